//! AWS Cloud Control adapter.
//!
//! `CloudControlApi` mirrors the five Cloud Control calls the adapter needs, so
//! the adapter logic runs the same against the SDK binding (`aws` feature) and
//! against in-process fakes.

use keel_core::{Error, OutputIdentity, OutputResource, Result};
use metrics::counter;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

use crate::{Adapter, ProgressEvent, ProgressStatus, Submission};

#[async_trait::async_trait]
pub trait CloudControlApi: Send + Sync {
    async fn create_resource(&self, type_name: &str, desired_state: &str) -> Result<ProgressEvent>;
    /// Current properties document; `NotFound` when absent.
    async fn get_resource(&self, type_name: &str, identifier: &str) -> Result<String>;
    async fn update_resource(&self, type_name: &str, identifier: &str, patch_document: &str) -> Result<ProgressEvent>;
    async fn delete_resource(&self, type_name: &str, identifier: &str) -> Result<ProgressEvent>;
    async fn get_resource_request_status(&self, request_token: &str) -> Result<ProgressEvent>;
}

/// Map a Cloud Control error code onto the keel taxonomy, keeping the message verbatim.
pub fn classify(code: Option<&str>, message: String) -> Error {
    match code {
        Some("ResourceNotFoundException") => Error::NotFound(message),
        Some(
            "ThrottlingException"
            | "ConcurrentOperationException"
            | "ConcurrentModificationException"
            | "ServiceInternalErrorException"
            | "HandlerInternalFailureException"
            | "NetworkFailureException"
            | "ServiceLimitExceededException"
            | "RequestTimeoutException",
        ) => Error::BackendTransient(message),
        // No service code means the request never got a response: dispatch or timeout.
        None => Error::BackendTransient(message),
        Some(_) => Error::BackendFatal(message),
    }
}

/// JSON patch (RFC 6902) turning `current` into `desired` for top-level properties.
/// Properties missing from `desired` are left alone; the service adds read-only and
/// defaulted properties we never declared.
pub fn patch_document(current: &Json, desired: &Json) -> Vec<Json> {
    let empty = Map::new();
    let cur = current.as_object().unwrap_or(&empty);
    let Some(want) = desired.as_object() else { return Vec::new() };
    let mut ops = Vec::new();
    for (k, v) in want {
        let path = format!("/{}", k.replace('~', "~0").replace('/', "~1"));
        match cur.get(k) {
            Some(have) if have == v => {}
            Some(_) => ops.push(json!({"op": "replace", "path": path, "value": v})),
            None => ops.push(json!({"op": "add", "path": path, "value": v})),
        }
    }
    ops
}

pub struct CloudControlAdapter<C: CloudControlApi> {
    api: C,
}

impl<C: CloudControlApi> CloudControlAdapter<C> {
    pub fn new(api: C) -> Self { Self { api } }

    pub fn api(&self) -> &C { &self.api }
}

fn target(output: &OutputResource) -> Result<(&str, &str)> {
    match &output.identity {
        OutputIdentity::AwsCloudControl { type_name, identifier } => Ok((type_name.as_str(), identifier.as_str())),
        other => Err(Error::Validation(format!("cloud control cannot handle output '{}' ({})", output.local_id, other))),
    }
}

fn submitted(ev: ProgressEvent) -> Result<Submission> {
    match ev.status {
        ProgressStatus::Success => Ok(Submission::Completed(None)),
        s if s.is_terminal() => ev.into_result().map(|_| Submission::Completed(None)),
        _ => ev
            .request_token
            .map(Submission::Pending)
            .ok_or_else(|| Error::BackendFatal("cloud control accepted the request without a request token".to_string())),
    }
}

#[async_trait::async_trait]
impl<C: CloudControlApi> Adapter for CloudControlAdapter<C> {
    fn name(&self) -> &str { "aws-cloudcontrol" }

    async fn create_or_update(&self, output: &OutputResource) -> Result<Submission> {
        let (type_name, identifier) = target(output)?;
        match self.api.get_resource(type_name, identifier).await {
            Err(Error::NotFound(_)) => {
                let desired = serde_json::to_string(&output.resource).map_err(|e| Error::Internal(e.to_string()))?;
                info!(type_name, identifier, "cloudcontrol: creating");
                counter!("cloudcontrol_create_total", 1u64);
                submitted(self.api.create_resource(type_name, &desired).await?)
            }
            Err(e) => Err(e),
            Ok(current) => {
                let current: Json = serde_json::from_str(&current).map_err(|e| Error::BackendFatal(format!("unreadable properties for {}: {}", identifier, e)))?;
                let patch = patch_document(&current, &output.resource);
                if patch.is_empty() {
                    debug!(type_name, identifier, "cloudcontrol: already up to date");
                    return Ok(Submission::Completed(Some(current)));
                }
                info!(type_name, identifier, changes = patch.len(), "cloudcontrol: updating");
                counter!("cloudcontrol_update_total", 1u64);
                let doc = serde_json::to_string(&patch).map_err(|e| Error::Internal(e.to_string()))?;
                submitted(self.api.update_resource(type_name, identifier, &doc).await?)
            }
        }
    }

    async fn get(&self, output: &OutputResource) -> Result<Json> {
        let (type_name, identifier) = target(output)?;
        let props = self.api.get_resource(type_name, identifier).await?;
        serde_json::from_str(&props).map_err(|e| Error::BackendFatal(format!("unreadable properties for {}: {}", identifier, e)))
    }

    async fn delete(&self, output: &OutputResource) -> Result<Submission> {
        let (type_name, identifier) = target(output)?;
        match self.api.get_resource(type_name, identifier).await {
            Err(Error::NotFound(_)) => {
                debug!(type_name, identifier, "cloudcontrol: already absent");
                return Ok(Submission::Completed(None));
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }
        info!(type_name, identifier, "cloudcontrol: deleting");
        counter!("cloudcontrol_delete_total", 1u64);
        match self.api.delete_resource(type_name, identifier).await {
            Err(Error::NotFound(_)) => Ok(Submission::Completed(None)),
            Err(e) => Err(e),
            Ok(ev) if ev.is_absent_on_delete() => Ok(Submission::Completed(None)),
            Ok(ev) => submitted(ev),
        }
    }

    async fn status(&self, token: &str) -> Result<ProgressEvent> {
        self.api.get_resource_request_status(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_only_touches_declared_properties() {
        let current = json!({"Name": "s1", "ShardCount": 1, "Arn": "arn:aws:kinesis:::stream/s1"});
        let desired = json!({"Name": "s1", "ShardCount": 2, "RetentionPeriodHours": 48});
        let ops = patch_document(&current, &desired);
        assert_eq!(ops, vec![
            json!({"op": "add", "path": "/RetentionPeriodHours", "value": 48}),
            json!({"op": "replace", "path": "/ShardCount", "value": 2}),
        ]);
        assert!(patch_document(&current, &json!({"Name": "s1"})).is_empty());
    }

    #[test]
    fn error_codes() {
        assert!(matches!(classify(Some("ResourceNotFoundException"), "gone".into()), Error::NotFound(_)));
        assert!(matches!(classify(Some("ThrottlingException"), "slow down".into()), Error::BackendTransient(_)));
        assert!(matches!(classify(None, "dispatch failure".into()), Error::BackendTransient(_)));
        match classify(Some("InvalidRequestException"), "Model validation failed".into()) {
            Error::BackendFatal(m) => assert_eq!(m, "Model validation failed"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
