//! Persisted records: logical resources, rendered output resources and operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::id::ResourceId;

/// Well-known `LocalID`s, stable within the rendering of one resource.
pub mod local_id {
    pub const SERVICE: &str = "Service";
    pub const INGRESS: &str = "Ingress";
    pub const DEPLOYMENT: &str = "Deployment";
    pub const GATEWAY: &str = "Gateway";
    pub const SECRET: &str = "Secret";
    pub const KUBERNETES_NAMESPACE: &str = "KubernetesNamespace";
    pub const AWS_RESOURCE: &str = "AWSResource";
    pub const AZURE_RESOURCE: &str = "AzureResource";
    pub const MONGO_DATABASE: &str = "AzureCosmosMongoDatabase";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProvisioningState {
    #[default]
    NotProvisioning,
    Provisioning,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    pub fn is_terminal(self) -> bool { !matches!(self, ProvisioningState::Provisioning) }
}

/// Named typed value map a resource exposes to its dependents, e.g. `http` with host/port/scheme/url.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Binding {
    pub kind: String,
    #[serde(default)]
    pub values: BTreeMap<String, Json>,
}

impl Binding {
    pub fn new(kind: impl Into<String>) -> Self { Self { kind: kind.into(), values: BTreeMap::new() } }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> { self.values.get(key).and_then(|v| v.as_str()) }
    pub fn get_u64(&self, key: &str) -> Option<u64> { self.values.get(key).and_then(|v| v.as_u64()) }

    /// Fail with `BindingNotFound` unless this binding is of `kind`.
    pub fn as_required(&self, kind: &str) -> Result<&Self> {
        if self.kind.eq_ignore_ascii_case(kind) {
            Ok(self)
        } else {
            Err(Error::BindingNotFound(format!("binding of kind '{}' is required, found '{}'", kind, self.kind)))
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let map: serde_json::Map<String, Json> = self.values.clone().into_iter().collect();
        Ok(serde_json::from_value(Json::Object(map))?)
    }
}

/// A value known at render time, or a JSON pointer into the backend state of one of the
/// resource's own outputs, resolved once that output is deployed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ComputedValue {
    Static { value: Json },
    #[serde(rename_all = "camelCase")]
    Output { local_id: String, json_pointer: String },
}

impl ComputedValue {
    pub fn value(v: impl Into<Json>) -> Self { ComputedValue::Static { value: v.into() } }

    pub fn from_output(local_id: impl Into<String>, json_pointer: impl Into<String>) -> Self {
        ComputedValue::Output { local_id: local_id.into(), json_pointer: json_pointer.into() }
    }

    /// Resolve against deployed outputs; output references need `state` recorded.
    pub fn resolve(&self, outputs: &[OutputResource]) -> Result<Json> {
        match self {
            ComputedValue::Static { value } => Ok(value.clone()),
            ComputedValue::Output { local_id, json_pointer } => {
                let out = outputs
                    .iter()
                    .find(|o| &o.local_id == local_id)
                    .ok_or_else(|| Error::Internal(format!("computed value references unknown output '{}'", local_id)))?;
                let state = out
                    .state
                    .as_ref()
                    .ok_or_else(|| Error::Internal(format!("output '{}' has no recorded state", local_id)))?;
                state
                    .pointer(json_pointer)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("'{}' not present in state of output '{}'", json_pointer, local_id)))
            }
        }
    }
}

/// Secrets share the computed-value shape but are never persisted.
pub type SecretValue = ComputedValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Kubernetes,
    AwsCloudControl,
    AzureArm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputIdentity {
    #[serde(rename_all = "camelCase")]
    Kubernetes { api_version: String, kind: String, namespace: Option<String>, name: String },
    #[serde(rename_all = "camelCase")]
    AwsCloudControl { type_name: String, identifier: String },
    #[serde(rename_all = "camelCase")]
    AzureArm { id: String, api_version: String },
}

impl std::fmt::Display for OutputIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIdentity::Kubernetes { api_version, kind, namespace: Some(ns), name } => write!(f, "{}/{} {}/{}", api_version, kind, ns, name),
            OutputIdentity::Kubernetes { api_version, kind, namespace: None, name } => write!(f, "{}/{} {}", api_version, kind, name),
            OutputIdentity::AwsCloudControl { type_name, identifier } => write!(f, "{} {}", type_name, identifier),
            OutputIdentity::AzureArm { id, .. } => f.write_str(id),
        }
    }
}

/// One concrete backend artifact produced while rendering a logical resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputResource {
    pub local_id: String,
    pub identity: OutputIdentity,
    /// False when the artifact pre-exists and is only referenced.
    pub managed: bool,
    #[serde(default)]
    pub deployed: bool,
    /// Desired state sent to the backend.
    #[serde(default)]
    pub resource: Json,
    /// LocalIDs that must be deployed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Backend-reported state after deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Json>,
}

impl OutputResource {
    /// Managed Kubernetes object; identity is read from `apiVersion`, `kind` and `metadata`.
    pub fn kubernetes(local_id: impl Into<String>, object: Json) -> Self {
        let s = |p: &str| object.pointer(p).and_then(|v| v.as_str()).map(|s| s.to_string());
        let identity = OutputIdentity::Kubernetes {
            api_version: s("/apiVersion").unwrap_or_default(),
            kind: s("/kind").unwrap_or_default(),
            namespace: s("/metadata/namespace"),
            name: s("/metadata/name").unwrap_or_default(),
        };
        Self::new(local_id, identity, true, object)
    }

    pub fn aws(local_id: impl Into<String>, type_name: impl Into<String>, identifier: impl Into<String>, desired: Json) -> Self {
        Self::new(local_id, OutputIdentity::AwsCloudControl { type_name: type_name.into(), identifier: identifier.into() }, true, desired)
    }

    pub fn arm(local_id: impl Into<String>, id: impl Into<String>, api_version: impl Into<String>, desired: Json, managed: bool) -> Self {
        Self::new(local_id, OutputIdentity::AzureArm { id: id.into(), api_version: api_version.into() }, managed, desired)
    }

    fn new(local_id: impl Into<String>, identity: OutputIdentity, managed: bool, resource: Json) -> Self {
        Self { local_id: local_id.into(), identity, managed, deployed: false, resource, dependencies: Vec::new(), state: None }
    }

    pub fn depends_on(mut self, local_id: impl Into<String>) -> Self {
        self.dependencies.push(local_id.into());
        self
    }

    pub fn kind(&self) -> OutputKind {
        match self.identity {
            OutputIdentity::Kubernetes { .. } => OutputKind::Kubernetes,
            OutputIdentity::AwsCloudControl { .. } => OutputKind::AwsCloudControl,
            OutputIdentity::AzureArm { .. } => OutputKind::AzureArm,
        }
    }

    /// Same backend object, regardless of desired state.
    pub fn same_target(&self, other: &OutputResource) -> bool {
        self.local_id == other.local_id && self.identity == other.identity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub output_resources: Vec<OutputResource>,
    #[serde(default)]
    pub computed_values: BTreeMap<String, Json>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Binding>,
}

/// User-authored resource definition plus what the control plane recorded for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogicalResource {
    pub id: ResourceId,
    #[serde(default)]
    pub properties: Json,
    #[serde(default)]
    pub provisioning_state: ProvisioningState,
    #[serde(default)]
    pub status: ResourceStatus,
    /// Bumped on every accepted create-or-update.
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LogicalResource {
    pub fn new(id: ResourceId, properties: Json) -> Self {
        Self { id, properties, provisioning_state: ProvisioningState::NotProvisioning, status: ResourceStatus::default(), generation: 0, updated_at: None }
    }

    /// Name of the owning application, from `properties.application`.
    pub fn application_name(&self) -> Option<String> {
        let app = self.properties.get("application").and_then(|v| v.as_str())?;
        match ResourceId::parse(app) {
            Ok(id) => Some(id.name().to_string()),
            Err(_) => Some(app.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    CreateOrUpdate,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool { matches!(self, OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Canceled) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub code: String,
    pub message: String,
    /// LocalID of the failing artifact, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl OperationError {
    pub fn from_error(e: &Error, target: Option<String>) -> Self {
        Self { code: e.code().to_string(), message: e.to_string(), target }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    pub target: ResourceId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub percent_complete: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub start_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Backend request token currently being polled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

impl Operation {
    pub fn new(target: ResourceId, kind: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            kind,
            status: OperationStatus::Accepted,
            percent_complete: 0,
            error: None,
            start_time: now,
            last_updated_time: now,
            end_time: None,
            continuation: None,
        }
    }

    pub fn is_terminal(&self) -> bool { self.status.is_terminal() }

    /// `{target}/operationResults/{id}`
    pub fn status_path(&self) -> String { format!("{}/operationResults/{}", self.target, self.id) }

    pub fn touch(&mut self) { self.last_updated_time = Utc::now(); }

    /// Record the outcome. A record that is already terminal keeps its first
    /// outcome; returns false in that case.
    pub fn finish(&mut self, status: OperationStatus, error: Option<OperationError>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.error = error;
        if status == OperationStatus::Succeeded { self.percent_complete = 100; }
        self.continuation = None;
        self.last_updated_time = now;
        self.end_time = Some(now);
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub id: ResourceId,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Set while a delete is checking the group is empty; new resources are refused.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kubernetes_output_reads_identity() {
        let o = OutputResource::kubernetes(
            local_id::SERVICE,
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "route0", "namespace": "app0"}}),
        );
        assert_eq!(o.kind(), OutputKind::Kubernetes);
        assert_eq!(o.identity.to_string(), "v1/Service app0/route0");
        assert!(o.managed && !o.deployed);
    }

    #[test]
    fn computed_values_resolve_from_state() {
        let mut o = OutputResource::aws(local_id::AWS_RESOURCE, "AWS::Kinesis::Stream", "s1", json!({}));
        o.state = Some(json!({"Arn": "arn:aws:kinesis:us-west-2:1:stream/s1"}));
        let outputs = vec![o];
        let cv = ComputedValue::from_output(local_id::AWS_RESOURCE, "/Arn");
        assert_eq!(cv.resolve(&outputs).unwrap(), json!("arn:aws:kinesis:us-west-2:1:stream/s1"));
        assert_eq!(ComputedValue::value(8080).resolve(&outputs).unwrap(), json!(8080));
        assert!(ComputedValue::from_output("Missing", "/x").resolve(&outputs).is_err());
    }

    #[test]
    fn binding_kind_mismatch_is_binding_not_found() {
        let b = Binding::new("http").with("port", 80);
        assert!(b.as_required("HTTP").is_ok());
        assert!(matches!(b.as_required("mongodb"), Err(Error::BindingNotFound(_))));
    }

    #[test]
    fn operation_status_path_and_finish() {
        let id = ResourceId::parse("/subscriptions/s/resourceGroups/rg/providers/Applications.Core/containers/c").unwrap();
        let mut op = Operation::new(id, OperationKind::CreateOrUpdate);
        assert!(op.status_path().ends_with(&format!("/containers/c/operationResults/{}", op.id)));
        assert!(op.finish(OperationStatus::Succeeded, None));
        assert!(op.is_terminal());
        assert_eq!(op.percent_complete, 100);
        assert!(op.end_time.is_some());

        let failed = OperationError::from_error(&Error::Internal("late".into()), None);
        assert!(!op.finish(OperationStatus::Failed, Some(failed)));
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert!(op.error.is_none());
    }

    #[test]
    fn application_name_from_id() {
        let id = ResourceId::parse("/subscriptions/s/resourceGroups/rg/providers/Applications.Core/httpRoutes/route0").unwrap();
        let r = LogicalResource::new(id, json!({"application": "/subscriptions/s/resourceGroups/rg/providers/Applications.Core/applications/app0"}));
        assert_eq!(r.application_name().as_deref(), Some("app0"));
    }
}
