//! Keel public API façade (in-process).
//!
//! Frontends address everything by resource path and exchange JSON bodies; each
//! call answers with an HTTP-shaped `Response` (status, headers, body) so a
//! network transport can be put in front of `InProcApi` without reshaping it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use keel_core::{Error, LogicalResource, Operation, ResourceGroup, ResourceId};
use keel_ops::{Accepted, OperationController};
use keel_store::{find_as, keys, save_as, update, Precondition};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOCATION: &str = "Location";
pub const ASYNC_OPERATION: &str = "Azure-AsyncOperation";

const OPERATION_RESULTS: &str = "/operationresults/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Json>,
}

impl Response {
    pub fn ok(body: Json) -> Self { Self::with_status(200, Some(body)) }

    pub fn no_content() -> Self { Self::with_status(204, None) }

    pub fn with_status(status: u16, body: Option<Json>) -> Self { Self { status, headers: BTreeMap::new(), body } }

    /// 201/202 carrying the operation status path in both async headers.
    fn accepted(status: u16, op: &Operation, body: Option<Json>) -> Self {
        let path = op.status_path();
        let mut r = Self::with_status(status, body);
        r.headers.insert(LOCATION.to_string(), path.clone());
        r.headers.insert(ASYNC_OPERATION.to_string(), path);
        r
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// API errors, grouped by the status they map to.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum ApiError {
    #[error("bad request ({code}): {message}")]
    BadRequest { code: String, message: String },
    #[error("not found ({code}): {message}")]
    NotFound { code: String, message: String },
    #[error("conflict ({code}): {message}")]
    Conflict { code: String, message: String },
    #[error("internal ({code}): {message}")]
    Internal { code: String, message: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest { .. } => 400,
            ApiError::NotFound { .. } => 404,
            ApiError::Conflict { .. } => 409,
            ApiError::Internal { .. } => 500,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::BadRequest { code, .. } | ApiError::NotFound { code, .. } | ApiError::Conflict { code, .. } | ApiError::Internal { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::Internal { message, .. } => message,
        }
    }

    /// `{ "error": { "code", "message" } }`
    pub fn body(&self) -> Json { json!({ "error": { "code": self.code(), "message": self.message() } }) }

    pub fn into_response(self) -> Response { Response::with_status(self.status(), Some(self.body())) }

    fn not_found(what: impl std::fmt::Display) -> Self { Error::NotFound(what.to_string()).into() }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let code = e.code().to_string();
        let message = e.to_string();
        match e {
            Error::InvalidResourceId { .. }
            | Error::UnsupportedProvider(_)
            | Error::UnsupportedResourceType(_)
            | Error::CyclicDependency(_)
            | Error::BindingNotFound(_)
            | Error::Validation(_) => ApiError::BadRequest { code, message },
            Error::NotFound(_) | Error::DependencyNotFound(_) => ApiError::NotFound { code, message },
            Error::ConflictingOperation { .. } | Error::Conflict(_) => ApiError::Conflict { code, message },
            _ => ApiError::Internal { code, message },
        }
    }
}

/// Control-plane API surface.
#[async_trait::async_trait]
pub trait KeelApi: Send + Sync {
    /// PUT `{ "properties": {...} }`. 201 for a new resource, 202 otherwise.
    async fn create_or_update(&self, id: &str, body: Json) -> ApiResult<Response>;

    /// Tracked resources come from the store; untracked AWS/Azure resources are
    /// read through their backend.
    async fn get(&self, id: &str) -> ApiResult<Response>;

    /// Resources of one type directly in a scope, e.g. `.../providers/Applications.Core/containers`.
    async fn list(&self, collection: &str) -> ApiResult<Response>;

    /// 202 while the delete runs, 204 when there was nothing to delete.
    async fn delete(&self, id: &str) -> ApiResult<Response>;

    async fn list_secrets(&self, id: &str) -> ApiResult<Response>;

    /// `{target}/operationResults/{operationId}`
    async fn operation_status(&self, path: &str) -> ApiResult<Response>;

    async fn cancel_operation(&self, path: &str) -> ApiResult<Response>;

    async fn put_resource_group(&self, id: &str, body: Json) -> ApiResult<Response>;

    async fn get_resource_group(&self, id: &str) -> ApiResult<Response>;

    async fn list_resource_groups(&self, scope: &str) -> ApiResult<Response>;

    /// Fails with 409 while the group still holds resources.
    async fn delete_resource_group(&self, id: &str) -> ApiResult<Response>;
}

/// In-process implementation over an `OperationController`.
#[derive(Clone)]
pub struct InProcApi {
    ctl: OperationController,
}

impl InProcApi {
    pub fn new(ctl: OperationController) -> Self { Self { ctl } }

    pub fn controller(&self) -> &OperationController { &self.ctl }

    async fn require_group(&self, id: &ResourceId) -> ApiResult<()> {
        if id.resource_group().is_none() {
            return Ok(());
        }
        let group = id.root_scope();
        match find_as::<ResourceGroup>(self.ctl.store().as_ref(), &keys::resource(&group)).await? {
            Some((g, _)) if g.deleting => Err(ApiError::Conflict {
                code: "ResourceGroupDeleting".to_string(),
                message: format!("resource group '{}' is being deleted", group),
            }),
            Some(_) => Ok(()),
            None => Err(ApiError::not_found(format!("resource group {}", group))),
        }
    }

    /// A create that passed `require_group` may persist after a concurrent
    /// delete removed the group. Both sides look again after their own write
    /// and whichever sees the other puts the group back.
    async fn keep_group(&self, id: &ResourceId) -> ApiResult<()> {
        if id.resource_group().is_none() {
            return Ok(());
        }
        let group = id.root_scope();
        if find_as::<ResourceGroup>(self.ctl.store().as_ref(), &keys::resource(&group)).await?.is_none() {
            self.restore_group(ResourceGroup { id: group, tags: BTreeMap::new(), created_at: Utc::now(), deleting: false }).await?;
        }
        Ok(())
    }

    async fn restore_group(&self, mut group: ResourceGroup) -> ApiResult<()> {
        group.deleting = false;
        match save_as(self.ctl.store().as_ref(), &keys::resource(&group.id), &group, Precondition::DoesNotExist).await {
            Ok(_) => {
                warn!(group = %group.id, "api: resource group restored after a resource was created during its deletion");
                Ok(())
            }
            Err(Error::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_id(id: &str) -> ApiResult<ResourceId> { Ok(ResourceId::parse(id)?) }

fn parse_group(id: &str) -> ApiResult<ResourceId> {
    let group = ResourceId::parse_scope(id)?;
    match group.resource_group() {
        Some(rg) if rg == group.name() => Ok(group),
        _ => Err(Error::Validation(format!("'{}' is not a resource group id", id)).into()),
    }
}

/// Split `{target}/operationResults/{operationId}`.
pub fn parse_operation_path(path: &str) -> ApiResult<(ResourceId, Uuid)> {
    let lower = path.to_ascii_lowercase();
    let at = lower
        .rfind(OPERATION_RESULTS)
        .ok_or_else(|| ApiError::from(Error::Validation(format!("'{}' is not an operation status path", path))))?;
    let target = ResourceId::parse(&path[..at])?;
    let id = path[at + OPERATION_RESULTS.len()..]
        .trim_end_matches('/')
        .parse::<Uuid>()
        .map_err(|e| ApiError::from(Error::Validation(format!("invalid operation id: {}", e))))?;
    Ok((target, id))
}

/// ARM-shaped resource body with the provisioning state folded into properties.
pub fn resource_body(r: &LogicalResource) -> Json {
    let mut props = match &r.properties {
        Json::Object(m) => m.clone(),
        _ => Map::new(),
    };
    props.insert("provisioningState".to_string(), json!(r.provisioning_state));
    json!({
        "id": r.id.to_string(),
        "name": r.id.name(),
        "type": r.id.resource_type(),
        "properties": props,
        "status": r.status,
    })
}

pub fn operation_body(op: &Operation) -> Json {
    let mut body = json!({
        "id": op.status_path(),
        "name": op.id.to_string(),
        "status": op.status,
        "startTime": op.start_time,
        "percentComplete": op.percent_complete,
    });
    if let Some(end) = op.end_time {
        body["endTime"] = json!(end);
    }
    if let Some(err) = &op.error {
        body["error"] = json!(err);
    }
    body
}

fn group_body(g: &ResourceGroup) -> Json {
    json!({ "id": g.id.to_string(), "name": g.id.name(), "type": "resourceGroups", "tags": g.tags, "createdAt": g.created_at })
}

fn not_empty(group: &ResourceId, count: usize) -> ApiError {
    ApiError::Conflict {
        code: "ResourceGroupNotEmpty".to_string(),
        message: format!("resource group '{}' still contains {} resource(s)", group, count),
    }
}

fn accepted_response(acc: Accepted, body: Option<Json>) -> Response {
    let status = if acc.created { 201 } else { 202 };
    Response::accepted(status, &acc.operation, body)
}

#[async_trait::async_trait]
impl KeelApi for InProcApi {
    async fn create_or_update(&self, id: &str, body: Json) -> ApiResult<Response> {
        let t0 = Instant::now();
        let id = parse_id(id)?;
        info!(id = %id, "api: put start");
        let properties = match &body {
            Json::Object(m) => m.get("properties").cloned().unwrap_or_else(|| json!({})),
            _ => return Err(Error::Validation("request body must be a JSON object".into()).into()),
        };
        self.require_group(&id).await?;
        let acc = self.ctl.create_or_update(&id, properties).await?;
        self.keep_group(&id).await?;
        counter!("api_accepted_total", 1u64);
        let stored = find_as::<LogicalResource>(self.ctl.store().as_ref(), &keys::resource(&id)).await?;
        let body = stored.map(|(r, _)| resource_body(&r));
        info!(id = %id, operation = %acc.operation.id, created = acc.created, attached = acc.attached, took_ms = %t0.elapsed().as_millis(), "api: put accepted");
        Ok(accepted_response(acc, body))
    }

    async fn get(&self, id: &str) -> ApiResult<Response> {
        let id = parse_id(id)?;
        if let Some((r, _)) = find_as::<LogicalResource>(self.ctl.store().as_ref(), &keys::resource(&id)).await? {
            return Ok(Response::ok(resource_body(&r)));
        }
        match self.ctl.proxy_get(&id).await {
            Ok(state) => {
                debug!(id = %id, "api: served untracked resource from backend");
                Ok(Response::ok(json!({ "id": id.to_string(), "name": id.name(), "type": id.resource_type(), "properties": state })))
            }
            Err(e) => {
                let e = ApiError::from(e);
                if e.status() < 500 { Err(ApiError::not_found(&id)) } else { Err(e) }
            }
        }
    }

    async fn list(&self, collection: &str) -> ApiResult<Response> {
        let coll = ResourceId::parse_collection(collection)?;
        let scope = coll.root_scope();
        let wanted = coll.resource_type();
        let mut value = Vec::new();
        for (_, obj) in self.ctl.store().list(&keys::under(&scope)).await? {
            let Ok(r) = serde_json::from_value::<LogicalResource>(obj.value) else { continue };
            if r.id.is_scope() || !r.id.resource_type().eq_ignore_ascii_case(&wanted) || r.id.root_scope() != scope {
                continue;
            }
            value.push(resource_body(&r));
        }
        debug!(collection = %coll, count = value.len(), "api: list ok");
        Ok(Response::ok(json!({ "value": value })))
    }

    async fn delete(&self, id: &str) -> ApiResult<Response> {
        let id = parse_id(id)?;
        info!(id = %id, "api: delete start");
        match self.ctl.delete(&id).await? {
            Some(acc) => {
                counter!("api_accepted_total", 1u64);
                Ok(Response::accepted(202, &acc.operation, None))
            }
            None => Ok(Response::no_content()),
        }
    }

    async fn list_secrets(&self, id: &str) -> ApiResult<Response> {
        let id = parse_id(id)?;
        let secrets = self.ctl.list_secrets(&id).await?;
        Ok(Response::ok(json!(secrets)))
    }

    async fn operation_status(&self, path: &str) -> ApiResult<Response> {
        let (target, op_id) = parse_operation_path(path)?;
        let op = self.ctl.get_operation(op_id).await?;
        if op.target != target {
            return Err(ApiError::not_found(format!("operation {}", op_id)));
        }
        Ok(Response::ok(operation_body(&op)))
    }

    async fn cancel_operation(&self, path: &str) -> ApiResult<Response> {
        let (target, op_id) = parse_operation_path(path)?;
        let op = self.ctl.get_operation(op_id).await?;
        if op.target != target {
            return Err(ApiError::not_found(format!("operation {}", op_id)));
        }
        let op = self.ctl.cancel(op_id).await?;
        info!(operation = %op_id, id = %target, "api: cancel requested");
        Ok(Response::accepted(202, &op, Some(operation_body(&op))))
    }

    async fn put_resource_group(&self, id: &str, body: Json) -> ApiResult<Response> {
        let id = parse_group(id)?;
        let tags: BTreeMap<String, String> = match body.get("tags") {
            Some(t) => serde_json::from_value(t.clone()).map_err(Error::from)?,
            None => BTreeMap::new(),
        };
        let store = self.ctl.store().as_ref();
        let key = keys::resource(&id);
        let existing = find_as::<ResourceGroup>(store, &key).await?;
        let (group, precondition, status) = match existing {
            Some((mut g, etag)) => {
                g.tags = tags;
                (g, Precondition::Matches(etag), 200)
            }
            None => (ResourceGroup { id: id.clone(), tags, created_at: Utc::now(), deleting: false }, Precondition::DoesNotExist, 201),
        };
        save_as(store, &key, &group, precondition).await?;
        info!(group = %id, status, "api: resource group saved");
        Ok(Response::with_status(status, Some(group_body(&group))))
    }

    async fn get_resource_group(&self, id: &str) -> ApiResult<Response> {
        let id = parse_group(id)?;
        match find_as::<ResourceGroup>(self.ctl.store().as_ref(), &keys::resource(&id)).await? {
            Some((g, _)) => Ok(Response::ok(group_body(&g))),
            None => Err(ApiError::not_found(format!("resource group {}", id))),
        }
    }

    async fn list_resource_groups(&self, scope: &str) -> ApiResult<Response> {
        let scope = ResourceId::parse_scope(scope)?;
        let mut value = Vec::new();
        for (_, obj) in self.ctl.store().list(&keys::under(&scope)).await? {
            let Ok(g) = serde_json::from_value::<ResourceGroup>(obj.value) else { continue };
            if g.id.is_scope() && g.id.parent().as_ref() == Some(&scope) && g.id.resource_group().is_some() {
                value.push(group_body(&g));
            }
        }
        Ok(Response::ok(json!({ "value": value })))
    }

    async fn delete_resource_group(&self, id: &str) -> ApiResult<Response> {
        let id = parse_group(id)?;
        let store = self.ctl.store().as_ref();
        let key = keys::resource(&id);
        let Some((mut group, etag)) = find_as::<ResourceGroup>(store, &key).await? else { return Ok(Response::no_content()) };
        group.deleting = true;
        let marked = save_as(store, &key, &group, Precondition::Matches(etag)).await?;

        let contained = store.list(&keys::under(&id)).await?;
        if !contained.is_empty() {
            let cleared = update::<ResourceGroup, _>(store, &key, |g| {
                g.deleting = false;
                Ok(())
            })
            .await;
            if let Err(e) = cleared {
                warn!(group = %id, error = %e, "api: could not clear the deleting mark");
            }
            return Err(not_empty(&id, contained.len()));
        }
        store.delete(&key, Precondition::Matches(marked)).await?;

        let late = store.list(&keys::under(&id)).await?;
        if !late.is_empty() {
            self.restore_group(group).await?;
            return Err(not_empty(&id, late.len()));
        }
        info!(group = %id, "api: resource group deleted");
        Ok(Response::with_status(200, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (Error::invalid_id("x", "bad"), 400),
            (Error::UnsupportedResourceType("A/b".into()), 400),
            (Error::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]), 400),
            (Error::DependencyNotFound("/x".into()), 404),
            (Error::NotFound("/x".into()), 404),
            (Error::ConflictingOperation { target: "/x".into(), operation: "1".into() }, 409),
            (Error::BackendFatal("boom".into()), 500),
        ];
        for (e, status) in cases {
            assert_eq!(ApiError::from(e.clone()).status(), status, "{e:?}");
        }
        let body = ApiError::from(Error::Validation("port must be a number".into())).body();
        assert_eq!(body, json!({"error": {"code": "BadRequest", "message": "port must be a number"}}));
    }

    #[test]
    fn operation_paths_split_case_insensitively() {
        let op = Uuid::new_v4();
        let target = "/planes/radius/local/resourceGroups/rg/providers/Applications.Core/containers/c";
        let (id, parsed) = parse_operation_path(&format!("{}/OperationResults/{}", target, op)).unwrap();
        assert_eq!(id.as_str(), target);
        assert_eq!(parsed, op);
        assert_eq!(parse_operation_path(target).unwrap_err().status(), 400);
        assert_eq!(parse_operation_path(&format!("{}/operationResults/nope", target)).unwrap_err().status(), 400);
    }

    #[test]
    fn group_ids_must_end_in_a_resource_group() {
        assert!(parse_group("/planes/radius/local/resourceGroups/rg").is_ok());
        assert!(parse_group("/subscriptions/s/resourceGroups/rg").is_ok());
        assert!(parse_group("/subscriptions/s").is_err());
        assert!(parse_group("/planes/radius/local/resourceGroups/rg/providers/Applications.Core/containers/c").is_err());
    }

    #[test]
    fn resource_body_folds_in_provisioning_state() {
        let id = ResourceId::parse("/planes/radius/local/resourceGroups/rg/providers/Applications.Core/httpRoutes/r").unwrap();
        let body = resource_body(&LogicalResource::new(id, json!({"port": 80})));
        assert_eq!(body["properties"], json!({"port": 80, "provisioningState": "NotProvisioning"}));
        assert_eq!(body["type"], "Applications.Core/httpRoutes");
    }
}
