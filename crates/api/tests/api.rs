use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_api::{InProcApi, KeelApi, Response, ASYNC_OPERATION, LOCATION};
use keel_backend::{MemoryAdapter, PollPolicy};
use keel_core::{local_id, LogicalResource, OutputResource, ResourceGroup, ResourceId, Result};
use keel_ops::{ControllerConfig, OperationController};
use keel_planes::{PlaneKind, PlaneTable, Router};
use keel_render::Registry;
use keel_store::{find_as, keys, update, MemoryStore, Object, Precondition, Store};
use serde_json::{json, Value};

const GROUP: &str = "/planes/radius/local/resourceGroups/rg";
const ROUTE: &str = "/planes/radius/local/resourceGroups/rg/providers/Applications.Core/httpRoutes/route0";

fn api() -> (InProcApi, Arc<MemoryAdapter>, Arc<MemoryAdapter>) { api_over(Arc::new(MemoryStore::new())) }

fn api_over(store: Arc<dyn Store>) -> (InProcApi, Arc<MemoryAdapter>, Arc<MemoryAdapter>) {
    let kube = Arc::new(MemoryAdapter::new("kubernetes"));
    let aws = Arc::new(MemoryAdapter::new("aws"));
    let router = Router::new(PlaneTable::builtin()).with_adapter(PlaneKind::Kubernetes, kube.clone()).with_adapter(PlaneKind::Aws, aws.clone());
    let config = ControllerConfig {
        poll: PollPolicy { interval: Duration::from_millis(5), max_interval: Duration::from_millis(20), multiplier: 2.0, max_wait: Duration::from_secs(5) },
        ..ControllerConfig::default()
    };
    let ctl = OperationController::new(store, router, Registry::builtin(), config);
    (InProcApi::new(ctl), kube, aws)
}

async fn settle(api: &InProcApi, accepted: &Response) -> Value {
    let path = accepted.header(LOCATION).expect("location header").to_string();
    for _ in 0..500 {
        let body = api.operation_status(&path).await.unwrap().body.unwrap();
        if body["status"] != "Accepted" && body["status"] != "Running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation at {path} did not finish");
}

#[tokio::test]
async fn resource_lifecycle_through_the_api() {
    let (api, kube, _) = api();
    assert_eq!(api.put_resource_group(GROUP, json!({"tags": {"env": "dev"}})).await.unwrap().status, 201);

    let created = api.create_or_update(ROUTE, json!({"properties": {"application": "app0", "port": 8080}})).await.unwrap();
    assert_eq!(created.status, 201);
    assert_eq!(created.header(LOCATION), created.header(ASYNC_OPERATION));
    assert!(created.header(LOCATION).unwrap().starts_with(&format!("{}/operationResults/", ROUTE)));

    let status = settle(&api, &created).await;
    assert_eq!(status["status"], "Succeeded");
    assert_eq!(status["percentComplete"], 100);
    assert!(status.get("endTime").is_some() && status.get("error").is_none());

    let got = api.get(ROUTE).await.unwrap().body.unwrap();
    assert_eq!(got["properties"]["provisioningState"], "Succeeded");
    assert_eq!(got["status"]["computedValues"]["url"], "http://route0:8080");

    let updated = api.create_or_update(ROUTE, json!({"properties": {"application": "app0", "port": 9090}})).await.unwrap();
    assert_eq!(updated.status, 202);
    settle(&api, &updated).await;

    let listed = api.list(&format!("{}/providers/Applications.Core/httpRoutes", GROUP)).await.unwrap().body.unwrap();
    assert_eq!(listed["value"].as_array().unwrap().len(), 1);
    let other = api.list(&format!("{}/providers/Applications.Core/containers", GROUP)).await.unwrap().body.unwrap();
    assert!(other["value"].as_array().unwrap().is_empty());

    let busy = api.delete_resource_group(GROUP).await.unwrap_err();
    assert_eq!(busy.status(), 409);

    let deleting = api.delete(ROUTE).await.unwrap();
    assert_eq!(deleting.status, 202);
    assert_eq!(settle(&api, &deleting).await["status"], "Succeeded");
    assert_eq!(kube.object_count(), 0);
    assert_eq!(api.delete(ROUTE).await.unwrap().status, 204);
    assert_eq!(api.get(ROUTE).await.unwrap_err().status(), 404);

    assert_eq!(api.delete_resource_group(GROUP).await.unwrap().status, 200);
    assert_eq!(api.get_resource_group(GROUP).await.unwrap_err().status(), 404);
}

#[tokio::test]
async fn synchronous_failures_use_error_bodies() {
    let (api, _, _) = api();

    let missing_group = api.create_or_update(ROUTE, json!({"properties": {"application": "app0"}})).await.unwrap_err();
    assert_eq!(missing_group.status(), 404);

    let bad_id = api.create_or_update("planes/radius", json!({})).await.unwrap_err();
    assert_eq!(bad_id.status(), 400);
    assert_eq!(bad_id.into_response().body.unwrap()["error"]["code"], "InvalidResourceId");

    api.put_resource_group(GROUP, json!({})).await.unwrap();
    let widget = api.create_or_update(&format!("{}/providers/Applications.Core/widgets/w", GROUP), json!({"properties": {}})).await.unwrap_err();
    assert_eq!((widget.status(), widget.code()), (400, "UnsupportedResourceType"));

    let dangling = api
        .create_or_update(
            &format!("{}/providers/Applications.Core/gateways/gw", GROUP),
            json!({"properties": {"application": "app0", "routes": [{"destination": ROUTE}]}}),
        )
        .await
        .unwrap_err();
    assert_eq!((dangling.status(), dangling.code()), (404, "DependencyNotFound"));

    let not_object = api.create_or_update(ROUTE, json!([1, 2])).await.unwrap_err();
    assert_eq!(not_object.status(), 400);
}

#[tokio::test]
async fn resource_groups_are_listed_per_scope() {
    let (api, _, _) = api();
    api.put_resource_group(GROUP, json!({})).await.unwrap();
    api.put_resource_group("/planes/radius/local/resourceGroups/other", json!({})).await.unwrap();
    assert_eq!(api.put_resource_group(GROUP, json!({"tags": {"team": "web"}})).await.unwrap().status, 200);

    let listed = api.list_resource_groups("/planes/radius/local").await.unwrap().body.unwrap();
    let names: Vec<&str> = listed["value"].as_array().unwrap().iter().map(|g| g["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["other", "rg"]);
    assert_eq!(api.get_resource_group(GROUP).await.unwrap().body.unwrap()["tags"], json!({"team": "web"}));
    assert_eq!(api.put_resource_group("/planes/radius/local", json!({})).await.unwrap_err().status(), 400);
}

#[tokio::test]
async fn operation_status_is_scoped_to_its_target() {
    let (api, _, _) = api();
    api.put_resource_group(GROUP, json!({})).await.unwrap();
    let created = api.create_or_update(ROUTE, json!({"properties": {"application": "app0"}})).await.unwrap();
    let path = created.header(LOCATION).unwrap().to_string();
    settle(&api, &created).await;

    let op_id = path.rsplit('/').next().unwrap();
    let elsewhere = format!("{}/providers/Applications.Core/httpRoutes/route1/operationResults/{}", GROUP, op_id);
    assert_eq!(api.operation_status(&elsewhere).await.unwrap_err().status(), 404);
    assert_eq!(api.operation_status(&format!("{}/operationResults/not-a-uuid", ROUTE)).await.unwrap_err().status(), 400);
}

#[tokio::test]
async fn untracked_cloud_resources_are_read_from_the_backend() {
    let (api, _, aws) = api();
    let existing = "/planes/aws/aws/accounts/1/regions/us-west-2/providers/AWS.Kinesis/Stream/legacy";
    assert_eq!(api.get(existing).await.unwrap_err().status(), 404);

    let out = OutputResource::aws(local_id::AWS_RESOURCE, "AWS::Kinesis::Stream", "legacy", json!({}));
    aws.insert_object(&out, json!({"Name": "legacy", "ShardCount": 4}));
    let got = api.get(existing).await.unwrap().body.unwrap();
    assert_eq!(got["properties"]["ShardCount"], 4);
    assert_eq!(got["type"], "AWS.Kinesis/Stream");

    let stream = "/planes/aws/aws/accounts/1/regions/us-west-2/providers/AWS.Kinesis/Stream/s1";
    let created = api.create_or_update(stream, json!({"properties": {"ShardCount": 2}})).await.unwrap();
    assert_eq!(settle(&api, &created).await["status"], "Succeeded");
    let got = api.get(stream).await.unwrap().body.unwrap();
    assert_eq!(got["properties"]["provisioningState"], "Succeeded");
    assert_eq!(got["status"]["outputResources"][0]["state"], json!({"ShardCount": 2}));
}

/// Writes one record right after the next listing returns, like a resource
/// create landing between a group's emptiness check and its removal.
#[derive(Default)]
struct LateWrite {
    inner: MemoryStore,
    pending: Mutex<Option<(String, Value)>>,
}

#[async_trait::async_trait]
impl Store for LateWrite {
    async fn get(&self, key: &str) -> Result<Object> { self.inner.get(key).await }

    async fn save(&self, key: &str, value: Value, precondition: Precondition) -> Result<String> { self.inner.save(key, value, precondition).await }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<()> { self.inner.delete(key, precondition).await }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Object)>> {
        let listed = self.inner.list(prefix).await?;
        let pending = self.pending.lock().unwrap().take();
        if let Some((key, value)) = pending {
            self.inner.save(&key, value, Precondition::DoesNotExist).await?;
        }
        Ok(listed)
    }
}

#[tokio::test]
async fn groups_being_deleted_refuse_new_resources() {
    let (api, kube, _) = api();
    api.put_resource_group(GROUP, json!({})).await.unwrap();
    let group = ResourceId::parse_scope(GROUP).unwrap();
    let store = api.controller().store().clone();
    update::<ResourceGroup, _>(store.as_ref(), &keys::resource(&group), |g| {
        g.deleting = true;
        Ok(())
    })
    .await
    .unwrap();

    let refused = api.create_or_update(ROUTE, json!({"properties": {"application": "app0"}})).await.unwrap_err();
    assert_eq!((refused.status(), refused.code()), (409, "ResourceGroupDeleting"));
    assert!(kube.calls().is_empty());
    assert_eq!(api.get(ROUTE).await.unwrap_err().status(), 404);

    assert_eq!(api.delete_resource_group(GROUP).await.unwrap().status, 200);
    assert_eq!(api.get_resource_group(GROUP).await.unwrap_err().status(), 404);
}

#[tokio::test]
async fn failed_group_delete_clears_its_mark() {
    let (api, _, _) = api();
    api.put_resource_group(GROUP, json!({})).await.unwrap();
    let created = api.create_or_update(ROUTE, json!({"properties": {"application": "app0"}})).await.unwrap();
    assert_eq!(settle(&api, &created).await["status"], "Succeeded");

    let busy = api.delete_resource_group(GROUP).await.unwrap_err();
    assert_eq!((busy.status(), busy.code()), (409, "ResourceGroupNotEmpty"));
    let group = ResourceId::parse_scope(GROUP).unwrap();
    let (stored, _) = find_as::<ResourceGroup>(api.controller().store().as_ref(), &keys::resource(&group)).await.unwrap().unwrap();
    assert!(!stored.deleting);
    let again = api.create_or_update(ROUTE, json!({"properties": {"application": "app0", "port": 8080}})).await.unwrap();
    assert_eq!(settle(&api, &again).await["status"], "Succeeded");
}

#[tokio::test]
async fn resource_created_during_group_delete_keeps_its_group() {
    let store = Arc::new(LateWrite::default());
    let (api, _, _) = api_over(store.clone());
    api.put_resource_group(GROUP, json!({"tags": {"team": "web"}})).await.unwrap();
    let route = ResourceId::parse(ROUTE).unwrap();
    let record = serde_json::to_value(LogicalResource::new(route.clone(), json!({"application": "app0"}))).unwrap();
    *store.pending.lock().unwrap() = Some((keys::resource(&route), record));

    let raced = api.delete_resource_group(GROUP).await.unwrap_err();
    assert_eq!((raced.status(), raced.code()), (409, "ResourceGroupNotEmpty"));
    let group = api.get_resource_group(GROUP).await.unwrap().body.unwrap();
    assert_eq!(group["tags"], json!({"team": "web"}));
    let (stored, _) = find_as::<ResourceGroup>(store.as_ref(), &keys::resource(&ResourceId::parse_scope(GROUP).unwrap())).await.unwrap().unwrap();
    assert!(!stored.deleting);
    assert!(store.inner.get(&keys::resource(&route)).await.is_ok());
}
