#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use keel_backend::{Adapter, CloudControlAdapter, CloudControlApi, PollPolicy, ProgressEvent, ProgressStatus, RequestKind, Submission};
use keel_core::{Error, OutputResource, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Cloud Control double: one stored resource and a queue of status replies.
#[derive(Default)]
struct FakeCloudControl {
    properties: Mutex<Option<String>>,
    statuses: Mutex<VecDeque<Result<ProgressEvent>>>,
    patches: Mutex<Vec<String>>,
    deletes: Mutex<u32>,
}

impl FakeCloudControl {
    fn with_statuses(statuses: Vec<Result<ProgressEvent>>) -> Self {
        Self { statuses: Mutex::new(statuses.into()), ..Default::default() }
    }
}

fn event(status: ProgressStatus) -> ProgressEvent { ProgressEvent::new(status).with_token("T") }

#[async_trait::async_trait]
impl CloudControlApi for FakeCloudControl {
    async fn create_resource(&self, _type_name: &str, desired_state: &str) -> Result<ProgressEvent> {
        *self.properties.lock().unwrap() = Some(desired_state.to_string());
        Ok(event(ProgressStatus::InProgress))
    }

    async fn get_resource(&self, type_name: &str, identifier: &str) -> Result<String> {
        self.properties.lock().unwrap().clone().ok_or_else(|| Error::NotFound(format!("{} {}", type_name, identifier)))
    }

    async fn update_resource(&self, _type_name: &str, _identifier: &str, patch_document: &str) -> Result<ProgressEvent> {
        self.patches.lock().unwrap().push(patch_document.to_string());
        Ok(event(ProgressStatus::InProgress))
    }

    async fn delete_resource(&self, _type_name: &str, _identifier: &str) -> Result<ProgressEvent> {
        *self.deletes.lock().unwrap() += 1;
        Ok(event(ProgressStatus::InProgress))
    }

    async fn get_resource_request_status(&self, _request_token: &str) -> Result<ProgressEvent> {
        let mut q = self.statuses.lock().unwrap();
        if q.len() > 1 { q.pop_front().unwrap() } else { q.front().cloned().unwrap_or_else(|| Ok(event(ProgressStatus::Success))) }
    }
}

fn stream() -> OutputResource {
    OutputResource::aws("AWSResource", "AWS::Kinesis::Stream", "s1", json!({"Name": "s1", "ShardCount": 1}))
}

fn fast() -> PollPolicy {
    PollPolicy { interval: Duration::from_millis(1), max_interval: Duration::from_millis(5), multiplier: 2.0, max_wait: Duration::from_secs(5) }
}

#[tokio::test]
async fn create_polls_token_until_success() {
    let api = FakeCloudControl::with_statuses(vec![
        Ok(event(ProgressStatus::InProgress)),
        Err(Error::BackendTransient("Rate exceeded".into())),
        Ok(event(ProgressStatus::InProgress)),
        Ok(event(ProgressStatus::Success)),
    ]);
    let adapter = CloudControlAdapter::new(api);
    let sub = adapter.create_or_update(&stream()).await.unwrap();
    assert_eq!(sub, Submission::Pending("T".into()));
    let ev = adapter.wait_for_terminal("T", &fast(), &CancellationToken::new()).await.unwrap();
    assert_eq!(ev.status, ProgressStatus::Success);
}

#[tokio::test]
async fn failed_request_keeps_backend_text() {
    let api = FakeCloudControl::with_statuses(vec![
        Ok(event(ProgressStatus::InProgress)),
        Ok(event(ProgressStatus::Failed).with_message("Resource handler returned message: \"Stream s1 already exists\"")),
    ]);
    let adapter = CloudControlAdapter::new(api);
    adapter.create_or_update(&stream()).await.unwrap();
    match adapter.wait_for_terminal("T", &fast(), &CancellationToken::new()).await {
        Err(Error::BackendFatal(m)) => assert_eq!(m, "Resource handler returned message: \"Stream s1 already exists\""),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn update_sends_patch_and_noop_completes() {
    let api = FakeCloudControl::default();
    *api.properties.lock().unwrap() = Some(r#"{"Name":"s1","ShardCount":1,"Arn":"arn"}"#.to_string());
    let adapter = CloudControlAdapter::new(api);
    match adapter.create_or_update(&stream()).await.unwrap() {
        Submission::Completed(Some(state)) => assert_eq!(state["Arn"], "arn"),
        other => panic!("unexpected {:?}", other),
    }
    let mut bigger = stream();
    bigger.resource["ShardCount"] = json!(4);
    assert_eq!(adapter.create_or_update(&bigger).await.unwrap(), Submission::Pending("T".into()));
    let patches = adapter.api().patches.lock().unwrap().clone();
    assert_eq!(patches, vec![r#"[{"op":"replace","path":"/ShardCount","value":4}]"#.to_string()]);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let adapter = CloudControlAdapter::new(FakeCloudControl::default());
    assert_eq!(adapter.delete(&stream()).await.unwrap(), Submission::Completed(None));
    assert_eq!(*adapter.api().deletes.lock().unwrap(), 0);

    let mut gone = ProgressEvent::new(ProgressStatus::Failed).with_token("T");
    gone.operation = Some(RequestKind::Delete);
    gone.error_code = Some("NotFound".into());
    let api = FakeCloudControl::with_statuses(vec![Ok(gone)]);
    *api.properties.lock().unwrap() = Some("{}".into());
    let adapter = CloudControlAdapter::new(api);
    assert_eq!(adapter.delete(&stream()).await.unwrap(), Submission::Pending("T".into()));
    let ev = adapter.wait_for_terminal("T", &fast(), &CancellationToken::new()).await.unwrap();
    assert_eq!(ev.status, ProgressStatus::Success);
}

#[tokio::test]
async fn polling_times_out_and_cancels() {
    let api = FakeCloudControl::with_statuses(vec![Ok(event(ProgressStatus::InProgress))]);
    let adapter = CloudControlAdapter::new(api);
    let policy = PollPolicy { max_wait: Duration::from_millis(30), ..fast() };
    assert!(matches!(adapter.wait_for_terminal("T", &policy, &CancellationToken::new()).await, Err(Error::PollTimeout { .. })));

    let cancel = CancellationToken::new();
    let slow = PollPolicy { interval: Duration::from_secs(30), max_interval: Duration::from_secs(30), multiplier: 1.0, max_wait: Duration::from_secs(600) };
    let c2 = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        c2.cancel();
    });
    let started = std::time::Instant::now();
    assert!(matches!(adapter.wait_for_terminal("T", &slow, &cancel).await, Err(Error::Canceled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}
