//! Scripted in-process adapter.
//!
//! Objects live in a map keyed by output identity. By default every call
//! completes inline; `script` queues progress sequences that the next
//! submissions hand out as request tokens, and `fail_next` injects errors.
//! Every call is recorded so callers can assert ordering.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use keel_core::{Error, OutputResource, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::{Adapter, ProgressEvent, ProgressStatus, RequestKind, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    CreateOrUpdate,
    Get,
    Delete,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    /// LocalID for resource calls, request token for status calls.
    pub subject: String,
}

struct PendingRequest {
    events: VecDeque<ProgressEvent>,
    key: String,
    /// Object written on success; `None` deletes.
    apply: Option<Json>,
    done: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Json>,
    reported: FxHashMap<String, Json>,
    calls: Vec<Call>,
    failures: FxHashMap<String, VecDeque<Error>>,
    scripts: VecDeque<Vec<ProgressEvent>>,
    requests: FxHashMap<String, PendingRequest>,
    next_token: u64,
}

pub struct MemoryAdapter {
    name: String,
    state: Mutex<State>,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), state: Mutex::new(State::default()) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// The next submission returns a token whose status calls yield `statuses` in
    /// order; the last one repeats.
    pub fn script(&self, statuses: &[ProgressStatus]) {
        let events = statuses.iter().map(|s| ProgressEvent::new(*s)).collect();
        self.lock().scripts.push_back(events);
    }

    /// Like `script`, with full events (messages, error codes).
    pub fn script_events(&self, events: Vec<ProgressEvent>) { self.lock().scripts.push_back(events); }

    /// The next call touching `local_id` fails with `err`.
    pub fn fail_next(&self, local_id: &str, err: Error) {
        self.lock().failures.entry(local_id.to_string()).or_default().push_back(err);
    }

    /// Merge `fields` into what the backend reports for `local_id` after applying it.
    pub fn report(&self, local_id: &str, fields: Json) { self.lock().reported.insert(local_id.to_string(), fields); }

    /// Resolve every outstanding request with `event` (a terminal one, usually).
    pub fn finish_all(&self, event: ProgressEvent) {
        let mut st = self.lock();
        for req in st.requests.values_mut().filter(|r| !r.done) {
            let mut ev = event.clone();
            ev.operation = req.events.front().and_then(|e| e.operation);
            req.events = VecDeque::from(vec![ev]);
        }
    }

    /// Tokens handed out and not yet resolved.
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut v: Vec<String> = self.lock().requests.iter().filter(|(_, r)| !r.done).map(|(t, _)| t.clone()).collect();
        v.sort();
        v
    }

    pub fn insert_object(&self, output: &OutputResource, state: Json) { self.lock().objects.insert(output.identity.to_string(), state); }

    pub fn object(&self, output: &OutputResource) -> Option<Json> { self.lock().objects.get(&output.identity.to_string()).cloned() }

    pub fn object_count(&self) -> usize { self.lock().objects.len() }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// LocalIDs of mutating calls of `kind`, in call order.
    pub fn subjects(&self, kind: CallKind) -> Vec<String> {
        self.lock().calls.iter().filter(|c| c.kind == kind).map(|c| c.subject.clone()).collect()
    }

    fn begin(&self, kind: CallKind, output: &OutputResource) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(Call { kind, subject: output.local_id.clone() });
        if let Some(err) = st.failures.get_mut(&output.local_id).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    fn submit(&self, op: RequestKind, key: String, apply: Option<Json>) -> Submission {
        let mut st = self.lock();
        match st.scripts.pop_front() {
            Some(mut events) => {
                st.next_token += 1;
                let token = format!("{}-request-{}", self.name, st.next_token);
                for ev in events.iter_mut() {
                    ev.request_token = Some(token.clone());
                    ev.operation = Some(op);
                }
                st.requests.insert(token.clone(), PendingRequest { events: events.into(), key, apply, done: false });
                Submission::Pending(token)
            }
            None => {
                let out = apply.clone();
                match apply {
                    Some(v) => { st.objects.insert(key, v); }
                    None => { st.objects.remove(&key); }
                }
                Submission::Completed(out)
            }
        }
    }

    fn desired_state(st: &State, output: &OutputResource) -> Json {
        let mut v = output.resource.clone();
        if let (Some(obj), Some(Json::Object(extra))) = (v.as_object_mut(), st.reported.get(&output.local_id)) {
            for (k, x) in extra { obj.insert(k.clone(), x.clone()); }
        }
        v
    }
}

#[async_trait::async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str { &self.name }

    async fn create_or_update(&self, output: &OutputResource) -> Result<Submission> {
        self.begin(CallKind::CreateOrUpdate, output)?;
        let state = Self::desired_state(&self.lock(), output);
        let op = if self.object(output).is_some() { RequestKind::Update } else { RequestKind::Create };
        Ok(self.submit(op, output.identity.to_string(), Some(state)))
    }

    async fn get(&self, output: &OutputResource) -> Result<Json> {
        self.begin(CallKind::Get, output)?;
        self.object(output).ok_or_else(|| Error::NotFound(output.identity.to_string()))
    }

    async fn delete(&self, output: &OutputResource) -> Result<Submission> {
        self.begin(CallKind::Delete, output)?;
        Ok(self.submit(RequestKind::Delete, output.identity.to_string(), None))
    }

    async fn status(&self, token: &str) -> Result<ProgressEvent> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.calls.push(Call { kind: CallKind::Status, subject: token.to_string() });
        let req = st.requests.get_mut(token).ok_or_else(|| Error::NotFound(format!("request token {}", token)))?;
        let next = if req.events.len() > 1 { req.events.pop_front() } else { req.events.front().cloned() };
        let mut ev = next.unwrap_or_else(|| ProgressEvent::new(ProgressStatus::Success));
        ev.request_token = Some(token.to_string());
        if ev.status == ProgressStatus::Success && !req.done {
            req.done = true;
            match req.apply.clone() {
                Some(v) => { st.objects.insert(req.key.clone(), v); }
                None => { st.objects.remove(&req.key); }
            }
        }
        Ok(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output() -> OutputResource { OutputResource::aws("AWSResource", "AWS::Kinesis::Stream", "s1", json!({"Name": "s1"})) }

    #[tokio::test]
    async fn scripted_request_applies_on_success() {
        let a = MemoryAdapter::new("aws");
        a.script(&[ProgressStatus::InProgress, ProgressStatus::Success]);
        let Submission::Pending(token) = a.create_or_update(&output()).await.unwrap() else { panic!("expected a token") };
        assert_eq!(a.status(&token).await.unwrap().status, ProgressStatus::InProgress);
        assert!(a.object(&output()).is_none());
        assert_eq!(a.status(&token).await.unwrap().status, ProgressStatus::Success);
        assert_eq!(a.status(&token).await.unwrap().status, ProgressStatus::Success);
        assert_eq!(a.object(&output()).unwrap(), json!({"Name": "s1"}));
    }

    #[tokio::test]
    async fn delete_of_absent_object_completes() {
        let a = MemoryAdapter::new("k8s");
        assert_eq!(a.delete(&output()).await.unwrap(), Submission::Completed(None));
        a.fail_next("AWSResource", Error::BackendFatal("denied".into()));
        assert!(matches!(a.delete(&output()).await, Err(Error::BackendFatal(_))));
        assert_eq!(a.subjects(CallKind::Delete), vec!["AWSResource", "AWSResource"]);
    }
}
