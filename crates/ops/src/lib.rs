//! Keel Ops: the asynchronous operation controller.
//!
//! A request is accepted synchronously (routing, renderer lookup, dependency
//! resolution, per-resource lease) and executed on a background task that
//! renders, deploys outputs in dependency order, polls backend tokens and records
//! progress on the operation record. Callers poll the operation by id.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_backend::PollPolicy;
use keel_core::{Error, LogicalResource, Operation, OperationError, OperationKind, OperationStatus, OutputKind, ProvisioningState, ResourceId, Result};
use keel_planes::Router;
use keel_render::{Dependencies, DependencyResolver, Registry, RendererResource, StoreResources};
use keel_store::{find_as, get_as, keys, save_as, update, Precondition, Store};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod execute;

/// What to do when a request targets a resource that already has an operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail the new request with `ConflictingOperation`.
    #[default]
    Reject,
    /// Hand back the in-flight operation when it is of the same kind.
    Attach,
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(ConflictPolicy::Reject),
            "attach" => Ok(ConflictPolicy::Attach),
            other => Err(Error::Validation(format!("unknown conflict policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub poll: PollPolicy,
    /// How long terminal operation records are kept.
    pub retention: Duration,
    pub conflict_policy: ConflictPolicy,
    pub reaper_interval: Duration,
    /// A non-terminal operation silent for this long is considered abandoned.
    pub lease_ttl: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            retention: Duration::from_secs(48 * 3600),
            conflict_policy: ConflictPolicy::Reject,
            reaper_interval: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(600),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |k: &str, dflt: Duration| std::env::var(k).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(dflt);
        Self {
            poll: PollPolicy::from_env(),
            retention: secs("KEEL_OPERATION_RETENTION_SECS", d.retention),
            conflict_policy: std::env::var("KEEL_CONFLICT_POLICY").ok().and_then(|s| s.parse().ok()).unwrap_or(d.conflict_policy),
            reaper_interval: secs("KEEL_REAPER_INTERVAL_SECS", d.reaper_interval),
            lease_ttl: secs("KEEL_LEASE_TTL_SECS", d.lease_ttl),
        }
    }
}

/// Record naming the operation that currently owns a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub operation: Uuid,
    pub target: ResourceId,
    pub acquired_at: DateTime<Utc>,
}

/// Result of accepting a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub operation: Operation,
    /// No record existed for the target before this request.
    pub created: bool,
    /// The request joined an operation that was already in flight.
    pub attached: bool,
}

struct Running {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn Store>,
    router: Router,
    registry: Registry,
    config: ControllerConfig,
    root: CancellationToken,
    running: Mutex<FxHashMap<Uuid, Running>>,
}

/// Cheap to clone; every clone drives the same set of background tasks.
#[derive(Clone)]
pub struct OperationController {
    inner: Arc<Inner>,
}

impl OperationController {
    pub fn new(store: Arc<dyn Store>, router: Router, registry: Registry, config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                router,
                registry,
                config,
                root: CancellationToken::new(),
                running: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> { &self.inner.store }
    pub fn router(&self) -> &Router { &self.inner.router }
    pub fn registry(&self) -> &Registry { &self.inner.registry }
    pub fn config(&self) -> &ControllerConfig { &self.inner.config }

    /// Accept a create-or-update of `id` with the given properties.
    ///
    /// Validation, routing, renderer lookup and dependency resolution happen before
    /// anything is persisted, so those failures never leave an operation behind.
    pub async fn create_or_update(&self, id: &ResourceId, properties: Json) -> Result<Accepted> {
        if id.is_scope() || id.is_collection() {
            return Err(Error::Validation(format!("'{}' does not name a resource", id)));
        }
        self.inner.router.route(id)?;
        let renderer = self.inner.registry.get(&id.resource_type())?;

        let key = keys::resource(id);
        let store = self.inner.store.as_ref();
        let existing = find_as::<LogicalResource>(store, &key).await?;
        let created = existing.is_none();
        let mut desired = match &existing {
            Some((r, _)) => r.clone(),
            None => LogicalResource::new(id.clone(), Json::Null),
        };
        desired.id = id.clone();
        desired.properties = properties;
        desired.generation += 1;
        desired.provisioning_state = ProvisioningState::Provisioning;
        desired.updated_at = Some(Utc::now());

        let reader = StoreResources::new(self.inner.store.clone());
        let resolution = DependencyResolver::new(&self.inner.registry, &reader).resolve(&desired).await?;

        let op = Operation::new(id.clone(), OperationKind::CreateOrUpdate);
        if let Some(held) = self.begin(&op).await? {
            return Ok(Accepted { operation: held, created: false, attached: true });
        }
        let precondition = match &existing {
            Some((_, etag)) => Precondition::Matches(etag.clone()),
            None => Precondition::DoesNotExist,
        };
        if let Err(e) = save_as(store, &key, &desired, precondition).await {
            self.inner.abandon(&op).await;
            return Err(e);
        }

        counter!("operations_accepted_total", 1u64);
        info!(operation = %op.id, resource = %id, generation = desired.generation, deps = resolution.order.len(), "ops: create-or-update accepted");
        let previous = existing.map(|(r, _)| r.status.output_resources).unwrap_or_default();
        let dependencies: Dependencies = resolution.dependencies;
        let op_id = op.id;
        self.spawn(op_id, move |inner, cancel| async move {
            inner.run_create(op_id, desired, renderer, dependencies, previous, cancel).await
        });
        Ok(Accepted { operation: op, created, attached: false })
    }

    /// Accept a delete of `id`. `None` when there is nothing to delete.
    pub async fn delete(&self, id: &ResourceId) -> Result<Option<Accepted>> {
        let key = keys::resource(id);
        let store = self.inner.store.as_ref();
        let Some((mut existing, etag)) = find_as::<LogicalResource>(store, &key).await? else {
            debug!(resource = %id, "ops: delete of absent resource");
            return Ok(None);
        };
        let op = Operation::new(id.clone(), OperationKind::Delete);
        if let Some(held) = self.begin(&op).await? {
            return Ok(Some(Accepted { operation: held, created: false, attached: true }));
        }
        existing.provisioning_state = ProvisioningState::Provisioning;
        existing.updated_at = Some(Utc::now());
        if let Err(e) = save_as(store, &key, &existing, Precondition::Matches(etag)).await {
            self.inner.abandon(&op).await;
            return Err(e);
        }

        counter!("operations_accepted_total", 1u64);
        info!(operation = %op.id, resource = %id, outputs = existing.status.output_resources.len(), "ops: delete accepted");
        let op_id = op.id;
        self.spawn(op_id, move |inner, cancel| async move { inner.run_delete(op_id, existing, cancel).await });
        Ok(Some(Accepted { operation: op, created: false, attached: false }))
    }

    pub async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        match find_as::<Operation>(self.inner.store.as_ref(), &keys::operation(id)).await? {
            Some((op, _)) => Ok(op),
            None => Err(Error::NotFound(format!("operation {}", id))),
        }
    }

    /// Request cancellation of an operation executing in this process.
    pub async fn cancel(&self, id: Uuid) -> Result<Operation> {
        let op = self.get_operation(id).await?;
        if op.is_terminal() {
            return Ok(op);
        }
        let token = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner).get(&id).map(|r| r.cancel.clone());
        match token {
            Some(t) => {
                t.cancel();
                info!(operation = %id, resource = %op.target, "ops: cancellation requested");
                Ok(op)
            }
            None => Err(Error::Validation(format!("operation {} is not executing in this process", id))),
        }
    }

    /// Poll the operation record until it is terminal.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<Operation> {
        let started = Instant::now();
        loop {
            let op = self.get_operation(id).await?;
            if op.is_terminal() {
                return Ok(op);
            }
            if started.elapsed() >= timeout {
                return Err(Error::PollTimeout { token: id.to_string(), waited_secs: started.elapsed().as_secs() });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Secret values of a deployed resource, resolved against its recorded outputs.
    pub async fn list_secrets(&self, id: &ResourceId) -> Result<BTreeMap<String, Json>> {
        let (resource, _) = get_as::<LogicalResource>(self.inner.store.as_ref(), &keys::resource(id)).await?;
        let renderer = self.inner.registry.get(&id.resource_type())?;
        let reader = StoreResources::new(self.inner.store.clone());
        let resolution = DependencyResolver::new(&self.inner.registry, &reader).resolve(&resource).await?;
        let out = renderer.render(&RendererResource::from_logical(&resource), &resolution.dependencies).map_err(|p| p.error)?;
        let mut secrets = BTreeMap::new();
        for (name, value) in &out.secret_values {
            secrets.insert(name.clone(), value.resolve(&resource.status.output_resources)?);
        }
        Ok(secrets)
    }

    /// Read a provider-addressed cloud resource straight from its backend.
    ///
    /// Only types whose renderer maps the id onto a single non-Kubernetes output
    /// (the AWS and Azure passthroughs) can be read this way.
    pub async fn proxy_get(&self, id: &ResourceId) -> Result<Json> {
        let renderer = self.inner.registry.get(&id.resource_type())?;
        let bare = RendererResource::from_logical(&LogicalResource::new(id.clone(), Json::Null));
        let out = renderer.render(&bare, &Dependencies::new()).map_err(|p| p.error)?;
        let target = match out.resources.as_slice() {
            [o] if o.kind() != OutputKind::Kubernetes => o,
            _ => return Err(Error::NotFound(id.to_string())),
        };
        let adapter = self.inner.router.adapter_for(target)?;
        adapter.get(target).await
    }

    /// Delete terminal operations older than the retention window and fail
    /// operations nobody has touched within the lease TTL. Returns the number
    /// of records removed.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let store = self.inner.store.as_ref();
        let now = Utc::now();
        let retention = span(self.inner.config.retention);
        let ttl = span(self.inner.config.lease_ttl);
        let mut removed = 0usize;
        for (key, obj) in store.list(keys::OPERATIONS).await? {
            let op: Operation = match serde_json::from_value(obj.value) {
                Ok(op) => op,
                Err(e) => {
                    warn!(key = %key, error = %e, "ops: skipping unreadable operation record");
                    continue;
                }
            };
            if op.is_terminal() {
                if op.end_time.map(|t| now - t > retention).unwrap_or(false) {
                    match store.delete(&key, Precondition::Matches(obj.etag)).await {
                        Ok(()) => removed += 1,
                        Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            } else if now - op.last_updated_time > ttl && !self.inner.is_running(op.id) {
                self.inner.fail_abandoned(&op).await;
            }
        }
        if removed > 0 {
            counter!("operations_reclaimed_total", removed as u64);
            info!(removed, "ops: reclaimed expired operations");
        }
        Ok(removed)
    }

    /// Run `reclaim_expired` every `reaper_interval` until shutdown.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let interval = this.inner.config.reaper_interval;
            loop {
                tokio::select! {
                    _ = this.inner.root.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = this.reclaim_expired().await {
                    warn!(error = %e, "ops: reaper pass failed");
                }
            }
            debug!("ops: reaper stopped");
        })
    }

    /// Number of operations executing in this process.
    pub fn in_flight(&self) -> usize { self.inner.running.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Cancel every in-flight operation and wait for the tasks to record their outcome.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
            running.values_mut().filter_map(|r| r.handle.take()).collect()
        };
        info!(tasks = handles.len(), "ops: shutting down");
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "ops: operation task ended abnormally");
            }
        }
    }

    /// Persist `op` and take the target's lease. `Some` when the request attached
    /// to an operation that already holds it.
    async fn begin(&self, op: &Operation) -> Result<Option<Operation>> {
        let store = self.inner.store.as_ref();
        save_as(store, &keys::operation(op.id), op, Precondition::DoesNotExist).await?;
        match self.inner.acquire_lease(op).await {
            Ok(()) => Ok(None),
            Err(Error::ConflictingOperation { target, operation }) => {
                let _ = store.delete(&keys::operation(op.id), Precondition::Any).await;
                counter!("operations_conflict_total", 1u64);
                if self.inner.config.conflict_policy == ConflictPolicy::Attach {
                    if let Ok(held_id) = operation.parse::<Uuid>() {
                        if let Ok(held) = self.get_operation(held_id).await {
                            if held.kind == op.kind && !held.is_terminal() {
                                info!(operation = %held.id, resource = %op.target, "ops: attached to in-flight operation");
                                return Ok(Some(held));
                            }
                        }
                    }
                }
                warn!(resource = %target, operation = %operation, "ops: conflicting operation in flight");
                Err(Error::ConflictingOperation { target, operation })
            }
            Err(e) => {
                let _ = store.delete(&keys::operation(op.id), Precondition::Any).await;
                Err(e)
            }
        }
    }

    fn spawn<F, Fut>(&self, op_id: Uuid, run: F)
    where
        F: FnOnce(Arc<Inner>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.root.child_token();
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op_id, Running { cancel: cancel.clone(), handle: None });
        let handle = tokio::spawn(run(self.inner.clone(), cancel));
        let mut running = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
        // The task may already have finished and removed itself.
        if let Some(r) = running.get_mut(&op_id) {
            r.handle = Some(handle);
        }
    }
}

fn span(d: Duration) -> chrono::Duration { chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64) }

impl Inner {
    fn is_running(&self, id: Uuid) -> bool { self.running.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&id) }

    async fn acquire_lease(&self, op: &Operation) -> Result<()> {
        let store = self.store.as_ref();
        let key = keys::lease(&op.target);
        let lease = Lease { operation: op.id, target: op.target.clone(), acquired_at: Utc::now() };
        for _ in 0..3 {
            match save_as(store, &key, &lease, Precondition::DoesNotExist).await {
                Ok(_) => return Ok(()),
                Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
            let Some((held, etag)) = find_as::<Lease>(store, &key).await? else { continue };
            let holder = find_as::<Operation>(store, &keys::operation(held.operation)).await?.map(|(o, _)| o);
            let ttl = span(self.config.lease_ttl);
            let stale = match &holder {
                None => true,
                Some(o) => o.is_terminal() || (Utc::now() - o.last_updated_time > ttl && !self.is_running(o.id)),
            };
            if !stale {
                return Err(Error::ConflictingOperation { target: op.target.to_string(), operation: held.operation.to_string() });
            }
            match save_as(store, &key, &lease, Precondition::Matches(etag)).await {
                Ok(_) => {
                    if let Some(o) = holder.filter(|o| !o.is_terminal()) {
                        self.fail_abandoned(&o).await;
                    }
                    debug!(resource = %op.target, previous = %held.operation, "ops: took over stale lease");
                    return Ok(());
                }
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(key))
    }

    async fn release_lease(&self, target: &ResourceId, op_id: Uuid) {
        let store = self.store.as_ref();
        let key = keys::lease(target);
        match find_as::<Lease>(store, &key).await {
            Ok(Some((lease, etag))) if lease.operation == op_id => {
                if let Err(e) = store.delete(&key, Precondition::Matches(etag)).await {
                    debug!(resource = %target, error = %e, "ops: lease already changed hands");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(resource = %target, error = %e, "ops: reading lease failed"),
        }
    }

    /// Undo a begin() whose follow-up write failed.
    async fn abandon(&self, op: &Operation) {
        let _ = self.store.delete(&keys::operation(op.id), Precondition::Any).await;
        self.release_lease(&op.target, op.id).await;
    }

    async fn fail_abandoned(&self, op: &Operation) {
        let err = OperationError::from_error(&Error::Internal("operation was abandoned".into()), None);
        let res = update(self.store.as_ref(), &keys::operation(op.id), |o: &mut Operation| {
            o.finish(OperationStatus::Failed, Some(err.clone()));
            Ok(())
        })
        .await;
        match res {
            Ok(_) => warn!(operation = %op.id, resource = %op.target, "ops: failed abandoned operation"),
            Err(e) => warn!(operation = %op.id, error = %e, "ops: could not fail abandoned operation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_policy_parses_case_insensitively() {
        assert_eq!("Attach".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Attach);
        assert_eq!("reject".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Reject);
        assert!("queue".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn config_defaults() {
        let c = ControllerConfig::default();
        assert_eq!(c.retention, Duration::from_secs(172_800));
        assert_eq!(c.conflict_policy, ConflictPolicy::Reject);
        assert!(c.lease_ttl > c.poll.max_wait);
    }

    #[test]
    fn lease_serializes_camel_case() {
        let target = ResourceId::parse("/planes/radius/local/resourceGroups/rg/providers/Applications.Core/containers/c").unwrap();
        let lease = Lease { operation: Uuid::nil(), target, acquired_at: Utc::now() };
        let v = serde_json::to_value(&lease).unwrap();
        assert!(v.get("acquiredAt").is_some());
        assert_eq!(serde_json::from_value::<Lease>(v).unwrap(), lease);
    }
}
