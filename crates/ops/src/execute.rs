//! Background execution of accepted operations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use keel_backend::{with_retries, Submission};
use keel_core::{
    Error, LogicalResource, Operation, OperationError, OperationStatus, OutputIdentity, OutputResource, ProvisioningState, ResourceId, Result,
};
use keel_render::{order_outputs, Dependencies, Renderer, RendererResource};
use keel_store::{find_as, keys, update, Precondition};
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Inner, Lease};

/// Why an execution stopped, and at which output.
struct Failure {
    error: Error,
    target: Option<String>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self { Self { error, target: None } }
}

impl Failure {
    fn at(local_id: &str, error: Error) -> Self { Self { error, target: Some(local_id.to_string()) } }
}

type Outcome = std::result::Result<(), Failure>;

/// `new` plus previously deployed outputs it no longer covers, so they stay
/// tracked until they are deleted.
fn carry_over(new: &[OutputResource], previous: &[OutputResource]) -> Vec<OutputResource> {
    let mut all = new.to_vec();
    all.extend(previous.iter().filter(|p| p.managed && p.deployed && !new.iter().any(|o| o.same_target(p))).cloned());
    all
}

fn percent(done: usize, total: usize) -> u8 { (done * 100 / total.max(1)).min(99) as u8 }

impl Inner {
    async fn set_op<F>(&self, id: Uuid, mut f: F) -> Result<Operation>
    where
        F: FnMut(&mut Operation) + Send,
    {
        update(self.store.as_ref(), &keys::operation(id), |op: &mut Operation| {
            f(op);
            op.touch();
            Ok(())
        })
        .await
    }

    async fn set_resource<F>(&self, id: &ResourceId, mut f: F) -> Result<LogicalResource>
    where
        F: FnMut(&mut LogicalResource) + Send,
    {
        update(self.store.as_ref(), &keys::resource(id), |r: &mut LogicalResource| {
            f(r);
            r.updated_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn record_outputs(&self, id: &ResourceId, outputs: Vec<OutputResource>) -> Result<()> {
        self.set_resource(id, |r| r.status.output_resources = outputs.clone()).await.map(|_| ())
    }

    pub(crate) async fn run_create(
        self: Arc<Self>,
        op_id: Uuid,
        desired: LogicalResource,
        renderer: Arc<dyn Renderer>,
        dependencies: Dependencies,
        previous: Vec<OutputResource>,
        cancel: CancellationToken,
    ) {
        let work = self.create(op_id, &desired, renderer.as_ref(), &dependencies, &previous, &cancel);
        let outcome = self.with_heartbeat(op_id, &cancel, work).await;
        if self.owns(op_id, &desired.id).await {
            self.settle_resource(&desired.id, &outcome).await;
        }
        self.finish(op_id, &desired.id, outcome).await;
    }

    pub(crate) async fn run_delete(self: Arc<Self>, op_id: Uuid, existing: LogicalResource, cancel: CancellationToken) {
        let work = self.remove_all(op_id, &existing, &cancel);
        let outcome = self.with_heartbeat(op_id, &cancel, work).await;
        if outcome.is_err() && self.owns(op_id, &existing.id).await {
            self.settle_resource(&existing.id, &outcome).await;
        }
        self.finish(op_id, &existing.id, outcome).await;
    }

    /// Drive `work` while touching the operation record every third of the lease
    /// TTL, so a long backend call never makes the operation look abandoned to
    /// another controller. If the record is finished elsewhere the work is canceled.
    async fn with_heartbeat<T>(&self, op_id: Uuid, cancel: &CancellationToken, work: impl Future<Output = T>) -> T {
        let every = (self.config.lease_ttl / 3).max(Duration::from_millis(10));
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticks.tick() => {
                    if !self.heartbeat(op_id).await && !cancel.is_cancelled() {
                        warn!(operation = %op_id, "ops: operation was finished elsewhere, stopping");
                        cancel.cancel();
                    }
                }
            }
        }
    }

    /// Refresh `last_updated_time`. False once the record is terminal.
    async fn heartbeat(&self, op_id: Uuid) -> bool {
        let mut live = true;
        let res = update(self.store.as_ref(), &keys::operation(op_id), |op: &mut Operation| {
            live = !op.is_terminal();
            if live {
                op.touch();
            }
            Ok(())
        })
        .await;
        match res {
            Ok(_) => live,
            Err(e) => {
                warn!(operation = %op_id, error = %e, "ops: heartbeat failed");
                true
            }
        }
    }

    /// The operation is still live and still holds the target's lease.
    async fn owns(&self, op_id: Uuid, target: &ResourceId) -> bool {
        let store = self.store.as_ref();
        let live = matches!(find_as::<Operation>(store, &keys::operation(op_id)).await, Ok(Some((op, _))) if !op.is_terminal());
        let leased = matches!(find_as::<Lease>(store, &keys::lease(target)).await, Ok(Some((lease, _))) if lease.operation == op_id);
        live && leased
    }

    async fn settle_resource(&self, id: &ResourceId, outcome: &Outcome) {
        let state = match outcome {
            Ok(()) => ProvisioningState::Succeeded,
            Err(f) if f.error == Error::Canceled => ProvisioningState::Canceled,
            Err(_) => ProvisioningState::Failed,
        };
        if let Err(e) = self.set_resource(id, |r| r.provisioning_state = state).await {
            warn!(resource = %id, error = %e, "ops: could not record provisioning state");
        }
    }

    async fn create(
        &self,
        op_id: Uuid,
        desired: &LogicalResource,
        renderer: &dyn Renderer,
        dependencies: &Dependencies,
        previous: &[OutputResource],
        cancel: &CancellationToken,
    ) -> Outcome {
        self.set_op(op_id, |op| op.status = OperationStatus::Running).await?;

        let resource = RendererResource::from_logical(desired);
        let started = Instant::now();
        let rendered = renderer.render(&resource, dependencies);
        histogram!("render_ms", started.elapsed().as_secs_f64() * 1000.0);
        let rendered = match rendered {
            Ok(out) => out,
            Err(partial) => {
                warn!(operation = %op_id, resource = %desired.id, error = %partial.error, partial = partial.output.resources.len(), "ops: render failed");
                self.record_outputs(&desired.id, carry_over(&partial.output.resources, previous)).await?;
                return Err(partial.error.into());
            }
        };
        debug!(operation = %op_id, outputs = rendered.resources.len(), "ops: rendered");

        let mut outputs = rendered.resources;
        let order = order_outputs(&outputs)?;
        let total = order.len() + 1;
        for (done, &i) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                self.record_outputs(&desired.id, carry_over(&outputs, previous)).await?;
                return Err(Error::Canceled.into());
            }
            if let Err(e) = self.deploy(op_id, &mut outputs[i], cancel).await {
                let local_id = outputs[i].local_id.clone();
                warn!(operation = %op_id, resource = %desired.id, local_id = %local_id, error = %e, "ops: output failed");
                self.record_outputs(&desired.id, carry_over(&outputs, previous)).await?;
                return Err(Failure::at(&local_id, e));
            }
            let pct = percent(done + 1, total);
            self.set_op(op_id, |op| {
                op.percent_complete = pct;
                op.continuation = None;
            })
            .await?;
            self.record_outputs(&desired.id, carry_over(&outputs, previous)).await?;
        }

        let bindings = renderer.allocate_bindings(&resource, &outputs)?;
        let mut computed = BTreeMap::new();
        for (name, value) in &rendered.computed_values {
            computed.insert(name.clone(), value.resolve(&outputs)?);
        }

        let orphans: Vec<OutputResource> =
            previous.iter().filter(|p| p.managed && !outputs.iter().any(|o| o.same_target(p))).cloned().collect();
        if !orphans.is_empty() {
            let mut order = order_outputs(&orphans).unwrap_or_else(|_| (0..orphans.len()).collect());
            order.reverse();
            for i in order {
                let o = &orphans[i];
                self.remove(op_id, o, cancel).await.map_err(|e| Failure::at(&o.local_id, e))?;
                info!(operation = %op_id, local_id = %o.local_id, identity = %o.identity, "ops: removed orphaned output");
            }
        }

        self.set_resource(&desired.id, |r| {
            r.status.output_resources = outputs.clone();
            r.status.computed_values = computed.clone();
            r.status.bindings = bindings.clone();
        })
        .await?;
        Ok(())
    }

    /// Converge one output. Unmanaged outputs are only recorded.
    async fn deploy(&self, op_id: Uuid, output: &mut OutputResource, cancel: &CancellationToken) -> Result<()> {
        if !output.managed {
            output.deployed = true;
            debug!(operation = %op_id, local_id = %output.local_id, "ops: unmanaged output recorded");
            return Ok(());
        }
        let adapter = self.router.adapter_for(output)?;
        let a = adapter.as_ref();
        let policy = &self.config.poll;
        let started = Instant::now();

        let submitted = {
            let current: &OutputResource = output;
            with_retries(policy, cancel, &current.local_id, move || a.create_or_update(current)).await?
        };
        let state = match submitted {
            Submission::Completed(state) => state,
            Submission::Pending(token) => {
                self.set_op(op_id, |op| op.continuation = Some(token.clone())).await?;
                info!(operation = %op_id, local_id = %output.local_id, adapter = a.name(), token = %token, "ops: polling backend request");
                let ev = a.wait_for_terminal(&token, policy, cancel).await?;
                if let (Some(found), OutputIdentity::AwsCloudControl { identifier, .. }) = (ev.identifier, &mut output.identity) {
                    if identifier.is_empty() {
                        *identifier = found;
                    }
                }
                None
            }
        };
        let state = match state {
            Some(s) => Some(s),
            None => {
                let current: &OutputResource = output;
                match with_retries(policy, cancel, &current.local_id, move || a.get(current)).await {
                    Ok(s) => Some(s),
                    Err(Error::NotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            }
        };
        output.deployed = true;
        output.state = state;
        counter!("outputs_deployed_total", 1u64);
        histogram!("output_deploy_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(operation = %op_id, local_id = %output.local_id, identity = %output.identity, "ops: output deployed");
        Ok(())
    }

    /// Delete one output from its backend; absent objects count as deleted.
    async fn remove(&self, op_id: Uuid, output: &OutputResource, cancel: &CancellationToken) -> Result<()> {
        if !output.managed {
            return Ok(());
        }
        let adapter = self.router.adapter_for(output)?;
        let a = adapter.as_ref();
        let policy = &self.config.poll;
        match with_retries(policy, cancel, &output.local_id, move || a.delete(output)).await? {
            Submission::Completed(_) => {}
            Submission::Pending(token) => {
                self.set_op(op_id, |op| op.continuation = Some(token.clone())).await?;
                a.wait_for_terminal(&token, policy, cancel).await?;
            }
        }
        counter!("outputs_deleted_total", 1u64);
        Ok(())
    }

    async fn remove_all(&self, op_id: Uuid, existing: &LogicalResource, cancel: &CancellationToken) -> Outcome {
        self.set_op(op_id, |op| op.status = OperationStatus::Running).await?;
        let outputs = &existing.status.output_resources;
        let mut order = order_outputs(outputs).unwrap_or_else(|_| (0..outputs.len()).collect());
        order.reverse();
        let total = order.len() + 1;
        for (done, &i) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Canceled.into());
            }
            let o = &outputs[i];
            self.remove(op_id, o, cancel).await.map_err(|e| Failure::at(&o.local_id, e))?;
            debug!(operation = %op_id, local_id = %o.local_id, "ops: output deleted");
            let pct = percent(done + 1, total);
            self.set_op(op_id, |op| {
                op.percent_complete = pct;
                op.continuation = None;
            })
            .await?;
        }

        let store = self.store.as_ref();
        let key = keys::resource(&existing.id);
        if let Some((_, etag)) = find_as::<LogicalResource>(store, &key).await? {
            match store.delete(&key, Precondition::Matches(etag)).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn finish(&self, op_id: Uuid, target: &ResourceId, outcome: Outcome) {
        let (status, err) = match outcome {
            Ok(()) => (OperationStatus::Succeeded, None),
            Err(f) if f.error == Error::Canceled => (OperationStatus::Canceled, Some(OperationError::from_error(&f.error, f.target))),
            Err(f) => (OperationStatus::Failed, Some(OperationError::from_error(&f.error, f.target))),
        };
        let mut applied = false;
        let recorded = self.set_op(op_id, |op| applied = op.finish(status, err.clone())).await;
        match recorded {
            Ok(op) if !applied => {
                warn!(operation = %op_id, resource = %target, recorded = ?op.status, outcome = ?status, "ops: operation was already finished elsewhere");
            }
            Ok(op) => {
                let took = op.end_time.map(|end| (end - op.start_time).num_milliseconds().max(0)).unwrap_or(0);
                histogram!("operation_duration_ms", took as f64);
                match status {
                    OperationStatus::Succeeded => {
                        counter!("operations_succeeded_total", 1u64);
                        info!(operation = %op_id, resource = %target, kind = ?op.kind, took_ms = took, "ops: operation succeeded");
                    }
                    OperationStatus::Canceled => {
                        counter!("operations_canceled_total", 1u64);
                        info!(operation = %op_id, resource = %target, "ops: operation canceled");
                    }
                    _ => {
                        counter!("operations_failed_total", 1u64);
                        let e = op.error.as_ref();
                        warn!(
                            operation = %op_id,
                            resource = %target,
                            code = e.map(|e| e.code.as_str()).unwrap_or(""),
                            local_id = e.and_then(|e| e.target.as_deref()).unwrap_or(""),
                            error = e.map(|e| e.message.as_str()).unwrap_or(""),
                            "ops: operation failed"
                        );
                    }
                }
            }
            Err(e) => error!(operation = %op_id, resource = %target, error = %e, "ops: could not record operation outcome"),
        }
        self.release_lease(target, op_id).await;
        self.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&op_id);
    }
}
