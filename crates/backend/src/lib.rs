//! Keel backend adapters.
//!
//! An `Adapter` applies, reads and deletes one kind of output resource. Calls
//! either finish inline or hand back a request token that is polled through
//! `status` until the backend reports a terminal state. `wait_for_terminal`
//! drives that poll loop with back-off and honours cancellation between polls.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use keel_core::{Error, OutputResource, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod arm;
#[cfg(feature = "aws")]
pub mod aws;
pub mod cloudcontrol;
pub mod kubernetes;
pub mod memory;

pub use arm::ArmProxyAdapter;
pub use cloudcontrol::{CloudControlAdapter, CloudControlApi};
pub use kubernetes::KubernetesAdapter;
pub use memory::MemoryAdapter;

/// Outcome of a mutating adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Done; carries the backend-reported state when there is one.
    Completed(Option<Json>),
    /// Accepted by the backend; poll this request token.
    Pending(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    CancelInProgress,
    CancelComplete,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool { matches!(self, ProgressStatus::Success | ProgressStatus::Failed | ProgressStatus::CancelComplete) }

    /// Accepts Cloud Control (`IN_PROGRESS`) and ARM (`InProgress`, `Succeeded`) spellings.
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s.chars().filter(|c| *c != '_').collect::<String>().to_ascii_lowercase();
        Some(match norm.as_str() {
            "pending" | "accepted" => ProgressStatus::Pending,
            "inprogress" | "running" | "updating" | "creating" | "deleting" => ProgressStatus::InProgress,
            "success" | "succeeded" => ProgressStatus::Success,
            "failed" => ProgressStatus::Failed,
            "cancelinprogress" => ProgressStatus::CancelInProgress,
            "cancelcomplete" | "canceled" | "cancelled" => ProgressStatus::CancelComplete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Create,
    Update,
    Delete,
}

/// One observation of a backend request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    #[serde(default)]
    pub request_token: Option<String>,
    #[serde(default)]
    pub operation: Option<RequestKind>,
    /// Backend identifier of the resource, once known.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl ProgressEvent {
    pub fn new(status: ProgressStatus) -> Self {
        Self { status, request_token: None, operation: None, identifier: None, status_message: None, error_code: None }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.request_token = Some(token.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// A delete that failed because the resource is already gone.
    pub fn is_absent_on_delete(&self) -> bool {
        self.status == ProgressStatus::Failed
            && self.operation == Some(RequestKind::Delete)
            && self.error_code.as_deref().map(|c| c.eq_ignore_ascii_case("NotFound")).unwrap_or(false)
    }

    /// Map a terminal event to success or the backend's own failure text.
    pub fn into_result(self) -> Result<ProgressEvent> {
        match self.status {
            ProgressStatus::Success => Ok(self),
            ProgressStatus::Failed if self.is_absent_on_delete() => Ok(ProgressEvent { status: ProgressStatus::Success, ..self }),
            ProgressStatus::Failed => Err(Error::BackendFatal(
                self.status_message.clone().or_else(|| self.error_code.clone()).unwrap_or_else(|| "backend request failed".to_string()),
            )),
            ProgressStatus::CancelComplete => Err(Error::Canceled),
            _ => Err(Error::Internal(format!("progress event is not terminal: {:?}", self.status))),
        }
    }
}

/// Polling and retry schedule for backend requests.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Upper bound on time spent waiting for one request.
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), max_interval: Duration::from_secs(10), multiplier: 2.0, max_wait: Duration::from_secs(300) }
    }
}

impl PollPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |k: &str, dflt: Duration| std::env::var(k).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(dflt);
        Self {
            interval: ms("KEEL_POLL_INTERVAL_MS", d.interval),
            max_interval: ms("KEEL_POLL_MAX_INTERVAL_MS", d.max_interval),
            multiplier: std::env::var("KEEL_POLL_MULTIPLIER").ok().and_then(|s| s.parse().ok()).unwrap_or(d.multiplier),
            max_wait: std::env::var("KEEL_POLL_MAX_WAIT_SECS").ok().and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.max_wait),
        }
    }

    /// Delay before poll number `attempt` (0-based), capped at `max_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.interval.as_millis() as f64 * self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        Duration::from_millis(ms as u64).min(self.max_interval)
    }
}

/// Sleep for `d` unless `cancel` fires first.
pub async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}

/// Run `f` until it succeeds or fails with a non-retriable error, backing off between
/// transient failures; gives up with the last error once `max_wait` is spent.
pub async fn with_retries<T, F, Fut>(policy: &PollPolicy, cancel: &CancellationToken, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            r = f() => r,
        };
        match res {
            Err(Error::BackendTransient(msg)) => {
                let delay = policy.delay_for_attempt(attempt);
                if started.elapsed() + delay > policy.max_wait {
                    return Err(Error::BackendTransient(msg));
                }
                counter!("adapter_retry_total", 1u64);
                warn!(what, attempt, error = %msg, delay_ms = delay.as_millis() as u64, "backend: transient failure, retrying");
                sleep_or_cancel(delay, cancel).await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Converge the backend object to `output.resource`.
    async fn create_or_update(&self, output: &OutputResource) -> Result<Submission>;

    /// Current backend state; `NotFound` when absent.
    async fn get(&self, output: &OutputResource) -> Result<Json>;

    /// Remove the backend object; an already absent object completes successfully.
    async fn delete(&self, output: &OutputResource) -> Result<Submission>;

    /// Status of a request token returned by `create_or_update` or `delete`.
    async fn status(&self, token: &str) -> Result<ProgressEvent>;

    /// Poll `token` until terminal. Failed requests surface as `BackendFatal` with the
    /// backend's message, transient polling errors are retried, and the wait ends with
    /// `PollTimeout` after `policy.max_wait` or `Canceled` when `cancel` fires.
    async fn wait_for_terminal(&self, token: &str, policy: &PollPolicy, cancel: &CancellationToken) -> Result<ProgressEvent> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            counter!("adapter_poll_total", 1u64);
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                r = self.status(token) => r,
            };
            match polled {
                Ok(ev) if ev.status.is_terminal() => {
                    debug!(adapter = self.name(), token, status = ?ev.status, took_ms = %started.elapsed().as_millis(), "backend: request terminal");
                    return ev.into_result();
                }
                Ok(ev) => debug!(adapter = self.name(), token, status = ?ev.status, "backend: request in progress"),
                Err(e) if e.is_retriable() => warn!(adapter = self.name(), token, error = %e, "backend: status poll failed, retrying"),
                Err(e) => return Err(e),
            }
            let elapsed = started.elapsed();
            if elapsed >= policy.max_wait {
                counter!("adapter_poll_timeout_total", 1u64);
                return Err(Error::PollTimeout { token: token.to_string(), waited_secs: elapsed.as_secs() });
            }
            let delay = policy.delay_for_attempt(attempt).min(policy.max_wait - elapsed);
            sleep_or_cancel(delay, cancel).await?;
            attempt += 1;
        }
    }
}
