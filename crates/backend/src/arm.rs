//! Azure Resource Manager proxy adapter.
//!
//! Sends ARM-shaped requests to a base URL (ARM itself or a proxy plane). A
//! `202 Accepted` hands back the `Azure-AsyncOperation` (or `Location`) URL,
//! which `status` polls until `Succeeded`, `Failed` or `Canceled`.

use std::time::Duration;

use keel_core::{Error, OutputIdentity, OutputResource, Result};
use reqwest::{header, Method, StatusCode};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{Adapter, ProgressEvent, ProgressStatus, Submission};

pub const ASYNC_OPERATION_HEADER: &str = "Azure-AsyncOperation";

pub struct ArmProxyAdapter {
    http: reqwest::Client,
    base_url: String,
    bearer: Option<String>,
}

impl ArmProxyAdapter {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let timeout = std::env::var("KEEL_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
        let http = reqwest::Client::builder().timeout(Duration::from_secs(timeout)).build()?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string(), bearer: None })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn target(output: &OutputResource) -> Result<(&str, &str)> {
        match &output.identity {
            OutputIdentity::AzureArm { id, api_version } => Ok((id.as_str(), api_version.as_str())),
            other => Err(Error::Validation(format!("arm cannot handle output '{}' ({})", output.local_id, other))),
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let rb = self.http.request(method, url);
        match &self.bearer {
            Some(t) => rb.bearer_auth(t),
            None => rb,
        }
    }

    fn url(&self, id: &str, api_version: &str) -> String { format!("{}{}?api-version={}", self.base_url, id, api_version) }
}

fn transport(e: reqwest::Error) -> Error { Error::BackendTransient(e.to_string()) }

/// ARM error body `{"error": {"code", "message"}}`, falling back to the raw text.
fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<Json>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(|s| s.to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if body.is_empty() { format!("request failed with {}", status) } else { body.to_string() })
}

fn classify(status: StatusCode, body: &str) -> Error {
    let msg = error_message(body, status);
    match status.as_u16() {
        404 => Error::NotFound(msg),
        409 | 429 | 500..=599 => Error::BackendTransient(msg),
        _ => Error::BackendFatal(msg),
    }
}

fn async_token(resp: &reqwest::Response) -> Option<String> {
    let h = resp.headers();
    h.get(ASYNC_OPERATION_HEADER)
        .or_else(|| h.get(header::LOCATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Status document of an ARM async operation.
pub fn parse_operation_status(body: &Json) -> Result<ProgressEvent> {
    let raw = body.get("status").and_then(|v| v.as_str()).unwrap_or("InProgress");
    let status = ProgressStatus::parse(raw).ok_or_else(|| Error::BackendFatal(format!("unknown async operation status '{}'", raw)))?;
    let mut ev = ProgressEvent::new(status);
    ev.status_message = body.pointer("/error/message").and_then(|v| v.as_str()).map(|s| s.to_string());
    ev.error_code = body.pointer("/error/code").and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(ev)
}

#[async_trait::async_trait]
impl Adapter for ArmProxyAdapter {
    fn name(&self) -> &str { "arm" }

    async fn create_or_update(&self, output: &OutputResource) -> Result<Submission> {
        let (id, api_version) = Self::target(output)?;
        let resp = self.request(Method::PUT, &self.url(id, api_version)).json(&output.resource).send().await.map_err(transport)?;
        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            let token = async_token(&resp).ok_or_else(|| Error::BackendFatal(format!("PUT {} accepted without an async operation header", id)))?;
            info!(id, "arm: create accepted");
            return Ok(Submission::Pending(token));
        }
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() { return Err(classify(status, &body)); }
        info!(id, status = status.as_u16(), "arm: created or updated");
        Ok(Submission::Completed(serde_json::from_str(&body).ok()))
    }

    async fn get(&self, output: &OutputResource) -> Result<Json> {
        let (id, api_version) = Self::target(output)?;
        let resp = self.request(Method::GET, &self.url(id, api_version)).send().await.map_err(transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() { return Err(classify(status, &body)); }
        serde_json::from_str(&body).map_err(|e| Error::BackendFatal(format!("unreadable body for {}: {}", id, e)))
    }

    async fn delete(&self, output: &OutputResource) -> Result<Submission> {
        let (id, api_version) = Self::target(output)?;
        let resp = self.request(Method::DELETE, &self.url(id, api_version)).send().await.map_err(transport)?;
        let status = resp.status();
        match status {
            StatusCode::ACCEPTED => {
                let token = async_token(&resp).ok_or_else(|| Error::BackendFatal(format!("DELETE {} accepted without an async operation header", id)))?;
                Ok(Submission::Pending(token))
            }
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                debug!(id, "arm: already absent");
                Ok(Submission::Completed(None))
            }
            s if s.is_success() => Ok(Submission::Completed(None)),
            s => {
                let body = resp.text().await.map_err(transport)?;
                Err(classify(s, &body))
            }
        }
    }

    async fn status(&self, token: &str) -> Result<ProgressEvent> {
        let resp = self.request(Method::GET, token).send().await.map_err(transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() { return Err(classify(status, &body)); }
        let doc: Json = serde_json::from_str(&body).map_err(|e| Error::BackendTransient(format!("unreadable async operation body: {}", e)))?;
        Ok(parse_operation_status(&doc)?.with_token(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_status_documents() {
        let ev = parse_operation_status(&serde_json::json!({"status": "Succeeded"})).unwrap();
        assert_eq!(ev.status, ProgressStatus::Success);
        let ev = parse_operation_status(&serde_json::json!({"status": "Failed", "error": {"code": "Conflict", "message": "account name taken"}})).unwrap();
        assert_eq!(ev.status, ProgressStatus::Failed);
        assert_eq!(ev.status_message.as_deref(), Some("account name taken"));
        assert!(parse_operation_status(&serde_json::json!({"status": "Weird"})).is_err());
    }

    #[test]
    fn error_bodies_keep_backend_text() {
        match classify(StatusCode::BAD_REQUEST, r#"{"error":{"code":"InvalidName","message":"name is invalid"}}"#) {
            Error::BackendFatal(m) => assert_eq!(m, "name is invalid"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(classify(StatusCode::TOO_MANY_REQUESTS, ""), Error::BackendTransient(_)));
        assert!(matches!(classify(StatusCode::NOT_FOUND, "nope"), Error::NotFound(m) if m == "nope"));
    }
}
