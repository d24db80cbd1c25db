//! Kubernetes adapter: server-side apply of rendered objects.

use anyhow::Context;
use keel_core::{Error, OutputIdentity, OutputResource, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{Adapter, ProgressEvent, Submission};

pub const FIELD_MANAGER: &str = "keel";

/// Metadata the API server maintains; kept out of recorded state.
const SERVER_FIELDS: [&str; 4] = ["managedFields", "resourceVersion", "generation", "creationTimestamp"];

pub struct KubernetesAdapter {
    client: Client,
}

impl KubernetesAdapter {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    fn api(&self, output: &OutputResource) -> Result<(Api<DynamicObject>, String)> {
        let OutputIdentity::Kubernetes { api_version, kind, namespace, name } = &output.identity else {
            return Err(Error::Validation(format!("kubernetes cannot handle output '{}' ({})", output.local_id, output.identity)));
        };
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version.as_str()),
        };
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        let api = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, name.clone()))
    }
}

/// 404 is NotFound; conflicts, throttling, server errors and transport failures are retriable.
pub fn map_kube_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => Error::NotFound(resp.message),
            409 | 429 | 500..=599 => Error::BackendTransient(resp.message),
            _ => Error::BackendFatal(resp.message),
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => Error::BackendTransient(e.to_string()),
        other => Error::BackendFatal(other.to_string()),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).map(without_server_fields).map_err(|e| Error::Internal(e.to_string()))
}

#[async_trait::async_trait]
impl Adapter for KubernetesAdapter {
    fn name(&self) -> &str { "kubernetes" }

    async fn create_or_update(&self, output: &OutputResource) -> Result<Submission> {
        let t0 = std::time::Instant::now();
        let (api, name) = self.api(output)?;
        // Always applied: with server-side apply, fields dropped from the desired
        // object are only pruned by sending it again.
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = match api.patch(&name, &pp, &Patch::Apply(&output.resource)).await {
            Ok(o) => o,
            Err(e) => { counter!("kube_apply_errors_total", 1u64); return Err(map_kube_error(e)); }
        };
        histogram!("kube_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kube_apply_total", 1u64);
        info!(output = %output.identity, resource_version = obj.metadata.resource_version.as_deref().unwrap_or(""), "kubernetes: applied");
        Ok(Submission::Completed(Some(to_json(&obj)?)))
    }

    async fn get(&self, output: &OutputResource) -> Result<Json> {
        let (api, name) = self.api(output)?;
        let obj = api.get(&name).await.map_err(map_kube_error)?;
        to_json(&obj)
    }

    async fn delete(&self, output: &OutputResource) -> Result<Submission> {
        let (api, name) = self.api(output)?;
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(output = %output.identity, "kubernetes: deleted");
                Ok(Submission::Completed(None))
            }
            Err(e) => match map_kube_error(e) {
                Error::NotFound(_) => {
                    debug!(output = %output.identity, "kubernetes: already absent");
                    Ok(Submission::Completed(None))
                }
                other => Err(other),
            },
        }
    }

    async fn status(&self, token: &str) -> Result<ProgressEvent> {
        // Server-side apply is synchronous; there is never a request to poll.
        Err(Error::Validation(format!("kubernetes has no pending request '{}'", token)))
    }
}

pub fn without_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in SERVER_FIELDS {
            meta.remove(f);
        }
    }
    v
}
