//! Keel provider router.
//!
//! A `PlaneTable` maps provider namespaces (`Applications`, `AWS`,
//! `Microsoft`) onto planes; each plane is served by one kind of backend
//! adapter. Lookup is a longest-prefix match on `.` boundaries, so
//! `Applications.Connector` can be split off `Applications`. The table is
//! loaded once at startup and never mutated.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use keel_backend::Adapter;
use keel_core::{Error, OutputKind, OutputResource, ResourceId, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlaneKind {
    Kubernetes,
    Aws,
    Azure,
}

impl PlaneKind {
    /// Plane kind whose adapter deploys outputs of `kind`.
    pub fn for_output(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Kubernetes => PlaneKind::Kubernetes,
            OutputKind::AwsCloudControl => PlaneKind::Aws,
            OutputKind::AzureArm => PlaneKind::Azure,
        }
    }
}

impl std::fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PlaneKind::Kubernetes => "kubernetes",
            PlaneKind::Aws => "aws",
            PlaneKind::Azure => "azure",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plane {
    /// Also the plane type in `/planes/{type}/{name}` ids.
    pub name: String,
    pub kind: PlaneKind,
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Base URL for proxying planes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Plane {
    pub fn new(name: impl Into<String>, kind: PlaneKind, namespaces: &[&str]) -> Self {
        Self { name: name.into(), kind, namespaces: namespaces.iter().map(|s| s.to_string()).collect(), url: None }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct PlaneFile {
    planes: Vec<Plane>,
}

/// Length of `registered` when it is `namespace` or a `.`-bounded prefix of it.
fn prefix_len(namespace: &str, registered: &str) -> Option<usize> {
    let (ns, reg) = (namespace.as_bytes(), registered.as_bytes());
    if ns.len() < reg.len() || !ns[..reg.len()].eq_ignore_ascii_case(reg) { return None; }
    if ns.len() == reg.len() || ns[reg.len()] == b'.' { Some(reg.len()) } else { None }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaneTable {
    planes: Vec<Plane>,
}

impl PlaneTable {
    /// Rejects unnamed planes and namespaces registered twice.
    pub fn new(planes: Vec<Plane>) -> Result<Self> {
        let mut seen: FxHashMap<String, &str> = FxHashMap::default();
        for p in &planes {
            if p.name.trim().is_empty() { return Err(Error::Validation("plane name must not be empty".into())); }
            for ns in &p.namespaces {
                if let Some(other) = seen.insert(ns.to_ascii_lowercase(), &p.name) {
                    return Err(Error::Validation(format!("namespace '{}' is registered by both '{}' and '{}'", ns, other, p.name)));
                }
            }
        }
        Ok(Self { planes })
    }

    /// Applications on Kubernetes, AWS through Cloud Control, Azure through ARM.
    pub fn builtin() -> Self {
        Self {
            planes: vec![
                Plane::new("radius", PlaneKind::Kubernetes, &["Applications"]),
                Plane::new("aws", PlaneKind::Aws, &["AWS"]),
                Plane::new("azure", PlaneKind::Azure, &["Microsoft"]).with_url("https://management.azure.com"),
            ],
        }
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let file: PlaneFile = serde_yaml::from_str(text).context("parsing plane table")?;
        Ok(Self::new(file.planes)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading plane table {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `KEEL_PLANES_FILE` when set, the built-in table otherwise.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("KEEL_PLANES_FILE").ok().filter(|s| !s.is_empty()) {
            Some(path) => {
                let table = Self::load(Path::new(&path))?;
                info!(path = %path, planes = table.planes.len(), "planes: loaded table");
                Ok(table)
            }
            None => Ok(Self::builtin()),
        }
    }

    pub fn planes(&self) -> &[Plane] { &self.planes }

    pub fn by_kind(&self, kind: PlaneKind) -> Option<&Plane> { self.planes.iter().find(|p| p.kind == kind) }

    /// Plane serving `id`: longest registered namespace prefix of its provider, or for
    /// scopes the plane named by `/planes/{type}` (subscription scopes go to Azure).
    pub fn resolve(&self, id: &ResourceId) -> Result<&Plane> {
        match id.provider_namespace() {
            Some(ns) => self
                .planes
                .iter()
                .flat_map(|p| p.namespaces.iter().filter_map(move |r| prefix_len(ns, r).map(|n| (n, p))))
                .max_by_key(|(n, _)| *n)
                .map(|(_, p)| p)
                .ok_or_else(|| Error::UnsupportedProvider(ns.to_string())),
            None => {
                let found = match id.plane() {
                    Some((plane_type, _)) => self.planes.iter().find(|p| p.name.eq_ignore_ascii_case(plane_type)),
                    None => self.by_kind(PlaneKind::Azure),
                };
                found.ok_or_else(|| Error::UnsupportedProvider(id.plane().map(|(t, _)| t).unwrap_or("subscriptions").to_string()))
            }
        }
    }
}

impl Default for PlaneTable {
    fn default() -> Self { Self::builtin() }
}

/// Result of routing an id: the plane and the adapter serving it.
#[derive(Clone)]
pub struct Route<'a> {
    pub plane: &'a Plane,
    pub adapter: Arc<dyn Adapter>,
}

/// Plane table plus one adapter per plane kind.
#[derive(Clone)]
pub struct Router {
    table: PlaneTable,
    adapters: FxHashMap<PlaneKind, Arc<dyn Adapter>>,
}

impl Router {
    pub fn new(table: PlaneTable) -> Self { Self { table, adapters: FxHashMap::default() } }

    pub fn with_adapter(mut self, kind: PlaneKind, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn table(&self) -> &PlaneTable { &self.table }

    pub fn adapter(&self, kind: PlaneKind) -> Result<Arc<dyn Adapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| Error::UnsupportedProvider(format!("{} (no adapter configured)", kind)))
    }

    pub fn route(&self, id: &ResourceId) -> Result<Route<'_>> {
        let plane = self.table.resolve(id)?;
        let adapter = self.adapter(plane.kind)?;
        debug!(id = %id, plane = %plane.name, adapter = adapter.name(), "planes: routed");
        Ok(Route { plane, adapter })
    }

    /// Adapter deploying `output`, chosen by its backend kind.
    pub fn adapter_for(&self, output: &OutputResource) -> Result<Arc<dyn Adapter>> { self.adapter(PlaneKind::for_output(output.kind())) }

    /// Build live adapters for every plane in `table`. Planes whose backend cannot be
    /// reached are left without an adapter and fail at routing time.
    pub async fn connect(table: PlaneTable) -> Self {
        let mut router = Router::new(table.clone());
        for plane in table.planes() {
            if router.adapters.contains_key(&plane.kind) { continue; }
            match connect_adapter(plane).await {
                Ok(adapter) => {
                    info!(plane = %plane.name, adapter = adapter.name(), "planes: adapter ready");
                    router.adapters.insert(plane.kind, adapter);
                }
                Err(e) => warn!(plane = %plane.name, error = %e, "planes: adapter unavailable"),
            }
        }
        router
    }
}

async fn connect_adapter(plane: &Plane) -> anyhow::Result<Arc<dyn Adapter>> {
    match plane.kind {
        PlaneKind::Kubernetes => Ok(Arc::new(keel_backend::KubernetesAdapter::try_default().await?)),
        PlaneKind::Azure => {
            let url = plane.url.as_deref().context("azure plane needs a url")?;
            let mut adapter = keel_backend::ArmProxyAdapter::new(url)?;
            if let Ok(token) = std::env::var("KEEL_ARM_TOKEN") { adapter = adapter.with_bearer(token); }
            Ok(Arc::new(adapter))
        }
        #[cfg(feature = "aws")]
        PlaneKind::Aws => {
            let api = keel_backend::aws::SdkCloudControl::from_env().await?;
            Ok(Arc::new(keel_backend::CloudControlAdapter::new(api)))
        }
        #[cfg(not(feature = "aws"))]
        PlaneKind::Aws => anyhow::bail!("built without the `aws` feature"),
    }
}
