//! Keel renderers.
//!
//! A `Renderer` turns one logical resource, plus the resolved state of its
//! dependencies, into backend artifacts (`OutputResource`s), computed values
//! and secret values. Rendering is pure: no store or backend access happens
//! here. The `Registry` picks a renderer by resource type and the
//! `DependencyResolver` loads and orders what a resource depends on.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{Binding, ComputedValue, Dag, Error, LogicalResource, OutputResource, ResourceId, Result, SecretValue};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

pub mod kube;
pub mod renderers;
pub mod resolver;

pub use resolver::{DependencyResolver, MemoryResources, Resolution, ResourceReader, StoreResources};

/// The resource being rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererResource {
    pub id: ResourceId,
    pub resource_name: String,
    /// Empty when the resource does not belong to an application.
    pub application_name: String,
    pub resource_type: String,
    /// User-authored properties.
    pub definition: Json,
}

impl RendererResource {
    pub fn from_logical(resource: &LogicalResource) -> Self {
        let resource_type = resource.id.resource_type();
        let application_name = if resource_type.eq_ignore_ascii_case(renderers::APPLICATIONS) {
            resource.id.name().to_string()
        } else {
            resource.application_name().unwrap_or_default()
        };
        Self {
            id: resource.id.clone(),
            resource_name: resource.id.name().to_string(),
            application_name,
            resource_type,
            definition: resource.properties.clone(),
        }
    }

    /// Decode the definition into a renderer's typed view of it.
    pub fn convert_definition<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.definition.clone())
            .map_err(|e| Error::Validation(format!("invalid properties for '{}': {}", self.id, e)))
    }

    pub fn require_application(&self) -> Result<&str> {
        if self.application_name.is_empty() {
            return Err(Error::Validation(format!("'{}' must belong to an application", self.id)));
        }
        Ok(&self.application_name)
    }

    /// Last segment of the resource type, e.g. `httpRoutes`.
    pub fn type_name(&self) -> &str { self.resource_type.rsplit('/').next().unwrap_or("") }
}

/// What a renderer sees of one of its dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererDependency {
    pub id: ResourceId,
    pub definition: Json,
    pub computed_values: BTreeMap<String, Json>,
    pub bindings: BTreeMap<String, Binding>,
}

impl RendererDependency {
    pub fn from_logical(resource: &LogicalResource) -> Self {
        Self {
            id: resource.id.clone(),
            definition: resource.properties.clone(),
            computed_values: resource.status.computed_values.clone(),
            bindings: resource.status.bindings.clone(),
        }
    }

    /// Binding named `kind`, or the only binding of that kind; `BindingNotFound` otherwise.
    pub fn binding(&self, kind: &str) -> Result<&Binding> {
        let found = self
            .bindings
            .get(kind)
            .or_else(|| self.bindings.values().find(|b| b.kind.eq_ignore_ascii_case(kind)))
            .ok_or_else(|| Error::BindingNotFound(format!("'{}' does not expose a binding of kind '{}'", self.id, kind)))?;
        found.as_required(kind)
    }
}

/// Resolved direct dependencies, keyed by `ResourceId::key`.
pub type Dependencies = BTreeMap<String, RendererDependency>;

/// Look up a declared dependency in the resolved set.
pub fn dependency<'a>(dependencies: &'a Dependencies, id: &ResourceId) -> Result<&'a RendererDependency> {
    dependencies.get(id.key()).ok_or_else(|| Error::DependencyNotFound(id.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RendererOutput {
    pub resources: Vec<OutputResource>,
    pub computed_values: BTreeMap<String, ComputedValue>,
    pub secret_values: BTreeMap<String, SecretValue>,
}

/// A render that failed after producing some outputs; they are kept so the caller
/// can record what may already exist.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRender {
    pub output: RendererOutput,
    pub error: Error,
}

impl PartialRender {
    pub fn new(output: RendererOutput, error: Error) -> Self { Self { output, error } }
}

impl From<Error> for PartialRender {
    fn from(error: Error) -> Self { Self { output: RendererOutput::default(), error } }
}

impl std::fmt::Display for PartialRender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.error.fmt(f) }
}

pub trait Renderer: Send + Sync {
    /// Resources that must exist before this one renders. No side effects.
    fn dependency_ids(&self, resource: &RendererResource) -> Result<Vec<ResourceId>>;

    /// Deterministic: the same inputs give structurally identical outputs.
    fn render(&self, resource: &RendererResource, dependencies: &Dependencies) -> Result<RendererOutput, PartialRender>;

    /// `(dependency, binding kind)` pairs `render` will read; checked when dependencies resolve.
    fn required_bindings(&self, _resource: &RendererResource) -> Result<Vec<(ResourceId, String)>> { Ok(Vec::new()) }

    /// Bindings exposed to dependents, given the deployed outputs.
    fn allocate_bindings(&self, _resource: &RendererResource, _outputs: &[OutputResource]) -> Result<BTreeMap<String, Binding>> {
        Ok(BTreeMap::new())
    }
}

/// Renderers by exact resource type, with provider-namespace fallbacks.
#[derive(Clone, Default)]
pub struct Registry {
    exact: FxHashMap<String, Arc<dyn Renderer>>,
    namespaces: Vec<(String, Arc<dyn Renderer>)>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, resource_type: &str, renderer: Arc<dyn Renderer>) -> &mut Self {
        self.exact.insert(resource_type.to_ascii_lowercase(), renderer);
        self
    }

    /// Serve every type whose namespace is `namespace` or below it (`AWS` serves `AWS.Kinesis/Stream`).
    pub fn register_namespace(&mut self, namespace: &str, renderer: Arc<dyn Renderer>) -> &mut Self {
        self.namespaces.push((namespace.to_ascii_lowercase(), renderer));
        self
    }

    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn Renderer>> {
        let key = resource_type.to_ascii_lowercase();
        if let Some(r) = self.exact.get(&key) {
            return Ok(r.clone());
        }
        let ns = key.split('/').next().unwrap_or("");
        self.namespaces
            .iter()
            .filter(|(p, _)| ns == p || ns.strip_prefix(p.as_str()).map(|rest| rest.starts_with('.')).unwrap_or(false))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, r)| r.clone())
            .ok_or_else(|| Error::UnsupportedResourceType(resource_type.to_string()))
    }

    pub fn types(&self) -> Vec<String> {
        let mut v: Vec<String> = self.exact.keys().cloned().collect();
        v.extend(self.namespaces.iter().map(|(p, _)| format!("{}/*", p)));
        v.sort();
        v
    }

    /// Every renderer keel ships with.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        renderers::register_builtin(&mut r);
        r
    }
}

/// Deployment order of `outputs` (indices), dependencies first, ties by position.
pub fn order_outputs(outputs: &[OutputResource]) -> Result<Vec<usize>> {
    let mut dag: Dag<String> = Dag::new();
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, o) in outputs.iter().enumerate() {
        if index.insert(o.local_id.as_str(), i).is_some() {
            return Err(Error::Validation(format!("output '{}' is rendered twice", o.local_id)));
        }
        dag.add_node(o.local_id.clone());
    }
    for o in outputs {
        for d in &o.dependencies {
            if !index.contains_key(d.as_str()) {
                return Err(Error::Validation(format!("output '{}' depends on unknown output '{}'", o.local_id, d)));
            }
            dag.add_dependency(o.local_id.clone(), d.clone());
        }
    }
    Ok(dag.toposort()?.iter().filter_map(|id| index.get(id.as_str()).copied()).collect())
}
