//! Dependency resolution.
//!
//! Starting from the resource being deployed, each declared dependency is
//! loaded, its own dependencies are asked of its renderer, and so on until
//! the graph is closed. The walk fails with `DependencyNotFound` on a missing
//! record, `CyclicDependency` when the graph loops back on itself and
//! `BindingNotFound` when a direct dependency lacks a binding the root's
//! renderer reads. All of these happen before anything renders.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use keel_core::{Dag, Error, LogicalResource, ResourceId, Result};
use keel_store::{find_as, keys, Store};
use tracing::debug;

use crate::{dependency, Dependencies, Registry, RendererDependency, RendererResource};

/// Read access to persisted logical resources.
#[async_trait::async_trait]
pub trait ResourceReader: Send + Sync {
    async fn read(&self, id: &ResourceId) -> Result<Option<LogicalResource>>;
}

pub struct StoreResources {
    store: Arc<dyn Store>,
}

impl StoreResources {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl ResourceReader for StoreResources {
    async fn read(&self, id: &ResourceId) -> Result<Option<LogicalResource>> {
        Ok(find_as::<LogicalResource>(self.store.as_ref(), &keys::resource(id)).await?.map(|(r, _)| r))
    }
}

/// Fixed set of resources, for offline rendering and tests.
#[derive(Default)]
pub struct MemoryResources {
    items: RwLock<BTreeMap<String, LogicalResource>>,
}

impl MemoryResources {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, resource: LogicalResource) {
        self.items.write().unwrap_or_else(PoisonError::into_inner).insert(resource.id.key().to_string(), resource);
    }
}

#[async_trait::async_trait]
impl ResourceReader for MemoryResources {
    async fn read(&self, id: &ResourceId) -> Result<Option<LogicalResource>> {
        Ok(self.items.read().unwrap_or_else(PoisonError::into_inner).get(id.key()).cloned())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Every transitive dependency, dependencies first, ties by declaration order.
    pub order: Vec<ResourceId>,
    /// The root's direct dependencies, ready for its renderer.
    pub dependencies: Dependencies,
}

pub struct DependencyResolver<'a> {
    registry: &'a Registry,
    reader: &'a dyn ResourceReader,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a Registry, reader: &'a dyn ResourceReader) -> Self { Self { registry, reader } }

    pub async fn resolve(&self, root: &LogicalResource) -> Result<Resolution> {
        let mut dag: Dag<ResourceId> = Dag::new();
        let mut loaded: BTreeMap<String, LogicalResource> = BTreeMap::new();
        dag.add_node(root.id.clone());

        let direct = self.declared(root)?;
        // Depth-first in declaration order, so insertion order (the tie-breaker) follows declarations.
        let mut stack: Vec<(ResourceId, ResourceId)> = direct.iter().rev().map(|d| (root.id.clone(), d.clone())).collect();
        while let Some((from, to)) = stack.pop() {
            dag.add_dependency(from, to.clone());
            if to == root.id || loaded.contains_key(to.key()) { continue; }
            let dep = self.reader.read(&to).await?.ok_or_else(|| Error::DependencyNotFound(to.to_string()))?;
            let next = self.declared(&dep)?;
            stack.extend(next.into_iter().rev().map(|d| (to.clone(), d)));
            loaded.insert(to.key().to_string(), dep);
        }

        let order: Vec<ResourceId> = dag.toposort()?.into_iter().filter(|id| *id != root.id).collect();
        let mut dependencies = Dependencies::new();
        for id in &direct {
            if let Some(dep) = loaded.get(id.key()) {
                dependencies.insert(id.key().to_string(), RendererDependency::from_logical(dep));
            }
        }
        let renderer = self.registry.get(&root.id.resource_type())?;
        for (id, kind) in renderer.required_bindings(&RendererResource::from_logical(root))? {
            dependency(&dependencies, &id)?.binding(&kind)?;
        }
        debug!(id = %root.id, direct = direct.len(), transitive = order.len(), "render: dependencies resolved");
        Ok(Resolution { order, dependencies })
    }

    fn declared(&self, resource: &LogicalResource) -> Result<Vec<ResourceId>> {
        let renderer = self.registry.get(&resource.id.resource_type())?;
        renderer.dependency_ids(&RendererResource::from_logical(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCOPE: &str = "/planes/radius/local/resourceGroups/rg/providers/Applications.Core";

    fn id(kind: &str, name: &str) -> ResourceId { ResourceId::parse(&format!("{}/{}/{}", SCOPE, kind, name)).unwrap() }

    fn container(name: &str, connections: &[&ResourceId]) -> LogicalResource {
        let conns: serde_json::Map<String, serde_json::Value> =
            connections.iter().enumerate().map(|(i, d)| (format!("c{}", i), json!({"source": d.to_string()}))).collect();
        LogicalResource::new(id("containers", name), json!({"application": "app0", "container": {"image": "nginx"}, "connections": conns}))
    }

    #[tokio::test]
    async fn transitive_order_follows_declarations() {
        let registry = Registry::builtin();
        let reader = MemoryResources::new();
        let (a, b, c) = (id("containers", "a"), id("containers", "b"), id("containers", "c"));
        reader.insert(container("b", &[&c]));
        reader.insert(container("c", &[]));
        let route = LogicalResource::new(id("httpRoutes", "r"), json!({"application": "app0"}));
        reader.insert(route.clone());
        let root = container("a", &[&b, &route.id]);
        let res = DependencyResolver::new(&registry, &reader).resolve(&root).await.unwrap();
        assert_eq!(res.order, vec![c, b.clone(), route.id.clone()]);
        assert_eq!(res.dependencies.len(), 2);
        assert!(res.dependencies.contains_key(b.key()));
        assert!(!res.order.contains(&a));
    }

    #[tokio::test]
    async fn cycles_and_missing_records_fail() {
        let registry = Registry::builtin();
        let reader = MemoryResources::new();
        let (a, b) = (id("containers", "a"), id("containers", "b"));
        reader.insert(container("b", &[&a]));
        let err = DependencyResolver::new(&registry, &reader).resolve(&container("a", &[&b])).await.unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)), "{:?}", err);

        let ghost = id("containers", "ghost");
        let err = DependencyResolver::new(&registry, &reader).resolve(&container("a", &[&ghost])).await.unwrap_err();
        assert_eq!(err, Error::DependencyNotFound(ghost.to_string()));
    }

    #[tokio::test]
    async fn bindings_read_by_the_renderer_must_already_exist() {
        let registry = Registry::builtin();
        let reader = MemoryResources::new();
        let mut route = LogicalResource::new(id("httpRoutes", "backend"), json!({"application": "app0", "port": 3000}));
        reader.insert(route.clone());
        let gateway = LogicalResource::new(id("gateways", "gw"), json!({"application": "app0", "routes": [{"destination": route.id.to_string()}]}));

        let err = DependencyResolver::new(&registry, &reader).resolve(&gateway).await.unwrap_err();
        assert!(matches!(err, Error::BindingNotFound(ref m) if m.contains("backend")), "{:?}", err);

        route.status.bindings.insert("web".into(), keel_core::Binding::new("http").with("port", 3000));
        reader.insert(route.clone());
        let res = DependencyResolver::new(&registry, &reader).resolve(&gateway).await.unwrap();
        assert_eq!(res.order, vec![route.id]);
    }
}
