//! Inbound-route trait: exposes one of a workload's HTTP bindings through an Ingress.
//!
//! The decorator renders through its inner renderer first and only ever appends
//! to what it produced. When the trait is malformed the inner outputs are still
//! handed back alongside the error.

use std::collections::BTreeMap;

use keel_core::{local_id, Binding, Error, OutputResource, ResourceId, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};

use super::container::ContainerBinding;
use super::KIND_HTTP;
use crate::kube::descriptive_labels;
use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

pub const TRAIT_KIND: &str = "keel.dev/InboundRoute@v1alpha1";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundRouteTrait {
    pub kind: String,
    #[serde(default)]
    pub binding: String,
    /// Empty serves every host.
    #[serde(default)]
    pub hostname: String,
}

pub struct InboundRoute {
    inner: Box<dyn Renderer>,
}

impl InboundRoute {
    pub fn new(inner: Box<dyn Renderer>) -> Self { Self { inner } }
}

fn find_trait(definition: &Json) -> Result<Option<InboundRouteTrait>> {
    let Some(traits) = definition.get("traits").and_then(|t| t.as_array()) else { return Ok(None) };
    let Some(raw) = traits.iter().find(|t| t.get("kind").and_then(|k| k.as_str()).map(|k| k.eq_ignore_ascii_case(TRAIT_KIND)).unwrap_or(false)) else {
        return Ok(None);
    };
    serde_json::from_value(raw.clone()).map(Some).map_err(|e| Error::Validation(format!("invalid trait '{}': {}", TRAIT_KIND, e)))
}

fn declared_binding(definition: &Json, name: &str) -> Result<ContainerBinding> {
    let raw = definition
        .get("bindings")
        .and_then(|b| b.get(name))
        .ok_or_else(|| Error::BindingNotFound(format!("cannot find the binding '{}' referenced by '{}' trait", name, TRAIT_KIND)))?;
    let binding: ContainerBinding =
        serde_json::from_value(raw.clone()).map_err(|e| Error::Validation(format!("invalid binding '{}': {}", name, e)))?;
    Binding::new(binding.kind.as_str()).as_required(KIND_HTTP)?;
    Ok(binding)
}

impl Renderer for InboundRoute {
    fn dependency_ids(&self, resource: &RendererResource) -> Result<Vec<ResourceId>> { self.inner.dependency_ids(resource) }

    fn required_bindings(&self, resource: &RendererResource) -> Result<Vec<(ResourceId, String)>> { self.inner.required_bindings(resource) }

    fn render(&self, resource: &RendererResource, dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let mut out = self.inner.render(resource, dependencies)?;
        let fail = |out: RendererOutput, e: Error| Err(PartialRender::new(out, e));

        let tr = match find_trait(&resource.definition) {
            Ok(Some(t)) => t,
            Ok(None) => return Ok(out),
            Err(e) => return fail(out, e),
        };
        if tr.binding.is_empty() {
            return fail(out, Error::Validation(format!("the binding field is required for trait '{}'", TRAIT_KIND)));
        }
        let binding = match declared_binding(&resource.definition, &tr.binding) {
            Ok(b) => b,
            Err(e) => return fail(out, e),
        };
        let app = match resource.require_application() {
            Ok(a) => a,
            Err(e) => return fail(out, e),
        };

        let name = &resource.resource_name;
        let backend = json!({ "service": { "name": name, "port": { "number": binding.effective_port() } } });
        let spec = if tr.hostname.is_empty() {
            json!({ "defaultBackend": backend })
        } else {
            json!({ "rules": [{ "host": tr.hostname, "http": { "paths": [{ "path": "/", "pathType": "Prefix", "backend": backend }] } }] })
        };
        let ingress = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
            "spec": spec,
        });
        let mut ingress = OutputResource::kubernetes(local_id::INGRESS, ingress);
        if out.resources.iter().any(|o| o.local_id == local_id::SERVICE) {
            ingress = ingress.depends_on(local_id::SERVICE);
        }
        out.resources.push(ingress);
        Ok(out)
    }

    fn allocate_bindings(&self, resource: &RendererResource, outputs: &[OutputResource]) -> Result<BTreeMap<String, Binding>> {
        self.inner.allocate_bindings(resource, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderers::container::ContainerRenderer;
    use keel_core::LogicalResource;

    fn frontend(traits: Json) -> RendererResource {
        let id = ResourceId::parse("/planes/radius/local/resourceGroups/rg/providers/Applications.Core/containers/frontend").unwrap();
        RendererResource::from_logical(&LogicalResource::new(id, json!({
            "application": "app0",
            "container": {"image": "frontend:1"},
            "bindings": {"web": {"kind": "http", "port": 8080}, "grpc": {"kind": "grpc", "port": 50051}},
            "traits": traits,
        })))
    }

    fn decorated() -> InboundRoute { InboundRoute::new(Box::new(ContainerRenderer)) }

    #[test]
    fn appends_ingress_after_inner_outputs() {
        let inner = ContainerRenderer.render(&frontend(json!([])), &Dependencies::new()).unwrap();
        let out = decorated().render(&frontend(json!([{"kind": TRAIT_KIND, "binding": "web", "hostname": "example.com"}])), &Dependencies::new()).unwrap();
        assert_eq!(&out.resources[..inner.resources.len()], &inner.resources[..]);
        let ing = out.resources.last().unwrap();
        assert_eq!(ing.local_id, local_id::INGRESS);
        assert_eq!(ing.dependencies, vec![local_id::SERVICE.to_string()]);
        assert_eq!(ing.resource["spec"]["rules"][0]["host"], "example.com");
        assert_eq!(ing.resource["spec"]["rules"][0]["http"]["paths"][0]["backend"]["service"]["port"]["number"], 8080);

        let any = decorated().render(&frontend(json!([{"kind": TRAIT_KIND, "binding": "web"}])), &Dependencies::new()).unwrap();
        assert_eq!(any.resources.last().unwrap().resource["spec"]["defaultBackend"]["service"]["name"], "frontend");
    }

    #[test]
    fn no_trait_is_a_passthrough() {
        let r = frontend(json!([]));
        assert_eq!(decorated().render(&r, &Dependencies::new()), ContainerRenderer.render(&r, &Dependencies::new()));
    }

    #[test]
    fn trait_errors_keep_inner_outputs() {
        let missing = decorated().render(&frontend(json!([{"kind": TRAIT_KIND}])), &Dependencies::new()).unwrap_err();
        assert_eq!(missing.error, Error::Validation(format!("the binding field is required for trait '{}'", TRAIT_KIND)));
        assert_eq!(missing.output.resources.len(), 2);

        let unknown = decorated().render(&frontend(json!([{"kind": TRAIT_KIND, "binding": "admin"}])), &Dependencies::new()).unwrap_err();
        assert_eq!(unknown.error, Error::BindingNotFound(format!("cannot find the binding 'admin' referenced by '{}' trait", TRAIT_KIND)));
        assert_eq!(unknown.output.resources.len(), 2);

        let wrong_kind = decorated().render(&frontend(json!([{"kind": TRAIT_KIND, "binding": "grpc"}])), &Dependencies::new()).unwrap_err();
        assert!(matches!(wrong_kind.error, Error::BindingNotFound(_)));
    }
}
