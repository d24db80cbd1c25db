//! Applications render to the Kubernetes namespace their resources live in.

use keel_core::{local_id, OutputResource, ResourceId, Result};
use serde_json::json;

use crate::kube::descriptive_labels;
use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

pub struct ApplicationRenderer;

impl Renderer for ApplicationRenderer {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let name = &resource.resource_name;
        let namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": descriptive_labels(name, name) },
        });
        let mut out = RendererOutput::default();
        out.resources.push(OutputResource::kubernetes(local_id::KUBERNETES_NAMESPACE, namespace));
        Ok(out)
    }
}
