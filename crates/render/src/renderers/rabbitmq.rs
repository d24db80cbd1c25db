//! RabbitMQ queue connector: values only, no deployed artifacts.

use keel_core::{ComputedValue, Error, ResourceId, Result};
use serde::Deserialize;

use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RabbitMqQueue {
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub secrets: Option<RabbitMqSecrets>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMqSecrets {
    #[serde(default)]
    pub connection_string: Option<String>,
}

pub struct RabbitMqRenderer;

impl Renderer for RabbitMqRenderer {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let q: RabbitMqQueue = resource.convert_definition()?;
        if q.queue.is_empty() {
            return Err(Error::Validation(format!("queue name is required for '{}'", resource.resource_name)).into());
        }
        let mut out = RendererOutput::default();
        out.computed_values.insert("queue".into(), ComputedValue::value(q.queue.as_str()));
        if let Some(cs) = q.secrets.and_then(|s| s.connection_string) {
            out.secret_values.insert("connectionString".into(), ComputedValue::value(cs));
        }
        Ok(out)
    }
}
