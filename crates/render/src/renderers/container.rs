//! Containers render to a Deployment, plus a Service when they expose HTTP bindings.
//!
//! Ports that `provide` an HTTP route take the route's hashed port name and
//! the pods carry the route's selector label, so the route's Service reaches
//! them. Connections become `CONNECTION_{NAME}_{VALUE}` environment variables
//! built from the connected resource's computed values.

use std::collections::BTreeMap;

use keel_core::{local_id, Binding, Error, OutputResource, ResourceId, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};

use super::{http_url, DEFAULT_HTTP_PORT, KIND_HTTP};
use crate::kube::{descriptive_labels, route_selector_labels, selector_labels, shortened_target_port_name};
use crate::{dependency, Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub container: ContainerSpec,
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,
    /// Endpoints this container exposes to others, by name.
    #[serde(default)]
    pub bindings: BTreeMap<String, ContainerBinding>,
    #[serde(default)]
    pub traits: Vec<Json>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<String, ContainerPort>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    /// HTTP route served on this port.
    #[serde(default)]
    pub provides: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Connection {
    pub source: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBinding {
    pub kind: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub target_port: Option<u16>,
}

impl ContainerBinding {
    pub fn effective_port(&self) -> u16 { self.port.unwrap_or(DEFAULT_HTTP_PORT) }
}

pub struct ContainerRenderer;

impl Container {
    fn connection_ids(&self) -> Result<Vec<(String, ResourceId)>> {
        self.connections.iter().map(|(name, c)| Ok((name.clone(), ResourceId::parse(&c.source)?))).collect()
    }

    fn provided_routes(&self) -> Result<Vec<(String, ResourceId)>> {
        self.container
            .ports
            .iter()
            .filter_map(|(name, p)| p.provides.as_ref().map(|r| (name, r)))
            .map(|(name, r)| Ok((name.clone(), ResourceId::parse(r)?)))
            .collect()
    }

    fn http_bindings(&self) -> impl Iterator<Item = (&String, &ContainerBinding)> {
        self.bindings.iter().filter(|(_, b)| b.kind.eq_ignore_ascii_case(KIND_HTTP))
    }
}

fn env_value(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn env_name(connection: &str, key: &str) -> String {
    format!("CONNECTION_{}_{}", connection, key).to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
}

impl Renderer for ContainerRenderer {
    fn dependency_ids(&self, resource: &RendererResource) -> Result<Vec<ResourceId>> {
        let c: Container = resource.convert_definition()?;
        let mut ids: Vec<ResourceId> = c.connection_ids()?.into_iter().map(|(_, id)| id).collect();
        ids.extend(c.provided_routes()?.into_iter().map(|(_, id)| id));
        Ok(ids)
    }

    fn render(&self, resource: &RendererResource, dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let c: Container = resource.convert_definition()?;
        let app = resource.require_application()?;
        let name = &resource.resource_name;
        if c.container.image.is_empty() {
            return Err(Error::Validation(format!("container '{}' must specify an image", name)).into());
        }

        let mut env: BTreeMap<String, String> = c.container.env.clone();
        for (conn, id) in c.connection_ids()? {
            for (key, value) in &dependency(dependencies, &id)?.computed_values {
                env.insert(env_name(&conn, key), env_value(value));
            }
        }

        let routes: BTreeMap<String, ResourceId> = c.provided_routes()?.into_iter().collect();
        let mut pod_labels = descriptive_labels(app, name);
        let mut ports: Vec<Json> = Vec::new();
        for (port_name, p) in &c.container.ports {
            let port_name = match routes.get(port_name) {
                Some(route) => {
                    let route_type = route.resource_type();
                    let route_type = route_type.rsplit('/').next().unwrap_or("");
                    pod_labels.extend(route_selector_labels(app, route_type, route.name()));
                    shortened_target_port_name(&format!("{}{}{}", app, route_type, route.name()))
                }
                None => port_name.clone(),
            };
            ports.push(json!({ "name": port_name, "containerPort": p.container_port, "protocol": p.protocol.as_deref().unwrap_or("TCP") }));
        }

        let env: Vec<Json> = env.into_iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
            "spec": {
                "selector": { "matchLabels": selector_labels(app, name) },
                "template": {
                    "metadata": { "labels": pod_labels },
                    "spec": { "containers": [{ "name": name, "image": c.container.image, "env": env, "ports": ports }] },
                },
            },
        });

        let mut out = RendererOutput::default();
        out.resources.push(OutputResource::kubernetes(local_id::DEPLOYMENT, deployment));

        let service_ports: Vec<Json> = c
            .http_bindings()
            .map(|(b, spec)| json!({ "name": b, "port": spec.effective_port(), "targetPort": spec.target_port.unwrap_or(spec.effective_port()), "protocol": "TCP" }))
            .collect();
        if !service_ports.is_empty() {
            let service = json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
                "spec": { "type": "ClusterIP", "selector": selector_labels(app, name), "ports": service_ports },
            });
            out.resources.push(OutputResource::kubernetes(local_id::SERVICE, service));
        }
        Ok(out)
    }

    fn allocate_bindings(&self, resource: &RendererResource, _outputs: &[OutputResource]) -> Result<BTreeMap<String, Binding>> {
        let c: Container = resource.convert_definition()?;
        let host = resource.resource_name.as_str();
        Ok(c
            .bindings
            .iter()
            .map(|(name, b)| {
                let port = b.effective_port();
                let mut binding = Binding::new(b.kind.as_str()).with("host", host).with("port", port);
                if b.kind.eq_ignore_ascii_case(KIND_HTTP) {
                    binding = binding.with("scheme", "http").with("url", http_url(host, port));
                }
                (name.clone(), binding)
            })
            .collect())
    }
}
