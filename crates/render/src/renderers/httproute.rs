//! HTTP routes: a ClusterIP Service selecting the pods that provide the route,
//! plus an Ingress when the route is exposed through a gateway hostname.

use std::collections::BTreeMap;

use keel_core::{local_id, Binding, ComputedValue, OutputResource, ResourceId, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};

use super::{http_url, DEFAULT_HTTP_PORT, KIND_HTTP};
use crate::kube::{descriptive_labels, route_selector_labels, shortened_target_port_name};
use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub gateway: Option<RouteGateway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteGateway {
    /// `*` serves every host.
    #[serde(default)]
    pub hostname: String,
}

impl HttpRoute {
    pub fn effective_port(&self) -> u16 { self.port.unwrap_or(DEFAULT_HTTP_PORT) }
}

pub struct HttpRouteRenderer;

impl HttpRouteRenderer {
    fn service(resource: &RendererResource, app: &str, route: &HttpRoute) -> OutputResource {
        let name = &resource.resource_name;
        let type_name = resource.type_name();
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
            "spec": {
                "type": "ClusterIP",
                "selector": route_selector_labels(app, type_name, name),
                "ports": [{
                    "name": name,
                    "port": route.effective_port(),
                    "targetPort": shortened_target_port_name(&format!("{}{}{}", app, type_name, name)),
                    "protocol": "TCP",
                }],
            },
        });
        OutputResource::kubernetes(local_id::SERVICE, service)
    }

    fn ingress(resource: &RendererResource, app: &str, route: &HttpRoute, hostname: &str) -> OutputResource {
        let name = &resource.resource_name;
        let backend = json!({ "service": { "name": name, "port": { "number": route.effective_port() } } });
        let spec: Json = if hostname == "*" {
            json!({ "defaultBackend": backend })
        } else {
            json!({ "rules": [{ "host": hostname, "http": { "paths": [{ "path": "/", "pathType": "Prefix", "backend": backend }] } }] })
        };
        let ingress = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
            "spec": spec,
        });
        OutputResource::kubernetes(local_id::INGRESS, ingress).depends_on(local_id::SERVICE)
    }
}

impl Renderer for HttpRouteRenderer {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let route: HttpRoute = resource.convert_definition()?;
        let app = resource.require_application()?;
        let name = &resource.resource_name;
        let port = route.effective_port();

        let mut out = RendererOutput::default();
        out.computed_values.insert("host".into(), ComputedValue::value(name.as_str()));
        out.computed_values.insert("port".into(), ComputedValue::value(port));
        out.computed_values.insert("url".into(), ComputedValue::value(http_url(name, port)));
        out.computed_values.insert("scheme".into(), ComputedValue::value("http"));

        out.resources.push(Self::service(resource, app, &route));
        if let Some(gw) = &route.gateway {
            out.resources.push(Self::ingress(resource, app, &route, &gw.hostname));
        }
        Ok(out)
    }

    fn allocate_bindings(&self, resource: &RendererResource, _outputs: &[OutputResource]) -> Result<BTreeMap<String, Binding>> {
        let route: HttpRoute = resource.convert_definition()?;
        let name = &resource.resource_name;
        let port = route.effective_port();
        let http = Binding::new(KIND_HTTP).with("host", name.as_str()).with("port", port).with("scheme", "http").with("url", http_url(name, port));
        Ok(BTreeMap::from([(KIND_HTTP.to_string(), http)]))
    }
}
