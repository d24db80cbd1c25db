//! Gateways: one Ingress fanning path prefixes out to HTTP route Services.

use keel_core::{local_id, ComputedValue, Error, OutputResource, ResourceId, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};

use super::{DEFAULT_HTTP_PORT, KIND_HTTP};
use crate::kube::descriptive_labels;
use crate::{dependency, Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    #[serde(default)]
    pub hostname: Option<GatewayHostname>,
    #[serde(default)]
    pub routes: Vec<GatewayRoute>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHostname {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub fully_qualified_hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRoute {
    #[serde(default)]
    pub path: String,
    /// Id of the HTTP route traffic is sent to.
    pub destination: String,
}

impl Gateway {
    /// Fully qualified hostname, else `{prefix}.{application}`.
    fn host(&self, application: &str) -> Option<String> {
        let h = self.hostname.as_ref()?;
        match (&h.fully_qualified_hostname, &h.prefix) {
            (Some(fqdn), _) if !fqdn.is_empty() => Some(fqdn.clone()),
            (_, Some(prefix)) if !prefix.is_empty() => Some(format!("{}.{}", prefix, application)),
            _ => None,
        }
    }
}

pub struct GatewayRenderer;

fn destinations(gw: &Gateway) -> Result<Vec<ResourceId>> {
    gw.routes.iter().map(|r| ResourceId::parse(&r.destination)).collect()
}

impl Renderer for GatewayRenderer {
    fn dependency_ids(&self, resource: &RendererResource) -> Result<Vec<ResourceId>> {
        destinations(&resource.convert_definition()?)
    }

    fn required_bindings(&self, resource: &RendererResource) -> Result<Vec<(ResourceId, String)>> {
        Ok(self.dependency_ids(resource)?.into_iter().map(|id| (id, KIND_HTTP.to_string())).collect())
    }

    fn render(&self, resource: &RendererResource, dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let gw: Gateway = resource.convert_definition()?;
        let app = resource.require_application()?;
        if gw.routes.is_empty() {
            return Err(Error::Validation(format!("gateway '{}' must declare at least one route", resource.resource_name)).into());
        }

        let mut paths: Vec<Json> = Vec::with_capacity(gw.routes.len());
        for (route, id) in gw.routes.iter().zip(destinations(&gw)?) {
            let http = dependency(dependencies, &id)?.binding(KIND_HTTP)?;
            let service = http.get_str("host").unwrap_or_else(|| id.name());
            let port = http.get_u64("port").unwrap_or(u64::from(DEFAULT_HTTP_PORT));
            let path = if route.path.is_empty() { "/" } else { route.path.as_str() };
            paths.push(json!({
                "path": path,
                "pathType": "Prefix",
                "backend": { "service": { "name": service, "port": { "number": port } } },
            }));
        }

        let host = gw.host(app);
        let mut rule = json!({ "http": { "paths": paths } });
        if let Some(h) = &host {
            rule["host"] = json!(h);
        }
        let name = &resource.resource_name;
        let ingress = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": { "name": name, "namespace": app, "labels": descriptive_labels(app, name) },
            "spec": { "rules": [rule] },
        });

        let mut out = RendererOutput::default();
        out.resources.push(OutputResource::kubernetes(local_id::GATEWAY, ingress));
        if let Some(h) = host {
            out.computed_values.insert("hostname".into(), ComputedValue::value(h.as_str()));
            out.computed_values.insert("url".into(), ComputedValue::value(format!("http://{}", h)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RendererDependency;
    use keel_core::{Binding, LogicalResource};
    use std::collections::BTreeMap;

    const SCOPE: &str = "/planes/radius/local/resourceGroups/rg/providers/Applications.Core";

    fn route_dep(name: &str, port: u64, with_binding: bool) -> (String, RendererDependency) {
        let id = ResourceId::parse(&format!("{}/httpRoutes/{}", SCOPE, name)).unwrap();
        let mut bindings = BTreeMap::new();
        if with_binding {
            bindings.insert("http".to_string(), Binding::new("http").with("host", name).with("port", port));
        }
        (id.key().to_string(), RendererDependency { id, definition: json!({}), computed_values: BTreeMap::new(), bindings })
    }

    fn gateway(hostname: Json) -> RendererResource {
        let id = ResourceId::parse(&format!("{}/gateways/gw", SCOPE)).unwrap();
        RendererResource::from_logical(&LogicalResource::new(id, json!({
            "application": "app0",
            "hostname": hostname,
            "routes": [
                {"path": "/api", "destination": format!("{}/httpRoutes/backend", SCOPE)},
                {"path": "/", "destination": format!("{}/httpRoutes/frontend", SCOPE)},
            ],
        })))
    }

    #[test]
    fn paths_point_at_route_services() {
        let deps: Dependencies = [route_dep("backend", 3000, true), route_dep("frontend", 80, true)].into_iter().collect();
        let r = gateway(json!({"fullyQualifiedHostname": "myapp.mydomain.com", "prefix": "ignored"}));
        assert_eq!(GatewayRenderer.dependency_ids(&r).unwrap().len(), 2);
        let out = GatewayRenderer.render(&r, &deps).unwrap();
        let rule = &out.resources[0].resource["spec"]["rules"][0];
        assert_eq!(rule["host"], "myapp.mydomain.com");
        assert_eq!(rule["http"]["paths"][0]["path"], "/api");
        assert_eq!(rule["http"]["paths"][0]["backend"]["service"]["port"]["number"], 3000);
        assert_eq!(out.computed_values["url"].resolve(&[]).unwrap(), json!("http://myapp.mydomain.com"));

        let out = GatewayRenderer.render(&gateway(json!({"prefix": "web"})), &deps).unwrap();
        assert_eq!(out.resources[0].resource["spec"]["rules"][0]["host"], "web.app0");
    }

    #[test]
    fn destination_without_http_binding_fails() {
        let deps: Dependencies = [route_dep("backend", 3000, true), route_dep("frontend", 80, false)].into_iter().collect();
        let err = GatewayRenderer.render(&gateway(Json::Null), &deps).unwrap_err();
        assert!(matches!(err.error, Error::BindingNotFound(_)));
        let only_one: Dependencies = [route_dep("backend", 3000, true)].into_iter().collect();
        assert!(matches!(GatewayRenderer.render(&gateway(Json::Null), &only_one).unwrap_err().error, Error::DependencyNotFound(_)));
    }
}
