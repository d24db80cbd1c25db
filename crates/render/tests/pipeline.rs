use keel_core::{local_id, Error, LogicalResource, ResourceId};
use keel_render::{order_outputs, DependencyResolver, MemoryResources, Registry, RendererResource};
use serde_json::json;

const SCOPE: &str = "/planes/radius/local/resourceGroups/rg/providers/Applications.Core";

fn logical(kind: &str, name: &str, props: serde_json::Value) -> LogicalResource {
    LogicalResource::new(ResourceId::parse(&format!("{}/{}/{}", SCOPE, kind, name)).unwrap(), props)
}

#[tokio::test]
async fn route_with_gateway_renders_service_then_ingress() {
    let registry = Registry::builtin();
    let reader = MemoryResources::new();
    let route = logical("httpRoutes", "route0", json!({"application": "app0", "port": 8080, "gateway": {"hostname": "myapp.mydomain.com"}}));

    let resolution = DependencyResolver::new(&registry, &reader).resolve(&route).await.unwrap();
    assert!(resolution.order.is_empty());
    let renderer = registry.get(&route.id.resource_type()).unwrap();
    let out = renderer.render(&RendererResource::from_logical(&route), &resolution.dependencies).unwrap();

    let ids: Vec<&str> = order_outputs(&out.resources).unwrap().into_iter().map(|i| out.resources[i].local_id.as_str()).collect();
    assert_eq!(ids, vec![local_id::SERVICE, local_id::INGRESS]);
    let values: Vec<(String, serde_json::Value)> = out.computed_values.iter().map(|(k, v)| (k.clone(), v.resolve(&out.resources).unwrap())).collect();
    assert_eq!(
        values,
        vec![
            ("host".to_string(), json!("route0")),
            ("port".to_string(), json!(8080)),
            ("scheme".to_string(), json!("http")),
            ("url".to_string(), json!("http://route0:8080")),
        ]
    );
}

#[tokio::test]
async fn gateway_uses_persisted_route_bindings() {
    let registry = Registry::builtin();
    let reader = MemoryResources::new();
    let mut route = logical("httpRoutes", "backend", json!({"application": "app0", "port": 3000}));
    let route_renderer = registry.get(&route.id.resource_type()).unwrap();
    route.status.bindings = route_renderer.allocate_bindings(&RendererResource::from_logical(&route), &[]).unwrap();
    reader.insert(route.clone());

    let gw = logical("gateways", "gw", json!({"application": "app0", "routes": [{"path": "/", "destination": route.id.to_string()}]}));
    let resolution = DependencyResolver::new(&registry, &reader).resolve(&gw).await.unwrap();
    assert_eq!(resolution.order, vec![route.id.clone()]);
    let out = registry.get(&gw.id.resource_type()).unwrap().render(&RendererResource::from_logical(&gw), &resolution.dependencies).unwrap();
    assert_eq!(out.resources[0].resource["spec"]["rules"][0]["http"]["paths"][0]["backend"]["service"]["port"]["number"], 3000);
}

#[tokio::test]
async fn mutual_gateway_dependencies_are_cycles() {
    let registry = Registry::builtin();
    let reader = MemoryResources::new();
    let a = format!("{}/gateways/a", SCOPE);
    let b = format!("{}/gateways/b", SCOPE);
    reader.insert(logical("gateways", "b", json!({"application": "app0", "routes": [{"destination": a}]})));
    let root = logical("gateways", "a", json!({"application": "app0", "routes": [{"destination": b}]}));
    match DependencyResolver::new(&registry, &reader).resolve(&root).await {
        Err(Error::CyclicDependency(path)) => assert_eq!(path.first(), path.last()),
        other => panic!("expected a cycle, got {:?}", other),
    }
}
