//! Built-in renderers.

use std::sync::Arc;

use crate::Registry;

pub mod application;
pub mod container;
pub mod gateway;
pub mod httproute;
pub mod inboundroute;
pub mod mongo;
pub mod passthrough;
pub mod rabbitmq;

pub const APPLICATIONS: &str = "Applications.Core/applications";
pub const CONTAINERS: &str = "Applications.Core/containers";
pub const GATEWAYS: &str = "Applications.Core/gateways";
pub const HTTP_ROUTES: &str = "Applications.Core/httpRoutes";
pub const MONGO_DATABASES: &str = "Applications.Connector/mongoDatabases";
pub const RABBITMQ_QUEUES: &str = "Applications.Connector/rabbitMQMessageQueues";

/// Binding kind for HTTP endpoints.
pub const KIND_HTTP: &str = "http";

/// Port used when an HTTP endpoint does not name one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

pub fn register_builtin(r: &mut Registry) {
    r.register(APPLICATIONS, Arc::new(application::ApplicationRenderer));
    r.register(HTTP_ROUTES, Arc::new(httproute::HttpRouteRenderer));
    r.register(GATEWAYS, Arc::new(gateway::GatewayRenderer));
    r.register(CONTAINERS, Arc::new(inboundroute::InboundRoute::new(Box::new(container::ContainerRenderer))));
    r.register(MONGO_DATABASES, Arc::new(mongo::MongoDatabaseRenderer));
    r.register(RABBITMQ_QUEUES, Arc::new(rabbitmq::RabbitMqRenderer));
    r.register_namespace("AWS", Arc::new(passthrough::AwsPassthrough));
    r.register_namespace("Microsoft", Arc::new(passthrough::ArmPassthrough::default()));
}

/// `http://{host}:{port}`
pub(crate) fn http_url(host: &str, port: u16) -> String { format!("http://{}:{}", host, port) }
