//! Mongo database connector.
//!
//! Either references an existing Azure Cosmos Mongo database (`fromResource`),
//! recorded as an unmanaged output, or carries its connection details inline
//! (`fromValues`), in which case nothing is deployed.

use keel_core::{local_id, ComputedValue, Error, OutputResource, ResourceId, Result};
use serde::Deserialize;

use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

pub const COSMOS_MONGO_API_VERSION: &str = "2021-10-15";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoDatabase {
    #[serde(default)]
    pub from_resource: Option<FromResource>,
    #[serde(default)]
    pub from_values: Option<SecretsValues>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FromResource {
    pub source: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsValues {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub struct MongoDatabaseRenderer;

impl Renderer for MongoDatabaseRenderer {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let db: MongoDatabase = resource.convert_definition()?;
        let mut out = RendererOutput::default();
        match (&db.from_resource, &db.from_values) {
            (Some(from), _) => {
                let source = ResourceId::parse(&from.source)?;
                if !source.resource_type().eq_ignore_ascii_case("Microsoft.DocumentDB/databaseAccounts/mongodbDatabases") {
                    return Err(Error::Validation(format!("'{}' is not a Cosmos DB Mongo database", source)).into());
                }
                out.resources.push(OutputResource::arm(
                    local_id::MONGO_DATABASE,
                    source.to_string(),
                    COSMOS_MONGO_API_VERSION,
                    serde_json::Value::Null,
                    false,
                ));
                out.computed_values.insert("database".into(), ComputedValue::value(source.name()));
            }
            (None, Some(values)) => {
                out.computed_values.insert("database".into(), ComputedValue::value(resource.resource_name.as_str()));
                let secrets = [("connectionString", &values.connection_string), ("username", &values.username), ("password", &values.password)];
                for (key, value) in secrets {
                    if let Some(v) = value {
                        out.secret_values.insert(key.to_string(), ComputedValue::value(v.as_str()));
                    }
                }
            }
            (None, None) => {
                return Err(Error::Validation(format!("mongo database '{}' needs either fromResource or fromValues", resource.resource_name)).into());
            }
        }
        Ok(out)
    }
}
