//! Cloud resources addressed directly by their provider type.
//!
//! `AWS.Kinesis/Stream` named `s1` becomes the Cloud Control resource
//! `AWS::Kinesis::Stream` with identifier `s1` and the user's properties as
//! desired state. `Microsoft.*` resources are PUT to ARM at their own id.

use keel_core::{local_id, Error, OutputResource, ResourceId, Result};
use serde_json::Value as Json;

use crate::{Dependencies, PartialRender, Renderer, RendererOutput, RendererResource};

/// `AWS.Kinesis/Stream` → `AWS::Kinesis::Stream`
pub fn cloudcontrol_type_name(resource_type: &str) -> String { resource_type.replace(['.', '/'], "::") }

pub struct AwsPassthrough;

impl Renderer for AwsPassthrough {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        if !resource.definition.is_object() && !resource.definition.is_null() {
            return Err(Error::Validation(format!("properties of '{}' must be an object", resource.id)).into());
        }
        let desired = if resource.definition.is_null() { Json::Object(Default::default()) } else { resource.definition.clone() };
        let mut out = RendererOutput::default();
        out.resources.push(OutputResource::aws(
            local_id::AWS_RESOURCE,
            cloudcontrol_type_name(&resource.resource_type),
            resource.resource_name.as_str(),
            desired,
        ));
        Ok(out)
    }
}

/// API version used when the properties do not carry an `apiVersion`.
pub struct ArmPassthrough {
    pub default_api_version: String,
}

impl Default for ArmPassthrough {
    fn default() -> Self { Self { default_api_version: "2021-04-01".to_string() } }
}

impl Renderer for ArmPassthrough {
    fn dependency_ids(&self, _resource: &RendererResource) -> Result<Vec<ResourceId>> { Ok(Vec::new()) }

    fn render(&self, resource: &RendererResource, _dependencies: &Dependencies) -> Result<RendererOutput, PartialRender> {
        let mut body = match &resource.definition {
            Json::Object(m) => m.clone(),
            Json::Null => Default::default(),
            _ => return Err(Error::Validation(format!("properties of '{}' must be an object", resource.id)).into()),
        };
        let api_version = match body.remove("apiVersion") {
            Some(Json::String(v)) => v,
            Some(_) => return Err(Error::Validation("apiVersion must be a string".into()).into()),
            None => self.default_api_version.clone(),
        };
        let mut out = RendererOutput::default();
        out.resources.push(OutputResource::arm(local_id::AZURE_RESOURCE, resource.id.to_string(), api_version, Json::Object(body), true));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{LogicalResource, OutputIdentity};
    use serde_json::json;

    fn resource(id: &str, props: Json) -> RendererResource {
        RendererResource::from_logical(&LogicalResource::new(ResourceId::parse(id).unwrap(), props))
    }

    #[test]
    fn aws_types_map_to_cloudcontrol_names() {
        assert_eq!(cloudcontrol_type_name("AWS.Kinesis/Stream"), "AWS::Kinesis::Stream");
        let r = resource("/planes/aws/aws/accounts/1/regions/us-west-2/providers/AWS.Kinesis/Stream/s1", json!({"ShardCount": 1}));
        let out = AwsPassthrough.render(&r, &Dependencies::new()).unwrap();
        assert_eq!(
            out.resources[0].identity,
            OutputIdentity::AwsCloudControl { type_name: "AWS::Kinesis::Stream".into(), identifier: "s1".into() }
        );
        assert_eq!(out.resources[0].resource, json!({"ShardCount": 1}));
    }

    #[test]
    fn arm_api_version_comes_from_properties() {
        let id = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/acct";
        let out = ArmPassthrough::default().render(&resource(id, json!({"apiVersion": "2023-01-01", "location": "westus"})), &Dependencies::new()).unwrap();
        assert_eq!(out.resources[0].identity, OutputIdentity::AzureArm { id: id.into(), api_version: "2023-01-01".into() });
        assert_eq!(out.resources[0].resource, json!({"location": "westus"}));
    }
}
