//! Cloud Control binding over the AWS SDK.

use anyhow::Result as AnyResult;
use aws_sdk_cloudcontrol::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_cloudcontrol::types::ProgressEvent as SdkProgressEvent;
use aws_sdk_cloudcontrol::Client;
use keel_core::{Error, Result};

use crate::cloudcontrol::{classify, CloudControlApi};
use crate::{ProgressEvent, ProgressStatus, RequestKind};

pub struct SdkCloudControl {
    client: Client,
}

impl SdkCloudControl {
    /// Credentials and region from the standard AWS environment chain.
    pub async fn from_env() -> AnyResult<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self { client: Client::new(&config) })
    }

    pub async fn with_region(region: &str) -> AnyResult<Self> {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Ok(Self { client: Client::new(&config) })
    }
}

fn sdk_error<E, R>(e: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = e.code().map(|s| s.to_string());
    let message = e.message().map(|s| s.to_string()).unwrap_or_else(|| e.to_string());
    classify(code.as_deref(), message)
}

fn convert(ev: Option<&SdkProgressEvent>) -> Result<ProgressEvent> {
    let ev = ev.ok_or_else(|| Error::BackendFatal("cloud control returned no progress event".to_string()))?;
    let status = ev
        .operation_status()
        .and_then(|s| ProgressStatus::parse(s.as_str()))
        .ok_or_else(|| Error::BackendFatal(format!("unknown cloud control status {:?}", ev.operation_status())))?;
    let operation = ev.operation().and_then(|o| match o.as_str() {
        "CREATE" => Some(RequestKind::Create),
        "UPDATE" => Some(RequestKind::Update),
        "DELETE" => Some(RequestKind::Delete),
        _ => None,
    });
    Ok(ProgressEvent {
        status,
        request_token: ev.request_token().map(|s| s.to_string()),
        operation,
        identifier: ev.identifier().map(|s| s.to_string()),
        status_message: ev.status_message().map(|s| s.to_string()),
        error_code: ev.error_code().map(|c| c.as_str().to_string()),
    })
}

#[async_trait::async_trait]
impl CloudControlApi for SdkCloudControl {
    async fn create_resource(&self, type_name: &str, desired_state: &str) -> Result<ProgressEvent> {
        let out = self
            .client
            .create_resource()
            .type_name(type_name)
            .desired_state(desired_state)
            .send()
            .await
            .map_err(sdk_error)?;
        convert(out.progress_event())
    }

    async fn get_resource(&self, type_name: &str, identifier: &str) -> Result<String> {
        let out = self.client.get_resource().type_name(type_name).identifier(identifier).send().await.map_err(sdk_error)?;
        out.resource_description()
            .and_then(|d| d.properties())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::NotFound(format!("{} {}", type_name, identifier)))
    }

    async fn update_resource(&self, type_name: &str, identifier: &str, patch_document: &str) -> Result<ProgressEvent> {
        let out = self
            .client
            .update_resource()
            .type_name(type_name)
            .identifier(identifier)
            .patch_document(patch_document)
            .send()
            .await
            .map_err(sdk_error)?;
        convert(out.progress_event())
    }

    async fn delete_resource(&self, type_name: &str, identifier: &str) -> Result<ProgressEvent> {
        let out = self
            .client
            .delete_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await
            .map_err(sdk_error)?;
        convert(out.progress_event())
    }

    async fn get_resource_request_status(&self, request_token: &str) -> Result<ProgressEvent> {
        let out = self.client.get_resource_request_status().request_token(request_token).send().await.map_err(sdk_error)?;
        convert(out.progress_event())
    }
}
