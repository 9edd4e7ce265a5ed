//! Azure Instance
//!
//! Attested document and compute metadata from the Azure instance
//! metadata service (IMDS).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{
    ChangeToken, CloudIdentity, CloudInstance, CloudInstanceDescriptor, CloudType,
    InstanceContext,
};
use crate::error::AttachError;
use crate::http::HttpRequest;
use crate::retry::RetryPolicy;

const IMDS_BASE: &str = "http://169.254.169.254";
const ATTESTED_PATH: &str = "/metadata/attested/document";
const COMPUTE_PATH: &str = "/metadata/instance/compute";
const API_VERSION: &str = "2020-09-01";

const DMI_CHASSIS_ASSET_TAG: &str = "sys/class/dmi/id/chassis_asset_tag";
const AZURE_CHASSIS_ASSET_TAG: &str = "7783-7084-3265-9085-8269-3286-77";
const AZURE_OVF_ENV_FILE: &str = "var/lib/cloud/seed/azure/ovf-env.xml";

pub fn azure_descriptor() -> CloudInstanceDescriptor {
    azure_descriptor_for(IMDS_BASE)
}

/// Azure IMDS endpoints below a different base URL
pub fn azure_descriptor_for(base: &str) -> CloudInstanceDescriptor {
    let base = base.trim_end_matches('/');
    CloudInstanceDescriptor {
        cloud_type: CloudType::Azure,
        identity_url: format!("{}{}?api-version={}", base, ATTESTED_PATH, API_VERSION),
        metadata_url: Some(format!("{}{}?api-version={}", base, COMPUTE_PATH, API_VERSION)),
        licenses_url: None,
        headers: vec![("Metadata".to_string(), "true".to_string())],
        licenses: BTreeMap::new(),
    }
}

/// Microsoft Azure virtual machine
pub struct AzureInstance {
    ctx: InstanceContext,
    descriptor: CloudInstanceDescriptor,
    retry: RetryPolicy,
}

impl AzureInstance {
    pub fn new(ctx: InstanceContext) -> Self {
        Self::with_descriptor(ctx, azure_descriptor())
    }

    pub fn with_descriptor(ctx: InstanceContext, descriptor: CloudInstanceDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            retry: RetryPolicy::from_secs(&[1.0, 1.0, 1.0]),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, AttachError> {
        let request = HttpRequest::get(url)
            .headers(&self.descriptor.headers)
            .timeout(self.ctx.identity_timeout);

        let response = self.ctx.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(AttachError::Metadata {
                cloud: CloudType::Azure.to_string(),
                code: response.code,
                body: response.body,
            });
        }
        Ok(response.json()?)
    }

    async fn fetch_documents(&self) -> Result<CloudIdentity, AttachError> {
        let attested = self.fetch_json(&self.descriptor.identity_url).await?;
        let signature = attested
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AttachError::InvalidIdentityToken("attested document has no signature".to_string())
            })?
            .to_string();

        let compute = match &self.descriptor.metadata_url {
            Some(url) => Some(self.fetch_json(url).await?),
            None => None,
        };

        Ok(CloudIdentity::new(signature, compute))
    }
}

#[async_trait]
impl CloudInstance for AzureInstance {
    fn cloud_type(&self) -> CloudType {
        CloudType::Azure
    }

    fn descriptor(&self) -> &CloudInstanceDescriptor {
        &self.descriptor
    }

    fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    fn is_viable(&self) -> bool {
        let host = &self.ctx.host;
        host.read_trimmed(DMI_CHASSIS_ASSET_TAG)
            .is_some_and(|tag| tag == AZURE_CHASSIS_ASSET_TAG)
            || host.exists(AZURE_OVF_ENV_FILE)
    }

    async fn identity_document(&self) -> Result<CloudIdentity, AttachError> {
        let identity = self
            .retry
            .run(|e: &AttachError| e.is_transport(), || self.fetch_documents())
            .await?;

        debug!(bytes = identity.token.len(), "Fetched Azure attested document");
        Ok(identity)
    }

    async fn is_pro_license_present(
        &self,
        _wait_for_change: bool,
        _change_token: &mut ChangeToken,
    ) -> Result<bool, AttachError> {
        warn!("Azure does not expose a Pro license endpoint");
        Err(AttachError::CancelLicensePolling)
    }
}
