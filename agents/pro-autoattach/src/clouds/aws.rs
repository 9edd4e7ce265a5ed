//! AWS Instance
//!
//! PKCS7-signed instance identity document from the EC2 instance metadata
//! service, using an IMDSv2 session token.

use async_trait::async_trait;
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
const TOKEN_PATH: &str = "/latest/api/token";
const PKCS7_PATH: &str = "/latest/dynamic/instance-identity/pkcs7";

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "21600";

const SYS_HYPERVISOR_UUID: &str = "sys/hypervisor/uuid";
const DMI_PRODUCT_UUID: &str = "sys/class/dmi/id/product_uuid";
const DMI_PRODUCT_SERIAL: &str = "sys/class/dmi/id/product_serial";

/// Static EC2 metadata endpoints; no license catalog
pub fn aws_descriptor() -> CloudInstanceDescriptor {
    aws_descriptor_for(IMDS_BASE)
}

/// EC2 metadata endpoints below a different base URL
pub fn aws_descriptor_for(base: &str) -> CloudInstanceDescriptor {
    let base = base.trim_end_matches('/');
    CloudInstanceDescriptor {
        cloud_type: CloudType::Aws,
        identity_url: format!("{}{}", base, PKCS7_PATH),
        metadata_url: Some(format!("{}{}", base, TOKEN_PATH)),
        licenses_url: None,
        headers: Vec::new(),
        licenses: BTreeMap::new(),
    }
}

/// Amazon EC2 instance
pub struct AwsInstance {
    ctx: InstanceContext,
    descriptor: CloudInstanceDescriptor,
    retry: RetryPolicy,
}

impl AwsInstance {
    pub fn new(ctx: InstanceContext) -> Self {
        Self::with_descriptor(ctx, aws_descriptor())
    }

    pub fn with_descriptor(ctx: InstanceContext, descriptor: CloudInstanceDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            retry: RetryPolicy::from_secs(&[0.5, 1.0, 1.0]),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn metadata_error(&self, code: u16, body: String) -> AttachError {
        AttachError::Metadata {
            cloud: CloudType::Aws.to_string(),
            code,
            body,
        }
    }

    async fn session_token(&self) -> Result<String, AttachError> {
        let Some(url) = self.descriptor.metadata_url.as_deref() else {
            return Err(AttachError::Config(
                "AWS descriptor has no session token endpoint".to_string(),
            ));
        };
        let request = HttpRequest::put(url)
            .headers(&self.descriptor.headers)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .timeout(self.ctx.identity_timeout);

        let response = self.ctx.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(self.metadata_error(response.code, response.body));
        }
        Ok(response.body.trim().to_string())
    }

    async fn fetch_pkcs7(&self) -> Result<String, AttachError> {
        let session = self.session_token().await?;
        let request = HttpRequest::get(&self.descriptor.identity_url)
            .headers(&self.descriptor.headers)
            .header(TOKEN_HEADER, session)
            .timeout(self.ctx.identity_timeout);

        let response = self.ctx.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(self.metadata_error(response.code, response.body));
        }
        Ok(response.body)
    }
}

fn starts_with_ec2(value: &str) -> bool {
    value
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("ec2"))
}

#[async_trait]
impl CloudInstance for AwsInstance {
    fn cloud_type(&self) -> CloudType {
        CloudType::Aws
    }

    fn descriptor(&self) -> &CloudInstanceDescriptor {
        &self.descriptor
    }

    fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    fn is_viable(&self) -> bool {
        let host = &self.ctx.host;

        if host
            .read_trimmed(SYS_HYPERVISOR_UUID)
            .is_some_and(|uuid| starts_with_ec2(&uuid))
        {
            return true;
        }

        // Nitro instances have no Xen hypervisor uuid; DMI uuid and serial both carry the prefix
        match (
            host.read_trimmed(DMI_PRODUCT_UUID),
            host.read_trimmed(DMI_PRODUCT_SERIAL),
        ) {
            (Some(uuid), Some(serial)) => starts_with_ec2(&uuid) && starts_with_ec2(&serial),
            _ => false,
        }
    }

    async fn identity_document(&self) -> Result<CloudIdentity, AttachError> {
        let pkcs7 = self
            .retry
            .run(|e: &AttachError| e.is_transport(), || self.fetch_pkcs7())
            .await?;

        debug!(bytes = pkcs7.len(), "Fetched AWS identity document");
        Ok(CloudIdentity::new(pkcs7, None))
    }

    async fn is_pro_license_present(
        &self,
        _wait_for_change: bool,
        _change_token: &mut ChangeToken,
    ) -> Result<bool, AttachError> {
        warn!("AWS does not expose a Pro license endpoint");
        Err(AttachError::CancelLicensePolling)
    }
}
