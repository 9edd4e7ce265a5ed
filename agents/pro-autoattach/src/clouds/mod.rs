//! Cloud Instance Adapters
//!
//! Trait-based abstraction over the cloud metadata services that can vouch
//! for a Pro entitlement: AWS, Azure and GCP.
//!
//! Each adapter answers four questions about the machine it runs on:
//!
//! - is this machine on my cloud? (`is_viable`, local files only)
//! - who is it? (`identity_document`, signed by the provider)
//! - should we watch for a Pro license? (`should_poll_for_license`)
//! - is a Pro license attached right now? (`is_pro_license_present`)

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod token;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AutoAttachConfig;
use crate::error::AttachError;
use crate::http::HttpFetcher;
use crate::release::ReleaseInfo;

pub use aws::AwsInstance;
pub use azure::AzureInstance;
pub use gcp::GcpInstance;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    Aws,
    Azure,
    Gcp,
}

impl CloudType {
    pub const ALL: [CloudType; 3] = [CloudType::Aws, CloudType::Azure, CloudType::Gcp];
}

impl std::fmt::Display for CloudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudType::Aws => write!(f, "aws"),
            CloudType::Azure => write!(f, "azure"),
            CloudType::Gcp => write!(f, "gcp"),
        }
    }
}

impl FromStr for CloudType {
    type Err = AttachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" | "aws-china" | "aws-gov" => Ok(CloudType::Aws),
            "azure" | "azurechina" => Ok(CloudType::Azure),
            "gcp" | "gce" => Ok(CloudType::Gcp),
            other => Err(AttachError::UnknownCloud(other.to_string())),
        }
    }
}

/// Provider-signed identity assertion
#[derive(Clone, PartialEq)]
pub struct CloudIdentity {
    /// Opaque signed token (JWT for GCP, PKCS7 for AWS and Azure)
    pub token: String,
    /// Decoded claims or provider instance document, when available
    pub claims: Option<serde_json::Value>,
}

impl CloudIdentity {
    pub fn new(token: impl Into<String>, claims: Option<serde_json::Value>) -> Self {
        Self {
            token: token.into(),
            claims,
        }
    }
}

impl std::fmt::Debug for CloudIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudIdentity")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("claims", &self.claims.is_some())
            .finish()
    }
}

/// Last-seen license set version (ETag) for one polling session
///
/// Owned by the poller and lent to the instance for each request. Empty
/// until the first successful response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeToken(Option<String>);

impl ChangeToken {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn replace(&mut self, etag: Option<String>) {
        self.0 = etag;
    }
}

/// Static per-provider data
#[derive(Debug, Clone)]
pub struct CloudInstanceDescriptor {
    pub cloud_type: CloudType,
    /// Endpoint returning the signed identity document
    pub identity_url: String,
    /// Secondary metadata endpoint (IMDSv2 session token, instance compute document)
    pub metadata_url: Option<String>,
    /// License enumeration endpoint, for providers that expose one
    pub licenses_url: Option<String>,
    /// Headers every metadata request must carry
    pub headers: Vec<(String, String)>,
    /// Release codename to the provider's Pro license id
    pub licenses: BTreeMap<String, String>,
}

impl CloudInstanceDescriptor {
    pub fn license_for(&self, series: &str) -> Option<&str> {
        self.licenses.get(series).map(String::as_str)
    }
}

/// Filesystem root that local viability markers are read from
#[derive(Debug, Clone)]
pub struct HostRoot {
    root: PathBuf,
}

impl HostRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }

    /// File content with surrounding whitespace removed; `None` if unreadable
    pub fn read_trimmed(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.path(relative))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl Default for HostRoot {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Collaborators shared by every adapter
#[derive(Clone)]
pub struct InstanceContext {
    pub fetcher: HttpFetcher,
    pub release: Arc<dyn ReleaseInfo>,
    pub host: HostRoot,
    /// Short timeout for identity document requests
    pub identity_timeout: Duration,
    /// Bounded timeout for long-poll license requests
    pub long_poll_timeout: Duration,
}

impl InstanceContext {
    pub fn new(fetcher: HttpFetcher, release: Arc<dyn ReleaseInfo>, host: HostRoot) -> Self {
        let defaults = AutoAttachConfig::default();
        Self {
            fetcher,
            release,
            host,
            identity_timeout: defaults.identity_timeout(),
            long_poll_timeout: defaults.long_poll_timeout(),
        }
    }

    /// Take request timeouts from the configuration
    pub fn with_timeouts(mut self, config: &AutoAttachConfig) -> Self {
        self.identity_timeout = config.identity_timeout();
        self.long_poll_timeout = config.long_poll_timeout();
        self
    }
}

/// Capability set of one cloud provider
#[async_trait]
pub trait CloudInstance: Send + Sync {
    /// Stable provider identifier
    fn cloud_type(&self) -> CloudType;

    fn descriptor(&self) -> &CloudInstanceDescriptor;

    fn context(&self) -> &InstanceContext;

    /// Whether local evidence says this machine runs on this cloud
    fn is_viable(&self) -> bool;

    /// Fetch the provider-signed identity document
    async fn identity_document(&self) -> Result<CloudIdentity, AttachError>;

    /// Whether this release has a Pro license id in the provider catalog
    fn should_poll_for_license(&self) -> bool {
        let series = match self.context().release.series() {
            Ok(series) => series,
            Err(e) => {
                info!(cloud = %self.cloud_type(), error = %e, "Unable to determine release, not polling for a Pro license");
                return false;
            }
        };

        if self.descriptor().license_for(&series).is_none() {
            info!(cloud = %self.cloud_type(), series = %series, "This series isn't supported for auto-attach license polling");
            return false;
        }

        debug!(cloud = %self.cloud_type(), series = %series, "Release supports Pro license polling");
        true
    }

    /// One license enumeration request
    ///
    /// Errors are `CancelLicensePolling` (stop for good) or
    /// `DelayLicensePolling` (try again later).
    async fn is_pro_license_present(
        &self,
        wait_for_change: bool,
        change_token: &mut ChangeToken,
    ) -> Result<bool, AttachError>;
}

/// Every known provider, in selection order
pub fn all_instances(ctx: &InstanceContext) -> Vec<Box<dyn CloudInstance>> {
    CloudType::ALL
        .iter()
        .map(|cloud| instance_for(*cloud, ctx))
        .collect()
}

pub fn instance_for(cloud: CloudType, ctx: &InstanceContext) -> Box<dyn CloudInstance> {
    match cloud {
        CloudType::Aws => Box::new(AwsInstance::new(ctx.clone())),
        CloudType::Azure => Box::new(AzureInstance::new(ctx.clone())),
        CloudType::Gcp => Box::new(GcpInstance::new(ctx.clone())),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;

    #[test]
    fn test_cloud_type_display_and_parse() {
        assert_eq!(CloudType::Gcp.to_string(), "gcp");
        assert_eq!("AWS".parse::<CloudType>().unwrap(), CloudType::Aws);
        assert_eq!("gce".parse::<CloudType>().unwrap(), CloudType::Gcp);
        assert!(matches!(
            "openstack".parse::<CloudType>(),
            Err(AttachError::UnknownCloud(_))
        ));
    }

    #[test]
    fn test_change_token_starts_empty() {
        let mut token = ChangeToken::new();
        assert!(token.is_empty());
        token.replace(Some("abc".to_string()));
        assert_eq!(token.get(), Some("abc"));
        token.replace(None);
        assert!(token.is_empty());
    }

    #[test]
    fn test_identity_debug_hides_token() {
        let identity = CloudIdentity::new("secret-token", None);
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("12 bytes"));
    }

    #[test]
    fn test_host_root_paths() {
        let host = HostRoot::new("/tmp/host");
        assert_eq!(
            host.path("/sys/class/dmi/id/product_name"),
            PathBuf::from("/tmp/host/sys/class/dmi/id/product_name")
        );
    }

    #[test]
    fn test_no_provider_viable_on_empty_host() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), "jammy");

        let instances = all_instances(&ctx);
        let types: Vec<CloudType> = instances.iter().map(|i| i.cloud_type()).collect();
        assert_eq!(types, CloudType::ALL.to_vec());
        assert!(instances.iter().all(|i| !i.is_viable()));
    }

    #[test]
    fn test_unsupported_release_never_polls() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), "trusty");

        for instance in all_instances(&ctx) {
            assert!(!instance.should_poll_for_license());
        }
    }
}
