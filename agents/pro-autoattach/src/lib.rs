//! Pro Auto-Attach
//!
//! Detects which public cloud a machine runs on, fetches the provider-signed
//! identity document and long-polls the provider's metadata service for a
//! Pro license attached to the running release.
//!
//! # Components
//!
//! - [`http::HttpFetcher`]: proxy-aware HTTP round trips with per-request timeouts
//! - [`retry::RetryPolicy`]: sleep schedule around fallible async operations
//! - [`clouds::CloudInstance`]: per-provider viability, identity and license checks
//! - [`poller::LicensePoller`]: long-poll loop owning the session's ETag
//! - [`orchestrator::AutoAttach`]: provider selection and session boundary

pub mod clouds;
pub mod config;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod poller;
pub mod release;
pub mod retry;

pub use clouds::{
    all_instances, instance_for, ChangeToken, CloudIdentity, CloudInstance,
    CloudInstanceDescriptor, CloudType, HostRoot, InstanceContext,
};
pub use config::{AutoAttachConfig, ProxyConfig};
pub use error::{AttachError, HttpError};
pub use http::{HttpFetcher, HttpRequest, HttpResponse};
pub use orchestrator::{AutoAttach, AutoAttachReport, ReportSummary};
pub use poller::{LicensePoller, PollOutcome, PollSettings};
pub use release::{FixedRelease, OsRelease, ReleaseInfo};
pub use retry::RetryPolicy;
