//! GCP Instance
//!
//! Identity tokens and license enumeration from the GCE metadata server.
//! The license endpoint supports long-polling: given the last ETag, the
//! server holds the request until the license set changes.
//!
//! See https://cloud.google.com/compute/docs/metadata/querying-metadata#etags

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use super::token::decode_payload;
use super::{
    ChangeToken, CloudIdentity, CloudInstance, CloudInstanceDescriptor, CloudType,
    InstanceContext,
};
use crate::error::AttachError;
use crate::http::HttpRequest;
use crate::retry::RetryPolicy;

const TOKEN_URL: &str = "http://metadata/computeMetadata/v1/instance/service-accounts/default/identity?audience=contracts.canonical.com&format=full&licenses=TRUE";
const LICENSES_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/licenses/?recursive=true";

const DMI_PRODUCT_NAME: &str = "sys/class/dmi/id/product_name";
const GCP_PRODUCT_NAME: &str = "Google Compute Engine";

const SERVICE_ACCOUNT_NOT_ENABLED: &str = "gcp-pro-service-account-not-enabled";

/// Release codename to GCP Ubuntu Pro license id
const GCP_LICENSES: [(&str, &str); 4] = [
    ("xenial", "8045211386737108299"),
    ("bionic", "6022427724719891830"),
    ("focal", "599959289349842382"),
    ("jammy", "2592866803419978320"),
];

/// Static GCP metadata endpoints and license catalog
pub fn gcp_descriptor() -> CloudInstanceDescriptor {
    CloudInstanceDescriptor {
        cloud_type: CloudType::Gcp,
        identity_url: TOKEN_URL.to_string(),
        metadata_url: None,
        licenses_url: Some(LICENSES_URL.to_string()),
        headers: vec![("Metadata-Flavor".to_string(), "Google".to_string())],
        licenses: GCP_LICENSES
            .iter()
            .map(|(series, id)| (series.to_string(), id.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Google Compute Engine instance
pub struct GcpInstance {
    ctx: InstanceContext,
    descriptor: CloudInstanceDescriptor,
    retry: RetryPolicy,
}

impl GcpInstance {
    pub fn new(ctx: InstanceContext) -> Self {
        Self::with_descriptor(ctx, gcp_descriptor())
    }

    pub fn with_descriptor(ctx: InstanceContext, descriptor: CloudInstanceDescriptor) -> Self {
        Self {
            ctx,
            descriptor,
            retry: RetryPolicy::from_secs(&[0.5, 1.0, 1.0]),
        }
    }

    /// Override the identity retry sleeps
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// License URL, with long-poll parameters only when a token is held
    pub fn licenses_url(&self, wait_for_change: bool, change_token: &ChangeToken) -> Option<String> {
        let base = self.descriptor.licenses_url.as_deref()?;
        match change_token.get() {
            Some(etag) if wait_for_change => Some(format!(
                "{}&wait_for_change=true&last_etag={}",
                base,
                urlencoding::encode(etag)
            )),
            _ => Some(base.to_string()),
        }
    }

    async fn fetch_identity_token(&self) -> Result<String, AttachError> {
        let request = HttpRequest::get(&self.descriptor.identity_url)
            .headers(&self.descriptor.headers)
            .timeout(self.ctx.identity_timeout);
        let response = self.ctx.fetcher.fetch(request).await?;

        if response.is_ok() {
            return Ok(response.body);
        }

        let error_desc = response
            .json_dict()
            .get("error_description")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        let (msg, msg_code) = match error_desc {
            Some(desc) if desc.to_lowercase().contains("service account") => (
                format!(
                    "Failed to attach machine\n{}\nFor more information, see https://cloud.google.com/iam/docs/service-accounts",
                    desc
                ),
                Some(SERVICE_ACCOUNT_NOT_ENABLED.to_string()),
            ),
            Some(desc) => (desc, None),
            None => (response.body, None),
        };

        Err(AttachError::ProAccount {
            msg,
            msg_code,
            code: response.code,
        })
    }
}

/// License ids carried in the identity token's `google.compute_engine.license_id`
///
/// Any missing level of nesting yields an empty list.
pub fn identity_to_licenses(token: &str) -> Result<Vec<String>, AttachError> {
    let claims = decode_payload(token)?;
    Ok(licenses_from_claims(&claims))
}

pub fn licenses_from_claims(claims: &Value) -> Vec<String> {
    claims
        .get("google")
        .and_then(|g| g.get("compute_engine"))
        .and_then(|c| c.get("license_id"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn licenses_from_identity(identity: &CloudIdentity) -> Vec<String> {
    identity
        .claims
        .as_ref()
        .map(licenses_from_claims)
        .unwrap_or_default()
}

#[async_trait]
impl CloudInstance for GcpInstance {
    fn cloud_type(&self) -> CloudType {
        CloudType::Gcp
    }

    fn descriptor(&self) -> &CloudInstanceDescriptor {
        &self.descriptor
    }

    fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    fn is_viable(&self) -> bool {
        self.ctx
            .host
            .read_trimmed(DMI_PRODUCT_NAME)
            .is_some_and(|name| name == GCP_PRODUCT_NAME)
    }

    async fn identity_document(&self) -> Result<CloudIdentity, AttachError> {
        let token = self
            .retry
            .run(
                |e: &AttachError| matches!(e, AttachError::ProAccount { .. }),
                || self.fetch_identity_token(),
            )
            .await?;

        let claims = decode_payload(&token)?;
        debug!(
            licenses = ?licenses_from_claims(&claims),
            "Fetched GCP identity token"
        );
        Ok(CloudIdentity::new(token, Some(claims)))
    }

    async fn is_pro_license_present(
        &self,
        wait_for_change: bool,
        change_token: &mut ChangeToken,
    ) -> Result<bool, AttachError> {
        let Some(url) = self.licenses_url(wait_for_change, change_token) else {
            return Err(AttachError::CancelLicensePolling);
        };

        let request = HttpRequest::get(url)
            .headers(&self.descriptor.headers)
            .timeout(self.ctx.long_poll_timeout);

        let response = match self.ctx.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                debug!(error = %e, "GCP license long-poll timed out without a change");
                return Err(AttachError::DelayLicensePolling);
            }
            Err(e) => {
                warn!(error = %e, "GCP license request failed");
                return Err(AttachError::DelayLicensePolling);
            }
        };

        if !response.is_ok() {
            error!(status = response.code, body = %response.body, "GCP license request rejected");
            return if response.code == 400 {
                Err(AttachError::CancelLicensePolling)
            } else {
                Err(AttachError::DelayLicensePolling)
            };
        }

        let license_ids: Vec<String> = match response.json_list() {
            Ok(items) => items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!(error = %e, "GCP license response is not a license list");
                return Err(AttachError::DelayLicensePolling);
            }
        };

        change_token.replace(response.header("etag").map(str::to_string));

        let series = self.ctx.release.series().map_err(|e| {
            warn!(error = %e, "Unable to determine release");
            AttachError::DelayLicensePolling
        })?;
        let expected = self.descriptor.license_for(&series);

        debug!(
            licenses = ?license_ids,
            expected = ?expected,
            etag = ?change_token.get(),
            "GCP licenses"
        );

        Ok(expected.is_some_and(|id| license_ids.iter().any(|l| l == id)))
    }
}
