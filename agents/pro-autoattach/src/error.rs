//! Error Types
//!
//! Transport-level failures from the metadata services and the coarse
//! attach/poll classifications derived from them.

use thiserror::Error;

/// Failures of a single HTTP round trip
#[derive(Debug, Error)]
pub enum HttpError {
    /// Connection refused/reset, TLS failure, proxy failure
    #[error("Failed to reach {url}: {message}")]
    Transport { url: String, message: String },

    /// The request did not complete within its timeout
    #[error("Request to {url} timed out")]
    Timeout { url: String },

    /// Response body is not the JSON shape the caller asked for
    #[error("Invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },

    /// The request could not be built (bad URL, bad header value)
    #[error("Invalid request to {url}: {message}")]
    InvalidRequest { url: String, message: String },
}

impl HttpError {
    /// Timeouts count as transport failures for retry purposes
    pub fn is_transport(&self) -> bool {
        matches!(self, HttpError::Transport { .. } | HttpError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout { .. })
    }
}

/// Errors surfaced by cloud instances, the license poller and the orchestrator
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// GCP refused to issue an identity token for this instance
    #[error("{msg}")]
    ProAccount {
        msg: String,
        msg_code: Option<String>,
        code: u16,
    },

    /// A metadata service answered with an unexpected status
    #[error("{cloud} metadata service returned {code}: {body}")]
    Metadata {
        cloud: String,
        code: u16,
        body: String,
    },

    /// The identity token payload could not be decoded
    #[error("Invalid identity token: {0}")]
    InvalidIdentityToken(String),

    /// License endpoint rejected the request permanently; stop polling
    #[error("License polling cancelled")]
    CancelLicensePolling,

    /// License check failed transiently; poll again later
    #[error("License polling delayed")]
    DelayLicensePolling,

    #[error("Unable to determine release: {0}")]
    ReleaseInfo(String),

    #[error("No viable cloud provider detected")]
    NoViableCloud,

    #[error("Unknown cloud type: {0}")]
    UnknownCloud(String),

    #[error("This machine is already attached")]
    AlreadyAttached,

    #[error("Auto-attach is disabled by configuration")]
    AutoAttachDisabled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AttachError {
    /// Short machine-readable code for reports and logs
    pub fn code(&self) -> &str {
        match self {
            AttachError::Http(e) if e.is_timeout() => "timeout",
            AttachError::Http(HttpError::Decode { .. }) => "decode-error",
            AttachError::Http(_) => "transport-error",
            AttachError::ProAccount { msg_code, .. } => {
                msg_code.as_deref().unwrap_or("gcp-pro-account-error")
            }
            AttachError::Metadata { .. } => "metadata-error",
            AttachError::InvalidIdentityToken(_) => "invalid-identity-token",
            AttachError::CancelLicensePolling => "cancel-pro-license-polling",
            AttachError::DelayLicensePolling => "delay-pro-license-polling",
            AttachError::ReleaseInfo(_) => "release-info-error",
            AttachError::NoViableCloud => "no-viable-cloud",
            AttachError::UnknownCloud(_) => "unknown-cloud",
            AttachError::AlreadyAttached => "already-attached",
            AttachError::AutoAttachDisabled => "auto-attach-disabled",
            AttachError::Config(_) => "config-error",
        }
    }

    /// Transport-level failure (connection or timeout)
    pub fn is_transport(&self) -> bool {
        matches!(self, AttachError::Http(e) if e.is_transport())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transport() {
        let err = HttpError::Timeout {
            url: "http://metadata".to_string(),
        };
        assert!(err.is_transport());
        assert!(err.is_timeout());

        let decode = HttpError::Decode {
            url: "http://metadata".to_string(),
            message: "expected value".to_string(),
        };
        assert!(!decode.is_transport());
    }

    #[test]
    fn test_error_codes() {
        let timeout = AttachError::from(HttpError::Timeout {
            url: "http://metadata".to_string(),
        });
        assert_eq!(timeout.code(), "timeout");
        assert!(timeout.is_transport());

        let account = AttachError::ProAccount {
            msg: "nope".to_string(),
            msg_code: None,
            code: 403,
        };
        assert_eq!(account.code(), "gcp-pro-account-error");
        assert_eq!(account.to_string(), "nope");
        assert!(!account.is_transport());
    }
}
