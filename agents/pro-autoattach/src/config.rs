//! Auto-Attach Configuration
//!
//! Settings for provider detection, identity fetches and license polling.
//! Loaded from an optional JSON file and then overridden by CLI flags.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::AttachError;

/// Proxy URLs keyed by request scheme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy for `http://` requests
    #[serde(default)]
    pub http: Option<String>,
    /// Proxy for `https://` requests
    #[serde(default)]
    pub https: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

/// Configuration for one auto-attach session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAttachConfig {
    /// Skip auto-attach entirely
    pub disable_auto_attach: bool,
    /// Long-poll the provider for a Pro license when the release is supported
    pub poll_for_pro_license: bool,
    /// Machine already holds a subscription
    pub attached: bool,
    /// Delay after a transient failure or a long-poll that returned early
    pub polling_interval_secs: u64,
    /// Upper bound on long-poll iterations
    pub max_poll_attempts: Option<u32>,
    /// Wall-clock bound on the whole polling session
    pub poll_deadline_secs: Option<u64>,
    /// Per-request timeout for identity document fetches
    pub identity_timeout_secs: u64,
    /// Per-request timeout for long-poll license fetches
    pub long_poll_timeout_secs: u64,
    /// A long-poll answering faster than this did not block server-side
    pub quick_return_secs: u64,
    /// Proxies for metadata requests
    pub proxies: ProxyConfig,
}

impl Default for AutoAttachConfig {
    fn default() -> Self {
        Self {
            disable_auto_attach: false,
            poll_for_pro_license: true,
            attached: false,
            polling_interval_secs: 300,
            max_poll_attempts: None,
            poll_deadline_secs: None,
            identity_timeout_secs: 1,
            long_poll_timeout_secs: 330,
            quick_return_secs: 10,
            proxies: ProxyConfig::default(),
        }
    }
}

impl AutoAttachConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self, AttachError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AttachError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AttachError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unbounded request timeouts and an empty attempt budget
    pub fn validate(&self) -> Result<(), AttachError> {
        if self.identity_timeout_secs == 0 {
            return Err(AttachError::Config(
                "identity_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.long_poll_timeout_secs == 0 {
            return Err(AttachError::Config(
                "long_poll_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_poll_attempts == Some(0) {
            return Err(AttachError::Config(
                "max_poll_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout_secs)
    }

    pub fn poll_deadline(&self) -> Option<Duration> {
        self.poll_deadline_secs.map(Duration::from_secs)
    }

    pub fn quick_return(&self) -> Duration {
        Duration::from_secs(self.quick_return_secs)
    }
}
