//! OS Release Information
//!
//! Supplies the release codename (e.g. `jammy`) that provider license
//! catalogs are keyed by.

use std::path::PathBuf;

use crate::error::AttachError;

/// Source of the running release's codename
pub trait ReleaseInfo: Send + Sync {
    fn series(&self) -> Result<String, AttachError>;
}

/// Reads `VERSION_CODENAME` (or `UBUNTU_CODENAME`) from an os-release file
#[derive(Debug, Clone)]
pub struct OsRelease {
    path: PathBuf,
}

impl OsRelease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `/etc/os-release` below the given filesystem root
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join("etc/os-release"))
    }
}

impl Default for OsRelease {
    fn default() -> Self {
        Self::new("/etc/os-release")
    }
}

impl ReleaseInfo for OsRelease {
    fn series(&self) -> Result<String, AttachError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            AttachError::ReleaseInfo(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        parse_codename(&content).ok_or_else(|| {
            AttachError::ReleaseInfo(format!("no codename in {}", self.path.display()))
        })
    }
}

/// A fixed codename, for overrides
#[derive(Debug, Clone)]
pub struct FixedRelease(pub String);

impl FixedRelease {
    pub fn new(series: impl Into<String>) -> Self {
        Self(series.into())
    }
}

impl ReleaseInfo for FixedRelease {
    fn series(&self) -> Result<String, AttachError> {
        Ok(self.0.clone())
    }
}

fn parse_codename(content: &str) -> Option<String> {
    let lookup = |key: &str| {
        content.lines().find_map(|line| {
            let (k, v) = line.trim().split_once('=')?;
            if k.trim() != key {
                return None;
            }
            let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
            (!v.is_empty()).then(|| v.to_string())
        })
    };

    lookup("VERSION_CODENAME").or_else(|| lookup("UBUNTU_CODENAME"))
}
