//! Pool locators and descriptor files.
//!
//! A locator is either a path to a descriptor file:
//!
//! ```text
//! type: btrfs
//! location: /srv/pools/btrfs
//! ```
//!
//! or an inline `<kind>:<location>` string such as `plain:/srv/pools/plain`.
//! A relative `location` in a descriptor file is resolved against the
//! directory holding the descriptor.

use mosaic_shared::errors::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved description of a pool: which driver, and where its data lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// Backend kind, looked up in the driver registry.
    #[serde(rename = "type")]
    pub kind: String,

    /// Backend-specific data location (usually a directory).
    pub location: PathBuf,

    /// Filesystem for volumes created with a filesystem; overrides
    /// `MosaicOptions::default_fs` for this pool.
    #[serde(default)]
    pub default_fs: Option<String>,
}

impl PoolDescriptor {
    pub fn new(kind: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
            default_fs: None,
        }
    }

    /// Resolve a locator string.
    ///
    /// # Returns
    /// * `Err(NotFound)` - the locator is neither an existing descriptor file
    ///   nor an inline `<kind>:<location>` string
    /// * `Err(BackendInitFailed)` - the descriptor exists but is malformed
    pub fn resolve(locator: &str) -> MosaicResult<Self> {
        let path = Path::new(locator);
        if path.is_file() {
            return Self::from_file(path);
        }

        if let Some((kind, location)) = split_inline(locator) {
            let desc = Self::new(kind, location);
            desc.validate()?;
            return Ok(desc);
        }

        Err(MosaicError::NotFound(format!(
            "pool locator '{}' is neither a descriptor file nor <kind>:<location>",
            locator
        )))
    }

    /// Load a descriptor file.
    pub fn from_file(path: &Path) -> MosaicResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MosaicError::BackendInitFailed(format!(
                "Failed to read pool descriptor {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut desc: PoolDescriptor = serde_yaml::from_str(&text).map_err(|e| {
            MosaicError::BackendInitFailed(format!(
                "Malformed pool descriptor {}: {}",
                path.display(),
                e
            ))
        })?;

        if desc.location.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            desc.location = base.join(&desc.location);
        }

        desc.validate()?;
        Ok(desc)
    }

    /// Write this descriptor as YAML.
    pub fn write_to(&self, path: &Path) -> MosaicResult<()> {
        let text = serde_yaml::to_string(self).map_err(MosaicError::storage)?;
        std::fs::write(path, text).map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to write pool descriptor {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn validate(&self) -> MosaicResult<()> {
        if self.kind.trim().is_empty() {
            return Err(MosaicError::BackendInitFailed(
                "pool descriptor has an empty type".into(),
            ));
        }
        if self.location.as_os_str().is_empty() {
            return Err(MosaicError::BackendInitFailed(format!(
                "pool descriptor for '{}' has an empty location",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Split `<kind>:<location>`; kind must be a bare identifier.
fn split_inline(locator: &str) -> Option<(&str, &str)> {
    let (kind, location) = locator.split_once(':')?;
    let is_ident = !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if is_ident && !location.is_empty() {
        Some((kind, location))
    } else {
        None
    }
}
