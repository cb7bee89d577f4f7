//! Configuration for mosaic.

use crate::constants::envs as const_envs;
use crate::constants::fs_defaults;
use crate::logging::LogLevel;
use mosaic_shared::errors::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide options for pools opened by this library.
///
/// Drivers receive these at open time. Everything has a default, so an
/// empty YAML document is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MosaicOptions {
    /// Filesystem put on image-backed volumes created with a filesystem,
    /// unless the pool descriptor names its own `default_fs`.
    ///
    /// Default: ext4
    #[serde(default = "default_fs")]
    pub default_fs: String,

    /// Extra directories searched (before `PATH`) for external tools such
    /// as `mkfs.ext4`, `losetup`, `btrfs`, `qemu-img` and `qemu-nbd`.
    #[serde(default)]
    pub tool_paths: Vec<PathBuf>,

    /// Log level used by [`crate::logging::init`] when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_fs() -> String {
    fs_defaults::DEFAULT_FS.to_string()
}

impl Default for MosaicOptions {
    fn default() -> Self {
        Self {
            default_fs: default_fs(),
            tool_paths: Vec::new(),
            log_level: LogLevel::default(),
        }
    }
}

impl MosaicOptions {
    /// Load options from a YAML file.
    pub fn from_file(path: &Path) -> MosaicResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MosaicError::NotFound(format!(
                "Failed to read options file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse options from a YAML document.
    pub fn from_yaml(text: &str) -> MosaicResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| MosaicError::InvalidArgument(format!("Invalid options: {}", e)))
    }

    /// Defaults overridden by `MOSAIC_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(fs) = lookup(const_envs::MOSAIC_DEFAULT_FS).filter(|v| !v.is_empty()) {
            self.default_fs = fs;
        }
        if let Some(paths) = lookup(const_envs::MOSAIC_TOOL_PATH) {
            self.tool_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(level) = lookup(const_envs::MOSAIC_LOG).and_then(|v| LogLevel::parse(&v)) {
            self.log_level = level;
        }
        self
    }

    /// Set the default filesystem.
    pub fn with_default_fs(mut self, fs: impl Into<String>) -> Self {
        self.default_fs = fs.into();
        self
    }

    /// Add a tool search directory.
    pub fn with_tool_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_paths.push(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let opts = MosaicOptions::default();
        assert_eq!(opts.default_fs, "ext4");
        assert!(opts.tool_paths.is_empty());
        assert_eq!(opts.log_level, LogLevel::Info);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(
            MosaicOptions::from_yaml("").unwrap(),
            MosaicOptions::default()
        );
    }

    #[test]
    fn test_yaml_partial() {
        let opts = MosaicOptions::from_yaml("default_fs: xfs\nlog_level: dbg\n").unwrap();
        assert_eq!(opts.default_fs, "xfs");
        assert_eq!(opts.log_level, LogLevel::Debug);
        assert!(opts.tool_paths.is_empty());
    }

    #[test]
    fn test_yaml_invalid() {
        let err = MosaicOptions::from_yaml("default_fs: [1, 2").unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MOSAIC_DEFAULT_FS", "btrfs"),
            ("MOSAIC_TOOL_PATH", "/opt/a:/opt/b"),
            ("MOSAIC_LOG", "wrn"),
        ]
        .into_iter()
        .collect();

        let opts = MosaicOptions::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(opts.default_fs, "btrfs");
        assert_eq!(
            opts.tool_paths,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
        assert_eq!(opts.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_unknown_log_level_keeps_default() {
        let opts = MosaicOptions::default().with_env_overrides(|k| {
            (k == "MOSAIC_LOG").then(|| "chatty".to_string())
        });
        assert_eq!(opts.log_level, LogLevel::Info);
    }
}
