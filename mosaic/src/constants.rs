//! Constants for mosaic
//!
//! Centralized location for hardcoded names, environment variables and
//! defaults used by the core and the built-in drivers.

// Re-export shared constants from mosaic-shared
pub use mosaic_shared::constants::{block, features, paths};

pub mod envs {
    /// Default filesystem for volumes created with a filesystem.
    pub const MOSAIC_DEFAULT_FS: &str = "MOSAIC_DEFAULT_FS";

    /// Extra directories (colon-separated) searched for external tools.
    pub const MOSAIC_TOOL_PATH: &str = "MOSAIC_TOOL_PATH";

    /// Log level when RUST_LOG is unset (err, wrn, inf, dbg).
    pub const MOSAIC_LOG: &str = "MOSAIC_LOG";
}

/// Built-in driver kinds.
pub mod kinds {
    pub const PLAIN: &str = "plain";
    pub const FSIMG: &str = "fsimg";
    pub const BTRFS: &str = "btrfs";
    pub const QCOW2: &str = "qcow2";
}

/// Filesystem defaults
pub mod fs_defaults {
    /// Filesystem put on image-backed volumes unless configured otherwise.
    pub const DEFAULT_FS: &str = "ext4";
}

/// File naming patterns
pub mod filenames {
    use std::path::{Path, PathBuf};

    /// Suffix of raw image volumes in an fsimg pool.
    pub const FSIMG_SUFFIX: &str = "img";

    /// Suffix of qcow2 image volumes.
    pub const QCOW2_SUFFIX: &str = "qcow2";

    /// Path of a suffixed image volume inside a pool location.
    pub fn image_path(location: &Path, name: &str, suffix: &str) -> PathBuf {
        location.join(format!("{}.{}", name, suffix))
    }
}
