//! Error taxonomy for pool and volume operations.
//!
//! Every fallible operation in mosaic returns exactly one of these. The
//! state-machine variants (`AlreadyMounted`, `NotMounted`, `Busy`,
//! `NotAttached`) are produced by the core itself; `Storage` carries
//! backend-reported failures verbatim so they can be logged, not branched on.

use thiserror::Error;

/// Result alias used throughout mosaic.
pub type MosaicResult<T> = Result<T, MosaicError>;

#[derive(Debug, Error)]
pub enum MosaicError {
    /// Pool locator, backend kind, or volume name does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// The pool lacks the capability the operation needs.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Mount requested on an entity that is already mounted.
    #[error("already mounted: {0}")]
    AlreadyMounted(String),

    /// Unmount requested on an entity that is not mounted (at that path).
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// Destructive operation on a volume that is mounted or attached.
    #[error("busy: {0}")]
    Busy(String),

    /// Block device released without a matching acquisition.
    #[error("no block device attached: {0}")]
    NotAttached(String),

    /// An output path exceeds the platform path limit.
    #[error("path too long ({len} bytes, limit {max}): {path}")]
    PathTooLong {
        path: String,
        len: usize,
        max: usize,
    },

    /// The backend could not be initialized for this pool.
    #[error("backend initialization failed: {0}")]
    BackendInitFailed(String),

    /// A volume with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The caller supplied a malformed argument (e.g. a volume name with '/').
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backend-reported I/O or tool failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MosaicError {
    /// Wrap anything displayable as a backend storage error.
    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }

    /// Wrap anything displayable as a backend init failure.
    pub fn backend_init<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendInitFailed(e.to_string())
    }
}

impl From<std::io::Error> for MosaicError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => MosaicError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => MosaicError::AlreadyExists(e.to_string()),
            _ => MosaicError::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MosaicError::Busy("volume test_vol is mounted at /mnt".into());
        assert_eq!(err.to_string(), "busy: volume test_vol is mounted at /mnt");

        let err = MosaicError::PathTooLong {
            path: "/dev/x".into(),
            len: 5000,
            max: 4096,
        };
        assert!(err.to_string().contains("5000"));
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_io_error_mapping() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            MosaicError::from(not_found),
            MosaicError::NotFound(_)
        ));

        let exists = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "dup");
        assert!(matches!(
            MosaicError::from(exists),
            MosaicError::AlreadyExists(_)
        ));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(MosaicError::from(denied), MosaicError::Storage(_)));
    }
}
