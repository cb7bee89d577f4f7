//! Built-in backend drivers.
//!
//! | kind    | volume                      | capabilities                 |
//! |---------|-----------------------------|------------------------------|
//! | `plain` | sub-directory               | none                         |
//! | `fsimg` | sparse raw image + mkfs     | clone, size, block device    |
//! | `btrfs` | btrfs subvolume             | clone                        |
//! | `qcow2` | qcow2 image                 | clone, size, block device    |
//!
//! With the `builtin-drivers` feature each one registers itself with the
//! driver registry at compile time.

mod btrfs;
mod fsimg;
mod plain;
mod qcow2;
mod subdir;

pub use btrfs::BtrfsDriver;
pub use fsimg::FsImageDriver;
pub use plain::PlainDriver;
pub use qcow2::Qcow2Driver;

use mosaic_shared::constants::block::blocks_to_bytes;
use mosaic_shared::errors::{MosaicError, MosaicResult};

/// Byte size of an image volume of `size_in_blocks`.
///
/// # Returns
/// * `Err(InvalidArgument)` - zero, or too large to express in bytes
pub(crate) fn image_bytes(name: &str, size_in_blocks: u64) -> MosaicResult<u64> {
    if size_in_blocks == 0 {
        return Err(MosaicError::InvalidArgument(format!(
            "image volume '{}' needs a non-zero size",
            name
        )));
    }
    blocks_to_bytes(size_in_blocks).ok_or_else(|| {
        MosaicError::InvalidArgument(format!(
            "size of volume '{}' ({} blocks) overflows a byte count",
            name, size_in_blocks
        ))
    })
}
