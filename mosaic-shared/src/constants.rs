//! Shared constants between the core and drivers.
//!
//! These values form the boundary contract; drivers compiled out of tree
//! rely on them being stable.

/// Volume size units.
pub mod block {
    /// Volume sizes are counted in 512-byte blocks at the API boundary.
    pub const BLOCK_SIZE: u64 = 512;

    /// log2(BLOCK_SIZE), for converting byte counts with shifts.
    pub const BLOCK_SHIFT: u32 = 9;

    /// Convert a byte count to whole blocks, rounding up.
    pub const fn bytes_to_blocks(bytes: u64) -> u64 {
        bytes.div_ceil(BLOCK_SIZE)
    }

    /// Convert a block count to bytes; `None` if the byte count overflows.
    pub const fn blocks_to_bytes(blocks: u64) -> Option<u64> {
        blocks.checked_mul(BLOCK_SIZE)
    }
}

/// Raw capability bits reported by `Pool::features()`.
pub mod features {
    /// Can clone volumes.
    pub const CLONE: u64 = 1 << 0;

    /// Honors the size argument at creation and supports resize.
    pub const DISK_SIZE_MGMT: u64 = 1 << 1;

    /// Can expose a raw block device for a volume.
    pub const BDEV: u64 = 1 << 2;

    /// Supports (live) migration of a volume.
    pub const MIGRATE: u64 = 1 << 3;
}

/// Host path limits.
pub mod paths {
    /// Longest path (including the terminating NUL) the host accepts.
    ///
    /// Matches Linux `PATH_MAX`. Block-device and mount paths at or over this
    /// length are rejected, never truncated.
    pub const PATH_MAX: usize = 4096;
}
