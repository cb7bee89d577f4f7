//! Disk image constants.

/// QCOW2 disk image configuration
pub mod qcow2 {
    /// QCOW2 cluster size in bits (64KB = 2^16)
    pub const CLUSTER_BITS: usize = 16;

    /// Cluster sizes a valid image may declare (512 bytes to 2 MiB).
    pub const MIN_CLUSTER_BITS: u32 = 9;
    pub const MAX_CLUSTER_BITS: u32 = 21;

    /// QCOW2 refcount order (16-bit refcounts = 2^4)
    pub const REFCOUNT_ORDER: u8 = 4;

    /// Block size for QCOW2 formatting (512 bytes)
    pub const BLOCK_SIZE: usize = 512;

    /// "QFI\xfb"
    pub const MAGIC: u32 = 0x514649fb;

    /// Header extension type carrying the backing file format.
    pub const EXT_BACKING_FORMAT: u32 = 0xE2792ACA;

    /// Length of a version 3 header without extensions.
    pub const V3_HEADER_LEN: usize = 104;

    /// Offset at which COW children store their backing file name.
    pub const BACKING_NAME_OFFSET: u64 = 512;
}

/// Loop and network block devices
pub mod devices {
    /// Where the kernel publishes block device state.
    pub const SYSFS_BLOCK: &str = "/sys/block";

    /// Number of /dev/nbdN nodes probed for a free one.
    pub const MAX_NBD_DEVICES: u32 = 16;
}

/// Ext2/3/4 superblock
pub mod ext4 {
    /// Byte offset of the superblock magic (superblock at 1024, magic at +56).
    pub const MAGIC_OFFSET: u64 = 1024 + 56;

    /// Little-endian s_magic value.
    pub const MAGIC: u16 = 0xEF53;
}
