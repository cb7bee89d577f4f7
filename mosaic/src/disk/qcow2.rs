//! Qcow2 image files.
//!
//! Images are formatted natively with qcow2-rs; copy-on-write children are
//! written by hand as a bare v3 header pointing at their backing file.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use mosaic_shared::errors::{MosaicError, MosaicResult};
use qcow2_rs::meta::Qcow2Header;

use super::constants::qcow2::{
    BACKING_NAME_OFFSET, BLOCK_SIZE, CLUSTER_BITS, EXT_BACKING_FORMAT, MAGIC, MAX_CLUSTER_BITS,
    MIN_CLUSTER_BITS, REFCOUNT_ORDER, V3_HEADER_LEN,
};
use super::{Disk, DiskFormat};

/// Parsed qcow2 header information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2HeaderInfo {
    pub version: u32,
    /// Virtual disk size in bytes.
    pub size: u64,
    pub cluster_bits: u32,
    /// Backing file name, for copy-on-write children.
    pub backing_file: Option<String>,
}

/// Backing file format for qcow2 COW overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingFormat {
    Raw,
    Qcow2,
}

impl BackingFormat {
    /// Get format string for qcow2 backing format extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackingFormat::Raw => "raw",
            BackingFormat::Qcow2 => "qcow2",
        }
    }
}

/// Create a sparse qcow2 image of `size_bytes` virtual size.
///
/// The returned [`Disk`] removes the file unless committed.
pub fn create_image(path: &Path, size_bytes: u64) -> MosaicResult<Disk> {
    if size_bytes == 0 {
        return Err(MosaicError::InvalidArgument(format!(
            "qcow2 image {} needs a non-zero size",
            path.display()
        )));
    }

    // Calculate required metadata size
    let (rc_table, rc_block, _l1_table) =
        Qcow2Header::calculate_meta_params(size_bytes, CLUSTER_BITS, REFCOUNT_ORDER, BLOCK_SIZE);
    let clusters = 1 + rc_table.1 + rc_block.1;
    let buffer_size = ((clusters as usize) << CLUSTER_BITS) + BLOCK_SIZE;

    let mut header_buf = vec![0u8; buffer_size];
    Qcow2Header::format_qcow2(
        &mut header_buf,
        size_bytes,
        CLUSTER_BITS,
        REFCOUNT_ORDER,
        BLOCK_SIZE,
    )
    .map_err(|e| {
        MosaicError::Storage(format!(
            "Failed to format qcow2 header for {}: {}",
            path.display(),
            e
        ))
    })?;

    write_new(path, &header_buf)?;
    tracing::debug!("Created qcow2 image {} ({} bytes)", path.display(), size_bytes);
    Ok(Disk::new(path.to_path_buf(), DiskFormat::Qcow2))
}

/// Create a copy-on-write child of `base`.
///
/// The child starts empty: every read falls through to `base`, writes land
/// in the child. `base` must not change afterwards.
pub fn create_cow_child(
    base: &Path,
    backing_format: BackingFormat,
    child: &Path,
    virtual_size: u64,
) -> MosaicResult<Disk> {
    // Get absolute path for backing file
    let backing = base
        .canonicalize()
        .map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to canonicalize backing path {}: {}",
                base.display(),
                e
            ))
        })?
        .to_string_lossy()
        .to_string();

    let header = cow_child_header(&backing, backing_format, virtual_size)?;
    write_new(child, &header)?;

    tracing::debug!(
        "Created COW child {} (backing: {}, format: {})",
        child.display(),
        backing,
        backing_format.as_str()
    );
    Ok(Disk::new(child.to_path_buf(), DiskFormat::Qcow2))
}

/// Virtual size of a qcow2 image in bytes.
pub fn virtual_size(path: &Path) -> MosaicResult<u64> {
    Ok(read_header(path)?.size)
}

/// Read the fixed qcow2 header (and backing file name, if any).
pub fn read_header(path: &Path) -> MosaicResult<Qcow2HeaderInfo> {
    let mut file = std::fs::File::open(path)?;

    let mut header = [0u8; V3_HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| {
        MosaicError::Storage(format!(
            "Failed to read header from {}: {}",
            path.display(),
            e
        ))
    })?;

    // Parse qcow2 header (big-endian)
    let magic = be_u32(&header, 0);
    if magic != MAGIC {
        return Err(MosaicError::Storage(format!(
            "Invalid qcow2 magic in {}: 0x{:08x}",
            path.display(),
            magic
        )));
    }

    let cluster_bits = be_u32(&header, 20);
    if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
        return Err(MosaicError::Storage(format!(
            "Invalid qcow2 cluster_bits in {}: {}",
            path.display(),
            cluster_bits
        )));
    }

    let backing_offset = be_u64(&header, 8);
    let backing_len = be_u32(&header, 16) as usize;
    // The backing name lives in the header cluster
    let max_backing_len = (1usize << cluster_bits) - BACKING_NAME_OFFSET as usize;
    if backing_len > max_backing_len {
        return Err(MosaicError::Storage(format!(
            "Backing file name in {} is {} bytes, limit {}",
            path.display(),
            backing_len,
            max_backing_len
        )));
    }
    let backing_file = if backing_offset != 0 && backing_len != 0 {
        use std::io::{Seek, SeekFrom};
        let mut name = vec![0u8; backing_len];
        file.seek(SeekFrom::Start(backing_offset))?;
        file.read_exact(&mut name)?;
        Some(String::from_utf8_lossy(&name).into_owned())
    } else {
        None
    };

    Ok(Qcow2HeaderInfo {
        version: be_u32(&header, 4),
        cluster_bits,
        size: be_u64(&header, 24),
        backing_file,
    })
}

/// Build a qcow2 v3 header with a backing file reference.
///
/// Layout: header and backing name in cluster 0, an all-zero L1 table in
/// cluster 1, refcount table in cluster 2, refcount block in cluster 3.
fn cow_child_header(
    backing: &str,
    backing_format: BackingFormat,
    virtual_size: u64,
) -> MosaicResult<Vec<u8>> {
    let cluster_bits = CLUSTER_BITS as u32;
    let cluster_size: u64 = 1 << cluster_bits;

    let backing_bytes = backing.as_bytes();
    let backing_end = BACKING_NAME_OFFSET as usize + backing_bytes.len();
    if backing_end > cluster_size as usize {
        return Err(MosaicError::PathTooLong {
            path: backing.to_string(),
            len: backing_bytes.len(),
            max: cluster_size as usize - BACKING_NAME_OFFSET as usize,
        });
    }

    // One L1 entry covers a full L2 table worth of clusters.
    let l2_entries = cluster_size / 8;
    let l1_entries = virtual_size.div_ceil(cluster_size * l2_entries);
    if l1_entries * 8 > cluster_size {
        return Err(MosaicError::InvalidArgument(format!(
            "virtual size {} too large for a single-cluster L1 table",
            virtual_size
        )));
    }

    let l1_offset = cluster_size;
    let refcount_offset = cluster_size * 2;
    let refcount_block_offset = cluster_size * 3;

    let format_bytes = backing_format.as_str().as_bytes();
    let mut header = vec![0u8; cluster_size as usize * 4];

    put_u32(&mut header, 0, MAGIC);
    put_u32(&mut header, 4, 3);
    put_u64(&mut header, 8, BACKING_NAME_OFFSET);
    put_u32(&mut header, 16, backing_bytes.len() as u32);
    put_u32(&mut header, 20, cluster_bits);
    put_u64(&mut header, 24, virtual_size);
    // 32: crypt_method = 0
    put_u32(&mut header, 36, l1_entries as u32);
    put_u64(&mut header, 40, l1_offset);
    put_u64(&mut header, 48, refcount_offset);
    put_u32(&mut header, 56, 1);
    // 60..96: no snapshots, no feature bits
    put_u32(&mut header, 96, REFCOUNT_ORDER as u32);
    put_u32(&mut header, 100, V3_HEADER_LEN as u32);

    // Backing format extension, padded to 8 bytes, then the end marker
    let ext = V3_HEADER_LEN;
    put_u32(&mut header, ext, EXT_BACKING_FORMAT);
    put_u32(&mut header, ext + 4, format_bytes.len() as u32);
    header[ext + 8..ext + 8 + format_bytes.len()].copy_from_slice(format_bytes);
    // end-of-extensions marker is already zero

    let name = BACKING_NAME_OFFSET as usize;
    header[name..backing_end].copy_from_slice(backing_bytes);

    put_u64(&mut header, refcount_offset as usize, refcount_block_offset);
    // 16-bit refcounts: clusters 0-3 are in use
    let rb = refcount_block_offset as usize;
    for i in 0..4 {
        header[rb + i * 2..rb + i * 2 + 2].copy_from_slice(&1u16.to_be_bytes());
    }

    Ok(header)
}

fn write_new(path: &Path, contents: &[u8]) -> MosaicResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                MosaicError::AlreadyExists(path.display().to_string())
            }
            _ => MosaicError::Storage(format!(
                "Failed to create image {}: {}",
                path.display(),
                e
            )),
        })?;
    // Guard the file until it is fully written
    let disk = Disk::new(path.to_path_buf(), DiskFormat::Qcow2);

    file.write_all(contents).map_err(|e| {
        MosaicError::Storage(format!(
            "Failed to write qcow2 header to {}: {}",
            path.display(),
            e
        ))
    })?;
    disk.commit();
    Ok(())
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_create_and_read_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");

        create_image(&path, 512 * MIB).unwrap().commit();

        let info = read_header(&path).unwrap();
        assert_eq!(info.size, 512 * MIB);
        assert_eq!(info.cluster_bits, CLUSTER_BITS as u32);
        assert_eq!(info.backing_file, None);
        assert_eq!(virtual_size(&path).unwrap(), 512 * MIB);
    }

    #[test]
    fn test_create_zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");
        let err = create_image(&path, 0).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_uncommitted_image_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");
        drop(create_image(&path, 64 * MIB).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_cow_child_points_at_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        let child = dir.path().join("child.qcow2");
        create_image(&base, 64 * MIB).unwrap().commit();

        create_cow_child(&base, BackingFormat::Qcow2, &child, 64 * MIB)
            .unwrap()
            .commit();

        let info = read_header(&child).unwrap();
        assert_eq!(info.version, 3);
        assert_eq!(info.size, 64 * MIB);
        let expected = base.canonicalize().unwrap();
        assert_eq!(info.backing_file.as_deref(), expected.to_str());
    }

    #[test]
    fn test_cow_child_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        let child = dir.path().join("child.qcow2");
        create_image(&base, 64 * MIB).unwrap().commit();
        std::fs::write(&child, b"occupied").unwrap();

        let err = create_cow_child(&base, BackingFormat::Qcow2, &child, 64 * MIB).unwrap_err();
        assert!(matches!(err, MosaicError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&child).unwrap(), b"occupied");
    }

    #[test]
    fn test_invalid_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.qcow2");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        let err = read_header(&path).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_oversized_backing_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");
        create_image(&path, 64 * MIB).unwrap().commit();

        let mut bytes = std::fs::read(&path).unwrap();
        put_u64(&mut bytes, 8, BACKING_NAME_OFFSET);
        put_u32(&mut bytes, 16, u32::MAX);
        std::fs::write(&path, &bytes).unwrap();

        let err = read_header(&path).unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_invalid_cluster_bits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");
        create_image(&path, 64 * MIB).unwrap().commit();

        let mut bytes = std::fs::read(&path).unwrap();
        put_u32(&mut bytes, 20, 63);
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(read_header(&path), Err(MosaicError::Storage(_))));
    }
}
