//! Directory-tree helpers for the simulated backends.

use std::path::Path;

use mosaic::MosaicResult;
use walkdir::WalkDir;

/// Copy everything under `src` into `dst` (which must exist).
pub fn copy_tree(src: &Path, dst: &Path) -> MosaicResult<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(mosaic::MosaicError::storage)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(mosaic::MosaicError::storage)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove everything under `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> MosaicResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
