//! Helpers shared by the built-in drivers: locating and running external
//! tools, and measuring directory trees.

use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use mosaic_shared::errors::{MosaicError, MosaicResult};
use walkdir::WalkDir;

use crate::options::MosaicOptions;

/// Directories holding admin tools that are often missing from a user's PATH.
const SYSTEM_TOOL_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Find an external tool.
///
/// Searches `options.tool_paths` first, then `PATH`, then the usual sbin
/// directories.
pub fn find_binary(binary_name: &str, options: &MosaicOptions) -> MosaicResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = options
        .tool_paths
        .iter()
        .map(|dir| dir.join(binary_name))
        .collect();

    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(binary_name)));
    }
    candidates.extend(SYSTEM_TOOL_DIRS.iter().map(|dir| Path::new(dir).join(binary_name)));

    for candidate in &candidates {
        if candidate.is_file() {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    // Not found - return error with all searched locations
    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(MosaicError::Storage(format!(
        "Binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

/// Run an external tool to completion and return its stdout.
///
/// A non-zero exit becomes `Storage` carrying the tool's stderr.
pub fn run_tool<I, S>(tool: &Path, args: I) -> MosaicResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(tool);
    cmd.args(args);
    tracing::debug!("Running {:?}", cmd);

    let output = cmd.output().map_err(|e| {
        MosaicError::Storage(format!("Failed to run {}: {}", tool.display(), e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MosaicError::Storage(format!(
            "{} failed with exit code {:?}: {}",
            tool.display(),
            output.status.code(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Space used by a directory tree, in 512-byte blocks.
///
/// Counts allocated blocks (`st_blocks`), so sparse files count for what
/// they actually occupy. Symlinks are not followed.
pub fn disk_usage_blocks(dir: &Path) -> MosaicResult<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            MosaicError::Storage(format!("Failed to walk directory {}: {}", dir.display(), e))
        })?;
        let metadata = entry.metadata().map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to stat {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        // st_blocks is always in 512-byte units
        total += metadata.blocks();
    }
    Ok(total)
}

/// Check if a process with the given PID exists.
///
/// PIDs that are 0 or do not fit a `pid_t` never name a single process
/// (kill would address a process group), so they count as not alive.
pub fn is_process_alive(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, 0) == 0 },
        _ => false,
    }
}
