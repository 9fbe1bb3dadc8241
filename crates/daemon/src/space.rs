//! Disk-space admission control for the work volume.
//!
//! Before a transcode starts, the worker checks that the scratch volume can
//! hold the estimated output (source size x 0.6) while keeping the configured
//! minimum free space untouched.

use std::path::Path;
use sysinfo::Disks;
use walkdir::WalkDir;

/// Conservative output-size estimate: transcoded output ~= 60% of the source.
pub const TRANSCODE_SPACE_MULTIPLIER: f64 = 0.6;

const GIB: u64 = 1024 * 1024 * 1024;

/// Result of the admission space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    /// Enough room for the estimated output plus the reserve.
    Sufficient { free_bytes: u64 },
    /// The job would breach the reserve.
    Insufficient {
        free_bytes: u64,
        required_bytes: u64,
    },
    /// The path maps to no known mount point; treated as passable by callers
    /// since refusing every job on an unmeasurable volume helps nobody.
    Unknown,
}

/// Estimated bytes the transcode output will need.
pub fn estimate_transcode_size(source_bytes: u64) -> u64 {
    (source_bytes as f64 * TRANSCODE_SPACE_MULTIPLIER) as u64
}

/// Total size in bytes of all files under `path`.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Free space on the filesystem holding `path`, by longest mount-point match.
pub fn free_space_for_path(path: &Path) -> Option<u64> {
    let probe = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|d| probe.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Runs the admission check for a job.
///
/// `required = source_bytes x 0.6 + minimum_free_gb`, compared against the
/// free space on the volume holding `work_path`.
pub fn check_space(work_path: &Path, source_bytes: u64, minimum_free_gb: u64) -> SpaceCheck {
    let required_bytes = estimate_transcode_size(source_bytes) + minimum_free_gb * GIB;

    match free_space_for_path(work_path) {
        Some(free_bytes) if free_bytes >= required_bytes => SpaceCheck::Sufficient { free_bytes },
        Some(free_bytes) => SpaceCheck::Insufficient {
            free_bytes,
            required_bytes,
        },
        None => SpaceCheck::Unknown,
    }
}
