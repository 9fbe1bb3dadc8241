//! Stability checking for source directories still being written.
//!
//! A rip lands on shared storage file by file; before processing we require
//! the whole tree to hold still. Every sample hashes the sorted
//! `(path, size, mtime)` tuples of all files under the source directory, and
//! the tree counts as stable once the fingerprint has not changed for the
//! configured window. A hard ceiling bounds the wait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Result of waiting for a source tree to stabilize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityOutcome {
    /// Fingerprint unchanged for the full window.
    Stable,
    /// The ceiling elapsed while the tree was still changing.
    Unstable,
    /// The path never appeared before the ceiling elapsed.
    Missing,
    /// Shutdown requested mid-wait.
    Cancelled,
}

/// Timing knobs for the stabilizer.
#[derive(Debug, Clone, Copy)]
pub struct StabilizeParams {
    /// How long the fingerprint must stay unchanged.
    pub window: Duration,
    /// Interval between samples.
    pub interval: Duration,
    /// Hard upper bound on the whole wait.
    pub ceiling: Duration,
}

impl Default for StabilizeParams {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            interval: Duration::from_secs(5),
            ceiling: Duration::from_secs(30 * 60),
        }
    }
}

impl StabilizeParams {
    pub fn with_window_secs(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            ..Self::default()
        }
    }
}

/// Fingerprints the file tree under `path`.
///
/// Returns `None` when the path does not exist. The fingerprint covers every
/// file's relative path, size, and mtime, in sorted order, so both content
/// growth and renames register as change.
pub fn fingerprint(path: &Path) -> Option<u64> {
    if !path.exists() {
        return None;
    }

    let mut entries: Vec<(String, u64, i64)> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let rel = e
                .path()
                .strip_prefix(path)
                .unwrap_or(e.path())
                .to_string_lossy()
                .to_string();
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            Some((rel, meta.len(), mtime))
        })
        .collect();
    entries.sort();

    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    Some(hasher.finish())
}

/// Waits until the tree under `path` has stopped changing.
///
/// Samples every `params.interval`; unchanged samples accumulate stable time,
/// any change resets it. Gives up at `params.ceiling`, reporting `Missing`
/// when the path never existed and `Unstable` otherwise.
pub async fn wait_for_stable(
    path: &Path,
    params: StabilizeParams,
    cancel: &CancellationToken,
) -> StabilityOutcome {
    let start = Instant::now();
    let mut last: Option<u64> = fingerprint(path);
    let mut ever_existed = last.is_some();
    let mut stable_for = Duration::ZERO;

    loop {
        if start.elapsed() >= params.ceiling {
            return if ever_existed {
                StabilityOutcome::Unstable
            } else {
                StabilityOutcome::Missing
            };
        }

        tokio::select! {
            _ = cancel.cancelled() => return StabilityOutcome::Cancelled,
            _ = sleep(params.interval) => {}
        }

        let current = fingerprint(path);
        if current.is_some() {
            ever_existed = true;
        }

        match (&last, &current) {
            (Some(prev), Some(curr)) if prev == curr => {
                stable_for += params.interval;
                if stable_for >= params.window {
                    return StabilityOutcome::Stable;
                }
            }
            _ => {
                stable_for = Duration::ZERO;
            }
        }
        last = current;
    }
}
