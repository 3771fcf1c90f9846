//! Removal of transient staged inputs
//!
//! Staged paths are the artifact copies and the provisioned key placed in
//! the working directory during a run. Removing them is best effort: a path
//! that is already gone counts as clean, and a failed removal is reported as
//! a warning without failing the run. Canonical board images are the output
//! of the pipeline and are never removed here.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fw_catalog::Catalog;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Set of transient paths created during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedPaths {
    paths: BTreeSet<PathBuf>,
}

impl StagedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a path for removal at the end of the run
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A staged path that could not be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Paths deleted by this pass
    pub removed: Vec<PathBuf>,
    /// Paths that were already gone
    pub already_absent: Vec<PathBuf>,
    /// Canonical images that were listed but left in place
    pub protected: Vec<PathBuf>,
    /// Removals that failed
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another pass into this one
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.already_absent.extend(other.already_absent);
        self.protected.extend(other.protected);
        self.failures.extend(other.failures);
    }
}

/// Remove every staged path under `work_dir`.
///
/// Paths in the working directory that carry a canonical image name are
/// left untouched.
pub fn cleanup(work_dir: &Path, staged: &StagedPaths, catalog: &Catalog) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in staged.iter() {
        if is_board_image(work_dir, path, catalog) {
            warn!(path = %path.display(), "refusing to remove board image");
            report.protected.push(path.to_path_buf());
            continue;
        }

        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed staged file");
                report.removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.already_absent.push(path.to_path_buf());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "CleanupFailed: could not remove staged file");
                report.failures.push(CleanupFailure {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }

    if !report.removed.is_empty() {
        info!(count = report.removed.len(), "staged inputs removed");
    }

    report
}

fn is_board_image(work_dir: &Path, path: &Path, catalog: &Catalog) -> bool {
    let in_work_dir = path.parent().map_or(false, |parent| parent == work_dir);
    let canonical = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| catalog.is_canonical(n));
    in_work_dir && canonical
}
