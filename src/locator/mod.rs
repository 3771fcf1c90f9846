//! Build artifact discovery
//!
//! Lists the linked executables sitting in the build output directory. The
//! scan does not consult the catalog: unknown names are handed on and the
//! converter decides what to ignore. Entries that cannot be read (a dangling
//! symlink, say) are skipped with a warning; only the directory itself
//! being missing or unreadable fails the scan.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

/// A file produced by the firmware build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// File name inside the build directory
    pub name: String,
    /// Full path to the file
    pub source_path: PathBuf,
}

/// Errors from scanning the build directory
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("build directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("build path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("cannot read build directory {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read build directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Start a fresh scan of `build_dir`.
///
/// The directory is read lazily as the returned iterator advances; each call
/// starts over, nothing is cached between scans.
pub fn scan(build_dir: &Path) -> Result<ArtifactScan, LocatorError> {
    if !build_dir.exists() {
        return Err(LocatorError::DirectoryNotFound(build_dir.to_path_buf()));
    }
    if !build_dir.is_dir() {
        return Err(LocatorError::NotADirectory(build_dir.to_path_buf()));
    }
    fs::read_dir(build_dir).map_err(|source| LocatorError::Unreadable {
        path: build_dir.to_path_buf(),
        source,
    })?;

    let inner = WalkDir::new(build_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter();

    Ok(ArtifactScan { inner })
}

/// Lazy iterator over the regular files of a build directory
pub struct ArtifactScan {
    inner: walkdir::IntoIter,
}

impl Iterator for ArtifactScan {
    type Item = Result<BuildArtifact, LocatorError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Some(Err(e.into())),
                Err(e) => {
                    tracing::warn!(
                        path = ?e.path(),
                        error = %e,
                        "skipping unreadable build directory entry"
                    );
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                tracing::debug!(path = %entry.path().display(), "skipping non UTF-8 file name");
                continue;
            };

            return Some(Ok(BuildArtifact {
                name: name.to_string(),
                source_path: entry.path().to_path_buf(),
            }));
        }
    }
}
