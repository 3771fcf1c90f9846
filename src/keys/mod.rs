//! Signing key provisioning
//!
//! The signer expects the key next to the images, so the key file is copied
//! from the key source into the working directory for the signing phase and
//! removed afterwards. [`SigningKey`] is the scope guard for that copy:
//! [`SigningKey::release`] removes and verifies, and `Drop` removes the file
//! on any path that skipped the explicit release (early return, panic).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::signal::SignalState;

/// Errors from key provisioning
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("signing key source not found: {0}")]
    KeySourceMissing(PathBuf),

    #[error("signing key source {0} is inside the working directory")]
    SourceInWorkDir(PathBuf),

    #[error("failed to provision signing key at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of retiring a key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyRelease {
    /// The key file was deleted and is gone
    Removed,
    /// The key file was already gone
    AlreadyAbsent,
    /// The key file is still on disk
    Residue { path: PathBuf, error: String },
}

impl KeyRelease {
    pub fn is_residue(&self) -> bool {
        matches!(self, KeyRelease::Residue { .. })
    }
}

/// Provisions the signing key into a working directory
#[derive(Debug, Clone)]
pub struct KeyManager {
    source: PathBuf,
    work_dir: PathBuf,
    signals: Option<Arc<SignalState>>,
}

impl KeyManager {
    pub fn new(source: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            work_dir: work_dir.into(),
            signals: None,
        }
    }

    /// Register provisioned keys with the interrupt handler
    pub fn with_signal_state(mut self, signals: Arc<SignalState>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Where the key lives while signing
    pub fn key_path(&self) -> PathBuf {
        match self.source.file_name() {
            Some(name) => self.work_dir.join(name),
            None => self.work_dir.join("signing.key"),
        }
    }

    /// Whether the working copy would be the source file itself
    fn key_is_source(&self) -> bool {
        let path = self.key_path();
        if path == self.source {
            return true;
        }
        match (fs::canonicalize(&path), fs::canonicalize(&self.source)) {
            (Ok(path), Ok(source)) => path == source,
            _ => false,
        }
    }

    /// Check that a key can be provisioned, without copying anything
    pub fn preflight(&self) -> Result<(), KeyError> {
        if self.key_is_source() {
            return Err(KeyError::SourceInWorkDir(self.source.clone()));
        }
        if self.key_path().is_file() || self.source.is_file() {
            Ok(())
        } else {
            Err(KeyError::KeySourceMissing(self.source.clone()))
        }
    }

    /// Provide the key in the working directory.
    ///
    /// A key file already present (left by an interrupted run) is reused
    /// as is; otherwise the source is copied.
    pub fn ensure_key(&self) -> Result<SigningKey, KeyError> {
        // Reusing the source would delete it on release.
        if self.key_is_source() {
            return Err(KeyError::SourceInWorkDir(self.source.clone()));
        }
        let path = self.key_path();

        if let Some(signals) = &self.signals {
            signals.register_key(&path);
        }

        if path.is_file() {
            warn!(path = %path.display(), "reusing signing key left by a previous run");
            return Ok(SigningKey::new(path, false, self.signals.clone()));
        }

        if !self.source.is_file() {
            if let Some(signals) = &self.signals {
                signals.unregister_key(&path);
            }
            return Err(KeyError::KeySourceMissing(self.source.clone()));
        }

        // The guard exists before the copy so a failed copy is cleaned up too.
        let key = SigningKey::new(path, true, self.signals.clone());
        fs::copy(&self.source, key.path()).map_err(|source| KeyError::Io {
            path: key.path().to_path_buf(),
            source,
        })?;
        restrict_permissions(key.path()).map_err(|source| KeyError::Io {
            path: key.path().to_path_buf(),
            source,
        })?;

        info!(path = %key.path().display(), "signing key provisioned");
        Ok(key)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// A key file provisioned for one run; removed when released or dropped
#[derive(Debug)]
pub struct SigningKey {
    path: PathBuf,
    ephemeral: bool,
    released: bool,
    signals: Option<Arc<SignalState>>,
}

impl SigningKey {
    fn new(path: PathBuf, ephemeral: bool, signals: Option<Arc<SignalState>>) -> Self {
        Self {
            path,
            ephemeral,
            released: false,
            signals,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when this run copied the key (false when reused)
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Remove the key file and verify it is gone
    pub fn release(mut self) -> KeyRelease {
        self.released = true;
        self.remove_and_verify()
    }

    fn remove_and_verify(&self) -> KeyRelease {
        let result = match fs::remove_file(&self.path) {
            Ok(()) => KeyRelease::Removed,
            Err(e) if e.kind() == io::ErrorKind::NotFound => KeyRelease::AlreadyAbsent,
            Err(e) => KeyRelease::Residue {
                path: self.path.clone(),
                error: e.to_string(),
            },
        };

        let result = match result {
            KeyRelease::Residue { .. } => result,
            _ if fs::symlink_metadata(&self.path).is_ok() => KeyRelease::Residue {
                path: self.path.clone(),
                error: "key file still present after removal".to_string(),
            },
            other => other,
        };

        match &result {
            KeyRelease::Residue { path, error } => {
                error!(
                    path = %path.display(),
                    error = %error,
                    "KeyResidueWarning: signing key is still on disk, remove it manually"
                );
            }
            _ => {
                if let Some(signals) = &self.signals {
                    signals.unregister_key(&self.path);
                }
                info!(path = %self.path.display(), "signing key removed");
            }
        }

        result
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.remove_and_verify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        work: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let keygen = temp.path().join("keygen");
        let work = temp.path().join("work");
        fs::create_dir_all(&keygen).unwrap();
        fs::create_dir_all(&work).unwrap();
        let source = keygen.join("ecc256.der");
        fs::write(&source, b"secret key").unwrap();
        Fixture {
            _temp: temp,
            source,
            work,
        }
    }

    #[test]
    fn test_ensure_key_copies_source() {
        let f = fixture();
        let manager = KeyManager::new(&f.source, &f.work);

        let key = manager.ensure_key().unwrap();
        assert_eq!(key.path(), f.work.join("ecc256.der"));
        assert!(key.is_ephemeral());
        assert_eq!(fs::read(key.path()).unwrap(), b"secret key");

        assert_eq!(key.release(), KeyRelease::Removed);
        assert!(!f.work.join("ecc256.der").exists());
        assert!(f.source.exists());
    }

    #[test]
    fn test_ensure_key_reuses_existing() {
        let f = fixture();
        fs::write(f.work.join("ecc256.der"), b"left over").unwrap();
        let manager = KeyManager::new(&f.source, &f.work);

        let key = manager.ensure_key().unwrap();
        assert!(!key.is_ephemeral());
        assert_eq!(fs::read(key.path()).unwrap(), b"left over");

        key.release();
        assert!(!f.work.join("ecc256.der").exists());
    }

    #[test]
    fn test_missing_source() {
        let f = fixture();
        fs::remove_file(&f.source).unwrap();
        let manager = KeyManager::new(&f.source, &f.work);

        assert!(matches!(manager.preflight(), Err(KeyError::KeySourceMissing(_))));
        assert!(matches!(manager.ensure_key(), Err(KeyError::KeySourceMissing(_))));
    }

    #[test]
    fn test_preflight_accepts_left_over_key() {
        let f = fixture();
        fs::remove_file(&f.source).unwrap();
        fs::write(f.work.join("ecc256.der"), b"left over").unwrap();

        assert!(KeyManager::new(&f.source, &f.work).preflight().is_ok());
    }

    #[test]
    fn test_source_inside_work_dir_is_never_reused() {
        let f = fixture();
        let manager = KeyManager::new(&f.source, f.source.parent().unwrap());

        assert!(matches!(manager.preflight(), Err(KeyError::SourceInWorkDir(_))));
        assert!(matches!(manager.ensure_key(), Err(KeyError::SourceInWorkDir(_))));
        assert_eq!(fs::read(&f.source).unwrap(), b"secret key");
    }

    #[test]
    fn test_source_reached_through_other_path_is_never_reused() {
        let f = fixture();
        let keygen = f.source.parent().unwrap();
        let manager = KeyManager::new(&f.source, keygen.join("..").join("keygen"));

        assert!(matches!(manager.ensure_key(), Err(KeyError::SourceInWorkDir(_))));
        assert!(f.source.exists());
    }

    #[test]
    fn test_drop_removes_key() {
        let f = fixture();
        let manager = KeyManager::new(&f.source, &f.work);
        {
            let _key = manager.ensure_key().unwrap();
            assert!(f.work.join("ecc256.der").exists());
        }
        assert!(!f.work.join("ecc256.der").exists());
    }

    #[test]
    fn test_panic_while_holding_key() {
        let f = fixture();
        let manager = KeyManager::new(&f.source, &f.work);

        let result = std::panic::catch_unwind(|| {
            let _key = manager.ensure_key().unwrap();
            panic!("signer crashed");
        });

        assert!(result.is_err());
        assert!(!f.work.join("ecc256.der").exists());
    }

    #[test]
    fn test_release_when_already_removed() {
        let f = fixture();
        let key = KeyManager::new(&f.source, &f.work).ensure_key().unwrap();
        fs::remove_file(key.path()).unwrap();

        assert_eq!(key.release(), KeyRelease::AlreadyAbsent);
    }

    #[test]
    fn test_release_reports_residue() {
        let f = fixture();
        let key = KeyManager::new(&f.source, &f.work).ensure_key().unwrap();
        fs::remove_file(key.path()).unwrap();
        // A directory in its place cannot be removed with remove_file.
        fs::create_dir(key.path()).unwrap();

        let release = key.release();
        assert!(release.is_residue());
        assert!(f.work.join("ecc256.der").exists());
    }

    #[test]
    fn test_signal_registration_follows_key() {
        let f = fixture();
        let signals = Arc::new(SignalState::new());
        let manager = KeyManager::new(&f.source, &f.work).with_signal_state(Arc::clone(&signals));

        let key = manager.ensure_key().unwrap();
        assert_eq!(signals.registered_keys(), vec![f.work.join("ecc256.der")]);

        key.release();
        assert!(signals.registered_keys().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let key = KeyManager::new(&f.source, &f.work).ensure_key().unwrap();
        let mode = fs::metadata(key.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
