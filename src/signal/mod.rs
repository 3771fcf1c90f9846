//! Interrupt handling (SIGINT/SIGTERM)
//!
//! A provisioned signing key must not survive the process. Unwinding paths
//! are covered by the key guard's `Drop`; an interrupt never unwinds, so the
//! handler removes every registered key file itself before exiting with
//! code 130.
//!
//! SIGKILL cannot be intercepted. A key left behind that way is reused and
//! then removed by the next run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Exit code for interrupted runs
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// State shared between the pipeline and the interrupt handler
#[derive(Debug, Default)]
pub struct SignalState {
    /// Signals received so far
    signal_count: AtomicU8,
    /// Key files currently provisioned
    key_paths: Mutex<Vec<PathBuf>>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an interrupt has been received
    pub fn is_interrupted(&self) -> bool {
        self.signal_count() > 0
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Register a key file for removal on interrupt
    pub fn register_key(&self, path: &Path) {
        if let Ok(mut keys) = self.key_paths.lock() {
            if !keys.iter().any(|p| p == path) {
                keys.push(path.to_path_buf());
            }
        }
    }

    /// Forget a key file (released normally)
    pub fn unregister_key(&self, path: &Path) {
        if let Ok(mut keys) = self.key_paths.lock() {
            keys.retain(|p| p != path);
        }
    }

    /// Key files currently registered
    pub fn registered_keys(&self) -> Vec<PathBuf> {
        self.key_paths.lock().map(|k| k.clone()).unwrap_or_default()
    }

    /// Handle an interrupt: remove every registered key file.
    ///
    /// Returns the paths that could not be removed.
    pub fn handle_signal(&self) -> Vec<PathBuf> {
        self.signal_count.fetch_add(1, Ordering::SeqCst);

        let keys = match self.key_paths.lock() {
            Ok(mut keys) => std::mem::take(&mut *keys),
            // A panic while holding the lock still leaves the list usable.
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        keys.into_iter()
            .filter(|path| match fs::remove_file(path) {
                Ok(()) => false,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(_) => true,
            })
            .collect()
    }
}

/// Installs the process interrupt handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install handlers for SIGINT and SIGTERM.
    ///
    /// Must be called once at program startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || {
            let residue = state.handle_signal();
            if residue.is_empty() {
                tracing::warn!("interrupted, signing key removed");
            } else {
                for path in &residue {
                    tracing::error!(
                        path = %path.display(),
                        "KeyResidueWarning: signing key could not be removed after interrupt"
                    );
                }
            }
            std::process::exit(EXIT_CODE_INTERRUPTED);
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_signal_state_initial() {
        let state = SignalState::new();
        assert!(!state.is_interrupted());
        assert!(state.registered_keys().is_empty());
    }

    #[test]
    fn test_key_registration() {
        let state = SignalState::new();
        state.register_key(Path::new("/w/ecc256.der"));
        state.register_key(Path::new("/w/ecc256.der"));
        assert_eq!(state.registered_keys().len(), 1);

        state.unregister_key(Path::new("/w/ecc256.der"));
        assert!(state.registered_keys().is_empty());
    }

    #[test]
    fn test_signal_removes_registered_keys() {
        let temp_dir = TempDir::new().unwrap();
        let key = temp_dir.path().join("ecc256.der");
        fs::write(&key, b"key").unwrap();

        let state = SignalState::new();
        state.register_key(&key);
        let residue = state.handle_signal();

        assert!(residue.is_empty());
        assert!(!key.exists());
        assert!(state.is_interrupted());
        assert!(state.registered_keys().is_empty());
    }

    #[test]
    fn test_signal_with_missing_key_is_clean() {
        let temp_dir = TempDir::new().unwrap();
        let state = SignalState::new();
        state.register_key(&temp_dir.path().join("ecc256.der"));

        assert!(state.handle_signal().is_empty());
    }

    #[test]
    fn test_signal_reports_residue() {
        let temp_dir = TempDir::new().unwrap();
        let key = temp_dir.path().join("ecc256.der");
        fs::create_dir(&key).unwrap();

        let state = SignalState::new();
        state.register_key(&key);

        assert_eq!(state.handle_signal(), vec![key]);
    }

    #[test]
    fn test_handler_shares_state() {
        let handler = SignalHandler::new();
        handler.state().register_key(Path::new("/w/key"));
        assert_eq!(handler.state().registered_keys().len(), 1);
    }
}
