//! Signing ledger (signed.json)
//!
//! Images are signed in place, so the file name alone does not show whether
//! an image has already been signed. The ledger records, per canonical file
//! name, the version and the SHA-256 of the bytes the signer left behind. An
//! image whose digest and version still match its entry is not signed again;
//! a reconverted image has a different digest and is.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Schema version for signed.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "fw-release/signed@1";

/// Ledger file name inside the state directory
pub const LEDGER_FILE: &str = "signed.json";

/// Errors for ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported ledger schema version {0}")]
    SchemaVersion(u32),
}

/// One signed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Version tag passed to the signer
    pub version: u32,
    /// SHA-256 of the signed image (hex)
    pub sha256: String,
    /// When the signature was recorded
    pub signed_at: DateTime<Utc>,
}

/// Record of images signed in one working directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningLedger {
    pub schema_version: u32,
    pub schema_id: String,
    /// Entries keyed by canonical file name
    pub images: BTreeMap<String, LedgerEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl SigningLedger {
    /// Empty ledger stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            images: BTreeMap::new(),
            path: path.into(),
        }
    }

    /// Ledger location for a state directory
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(LEDGER_FILE)
    }

    /// Load the ledger, or start an empty one when the file does not exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        let mut ledger: SigningLedger =
            serde_json::from_str(&content).map_err(|source| LedgerError::Json {
                path: path.clone(),
                source,
            })?;
        if ledger.schema_version != SCHEMA_VERSION {
            return Err(LedgerError::SchemaVersion(ledger.schema_version));
        }
        ledger.path = path;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `image` is recorded as signed with `version` and is unchanged since
    pub fn is_signed(&self, image: &Path, version: u32) -> Result<bool, LedgerError> {
        let Some(entry) = file_key(image).and_then(|name| self.images.get(name)) else {
            return Ok(false);
        };
        if entry.version != version {
            return Ok(false);
        }
        Ok(digest_file(image)? == entry.sha256)
    }

    /// Record `image` as signed and persist the ledger
    pub fn record(&mut self, image: &Path, version: u32) -> Result<(), LedgerError> {
        let Some(name) = file_key(image) else {
            return Ok(());
        };
        let entry = LedgerEntry {
            version,
            sha256: digest_file(image)?,
            signed_at: Utc::now(),
        };
        self.images.insert(name.to_string(), entry);
        self.save()
    }

    /// Write atomically (temp file, then rename)
    pub fn save(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| LedgerError::Json {
            path: self.path.clone(),
            source,
        })?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(|source| LedgerError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn file_key(image: &Path) -> Option<&str> {
    image.file_name().and_then(|n| n.to_str())
}

/// SHA-256 of a file, hex encoded
pub fn digest_file(path: &Path) -> Result<String, LedgerError> {
    let bytes = fs::read(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
