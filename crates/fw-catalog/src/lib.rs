//! Firmware catalog for OTA release preparation.
//!
//! The catalog is the single table that decides, for every build artifact
//! name, which board it belongs to, which slot (boot or update) it fills and
//! which version tag the signer embeds. It is validated once at construction
//! and is read-only afterwards.

pub mod builtin;
mod slot;

pub use slot::Slot;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extension of every converted board image.
pub const IMAGE_EXTENSION: &str = "bin";

/// One row of the catalog: a build artifact name and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Linked executable name as produced by the build
    #[serde(alias = "artifact")]
    pub artifact_name: String,

    /// Canonical board identifier (prefix of the output file name)
    #[serde(alias = "board")]
    pub board_id: String,

    /// Slot the image is signed for
    pub slot: Slot,

    /// Version tag embedded by the signer
    pub version: u32,

    /// Strip symbol and debug information during conversion
    #[serde(default)]
    pub strip: bool,
}

impl CatalogEntry {
    pub fn new(
        artifact_name: impl Into<String>,
        board_id: impl Into<String>,
        slot: Slot,
        version: u32,
    ) -> Self {
        Self {
            artifact_name: artifact_name.into(),
            board_id: board_id.into(),
            slot,
            version,
            strip: false,
        }
    }

    /// Request symbol stripping for this entry.
    pub fn stripped(mut self) -> Self {
        self.strip = true;
        self
    }

    /// Canonical output file name for this entry's board and slot.
    pub fn file_name(&self) -> String {
        canonical_file_name(&self.board_id, self.slot)
    }
}

/// A resolved `(board, slot)` pair with its canonical output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
    pub board_id: String,
    pub slot: Slot,
    pub version: u32,
    pub strip: bool,
}

impl ImageTarget {
    pub fn file_name(&self) -> String {
        canonical_file_name(&self.board_id, self.slot)
    }
}

/// `<board>_bootfw.bin` or `<board>_updtfw.bin`.
pub fn canonical_file_name(board_id: &str, slot: Slot) -> String {
    format!("{}_{}.{}", board_id, slot.file_suffix(), IMAGE_EXTENSION)
}

/// Errors raised while validating a catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog is empty")]
    Empty,

    #[error("duplicate artifact name: '{0}'")]
    DuplicateArtifact(String),

    #[error("artifact '{artifact}': invalid board id '{board_id}'")]
    InvalidBoardId { artifact: String, board_id: String },

    #[error("catalog entry has an empty artifact name")]
    EmptyArtifactName,

    #[error("{board_id} {slot}: conflicting versions {existing} and {conflicting} (artifact '{artifact}')")]
    ConflictingVersion {
        board_id: String,
        slot: Slot,
        existing: u32,
        conflicting: u32,
        artifact: String,
    },

    #[error("{board_id} {slot}: artifact '{artifact}' disagrees on symbol stripping")]
    ConflictingStrip {
        board_id: String,
        slot: Slot,
        artifact: String,
    },

    #[error("{board_id}: boot and update images share version {version}")]
    SlotVersionClash { board_id: String, version: u32 },
}

/// Validated, immutable firmware catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// artifact name -> entry
    entries: BTreeMap<String, CatalogEntry>,
    /// canonical file name -> target
    targets: BTreeMap<String, ImageTarget>,
}

impl Catalog {
    /// Build a catalog from table rows, rejecting any inconsistency.
    pub fn new(rows: impl IntoIterator<Item = CatalogEntry>) -> Result<Self, CatalogError> {
        let mut entries = BTreeMap::new();
        let mut targets: BTreeMap<String, ImageTarget> = BTreeMap::new();

        for entry in rows {
            if entry.artifact_name.is_empty() {
                return Err(CatalogError::EmptyArtifactName);
            }
            if !is_valid_board_id(&entry.board_id) {
                return Err(CatalogError::InvalidBoardId {
                    artifact: entry.artifact_name.clone(),
                    board_id: entry.board_id.clone(),
                });
            }

            if entries.contains_key(&entry.artifact_name) {
                return Err(CatalogError::DuplicateArtifact(entry.artifact_name));
            }

            let file_name = entry.file_name();
            match targets.get(&file_name) {
                Some(existing) if existing.version != entry.version => {
                    return Err(CatalogError::ConflictingVersion {
                        board_id: entry.board_id.clone(),
                        slot: entry.slot,
                        existing: existing.version,
                        conflicting: entry.version,
                        artifact: entry.artifact_name.clone(),
                    });
                }
                Some(existing) if existing.strip != entry.strip => {
                    return Err(CatalogError::ConflictingStrip {
                        board_id: entry.board_id.clone(),
                        slot: entry.slot,
                        artifact: entry.artifact_name.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    targets.insert(
                        file_name,
                        ImageTarget {
                            board_id: entry.board_id.clone(),
                            slot: entry.slot,
                            version: entry.version,
                            strip: entry.strip,
                        },
                    );
                }
            }

            entries.insert(entry.artifact_name.clone(), entry);
        }

        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        let catalog = Self { entries, targets };
        catalog.check_slot_versions()?;
        Ok(catalog)
    }

    /// The release table shipped with the tool.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::new(builtin::entries())
    }

    /// Look up a build artifact by exact name.
    pub fn resolve(&self, artifact_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(artifact_name)
    }

    /// Reverse lookup: canonical image file name to its target.
    pub fn resolve_image(&self, file_name: &str) -> Option<&ImageTarget> {
        self.targets.get(file_name)
    }

    /// Target for a board and slot, if the catalog has one.
    pub fn target(&self, board_id: &str, slot: Slot) -> Option<&ImageTarget> {
        self.targets.get(&canonical_file_name(board_id, slot))
    }

    /// Whether `file_name` is a canonical board image name.
    pub fn is_canonical(&self, file_name: &str) -> bool {
        self.targets.contains_key(file_name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn targets(&self) -> impl Iterator<Item = &ImageTarget> {
        self.targets.values()
    }

    /// Distinct board identifiers.
    pub fn boards(&self) -> BTreeSet<&str> {
        self.targets.values().map(|t| t.board_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_slot_versions(&self) -> Result<(), CatalogError> {
        for board in self.boards() {
            if let (Some(boot), Some(update)) = (
                self.target(board, Slot::Boot),
                self.target(board, Slot::Update),
            ) {
                if boot.version == update.version {
                    return Err(CatalogError::SlotVersionClash {
                        board_id: board.to_string(),
                        version: boot.version,
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_valid_board_id(board_id: &str) -> bool {
    !board_id.is_empty()
        && board_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
