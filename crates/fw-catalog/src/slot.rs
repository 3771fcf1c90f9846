//! Image slots of the dual-bank update scheme.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of a firmware image within the dual-bank update scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Initial image flashed into the boot partition
    Boot,
    /// Image staged in the update partition for a running device
    Update,
}

impl Slot {
    /// All slots, in flashing order.
    pub const ALL: [Slot; 2] = [Slot::Boot, Slot::Update];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Boot => "boot",
            Slot::Update => "update",
        }
    }

    /// Suffix used in canonical image file names (`<board>_<suffix>.bin`).
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Slot::Boot => "bootfw",
            Slot::Update => "updtfw",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boot" | "bootfw" => Ok(Slot::Boot),
            "update" | "updt" | "updtfw" => Ok(Slot::Update),
            other => Err(format!("unknown slot '{}' (expected boot or update)", other)),
        }
    }
}
