//! Release table shipped with the tool.
//!
//! Every supported board gets a boot image tagged 1234 and an update image
//! tagged 1235. The rp2040 images are stripped to fit its flash layout.

use crate::{CatalogEntry, Slot};

/// Version tag for boot images.
pub const BOOT_VERSION: u32 = 1234;

/// Version tag for update images.
pub const UPDATE_VERSION: u32 = 1235;

/// Boards with a released boot/update image pair.
pub const BOARDS: &[&str] = &[
    "nrf52840",
    "stm32f411",
    "stm32f446",
    "stm32h723",
    "stm32f746",
    "stm32f334",
    "rp2040",
];

/// Boards whose images are converted with symbols stripped.
const STRIPPED_BOARDS: &[&str] = &["rp2040"];

/// Catalog rows of the built-in release table.
pub fn entries() -> Vec<CatalogEntry> {
    BOARDS
        .iter()
        .flat_map(|board| {
            let strip = STRIPPED_BOARDS.contains(board);
            Slot::ALL.into_iter().map(move |slot| {
                let version = match slot {
                    Slot::Boot => BOOT_VERSION,
                    Slot::Update => UPDATE_VERSION,
                };
                CatalogEntry {
                    artifact_name: format!("{}_{}", board, slot.file_suffix()),
                    board_id: board.to_string(),
                    slot,
                    version,
                    strip,
                }
            })
        })
        .collect()
}
