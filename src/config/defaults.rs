//! Built-in defaults
//!
//! Values match the layout of the signing directory in the firmware tree:
//! the tool runs from `boards/rbSigner/signed_images`, reads ELF files from
//! the thumbv7em release directory and the key from the sibling `keygen`
//! directory.

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Directory holding the linked executables
    pub build_dir: String,

    /// Staging directory for converted and signed images
    pub work_dir: String,

    /// Key file copied into the working directory for signing
    pub key_source: String,

    /// Directory for the signing ledger and run summaries
    pub state_dir: String,

    /// Conversion tool
    pub convert_program: String,

    /// Input object format passed with `-I`
    pub input_format: String,

    /// Output format passed with `-O`
    pub output_format: String,

    /// Flag added for entries that request stripping
    pub strip_flag: String,

    /// Signer program
    pub sign_program: String,

    /// Leading signer arguments (script path)
    pub sign_args: Vec<String>,

    /// Signature algorithm flag
    pub algorithm: String,

    /// Hash algorithm flag
    pub hash: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            build_dir: "../../target/thumbv7em-none-eabihf/release".to_string(),
            work_dir: ".".to_string(),
            key_source: "../keygen/ecc256.der".to_string(),
            state_dir: "../../target/fw-release".to_string(),
            convert_program: "rust-objcopy".to_string(),
            input_format: "elf32-littlearm".to_string(),
            output_format: "binary".to_string(),
            strip_flag: "--strip-all".to_string(),
            sign_program: "python3".to_string(),
            sign_args: vec!["sign.py".to_string()],
            algorithm: "--ecc256".to_string(),
            hash: "--sha256".to_string(),
        }
    }
}
