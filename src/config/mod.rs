//! Release configuration
//!
//! A release is described by a `release.toml` file:
//!
//! ```toml
//! [paths]
//! build_dir = "../../target/thumbv7em-none-eabihf/release"
//! work_dir = "."
//! key_source = "../keygen/ecc256.der"
//! state_dir = "../../target/fw-release"
//!
//! [convert]
//! program = "rust-objcopy"
//! stage_artifacts = false
//!
//! [sign]
//! program = "python3"
//! args = ["sign.py"]
//!
//! [[firmware]]
//! artifact = "nrf52840_bootfw"
//! board = "nrf52840"
//! slot = "boot"
//! version = 1234
//! ```
//!
//! Every section is optional. Without `[[firmware]]` rows the built-in
//! release table is used. Relative paths resolve against the directory of
//! the config file.

mod defaults;

pub use defaults::BuiltinDefaults;

use std::fs;
use std::path::{Component, Path, PathBuf};

use fw_catalog::{Catalog, CatalogEntry, CatalogError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default config file name looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "release.toml";

/// Errors from loading or validating the release configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file {} is not valid UTF-8: {source}", .path.display())]
    Encoding {
        path: PathBuf,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("invalid firmware catalog: {0}")]
    Catalog(#[from] CatalogError),
}

/// Directory layout of a release run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub build_dir: PathBuf,
    pub work_dir: PathBuf,
    pub key_source: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            build_dir: PathBuf::from(defaults.build_dir),
            work_dir: PathBuf::from(defaults.work_dir),
            key_source: PathBuf::from(defaults.key_source),
            state_dir: PathBuf::from(defaults.state_dir),
        }
    }
}

/// Conversion tool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    pub program: String,
    pub input_format: String,
    pub output_format: String,
    pub strip_flag: String,
    /// Copy each artifact into the working directory before converting it
    pub stage_artifacts: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            program: defaults.convert_program,
            input_format: defaults.input_format,
            output_format: defaults.output_format,
            strip_flag: defaults.strip_flag,
            stage_artifacts: false,
        }
    }
}

/// Signer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignConfig {
    pub program: String,
    pub args: Vec<String>,
    pub algorithm: String,
    pub hash: String,
}

impl Default for SignConfig {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            program: defaults.sign_program,
            args: defaults.sign_args,
            algorithm: defaults.algorithm,
            hash: defaults.hash,
        }
    }
}

/// Complete release configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub paths: PathsConfig,
    pub convert: ConvertConfig,
    pub sign: SignConfig,

    /// Catalog rows; empty means the built-in release table
    pub firmware: Vec<CatalogEntry>,

    /// SHA-256 of the raw config file, when loaded from disk
    #[serde(skip)]
    pub digest: Option<String>,
}

impl ReleaseConfig {
    /// Load from an explicit path, or from `release.toml` in the current
    /// directory, falling back to built-in defaults when neither exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    let config = Self::default();
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    /// Load and validate a config file, resolving relative paths against
    /// the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let raw = fs::read(path)?;
        let content = std::str::from_utf8(&raw).map_err(|source| ConfigError::Encoding {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ReleaseConfig = toml::from_str(content)?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_relative(base);
        config.validate()?;
        config.digest = Some(hex::encode(Sha256::digest(&raw)));

        Ok(config)
    }

    /// Parse and validate config from a TOML string (paths left as written)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ReleaseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Anchor relative paths at `base`
    pub fn resolve_relative(&mut self, base: &Path) {
        let paths = &mut self.paths;
        for path in [
            &mut paths.build_dir,
            &mut paths.work_dir,
            &mut paths.key_source,
            &mut paths.state_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// The catalog for this release
    pub fn catalog(&self) -> Result<Catalog, ConfigError> {
        if self.firmware.is_empty() {
            Ok(Catalog::builtin()?)
        } else {
            Ok(Catalog::new(self.firmware.iter().cloned())?)
        }
    }

    /// File name the key takes inside the working directory
    pub fn key_file_name(&self) -> Result<&str, ConfigError> {
        self.paths
            .key_source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("paths.key_source", "must name a file"))
    }

    /// Check the configuration for values a run cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("convert.program", &self.convert.program),
            ("convert.input_format", &self.convert.input_format),
            ("convert.output_format", &self.convert.output_format),
            ("sign.program", &self.sign.program),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }

        if self.paths.build_dir == self.paths.work_dir {
            return Err(invalid(
                "paths.work_dir",
                "must differ from paths.build_dir",
            ));
        }

        self.key_file_name()?;

        // The key is copied to and deleted from work_dir; the source must live elsewhere.
        let key_dir = parent_dir(&self.paths.key_source);
        if same_dir(key_dir, &self.paths.work_dir) {
            return Err(invalid(
                "paths.key_source",
                "must not be inside paths.work_dir",
            ));
        }

        if !self.firmware.is_empty() {
            Catalog::new(self.firmware.iter().cloned())?;
        }

        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Whether two directory paths name the same directory
fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => lexical(a).eq(lexical(b)),
    }
}

fn lexical(path: &Path) -> impl Iterator<Item = Component<'_>> {
    path.components().filter(|c| !matches!(c, Component::CurDir))
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
