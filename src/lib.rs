//! fw-release - OTA firmware release preparation
//!
//! Converts linked firmware executables into raw board images, signs each
//! image with the version of its slot, and guarantees that the signing key
//! never outlives a run.

pub mod cleanup;
pub mod config;
pub mod convert;
pub mod keys;
pub mod ledger;
pub mod locator;
pub mod mock;
pub mod pipeline;
pub mod sign;
pub mod signal;
pub mod summary;
pub mod tool;

pub use config::{ConfigError, ReleaseConfig};
pub use fw_catalog::{Catalog, CatalogEntry, CatalogError, ImageTarget, Slot};
pub use pipeline::{Pipeline, PipelineError};
