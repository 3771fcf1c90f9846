//! Signing of converted board images
//!
//! Every canonical image in the working directory is handed to the signer
//! with the version its slot carries. The signer modifies the image in
//! place. A failing image does not stop the batch; its exit code is
//! recorded and the remaining images are still attempted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fw_catalog::{Catalog, Slot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SignConfig;
use crate::keys::SigningKey;
use crate::ledger::SigningLedger;
use crate::tool::{ToolError, ToolInvocation, ToolStatus};

/// Batch-level signing errors
#[derive(Debug, Error)]
pub enum SignError {
    #[error("cannot read working directory {}: {source}", .path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Inputs for one signer invocation
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    pub image: &'a Path,
    pub key: &'a Path,
    pub version: u32,
}

/// External image signer
pub trait SigningTool {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<ToolStatus, ToolError>;
}

/// Signer run as a command, e.g. `python3 sign.py --ecc256 --sha256 <image> <key> <version>`
///
/// The command runs from the image's directory and receives the image and
/// key by file name, which is where the signing script expects them.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    config: SignConfig,
}

impl CommandSigner {
    pub fn new(config: SignConfig) -> Self {
        Self { config }
    }

    pub fn invocation(&self, request: &SigningRequest<'_>) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(&self.config.program).args(&self.config.args);
        for flag in [&self.config.algorithm, &self.config.hash] {
            if !flag.is_empty() {
                invocation = invocation.arg(flag);
            }
        }

        let invocation = invocation
            .arg(request.image.file_name().unwrap_or(request.image.as_os_str()))
            .arg(request.key.file_name().unwrap_or(request.key.as_os_str()))
            .arg(request.version.to_string());

        match request.image.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => invocation.current_dir(dir),
            None => invocation,
        }
    }
}

impl SigningTool for CommandSigner {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<ToolStatus, ToolError> {
        self.invocation(request).run()
    }
}

/// What happened to one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SigningOutcome {
    /// The signer accepted the image
    Signed,
    /// The ledger shows the image already signed with this version
    AlreadySigned,
    /// The signer failed or could not run
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

/// Per-image signing result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningResult {
    pub image: PathBuf,
    pub board_id: String,
    pub slot: Slot,
    pub version: u32,
    pub outcome: SigningOutcome,
}

impl SigningResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, SigningOutcome::Failed { .. })
    }

    /// File name of the image
    pub fn file_name(&self) -> String {
        self.image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Signs every canonical image in a working directory
pub struct SigningOrchestrator<'a> {
    catalog: &'a Catalog,
    tool: &'a dyn SigningTool,
    ledger: Option<&'a mut SigningLedger>,
}

impl<'a> SigningOrchestrator<'a> {
    pub fn new(catalog: &'a Catalog, tool: &'a dyn SigningTool) -> Self {
        Self {
            catalog,
            tool,
            ledger: None,
        }
    }

    /// Skip images the ledger already records, and record new signatures
    pub fn with_ledger(mut self, ledger: &'a mut SigningLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Canonical images in `work_dir`, sorted by file name
    pub fn pending_images(&self, work_dir: &Path) -> Result<Vec<PathBuf>, SignError> {
        let read_error = |source: io::Error| SignError::WorkDir {
            path: work_dir.to_path_buf(),
            source,
        };

        let mut images = Vec::new();
        for entry in fs::read_dir(work_dir).map_err(read_error)? {
            let entry = entry.map_err(read_error)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.catalog.is_canonical(&name) {
                continue;
            }
            if !entry.file_type().map_err(read_error)?.is_file() {
                continue;
            }
            images.push(entry.path());
        }
        images.sort();
        Ok(images)
    }

    /// Sign every canonical image in `work_dir` with `key`
    pub fn sign_all(
        &mut self,
        work_dir: &Path,
        key: &SigningKey,
    ) -> Result<Vec<SigningResult>, SignError> {
        let images = self.pending_images(work_dir)?;
        let mut results = Vec::with_capacity(images.len());

        for image in images {
            if let Some(result) = self.sign_one(&image, key.path()) {
                results.push(result);
            }
        }

        let failed = results.iter().filter(|r| r.is_failure()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "signing finished with failures");
        } else {
            info!(total = results.len(), "signing finished");
        }

        Ok(results)
    }

    fn sign_one(&mut self, image: &Path, key: &Path) -> Option<SigningResult> {
        let file_name = image.file_name()?.to_str()?;
        let target = self.catalog.resolve_image(file_name)?;

        let mut result = SigningResult {
            image: image.to_path_buf(),
            board_id: target.board_id.clone(),
            slot: target.slot,
            version: target.version,
            outcome: SigningOutcome::Signed,
        };

        if let Some(ledger) = self.ledger.as_deref() {
            match ledger.is_signed(image, target.version) {
                Ok(true) => {
                    debug!(image = %file_name, "already signed, skipping");
                    result.outcome = SigningOutcome::AlreadySigned;
                    return Some(result);
                }
                Ok(false) => {}
                Err(e) => warn!(image = %file_name, error = %e, "ledger check failed, signing again"),
            }
        }

        let request = SigningRequest {
            image,
            key,
            version: target.version,
        };

        result.outcome = match self.tool.sign(&request) {
            Ok(status) if status.success() => {
                info!(image = %file_name, version = target.version, "signed");
                // An unrecorded signature would be applied again by the next run.
                match self.ledger.as_deref_mut().map(|l| l.record(image, target.version)) {
                    Some(Err(e)) => {
                        error!(image = %file_name, error = %e, "SigningFailed: signature not recorded in ledger");
                        SigningOutcome::Failed {
                            exit_code: None,
                            message: format!("signed, but ledger not updated: {}", e),
                        }
                    }
                    _ => SigningOutcome::Signed,
                }
            }
            Ok(status) => {
                error!(
                    image = %file_name,
                    exit_code = ?status.exit_code,
                    "SigningFailed"
                );
                SigningOutcome::Failed {
                    exit_code: status.exit_code,
                    message: status.stderr,
                }
            }
            Err(e) => {
                error!(image = %file_name, error = %e, "SigningFailed: signer could not run");
                SigningOutcome::Failed {
                    exit_code: None,
                    message: e.to_string(),
                }
            }
        };

        Some(result)
    }
}
