//! Release pipeline
//!
//! Control flow of one release run:
//! - Preflight: catalog valid, key obtainable, ledger readable
//! - Scan the build directory and convert every catalog artifact
//! - Provision the key and sign every canonical image
//! - Retire the key and remove staged inputs
//! - Aggregate and persist the run report
//!
//! Conversion and signing failures are per item and do not stop the run.
//! Only a missing build directory, an unobtainable key, an unreadable
//! working directory or an unreadable ledger abort it.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use fw_catalog::{Catalog, ImageTarget};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::cleanup::{cleanup, StagedPaths};
use crate::config::{ConfigError, ReleaseConfig};
use crate::convert::{ConversionTool, ImageConverter, ObjcopyTool};
use crate::keys::{KeyError, KeyManager};
use crate::ledger::{LedgerError, SigningLedger};
use crate::locator::{scan, LocatorError};
use crate::sign::{CommandSigner, SignError, SigningOrchestrator, SigningTool};
use crate::signal::SignalState;
use crate::summary::{ExitCode, RunReport, RUN_SUMMARY_FILE};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Locator(#[from] LocatorError),

    #[error("{0}")]
    Key(#[from] KeyError),

    #[error("{0}")]
    Sign(#[from] SignError),

    #[error("signing ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("cannot prepare working directory {}: {source}", .path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            PipelineError::Config(_) => ExitCode::Config,
            PipelineError::Locator(_) => ExitCode::BuildDirMissing,
            PipelineError::Key(KeyError::SourceInWorkDir(_)) => ExitCode::Config,
            PipelineError::Key(_) => ExitCode::KeySourceMissing,
            PipelineError::Sign(_) => ExitCode::SigningFailed,
            PipelineError::Ledger(_) => ExitCode::Config,
            PipelineError::WorkDir { .. } => ExitCode::Config,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// State of one catalog image in the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCheck {
    pub file_name: String,
    pub board_id: String,
    pub version: u32,
    pub present: bool,
    pub signed: bool,
}

/// Result of inspecting a working directory without changing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub images: Vec<ImageCheck>,
    /// A key file is present in the working directory
    pub key_present: bool,
}

impl VerifyReport {
    /// Present images that the ledger does not show as signed
    pub fn unsigned(&self) -> impl Iterator<Item = &ImageCheck> {
        self.images.iter().filter(|i| i.present && !i.signed)
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.key_present {
            ExitCode::KeyResidue
        } else if self.unsigned().next().is_some() {
            ExitCode::SigningFailed
        } else {
            ExitCode::Success
        }
    }
}

/// One configured release pipeline
pub struct Pipeline {
    config: ReleaseConfig,
    catalog: Catalog,
    converter: Box<dyn ConversionTool>,
    signer: Box<dyn SigningTool>,
    signals: Option<Arc<SignalState>>,
}

impl Pipeline {
    /// Pipeline using the configured external tools
    pub fn new(config: ReleaseConfig) -> PipelineResult<Self> {
        let converter = Box::new(ObjcopyTool::new(config.convert.clone()));
        let signer = Box::new(CommandSigner::new(config.sign.clone()));
        Self::with_tools(config, converter, signer)
    }

    /// Pipeline with explicit tool implementations
    pub fn with_tools(
        config: ReleaseConfig,
        converter: Box<dyn ConversionTool>,
        signer: Box<dyn SigningTool>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let catalog = config.catalog()?;
        Ok(Self {
            config,
            catalog,
            converter,
            signer,
            signals: None,
        })
    }

    /// Register provisioned keys with the interrupt handler
    pub fn with_signal_state(mut self, signals: Arc<SignalState>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn key_manager(&self) -> KeyManager {
        let keys = KeyManager::new(&self.config.paths.key_source, &self.config.paths.work_dir);
        match &self.signals {
            Some(signals) => keys.with_signal_state(Arc::clone(signals)),
            None => keys,
        }
    }

    /// Full release: convert, sign, clean up
    pub fn run(&self) -> PipelineResult<RunReport> {
        let mut ledger = self.preflight()?;
        let mut report = self.new_report();
        let mut staged = StagedPaths::new();

        let result = self
            .convert_all(&mut report, &mut staged)
            .and_then(|()| self.sign_all(&mut report, &mut ledger));

        report.record_cleanup(cleanup(&self.config.paths.work_dir, &staged, &self.catalog));
        result?;

        Ok(self.finish(report))
    }

    /// Conversion only; no key is provisioned
    pub fn convert(&self) -> PipelineResult<RunReport> {
        self.prepare_work_dir()?;
        let mut report = self.new_report();
        let mut staged = StagedPaths::new();

        let result = self.convert_all(&mut report, &mut staged);
        report.record_cleanup(cleanup(&self.config.paths.work_dir, &staged, &self.catalog));
        result?;

        Ok(self.finish(report))
    }

    /// Signing only, over the images already in the working directory
    pub fn sign(&self) -> PipelineResult<RunReport> {
        let mut ledger = self.preflight()?;
        let mut report = self.new_report();
        self.sign_all(&mut report, &mut ledger)?;
        Ok(self.finish(report))
    }

    /// Check which catalog images are present and signed
    pub fn verify(&self) -> PipelineResult<VerifyReport> {
        let ledger = SigningLedger::load(SigningLedger::path_in(&self.config.paths.state_dir))?;

        let mut images = Vec::new();
        for target in self.catalog.targets() {
            images.push(self.check_image(target, &ledger)?);
        }

        Ok(VerifyReport {
            images,
            key_present: self.key_manager().key_path().exists(),
        })
    }

    fn check_image(&self, target: &ImageTarget, ledger: &SigningLedger) -> PipelineResult<ImageCheck> {
        let file_name = target.file_name();
        let path = self.config.paths.work_dir.join(&file_name);
        let present = path.is_file();
        let signed = present && ledger.is_signed(&path, target.version)?;

        Ok(ImageCheck {
            file_name,
            board_id: target.board_id.clone(),
            version: target.version,
            present,
            signed,
        })
    }

    /// Everything that must hold before the first conversion
    fn preflight(&self) -> PipelineResult<SigningLedger> {
        self.prepare_work_dir()?;
        self.key_manager().preflight()?;
        let ledger = SigningLedger::load(SigningLedger::path_in(&self.config.paths.state_dir))?;
        info!(
            catalog_entries = self.catalog.len(),
            boards = self.catalog.boards().len(),
            "preflight passed"
        );
        Ok(ledger)
    }

    fn prepare_work_dir(&self) -> PipelineResult<()> {
        let work_dir = &self.config.paths.work_dir;
        fs::create_dir_all(work_dir).map_err(|source| PipelineError::WorkDir {
            path: work_dir.clone(),
            source,
        })
    }

    fn new_report(&self) -> RunReport {
        let report = RunReport::new(Ulid::new().to_string())
            .with_config_digest(self.config.digest.clone());
        info!(run_id = %report.run_id, "release run started");
        report
    }

    /// Convert every artifact in the build directory
    pub fn convert_all(
        &self,
        report: &mut RunReport,
        staged: &mut StagedPaths,
    ) -> PipelineResult<()> {
        let converter = ImageConverter::new(
            &self.catalog,
            self.converter.as_ref(),
            &self.config.paths.work_dir,
        )
        .with_staging(self.config.convert.stage_artifacts);

        for artifact in scan(&self.config.paths.build_dir)? {
            let artifact = artifact?;
            let result = converter.convert(&artifact, staged);
            if let Err(e) = &result {
                error!(artifact = %artifact.name, exit_code = ?e.exit_code(), "ConversionFailed: {}", e);
            }
            report.record_conversion(&artifact.name, &result);
        }

        Ok(())
    }

    /// Provision the key, sign every canonical image, retire the key
    pub fn sign_all(&self, report: &mut RunReport, ledger: &mut SigningLedger) -> PipelineResult<()> {
        let key = self.key_manager().ensure_key()?;

        let results = SigningOrchestrator::new(&self.catalog, self.signer.as_ref())
            .with_ledger(ledger)
            .sign_all(&self.config.paths.work_dir, &key)?;
        report.record_signings(results);

        report.record_key_release(key.release());
        Ok(())
    }

    fn finish(&self, mut report: RunReport) -> RunReport {
        report.finish();

        let path = self.config.paths.state_dir.join(RUN_SUMMARY_FILE);
        if let Err(e) = report.write_to_file(&path) {
            warn!(path = %path.display(), error = %e, "could not write run summary");
        }

        if report.is_success() {
            info!(run_id = %report.run_id, "{}", report.human_summary);
        } else {
            error!(run_id = %report.run_id, "{}", report.human_summary);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConverter, MockSigner};
    use crate::summary::ConversionStatus;
    use fw_catalog::{CatalogEntry, Slot};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        config: ReleaseConfig,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("build")).unwrap();
        fs::create_dir_all(root.join("keygen")).unwrap();
        fs::write(root.join("keygen").join("ecc256.der"), b"key").unwrap();
        fs::write(root.join("build").join("A_bootfw"), b"boot").unwrap();

        let mut config = ReleaseConfig::default();
        config.paths.build_dir = root.join("build");
        config.paths.work_dir = root.join("work");
        config.paths.key_source = root.join("keygen").join("ecc256.der");
        config.paths.state_dir = root.join("state");
        config.firmware = vec![
            CatalogEntry::new("A_bootfw", "boardA", Slot::Boot, 1234),
            CatalogEntry::new("A_updtfw", "boardA", Slot::Update, 1235),
        ];

        Fixture { _temp: temp, config }
    }

    fn pipeline(config: &ReleaseConfig) -> Pipeline {
        Pipeline::with_tools(
            config.clone(),
            Box::new(MockConverter::new()),
            Box::new(MockSigner::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_run_success_writes_summary() {
        let f = fixture();
        let report = pipeline(&f.config).run().unwrap();

        assert!(report.is_success());
        assert_eq!(report.count_conversions(ConversionStatus::Converted), 1);
        assert_eq!(report.count_signed(), 1);
        assert!(f.config.paths.state_dir.join(RUN_SUMMARY_FILE).exists());
        assert!(!f.config.paths.work_dir.join("ecc256.der").exists());
    }

    #[test]
    fn test_missing_build_dir_is_fatal() {
        let mut f = fixture();
        f.config.paths.build_dir = f.config.paths.build_dir.join("missing");

        let err = pipeline(&f.config).run().unwrap_err();
        assert!(matches!(err, PipelineError::Locator(LocatorError::DirectoryNotFound(_))));
        assert_eq!(err.exit_code(), ExitCode::BuildDirMissing);
        assert!(!f.config.paths.work_dir.join("ecc256.der").exists());
    }

    #[test]
    fn test_missing_key_aborts_before_conversion() {
        let f = fixture();
        fs::remove_file(&f.config.paths.key_source).unwrap();

        let err = pipeline(&f.config).run().unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::KeySourceMissing);
        assert!(!f.config.paths.work_dir.join("boardA_bootfw.bin").exists());
    }

    #[test]
    fn test_convert_only_leaves_no_key() {
        let f = fixture();
        let report = pipeline(&f.config).convert().unwrap();

        assert!(report.signings.is_empty());
        assert!(report.key_release.is_none());
        assert!(f.config.paths.work_dir.join("boardA_bootfw.bin").exists());
        assert!(!f.config.paths.work_dir.join("ecc256.der").exists());
    }

    #[test]
    fn test_verify_after_run() {
        let f = fixture();
        let pipeline = pipeline(&f.config);

        let before = pipeline.verify().unwrap();
        assert!(before.images.iter().all(|i| !i.present));

        pipeline.run().unwrap();
        let after = pipeline.verify().unwrap();
        let boot = after
            .images
            .iter()
            .find(|i| i.file_name == "boardA_bootfw.bin")
            .unwrap();
        assert!(boot.present && boot.signed);
        assert_eq!(after.exit_code(), ExitCode::Success);
    }

    #[test]
    fn test_verify_flags_key_residue() {
        let f = fixture();
        fs::create_dir_all(&f.config.paths.work_dir).unwrap();
        fs::write(f.config.paths.work_dir.join("ecc256.der"), b"key").unwrap();

        let report = pipeline(&f.config).verify().unwrap();
        assert_eq!(report.exit_code(), ExitCode::KeyResidue);
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        let mut f = fixture();
        f.config.firmware.push(CatalogEntry::new("A_bootfw", "boardA", Slot::Boot, 1234));

        let err = Pipeline::with_tools(
            f.config,
            Box::new(MockConverter::new()),
            Box::new(MockSigner::new()),
        )
        .err()
        .unwrap();
        assert_eq!(err.exit_code(), ExitCode::Config);
    }
}
