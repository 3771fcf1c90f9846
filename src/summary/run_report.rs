//! Run summary (run_summary.json)

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::{ExitCode, ExitCodeAggregator, FailureKind, Status};
use crate::cleanup::CleanupReport;
use crate::convert::{BoardImage, ConversionOutcome, ConvertError};
use crate::keys::KeyRelease;
use crate::sign::{SigningOutcome, SigningResult};

/// Schema version for run_summary.json
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for run_summary.json
pub const RUN_SUMMARY_SCHEMA_ID: &str = "fw-release/run_summary@1";

/// File name inside the state directory
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// What happened to one build artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Converted,
    Skipped,
    Ignored,
    Failed,
}

/// Per-artifact conversion record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub artifact: String,
    pub status: ConversionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<BoardImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A failed item, named with its tool exit code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Artifact name, image file name or key path
    pub name: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Run summary (run_summary.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub schema_id: String,

    /// Run identifier (ULID)
    pub run_id: String,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// SHA-256 of the release config, when loaded from a file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,

    pub conversions: Vec<ConversionRecord>,

    pub signings: Vec<SigningResult>,

    pub cleanup: CleanupReport,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_release: Option<KeyRelease>,

    pub status: Status,

    pub exit_code: i32,

    pub failures: Vec<FailureRecord>,

    /// Non-fatal problems (cleanup)
    pub warnings: Vec<String>,

    pub duration_ms: u64,

    pub human_summary: String,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION,
            schema_id: RUN_SUMMARY_SCHEMA_ID.to_string(),
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            config_digest: None,
            conversions: Vec::new(),
            signings: Vec::new(),
            cleanup: CleanupReport::default(),
            key_release: None,
            status: Status::Success,
            exit_code: ExitCode::Success.as_i32(),
            failures: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
            human_summary: String::new(),
        }
    }

    pub fn with_config_digest(mut self, digest: Option<String>) -> Self {
        self.config_digest = digest;
        self
    }

    pub fn record_conversion(
        &mut self,
        artifact: &str,
        result: &Result<ConversionOutcome, ConvertError>,
    ) {
        let (status, image) = match result {
            Ok(ConversionOutcome::Converted(image)) => {
                (ConversionStatus::Converted, Some(image.clone()))
            }
            Ok(ConversionOutcome::Skipped(image)) => {
                (ConversionStatus::Skipped, Some(image.clone()))
            }
            Ok(ConversionOutcome::Ignored) => (ConversionStatus::Ignored, None),
            Err(_) => (ConversionStatus::Failed, None),
        };

        self.conversions.push(ConversionRecord {
            artifact: artifact.to_string(),
            status,
            image,
            exit_code: result.as_ref().err().and_then(ConvertError::exit_code),
            error: result.as_ref().err().map(ToString::to_string),
        });
    }

    /// Record signing results and mark the matching converted images signed
    pub fn record_signings(&mut self, results: Vec<SigningResult>) {
        for result in results.iter().filter(|r| !r.is_failure()) {
            let image = self
                .conversions
                .iter_mut()
                .filter_map(|c| c.image.as_mut())
                .find(|image| image.path == result.image);
            if let Some(image) = image {
                image.mark_signed();
            }
        }
        self.signings.extend(results);
    }

    pub fn record_cleanup(&mut self, report: CleanupReport) {
        self.cleanup.merge(report);
    }

    pub fn record_key_release(&mut self, release: KeyRelease) {
        self.key_release = Some(release);
    }

    /// Compute failures, status and exit code; stamp the finish time
    pub fn finish(&mut self) {
        let mut failures = Vec::new();

        for record in &self.conversions {
            if record.status == ConversionStatus::Failed {
                failures.push(FailureRecord {
                    kind: FailureKind::ConversionFailed,
                    name: record.artifact.clone(),
                    exit_code: record.exit_code,
                    message: record.error.clone().unwrap_or_default(),
                });
            }
        }

        for result in &self.signings {
            if let SigningOutcome::Failed { exit_code, message } = &result.outcome {
                failures.push(FailureRecord {
                    kind: FailureKind::SigningFailed,
                    name: result.file_name(),
                    exit_code: *exit_code,
                    message: message.clone(),
                });
            }
        }

        if let Some(KeyRelease::Residue { path, error }) = &self.key_release {
            failures.push(FailureRecord {
                kind: FailureKind::KeyResidue,
                name: path.display().to_string(),
                exit_code: None,
                message: error.clone(),
            });
        }

        let mut aggregator = ExitCodeAggregator::new();
        for failure in &failures {
            aggregator.add(failure.kind);
        }

        self.warnings = self
            .cleanup
            .failures
            .iter()
            .map(|f| format!("CleanupFailed: {}: {}", f.path.display(), f.error))
            .collect();

        let finished_at = Utc::now();
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(finished_at);
        self.failures = failures;
        self.status = aggregator.status();
        self.exit_code = aggregator.exit_code().as_i32();
        self.human_summary = self.generate_human_summary();
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Get the exit code as ExitCode enum
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from_i32(self.exit_code).unwrap_or(ExitCode::Success)
    }

    pub fn count_conversions(&self, status: ConversionStatus) -> usize {
        self.conversions.iter().filter(|c| c.status == status).count()
    }

    pub fn count_signed(&self) -> usize {
        self.signings
            .iter()
            .filter(|s| s.outcome == SigningOutcome::Signed)
            .count()
    }

    fn generate_human_summary(&self) -> String {
        let converted = self.count_conversions(ConversionStatus::Converted);
        let skipped = self.count_conversions(ConversionStatus::Skipped);
        let signed = self.count_signed();
        let already = self.signings.len() - signed - self.count_signing_failures();

        let mut summary = match self.status {
            Status::Success => format!(
                "Release succeeded: {} converted, {} already converted, {} signed, {} already signed",
                converted, skipped, signed, already
            ),
            Status::Failed => format!(
                "Release failed: {} failure(s); {} converted, {} signed",
                self.failures.len(),
                converted,
                signed
            ),
        };

        for failure in &self.failures {
            let code = match failure.exit_code {
                Some(code) => code.to_string(),
                None => "-".to_string(),
            };
            summary.push_str(&format!(
                "\n  {}: {} (exit code {})",
                failure.kind.description(),
                failure.name,
                code
            ));
        }
        summary
    }

    fn count_signing_failures(&self) -> usize {
        self.signings.iter().filter(|s| s.is_failure()).count()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to file (temp file, then rename)
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)
    }

    /// Load from file
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use fw_catalog::Slot;
    use tempfile::TempDir;

    fn signing(name: &str, version: u32, outcome: SigningOutcome) -> SigningResult {
        SigningResult {
            image: PathBuf::from("/w").join(name),
            board_id: "boardA".to_string(),
            slot: Slot::Boot,
            version,
            outcome,
        }
    }

    fn converted(name: &str) -> Result<ConversionOutcome, ConvertError> {
        Ok(ConversionOutcome::Converted(BoardImage {
            board_id: "boardA".to_string(),
            slot: Slot::Boot,
            path: PathBuf::from("/w").join(name),
            converted: true,
            signed: false,
        }))
    }

    #[test]
    fn test_all_success() {
        let mut report = RunReport::new("01TEST");
        report.record_conversion("A_bootfw", &converted("boardA_bootfw.bin"));
        report.record_conversion("junk_file", &Ok(ConversionOutcome::Ignored));
        report.record_signings(vec![signing("boardA_bootfw.bin", 1234, SigningOutcome::Signed)]);
        report.record_key_release(KeyRelease::Removed);
        report.finish();

        assert!(report.is_success());
        assert_eq!(report.exit_code(), ExitCode::Success);
        assert!(report.failures.is_empty());
        assert_eq!(report.count_conversions(ConversionStatus::Ignored), 1);
        assert!(report.human_summary.starts_with("Release succeeded"));
    }

    #[test]
    fn test_signing_marks_converted_images() {
        let mut report = RunReport::new("01TEST");
        report.record_conversion("A_bootfw", &converted("boardA_bootfw.bin"));
        report.record_conversion("A_updtfw", &converted("boardA_updtfw.bin"));
        report.record_signings(vec![
            signing("boardA_bootfw.bin", 1234, SigningOutcome::Signed),
            signing(
                "boardA_updtfw.bin",
                1235,
                SigningOutcome::Failed {
                    exit_code: Some(1),
                    message: String::new(),
                },
            ),
        ]);

        let signed: Vec<bool> = report
            .conversions
            .iter()
            .map(|c| c.image.as_ref().unwrap().signed)
            .collect();
        assert_eq!(signed, vec![true, false]);
    }

    #[test]
    fn test_conversion_failure_named_with_exit_code() {
        let mut report = RunReport::new("01TEST");
        report.record_conversion(
            "A_updtfw",
            &Err(ConvertError::ConversionFailed {
                artifact: "A_updtfw".to_string(),
                exit_code: Some(2),
            }),
        );
        report.record_signings(vec![signing(
            "boardA_bootfw.bin",
            1234,
            SigningOutcome::Failed {
                exit_code: Some(4),
                message: String::new(),
            },
        )]);
        report.finish();

        assert_eq!(report.exit_code(), ExitCode::ConversionFailed);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].name, "A_updtfw");
        assert_eq!(report.failures[0].exit_code, Some(2));
        assert_eq!(report.failures[1].name, "boardA_bootfw.bin");
        assert!(report.human_summary.contains("A_updtfw (exit code 2)"));
    }

    #[test]
    fn test_key_residue_fails_run() {
        let mut report = RunReport::new("01TEST");
        report.record_key_release(KeyRelease::Residue {
            path: PathBuf::from("/w/ecc256.der"),
            error: "permission denied".to_string(),
        });
        report.finish();

        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.exit_code(), ExitCode::KeyResidue);
    }

    #[test]
    fn test_cleanup_failure_is_warning() {
        let mut report = RunReport::new("01TEST");
        report.record_cleanup(CleanupReport {
            failures: vec![crate::cleanup::CleanupFailure {
                path: PathBuf::from("/w/A_bootfw"),
                error: "busy".to_string(),
            }],
            ..Default::default()
        });
        report.finish();

        assert!(report.is_success());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_write_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join(RUN_SUMMARY_FILE);

        let mut report = RunReport::new("01TEST").with_config_digest(Some("abc".to_string()));
        report.finish();
        report.write_to_file(&path).unwrap();

        let loaded = RunReport::from_file(&path).unwrap();
        assert_eq!(loaded.run_id, "01TEST");
        assert_eq!(loaded.schema_id, RUN_SUMMARY_SCHEMA_ID);
        assert_eq!(loaded.config_digest.as_deref(), Some("abc"));
    }
}
