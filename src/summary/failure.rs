//! Failure taxonomy and stable exit codes

use serde::{Deserialize, Serialize};

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Every image converted and signed, key retired
    Success,
    /// At least one item failed or the key was left behind
    Failed,
}

/// Failure kind - categorizes a per-item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The converter exited non-zero or could not run
    ConversionFailed,
    /// The signer exited non-zero or could not run
    SigningFailed,
    /// The signing key is still on disk after the run
    KeyResidue,
}

impl FailureKind {
    /// Get the stable exit code for this failure kind
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FailureKind::ConversionFailed => ExitCode::ConversionFailed,
            FailureKind::SigningFailed => ExitCode::SigningFailed,
            FailureKind::KeyResidue => ExitCode::KeyResidue,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::ConversionFailed => "Conversion failed",
            FailureKind::SigningFailed => "Signing failed",
            FailureKind::KeyResidue => "Signing key left on disk",
        }
    }
}

/// Stable process exit codes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful execution
    #[default]
    Success = 0,
    /// Configuration or catalog invalid
    Config = 1,
    /// Build output directory missing
    BuildDirMissing = 10,
    /// Key source missing
    KeySourceMissing = 20,
    /// One or more conversions failed
    ConversionFailed = 30,
    /// One or more signatures failed
    SigningFailed = 40,
    /// Signing key could not be removed
    KeyResidue = 50,
    /// Interrupted by SIGINT/SIGTERM
    Interrupted = 130,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Create from integer value
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::Config),
            10 => Some(ExitCode::BuildDirMissing),
            20 => Some(ExitCode::KeySourceMissing),
            30 => Some(ExitCode::ConversionFailed),
            40 => Some(ExitCode::SigningFailed),
            50 => Some(ExitCode::KeyResidue),
            130 => Some(ExitCode::Interrupted),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// Aggregates failure kinds into one exit code.
///
/// Key residue wins over everything else; otherwise the first failure in
/// pipeline order decides.
#[derive(Debug, Default)]
pub struct ExitCodeAggregator {
    has_residue: bool,
    first_failure_code: Option<ExitCode>,
}

impl ExitCodeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::KeyResidue => self.has_residue = true,
            _ => {
                if self.first_failure_code.is_none() {
                    self.first_failure_code = Some(kind.exit_code());
                }
            }
        }
    }

    pub fn status(&self) -> Status {
        if self.has_residue || self.first_failure_code.is_some() {
            Status::Failed
        } else {
            Status::Success
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.has_residue {
            ExitCode::KeyResidue
        } else {
            self.first_failure_code.unwrap_or(ExitCode::Success)
        }
    }
}
