//! Run report and failure taxonomy
//!
//! Implements run_summary.json and the stable exit codes.

mod failure;
mod run_report;

pub use failure::{ExitCode, ExitCodeAggregator, FailureKind, Status};
pub use run_report::{
    ConversionRecord, ConversionStatus, FailureRecord, RunReport, RUN_SUMMARY_FILE,
    RUN_SUMMARY_SCHEMA_ID, RUN_SUMMARY_SCHEMA_VERSION,
};
