//! Failure injection for the mock tools
//!
//! Failures are keyed by input file name, so a test can make one image in a
//! batch fail while the others succeed.

use std::collections::HashMap;

/// What a mock tool does instead of succeeding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Exit with this code, producing no output
    Exit(i32),
    /// Terminated by a signal (no exit code)
    Killed,
    /// Panic inside the tool call
    Panic,
}

/// Failure configuration for one file name
#[derive(Debug, Clone)]
pub struct FailureConfig {
    pub failure: InjectedFailure,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    pub fn new(failure: InjectedFailure) -> Self {
        Self {
            failure,
            fail_count: None,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

/// Per-file failure injector
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<String, FailureConfig>,
    call_counts: HashMap<String, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, file_name: impl Into<String>, config: FailureConfig) {
        let file_name = file_name.into();
        self.call_counts.insert(file_name.clone(), 0);
        self.configs.insert(file_name, config);
    }

    /// Failure to apply to this call for `file_name`, if any
    pub fn check(&mut self, file_name: &str) -> Option<InjectedFailure> {
        let config = self.configs.get(file_name)?;
        let count = self.call_counts.entry(file_name.to_string()).or_insert(0);
        *count += 1;

        match config.fail_count {
            Some(limit) if *count > limit => None,
            _ => Some(config.failure.clone()),
        }
    }
}
