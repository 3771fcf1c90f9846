//! External tool invocation
//!
//! Both the converter and the signer are separate programs. They are run
//! with an explicit argument vector (never through a shell) and the pipeline
//! waits for their exit status before moving on.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

/// Lines of stderr kept from a failing tool
const STDERR_TAIL_LINES: usize = 20;

/// Errors launching an external tool
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Completion status of an external tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Tail of the tool's stderr
    pub stderr: String,
}

impl ToolStatus {
    /// Status of a tool that exited with `code`
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A fully specified tool command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Run the tool from `dir` instead of the current directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Run to completion, capturing output.
    pub fn run(&self) -> Result<ToolStatus, ToolError> {
        debug!(command = %self, "running tool");

        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|source| ToolError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let stderr = tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES);
        let status = ToolStatus {
            exit_code: output.status.code(),
            stderr,
        };

        if !status.success() {
            warn!(
                command = %self,
                exit_code = ?status.exit_code,
                stderr = %status.stderr,
                "tool failed"
            );
        }

        Ok(status)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}
