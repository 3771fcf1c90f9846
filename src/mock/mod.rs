//! In-process stand-ins for the external tools
//!
//! [`MockConverter`] and [`MockSigner`] implement the conversion and signing
//! seams without spawning processes. They record every call and accept
//! injected failures per file name, which lets tests drive the pipeline
//! through its error paths.
//!
//! - The converter writes `BIN:` followed by the input bytes.
//! - The signer appends [`signature_trailer`] for the requested version.

mod failure;

pub use failure::{FailureConfig, FailureInjector, InjectedFailure};

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::convert::{ConversionRequest, ConversionTool};
use crate::sign::{SigningRequest, SigningTool};
use crate::tool::{ToolError, ToolStatus};

/// Prefix the mock converter writes before the input bytes
pub const CONVERTED_PREFIX: &[u8] = b"BIN:";

/// Bytes the mock signer appends to a signed image
pub fn signature_trailer(version: u32) -> Vec<u8> {
    format!("\nSIGNED:v{}", version).into_bytes()
}

/// Version recorded in the last trailer of a mock-signed image
pub fn signed_version(image: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(image);
    let (_, tail) = text.rsplit_once("\nSIGNED:v")?;
    tail.parse().ok()
}

/// One recorded conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCall {
    pub input: PathBuf,
    pub output: PathBuf,
    pub strip: bool,
}

/// One recorded signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningCall {
    pub image: PathBuf,
    pub key: PathBuf,
    pub version: u32,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn injected_status(failure: InjectedFailure, what: &str) -> ToolStatus {
    match failure {
        InjectedFailure::Exit(code) => ToolStatus {
            exit_code: Some(code),
            stderr: format!("injected failure for {}", what),
        },
        InjectedFailure::Killed => ToolStatus {
            exit_code: None,
            stderr: String::new(),
        },
        InjectedFailure::Panic => panic!("injected panic for {}", what),
    }
}

fn spawn_error(program: &str, source: io::Error) -> ToolError {
    ToolError::Spawn {
        program: program.to_string(),
        source,
    }
}

/// Mock ELF to binary converter
#[derive(Debug, Clone, Default)]
pub struct MockConverter {
    calls: Arc<Mutex<Vec<ConversionCall>>>,
    failures: Arc<Mutex<FailureInjector>>,
}

impl MockConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` when converting the artifact named `input_name`
    pub fn fail_on(self, input_name: &str, code: i32) -> Self {
        self.inject(input_name, FailureConfig::new(InjectedFailure::Exit(code)))
    }

    /// Panic when converting the artifact named `input_name`
    pub fn panic_on(self, input_name: &str) -> Self {
        self.inject(input_name, FailureConfig::new(InjectedFailure::Panic))
    }

    pub fn inject(self, input_name: &str, config: FailureConfig) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.inject(input_name, config);
        }
        self
    }

    pub fn calls(&self) -> Vec<ConversionCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

impl ConversionTool for MockConverter {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ToolStatus, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ConversionCall {
                input: request.input.to_path_buf(),
                output: request.output.to_path_buf(),
                strip: request.strip,
            });
        }

        let name = file_name(request.input);
        let failure = self.failures.lock().ok().and_then(|mut f| f.check(&name));
        if let Some(failure) = failure {
            return Ok(injected_status(failure, &name));
        }

        let input = fs::read(request.input).map_err(|e| spawn_error("mock-objcopy", e))?;
        let mut output = CONVERTED_PREFIX.to_vec();
        output.extend_from_slice(&input);
        fs::write(request.output, output).map_err(|e| spawn_error("mock-objcopy", e))?;

        Ok(ToolStatus::exited(0))
    }
}

/// Mock in-place image signer
#[derive(Debug, Clone, Default)]
pub struct MockSigner {
    calls: Arc<Mutex<Vec<SigningCall>>>,
    failures: Arc<Mutex<FailureInjector>>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` when signing the image named `image_name`
    pub fn fail_on(self, image_name: &str, code: i32) -> Self {
        self.inject(image_name, FailureConfig::new(InjectedFailure::Exit(code)))
    }

    /// Exit with `code` the first time `image_name` is signed, then succeed
    pub fn fail_once(self, image_name: &str, code: i32) -> Self {
        self.inject(
            image_name,
            FailureConfig::new(InjectedFailure::Exit(code)).with_fail_count(1),
        )
    }

    /// Panic when signing the image named `image_name`
    pub fn panic_on(self, image_name: &str) -> Self {
        self.inject(image_name, FailureConfig::new(InjectedFailure::Panic))
    }

    pub fn inject(self, image_name: &str, config: FailureConfig) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.inject(image_name, config);
        }
        self
    }

    pub fn calls(&self) -> Vec<SigningCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

impl SigningTool for MockSigner {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<ToolStatus, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SigningCall {
                image: request.image.to_path_buf(),
                key: request.key.to_path_buf(),
                version: request.version,
            });
        }

        let name = file_name(request.image);
        let failure = self.failures.lock().ok().and_then(|mut f| f.check(&name));
        if let Some(failure) = failure {
            return Ok(injected_status(failure, &name));
        }

        // A real signer cannot work without its key.
        if !request.key.is_file() {
            return Ok(ToolStatus {
                exit_code: Some(1),
                stderr: format!("key not found: {}", request.key.display()),
            });
        }

        let mut image = OpenOptions::new()
            .append(true)
            .open(request.image)
            .map_err(|e| spawn_error("mock-signer", e))?;
        image
            .write_all(&signature_trailer(request.version))
            .map_err(|e| spawn_error("mock-signer", e))?;

        Ok(ToolStatus::exited(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mock_converter_output() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("A_bootfw");
        let output = temp_dir.path().join("out.bin");
        fs::write(&input, b"elf").unwrap();

        let tool = MockConverter::new();
        let status = tool
            .convert(&ConversionRequest {
                input: &input,
                output: &output,
                strip: false,
            })
            .unwrap();

        assert!(status.success());
        assert_eq!(fs::read(&output).unwrap(), b"BIN:elf");
        assert_eq!(tool.call_count(), 1);
    }

    #[test]
    fn test_mock_signer_appends_trailer() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("boardA_updtfw.bin");
        let key = temp_dir.path().join("ecc256.der");
        fs::write(&image, b"BIN:elf").unwrap();
        fs::write(&key, b"key").unwrap();

        let signer = MockSigner::new();
        let status = signer
            .sign(&SigningRequest {
                image: &image,
                key: &key,
                version: 1235,
            })
            .unwrap();

        assert!(status.success());
        assert_eq!(signed_version(&fs::read(&image).unwrap()), Some(1235));
    }

    #[test]
    fn test_mock_signer_requires_key() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("boardA_bootfw.bin");
        fs::write(&image, b"BIN:elf").unwrap();

        let status = MockSigner::new()
            .sign(&SigningRequest {
                image: &image,
                key: &temp_dir.path().join("ecc256.der"),
                version: 1234,
            })
            .unwrap();

        assert_eq!(status.exit_code, Some(1));
        assert_eq!(signed_version(&fs::read(&image).unwrap()), None);
    }

    #[test]
    fn test_mock_signer_injected_exit() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("boardA_bootfw.bin");
        fs::write(&image, b"x").unwrap();

        let signer = MockSigner::new().fail_on("boardA_bootfw.bin", 9);
        let status = signer
            .sign(&SigningRequest {
                image: &image,
                key: &image,
                version: 1234,
            })
            .unwrap();

        assert_eq!(status.exit_code, Some(9));
        assert_eq!(signer.calls()[0].version, 1234);
    }

    #[test]
    fn test_signed_version() {
        assert_eq!(signed_version(b"BIN:x\nSIGNED:v1234"), Some(1234));
        assert_eq!(signed_version(b"BIN:x"), None);
    }
}
