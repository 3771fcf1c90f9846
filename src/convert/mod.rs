//! ELF to raw binary conversion
//!
//! Each recognized build artifact becomes `<board>_bootfw.bin` or
//! `<board>_updtfw.bin` in the working directory. An image that already
//! exists under its canonical name is left alone, so an interrupted release
//! can be re-run without redoing finished conversions.
//!
//! The tool writes to `<canonical>.partial` first and the result is renamed
//! into place only when the tool succeeds; a crashed conversion never leaves
//! a truncated file under the canonical name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fw_catalog::{Catalog, CatalogEntry, Slot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cleanup::StagedPaths;
use crate::config::ConvertConfig;
use crate::locator::BuildArtifact;
use crate::tool::{ToolError, ToolInvocation, ToolStatus};

/// Suffix of in-progress conversion output
const PARTIAL_SUFFIX: &str = "partial";

/// A converted board image in the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardImage {
    pub board_id: String,
    pub slot: Slot,
    pub path: PathBuf,
    pub converted: bool,
    pub signed: bool,
}

impl BoardImage {
    /// Image at `path` produced for `entry`, not yet signed
    pub fn converted(entry: &CatalogEntry, path: PathBuf) -> Self {
        Self {
            board_id: entry.board_id.clone(),
            slot: entry.slot,
            path,
            converted: true,
            signed: false,
        }
    }

    /// Whether the image may be handed to the signer
    pub fn is_signable(&self) -> bool {
        self.converted
    }

    pub fn mark_signed(&mut self) {
        self.signed = true;
    }
}

/// Paths and options for one conversion
#[derive(Debug, Clone, Copy)]
pub struct ConversionRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub strip: bool,
}

/// External ELF to binary converter
pub trait ConversionTool {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ToolStatus, ToolError>;
}

/// `rust-objcopy` (or any objcopy-compatible program)
#[derive(Debug, Clone)]
pub struct ObjcopyTool {
    config: ConvertConfig,
}

impl ObjcopyTool {
    pub fn new(config: ConvertConfig) -> Self {
        Self { config }
    }

    /// `<program> [--strip-all] -I <in-fmt> <input> -O <out-fmt> <output>`
    pub fn invocation(&self, request: &ConversionRequest<'_>) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(&self.config.program);
        if request.strip && !self.config.strip_flag.is_empty() {
            invocation = invocation.arg(&self.config.strip_flag);
        }
        invocation
            .arg("-I")
            .arg(&self.config.input_format)
            .arg(request.input)
            .arg("-O")
            .arg(&self.config.output_format)
            .arg(request.output)
    }
}

impl ConversionTool for ObjcopyTool {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ToolStatus, ToolError> {
        self.invocation(request).run()
    }
}

/// Result of handing one artifact to the converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// The tool produced a new image
    Converted(BoardImage),
    /// The canonical image was already present
    Skipped(BoardImage),
    /// The artifact is not in the catalog
    Ignored,
}

/// Conversion errors, reported per artifact
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("conversion of '{artifact}' failed with exit code {}", display_code(.exit_code))]
    ConversionFailed {
        artifact: String,
        exit_code: Option<i32>,
    },

    #[error("conversion of '{artifact}' could not run: {source}")]
    Tool {
        artifact: String,
        #[source]
        source: ToolError,
    },

    #[error("converter reported success for '{artifact}' but wrote no output")]
    MissingOutput { artifact: String },

    #[error("I/O error converting '{artifact}' ({}): {source}", .path.display())]
    Io {
        artifact: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConvertError {
    pub fn artifact(&self) -> &str {
        match self {
            ConvertError::ConversionFailed { artifact, .. }
            | ConvertError::Tool { artifact, .. }
            | ConvertError::MissingOutput { artifact }
            | ConvertError::Io { artifact, .. } => artifact,
        }
    }

    /// Tool exit code, when the tool ran and exited
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ConvertError::ConversionFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

pub(crate) fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

/// Converts catalog artifacts into canonical images in the working directory
pub struct ImageConverter<'a> {
    catalog: &'a Catalog,
    tool: &'a dyn ConversionTool,
    work_dir: &'a Path,
    stage_artifacts: bool,
}

impl<'a> ImageConverter<'a> {
    pub fn new(catalog: &'a Catalog, tool: &'a dyn ConversionTool, work_dir: &'a Path) -> Self {
        Self {
            catalog,
            tool,
            work_dir,
            stage_artifacts: false,
        }
    }

    /// Copy artifacts into the working directory before converting them
    pub fn with_staging(mut self, stage_artifacts: bool) -> Self {
        self.stage_artifacts = stage_artifacts;
        self
    }

    /// Canonical output path for an entry
    pub fn output_path(&self, entry: &CatalogEntry) -> PathBuf {
        self.work_dir.join(entry.file_name())
    }

    /// Convert one artifact. Staged copies are recorded in `staged`, also
    /// when the conversion fails.
    pub fn convert(
        &self,
        artifact: &BuildArtifact,
        staged: &mut StagedPaths,
    ) -> Result<ConversionOutcome, ConvertError> {
        let Some(entry) = self.catalog.resolve(&artifact.name) else {
            debug!(artifact = %artifact.name, "not in catalog, ignoring");
            return Ok(ConversionOutcome::Ignored);
        };

        let output = self.output_path(entry);
        if output.exists() {
            info!(
                artifact = %artifact.name,
                image = %output.display(),
                "image already converted, skipping"
            );
            return Ok(ConversionOutcome::Skipped(BoardImage::converted(entry, output)));
        }

        let input = self.stage(artifact, &output, staged)?;
        let partial = partial_path(&output);
        discard(&partial).map_err(|source| io_error(artifact, &partial, source))?;

        let request = ConversionRequest {
            input: &input,
            output: &partial,
            strip: entry.strip,
        };

        let status = match self.tool.convert(&request) {
            Ok(status) => status,
            Err(source) => {
                let _ = discard(&partial);
                return Err(ConvertError::Tool {
                    artifact: artifact.name.clone(),
                    source,
                });
            }
        };

        if !status.success() {
            let _ = discard(&partial);
            return Err(ConvertError::ConversionFailed {
                artifact: artifact.name.clone(),
                exit_code: status.exit_code,
            });
        }

        if !partial.exists() {
            return Err(ConvertError::MissingOutput {
                artifact: artifact.name.clone(),
            });
        }

        fs::rename(&partial, &output).map_err(|source| io_error(artifact, &output, source))?;

        info!(
            artifact = %artifact.name,
            board = %entry.board_id,
            slot = %entry.slot,
            image = %output.display(),
            "converted"
        );

        Ok(ConversionOutcome::Converted(BoardImage::converted(entry, output)))
    }

    /// Input path for the tool: the build output itself, or a copy of it
    /// in the working directory when staging is enabled.
    fn stage(
        &self,
        artifact: &BuildArtifact,
        output: &Path,
        staged: &mut StagedPaths,
    ) -> Result<PathBuf, ConvertError> {
        if !self.stage_artifacts {
            return Ok(artifact.source_path.clone());
        }

        let copy = self.work_dir.join(&artifact.name);
        if copy == output || copy == artifact.source_path {
            return Ok(artifact.source_path.clone());
        }

        staged.insert(copy.clone());
        fs::copy(&artifact.source_path, &copy).map_err(|source| io_error(artifact, &copy, source))?;
        debug!(artifact = %artifact.name, copy = %copy.display(), "staged artifact");

        Ok(copy)
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn discard(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn io_error(artifact: &BuildArtifact, path: &Path, source: io::Error) -> ConvertError {
    ConvertError::Io {
        artifact: artifact.name.clone(),
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConverter;
    use fw_catalog::CatalogEntry;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        build: PathBuf,
        work: PathBuf,
        catalog: Catalog,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let build = temp.path().join("build");
        let work = temp.path().join("work");
        fs::create_dir_all(&build).unwrap();
        fs::create_dir_all(&work).unwrap();
        fs::write(build.join("A_bootfw"), b"boot-elf").unwrap();
        fs::write(build.join("junk_file"), b"junk").unwrap();

        let catalog = Catalog::new(vec![
            CatalogEntry::new("A_bootfw", "boardA", Slot::Boot, 1234),
            CatalogEntry::new("A_updtfw", "boardA", Slot::Update, 1235).stripped(),
        ])
        .unwrap();

        Fixture {
            _temp: temp,
            build,
            work,
            catalog,
        }
    }

    fn artifact(dir: &Path, name: &str) -> BuildArtifact {
        BuildArtifact {
            name: name.to_string(),
            source_path: dir.join(name),
        }
    }

    #[test]
    fn test_convert_writes_canonical_image() {
        let f = fixture();
        let tool = MockConverter::new();
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work);
        let mut staged = StagedPaths::new();

        let outcome = converter
            .convert(&artifact(&f.build, "A_bootfw"), &mut staged)
            .unwrap();

        let image = match outcome {
            ConversionOutcome::Converted(image) => image,
            other => panic!("expected conversion, got {:?}", other),
        };
        assert_eq!(image.path, f.work.join("boardA_bootfw.bin"));
        assert!(image.is_signable());
        assert!(!image.signed);
        assert_eq!(fs::read(&image.path).unwrap(), b"BIN:boot-elf");
        assert!(!partial_path(&image.path).exists());
        assert!(staged.is_empty());
    }

    #[test]
    fn test_convert_ignores_unknown_artifact() {
        let f = fixture();
        let tool = MockConverter::new();
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work).with_staging(true);
        let mut staged = StagedPaths::new();

        let outcome = converter
            .convert(&artifact(&f.build, "junk_file"), &mut staged)
            .unwrap();

        assert_eq!(outcome, ConversionOutcome::Ignored);
        assert_eq!(tool.call_count(), 0);
        assert!(staged.is_empty());
        assert_eq!(fs::read_dir(&f.work).unwrap().count(), 0);
    }

    #[test]
    fn test_convert_skips_existing_output() {
        let f = fixture();
        fs::write(f.work.join("boardA_bootfw.bin"), b"previous").unwrap();
        let tool = MockConverter::new();
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work);

        let outcome = converter
            .convert(&artifact(&f.build, "A_bootfw"), &mut StagedPaths::new())
            .unwrap();

        assert!(matches!(outcome, ConversionOutcome::Skipped(_)));
        assert_eq!(tool.call_count(), 0);
        assert_eq!(fs::read(f.work.join("boardA_bootfw.bin")).unwrap(), b"previous");
    }

    #[test]
    fn test_convert_failure_reports_exit_code() {
        let f = fixture();
        let tool = MockConverter::new().fail_on("A_bootfw", 2);
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work);

        let err = converter
            .convert(&artifact(&f.build, "A_bootfw"), &mut StagedPaths::new())
            .unwrap_err();

        assert!(matches!(
            err,
            ConvertError::ConversionFailed { ref artifact, exit_code: Some(2) } if artifact == "A_bootfw"
        ));
        assert_eq!(err.exit_code(), Some(2));
        assert!(!f.work.join("boardA_bootfw.bin").exists());
        assert!(!partial_path(&f.work.join("boardA_bootfw.bin")).exists());
    }

    #[test]
    fn test_convert_passes_strip_flag() {
        let f = fixture();
        fs::write(f.build.join("A_updtfw"), b"updt-elf").unwrap();
        let tool = MockConverter::new();
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work);

        converter
            .convert(&artifact(&f.build, "A_updtfw"), &mut StagedPaths::new())
            .unwrap();
        converter
            .convert(&artifact(&f.build, "A_bootfw"), &mut StagedPaths::new())
            .unwrap();

        let calls = tool.calls();
        assert!(calls[0].strip);
        assert!(!calls[1].strip);
    }

    #[test]
    fn test_convert_with_staging_records_copy() {
        let f = fixture();
        let tool = MockConverter::new();
        let converter = ImageConverter::new(&f.catalog, &tool, &f.work).with_staging(true);
        let mut staged = StagedPaths::new();

        converter
            .convert(&artifact(&f.build, "A_bootfw"), &mut staged)
            .unwrap();

        let copy = f.work.join("A_bootfw");
        assert!(staged.contains(&copy));
        assert_eq!(tool.calls()[0].input, copy);
        assert_eq!(fs::read(copy).unwrap(), b"boot-elf");
    }

    #[test]
    fn test_objcopy_invocation() {
        let tool = ObjcopyTool::new(ConvertConfig::default());
        let request = ConversionRequest {
            input: Path::new("build/rp2040_bootfw"),
            output: Path::new("rp2040_bootfw.bin.partial"),
            strip: true,
        };

        assert_eq!(
            tool.invocation(&request).to_string(),
            "rust-objcopy --strip-all -I elf32-littlearm build/rp2040_bootfw -O binary rp2040_bootfw.bin.partial"
        );

        let request = ConversionRequest { strip: false, ..request };
        assert!(!tool.invocation(&request).to_string().contains("--strip-all"));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/w/boardA_bootfw.bin")),
            PathBuf::from("/w/boardA_bootfw.bin.partial")
        );
    }
}
