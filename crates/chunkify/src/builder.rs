//! The conversion collaborator seam.
//!
//! The actual chunking/dedup algorithm lives outside this crate.  The
//! pipeline hands a [`Converter`] the unpacked layer directory and the
//! parent's bootstrap file, and receives the data blob and bootstrap files
//! it asked for.  Conversion must be deterministic for identical inputs —
//! the chain cache depends on it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// One conversion request: where to read the unpacked layer, where the
/// parent's bootstrap lives (absent for the base layer), and where to write
/// the outputs.
#[derive(Debug, Clone, Copy)]
pub struct ConvertRequest<'a> {
    pub source_dir: &'a Path,
    pub parent_bootstrap: Option<&'a Path>,
    pub blob_path: &'a Path,
    pub bootstrap_path: &'a Path,
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert one unpacked layer, writing the blob and bootstrap files
    /// named by the request.
    async fn convert(&self, request: ConvertRequest<'_>) -> Result<()>;
}

/// Runs an external builder executable for each conversion:
/// `<program> create <dir> --blob <path> --bootstrap <path>
/// [--parent-bootstrap <path>]`.
pub struct BuilderCommand {
    program: PathBuf,
}

impl BuilderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(request: &ConvertRequest<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "create".into(),
            request.source_dir.into(),
            "--blob".into(),
            request.blob_path.into(),
            "--bootstrap".into(),
            request.bootstrap_path.into(),
        ];
        if let Some(parent) = request.parent_bootstrap {
            args.push("--parent-bootstrap".into());
            args.push(parent.into());
        }
        args
    }
}

#[async_trait]
impl Converter for BuilderCommand {
    async fn convert(&self, request: ConvertRequest<'_>) -> Result<()> {
        let output = tokio::process::Command::new(&self.program)
            .args(Self::args(&request))
            .output()
            .await
            .with_context(|| format!("spawn builder {:?}", self.program))?;

        if !output.status.success() {
            bail!(
                "builder {:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}
