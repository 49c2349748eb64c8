//! Command-line driver for chunkfs image conversion.
//!
//! `chunkctl convert` runs one conversion: it pulls the source image's
//! layers, converts each into a data blob plus bootstrap layer via the
//! external builder, and pushes the results to the target registry or a
//! configured blob backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use chunkify::backend::{self, BackendConfig};
use chunkify::builder::BuilderCommand;
use chunkify::job::{BlobTarget, WorkDir};
use chunkify::registry::OciRegistry;
use chunkify::{Pipeline, Reference, RegistryAuth};

/// chunkctl
#[derive(Debug, Parser)]
#[clap(name = "chunkctl", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a layered image into the chunkfs accelerated format.
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Source image reference
    source: Reference,
    /// Target image reference
    target: Reference,

    /// Cache namespace tag (e.g. "cache:v1"); omit to convert without a
    /// cache
    #[clap(long)]
    cache: Option<String>,

    /// Path of a backend config JSON; when given, data blobs go to this
    /// external store instead of the target registry
    #[clap(long)]
    backend_config: Option<PathBuf>,

    /// The builder executable performing the per-layer conversion
    #[clap(long, default_value = "chunkfs-builder")]
    builder: PathBuf,

    /// Scratch directory for this run (exclusive; defaults to a temporary
    /// directory)
    #[clap(long)]
    work_dir: Option<PathBuf>,

    /// Maximum concurrent pull/push streams; 0 means one per core
    #[clap(long, default_value_t = 4)]
    parallel: usize,

    /// Registry username (password read from CHUNKCTL_PASSWORD)
    #[clap(long)]
    username: Option<String>,
}

fn registry_auth(username: Option<String>) -> RegistryAuth {
    match username {
        Some(username) => match std::env::var("CHUNKCTL_PASSWORD") {
            Ok(password) => RegistryAuth::Basic(username, password),
            Err(_) => RegistryAuth::Anonymous,
        },
        None => RegistryAuth::Anonymous,
    }
}

async fn convert(args: ConvertArgs) -> Result<()> {
    let blob_target = match &args.backend_config {
        Some(path) => {
            let raw = std::fs::read(path).with_context(|| format!("read {path:?}"))?;
            let config: BackendConfig =
                serde_json::from_slice(&raw).with_context(|| format!("parse {path:?}"))?;
            BlobTarget::External(backend::from_config(&config)?)
        }
        None => BlobTarget::Registry,
    };

    // Keep the handle alive for the whole run: dropping it removes the
    // directory.
    let scratch;
    let workdir = match &args.work_dir {
        Some(dir) => WorkDir::new(dir),
        None => {
            scratch = tempfile::tempdir().context("create scratch directory")?;
            WorkDir::new(scratch.path())
        }
    };

    let pipeline = Pipeline {
        registry: Arc::new(OciRegistry::new(registry_auth(args.username))),
        converter: Arc::new(BuilderCommand::new(args.builder)),
        blob_target,
        workdir,
        cache_tag: args.cache,
        parallel: args.parallel,
        cancel: Default::default(),
    };

    let cancel = pipeline.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, aborting conversion");
            cancel.cancel();
        }
    });

    let summary = pipeline.run(&args.source, &args.target).await?;
    println!(
        "converted {}: {} layers, {} cache hits, {} converted",
        args.source, summary.layers, summary.cache_hits, summary.converted
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match App::parse().cmd {
        Command::Convert(args) => convert(args).await,
    }
}
