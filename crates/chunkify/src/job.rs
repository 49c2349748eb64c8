//! Layer jobs: the per-layer conversion unit.
//!
//! A [`LayerJob`] owns one source layer and the artifacts derived from it.
//! Its lifecycle is `Created → Pulled → Converted|CacheHit → Pushed`, driven
//! by the pipeline: `pull` fetches and unpacks the source layer, the
//! converter collaborator fills in the artifacts, and `push` uploads them —
//! the data blob to the configured destination, the bootstrap always to the
//! target registry, strictly in that order (a bootstrap referencing a
//! missing blob is unrecoverable at read time).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use log::{debug, info};
use oci_client::Reference;
use tokio::io::{AsyncRead, BufReader};

use crate::backend::Backend;
use crate::cache::CacheRecord;
use crate::digest::Sha256Digest;
use crate::error::ConvertError;
use crate::layer::{ArtifactKind, Compression, Layer, LayerDescriptor};
use crate::registry::{LayerStream, Registry};

/// The scratch directory of one run.  Layout is deterministic per content:
/// repeated pulls of the same layer land on the same path, so an unpacked
/// layer can be detected as already present.
///
/// The directory is exclusive to its run; concurrent runs must not share
/// one.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        for sub in ["layers", "blobs", "bootstraps"] {
            tokio::fs::create_dir_all(self.root.join(sub)).await?;
        }
        Ok(())
    }

    /// Where the unpacked content of a source layer lives.
    pub fn layer_dir(&self, layer: &LayerDescriptor) -> PathBuf {
        self.root.join("layers").join(layer.digest_hex())
    }

    /// Where the converted data blob of a source layer is written.
    pub fn blob_path(&self, layer: &LayerDescriptor) -> PathBuf {
        self.root.join("blobs").join(layer.digest_hex())
    }

    /// Where the bootstrap produced for a source layer is written.
    pub fn bootstrap_path(&self, layer: &LayerDescriptor) -> PathBuf {
        self.root.join("bootstraps").join(layer.digest_hex())
    }
}

/// Where converted data blobs are sent.  Chosen once per run, never per
/// layer.
#[derive(Clone)]
pub enum BlobTarget {
    /// Blobs become ordinary layers of the target repository.
    Registry,
    /// Blobs go to an external key-addressed store; the registry carries
    /// only bootstrap layers plus a reference to the blobs.
    External(Arc<dyn Backend>),
}

/// The finished artifacts of a job: either freshly converted files in the
/// scratch directory, or the descriptors a cache hit resolved to.
#[derive(Clone)]
pub enum JobArtifacts {
    Fresh { blob: Layer, bootstrap: Layer },
    Cached { record: CacheRecord },
}

/// The conversion unit for a single layer position of the source image.
///
/// `parent` indexes the job for the preceding layer in the run's ordered
/// job list; conversion needs the parent's bootstrap because accelerated
/// metadata is cumulative.
#[derive(Clone)]
pub struct LayerJob {
    pub source: Reference,
    pub target: Reference,
    pub source_layer: LayerDescriptor,
    pub chain_id: Sha256Digest,
    pub parent: Option<usize>,
    pub artifacts: Option<JobArtifacts>,
}

impl LayerJob {
    pub fn new(
        source: Reference,
        target: Reference,
        source_layer: LayerDescriptor,
        chain_id: Sha256Digest,
        parent: Option<usize>,
    ) -> Self {
        Self {
            source,
            target,
            source_layer,
            chain_id,
            parent,
            artifacts: None,
        }
    }

    /// Whether this job was resolved from the cache instead of converted.
    pub fn cached(&self) -> bool {
        matches!(self.artifacts, Some(JobArtifacts::Cached { .. }))
    }

    /// Fetch and unpack the source layer into the scratch directory,
    /// returning the unpacked path.
    ///
    /// The compressed representation is tried first, then the uncompressed
    /// one — some sources only expose one form.  If the layer content is
    /// already unpacked from an earlier pull, nothing is fetched.
    pub async fn pull(
        &self,
        registry: &dyn Registry,
        workdir: &WorkDir,
    ) -> Result<PathBuf, ConvertError> {
        let digest = self.source_layer.digest_ref();
        let dir = workdir.layer_dir(&self.source_layer);

        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!("[SOUR] already unpacked {digest}");
            return Ok(dir);
        }

        info!("[SOUR] pulling {digest}");
        let stream = match registry.open_compressed(&self.source, &self.source_layer).await {
            Ok(stream) => stream,
            Err(compressed) => {
                match registry
                    .open_uncompressed(&self.source, &self.source_layer)
                    .await
                {
                    Ok(stream) => stream,
                    Err(uncompressed) => {
                        return Err(ConvertError::SourceUnavailable {
                            digest,
                            reason: anyhow!(
                                "compressed: {compressed:#}; uncompressed: {uncompressed:#}"
                            ),
                        });
                    }
                }
            }
        };

        unpack(stream, &dir)
            .await
            .map_err(|reason| ConvertError::Decompression {
                digest: digest.clone(),
                reason,
            })?;
        info!("[SOUR] pulled {digest}");

        Ok(dir)
    }

    /// Upload this job's artifacts: the data blob to the run's blob
    /// destination, then the bootstrap to the target registry.
    ///
    /// A job without fresh artifacts (a pure cache hit) pushes nothing —
    /// its artifacts are already present at the target.
    pub async fn push(
        &self,
        registry: &dyn Registry,
        blob_target: &BlobTarget,
    ) -> Result<(), ConvertError> {
        let Some(JobArtifacts::Fresh { blob, bootstrap }) = &self.artifacts else {
            return Ok(());
        };

        let descriptor = blob.descriptor().await?;
        let digest = descriptor.digest_ref();
        match blob_target {
            BlobTarget::External(backend) => {
                info!("[BLOB] uploading {digest}");
                let content = open_artifact(blob, &digest).await?;
                backend
                    .put(&descriptor.digest_hex(), content)
                    .await
                    .map_err(|reason| ConvertError::Upload {
                        artifact: ArtifactKind::Blob,
                        digest: digest.clone(),
                        reason,
                    })?;
                info!("[BLOB] uploaded {digest}");
            }
            BlobTarget::Registry => {
                info!("[BLOB] pushing {digest}");
                let content = open_artifact(blob, &digest).await?;
                registry
                    .push_blob(&self.target, &descriptor, content)
                    .await
                    .map_err(|reason| ConvertError::Upload {
                        artifact: ArtifactKind::Blob,
                        digest: digest.clone(),
                        reason,
                    })?;
                info!("[BLOB] pushed {digest}");
            }
        }

        let descriptor = bootstrap.descriptor().await?;
        let digest = descriptor.digest_ref();
        info!("[BOOT] pushing {digest}");
        let content = open_artifact(bootstrap, &digest).await?;
        registry
            .push_blob(&self.target, &descriptor, content)
            .await
            .map_err(|reason| ConvertError::Upload {
                artifact: ArtifactKind::Bootstrap,
                digest: digest.clone(),
                reason,
            })?;
        info!("[BOOT] pushed {digest}");

        Ok(())
    }

    /// The finished artifacts as a cache record, or None while conversion
    /// is still pending.
    pub async fn finished_record(&self) -> Result<Option<CacheRecord>, ConvertError> {
        match &self.artifacts {
            None => Ok(None),
            Some(JobArtifacts::Cached { record }) => Ok(Some(record.clone())),
            Some(JobArtifacts::Fresh { blob, bootstrap }) => Ok(Some(CacheRecord {
                chain_id: self.chain_id,
                blob: blob.descriptor().await?,
                bootstrap: bootstrap.descriptor().await?,
            })),
        }
    }
}

async fn open_artifact(
    layer: &Layer,
    digest: &str,
) -> Result<Box<dyn AsyncRead + Send + Unpin>, ConvertError> {
    match layer.open().await {
        Ok(file) => Ok(Box::new(file)),
        Err(err) => Err(ConvertError::Upload {
            artifact: layer.kind(),
            digest: digest.to_string(),
            reason: err.into(),
        }),
    }
}

/// Decompress a layer stream and unpack the tar into `dir`.
///
/// The plain tar is staged on disk first (the stream is consumed exactly
/// once), then unpacked off the async threads.  The unpack lands in a
/// temporary directory that is renamed into place, so `dir` existing means
/// the content is complete.
async fn unpack(stream: LayerStream, dir: &Path) -> Result<()> {
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = match stream.compression {
        Compression::None => stream.reader,
        Compression::Gzip => Box::new(GzipDecoder::new(BufReader::new(stream.reader))),
        Compression::Zstd => Box::new(ZstdDecoder::new(BufReader::new(stream.reader))),
    };

    let staging = dir.with_extension("tar");
    let mut file = tokio::fs::File::create(&staging)
        .await
        .with_context(|| format!("create {staging:?}"))?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .context("decompress layer stream")?;
    drop(file);

    let unpacking = dir.with_extension("unpack");
    let _ = tokio::fs::remove_dir_all(&unpacking).await;
    let (tar_path, into) = (staging.clone(), unpacking.clone());
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&into)?;
        let mut archive = tar::Archive::new(std::fs::File::open(&tar_path)?);
        archive.unpack(&into).context("unpack layer tar")?;
        Ok(())
    })
    .await
    .context("unpack task")??;

    let _ = tokio::fs::remove_file(&staging).await;
    tokio::fs::rename(&unpacking, dir)
        .await
        .with_context(|| format!("finalize {dir:?}"))?;
    Ok(())
}
