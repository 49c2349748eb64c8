//! Layer descriptors and derived artifact layers.
//!
//! Two kinds of layer appear in a conversion run: [`LayerDescriptor`] is the
//! wire-level description of a blob (digest, size, media type) used both for
//! source pulls and target pushes, and [`Layer`] is a derived artifact — a
//! data blob or bootstrap file produced by conversion into the scratch
//! directory, whose digest is computed lazily and exactly once.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::digest::{digest_ref, digest_ref_serde, sha256_file, Sha256Digest};
use crate::error::ConvertError;

/// Media type of a chunkfs data blob layer.
pub const BLOB_MEDIA_TYPE: &str = "application/vnd.chunkfs.blob.v1.tar";
/// Media type of a chunkfs bootstrap (metadata) layer.
pub const BOOTSTRAP_MEDIA_TYPE: &str = "application/vnd.chunkfs.bootstrap.v1.tar";

/// Compression applied to a layer's as-stored bytes, derived from its media
/// type suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn for_media_type(media_type: &str) -> Self {
        if media_type.ends_with("gzip") {
            Compression::Gzip
        } else if media_type.ends_with("zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Description of one stored blob: its content digest, size and media type.
///
/// Ordered base-to-top sequences of these describe a source image's layers;
/// single descriptors address derived artifacts at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(with = "digest_ref_serde")]
    pub digest: Sha256Digest,
    pub size: u64,
    pub media_type: String,
}

impl LayerDescriptor {
    /// The digest in lowercase hex, without the algorithm prefix.  This is
    /// the key form used by external blob backends.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// The digest as an OCI digest reference, "sha256:<hex>".
    pub fn digest_ref(&self) -> String {
        digest_ref(&self.digest)
    }

    pub fn compression(&self) -> Compression {
        Compression::for_media_type(&self.media_type)
    }
}

/// The role of a derived artifact layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Blob,
    Bootstrap,
}

impl ArtifactKind {
    fn media_type(self) -> &'static str {
        match self {
            ArtifactKind::Blob => BLOB_MEDIA_TYPE,
            ArtifactKind::Bootstrap => BOOTSTRAP_MEDIA_TYPE,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Blob => "blob",
            ArtifactKind::Bootstrap => "bootstrap",
        })
    }
}

/// A derived artifact layer: a file in the scratch directory plus its role.
///
/// The digest is computed over the file's canonical bytes by a single
/// streaming pass and memoized; recomputation is idempotent and repeated
/// calls never re-read the file.
#[derive(Debug, Clone)]
pub struct Layer {
    kind: ArtifactKind,
    path: PathBuf,
    identity: OnceCell<(Sha256Digest, u64)>,
}

impl Layer {
    pub fn new(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            identity: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn media_type(&self) -> &'static str {
        self.kind.media_type()
    }

    /// The artifact's content digest, computed on first use.
    pub async fn digest(&self) -> Result<Sha256Digest, ConvertError> {
        Ok(self.identity().await?.0)
    }

    /// The wire descriptor for pushing this artifact.
    pub async fn descriptor(&self) -> Result<LayerDescriptor, ConvertError> {
        let (digest, size) = self.identity().await?;
        Ok(LayerDescriptor {
            digest,
            size,
            media_type: self.media_type().to_string(),
        })
    }

    /// Open the artifact file for streaming its (uncompressed) bytes.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }

    async fn identity(&self) -> Result<(Sha256Digest, u64), ConvertError> {
        self.identity
            .get_or_try_init(|| async {
                sha256_file(&self.path)
                    .await
                    .map_err(|err| ConvertError::DigestComputation {
                        path: self.path.clone(),
                        reason: err.into(),
                    })
            })
            .await
            .copied()
    }
}
