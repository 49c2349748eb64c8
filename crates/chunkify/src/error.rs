//! Error types for the conversion core.

use std::path::PathBuf;

use thiserror::Error;

use crate::layer::ArtifactKind;

/// A fatal error for a single layer conversion job.
///
/// Every variant names the artifact it concerns, so a failed run can report
/// which layer and which phase went wrong. Cache lookup and cache write
/// failures are deliberately not represented here: caching is an
/// optimization, those failures are logged and the run continues.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Neither the compressed nor the uncompressed representation of the
    /// source layer could be fetched.
    #[error("pull source layer {digest}: {reason:#}")]
    SourceUnavailable { digest: String, reason: anyhow::Error },

    /// The source layer stream could not be decompressed or unpacked.
    #[error("decompress source layer {digest}: {reason:#}")]
    Decompression { digest: String, reason: anyhow::Error },

    /// The external converter failed for this layer.
    #[error("convert layer {digest}: {reason:#}")]
    Conversion { digest: String, reason: anyhow::Error },

    /// A derived artifact's digest could not be computed.
    #[error("compute digest of {path:?}: {reason:#}")]
    DigestComputation { path: PathBuf, reason: anyhow::Error },

    /// Uploading a derived artifact failed.
    #[error("upload {artifact} layer {digest}: {reason:#}")]
    Upload {
        artifact: ArtifactKind,
        digest: String,
        reason: anyhow::Error,
    },

    /// The run-scoped cancellation signal fired.
    #[error("conversion cancelled")]
    Cancelled,
}
