//! The registry collaborator seam.
//!
//! The conversion core talks to registries exclusively through the
//! [`Registry`] trait: listing a source image's ordered layers, opening layer
//! byte streams, pushing derived blobs, writing the converted image, and
//! reading/writing the conversion cache manifest stored under a tag.
//! Authentication is supplied to the production adapter as an opaque
//! credential object; the core never sees it.

pub mod oci;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use oci_client::Reference;
use tokio::io::AsyncRead;

use crate::cache::CacheManifest;
use crate::layer::{Compression, LayerDescriptor};

pub use oci::OciRegistry;

/// An open byte stream for one stored layer, together with the compression
/// of the bytes it yields.
pub struct LayerStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub compression: Compression,
}

impl LayerStream {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, compression: Compression) -> Self {
        Self {
            reader: Box::new(reader),
            compression,
        }
    }
}

/// Registry operations required by the conversion pipeline.
#[async_trait]
pub trait Registry: Send + Sync {
    /// The ordered (base-to-top) layer descriptors of an image.
    async fn layers(&self, image: &Reference) -> Result<Vec<LayerDescriptor>>;

    /// Open a layer's as-stored (usually compressed) representation.
    async fn open_compressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream>;

    /// Open a layer's uncompressed representation.  Some sources only expose
    /// one of the two forms; pull falls back to this when
    /// [`Registry::open_compressed`] fails.
    async fn open_uncompressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream>;

    /// Push one blob to the image's repository, addressed by the
    /// descriptor's digest.  Uploading identical content twice must succeed
    /// harmlessly.
    async fn push_blob(
        &self,
        image: &Reference,
        descriptor: &LayerDescriptor,
        content: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    /// Write the image manifest (and a synthesized config) referencing the
    /// given layers, making the converted image visible under `image`'s tag.
    async fn push_image(
        &self,
        image: &Reference,
        layers: &[LayerDescriptor],
        annotations: HashMap<String, String>,
    ) -> Result<()>;

    /// Read the conversion cache manifest stored under `tag` in the image's
    /// repository.  A missing tag resolves to `Ok(None)`.
    async fn read_cache(&self, image: &Reference, tag: &str) -> Result<Option<CacheManifest>>;

    /// Write the conversion cache manifest under `tag`.
    async fn write_cache(&self, image: &Reference, tag: &str, manifest: &CacheManifest)
        -> Result<()>;
}
