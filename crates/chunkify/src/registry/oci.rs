//! Registry access backed by oci-client.
//!
//! This is the production [`Registry`] adapter: it speaks the OCI
//! distribution protocol through [`oci_client::Client`], translating between
//! the conversion core's layer descriptors and oci-client's manifest types.
//! The conversion cache manifest is stored as a single-layer image manifest
//! under the cache tag, with the records serialized as a JSON blob.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use oci_client::{
    client::ClientConfig,
    manifest::{OciDescriptor, OciImageManifest, OciManifest, IMAGE_MANIFEST_MEDIA_TYPE},
    secrets::RegistryAuth,
    Client, Reference, RegistryOperation,
};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::cache::{CacheManifest, CACHE_CONFIG_MEDIA_TYPE, CACHE_MEDIA_TYPE};
use crate::digest::sha256_from_digest;
use crate::layer::{Compression, LayerDescriptor};
use crate::registry::{LayerStream, Registry};

/// Media type used for the synthesized config of a converted image.
const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    pub fn new(auth: RegistryAuth) -> Self {
        Self::with_config(ClientConfig::default(), auth)
    }

    pub fn with_config(config: ClientConfig, auth: RegistryAuth) -> Self {
        Self {
            client: Client::new(config),
            auth,
        }
    }

    fn to_oci_descriptor(layer: &LayerDescriptor) -> OciDescriptor {
        OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest_ref(),
            size: layer.size as i64,
            ..Default::default()
        }
    }

    fn from_oci_descriptor(descriptor: &OciDescriptor) -> Result<LayerDescriptor> {
        Ok(LayerDescriptor {
            digest: sha256_from_digest(&descriptor.digest)
                .with_context(|| format!("layer digest {}", descriptor.digest))?,
            size: u64::try_from(descriptor.size)
                .with_context(|| format!("layer size {}", descriptor.size))?,
            media_type: descriptor.media_type.clone(),
        })
    }

    async fn push_bytes(&self, image: &Reference, data: &[u8], digest: &str) -> Result<()> {
        self.client
            .auth(image, &self.auth, RegistryOperation::Push)
            .await?;
        self.client.push_blob(image, data, digest).await?;
        Ok(())
    }

    fn blob_descriptor(media_type: &str, data: &[u8]) -> OciDescriptor {
        use sha2::Digest;
        let digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(data)));
        OciDescriptor {
            media_type: media_type.to_string(),
            digest,
            size: data.len() as i64,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn layers(&self, image: &Reference) -> Result<Vec<LayerDescriptor>> {
        let (manifest, _digest) = self
            .client
            .pull_image_manifest(image, &self.auth)
            .await
            .with_context(|| format!("fetch manifest of {image}"))?;

        manifest.layers.iter().map(Self::from_oci_descriptor).collect()
    }

    async fn open_compressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream> {
        self.client
            .auth(image, &self.auth, RegistryOperation::Pull)
            .await?;
        let stream = self
            .client
            .pull_blob_stream(image, &Self::to_oci_descriptor(layer))
            .await
            .with_context(|| format!("open blob {}", layer.digest_ref()))?;

        Ok(LayerStream::new(
            StreamReader::new(stream),
            layer.compression(),
        ))
    }

    async fn open_uncompressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream> {
        // A pure registry stores only the as-pushed bytes, so the
        // uncompressed form is produced by decoding on the way through.
        let compressed = self.open_compressed(image, layer).await?;
        let reader: Box<dyn AsyncRead + Send + Unpin> = match compressed.compression {
            Compression::None => compressed.reader,
            Compression::Gzip => Box::new(async_compression::tokio::bufread::GzipDecoder::new(
                BufReader::new(compressed.reader),
            )),
            Compression::Zstd => Box::new(async_compression::tokio::bufread::ZstdDecoder::new(
                BufReader::new(compressed.reader),
            )),
        };

        Ok(LayerStream {
            reader,
            compression: Compression::None,
        })
    }

    async fn push_blob(
        &self,
        image: &Reference,
        descriptor: &LayerDescriptor,
        mut content: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let mut data = Vec::with_capacity(descriptor.size as usize);
        content
            .read_to_end(&mut data)
            .await
            .with_context(|| format!("read blob {} for upload", descriptor.digest_ref()))?;
        self.push_bytes(image, &data, &descriptor.digest_ref())
            .await
            .with_context(|| format!("push blob {} to {image}", descriptor.digest_ref()))
    }

    async fn push_image(
        &self,
        image: &Reference,
        layers: &[LayerDescriptor],
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        use oci_spec::image::{ImageConfigurationBuilder, RootFsBuilder};

        let diff_ids: Vec<String> = layers.iter().map(LayerDescriptor::digest_ref).collect();
        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(diff_ids)
            .build()
            .context("build image rootfs")?;
        let config = ImageConfigurationBuilder::default()
            .architecture("amd64")
            .os("linux")
            .rootfs(rootfs)
            .build()
            .context("build image config")?;

        let config_json = config.to_string().context("serialize image config")?;
        let config_descriptor = Self::blob_descriptor(IMAGE_CONFIG_MEDIA_TYPE, config_json.as_bytes());
        self.push_bytes(image, config_json.as_bytes(), &config_descriptor.digest)
            .await
            .context("push image config")?;

        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_descriptor,
            layers: layers.iter().map(Self::to_oci_descriptor).collect(),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.into_iter().collect())
            },
            ..Default::default()
        };

        self.client
            .auth(image, &self.auth, RegistryOperation::Push)
            .await?;
        self.client
            .push_manifest(image, &OciManifest::Image(manifest))
            .await
            .with_context(|| format!("push manifest of {image}"))?;
        Ok(())
    }

    async fn read_cache(&self, image: &Reference, tag: &str) -> Result<Option<CacheManifest>> {
        let reference = crate::cache::cache_reference(image, tag);
        let manifest = match self.client.pull_image_manifest(&reference, &self.auth).await {
            Ok((manifest, _digest)) => manifest,
            Err(err) => {
                // An absent tag and an unreachable cache both resolve to "no
                // cache": the distribution API doesn't let us tell them
                // apart reliably, and either way the answer is a full miss.
                log::debug!("no cache manifest at {reference}: {err:#}");
                return Ok(None);
            }
        };

        let Some(records) = manifest
            .layers
            .iter()
            .find(|layer| layer.media_type == CACHE_MEDIA_TYPE)
        else {
            bail!("manifest at {reference} carries no cache records layer");
        };

        let mut data = Vec::with_capacity(records.size as usize);
        self.client
            .auth(&reference, &self.auth, RegistryOperation::Pull)
            .await?;
        self.client
            .pull_blob(&reference, records, &mut data)
            .await
            .with_context(|| format!("fetch cache records from {reference}"))?;

        Ok(Some(
            serde_json::from_slice(&data).context("parse cache records")?,
        ))
    }

    async fn write_cache(
        &self,
        image: &Reference,
        tag: &str,
        manifest: &CacheManifest,
    ) -> Result<()> {
        let reference = crate::cache::cache_reference(image, tag);

        let records = serde_json::to_vec(manifest).context("serialize cache records")?;
        let records_descriptor = Self::blob_descriptor(CACHE_MEDIA_TYPE, &records);
        self.push_bytes(&reference, &records, &records_descriptor.digest)
            .await
            .context("push cache records blob")?;

        let config = b"{}";
        let config_descriptor = Self::blob_descriptor(CACHE_CONFIG_MEDIA_TYPE, config);
        self.push_bytes(&reference, config, &config_descriptor.digest)
            .await
            .context("push cache config blob")?;

        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_descriptor,
            layers: vec![records_descriptor],
            ..Default::default()
        };

        self.client
            .push_manifest(&reference, &OciManifest::Image(manifest))
            .await
            .with_context(|| format!("push cache manifest to {reference}"))?;
        Ok(())
    }
}
