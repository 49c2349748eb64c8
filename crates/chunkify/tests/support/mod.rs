//! Test doubles for pipeline tests: an in-memory registry, a deterministic
//! converter, and a recording blob backend.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use sha2::Digest;

use chunkify::backend::Backend;
use chunkify::builder::{ConvertRequest, Converter};
use chunkify::cache::{cache_reference, CacheManifest};
use chunkify::layer::{Compression, LayerDescriptor};
use chunkify::registry::{LayerStream, Registry};
use chunkify::Reference;
use tokio::io::AsyncRead;

/// Everything observable that happened against the registry, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    OpenCompressed { digest: String },
    OpenUncompressed { digest: String },
    PushBlob { digest: String, media_type: String },
    PushImage { reference: String },
}

#[derive(Default)]
struct State {
    /// whole reference → ordered layer descriptors
    images: HashMap<String, Vec<LayerDescriptor>>,
    /// registry host → digest ref → bytes (content-addressed, shared
    /// between repositories like a real registry's blob store)
    blobs: HashMap<String, HashMap<String, Vec<u8>>>,
    /// whole reference → (layers, annotations) of a pushed image
    manifests: HashMap<String, (Vec<LayerDescriptor>, HashMap<String, String>)>,
    /// whole cache reference → cache manifest
    caches: HashMap<String, CacheManifest>,
    /// digest refs whose compressed representation is unavailable
    fail_compressed: HashSet<String>,
    fail_cache_writes: bool,
    events: Vec<Event>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store an image built from `(media type, bytes)` layers, returning
    /// the descriptors.
    pub fn put_image(&self, image: &Reference, layers: &[(&str, Vec<u8>)]) -> Vec<LayerDescriptor> {
        let mut state = self.state.lock().unwrap();
        let descriptors: Vec<LayerDescriptor> = layers
            .iter()
            .map(|(media_type, bytes)| LayerDescriptor {
                digest: sha2::Sha256::digest(bytes).into(),
                size: bytes.len() as u64,
                media_type: media_type.to_string(),
            })
            .collect();

        let host = state.blobs.entry(image.registry().to_string()).or_default();
        for (descriptor, (_media, bytes)) in descriptors.iter().zip(layers) {
            host.insert(descriptor.digest_ref(), bytes.clone());
        }
        state.images.insert(image.whole(), descriptors.clone());
        descriptors
    }

    /// Make the compressed representation of a layer unavailable, forcing
    /// the uncompressed fallback.
    pub fn fail_compressed(&self, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_compressed
            .insert(digest.to_string());
    }

    pub fn fail_cache_writes(&self) {
        self.state.lock().unwrap().fail_cache_writes = true;
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.state.lock().unwrap().events)
    }

    pub fn pushed_manifest(
        &self,
        image: &Reference,
    ) -> Option<(Vec<LayerDescriptor>, HashMap<String, String>)> {
        self.state.lock().unwrap().manifests.get(&image.whole()).cloned()
    }

    pub fn blob(&self, registry: &str, digest: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(registry)
            .and_then(|host| host.get(digest))
            .cloned()
    }

    pub fn cache_manifest(&self, target: &Reference, namespace: &str) -> Option<CacheManifest> {
        let reference = cache_reference(target, namespace);
        self.state.lock().unwrap().caches.get(&reference.whole()).cloned()
    }

    /// Directly overwrite a stored cache manifest (for staleness tests).
    pub fn set_cache_manifest(&self, target: &Reference, namespace: &str, manifest: CacheManifest) {
        let reference = cache_reference(target, namespace);
        self.state
            .lock()
            .unwrap()
            .caches
            .insert(reference.whole(), manifest);
    }

    fn fetch(&self, image: &Reference, layer: &LayerDescriptor, event: Event) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.events.push(event);
        state
            .blobs
            .get(image.registry())
            .and_then(|host| host.get(&layer.digest_ref()))
            .cloned()
            .with_context(|| format!("blob {} not found", layer.digest_ref()))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn layers(&self, image: &Reference) -> Result<Vec<LayerDescriptor>> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(&image.whole())
            .cloned()
            .with_context(|| format!("image {image} not found"))
    }

    async fn open_compressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream> {
        let digest = layer.digest_ref();
        if self.state.lock().unwrap().fail_compressed.contains(&digest) {
            bail!("compressed representation of {digest} unavailable");
        }
        let bytes = self.fetch(image, layer, Event::OpenCompressed { digest })?;
        Ok(LayerStream::new(
            std::io::Cursor::new(bytes),
            layer.compression(),
        ))
    }

    async fn open_uncompressed(
        &self,
        image: &Reference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream> {
        let digest = layer.digest_ref();
        ensure!(
            layer.compression() == Compression::None,
            "no uncompressed representation of {digest}"
        );
        let bytes = self.fetch(image, layer, Event::OpenUncompressed { digest })?;
        Ok(LayerStream::new(std::io::Cursor::new(bytes), Compression::None))
    }

    async fn push_blob(
        &self,
        image: &Reference,
        descriptor: &LayerDescriptor,
        mut content: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await?;
        let received: [u8; 32] = sha2::Sha256::digest(&bytes).into();
        ensure!(
            received == descriptor.digest,
            "pushed content does not match descriptor digest {}",
            descriptor.digest_ref()
        );

        let mut state = self.state.lock().unwrap();
        state.events.push(Event::PushBlob {
            digest: descriptor.digest_ref(),
            media_type: descriptor.media_type.clone(),
        });
        state
            .blobs
            .entry(image.registry().to_string())
            .or_default()
            .insert(descriptor.digest_ref(), bytes);
        Ok(())
    }

    async fn push_image(
        &self,
        image: &Reference,
        layers: &[LayerDescriptor],
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::PushImage {
            reference: image.whole(),
        });
        state
            .manifests
            .insert(image.whole(), (layers.to_vec(), annotations));
        Ok(())
    }

    async fn read_cache(&self, image: &Reference, tag: &str) -> Result<Option<CacheManifest>> {
        let reference = cache_reference(image, tag);
        Ok(self.state.lock().unwrap().caches.get(&reference.whole()).cloned())
    }

    async fn write_cache(
        &self,
        image: &Reference,
        tag: &str,
        manifest: &CacheManifest,
    ) -> Result<()> {
        let reference = cache_reference(image, tag);
        let mut state = self.state.lock().unwrap();
        if state.fail_cache_writes {
            bail!("cache writes disabled");
        }
        state.caches.insert(reference.whole(), manifest.clone());
        Ok(())
    }
}

/// Deterministic stand-in for the external builder: the blob is the sorted
/// concatenation of the unpacked files, the bootstrap is the parent
/// bootstrap plus the blob digest — cumulative, like the real metadata.
#[derive(Default)]
pub struct MockConverter {
    pub calls: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(&self, request: ConvertRequest<'_>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(request.source_dir.to_path_buf());

        let mut entries: Vec<PathBuf> = std::fs::read_dir(request.source_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        entries.sort();

        let mut blob = Vec::new();
        for path in entries {
            blob.extend(path.file_name().unwrap().as_encoded_bytes());
            blob.push(0);
            blob.extend(std::fs::read(&path)?);
        }
        std::fs::write(request.blob_path, &blob)?;

        let mut bootstrap = match request.parent_bootstrap {
            Some(parent) => std::fs::read(parent)?,
            None => Vec::new(),
        };
        bootstrap.extend(hex::encode(sha2::Sha256::digest(&blob)).as_bytes());
        bootstrap.push(b'\n');
        std::fs::write(request.bootstrap_path, &bootstrap)?;
        Ok(())
    }
}

/// A converter that fails every call.
pub struct FailingConverter;

#[async_trait]
impl Converter for FailingConverter {
    async fn convert(&self, _request: ConvertRequest<'_>) -> Result<()> {
        bail!("builder crashed")
    }
}

/// An in-memory blob backend recording puts and existence checks.
#[derive(Default)]
pub struct RecordingBackend {
    pub store: Mutex<HashMap<String, Vec<u8>>>,
    pub exists_checks: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remove(&self, key: &str) {
        self.store.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn put(&self, key: &str, mut content: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await?;
        self.store.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.exists_checks.lock().unwrap().push(key.to_string());
        Ok(self.store.lock().unwrap().contains_key(key))
    }
}

/// A tar archive holding the given files, all regular, mode 0644.
pub fn tar_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    for (name, content) in files {
        let mut header = tar::Header::new_ustar();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

pub async fn gzip(bytes: &[u8]) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut out = Vec::new();
    async_compression::tokio::bufread::GzipEncoder::new(bytes)
        .read_to_end(&mut out)
        .await
        .unwrap();
    out
}

pub fn reference(s: &str) -> Reference {
    s.parse().unwrap()
}
