//! The pipeline orchestrator: one conversion run end to end.
//!
//! Layers convert strictly base-to-top — every bootstrap builds on its
//! parent's — so conversion is sequential.  Pulls and pushes are
//! content-independent I/O and run concurrently under a bounded width.
//! Cache resolution completes in full before the first conversion, because
//! the poison rule needs the whole hit/miss vector up front.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use oci_client::Reference;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::builder::{Converter, ConvertRequest};
use crate::cache::{self, CacheManifest, CacheRecord};
use crate::error::ConvertError;
use crate::job::{BlobTarget, JobArtifacts, LayerJob, WorkDir};
use crate::layer::{ArtifactKind, Layer};
use crate::registry::Registry;

/// Manifest annotation listing the data blob digests of an image whose
/// blobs live in an external backend instead of the registry.
pub const BLOB_DIGESTS_ANNOTATION: &str = "chunkfs.blobs.digests";

/// Outcome of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    pub layers: usize,
    pub cache_hits: usize,
    pub converted: usize,
}

/// One conversion run: source and target image, collaborator handles, and
/// run-level policy.  Construct it literally and call [`Pipeline::run`].
pub struct Pipeline {
    pub registry: Arc<dyn Registry>,
    pub converter: Arc<dyn Converter>,
    pub blob_target: BlobTarget,
    pub workdir: WorkDir,
    /// Cache namespace tag; None disables caching entirely.
    pub cache_tag: Option<String>,
    /// Upper bound on concurrent pull/push streams; 0 means one per
    /// available core.
    pub parallel: usize,
    /// Run-scoped cancellation: aborts in-flight transfers promptly and
    /// suppresses the cache update.
    pub cancel: CancellationToken,
}

impl Pipeline {
    pub async fn run(&self, source: &Reference, target: &Reference) -> Result<ConvertSummary> {
        self.workdir
            .prepare()
            .await
            .context("prepare scratch directory")?;

        let layers = self
            .registry
            .layers(source)
            .await
            .with_context(|| format!("list layers of {source}"))?;
        if layers.is_empty() {
            bail!("source image {source} has no layers");
        }
        info!("converting {source} to {target} ({} layers)", layers.len());

        let chain_ids = cache::chain_ids(&layers);

        let cache_index = match &self.cache_tag {
            Some(tag) => match self.registry.read_cache(target, tag).await {
                Ok(index) => index,
                Err(err) => {
                    warn!("cache lookup under {tag} failed, converting from scratch: {err:#}");
                    None
                }
            },
            None => None,
        };
        let mut resolved = cache::resolve(cache_index.as_ref(), &chain_ids);
        self.revalidate_hits(&mut resolved).await;

        let mut jobs: Vec<LayerJob> = Vec::with_capacity(layers.len());
        for (index, (layer, chain_id)) in layers.into_iter().zip(chain_ids).enumerate() {
            let mut job = LayerJob::new(
                source.clone(),
                target.clone(),
                layer,
                chain_id,
                index.checked_sub(1),
            );
            if let Some(record) = resolved[index].take() {
                job.artifacts = Some(JobArtifacts::Cached { record });
            }
            jobs.push(job);
        }

        // Hits form a prefix of the job list, so the hit count is also the
        // index of the first layer needing conversion.
        let mut first_miss = jobs.iter().filter(|job| job.cached()).count();

        // The first converted layer builds on the deepest hit's bootstrap,
        // which exists only in the registry; fetch it into the scratch slot
        // where a fresh conversion would have written it.  A cached
        // bootstrap that can't be fetched demotes every hit to a miss —
        // the cache is an optimization, not a hard dependency.
        if first_miss > 0 && first_miss < jobs.len() {
            if let Err(err) = self.fetch_cached_bootstrap(target, &jobs[first_miss - 1]).await {
                warn!("cached bootstrap unavailable, reconverting all layers: {err:#}");
                for job in &mut jobs {
                    job.artifacts = None;
                }
                first_miss = 0;
            }
        }

        let cache_hits = first_miss;
        info!("cache: {cache_hits}/{} layers hit", jobs.len());

        if first_miss < jobs.len() {
            self.pull_all(&jobs[first_miss..]).await?;
        }

        let semaphore = Arc::new(Semaphore::new(self.width()));
        let mut pushes = JoinSet::new();
        for index in first_miss..jobs.len() {
            if self.cancel.is_cancelled() {
                return Err(ConvertError::Cancelled.into());
            }

            let layer = jobs[index].source_layer.clone();
            let source_dir = self.workdir.layer_dir(&layer);
            let blob_path = self.workdir.blob_path(&layer);
            let bootstrap_path = self.workdir.bootstrap_path(&layer);

            // The parent's bootstrap sits at its deterministic scratch
            // path, whether it was converted this run or prefetched from
            // the cache above.
            let parent_bootstrap: Option<PathBuf> = jobs[index]
                .parent
                .map(|parent| self.workdir.bootstrap_path(&jobs[parent].source_layer));

            info!("[CONV] converting {}", layer.digest_ref());
            self.converter
                .convert(ConvertRequest {
                    source_dir: &source_dir,
                    parent_bootstrap: parent_bootstrap.as_deref(),
                    blob_path: &blob_path,
                    bootstrap_path: &bootstrap_path,
                })
                .await
                .map_err(|reason| ConvertError::Conversion {
                    digest: layer.digest_ref(),
                    reason,
                })?;
            info!("[CONV] converted {}", layer.digest_ref());

            jobs[index].artifacts = Some(JobArtifacts::Fresh {
                blob: Layer::new(ArtifactKind::Blob, blob_path),
                bootstrap: Layer::new(ArtifactKind::Bootstrap, bootstrap_path),
            });

            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let job = jobs[index].clone();
            let registry = Arc::clone(&self.registry);
            let blob_target = self.blob_target.clone();
            let cancel = self.cancel.clone();
            pushes.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = cancel.cancelled() => Err(ConvertError::Cancelled),
                    result = job.push(registry.as_ref(), &blob_target) => result,
                }
            });
        }

        while let Some(result) = pushes.join_next().await {
            if let Err(err) = result.context("push task")? {
                self.cancel.cancel();
                return Err(err).context("upload converted artifacts");
            }
        }

        self.push_target_image(target, &jobs).await?;

        // Recorded only after the entire chain made it to the target; a
        // failed write just means future runs reconvert.
        if let Some(tag) = &self.cache_tag {
            if self.cancel.is_cancelled() {
                return Err(ConvertError::Cancelled.into());
            }
            match self.record_cache(target, tag, cache_index, &jobs).await {
                Ok(()) => info!("cache updated under {tag}"),
                Err(err) => warn!("cache update under {tag} failed: {err:#}"),
            }
        }

        Ok(ConvertSummary {
            layers: jobs.len(),
            cache_hits,
            converted: jobs.len() - cache_hits,
        })
    }

    fn width(&self) -> usize {
        match self.parallel {
            0 => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            n => n,
        }
    }

    /// Only an external store can lose blobs the index still names: the
    /// cache manifest pins registry-resident artifacts, but has no hold on
    /// the backend.  A missing or uncheckable blob demotes its layer — and
    /// by the chain rule everything deeper — to a miss.
    async fn revalidate_hits(&self, resolved: &mut [Option<CacheRecord>]) {
        let BlobTarget::External(backend) = &self.blob_target else {
            return;
        };

        let mut valid = 0;
        for record in resolved.iter().flatten() {
            match backend.exists(&record.blob.digest_hex()).await {
                Ok(true) => valid += 1,
                Ok(false) => {
                    warn!(
                        "cached blob {} missing from backend, reconverting",
                        record.blob.digest_ref()
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        "existence check for cached blob {} failed, reconverting: {err:#}",
                        record.blob.digest_ref()
                    );
                    break;
                }
            }
        }
        for record in resolved[valid..].iter_mut() {
            *record = None;
        }
    }

    async fn pull_all(&self, jobs: &[LayerJob]) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.width()));
        let mut pulls = JoinSet::new();
        for job in jobs {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let job = job.clone();
            let registry = Arc::clone(&self.registry);
            let workdir = self.workdir.clone();
            let cancel = self.cancel.clone();
            pulls.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = cancel.cancelled() => Err(ConvertError::Cancelled),
                    result = job.pull(registry.as_ref(), &workdir) => result.map(drop),
                }
            });
        }

        while let Some(result) = pulls.join_next().await {
            if let Err(err) = result.context("pull task")? {
                self.cancel.cancel();
                return Err(err).context("fetch source layers");
            }
        }
        Ok(())
    }

    async fn fetch_cached_bootstrap(&self, target: &Reference, job: &LayerJob) -> Result<()> {
        let Some(JobArtifacts::Cached { record }) = &job.artifacts else {
            bail!("parent job has no cached artifacts");
        };
        let Some(tag) = &self.cache_tag else {
            bail!("cache hit without a cache namespace");
        };

        // Cached artifacts are addressed through the cache namespace — the
        // run that produced them may have had a different target
        // repository.
        let cache = cache::cache_reference(target, tag);
        let path = self.workdir.bootstrap_path(&job.source_layer);
        info!("[BOOT] fetching cached {}", record.bootstrap.digest_ref());
        let mut stream = self
            .registry
            .open_compressed(&cache, &record.bootstrap)
            .await
            .with_context(|| format!("fetch cached bootstrap {}", record.bootstrap.digest_ref()))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("create {path:?}"))?;
        tokio::io::copy(&mut stream.reader, &mut file)
            .await
            .with_context(|| format!("store cached bootstrap {}", record.bootstrap.digest_ref()))?;
        Ok(())
    }

    /// The converted image references every data blob layer (when they are
    /// registry-resident) plus the top bootstrap, which folds in all
    /// ancestors.  Externally stored blobs are recorded as an annotation
    /// instead of layers.
    async fn push_target_image(&self, target: &Reference, jobs: &[LayerJob]) -> Result<()> {
        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs {
            records.push(
                job.finished_record()
                    .await?
                    .context("layer job left unconverted")?,
            );
        }

        let mut layers = Vec::new();
        let mut annotations = HashMap::new();
        match &self.blob_target {
            BlobTarget::Registry => {
                layers.extend(records.iter().map(|record| record.blob.clone()));
            }
            BlobTarget::External(_) => {
                let digests: Vec<String> =
                    records.iter().map(|record| record.blob.digest_ref()).collect();
                annotations.insert(BLOB_DIGESTS_ANNOTATION.to_string(), digests.join(","));
            }
        }
        if let Some(top) = records.last() {
            layers.push(top.bootstrap.clone());
        }

        self.registry
            .push_image(target, &layers, annotations)
            .await
            .with_context(|| format!("push converted image {target}"))
    }

    async fn record_cache(
        &self,
        target: &Reference,
        tag: &str,
        index: Option<CacheManifest>,
        jobs: &[LayerJob],
    ) -> Result<()> {
        let mut index = index.unwrap_or_else(CacheManifest::new);
        for job in jobs {
            if let Some(record) = job.finished_record().await? {
                index.insert(record);
            }
        }
        self.registry.write_cache(target, tag, &index).await
    }
}
