//! The chain cache: conversion results keyed by content chain identity.
//!
//! Every layer position in an image has a chain identity folding its own
//! digest with all ancestor digests in order (see
//! [`crate::digest::chain_digest`]).  The cache manifest maps chain
//! identities to previously converted blob/bootstrap descriptors and is
//! persisted under a user-supplied tag in the target repository.  Caching is
//! strictly an optimization: lookups that fail are treated as misses and a
//! failed write only means future runs reconvert.

use oci_client::Reference;
use serde::{Deserialize, Serialize};

use crate::digest::{chain_digest, digest_ref_serde, Sha256Digest};
use crate::layer::LayerDescriptor;

/// Media type of the cache records blob stored under the cache tag.
pub const CACHE_MEDIA_TYPE: &str = "application/vnd.chunkfs.cache.v1+json";
/// Media type of the (empty) config blob of a cache manifest.
pub const CACHE_CONFIG_MEDIA_TYPE: &str = "application/vnd.chunkfs.cache.config.v1+json";

/// One cached conversion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(with = "digest_ref_serde")]
    pub chain_id: Sha256Digest,
    pub blob: LayerDescriptor,
    pub bootstrap: LayerDescriptor,
}

/// The persisted cache index: a set of records, at most one per chain
/// identity.  Appending a record for an existing identity replaces it;
/// nothing is ever invalidated otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: u32,
    pub records: Vec<CacheRecord>,
}

impl CacheManifest {
    pub const VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            records: Vec::new(),
        }
    }

    pub fn get(&self, chain_id: &Sha256Digest) -> Option<&CacheRecord> {
        self.records
            .iter()
            .find(|record| record.chain_id == *chain_id)
    }

    pub fn insert(&mut self, record: CacheRecord) {
        match self
            .records
            .iter_mut()
            .find(|existing| existing.chain_id == record.chain_id)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }
}

/// The registry location of a cache namespace.
///
/// A namespace name like `cache:v1` is a repository and tag within the
/// target's registry, so runs converting different targets share it.  A
/// bare name gets the registry's default tag.
pub fn cache_reference(target: &Reference, namespace: &str) -> Reference {
    let registry = target.registry().to_string();
    match namespace.rsplit_once(':') {
        Some((repository, tag)) => {
            Reference::with_tag(registry, repository.to_string(), tag.to_string())
        }
        None => Reference::with_tag(registry, namespace.to_string(), "latest".to_string()),
    }
}

/// Compute the chain identity of every layer position, base to top.
pub fn chain_ids(layers: &[LayerDescriptor]) -> Vec<Sha256Digest> {
    let mut ids = Vec::with_capacity(layers.len());
    let mut parent: Option<Sha256Digest> = None;
    for layer in layers {
        let id = chain_digest(parent.as_ref(), &layer.digest);
        ids.push(id);
        parent = Some(id);
    }
    ids
}

/// Resolve the hit/miss vector for an ordered list of chain identities.
///
/// A hit at depth N is only honored if depths 1..N-1 all hit: bootstrap
/// layers are cumulative, so the first miss poisons everything deeper even
/// when a stale record happens to match.  With no manifest, everything
/// misses.
pub fn resolve(
    manifest: Option<&CacheManifest>,
    chain_ids: &[Sha256Digest],
) -> Vec<Option<CacheRecord>> {
    let mut resolved = Vec::with_capacity(chain_ids.len());
    let mut poisoned = false;

    for chain_id in chain_ids {
        let record = match (poisoned, manifest) {
            (false, Some(manifest)) => manifest.get(chain_id).cloned(),
            _ => None,
        };
        poisoned = poisoned || record.is_none();
        resolved.push(record);
    }

    resolved
}
