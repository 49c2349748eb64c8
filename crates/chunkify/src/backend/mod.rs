//! Storage backends for converted data blobs.
//!
//! A [`Backend`] is a stateless transport for blob bytes addressed by their
//! content digest in lowercase hex.  Whether a run uses one at all is decided
//! once, up front: data blobs either go to the target registry as ordinary
//! layers, or to an external key-addressed store through a `Backend`.
//! Bootstrap layers never travel through a backend.

mod localfs;
mod oss;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncRead;

pub use localfs::LocalFs;
pub use oss::Oss;

/// A key-addressed blob store.
///
/// `put` must be idempotent for identical content: uploading the same key
/// twice succeeds silently or overwrites harmlessly.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Upload `content`, addressed by `key` (the blob digest in lowercase
    /// hex, without algorithm prefix).
    async fn put(&self, key: &str, content: Box<dyn AsyncRead + Send + Unpin>) -> Result<()>;

    /// Whether a blob with the given key is already stored.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Run-level backend selection, parsed from a `{"type": ..., "config": ...}`
/// JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Instantiate the backend described by `config`.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    match config.backend_type.as_str() {
        "localfs" => Ok(Arc::new(
            LocalFs::from_config(&config.config).context("localfs backend config")?,
        )),
        "oss" => Ok(Arc::new(
            Oss::from_config(&config.config).context("oss backend config")?,
        )),
        other => bail!("unsupported backend type '{other}'"),
    }
}

fn require<'a>(config: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .map(String::as_str)
        .with_context(|| format!("missing '{key}'"))
}
