//! Directory-based blob storage.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::{require, Backend};

/// Stores each blob as `<dir>/<key>`.
///
/// Writes go to a temporary file first and are renamed into place, so
/// concurrent puts of identical content land harmlessly.
pub struct LocalFs {
    dir: PathBuf,
}

impl LocalFs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(super) fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        Ok(Self::new(require(config, "dir")?))
    }
}

#[async_trait]
impl Backend for LocalFs {
    async fn put(&self, key: &str, mut content: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create blob dir {:?}", self.dir))?;

        let tmp = self.dir.join(format!(".upload-{key}"));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {tmp:?}"))?;
        if let Err(err) = tokio::io::copy(&mut content, &mut file).await {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("write {tmp:?}"));
        }
        file.sync_all().await.with_context(|| format!("sync {tmp:?}"))?;
        drop(file);

        tokio::fs::rename(&tmp, self.dir.join(key))
            .await
            .with_context(|| format!("store blob {key}"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.dir.join(key)).await?)
    }
}
