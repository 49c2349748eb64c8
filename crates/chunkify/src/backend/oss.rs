//! HTTP object-store blob storage.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Body, Client, StatusCode, Url};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use super::{require, Backend};

/// Pushes blobs to an object-storage service over plain HTTP:
/// `PUT <endpoint>/<bucket>/<key>` for uploads, `HEAD` for existence.
///
/// Config keys: `endpoint`, `bucket`, and optionally `token` (sent as a
/// bearer header on every request).
pub struct Oss {
    client: Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

impl Oss {
    pub fn new(endpoint: Url, bucket: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            bucket: bucket.into(),
            token,
        }
    }

    pub(super) fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let endpoint = require(config, "endpoint")?;
        let endpoint = Url::parse(endpoint).with_context(|| format!("endpoint '{endpoint}'"))?;
        Ok(Self::new(
            endpoint,
            require(config, "bucket")?,
            config.get("token").cloned(),
        ))
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        let path = format!("{}/{}", self.bucket.trim_matches('/'), key);
        Ok(self.endpoint.join(&path)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Backend for Oss {
    async fn put(&self, key: &str, content: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        let url = self.object_url(key)?;
        let request = self
            .authorize(self.client.put(url.clone()))
            .body(Body::wrap_stream(ReaderStream::new(content)));
        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("put object {url}"))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.client.head(url.clone()))
            .send()
            .await
            .with_context(|| format!("head object {url}"))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => anyhow::bail!("head object {url}: unexpected status {status}"),
        }
    }
}
