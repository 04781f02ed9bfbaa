use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

const PROPERTIES_SUFFIX: &str = ".properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Properties,
    Opaque,
}

/// One remote configuration resource: its coordination-service path, its
/// content kind, and the local cache file it is mirrored to. The set of
/// handles is fixed at startup.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub node_path: String,
    pub item: String,
    pub kind: ResourceKind,
    pub cache_path: PathBuf,
}

impl ResourceHandle {
    pub fn new(node_path: impl Into<String>, download_dir: &Path) -> Self {
        let node_path = node_path.into();
        let item = node_path
            .rsplit('/')
            .next()
            .unwrap_or(node_path.as_str())
            .to_owned();
        let kind = if item.ends_with(PROPERTIES_SUFFIX) {
            ResourceKind::Properties
        } else {
            ResourceKind::Opaque
        };
        let cache_path = download_dir.join(&item);
        Self {
            node_path,
            item,
            kind,
            cache_path,
        }
    }
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, handle: &ResourceHandle) -> Result<Vec<u8>>;
}

/// Downloads resource content from the configuration server over HTTP.
/// The client carries a hard timeout so a stuck remote stalls only the
/// resource being fetched, never the process.
pub struct HttpFetcher {
    client: reqwest::Client,
    url_prefix: String,
}

impl HttpFetcher {
    pub fn new(
        conf_server: &str,
        app: &str,
        version: &str,
        env: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to build fetch client: {err}")))?;
        let url_prefix = format!(
            "{conf_server}/api/config/file?type=0&app={app}&version={version}&env={env}&key="
        );
        Ok(Self { client, url_prefix })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, handle: &ResourceHandle) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.url_prefix, handle.item);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::Download(format!("fetch '{}': {err}", handle.item)))?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "fetch '{}': HTTP {}",
                handle.item,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::Download(format!("read '{}': {err}", handle.item)))?;
        if body.is_empty() {
            return Err(Error::Download(format!(
                "empty download for '{}'",
                handle.item
            )));
        }
        Ok(body.to_vec())
    }
}
