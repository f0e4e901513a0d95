//! Capabilities backed by the cloud service
//!
//! The core only needs two things from the service: the binary archive for a
//! release target and the list of tunnel instances it currently sees. Both are
//! traits so tests and embedders can swap in their own transport.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

/// Base URL for binary archives
pub const DEFAULT_DOWNLOAD_BASE_URL: &str =
    "https://www.browserstack.com/local-testing/downloads/binaries";

/// Endpoint listing the running tunnel instances of an account
pub const DEFAULT_INSTANCES_URL: &str = "https://www.browserstack.com/local/v1/list";

/// Outcome of an archive fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveFetch {
    /// Fresh archive bytes with the remote cache token, if any
    Archive {
        bytes: Vec<u8>,
        cache_token: Option<String>,
    },
    /// The archive matching the supplied cache token is still current
    NotModified,
}

/// Source of binary archives
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Fetch the archive for `archive_key`, conditional on `cache_token` when given
    async fn fetch(&self, archive_key: &str, cache_token: Option<&str>) -> Result<ArchiveFetch>;
}

/// A tunnel instance the service reports as running
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveInstance {
    pub id: String,
    #[serde(default, alias = "localIdentifier")]
    pub local_identifier: Option<String>,
}

/// Source of the service's view of running instances
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_active_instances(&self) -> Result<Vec<ActiveInstance>>;
}

/// Archive source backed by the public download endpoint
pub struct HttpArchiveSource {
    client: Client,
    base_url: String,
}

impl HttpArchiveSource {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_DOWNLOAD_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("bslocal/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Download URL for an archive key (e.g. "linux-x64")
    pub fn archive_url(&self, archive_key: &str) -> String {
        format!("{}/BrowserStackLocal-{archive_key}.zip", self.base_url)
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch(&self, archive_key: &str, cache_token: Option<&str>) -> Result<ArchiveFetch> {
        let url = self.archive_url(archive_key);
        info!(url = %url, "Downloading BrowserStackLocal archive");

        let mut request = self.client.get(&url);
        if let Some(token) = cache_token {
            request = request.header(IF_NONE_MATCH, token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(url = %url, "Archive not modified");
            return Ok(ArchiveFetch::NotModified);
        }

        if !response.status().is_success() {
            anyhow::bail!("Failed to download {url}: HTTP {}", response.status());
        }

        let cache_token = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {url}"))?;

        Ok(ArchiveFetch::Archive {
            bytes: bytes.to_vec(),
            cache_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    #[serde(default)]
    instances: Vec<ActiveInstance>,
}

/// Instance lister backed by the service's REST endpoint
pub struct HttpInstanceLister {
    client: Client,
    url: String,
    access_key: String,
    last: u32,
}

impl HttpInstanceLister {
    pub fn new(access_key: impl Into<String>) -> Result<Self> {
        Self::with_url(DEFAULT_INSTANCES_URL, access_key)
    }

    pub fn with_url(url: impl Into<String>, access_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("bslocal/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            access_key: access_key.into(),
            last: 100,
        })
    }
}

#[async_trait]
impl InstanceLister for HttpInstanceLister {
    async fn list_active_instances(&self) -> Result<Vec<ActiveInstance>> {
        let last = self.last.to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("auth_token", self.access_key.as_str()),
                ("state", "running"),
                ("last", last.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.url))?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list instances: HTTP {}", response.status());
        }

        let body: InstancesResponse = response
            .json()
            .await
            .context("Failed to parse instance listing")?;
        Ok(body.instances)
    }
}
