//! HTTP client for a single package repository.
//!
//! A repository serves `index.yaml` at its base URL, a version list at
//! `<package>/versions.yaml` and a manifest at
//! `<package>/<version>/package.yaml`. Responses may be JSON or YAML and are
//! cached per URL for a configurable maximum age.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::auth::Authenticator;
use super::{PackageIndex, PackageRepoIndex};
use crate::crd::PackageManifest;

#[derive(Default)]
struct CacheEntry {
    bytes: Vec<u8>,
    updated: Option<Instant>,
}

pub struct RepoClient {
    http: reqwest::Client,
    base_url: String,
    auth: Authenticator,
    max_cache_age: Duration,
    cache: Mutex<HashMap<String, Arc<Mutex<CacheEntry>>>>,
}

impl std::fmt::Debug for RepoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoClient")
            .field("base_url", &self.base_url)
            .field("max_cache_age", &self.max_cache_age)
            .finish_non_exhaustive()
    }
}

impl RepoClient {
    pub fn new(base_url: &str, auth: Authenticator, max_cache_age: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.to_owned(),
            auth,
            max_cache_age,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the index of all packages in the repository
    pub async fn fetch_package_repo_index(&self) -> Result<PackageRepoIndex> {
        self.fetch_yaml_or_json(&self.package_repo_index_url()?).await
    }

    /// Fetches the list of available versions of a package
    pub async fn fetch_package_index(&self, name: &str) -> Result<PackageIndex> {
        self.fetch_yaml_or_json(&self.package_index_url(name)?).await
    }

    /// Fetches the manifest of a package in a specific version
    pub async fn fetch_package_manifest(&self, name: &str, version: &str) -> Result<PackageManifest> {
        self.fetch_yaml_or_json(&self.package_manifest_url(name, version)?).await
    }

    /// Fetches the manifest of the latest version of a package.
    /// Returns the manifest together with the version it resolved to
    pub async fn fetch_latest_package_manifest(&self, name: &str) -> Result<(String, PackageManifest)> {
        let index = self.fetch_package_index(name).await?;
        let manifest = self.fetch_package_manifest(name, &index.latest_version).await?;
        Ok((index.latest_version, manifest))
    }

    /// Fetches an arbitrary repository URL with this repository's
    /// credentials, for example a plain manifest referenced from a package
    /// manifest
    pub async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch_cached(url).await
    }

    async fn fetch_yaml_or_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let bytes = self.fetch_cached(url).await?;
        serde_yaml::from_slice(&bytes).with_context(|| format!("could not decode {url}"))
    }

    async fn fetch_cached(&self, url: &str) -> Result<Vec<u8>> {
        let entry = {
            let mut cache = self.cache.lock().await;
            Arc::clone(cache.entry(url.to_owned()).or_default())
        };
        // The per-URL lock makes concurrent fetches of the same URL wait for
        // the first one instead of hitting the repository multiple times
        let mut entry = entry.lock().await;
        if let Some(updated) = entry.updated {
            if updated.elapsed() < self.max_cache_age {
                return Ok(entry.bytes.clone());
            }
        }

        let request = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .header(ACCEPT, "application/yaml");
        let response = self
            .auth
            .authenticate(request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("failed to fetch {url}"))?;
        let bytes = response.bytes().await?.to_vec();
        entry.bytes = bytes.clone();
        entry.updated = Some(Instant::now());
        Ok(bytes)
    }

    fn package_repo_index_url(&self) -> Result<String> {
        self.url_for(&["index.yaml"])
    }

    fn package_index_url(&self, name: &str) -> Result<String> {
        self.url_for(&[name, "versions.yaml"])
    }

    pub fn package_manifest_url(&self, name: &str, version: &str) -> Result<String> {
        self.url_for(&[name, version, "package.yaml"])
    }

    fn url_for(&self, segments: &[&str]) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid repository URL {}", self.base_url))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| anyhow!("repository URL cannot be a base"))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url.to_string())
    }
}
