//! # Package Repositories
//!
//! Access to the HTTP repositories that packages are fetched from. Each
//! `PackageRepository` resource points at one repository; the
//! [`RepoClientset`] hands out one cached [`client::RepoClient`] per
//! repository and resolves repository credentials from secrets in the
//! controller namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::constants::DEFAULT_REPO_CACHE_MAX_AGE_SECS;
use crate::crd::{PackageRepository, PackageResource, PackageScope, SecretKeyRef};

pub mod auth;
pub mod client;

use auth::Authenticator;
pub use client::RepoClient;

/// The version list a repository serves per package
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageIndex {
    #[serde(default)]
    pub versions: Vec<PackageIndexItem>,
    #[serde(default)]
    pub latest_version: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PackageIndexItem {
    pub version: String,
}

/// The index of all packages a repository serves
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PackageRepoIndex {
    #[serde(default)]
    pub packages: Vec<PackageRepoIndexItem>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRepoIndexItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PackageScope>,
}

/// Hands out repository clients, one per `PackageRepository`.
///
/// Clients are cached by repository name so that all users of the same
/// repository share one response cache.
pub struct RepoClientset {
    client: Client,
    namespace: String,
    max_cache_age: Duration,
    clients: RwLock<HashMap<String, Arc<RepoClient>>>,
}

impl std::fmt::Debug for RepoClientset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoClientset")
            .field("namespace", &self.namespace)
            .field("max_cache_age", &self.max_cache_age)
            .finish_non_exhaustive()
    }
}

impl RepoClientset {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self::with_max_cache_age(
            client,
            namespace,
            Duration::from_secs(DEFAULT_REPO_CACHE_MAX_AGE_SECS),
        )
    }

    pub fn with_max_cache_age(client: Client, namespace: &str, max_cache_age: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            max_cache_age,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// The client for the repository a package is pinned to, or the default
    /// repository if the package does not name one
    pub async fn for_package<P: PackageResource>(&self, pkg: &P) -> Result<Arc<RepoClient>> {
        self.for_repo_with_name(&pkg.package_info().repository_name).await
    }

    /// The client for the repository with the given name. An empty name
    /// resolves to the default repository
    pub async fn for_repo_with_name(&self, name: &str) -> Result<Arc<RepoClient>> {
        if name.is_empty() {
            return self.default_repo().await;
        }
        if let Some(client) = self.clients.read().await.get(name) {
            return Ok(Arc::clone(client));
        }
        let api: Api<PackageRepository> = Api::all(self.client.clone());
        let repo = api
            .get(name)
            .await
            .with_context(|| format!("package repository {name} not found"))?;
        self.for_repo(&repo).await
    }

    /// The client for the repository annotated as default
    pub async fn default_repo(&self) -> Result<Arc<RepoClient>> {
        let api: Api<PackageRepository> = Api::all(self.client.clone());
        for repo in api.list(&Default::default()).await?.items {
            if repo.is_default_repository() {
                return self.for_repo(&repo).await;
            }
        }
        bail!("default repository not found")
    }

    pub async fn for_repo(&self, repo: &PackageRepository) -> Result<Arc<RepoClient>> {
        let name = repo.name_any();
        if let Some(client) = self.clients.read().await.get(&name) {
            return Ok(Arc::clone(client));
        }
        let auth = self.authenticator_for(repo).await?;
        let client = Arc::new(RepoClient::new(&repo.spec.url, auth, self.max_cache_age));
        self.clients.write().await.insert(name, Arc::clone(&client));
        Ok(client)
    }

    /// All repositories that serve a package with the given name
    pub async fn get_repos_for_package(&self, name: &str) -> Result<Vec<PackageRepository>> {
        let api: Api<PackageRepository> = Api::all(self.client.clone());
        let mut result = Vec::new();
        for repo in api.list(&Default::default()).await?.items {
            let index = self.for_repo(&repo).await?.fetch_package_repo_index().await?;
            if index.packages.iter().any(|item| item.name == name) {
                result.push(repo);
            }
        }
        Ok(result)
    }

    async fn authenticator_for(&self, repo: &PackageRepository) -> Result<Authenticator> {
        let Some(auth) = &repo.spec.auth else {
            return Ok(Authenticator::Noop);
        };
        if let Some(basic) = &auth.basic {
            let username = match (&basic.username, &basic.username_secret_ref) {
                (Some(username), _) => username.clone(),
                (None, Some(secret_ref)) => self.secret_value(secret_ref).await?,
                (None, None) => bail!("basic auth requires a username or usernameSecretRef"),
            };
            let password = match (&basic.password, &basic.password_secret_ref) {
                (Some(password), _) => password.clone(),
                (None, Some(secret_ref)) => self.secret_value(secret_ref).await?,
                (None, None) => bail!("basic auth requires a password or passwordSecretRef"),
            };
            return Ok(Authenticator::Basic { username, password });
        }
        if let Some(bearer) = &auth.bearer {
            let token = match (&bearer.token, &bearer.token_secret_ref) {
                (Some(token), _) => token.clone(),
                (None, Some(secret_ref)) => self.secret_value(secret_ref).await?,
                (None, None) => bail!("bearer auth requires a token or tokenSecretRef"),
            };
            return Ok(Authenticator::Bearer { token });
        }
        Ok(Authenticator::Noop)
    }

    async fn secret_value(&self, secret_ref: &SecretKeyRef) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(&secret_ref.name).await?;
        match secret.data.as_ref().and_then(|data| data.get(&secret_ref.key)) {
            Some(bytes) => String::from_utf8(bytes.0.clone()).with_context(|| {
                format!("secret {} key {} is not valid UTF-8", secret_ref.name, secret_ref.key)
            }),
            None => bail!("secret {} has no key {}", secret_ref.name, secret_ref.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_index_parses_yaml() {
        let index: PackageIndex = serde_yaml::from_str(
            "latestVersion: v1.2.0\nversions:\n  - version: v1.0.0\n  - version: v1.2.0\n",
        )
        .unwrap();
        assert_eq!(index.latest_version, "v1.2.0");
        assert_eq!(index.versions.len(), 2);
        assert_eq!(index.versions[1].version, "v1.2.0");
    }

    #[test]
    fn package_repo_index_parses_json() {
        let index: PackageRepoIndex = serde_yaml::from_str(
            r#"{"packages": [{"name": "argo-cd", "latestVersion": "v2.11.0", "scope": "Cluster"}]}"#,
        )
        .unwrap();
        assert_eq!(index.packages.len(), 1);
        assert_eq!(index.packages[0].name, "argo-cd");
        assert_eq!(index.packages[0].scope, Some(PackageScope::Cluster));
    }
}
