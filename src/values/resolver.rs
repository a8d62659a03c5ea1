//! Resolution of configured values to concrete strings.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};

use crate::crd::{
    ClusterPackage, ObjectKeyValueSource, PackageValueSource, ValueConfiguration, ValueReference,
};

/// Read access to the objects that values can reference
#[async_trait]
pub trait ValueSourceAdapter: Send + Sync {
    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap>;
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret>;
    async fn get_cluster_package(&self, name: &str) -> Result<ClusterPackage>;
}

/// [`ValueSourceAdapter`] implementation backed by the Kubernetes API
pub struct KubeValueSource {
    client: Client,
}

impl std::fmt::Debug for KubeValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeValueSource").finish_non_exhaustive()
    }
}

impl KubeValueSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ValueSourceAdapter for KubeValueSource {
    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_cluster_package(&self, name: &str) -> Result<ClusterPackage> {
        let api: Api<ClusterPackage> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// Resolves value configurations to strings, following references to
/// `ConfigMaps`, `Secrets` and other cluster packages
pub struct ValueResolver {
    adapter: Arc<dyn ValueSourceAdapter>,
}

impl std::fmt::Debug for ValueResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueResolver").finish_non_exhaustive()
    }
}

impl ValueResolver {
    pub fn new(adapter: Arc<dyn ValueSourceAdapter>) -> Self {
        Self { adapter }
    }

    /// Resolves each value independently. Errors do not short-circuit:
    /// all values that cannot be resolved are reported in one combined
    /// error so a user sees every broken reference at once
    pub async fn resolve(
        &self,
        values: &BTreeMap<String, ValueConfiguration>,
    ) -> Result<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, value) in values {
            match self.resolve_value(value).await {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(err) => errors.push(format!("cannot resolve value {name}: {err:#}")),
            }
        }
        if errors.is_empty() {
            Ok(resolved)
        } else {
            bail!("{}", errors.join("; "))
        }
    }

    /// Resolves a single value configuration
    pub async fn resolve_value(&self, value: &ValueConfiguration) -> Result<String> {
        let mut visited = Vec::new();
        self.resolve_value_guarded(value, &mut visited).await
    }

    // Package references can chain arbitrarily, so the set of already
    // visited package values travels along and recursion stops with an
    // error as soon as a reference is seen twice
    fn resolve_value_guarded<'a>(
        &'a self,
        value: &'a ValueConfiguration,
        visited: &'a mut Vec<(String, String)>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if let Some(value) = &value.value {
                Ok(value.clone())
            } else if let Some(reference) = &value.value_from {
                self.resolve_reference(reference, visited).await
            } else {
                bail!("cannot resolve empty value")
            }
        })
    }

    async fn resolve_reference(
        &self,
        reference: &ValueReference,
        visited: &mut Vec<(String, String)>,
    ) -> Result<String> {
        if let Some(source) = &reference.config_map_ref {
            self.config_map_value(source).await.with_context(|| {
                format!("cannot resolve reference to ConfigMap {}.{}", source.name, source.namespace)
            })
        } else if let Some(source) = &reference.secret_ref {
            self.secret_value(source).await.with_context(|| {
                format!("cannot resolve reference to Secret {}.{}", source.name, source.namespace)
            })
        } else if let Some(source) = &reference.package_ref {
            self.package_value(source, visited).await.with_context(|| {
                format!("cannot resolve reference to value {} in Package {}", source.value, source.name)
            })
        } else {
            bail!("cannot resolve empty reference")
        }
    }

    async fn config_map_value(&self, source: &ObjectKeyValueSource) -> Result<String> {
        let config_map = self.adapter.get_config_map(&source.name, &source.namespace).await?;
        match config_map.data.as_ref().and_then(|data| data.get(&source.key)) {
            Some(value) => Ok(value.clone()),
            None => bail!("no such key: {}", source.key),
        }
    }

    async fn secret_value(&self, source: &ObjectKeyValueSource) -> Result<String> {
        let secret = self.adapter.get_secret(&source.name, &source.namespace).await?;
        match secret.data.as_ref().and_then(|data| data.get(&source.key)) {
            Some(bytes) => Ok(String::from_utf8(bytes.0.clone())?),
            None => bail!("no such key: {}", source.key),
        }
    }

    async fn package_value(
        &self,
        source: &PackageValueSource,
        visited: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let key = (source.name.clone(), source.value.clone());
        if visited.contains(&key) {
            bail!("cyclic value reference");
        }
        visited.push(key);
        let pkg = self.adapter.get_cluster_package(&source.name).await?;
        match pkg.spec.values.get(&source.value) {
            Some(value) => self.resolve_value_guarded(value, visited).await,
            None => bail!("no such key: {}", source.value),
        }
    }
}
