//! Plain-manifest adapter.
//!
//! Installs packages whose manifest lists URLs of plain Kubernetes YAML
//! documents. The documents are fetched, defaulted into the right namespace,
//! patched and applied with server-side apply. Readiness is derived from the
//! Deployments and StatefulSets among the applied resources.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{ApiResource, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Api, Client, ResourceExt};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::result::ReconcileResult;
use super::ManifestAdapter;
use crate::constants::FIELD_MANAGER;
use crate::crd::{OwnedResourceRef, PackageInfo, PackageManifest, PackageResource, PlainManifest};
use crate::labels;
use crate::repo::RepoClientset;
use crate::values::TargetPatches;

/// Kinds that are known to be cluster-scoped. Discovery is not consulted,
/// so resources of unknown kinds are assumed to be namespaced.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CertificateSigningRequest",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

pub struct PlainManifestAdapter {
    client: Client,
    repo: Arc<RepoClientset>,
    http: reqwest::Client,
}

impl std::fmt::Debug for PlainManifestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainManifestAdapter").finish_non_exhaustive()
    }
}

impl PlainManifestAdapter {
    pub fn new(client: Client, repo: Arc<RepoClientset>) -> Self {
        Self {
            client,
            repo,
            http: reqwest::Client::new(),
        }
    }

    async fn reconcile_plain_manifest<P: PackageResource>(
        &self,
        pkg: &P,
        package_info: &PackageInfo,
        package_manifest: &PackageManifest,
        manifest: &PlainManifest,
        patches: &TargetPatches,
    ) -> Result<Vec<OwnedResourceRef>> {
        let mut objects = self.fetch_manifest(package_info, &manifest.url).await?;
        debug!(url = %manifest.url, count = objects.len(), "fetched manifest resources");

        if let Some(namespace) = pkg.namespace() {
            for obj in &mut objects {
                if is_namespaced(obj) {
                    obj.metadata.namespace = Some(namespace.clone());
                }
            }
        } else {
            // The more specific namespace override takes precedence
            let default_namespace = if manifest.default_namespace.is_empty() {
                &package_manifest.default_namespace
            } else {
                &manifest.default_namespace
            };
            apply_default_namespace(&mut objects, default_namespace);
        }

        // Apply all modifications before changing anything on the cluster
        for obj in &mut objects {
            let (_, api) = self.api_for(obj)?;
            self.claim_if_unmanaged(&api, obj).await?;
            patches.apply_to_resource(obj)?;
        }

        let mut owned_resources = Vec::with_capacity(objects.len());
        for obj in &objects {
            let (resource, api) = self.api_for(obj)?;
            let applied = api
                .patch(
                    &obj.name_any(),
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(obj),
                )
                .await
                .context("could not apply resource")?;
            debug!(
                kind = %resource.kind,
                namespace = %applied.namespace().unwrap_or_default(),
                name = %applied.name_any(),
                "applied resource"
            );
            owned_resources.push(OwnedResourceRef::from_dynamic(&applied, &resource));
        }
        Ok(owned_resources)
    }

    async fn fetch_manifest(
        &self,
        package_info: &PackageInfo,
        url: &str,
    ) -> Result<Vec<DynamicObject>> {
        let resolved_url = package_info
            .status
            .as_ref()
            .map(|status| status.resolved_url.as_str())
            .unwrap_or_default();
        let (target, repo_relative) = resolve_manifest_url(url, resolved_url)?;
        let bytes = if repo_relative {
            // Relative URLs point into the repository the manifest came
            // from, so the request must use that repository's credentials
            let repo = self
                .repo
                .for_repo_with_name(&package_info.spec.repository_name)
                .await?;
            repo.fetch_url(target.as_str()).await?
        } else {
            let response = self
                .http
                .get(target.clone())
                .header(ACCEPT, "application/json")
                .header(ACCEPT, "application/yaml")
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .with_context(|| format!("failed to download manifest from {target}"))?;
            response.bytes().await?.to_vec()
        };
        parse_resources(&bytes, target.as_str())
    }

    /// Labels the object as managed unless it already exists without the
    /// label, so that resources belonging to someone else are never claimed
    /// and never pruned later
    async fn claim_if_unmanaged(
        &self,
        api: &Api<DynamicObject>,
        obj: &mut DynamicObject,
    ) -> Result<()> {
        match api.get_opt(&obj.name_any()).await? {
            Some(existing) if !labels::is_managed(&existing) => Ok(()),
            _ => {
                labels::set_managed(obj);
                Ok(())
            }
        }
    }

    fn api_for(&self, obj: &DynamicObject) -> Result<(ApiResource, Api<DynamicObject>)> {
        let resource = api_resource_for(obj)?;
        let api = match obj.namespace() {
            Some(namespace) => Api::namespaced_with(self.client.clone(), &namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        Ok((resource, api))
    }
}

#[async_trait]
impl<P: PackageResource> ManifestAdapter<P> for PlainManifestAdapter {
    async fn reconcile(
        &self,
        pkg: &P,
        package_info: &PackageInfo,
        manifest: &PackageManifest,
        patches: &TargetPatches,
    ) -> Result<ReconcileResult> {
        let mut all_owned = Vec::new();
        for plain in &manifest.manifests {
            let owned = self
                .reconcile_plain_manifest(pkg, package_info, manifest, plain, patches)
                .await?;
            all_owned.extend(owned);
        }

        let mut not_ready = Vec::new();
        for owned in &all_owned {
            match owned.kind.as_str() {
                "Deployment" => {
                    let api: Api<Deployment> =
                        Api::namespaced(self.client.clone(), &owned.namespace);
                    let deployment = api.get(&owned.name).await.with_context(|| {
                        format!(
                            "failed to get Deployment {}/{} for status check",
                            owned.namespace, owned.name
                        )
                    })?;
                    let ready_replicas =
                        deployment.status.as_ref().and_then(|status| status.ready_replicas);
                    let spec_replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas);
                    if !is_ready(ready_replicas, spec_replicas) {
                        not_ready.push(format!("{}/{}", owned.namespace, owned.name));
                    }
                }
                "StatefulSet" => {
                    let api: Api<StatefulSet> =
                        Api::namespaced(self.client.clone(), &owned.namespace);
                    let stateful_set = api.get(&owned.name).await.with_context(|| {
                        format!(
                            "failed to get StatefulSet {}/{} for status check",
                            owned.namespace, owned.name
                        )
                    })?;
                    let ready_replicas = stateful_set
                        .status
                        .as_ref()
                        .and_then(|status| status.ready_replicas);
                    let spec_replicas = stateful_set.spec.as_ref().and_then(|spec| spec.replicas);
                    if !is_ready(ready_replicas, spec_replicas) {
                        not_ready.push(format!("{}/{}", owned.namespace, owned.name));
                    }
                }
                _ => {}
            }
        }

        if not_ready.is_empty() {
            Ok(ReconcileResult::ready(
                format!("{} manifests reconciled", all_owned.len()),
                all_owned,
            ))
        } else {
            Ok(ReconcileResult::waiting(
                format!("{} resources not ready: {}", not_ready.len(), not_ready.join(",")),
                all_owned,
            ))
        }
    }
}

/// Returns the URL to fetch a plain manifest from and whether it is hosted
/// inside the package repository. Relative URLs are resolved against the URL
/// the package manifest itself was fetched from.
fn resolve_manifest_url(url: &str, base: &str) -> Result<(Url, bool)> {
    match Url::parse(url) {
        Ok(absolute) => Ok((absolute, false)),
        Err(_) => {
            let base_url = Url::parse(base)
                .with_context(|| format!("cannot resolve manifest URL {url} against {base}"))?;
            let target = base_url
                .join(url)
                .with_context(|| format!("cannot resolve manifest URL {url} against {base}"))?;
            Ok((target, true))
        }
    }
}

fn parse_resources(bytes: &[u8], url: &str) -> Result<Vec<DynamicObject>> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("could not decode manifest {url}"))?;
        let empty = match &value {
            serde_yaml::Value::Null => true,
            serde_yaml::Value::Mapping(mapping) => mapping.is_empty(),
            _ => false,
        };
        if empty {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(value)
            .with_context(|| format!("could not decode manifest {url}"))?;
        resources.push(obj);
    }
    Ok(resources)
}

/// Sets the default namespace on all namespaced objects that do not have
/// one, and prepends a Namespace object when at least one resource ends up
/// in the default namespace and the manifest does not ship it itself.
fn apply_default_namespace(objects: &mut Vec<DynamicObject>, default_namespace: &str) {
    if default_namespace.is_empty() {
        return;
    }
    let mut namespace_required = false;
    let mut namespace_in_list = false;
    for obj in objects.iter_mut() {
        if kind_of(obj) == "Namespace" && obj.name_any() == default_namespace {
            namespace_in_list = true;
        } else if is_namespaced(obj) {
            if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = Some(default_namespace.to_owned());
            }
            if obj.metadata.namespace.as_deref() == Some(default_namespace) {
                namespace_required = true;
            }
        }
    }
    if namespace_required && !namespace_in_list {
        objects.insert(0, namespace_object(default_namespace));
    }
}

fn namespace_object(name: &str) -> DynamicObject {
    let resource = ApiResource::from_gvk(&GroupVersionKind {
        group: String::new(),
        version: "v1".to_string(),
        kind: "Namespace".to_string(),
    });
    let mut namespace = DynamicObject::new(name, &resource);
    namespace.data = json!({});
    namespace
}

fn api_resource_for(obj: &DynamicObject) -> Result<ApiResource> {
    let types = obj
        .types
        .as_ref()
        .with_context(|| format!("resource {} has no type metadata", obj.name_any()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(ApiResource::from_gvk(&GroupVersionKind {
        group: group.to_owned(),
        version: version.to_owned(),
        kind: types.kind.clone(),
    }))
}

fn kind_of(obj: &DynamicObject) -> &str {
    obj.types
        .as_ref()
        .map(|types| types.kind.as_str())
        .unwrap_or_default()
}

fn is_namespaced(obj: &DynamicObject) -> bool {
    !CLUSTER_SCOPED_KINDS.contains(&kind_of(obj))
}

fn is_ready(ready_replicas: Option<i32>, spec_replicas: Option<i32>) -> bool {
    let ready = ready_replicas.unwrap_or(0);
    match spec_replicas {
        Some(spec) => ready == spec,
        None => ready > 0,
    }
}
