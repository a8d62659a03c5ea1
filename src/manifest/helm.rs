//! Helm adapter backed by Flux CD.
//!
//! Instead of talking to helm directly, the adapter writes `HelmRepository`
//! and `HelmRelease` resources and lets the Flux helm-controller do the
//! actual chart installation. Readiness is then derived from the `Ready`
//! condition Flux maintains on the release.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::flux;
use super::result::ReconcileResult;
use super::ManifestAdapter;
use crate::constants::{FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{HelmManifest, OwnedResourceRef, PackageInfo, PackageManifest, PackageResource};
use crate::values::TargetPatches;

pub struct FluxHelmAdapter {
    client: Client,
}

impl std::fmt::Debug for FluxHelmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxHelmAdapter").finish_non_exhaustive()
    }
}

impl FluxHelmAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates the target namespace if it does not exist yet. Namespaces
    /// that already exist are left untouched, so installing into a shared
    /// namespace never claims it for this controller.
    async fn ensure_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(name).await.context("could not ensure namespace")? {
            Some(namespace) => Ok(namespace),
            None => {
                let namespace = Namespace {
                    metadata: ObjectMeta {
                        name: Some(name.to_owned()),
                        labels: Some(BTreeMap::from([(
                            MANAGED_BY_LABEL.to_owned(),
                            MANAGED_BY_VALUE.to_owned(),
                        )])),
                        ..ObjectMeta::default()
                    },
                    ..Namespace::default()
                };
                api.create(&PostParams::default(), &namespace)
                    .await
                    .context("could not ensure namespace")
            }
        }
    }

    async fn ensure_helm_repository(
        &self,
        manifest: &PackageManifest,
        helm: &HelmManifest,
        namespace: &str,
    ) -> Result<DynamicObject> {
        let resource = flux::helm_repository_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let desired = json!({
            "apiVersion": format!("{}/{}", flux::HELM_REPOSITORY_GROUP, flux::HELM_REPOSITORY_VERSION),
            "kind": flux::HELM_REPOSITORY_KIND,
            "metadata": {
                "name": manifest.name,
                "namespace": namespace,
                "labels": { MANAGED_BY_LABEL: MANAGED_BY_VALUE },
            },
            "spec": {
                "url": helm.repository_url,
                "interval": "1h",
            },
        });
        let applied = api
            .patch(
                &manifest.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await
            .context("could not ensure helm repository")?;
        debug!(name = %applied.name_any(), "ensured HelmRepository");
        Ok(applied)
    }

    async fn ensure_helm_release(
        &self,
        manifest: &PackageManifest,
        helm: &HelmManifest,
        patches: &TargetPatches,
        namespace: &str,
    ) -> Result<DynamicObject> {
        let mut values = helm.values.clone().unwrap_or(serde_json::Value::Null);
        patches.apply_to_helm_values(&helm.chart_name, &mut values)?;

        let mut spec = json!({
            "chart": {
                "spec": {
                    "chart": helm.chart_name,
                    "version": helm.chart_version,
                    "sourceRef": {
                        "kind": flux::HELM_REPOSITORY_KIND,
                        "name": manifest.name,
                    },
                },
            },
            "interval": "5m",
        });
        if !values.is_null() {
            spec["values"] = values;
        }

        let resource = flux::helm_release_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let desired = json!({
            "apiVersion": format!("{}/{}", flux::HELM_RELEASE_GROUP, flux::HELM_RELEASE_VERSION),
            "kind": flux::HELM_RELEASE_KIND,
            "metadata": {
                "name": manifest.name,
                "namespace": namespace,
                "labels": { MANAGED_BY_LABEL: MANAGED_BY_VALUE },
            },
            "spec": spec,
        });
        let applied = api
            .patch(
                &manifest.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await
            .context("could not ensure helm release")?;
        debug!(name = %applied.name_any(), "ensured HelmRelease");
        Ok(applied)
    }
}

#[async_trait]
impl<P: PackageResource> ManifestAdapter<P> for FluxHelmAdapter {
    async fn reconcile(
        &self,
        pkg: &P,
        _package_info: &PackageInfo,
        manifest: &PackageManifest,
        patches: &TargetPatches,
    ) -> Result<ReconcileResult> {
        let Some(helm) = &manifest.helm else {
            bail!("manifest of {} has no helm section", pkg.name_any());
        };
        let mut owned_resources = Vec::new();
        let namespace = match pkg.namespace() {
            Some(namespace) => namespace,
            None => {
                // A cluster-scoped package brings its own namespace along.
                let namespace = target_namespace(pkg, manifest)?;
                let ns = self.ensure_namespace(&namespace).await?;
                owned_resources.push(OwnedResourceRef::from_object(&ns));
                if is_terminating(&ns) {
                    return Ok(ReconcileResult::waiting(
                        "Namespace is still terminating",
                        owned_resources,
                    ));
                }
                namespace
            }
        };
        let repository = self
            .ensure_helm_repository(manifest, helm, &namespace)
            .await?;
        owned_resources.push(OwnedResourceRef::from_dynamic(
            &repository,
            &flux::helm_repository_resource(),
        ));
        let release = self
            .ensure_helm_release(manifest, helm, patches, &namespace)
            .await?;
        owned_resources.push(OwnedResourceRef::from_dynamic(
            &release,
            &flux::helm_release_resource(),
        ));
        Ok(extract_result(&release, owned_resources))
    }
}

fn target_namespace<P: PackageResource>(pkg: &P, manifest: &PackageManifest) -> Result<String> {
    if !manifest.default_namespace.is_empty() {
        Ok(manifest.default_namespace.clone())
    } else {
        bail!(
            "manifest of {} declares no default namespace",
            pkg.name_any()
        );
    }
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Terminating")
}

/// Derives the adapter verdict from the Ready condition of the release.
///
/// A release without a Ready condition is still being picked up by Flux.
/// Flux briefly reports Ready=False with a generation mismatch message right
/// after the release spec changed, which counts as waiting rather than as a
/// failure.
fn extract_result(release: &DynamicObject, owned_resources: Vec<OwnedResourceRef>) -> ReconcileResult {
    match flux::find_condition(release, "Ready") {
        Some(("True", message)) => {
            ReconcileResult::ready(format!("flux: {message}"), owned_resources)
        }
        Some(("False", message)) => {
            if message.contains("latest generation of object has not been reconciled") {
                ReconcileResult::waiting(format!("flux: {message}"), owned_resources)
            } else {
                ReconcileResult::failed(format!("flux: {message}"), owned_resources)
            }
        }
        _ => {
            let message = match flux::find_condition(release, "Reconciling") {
                Some((_, message)) => format!("flux: {message}"),
                None => "Waiting for HelmRelease reconciliation".to_owned(),
            };
            ReconcileResult::waiting(message, owned_resources)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NamespaceStatus;

    fn release_with_conditions(conditions: serde_json::Value) -> DynamicObject {
        let mut release = DynamicObject::new("cert-manager", &flux::helm_release_resource());
        release.data = json!({ "status": { "conditions": conditions } });
        release
    }

    #[test]
    fn ready_condition_true_is_ready() {
        let release = release_with_conditions(json!([
            { "type": "Ready", "status": "True", "message": "Release reconciliation succeeded" }
        ]));
        let result = extract_result(&release, vec![]);
        assert!(result.is_ready());
        assert_eq!(result.message, "flux: Release reconciliation succeeded");
    }

    #[test]
    fn ready_condition_false_is_failed() {
        let release = release_with_conditions(json!([
            { "type": "Ready", "status": "False", "message": "install retries exhausted" }
        ]));
        let result = extract_result(&release, vec![]);
        assert!(result.is_failed());
        assert_eq!(result.message, "flux: install retries exhausted");
    }

    #[test]
    fn generation_mismatch_is_waiting_not_failed() {
        let release = release_with_conditions(json!([
            {
                "type": "Ready",
                "status": "False",
                "message": "latest generation of object has not been reconciled",
            }
        ]));
        assert!(extract_result(&release, vec![]).is_waiting());
    }

    #[test]
    fn missing_ready_condition_is_waiting() {
        let release = DynamicObject::new("cert-manager", &flux::helm_release_resource());
        let result = extract_result(&release, vec![]);
        assert!(result.is_waiting());
        assert_eq!(result.message, "Waiting for HelmRelease reconciliation");
    }

    #[test]
    fn reconciling_condition_message_is_surfaced_while_waiting() {
        let release = release_with_conditions(json!([
            { "type": "Ready", "status": "Unknown", "message": "" },
            { "type": "Reconciling", "status": "True", "message": "Running 'install' action" },
        ]));
        let result = extract_result(&release, vec![]);
        assert!(result.is_waiting());
        assert_eq!(result.message, "flux: Running 'install' action");
    }

    #[test]
    fn terminating_namespace_is_detected() {
        assert!(!is_terminating(&Namespace::default()));
        let namespace = Namespace {
            status: Some(NamespaceStatus {
                phase: Some("Terminating".into()),
                ..NamespaceStatus::default()
            }),
            ..Namespace::default()
        };
        assert!(is_terminating(&namespace));
    }

    #[test]
    fn cluster_scoped_package_requires_a_default_namespace() {
        use crate::crd::ClusterPackage;
        let pkg = ClusterPackage::new("cert-manager", Default::default());
        let manifest = PackageManifest::default();
        assert!(target_namespace(&pkg, &manifest).is_err());

        let manifest = PackageManifest {
            default_namespace: "cert-manager".into(),
            ..PackageManifest::default()
        };
        assert_eq!(
            target_namespace(&pkg, &manifest).unwrap(),
            "cert-manager".to_owned()
        );
    }
}
