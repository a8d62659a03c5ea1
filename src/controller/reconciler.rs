//! # Package Reconciliation
//!
//! Reconciliation logic shared by `Package` and `ClusterPackage` resources.
//!
//! Each pass walks the same sequence:
//!
//! 1. Short-circuit when the package is being deleted or suspended
//! 2. Ensure the deletion finalizer is present
//! 3. Ensure the companion `PackageInfo` exists and matches the spec
//! 4. Branch on the `PackageInfo` Ready condition
//! 5. Validate dependencies, creating missing required packages
//! 6. Resolve and validate configured values, generate patches
//! 7. Run the manifest adapters, all or nothing
//! 8. Finalize: merge owned references, prune, persist status
//!
//! The pass only mutates an in-memory copy of the package. All changes are
//! written back in one place at the end ([`PackageReconciler::actual_finalize`]),
//! no matter which branch the pass took.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::constants::PACKAGE_DELETION_FINALIZER;
use crate::controller::conditions::{self, ConditionReason, CONDITION_FAILED, CONDITION_READY};
use crate::controller::requeue;
use crate::crd::{
    add_owned_resource_ref, contains_owned_resource_ref, get_condition, is_condition_true,
    remove_owned_resource_ref, ClusterPackage, ClusterPackageSpec, ConditionStatus,
    OwnedResourceRef, Package, PackageInfo, PackageInfoSpec, PackageInfoTemplate, PackageManifest,
    PackageResource,
};
use crate::dependency::{package_ref, DependencyManager, KubePackageClient, ValidationResultStatus};
use crate::labels;
use crate::manifest::{FluxHelmAdapter, ManifestAdapter, PlainManifestAdapter, ReconcileResult};
use crate::names;
use crate::observability::metrics;
use crate::repo::RepoClientset;
use crate::values::{generate_patches, validate_resolved_values, KubeValueSource, ValueResolver};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Reconciliation failed: {0:#}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// Shared context of the `Package` and `ClusterPackage` controllers
pub struct PackageReconciler {
    client: Client,
    repo: Arc<RepoClientset>,
    dependency_manager: DependencyManager,
    value_resolver: ValueResolver,
    helm_adapter: Option<FluxHelmAdapter>,
    plain_adapter: Option<PlainManifestAdapter>,
}

impl std::fmt::Debug for PackageReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageReconciler").finish_non_exhaustive()
    }
}

impl PackageReconciler {
    /// Creates a reconciler with all manifest adapters wired in
    pub fn new(client: Client, repo: Arc<RepoClientset>) -> Self {
        let dependency_manager = DependencyManager::new(
            Arc::new(KubePackageClient::new(client.clone())),
            repo.clone(),
        );
        let value_resolver = ValueResolver::new(Arc::new(KubeValueSource::new(client.clone())));
        Self {
            helm_adapter: Some(FluxHelmAdapter::new(client.clone())),
            plain_adapter: Some(PlainManifestAdapter::new(client.clone(), repo.clone())),
            client,
            repo,
            dependency_manager,
            value_resolver,
        }
    }

    /// Controller entry point for one package
    pub async fn reconcile<P: PackageResource>(
        pkg: Arc<P>,
        ctx: Arc<Self>,
    ) -> Result<Action, ReconcilerError> {
        let kind = P::kind(&());
        metrics::increment_reconciliations(&kind);
        let start = Instant::now();
        let result = ctx.reconcile_package(&*pkg).await;
        metrics::observe_reconciliation_duration(&kind, start.elapsed().as_secs_f64());
        result
    }

    /// Controller error handler: count the error and retry on a short timer
    pub fn error_policy<P: PackageResource>(
        pkg: Arc<P>,
        err: &ReconcilerError,
        _ctx: Arc<Self>,
    ) -> Action {
        metrics::increment_reconciliation_errors(&P::kind(&()));
        error!(package = %pkg.display_name(), "{err}");
        requeue::on_error()
    }

    async fn reconcile_package<P: PackageResource>(
        &self,
        pkg: &P,
    ) -> Result<Action, ReconcilerError> {
        let mut rec = Reconciliation::new(pkg.clone());
        debug!(package = %rec.pkg.display_name(), "reconciling package");

        // Deletion must complete even for suspended packages, otherwise the
        // finalizer would keep them around forever
        if rec.pkg.is_being_deleted() {
            return self.reconcile_after_deletion(&mut rec).await;
        }

        if rec.pkg.suspended() {
            info!(package = %rec.pkg.display_name(), "reconciliation is suspended");
            return Ok(requeue::await_change());
        }

        rec.ensure_finalizer();

        let package_info = self.ensure_package_info(&mut rec).await?;
        let pi_conditions = package_info
            .status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default();

        if is_condition_true(pi_conditions, CONDITION_READY) {
            debug!(package_info = %package_info.name_any(), "PackageInfo is ready");
            self.reconcile_package_info_ready(&mut rec, &package_info)
                .await
        } else if let Some(ready) = get_condition(pi_conditions, CONDITION_READY)
            .filter(|c| c.status == ConditionStatus::False.as_str())
        {
            // The package inherits the failure of its PackageInfo verbatim
            let reason = ready.reason.clone();
            let message = ready.message.clone();
            rec.set_failed(reason, &message);
            self.finalize(&mut rec).await
        } else {
            rec.set_unknown(ConditionReason::Pending, "PackageInfo status is unknown");
            self.finalize(&mut rec).await
        }
    }

    async fn reconcile_package_info_ready<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
        package_info: &PackageInfo,
    ) -> Result<Action, ReconcilerError> {
        let Some(manifest) = package_info.status.as_ref().and_then(|s| s.manifest.as_ref())
        else {
            rec.set_failed(ConditionReason::UnsupportedFormat, "PackageInfo has no manifest");
            return self.finalize_no_requeue(rec).await;
        };

        if !self.ensure_dependencies(rec, manifest).await {
            return self.finalize(rec).await;
        }

        let resolved = match self.value_resolver.resolve(rec.pkg.values()).await {
            Ok(resolved) => resolved,
            Err(err) => {
                rec.set_failed(ConditionReason::ValueConfigurationInvalid, &format!("{err:#}"));
                return self.finalize_with_error(rec, err).await;
            }
        };
        if let Err(err) = validate_resolved_values(manifest, &resolved) {
            rec.set_failed(ConditionReason::ValueConfigurationInvalid, &format!("{err:#}"));
            return self.finalize_with_error(rec, err).await;
        }
        let patches = match generate_patches(manifest, &resolved) {
            Ok(patches) => patches,
            Err(err) => {
                rec.set_failed(ConditionReason::InstallationFailed, &format!("{err:#}"));
                return self.finalize_with_error(rec, err).await;
            }
        };

        // Collect the adapters for all included manifest types before running
        // any of them. If one type is not supported, nothing must be applied.
        let mut adapters_to_run: Vec<&dyn ManifestAdapter<P>> = Vec::new();
        if !manifest.manifests.is_empty() {
            match &self.plain_adapter {
                Some(adapter) => adapters_to_run.push(adapter),
                None => {
                    rec.set_failed(ConditionReason::UnsupportedFormat, "manifests not supported");
                    return self.finalize_no_requeue(rec).await;
                }
            }
        }
        if manifest.kustomize.is_some() {
            rec.set_failed(ConditionReason::UnsupportedFormat, "kustomize not supported");
            return self.finalize_no_requeue(rec).await;
        }
        if manifest.helm.is_some() {
            match &self.helm_adapter {
                Some(adapter) => adapters_to_run.push(adapter),
                None => {
                    rec.set_failed(ConditionReason::UnsupportedFormat, "helm not supported");
                    return self.finalize_no_requeue(rec).await;
                }
            }
        }

        let mut results: Vec<ReconcileResult> = Vec::with_capacity(adapters_to_run.len());
        let mut errors: Vec<String> = Vec::new();
        for adapter in adapters_to_run {
            match adapter
                .reconcile(&rec.pkg, package_info, manifest, &patches)
                .await
            {
                Ok(result) => {
                    for owned in &result.owned_resources {
                        add_owned_resource_ref(&mut rec.current_owned_resources, owned.clone());
                    }
                    results.push(result);
                }
                Err(err) => errors.push(format!("{err:#}")),
            }
        }

        if !errors.is_empty() {
            let message = errors.join("; ");
            rec.set_failed(ConditionReason::InstallationFailed, &message);
            return self.finalize_with_error(rec, anyhow!("{message}")).await;
        }
        if !rec.handle_adapter_results(&results) {
            return self.finalize(rec).await;
        }
        rec.after_success(package_info, &results);
        self.finalize(rec).await
    }

    async fn reconcile_after_deletion<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
    ) -> Result<Action, ReconcilerError> {
        rec.set_unknown(ConditionReason::Pending, "Package is being deleted");

        if rec.pkg.finalizers().iter().any(|f| f == PACKAGE_DELETION_FINALIZER) {
            let result = if rec.pkg.status().is_some_and(|s| !s.owned_packages.is_empty()) {
                let result = self.prune_owned_packages(rec, true).await;
                info!(package = %rec.pkg.display_name(), "waiting for deletion of required packages");
                result
            } else if rec.pkg.status().is_some_and(|s| !s.owned_resources.is_empty()) {
                let result = self.prune_owned_resources(rec).await;
                info!(package = %rec.pkg.display_name(), "waiting for deletion of owned resources");
                result
            } else if rec.pkg.status().is_some_and(|s| !s.owned_package_infos.is_empty()) {
                let result = self.prune_owned_package_infos(rec, true).await;
                info!(package = %rec.pkg.display_name(), "waiting for deletion of package infos");
                result
            } else {
                if let Some(finalizers) = rec.pkg.meta_mut().finalizers.as_mut() {
                    finalizers.retain(|f| f != PACKAGE_DELETION_FINALIZER);
                }
                rec.should_update_resource = true;
                Ok(())
            };
            if let Err(err) = result {
                return self.finalize_with_error(rec, err).await;
            }
        }

        self.finalize_no_requeue(rec).await
    }

    /// Creates or updates the `PackageInfo` for the version the package wants
    /// installed and records it as owned
    async fn ensure_package_info<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
    ) -> Result<PackageInfo> {
        let name = names::package_info_name(&rec.pkg);
        let api: Api<PackageInfo> = Api::all(self.client.clone());
        let template = rec.pkg.package_info();
        let spec = PackageInfoSpec {
            name: template.name.clone(),
            version: template.version.clone(),
            repository_name: template.repository_name.clone(),
        };

        let package_info = match api
            .get_opt(&name)
            .await
            .context("could not create or update PackageInfo")?
        {
            Some(mut existing) => {
                if existing.spec == spec {
                    existing
                } else {
                    existing.spec = spec;
                    api.replace(&name, &PostParams::default(), &existing)
                        .await
                        .context("could not create or update PackageInfo")?
                }
            }
            None => api
                .create(&PostParams::default(), &PackageInfo::new(&name, spec))
                .await
                .context("could not create or update PackageInfo")?,
        };
        debug!(package_info = %name, "ensured PackageInfo");

        let changed = add_owned_resource_ref(
            &mut rec.pkg.status_mut().owned_package_infos,
            OwnedResourceRef::from_object(&package_info),
        );
        rec.set_should_update(changed);
        Ok(package_info)
    }

    /// Validates the dependencies declared in the manifest, installing
    /// missing direct requirements as cluster packages. Returns false when
    /// reconciliation cannot proceed, with the conditions already set
    async fn ensure_dependencies<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
        manifest: &PackageManifest,
    ) -> bool {
        debug!(dependencies = ?manifest.dependencies, "ensuring dependencies");
        let mut failed: Vec<String> = Vec::new();

        let target = package_ref(&rec.pkg);
        let version = rec.pkg.package_info().version.clone();
        match self.dependency_manager.validate(&target, manifest, &version).await {
            Err(err) => {
                rec.set_failed(
                    ConditionReason::InstallationFailed,
                    &format!("error validating dependencies: {err:#}"),
                );
                return false;
            }
            Ok(result) => match result.status {
                ValidationResultStatus::Ok => {}
                ValidationResultStatus::Resolvable => {
                    for requirement in &result.requirements {
                        if requirement.transitive {
                            // Transitive requirements are created by the
                            // reconciliation of the package that declares them
                            continue;
                        }
                        if let Err(err) = self.create_required_package(requirement).await {
                            error!(
                                required = %requirement.package.name,
                                "could not install required package: {err:#}"
                            );
                            failed.push(requirement.package.name.clone());
                        }
                    }
                    if !failed.is_empty() {
                        rec.set_failed(
                            ConditionReason::InstallationFailed,
                            &format!("required package(s) not installed: {}", failed.join(",")),
                        );
                        return false;
                    }
                }
                ValidationResultStatus::Conflict => {
                    let parts: Vec<String> = result
                        .conflicts
                        .iter()
                        .map(|c| {
                            format!(
                                "need version {} of {} but found {}",
                                c.required.version, c.actual.name, c.actual.version
                            )
                        })
                        .collect();
                    rec.set_failed(
                        ConditionReason::InstallationFailed,
                        &format!("conflicting dependencies: {}", parts.join(",")),
                    );
                    return false;
                }
            },
        }

        // All requirements exist, so the readiness of each one can be checked
        let api: Api<ClusterPackage> = Api::all(self.client.clone());
        let mut waiting_for: Vec<String> = Vec::new();
        let mut owned_packages: Vec<OwnedResourceRef> = Vec::new();
        for dependency in &manifest.dependencies {
            match api.get_opt(&dependency.name).await {
                Ok(None) => waiting_for.push(dependency.name.clone()),
                Err(err) => {
                    rec.set_failed(
                        ConditionReason::InstallationFailed,
                        &format!("failed to get required package {}: {err:#}", dependency.name),
                    );
                    return false;
                }
                Ok(Some(required)) => {
                    owned_packages.push(OwnedResourceRef::from_object(&required));
                    let required_conditions = required
                        .status
                        .as_ref()
                        .map(|status| status.conditions.as_slice())
                        .unwrap_or_default();
                    if is_condition_true(required_conditions, CONDITION_FAILED) {
                        failed.push(required.name_any());
                    } else if !is_condition_true(required_conditions, CONDITION_READY) {
                        waiting_for.push(required.name_any());
                    }
                }
            }
        }

        if !failed.is_empty() {
            rec.set_failed(
                ConditionReason::InstallationFailed,
                &format!("required package(s) not installed: {}", failed.join(",")),
            );
            return false;
        }
        if !waiting_for.is_empty() {
            rec.set_unknown(
                ConditionReason::Pending,
                &format!("waiting for required package(s) {}", waiting_for.join(",")),
            );
            return false;
        }

        for owned in owned_packages {
            add_owned_resource_ref(&mut rec.current_owned_packages, owned);
        }
        true
    }

    /// Installs one missing requirement as a `ClusterPackage` marked as
    /// installed-as-dependency. The repository carrying the package must be
    /// unambiguous
    async fn create_required_package(
        &self,
        requirement: &crate::dependency::Requirement,
    ) -> Result<()> {
        let name = &requirement.package.name;
        let repositories = self
            .repo
            .get_repos_for_package(name)
            .await
            .context("could not resolve repositories")?;
        let repository_name = match repositories.as_slice() {
            [] => anyhow::bail!("package is not available in any repository"),
            [repository] => repository.name_any(),
            _ => anyhow::bail!("package is available in more than one repository"),
        };

        let mut dependency = ClusterPackage::new(
            name,
            ClusterPackageSpec {
                package_info: PackageInfoTemplate {
                    name: name.clone(),
                    version: requirement.package.version.clone(),
                    repository_name,
                },
                ..ClusterPackageSpec::default()
            },
        );
        dependency.set_installed_as_dependency(true);

        let api: Api<ClusterPackage> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), &dependency).await {
            Ok(_) => {
                info!(package = %name, version = %requirement.package.version, "created required package");
                metrics::increment_required_packages_created();
                Ok(())
            }
            // Someone else created it in the meantime, which is just as good
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(err) => Err(anyhow::Error::from(err).context("could not create required package")),
        }
    }

    async fn finalize<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
    ) -> Result<Action, ReconcilerError> {
        self.actual_finalize(rec).await?;
        Ok(requeue::always())
    }

    /// Finalization for terminal states that only a spec change can resolve
    async fn finalize_no_requeue<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
    ) -> Result<Action, ReconcilerError> {
        self.actual_finalize(rec).await?;
        Ok(requeue::await_change())
    }

    async fn finalize_with_error<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
        err: anyhow::Error,
    ) -> Result<Action, ReconcilerError> {
        match self.actual_finalize(rec).await {
            Ok(()) => Err(err.into()),
            Err(finalize_err) => {
                Err(err.context(format!("finalization also failed: {finalize_err:#}")).into())
            }
        }
    }

    /// Merges the owned references collected during this pass into the
    /// status, prunes stale state after a successful pass and persists
    /// whatever changed
    async fn actual_finalize<P: PackageResource>(&self, rec: &mut Reconciliation<P>) -> Result<()> {
        let current_resources = rec.current_owned_resources.clone();
        let current_packages = rec.current_owned_packages.clone();
        let mut changed = false;
        for owned in current_resources {
            changed |= add_owned_resource_ref(&mut rec.pkg.status_mut().owned_resources, owned);
        }
        for owned in current_packages {
            changed |= add_owned_resource_ref(&mut rec.pkg.status_mut().owned_packages, owned);
        }
        rec.set_should_update(changed);

        let mut errs: Vec<anyhow::Error> = Vec::new();
        if rec.is_success {
            if let Err(err) = self.cleanup(rec).await {
                rec.set_failed(
                    ConditionReason::InstallationFailed,
                    &format!("cleanup failed: {err:#}"),
                );
                errs.push(err);
            } else {
                debug!(package = %rec.pkg.display_name(), "cleanup done");
            }
        }

        let name = rec.pkg.name_any();
        let api = rec.pkg.api(self.client.clone());
        if rec.should_update_status {
            // A merge patch would keep stale entries when an owned list
            // becomes empty, so the whole status is replaced instead
            match serde_json::to_vec(&rec.pkg).context("could not serialize package") {
                Ok(data) => {
                    match api.replace_status(&name, &PostParams::default(), data).await {
                        Ok(_) => info!(package = %rec.pkg.display_name(), "package status updated"),
                        Err(err) => {
                            error!(package = %rec.pkg.display_name(), "package status update failed: {err}");
                            errs.push(
                                anyhow::Error::from(err).context("could not update package status"),
                            );
                        }
                    }
                }
                Err(err) => errs.push(err),
            }
        } else if rec.should_update_resource {
            match api.replace(&name, &PostParams::default(), &rec.pkg).await {
                Ok(_) => info!(package = %rec.pkg.display_name(), "package updated"),
                Err(err) => {
                    error!(package = %rec.pkg.display_name(), "package update failed: {err}");
                    errs.push(anyhow::Error::from(err).context("could not update package"));
                }
            }
        }

        combine_errors(errs)
    }

    async fn cleanup<P: PackageResource>(&self, rec: &mut Reconciliation<P>) -> Result<()> {
        let mut errs: Vec<anyhow::Error> = Vec::new();
        if let Err(err) = self.prune_owned_resources(rec).await {
            errs.push(err);
        }
        if let Err(err) = self.prune_owned_package_infos(rec, false).await {
            errs.push(err);
        }
        if let Err(err) = self.prune_owned_packages(rec, false).await {
            errs.push(err);
        }
        combine_errors(errs)
    }

    /// Deletes owned resources that are no longer part of the package, but
    /// only if they are still labeled as managed by this controller.
    /// Unmanaged and already deleted resources are only dropped from the
    /// owned list
    async fn prune_owned_resources<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
    ) -> Result<()> {
        let mut errs: Vec<anyhow::Error> = Vec::new();
        let refs = rec
            .pkg
            .status()
            .map(|s| s.owned_resources.clone())
            .unwrap_or_default();
        for r in refs {
            if contains_owned_resource_ref(&rec.current_owned_resources, &r) {
                continue;
            }
            let api = self.api_for_ref(&r);
            let mut drop_ref = false;
            match api.get_opt(&r.name).await {
                Err(err) => errs.push(
                    anyhow::Error::from(err)
                        .context(format!("could not get resource {r} during pruning")),
                ),
                Ok(None) => drop_ref = true,
                Ok(Some(obj)) => {
                    if labels::is_managed(&obj) {
                        match api.delete(&r.name, &DeleteParams::default()).await {
                            Err(kube::Error::Api(err)) if err.code == 404 => drop_ref = true,
                            Err(err) => errs.push(
                                anyhow::Error::from(err)
                                    .context(format!("could not prune resource {r}")),
                            ),
                            Ok(_) => {
                                debug!(reference = %r, "pruned resource");
                                drop_ref = true;
                            }
                        }
                    } else {
                        debug!(reference = %r, "skipped pruning unmanaged resource");
                        drop_ref = true;
                    }
                }
            }
            if drop_ref {
                let changed =
                    remove_owned_resource_ref(&mut rec.pkg.status_mut().owned_resources, &r);
                rec.set_should_update(changed);
            }
        }
        combine_errors(errs)
    }

    /// Deletes owned package infos that no package references anymore. The
    /// own package info is skipped unless `all` is set (package deletion)
    async fn prune_owned_package_infos<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
        all: bool,
    ) -> Result<()> {
        let all_packages = self.all_packages().await?;
        let own_info_name = names::package_info_name(&rec.pkg);
        let own_name = rec.pkg.name_any();
        let own_namespace = rec.pkg.namespace().unwrap_or_default();
        let api: Api<PackageInfo> = Api::all(self.client.clone());

        let mut errs: Vec<anyhow::Error> = Vec::new();
        let refs = rec
            .pkg
            .status()
            .map(|s| s.owned_package_infos.clone())
            .unwrap_or_default();
        for r in refs {
            if !all && r.name == own_info_name {
                continue;
            }

            let still_used = all_packages.iter().any(|other| {
                !(other.name == own_name && other.namespace == own_namespace)
                    && other
                        .owned_package_infos
                        .iter()
                        .any(|other_ref| other_ref.name == r.name)
            });
            if !still_used {
                debug!(package_info = %r.name, "deleting unused PackageInfo");
                match api.delete(&r.name, &DeleteParams::default()).await {
                    Err(kube::Error::Api(err)) if err.code == 404 => {}
                    Err(err) => {
                        errs.push(
                            anyhow::Error::from(err)
                                .context(format!("could not delete PackageInfo {}", r.name)),
                        );
                        continue;
                    }
                    Ok(_) => {}
                }
            }

            let changed =
                remove_owned_resource_ref(&mut rec.pkg.status_mut().owned_package_infos, &r);
            rec.set_should_update(changed);
        }
        combine_errors(errs)
    }

    /// Deletes required packages that no package depends on anymore, but
    /// only if they were installed as a dependency in the first place.
    /// Explicitly installed packages are left alone
    async fn prune_owned_packages<P: PackageResource>(
        &self,
        rec: &mut Reconciliation<P>,
        all: bool,
    ) -> Result<()> {
        let all_packages = self.all_packages().await?;
        let own_name = rec.pkg.name_any();
        let own_namespace = rec.pkg.namespace().unwrap_or_default();
        let api: Api<ClusterPackage> = Api::all(self.client.clone());

        let mut errs: Vec<anyhow::Error> = Vec::new();
        let refs = rec
            .pkg
            .status()
            .map(|s| s.owned_packages.clone())
            .unwrap_or_default();
        for r in refs {
            if !all && contains_owned_resource_ref(&rec.current_owned_packages, &r) {
                continue;
            }

            let still_used = all_packages.iter().any(|other| {
                !other.deleted
                    && !(other.name == own_name && other.namespace == own_namespace)
                    && other
                        .owned_packages
                        .iter()
                        .any(|other_ref| other_ref.name == r.name)
            });
            if !still_used {
                match api.get_opt(&r.name).await {
                    Ok(None) => {}
                    Err(err) => {
                        errs.push(anyhow::Error::from(err).context(format!(
                            "failed to get required package {} during pruning",
                            r.name
                        )));
                        continue;
                    }
                    Ok(Some(required)) => {
                        if required.installed_as_dependency() {
                            match api.delete(&r.name, &DeleteParams::foreground()).await {
                                Err(kube::Error::Api(err)) if err.code == 404 => {}
                                Err(err) => {
                                    errs.push(
                                        anyhow::Error::from(err)
                                            .context(format!("could not prune package {}", r.name)),
                                    );
                                    continue;
                                }
                                Ok(_) => debug!(reference = %r, "pruned package"),
                            }
                        }
                    }
                }
            }

            let changed = remove_owned_resource_ref(&mut rec.pkg.status_mut().owned_packages, &r);
            rec.set_should_update(changed);
        }
        combine_errors(errs)
    }

    fn api_for_ref(&self, r: &OwnedResourceRef) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&GroupVersionKind {
            group: r.group.clone(),
            version: r.version.clone(),
            kind: r.kind.clone(),
        });
        if r.namespace.is_empty() {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), &r.namespace, &resource)
        }
    }

    /// Ownership info of every package resource in the cluster, used to
    /// decide whether a shared package info or required package is still
    /// referenced by anyone else
    async fn all_packages(&self) -> Result<Vec<PackageListEntry>> {
        let mut entries = Vec::new();
        let packages: Api<Package> = Api::all(self.client.clone());
        for pkg in packages
            .list(&ListParams::default())
            .await
            .context("could not list packages")?
        {
            entries.push(PackageListEntry::from_package(&pkg));
        }
        let cluster_packages: Api<ClusterPackage> = Api::all(self.client.clone());
        for pkg in cluster_packages
            .list(&ListParams::default())
            .await
            .context("could not list cluster packages")?
        {
            entries.push(PackageListEntry::from_package(&pkg));
        }
        Ok(entries)
    }
}

/// Mutable state of a single reconciliation pass
struct Reconciliation<P: PackageResource> {
    pkg: P,
    is_success: bool,
    should_update_status: bool,
    should_update_resource: bool,
    current_owned_resources: Vec<OwnedResourceRef>,
    current_owned_packages: Vec<OwnedResourceRef>,
}

impl<P: PackageResource> Reconciliation<P> {
    fn new(pkg: P) -> Self {
        Self {
            pkg,
            is_success: false,
            should_update_status: false,
            should_update_resource: false,
            current_owned_resources: Vec::new(),
            current_owned_packages: Vec::new(),
        }
    }

    fn set_should_update(&mut self, changed: bool) {
        self.should_update_status = self.should_update_status || changed;
    }

    fn set_ready(&mut self, reason: impl std::fmt::Display, message: &str) {
        let generation = self.pkg.meta().generation;
        let changed = conditions::set_ready(
            &mut self.pkg.status_mut().conditions,
            generation,
            reason,
            message,
        );
        self.set_should_update(changed);
    }

    fn set_failed(&mut self, reason: impl std::fmt::Display, message: &str) {
        let generation = self.pkg.meta().generation;
        let changed = conditions::set_failed(
            &mut self.pkg.status_mut().conditions,
            generation,
            reason,
            message,
        );
        self.set_should_update(changed);
    }

    fn set_unknown(&mut self, reason: impl std::fmt::Display, message: &str) {
        let generation = self.pkg.meta().generation;
        let changed = conditions::set_unknown(
            &mut self.pkg.status_mut().conditions,
            generation,
            reason,
            message,
        );
        self.set_should_update(changed);
    }

    fn ensure_finalizer(&mut self) {
        if !self.pkg.finalizers().iter().any(|f| f == PACKAGE_DELETION_FINALIZER) {
            self.pkg
                .meta_mut()
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(PACKAGE_DELETION_FINALIZER.to_owned());
            self.should_update_resource = true;
        }
    }

    /// Surfaces the first failed adapter result, or the first waiting one.
    /// Returns true if all adapters reported ready
    fn handle_adapter_results(&mut self, results: &[ReconcileResult]) -> bool {
        if let Some(failed) = results.iter().find(|r| r.is_failed()) {
            let message = failed.message.clone();
            self.set_failed(ConditionReason::InstallationFailed, &message);
            false
        } else if let Some(waiting) = results.iter().find(|r| r.is_waiting()) {
            let message = waiting.message.clone();
            self.set_unknown(ConditionReason::Pending, &message);
            false
        } else {
            true
        }
    }

    fn after_success(&mut self, package_info: &PackageInfo, results: &[ReconcileResult]) {
        if results.is_empty() {
            self.set_ready(
                ConditionReason::UpToDate,
                "PackageInfo has nothing to apply (no helm chart or manifests present)",
            );
        } else {
            let messages: Vec<&str> = results.iter().map(|r| r.message.as_str()).collect();
            self.set_ready(ConditionReason::InstallationSucceeded, &messages.join("\n"));
        }

        let version = package_info
            .status
            .as_ref()
            .map(|status| status.version.clone())
            .unwrap_or_default();
        let changed = self.pkg.status_mut().version != version;
        self.pkg.status_mut().version = version;
        self.set_should_update(changed);
        self.is_success = true;
    }
}

/// Name, scope and ownership info of one package resource
struct PackageListEntry {
    name: String,
    namespace: String,
    deleted: bool,
    owned_package_infos: Vec<OwnedResourceRef>,
    owned_packages: Vec<OwnedResourceRef>,
}

impl PackageListEntry {
    fn from_package<P: PackageResource>(pkg: &P) -> Self {
        Self {
            name: pkg.name_any(),
            namespace: pkg.namespace().unwrap_or_default(),
            deleted: pkg.is_being_deleted(),
            owned_package_infos: pkg
                .status()
                .map(|s| s.owned_package_infos.clone())
                .unwrap_or_default(),
            owned_packages: pkg
                .status()
                .map(|s| s.owned_packages.clone())
                .unwrap_or_default(),
        }
    }
}

fn combine_errors(errs: Vec<anyhow::Error>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let combined = errs
            .iter()
            .map(|err| format!("{err:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow!("{combined}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PackageInfoStatus, PackageStatus};

    fn cluster_package(name: &str) -> ClusterPackage {
        ClusterPackage::new(
            name,
            ClusterPackageSpec {
                package_info: PackageInfoTemplate {
                    name: name.to_owned(),
                    version: "1.0.0".to_owned(),
                    repository_name: String::new(),
                },
                ..ClusterPackageSpec::default()
            },
        )
    }

    fn package_info_with_version(version: &str) -> PackageInfo {
        let mut package_info = PackageInfo::new(
            "test--1.0.0",
            PackageInfoSpec {
                name: "test".to_owned(),
                version: "1.0.0".to_owned(),
                repository_name: String::new(),
            },
        );
        package_info.status = Some(PackageInfoStatus {
            version: version.to_owned(),
            ..PackageInfoStatus::default()
        });
        package_info
    }

    #[test]
    fn finalizer_is_added_exactly_once() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        rec.ensure_finalizer();
        assert!(rec.should_update_resource);
        assert_eq!(rec.pkg.finalizers(), [PACKAGE_DELETION_FINALIZER]);

        rec.should_update_resource = false;
        rec.ensure_finalizer();
        assert!(!rec.should_update_resource);
        assert_eq!(rec.pkg.finalizers().len(), 1);
    }

    #[test]
    fn failed_adapter_result_wins_over_waiting() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        let results = vec![
            ReconcileResult::waiting("still rolling out", vec![]),
            ReconcileResult::failed("rollout broke", vec![]),
        ];
        assert!(!rec.handle_adapter_results(&results));

        let conditions = &rec.pkg.status.as_ref().unwrap().conditions;
        let failed = get_condition(conditions, CONDITION_FAILED).unwrap();
        assert_eq!(failed.status, "True");
        assert_eq!(failed.message, "rollout broke");
        assert!(rec.should_update_status);
    }

    #[test]
    fn waiting_adapter_result_leaves_outcome_undecided() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        let results = vec![
            ReconcileResult::ready("all applied", vec![]),
            ReconcileResult::waiting("still rolling out", vec![]),
        ];
        assert!(!rec.handle_adapter_results(&results));

        let conditions = &rec.pkg.status.as_ref().unwrap().conditions;
        let ready = get_condition(conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "Unknown");
        assert_eq!(ready.message, "still rolling out");
    }

    #[test]
    fn all_ready_adapter_results_proceed() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        let results = vec![ReconcileResult::ready("all applied", vec![])];
        assert!(rec.handle_adapter_results(&results));
        assert!(rec.pkg.status.is_none());
    }

    #[test]
    fn success_without_results_reports_nothing_to_apply() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        rec.after_success(&package_info_with_version("1.0.0"), &[]);

        assert!(rec.is_success);
        let conditions = &rec.pkg.status.as_ref().unwrap().conditions;
        let ready = get_condition(conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "UpToDate");
    }

    #[test]
    fn success_records_resolved_version_and_joins_messages() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        let results = vec![
            ReconcileResult::ready("2 manifests reconciled", vec![]),
            ReconcileResult::ready("flux: release is ready", vec![]),
        ];
        rec.after_success(&package_info_with_version("1.0.0"), &results);

        assert!(rec.should_update_status);
        let status = rec.pkg.status.as_ref().unwrap();
        assert_eq!(status.version, "1.0.0");
        let ready = get_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, "InstallationSucceeded");
        assert_eq!(ready.message, "2 manifests reconciled\nflux: release is ready");
    }

    #[test]
    fn recorded_version_change_forces_a_status_update() {
        let mut rec = Reconciliation::new(cluster_package("test"));
        rec.pkg.status = Some(PackageStatus {
            version: "0.9.0".to_owned(),
            ..PackageStatus::default()
        });
        rec.after_success(&package_info_with_version("1.0.0"), &[]);
        assert_eq!(rec.pkg.status.as_ref().unwrap().version, "1.0.0");
        assert!(rec.should_update_status);
    }

    #[test]
    fn combined_errors_render_every_cause() {
        let errs = vec![anyhow!("first thing broke"), anyhow!("second thing broke")];
        let err = combine_errors(errs).unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("first thing broke"));
        assert!(rendered.contains("second thing broke"));
        assert!(combine_errors(Vec::new()).is_ok());
    }
}
