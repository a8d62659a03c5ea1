//! # PackageInfo Reconciliation
//!
//! Keeps the manifest stored in a `PackageInfo` status in sync with the
//! package repository. The manifest is refetched when the requested version
//! changes and periodically after that, so that repository-side fixes to a
//! published manifest eventually reach the cluster.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, error, info};

use crate::constants::DEFAULT_PACKAGE_INFO_SYNC_INTERVAL_SECS;
use crate::controller::conditions::{self, ConditionReason};
use crate::controller::reconciler::ReconcilerError;
use crate::controller::requeue;
use crate::crd::PackageInfo;
use crate::observability::metrics;
use crate::repo::RepoClientset;

/// Context of the `PackageInfo` controller
pub struct PackageInfoReconciler {
    client: Client,
    repo: Arc<RepoClientset>,
}

impl std::fmt::Debug for PackageInfoReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageInfoReconciler").finish_non_exhaustive()
    }
}

impl PackageInfoReconciler {
    pub fn new(client: Client, repo: Arc<RepoClientset>) -> Self {
        Self { client, repo }
    }

    /// Controller entry point for one package info
    pub async fn reconcile(
        package_info: Arc<PackageInfo>,
        ctx: Arc<Self>,
    ) -> Result<Action, ReconcilerError> {
        let kind = PackageInfo::kind(&());
        metrics::increment_reconciliations(&kind);
        let start = Instant::now();
        let result = ctx.reconcile_package_info(&package_info).await;
        metrics::observe_reconciliation_duration(&kind, start.elapsed().as_secs_f64());
        result
    }

    pub fn error_policy(
        package_info: Arc<PackageInfo>,
        err: &ReconcilerError,
        _ctx: Arc<Self>,
    ) -> Action {
        metrics::increment_reconciliation_errors(&PackageInfo::kind(&()));
        error!(package_info = %package_info.name_any(), "{err}");
        requeue::on_error()
    }

    async fn reconcile_package_info(
        &self,
        package_info: &PackageInfo,
    ) -> Result<Action, ReconcilerError> {
        let mut package_info = package_info.clone();

        // Make the resource visibly "in progress" before the first fetch
        if ensure_initial_conditions(&mut package_info) {
            self.update_status(&mut package_info).await?;
        }

        if should_sync_from_repo(&package_info) {
            match self.sync_from_repo(&mut package_info).await {
                Ok(version) => {
                    info!(
                        package_info = %package_info.name_any(),
                        version = %version,
                        "synced package manifest from repository"
                    );
                    set_ready(&mut package_info, &version);
                    self.update_status(&mut package_info).await?;
                }
                Err(err) => {
                    error!(
                        package_info = %package_info.name_any(),
                        "could not fetch package manifest: {err:#}"
                    );
                    set_failed(&mut package_info, &format!("{err:#}"));
                    self.update_status(&mut package_info).await?;
                }
            }
        }

        Ok(requeue::always())
    }

    /// Fetches the manifest for the requested version (or the latest version
    /// if none is requested) and stores it in the status. Returns the version
    /// the fetch resolved to
    async fn sync_from_repo(&self, package_info: &mut PackageInfo) -> Result<String> {
        let spec = package_info.spec.clone();
        let repo_client = self.repo.for_repo_with_name(&spec.repository_name).await?;

        let (version, manifest) = if spec.version.is_empty() {
            repo_client.fetch_latest_package_manifest(&spec.name).await?
        } else {
            let manifest = repo_client
                .fetch_package_manifest(&spec.name, &spec.version)
                .await?;
            (spec.version.clone(), manifest)
        };
        let resolved_url = repo_client.package_manifest_url(&spec.name, &version)?;
        debug!(url = %resolved_url, "fetched package manifest");

        let status = package_info.status.get_or_insert_with(Default::default);
        status.manifest = Some(manifest);
        status.resolved_url = resolved_url;
        status.version = version.clone();
        status.last_update_timestamp = Some(Utc::now().to_rfc3339());
        Ok(version)
    }

    /// Replaces the status subresource and refreshes the in-memory object so
    /// that a later update in the same pass does not conflict
    async fn update_status(&self, package_info: &mut PackageInfo) -> Result<()> {
        let api: Api<PackageInfo> = Api::all(self.client.clone());
        let name = package_info.name_any();
        let data = serde_json::to_vec(&*package_info).context("could not serialize PackageInfo")?;
        *package_info = api
            .replace_status(&name, &PostParams::default(), data)
            .await
            .context("could not update PackageInfo status")?;
        debug!(package_info = %name, "status updated");
        Ok(())
    }
}

fn ensure_initial_conditions(package_info: &mut PackageInfo) -> bool {
    if package_info
        .status
        .as_ref()
        .is_some_and(|s| !s.conditions.is_empty())
    {
        return false;
    }
    debug!(package_info = %package_info.name_any(), "set initial conditions");
    let generation = package_info.metadata.generation;
    let status = package_info.status.get_or_insert_with(Default::default);
    conditions::set_unknown(
        &mut status.conditions,
        generation,
        ConditionReason::Reconciling,
        "Starting reconciliation",
    )
}

fn set_ready(package_info: &mut PackageInfo, version: &str) {
    let generation = package_info.metadata.generation;
    let status = package_info.status.get_or_insert_with(Default::default);
    conditions::set_ready(
        &mut status.conditions,
        generation,
        ConditionReason::SyncCompleted,
        &format!("synced version {version} from repository"),
    );
}

fn set_failed(package_info: &mut PackageInfo, message: &str) {
    let generation = package_info.metadata.generation;
    let status = package_info.status.get_or_insert_with(Default::default);
    conditions::set_failed(
        &mut status.conditions,
        generation,
        ConditionReason::SyncFailed,
        message,
    );
}

/// A sync is due when there is no previous sync, when the requested version
/// differs from the synced one or when the last sync is older than the sync
/// interval
fn should_sync_from_repo(package_info: &PackageInfo) -> bool {
    let Some(status) = package_info.status.as_ref() else {
        return true;
    };
    if status.manifest.is_none() {
        return true;
    }
    if !package_info.spec.version.is_empty() && status.version != package_info.spec.version {
        return true;
    }
    match status
        .last_update_timestamp
        .as_deref()
        .map(DateTime::parse_from_rfc3339)
    {
        Some(Ok(last_update)) => {
            Utc::now().signed_duration_since(last_update)
                > chrono::Duration::seconds(DEFAULT_PACKAGE_INFO_SYNC_INTERVAL_SECS as i64)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::conditions::CONDITION_READY;
    use crate::crd::{get_condition, PackageInfoSpec, PackageInfoStatus, PackageManifest};

    fn package_info(version: &str) -> PackageInfo {
        PackageInfo::new(
            "test--1.0.0",
            PackageInfoSpec {
                name: "test".to_owned(),
                version: version.to_owned(),
                repository_name: String::new(),
            },
        )
    }

    fn synced_status(version: &str, last_update: DateTime<Utc>) -> PackageInfoStatus {
        PackageInfoStatus {
            manifest: Some(PackageManifest::default()),
            version: version.to_owned(),
            last_update_timestamp: Some(last_update.to_rfc3339()),
            ..PackageInfoStatus::default()
        }
    }

    #[test]
    fn sync_is_due_without_status() {
        assert!(should_sync_from_repo(&package_info("1.0.0")));
    }

    #[test]
    fn sync_is_due_without_manifest() {
        let mut pi = package_info("1.0.0");
        pi.status = Some(PackageInfoStatus {
            version: "1.0.0".to_owned(),
            last_update_timestamp: Some(Utc::now().to_rfc3339()),
            ..PackageInfoStatus::default()
        });
        assert!(should_sync_from_repo(&pi));
    }

    #[test]
    fn recent_sync_of_requested_version_is_not_repeated() {
        let mut pi = package_info("1.0.0");
        pi.status = Some(synced_status("1.0.0", Utc::now()));
        assert!(!should_sync_from_repo(&pi));
    }

    #[test]
    fn sync_is_due_after_the_sync_interval() {
        let mut pi = package_info("1.0.0");
        let last_update = Utc::now()
            - chrono::Duration::seconds(DEFAULT_PACKAGE_INFO_SYNC_INTERVAL_SECS as i64 + 60);
        pi.status = Some(synced_status("1.0.0", last_update));
        assert!(should_sync_from_repo(&pi));
    }

    #[test]
    fn sync_is_due_when_the_requested_version_changes() {
        let mut pi = package_info("1.1.0");
        pi.status = Some(synced_status("1.0.0", Utc::now()));
        assert!(should_sync_from_repo(&pi));
    }

    #[test]
    fn unparsable_timestamp_forces_a_sync() {
        let mut pi = package_info("1.0.0");
        let mut status = synced_status("1.0.0", Utc::now());
        status.last_update_timestamp = Some("yesterday".to_owned());
        pi.status = Some(status);
        assert!(should_sync_from_repo(&pi));
    }

    #[test]
    fn initial_conditions_are_set_once() {
        let mut pi = package_info("1.0.0");
        assert!(ensure_initial_conditions(&mut pi));
        let conditions = &pi.status.as_ref().unwrap().conditions;
        let ready = get_condition(conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, "Unknown");
        assert_eq!(ready.reason, "Reconciling");
        assert_eq!(ready.message, "Starting reconciliation");

        assert!(!ensure_initial_conditions(&mut pi));
    }
}
