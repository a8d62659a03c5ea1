//! # PackageRepository Reconciliation
//!
//! Periodically fetches the package index of every `PackageRepository` and
//! reflects the outcome in the repository's Ready condition, so that a broken
//! URL or bad credentials show up on the repository itself instead of only on
//! the packages using it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, error};

use crate::controller::conditions::{self, ConditionReason};
use crate::controller::reconciler::ReconcilerError;
use crate::controller::requeue;
use crate::crd::PackageRepository;
use crate::observability::metrics;
use crate::repo::RepoClientset;

/// Context of the `PackageRepository` controller
pub struct PackageRepositoryReconciler {
    client: Client,
    repo: Arc<RepoClientset>,
}

impl std::fmt::Debug for PackageRepositoryReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRepositoryReconciler")
            .finish_non_exhaustive()
    }
}

impl PackageRepositoryReconciler {
    pub fn new(client: Client, repo: Arc<RepoClientset>) -> Self {
        Self { client, repo }
    }

    /// Controller entry point for one package repository
    pub async fn reconcile(
        repository: Arc<PackageRepository>,
        ctx: Arc<Self>,
    ) -> Result<Action, ReconcilerError> {
        let kind = PackageRepository::kind(&());
        metrics::increment_reconciliations(&kind);
        let start = Instant::now();
        let result = ctx.reconcile_repository(&repository).await;
        metrics::observe_reconciliation_duration(&kind, start.elapsed().as_secs_f64());
        result
    }

    pub fn error_policy(
        repository: Arc<PackageRepository>,
        err: &ReconcilerError,
        _ctx: Arc<Self>,
    ) -> Action {
        metrics::increment_reconciliation_errors(&PackageRepository::kind(&()));
        error!(repository = %repository.name_any(), "{err}");
        requeue::on_error()
    }

    async fn reconcile_repository(
        &self,
        repository: &PackageRepository,
    ) -> Result<Action, ReconcilerError> {
        let mut repository = repository.clone();
        let changed = match self.fetch_index_size(&repository).await {
            Ok(packages) => {
                debug!(
                    repository = %repository.name_any(),
                    packages,
                    "fetched repository index"
                );
                set_synced(&mut repository, packages)
            }
            Err(err) => {
                error!(
                    repository = %repository.name_any(),
                    "could not fetch repository index: {err:#}"
                );
                set_sync_failed(&mut repository, &format!("{err:#}"))
            }
        };
        if changed {
            self.update_status(&mut repository).await?;
        }
        Ok(requeue::always())
    }

    async fn fetch_index_size(&self, repository: &PackageRepository) -> Result<usize> {
        let client = self.repo.for_repo(repository).await?;
        let index = client.fetch_package_repo_index().await?;
        Ok(index.packages.len())
    }

    async fn update_status(&self, repository: &mut PackageRepository) -> Result<()> {
        let api: Api<PackageRepository> = Api::all(self.client.clone());
        let name = repository.name_any();
        let data =
            serde_json::to_vec(&*repository).context("could not serialize PackageRepository")?;
        *repository = api
            .replace_status(&name, &PostParams::default(), data)
            .await
            .context("could not update PackageRepository status")?;
        debug!(repository = %name, "status updated");
        Ok(())
    }
}

/// Returns true if the conditions changed
fn set_synced(repository: &mut PackageRepository, packages: usize) -> bool {
    let generation = repository.metadata.generation;
    let status = repository.status.get_or_insert_with(Default::default);
    conditions::set_ready(
        &mut status.conditions,
        generation,
        ConditionReason::SyncCompleted,
        &format!("repository serves {packages} packages"),
    )
}

fn set_sync_failed(repository: &mut PackageRepository, message: &str) -> bool {
    let generation = repository.metadata.generation;
    let status = repository.status.get_or_insert_with(Default::default);
    conditions::set_failed(
        &mut status.conditions,
        generation,
        ConditionReason::SyncFailed,
        message,
    )
}
