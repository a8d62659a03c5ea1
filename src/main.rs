//! # Package Manager Controller
//!
//! A Kubernetes controller that installs and reconciles packages from
//! package repositories.
//!
//! ## Overview
//!
//! The controller watches four custom resources:
//!
//! 1. **`Package`** - a namespaced installation of a package
//! 2. **`ClusterPackage`** - a cluster-wide installation of a package
//! 3. **`PackageInfo`** - the manifest of one package version, synced from
//!    its repository
//! 4. **`PackageRepository`** - a repository serving packages, its health is
//!    reflected in the status
//!
//! For each package it keeps the companion `PackageInfo` up to date,
//! validates declared dependencies (installing missing required packages),
//! resolves configured values into patches and applies the package content
//! through the manifest adapters. Owned resources are tracked in the status
//! and pruned when they fall out of the desired set or when the package is
//! deleted.
//!
//! ## Features
//!
//! - **Dependency resolution**: version ranges are validated against already
//!   installed packages, missing dependencies are installed automatically
//! - **Value configuration**: values from literals, config maps, secrets or
//!   other packages are validated and patched into the installed resources
//! - **Helm and plain manifests**: helm charts are delegated to the flux
//!   helm-controller, plain manifests are applied directly
//! - **Prometheus metrics**: exposes metrics for monitoring and observability
//! - **Health probes**: HTTP endpoints for liveness and readiness checks

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use tracing::{error, info};

use package_manager_controller::constants::{
    DEFAULT_METRICS_PORT, DEFAULT_REPO_CACHE_MAX_AGE_SECS,
};
use package_manager_controller::controller::{
    PackageInfoReconciler, PackageReconciler, PackageRepositoryReconciler,
};
use package_manager_controller::crd::{ClusterPackage, Package, PackageInfo, PackageRepository};
use package_manager_controller::observability;
use package_manager_controller::repo::RepoClientset;
use package_manager_controller::server::{start_server, ServerState};

#[derive(Parser, Debug)]
#[command(name = "package-manager-controller", version, about)]
struct Args {
    /// Port of the HTTP server for metrics and probes
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Namespace the controller runs in, used to resolve repository
    /// credential secrets
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Maximum age of cached repository responses in seconds
    #[arg(long, default_value_t = DEFAULT_REPO_CACHE_MAX_AGE_SECS)]
    repo_cache_max_age: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "package_manager_controller=info".into()),
        )
        .init();

    info!(
        version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_GIT_HASH")),
        "Starting Package Manager Controller"
    );

    observability::register_metrics()?;

    let server_state = ServerState::new();
    let server_state_clone = server_state.clone();
    let server_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let repo = Arc::new(RepoClientset::with_max_cache_age(
        client.clone(),
        &args.namespace,
        Duration::from_secs(args.repo_cache_max_age),
    ));

    let package_reconciler = Arc::new(PackageReconciler::new(client.clone(), repo.clone()));
    let package_info_reconciler = Arc::new(PackageInfoReconciler::new(client.clone(), repo.clone()));
    let repository_reconciler = Arc::new(PackageRepositoryReconciler::new(client.clone(), repo));

    server_state.set_ready();

    // All four resources are watched across all namespaces. The four
    // controllers run until a shutdown signal arrives.
    let packages = Controller::new(
        Api::<Package>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        PackageReconciler::reconcile::<Package>,
        PackageReconciler::error_policy::<Package>,
        package_reconciler.clone(),
    )
    .for_each(|_| std::future::ready(()));

    let cluster_packages = Controller::new(
        Api::<ClusterPackage>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        PackageReconciler::reconcile::<ClusterPackage>,
        PackageReconciler::error_policy::<ClusterPackage>,
        package_reconciler,
    )
    .for_each(|_| std::future::ready(()));

    let package_infos = Controller::new(
        Api::<PackageInfo>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        PackageInfoReconciler::reconcile,
        PackageInfoReconciler::error_policy,
        package_info_reconciler,
    )
    .for_each(|_| std::future::ready(()));

    let repositories = Controller::new(
        Api::<PackageRepository>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(
        PackageRepositoryReconciler::reconcile,
        PackageRepositoryReconciler::error_policy,
        repository_reconciler,
    )
    .for_each(|_| std::future::ready(()));

    tokio::join!(packages, cluster_packages, package_infos, repositories);

    info!("Controller stopped");

    Ok(())
}
