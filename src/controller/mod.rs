//! # Controller
//!
//! Reconciliation loops of the package manager.
//!
//! - `conditions`: Ready and Failed condition handling on package resources
//! - `package_info`: syncs `PackageInfo` manifests from their repository
//! - `reconciler`: shared reconciliation of `Package` and `ClusterPackage`
//! - `repository`: surfaces repository health on `PackageRepository` resources
//! - `requeue`: requeue intervals shared by all reconcilers

pub mod conditions;
pub mod package_info;
pub mod reconciler;
pub mod repository;
pub mod requeue;

pub use package_info::PackageInfoReconciler;
pub use reconciler::{PackageReconciler, ReconcilerError};
pub use repository::PackageRepositoryReconciler;
