//! Package Manager Controller Library
//!
//! Core functionality of the package manager controller: the custom resource
//! types, dependency validation, value resolution and patch generation,
//! repository access and the reconcilers tying it all together.
//! Tests are included in the module files.

pub mod constants;
pub mod controller;
pub mod crd;
pub mod dependency;
pub mod labels;
pub mod manifest;
pub mod names;
pub mod observability;
pub mod repo;
pub mod server;
pub mod values;
pub mod versions;

pub use controller::{
    PackageInfoReconciler, PackageReconciler, PackageRepositoryReconciler, ReconcilerError,
};
pub use crd::{ClusterPackage, Package, PackageInfo, PackageRepository};
