//! # Custom Resource Definitions
//!
//! CRD types for the Package Manager Controller.
//!
//! This module contains all the Kubernetes Custom Resource Definition types
//! used by the controller, together with the manifest and value types shared
//! between them.
//!
//! ## Module Structure
//!
//! - `package.rs` - `Package` and `ClusterPackage` resources and the common trait
//! - `package_info.rs` - `PackageInfo` resource caching repository manifests
//! - `repository.rs` - `PackageRepository` resource
//! - `manifest.rs` - Package manifest as published in repositories
//! - `values.rs` - Value definitions and value configurations
//! - `owned.rs` - References to resources owned by a package
//! - `status.rs` - Status condition type shared by all resources

mod manifest;
mod owned;
mod package;
mod package_info;
mod repository;
mod status;
mod values;

// Re-export all public types
pub use manifest::{
    Component, Dependency, HelmManifest, KustomizeManifest, PackageEntrypoint, PackageManifest,
    PackageReference, PackageScope, PlainManifest,
};
pub use owned::{
    add_owned_resource_ref, contains_owned_resource_ref, remove_owned_resource_ref,
    OwnedResourceRef,
};
pub use package::{
    ClusterPackage, ClusterPackageSpec, Package, PackageInfoTemplate, PackageResource, PackageSpec,
    PackageStatus,
};
pub use package_info::{PackageInfo, PackageInfoSpec, PackageInfoStatus};
pub use repository::{
    PackageRepository, PackageRepositorySpec, PackageRepositoryStatus, RepositoryAuth,
    RepositoryBasicAuth, RepositoryBearerAuth, SecretKeyRef,
};
pub use status::{get_condition, is_condition_true, set_condition, Condition, ConditionStatus};
pub use values::{
    ObjectKeyValueSource, PackageValueSource, PartialJsonPatch, TargetResourceRef,
    ValueConfiguration, ValueDefinition, ValueDefinitionConstraints, ValueDefinitionMetadata,
    ValueDefinitionTarget, ValueReference, ValueType,
};
