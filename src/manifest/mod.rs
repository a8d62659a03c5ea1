//! # Manifest Adapters
//!
//! A package manifest can carry installable content in different formats
//! (helm chart, kustomization, plain manifests). Each format is handled by
//! an adapter implementing [`ManifestAdapter`]. The reconciler selects the
//! adapters matching the non-empty manifest sections and refuses to run any
//! of them when one of the required formats has no adapter wired in.

use anyhow::Result;
use async_trait::async_trait;

use crate::crd::{PackageInfo, PackageManifest, PackageResource};
use crate::values::TargetPatches;

mod flux;
mod helm;
mod plain;
mod result;

pub use helm::FluxHelmAdapter;
pub use plain::PlainManifestAdapter;
pub use result::ReconcileResult;

/// Applies one manifest format on behalf of a package.
#[async_trait]
pub trait ManifestAdapter<P: PackageResource>: Send + Sync {
    /// Brings the installed resources in line with the manifest and reports
    /// whether they are ready, still rolling out or failed.
    ///
    /// Errors indicate that the adapter could not act at all, for example
    /// because the cluster was unreachable. Problems with the installed
    /// resources themselves are reported through the [`ReconcileResult`].
    async fn reconcile(
        &self,
        pkg: &P,
        package_info: &PackageInfo,
        manifest: &PackageManifest,
        patches: &TargetPatches,
    ) -> Result<ReconcileResult>;
}
