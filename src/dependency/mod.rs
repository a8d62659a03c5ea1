//! # Dependency Management
//!
//! Validates a package against the dependencies and components it declares
//! before it is installed, updated or deleted.
//!
//! Validation rebuilds a [`graph::DependencyGraph`] from the current cluster
//! state on every call, transiently adds the package under validation and
//! classifies each of its dependencies as satisfied, missing-but-resolvable
//! or conflicting. The graph is never shared between validations.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use semver::Version;

use crate::crd::{
    ClusterPackage, Package, PackageInfo, PackageManifest, PackageRepository, PackageResource,
};
use crate::names;
use crate::repo::RepoClientset;
use crate::versions::parse_version;

pub mod graph;

use graph::{DependencyError, DependencyErrorCause, DependencyGraph, PackageRef};

/// Read access to the package resources in the cluster, as far as dependency
/// validation needs it
#[async_trait]
pub trait PackageClientAdapter: Send + Sync {
    /// List all cluster packages
    async fn list_cluster_packages(&self) -> Result<Vec<ClusterPackage>>;

    /// List the packages of all namespaces
    async fn list_packages(&self) -> Result<Vec<Package>>;

    /// Get a package info by name. Returns an error if it does not exist
    async fn get_package_info(&self, name: &str) -> Result<PackageInfo>;
}

/// Read access to the package repositories, as far as dependency validation
/// needs it
#[async_trait]
pub trait RepoAdapter: Send + Sync {
    /// All known versions of a package
    async fn get_versions(&self, name: &str) -> Result<Vec<String>>;

    /// The manifest of a package in a specific version
    async fn get_manifest(&self, name: &str, version: &str) -> Result<PackageManifest>;
}

/// [`PackageClientAdapter`] implementation backed by the Kubernetes API
pub struct KubePackageClient {
    client: Client,
}

impl std::fmt::Debug for KubePackageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePackageClient").finish_non_exhaustive()
    }
}

impl KubePackageClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PackageClientAdapter for KubePackageClient {
    async fn list_cluster_packages(&self) -> Result<Vec<ClusterPackage>> {
        let api: Api<ClusterPackage> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let api: Api<Package> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        let api: Api<PackageInfo> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// [`RepoAdapter`] implementation that resolves each package to the single
/// repository it is available from
#[derive(Debug)]
pub struct DefaultRepoAdapter {
    client: Arc<RepoClientset>,
}

impl DefaultRepoAdapter {
    pub fn new(client: Arc<RepoClientset>) -> Self {
        Self { client }
    }

    async fn repo_for_package(&self, name: &str) -> Result<PackageRepository> {
        let mut repos = self.client.get_repos_for_package(name).await?;
        if repos.len() > 1 {
            bail!(
                "{} is available from {} repositories (currently unsupported)",
                name,
                repos.len()
            );
        }
        match repos.pop() {
            Some(repo) => Ok(repo),
            None => bail!("{name} is not available in any repository"),
        }
    }
}

#[async_trait]
impl RepoAdapter for DefaultRepoAdapter {
    async fn get_versions(&self, name: &str) -> Result<Vec<String>> {
        let repo = self.repo_for_package(name).await?;
        let index = self.client.for_repo(&repo).await?.fetch_package_index(name).await?;
        Ok(index.versions.into_iter().map(|item| item.version).collect())
    }

    async fn get_manifest(&self, name: &str, version: &str) -> Result<PackageManifest> {
        let repo = self.repo_for_package(name).await?;
        self.client.for_repo(&repo).await?.fetch_package_manifest(name, version).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResultStatus {
    Ok,
    Resolvable,
    Conflict,
}

impl std::fmt::Display for ValidationResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationResultStatus::Ok => write!(f, "OK"),
            ValidationResultStatus::Resolvable => write!(f, "RESOLVABLE"),
            ValidationResultStatus::Conflict => write!(f, "CONFLICT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageWithVersion {
    pub name: String,
    pub version: String,
}

/// Where a required package has to be installed when it is a sub-component
/// of its dependant. The resource name and namespace then differ from the
/// name the package has in the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMetadata {
    pub name: String,
    pub namespace: String,
}

/// A package that is not yet installed but required by the package under
/// validation, either directly or transitively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub package: PackageWithVersion,
    pub component: Option<ComponentMetadata>,
    pub transitive: bool,
}

/// An installed package whose version does not satisfy a constraint that the
/// package under validation puts on it
#[derive(Debug, Clone)]
pub struct Conflict {
    pub actual: PackageWithVersion,
    pub required: PackageWithVersion,
    pub cause: DependencyError,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (required: {}, actual: {})",
            self.required.name, self.required.version, self.actual.version
        )
    }
}

/// Joins conflicts for use in condition messages
pub fn conflicts_to_string(conflicts: &[Conflict]) -> String {
    conflicts.iter().map(Conflict::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub status: ValidationResultStatus,
    pub requirements: Vec<Requirement>,
    pub conflicts: Vec<Conflict>,
    /// Packages that would be removed together with the package under
    /// validation. Only set by [`DependencyManager::validate_delete`]
    pub pruned: Vec<PackageRef>,
}

/// Returns the graph identity of a package resource
pub fn package_ref<P: PackageResource>(pkg: &P) -> PackageRef {
    PackageRef {
        name: pkg.name_any(),
        namespace: if pkg.is_namespace_scoped() {
            pkg.namespace().unwrap_or_default()
        } else {
            String::new()
        },
        package_name: pkg.package_info().name.clone(),
    }
}

pub struct DependencyManager {
    pkg_client: Arc<dyn PackageClientAdapter>,
    repo_adapter: Arc<dyn RepoAdapter>,
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager").finish_non_exhaustive()
    }
}

impl DependencyManager {
    pub fn new(pkg_client: Arc<dyn PackageClientAdapter>, repo_client: Arc<RepoClientset>) -> Self {
        Self {
            pkg_client,
            repo_adapter: Arc::new(DefaultRepoAdapter::new(repo_client)),
        }
    }

    /// Creates a manager with a custom repository adapter
    pub fn with_repo_adapter(
        pkg_client: Arc<dyn PackageClientAdapter>,
        repo_adapter: Arc<dyn RepoAdapter>,
    ) -> Self {
        Self { pkg_client, repo_adapter }
    }

    /// Validates installing or updating `target` with the given manifest and
    /// version against the current cluster state.
    ///
    /// Dependencies that are missing but available from a repository are
    /// reported as requirements, installed dependencies that violate a
    /// version constraint as conflicts. Conflicts take precedence over
    /// requirements in the reported status.
    pub async fn validate(
        &self,
        target: &PackageRef,
        manifest: &PackageManifest,
        version: &str,
    ) -> Result<ValidationResult> {
        let mut g = self.new_graph().await?;

        // The initial graph, representing the current cluster state, may
        // itself be invalid: dependencies are created by the controller only
        // after the dependant already exists. These errors are kept so that
        // we can tell later whether an error was introduced by the change
        // under validation or existed before.
        let err_before = g.validate().err();

        self.add(&mut g, target, manifest, version)?;
        let mut requirements = self.add_dependencies(&mut g, target.clone(), false).await?;
        requirements.sort_by(|a, b| a.package.name.cmp(&b.package.name));

        let mut conflicts = Vec::new();
        if let Err(errors) = g.validate() {
            for error in errors.0 {
                if !is_error_new(&error, err_before.as_ref()) {
                    continue;
                }
                match &error.cause {
                    DependencyErrorCause::ConstraintViolated { version, constraint } => {
                        let actual = PackageWithVersion {
                            name: error.dependency.name.clone(),
                            version: version.to_string(),
                        };
                        let required = PackageWithVersion {
                            name: error.dependency.name.clone(),
                            version: constraint.to_string(),
                        };
                        conflicts.push(Conflict { actual, required, cause: error });
                    }
                    DependencyErrorCause::NotInstalled(_) => return Err(error.into()),
                }
            }
        }

        let mut status = ValidationResultStatus::Ok;
        if !requirements.is_empty() {
            status = ValidationResultStatus::Resolvable;
        }
        if !conflicts.is_empty() {
            status = ValidationResultStatus::Conflict;
        }
        Ok(ValidationResult {
            status,
            requirements,
            conflicts,
            pruned: Vec::new(),
        })
    }

    /// Validates deleting `target` against the current cluster state.
    ///
    /// Reports the packages that would be pruned together with it, and a
    /// conflict for every installed package whose dependencies would no
    /// longer be satisfied afterwards.
    pub async fn validate_delete(&self, target: &PackageRef) -> Result<ValidationResult> {
        let g = self.new_graph().await?;
        let err_before = g.validate().err();
        let (pruned, validation) = g.validate_delete(target);

        let mut conflicts = Vec::new();
        if let Err(errors) = validation {
            for error in errors.0 {
                if !is_error_new(&error, err_before.as_ref()) {
                    continue;
                }
                let (version, constraint) = match &error.cause {
                    DependencyErrorCause::ConstraintViolated { version, constraint } => {
                        (version.to_string(), constraint.to_string())
                    }
                    DependencyErrorCause::NotInstalled(_) => (String::new(), String::new()),
                };
                conflicts.push(Conflict {
                    actual: PackageWithVersion {
                        name: error.dependency.name.clone(),
                        version,
                    },
                    required: PackageWithVersion {
                        name: error.dependency.name.clone(),
                        version: constraint,
                    },
                    cause: error,
                });
            }
        }

        let status = if conflicts.is_empty() {
            ValidationResultStatus::Ok
        } else {
            ValidationResultStatus::Conflict
        };
        Ok(ValidationResult {
            status,
            requirements: Vec::new(),
            conflicts,
            pruned,
        })
    }

    /// Constructs a graph of all packages and cluster packages that currently
    /// exist in the cluster
    pub async fn new_graph(&self) -> Result<DependencyGraph> {
        let mut g = DependencyGraph::new();
        for pkg in self.pkg_client.list_cluster_packages().await? {
            self.add_existing(&mut g, &pkg).await?;
        }
        for pkg in self.pkg_client.list_packages().await? {
            self.add_existing(&mut g, &pkg).await?;
        }
        Ok(g)
    }

    async fn add_existing<P: PackageResource>(&self, g: &mut DependencyGraph, pkg: &P) -> Result<()> {
        let target = package_ref(pkg);
        let mut manifest = PackageManifest::default();
        let mut version = pkg.package_info().version.clone();
        if pkg.is_being_deleted() {
            // A package that is currently being deleted is added to the
            // graph in a state representing "not installed"
            version = String::new();
        } else {
            let info = self.pkg_client.get_package_info(&names::package_info_name(pkg)).await?;
            if let Some(m) = info.status.and_then(|status| status.manifest) {
                manifest = m;
            }
        }
        g.add_or_update(&target, &manifest, &version, !pkg.installed_as_dependency())?;
        Ok(())
    }

    fn add(
        &self,
        g: &mut DependencyGraph,
        target: &PackageRef,
        manifest: &PackageManifest,
        version: &str,
    ) -> Result<()> {
        let manual = g.manual(target);
        g.add_or_update(target, manifest, version, manual)?;
        Ok(())
    }

    /// Adds the highest installable version of every uninstalled dependency
    /// of `target` to the graph, recursing into transitive dependencies
    fn add_dependencies<'a>(
        &'a self,
        g: &'a mut DependencyGraph,
        target: PackageRef,
        transitive: bool,
    ) -> BoxFuture<'a, Result<Vec<Requirement>>> {
        Box::pin(async move {
            let mut all_added = Vec::new();
            for dep in g.dependencies(&target) {
                if g.version(&dep).is_some() {
                    continue;
                }
                let (raw, parsed) = self.get_versions(&dep.package_name).await?;
                let max = match g.max(&dep, &parsed) {
                    Ok(max) => max,
                    // No suitable version exists. The dependency is not
                    // added and the final validation reports it as unmet.
                    Err(_) => continue,
                };
                let version = original_version(&raw, &parsed, &max);
                let dep_manifest = self.repo_adapter.get_manifest(&dep.package_name, &version).await?;
                self.add(&mut *g, &dep, &dep_manifest, &version)?;
                let mut added = self.add_dependencies(&mut *g, dep.clone(), true).await?;
                all_added.push(Requirement {
                    package: PackageWithVersion {
                        name: dep_manifest.name.clone(),
                        version,
                    },
                    component: component_metadata(&dep),
                    transitive,
                });
                all_added.append(&mut added);
            }
            Ok(all_added)
        })
    }

    async fn get_versions(&self, name: &str) -> Result<(Vec<String>, Vec<Version>)> {
        let raw = self.repo_adapter.get_versions(name).await?;
        let parsed = raw
            .iter()
            .map(|version| parse_version(version))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((raw, parsed))
    }
}

/// The version string as the repository lists it, looked up by its parsed
/// representation
fn original_version(raw: &[String], parsed: &[Version], version: &Version) -> String {
    parsed
        .iter()
        .position(|v| v == version)
        .map_or_else(|| version.to_string(), |idx| raw[idx].clone())
}

/// Sub-components keep their own resource name and namespace, which differ
/// from the name the package has in the repository
fn component_metadata(dep: &PackageRef) -> Option<ComponentMetadata> {
    if dep.name != dep.package_name || !dep.namespace.is_empty() {
        Some(ComponentMetadata {
            name: dep.name.clone(),
            namespace: dep.namespace.clone(),
        })
    } else {
        None
    }
}

/// Whether `current` concerns a dependant/dependency pair that did not
/// already have an error before the change under validation
fn is_error_new(current: &DependencyError, before: Option<&graph::DependencyErrors>) -> bool {
    let Some(before) = before else {
        return true;
    };
    !before.0.iter().any(|err| {
        err.dependant.name == current.dependant.name
            && err.dependant.namespace == current.dependant.namespace
            && err.dependency.name == current.dependency.name
            && err.dependency.namespace == current.dependency.namespace
    })
}
