//! # Dependency Validation Tests
//!
//! Integration tests for the dependency manager, driving full validations
//! against in-memory cluster state and repository contents.
//!
//! These tests verify:
//! - Installed dependencies validate as OK
//! - Missing dependencies are reported as resolvable requirements
//! - Requirement versions respect the constraints of installed dependants
//! - Version conflicts are detected and attributed to the change under validation
//! - Delete validation reports pruned packages and broken dependants

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use package_manager_controller::crd::{
    ClusterPackage, ClusterPackageSpec, Component, Dependency, Package, PackageInfo,
    PackageInfoSpec, PackageInfoStatus, PackageInfoTemplate, PackageManifest, PackageResource,
    PackageSpec,
};
use package_manager_controller::dependency::graph::PackageRef;
use package_manager_controller::dependency::{
    conflicts_to_string, ComponentMetadata, DependencyManager, PackageClientAdapter,
    PackageWithVersion, RepoAdapter, Requirement, ValidationResultStatus,
};
use package_manager_controller::names;

/// Cluster state served to the dependency manager, as if listed from the
/// Kubernetes API
#[derive(Default)]
struct InMemoryPackages {
    cluster_packages: Vec<ClusterPackage>,
    packages: Vec<Package>,
    package_infos: Vec<PackageInfo>,
}

impl InMemoryPackages {
    fn with_cluster_package(
        mut self,
        version: &str,
        manifest: &PackageManifest,
        installed_as_dependency: bool,
    ) -> Self {
        let mut pkg = ClusterPackage::new(
            &manifest.name,
            ClusterPackageSpec {
                package_info: PackageInfoTemplate {
                    name: manifest.name.clone(),
                    version: version.to_owned(),
                    repository_name: String::new(),
                },
                ..ClusterPackageSpec::default()
            },
        );
        pkg.set_installed_as_dependency(installed_as_dependency);
        self.package_infos.push(package_info_for(&pkg, manifest));
        self.cluster_packages.push(pkg);
        self
    }

    fn with_package(mut self, namespace: &str, version: &str, manifest: &PackageManifest) -> Self {
        let mut pkg = Package::new(
            &manifest.name,
            PackageSpec {
                package_info: PackageInfoTemplate {
                    name: manifest.name.clone(),
                    version: version.to_owned(),
                    repository_name: String::new(),
                },
                ..PackageSpec::default()
            },
        );
        pkg.metadata.namespace = Some(namespace.to_owned());
        self.package_infos.push(package_info_for(&pkg, manifest));
        self.packages.push(pkg);
        self
    }
}

#[async_trait]
impl PackageClientAdapter for InMemoryPackages {
    async fn list_cluster_packages(&self) -> Result<Vec<ClusterPackage>> {
        Ok(self.cluster_packages.clone())
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(self.packages.clone())
    }

    async fn get_package_info(&self, name: &str) -> Result<PackageInfo> {
        self.package_infos
            .iter()
            .find(|info| info.name_any() == name)
            .cloned()
            .ok_or_else(|| anyhow!("PackageInfo {name} not found"))
    }
}

/// Repository contents served to the dependency manager
#[derive(Default)]
struct InMemoryRepo {
    entries: Vec<(String, PackageManifest)>,
}

impl InMemoryRepo {
    fn with(mut self, version: &str, manifest: &PackageManifest) -> Self {
        self.entries.push((version.to_owned(), manifest.clone()));
        self
    }
}

#[async_trait]
impl RepoAdapter for InMemoryRepo {
    async fn get_versions(&self, name: &str) -> Result<Vec<String>> {
        let versions: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, manifest)| manifest.name == name)
            .map(|(version, _)| version.clone())
            .collect();
        if versions.is_empty() {
            bail!("{name} is not available in any repository");
        }
        Ok(versions)
    }

    async fn get_manifest(&self, name: &str, version: &str) -> Result<PackageManifest> {
        self.entries
            .iter()
            .find(|(v, manifest)| manifest.name == name && v.as_str() == version)
            .map(|(_, manifest)| manifest.clone())
            .ok_or_else(|| anyhow!("no manifest for {name} in version {version}"))
    }
}

fn manager(state: InMemoryPackages, repo: InMemoryRepo) -> DependencyManager {
    DependencyManager::with_repo_adapter(Arc::new(state), Arc::new(repo))
}

fn manifest(name: &str, deps: &[(&str, &str)]) -> PackageManifest {
    PackageManifest {
        name: name.into(),
        dependencies: deps
            .iter()
            .map(|(dep_name, constraint)| Dependency {
                name: (*dep_name).into(),
                version: (*constraint).into(),
            })
            .collect(),
        ..Default::default()
    }
}

fn package_info_for<P: PackageResource>(pkg: &P, manifest: &PackageManifest) -> PackageInfo {
    let template = pkg.package_info();
    let mut info = PackageInfo::new(
        &names::package_info_name(pkg),
        PackageInfoSpec {
            name: template.name.clone(),
            version: template.version.clone(),
            repository_name: template.repository_name.clone(),
        },
    );
    info.status = Some(PackageInfoStatus {
        manifest: Some(manifest.clone()),
        version: template.version.clone(),
        ..PackageInfoStatus::default()
    });
    info
}

#[tokio::test]
async fn test_validate_ok_when_all_dependencies_installed() {
    let bar = manifest("bar", &[]);
    let state = InMemoryPackages::default().with_cluster_package("1.0.0", &bar, false);
    let mgr = manager(state, InMemoryRepo::default());

    let foo = manifest("foo", &[("bar", "1.x.x")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Ok);
    assert!(result.requirements.is_empty());
    assert!(result.conflicts.is_empty());
    assert!(result.pruned.is_empty());
}

#[tokio::test]
async fn test_validate_reports_missing_dependency_as_requirement() {
    let bar = manifest("bar", &[]);
    let repo = InMemoryRepo::default()
        .with("1.0.0", &bar)
        .with("1.2.0", &bar)
        .with("2.0.0", &bar);
    let mgr = manager(InMemoryPackages::default(), repo);

    let foo = manifest("foo", &[("bar", "1.x.x")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Resolvable);
    assert!(result.conflicts.is_empty());
    // The highest version satisfying foo's constraint is picked
    assert_eq!(
        result.requirements,
        vec![Requirement {
            package: PackageWithVersion {
                name: "bar".into(),
                version: "1.2.0".into(),
            },
            component: None,
            transitive: false,
        }]
    );
}

#[tokio::test]
async fn test_validate_flags_transitive_requirements() {
    let baz = manifest("baz", &[]);
    let bar = manifest("bar", &[("baz", "")]);
    let repo = InMemoryRepo::default().with("1.2.0", &bar).with("0.5.0", &baz);
    let mgr = manager(InMemoryPackages::default(), repo);

    let foo = manifest("foo", &[("bar", "")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Resolvable);
    assert_eq!(result.requirements.len(), 2);
    assert_eq!(result.requirements[0].package.name, "bar");
    assert!(!result.requirements[0].transitive);
    assert_eq!(result.requirements[1].package.name, "baz");
    assert!(result.requirements[1].transitive);
}

#[tokio::test]
async fn test_requirement_version_satisfies_installed_dependants() {
    let bar = manifest("bar", &[]);
    let foo = manifest("foo", &[("bar", ">=1.0.0")]);
    let state = InMemoryPackages::default().with_cluster_package("1.0.0", &foo, false);
    let repo = InMemoryRepo::default()
        .with("0.9.0", &bar)
        .with("1.2.0", &bar)
        .with("2.0.0", &bar);
    let mgr = manager(state, repo);

    let baz = manifest("baz", &[("bar", "<1.5.0")]);
    let result = mgr
        .validate(&PackageRef::cluster("baz"), &baz, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Resolvable);
    assert_eq!(result.requirements.len(), 1);
    // 2.0.0 violates baz's constraint, 0.9.0 the one of the installed foo
    assert_eq!(result.requirements[0].package.version, "1.2.0");
}

#[tokio::test]
async fn test_validate_reports_version_conflict() {
    let bar = manifest("bar", &[]);
    let state = InMemoryPackages::default().with_cluster_package("1.0.0", &bar, false);
    let mgr = manager(state, InMemoryRepo::default());

    let foo = manifest("foo", &[("bar", ">=2.0.0")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Conflict);
    assert!(result.requirements.is_empty());
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(
        conflict.actual,
        PackageWithVersion {
            name: "bar".into(),
            version: "1.0.0".into(),
        }
    );
    assert_eq!(conflict.required.version, ">=2.0.0");
    assert_eq!(
        conflicts_to_string(&result.conflicts),
        "bar (required: >=2.0.0, actual: 1.0.0)"
    );
}

#[tokio::test]
async fn test_conflicts_take_precedence_over_requirements() {
    let bar = manifest("bar", &[]);
    let qux = manifest("qux", &[]);
    let state = InMemoryPackages::default().with_cluster_package("1.0.0", &bar, false);
    let repo = InMemoryRepo::default().with("1.0.0", &qux);
    let mgr = manager(state, repo);

    let foo = manifest("foo", &[("bar", ">=2.0.0"), ("qux", "")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Conflict);
    assert_eq!(result.requirements.len(), 1);
    assert_eq!(result.requirements[0].package.name, "qux");
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].actual.version, "1.0.0");
}

#[tokio::test]
async fn test_validate_ignores_preexisting_conflicts() {
    let bar = manifest("bar", &[]);
    let foo = manifest("foo", &[("bar", ">=2.0.0")]);
    let state = InMemoryPackages::default()
        .with_cluster_package("1.0.0", &bar, false)
        .with_cluster_package("1.0.0", &foo, false);
    let mgr = manager(state, InMemoryRepo::default());

    // foo's conflict with bar exists independently of the package under
    // validation and must not be attributed to it
    let baz = manifest("baz", &[]);
    let result = mgr
        .validate(&PackageRef::cluster("baz"), &baz, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Ok);
    assert!(result.conflicts.is_empty());
}

#[tokio::test]
async fn test_validate_fails_when_no_version_satisfies_constraints() {
    let bar = manifest("bar", &[]);
    let repo = InMemoryRepo::default().with("1.0.0", &bar);
    let mgr = manager(InMemoryPackages::default(), repo);

    let foo = manifest("foo", &[("bar", ">=2.0.0")]);
    let err = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not installed"));
}

#[tokio::test]
async fn test_validate_reports_component_install_metadata() {
    let postgres = manifest("postgresql", &[]);
    let repo = InMemoryRepo::default().with("16.0.0", &postgres);
    let mgr = manager(InMemoryPackages::default(), repo);

    let mut gitea = manifest("gitea", &[]);
    gitea.default_namespace = "gitea".into();
    gitea.components = vec![Component {
        name: "postgresql".into(),
        installed_name: "db".into(),
        version: String::new(),
    }];
    let result = mgr
        .validate(&PackageRef::cluster("gitea"), &gitea, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Resolvable);
    assert_eq!(
        result.requirements,
        vec![Requirement {
            package: PackageWithVersion {
                name: "postgresql".into(),
                version: "16.0.0".into(),
            },
            component: Some(ComponentMetadata {
                name: "gitea-db".into(),
                namespace: "gitea".into(),
            }),
            transitive: false,
        }]
    );
}

#[tokio::test]
async fn test_package_being_deleted_counts_as_not_installed() {
    let bar = manifest("bar", &[]);
    let mut state = InMemoryPackages::default().with_cluster_package("1.0.0", &bar, false);
    state.cluster_packages[0].metadata.deletion_timestamp = Some(Time(Utc::now()));
    let repo = InMemoryRepo::default().with("1.0.0", &bar);
    let mgr = manager(state, repo);

    let foo = manifest("foo", &[("bar", "")]);
    let result = mgr
        .validate(&PackageRef::cluster("foo"), &foo, "1.0.0")
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Resolvable);
    assert_eq!(result.requirements.len(), 1);
    assert_eq!(result.requirements[0].package.name, "bar");
}

#[tokio::test]
async fn test_validate_delete_reports_pruned_dependencies() {
    let bar = manifest("bar", &[]);
    let foo = manifest("foo", &[("bar", "")]);
    let state = InMemoryPackages::default()
        .with_cluster_package("1.0.0", &bar, true)
        .with_cluster_package("1.0.0", &foo, false);
    let mgr = manager(state, InMemoryRepo::default());

    let result = mgr
        .validate_delete(&PackageRef::cluster("foo"))
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Ok);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.pruned.len(), 2);
    assert_eq!(result.pruned[0], PackageRef::cluster("foo"));
    assert!(result.pruned.contains(&PackageRef::cluster("bar")));
}

#[tokio::test]
async fn test_validate_delete_reports_broken_dependants() {
    let lib = manifest("lib", &[]);
    let app = manifest("app", &[("lib", "")]);
    let state = InMemoryPackages::default()
        .with_cluster_package("1.0.0", &lib, false)
        .with_cluster_package("1.0.0", &app, false);
    let mgr = manager(state, InMemoryRepo::default());

    let result = mgr
        .validate_delete(&PackageRef::cluster("lib"))
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Conflict);
    assert_eq!(result.pruned, vec![PackageRef::cluster("lib")]);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].actual.name, "lib");
    assert!(result.conflicts[0].actual.version.is_empty());
}

#[tokio::test]
async fn test_validate_delete_sees_namespaced_dependants() {
    let lib = manifest("lib", &[]);
    let app = manifest("app", &[("lib", "")]);
    let state = InMemoryPackages::default()
        .with_cluster_package("1.0.0", &lib, true)
        .with_package("tools", "1.0.0", &app);
    let mgr = manager(state, InMemoryRepo::default());

    let result = mgr
        .validate_delete(&PackageRef::cluster("lib"))
        .await
        .unwrap();

    assert_eq!(result.status, ValidationResultStatus::Conflict);
    assert_eq!(result.conflicts[0].cause.dependant.namespace, "tools");
}
