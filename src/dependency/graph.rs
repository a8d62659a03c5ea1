//! # Dependency Graph
//!
//! In-memory model of every package installation in the cluster and the
//! dependency relations between them. The graph is built from the current
//! cluster state, then mutated to simulate the installation, upgrade or
//! deletion that is being validated. Simulations for deletion run on a deep
//! copy so the live graph stays untouched.
//!
//! Vertices are keyed by installation name and namespace. A vertex that is
//! referenced as a dependency target but not installed is kept with an unset
//! version so that validation can report it as missing.

use semver::{Version, VersionReq};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crd::{Component, PackageManifest};
use crate::versions::{cmp_with_build, parse_constraint, parse_version};

/// Identity of one package installation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageRef {
    /// Name of the installation
    pub name: String,
    /// Namespace of the installation, empty for cluster-scoped packages
    pub namespace: String,
    /// Name of the package in the repository. Differs from `name` for
    /// component installations
    pub package_name: String,
}

impl PackageRef {
    /// Reference to a cluster-scoped installation named after its package
    pub fn cluster(name: &str) -> Self {
        PackageRef {
            name: name.to_owned(),
            namespace: String::new(),
            package_name: name.to_owned(),
        }
    }

    pub fn namespaced(name: &str, namespace: &str, package_name: &str) -> Self {
        PackageRef {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            package_name: package_name.to_owned(),
        }
    }
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no matching version for {0} found")]
    NoMatchingVersion(PackageRef),
    #[error(transparent)]
    InvalidVersion(#[from] semver::Error),
}

/// A single unmet dependency found by [`DependencyGraph::validate`]
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unmet dependency {dependant} -> {dependency}: {cause}")]
pub struct DependencyError {
    pub dependant: PackageRef,
    pub dependency: PackageRef,
    pub cause: DependencyErrorCause,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DependencyErrorCause {
    #[error("{0} not installed")]
    NotInstalled(PackageRef),
    #[error("constraint {constraint} violated by version {version}")]
    ConstraintViolated {
        version: Version,
        constraint: VersionReq,
    },
}

/// All unmet dependencies of a graph
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DependencyErrors(pub Vec<DependencyError>);

impl std::fmt::Display for DependencyErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DependencyErrors {}

type VertexKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
struct Vertex {
    package_name: String,
    version: Option<Version>,
    manual: bool,
    edges: BTreeMap<VertexKey, Edge>,
}

#[derive(Debug, Clone, PartialEq)]
struct Edge {
    constraint: Option<VersionReq>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DependencyGraph {
    vertices: BTreeMap<VertexKey, Vertex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Simulates installing or updating a package by
    /// 1. Creating a vertex if necessary
    /// 2. Setting its version and manual flag and
    /// 3. Replacing the outgoing edges of the vertex according to the
    ///    dependencies and components declared in the manifest
    ///
    /// An empty version is treated as "not installed": the vertex is kept
    /// but its version, manual flag and edges are cleared.
    pub fn add_or_update(
        &mut self,
        pkg: &PackageRef,
        manifest: &PackageManifest,
        version: &str,
        manual: bool,
    ) -> Result<(), GraphError> {
        if version.is_empty() {
            self.delete(pkg);
            self.ensure_vertex(pkg);
            return Ok(());
        }

        let parsed_version = parse_version(version)?;

        // Parse all constraints and resolve all edge targets up front, so a
        // malformed manifest does not leave the graph partially updated
        let mut edges = BTreeMap::new();
        for dep in &manifest.dependencies {
            let constraint = if dep.version.is_empty() {
                None
            } else {
                Some(parse_constraint(&dep.version)?)
            };
            let target = PackageRef::cluster(&dep.name);
            edges.insert(target, Edge { constraint });
        }
        for cmp in &manifest.components {
            let constraint = if cmp.version.is_empty() {
                None
            } else {
                Some(parse_constraint(&cmp.version)?)
            };
            let target = component_ref(pkg, manifest, cmp);
            edges.insert(target, Edge { constraint });
        }

        self.ensure_vertex(pkg);
        for target in edges.keys() {
            self.ensure_vertex(target);
        }
        if let Some(vertex) = self.vertices.get_mut(&key_of(pkg)) {
            vertex.package_name = pkg.package_name.clone();
            vertex.version = Some(parsed_version);
            vertex.manual = manual;
            vertex.edges = edges.into_iter().map(|(r, e)| (key_of(&r), e)).collect();
        }
        Ok(())
    }

    /// Returns the installed version of a package, or `None` if that
    /// package is not installed
    pub fn version(&self, pkg: &PackageRef) -> Option<&Version> {
        self.vertices.get(&key_of(pkg)).and_then(|v| v.version.as_ref())
    }

    /// Returns whether a package has been installed manually by a user
    pub fn manual(&self, pkg: &PackageRef) -> bool {
        self.vertices.get(&key_of(pkg)).is_some_and(|v| v.manual)
    }

    /// Returns the packages that this package depends on
    pub fn dependencies(&self, pkg: &PackageRef) -> Vec<PackageRef> {
        match self.vertices.get(&key_of(pkg)) {
            Some(vertex) => vertex.edges.keys().map(|k| self.ref_for(k)).collect(),
            None => Vec::new(),
        }
    }

    /// Returns the installed packages that depend on this package
    pub fn dependants(&self, pkg: &PackageRef) -> Vec<PackageRef> {
        let target = key_of(pkg);
        self.vertices
            .iter()
            .filter(|(_, vertex)| vertex.version.is_some() && vertex.edges.contains_key(&target))
            .map(|(k, _)| self.ref_for(k))
            .collect()
    }

    /// Returns all constraints that installed dependants put on this package
    pub fn constraints(&self, pkg: &PackageRef) -> Vec<VersionReq> {
        let target = key_of(pkg);
        self.vertices
            .values()
            .filter(|vertex| vertex.version.is_some())
            .filter_map(|vertex| vertex.edges.get(&target))
            .filter_map(|edge| edge.constraint.clone())
            .collect()
    }

    /// Returns the maximum of `versions` that does not violate any
    /// constraint put on this package.
    ///
    /// Build metadata is taken into account when comparing candidates but
    /// ignored when checking constraints.
    pub fn max(&self, pkg: &PackageRef, versions: &[Version]) -> Result<Version, GraphError> {
        let constraints = self.constraints(pkg);
        let mut max_version: Option<&Version> = None;
        for version in versions {
            let better = match max_version {
                Some(current) => cmp_with_build(current, version) == Ordering::Less,
                None => true,
            };
            if better && constraints.iter().all(|c| c.matches(version)) {
                max_version = Some(version);
            }
        }
        max_version
            .cloned()
            .ok_or_else(|| GraphError::NoMatchingVersion(pkg.clone()))
    }

    /// Simulates uninstalling a package.
    ///
    /// The vertex is not removed from the graph, as it may still be
    /// referenced by other packages and needs to be kept for validation.
    /// Instead, its version and manual flag are unset and its edges are
    /// cleared. Returns whether the package was installed.
    pub fn delete(&mut self, pkg: &PackageRef) -> bool {
        match self.vertices.get_mut(&key_of(pkg)) {
            Some(vertex) => {
                let deleted = vertex.version.is_some();
                vertex.version = None;
                vertex.manual = false;
                vertex.edges = BTreeMap::new();
                deleted
            }
            None => false,
        }
    }

    /// Deletes all vertices for which all of the following applies:
    /// 1. It has not been installed manually
    /// 2. It does not have any dependants
    ///
    /// Iterates until a fixpoint is reached, because deleting one vertex
    /// may orphan another. Returns the deleted packages.
    pub fn prune(&mut self) -> Vec<PackageRef> {
        let mut removed = Vec::new();
        let mut stable = false;
        while !stable {
            stable = true;
            let keys: Vec<VertexKey> = self.vertices.keys().cloned().collect();
            for key in keys {
                let pkg = self.ref_for(&key);
                let manual = self.vertices.get(&key).is_some_and(|v| v.manual);
                if !manual && self.dependants(&pkg).is_empty() && self.delete(&pkg) {
                    stable = false;
                    removed.push(pkg);
                }
            }
        }
        removed
    }

    /// Deletes a package and prunes everything orphaned by that.
    /// Returns the deleted packages, starting with the given one
    pub fn delete_and_prune(&mut self, pkg: &PackageRef) -> Vec<PackageRef> {
        let full_ref = self.ref_for(&key_of(pkg));
        if self.delete(pkg) {
            let mut removed = vec![full_ref];
            removed.extend(self.prune());
            removed
        } else {
            Vec::new()
        }
    }

    /// Previews the effect of deleting a package on a deep copy, without
    /// mutating this graph. Returns the packages that would be removed and
    /// the validation outcome of the remaining graph
    pub fn validate_delete(
        &self,
        pkg: &PackageRef,
    ) -> (Vec<PackageRef>, Result<(), DependencyErrors>) {
        let mut copy = self.clone();
        let pruned = copy.delete_and_prune(pkg);
        (pruned, copy.validate())
    }

    /// Checks the consistency of the entire graph:
    /// 1. Every dependency target must be installed
    /// 2. No version constraint may be violated
    pub fn validate(&self) -> Result<(), DependencyErrors> {
        let mut errors = Vec::new();
        for (key, vertex) in &self.vertices {
            for (dep_key, edge) in &vertex.edges {
                let dependant = self.ref_for(key);
                let dependency = self.ref_for(dep_key);
                match self.vertices.get(dep_key).and_then(|v| v.version.as_ref()) {
                    None => errors.push(DependencyError {
                        dependant,
                        cause: DependencyErrorCause::NotInstalled(dependency.clone()),
                        dependency,
                    }),
                    Some(version) => {
                        if let Some(constraint) = &edge.constraint {
                            if !constraint.matches(version) {
                                errors.push(DependencyError {
                                    dependant,
                                    dependency,
                                    cause: DependencyErrorCause::ConstraintViolated {
                                        version: version.clone(),
                                        constraint: constraint.clone(),
                                    },
                                });
                            }
                        }
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DependencyErrors(errors))
        }
    }

    fn ensure_vertex(&mut self, pkg: &PackageRef) {
        self.vertices.entry(key_of(pkg)).or_insert_with(|| Vertex {
            package_name: pkg.package_name.clone(),
            version: None,
            manual: false,
            edges: BTreeMap::new(),
        });
    }

    fn ref_for(&self, key: &VertexKey) -> PackageRef {
        let package_name = self
            .vertices
            .get(key)
            .map_or_else(|| key.0.clone(), |v| v.package_name.clone());
        PackageRef {
            name: key.0.clone(),
            namespace: key.1.clone(),
            package_name,
        }
    }
}

fn key_of(pkg: &PackageRef) -> VertexKey {
    (pkg.name.clone(), pkg.namespace.clone())
}

/// Derives the installation reference of a component.
///
/// The installation is named after its parent plus the component's
/// installed name. It lives in the parent's namespace, falling back to the
/// manifest default namespace for cluster-scoped parents.
fn component_ref(parent: &PackageRef, manifest: &PackageManifest, cmp: &Component) -> PackageRef {
    let installed_name = if cmp.installed_name.is_empty() {
        &cmp.name
    } else {
        &cmp.installed_name
    };
    let namespace = if parent.namespace.is_empty() {
        manifest.default_namespace.clone()
    } else {
        parent.namespace.clone()
    };
    PackageRef {
        name: format!("{}-{}", parent.name, installed_name),
        namespace,
        package_name: cmp.name.clone(),
    }
}
