//! # Package Custom Resources
//!
//! `ClusterPackage` is the cluster-scoped installation of a package,
//! `Package` the namespace-scoped one. Both share the same spec and status
//! shape and are reconciled by the same logic, abstracted over the
//! [`PackageResource`] trait.

use kube::{Api, Client, CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::owned::OwnedResourceRef;
use super::status::Condition;
use super::values::ValueConfiguration;
use crate::constants::INSTALLED_AS_DEPENDENCY_ANNOTATION;

/// Reference to the package version that should be installed
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfoTemplate {
    /// Name of the package in the repository
    pub name: String,
    /// Version of the package to install
    pub version: String,
    /// Name of the `PackageRepository` to fetch the package from.
    /// The default repository is used when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_name: String,
}

/// Status shared by `Package` and `ClusterPackage`
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Version that is currently installed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Resources installed on behalf of this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_resources: Vec<OwnedResourceRef>,
    /// Package infos created on behalf of this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_package_infos: Vec<OwnedResourceRef>,
    /// Packages installed on behalf of this package to satisfy dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_packages: Vec<OwnedResourceRef>,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-management.microscaler.io",
    version = "v1",
    kind = "Package",
    namespaced,
    status = "PackageStatus",
    printcolumn = r#"{"name":"Desired version", "type":"string", "jsonPath":".spec.packageInfo.version"}, {"name":"Installed version", "type":"string", "jsonPath":".status.version"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub package_info: PackageInfoTemplate,
    /// Configured values, keyed by value definition name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, ValueConfiguration>,
    /// Suspends reconciliation of this package when set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspend: bool,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-management.microscaler.io",
    version = "v1",
    kind = "ClusterPackage",
    status = "PackageStatus",
    printcolumn = r#"{"name":"Desired version", "type":"string", "jsonPath":".spec.packageInfo.version"}, {"name":"Installed version", "type":"string", "jsonPath":".status.version"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPackageSpec {
    pub package_info: PackageInfoTemplate,
    /// Configured values, keyed by value definition name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, ValueConfiguration>,
    /// Suspends reconciliation of this package when set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspend: bool,
}

/// Common behavior of `Package` and `ClusterPackage`, so that the
/// reconciler and the dependency manager can treat both uniformly
pub trait PackageResource:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + Sized
    + 'static
{
    fn package_info(&self) -> &PackageInfoTemplate;

    fn values(&self) -> &BTreeMap<String, ValueConfiguration>;

    fn suspended(&self) -> bool;

    fn status(&self) -> Option<&PackageStatus>;

    fn status_mut(&mut self) -> &mut PackageStatus;

    fn is_namespace_scoped(&self) -> bool;

    /// Returns an API handle scoped correctly for this object
    fn api(&self, client: Client) -> Api<Self>;

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// True if this package was installed to satisfy a dependency
    /// rather than by an explicit user request
    fn installed_as_dependency(&self) -> bool {
        self.annotations()
            .get(INSTALLED_AS_DEPENDENCY_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    fn set_installed_as_dependency(&mut self, value: bool) {
        if value {
            self.annotations_mut()
                .insert(INSTALLED_AS_DEPENDENCY_ANNOTATION.to_owned(), "true".to_owned());
        } else {
            self.annotations_mut().remove(INSTALLED_AS_DEPENDENCY_ANNOTATION);
        }
    }

    /// "namespace/name" for namespaced packages, "name" otherwise
    fn display_name(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name_any()),
            None => self.name_any(),
        }
    }
}

impl PackageResource for Package {
    fn package_info(&self) -> &PackageInfoTemplate {
        &self.spec.package_info
    }

    fn values(&self) -> &BTreeMap<String, ValueConfiguration> {
        &self.spec.values
    }

    fn suspended(&self) -> bool {
        self.spec.suspend
    }

    fn status(&self) -> Option<&PackageStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut PackageStatus {
        self.status.get_or_insert_with(PackageStatus::default)
    }

    fn is_namespace_scoped(&self) -> bool {
        true
    }

    fn api(&self, client: Client) -> Api<Self> {
        Api::namespaced(client, self.namespace().unwrap_or_default().as_str())
    }
}

impl PackageResource for ClusterPackage {
    fn package_info(&self) -> &PackageInfoTemplate {
        &self.spec.package_info
    }

    fn values(&self) -> &BTreeMap<String, ValueConfiguration> {
        &self.spec.values
    }

    fn suspended(&self) -> bool {
        self.spec.suspend
    }

    fn status(&self) -> Option<&PackageStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut PackageStatus {
        self.status.get_or_insert_with(PackageStatus::default)
    }

    fn is_namespace_scoped(&self) -> bool {
        false
    }

    fn api(&self, _client: Client) -> Api<Self> {
        Api::all(_client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_as_dependency_round_trip() {
        let mut pkg = ClusterPackage::new(
            "cert-manager",
            ClusterPackageSpec {
                package_info: PackageInfoTemplate {
                    name: "cert-manager".into(),
                    version: "1.2.3".into(),
                    repository_name: String::new(),
                },
                values: BTreeMap::new(),
                suspend: false,
            },
        );
        assert!(!pkg.installed_as_dependency());
        pkg.set_installed_as_dependency(true);
        assert!(pkg.installed_as_dependency());
        pkg.set_installed_as_dependency(false);
        assert!(!pkg.installed_as_dependency());
    }

    #[test]
    fn test_status_mut_initializes_default() {
        let mut pkg = ClusterPackage::new(
            "test",
            ClusterPackageSpec {
                package_info: PackageInfoTemplate::default(),
                values: BTreeMap::new(),
                suspend: false,
            },
        );
        assert!(pkg.status().is_none());
        pkg.status_mut().version = "1.0.0".into();
        assert_eq!(pkg.status().unwrap().version, "1.0.0");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = PackageSpec {
            package_info: PackageInfoTemplate {
                name: "foo".into(),
                version: "1.0.0".into(),
                repository_name: "main".into(),
            },
            values: BTreeMap::new(),
            suspend: false,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["packageInfo"]["repositoryName"], "main");
        assert!(json.get("suspend").is_none());
    }
}
