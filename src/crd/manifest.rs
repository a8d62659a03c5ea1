//! # Package Manifest
//!
//! The package manifest describes the content of a package version as
//! published in a package repository: what to install (helm chart, plain
//! manifests), which values can be configured and which other packages are
//! required.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::values::ValueDefinition;

/// Installation scope of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PackageScope {
    Cluster,
    Namespaced,
}

/// Manifest of a single package version
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Scope of the package. Defaults to cluster scope when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PackageScope>,
    /// Name of the package
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub long_description: String,
    /// Links to project homepage, documentation and similar
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<PackageReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon_url: String,
    /// Helm chart to install for this package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmManifest>,
    /// Kustomization to install for this package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeManifest>,
    /// Plain manifests to install for this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PlainManifest>,
    /// Configurable values of this package, keyed by value name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_definitions: BTreeMap<String, ValueDefinition>,
    /// Namespace that namespaced owned resources are installed into when
    /// they do not specify one themselves
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_namespace: String,
    /// Services a user can open in the browser once the package is installed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoints: Vec<PackageEntrypoint>,
    /// Packages that must be installed for this package to work
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    /// Sub-packages installed alongside this package
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
}

impl PackageManifest {
    /// Returns the effective scope, defaulting to cluster scope
    pub fn scope(&self) -> PackageScope {
        self.scope.unwrap_or(PackageScope::Cluster)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.scope() == PackageScope::Cluster
    }

    pub fn is_namespace_scoped(&self) -> bool {
        self.scope() == PackageScope::Namespaced
    }
}

/// External reference related to a package
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageReference {
    pub label: String,
    pub url: String,
}

/// Helm chart installation instructions
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmManifest {
    /// URL of the helm repository hosting the chart
    pub repository_url: String,
    pub chart_name: String,
    pub chart_version: String,
    /// Default values passed to the chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
    pub values: Option<serde_json::Value>,
}

/// Kustomize installation instructions.
/// Recognized in manifests but not supported by this controller yet.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct KustomizeManifest {}

/// A plain multi-document manifest fetched from a URL
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlainManifest {
    pub url: String,
    /// Overrides the package default namespace for the objects of this manifest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_namespace: String,
}

/// Service entrypoint of an installed package
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageEntrypoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub service_name: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
}

/// Dependency of a package on another package
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Name of the required package
    pub name: String,
    /// Semver constraint the installed version of the required package
    /// must satisfy. Any version is accepted when omitted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Component installed as a separate package owned by its parent
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Name of the component package in the repository
    pub name: String,
    /// Name the component installation derives its name from.
    /// The component package name is used when omitted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub installed_name: String,
    /// Semver constraint for the component version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_defaults_to_cluster() {
        let manifest = PackageManifest {
            name: "test".into(),
            ..Default::default()
        };
        assert!(manifest.is_cluster_scoped());
        assert!(!manifest.is_namespace_scoped());
    }

    #[test]
    fn test_manifest_deserializes_from_repo_yaml() {
        let yaml = r"
name: argo-cd
scope: Cluster
defaultNamespace: argocd
helm:
  repositoryUrl: https://argoproj.github.io/argo-helm
  chartName: argo-cd
  chartVersion: 6.7.11
  values:
    notifications:
      enabled: false
dependencies:
  - name: cert-manager
    version: '>=1.0.0'
";
        let manifest: PackageManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.name, "argo-cd");
        assert_eq!(manifest.default_namespace, "argocd");
        let helm = manifest.helm.as_ref().unwrap();
        assert_eq!(helm.chart_name, "argo-cd");
        assert!(helm.values.is_some());
        assert_eq!(manifest.dependencies.len(), 1);
        assert_eq!(manifest.dependencies[0].version, ">=1.0.0");
    }
}
