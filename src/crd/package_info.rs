//! # PackageInfo Custom Resource
//!
//! A `PackageInfo` caches the manifest of one package version fetched from a
//! package repository. Packages do not talk to repositories directly during
//! reconciliation; they read the manifest from the referenced `PackageInfo`
//! instead, which is kept up to date by its own controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::manifest::PackageManifest;
use super::status::Condition;

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-management.microscaler.io",
    version = "v1",
    kind = "PackageInfo",
    status = "PackageInfoStatus",
    printcolumn = r#"{"name":"Desired version", "type":"string", "jsonPath":".spec.version"}, {"name":"Current version", "type":"string", "jsonPath":".status.version"}, {"name":"Last Updated", "type":"date", "jsonPath":".status.lastUpdateTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfoSpec {
    /// Name of the package in the repository
    pub name: String,
    /// Version of the package to fetch
    pub version: String,
    /// Name of the `PackageRepository` to fetch from.
    /// The default repository is used when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfoStatus {
    /// Manifest fetched from the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PackageManifest>,
    /// URL the manifest was fetched from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// RFC 3339 timestamp of the last successful fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<String>,
    /// Version the manifest was fetched for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}
