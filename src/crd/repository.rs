//! # PackageRepository Custom Resource
//!
//! A package repository is an HTTP server hosting a package index plus, per
//! package, a version list and one manifest per version. Repositories can
//! require authentication and one repository can be marked as the default
//! used by packages that do not name a repository explicitly.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::Condition;
use crate::constants::DEFAULT_REPOSITORY_ANNOTATION;

/// Key of a `Secret` holding a credential
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Name of the secret in the controller namespace
    pub name: String,
    pub key: String,
}

/// HTTP basic auth credentials, inline or from secrets
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryBasicAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretKeyRef>,
}

/// Bearer token, inline or from a secret
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryBearerAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<RepositoryBasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<RepositoryBearerAuth>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-management.microscaler.io",
    version = "v1",
    kind = "PackageRepository",
    plural = "packagerepositories",
    status = "PackageRepositoryStatus",
    printcolumn = r#"{"name":"Url", "type":"string", "jsonPath":".spec.url"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageRepositorySpec {
    /// Base URL of the repository
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RepositoryAuth>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageRepositoryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PackageRepository {
    /// True if this repository is annotated as the default repository
    pub fn is_default_repository(&self) -> bool {
        self.annotations()
            .get(DEFAULT_REPOSITORY_ANNOTATION)
            .is_some_and(|v| v == "true")
    }
}
