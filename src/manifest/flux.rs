//! Descriptors and helpers for the Flux CD resources the helm adapter drives.
//!
//! `HelmRepository` and `HelmRelease` are CRDs owned by Flux, so they are
//! handled as `DynamicObject`s instead of typed structs.

use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};

pub const HELM_REPOSITORY_GROUP: &str = "source.toolkit.fluxcd.io";
pub const HELM_REPOSITORY_VERSION: &str = "v1beta2";
pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";

pub const HELM_RELEASE_GROUP: &str = "helm.toolkit.fluxcd.io";
pub const HELM_RELEASE_VERSION: &str = "v2beta2";
pub const HELM_RELEASE_KIND: &str = "HelmRelease";

pub fn helm_repository_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: HELM_REPOSITORY_GROUP.to_string(),
        version: HELM_REPOSITORY_VERSION.to_string(),
        kind: HELM_REPOSITORY_KIND.to_string(),
    })
}

pub fn helm_release_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: HELM_RELEASE_GROUP.to_string(),
        version: HELM_RELEASE_VERSION.to_string(),
        kind: HELM_RELEASE_KIND.to_string(),
    })
}

/// Looks up a status condition of the given type on a dynamic object and
/// returns its `status` and `message` fields.
pub fn find_condition<'a>(obj: &'a DynamicObject, r#type: &str) -> Option<(&'a str, &'a str)> {
    let conditions = obj.data.get("status")?.get("conditions")?.as_array()?;
    let condition = conditions
        .iter()
        .find(|c| c.get("type").and_then(serde_json::Value::as_str) == Some(r#type))?;
    let status = condition
        .get("status")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    let message = condition
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    Some((status, message))
}
