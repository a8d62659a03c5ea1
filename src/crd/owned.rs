//! # Owned Resource References
//!
//! Lightweight references to resources created on behalf of a package.
//!
//! These are recorded in the package status so that resources which are no
//! longer part of the package manifest can be cleaned up on the next
//! reconciliation, and so that deletion of a package can cascade to
//! everything it installed.

use kube::core::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a single resource owned by a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OwnedResourceRef {
    /// API group of the resource, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version of the resource
    pub version: String,
    /// Kind of the resource
    pub kind: String,
    /// Name of the resource
    pub name: String,
    /// Namespace of the resource, empty for cluster-scoped resources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Set when the resource has been scheduled for deletion
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub marked_for_deletion: bool,
}

impl OwnedResourceRef {
    /// Builds a reference for a typed Kubernetes object
    pub fn from_object<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        OwnedResourceRef {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            marked_for_deletion: false,
        }
    }

    /// Builds a reference for a dynamic object with its API resource description
    pub fn from_dynamic(obj: &DynamicObject, resource: &ApiResource) -> Self {
        OwnedResourceRef {
            group: resource.group.clone(),
            version: resource.version.clone(),
            kind: resource.kind.clone(),
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            marked_for_deletion: false,
        }
    }

    /// Returns true if both references point at the same resource,
    /// ignoring the deletion marker
    pub fn refers_to_same_resource(&self, other: &OwnedResourceRef) -> bool {
        self.group == other.group
            && self.version == other.version
            && self.kind == other.kind
            && self.name == other.name
            && self.namespace == other.namespace
    }
}

impl std::fmt::Display for OwnedResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} ({})", self.name, self.kind)
        } else {
            write!(f, "{}/{} ({})", self.namespace, self.name, self.kind)
        }
    }
}

/// Adds a reference if no equivalent reference exists yet.
/// Returns true if the list was modified.
pub fn add_owned_resource_ref(refs: &mut Vec<OwnedResourceRef>, new_ref: OwnedResourceRef) -> bool {
    if refs.iter().any(|r| r.refers_to_same_resource(&new_ref)) {
        false
    } else {
        refs.push(new_ref);
        true
    }
}

/// Removes all references equivalent to the given one.
/// Returns true if the list was modified.
pub fn remove_owned_resource_ref(refs: &mut Vec<OwnedResourceRef>, r: &OwnedResourceRef) -> bool {
    let before = refs.len();
    refs.retain(|existing| !existing.refers_to_same_resource(r));
    refs.len() != before
}

/// Returns true if an equivalent reference is present
pub fn contains_owned_resource_ref(refs: &[OwnedResourceRef], r: &OwnedResourceRef) -> bool {
    refs.iter().any(|existing| existing.refers_to_same_resource(r))
}
