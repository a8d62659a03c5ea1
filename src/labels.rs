//! Managed-by label handling.
//!
//! Resources created on behalf of a package are labeled so that pruning can
//! distinguish them from resources that happen to share a name with
//! something a package once installed.

use kube::ResourceExt;

use crate::constants::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Returns true if the object carries the managed-by label of this controller
pub fn is_managed(obj: &impl ResourceExt) -> bool {
    obj.labels()
        .get(MANAGED_BY_LABEL)
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

/// Marks the object as managed by this controller
pub fn set_managed(obj: &mut impl ResourceExt) {
    obj.labels_mut()
        .insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn set_managed_makes_is_managed_true() {
        let mut obj = ConfigMap::default();
        assert!(!is_managed(&obj));
        set_managed(&mut obj);
        assert!(is_managed(&obj));
        assert_eq!(
            obj.labels().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn other_owners_are_not_managed() {
        let mut obj = ConfigMap::default();
        obj.labels_mut()
            .insert(MANAGED_BY_LABEL.to_owned(), "helm".to_owned());
        assert!(!is_managed(&obj));
    }
}
