//! # Status Condition Types
//!
//! Condition type shared by all custom resource statuses.
//!
//! A hand-rolled condition type is used instead of the upstream Kubernetes one
//! because the k8s-openapi types do not implement `JsonSchema` and therefore
//! cannot be embedded in generated CRD schemas.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single status condition, following the Kubernetes condition conventions
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Ready" or "Failed"
    pub r#type: String,
    /// Condition status: "True", "False" or "Unknown"
    pub status: String,
    /// Generation of the resource the condition was last derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC 3339 timestamp of the last transition of this condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Machine readable reason for the last transition
    pub reason: String,
    /// Human readable message explaining the condition
    #[serde(default)]
    pub message: String,
}

/// Status value of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Returns the condition with the given type, if present
pub fn get_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Returns true if the condition with the given type exists and has the given status
pub fn is_condition_true(conditions: &[Condition], r#type: &str) -> bool {
    get_condition(conditions, r#type).is_some_and(|c| c.status == ConditionStatus::True.as_str())
}

/// Sets or updates a condition, preserving the transition time when
/// only reason or message changed. Returns true if anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    observed_generation: Option<i64>,
    r#type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    let now = chrono::Utc::now().to_rfc3339();
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
        let mut changed = false;
        if existing.status != status.as_str() {
            existing.status = status.as_str().to_owned();
            existing.last_transition_time = Some(now);
            changed = true;
        }
        if existing.reason != reason {
            existing.reason = reason.to_owned();
            changed = true;
        }
        if existing.message != message {
            existing.message = message.to_owned();
            changed = true;
        }
        if existing.observed_generation != observed_generation {
            existing.observed_generation = observed_generation;
            changed = true;
        }
        changed
    } else {
        conditions.push(Condition {
            r#type: r#type.to_owned(),
            status: status.as_str().to_owned(),
            observed_generation,
            last_transition_time: Some(now),
            reason: reason.to_owned(),
            message: message.to_owned(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: ConditionStatus) -> Condition {
        Condition {
            r#type: "Ready".into(),
            status: status.as_str().into(),
            observed_generation: None,
            last_transition_time: None,
            reason: "Test".into(),
            message: String::new(),
        }
    }

    #[test]
    fn test_is_condition_true() {
        assert!(is_condition_true(&[ready(ConditionStatus::True)], "Ready"));
        assert!(!is_condition_true(&[ready(ConditionStatus::False)], "Ready"));
        assert!(!is_condition_true(&[ready(ConditionStatus::True)], "Failed"));
        assert!(!is_condition_true(&[], "Ready"));
    }

    #[test]
    fn test_set_condition_updates_in_place() {
        let mut conditions = vec![ready(ConditionStatus::Unknown)];
        let changed = set_condition(
            &mut conditions,
            Some(2),
            "Ready",
            ConditionStatus::True,
            "InstallationSucceeded",
            "installed",
        );
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "InstallationSucceeded");
        assert!(conditions[0].last_transition_time.is_some());

        // Identical update reports no change
        let changed = set_condition(
            &mut conditions,
            Some(2),
            "Ready",
            ConditionStatus::True,
            "InstallationSucceeded",
            "installed",
        );
        assert!(!changed);
    }

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = vec![ready(ConditionStatus::True)];
        let changed = set_condition(
            &mut conditions,
            None,
            "Failed",
            ConditionStatus::False,
            "InstallationSucceeded",
            "",
        );
        assert!(changed);
        assert_eq!(conditions.len(), 2);
    }
}
