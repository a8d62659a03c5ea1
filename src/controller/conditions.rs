//! Ready and Failed condition handling.
//!
//! Packages and package infos carry a `Ready` and a `Failed` condition that
//! are always updated together: ready implies not failed, failed implies not
//! ready, and while the outcome is undecided both are unknown.

use crate::crd::{set_condition, Condition, ConditionStatus};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_FAILED: &str = "Failed";

/// Machine readable reasons recorded in the Ready and Failed conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionReason {
    Pending,
    Reconciling,
    UpToDate,
    InstallationSucceeded,
    InstallationFailed,
    UnsupportedFormat,
    ValueConfigurationInvalid,
    SyncCompleted,
    SyncFailed,
}

impl ConditionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionReason::Pending => "Pending",
            ConditionReason::Reconciling => "Reconciling",
            ConditionReason::UpToDate => "UpToDate",
            ConditionReason::InstallationSucceeded => "InstallationSucceeded",
            ConditionReason::InstallationFailed => "InstallationFailed",
            ConditionReason::UnsupportedFormat => "UnsupportedFormat",
            ConditionReason::ValueConfigurationInvalid => "ValueConfigurationInvalid",
            ConditionReason::SyncCompleted => "SyncCompleted",
            ConditionReason::SyncFailed => "SyncFailed",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marks the resource as ready. Returns true if the conditions changed
pub fn set_ready(
    conditions: &mut Vec<Condition>,
    observed_generation: Option<i64>,
    reason: impl std::fmt::Display,
    message: &str,
) -> bool {
    let reason = reason.to_string();
    let ready_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_READY,
        ConditionStatus::True,
        &reason,
        message,
    );
    let failed_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_FAILED,
        ConditionStatus::False,
        &reason,
        message,
    );
    ready_changed || failed_changed
}

/// Marks the resource as failed. The reason is displayable rather than
/// strictly a [`ConditionReason`] so that failure reasons of an owned
/// resource can be forwarded verbatim. Returns true if the conditions
/// changed
pub fn set_failed(
    conditions: &mut Vec<Condition>,
    observed_generation: Option<i64>,
    reason: impl std::fmt::Display,
    message: &str,
) -> bool {
    let reason = reason.to_string();
    let ready_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_READY,
        ConditionStatus::False,
        &reason,
        message,
    );
    let failed_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_FAILED,
        ConditionStatus::True,
        &reason,
        message,
    );
    ready_changed || failed_changed
}

/// Marks the outcome as undecided. Returns true if the conditions changed
pub fn set_unknown(
    conditions: &mut Vec<Condition>,
    observed_generation: Option<i64>,
    reason: impl std::fmt::Display,
    message: &str,
) -> bool {
    let reason = reason.to_string();
    let ready_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_READY,
        ConditionStatus::Unknown,
        &reason,
        message,
    );
    let failed_changed = set_condition(
        conditions,
        observed_generation,
        CONDITION_FAILED,
        ConditionStatus::Unknown,
        &reason,
        message,
    );
    ready_changed || failed_changed
}
