//! Requeue policy of the package controllers.
//!
//! Reconciliation repeats on a fixed interval, also after errors, so that
//! drift in installed resources is noticed even without a watch event.

use std::time::Duration;

use kube_runtime::controller::Action;

use crate::constants::{DEFAULT_ERROR_REQUEUE_SECS, DEFAULT_REQUEUE_SECS};

/// Requeue after the regular reconcile interval
pub fn always() -> Action {
    Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECS))
}

/// Requeue after the shorter error interval
pub fn on_error() -> Action {
    Action::requeue(Duration::from_secs(DEFAULT_ERROR_REQUEUE_SECS))
}

/// Do not requeue on a timer. Used for terminal states that only a spec
/// change can get the package out of
pub fn await_change() -> Action {
    Action::await_change()
}
