//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of all custom resources owned by this controller
pub const API_GROUP: &str = "package-management.microscaler.io";

/// API version of all custom resources owned by this controller
pub const API_VERSION: &str = "v1";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "package-manager-controller";

/// Finalizer placed on packages so that owned resources are cleaned up
/// before the package itself is removed
pub const PACKAGE_DELETION_FINALIZER: &str = "package-management.microscaler.io/package-deletion";

/// Annotation marking a package as installed to satisfy a dependency of
/// another package rather than by an explicit user request
pub const INSTALLED_AS_DEPENDENCY_ANNOTATION: &str =
    "package-management.microscaler.io/installed-as-dependency";

/// Annotation marking a package repository as the default repository
pub const DEFAULT_REPOSITORY_ANNOTATION: &str =
    "package-management.microscaler.io/default-repository";

/// Label key identifying resources managed by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label value identifying resources managed by this controller
pub const MANAGED_BY_VALUE: &str = "package-manager-controller";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default requeue interval after a successful reconciliation (seconds)
pub const DEFAULT_REQUEUE_SECS: u64 = 60;

/// Default requeue interval after a failed reconciliation (seconds)
pub const DEFAULT_ERROR_REQUEUE_SECS: u64 = 30;

/// Default interval between package info refreshes from the repository (seconds)
pub const DEFAULT_PACKAGE_INFO_SYNC_INTERVAL_SECS: u64 = 300;

/// Default maximum age of cached repository responses (seconds)
pub const DEFAULT_REPO_CACHE_MAX_AGE_SECS: u64 = 300;
