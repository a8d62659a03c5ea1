//! # Observability
//!
//! Prometheus metrics collected by the controller. The metrics are exposed
//! through the HTTP server in [`crate::server`].

pub mod metrics;

pub use metrics::register_metrics;
