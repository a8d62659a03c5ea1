//! # Package Value Configuration
//!
//! Packages declare configurable values in their manifest. This module
//! resolves the values configured on a package, validates them against
//! their definitions and turns them into JSON patches that the manifest
//! adapters apply to the installed resources or helm values.

mod patch;
mod resolver;
mod validate;

pub use patch::{generate_patches, TargetPatch, TargetPatches};
pub use resolver::{KubeValueSource, ValueResolver, ValueSourceAdapter};
pub use validate::{validate_package, validate_resolved_values, validate_value};
