//! # Resource Naming
//!
//! Derives the names of resources that are created on behalf of a package.
//! All derived names are escaped so that they are valid Kubernetes resource
//! names regardless of what characters the package metadata contains.

use std::sync::LazyLock;

use regex::Regex;

use crate::crd::PackageResource;

static RESOURCE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w.-]").expect("Failed to compile resource name pattern - this should never happen")
});

/// Returns the name of the `PackageInfo` a package is pinned to.
///
/// The name is derived from the repository name (if set), the package name
/// and the requested version, so that packages pinned to the same manifest
/// share a single `PackageInfo`.
pub fn package_info_name<P: PackageResource>(pkg: &P) -> String {
    let info = pkg.package_info();
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if !info.repository_name.is_empty() {
        parts.push(&info.repository_name);
    }
    parts.push(&info.name);
    parts.push(&info.version);
    escape_resource_name(&parts.join("--"))
}

fn escape_resource_name(name: &str) -> String {
    RESOURCE_NAME_PATTERN.replace_all(name, "--").to_lowercase()
}
