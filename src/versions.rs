//! # Version Comparison
//!
//! Helpers on top of the `semver` crate.
//!
//! Package versions may carry build metadata (e.g. `1.2.3+4`) which
//! repositories use to distinguish packaging revisions of the same upstream
//! version. Constraint matching ignores build metadata, but picking the
//! maximum version and deciding upgradability must take it into account,
//! comparing numeric metadata numerically.

use semver::{BuildMetadata, Version, VersionReq};
use std::cmp::Ordering;

/// Parses a version, tolerating a leading `v`
pub fn parse_version(s: &str) -> Result<Version, semver::Error> {
    Version::parse(s.strip_prefix(['v', 'V']).unwrap_or(s))
}

/// Parses a version constraint
pub fn parse_constraint(s: &str) -> Result<VersionReq, semver::Error> {
    VersionReq::parse(s)
}

/// Compares two versions including build metadata.
///
/// Precedence is compared first per the semver spec. Versions equal in
/// precedence are ordered by build metadata: absent metadata sorts lowest
/// and fully numeric metadata is compared numerically.
pub fn cmp_with_build(a: &Version, b: &Version) -> Ordering {
    match a.cmp_precedence(b) {
        Ordering::Equal => cmp_build(&a.build, &b.build),
        ord => ord,
    }
}

fn cmp_build(a: &BuildMetadata, b: &BuildMetadata) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    match (a.is_empty(), b.is_empty()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num),
        _ => a.as_str().cmp(b.as_str()),
    }
}

/// True if `desired` denotes a newer version than `installed`.
///
/// Unparseable versions fall back to plain string inequality.
pub fn is_upgradable(installed: &str, desired: &str) -> bool {
    match (parse_version(installed), parse_version(desired)) {
        (Ok(installed), Ok(desired)) => is_version_upgradable(&installed, &desired),
        _ => installed != desired,
    }
}

/// True if `desired` denotes a newer version than `installed`
pub fn is_version_upgradable(installed: &Version, desired: &Version) -> bool {
    match desired.cmp_precedence(installed) {
        Ordering::Greater => true,
        Ordering::Equal => is_upgradable_build(&installed.build, &desired.build),
        Ordering::Less => false,
    }
}

fn is_upgradable_build(installed: &BuildMetadata, desired: &BuildMetadata) -> bool {
    if installed == desired || desired.is_empty() {
        false
    } else if installed.is_empty() {
        true
    } else if let (Ok(installed_num), Ok(desired_num)) =
        (installed.parse::<i64>(), desired.parse::<i64>())
    {
        installed_num < desired_num
    } else {
        installed.as_str() != desired.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_version_tolerates_v_prefix() {
        assert_eq!(v("v1.2.3"), v("1.2.3"));
        assert!(parse_version("not a version").is_err());
    }

    #[test]
    fn test_cmp_with_build_orders_numeric_metadata_numerically() {
        assert_eq!(cmp_with_build(&v("1.1.0+1"), &v("1.1.0+2")), Ordering::Less);
        assert_eq!(cmp_with_build(&v("1.1.0+10"), &v("1.1.0+9")), Ordering::Greater);
        assert_eq!(cmp_with_build(&v("1.1.0"), &v("1.1.0+1")), Ordering::Less);
        assert_eq!(cmp_with_build(&v("1.1.0+1"), &v("1.1.0+1")), Ordering::Equal);
        assert_eq!(cmp_with_build(&v("1.2.0"), &v("1.1.9+7")), Ordering::Greater);
    }

    #[test]
    fn test_constraint_matching_ignores_build_metadata() {
        let req = parse_constraint("<=1.1.0+1").unwrap();
        assert!(req.matches(&v("1.1.0+2")));
        assert!(!req.matches(&v("1.1.1")));
    }

    #[test]
    fn test_is_upgradable() {
        assert!(is_upgradable("1.0.0", "1.0.1"));
        assert!(!is_upgradable("1.0.1", "1.0.0"));
        assert!(!is_upgradable("1.0.0", "1.0.0"));
        // Metadata-only upgrades
        assert!(is_upgradable("1.0.0", "1.0.0+1"));
        assert!(is_upgradable("1.0.0+1", "1.0.0+2"));
        assert!(!is_upgradable("1.0.0+2", "1.0.0+1"));
        assert!(!is_upgradable("1.0.0+1", "1.0.0"));
        // Unparseable versions compare as strings
        assert!(is_upgradable("latest", "1.0.0"));
        assert!(!is_upgradable("latest", "latest"));
    }
}
