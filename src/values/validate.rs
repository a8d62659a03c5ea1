//! Validation of configured values against their definitions.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use regex::Regex;

use crate::crd::{
    PackageManifest, PackageResource, ValueDefinition, ValueDefinitionConstraints, ValueType,
};

enum ValidationTarget {
    Actual(String),
    Skip,
}

/// Validates fully resolved values. Every value is checked against its
/// definition and values without a definition are rejected
pub fn validate_resolved_values(
    manifest: &PackageManifest,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    let targets = values
        .iter()
        .map(|(name, value)| (name.clone(), ValidationTarget::Actual(value.clone())))
        .collect();
    validate(manifest, &targets)
}

/// Validates the values configured on a package as far as possible
/// without resolving them. Reference values are skipped here because
/// their content is not known yet, but they still count as present for
/// the required constraint
pub fn validate_package<P: PackageResource>(manifest: &PackageManifest, pkg: &P) -> Result<()> {
    let targets = pkg
        .values()
        .iter()
        .map(|(name, value)| {
            let target = match &value.value {
                Some(value) => ValidationTarget::Actual(value.clone()),
                None => ValidationTarget::Skip,
            };
            (name.clone(), target)
        })
        .collect();
    validate(manifest, &targets)
}

fn validate(manifest: &PackageManifest, values: &BTreeMap<String, ValidationTarget>) -> Result<()> {
    let mut errors = Vec::new();
    for (name, definition) in &manifest.value_definitions {
        match values.get(name) {
            Some(ValidationTarget::Actual(value)) => {
                if let Err(err) = validate_value(definition, value) {
                    errors.push(format!("validation error for value {name}: {err:#}"));
                }
            }
            Some(ValidationTarget::Skip) => {}
            None => {
                if definition.constraints.required {
                    errors.push(format!(
                        "validation error for value {name}: constraint violation: Required"
                    ));
                }
            }
        }
    }
    for name in values.keys() {
        if !manifest.value_definitions.contains_key(name) {
            errors.push(format!("validation error for value {name}: no value definition found"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

/// Validates a single value against its definition. All violated
/// constraints are reported, not just the first one
pub fn validate_value(definition: &ValueDefinition, value: &str) -> Result<()> {
    let constraints = &definition.constraints;
    let mut errors = Vec::new();
    match definition.r#type {
        ValueType::Text => {
            collect(&mut errors, validate_min_length(constraints, value));
            collect(&mut errors, validate_max_length(constraints, value));
            collect(&mut errors, validate_pattern(constraints, value));
        }
        ValueType::Number => {
            collect(&mut errors, validate_number_format(value));
            collect(&mut errors, validate_min(constraints, value));
            collect(&mut errors, validate_max(constraints, value));
            collect(&mut errors, validate_pattern(constraints, value));
        }
        ValueType::Options => {
            collect(&mut errors, validate_options(&definition.options, value));
        }
        ValueType::Boolean => {
            collect(&mut errors, validate_boolean_format(value));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

fn collect(errors: &mut Vec<String>, result: Result<()>) {
    if let Err(err) = result {
        errors.push(format!("{err:#}"));
    }
}

fn validate_min_length(constraints: &ValueDefinitionConstraints, value: &str) -> Result<()> {
    if let Some(min_length) = constraints.min_length {
        if length_of(value) < min_length {
            bail!("constraint violation: MinLength: {min_length}");
        }
    }
    Ok(())
}

fn validate_max_length(constraints: &ValueDefinitionConstraints, value: &str) -> Result<()> {
    if let Some(max_length) = constraints.max_length {
        if length_of(value) > max_length {
            bail!("constraint violation: MaxLength: {max_length}");
        }
    }
    Ok(())
}

fn length_of(value: &str) -> i64 {
    i64::try_from(value.chars().count()).unwrap_or(i64::MAX)
}

fn validate_number_format(value: &str) -> Result<()> {
    if value.parse::<i64>().is_err() {
        bail!("value must be a number: {value}");
    }
    Ok(())
}

fn validate_min(constraints: &ValueDefinitionConstraints, value: &str) -> Result<()> {
    if let Some(min) = constraints.min {
        if let Ok(number) = value.parse::<i64>() {
            if number < min {
                bail!("constraint violation: Min: {min}");
            }
        }
    }
    Ok(())
}

fn validate_max(constraints: &ValueDefinitionConstraints, value: &str) -> Result<()> {
    if let Some(max) = constraints.max {
        if let Ok(number) = value.parse::<i64>() {
            if number > max {
                bail!("constraint violation: Max: {max}");
            }
        }
    }
    Ok(())
}

fn validate_pattern(constraints: &ValueDefinitionConstraints, value: &str) -> Result<()> {
    if let Some(pattern) = &constraints.pattern {
        let regex = Regex::new(pattern)?;
        if !regex.is_match(value) {
            bail!("value must match '{pattern}'");
        }
    }
    Ok(())
}

fn validate_options(options: &[String], value: &str) -> Result<()> {
    if !options.iter().any(|option| option == value) {
        bail!("value must be one of: {}", options.join(", "));
    }
    Ok(())
}

fn validate_boolean_format(value: &str) -> Result<()> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" | "0" | "f" | "F" | "FALSE" | "false"
        | "False" => Ok(()),
        _ => bail!("value must be a boolean: {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PartialJsonPatch, ValueConfiguration, ValueDefinitionTarget};

    fn definition(r#type: ValueType) -> ValueDefinition {
        ValueDefinition {
            r#type,
            metadata: Default::default(),
            default_value: String::new(),
            options: Vec::new(),
            constraints: Default::default(),
            targets: vec![ValueDefinitionTarget {
                resource: None,
                chart_name: Some("test".into()),
                patch: PartialJsonPatch {
                    op: "add".into(),
                    path: "/test".into(),
                },
                value_template: None,
            }],
        }
    }

    fn manifest_with(name: &str, definition: ValueDefinition) -> PackageManifest {
        PackageManifest {
            value_definitions: [(name.to_owned(), definition)].into(),
            ..Default::default()
        }
    }

    #[test]
    fn text_constraints() {
        let mut def = definition(ValueType::Text);
        def.constraints.min_length = Some(2);
        def.constraints.max_length = Some(4);
        def.constraints.pattern = Some("^[a-z]+$".into());

        assert!(validate_value(&def, "abc").is_ok());
        let err = validate_value(&def, "a").unwrap_err().to_string();
        assert!(err.contains("MinLength: 2"), "{err}");
        let err = validate_value(&def, "abcde").unwrap_err().to_string();
        assert!(err.contains("MaxLength: 4"), "{err}");
        let err = validate_value(&def, "ABC").unwrap_err().to_string();
        assert!(err.contains("value must match '^[a-z]+$'"), "{err}");
    }

    #[test]
    fn number_constraints() {
        let mut def = definition(ValueType::Number);
        def.constraints.min = Some(1);
        def.constraints.max = Some(10);

        assert!(validate_value(&def, "5").is_ok());
        let err = validate_value(&def, "0").unwrap_err().to_string();
        assert!(err.contains("Min: 1"), "{err}");
        let err = validate_value(&def, "11").unwrap_err().to_string();
        assert!(err.contains("Max: 10"), "{err}");
        let err = validate_value(&def, "five").unwrap_err().to_string();
        assert!(err.contains("value must be a number"), "{err}");
    }

    #[test]
    fn options_must_contain_the_value() {
        let mut def = definition(ValueType::Options);
        def.options = vec!["a".into(), "b".into()];

        assert!(validate_value(&def, "a").is_ok());
        let err = validate_value(&def, "c").unwrap_err().to_string();
        assert_eq!(err, "value must be one of: a, b");
    }

    #[test]
    fn boolean_accepts_the_usual_spellings() {
        let def = definition(ValueType::Boolean);
        for value in ["true", "True", "TRUE", "false", "0", "1", "t", "F"] {
            assert!(validate_value(&def, value).is_ok(), "{value}");
        }
        assert!(validate_value(&def, "yes").is_err());
    }

    #[test]
    fn missing_required_value_is_reported() {
        let mut def = definition(ValueType::Text);
        def.constraints.required = true;
        let manifest = manifest_with("host", def);

        let err = validate_resolved_values(&manifest, &BTreeMap::new()).unwrap_err().to_string();
        assert!(err.contains("validation error for value host"), "{err}");
        assert!(err.contains("constraint violation: Required"), "{err}");
    }

    #[test]
    fn value_without_definition_is_rejected() {
        let manifest = manifest_with("host", definition(ValueType::Text));
        let values = [("host".to_owned(), "a".to_owned()), ("other".to_owned(), "b".to_owned())];

        let err = validate_resolved_values(&manifest, &values.into()).unwrap_err().to_string();
        assert!(err.contains("validation error for value other: no value definition found"), "{err}");
    }

    #[test]
    fn reference_values_are_skipped_but_count_as_present() {
        let mut def = definition(ValueType::Number);
        def.constraints.required = true;
        def.constraints.min = Some(1);
        let manifest = manifest_with("replicas", def);

        let pkg = crate::crd::ClusterPackage::new(
            "test",
            crate::crd::ClusterPackageSpec {
                values: [(
                    "replicas".to_owned(),
                    ValueConfiguration {
                        value: None,
                        value_from: Some(Default::default()),
                    },
                )]
                .into(),
                ..Default::default()
            },
        );
        assert!(validate_package(&manifest, &pkg).is_ok());
    }

    #[test]
    fn all_violations_are_reported_together() {
        let mut def = definition(ValueType::Number);
        def.constraints.max = Some(10);
        def.constraints.pattern = Some("^1?[0-9]$".into());

        let err = validate_value(&def, "25").unwrap_err().to_string();
        assert!(err.contains("Max: 10"), "{err}");
        assert!(err.contains("value must match"), "{err}");
    }
}
