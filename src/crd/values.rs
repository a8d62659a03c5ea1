//! # Value Definitions and Configurations
//!
//! A package manifest declares which values can be configured
//! (`ValueDefinition`) and where each value is written to
//! (`ValueDefinitionTarget`). A package declares the concrete value for each
//! name (`ValueConfiguration`), either inline or as a reference to a
//! `ConfigMap`, `Secret` or another package.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Data type of a configurable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Text,
    Number,
    Options,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Boolean => "boolean",
            ValueType::Text => "text",
            ValueType::Number => "number",
            ValueType::Options => "options",
        };
        f.write_str(s)
    }
}

/// Display metadata of a value definition
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueDefinitionMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Constraints a configured value must satisfy
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueDefinitionConstraints {
    /// Whether a value must be configured for this definition
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    /// Inclusive minimum for number values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Inclusive maximum for number values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Minimum length for text values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<i64>,
    /// Maximum length for text values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
    /// Regular expression text and number values must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Partial JSON patch operation, completed with the resolved value
/// when patches are generated
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartialJsonPatch {
    /// JSON patch operation: "add", "replace" or "remove"
    pub op: String,
    /// JSON pointer to the patched location
    pub path: String,
}

/// Reference to a patchable resource installed by the package
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetResourceRef {
    /// API group and version of the target, e.g. "apps/v1".
    /// Omitted or empty for the core group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A single place a configured value is written to
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueDefinitionTarget {
    /// Patch a resource installed via plain manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<TargetResourceRef>,
    /// Patch the values of the helm release with this chart name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_name: Option<String>,
    pub patch: PartialJsonPatch,
    /// Template rendering the raw value into the JSON value used in the
    /// patch. The raw value is used as a plain string when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
}

/// A configurable value declared by a package manifest
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueDefinition {
    pub r#type: ValueType,
    #[serde(default)]
    pub metadata: ValueDefinitionMetadata,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_value: String,
    /// Valid values for definitions of type "options"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub constraints: ValueDefinitionConstraints,
    pub targets: Vec<ValueDefinitionTarget>,
}

/// Value configured on a package, inline or by reference
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueReference>,
}

/// Reference to a value held by another object
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ObjectKeyValueSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ObjectKeyValueSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_ref: Option<PackageValueSource>,
}

/// Key of a `ConfigMap` or `Secret` holding a value
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeyValueSource {
    pub name: String,
    pub namespace: String,
    pub key: String,
}

/// Value configured on another cluster package
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageValueSource {
    /// Name of the referenced cluster package
    pub name: String,
    /// Name of the value on the referenced package
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ValueType::Boolean).unwrap(), "\"boolean\"");
        assert_eq!(serde_json::to_string(&ValueType::Options).unwrap(), "\"options\"");
    }

    #[test]
    fn test_value_definition_deserializes() {
        let yaml = r#"
type: number
metadata:
  label: Replicas
defaultValue: "1"
constraints:
  required: true
  min: 0
  max: 10
targets:
  - resource:
      apiGroup: apps/v1
      kind: Deployment
      name: my-app
    patch:
      op: replace
      path: /spec/replicas
    valueTemplate: "{{ value }}"
"#;
        let def: ValueDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.r#type, ValueType::Number);
        assert!(def.constraints.required);
        assert_eq!(def.constraints.max, Some(10));
        assert_eq!(def.targets.len(), 1);
        let target = &def.targets[0];
        assert_eq!(target.patch.op, "replace");
        assert_eq!(target.value_template.as_deref(), Some("{{ value }}"));
    }

    #[test]
    fn test_value_configuration_variants() {
        let inline: ValueConfiguration = serde_yaml::from_str("value: abc").unwrap();
        assert_eq!(inline.value.as_deref(), Some("abc"));
        assert!(inline.value_from.is_none());

        let referenced: ValueConfiguration = serde_yaml::from_str(
            r"
valueFrom:
  secretRef:
    name: creds
    namespace: default
    key: password
",
        )
        .unwrap();
        assert!(referenced.value.is_none());
        let value_from = referenced.value_from.unwrap();
        assert_eq!(value_from.secret_ref.unwrap().key, "password");
    }
}
