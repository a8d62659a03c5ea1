//! Generation and application of JSON patches for resolved values.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use kube::core::DynamicObject;
use minijinja::{context, Environment};
use serde_json::Value;

use crate::crd::{PackageManifest, TargetResourceRef, ValueDefinitionTarget};

/// Group, version, kind, name and optional namespace a patch applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResource {
    group: String,
    version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
}

impl TargetResource {
    fn from_ref(target: &TargetResourceRef) -> Result<Self> {
        let (group, version) = parse_group_version(target.api_group.as_deref().unwrap_or_default())?;
        Ok(Self {
            group,
            version,
            kind: target.kind.clone(),
            name: target.name.clone(),
            namespace: target.namespace.clone(),
        })
    }

    fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether the patch applies to the given object. The namespace is
    /// only compared when the target specifies one
    fn matches(&self, obj: &DynamicObject) -> bool {
        let Some(types) = &obj.types else {
            return false;
        };
        types.api_version == self.api_version()
            && types.kind == self.kind
            && obj.metadata.name.as_deref() == Some(self.name.as_str())
            && self
                .namespace
                .as_ref()
                .is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns.as_str()))
    }
}

fn parse_group_version(api_group: &str) -> Result<(String, String)> {
    match api_group.split('/').collect::<Vec<_>>().as_slice() {
        [""] => Ok((String::new(), String::new())),
        [version] => Ok((String::new(), (*version).to_owned())),
        [group, version] => Ok(((*group).to_owned(), (*version).to_owned())),
        _ => bail!("unexpected GroupVersion string: {api_group}"),
    }
}

#[derive(Debug, Clone)]
struct PatchOperation {
    op: String,
    path: String,
    value: Value,
}

impl PatchOperation {
    fn apply(&self, doc: &mut Value) -> Result<()> {
        match self.op.as_str() {
            "add" => add(doc, &self.path, self.value.clone()),
            "replace" => replace(doc, &self.path, self.value.clone()),
            "remove" => remove(doc, &self.path),
            op => bail!("unsupported patch operation: {op}"),
        }
    }
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent_path, token) = split_pointer(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| anyhow!("path {path} does not exist"))?;
    match parent {
        Value::Object(map) => {
            map.insert(token, value);
        }
        Value::Array(array) => {
            if token == "-" {
                array.push(value);
            } else {
                let index = array_index(&token, array.len() + 1)
                    .with_context(|| format!("invalid array index in {path}"))?;
                array.insert(index, value);
            }
        }
        _ => bail!("path {path} does not point into an object or array"),
    }
    Ok(())
}

fn replace(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let target = doc
        .pointer_mut(path)
        .ok_or_else(|| anyhow!("path {path} does not exist"))?;
    *target = value;
    Ok(())
}

fn remove(doc: &mut Value, path: &str) -> Result<()> {
    let (parent_path, token) = split_pointer(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| anyhow!("path {path} does not exist"))?;
    match parent {
        Value::Object(map) => {
            if map.remove(&token).is_none() {
                bail!("path {path} does not exist");
            }
        }
        Value::Array(array) => {
            let index = array_index(&token, array.len())
                .with_context(|| format!("invalid array index in {path}"))?;
            array.remove(index);
        }
        _ => bail!("path {path} does not point into an object or array"),
    }
    Ok(())
}

// Splits a JSON pointer into the pointer of the parent and the decoded
// final reference token
fn split_pointer(path: &str) -> Result<(&str, String)> {
    if !path.starts_with('/') {
        bail!("invalid JSON pointer: {path}");
    }
    let (parent, token) = path.rsplit_once('/').unwrap_or(("", path));
    Ok((parent, token.replace("~1", "/").replace("~0", "~")))
}

fn array_index(token: &str, len: usize) -> Result<usize> {
    let index: usize = token.parse()?;
    if index >= len {
        bail!("index {index} out of bounds");
    }
    Ok(index)
}

/// A compiled patch bound to either a target resource or a helm chart
#[derive(Debug, Clone)]
pub struct TargetPatch {
    resource: Option<TargetResource>,
    helm_chart: Option<String>,
    operation: PatchOperation,
}

impl TargetPatch {
    pub fn matches_resource(&self, obj: &DynamicObject) -> bool {
        self.resource.as_ref().is_some_and(|resource| resource.matches(obj))
    }

    pub fn matches_chart(&self, chart_name: &str) -> bool {
        self.helm_chart.as_deref() == Some(chart_name)
    }

    /// Applies the patch to the object if it matches the target resource
    pub fn apply_to_resource(&self, obj: &mut DynamicObject) -> Result<()> {
        if !self.matches_resource(obj) {
            return Ok(());
        }
        let mut data = serde_json::to_value(&*obj)?;
        self.operation.apply(&mut data)?;
        *obj = serde_json::from_value(data)?;
        Ok(())
    }

    /// Applies the patch to a helm values object if the chart name
    /// matches. A missing values object starts out as an empty object
    pub fn apply_to_helm_values(&self, chart_name: &str, values: &mut Value) -> Result<()> {
        if !self.matches_chart(chart_name) {
            return Ok(());
        }
        if values.is_null() {
            *values = Value::Object(serde_json::Map::new());
        }
        self.operation.apply(values)
    }
}

/// All patches generated for a package, applied in value definition order
#[derive(Debug, Clone, Default)]
pub struct TargetPatches(Vec<TargetPatch>);

impl TargetPatches {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn apply_to_resource(&self, obj: &mut DynamicObject) -> Result<()> {
        for patch in &self.0 {
            patch.apply_to_resource(obj)?;
        }
        Ok(())
    }

    pub fn apply_to_helm_values(&self, chart_name: &str, values: &mut Value) -> Result<()> {
        for patch in &self.0 {
            patch.apply_to_helm_values(chart_name, values)?;
        }
        Ok(())
    }
}

/// Creates one patch per target of every value definition a resolved
/// value exists for. Values are expected to be validated already
pub fn generate_patches(
    manifest: &PackageManifest,
    values: &BTreeMap<String, String>,
) -> Result<TargetPatches> {
    let mut patches = Vec::new();
    for (name, definition) in &manifest.value_definitions {
        if let Some(value) = values.get(name) {
            for target in &definition.targets {
                let patch = generate_target_patch(target, value)
                    .with_context(|| format!("cannot generate patch for value {name}"))?;
                patches.push(patch);
            }
        }
    }
    Ok(TargetPatches(patches))
}

fn generate_target_patch(target: &ValueDefinitionTarget, value: &str) -> Result<TargetPatch> {
    let operation = PatchOperation {
        op: target.patch.op.clone(),
        path: target.patch.path.clone(),
        value: actual_value(target, value)?,
    };
    let resource = match &target.resource {
        Some(resource) => Some(TargetResource::from_ref(resource)?),
        None => None,
    };
    if resource.is_none() && target.chart_name.is_none() {
        bail!("target has neither a resource nor a chart name");
    }
    Ok(TargetPatch {
        resource,
        helm_chart: target.chart_name.clone(),
        operation,
    })
}

// The template decides the JSON type of the patched value. Without a
// template the raw string is used as-is
fn actual_value(target: &ValueDefinitionTarget, value: &str) -> Result<Value> {
    let template = target.value_template.as_deref().unwrap_or_default();
    if template.is_empty() {
        return Ok(Value::String(value.to_owned()));
    }
    let mut env = Environment::new();
    env.add_filter("base64", |value: String| {
        general_purpose::STANDARD.encode(value.as_bytes())
    });
    let rendered = env
        .render_str(template, context! { value })
        .with_context(|| format!("cannot render value template '{template}'"))?;
    serde_json::from_str(&rendered)
        .with_context(|| format!("template output is not valid JSON: {rendered}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn resource_target(op: &str, path: &str, template: Option<&str>) -> ValueDefinitionTarget {
        ValueDefinitionTarget {
            resource: Some(TargetResourceRef {
                api_group: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name: "test".into(),
                namespace: None,
            }),
            chart_name: None,
            patch: crate::crd::PartialJsonPatch {
                op: op.into(),
                path: path.into(),
            },
            value_template: template.map(Into::into),
        }
    }

    fn chart_target(chart: &str, op: &str, path: &str, template: Option<&str>) -> ValueDefinitionTarget {
        ValueDefinitionTarget {
            resource: None,
            chart_name: Some(chart.into()),
            patch: crate::crd::PartialJsonPatch {
                op: op.into(),
                path: path.into(),
            },
            value_template: template.map(Into::into),
        }
    }

    fn deployment(name: &str) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        let mut obj = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
        obj.data = json!({"spec": {}});
        obj
    }

    #[test]
    fn value_without_template_stays_a_string() {
        let target = resource_target("add", "/spec/host", None);
        let patch = generate_target_patch(&target, "example.com").unwrap();
        assert_eq!(patch.operation.value, json!("example.com"));
    }

    #[test]
    fn template_controls_the_json_type() {
        let target = resource_target("add", "/spec/replicas", Some("{{ value }}"));
        let patch = generate_target_patch(&target, "2").unwrap();
        assert_eq!(patch.operation.value, json!(2));
    }

    #[test]
    fn base64_filter_encodes_the_value() {
        let target = resource_target("add", "/data/password", Some("\"{{ value | base64 }}\""));
        let patch = generate_target_patch(&target, "test").unwrap();
        assert_eq!(patch.operation.value, json!("dGVzdA=="));
    }

    #[test]
    fn template_output_must_be_json() {
        let target = resource_target("add", "/spec/replicas", Some("{{ value }}"));
        let err = generate_target_patch(&target, "not a number").unwrap_err();
        assert!(format!("{err:#}").contains("not valid JSON"));
    }

    #[test]
    fn patch_is_applied_to_a_matching_resource() {
        let target = resource_target("add", "/spec/replicas", Some("{{ value }}"));
        let patch = generate_target_patch(&target, "2").unwrap();

        let mut obj = deployment("test");
        patch.apply_to_resource(&mut obj).unwrap();
        assert_eq!(obj.data, json!({"spec": {"replicas": 2}}));
    }

    #[test]
    fn patch_skips_resources_with_a_different_name() {
        let target = resource_target("add", "/spec/replicas", Some("{{ value }}"));
        let patch = generate_target_patch(&target, "2").unwrap();

        let mut obj = deployment("other");
        patch.apply_to_resource(&mut obj).unwrap();
        assert_eq!(obj.data, json!({"spec": {}}));
    }

    #[test]
    fn namespace_is_only_compared_when_the_target_sets_one() {
        let mut target = resource_target("add", "/spec/replicas", Some("{{ value }}"));
        if let Some(resource) = &mut target.resource {
            resource.namespace = Some("prod".into());
        }
        let patch = generate_target_patch(&target, "2").unwrap();

        let mut obj = deployment("test");
        obj.metadata.namespace = Some("dev".into());
        patch.apply_to_resource(&mut obj).unwrap();
        assert_eq!(obj.data, json!({"spec": {}}));

        obj.metadata.namespace = Some("prod".into());
        patch.apply_to_resource(&mut obj).unwrap();
        assert_eq!(obj.data, json!({"spec": {"replicas": 2}}));
    }

    #[test]
    fn helm_values_start_out_empty() {
        let target = chart_target("argo-cd", "add", "/server/replicas", Some("{{ value }}"));
        let patch = generate_target_patch(&target, "3").unwrap();

        let mut values = Value::Null;
        patch.apply_to_helm_values("argo-cd", &mut values).unwrap();
        assert_eq!(values, json!({"server": {"replicas": 3}}));
    }

    #[test]
    fn helm_patch_skips_other_charts() {
        let target = chart_target("argo-cd", "add", "/server/replicas", Some("{{ value }}"));
        let patch = generate_target_patch(&target, "3").unwrap();

        let mut values = json!({});
        patch.apply_to_helm_values("other", &mut values).unwrap();
        assert_eq!(values, json!({}));
    }

    #[test]
    fn replace_and_remove_operations() {
        let mut doc = json!({"spec": {"replicas": 1, "paused": true}});
        PatchOperation {
            op: "replace".into(),
            path: "/spec/replicas".into(),
            value: json!(5),
        }
        .apply(&mut doc)
        .unwrap();
        PatchOperation {
            op: "remove".into(),
            path: "/spec/paused".into(),
            value: Value::Null,
        }
        .apply(&mut doc)
        .unwrap();
        assert_eq!(doc, json!({"spec": {"replicas": 5}}));
    }

    #[test]
    fn add_appends_to_arrays_with_a_dash() {
        let mut doc = json!({"args": ["--a"]});
        PatchOperation {
            op: "add".into(),
            path: "/args/-".into(),
            value: json!("--b"),
        }
        .apply(&mut doc)
        .unwrap();
        assert_eq!(doc, json!({"args": ["--a", "--b"]}));
    }

    #[test]
    fn pointer_tokens_are_decoded() {
        let mut doc = json!({"metadata": {"annotations": {}}});
        PatchOperation {
            op: "add".into(),
            path: "/metadata/annotations/example.com~1key".into(),
            value: json!("v"),
        }
        .apply(&mut doc)
        .unwrap();
        assert_eq!(doc, json!({"metadata": {"annotations": {"example.com/key": "v"}}}));
    }

    #[test]
    fn replace_on_a_missing_path_fails() {
        let mut doc = json!({"spec": {}});
        let err = PatchOperation {
            op: "replace".into(),
            path: "/spec/replicas".into(),
            value: json!(1),
        }
        .apply(&mut doc)
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn generate_patches_covers_every_target_of_resolved_values() {
        let manifest = PackageManifest {
            value_definitions: [
                (
                    "replicas".to_owned(),
                    crate::crd::ValueDefinition {
                        r#type: crate::crd::ValueType::Number,
                        metadata: Default::default(),
                        default_value: String::new(),
                        options: Vec::new(),
                        constraints: Default::default(),
                        targets: vec![
                            resource_target("add", "/spec/replicas", Some("{{ value }}")),
                            chart_target("argo-cd", "add", "/server/replicas", Some("{{ value }}")),
                        ],
                    },
                ),
                (
                    "unused".to_owned(),
                    crate::crd::ValueDefinition {
                        r#type: crate::crd::ValueType::Text,
                        metadata: Default::default(),
                        default_value: String::new(),
                        options: Vec::new(),
                        constraints: Default::default(),
                        targets: vec![resource_target("add", "/spec/host", None)],
                    },
                ),
            ]
            .into(),
            ..Default::default()
        };
        let values = [("replicas".to_owned(), "2".to_owned())].into();

        let patches = generate_patches(&manifest, &values).unwrap();
        assert_eq!(patches.0.len(), 2);

        let mut obj = deployment("test");
        patches.apply_to_resource(&mut obj).unwrap();
        assert_eq!(obj.data, json!({"spec": {"replicas": 2}}));

        let mut helm_values = Value::Null;
        patches.apply_to_helm_values("argo-cd", &mut helm_values).unwrap();
        assert_eq!(helm_values, json!({"server": {"replicas": 2}}));
    }
}
