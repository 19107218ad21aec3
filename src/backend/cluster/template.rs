// src/backend/cluster/template.rs

//! Pod manifest rendering.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::backend::CreateError;

/// Longest name or label value the cluster accepts.
const MAX_NAME_LEN: usize = 63;

/// Built-in single-container pod used when no template file is configured.
pub fn default_template(image: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {},
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "runner",
                "image": image,
            }]
        }
    })
}

/// Per-instance values layered on top of the template.
#[derive(Debug, Clone, Default)]
pub struct PodOverrides {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<(String, String)>,
    pub service_account: Option<String>,
}

/// Lowercase RFC 1123 label: `[a-z0-9-]`, no leading/trailing dash.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// `<prefix>-<instance>-<attempt>`, truncated so the attempt suffix survives.
pub fn workload_name(prefix: &str, instance_id: &str, attempt: u32) -> String {
    let suffix = format!("-{attempt}");
    let mut base = sanitize_name(&format!("{prefix}-{instance_id}"));
    base.truncate(MAX_NAME_LEN - suffix.len());
    let base = base.trim_end_matches('-');
    format!("{base}{suffix}")
}

/// Label values share the name alphabet plus `_` and `.`.
pub fn label_value(raw: &str) -> String {
    let mut v: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    v.truncate(MAX_NAME_LEN);
    v.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Run `f` on the object stored under `key`, replacing a missing or
/// non-object value with an empty object.
fn with_object<R>(
    parent: &mut Map<String, Value>,
    key: &str,
    f: impl FnOnce(&mut Map<String, Value>) -> R,
) -> R {
    let mut object = match parent.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let out = f(&mut object);
    parent.insert(key.to_string(), Value::Object(object));
    out
}

/// Render the manifest for one attempt.
///
/// The template must be a pod with at least one container that names an
/// image; overrides always win over template values.
pub fn render_manifest(template: &Value, overrides: &PodOverrides) -> Result<Value, CreateError> {
    let mut manifest = template.clone();
    let Some(root) = manifest.as_object_mut() else {
        return Err(CreateError::invalid_spec("pod template must be a JSON object"));
    };

    match root.get("kind").and_then(Value::as_str) {
        None | Some("Pod") => {}
        Some(other) => {
            return Err(CreateError::invalid_spec(format!(
                "pod template has kind '{other}', expected 'Pod'"
            )));
        }
    }
    root.insert("apiVersion".into(), json!("v1"));
    root.insert("kind".into(), json!("Pod"));

    with_object(root, "metadata", |metadata| {
        metadata.insert("name".into(), json!(overrides.name));
        metadata.insert("namespace".into(), json!(overrides.namespace));
        metadata.remove("generateName");
        with_object(metadata, "labels", |labels| {
            for (k, v) in &overrides.labels {
                labels.insert(k.clone(), json!(label_value(v)));
            }
        });
    });

    with_object(root, "spec", |spec| {
        // Each attempt is a fresh pod; restarts are the controller's call.
        spec.insert("restartPolicy".into(), json!("Never"));
        if let Some(sa) = &overrides.service_account {
            spec.insert("serviceAccountName".into(), json!(sa));
        }

        let Some(runner) = spec
            .get_mut("containers")
            .and_then(Value::as_array_mut)
            .and_then(|cs| cs.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return Err(CreateError::invalid_spec(
                "pod template needs at least one container",
            ));
        };
        if runner
            .get("image")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty)
        {
            return Err(CreateError::invalid_spec(
                "first container of the pod template has no image",
            ));
        }

        let mut entries = match runner.remove("env") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        for (name, value) in &overrides.env {
            entries.retain(|e| e["name"].as_str() != Some(name.as_str()));
            entries.push(json!({"name": name, "value": value}));
        }
        runner.insert("env".into(), Value::Array(entries));
        Ok(())
    })?;

    Ok(manifest)
}
