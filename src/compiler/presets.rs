//! Preset and run-patch merging.
//!
//! Merges work on the JSON form of the spec. Each [`PatchStrategy`] is a
//! deterministic function over a `(target, patch)` pair, and only the keys in
//! [`PATCHABLE_KEYS`] are touched by presets.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::flow::{from_value, Operation, PatchStrategy, Run};

/// Operation keys a preset may patch (camelCase wire names).
pub const PATCHABLE_KEYS: &[&str] = &[
    "name",
    "description",
    "tags",
    "queue",
    "namespace",
    "cache",
    "build",
    "hooks",
    "events",
    "plugins",
    "termination",
    "matrix",
    "joins",
    "schedule",
    "dependencies",
    "trigger",
    "conditions",
    "skipOnUpstreamSkip",
];

/// Merge `patch` into `target` under `strategy`.
pub fn merge(target: &Value, patch: &Value, strategy: PatchStrategy) -> Value {
    match strategy {
        PatchStrategy::Replace => {
            if patch.is_null() {
                target.clone()
            } else {
                patch.clone()
            }
        }
        PatchStrategy::Isnull => {
            if is_unset(target) {
                patch.clone()
            } else {
                target.clone()
            }
        }
        PatchStrategy::PostMerge => deep_merge(target, patch, true),
        PatchStrategy::PreMerge => deep_merge(target, patch, false),
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn deep_merge(target: &Value, patch: &Value, patch_wins: bool) -> Value {
    match (target, patch) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (Value::Object(a), Value::Object(b)) => {
            // tagged variants of different kinds do not merge
            if let (Some(ka), Some(kb)) = (a.get("kind"), b.get("kind")) {
                if ka != kb {
                    return if patch_wins { patch.clone() } else { target.clone() };
                }
            }
            let mut out: Map<String, Value> = a.clone();
            for (key, pv) in b {
                let merged = match a.get(key) {
                    Some(tv) => deep_merge(tv, pv, patch_wins),
                    None => pv.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(a), Value::Array(b)) => {
            let (first, second) = if patch_wins { (a, b) } else { (b, a) };
            let mut out: Vec<Value> = first.clone();
            for item in second {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        _ => {
            if patch_wins {
                patch.clone()
            } else {
                target.clone()
            }
        }
    }
}

/// Apply one preset to an operation using the preset's strategy.
pub fn apply_preset(op: &Operation, preset: &Operation) -> Result<Operation> {
    let strategy = preset.patch_strategy.unwrap_or_default();
    let mut target = serde_json::to_value(op)?;
    let patch = serde_json::to_value(preset)?;
    let Value::Object(target_map) = &mut target else {
        return Err(Error::Compiler("operation did not serialize to a mapping".into()));
    };

    for key in PATCHABLE_KEYS.iter().chain(std::iter::once(&"runPatch")) {
        let Some(patch_value) = patch.get(*key) else {
            continue;
        };
        let current = target_map.get(*key).cloned().unwrap_or(Value::Null);
        let merged = merge(&current, patch_value, strategy);
        if merged.is_null() {
            target_map.remove(*key);
        } else {
            target_map.insert(key.to_string(), merged);
        }
    }
    from_value(target).map_err(|e| e.at("presets"))
}

/// Apply every preset in order.
pub fn apply_presets(op: &Operation, presets: &[Operation]) -> Result<Operation> {
    presets
        .iter()
        .try_fold(op.clone(), |acc, preset| apply_preset(&acc, preset))
}

/// Merge a `runPatch` against a run block of the same kind.
pub fn apply_run_patch(run: &Run, patch: &Value, strategy: PatchStrategy) -> Result<Run> {
    let Value::Object(patch_map) = patch else {
        return Err(Error::Compiler("runPatch must be a mapping".into()));
    };
    let kind = run.kind();
    if let Some(patch_kind) = patch_map.get("kind").and_then(Value::as_str) {
        if patch_kind != kind.as_str() {
            return Err(Error::Compiler(format!(
                "runPatch of kind `{}` cannot patch a `{}` run",
                patch_kind, kind
            )));
        }
    }
    let mut patch_map = patch_map.clone();
    patch_map.remove("kind");

    let current = serde_json::to_value(run)?;
    let mut merged = merge(&current, &Value::Object(patch_map), strategy);
    if let Value::Object(map) = &mut merged {
        map.insert("kind".into(), Value::String(kind.as_str().to_string()));
    }
    from_value(merged).map_err(|e| e.at("runPatch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategies() {
        let target = json!({"a": 1, "tags": ["x"], "nested": {"k": 1}});
        let patch = json!({"a": 2, "tags": ["y"], "nested": {"j": 2}});

        assert_eq!(merge(&target, &patch, PatchStrategy::Replace), patch);
        assert_eq!(merge(&target, &patch, PatchStrategy::Isnull), target);
        assert_eq!(merge(&Value::Null, &patch, PatchStrategy::Isnull), patch);

        let post = merge(&target, &patch, PatchStrategy::PostMerge);
        assert_eq!(post["a"], 2);
        assert_eq!(post["tags"], json!(["x", "y"]));
        assert_eq!(post["nested"], json!({"k": 1, "j": 2}));

        let pre = merge(&target, &patch, PatchStrategy::PreMerge);
        assert_eq!(pre["a"], 1);
        assert_eq!(pre["tags"], json!(["y", "x"]));
    }

    #[test]
    fn test_kinds_do_not_merge() {
        let target = json!({"kind": "grid", "params": {"a": 1}});
        let patch = json!({"kind": "random", "numRuns": 3});
        assert_eq!(merge(&target, &patch, PatchStrategy::PostMerge), patch);
    }

    #[test]
    fn test_apply_preset() {
        let op: Operation = serde_yaml::from_str(
            r#"
hubRef: trainer
queue: cpu
tags: [a]
params:
  lr: {value: 0.1}
"#,
        )
        .unwrap();
        let preset = crate::flow::read_preset(
            r#"
queue: gpu
tags: [b]
termination: {maxRetries: 2}
params:
  lr: {value: 0.5}
"#,
        )
        .unwrap();
        let patched = apply_preset(&op, &preset).unwrap();
        assert_eq!(patched.queue.as_deref(), Some("gpu"));
        assert_eq!(patched.tags, vec!["a", "b"]);
        assert_eq!(patched.termination.unwrap().max_retries, Some(2));
        // params are not patchable
        assert_eq!(patched.params["lr"].value, Some(json!(0.1)));
        assert!(!patched.is_preset);

        let isnull: Operation = serde_yaml::from_str("isPreset: true\npatchStrategy: isnull\nqueue: gpu").unwrap();
        let patched = apply_preset(&op, &isnull).unwrap();
        assert_eq!(patched.queue.as_deref(), Some("cpu"));
    }

    #[test]
    fn test_run_patch() {
        let run: Run = serde_yaml::from_str(
            r#"
kind: job
container:
  image: python
  command: [python, train.py]
"#,
        )
        .unwrap();
        let patch = json!({"kind": "job", "container": {"image": "python:3.12", "args": ["--fast"]}});
        let patched = apply_run_patch(&run, &patch, PatchStrategy::PostMerge).unwrap();
        match patched {
            Run::Job(job) => {
                assert_eq!(job.container.image.as_deref(), Some("python:3.12"));
                assert_eq!(job.container.command, vec!["python", "train.py"]);
                assert_eq!(job.container.args, vec!["--fast"]);
            }
            _ => panic!("Expected job"),
        }

        let err = apply_run_patch(&run, &json!({"kind": "service"}), PatchStrategy::PostMerge).unwrap_err();
        assert!(err.to_string().contains("cannot patch"));
    }
}
