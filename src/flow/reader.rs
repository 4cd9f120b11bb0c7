//! Spec reader: YAML or JSON text to a typed spec.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::compiled::CompiledOperation;
use super::component::Component;
use super::operation::Operation;
use crate::error::{Error, Result};

/// Supported major spec version.
pub const SPEC_MAJOR_VERSION: u64 = 1;

/// A parsed top-level spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Spec {
    Component(Component),
    Operation(Operation),
    CompiledOperation(CompiledOperation),
}

impl Spec {
    pub fn kind(&self) -> &'static str {
        match self {
            Spec::Component(_) => "component",
            Spec::Operation(_) => "operation",
            Spec::CompiledOperation(_) => "compiled_operation",
        }
    }

    /// Wrap a component into an operation; operations pass through.
    pub fn into_operation(self) -> Result<Operation> {
        match self {
            Spec::Component(component) => Ok(Operation::with_component(component)),
            Spec::Operation(op) => Ok(op),
            Spec::CompiledOperation(_) => Err(Error::Schema(
                "a compiled_operation cannot be used as an operation".into(),
            )),
        }
    }
}

/// Read a spec from YAML or JSON text.
pub fn read_spec(text: &str) -> Result<Spec> {
    let value = read_value(text)?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Schema("Missing required field: kind".into()))?
        .to_string();
    check_version(value.get("version"))?;
    match kind.as_str() {
        "component" => {
            let component: Component = from_value(value)?;
            component.validate()?;
            Ok(Spec::Component(component))
        }
        "operation" => {
            let op: Operation = from_value(value)?;
            op.validate()?;
            Ok(Spec::Operation(op))
        }
        "compiled_operation" | "compiledOperation" => {
            let compiled: CompiledOperation = from_value(value)?;
            compiled.validate()?;
            Ok(Spec::CompiledOperation(compiled))
        }
        other => Err(Error::Schema(format!(
            "unsupported spec kind `{}` (expected component, operation or compiled_operation)",
            other
        ))),
    }
}

/// Read a spec file.
pub fn read_spec_file(path: &Path) -> Result<Spec> {
    let content = std::fs::read_to_string(path)?;
    read_spec(&content)
}

/// Read a preset operation: `kind` defaults to operation and `isPreset` is forced.
pub fn read_preset(text: &str) -> Result<Operation> {
    let mut value = read_value(text)?;
    if let Value::Object(map) = &mut value {
        map.entry("kind").or_insert_with(|| Value::String("operation".into()));
        map.insert("isPreset".into(), Value::Bool(true));
        map.remove("is_preset");
    }
    check_version(value.get("version"))?;
    let op: Operation = from_value(value)?;
    op.validate()?;
    Ok(op)
}

/// Parse YAML or JSON into a JSON value.
pub fn read_value(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Err(Error::Schema("Empty spec definition".into()));
    }
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| Error::Schema(format!("Invalid YAML: {}", e)))?;
    if !value.is_object() {
        return Err(Error::Schema("spec must be a mapping".into()));
    }
    Ok(value)
}

/// Deserialize a typed spec, naming the missing field on failure.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        let msg = e.to_string();
        match extract_missing_field(&msg) {
            Some(field) => Error::Schema(format!("Missing required field: {}", field)),
            None => Error::Schema(msg),
        }
    })
}

fn check_version(version: Option<&Value>) -> Result<()> {
    let Some(version) = version else {
        return Ok(());
    };
    let raw = match version {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => {
            return Err(Error::Schema(format!("invalid spec version `{}`", other)));
        }
    };
    let major = raw
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::Schema(format!("invalid spec version `{}`", raw)))?;
    if major != SPEC_MAJOR_VERSION {
        return Err(Error::Schema(format!(
            "unsupported spec version `{}` (major version must be {})",
            raw, SPEC_MAJOR_VERSION
        )));
    }
    Ok(())
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_component() {
        let yaml = r#"
version: 1.1
kind: component
name: trainer
run:
  kind: job
  container:
    image: busybox
"#;
        let spec = read_spec(yaml).unwrap();
        assert_eq!(spec.kind(), "component");
        let op = spec.into_operation().unwrap();
        assert!(op.component.is_some());
    }

    #[test]
    fn test_read_json() {
        let json = r#"{"version": 1.1, "kind": "operation", "hubRef": "trainer", "params": {"lr": {"value": 0.1}}}"#;
        let spec = read_spec(json).unwrap();
        match spec {
            Spec::Operation(op) => assert_eq!(op.hub_ref.as_deref(), Some("trainer")),
            other => panic!("Expected operation, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_version_major() {
        let yaml = "version: 2.0\nkind: operation\nhubRef: x";
        let err = read_spec(yaml).unwrap_err();
        assert!(err.to_string().contains("major version"));
    }

    #[test]
    fn test_missing_kind() {
        let err = read_spec("name: x").unwrap_err();
        assert!(err.to_string().contains("Missing required field: kind"));
    }

    #[test]
    fn test_missing_run() {
        let err = read_spec("kind: component\nname: x").unwrap_err();
        assert!(err.to_string().contains("Missing required field: run"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_empty_and_invalid() {
        assert!(read_spec("").is_err());
        let err = read_spec("kind: [broken").unwrap_err();
        assert!(err.to_string().contains("Invalid YAML"));
    }

    #[test]
    fn test_read_preset() {
        let preset = read_preset("queue: gpu\nplugins:\n  auth: false").unwrap();
        assert!(preset.is_preset);
        assert_eq!(preset.queue.as_deref(), Some("gpu"));
    }
}
