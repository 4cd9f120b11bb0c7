//! IO slots and param bindings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::refs::{ContextRef, EntityRef};
use crate::error::{Error, Result};
use crate::types::{parse_value, IoType, Validation};

/// Names that may not be used for inputs or outputs.
pub const RESERVED_NAMES: &[&str] = &["globals", "params", "connections"];

/// A typed parameter slot on a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Io {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Type tag; `None` accepts any value.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub iotype: Option<IoType>,

    /// Default value, only allowed on optional slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, alias = "is_optional", skip_serializing_if = "std::ops::Not::not")]
    pub is_optional: bool,

    #[serde(default, alias = "is_list", skip_serializing_if = "std::ops::Not::not")]
    pub is_list: bool,

    /// Render a bool as a bare CLI switch.
    #[serde(default, alias = "is_flag", skip_serializing_if = "std::ops::Not::not")]
    pub is_flag: bool,

    /// Template used by `as_arg`, e.g. `--lr {{ lr }}`.
    #[serde(default, alias = "arg_format", skip_serializing_if = "Option::is_none")]
    pub arg_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    #[serde(default, alias = "to_init", skip_serializing_if = "std::ops::Not::not")]
    pub to_init: bool,

    /// Expose the bound value as this env var on the main container.
    #[serde(default, alias = "to_env", skip_serializing_if = "Option::is_none")]
    pub to_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

impl Io {
    pub fn new(name: impl Into<String>, iotype: IoType) -> Self {
        Self {
            name: name.into(),
            description: None,
            iotype: Some(iotype),
            value: None,
            is_optional: false,
            is_list: false,
            is_flag: false,
            arg_format: None,
            connection: None,
            to_init: false,
            to_env: None,
            validation: None,
        }
    }

    /// Optional slot with a default value.
    pub fn optional(mut self, value: Value) -> Self {
        self.is_optional = true;
        self.value = if value.is_null() { None } else { Some(value) };
        self
    }

    pub fn is_required(&self) -> bool {
        !self.is_optional
    }

    /// Shape checks run when a spec is read.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Schema("IO name is required".into()));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(Error::Schema(format!(
                "IO name `{}` is reserved (reserved names: {})",
                self.name,
                RESERVED_NAMES.join(", ")
            )));
        }
        if !self.is_optional && self.value.is_some() {
            return Err(Error::Schema(format!(
                "IO `{}` is not optional and cannot have a default value",
                self.name
            )));
        }
        if self.is_flag && !matches!(self.iotype, Some(IoType::Bool)) {
            return Err(Error::Schema(format!(
                "IO `{}` is a flag and must be of type bool",
                self.name
            )));
        }
        if let Some(validation) = &self.validation {
            validation.validate_schema().map_err(|e| e.at(&format!("inputs[{}]", self.name)))?;
        }
        if let Some(value) = &self.value {
            if !is_template(value) {
                let parsed = parse_value(&self.name, self.iotype, value, self.is_list)?;
                if let Some(validation) = &self.validation {
                    validation.check(&self.name, &parsed, false)?;
                }
            }
        }
        Ok(())
    }

    /// Coerce and validate a bound value for this slot.
    pub fn parse(&self, value: &Value, runtime: bool) -> Result<Value> {
        if is_template(value) {
            return Ok(value.clone());
        }
        let parsed = parse_value(&self.name, self.iotype, value, self.is_list)?;
        if let Some(validation) = &self.validation {
            validation.check(&self.name, &parsed, runtime)?;
        }
        Ok(parsed)
    }
}

/// Check IO names are unique and individually valid.
pub fn validate_io_list(ios: &[Io], section: &str) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for io in ios {
        io.validate().map_err(|e| e.at(section))?;
        if !seen.insert(io.name.as_str()) {
            return Err(Error::Schema(format!(
                "{}: duplicate IO name `{}`",
                section, io.name
            )));
        }
    }
    Ok(())
}

/// A string value still carrying template tokens.
pub fn is_template(value: &Value) -> bool {
    value.as_str().map(|s| s.contains("{{")).unwrap_or(false)
}

/// A value binding at an operation: a literal or a reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Entity reference (`ops.<name>`, `runs.<uuid>`, `dag`, `joins.<name>`).
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Bind into the template context without an IO slot.
    #[serde(default, alias = "context_only", skip_serializing_if = "std::ops::Not::not")]
    pub context_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    #[serde(default, alias = "to_init", skip_serializing_if = "std::ops::Not::not")]
    pub to_init: bool,

    #[serde(default, alias = "to_env", skip_serializing_if = "Option::is_none")]
    pub to_env: Option<String>,
}

impl Param {
    pub fn literal(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn from_ref(reference: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: Some(Value::String(value.into())),
            reference: Some(reference.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.value.is_none() && self.reference.is_none() {
            return Err(Error::Schema(format!(
                "param `{}` requires a value or a ref",
                name
            )));
        }
        if let Some(reference) = &self.reference {
            let (_, path) = EntityRef::split(reference).map_err(|e| e.at(&format!("params[{}]", name)))?;
            if path.is_none() && self.value_str().is_none() {
                return Err(Error::Schema(format!(
                    "param `{}` with ref `{}` requires a string value",
                    name, reference
                )));
            }
        }
        Ok(())
    }

    pub fn is_literal(&self) -> bool {
        self.reference.is_none()
    }

    pub fn is_ref(&self) -> bool {
        self.reference.is_some()
    }

    pub fn value_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }

    pub fn entity_ref(&self) -> Option<Result<EntityRef>> {
        self.reference.as_deref().map(EntityRef::parse)
    }

    /// Parse `ref` + `value` into a context reference.
    pub fn context_ref(&self) -> Option<Result<ContextRef>> {
        let reference = self.reference.as_deref()?;
        Some(ContextRef::from_param(reference, self.value_str().unwrap_or_default()))
    }

    /// Operation this param depends on, if it references one.
    pub fn upstream_op(&self) -> Result<Option<String>> {
        let entity = self.entity_ref().transpose()?;
        Ok(entity.and_then(|e| e.op_name().map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_io_from_yaml() {
        let yaml = r#"
name: lr
type: float
isOptional: true
value: 0.01
arg_format: "--learning-rate={{ lr }}"
"#;
        let io: Io = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(io.iotype, Some(IoType::Float));
        assert!(io.is_optional);
        assert_eq!(io.arg_format.as_deref(), Some("--learning-rate={{ lr }}"));
        assert!(io.validate().is_ok());
    }

    #[test]
    fn test_required_io_rejects_default() {
        let mut io = Io::new("lr", IoType::Float);
        io.value = Some(json!(0.1));
        assert!(io.validate().is_err());
    }

    #[test]
    fn test_reserved_names() {
        let io = Io::new("globals", IoType::Str);
        let err = io.validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_flag_requires_bool() {
        let mut io = Io::new("verbose", IoType::Str);
        io.is_flag = true;
        assert!(io.validate().is_err());
        io.iotype = Some(IoType::Bool);
        assert!(io.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names() {
        let ios = vec![Io::new("a", IoType::Int), Io::new("a", IoType::Float)];
        assert!(validate_io_list(&ios, "inputs").is_err());
    }

    #[test]
    fn test_default_is_validated() {
        let yaml = r#"
name: epochs
type: int
isOptional: true
value: 200
validation:
  le: 100
"#;
        let io: Io = serde_yaml::from_str(yaml).unwrap();
        assert!(io.validate().is_err());
    }

    #[test]
    fn test_param_requires_value_or_ref() {
        assert!(Param::default().validate("x").is_err());
        assert!(Param::literal(json!(1)).validate("x").is_ok());

        let param = Param::from_ref("ops.A", "outputs.metric");
        assert!(param.validate("x").is_ok());
        assert_eq!(param.upstream_op().unwrap().as_deref(), Some("A"));
        let context = param.context_ref().unwrap().unwrap();
        assert_eq!(context.key(), "ops.A.outputs.metric");
    }

    #[test]
    fn test_param_from_yaml() {
        let yaml = r#"
ref: dag
value: inputs.lr
context_only: true
"#;
        let param: Param = serde_yaml::from_str(yaml).unwrap();
        assert!(param.is_ref());
        assert!(param.context_only);
        assert!(param.upstream_op().unwrap().is_none());

        let param = Param::from_ref("ops.a.outputs.metric", "{{ ops.a.outputs.metric }}");
        assert!(param.validate("x").is_ok());
        assert_eq!(param.upstream_op().unwrap().as_deref(), Some("a"));
    }
}
