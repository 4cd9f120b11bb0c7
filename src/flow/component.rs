//! Components: reusable typed units of work.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::environment::Termination;
use super::io::{validate_io_list, Io};
use super::lifecycle::{Build, Cache, Hook};
use super::plugins::Plugins;
use super::run::Run;
use crate::error::{Error, Result};

/// A reusable unit of work with typed inputs/outputs and a run block.
///
/// # Example YAML
///
/// ```yaml
/// version: 1.1
/// kind: component
/// name: trainer
/// inputs:
///   - name: lr
///     type: float
///     isOptional: true
///     value: 0.01
/// run:
///   kind: job
///   container:
///     image: python:3.11
///     command: [python, train.py]
///     args: ["{{ params.lr.as_arg }}"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Cache>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Io>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Io>,

    pub run: Run,
}

impl Component {
    pub fn new(run: Run) -> Self {
        Self {
            version: None,
            kind: Some("component".to_string()),
            name: None,
            description: None,
            tags: vec![],
            presets: vec![],
            queue: None,
            namespace: None,
            cache: None,
            termination: None,
            plugins: None,
            build: None,
            hooks: vec![],
            inputs: vec![],
            outputs: vec![],
            run,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if !is_slug(name) {
                return Err(Error::Schema(format!(
                    "component name `{}` must be a slug (lowercase letters, digits, `-`, `_`)",
                    name
                )));
            }
        }
        validate_io_list(&self.inputs, "inputs")?;
        validate_io_list(&self.outputs, "outputs")?;
        for input in &self.inputs {
            if self.outputs.iter().any(|o| o.name == input.name) {
                return Err(Error::Schema(format!(
                    "`{}` is declared both as an input and an output",
                    input.name
                )));
            }
        }
        self.run.validate()?;
        if let Some(dag) = self.run.as_dag() {
            for component in &dag.components {
                component.validate().map_err(|e| {
                    e.at(&format!(
                        "run.components[{}]",
                        component.name.as_deref().unwrap_or("?")
                    ))
                })?;
            }
            for op in &dag.operations {
                op.validate()
                    .map_err(|e| e.at(&format!("run.operations[{}]", op.name.as_deref().unwrap_or("?"))))?;
            }
        }
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&Io> {
        self.inputs.iter().find(|io| io.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Io> {
        self.outputs.iter().find(|io| io.name == name)
    }

    /// Plugins with defaults filled in.
    pub fn plugins(&self) -> Plugins {
        self.plugins.clone().unwrap_or_default()
    }
}

/// Operation names are segments of dotted references (`ops.<name>.outputs.x`),
/// so they allow either case but never a dot.
pub(crate) fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::run::RunKind;

    #[test]
    fn test_component_from_yaml() {
        let yaml = r#"
version: 1.1
kind: component
name: trainer
inputs:
  - name: lr
    type: float
    isOptional: true
    value: 0.01
outputs:
  - name: loss
    type: float
run:
  kind: job
  container:
    image: python:3.11
    args: ["{{ params.lr.as_arg }}"]
"#;
        let component: Component = serde_yaml::from_str(yaml).unwrap();
        assert!(component.validate().is_ok());
        assert_eq!(component.run.kind(), RunKind::Job);
        assert!(component.input("lr").unwrap().is_optional);
        assert!(component.output("loss").is_some());
    }

    #[test]
    fn test_bad_slug() {
        let yaml = r#"
name: "Bad Name"
run:
  kind: job
  container:
    image: busybox
"#;
        let component: Component = serde_yaml::from_str(yaml).unwrap();
        assert!(component.validate().is_err());
    }

    #[test]
    fn test_input_output_overlap() {
        let yaml = r#"
inputs:
  - {name: x, type: int}
outputs:
  - {name: x, type: int}
run:
  kind: job
  container:
    image: busybox
"#;
        let component: Component = serde_yaml::from_str(yaml).unwrap();
        assert!(component.validate().is_err());
    }
}
