//! The normalized, fully resolved form of an operation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::component::Component;
use super::environment::Termination;
use super::io::{validate_io_list, Io, Param};
use super::lifecycle::{Build, Cache, EventTrigger, Hook, Join, Schedule, TriggerPolicy};
use super::matrix::Matrix;
use super::operation::Operation;
use super::plugins::Plugins;
use super::run::Run;
use crate::error::Result;

/// Component fields plus the operation-level bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(default = "default_kind")]
    pub kind: String,
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
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub joins: IndexMap<String, Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, alias = "skip_on_upstream_skip", skip_serializing_if = "Option::is_none")]
    pub skip_on_upstream_skip: Option<bool>,
    #[serde(default, alias = "is_approved", skip_serializing_if = "Option::is_none")]
    pub is_approved: Option<bool>,
    pub run: Run,
}

fn default_kind() -> String {
    "compiled_operation".to_string()
}

impl CompiledOperation {
    /// Merge an operation onto its component; operation values win.
    pub fn from_parts(op: &Operation, component: &Component) -> Self {
        let mut tags = component.tags.clone();
        for tag in &op.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let mut hooks = component.hooks.clone();
        hooks.extend(op.hooks.iter().cloned());
        Self {
            version: op.version.clone().or_else(|| component.version.clone()),
            kind: default_kind(),
            name: op.name.clone().or_else(|| component.name.clone()),
            description: op.description.clone().or_else(|| component.description.clone()),
            tags,
            presets: component.presets.clone(),
            queue: op.queue.clone().or_else(|| component.queue.clone()),
            namespace: op.namespace.clone().or_else(|| component.namespace.clone()),
            cache: op.cache.clone().or_else(|| component.cache.clone()),
            termination: op.termination.clone().or_else(|| component.termination.clone()),
            plugins: op.plugins.clone().or_else(|| component.plugins.clone()),
            build: op.build.clone().or_else(|| component.build.clone()),
            hooks,
            inputs: component.inputs.clone(),
            outputs: component.outputs.clone(),
            params: op.params.clone(),
            matrix: op.matrix.clone(),
            joins: op.joins.clone(),
            schedule: op.schedule.clone(),
            events: op.events.clone(),
            dependencies: op.dependencies.clone(),
            trigger: op.trigger,
            conditions: op.conditions.clone(),
            skip_on_upstream_skip: op.skip_on_upstream_skip,
            is_approved: op.is_approved,
            run: component.run.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_io_list(&self.inputs, "inputs")?;
        validate_io_list(&self.outputs, "outputs")?;
        self.run.validate()?;
        for (name, param) in &self.params {
            param.validate(name)?;
        }
        if let Some(matrix) = &self.matrix {
            matrix.validate()?;
        }
        Ok(())
    }

    pub fn plugins(&self) -> Plugins {
        self.plugins.clone().unwrap_or_default()
    }

    pub fn is_dag(&self) -> bool {
        self.run.as_dag().is_some()
    }

    /// The component view of this compiled operation.
    pub fn to_component(&self) -> Component {
        Component {
            version: self.version.clone(),
            kind: Some("component".to_string()),
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            presets: self.presets.clone(),
            queue: self.queue.clone(),
            namespace: self.namespace.clone(),
            cache: self.cache.clone(),
            termination: self.termination.clone(),
            plugins: self.plugins.clone(),
            build: self.build.clone(),
            hooks: self.hooks.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            run: self.run.clone(),
        }
    }

    /// Bound value of an input or output after params were applied.
    pub fn io_value(&self, name: &str) -> Option<&Value> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|io| io.name == name)
            .and_then(|io| io.value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_operation_wins() {
        let component: Component = serde_yaml::from_str(
            r#"
name: trainer
queue: cpu
tags: [ml]
inputs:
  - {name: lr, type: float, isOptional: true, value: 0.01}
run:
  kind: job
  container:
    image: python
"#,
        )
        .unwrap();
        let op: Operation = serde_yaml::from_str(
            r#"
name: train-v2
queue: gpu
tags: [ml, v2]
params:
  lr: {value: 0.1}
"#,
        )
        .unwrap();
        let compiled = CompiledOperation::from_parts(&op, &component);
        assert_eq!(compiled.name.as_deref(), Some("train-v2"));
        assert_eq!(compiled.queue.as_deref(), Some("gpu"));
        assert_eq!(compiled.tags, vec!["ml", "v2"]);
        assert_eq!(compiled.params.len(), 1);
        assert_eq!(compiled.kind, "compiled_operation");
        assert!(compiled.validate().is_ok());
    }
}
