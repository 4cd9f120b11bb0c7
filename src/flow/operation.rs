//! Operations: invocations of a component.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::component::{is_identifier, Component};
use super::environment::Termination;
use super::io::Param;
use super::lifecycle::{Build, Cache, EventTrigger, Hook, Join, Schedule, TriggerPolicy};
use super::matrix::Matrix;
use super::plugins::Plugins;
use crate::error::{Error, Result};

/// How a preset or patch is merged into its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    /// Patch values replace target values.
    Replace,
    /// Patch values only fill unset target values.
    Isnull,
    /// Deep merge; patch wins on conflicts and lists are appended.
    #[default]
    PostMerge,
    /// Deep merge; target wins on conflicts and patch lists are prepended.
    PreMerge,
}

/// A component reference kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSource {
    Hub,
    Dag,
    Url,
    Path,
    Inline,
}

/// An invocation of a component with params and overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
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
    #[serde(default, alias = "run_patch", skip_serializing_if = "Option::is_none")]
    pub run_patch: Option<Value>,
    #[serde(default, alias = "patch_strategy", skip_serializing_if = "Option::is_none")]
    pub patch_strategy: Option<PatchStrategy>,
    #[serde(default, alias = "is_preset", skip_serializing_if = "std::ops::Not::not")]
    pub is_preset: bool,
    #[serde(default, alias = "is_approved", skip_serializing_if = "Option::is_none")]
    pub is_approved: Option<bool>,
    #[serde(default, alias = "hub_ref", skip_serializing_if = "Option::is_none")]
    pub hub_ref: Option<String>,
    #[serde(default, alias = "dag_ref", skip_serializing_if = "Option::is_none")]
    pub dag_ref: Option<String>,
    #[serde(default, alias = "url_ref", skip_serializing_if = "Option::is_none")]
    pub url_ref: Option<String>,
    #[serde(default, alias = "path_ref", skip_serializing_if = "Option::is_none")]
    pub path_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Box<Component>>,
}

impl Operation {
    pub fn with_component(component: Component) -> Self {
        Self {
            kind: Some("operation".to_string()),
            component: Some(Box::new(component)),
            ..Default::default()
        }
    }

    /// Which component reference is set; exactly one unless a preset.
    pub fn component_source(&self) -> Result<Option<ComponentSource>> {
        let mut sources = Vec::new();
        if self.hub_ref.is_some() {
            sources.push(ComponentSource::Hub);
        }
        if self.dag_ref.is_some() {
            sources.push(ComponentSource::Dag);
        }
        if self.url_ref.is_some() {
            sources.push(ComponentSource::Url);
        }
        if self.path_ref.is_some() {
            sources.push(ComponentSource::Path);
        }
        if self.component.is_some() {
            sources.push(ComponentSource::Inline);
        }
        match sources.as_slice() {
            [source] => Ok(Some(*source)),
            [] if self.is_preset => Ok(None),
            [] => Err(Error::Validation(
                "operation requires one of hubRef, dagRef, urlRef, pathRef or component".into(),
            )),
            _ if self.is_preset => Ok(None),
            _ => Err(Error::Validation(format!(
                "operation accepts only one component reference, got {:?}",
                sources
            ))),
        }
    }

    /// The reference label used in error paths.
    pub fn reference_label(&self) -> String {
        if let Some(r) = &self.hub_ref {
            return format!("hub:{}", r);
        }
        if let Some(r) = &self.dag_ref {
            return format!("dag:{}", r);
        }
        if let Some(r) = &self.url_ref {
            return format!("url:{}", r);
        }
        if let Some(r) = &self.path_ref {
            return format!("path:{}", r);
        }
        self.component
            .as_ref()
            .and_then(|c| c.name.clone())
            .unwrap_or_else(|| "inline".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        self.component_source()?;
        if let Some(name) = &self.name {
            if !is_identifier(name) {
                return Err(Error::Schema(format!(
                    "operation name `{}` may only contain letters, digits, `-` and `_`",
                    name
                )));
            }
        }
        for (name, param) in &self.params {
            param.validate(name)?;
        }
        if let Some(matrix) = &self.matrix {
            matrix.validate()?;
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        for event in &self.events {
            event.validate()?;
        }
        for (name, join) in &self.joins {
            if join.query.trim().is_empty() {
                return Err(Error::Schema(format!("join `{}` requires a query", name)));
            }
            for (param_name, param) in &join.params {
                param.validate(param_name).map_err(|e| e.at(&format!("joins[{}]", name)))?;
            }
        }
        if let Some(component) = &self.component {
            component.validate()?;
        }
        Ok(())
    }

    /// Upstream operations declared explicitly, via param refs, or via events.
    pub fn upstream(&self) -> Result<Vec<String>> {
        let mut upstream: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !upstream.contains(&name) {
                upstream.push(name);
            }
        };
        for dep in &self.dependencies {
            push(dep.clone());
        }
        for (name, param) in &self.params {
            if let Some(op) = param.upstream_op().map_err(|e| e.at(&format!("params[{}]", name)))? {
                push(op);
            }
        }
        for (i, event) in self.events.iter().enumerate() {
            push(event.upstream_op().map_err(|e| e.at(&format!("events[{}]", i)))?);
        }
        Ok(upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_reference() {
        let op: Operation = serde_yaml::from_str("hubRef: trainer").unwrap();
        assert_eq!(op.component_source().unwrap(), Some(ComponentSource::Hub));

        let op: Operation = serde_yaml::from_str("hubRef: trainer\ndag_ref: local").unwrap();
        assert!(op.component_source().is_err());

        let op: Operation = serde_yaml::from_str("name: empty").unwrap();
        assert!(op.component_source().is_err());

        let op: Operation = serde_yaml::from_str("isPreset: true\nqueue: gpu").unwrap();
        assert_eq!(op.component_source().unwrap(), None);
    }

    #[test]
    fn test_upstream_union() {
        let yaml = r#"
name: evaluate
dagRef: evaluator
dependencies: [prepare]
params:
  model:
    ref: ops.train
    value: outputs.model
  threshold:
    value: 0.5
events:
  - kinds: [run_status_done]
    ref: ops.monitor
  - kinds: [run_status_succeeded]
    ref: ops.train
"#;
        let op: Operation = serde_yaml::from_str(yaml).unwrap();
        assert!(op.validate().is_ok());
        assert_eq!(op.upstream().unwrap(), vec!["prepare", "train", "monitor"]);
    }

    #[test]
    fn test_upstream_rejects_malformed_event_ref() {
        let yaml = r#"
name: evaluate
dagRef: evaluator
events:
  - kinds: [run_status_done]
    ref: dag.inputs
"#;
        let op: Operation = serde_yaml::from_str(yaml).unwrap();
        let err = op.upstream().unwrap_err();
        assert!(err.to_string().contains("events[0]"));
    }

    #[test]
    fn test_operation_names_allow_uppercase() {
        let op: Operation = serde_yaml::from_str("name: TrainA
hubRef: trainer").unwrap();
        assert!(op.validate().is_ok());
        let op: Operation = serde_yaml::from_str("name: train.a
hubRef: trainer").unwrap();
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_default_patch_strategy() {
        assert_eq!(PatchStrategy::default(), PatchStrategy::PostMerge);
        let op: Operation =
            serde_yaml::from_str("isPreset: true\npatchStrategy: pre_merge").unwrap();
        assert_eq!(op.patch_strategy, Some(PatchStrategy::PreMerge));
    }
}
