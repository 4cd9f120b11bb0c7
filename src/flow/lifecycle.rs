//! Scheduling, triggering and follow-up settings of an operation.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::io::Param;
use super::operation::{Operation, PatchStrategy};
use super::refs::EntityRef;
use crate::error::{Error, Result};

/// When an operation is (re)scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Cron(CronSchedule),
    Interval(IntervalSchedule),
    Datetime(DatetimeSchedule),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub cron: String,
    #[serde(default, alias = "start_at", skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "end_at", skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "max_runs", skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, alias = "depends_on_past", skip_serializing_if = "std::ops::Not::not")]
    pub depends_on_past: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSchedule {
    /// Seconds between runs.
    pub frequency: u64,
    #[serde(default, alias = "start_at", skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "end_at", skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "max_runs", skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, alias = "depends_on_past", skip_serializing_if = "std::ops::Not::not")]
    pub depends_on_past: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatetimeSchedule {
    #[serde(alias = "start_at")]
    pub start_at: DateTime<Utc>,
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        let (start_at, end_at) = match self {
            Schedule::Cron(cron) => {
                let fields = cron.cron.split_whitespace().count();
                if !(5..=6).contains(&fields) {
                    return Err(Error::Schema(format!(
                        "cron schedule `{}` must have 5 or 6 fields",
                        cron.cron
                    )));
                }
                (cron.start_at, cron.end_at)
            }
            Schedule::Interval(interval) => {
                if interval.frequency == 0 {
                    return Err(Error::Schema("interval schedule frequency must be positive".into()));
                }
                (interval.start_at, interval.end_at)
            }
            Schedule::Datetime(_) => (None, None),
        };
        if let (Some(start), Some(end)) = (start_at, end_at) {
            if end <= start {
                return Err(Error::Schema("schedule endAt must be after startAt".into()));
            }
        }
        Ok(())
    }
}

/// Run lifecycle events an operation can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStatusCreated,
    RunStatusResuming,
    RunStatusRunning,
    RunStatusProcessing,
    RunStatusStopped,
    RunStatusFailed,
    RunStatusSucceeded,
    RunStatusSkipped,
    RunStatusWarning,
    RunStatusUnschedulable,
    RunStatusUpstreamFailed,
    RunStatusRetrying,
    RunStatusUnknown,
    RunStatusDone,
    RunApprovedActor,
    RunInvalidatedActor,
    RunNewArtifacts,
}

/// Wait on events emitted by another operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub kinds: Vec<EventKind>,
    #[serde(rename = "ref")]
    pub reference: String,
}

impl EventTrigger {
    pub fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(Error::Schema(format!(
                "event trigger on `{}` requires at least one kind",
                self.reference
            )));
        }
        self.upstream_op().map(|_| ())
    }

    /// The operation this trigger listens to.
    pub fn upstream_op(&self) -> Result<String> {
        let entity = EntityRef::parse(&self.reference)?;
        entity.op_name().map(str::to_string).ok_or_else(|| {
            Error::Schema(format!(
                "event ref `{}` must reference an operation (ops.<name>)",
                self.reference
            ))
        })
    }
}

/// When a downstream operation fires relative to its upstream statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    AllSucceeded,
    AllFailed,
    AllDone,
    OneSucceeded,
    OneFailed,
    OneDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    Maximize,
    Minimize,
}

/// Early stopping policies for matrix and DAG runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EarlyStopping {
    MetricEarlyStopping(MetricEarlyStopping),
    FailureEarlyStopping(FailureEarlyStopping),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEarlyStopping {
    pub metric: String,
    pub value: f64,
    pub optimization: Optimization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEarlyStopping {
    /// Percentage of failed runs that stops the whole group.
    pub percent: f64,
}

impl EarlyStopping {
    pub fn validate(&self) -> Result<()> {
        if let EarlyStopping::FailureEarlyStopping(failure) = self {
            if !(0.0..=100.0).contains(&failure.percent) {
                return Err(Error::Schema(format!(
                    "failure early stopping percent must be within [0, 100], got {}",
                    failure.percent
                )));
            }
        }
        Ok(())
    }
}

/// Result caching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Inputs that participate in the cache key; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub io: Vec<String>,
}

/// A build step producing the image a run uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(alias = "hub_ref")]
    pub hub_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, alias = "run_patch", skip_serializing_if = "Option::is_none")]
    pub run_patch: Option<Value>,
    #[serde(default, alias = "patch_strategy", skip_serializing_if = "Option::is_none")]
    pub patch_strategy: Option<PatchStrategy>,
}

impl Build {
    /// Standalone operation that performs the build.
    pub fn to_operation(&self) -> Operation {
        let mut params = self.params.clone();
        if let Some(connection) = &self.connection {
            params
                .entry("destination".to_string())
                .or_insert_with(|| Param {
                    connection: Some(connection.clone()),
                    value: Some(Value::String(connection.clone())),
                    ..Default::default()
                });
        }
        Operation {
            hub_ref: Some(self.hub_ref.clone()),
            params,
            presets: self.presets.clone(),
            queue: self.queue.clone(),
            run_patch: self.run_patch.clone(),
            patch_strategy: self.patch_strategy,
            ..Default::default()
        }
    }
}

/// Run statuses a hook fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    Succeeded,
    Failed,
    Stopped,
    Done,
}

impl HookTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookTrigger::Succeeded => "succeeded",
            HookTrigger::Failed => "failed",
            HookTrigger::Stopped => "stopped",
            HookTrigger::Done => "done",
        }
    }

    /// Whether a final run status fires this trigger.
    pub fn matches(&self, status: &str) -> bool {
        match self {
            HookTrigger::Done => matches!(status, "succeeded" | "failed" | "stopped" | "skipped"),
            other => other.as_str() == status,
        }
    }
}

/// A follow-up operation fired by the lifecycle of its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<HookTrigger>,
    #[serde(alias = "hub_ref")]
    pub hub_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, alias = "disable_defaults", skip_serializing_if = "std::ops::Not::not")]
    pub disable_defaults: bool,
}

impl Hook {
    /// Build the hook operation from the parent's resolved globals.
    ///
    /// Unless `disable_defaults` is set the parent's uuid, name, status and
    /// conditions are bound as context-only params.
    pub fn to_operation(&self, parent: &IndexMap<String, Value>) -> Operation {
        let mut params = IndexMap::new();
        if !self.disable_defaults {
            for key in ["uuid", "name", "status", "condition"] {
                let value = parent.get(key).cloned().unwrap_or(Value::Null);
                params.insert(
                    key.to_string(),
                    Param {
                        value: Some(value),
                        context_only: true,
                        ..Default::default()
                    },
                );
            }
        }
        for (name, param) in &self.params {
            params.insert(name.clone(), param.clone());
        }
        if let Some(connection) = &self.connection {
            params
                .entry("connection".to_string())
                .or_insert_with(|| Param {
                    value: Some(Value::String(connection.clone())),
                    connection: Some(connection.clone()),
                    context_only: true,
                    ..Default::default()
                });
        }
        Operation {
            hub_ref: Some(self.hub_ref.clone()),
            params,
            presets: self.presets.clone(),
            queue: self.queue.clone(),
            conditions: self.conditions.clone(),
            ..Default::default()
        }
    }
}

/// A query over other runs, exposed as `joins.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Param name to the field collected from each joined run.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Param>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_schedule() {
        let yaml = r#"
kind: cron
cron: "0 0 * * *"
startAt: "2024-01-01T00:00:00Z"
end_at: "2024-02-01T00:00:00Z"
maxRuns: 10
"#;
        let schedule: Schedule = serde_yaml::from_str(yaml).unwrap();
        assert!(schedule.validate().is_ok());

        let bad: Schedule = serde_yaml::from_str("kind: cron\ncron: \"* *\"").unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_schedule_end_before_start() {
        let yaml = r#"
kind: interval
frequency: 60
startAt: "2024-02-01T00:00:00Z"
endAt: "2024-01-01T00:00:00Z"
"#;
        let schedule: Schedule = serde_yaml::from_str(yaml).unwrap();
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_event_trigger_ref() {
        let yaml = r#"
kinds: [run_status_succeeded]
ref: ops.train
"#;
        let event: EventTrigger = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(event.upstream_op().unwrap(), "train");

        let event = EventTrigger {
            kinds: vec![EventKind::RunStatusDone],
            reference: "runs.abc".into(),
        };
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_early_stopping() {
        let yaml = r#"
kind: metric_early_stopping
metric: loss
value: 0.01
optimization: minimize
"#;
        let stopping: EarlyStopping = serde_yaml::from_str(yaml).unwrap();
        assert!(stopping.validate().is_ok());

        let stopping = EarlyStopping::FailureEarlyStopping(FailureEarlyStopping { percent: 120.0 });
        assert!(stopping.validate().is_err());
    }

    #[test]
    fn test_hook_to_operation() {
        let hook = Hook {
            trigger: Some(HookTrigger::Failed),
            hub_ref: "slack-notifier".into(),
            connection: Some("slack".into()),
            params: IndexMap::new(),
            presets: vec![],
            queue: Some("hooks".into()),
            conditions: None,
            disable_defaults: false,
        };
        let mut parent = IndexMap::new();
        parent.insert("uuid".to_string(), Value::String("abc".into()));
        parent.insert("status".to_string(), Value::String("failed".into()));

        let op = hook.to_operation(&parent);
        assert_eq!(op.hub_ref.as_deref(), Some("slack-notifier"));
        assert_eq!(op.params["uuid"].value, Some(Value::String("abc".into())));
        assert!(op.params["uuid"].context_only);
        assert_eq!(op.params["connection"].connection.as_deref(), Some("slack"));
        assert_eq!(op.queue.as_deref(), Some("hooks"));
        assert!(HookTrigger::Done.matches("failed"));
        assert!(!HookTrigger::Succeeded.matches("failed"));
    }

    #[test]
    fn test_build_to_operation() {
        let yaml = r#"
hubRef: kaniko
connection: registry
queue: builds
"#;
        let build: Build = serde_yaml::from_str(yaml).unwrap();
        let op = build.to_operation();
        assert_eq!(op.hub_ref.as_deref(), Some("kaniko"));
        assert_eq!(op.params["destination"].connection.as_deref(), Some("registry"));
    }
}
