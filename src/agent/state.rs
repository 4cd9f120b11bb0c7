//! Agent state polled from the control plane, and run status conditions.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::compiler::RuntimeContext;
use crate::error::Error;
use crate::flow::RunKind;

/// Live state of an agent record; anything below `LIVE` is archived or deleted.
pub const LIVE: i32 = 1;

/// Statuses a run can be reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Scheduled,
    Running,
    Stopping,
    Stopped,
    Succeeded,
    Failed,
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Scheduled => "scheduled",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One condition appended to a run's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub status_type: RunStatus,
    /// Always "True" for appended conditions.
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(alias = "last_update_time")]
    pub last_update_time: DateTime<Utc>,
    #[serde(alias = "last_transition_time")]
    pub last_transition_time: DateTime<Utc>,
}

impl StatusCondition {
    pub fn new(status_type: RunStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status_type,
            status: "True".to_string(),
            reason: reason.into(),
            message: message.into(),
            last_update_time: now,
            last_transition_time: now,
        }
    }

    /// A `failed` condition classified by error class, with its source chain.
    pub fn failed(err: &Error) -> Self {
        Self::new(RunStatus::Failed, err.reason(), error_summary(err))
    }
}

/// `CODE: message` followed by each source in the chain.
pub fn error_summary(err: &Error) -> String {
    let mut summary = format!("{}: {}", err.code(), err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        summary.push_str("\n  caused by: ");
        summary.push_str(&cause.to_string());
        source = cause.source();
    }
    summary
}

/// A run the control plane wants the agent to act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    #[serde(alias = "owner_name")]
    pub owner_name: String,
    #[serde(alias = "project_name")]
    pub project_name: String,
    #[serde(alias = "run_uuid")]
    pub run_uuid: String,
    #[serde(default, alias = "run_name", skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default, alias = "run_kind", skip_serializing_if = "Option::is_none")]
    pub run_kind: Option<RunKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Spec payload: a compiled operation, or an operation template for
    /// hooks, watchdogs and tuners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Resolved upstream values keyed by qualified name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub refs: IndexMap<String, Value>,
    /// Operation to create once a deleted run is cleaned up.
    #[serde(default, alias = "follow_up", skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
}

impl RunEntry {
    pub fn new(owner: impl Into<String>, project: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            owner_name: owner.into(),
            project_name: project.into(),
            run_uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn runtime(&self) -> RuntimeContext {
        let mut runtime = RuntimeContext::new(&self.run_uuid, &self.owner_name, &self.project_name);
        runtime.name = self.run_name.clone();
        runtime.namespace = self.namespace.clone();
        runtime.refs = self.refs.clone();
        runtime
    }
}

/// Work buckets of one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateBuckets {
    pub schedules: Vec<RunEntry>,
    pub queued: Vec<RunEntry>,
    pub apply: Vec<RunEntry>,
    pub stopping: Vec<RunEntry>,
    pub checks: Vec<RunEntry>,
    pub deleting: Vec<RunEntry>,
    pub hooks: Vec<RunEntry>,
    pub watchdogs: Vec<RunEntry>,
    pub tuners: Vec<RunEntry>,
}

impl StateBuckets {
    /// Buckets in dispatch order, named as reported in metrics.
    pub fn iter(&self) -> [(&'static str, &[RunEntry]); 9] {
        [
            ("schedules", &self.schedules),
            ("queued", &self.queued),
            ("apply", &self.apply),
            ("stopping", &self.stopping),
            ("checks", &self.checks),
            ("deleting", &self.deleting),
            ("hooks", &self.hooks),
            ("watchdogs", &self.watchdogs),
            ("tuners", &self.tuners),
        ]
    }
}

/// Agent record status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// What the control plane returns on each poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default = "default_live_state", alias = "live_state")]
    pub live_state: i32,
    #[serde(default)]
    pub state: StateBuckets,
    #[serde(default, alias = "compatible_updates", skip_serializing_if = "Option::is_none")]
    pub compatible_updates: Option<Value>,
}

fn default_live_state() -> i32 {
    LIVE
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            status: AgentStatus::default(),
            live_state: LIVE,
            state: StateBuckets::default(),
            compatible_updates: None,
        }
    }
}

impl AgentState {
    pub fn is_stopped(&self) -> bool {
        self.status == AgentStatus::Stopped
    }

    pub fn is_live(&self) -> bool {
        self.live_state >= LIVE
    }

    /// Whether any bucket has work.
    pub fn is_full(&self) -> bool {
        self.state.iter().iter().any(|(_, entries)| !entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing() {
        let state: AgentState = serde_json::from_value(serde_json::json!({
            "status": "running",
            "live_state": 1,
            "state": {
                "queued": [{
                    "ownerName": "acme",
                    "project_name": "mnist",
                    "runUuid": "u1",
                    "runKind": "job",
                    "content": "kind: compiled_operation"
                }]
            }
        }))
        .unwrap();
        assert!(state.is_live());
        assert!(!state.is_stopped());
        assert!(state.is_full());
        assert_eq!(state.state.queued[0].run_kind, Some(RunKind::Job));
        assert_eq!(state.state.queued[0].runtime().project_name, "mnist");
    }

    #[test]
    fn test_empty_and_archived() {
        let state: AgentState =
            serde_json::from_value(serde_json::json!({"status": "stopped", "liveState": 0})).unwrap();
        assert!(state.is_stopped());
        assert!(!state.is_live());
        assert!(!state.is_full());

        let unknown: AgentState = serde_json::from_value(serde_json::json!({"status": "paused"})).unwrap();
        assert_eq!(unknown.status, AgentStatus::Unknown);
        assert!(unknown.is_live());
    }

    #[test]
    fn test_failed_condition() {
        let err = Error::Validation("inputs[lr]: missing required input".into());
        let condition = StatusCondition::failed(&err);
        assert_eq!(condition.status_type, RunStatus::Failed);
        assert_eq!(condition.reason, "ValidationError");
        assert!(condition.message.starts_with("VALIDATION_ERROR"));

        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastUpdateTime").is_some());
    }
}
