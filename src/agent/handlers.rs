//! Per-run handlers dispatched from the agent's state buckets.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use super::control_plane::ControlPlane;
use super::executor::Executor;
use super::state::{RunEntry, RunStatus, StatusCondition};
use crate::compiler::Compiler;
use crate::converter::{Converter, Resource};
use crate::error::{Error, Result};
use crate::flow::{read_spec, RunKind, Spec};
use crate::metrics;

/// Which handler a bucket entry goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Submit,
    Apply,
    Stop,
    Check,
    Delete,
    MakeAndCreate,
}

impl Handler {
    pub fn for_bucket(bucket: &str) -> Option<Self> {
        match bucket {
            "schedules" | "queued" => Some(Handler::Submit),
            "apply" => Some(Handler::Apply),
            "stopping" => Some(Handler::Stop),
            "checks" => Some(Handler::Check),
            "deleting" => Some(Handler::Delete),
            "hooks" | "watchdogs" | "tuners" => Some(Handler::MakeAndCreate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Submit => "submit_run",
            Handler::Apply => "apply_run",
            Handler::Stop => "stop_run",
            Handler::Check => "check_run",
            Handler::Delete => "delete_run",
            Handler::MakeAndCreate => "make_and_create_run",
        }
    }
}

/// Compiles, converts and drives runs; shared by every worker.
pub struct Handlers {
    compiler: Compiler,
    converter: Converter,
    control_plane: Arc<dyn ControlPlane>,
    executor: Arc<dyn Executor>,
}

impl Handlers {
    pub fn new(
        compiler: Compiler,
        converter: Converter,
        control_plane: Arc<dyn ControlPlane>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            compiler,
            converter,
            control_plane,
            executor,
        }
    }

    /// Run one handler. Failures never escape: they are reported as a
    /// `failed` condition on the run.
    #[instrument(skip_all, fields(handler = handler.as_str(), run_uuid = %entry.run_uuid))]
    pub async fn handle(&self, handler: Handler, entry: RunEntry) {
        let start = Instant::now();
        metrics::inc_inflight();
        let result = match handler {
            Handler::Submit => self.submit_run(&entry).await,
            Handler::Apply => self.apply_run(&entry).await,
            Handler::Stop => self.stop_run(&entry).await,
            Handler::Check => self.check_run(&entry).await,
            Handler::Delete => self.delete_run(&entry).await,
            Handler::MakeAndCreate => self.make_and_create_run(&entry).await,
        };
        metrics::dec_inflight();
        metrics::record_handler(handler.as_str(), result.is_ok(), start.elapsed());

        if let Err(e) = result {
            error!(
                handler = handler.as_str(),
                run_uuid = %entry.run_uuid,
                code = e.code(),
                "Handler failed: {}",
                e
            );
            self.post(&entry, StatusCondition::failed(&e)).await;
        }
    }

    /// Compile, resolve and convert an entry's spec payload.
    pub fn prepare(&self, entry: &RunEntry) -> Result<(RunKind, Resource)> {
        let content = entry
            .content
            .as_deref()
            .ok_or_else(|| Error::Schema(format!("run `{}` has no spec content", entry.run_uuid)))?;
        let compilation = self.compiler.compile_text(content, &[])?;
        let runtime = entry.runtime();
        let compiled = self.compiler.resolve(&compilation.compiled, &runtime)?;
        let resource = self.converter.convert(&compiled, &runtime)?;
        Ok((compiled.run.kind(), resource))
    }

    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn submit_run(&self, entry: &RunEntry) -> Result<()> {
        let (kind, resource) = self.prepare(entry)?;
        match self.executor.create(&entry.run_uuid, kind, &resource).await {
            Ok(()) => {
                info!(resource = %resource.name(), "Run submitted");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!(resource = %resource.name(), "Resource already exists, applying instead");
                self.apply_resource(entry, kind, &resource).await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn apply_run(&self, entry: &RunEntry) -> Result<()> {
        let (kind, resource) = self.prepare(entry)?;
        self.apply_resource(entry, kind, &resource).await
    }

    async fn apply_resource(&self, entry: &RunEntry, kind: RunKind, resource: &Resource) -> Result<()> {
        self.executor.apply(&entry.run_uuid, kind, resource).await?;
        self.post(
            entry,
            StatusCondition::new(RunStatus::Running, "AgentApplied", "Run resources were applied by the agent"),
        )
        .await;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn stop_run(&self, entry: &RunEntry) -> Result<()> {
        match self.executor.stop(&entry.run_uuid, entry_kind(entry)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.post_stopped(entry).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn check_run(&self, entry: &RunEntry) -> Result<()> {
        match self.executor.get(&entry.run_uuid, entry_kind(entry)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.post_stopped(entry).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn delete_run(&self, entry: &RunEntry) -> Result<()> {
        let kind = entry_kind(entry);
        self.executor.clean(&entry.run_uuid, kind).await?;
        match self.executor.stop(&entry.run_uuid, kind).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Some(follow_up) = &entry.follow_up {
            info!("Submitting follow-up operation");
            self.create_from_template(entry, follow_up).await?;
        }
        Ok(())
    }

    /// Hooks, watchdogs and tuners carry an operation template; it is
    /// compiled without runtime contexts and created as a new run.
    #[instrument(skip(self, entry), fields(run_uuid = %entry.run_uuid))]
    pub async fn make_and_create_run(&self, entry: &RunEntry) -> Result<()> {
        let content = entry
            .content
            .as_deref()
            .ok_or_else(|| Error::Schema(format!("run `{}` has no operation template", entry.run_uuid)))?;
        self.create_from_template(entry, content).await
    }

    async fn create_from_template(&self, entry: &RunEntry, template: &str) -> Result<()> {
        let payload = self.template_payload(template)?;
        let created = self
            .control_plane
            .create_run(&entry.owner_name, &entry.project_name, &payload)
            .await?;
        let created_uuid = created.get("uuid").and_then(|v| v.as_str()).unwrap_or("?");
        info!(created = %created_uuid, "Run created");
        Ok(())
    }

    /// Inline components compile locally; referenced components go to the
    /// control plane as validated operations.
    fn template_payload(&self, template: &str) -> Result<Value> {
        match read_spec(template)? {
            Spec::Operation(op) if op.component.is_none() => Ok(serde_json::to_value(&op)?),
            spec => {
                let compilation = self.compiler.compile_spec(spec, &[])?;
                Ok(serde_json::to_value(&compilation.compiled)?)
            }
        }
    }

    async fn post_stopped(&self, entry: &RunEntry) {
        self.post(
            entry,
            StatusCondition::new(RunStatus::Stopped, "NotFound", "Run resources were not found by the agent"),
        )
        .await;
    }

    /// Status reporting is best effort; a failed post is only logged.
    async fn post(&self, entry: &RunEntry, condition: StatusCondition) {
        if let Err(e) = self
            .control_plane
            .post_status(&entry.owner_name, &entry.project_name, &entry.run_uuid, &condition)
            .await
        {
            warn!(
                run_uuid = %entry.run_uuid,
                status = %condition.status_type,
                "Failed to post status: {}",
                e
            );
        }
    }
}

fn entry_kind(entry: &RunEntry) -> RunKind {
    entry.run_kind.unwrap_or(RunKind::Job)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::state::AgentState;
    use crate::converter::ConverterSettings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub const JOB: &str = r#"
kind: operation
version: 1.1
component:
  name: echo
  plugins: {auth: false, collectArtifacts: false, collectLogs: false, collectResources: false}
  run:
    kind: job
    container:
      image: busybox
      command: [echo, "{{ globals.uuid }}"]
"#;

    #[derive(Default)]
    pub struct StubControlPlane {
        pub state: Mutex<AgentState>,
        pub statuses: Mutex<Vec<(String, StatusCondition)>>,
        pub created: Mutex<Vec<Value>>,
        pub polls: AtomicUsize,
    }

    impl StubControlPlane {
        pub fn status_types(&self) -> Vec<RunStatus> {
            self.statuses.lock().unwrap().iter().map(|(_, c)| c.status_type).collect()
        }
    }

    #[async_trait]
    impl ControlPlane for StubControlPlane {
        async fn get_state(&self) -> Result<AgentState> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.lock().unwrap().clone())
        }

        async fn post_status(&self, _owner: &str, _project: &str, uuid: &str, condition: &StatusCondition) -> Result<()> {
            self.statuses.lock().unwrap().push((uuid.to_string(), condition.clone()));
            Ok(())
        }

        async fn create_run(&self, _owner: &str, _project: &str, content: &Value) -> Result<Value> {
            self.created.lock().unwrap().push(content.clone());
            Ok(json!({"uuid": "new-run"}))
        }
    }

    /// Fails the first `conflicts` creates with 409; `missing` makes
    /// stop and get return 404.
    #[derive(Default)]
    pub struct StubExecutor {
        pub conflicts: usize,
        pub missing: bool,
        pub creates: AtomicUsize,
        pub applies: AtomicUsize,
        pub cleans: AtomicUsize,
    }

    fn not_found() -> Error {
        Error::executor(Some(404), "not found")
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn create(&self, _uuid: &str, _kind: RunKind, _resource: &Resource) -> Result<()> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            if n < self.conflicts {
                return Err(Error::executor(Some(409), "already exists"));
            }
            Ok(())
        }

        async fn apply(&self, _uuid: &str, _kind: RunKind, _resource: &Resource) -> Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _uuid: &str, _kind: RunKind) -> Result<()> {
            if self.missing {
                return Err(not_found());
            }
            Ok(())
        }

        async fn get(&self, _uuid: &str, _kind: RunKind) -> Result<Value> {
            if self.missing {
                return Err(not_found());
            }
            Ok(json!({"status": "running"}))
        }

        async fn clean(&self, _uuid: &str, _kind: RunKind) -> Result<()> {
            self.cleans.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    pub fn handlers(control_plane: Arc<StubControlPlane>, executor: Arc<StubExecutor>) -> Handlers {
        Handlers::new(
            Compiler::default(),
            Converter::new(ConverterSettings::default()),
            control_plane,
            executor,
        )
    }

    fn entry() -> RunEntry {
        RunEntry::new("acme", "mnist", "u1").with_content(JOB)
    }

    #[tokio::test]
    async fn test_conflict_on_create_falls_through_to_apply() {
        let cp = Arc::new(StubControlPlane::default());
        let executor = Arc::new(StubExecutor {
            conflicts: 1,
            ..Default::default()
        });
        let handlers = handlers(cp.clone(), executor.clone());

        handlers.handle(Handler::Submit, entry()).await;

        assert_eq!(executor.creates.load(Ordering::SeqCst), 1);
        assert_eq!(executor.applies.load(Ordering::SeqCst), 1);
        assert_eq!(cp.status_types(), vec![RunStatus::Running]);
    }

    #[tokio::test]
    async fn test_submit_without_conflict_posts_nothing() {
        let cp = Arc::new(StubControlPlane::default());
        let executor = Arc::new(StubExecutor::default());
        handlers(cp.clone(), executor.clone()).handle(Handler::Submit, entry()).await;
        assert_eq!(executor.applies.load(Ordering::SeqCst), 0);
        assert!(cp.status_types().is_empty());
    }

    #[tokio::test]
    async fn test_compile_failure_posts_failed() {
        let cp = Arc::new(StubControlPlane::default());
        let handlers = handlers(cp.clone(), Arc::new(StubExecutor::default()));
        let bad = RunEntry::new("acme", "mnist", "u2").with_content(
            r#"
kind: component
version: 1.1
inputs:
  - {name: lr, type: float}
run:
  kind: job
  container: {image: busybox}
"#,
        );
        handlers.handle(Handler::Apply, bad).await;

        let statuses = cp.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        let (uuid, condition) = &statuses[0];
        assert_eq!(uuid, "u2");
        assert_eq!(condition.status_type, RunStatus::Failed);
        assert_eq!(condition.reason, "ValidationError");
        assert!(condition.message.contains("lr"));
    }

    #[tokio::test]
    async fn test_missing_resources_post_stopped() {
        let cp = Arc::new(StubControlPlane::default());
        let executor = Arc::new(StubExecutor {
            missing: true,
            ..Default::default()
        });
        let handlers = handlers(cp.clone(), executor);
        handlers.handle(Handler::Stop, entry()).await;
        handlers.handle(Handler::Check, entry()).await;
        assert_eq!(cp.status_types(), vec![RunStatus::Stopped, RunStatus::Stopped]);
    }

    #[tokio::test]
    async fn test_delete_submits_follow_up() {
        let cp = Arc::new(StubControlPlane::default());
        let executor = Arc::new(StubExecutor {
            missing: true,
            ..Default::default()
        });
        let handlers = handlers(cp.clone(), executor.clone());
        let mut deleting = entry();
        deleting.follow_up = Some(
            r#"
kind: operation
version: 1.1
hubRef: notifier
params:
  url: {value: "runs/u1"}
"#
            .to_string(),
        );
        handlers.handle(Handler::Delete, deleting).await;

        assert_eq!(executor.cleans.load(Ordering::SeqCst), 1);
        assert!(cp.status_types().is_empty());
        let created = cp.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["hubRef"], "notifier");
    }

    #[tokio::test]
    async fn test_make_and_create_compiles_inline_component() {
        let cp = Arc::new(StubControlPlane::default());
        let handlers = handlers(cp.clone(), Arc::new(StubExecutor::default()));
        handlers.handle(Handler::MakeAndCreate, entry()).await;

        let created = cp.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["kind"], "compiled_operation");
        assert_eq!(created[0]["run"]["container"]["command"][1], "{{ globals.uuid }}");
    }

    #[test]
    fn test_bucket_routing() {
        assert_eq!(Handler::for_bucket("queued"), Some(Handler::Submit));
        assert_eq!(Handler::for_bucket("tuners"), Some(Handler::MakeAndCreate));
        assert_eq!(Handler::for_bucket("unknown"), None);
        assert_eq!(Handler::Check.as_str(), "check_run");
    }
}
