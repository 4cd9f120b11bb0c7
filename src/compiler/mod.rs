//! Compilation pipeline.
//!
//! An operation goes through ordered passes, each returning a new
//! [`CompiledOperation`] or failing with the offending path:
//!
//! 1. read and shape-check
//! 2. apply presets
//! 3. apply params
//! 4. apply operation contexts (eager)
//! 5. resolve the DAG
//! 6. apply run connections
//! 7. apply runtime contexts (strict, per replica)
//! 8. apply hooks contexts
//!
//! Passes 1-6 run in [`Compiler::compile`]; 7 and 8 need the run identity
//! and run in [`Compiler::resolve`] and [`Compiler::hooks`].

mod contexts;
mod presets;

pub use contexts::{
    operation_context, replica_context, runtime_context, RuntimeContext, CONTEXT_ARTIFACTS_ROOT,
    CONTEXT_ROOT,
};
pub use presets::{apply_preset, apply_presets, apply_run_patch, merge, PATCHABLE_KEYS};

use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::connections::Connection;
use crate::dag::{DagPlan, PlanOptions};
use crate::error::{Error, Result};
use crate::flow::{
    is_template, read_preset, read_spec, CompiledOperation, Component, HookTrigger, Operation, Run, Spec,
};
use crate::params::{validate_params, ContextTable, ParamSpec};
use crate::parser::{remaining_tokens, render_str, render_typed, render_value, Mode};

/// Compile-time switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Accept hub-referenced dag operations without local validation.
    pub ignore_hub_validation: bool,
    /// Tolerate missing required inputs.
    pub is_template: bool,
}

/// Output of passes 1-6.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub compiled: CompiledOperation,
    pub params: Vec<ParamSpec>,
    pub dag: Option<DagPlan>,
}

/// The compiler: options plus the connection catalog it resolves against.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompileOptions,
    connections: IndexMap<String, Connection>,
    artifacts_store: Option<String>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn with_connections(mut self, connections: impl IntoIterator<Item = Connection>) -> Self {
        for connection in connections {
            self.connections.insert(connection.name.clone(), connection);
        }
        self
    }

    /// Name the default artifacts store; it is added to the catalog if given.
    pub fn with_artifacts_store(mut self, store: Option<Connection>) -> Self {
        if let Some(store) = store {
            self.artifacts_store = Some(store.name.clone());
            self.connections.insert(store.name.clone(), store);
        }
        self
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    pub fn connections(&self) -> &IndexMap<String, Connection> {
        &self.connections
    }

    pub fn artifacts_store(&self) -> Option<&Connection> {
        self.artifacts_store
            .as_deref()
            .and_then(|name| self.connections.get(name))
    }

    /// Read a spec and its presets from text, then compile.
    pub fn compile_text(&self, text: &str, presets: &[String]) -> Result<Compilation> {
        let spec = read_spec(text)?;
        let presets = presets
            .iter()
            .map(|p| read_preset(p))
            .collect::<Result<Vec<_>>>()?;
        self.compile_spec(spec, &presets)
    }

    /// Compile any top-level spec.
    pub fn compile_spec(&self, spec: Spec, presets: &[Operation]) -> Result<Compilation> {
        match spec {
            Spec::CompiledOperation(compiled) => self.timed(|| self.finish(compiled)),
            other => self.compile(other.into_operation()?, presets),
        }
    }

    /// Passes 1-6.
    #[instrument(skip_all, fields(operation = op.name.as_deref().unwrap_or("")))]
    pub fn compile(&self, op: Operation, presets: &[Operation]) -> Result<Compilation> {
        self.timed(|| {
            op.validate()?;
            let op = apply_presets(&op, presets)?;
            let component = resolve_component(&op)?;
            let mut compiled = CompiledOperation::from_parts(&op, &component);
            if let Some(patch) = &op.run_patch {
                compiled.run = apply_run_patch(&compiled.run, patch, op.patch_strategy.unwrap_or_default())?;
            }
            self.finish(compiled)
        })
    }

    fn timed(&self, f: impl FnOnce() -> Result<Compilation>) -> Result<Compilation> {
        let start = Instant::now();
        let result = f();
        crate::metrics::record_compilation(result.is_ok(), start.elapsed());
        match &result {
            Ok(compilation) => info!(
                name = compilation.compiled.name.as_deref().unwrap_or(""),
                kind = %compilation.compiled.run.kind(),
                params = compilation.params.len(),
                "Compiled operation"
            ),
            Err(e) => debug!(error = %e, "Compilation failed"),
        }
        result
    }

    fn finish(&self, compiled: CompiledOperation) -> Result<Compilation> {
        compiled.validate()?;
        let (compiled, params) = self.apply_params(compiled)?;
        let compiled = self.apply_operation_contexts(compiled, &params)?;
        let dag = self.resolve_dag(&compiled)?;
        let compiled = self.apply_run_connections(compiled, &params)?;
        Ok(Compilation {
            compiled,
            params,
            dag,
        })
    }

    /// Validate params and stamp bound values onto the IO slots.
    pub fn apply_params(&self, mut compiled: CompiledOperation) -> Result<(CompiledOperation, Vec<ParamSpec>)> {
        let specs = self.param_specs(&compiled, self.options.is_template)?;
        stamp_literals(&mut compiled, &specs);
        Ok((compiled, specs))
    }

    fn param_specs(&self, compiled: &CompiledOperation, is_template: bool) -> Result<Vec<ParamSpec>> {
        validate_params(
            &compiled.params,
            &compiled.inputs,
            &compiled.outputs,
            &ContextTable::new(),
            compiled.matrix.as_ref(),
            &compiled.joins,
            is_template,
            false,
        )
    }

    /// Eager substitution of literal-backed templates in the run block.
    pub fn apply_operation_contexts(
        &self,
        mut compiled: CompiledOperation,
        specs: &[ParamSpec],
    ) -> Result<CompiledOperation> {
        if compiled.is_dag() {
            return Ok(compiled);
        }
        let ctx = operation_context(specs, &self.connections);
        compiled.run = render_typed(&compiled.run, &ctx, Mode::Eager, "run")?;
        Ok(compiled)
    }

    /// Plan the DAG of a `dag` run.
    pub fn resolve_dag(&self, compiled: &CompiledOperation) -> Result<Option<DagPlan>> {
        let Some(dag) = compiled.run.as_dag() else {
            return Ok(None);
        };
        let options = PlanOptions {
            ignore_hub_validation: self.options.ignore_hub_validation,
            is_template: self.options.is_template,
        };
        DagPlan::build(dag, &compiled.inputs, &compiled.outputs, options).map(Some)
    }

    /// Default store on artifact inits; templated connection names rendered.
    pub fn apply_run_connections(
        &self,
        mut compiled: CompiledOperation,
        specs: &[ParamSpec],
    ) -> Result<CompiledOperation> {
        let ctx = operation_context(specs, &self.connections);
        let default_store = self.artifacts_store.clone();
        for (i, init) in compiled.run.inits_mut().into_iter().enumerate() {
            let path = format!("run.init[{}].connection", i);
            match &init.connection {
                Some(name) => {
                    let rendered = render_str(name, &ctx, Mode::Eager, &path)?;
                    init.connection = Some(crate::parser::stringify(&rendered));
                }
                None if init.has_artifacts_or_paths() => {
                    init.connection = default_store.clone();
                }
                None => {}
            }
        }
        for names in connection_lists_mut(&mut compiled.run) {
            for (i, name) in names.iter_mut().enumerate() {
                let rendered = render_str(name, &ctx, Mode::Eager, &format!("run.connections[{}]", i))?;
                *name = crate::parser::stringify(&rendered);
            }
        }
        Ok(compiled)
    }

    /// Pass 7: every template must resolve.
    #[instrument(skip_all, fields(run_uuid = %runtime.uuid))]
    pub fn resolve(&self, compiled: &CompiledOperation, runtime: &RuntimeContext) -> Result<CompiledOperation> {
        let mut compiled = compiled.clone();
        let mut specs = self.param_specs(&compiled, false)?;
        let store = self.artifacts_store();

        // Literal values may themselves carry runtime templates; resolve them
        // first so the run block sees final values.
        let base = runtime_context(&compiled, &specs, &self.connections, runtime, store)?;
        for spec in specs.iter_mut().filter(|s| s.is_literal()) {
            if let Some(value) = spec.param.value.as_ref().filter(|v| is_template(v)) {
                let rendered = render_value(value, &base, Mode::Runtime, &format!("params.{}", spec.name))?;
                spec.param.value = Some(rendered);
            }
        }
        stamp_literals(&mut compiled, &specs);
        let ctx = runtime_context(&compiled, &specs, &self.connections, runtime, store)?;

        for spec in specs.iter().filter(|s| !s.is_literal() && !s.is_context) {
            let value = contexts::resolve_ref(spec, runtime)?;
            let ios = if spec.is_output {
                &mut compiled.outputs
            } else {
                &mut compiled.inputs
            };
            if let Some(io) = ios.iter_mut().find(|io| io.name == spec.name) {
                io.value = Some(value);
            }
        }

        match &mut compiled.run {
            Run::Dag(_) => {}
            run if run.kind().is_distributed() => {
                if let Some(distributed) = run.distributed_mut() {
                    for (name, replica) in distributed.replicas.iter_mut() {
                        let replica_ctx = ctx.overlay(&replica_context(runtime, name));
                        *replica = render_typed(&*replica, &replica_ctx, Mode::Runtime, &format!("run.{}", name))?;
                    }
                }
            }
            run => {
                *run = render_typed(&*run, &ctx, Mode::Runtime, "run")?;
            }
        }

        let leftover = leftover_tokens(&compiled)?;
        if let Some((path, token)) = leftover.first() {
            return Err(Error::Compiler(format!(
                "{}: unresolved template `{}` after the runtime pass",
                path, token
            )));
        }
        Ok(compiled)
    }

    /// Pass 8: hook operations fired by `status`.
    pub fn hooks(
        &self,
        compiled: &CompiledOperation,
        runtime: &RuntimeContext,
        status: &str,
        condition: Option<Value>,
    ) -> Result<Vec<Operation>> {
        let specs = self.param_specs(compiled, true)?;
        let ctx = runtime_context(compiled, &specs, &self.connections, runtime, self.artifacts_store())?;
        let mut parent = IndexMap::new();
        parent.insert("uuid".to_string(), Value::String(runtime.uuid.clone()));
        parent.insert(
            "name".to_string(),
            runtime
                .name
                .clone()
                .or_else(|| compiled.name.clone())
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        parent.insert("status".to_string(), Value::String(status.to_string()));
        parent.insert("condition".to_string(), condition.unwrap_or(Value::Null));

        let mut operations = Vec::new();
        for (i, hook) in compiled.hooks.iter().enumerate() {
            let trigger = hook.trigger.unwrap_or(HookTrigger::Done);
            if !trigger.matches(status) {
                continue;
            }
            let mut op = hook.to_operation(&parent);
            for (name, param) in op.params.iter_mut() {
                if let Some(value) = &param.value {
                    param.value = Some(render_value(value, &ctx, Mode::Eager, &format!("hooks[{}].params.{}", i, name))?);
                }
            }
            operations.push(op);
        }
        Ok(operations)
    }

    /// Passes 1-7 in one call.
    pub fn compile_and_resolve(
        &self,
        op: Operation,
        presets: &[Operation],
        runtime: &RuntimeContext,
    ) -> Result<CompiledOperation> {
        let compilation = self.compile(op, presets)?;
        self.resolve(&compilation.compiled, runtime)
    }
}

/// Only inline components can be compiled locally.
fn resolve_component(op: &Operation) -> Result<Component> {
    if let Some(component) = &op.component {
        return Ok((**component).clone());
    }
    if op.is_preset {
        return Err(Error::Compiler("a preset cannot be compiled on its own".into()));
    }
    Err(Error::Compiler(format!(
        "operation `{}` must be resolved to an inline component before compilation",
        op.reference_label()
    )))
}

/// Write literal bindings back onto the IO slots and requested params.
fn stamp_literals(compiled: &mut CompiledOperation, specs: &[ParamSpec]) {
    for spec in specs.iter().filter(|s| s.is_literal()) {
        if !spec.is_context {
            let ios = if spec.is_output {
                &mut compiled.outputs
            } else {
                &mut compiled.inputs
            };
            if let Some(io) = ios.iter_mut().find(|io| io.name == spec.name) {
                io.value = spec.value().filter(|v| !v.is_null()).cloned();
            }
        }
        if spec.is_requested {
            if let Some(param) = compiled.params.get_mut(&spec.name) {
                param.value = spec.param.value.clone();
            }
        }
    }
}

/// Template tokens left in values after the runtime pass. Ref params are
/// skipped: their value is a reference path, not a value.
fn leftover_tokens(compiled: &CompiledOperation) -> Result<Vec<(String, String)>> {
    let mut leftover = Vec::new();
    for (section, ios) in [("inputs", &compiled.inputs), ("outputs", &compiled.outputs)] {
        for io in ios.iter() {
            if let Some(value) = &io.value {
                leftover.extend(remaining_tokens(value, &format!("{}[{}]", section, io.name)));
            }
        }
    }
    for (name, param) in compiled.params.iter().filter(|(_, p)| p.is_literal()) {
        if let Some(value) = &param.value {
            leftover.extend(remaining_tokens(value, &format!("params.{}", name)));
        }
    }
    if !compiled.is_dag() {
        leftover.extend(remaining_tokens(&serde_json::to_value(&compiled.run)?, "run"));
    }
    Ok(leftover)
}

fn connection_lists_mut(run: &mut Run) -> Vec<&mut Vec<String>> {
    match run {
        Run::Job(job) => vec![&mut job.connections],
        Run::Service(service) => vec![&mut service.connections],
        Run::Dag(dag) => vec![&mut dag.connections],
        other => other
            .distributed_mut()
            .map(|d| d.replicas.values_mut().map(|r| &mut r.connections).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionKind;
    use serde_json::json;

    fn compiler() -> Compiler {
        Compiler::new(CompileOptions::default())
            .with_artifacts_store(Some(Connection::bucket("store1", ConnectionKind::S3, "s3://bucket")))
    }

    fn compile(yaml: &str) -> Result<Compilation> {
        compiler().compile_text(yaml, &[])
    }

    #[test]
    fn test_required_input_without_param_fails() {
        let err = compile(
            r#"
version: 1.1
kind: component
name: trainer
inputs:
  - {name: lr, type: float}
run:
  kind: job
  container: {image: busybox}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("lr"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_param_overrides_default() {
        let compilation = compile(
            r#"
version: 1.1
kind: operation
params:
  lr: {value: 0.1}
component:
  name: trainer
  inputs:
    - {name: lr, type: float, isOptional: true, value: 0.01}
  run:
    kind: job
    container:
      image: python
      command: [python, train.py]
      args: ["{{ params.lr.as_arg }}", "--plain={{ lr }}"]
"#,
        )
        .unwrap();
        assert_eq!(compilation.compiled.io_value("lr"), Some(&json!(0.1)));
        match &compilation.compiled.run {
            Run::Job(job) => assert_eq!(job.container.args, vec!["--lr=0.1", "--plain=0.1"]),
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_runtime_templates_wait_for_runtime_pass() {
        let yaml = r#"
kind: component
name: echo
run:
  kind: job
  container:
    image: busybox
    command: ["echo", "{{ globals.uuid }}"]
"#;
        let compiler = compiler();
        let compilation = compiler.compile_text(yaml, &[]).unwrap();
        match &compilation.compiled.run {
            Run::Job(job) => assert_eq!(job.container.command[1], "{{ globals.uuid }}"),
            _ => panic!("Expected job"),
        }

        let runtime = RuntimeContext::new("8f3a", "acme", "mnist");
        let resolved = compiler.resolve(&compilation.compiled, &runtime).unwrap();
        match &resolved.run {
            Run::Job(job) => assert_eq!(job.container.command[1], "8f3a"),
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_unresolvable_template_fails_at_runtime() {
        let compilation = compile(
            r#"
kind: component
run:
  kind: job
  container:
    image: busybox
    command: ["echo", "{{ nothing.here }}"]
"#,
        )
        .unwrap();
        let err = compiler()
            .resolve(&compilation.compiled, &RuntimeContext::new("u", "o", "p"))
            .unwrap_err();
        assert!(matches!(err, Error::Compiler(_)));
        assert!(err.to_string().contains("run.container.command[1]"));
    }

    #[test]
    fn test_runtime_pass_resolves_templated_values() {
        let compilation = compile(
            r#"
kind: operation
params:
  out: {value: "{{ globals.run_outputs_path }}"}
component:
  inputs:
    - {name: out, type: path}
  run:
    kind: job
    container:
      image: busybox
      args: ["{{ params.out.as_arg }}"]
"#,
        )
        .unwrap();
        let resolved = compiler()
            .resolve(&compilation.compiled, &RuntimeContext::new("u1", "o", "p"))
            .unwrap();
        let expected = json!("/plx-context/artifacts/u1/outputs");
        assert_eq!(resolved.io_value("out"), Some(&expected));
        assert_eq!(resolved.params["out"].value, Some(expected));
        match &resolved.run {
            Run::Job(job) => assert_eq!(job.container.args, vec!["--out=/plx-context/artifacts/u1/outputs"]),
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_unresolvable_value_fails_at_runtime() {
        let compilation = compile(
            r#"
kind: operation
params:
  out: {value: "{{ nothing.here }}"}
component:
  inputs:
    - {name: out, type: str}
  run:
    kind: job
    container: {image: busybox}
"#,
        )
        .unwrap();
        let err = compiler()
            .resolve(&compilation.compiled, &RuntimeContext::new("u1", "o", "p"))
            .unwrap_err();
        assert!(matches!(err, Error::Compiler(_)));
        assert!(err.to_string().contains("params.out"));
    }

    #[test]
    fn test_join_values_resolve_at_runtime() {
        let compilation = compile(
            r#"
kind: operation
joins:
  best:
    query: "metrics.loss:<0.1"
    params:
      losses: {value: outputs.loss}
component:
  inputs:
    - {name: losses, type: float, isList: true}
  run:
    kind: job
    container:
      image: busybox
      args: ["--losses={{ joins.best.outputs.loss }}"]
"#,
        )
        .unwrap();
        let mut runtime = RuntimeContext::new("u1", "o", "p");
        runtime
            .refs
            .insert("joins.best.outputs.loss".to_string(), json!([0.05, 0.08]));
        let resolved = compiler().resolve(&compilation.compiled, &runtime).unwrap();
        assert_eq!(resolved.io_value("losses"), Some(&json!([0.05, 0.08])));
        match &resolved.run {
            Run::Job(job) => assert_eq!(job.container.args, vec!["--losses=[0.05,0.08]"]),
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_artifacts_init_gets_default_store() {
        let compilation = compile(
            r#"
kind: component
run:
  kind: job
  init:
    - artifacts: {files: ["/foo"]}
    - connection: "{{ repo }}"
  container: {image: busybox}
inputs:
  - {name: repo, type: str, isOptional: true, value: my-repo}
"#,
        )
        .unwrap();
        match &compilation.compiled.run {
            Run::Job(job) => {
                assert_eq!(job.init[0].connection.as_deref(), Some("store1"));
                assert_eq!(job.init[1].connection.as_deref(), Some("my-repo"));
            }
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_presets_and_run_patch() {
        let preset = "queue: gpu\nrunPatch:\n  container:\n    resources:\n      limits: {nvidia.com/gpu: 1}".to_string();
        let compilation = compiler()
            .compile_text(
                r#"
kind: operation
queue: cpu
component:
  run:
    kind: job
    container: {image: busybox}
"#,
                &[preset],
            )
            .unwrap();
        assert_eq!(compilation.compiled.queue.as_deref(), Some("gpu"));
        match &compilation.compiled.run {
            Run::Job(job) => {
                let resources = job.container.resources.as_ref().unwrap();
                assert_eq!(resources.limits["nvidia.com/gpu"], json!(1));
            }
            _ => panic!("Expected job"),
        }
    }

    #[test]
    fn test_dag_is_planned() {
        let compilation = compile(
            r#"
kind: component
name: pipeline
run:
  kind: dag
  operations:
    - name: B
      dagRef: consumer
      params:
        x: {ref: ops.A, value: outputs.metric}
    - name: A
      dagRef: producer
  components:
    - name: producer
      outputs: [{name: metric, type: float}]
      run: {kind: job, container: {image: busybox}}
    - name: consumer
      inputs: [{name: x, type: float}]
      run: {kind: job, container: {image: busybox}}
"#,
        )
        .unwrap();
        let dag = compilation.dag.unwrap();
        assert_eq!(dag.sorted(), vec!["A", "B"]);
    }

    #[test]
    fn test_replicas_render_with_overlay() {
        let compilation = compile(
            r#"
kind: component
run:
  kind: pytorchjob
  master:
    replicas: 1
    container:
      image: pytorch
      args: ["--role={{ globals.replica }}", "--run={{ globals.uuid }}"]
  worker:
    replicas: 2
    container:
      image: pytorch
      args: ["--role={{ globals.replica }}"]
"#,
        )
        .unwrap();
        let resolved = compiler()
            .resolve(&compilation.compiled, &RuntimeContext::new("abc", "o", "p"))
            .unwrap();
        let distributed = resolved.run.distributed().unwrap();
        assert_eq!(distributed.replicas["master"].container.args, vec!["--role=master", "--run=abc"]);
        assert_eq!(distributed.replicas["worker"].container.args, vec!["--role=worker"]);
    }

    #[test]
    fn test_hooks_materialize() {
        let compilation = compile(
            r#"
kind: component
name: trainer
hooks:
  - trigger: succeeded
    hubRef: notifier
    params:
      url: {value: "runs/{{ globals.uuid }}", contextOnly: true}
  - trigger: failed
    hubRef: pager
run:
  kind: job
  container: {image: busybox}
"#,
        )
        .unwrap();
        let runtime = RuntimeContext::new("u1", "o", "p");
        let ops = compiler().hooks(&compilation.compiled, &runtime, "succeeded", None).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].hub_ref.as_deref(), Some("notifier"));
        assert_eq!(ops[0].params["uuid"].value, Some(json!("u1")));
        assert_eq!(ops[0].params["url"].value, Some(json!("runs/u1")));
    }

    #[test]
    fn test_hub_operation_requires_component() {
        let err = compile("kind: operation\nhubRef: trainer").unwrap_err();
        assert!(err.to_string().contains("hub:trainer"));
        assert_eq!(err.exit_code(), 3);
    }
}
