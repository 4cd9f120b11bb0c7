//! Template contexts for the operation and runtime passes.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connections::Connection;
use crate::error::{Error, Result};
use crate::flow::CompiledOperation;
use crate::params::{ParamKind, ParamSpec};
use crate::parser::TemplateContext;

/// Mount root shared by init containers, sidecar and main container.
pub const CONTEXT_ROOT: &str = "/plx-context";
/// Artifacts root inside the context mount.
pub const CONTEXT_ARTIFACTS_ROOT: &str = "/plx-context/artifacts";

/// Run identity known only once the control plane created the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "owner_name")]
    pub owner_name: String,
    #[serde(default, alias = "project_name")]
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, alias = "cloning_kind", skip_serializing_if = "Option::is_none")]
    pub cloning_kind: Option<String>,
    #[serde(default, alias = "original_uuid", skip_serializing_if = "Option::is_none")]
    pub original_uuid: Option<String>,
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Resolved reference values keyed by qualified name (`ops.A.outputs.loss`).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub refs: IndexMap<String, Value>,
    /// Extra context values per replica group, keyed by dotted name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub replicas: IndexMap<String, IndexMap<String, Value>>,
}

impl RuntimeContext {
    pub fn new(uuid: impl Into<String>, owner_name: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            owner_name: owner_name.into(),
            project_name: project_name.into(),
            ..Default::default()
        }
    }

    pub fn run_artifacts_path(&self) -> String {
        format!("{}/{}", CONTEXT_ARTIFACTS_ROOT, self.uuid)
    }

    pub fn run_outputs_path(&self) -> String {
        format!("{}/outputs", self.run_artifacts_path())
    }

    /// The `globals` section.
    pub fn globals(&self, compiled: &CompiledOperation, store: Option<&Connection>) -> Value {
        let name = self.name.clone().or_else(|| compiled.name.clone());
        let store_path = store.and_then(Connection::store_path);
        json!({
            "owner_name": self.owner_name,
            "project_name": self.project_name,
            "project_unique_name": format!("{}.{}", self.owner_name, self.project_name),
            "uuid": self.uuid,
            "name": name,
            "iteration": self.iteration,
            "namespace": self.namespace.clone().or_else(|| compiled.namespace.clone()),
            "context_path": CONTEXT_ROOT,
            "artifacts_path": CONTEXT_ARTIFACTS_ROOT,
            "run_artifacts_path": self.run_artifacts_path(),
            "run_outputs_path": self.run_outputs_path(),
            "store_path": store_path,
            "created_at": self.created_at.map(|t| t.to_rfc3339()),
            "compiled_at": Utc::now().to_rfc3339(),
            "cloning_kind": self.cloning_kind,
            "original_uuid": self.original_uuid,
        })
    }
}

fn io_section(spec: &ParamSpec) -> &'static str {
    if spec.is_output {
        "outputs"
    } else {
        "inputs"
    }
}

fn bind(ctx: &mut TemplateContext, spec: &ParamSpec, value: Value) {
    if !spec.is_context {
        ctx.insert(&format!("{}.{}", io_section(spec), spec.name), value.clone());
    }
    ctx.add_param(&spec.name, value, spec.format());
}

/// Context of the eager pass: literal params and known connections.
pub fn operation_context(specs: &[ParamSpec], connections: &IndexMap<String, Connection>) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    for spec in specs.iter().filter(|s| s.is_literal()) {
        if let Some(value) = spec.value() {
            bind(&mut ctx, spec, value.clone());
        }
    }
    for (name, connection) in connections {
        ctx.insert(&format!("connections.{}", name), connection.template_context());
    }
    ctx
}

/// Context of the runtime pass: globals and resolved references on top.
pub fn runtime_context(
    compiled: &CompiledOperation,
    specs: &[ParamSpec],
    connections: &IndexMap<String, Connection>,
    runtime: &RuntimeContext,
    store: Option<&Connection>,
) -> Result<TemplateContext> {
    let mut ctx = operation_context(specs, connections);
    for (key, value) in &runtime.refs {
        ctx.insert(key, value.clone());
    }
    for spec in specs.iter().filter(|s| !s.is_literal()) {
        let value = resolve_ref(spec, runtime)?;
        bind(&mut ctx, spec, value);
    }
    ctx.insert("globals", runtime.globals(compiled, store));
    Ok(ctx)
}

/// Overlay applied for one replica group.
pub fn replica_context(runtime: &RuntimeContext, replica: &str) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.insert("globals.replica", Value::String(replica.to_string()));
    if let Some(values) = runtime.replicas.get(replica) {
        for (key, value) in values {
            ctx.insert(key, value.clone());
        }
    }
    ctx
}

/// Resolve a reference param from the control plane's values.
pub fn resolve_ref(spec: &ParamSpec, runtime: &RuntimeContext) -> Result<Value> {
    let context_ref = spec
        .context_ref()
        .transpose()?
        .ok_or_else(|| Error::Compiler(format!("param `{}` is not a reference", spec.name)))?;
    let mut key = context_ref.key();
    if spec.kind == ParamKind::Pipeline {
        key = key.replacen("pipeline", "dag", 1);
    }
    runtime.refs.get(&key).cloned().ok_or_else(|| {
        Error::Compiler(format!(
            "params[{}]: reference `{}` was not resolved by the control plane",
            spec.name, key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Param;
    use crate::parser::{render_str, Mode};

    fn spec(name: &str, param: Param, kind: ParamKind) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            param,
            iotype: None,
            is_flag: false,
            is_list: false,
            is_requested: true,
            is_context: false,
            arg_format: None,
            kind,
            is_output: false,
            connection: None,
            to_init: false,
            to_env: None,
        }
    }

    #[test]
    fn test_operation_context_binds_literals_only() {
        let specs = vec![
            spec("lr", Param::literal(json!(0.1)), ParamKind::Literal),
            spec("x", Param::from_ref("ops.A", "outputs.metric"), ParamKind::Ops),
        ];
        let ctx = operation_context(&specs, &IndexMap::new());
        assert_eq!(render_str("{{ inputs.lr }}", &ctx, Mode::Eager, "t").unwrap(), json!(0.1));
        assert_eq!(render_str("{{ x }}", &ctx, Mode::Eager, "t").unwrap(), json!("{{ x }}"));
    }

    #[test]
    fn test_runtime_context_resolves_refs() {
        let compiled: CompiledOperation = serde_yaml::from_str(
            "name: trainer\nrun: {kind: job, container: {image: busybox}}",
        )
        .unwrap();
        let specs = vec![spec("x", Param::from_ref("ops.A", "outputs.metric"), ParamKind::Ops)];
        let mut runtime = RuntimeContext::new("f00", "acme", "mnist");

        let err = runtime_context(&compiled, &specs, &IndexMap::new(), &runtime, None).unwrap_err();
        assert!(err.to_string().contains("ops.A.outputs.metric"));

        runtime.refs.insert("ops.A.outputs.metric".into(), json!(0.9));
        let ctx = runtime_context(&compiled, &specs, &IndexMap::new(), &runtime, None).unwrap();
        assert_eq!(render_str("{{ x }}", &ctx, Mode::Runtime, "t").unwrap(), json!(0.9));
        assert_eq!(render_str("{{ globals.uuid }}", &ctx, Mode::Runtime, "t").unwrap(), json!("f00"));
        assert_eq!(
            render_str("{{ globals.run_outputs_path }}", &ctx, Mode::Runtime, "t").unwrap(),
            json!("/plx-context/artifacts/f00/outputs")
        );
        assert_eq!(render_str("{{ globals.name }}", &ctx, Mode::Runtime, "t").unwrap(), json!("trainer"));

        let replica = ctx.overlay(&replica_context(&runtime, "worker"));
        assert_eq!(render_str("{{ globals.replica }}", &replica, Mode::Runtime, "t").unwrap(), json!("worker"));
        assert_eq!(render_str("{{ globals.uuid }}", &replica, Mode::Runtime, "t").unwrap(), json!("f00"));
    }
}
