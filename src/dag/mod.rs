//! DAG planner.
//!
//! Turns a `dag` run block into a validated execution graph: edges come from
//! explicit dependencies, param refs and event triggers. Nodes live in an
//! insertion-ordered map and edges are index sets, so sorting and
//! back-filling never chase pointers.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::{Component, ComponentSource, ContextRef, Dag, Io, Join, Operation};
use crate::params::{validate_params, ContextIo, ContextTable, ParamSpec};
use crate::types::IoType;

/// Fields every run exposes under `globals`.
pub const GLOBALS_FIELDS: &[(&str, IoType)] = &[
    ("owner_name", IoType::Str),
    ("project_name", IoType::Str),
    ("project_unique_name", IoType::Str),
    ("uuid", IoType::Str),
    ("name", IoType::Str),
    ("iteration", IoType::Int),
    ("namespace", IoType::Str),
    ("context_path", IoType::Path),
    ("artifacts_path", IoType::Path),
    ("run_artifacts_path", IoType::Path),
    ("run_outputs_path", IoType::Path),
    ("store_path", IoType::Path),
    ("created_at", IoType::Datetime),
    ("compiled_at", IoType::Datetime),
    ("cloning_kind", IoType::Str),
    ("original_uuid", IoType::Str),
];

/// Planner switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Accept hub-referenced operations without local validation.
    pub ignore_hub_validation: bool,
    /// The dag itself is a template; missing inputs are tolerated.
    pub is_template: bool,
}

/// A node of the execution graph.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub op: Operation,
    pub upstream: BTreeSet<usize>,
    pub downstream: BTreeSet<usize>,
}

/// The planned DAG: graph, order, context table and resolved components.
#[derive(Debug, Clone)]
pub struct DagPlan {
    nodes: IndexMap<String, DagNode>,
    levels: Vec<Vec<usize>>,
    context: ContextTable,
    components_by_name: IndexMap<String, Component>,
    op_components: IndexMap<String, Component>,
    param_specs: IndexMap<String, Vec<ParamSpec>>,
}

impl DagPlan {
    /// Plan a dag whose own component declares `inputs` and `outputs`.
    pub fn build(dag: &Dag, inputs: &[Io], outputs: &[Io], options: PlanOptions) -> Result<Self> {
        let nodes = build_graph(&dag.operations)?;
        let levels = topological_levels(&nodes)?;

        let mut components_by_name = IndexMap::new();
        for component in &dag.components {
            let name = component.name.clone().ok_or_else(|| {
                Error::Compiler("dag components must be named to be referenced".into())
            })?;
            if components_by_name.insert(name.clone(), component.clone()).is_some() {
                return Err(Error::Compiler(format!("duplicate dag component `{}`", name)));
            }
        }

        let mut plan = Self {
            nodes,
            levels,
            context: ContextTable::new(),
            components_by_name,
            op_components: IndexMap::new(),
            param_specs: IndexMap::new(),
        };
        plan.resolve_components(options)?;
        plan.build_context(inputs, outputs)?;
        plan.validate_ops(options)?;
        Ok(plan)
    }

    fn resolve_components(&mut self, options: PlanOptions) -> Result<()> {
        for (name, node) in &self.nodes {
            let op = &node.op;
            match op.component_source().map_err(|e| e.at(&format!("operations[{}]", name)))? {
                Some(ComponentSource::Inline) => {
                    if let Some(component) = &op.component {
                        self.op_components.insert(name.clone(), (**component).clone());
                    }
                }
                Some(ComponentSource::Dag) => {
                    let dag_ref = op.dag_ref.as_deref().unwrap_or_default();
                    let component = self.components_by_name.get(dag_ref).ok_or_else(|| {
                        Error::Compiler(format!(
                            "operations[{}]: dagRef `{}` does not match any dag component",
                            name, dag_ref
                        ))
                    })?;
                    self.op_components.insert(name.clone(), component.clone());
                }
                Some(ComponentSource::Hub) if !options.ignore_hub_validation => {
                    return Err(Error::Compiler(format!(
                        "operations[{}]: hubRef `{}` cannot be resolved locally",
                        name,
                        op.hub_ref.as_deref().unwrap_or_default()
                    )));
                }
                Some(_) | None => {
                    debug!(operation = %name, reference = %op.reference_label(), "Deferring validation of remote component");
                }
            }
        }
        Ok(())
    }

    fn build_context(&mut self, inputs: &[Io], outputs: &[Io]) -> Result<()> {
        for (field, iotype) in GLOBALS_FIELDS {
            self.context.insert(format!("dag.globals.{}", field), ContextIo::typed(*iotype));
        }
        for io in inputs {
            self.context.insert(format!("dag.inputs.{}", io.name), ContextIo::from(io));
        }
        for io in outputs {
            self.context.insert(format!("dag.outputs.{}", io.name), ContextIo::from(io));
        }
        self.context.insert("dag.artifacts", ContextIo::typed(IoType::Artifacts));

        for name in self.nodes.keys() {
            let prefix = format!("ops.{}", name);
            match self.op_components.get(name) {
                Some(component) => {
                    for io in &component.inputs {
                        self.context
                            .insert(format!("{}.inputs.{}", prefix, io.name), ContextIo::from(io));
                    }
                    for io in &component.outputs {
                        self.context
                            .insert(format!("{}.outputs.{}", prefix, io.name), ContextIo::from(io));
                    }
                }
                None => self.context.mark_opaque(prefix.clone()),
            }
            for (field, iotype) in GLOBALS_FIELDS {
                self.context
                    .insert(format!("{}.globals.{}", prefix, field), ContextIo::typed(*iotype));
            }
            self.context.insert(format!("{}.io", prefix), ContextIo::typed(IoType::Dict));
            self.context
                .insert(format!("{}.artifacts", prefix), ContextIo::typed(IoType::Artifacts));
            self.context.insert(format!("{}.status", prefix), ContextIo::typed(IoType::Str));
        }

        let mut join_owners: IndexMap<&str, &str> = IndexMap::new();
        for (op_name, node) in &self.nodes {
            for (join_name, join) in &node.op.joins {
                if let Some(owner) = join_owners.insert(join_name.as_str(), op_name.as_str()) {
                    return Err(Error::Compiler(format!(
                        "join `{}` is declared by both `{}` and `{}`",
                        join_name, owner, op_name
                    )));
                }
                let inputs = self
                    .op_components
                    .get(op_name)
                    .map(|c| c.inputs.as_slice())
                    .unwrap_or_default();
                register_join(&mut self.context, join_name, join, inputs)?;
            }
        }
        Ok(())
    }

    fn validate_ops(&mut self, options: PlanOptions) -> Result<()> {
        for idx in self.sorted_indices() {
            let Some((name, node)) = self.nodes.get_index(idx) else {
                continue;
            };
            let Some(component) = self.op_components.get(name) else {
                continue;
            };
            let op = &node.op;
            let specs = validate_params(
                &op.params,
                &component.inputs,
                &component.outputs,
                &self.context,
                op.matrix.as_ref(),
                &op.joins,
                options.is_template,
                true,
            )
            .map_err(|e| e.at(&format!("{}.{}", name, op.reference_label())))?;
            self.param_specs.insert(name.clone(), specs);
        }
        Ok(())
    }

    fn sorted_indices(&self) -> Vec<usize> {
        self.levels.iter().flatten().copied().collect()
    }

    /// Operation names in topological order.
    pub fn sorted(&self) -> Vec<String> {
        self.sorted_indices()
            .into_iter()
            .filter_map(|idx| self.nodes.get_index(idx).map(|(name, _)| name.clone()))
            .collect()
    }

    /// Names grouped by depth; siblings keep insertion order.
    pub fn levels(&self) -> Vec<Vec<String>> {
        self.levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|idx| self.nodes.get_index(*idx).map(|(name, _)| name.clone()))
                    .collect()
            })
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn upstream(&self, name: &str) -> Vec<String> {
        self.edge_names(name, |node| &node.upstream)
    }

    pub fn downstream(&self, name: &str) -> Vec<String> {
        self.edge_names(name, |node| &node.downstream)
    }

    fn edge_names(&self, name: &str, edges: impl Fn(&DagNode) -> &BTreeSet<usize>) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|node| {
                edges(node)
                    .iter()
                    .filter_map(|idx| self.nodes.get_index(*idx).map(|(n, _)| n.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Operations without upstream dependencies.
    pub fn roots(&self) -> Vec<String> {
        self.levels().into_iter().next().unwrap_or_default()
    }

    pub fn context(&self) -> &ContextTable {
        &self.context
    }

    pub fn component(&self, op_name: &str) -> Option<&Component> {
        self.op_components.get(op_name)
    }

    pub fn component_by_name(&self, name: &str) -> Option<&Component> {
        self.components_by_name.get(name)
    }

    pub fn param_specs(&self, op_name: &str) -> Option<&[ParamSpec]> {
        self.param_specs.get(op_name).map(Vec::as_slice)
    }
}

/// Build nodes and both edge directions, rejecting orphans.
/// `joins.<name>` entries. Every joined field is a list, one item per run
/// matched by the query; fields not collected by the join stay unchecked.
fn register_join(context: &mut ContextTable, name: &str, join: &Join, inputs: &[Io]) -> Result<()> {
    let prefix = format!("joins.{}", name);
    let list = |iotype: Option<IoType>| ContextIo {
        iotype,
        is_list: true,
        ..Default::default()
    };
    context.mark_opaque(prefix.clone());
    for (field, iotype) in GLOBALS_FIELDS {
        context.insert(format!("{}.globals.{}", prefix, field), list(Some(*iotype)));
    }
    context.insert(format!("{}.io", prefix), list(Some(IoType::Dict)));
    context.insert(format!("{}.artifacts", prefix), list(Some(IoType::Artifacts)));
    context.insert(format!("{}.status", prefix), list(Some(IoType::Str)));
    for (param_name, param) in &join.params {
        let context_ref = ContextRef::from_param(&prefix, param.value_str().unwrap_or_default())
            .map_err(|e| e.at(&format!("joins[{}].params[{}]", name, param_name)))?;
        let iotype = inputs.iter().find(|io| &io.name == param_name).and_then(|io| io.iotype);
        context.insert(context_ref.key(), list(iotype));
    }
    Ok(())
}

fn build_graph(operations: &[Operation]) -> Result<IndexMap<String, DagNode>> {
    let mut nodes: IndexMap<String, DagNode> = IndexMap::new();
    for (i, op) in operations.iter().enumerate() {
        let name = op
            .name
            .clone()
            .ok_or_else(|| Error::Compiler(format!("dag operation #{} requires a name", i)))?;
        if nodes.contains_key(&name) {
            return Err(Error::Compiler(format!("duplicate dag operation `{}`", name)));
        }
        nodes.insert(
            name,
            DagNode {
                op: op.clone(),
                upstream: BTreeSet::new(),
                downstream: BTreeSet::new(),
            },
        );
    }

    let mut edges = Vec::new();
    for (idx, (name, node)) in nodes.iter().enumerate() {
        let upstream_ops = node
            .op
            .upstream()
            .map_err(|e| e.at(&format!("operations[{}]", name)))?;
        for upstream in upstream_ops {
            let up_idx = nodes.get_index_of(&upstream).ok_or_else(|| {
                Error::Compiler(format!(
                    "operation `{}` depends on `{}` which is not defined in the dag (orphan)",
                    name, upstream
                ))
            })?;
            if up_idx == idx {
                return Err(Error::Compiler(format!(
                    "operation `{}` depends on itself (cycle)",
                    name
                )));
            }
            edges.push((up_idx, idx));
        }
    }
    for (up, down) in edges {
        if let Some((_, node)) = nodes.get_index_mut(down) {
            node.upstream.insert(up);
        }
        if let Some((_, node)) = nodes.get_index_mut(up) {
            node.downstream.insert(down);
        }
    }
    Ok(nodes)
}

/// Kahn's algorithm, one level at a time.
fn topological_levels(nodes: &IndexMap<String, DagNode>) -> Result<Vec<Vec<usize>>> {
    let mut remaining: Vec<usize> = nodes.values().map(|n| n.upstream.len()).collect();
    let mut done = vec![false; nodes.len()];
    let mut levels = Vec::new();
    let mut emitted = 0;

    loop {
        let level: Vec<usize> = (0..nodes.len())
            .filter(|idx| !done[*idx] && remaining[*idx] == 0)
            .collect();
        if level.is_empty() {
            break;
        }
        for idx in &level {
            done[*idx] = true;
            emitted += 1;
            if let Some((_, node)) = nodes.get_index(*idx) {
                for down in &node.downstream {
                    remaining[*down] = remaining[*down].saturating_sub(1);
                }
            }
        }
        levels.push(level);
    }

    if emitted != nodes.len() {
        let stuck: Vec<&str> = nodes
            .keys()
            .enumerate()
            .filter(|(idx, _)| !done[*idx])
            .map(|(_, name)| name.as_str())
            .collect();
        return Err(Error::Compiler(format!(
            "dag contains a cycle involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(levels)
}
