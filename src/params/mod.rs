//! Parameter resolver.
//!
//! Validates an operation's params against its component's IO contract and
//! classifies every binding as a literal or a reference. The result is an
//! ordered list of [`ParamSpec`]s consumed by the compiler and the parser.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::flow::{is_template, ContextRef, Io, Join, Matrix, Param, RefEntity};
use crate::parser::ArgFormat;
use crate::types::IoType;

/// How a param is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Literal,
    Ops,
    Runs,
    Dag,
    Pipeline,
    Joins,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Literal => "literal",
            ParamKind::Ops => "ops",
            ParamKind::Runs => "runs",
            ParamKind::Dag => "dag",
            ParamKind::Pipeline => "pipeline",
            ParamKind::Joins => "joins",
        }
    }

    fn from_entity(entity: RefEntity) -> Self {
        match entity {
            RefEntity::Ops => ParamKind::Ops,
            RefEntity::Runs => ParamKind::Runs,
            RefEntity::Dag => ParamKind::Dag,
            RefEntity::Pipeline => ParamKind::Pipeline,
            RefEntity::Joins => ParamKind::Joins,
        }
    }
}

/// A validated param binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param: Param,
    pub iotype: Option<IoType>,
    pub is_flag: bool,
    pub is_list: bool,
    /// Explicitly bound by the operation rather than a stamped default.
    pub is_requested: bool,
    /// Context-only binding without an IO slot.
    pub is_context: bool,
    pub arg_format: Option<String>,
    pub kind: ParamKind,
    /// Bound to an output rather than an input.
    pub is_output: bool,
    pub connection: Option<String>,
    pub to_init: bool,
    pub to_env: Option<String>,
}

impl ParamSpec {
    fn from_io(name: &str, param: Param, io: Option<&Io>, kind: ParamKind, is_output: bool) -> Self {
        let connection = param
            .connection
            .clone()
            .or_else(|| io.and_then(|io| io.connection.clone()));
        let to_init = param.to_init || io.map(|io| io.to_init).unwrap_or(false);
        let to_env = param.to_env.clone().or_else(|| io.and_then(|io| io.to_env.clone()));
        Self {
            name: name.to_string(),
            iotype: io.and_then(|io| io.iotype),
            is_flag: io.map(|io| io.is_flag).unwrap_or(false),
            is_list: io.map(|io| io.is_list).unwrap_or(false),
            is_requested: true,
            is_context: io.is_none(),
            arg_format: io.and_then(|io| io.arg_format.clone()),
            kind,
            is_output,
            connection,
            to_init,
            to_env,
            param,
        }
    }

    pub fn is_literal(&self) -> bool {
        self.kind == ParamKind::Literal
    }

    /// Literal value, if bound to one.
    pub fn value(&self) -> Option<&Value> {
        if self.is_literal() {
            self.param.value.as_ref()
        } else {
            None
        }
    }

    pub fn format(&self) -> ArgFormat {
        ArgFormat {
            arg_format: self.arg_format.clone(),
            is_flag: self.is_flag,
        }
    }

    pub fn context_ref(&self) -> Option<Result<ContextRef>> {
        self.param.context_ref()
    }
}

/// What the context table knows about a referenceable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextIo {
    pub iotype: Option<IoType>,
    pub is_list: bool,
    pub is_optional: bool,
    pub value: Option<Value>,
}

impl ContextIo {
    pub fn typed(iotype: IoType) -> Self {
        Self {
            iotype: Some(iotype),
            ..Default::default()
        }
    }
}

impl From<&Io> for ContextIo {
    fn from(io: &Io) -> Self {
        Self {
            iotype: io.iotype,
            is_list: io.is_list,
            is_optional: io.is_optional,
            value: io.value.clone(),
        }
    }
}

/// Qualified name to IO descriptor, e.g. `ops.A.outputs.loss`.
///
/// Entities marked opaque have fields that cannot be known locally
/// (hub or url components); references into them are accepted unchecked.
#[derive(Debug, Clone, Default)]
pub struct ContextTable {
    entries: IndexMap<String, ContextIo>,
    opaque: HashSet<String>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, io: ContextIo) {
        self.entries.insert(key.into(), io);
    }

    pub fn get(&self, key: &str) -> Option<&ContextIo> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn mark_opaque(&mut self, entity: impl Into<String>) {
        self.opaque.insert(entity.into());
    }

    pub fn is_opaque(&self, entity: &str) -> bool {
        self.opaque.contains(entity)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validate params against a component's IO contract.
///
/// With `is_template` set, missing required inputs are tolerated. With
/// `check_all_refs` set, every `ops`/`dag` reference must exist in `context`
/// with a type compatible with the consuming IO.
#[allow(clippy::too_many_arguments)]
pub fn validate_params(
    params: &IndexMap<String, Param>,
    inputs: &[Io],
    outputs: &[Io],
    context: &ContextTable,
    matrix: Option<&Matrix>,
    joins: &IndexMap<String, Join>,
    is_template: bool,
    check_all_refs: bool,
) -> Result<Vec<ParamSpec>> {
    let matrix_names = matrix.map(Matrix::param_names).unwrap_or_default();
    let find_io = |name: &str| -> Option<(&Io, bool)> {
        inputs
            .iter()
            .find(|io| io.name == name)
            .map(|io| (io, false))
            .or_else(|| outputs.iter().find(|io| io.name == name).map(|io| (io, true)))
    };

    let mut specs: Vec<ParamSpec> = Vec::new();
    let mut bound: HashSet<String> = HashSet::new();

    for (name, param) in params {
        param.validate(name)?;
        if matrix_names.contains(name) {
            return Err(Error::Validation(format!(
                "param `{}` is bound both by params and by the matrix",
                name
            )));
        }
        let io = find_io(name);
        if io.is_none() && !param.context_only {
            return Err(Error::Validation(format!(
                "param `{}` is not defined in the component inputs or outputs",
                name
            )));
        }
        let (io, is_output) = match io {
            Some((io, is_output)) => (Some(io), is_output),
            None => (None, false),
        };

        let spec = match &param.reference {
            None => match check_literal(name, param, io) {
                Ok(spec) => spec,
                Err(e) if param.context_only => {
                    warn!(param = %name, error = %e, "Skipping context-only param that failed type check");
                    continue;
                }
                Err(e) => return Err(e),
            },
            Some(_) => {
                let spec = check_reference(name, param, io, is_output, context, joins, check_all_refs);
                match spec {
                    Ok(spec) => spec,
                    Err(e) if param.context_only => {
                        warn!(param = %name, error = %e, "Skipping context-only param that failed type check");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        let mut spec = spec;
        spec.is_output = is_output;
        bound.insert(name.clone());
        specs.push(spec);
    }

    if let Some(matrix) = matrix {
        validate_matrix(matrix, inputs, &matrix_names)?;
    }

    for (join_name, join) in joins {
        for (name, param) in &join.params {
            let Some((io, is_output)) = find_io(name) else {
                return Err(Error::Validation(format!(
                    "join `{}` binds `{}` which is not a component input",
                    join_name, name
                )));
            };
            if !io.is_list {
                return Err(Error::Validation(format!(
                    "join `{}` binds `{}` which must be declared with isList",
                    join_name, name
                )));
            }
            if bound.contains(name) {
                return Err(Error::Validation(format!(
                    "param `{}` is bound both by params and by join `{}`",
                    name, join_name
                )));
            }
            let mut join_param = param.clone();
            join_param.reference = Some(format!("joins.{}", join_name));
            let mut spec = ParamSpec::from_io(name, join_param, Some(io), ParamKind::Joins, is_output);
            spec.is_output = is_output;
            bound.insert(name.clone());
            specs.push(spec);
        }
    }

    for io in inputs {
        if bound.contains(&io.name) || matrix_names.contains(&io.name) {
            continue;
        }
        if io.value.is_none() && !io.is_optional {
            if is_template {
                continue;
            }
            return Err(Error::Validation(format!(
                "inputs[{}]: missing required input `{}` of type `{}`",
                io.name,
                io.name,
                io.iotype.map(|t| t.as_str()).unwrap_or("any")
            )));
        }
        specs.push(stamped_default(io, false));
    }
    for io in outputs {
        if bound.contains(&io.name) || io.value.is_none() {
            continue;
        }
        specs.push(stamped_default(io, true));
    }

    Ok(specs)
}

fn stamped_default(io: &Io, is_output: bool) -> ParamSpec {
    let param = Param::literal(io.value.clone().unwrap_or(Value::Null));
    let mut spec = ParamSpec::from_io(&io.name, param, Some(io), ParamKind::Literal, is_output);
    spec.is_requested = false;
    spec
}

fn check_literal(name: &str, param: &Param, io: Option<&Io>) -> Result<ParamSpec> {
    let mut param = param.clone();
    if let (Some(io), Some(value)) = (io, param.value.as_ref()) {
        if !is_template(value) {
            let parsed = io
                .parse(value, false)
                .map_err(|e| e.at(&format!("params[{}]", name)))?;
            param.value = Some(parsed);
        }
    }
    Ok(ParamSpec::from_io(name, param, io, ParamKind::Literal, false))
}

fn check_reference(
    name: &str,
    param: &Param,
    io: Option<&Io>,
    is_output: bool,
    context: &ContextTable,
    joins: &IndexMap<String, Join>,
    check_all_refs: bool,
) -> Result<ParamSpec> {
    let path = format!("params[{}]", name);
    let entity = param
        .entity_ref()
        .transpose()
        .map_err(|e| e.at(&path))?
        .ok_or_else(|| Error::Validation(format!("{}: missing ref", path)))?;
    let kind = ParamKind::from_entity(entity.entity);

    match kind {
        ParamKind::Joins => {
            let join_name = entity.name.as_deref().unwrap_or_default();
            if !joins.contains_key(join_name) {
                return Err(Error::Validation(format!(
                    "{}: reference to undefined join `{}`",
                    path, join_name
                )));
            }
            if let Some(io) = io {
                if !io.is_list {
                    return Err(Error::Validation(format!(
                        "{}: join references require `{}` to be declared with isList",
                        path, name
                    )));
                }
            }
            if check_all_refs {
                let context_ref = param
                    .context_ref()
                    .transpose()
                    .map_err(|e| e.at(&path))?
                    .ok_or_else(|| Error::Validation(format!("{}: missing ref", path)))?;
                let key = context_ref.key();
                match context.get(&key) {
                    Some(entry) => check_ref_type(name, io, entry, &key)?,
                    None if context.is_opaque(&context_ref.entity.to_string()) => {}
                    None => {
                        return Err(Error::Validation(format!(
                            "{}: reference `{}` does not exist in the context",
                            path, key
                        )))
                    }
                }
            }
        }
        ParamKind::Runs => {
            // run refs are resolved by the control plane
            param
                .context_ref()
                .transpose()
                .map_err(|e| e.at(&path))?;
        }
        ParamKind::Ops | ParamKind::Dag | ParamKind::Pipeline => {
            let context_ref = param
                .context_ref()
                .transpose()
                .map_err(|e| e.at(&path))?
                .ok_or_else(|| Error::Validation(format!("{}: missing ref", path)))?;
            if check_all_refs && !context.is_opaque(&context_ref.entity.to_string()) {
                let key = context_key(&context_ref, kind);
                let entry = context.get(&key).ok_or_else(|| {
                    Error::Validation(format!(
                        "{}: reference `{}` does not exist in the context",
                        path, key
                    ))
                })?;
                check_ref_type(name, io, entry, &key)?;
            }
        }
        ParamKind::Literal => {}
    }

    Ok(ParamSpec::from_io(name, param.clone(), io, kind, is_output))
}

/// Pipeline refs address the enclosing dag.
fn context_key(context_ref: &ContextRef, kind: ParamKind) -> String {
    let key = context_ref.key();
    match kind {
        ParamKind::Pipeline => key.replacen("pipeline", "dag", 1),
        _ => key,
    }
}

fn check_ref_type(name: &str, io: Option<&Io>, entry: &ContextIo, key: &str) -> Result<()> {
    let (Some(expected), Some(actual)) = (io.and_then(|io| io.iotype), entry.iotype) else {
        return Ok(());
    };
    if expected.accepts(actual) || (io.map(|io| io.is_list).unwrap_or(false) && entry.is_list) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "param `{}` expects type `{}` but reference `{}` has type `{}`",
        name, expected, key, actual
    )))
}

fn validate_matrix(matrix: &Matrix, inputs: &[Io], names: &[String]) -> Result<()> {
    for name in names {
        let io = inputs.iter().find(|io| &io.name == name).ok_or_else(|| {
            Error::Validation(format!(
                "matrix param `{}` is not defined in the component inputs",
                name
            ))
        })?;
        if let Some(hp) = matrix.params().and_then(|p| p.get(name)) {
            if !hp.accepts_type(io.iotype) {
                return Err(Error::Validation(format!(
                    "matrix param `{}` of kind `{}` is incompatible with input type `{}`",
                    name,
                    hp.kind(),
                    io.iotype.map(|t| t.as_str()).unwrap_or("any")
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ios(yaml: &str) -> Vec<Io> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn params(yaml: &str) -> IndexMap<String, Param> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn validate(
        params: &IndexMap<String, Param>,
        inputs: &[Io],
        outputs: &[Io],
        context: &ContextTable,
    ) -> Result<Vec<ParamSpec>> {
        validate_params(params, inputs, outputs, context, None, &IndexMap::new(), false, true)
    }

    #[test]
    fn test_missing_required_input() {
        let inputs = ios("- {name: lr, type: float}");
        let err = validate(&IndexMap::new(), &inputs, &[], &ContextTable::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("lr"));

        let specs = validate_params(
            &IndexMap::new(),
            &inputs,
            &[],
            &ContextTable::new(),
            None,
            &IndexMap::new(),
            true,
            false,
        )
        .unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_optional_inputs_need_no_params() {
        let inputs = ios(
            r#"
- {name: lr, type: float, isOptional: true, value: 0.01}
- {name: tag, type: str, isOptional: true}
"#,
        );
        let specs = validate(&IndexMap::new(), &inputs, &[], &ContextTable::new()).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(!specs[0].is_requested);
        assert_eq!(specs[0].value(), Some(&json!(0.01)));
    }

    #[test]
    fn test_literal_override_is_coerced() {
        let inputs = ios("- {name: lr, type: float, isOptional: true, value: 0.01}");
        let specs = validate(&params("lr: {value: '0.1'}"), &inputs, &[], &ContextTable::new()).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].is_requested);
        assert_eq!(specs[0].value(), Some(&json!(0.1)));

        let err = validate(&params("lr: {value: abc}"), &inputs, &[], &ContextTable::new()).unwrap_err();
        assert!(err.to_string().contains("params[lr]"));
    }

    #[test]
    fn test_unknown_param_rejected_unless_context_only() {
        let inputs = ios("- {name: lr, type: float, isOptional: true}");
        let err = validate(&params("epochs: {value: 3}"), &inputs, &[], &ContextTable::new()).unwrap_err();
        assert!(err.to_string().contains("epochs"));

        let specs = validate(
            &params("epochs: {value: 3, contextOnly: true}"),
            &inputs,
            &[],
            &ContextTable::new(),
        )
        .unwrap();
        assert!(specs.iter().any(|s| s.name == "epochs" && s.is_context));
    }

    #[test]
    fn test_context_only_type_failure_is_skipped() {
        let inputs = ios("- {name: lr, type: float, isOptional: true}");
        let specs = validate(
            &params("lr: {value: abc, contextOnly: true}"),
            &inputs,
            &[],
            &ContextTable::new(),
        )
        .unwrap();
        assert!(specs.iter().all(|s| !s.is_requested));
    }

    #[test]
    fn test_ref_classification_and_checks() {
        let inputs = ios("- {name: x, type: float}");
        let mut context = ContextTable::new();
        context.insert("ops.A.outputs.metric", ContextIo::typed(IoType::Float));
        context.insert("ops.A.outputs.name", ContextIo::typed(IoType::Str));

        let specs = validate(
            &params("x: {ref: ops.A, value: outputs.metric}"),
            &inputs,
            &[],
            &context,
        )
        .unwrap();
        assert_eq!(specs[0].kind, ParamKind::Ops);

        let err = validate(&params("x: {ref: ops.A, value: outputs.missing}"), &inputs, &[], &context)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let err = validate(&params("x: {ref: ops.A, value: outputs.name}"), &inputs, &[], &context)
            .unwrap_err();
        assert!(err.to_string().contains("expects type `float`"));

        let specs = validate(&params("x: {ref: runs.abc, value: outputs.loss}"), &inputs, &[], &context)
            .unwrap();
        assert_eq!(specs[0].kind, ParamKind::Runs);
    }

    #[test]
    fn test_opaque_entities_are_unchecked() {
        let inputs = ios("- {name: x, type: float}");
        let mut context = ContextTable::new();
        context.mark_opaque("ops.hub");
        let specs = validate(&params("x: {ref: ops.hub, value: outputs.anything}"), &inputs, &[], &context)
            .unwrap();
        assert_eq!(specs[0].kind, ParamKind::Ops);
    }

    #[test]
    fn test_join_params_require_lists() {
        let inputs = ios("- {name: losses, type: float, isList: true}\n- {name: single, type: float, isOptional: true}");
        let joins: IndexMap<String, Join> = serde_yaml::from_str(
            r#"
best:
  query: "metrics.loss:<0.1"
  params:
    losses: {value: outputs.loss}
"#,
        )
        .unwrap();
        let specs = validate_params(
            &IndexMap::new(),
            &inputs,
            &[],
            &ContextTable::new(),
            None,
            &joins,
            false,
            true,
        )
        .unwrap();
        assert_eq!(specs[0].kind, ParamKind::Joins);

        let joins: IndexMap<String, Join> = serde_yaml::from_str(
            "best: {query: q, params: {single: {value: outputs.loss}}}",
        )
        .unwrap();
        assert!(validate_params(
            &IndexMap::new(),
            &inputs,
            &[],
            &ContextTable::new(),
            None,
            &joins,
            true,
            true
        )
        .is_err());
    }

    #[test]
    fn test_matrix_type_rules() {
        let inputs = ios("- {name: lr, type: float}\n- {name: day, type: date}");
        let matrix: Matrix = serde_yaml::from_str(
            r#"
kind: grid
params:
  lr: {kind: linspace, value: {start: 0.1, stop: 0.5, num: 3}}
"#,
        )
        .unwrap();
        let err = validate_params(
            &IndexMap::new(),
            &inputs,
            &[],
            &ContextTable::new(),
            Some(&matrix),
            &IndexMap::new(),
            false,
            true,
        )
        .unwrap_err();
        // `day` is still missing
        assert!(err.to_string().contains("day"));

        let matrix: Matrix = serde_yaml::from_str(
            r#"
kind: grid
params:
  day: {kind: range, value: {start: 1, stop: 5, step: 1}}
"#,
        )
        .unwrap();
        let err = validate_params(
            &IndexMap::new(),
            &inputs,
            &[],
            &ContextTable::new(),
            Some(&matrix),
            &IndexMap::new(),
            true,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }
}
