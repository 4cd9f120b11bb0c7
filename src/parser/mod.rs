//! `{{ expr }}` template substitution.
//!
//! Two modes:
//! - [`Mode::Eager`] substitutes tokens whose referents are bound and
//!   leaves the rest verbatim for a later pass.
//! - [`Mode::Runtime`] requires every token to resolve.
//!
//! A string that is exactly one token keeps the resolved value's JSON type;
//! tokens embedded in longer strings are stringified.

mod expr;

pub use expr::{Expr, Filter, Operand, Segment};

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Matches `{{ ... }}` tokens.
pub fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("valid regex"))
}

/// Substitution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Eager,
    Runtime,
}

/// How a named value renders through `as_arg`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgFormat {
    pub arg_format: Option<String>,
    pub is_flag: bool,
}

/// Values visible to templates, keyed by root identifier.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: Map<String, Value>,
    formats: HashMap<String, ArgFormat>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value under a dotted key, creating intermediate objects.
    pub fn insert(&mut self, key: &str, value: Value) {
        let mut parts = key.split('.');
        let Some(first) = parts.next() else {
            return;
        };
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            self.values.insert(first.to_string(), value);
            return;
        }
        let mut current = self
            .values
            .entry(first.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for part in &rest[..rest.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        if let (Value::Object(map), Some(last)) = (current, rest.last()) {
            map.insert(last.to_string(), value);
        }
    }

    /// Bind a param: `{{ name }}`, `{{ params.name.value }}`, `{{ params.name.as_arg }}`.
    pub fn add_param(&mut self, name: &str, value: Value, format: ArgFormat) {
        self.formats.insert(name.to_string(), format);
        let as_arg = self.format_arg(name, &value);
        let as_str = stringify(&value);
        self.insert(
            &format!("params.{}", name),
            serde_json::json!({
                "value": value,
                "as_arg": as_arg,
                "as_str": as_str,
            }),
        );
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, root: &str) -> Option<&Value> {
        self.values.get(root)
    }

    pub fn contains(&self, root: &str) -> bool {
        self.values.contains_key(root)
    }

    /// Render `value` as a CLI argument for `name`.
    pub fn format_arg(&self, name: &str, value: &Value) -> String {
        let format = self.formats.get(name).cloned().unwrap_or_default();
        as_arg(name, value, &format)
    }

    /// Layer `other` over this context; keys in `other` win at the top level.
    pub fn overlay(&self, other: &TemplateContext) -> TemplateContext {
        let mut merged = self.clone();
        for (k, v) in &other.values {
            match (merged.values.get_mut(k), v) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    for (ik, iv) in incoming {
                        existing.insert(ik.clone(), iv.clone());
                    }
                }
                _ => {
                    merged.values.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, f) in &other.formats {
            merged.formats.insert(k.clone(), f.clone());
        }
        merged
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// CLI argument rendering.
///
/// `true` renders `--name`; `false` and null render an empty string;
/// any other value renders `--name=value` unless `arg_format` is set, in
/// which case the format is rendered with the value bound to `name`.
pub fn as_arg(name: &str, value: &Value, format: &ArgFormat) -> String {
    match value {
        Value::Null | Value::Bool(false) => return String::new(),
        Value::Bool(true) if format.arg_format.is_none() => return format!("--{}", name),
        _ => {}
    }
    if let Some(arg_format) = &format.arg_format {
        let mut ctx = TemplateContext::new();
        ctx.insert(name, value.clone());
        return match render_str(arg_format, &ctx, Mode::Eager, name) {
            Ok(rendered) => stringify(&rendered),
            Err(_) => arg_format.clone(),
        };
    }
    if format.is_flag {
        return format!("--{}", name);
    }
    format!("--{}={}", name, stringify(value))
}

/// Strings raw; everything else compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether a string still carries template tokens.
pub fn has_tokens(s: &str) -> bool {
    token_regex().is_match(s)
}

/// Render a string. `path` names the spec element for error messages.
pub fn render_str(s: &str, ctx: &TemplateContext, mode: Mode, path: &str) -> Result<Value> {
    let re = token_regex();
    let trimmed = s.trim();
    let matches: Vec<_> = re.find_iter(trimmed).collect();
    if matches.len() == 1 && matches[0].start() == 0 && matches[0].end() == trimmed.len() {
        let caps = re
            .captures(trimmed)
            .ok_or_else(|| Error::Compiler(format!("{}: invalid template", path)))?;
        let src = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        return match resolve(src, ctx, mode, path)? {
            Some(value) => Ok(value),
            None => Ok(Value::String(s.to_string())),
        };
    }
    if matches.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        match resolve(inner.as_str(), ctx, mode, path)? {
            Some(value) => out.push_str(&stringify(&value)),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn resolve(src: &str, ctx: &TemplateContext, mode: Mode, path: &str) -> Result<Option<Value>> {
    let expr = Expr::parse(src).map_err(|e| e.at(path))?;
    match expr.eval(ctx).map_err(|e| e.at(path))? {
        Some(value) => Ok(Some(value)),
        None => match mode {
            Mode::Eager => Ok(None),
            Mode::Runtime => Err(Error::Compiler(format!(
                "{}: unresolved template `{{{{ {} }}}}`",
                path,
                src.trim()
            ))),
        },
    }
}

/// Render every string in a JSON tree.
pub fn render_value(value: &Value, ctx: &TemplateContext, mode: Mode, path: &str) -> Result<Value> {
    match value {
        Value::String(s) => render_str(s, ctx, mode, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| render_value(item, ctx, mode, &format!("{}[{}]", path, i)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", path, k)
                };
                out.insert(k.clone(), render_value(v, ctx, mode, &child)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a JSON tree, stringifying every token so string fields stay strings.
pub fn render_strings(value: &Value, ctx: &TemplateContext, mode: Mode, path: &str) -> Result<Value> {
    match value {
        Value::String(s) if has_tokens(s) => {
            let rendered = render_str(s, ctx, mode, path)?;
            Ok(match rendered {
                Value::String(s) => Value::String(s),
                other => Value::String(stringify(&other)),
            })
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| render_strings(item, ctx, mode, &format!("{}[{}]", path, i)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", path, k)
                };
                out.insert(k.clone(), render_strings(v, ctx, mode, &child)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a typed section through its JSON form.
pub fn render_typed<T: Serialize + DeserializeOwned>(
    item: &T,
    ctx: &TemplateContext,
    mode: Mode,
    path: &str,
) -> Result<T> {
    let value = serde_json::to_value(item)?;
    let rendered = render_strings(&value, ctx, mode, path)?;
    serde_json::from_value(rendered)
        .map_err(|e| Error::Compiler(format!("{}: rendered section is invalid: {}", path, e)))
}

/// Collect every token left in a JSON tree, with its path.
pub fn remaining_tokens(value: &Value, path: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    collect_tokens(value, path, &mut out);
    out
}

fn collect_tokens(value: &Value, path: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            for m in token_regex().find_iter(s) {
                out.push((path.to_string(), m.as_str().to_string()));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_tokens(item, &format!("{}[{}]", path, i), out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect_tokens(v, &format!("{}.{}", path, k), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.add_param("lr", json!(0.1), ArgFormat::default());
        ctx.add_param("verbose", json!(true), ArgFormat::default());
        ctx.add_param("debug", json!(false), ArgFormat::default());
        ctx.add_param(
            "epochs",
            json!(10),
            ArgFormat {
                arg_format: Some("--num-epochs {{ epochs }}".into()),
                is_flag: false,
            },
        );
        ctx
    }

    #[test]
    fn test_single_token_keeps_type() {
        let v = render_str("{{ lr }}", &ctx(), Mode::Eager, "x").unwrap();
        assert_eq!(v, json!(0.1));
        let v = render_str("lr={{ lr }}", &ctx(), Mode::Eager, "x").unwrap();
        assert_eq!(v, json!("lr=0.1"));
    }

    #[test]
    fn test_as_arg() {
        let c = ctx();
        assert_eq!(render_str("{{ params.lr.as_arg }}", &c, Mode::Runtime, "x").unwrap(), json!("--lr=0.1"));
        assert_eq!(render_str("{{ verbose | as_arg }}", &c, Mode::Runtime, "x").unwrap(), json!("--verbose"));
        assert_eq!(render_str("{{ params.debug.as_arg }}", &c, Mode::Runtime, "x").unwrap(), json!(""));
        assert_eq!(
            render_str("{{ params.epochs.as_arg }}", &c, Mode::Runtime, "x").unwrap(),
            json!("--num-epochs 10")
        );
        assert_eq!(as_arg("x", &Value::Null, &ArgFormat::default()), "");
    }

    #[test]
    fn test_eager_leaves_unbound() {
        let v = render_str("{{ globals.uuid }}", &ctx(), Mode::Eager, "cmd").unwrap();
        assert_eq!(v, json!("{{ globals.uuid }}"));
        let v = render_str("run {{ globals.uuid }} {{ lr }}", &ctx(), Mode::Eager, "cmd").unwrap();
        assert_eq!(v, json!("run {{ globals.uuid }} 0.1"));
    }

    #[test]
    fn test_runtime_requires_resolution() {
        let err = render_str("{{ globals.uuid }}", &ctx(), Mode::Runtime, "run.container.command[0]")
            .unwrap_err();
        assert!(err.to_string().contains("run.container.command[0]"));
        assert_eq!(err.exit_code(), 3);

        let mut c = ctx();
        c.insert("globals.uuid", json!("f00"));
        let v = render_str("{{ globals.uuid }}", &c, Mode::Runtime, "x").unwrap();
        assert_eq!(v, json!("f00"));
    }

    #[test]
    fn test_render_value_tree() {
        let tree = json!({
            "args": ["{{ params.lr.as_arg }}", "{{ params.debug.as_arg }}"],
            "env": [{"name": "LR", "value": "{{ lr }}"}],
        });
        let rendered = render_strings(&tree, &ctx(), Mode::Runtime, "").unwrap();
        assert_eq!(rendered["args"][0], "--lr=0.1");
        assert_eq!(rendered["args"][1], "");
        assert_eq!(rendered["env"][0]["value"], "0.1");
        assert!(remaining_tokens(&rendered, "run").is_empty());
    }

    #[test]
    fn test_overlay() {
        let mut base = TemplateContext::new();
        base.insert("globals.uuid", json!("a"));
        base.insert("globals.name", json!("n"));
        let mut replica = TemplateContext::new();
        replica.insert("globals.replica", json!("worker"));
        let merged = base.overlay(&replica);
        assert_eq!(merged.get("globals").unwrap()["uuid"], "a");
        assert_eq!(merged.get("globals").unwrap()["replica"], "worker");
    }

    #[test]
    fn test_nested_insert() {
        let mut c = TemplateContext::new();
        c.insert("ops.A.outputs.metric", json!(0.9));
        c.insert("ops.A.inputs.lr", json!(0.1));
        let v = render_str("{{ ops.A.outputs.metric }}", &c, Mode::Runtime, "x").unwrap();
        assert_eq!(v, json!(0.9));
        assert_eq!(c.get("ops").unwrap()["A"]["inputs"]["lr"], 0.1);
    }
}
