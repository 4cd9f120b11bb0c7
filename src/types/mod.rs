//! Typed IO values.
//!
//! Every IO slot carries a type tag; values supplied by params or defaults
//! are coerced against the tag before they are bound.

mod validation;

pub use validation::Validation;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// IO type tag: primitive or semantic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoType {
    Any,
    Str,
    Int,
    Float,
    Bool,
    Dict,
    List,
    Path,
    Uri,
    Image,
    Gcs,
    S3,
    Wasb,
    Git,
    Dockerfile,
    Artifacts,
    Tensorboard,
    Event,
    Metric,
    Metadata,
    Date,
    Datetime,
}

impl IoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoType::Any => "any",
            IoType::Str => "str",
            IoType::Int => "int",
            IoType::Float => "float",
            IoType::Bool => "bool",
            IoType::Dict => "dict",
            IoType::List => "list",
            IoType::Path => "path",
            IoType::Uri => "uri",
            IoType::Image => "image",
            IoType::Gcs => "gcs",
            IoType::S3 => "s3",
            IoType::Wasb => "wasb",
            IoType::Git => "git",
            IoType::Dockerfile => "dockerfile",
            IoType::Artifacts => "artifacts",
            IoType::Tensorboard => "tensorboard",
            IoType::Event => "event",
            IoType::Metric => "metric",
            IoType::Metadata => "metadata",
            IoType::Date => "date",
            IoType::Datetime => "datetime",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, IoType::Int | IoType::Float | IoType::Metric)
    }

    /// Whether a value produced under `other` may feed a slot of this type.
    pub fn accepts(&self, other: IoType) -> bool {
        if *self == other || *self == IoType::Any || other == IoType::Any {
            return true;
        }
        match self {
            IoType::Float | IoType::Metric => matches!(other, IoType::Int | IoType::Float | IoType::Metric),
            IoType::Str => matches!(
                other,
                IoType::Path
                    | IoType::Uri
                    | IoType::Image
                    | IoType::Gcs
                    | IoType::S3
                    | IoType::Wasb
                    | IoType::Date
                    | IoType::Datetime
            ),
            IoType::Path => matches!(other, IoType::Str | IoType::Gcs | IoType::S3 | IoType::Wasb),
            IoType::Uri => matches!(other, IoType::Str),
            IoType::Dict => matches!(other, IoType::Metadata),
            IoType::Metadata => matches!(other, IoType::Dict),
            _ => false,
        }
    }
}

impl std::fmt::Display for IoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// JSON type name used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Coerce `value` to `iotype`, returning the normalized value.
///
/// `is_list` requires a sequence whose elements are each coerced.
/// A `None` type accepts anything unchanged.
pub fn parse_value(name: &str, iotype: Option<IoType>, value: &Value, is_list: bool) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if is_list {
        let items = match value {
            Value::Array(items) => items.clone(),
            Value::String(s) => parse_list_string(s),
            other => {
                return Err(type_error(name, "list", other));
            }
        };
        let parsed = items
            .iter()
            .map(|item| parse_scalar(name, iotype, item))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::Array(parsed));
    }
    parse_scalar(name, iotype, value)
}

fn parse_list_string(s: &str) -> Vec<Value> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
        return items;
    }
    s.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| Value::String(part.to_string()))
        .collect()
}

fn type_error(name: &str, expected: &str, value: &Value) -> Error {
    Error::Validation(format!(
        "param `{}` expected type `{}`, got `{}`",
        name,
        expected,
        json_type_name(value)
    ))
}

fn parse_scalar(name: &str, iotype: Option<IoType>, value: &Value) -> Result<Value> {
    let iotype = match iotype {
        None | Some(IoType::Any) => return Ok(value.clone()),
        Some(t) => t,
    };
    let expected = iotype.as_str();

    match iotype {
        IoType::Any => Ok(value.clone()),
        IoType::Str => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err(type_error(name, expected, value)),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| type_error(name, expected, value)),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Float | IoType::Metric => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| type_error(name, expected, value)),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "n" | "off" => Ok(Value::Bool(false)),
                _ => Err(type_error(name, expected, value)),
            },
            other => Err(type_error(name, expected, other)),
        },
        IoType::Dict | IoType::Metadata => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(type_error(name, expected, value)),
            },
            other => Err(type_error(name, expected, other)),
        },
        IoType::List => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::String(s) => Ok(Value::Array(parse_list_string(s))),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Path | IoType::Event => match value {
            Value::String(_) | Value::Object(_) => Ok(value.clone()),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Uri => match value {
            Value::String(s) if !s.trim().is_empty() => Ok(value.clone()),
            Value::Object(obj) if obj.contains_key("host") => Ok(value.clone()),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Image => match value {
            Value::String(s) if !s.is_empty() && !s.contains(char::is_whitespace) => {
                Ok(value.clone())
            }
            other => Err(type_error(name, expected, other)),
        },
        IoType::Gcs => parse_bucket(name, expected, value, &["gs://"]),
        IoType::S3 => parse_bucket(name, expected, value, &["s3://", "s3a://"]),
        IoType::Wasb => parse_bucket(name, expected, value, &["wasb://", "wasbs://", "az://", "abfs://"]),
        IoType::Git => match value {
            Value::String(s) if !s.is_empty() => Ok(serde_json::json!({ "url": s })),
            Value::Object(_) => Ok(value.clone()),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Dockerfile | IoType::Tensorboard => match value {
            Value::Object(_) => Ok(value.clone()),
            other => Err(type_error(name, expected, other)),
        },
        IoType::Artifacts => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::Array(items) if items.iter().all(Value::is_string) => {
                Ok(serde_json::json!({ "files": items }))
            }
            other => Err(type_error(name, expected, other)),
        },
        IoType::Date => match value {
            Value::String(s) if NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok() => {
                Ok(value.clone())
            }
            other => Err(type_error(name, expected, other)),
        },
        IoType::Datetime => match value {
            Value::String(s) if parse_datetime(s).is_some() => Ok(value.clone()),
            other => Err(type_error(name, expected, other)),
        },
    }
}

fn parse_bucket(name: &str, expected: &str, value: &Value, schemes: &[&str]) -> Result<Value> {
    match value {
        Value::String(s) if schemes.iter().any(|scheme| s.starts_with(scheme)) => {
            Ok(value.clone())
        }
        Value::String(s) => Err(Error::Validation(format!(
            "param `{}` expected a `{}` uri ({}), got `{}`",
            name,
            expected,
            schemes.join(" | "),
            s
        ))),
        other => Err(type_error(name, expected, other)),
    }
}

/// Parse the datetime formats accepted by `datetime` IOs and date ranges.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_value("lr", Some(IoType::Float), &json!(0.1), false).unwrap(), json!(0.1));
        assert_eq!(parse_value("lr", Some(IoType::Float), &json!(1), false).unwrap(), json!(1));
        assert_eq!(parse_value("lr", Some(IoType::Float), &json!("0.5"), false).unwrap(), json!(0.5));
        assert_eq!(parse_value("n", Some(IoType::Int), &json!("12"), false).unwrap(), json!(12));
        assert!(parse_value("n", Some(IoType::Int), &json!(1.5), false).is_err());
        assert!(parse_value("n", Some(IoType::Int), &json!("abc"), false).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_value("f", Some(IoType::Bool), &json!("yes"), false).unwrap(), json!(true));
        assert_eq!(parse_value("f", Some(IoType::Bool), &json!(0), false).unwrap(), json!(false));
        assert!(parse_value("f", Some(IoType::Bool), &json!("maybe"), false).is_err());
    }

    #[test]
    fn test_parse_list() {
        let parsed = parse_value("xs", Some(IoType::Int), &json!(["1", 2]), true).unwrap();
        assert_eq!(parsed, json!([1, 2]));
        let parsed = parse_value("xs", Some(IoType::Str), &json!("a, b"), true).unwrap();
        assert_eq!(parsed, json!(["a", "b"]));
        assert!(parse_value("xs", Some(IoType::Int), &json!(3), true).is_err());
    }

    #[test]
    fn test_parse_buckets() {
        assert!(parse_value("b", Some(IoType::S3), &json!("s3://bucket/path"), false).is_ok());
        assert!(parse_value("b", Some(IoType::Gcs), &json!("s3://bucket"), false).is_err());
        assert!(parse_value("b", Some(IoType::Wasb), &json!("wasbs://c@a.blob.core.windows.net"), false).is_ok());
    }

    #[test]
    fn test_parse_dates() {
        assert!(parse_value("d", Some(IoType::Date), &json!("2024-01-31"), false).is_ok());
        assert!(parse_value("d", Some(IoType::Date), &json!("2024-31-01"), false).is_err());
        assert!(parse_value("d", Some(IoType::Datetime), &json!("2024-01-31 10:00"), false).is_ok());
        assert!(parse_value("d", Some(IoType::Datetime), &json!("2024-01-31T10:00:00Z"), false).is_ok());
    }

    #[test]
    fn test_semantic_shapes() {
        let git = parse_value("repo", Some(IoType::Git), &json!("https://github.com/org/repo"), false).unwrap();
        assert_eq!(git["url"], "https://github.com/org/repo");
        let artifacts = parse_value("a", Some(IoType::Artifacts), &json!(["/foo"]), false).unwrap();
        assert_eq!(artifacts["files"], json!(["/foo"]));
        assert!(parse_value("img", Some(IoType::Image), &json!("bad image"), false).is_err());
    }

    #[test]
    fn test_accepts() {
        assert!(IoType::Float.accepts(IoType::Int));
        assert!(IoType::Str.accepts(IoType::Path));
        assert!(!IoType::Int.accepts(IoType::Float));
        assert!(IoType::Any.accepts(IoType::Dict));
        assert!(!IoType::Bool.accepts(IoType::Str));
    }
}
