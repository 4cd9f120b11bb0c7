//! Value predicates attached to IO slots.

use std::collections::HashSet;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Optional predicates checked against a bound value.
///
/// Scalar predicates apply element-wise to sequences; `keys`-family
/// predicates apply to mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ge: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<f64>,
    #[serde(default, alias = "multiple_of", skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    #[serde(default, alias = "min_digits", skip_serializing_if = "Option::is_none")]
    pub min_digits: Option<u32>,
    #[serde(default, alias = "max_digits", skip_serializing_if = "Option::is_none")]
    pub max_digits: Option<u32>,
    #[serde(default, alias = "decimal_places", skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, alias = "min_length", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, alias = "max_length", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, alias = "min_items", skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(default, alias = "max_items", skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, alias = "contains_keys", skip_serializing_if = "Option::is_none")]
    pub contains_keys: Option<Vec<String>>,
    #[serde(default, alias = "excludes_keys", skip_serializing_if = "Option::is_none")]
    pub excludes_keys: Option<Vec<String>>,
    /// Defer the check to the runtime pass.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delay: bool,
}

impl Validation {
    /// Check the predicate set itself is coherent.
    pub fn validate_schema(&self) -> Result<()> {
        if let Some(regex) = &self.regex {
            Regex::new(regex)
                .map_err(|e| Error::Schema(format!("invalid validation regex `{}`: {}", regex, e)))?;
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(Error::Schema("validation minLength > maxLength".into()));
            }
        }
        if let (Some(min), Some(max)) = (self.min_items, self.max_items) {
            if min > max {
                return Err(Error::Schema("validation minItems > maxItems".into()));
            }
        }
        if let Some(multiple) = self.multiple_of {
            if multiple <= 0.0 {
                return Err(Error::Schema("validation multipleOf must be positive".into()));
            }
        }
        Ok(())
    }

    /// Validate `value` for the param `name`.
    ///
    /// Delayed validations are skipped unless `runtime` is set.
    pub fn check(&self, name: &str, value: &Value, runtime: bool) -> Result<()> {
        if self.delay && !runtime {
            return Ok(());
        }
        if value.is_null() {
            return Ok(());
        }
        match value {
            Value::Array(items) => {
                self.check_container(name, items)?;
                for item in items {
                    self.check_scalar(name, item)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                self.check_keys(name, map)?;
                self.check_options(name, value)
            }
            _ => self.check_scalar(name, value),
        }
    }

    fn check_container(&self, name: &str, items: &[Value]) -> Result<()> {
        if let Some(min) = self.min_items {
            if items.len() < min {
                return Err(fail(name, format!("expected at least {} items, got {}", min, items.len())));
            }
        }
        if let Some(max) = self.max_items {
            if items.len() > max {
                return Err(fail(name, format!("expected at most {} items, got {}", max, items.len())));
            }
        }
        if let Some(contains) = &self.contains {
            for needle in as_list(contains) {
                if !items.contains(needle) {
                    return Err(fail(name, format!("expected to contain {}", needle)));
                }
            }
        }
        if let Some(excludes) = &self.excludes {
            for needle in as_list(excludes) {
                if items.contains(needle) {
                    return Err(fail(name, format!("must not contain {}", needle)));
                }
            }
        }
        Ok(())
    }

    fn check_keys(&self, name: &str, map: &serde_json::Map<String, Value>) -> Result<()> {
        if let Some(keys) = &self.keys {
            let allowed: HashSet<&str> = keys.iter().map(String::as_str).collect();
            if let Some(extra) = map.keys().find(|k| !allowed.contains(k.as_str())) {
                return Err(fail(name, format!("key `{}` not in allowed keys {:?}", extra, keys)));
            }
        }
        if let Some(required) = &self.contains_keys {
            if let Some(missing) = required.iter().find(|k| !map.contains_key(k.as_str())) {
                return Err(fail(name, format!("missing required key `{}`", missing)));
            }
        }
        if let Some(excluded) = &self.excludes_keys {
            if let Some(found) = excluded.iter().find(|k| map.contains_key(k.as_str())) {
                return Err(fail(name, format!("key `{}` is not allowed", found)));
            }
        }
        if let Some(min) = self.min_items {
            if map.len() < min {
                return Err(fail(name, format!("expected at least {} keys, got {}", min, map.len())));
            }
        }
        if let Some(max) = self.max_items {
            if map.len() > max {
                return Err(fail(name, format!("expected at most {} keys, got {}", max, map.len())));
            }
        }
        Ok(())
    }

    fn check_options(&self, name: &str, value: &Value) -> Result<()> {
        if let Some(options) = &self.options {
            if !options.contains(value) {
                return Err(fail(name, format!("value {} not in options {:?}", value, options)));
            }
        }
        Ok(())
    }

    fn check_scalar(&self, name: &str, value: &Value) -> Result<()> {
        self.check_options(name, value)?;
        match value {
            Value::Number(n) => {
                let x = n.as_f64().unwrap_or_default();
                self.check_numeric(name, x)?;
                self.check_decimal(name, &n.to_string())
            }
            Value::String(s) => self.check_string(name, s),
            _ => Ok(()),
        }
    }

    fn check_numeric(&self, name: &str, x: f64) -> Result<()> {
        if let Some(gt) = self.gt {
            if x <= gt {
                return Err(fail(name, format!("{} must be > {}", x, gt)));
            }
        }
        if let Some(ge) = self.ge {
            if x < ge {
                return Err(fail(name, format!("{} must be >= {}", x, ge)));
            }
        }
        if let Some(lt) = self.lt {
            if x >= lt {
                return Err(fail(name, format!("{} must be < {}", x, lt)));
            }
        }
        if let Some(le) = self.le {
            if x > le {
                return Err(fail(name, format!("{} must be <= {}", x, le)));
            }
        }
        if let Some(multiple) = self.multiple_of {
            let ratio = x / multiple;
            if (ratio - ratio.round()).abs() > 1e-9 {
                return Err(fail(name, format!("{} is not a multiple of {}", x, multiple)));
            }
        }
        Ok(())
    }

    fn check_decimal(&self, name: &str, repr: &str) -> Result<()> {
        if self.min_digits.is_none() && self.max_digits.is_none() && self.decimal_places.is_none() {
            return Ok(());
        }
        let unsigned = repr.trim_start_matches('-');
        let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let whole = whole.trim_start_matches('0');
        let digits = (whole.len() + fraction.len()) as u32;
        let places = fraction.len() as u32;
        if let Some(min) = self.min_digits {
            if digits < min {
                return Err(fail(name, format!("expected at least {} digits, got {}", min, digits)));
            }
        }
        if let Some(max) = self.max_digits {
            if digits > max {
                return Err(fail(name, format!("expected at most {} digits, got {}", max, digits)));
            }
        }
        if let Some(max_places) = self.decimal_places {
            if places > max_places {
                return Err(fail(
                    name,
                    format!("expected at most {} decimal places, got {}", max_places, places),
                ));
            }
        }
        Ok(())
    }

    fn check_string(&self, name: &str, s: &str) -> Result<()> {
        let len = s.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                return Err(fail(name, format!("expected length >= {}, got {}", min, len)));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(fail(name, format!("expected length <= {}, got {}", max, len)));
            }
        }
        if let Some(pattern) = &self.regex {
            let re = Regex::new(pattern)
                .map_err(|e| Error::Schema(format!("invalid validation regex `{}`: {}", pattern, e)))?;
            if !re.is_match(s) {
                return Err(fail(name, format!("`{}` does not match `{}`", s, pattern)));
            }
        }
        Ok(())
    }
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn fail(name: &str, reason: String) -> Error {
    Error::Validation(format!("param `{}` failed validation: {}", name, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_bounds() {
        let v = Validation {
            gt: Some(0.0),
            le: Some(1.0),
            ..Default::default()
        };
        assert!(v.check("lr", &json!(0.5), false).is_ok());
        assert!(v.check("lr", &json!(0), false).is_err());
        assert!(v.check("lr", &json!(1.5), false).is_err());
    }

    #[test]
    fn test_multiple_of_and_decimals() {
        let v = Validation {
            multiple_of: Some(0.5),
            decimal_places: Some(1),
            ..Default::default()
        };
        assert!(v.check("x", &json!(1.5), false).is_ok());
        assert!(v.check("x", &json!(1.25), false).is_err());
    }

    #[test]
    fn test_string_predicates() {
        let v = Validation {
            regex: Some("^v[0-9]+$".into()),
            max_length: Some(4),
            ..Default::default()
        };
        assert!(v.check("tag", &json!("v12"), false).is_ok());
        assert!(v.check("tag", &json!("x12"), false).is_err());
        assert!(v.check("tag", &json!("v12345"), false).is_err());
    }

    #[test]
    fn test_elementwise_predicates() {
        let v = Validation {
            ge: Some(0.0),
            min_items: Some(2),
            contains: Some(json!(3)),
            ..Default::default()
        };
        assert!(v.check("xs", &json!([1, 3]), false).is_ok());
        assert!(v.check("xs", &json!([3]), false).is_err());
        assert!(v.check("xs", &json!([-1, 3]), false).is_err());
        assert!(v.check("xs", &json!([1, 2]), false).is_err());
    }

    #[test]
    fn test_options() {
        let v = Validation {
            options: Some(vec![json!("adam"), json!("sgd")]),
            ..Default::default()
        };
        assert!(v.check("opt", &json!("adam"), false).is_ok());
        assert!(v.check("opt", &json!(["adam", "sgd"]), false).is_ok());
        assert!(v.check("opt", &json!("rmsprop"), false).is_err());
    }

    #[test]
    fn test_keys() {
        let v = Validation {
            keys: Some(vec!["a".into(), "b".into()]),
            contains_keys: Some(vec!["a".into()]),
            ..Default::default()
        };
        assert!(v.check("d", &json!({"a": 1}), false).is_ok());
        assert!(v.check("d", &json!({"b": 1}), false).is_err());
        assert!(v.check("d", &json!({"a": 1, "c": 2}), false).is_err());
    }

    #[test]
    fn test_delay() {
        let v = Validation {
            gt: Some(10.0),
            delay: true,
            ..Default::default()
        };
        assert!(v.check("x", &json!(1), false).is_ok());
        assert!(v.check("x", &json!(1), true).is_err());
    }

    #[test]
    fn test_schema_check() {
        let v = Validation {
            min_items: Some(3),
            max_items: Some(1),
            ..Default::default()
        };
        assert!(v.validate_schema().is_err());
    }
}
