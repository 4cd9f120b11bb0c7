//! Hyperparameter spaces and search algorithms.
//!
//! Each [`HpParam`] variant carries only its own fields; the `is_*`
//! predicates classify a param without inspecting its values twice.

use chrono::{Duration, NaiveDate};
use indexmap::IndexMap;
use rand::Rng;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::lifecycle::EarlyStopping;
use crate::error::{Error, Result};
use crate::types::{parse_datetime, IoType};

/// `start:stop:step` numeric range (stop exclusive).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSpec {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

/// Date or datetime range; `step` is in days for dates, seconds for datetimes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateRangeSpec {
    pub start: String,
    pub stop: String,
    pub step: i64,
}

/// `linspace`/`logspace`/`geomspace` parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceSpec {
    pub start: f64,
    pub stop: f64,
    pub num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<f64>,
}

/// Uniform-family parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniformSpec {
    pub low: f64,
    pub high: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// Normal-family parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalSpec {
    pub loc: f64,
    pub scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// Spec fields given as a map, a positional list (`[0, 10, 2]`) or, when
/// `text` is set, a colon separated string (`"0:10:2"`).
fn positional<'de, D: Deserializer<'de>>(
    deserializer: D,
    names: &[&str],
    text: bool,
) -> std::result::Result<Map<String, Value>, D::Error> {
    let items: Vec<Value> = match Value::deserialize(deserializer)? {
        Value::Object(map) => return Ok(map),
        Value::Array(items) => items,
        Value::String(s) if text => s.split(':').map(|part| scalar(part.trim())).collect(),
        other => {
            return Err(D::Error::custom(format!(
                "expected a map or a list of [{}], got `{}`",
                names.join(", "),
                other
            )))
        }
    };
    if items.len() > names.len() {
        return Err(D::Error::custom(format!(
            "expected at most {} values ({}), got {}",
            names.len(),
            names.join(", "),
            items.len()
        )));
    }
    Ok(names.iter().map(|n| n.to_string()).zip(items).collect())
}

fn scalar(s: &str) -> Value {
    s.parse::<i64>()
        .map(Value::from)
        .or_else(|_| s.parse::<f64>().map(Value::from))
        .unwrap_or_else(|_| Value::String(s.to_string()))
}

fn field<T: DeserializeOwned, E: serde::de::Error>(
    map: &mut Map<String, Value>,
    name: &'static str,
) -> std::result::Result<T, E> {
    let value = map.remove(name).ok_or_else(|| E::missing_field(name))?;
    serde_json::from_value(value).map_err(|e| E::custom(format!("field `{}`: {}", name, e)))
}

fn optional_field<T: DeserializeOwned, E: serde::de::Error>(
    map: &mut Map<String, Value>,
    name: &'static str,
) -> std::result::Result<Option<T>, E> {
    match map.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| E::custom(format!("field `{}`: {}", name, e))),
    }
}

impl<'de> Deserialize<'de> for RangeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut map = positional(deserializer, &["start", "stop", "step"], true)?;
        Ok(Self {
            start: field(&mut map, "start")?,
            stop: field(&mut map, "stop")?,
            step: field(&mut map, "step")?,
        })
    }
}

impl<'de> Deserialize<'de> for DateRangeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // datetimes contain colons, so no string form
        let mut map = positional(deserializer, &["start", "stop", "step"], false)?;
        Ok(Self {
            start: field(&mut map, "start")?,
            stop: field(&mut map, "stop")?,
            step: field(&mut map, "step")?,
        })
    }
}

impl<'de> Deserialize<'de> for SpaceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut map = positional(deserializer, &["start", "stop", "num", "base"], true)?;
        Ok(Self {
            start: field(&mut map, "start")?,
            stop: field(&mut map, "stop")?,
            num: field(&mut map, "num")?,
            base: optional_field(&mut map, "base")?,
        })
    }
}

impl<'de> Deserialize<'de> for UniformSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut map = positional(deserializer, &["low", "high", "q", "size"], true)?;
        Ok(Self {
            low: field(&mut map, "low")?,
            high: field(&mut map, "high")?,
            q: optional_field(&mut map, "q")?,
            size: optional_field(&mut map, "size")?,
        })
    }
}

impl<'de> Deserialize<'de> for NormalSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut map = positional(deserializer, &["loc", "scale", "q", "size"], true)?;
        Ok(Self {
            loc: field(&mut map, "loc")?,
            scale: field(&mut map, "scale")?,
            q: optional_field(&mut map, "q")?,
            size: optional_field(&mut map, "size")?,
        })
    }
}

/// A single hyperparameter distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum HpParam {
    Choice(Vec<Value>),
    Pchoice(Vec<(Value, f64)>),
    Range(RangeSpec),
    Daterange(DateRangeSpec),
    Datetimerange(DateRangeSpec),
    Linspace(SpaceSpec),
    Logspace(SpaceSpec),
    Geomspace(SpaceSpec),
    Uniform(UniformSpec),
    Quniform(UniformSpec),
    Loguniform(UniformSpec),
    Qloguniform(UniformSpec),
    Normal(NormalSpec),
    Qnormal(NormalSpec),
    Lognormal(NormalSpec),
    Qlognormal(NormalSpec),
}

impl HpParam {
    pub fn kind(&self) -> &'static str {
        match self {
            HpParam::Choice(_) => "choice",
            HpParam::Pchoice(_) => "pchoice",
            HpParam::Range(_) => "range",
            HpParam::Daterange(_) => "daterange",
            HpParam::Datetimerange(_) => "datetimerange",
            HpParam::Linspace(_) => "linspace",
            HpParam::Logspace(_) => "logspace",
            HpParam::Geomspace(_) => "geomspace",
            HpParam::Uniform(_) => "uniform",
            HpParam::Quniform(_) => "quniform",
            HpParam::Loguniform(_) => "loguniform",
            HpParam::Qloguniform(_) => "qloguniform",
            HpParam::Normal(_) => "normal",
            HpParam::Qnormal(_) => "qnormal",
            HpParam::Lognormal(_) => "lognormal",
            HpParam::Qlognormal(_) => "qlognormal",
        }
    }

    pub fn is_distribution(&self) -> bool {
        matches!(
            self,
            HpParam::Pchoice(_)
                | HpParam::Uniform(_)
                | HpParam::Quniform(_)
                | HpParam::Loguniform(_)
                | HpParam::Qloguniform(_)
                | HpParam::Normal(_)
                | HpParam::Qnormal(_)
                | HpParam::Lognormal(_)
                | HpParam::Qlognormal(_)
        )
    }

    pub fn is_continuous(&self) -> bool {
        self.is_distribution() && !matches!(self, HpParam::Pchoice(_))
    }

    pub fn is_discrete(&self) -> bool {
        !self.is_continuous()
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            HpParam::Range(_) | HpParam::Daterange(_) | HpParam::Datetimerange(_)
        )
    }

    pub fn is_space(&self) -> bool {
        matches!(
            self,
            HpParam::Linspace(_) | HpParam::Logspace(_) | HpParam::Geomspace(_)
        )
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self, HpParam::Uniform(_))
    }

    pub fn is_categorical(&self) -> bool {
        match self {
            HpParam::Choice(values) => values.iter().any(|v| !v.is_number()),
            HpParam::Pchoice(values) => values.iter().any(|(v, _)| !v.is_number()),
            _ => false,
        }
    }

    /// IO types a matrix-bound input may declare for this param.
    pub fn accepts_type(&self, iotype: Option<IoType>) -> bool {
        let Some(iotype) = iotype else {
            return true;
        };
        match self {
            HpParam::Choice(_) | HpParam::Pchoice(_) => true,
            HpParam::Daterange(_) => matches!(iotype, IoType::Date | IoType::Str | IoType::Any),
            HpParam::Datetimerange(_) => {
                matches!(iotype, IoType::Datetime | IoType::Str | IoType::Any)
            }
            _ => iotype.is_numeric() || iotype == IoType::Any,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            HpParam::Choice(values) if values.is_empty() => {
                Err(Error::Schema("choice requires at least one value".into()))
            }
            HpParam::Pchoice(values) => {
                if values.is_empty() {
                    return Err(Error::Schema("pchoice requires at least one value".into()));
                }
                let mut total = 0.0;
                for (value, weight) in values {
                    if !(0.0..1.0).contains(weight) {
                        return Err(Error::Schema(format!(
                            "pchoice weight for {} must be in [0, 1), got {}",
                            value, weight
                        )));
                    }
                    total += weight;
                }
                if total > 1.0 + f64::EPSILON {
                    return Err(Error::Schema(format!(
                        "pchoice weights must sum to at most 1, got {}",
                        total
                    )));
                }
                Ok(())
            }
            HpParam::Range(range) => {
                if range.step == 0.0 || (range.stop - range.start) / range.step < 0.0 {
                    return Err(Error::Schema(format!(
                        "range {}:{}:{} is empty",
                        range.start, range.stop, range.step
                    )));
                }
                Ok(())
            }
            HpParam::Daterange(range) | HpParam::Datetimerange(range) => {
                if range.step <= 0 {
                    return Err(Error::Schema(format!("{} step must be positive", self.kind())));
                }
                let (start, stop) = self.date_bounds(range)?;
                if stop <= start {
                    return Err(Error::Schema(format!("{} stop must be after start", self.kind())));
                }
                Ok(())
            }
            HpParam::Linspace(space) | HpParam::Logspace(space) | HpParam::Geomspace(space) => {
                if space.num == 0 {
                    return Err(Error::Schema(format!("{} requires num > 0", self.kind())));
                }
                if matches!(self, HpParam::Geomspace(_)) && (space.start <= 0.0 || space.stop <= 0.0) {
                    return Err(Error::Schema("geomspace bounds must be positive".into()));
                }
                Ok(())
            }
            HpParam::Uniform(spec)
            | HpParam::Quniform(spec)
            | HpParam::Loguniform(spec)
            | HpParam::Qloguniform(spec) => {
                if spec.low >= spec.high {
                    return Err(Error::Schema(format!(
                        "{} requires low < high, got [{}, {}]",
                        self.kind(),
                        spec.low,
                        spec.high
                    )));
                }
                if matches!(self, HpParam::Quniform(_) | HpParam::Qloguniform(_)) {
                    require_q(self.kind(), spec.q)?;
                }
                Ok(())
            }
            HpParam::Normal(spec)
            | HpParam::Qnormal(spec)
            | HpParam::Lognormal(spec)
            | HpParam::Qlognormal(spec) => {
                if spec.scale <= 0.0 {
                    return Err(Error::Schema(format!("{} requires scale > 0", self.kind())));
                }
                if matches!(self, HpParam::Qnormal(_) | HpParam::Qlognormal(_)) {
                    require_q(self.kind(), spec.q)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Materialize every value of a discrete param.
    pub fn to_values(&self) -> Result<Vec<Value>> {
        match self {
            HpParam::Choice(values) => Ok(values.clone()),
            HpParam::Pchoice(values) => Ok(values.iter().map(|(v, _)| v.clone()).collect()),
            HpParam::Range(range) => {
                let mut values = Vec::new();
                let mut current = range.start;
                let ascending = range.step > 0.0;
                while (ascending && current < range.stop) || (!ascending && current > range.stop) {
                    values.push(number(current));
                    current += range.step;
                }
                Ok(values)
            }
            HpParam::Daterange(range) => {
                let (start, stop) = self.date_bounds(range)?;
                let mut values = Vec::new();
                let mut current = start;
                while current < stop {
                    values.push(Value::String(current.format("%Y-%m-%d").to_string()));
                    current += Duration::days(range.step);
                }
                Ok(values)
            }
            HpParam::Datetimerange(range) => {
                let (start, stop) = self.date_bounds(range)?;
                let mut values = Vec::new();
                let mut current = start;
                while current < stop {
                    values.push(Value::String(current.format("%Y-%m-%dT%H:%M:%S").to_string()));
                    current += Duration::seconds(range.step);
                }
                Ok(values)
            }
            HpParam::Linspace(space) => Ok(linspace(space.start, space.stop, space.num)
                .into_iter()
                .map(number)
                .collect()),
            HpParam::Logspace(space) => {
                let base = space.base.unwrap_or(10.0);
                Ok(linspace(space.start, space.stop, space.num)
                    .into_iter()
                    .map(|x| number(base.powf(x)))
                    .collect())
            }
            HpParam::Geomspace(space) => Ok(linspace(space.start.ln(), space.stop.ln(), space.num)
                .into_iter()
                .map(|x| number(x.exp()))
                .collect()),
            _ => Err(Error::Compiler(format!(
                "`{}` is a continuous distribution and has no finite values",
                self.kind()
            ))),
        }
    }

    /// Draw one value.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Value> {
        let value = match self {
            HpParam::Pchoice(values) => {
                let total: f64 = values.iter().map(|(_, w)| w).sum();
                let mut draw = rng.gen::<f64>() * total;
                let mut picked = values.last().map(|(v, _)| v.clone());
                for (value, weight) in values {
                    if draw < *weight {
                        picked = Some(value.clone());
                        break;
                    }
                    draw -= weight;
                }
                picked.unwrap_or(Value::Null)
            }
            HpParam::Uniform(spec) => number(rng.gen_range(spec.low..spec.high)),
            HpParam::Quniform(spec) => {
                number(quantize(rng.gen_range(spec.low..spec.high), spec.q))
            }
            HpParam::Loguniform(spec) => number(rng.gen_range(spec.low..spec.high).exp()),
            HpParam::Qloguniform(spec) => {
                number(quantize(rng.gen_range(spec.low..spec.high).exp(), spec.q))
            }
            HpParam::Normal(spec) => number(spec.loc + spec.scale * standard_normal(rng)),
            HpParam::Qnormal(spec) => {
                number(quantize(spec.loc + spec.scale * standard_normal(rng), spec.q))
            }
            HpParam::Lognormal(spec) => {
                number((spec.loc + spec.scale * standard_normal(rng)).exp())
            }
            HpParam::Qlognormal(spec) => number(quantize(
                (spec.loc + spec.scale * standard_normal(rng)).exp(),
                spec.q,
            )),
            discrete => {
                let values = discrete.to_values()?;
                if values.is_empty() {
                    return Err(Error::Compiler(format!("`{}` has no values", discrete.kind())));
                }
                values[rng.gen_range(0..values.len())].clone()
            }
        };
        Ok(value)
    }

    fn date_bounds(&self, range: &DateRangeSpec) -> Result<(chrono::NaiveDateTime, chrono::NaiveDateTime)> {
        let parse = |s: &str| -> Result<chrono::NaiveDateTime> {
            let parsed = match self {
                HpParam::Daterange(_) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0)),
                _ => parse_datetime(s),
            };
            parsed.ok_or_else(|| {
                Error::Schema(format!("{} bound `{}` is not a valid date", self.kind(), s))
            })
        };
        Ok((parse(&range.start)?, parse(&range.stop)?))
    }
}

fn require_q(kind: &str, q: Option<f64>) -> Result<()> {
    match q {
        Some(q) if q > 0.0 => Ok(()),
        _ => Err(Error::Schema(format!("{} requires a positive q", kind))),
    }
}

fn quantize(x: f64, q: Option<f64>) -> f64 {
    match q {
        Some(q) if q > 0.0 => (x / q).round() * q,
        _ => x,
    }
}

/// Box-Muller transform.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn linspace(start: f64, stop: f64, num: u32) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Integral floats become JSON integers.
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

/// Grid search over discrete params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSearch {
    pub params: IndexMap<String, HpParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, alias = "num_runs", skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<u32>,
    #[serde(default, alias = "early_stopping", skip_serializing_if = "Vec::is_empty")]
    pub early_stopping: Vec<EarlyStopping>,
}

/// Random search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomSearch {
    pub params: IndexMap<String, HpParam>,
    #[serde(alias = "num_runs")]
    pub num_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, alias = "early_stopping", skip_serializing_if = "Vec::is_empty")]
    pub early_stopping: Vec<EarlyStopping>,
}

/// Explicit list of param sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSearch {
    pub values: Vec<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, alias = "early_stopping", skip_serializing_if = "Vec::is_empty")]
    pub early_stopping: Vec<EarlyStopping>,
}

/// Tuner-driven searches; iterations are produced by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunerSearch {
    pub params: IndexMap<String, HpParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, alias = "num_runs", skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, alias = "early_stopping", skip_serializing_if = "Vec::is_empty")]
    pub early_stopping: Vec<EarlyStopping>,
    /// Algorithm-specific settings (`maxIterations`, `eta`, `metric`, ...).
    #[serde(flatten)]
    pub settings: IndexMap<String, Value>,
}

/// A matrix: the search algorithm and its param space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matrix {
    /// `choice` names the same exhaustive search over discrete params.
    #[serde(alias = "choice")]
    Grid(GridSearch),
    Random(RandomSearch),
    Mapping(MappingSearch),
    Hyperband(TunerSearch),
    Bayes(TunerSearch),
    Hyperopt(TunerSearch),
    Iterative(TunerSearch),
}

impl Matrix {
    pub fn kind(&self) -> &'static str {
        match self {
            Matrix::Grid(_) => "grid",
            Matrix::Random(_) => "random",
            Matrix::Mapping(_) => "mapping",
            Matrix::Hyperband(_) => "hyperband",
            Matrix::Bayes(_) => "bayes",
            Matrix::Hyperopt(_) => "hyperopt",
            Matrix::Iterative(_) => "iterative",
        }
    }

    /// Param space, empty for mappings.
    pub fn params(&self) -> Option<&IndexMap<String, HpParam>> {
        match self {
            Matrix::Grid(m) => Some(&m.params),
            Matrix::Random(m) => Some(&m.params),
            Matrix::Mapping(_) => None,
            Matrix::Hyperband(m) | Matrix::Bayes(m) | Matrix::Hyperopt(m) | Matrix::Iterative(m) => {
                Some(&m.params)
            }
        }
    }

    /// Names of the inputs the matrix binds.
    pub fn param_names(&self) -> Vec<String> {
        match self {
            Matrix::Mapping(m) => {
                let mut names: Vec<String> = Vec::new();
                for set in &m.values {
                    for key in set.keys() {
                        if !names.contains(key) {
                            names.push(key.clone());
                        }
                    }
                }
                names
            }
            other => other
                .params()
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn concurrency(&self) -> Option<u32> {
        match self {
            Matrix::Grid(m) => m.concurrency,
            Matrix::Random(m) => m.concurrency,
            Matrix::Mapping(m) => m.concurrency,
            Matrix::Hyperband(m) | Matrix::Bayes(m) | Matrix::Hyperopt(m) | Matrix::Iterative(m) => {
                m.concurrency
            }
        }
    }

    pub fn early_stopping(&self) -> &[EarlyStopping] {
        match self {
            Matrix::Grid(m) => &m.early_stopping,
            Matrix::Random(m) => &m.early_stopping,
            Matrix::Mapping(m) => &m.early_stopping,
            Matrix::Hyperband(m) | Matrix::Bayes(m) | Matrix::Hyperopt(m) | Matrix::Iterative(m) => {
                &m.early_stopping
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(params) = self.params() {
            for (name, param) in params {
                param
                    .validate()
                    .map_err(|e| e.at(&format!("matrix.params[{}]", name)))?;
            }
        }
        match self {
            Matrix::Grid(grid) => {
                for (name, param) in &grid.params {
                    if param.is_continuous() {
                        return Err(Error::Schema(format!(
                            "grid search param `{}` uses continuous distribution `{}`",
                            name,
                            param.kind()
                        )));
                    }
                }
            }
            Matrix::Random(random) if random.num_runs == 0 => {
                return Err(Error::Schema("random search requires numRuns > 0".into()));
            }
            Matrix::Mapping(mapping) if mapping.values.is_empty() => {
                return Err(Error::Schema("mapping requires at least one value set".into()));
            }
            _ => {}
        }
        for stopping in self.early_stopping() {
            stopping.validate()?;
        }
        Ok(())
    }

    /// Produce the param sets of every trial for locally expandable kinds.
    pub fn suggestions<R: Rng>(&self, rng: &mut R) -> Result<Vec<IndexMap<String, Value>>> {
        match self {
            Matrix::Grid(grid) => {
                let mut suggestions = vec![IndexMap::new()];
                for (name, param) in &grid.params {
                    let values = param.to_values()?;
                    let mut next = Vec::with_capacity(suggestions.len() * values.len());
                    for suggestion in &suggestions {
                        for value in &values {
                            let mut s: IndexMap<String, Value> = suggestion.clone();
                            s.insert(name.clone(), value.clone());
                            next.push(s);
                        }
                    }
                    suggestions = next;
                }
                if let Some(limit) = grid.num_runs {
                    suggestions.truncate(limit as usize);
                }
                Ok(suggestions)
            }
            Matrix::Random(random) => {
                let mut seeded;
                let rng: &mut dyn rand::RngCore = match random.seed {
                    Some(seed) => {
                        seeded = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(seed);
                        &mut seeded
                    }
                    None => rng,
                };
                (0..random.num_runs)
                    .map(|_| {
                        random
                            .params
                            .iter()
                            .map(|(name, param)| Ok((name.clone(), param.sample(rng)?)))
                            .collect::<Result<IndexMap<_, _>>>()
                    })
                    .collect()
            }
            Matrix::Mapping(mapping) => Ok(mapping.values.clone()),
            tuner => Err(Error::Compiler(format!(
                "`{}` matrix iterations are produced by the tuner",
                tuner.kind()
            ))),
        }
    }
}
