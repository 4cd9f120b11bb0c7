//! Dotted reference AST.
//!
//! References such as `ops.train.outputs.loss` are parsed once into a
//! [`ContextRef`] and shared by the param resolver and the DAG planner.

use std::fmt;

use crate::error::{Error, Result};

/// The kind of entity a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefEntity {
    Ops,
    Runs,
    Dag,
    Pipeline,
    Joins,
}

impl RefEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefEntity::Ops => "ops",
            RefEntity::Runs => "runs",
            RefEntity::Dag => "dag",
            RefEntity::Pipeline => "pipeline",
            RefEntity::Joins => "joins",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ops" => Some(RefEntity::Ops),
            "runs" => Some(RefEntity::Runs),
            "dag" => Some(RefEntity::Dag),
            "pipeline" => Some(RefEntity::Pipeline),
            "joins" => Some(RefEntity::Joins),
            _ => None,
        }
    }

    /// Entities that must be followed by a name.
    fn requires_name(&self) -> bool {
        matches!(self, RefEntity::Ops | RefEntity::Runs | RefEntity::Joins)
    }
}

/// Section of an entity a reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefSection {
    Inputs,
    Outputs,
    Globals,
    Artifacts,
    Io,
    Status,
}

impl RefSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefSection::Inputs => "inputs",
            RefSection::Outputs => "outputs",
            RefSection::Globals => "globals",
            RefSection::Artifacts => "artifacts",
            RefSection::Io => "io",
            RefSection::Status => "status",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "inputs" => Some(RefSection::Inputs),
            "outputs" => Some(RefSection::Outputs),
            "globals" => Some(RefSection::Globals),
            "artifacts" => Some(RefSection::Artifacts),
            "io" => Some(RefSection::Io),
            "status" => Some(RefSection::Status),
            _ => None,
        }
    }

    /// Sections addressed as a whole, without a field.
    fn is_terminal(&self) -> bool {
        matches!(self, RefSection::Artifacts | RefSection::Io | RefSection::Status)
    }
}

/// An entity reference: `ops.<name>`, `runs.<uuid>`, `dag`, `joins.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity: RefEntity,
    pub name: Option<String>,
}

impl EntityRef {
    pub fn parse(reference: &str) -> Result<Self> {
        Self::split(reference).map(|(entity, _)| entity)
    }

    /// Split a reference into its entity and the dotted path that follows:
    /// `ops.A.outputs.loss` gives `ops.A` and `outputs.loss`.
    pub fn split(reference: &str) -> Result<(Self, Option<&str>)> {
        let reference = reference.trim();
        let (head, rest) = match reference.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (reference, None),
        };
        let entity = RefEntity::parse(head)
            .ok_or_else(|| Error::Validation(format!("unsupported reference `{}`", reference)))?;
        let (name, rest) = if entity.requires_name() {
            match rest.map(|r| r.split_once('.')) {
                Some(Some((name, rest))) => (Some(name), Some(rest)),
                Some(None) => (rest, None),
                None => (None, None),
            }
        } else {
            (None, rest)
        };
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        if entity.requires_name() && name.is_none() {
            return Err(Error::Validation(format!(
                "reference `{}` must name the {} entity",
                reference,
                entity.as_str()
            )));
        }
        let rest = rest.map(str::trim).filter(|r| !r.is_empty());
        Ok((
            Self {
                entity,
                name: name.map(str::to_string),
            },
            rest,
        ))
    }

    pub fn ops(name: impl Into<String>) -> Self {
        Self {
            entity: RefEntity::Ops,
            name: Some(name.into()),
        }
    }

    /// The referenced operation name, for `ops.<name>` refs.
    pub fn op_name(&self) -> Option<&str> {
        match self.entity {
            RefEntity::Ops => self.name.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}.{}", self.entity.as_str(), name),
            None => write!(f, "{}", self.entity.as_str()),
        }
    }
}

/// A fully qualified reference: entity, section and optional field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextRef {
    pub entity: EntityRef,
    pub section: RefSection,
    pub field: Option<String>,
}

impl ContextRef {
    /// Build from a param's `ref` and `value`. The section comes from the
    /// value (`ref: ops.A`, `value: outputs.loss`) unless the ref already
    /// carries it (`ref: ops.A.outputs.loss`).
    pub fn from_param(reference: &str, value: &str) -> Result<Self> {
        let (entity, rest) = EntityRef::split(reference)?;
        let value = strip_braces(value);
        let path = match rest {
            Some(rest) => rest,
            None => match ContextRef::parse(value) {
                Ok(full) if full.entity == entity => return Ok(full),
                _ => value,
            },
        };
        let (section, field) = parse_section(path).ok_or_else(|| {
            Error::Validation(format!(
                "param reference `{}` has an invalid value `{}`",
                reference, path
            ))
        })?;
        Ok(Self {
            entity,
            section,
            field,
        })
    }

    /// Parse a fully dotted reference, e.g. `ops.A.outputs.loss` or `dag.inputs.x`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = strip_braces(reference);
        let invalid = || Error::Validation(format!("invalid context reference `{}`", reference));
        let (head, rest) = reference.split_once('.').ok_or_else(invalid)?;
        let entity = RefEntity::parse(head).ok_or_else(invalid)?;
        let (name, rest) = if entity.requires_name() {
            let (name, rest) = rest.split_once('.').ok_or_else(invalid)?;
            (Some(name.to_string()), rest)
        } else {
            (None, rest)
        };
        let (section, field) = parse_section(rest).ok_or_else(invalid)?;
        Ok(Self {
            entity: EntityRef { entity, name },
            section,
            field,
        })
    }

    /// Key used in the DAG context table.
    pub fn key(&self) -> String {
        match &self.field {
            Some(field) => format!("{}.{}.{}", self.entity, self.section.as_str(), field),
            None => format!("{}.{}", self.entity, self.section.as_str()),
        }
    }

    /// Path relative to the entity, as a template would address it.
    pub fn value_path(&self) -> String {
        match &self.field {
            Some(field) => format!("{}.{}", self.section.as_str(), field),
            None => self.section.as_str().to_string(),
        }
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn strip_braces(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(s)
}

fn parse_section(s: &str) -> Option<(RefSection, Option<String>)> {
    let (section, field) = match s.split_once('.') {
        Some((section, field)) => (section, Some(field)),
        None => (s, None),
    };
    let section = RefSection::parse(section.trim())?;
    let field = field.map(str::trim).filter(|f| !f.is_empty());
    if field.is_none() && !section.is_terminal() {
        return None;
    }
    Some((section, field.map(str::to_string)))
}
