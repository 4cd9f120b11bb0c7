//! Init directives: work that runs before the main container.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connections::GitSchema;
use crate::error::{Error, Result};
use crate::k8s::Container;

/// Files and directories to pull from a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsInit {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
}

impl ArtifactsInit {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Dockerfile generation spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerfileInit {
    pub image: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copy: Vec<Value>,
    #[serde(default, alias = "post_run_copy", skip_serializing_if = "Vec::is_empty")]
    pub post_run_copy: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,
    #[serde(default, alias = "lang_env", skip_serializing_if = "Option::is_none")]
    pub lang_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, alias = "workdir_path", skip_serializing_if = "Option::is_none")]
    pub workdir_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl DockerfileInit {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("Dockerfile")
    }
}

/// A literal file to materialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Octal mode string, e.g. `+x` or `755`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chmod: Option<String>,
}

impl FileInit {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("file")
    }
}

/// Tensorboard launcher spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorboardInit {
    #[serde(default)]
    pub uuids: Vec<String>,
    #[serde(default, alias = "use_names", skip_serializing_if = "std::ops::Not::not")]
    pub use_names: bool,
    #[serde(default, alias = "path_prefix", skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,
}

/// The single directive an [`Init`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDirective {
    /// Pull `artifacts` or `paths` from a store connection.
    Store,
    /// Clone a repository (inline override, possibly on a git connection).
    Git,
    Dockerfile,
    File,
    Tensorboard,
    /// A bare connection; resolved to git or store by its kind.
    Connection,
    /// A user-provided container.
    Custom,
}

/// An init directive attached to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Init {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsInit>,
    /// Explicit `[from, to]` or single-path entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<DockerfileInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorboard: Option<TensorboardInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Mount target override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

impl Init {
    pub fn store(connection: Option<&str>, artifacts: ArtifactsInit) -> Self {
        Self {
            artifacts: Some(artifacts),
            connection: connection.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn has_artifacts_or_paths(&self) -> bool {
        self.artifacts.as_ref().map(|a| !a.is_empty()).unwrap_or(false)
            || self.paths.as_ref().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// Resolve the directive, failing when more than one is set.
    pub fn directive(&self) -> Result<InitDirective> {
        let mut directives = Vec::new();
        if self.artifacts.is_some() || self.paths.is_some() {
            directives.push(InitDirective::Store);
        }
        if self.git.is_some() {
            directives.push(InitDirective::Git);
        }
        if self.dockerfile.is_some() {
            directives.push(InitDirective::Dockerfile);
        }
        if self.file.is_some() {
            directives.push(InitDirective::File);
        }
        if self.tensorboard.is_some() {
            directives.push(InitDirective::Tensorboard);
        }
        match directives.as_slice() {
            [] if self.connection.is_some() => Ok(InitDirective::Connection),
            [] if self.container.is_some() => Ok(InitDirective::Custom),
            [] => Err(Error::Schema(
                "init requires one of artifacts, paths, git, dockerfile, file, tensorboard, connection or container".into(),
            )),
            [directive] => Ok(*directive),
            _ => Err(Error::Schema(format!(
                "init accepts only one directive, got {:?}",
                directives
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let directive = self.directive()?;
        if let Some(paths) = &self.paths {
            for path in paths {
                let ok = match path {
                    Value::String(_) => true,
                    Value::Array(pair) => pair.len() == 2 && pair.iter().all(Value::is_string),
                    _ => false,
                };
                if !ok {
                    return Err(Error::Schema(format!(
                        "init paths entries must be a path or a [from, to] pair, got {}",
                        path
                    )));
                }
            }
        }
        if directive == InitDirective::Dockerfile {
            if let Some(dockerfile) = &self.dockerfile {
                if dockerfile.image.trim().is_empty() {
                    return Err(Error::Schema("dockerfile init requires an image".into()));
                }
            }
        }
        Ok(())
    }

    /// Flatten `paths` into `(from, to)` pairs; `to` is `None` for plain paths.
    pub fn path_pairs(&self) -> Vec<(String, Option<String>)> {
        self.paths
            .iter()
            .flatten()
            .filter_map(|path| match path {
                Value::String(p) => Some((p.clone(), None)),
                Value::Array(pair) => {
                    let from = pair.first()?.as_str()?.to_string();
                    let to = pair.get(1)?.as_str()?.to_string();
                    Some((from, Some(to)))
                }
                _ => None,
            })
            .collect()
    }
}
