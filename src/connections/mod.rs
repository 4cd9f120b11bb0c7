//! Connections: named handles to external storage and VCS.
//!
//! A connection carries a kind, a kind-specific schema, and optional
//! secret / config-map references that the converter projects into
//! containers as env vars or volume mounts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::k8s::EnvVar;

/// Connection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    S3,
    Gcs,
    Wasb,
    VolumeClaim,
    HostPath,
    Git,
    Ssh,
    Registry,
    Custom,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::S3 => "s3",
            ConnectionKind::Gcs => "gcs",
            ConnectionKind::Wasb => "wasb",
            ConnectionKind::VolumeClaim => "volume_claim",
            ConnectionKind::HostPath => "host_path",
            ConnectionKind::Git => "git",
            ConnectionKind::Ssh => "ssh",
            ConnectionKind::Registry => "registry",
            ConnectionKind::Custom => "custom",
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, ConnectionKind::S3 | ConnectionKind::Gcs | ConnectionKind::Wasb)
    }

    pub fn is_mount(&self) -> bool {
        matches!(self, ConnectionKind::VolumeClaim | ConnectionKind::HostPath)
    }

    /// Kinds that can serve as an artifacts store.
    pub fn is_artifact_store(&self) -> bool {
        self.is_bucket() || self.is_mount()
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named secret or config map reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub name: String,
    /// Subset of keys to project; empty means all keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, alias = "mount_path", skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, alias = "is_requested", skip_serializing_if = "std::ops::Not::not")]
    pub is_requested: bool,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Projected as a volume mount.
    pub fn is_mounted(&self) -> bool {
        self.mount_path.is_some()
    }

    /// Projected wholesale via `envFrom`.
    pub fn is_env_from(&self) -> bool {
        self.mount_path.is_none() && self.items.is_empty()
    }

    /// Volume name used when the resource is mounted.
    pub fn volume_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.name)
    }
}

/// Bucket schema for s3/gcs/wasb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSchema {
    pub bucket: String,
}

/// Mount schema for volume claims and host paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSchema {
    #[serde(default, alias = "volume_claim", skip_serializing_if = "Option::is_none")]
    pub volume_claim: Option<String>,
    #[serde(default, alias = "host_path", skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, alias = "mount_path")]
    pub mount_path: String,
    #[serde(default, alias = "read_only")]
    pub read_only: bool,
}

/// Git repository schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitSchema {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl GitSchema {
    pub fn is_ssh(&self) -> bool {
        self.url
            .as_deref()
            .map(|url| url.starts_with("git@") || url.starts_with("ssh://"))
            .unwrap_or(false)
    }

    /// Repository name derived from the url (`org/repo.git` -> `repo`).
    pub fn repo_name(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim_end_matches('/');
        let last = url.rsplit(['/', ':']).next()?;
        let name = last.trim_end_matches(".git");
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Overlay `other` onto this schema (inline git init overrides).
    pub fn patch(&self, other: &GitSchema) -> GitSchema {
        GitSchema {
            url: other.url.clone().or_else(|| self.url.clone()),
            revision: other.revision.clone().or_else(|| self.revision.clone()),
            flags: if other.flags.is_empty() {
                self.flags.clone()
            } else {
                other.flags.clone()
            },
        }
    }
}

/// Kind-specific schema, resolved from a connection's raw `schema`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSchema {
    Bucket(BucketSchema),
    Claim(ClaimSchema),
    Git(GitSchema),
    Custom(Value),
}

/// A named connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub name: String,
    pub kind: ConnectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ResourceRef>,
    #[serde(default, alias = "config_map", skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl Connection {
    pub fn bucket(name: impl Into<String>, kind: ConnectionKind, bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            tags: vec![],
            schema: Some(serde_json::json!({ "bucket": bucket.into() })),
            secret: None,
            config_map: None,
            env: vec![],
        }
    }

    pub fn claim(name: impl Into<String>, volume_claim: &str, mount_path: &str) -> Self {
        Self {
            name: name.into(),
            kind: ConnectionKind::VolumeClaim,
            description: None,
            tags: vec![],
            schema: Some(serde_json::json!({
                "volumeClaim": volume_claim,
                "mountPath": mount_path,
            })),
            secret: None,
            config_map: None,
            env: vec![],
        }
    }

    pub fn git(name: impl Into<String>, url: &str) -> Self {
        Self {
            name: name.into(),
            kind: ConnectionKind::Git,
            description: None,
            tags: vec![],
            schema: Some(serde_json::json!({ "url": url })),
            secret: None,
            config_map: None,
            env: vec![],
        }
    }

    pub fn with_secret(mut self, secret: ResourceRef) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Resolve the typed schema for this connection's kind.
    pub fn typed_schema(&self) -> Result<ConnectionSchema> {
        let raw = self.schema.clone().unwrap_or(Value::Object(Default::default()));
        let schema_err = |e: serde_json::Error| {
            Error::Schema(format!(
                "connection `{}` has an invalid `{}` schema: {}",
                self.name, self.kind, e
            ))
        };
        match self.kind {
            ConnectionKind::S3 | ConnectionKind::Gcs | ConnectionKind::Wasb => {
                let schema: BucketSchema = serde_json::from_value(raw).map_err(schema_err)?;
                Ok(ConnectionSchema::Bucket(schema))
            }
            ConnectionKind::VolumeClaim | ConnectionKind::HostPath => {
                let schema: ClaimSchema = serde_json::from_value(raw).map_err(schema_err)?;
                Ok(ConnectionSchema::Claim(schema))
            }
            ConnectionKind::Git => {
                let schema: GitSchema = serde_json::from_value(raw).map_err(schema_err)?;
                Ok(ConnectionSchema::Git(schema))
            }
            ConnectionKind::Ssh | ConnectionKind::Registry | ConnectionKind::Custom => {
                Ok(ConnectionSchema::Custom(raw))
            }
        }
    }

    /// Validate per-kind invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Schema("connection name is required".into()));
        }
        match self.typed_schema()? {
            ConnectionSchema::Bucket(schema) => {
                if schema.bucket.trim().is_empty() {
                    return Err(Error::Schema(format!(
                        "connection `{}` of kind `{}` requires a non-empty bucket",
                        self.name, self.kind
                    )));
                }
            }
            ConnectionSchema::Claim(schema) => {
                if schema.mount_path.trim().is_empty() {
                    return Err(Error::Schema(format!(
                        "connection `{}` of kind `{}` requires a mount path",
                        self.name, self.kind
                    )));
                }
                match self.kind {
                    ConnectionKind::VolumeClaim if schema.volume_claim.is_none() => {
                        return Err(Error::Schema(format!(
                            "connection `{}` requires a volume claim name",
                            self.name
                        )));
                    }
                    ConnectionKind::HostPath if schema.host_path.is_none() => {
                        return Err(Error::Schema(format!(
                            "connection `{}` requires a host path",
                            self.name
                        )));
                    }
                    _ => {}
                }
            }
            ConnectionSchema::Git(_) | ConnectionSchema::Custom(_) => {}
        }
        Ok(())
    }

    pub fn is_bucket(&self) -> bool {
        self.kind.is_bucket()
    }

    pub fn is_mount(&self) -> bool {
        self.kind.is_mount()
    }

    pub fn is_git(&self) -> bool {
        self.kind == ConnectionKind::Git
    }

    /// Root path of the store: the bucket uri or the mount path.
    pub fn store_path(&self) -> Option<String> {
        match self.typed_schema().ok()? {
            ConnectionSchema::Bucket(schema) => Some(schema.bucket.trim_end_matches('/').to_string()),
            ConnectionSchema::Claim(schema) => Some(schema.mount_path.trim_end_matches('/').to_string()),
            _ => None,
        }
    }

    pub fn git_schema(&self) -> Option<GitSchema> {
        match self.typed_schema().ok()? {
            ConnectionSchema::Git(schema) => Some(schema),
            _ => None,
        }
    }

    /// Catalog entry: what containers learn about this connection.
    pub fn catalog_entry(&self) -> Value {
        let mut entry = serde_json::json!({
            "name": self.name,
            "kind": self.kind,
        });
        if let Some(schema) = &self.schema {
            entry["schema"] = schema.clone();
        }
        if let Some(secret) = &self.secret {
            entry["secret"] = serde_json::json!({
                "name": secret.name,
                "mountPath": secret.mount_path,
            });
        }
        if let Some(config_map) = &self.config_map {
            entry["configMap"] = serde_json::json!({
                "name": config_map.name,
                "mountPath": config_map.mount_path,
            });
        }
        entry
    }

    /// Connection-specific env vars: declared env plus keyed secret/config-map items.
    pub fn env_vars(&self) -> Vec<EnvVar> {
        let mut env = self.env.clone();
        if let Some(secret) = &self.secret {
            if !secret.is_mounted() {
                for key in &secret.items {
                    env.push(EnvVar::from_secret(key.clone(), &secret.name, key));
                }
            }
        }
        if let Some(config_map) = &self.config_map {
            if !config_map.is_mounted() {
                for key in &config_map.items {
                    env.push(EnvVar::from_config_map(key.clone(), &config_map.name, key));
                }
            }
        }
        env
    }

    /// Context exposed to templates as `connections.<name>`.
    pub fn template_context(&self) -> Value {
        let mut context = self.catalog_entry();
        if let Some(path) = self.store_path() {
            context["storePath"] = Value::String(path);
        }
        context
    }
}
