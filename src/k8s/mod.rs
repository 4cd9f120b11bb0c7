//! Container-runtime resource model.
//!
//! A minimal, serializable subset of the Kubernetes core API: enough to
//! describe pods with init containers, sidecars, env and volumes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A container specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, alias = "image_pull_policy", skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, alias = "working_dir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, alias = "env_from", skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default, alias = "volume_mounts", skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, alias = "security_context", skip_serializing_if = "Option::is_none")]
    pub security_context: Option<Value>,
}

impl Container {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a mount unless one already targets the same path.
    pub fn add_mount(&mut self, mount: VolumeMount) {
        if !self.volume_mounts.iter().any(|m| m.mount_path == mount.mount_path) {
            self.volume_mounts.push(mount);
        }
    }

    /// Add an env var, replacing any previous var with the same name.
    pub fn set_env(&mut self, var: EnvVar) {
        if let Some(existing) = self.env.iter_mut().find(|e| e.name == var.name) {
            *existing = var;
        } else {
            self.env.push(var);
        }
    }

    pub fn get_env(&self, name: &str) -> Option<&EnvVar> {
        self.env.iter().find(|e| e.name == name)
    }
}

/// An environment variable, literal or projected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "value_from", skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn from_secret(name: impl Into<String>, secret: &str, key: &str) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(KeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                }),
                ..Default::default()
            }),
        }
    }

    pub fn from_config_map(name: impl Into<String>, config_map: &str, key: &str) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(KeySelector {
                    name: config_map.to_string(),
                    key: key.to_string(),
                }),
                ..Default::default()
            }),
        }
    }

    pub fn from_field(name: impl Into<String>, field_path: &str) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(FieldSelector {
                    field_path: field_path.to_string(),
                }),
                ..Default::default()
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_ref: Option<FieldSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    pub field_path: String,
}

/// Bulk env projection from a secret or config map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NameRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<NameRef>,
}

impl EnvFromSource {
    pub fn secret(name: &str) -> Self {
        Self {
            secret_ref: Some(NameRef { name: name.to_string() }),
            config_map_ref: None,
        }
    }

    pub fn config_map(name: &str) -> Self {
        Self {
            secret_ref: None,
            config_map_ref: Some(NameRef { name: name.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    #[serde(alias = "mount_path")]
    pub mount_path: String,
    #[serde(default, alias = "sub_path", skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default, alias = "read_only", skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            sub_path: None,
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// A pod volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    EmptyDir {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        medium: Option<String>,
    },
    Secret {
        #[serde(rename = "secretName")]
        secret_name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        items: Vec<KeyToPath>,
    },
    ConfigMap {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        items: Vec<KeyToPath>,
    },
    PersistentVolumeClaim {
        #[serde(rename = "claimName")]
        claim_name: String,
        #[serde(rename = "readOnly", default)]
        read_only: bool,
    },
    HostPath {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyToPath {
    pub key: String,
    pub path: String,
}

impl Volume {
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::EmptyDir { medium: None },
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::EmptyDir {
                medium: Some("Memory".to_string()),
            },
        }
    }

    pub fn secret(name: impl Into<String>, secret_name: &str, items: &[String]) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::Secret {
                secret_name: secret_name.to_string(),
                items: key_paths(items),
            },
        }
    }

    pub fn config_map(name: impl Into<String>, config_map: &str, items: &[String]) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::ConfigMap {
                name: config_map.to_string(),
                items: key_paths(items),
            },
        }
    }

    pub fn claim(name: impl Into<String>, claim_name: &str, read_only: bool) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::PersistentVolumeClaim {
                claim_name: claim_name.to_string(),
                read_only,
            },
        }
    }

    pub fn host_path(name: impl Into<String>, path: &str) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::HostPath {
                path: path.to_string(),
            },
        }
    }
}

fn key_paths(items: &[String]) -> Vec<KeyToPath> {
    items
        .iter()
        .map(|key| KeyToPath {
            key: key.clone(),
            path: key.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub limits: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub requests: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(alias = "container_port")]
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Object metadata for generated resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
}

/// Pod specification produced by the converter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_selector: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<NameRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl PodSpec {
    /// Add a volume unless one with the same name exists.
    pub fn add_volume(&mut self, volume: Volume) {
        if !self.volumes.iter().any(|v| v.name == volume.name) {
            self.volumes.push(volume);
        }
    }

    pub fn main_container(&self) -> Option<&Container> {
        self.containers.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_serialization() {
        let volume = Volume::secret("aws", "aws-secret", &["key".to_string()]);
        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(json["name"], "aws");
        assert_eq!(json["secret"]["secretName"], "aws-secret");
        assert_eq!(json["secret"]["items"][0]["key"], "key");

        let volume = Volume::empty_dir("ctx");
        let json = serde_json::to_value(&volume).unwrap();
        assert!(json["emptyDir"].is_object());
    }

    #[test]
    fn test_env_from_secret() {
        let env = EnvVar::from_secret("TOKEN", "plx-secret", "token");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["valueFrom"]["secretKeyRef"]["name"], "plx-secret");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_container_dedupes_mounts_and_env() {
        let mut container = Container::named("main");
        container.add_mount(VolumeMount::new("a", "/data"));
        container.add_mount(VolumeMount::new("b", "/data"));
        assert_eq!(container.volume_mounts.len(), 1);

        container.set_env(EnvVar::new("X", "1"));
        container.set_env(EnvVar::new("X", "2"));
        assert_eq!(container.env.len(), 1);
        assert_eq!(container.get_env("X").unwrap().value.as_deref(), Some("2"));
    }

    #[test]
    fn test_container_from_yaml() {
        let container: Container = serde_yaml::from_str(
            r#"
image: python:3.11
command: [python, train.py]
args: ["--lr=0.1"]
working_dir: /code
resources:
  limits:
    cpu: 1
"#,
        )
        .unwrap();
        assert_eq!(container.image.as_deref(), Some("python:3.11"));
        assert_eq!(container.working_dir.as_deref(), Some("/code"));
        assert_eq!(container.resources.unwrap().limits["cpu"], 1);
    }
}
