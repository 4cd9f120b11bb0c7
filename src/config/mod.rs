//! Configuration management.
//!
//! polyflow configuration comes from:
//! - Config file (~/.config/polyflow/config.toml)
//! - Environment variables (POLYAXON_*, HTTP(S)_PROXY, NO_PROXY, SSH_PATH)
//!
//! Environment variables win. The loaded value is immutable; reloading
//! means calling [`Config::load_from_path`] again.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{AgentSettings, KubeSettings};
use crate::connections::{Connection, ResourceRef};
use crate::converter::{ConverterSettings, RuntimeTarget, DEFAULT_INIT_IMAGE, DEFAULT_SIDECAR_IMAGE};
use crate::error::{Error, Result};

/// polyflow configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Control plane client and run-side switches
    #[serde(default)]
    pub client: ClientConfig,

    /// Reconcile agent
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Control plane client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Control plane URL
    #[serde(default)]
    pub host: Option<String>,

    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Run without reaching the API
    #[serde(default)]
    pub no_api: bool,

    #[serde(default)]
    pub is_offline: bool,

    /// Accept every runtime call without executing it
    #[serde(default)]
    pub no_op: bool,

    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub http_proxy: Option<String>,

    #[serde(default)]
    pub https_proxy: Option<String>,

    #[serde(default)]
    pub no_proxy: Option<String>,

    /// `owner.project.runs.uuid` when running inside a run
    #[serde(default)]
    pub run_instance: Option<String>,

    #[serde(default)]
    pub collect_artifacts: Option<bool>,

    #[serde(default)]
    pub collect_resources: Option<bool>,

    /// Mounted SSH material for git inits
    #[serde(default)]
    pub ssh_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            token: None,
            timeout_secs: default_timeout_secs(),
            no_api: false,
            is_offline: false,
            no_op: false,
            log_level: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            run_instance: None,
            collect_artifacts: None,
            collect_resources: None,
            ssh_path: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Reconcile agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// `owner.agents.id`
    #[serde(default)]
    pub instance: Option<String>,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_sleep_stop_time_secs")]
    pub sleep_stop_time_secs: u64,

    #[serde(default = "default_sleep_archived_time_secs")]
    pub sleep_archived_time_secs: u64,

    /// Defaults to the data directory
    #[serde(default)]
    pub heartbeat_path: Option<PathBuf>,

    #[serde(default = "default_heartbeat_freshness_secs")]
    pub heartbeat_freshness_secs: u64,

    /// kubernetes | docker
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Kubernetes API server; in-cluster discovery when unset
    #[serde(default)]
    pub kube_api: Option<String>,

    #[serde(default)]
    pub kube_token_path: Option<PathBuf>,

    #[serde(default)]
    pub kube_ca_path: Option<PathBuf>,

    /// Secret with the service token for platform containers
    #[serde(default)]
    pub auth_secret: Option<String>,

    #[serde(default = "default_init_image")]
    pub init_image: String,

    #[serde(default = "default_sidecar_image")]
    pub sidecar_image: String,

    /// Sidecar sleep interval (seconds)
    #[serde(default = "default_sidecar_interval")]
    pub sleep_interval: u64,

    /// Sidecar sync interval (seconds)
    #[serde(default = "default_sidecar_interval")]
    pub sync_interval: u64,

    /// Name of the catalog connection used as artifacts store
    #[serde(default)]
    pub artifacts_store: Option<String>,

    /// Connection catalog
    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Extra secrets exposed to every main container
    #[serde(default)]
    pub secrets: Vec<ResourceRef>,

    /// Extra config maps exposed to every main container
    #[serde(default)]
    pub config_maps: Vec<ResourceRef>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance: None,
            max_workers: default_max_workers(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            sleep_stop_time_secs: default_sleep_stop_time_secs(),
            sleep_archived_time_secs: default_sleep_archived_time_secs(),
            heartbeat_path: None,
            heartbeat_freshness_secs: default_heartbeat_freshness_secs(),
            runtime: default_runtime(),
            namespace: None,
            kube_api: None,
            kube_token_path: None,
            kube_ca_path: None,
            auth_secret: None,
            init_image: default_init_image(),
            sidecar_image: default_sidecar_image(),
            sleep_interval: default_sidecar_interval(),
            sync_interval: default_sidecar_interval(),
            artifacts_store: None,
            connections: vec![],
            secrets: vec![],
            config_maps: vec![],
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_min_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    6_000
}

fn default_sleep_stop_time_secs() -> u64 {
    60
}

fn default_sleep_archived_time_secs() -> u64 {
    1_800
}

fn default_heartbeat_freshness_secs() -> u64 {
    120
}

fn default_runtime() -> String {
    "kubernetes".to_string()
}

fn default_init_image() -> String {
    DEFAULT_INIT_IMAGE.to_string()
}

fn default_sidecar_image() -> String {
    DEFAULT_SIDECAR_IMAGE.to_string()
}

fn default_sidecar_interval() -> u64 {
    10
}

impl AgentConfig {
    /// Split `owner.agents.id` into owner and agent id.
    pub fn owner_and_id(&self) -> Result<(String, String)> {
        let instance = self
            .instance
            .as_deref()
            .ok_or_else(|| Error::Config("agent instance is not set (POLYAXON_AGENT_INSTANCE)".into()))?;
        match instance.split_once(".agents.") {
            Some((owner, id)) if !owner.is_empty() && !id.is_empty() => {
                Ok((owner.to_string(), id.to_string()))
            }
            _ => Err(Error::Config(format!(
                "invalid agent instance `{}`, expected `owner.agents.id`",
                instance
            ))),
        }
    }
}

impl Config {
    /// Load from the default file (if present) and the process environment.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            let mut config = Self::default();
            config.apply_env(|name| std::env::var(name).ok());
            config.validate()?;
            Ok(config)
        }
    }

    /// Load from an explicit file plus the process environment.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("polyflow"))
            .unwrap_or_else(|| PathBuf::from(".polyflow"))
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("polyflow"))
            .unwrap_or_else(|| PathBuf::from(".polyflow"))
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Override values from environment variables looked up through `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        let flag = |name: &str| get(name).map(|v| parse_bool(&v));

        if let Some(host) = get("POLYAXON_HOST") {
            self.client.host = Some(host);
        }
        if let Some(token) = get("POLYAXON_AUTH_TOKEN") {
            self.client.token = Some(token);
        }
        if let Some(no_api) = flag("POLYAXON_NO_API") {
            self.client.no_api = no_api;
        }
        if let Some(offline) = flag("POLYAXON_IS_OFFLINE") {
            self.client.is_offline = offline;
        }
        if let Some(no_op) = flag("POLYAXON_NO_OP") {
            self.client.no_op = no_op;
        }
        if let Some(level) = get("POLYAXON_LOG_LEVEL") {
            self.client.log_level = Some(level);
        }
        if let Some(proxy) = get("HTTP_PROXY") {
            self.client.http_proxy = Some(proxy);
        }
        if let Some(proxy) = get("HTTPS_PROXY") {
            self.client.https_proxy = Some(proxy);
        }
        if let Some(no_proxy) = get("NO_PROXY") {
            self.client.no_proxy = Some(no_proxy);
        }
        if let Some(instance) = get("POLYAXON_RUN_INSTANCE") {
            self.client.run_instance = Some(instance);
        }
        if let Some(collect) = flag("POLYAXON_COLLECT_ARTIFACTS") {
            self.client.collect_artifacts = Some(collect);
        }
        if let Some(collect) = flag("POLYAXON_COLLECT_RESOURCES") {
            self.client.collect_resources = Some(collect);
        }
        if let Some(path) = get("SSH_PATH") {
            self.client.ssh_path = Some(path);
        }
        if let Some(store) = get("POLYAXON_ARTIFACTS_STORE_NAME") {
            self.agent.artifacts_store = Some(store);
        }
        if let Some(instance) = get("POLYAXON_AGENT_INSTANCE") {
            self.agent.instance = Some(instance);
        }
        if let Some(workers) = get("POLYAXON_AGENT_MAX_WORKERS") {
            if let Ok(parsed) = workers.parse::<usize>() {
                self.agent.max_workers = parsed;
            }
        }
        if let Some(namespace) = get("POLYAXON_K8S_NAMESPACE") {
            self.agent.namespace = Some(namespace);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_workers == 0 {
            return Err(Error::Config("agent.max_workers must be at least 1".into()));
        }
        if self.agent.min_interval_ms > self.agent.max_interval_ms {
            return Err(Error::Config(
                "agent.min_interval_ms must not exceed agent.max_interval_ms".into(),
            ));
        }
        self.agent.runtime.parse::<RuntimeTarget>()?;
        self.artifacts_store()?;
        Ok(())
    }

    /// The configured artifacts store, looked up in the connection catalog.
    pub fn artifacts_store(&self) -> Result<Option<Connection>> {
        let Some(name) = &self.agent.artifacts_store else {
            return Ok(None);
        };
        self.agent
            .connections
            .iter()
            .find(|c| &c.name == name)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                Error::Config(format!("artifacts store `{}` is not in the connection catalog", name))
            })
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.agent
            .heartbeat_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("agent.heartbeat"))
    }

    pub fn heartbeat_freshness(&self) -> Duration {
        Duration::from_secs(self.agent.heartbeat_freshness_secs)
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_workers: self.agent.max_workers,
            min_interval: Duration::from_millis(self.agent.min_interval_ms),
            max_interval: Duration::from_millis(self.agent.max_interval_ms),
            sleep_stop_time: Duration::from_secs(self.agent.sleep_stop_time_secs),
            sleep_archived_time: Duration::from_secs(self.agent.sleep_archived_time_secs),
            heartbeat_path: Some(self.heartbeat_path()),
        }
    }

    pub fn kube_settings(&self) -> KubeSettings {
        KubeSettings {
            api: self.agent.kube_api.clone(),
            namespace: self
                .agent
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            token_path: self.agent.kube_token_path.clone(),
            ca_path: self.agent.kube_ca_path.clone(),
            timeout: Duration::from_secs(self.client.timeout_secs),
        }
    }

    pub fn to_converter_settings(&self) -> Result<ConverterSettings> {
        Ok(ConverterSettings {
            target: self.agent.runtime.parse()?,
            namespace: self.agent.namespace.clone(),
            host: self.client.host.clone(),
            auth_secret: self.agent.auth_secret.clone(),
            init_image: self.agent.init_image.clone(),
            sidecar_image: self.agent.sidecar_image.clone(),
            sleep_interval: self.agent.sleep_interval,
            sync_interval: self.agent.sync_interval,
            log_level: self.client.log_level.clone(),
            no_api: self.client.no_api,
            http_proxy: self.client.http_proxy.clone(),
            https_proxy: self.client.https_proxy.clone(),
            no_proxy: self.client.no_proxy.clone(),
            secrets: self.agent.secrets.clone(),
            config_maps: self.agent.config_maps.clone(),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
[client]
host = "https://polyaxon.local"

[agent]
instance = "acme.agents.a1"
max_workers = 8
runtime = "docker"
artifacts_store = "store1"

[[agent.connections]]
name = "store1"
kind = "s3"
schema = { bucket = "s3://artifacts" }

[[agent.secrets]]
name = "extra"
items = ["API_KEY"]
"#;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.agent.max_workers, 4);
        assert_eq!(config.agent.runtime, "kubernetes");
        assert_eq!(config.client.timeout_secs, 30);
        assert!(config.validate().is_ok());
        assert!(config.artifacts_store().unwrap().is_none());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.owner_and_id().unwrap(), ("acme".into(), "a1".into()));
        assert_eq!(config.artifacts_store().unwrap().unwrap().name, "store1");

        let settings = config.to_converter_settings().unwrap();
        assert_eq!(settings.target, RuntimeTarget::Docker);
        assert_eq!(settings.host.as_deref(), Some("https://polyaxon.local"));
        assert_eq!(settings.secrets[0].items, vec!["API_KEY"]);
        assert_eq!(config.agent_settings().max_workers, 8);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml(CONFIG).unwrap();
        config.apply_env(env(&[
            ("POLYAXON_HOST", "http://localhost:8000"),
            ("POLYAXON_NO_OP", "true"),
            ("POLYAXON_AGENT_MAX_WORKERS", "2"),
            ("POLYAXON_K8S_NAMESPACE", "polyaxon"),
            ("HTTPS_PROXY", "http://proxy:3128"),
            ("POLYAXON_COLLECT_ARTIFACTS", "0"),
        ]));
        assert_eq!(config.client.host.as_deref(), Some("http://localhost:8000"));
        assert!(config.client.no_op);
        assert_eq!(config.agent.max_workers, 2);
        assert_eq!(config.agent.namespace.as_deref(), Some("polyaxon"));
        assert_eq!(config.client.collect_artifacts, Some(false));
        assert_eq!(
            config.to_converter_settings().unwrap().https_proxy.as_deref(),
            Some("http://proxy:3128")
        );
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = Config::default();
        config.agent.artifacts_store = Some("missing".into());
        assert_eq!(config.validate().unwrap_err().code(), "CONFIG_ERROR");

        let mut config = Config::default();
        config.agent.runtime = "nomad".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent.instance = Some("acme-a1".into());
        assert!(config.agent.owner_and_id().is_err());

        assert!(Config::from_toml("agent = 3").is_err());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.agent.connections.len(), 1);

        let missing = Config::load_from_path(&dir.path().join("nope.toml")).unwrap_err();
        assert_eq!(missing.exit_code(), 1);
    }
}
