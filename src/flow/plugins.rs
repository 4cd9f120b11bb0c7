//! Per-operation platform plugins.

use serde::{Deserialize, Serialize};

/// Sidecar overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarOverrides {
    #[serde(default, alias = "sleep_interval", skip_serializing_if = "Option::is_none")]
    pub sleep_interval: Option<u64>,
    #[serde(default, alias = "sync_interval", skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<u64>,
}

/// Toggles for what the platform injects around the main container.
///
/// Unset toggles take the platform default exposed by the accessor methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugins {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm: Option<bool>,
    #[serde(default, alias = "mount_artifacts_store", skip_serializing_if = "Option::is_none")]
    pub mount_artifacts_store: Option<bool>,
    #[serde(default, alias = "collect_artifacts", skip_serializing_if = "Option::is_none")]
    pub collect_artifacts: Option<bool>,
    #[serde(default, alias = "collect_logs", skip_serializing_if = "Option::is_none")]
    pub collect_logs: Option<bool>,
    #[serde(default, alias = "collect_resources", skip_serializing_if = "Option::is_none")]
    pub collect_resources: Option<bool>,
    #[serde(default, alias = "auto_resume", skip_serializing_if = "Option::is_none")]
    pub auto_resume: Option<bool>,
    #[serde(default, alias = "sync_statuses", skip_serializing_if = "Option::is_none")]
    pub sync_statuses: Option<bool>,
    #[serde(default, alias = "log_level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, alias = "external_host", skip_serializing_if = "Option::is_none")]
    pub external_host: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<SidecarOverrides>,
}

impl Plugins {
    pub fn auth(&self) -> bool {
        self.auth.unwrap_or(true)
    }

    pub fn docker(&self) -> bool {
        self.docker.unwrap_or(false)
    }

    pub fn shm(&self) -> bool {
        self.shm.unwrap_or(true)
    }

    pub fn mount_artifacts_store(&self) -> bool {
        self.mount_artifacts_store.unwrap_or(false)
    }

    pub fn collect_artifacts(&self) -> bool {
        self.collect_artifacts.unwrap_or(true)
    }

    pub fn collect_logs(&self) -> bool {
        self.collect_logs.unwrap_or(true)
    }

    pub fn collect_resources(&self) -> bool {
        self.collect_resources.unwrap_or(true)
    }

    pub fn auto_resume(&self) -> bool {
        self.auto_resume.unwrap_or(true)
    }

    pub fn sync_statuses(&self) -> bool {
        self.sync_statuses.unwrap_or(true)
    }

    /// At least one collector requires the sidecar.
    pub fn needs_sidecar(&self) -> bool {
        self.collect_logs() || self.collect_artifacts() || self.collect_resources()
    }

    /// Plugins with every collector and auth disabled.
    pub fn disabled() -> Self {
        Self {
            auth: Some(false),
            collect_artifacts: Some(false),
            collect_logs: Some(false),
            collect_resources: Some(false),
            auto_resume: Some(false),
            sync_statuses: Some(false),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let plugins = Plugins::default();
        assert!(plugins.auth());
        assert!(plugins.collect_artifacts());
        assert!(!plugins.docker());
        assert!(plugins.needs_sidecar());
        assert!(!Plugins::disabled().needs_sidecar());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
auth: false
collect_logs: false
collectArtifacts: false
collectResources: false
sidecar:
  sleepInterval: 5
"#;
        let plugins: Plugins = serde_yaml::from_str(yaml).unwrap();
        assert!(!plugins.auth());
        assert!(!plugins.needs_sidecar());
        assert_eq!(plugins.sidecar.unwrap().sleep_interval, Some(5));
    }
}
