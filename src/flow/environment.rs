//! Pod-level environment and termination settings.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::k8s::{NameRef, ObjectMeta, PodSpec};

/// Scheduling and pod-level settings applied to generated pods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
    #[serde(default, alias = "node_selector", skip_serializing_if = "IndexMap::is_empty")]
    pub node_selector: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Value>,
    #[serde(default, alias = "node_name", skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, alias = "service_account_name", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, alias = "image_pull_secrets", skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    #[serde(default, alias = "security_context", skip_serializing_if = "Option::is_none")]
    pub security_context: Option<Value>,
    #[serde(default, alias = "host_network", skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    #[serde(default, alias = "host_pid", skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<bool>,
    #[serde(default, alias = "dns_policy", skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(default, alias = "dns_config", skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<Value>,
    #[serde(default, alias = "scheduler_name", skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, alias = "priority_class_name", skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, alias = "restart_policy", skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

impl Environment {
    /// Copy scheduling settings onto a pod spec.
    pub fn apply_to_pod(&self, pod: &mut PodSpec) {
        if !self.node_selector.is_empty() {
            pod.node_selector = self.node_selector.clone();
        }
        if self.affinity.is_some() {
            pod.affinity = self.affinity.clone();
        }
        if !self.tolerations.is_empty() {
            pod.tolerations = self.tolerations.clone();
        }
        if self.node_name.is_some() {
            pod.node_name = self.node_name.clone();
        }
        if self.service_account_name.is_some() {
            pod.service_account_name = self.service_account_name.clone();
        }
        for secret in &self.image_pull_secrets {
            if !pod.image_pull_secrets.iter().any(|s| &s.name == secret) {
                pod.image_pull_secrets.push(NameRef {
                    name: secret.clone(),
                });
            }
        }
        if self.security_context.is_some() {
            pod.security_context = self.security_context.clone();
        }
        pod.host_network = self.host_network.or(pod.host_network);
        pod.host_pid = self.host_pid.or(pod.host_pid);
        if self.dns_policy.is_some() {
            pod.dns_policy = self.dns_policy.clone();
        }
        if self.dns_config.is_some() {
            pod.dns_config = self.dns_config.clone();
        }
        if self.scheduler_name.is_some() {
            pod.scheduler_name = self.scheduler_name.clone();
        }
        if self.priority_class_name.is_some() {
            pod.priority_class_name = self.priority_class_name.clone();
        }
        pod.priority = self.priority.or(pod.priority);
        if self.restart_policy.is_some() {
            pod.restart_policy = self.restart_policy.clone();
        }
    }

    /// Merge user labels and annotations into generated metadata.
    pub fn apply_to_meta(&self, meta: &mut ObjectMeta) {
        for (k, v) in &self.labels {
            meta.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &self.annotations {
            meta.annotations.insert(k.clone(), v.clone());
        }
    }
}

/// Retry and lifetime limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Termination {
    #[serde(default, alias = "max_retries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Seconds to keep finished resources around.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Seconds before an active run is killed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Pod-level projection of a [`Termination`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<u64>,
}

impl Termination {
    pub fn to_spec(&self) -> TerminationSpec {
        TerminationSpec {
            backoff_limit: self.max_retries,
            ttl_seconds_after_finished: self.ttl,
            active_deadline_seconds: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_applies_to_pod() {
        let yaml = r#"
nodeSelector:
  gpu: "true"
service_account_name: trainer
imagePullSecrets: [regcred]
restartPolicy: Never
labels:
  team: ml
"#;
        let env: Environment = serde_yaml::from_str(yaml).unwrap();
        let mut pod = PodSpec::default();
        env.apply_to_pod(&mut pod);
        assert_eq!(pod.node_selector["gpu"], "true");
        assert_eq!(pod.service_account_name.as_deref(), Some("trainer"));
        assert_eq!(pod.image_pull_secrets.len(), 1);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let mut meta = ObjectMeta::default();
        env.apply_to_meta(&mut meta);
        assert_eq!(meta.labels["team"], "ml");
    }

    #[test]
    fn test_termination_projection() {
        let termination = Termination {
            max_retries: Some(3),
            ttl: Some(600),
            timeout: None,
        };
        let spec = termination.to_spec();
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));
        assert!(spec.active_deadline_seconds.is_none());
    }
}
