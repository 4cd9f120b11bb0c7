//! Run blocks: what a component actually executes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::component::Component;
use super::environment::Environment;
use super::init::Init;
use super::lifecycle::EarlyStopping;
use super::operation::Operation;
use crate::error::{Error, Result};
use crate::k8s::{Container, Volume};

/// Run kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Job,
    Service,
    Dag,
    Tfjob,
    Pytorchjob,
    Paddlejob,
    Mpijob,
    Mxjob,
    Xgbjob,
    Rayjob,
    Daskjob,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Job => "job",
            RunKind::Service => "service",
            RunKind::Dag => "dag",
            RunKind::Tfjob => "tfjob",
            RunKind::Pytorchjob => "pytorchjob",
            RunKind::Paddlejob => "paddlejob",
            RunKind::Mpijob => "mpijob",
            RunKind::Mxjob => "mxjob",
            RunKind::Xgbjob => "xgbjob",
            RunKind::Rayjob => "rayjob",
            RunKind::Daskjob => "daskjob",
        }
    }

    pub fn is_distributed(&self) -> bool {
        !matches!(self, RunKind::Job | RunKind::Service | RunKind::Dag)
    }

    /// Replica group names allowed for a distributed kind.
    pub fn replica_roles(&self) -> &'static [&'static str] {
        REPLICA_ROLES
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, roles)| *roles)
            .unwrap_or(&[])
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replica group names per distributed kind.
const REPLICA_ROLES: &[(RunKind, &[&str])] = &[
    (RunKind::Tfjob, &["chief", "ps", "worker", "evaluator"]),
    (RunKind::Pytorchjob, &["master", "worker"]),
    (RunKind::Paddlejob, &["master", "worker"]),
    (RunKind::Mpijob, &["launcher", "worker"]),
    (RunKind::Mxjob, &["scheduler", "server", "worker", "tuner", "tunerTracker", "tunerServer"]),
    (RunKind::Xgbjob, &["master", "worker"]),
    (RunKind::Rayjob, &["head", "worker"]),
    (RunKind::Daskjob, &["job", "scheduler", "worker"]),
];

/// A single-container batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    /// Connections mounted or exposed to the main container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Init>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Container>,
    #[serde(default)]
    pub container: Container,
}

/// A long-running run exposing ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Init>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Container>,
    #[serde(default)]
    pub container: Container,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, alias = "is_external", skip_serializing_if = "std::ops::Not::not")]
    pub is_external: bool,
    #[serde(default, alias = "rewrite_path", skip_serializing_if = "std::ops::Not::not")]
    pub rewrite_path: bool,
}

impl Service {
    pub fn as_job(&self) -> Job {
        Job {
            environment: self.environment.clone(),
            connections: self.connections.clone(),
            volumes: self.volumes.clone(),
            init: self.init.clone(),
            sidecars: self.sidecars.clone(),
            container: self.container.clone(),
        }
    }
}

/// A graph of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Reusable components addressed by `dagRef`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, alias = "early_stopping", skip_serializing_if = "Vec::is_empty")]
    pub early_stopping: Vec<EarlyStopping>,
}

/// One named replica group of a distributed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init: Vec<Init>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Container>,
    #[serde(default)]
    pub container: Container,
}

impl ReplicaSpec {
    pub fn as_job(&self) -> Job {
        Job {
            environment: self.environment.clone(),
            connections: self.connections.clone(),
            volumes: self.volumes.clone(),
            init: self.init.clone(),
            sidecars: self.sidecars.clone(),
            container: self.container.clone(),
        }
    }
}

/// A distributed run: named replica groups plus framework options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedRun {
    #[serde(default, alias = "clean_pod_policy", skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<String>,
    #[serde(default, alias = "scheduling_policy", skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<Value>,
    #[serde(default, alias = "slots_per_worker", skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<u32>,
    #[serde(flatten)]
    pub replicas: IndexMap<String, ReplicaSpec>,
}

/// The run block of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Run {
    Job(Job),
    Service(Service),
    Dag(Dag),
    Tfjob(DistributedRun),
    Pytorchjob(DistributedRun),
    Paddlejob(DistributedRun),
    Mpijob(DistributedRun),
    Mxjob(DistributedRun),
    Xgbjob(DistributedRun),
    Rayjob(DistributedRun),
    Daskjob(DistributedRun),
}

impl Run {
    pub fn kind(&self) -> RunKind {
        match self {
            Run::Job(_) => RunKind::Job,
            Run::Service(_) => RunKind::Service,
            Run::Dag(_) => RunKind::Dag,
            Run::Tfjob(_) => RunKind::Tfjob,
            Run::Pytorchjob(_) => RunKind::Pytorchjob,
            Run::Paddlejob(_) => RunKind::Paddlejob,
            Run::Mpijob(_) => RunKind::Mpijob,
            Run::Mxjob(_) => RunKind::Mxjob,
            Run::Xgbjob(_) => RunKind::Xgbjob,
            Run::Rayjob(_) => RunKind::Rayjob,
            Run::Daskjob(_) => RunKind::Daskjob,
        }
    }

    pub fn distributed(&self) -> Option<&DistributedRun> {
        match self {
            Run::Tfjob(d)
            | Run::Pytorchjob(d)
            | Run::Paddlejob(d)
            | Run::Mpijob(d)
            | Run::Mxjob(d)
            | Run::Xgbjob(d)
            | Run::Rayjob(d)
            | Run::Daskjob(d) => Some(d),
            _ => None,
        }
    }

    pub fn distributed_mut(&mut self) -> Option<&mut DistributedRun> {
        match self {
            Run::Tfjob(d)
            | Run::Pytorchjob(d)
            | Run::Paddlejob(d)
            | Run::Mpijob(d)
            | Run::Mxjob(d)
            | Run::Xgbjob(d)
            | Run::Rayjob(d)
            | Run::Daskjob(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dag(&self) -> Option<&Dag> {
        match self {
            Run::Dag(dag) => Some(dag),
            _ => None,
        }
    }

    /// Init directives across the run, replica groups included.
    pub fn inits_mut(&mut self) -> Vec<&mut Init> {
        match self {
            Run::Job(job) => job.init.iter_mut().collect(),
            Run::Service(service) => service.init.iter_mut().collect(),
            Run::Dag(_) => vec![],
            other => other
                .distributed_mut()
                .map(|d| d.replicas.values_mut().flat_map(|r| r.init.iter_mut()).collect())
                .unwrap_or_default(),
        }
    }

    /// Connections declared on the run, replica groups included.
    pub fn connections(&self) -> Vec<String> {
        let mut names: Vec<String> = match self {
            Run::Job(job) => job.connections.clone(),
            Run::Service(service) => service.connections.clone(),
            Run::Dag(dag) => dag.connections.clone(),
            other => other
                .distributed()
                .map(|d| d.replicas.values().flat_map(|r| r.connections.clone()).collect())
                .unwrap_or_default(),
        };
        let mut seen = std::collections::HashSet::new();
        names.retain(|n| seen.insert(n.clone()));
        names
    }

    /// Named single-pod units: `("main", job)` or one entry per replica group.
    pub fn units(&self) -> Vec<(String, Job)> {
        match self {
            Run::Job(job) => vec![("main".to_string(), job.clone())],
            Run::Service(service) => vec![("main".to_string(), service.as_job())],
            Run::Dag(_) => vec![],
            other => other
                .distributed()
                .map(|d| {
                    d.replicas
                        .iter()
                        .map(|(name, replica)| (name.clone(), replica.as_job()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let inits: Vec<&Init> = match self {
            Run::Job(job) => job.init.iter().collect(),
            Run::Service(service) => service.init.iter().collect(),
            Run::Dag(dag) => {
                if dag.operations.is_empty() {
                    return Err(Error::Schema("dag requires at least one operation".into()));
                }
                vec![]
            }
            other => {
                let kind = other.kind();
                let distributed = other
                    .distributed()
                    .ok_or_else(|| Error::Schema(format!("unexpected run kind `{}`", kind)))?;
                let roles = kind.replica_roles();
                if distributed.replicas.is_empty() {
                    return Err(Error::Schema(format!(
                        "{} requires at least one replica group ({})",
                        kind,
                        roles.join(", ")
                    )));
                }
                for name in distributed.replicas.keys() {
                    if !roles.contains(&name.as_str()) {
                        return Err(Error::Schema(format!(
                            "{} does not support replica group `{}` (expected one of {})",
                            kind,
                            name,
                            roles.join(", ")
                        )));
                    }
                }
                distributed
                    .replicas
                    .values()
                    .flat_map(|r| r.init.iter())
                    .collect()
            }
        };
        for (i, init) in inits.iter().enumerate() {
            init.validate().map_err(|e| e.at(&format!("run.init[{}]", i)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_from_yaml() {
        let yaml = r#"
kind: job
connections: [data]
init:
  - git:
      url: https://github.com/org/repo
container:
  image: python:3.11
  command: [python, train.py]
"#;
        let run: Run = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(run.kind(), RunKind::Job);
        assert!(run.validate().is_ok());
        assert_eq!(run.connections(), vec!["data".to_string()]);
        assert_eq!(run.units().len(), 1);
    }

    #[test]
    fn test_distributed_replicas() {
        let yaml = r#"
kind: pytorchjob
cleanPodPolicy: All
master:
  replicas: 1
  container:
    image: torch
worker:
  replicas: 4
  connections: [data]
  container:
    image: torch
"#;
        let run: Run = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(run.kind(), RunKind::Pytorchjob);
        assert!(run.validate().is_ok());
        let distributed = run.distributed().unwrap();
        assert_eq!(distributed.clean_pod_policy.as_deref(), Some("All"));
        assert_eq!(distributed.replicas["worker"].replicas, Some(4));
        let units = run.units();
        assert_eq!(units[0].0, "master");
        assert_eq!(units[1].0, "worker");
        assert_eq!(run.connections(), vec!["data".to_string()]);
    }

    #[test]
    fn test_unknown_replica_group() {
        let yaml = r#"
kind: tfjob
master:
  container:
    image: tf
"#;
        let run: Run = serde_yaml::from_str(yaml).unwrap();
        let err = run.validate().unwrap_err();
        assert!(err.to_string().contains("replica group `master`"));
    }

    #[test]
    fn test_replica_roles_table() {
        assert!(RunKind::Tfjob.replica_roles().contains(&"chief"));
        assert!(RunKind::Mpijob.replica_roles().contains(&"launcher"));
        assert!(RunKind::Job.replica_roles().is_empty());
        assert!(RunKind::Rayjob.is_distributed());
        assert!(!RunKind::Dag.is_distributed());
    }

    #[test]
    fn test_empty_dag_rejected() {
        let run: Run = serde_yaml::from_str("kind: dag\noperations: []").unwrap();
        assert!(run.validate().is_err());
    }
}
