//! Runtime drivers.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::converter::{resource_name, Resource};
use crate::error::{Error, Result};
use crate::flow::RunKind;
use crate::k8s::{Container, PodSpec, VolumeSource};

/// Applies converted resources to a runtime. Shared across workers.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create the resource; a 409 status means it already exists.
    async fn create(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()>;

    /// Create or replace the resource.
    async fn apply(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()>;

    /// Stop the run; a 404 status means nothing was running.
    async fn stop(&self, uuid: &str, kind: RunKind) -> Result<()>;

    /// Runtime view of the run.
    async fn get(&self, uuid: &str, kind: RunKind) -> Result<Value>;

    /// Release anything left behind by a finished run.
    async fn clean(&self, uuid: &str, kind: RunKind) -> Result<()>;

    /// Reload runtime credentials or connections.
    async fn refresh(&self) -> Result<()>;
}

/// Accepts everything and only logs; used when operations are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl Executor for DryRunExecutor {
    async fn create(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        info!(run_uuid = %uuid, kind = %kind.as_str(), resource = %resource.name(), "Dry run: create");
        Ok(())
    }

    async fn apply(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        info!(run_uuid = %uuid, kind = %kind.as_str(), resource = %resource.name(), "Dry run: apply");
        Ok(())
    }

    async fn stop(&self, uuid: &str, kind: RunKind) -> Result<()> {
        info!(run_uuid = %uuid, kind = %kind.as_str(), "Dry run: stop");
        Ok(())
    }

    async fn get(&self, uuid: &str, kind: RunKind) -> Result<Value> {
        Ok(json!({ "name": resource_name(uuid), "kind": kind.as_str(), "status": "dry_run" }))
    }

    async fn clean(&self, uuid: &str, kind: RunKind) -> Result<()> {
        debug!(run_uuid = %uuid, kind = %kind.as_str(), "Dry run: clean");
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Drives the local `docker` CLI. Init containers run to completion in
/// order before the main container is started detached.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    binary: String,
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Argument lists for one docker run.
#[derive(Debug, Clone, PartialEq)]
pub struct DockerPlan {
    pub inits: Vec<Vec<String>>,
    pub main: Vec<String>,
}

impl DockerExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Translate a converted job into `docker run` argument lists.
    pub fn plan(resource: &Resource) -> Result<DockerPlan> {
        if resource.kind != RunKind::Job {
            return Err(Error::executor(
                None,
                format!("the docker runtime cannot run `{}` resources", resource.kind.as_str()),
            ));
        }
        let replica = resource
            .main()
            .ok_or_else(|| Error::executor(None, "resource has no main replica"))?;
        let name = resource.name();
        let pod = &replica.spec;

        let mut labels = Vec::new();
        for (key, value) in &resource.metadata.labels {
            labels.push("--label".to_string());
            labels.push(format!("{}={}", key, value));
        }

        let mut inits = Vec::new();
        for init in &pod.init_containers {
            let init_name = init.name.as_deref().unwrap_or("init");
            let mut args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "--name".to_string(),
                format!("{}-{}", name, init_name),
            ];
            args.extend(labels.iter().cloned());
            args.extend(container_args(name, pod, init)?);
            inits.push(args);
        }

        let main = pod
            .main_container()
            .ok_or_else(|| Error::executor(None, "resource has no main container"))?;
        let mut args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), name.to_string()];
        args.extend(labels);
        args.extend(container_args(name, pod, main)?);
        Ok(DockerPlan { inits, main: args })
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!(args = ?args, "Running docker");
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(stderr))
    }
}

/// Map docker CLI failures onto API-style statuses.
fn classify(stderr: String) -> Error {
    if stderr.contains("No such container") || stderr.contains("No such object") {
        Error::executor(Some(404), stderr)
    } else if stderr.contains("Conflict") || stderr.contains("already in use") {
        Error::executor(Some(409), stderr)
    } else {
        Error::executor(None, stderr)
    }
}

/// Mounts, env, working dir, image and command of one container.
fn container_args(resource: &str, pod: &PodSpec, container: &Container) -> Result<Vec<String>> {
    let mut args = Vec::new();
    for mount in &container.volume_mounts {
        let Some(volume) = pod.volumes.iter().find(|v| v.name == mount.name) else {
            return Err(Error::executor(None, format!("mount `{}` has no volume", mount.name)));
        };
        let source = match &volume.source {
            VolumeSource::EmptyDir { .. } => format!("{}-{}", resource, volume.name),
            VolumeSource::HostPath { path } => path.clone(),
            _ => {
                warn!(volume = %volume.name, "Skipping volume unsupported by the docker runtime");
                continue;
            }
        };
        let mut spec = format!("{}:{}", source, mount.mount_path);
        if mount.read_only {
            spec.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(spec);
    }
    for var in &container.env {
        match &var.value {
            Some(value) => {
                args.push("-e".to_string());
                args.push(format!("{}={}", var.name, value));
            }
            None => debug!(env = %var.name, "Skipping env var sourced from the cluster"),
        }
    }
    if let Some(dir) = &container.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }

    let image = container
        .image
        .clone()
        .ok_or_else(|| Error::executor(None, "container has no image"))?;
    let mut command = container.command.iter();
    if let Some(entrypoint) = command.next() {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }
    args.push(image);
    args.extend(command.cloned());
    args.extend(container.args.iter().cloned());
    Ok(args)
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn create(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        let plan = Self::plan(resource)?;
        for init in &plan.inits {
            self.docker(init).await?;
        }
        let id = self.docker(&plan.main).await?;
        info!(run_uuid = %uuid, kind = %kind.as_str(), container = %id, "Started docker container");
        Ok(())
    }

    async fn apply(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        match self.stop(uuid, kind).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.create(uuid, kind, resource).await
    }

    async fn stop(&self, uuid: &str, _kind: RunKind) -> Result<()> {
        self.docker(&["rm".to_string(), "-f".to_string(), resource_name(uuid)])
            .await
            .map(|_| ())
    }

    async fn get(&self, uuid: &str, _kind: RunKind) -> Result<Value> {
        let output = self.docker(&["inspect".to_string(), resource_name(uuid)]).await?;
        let mut parsed: Vec<Value> = serde_json::from_str(&output)?;
        if parsed.is_empty() {
            return Err(Error::executor(Some(404), format!("No such object: {}", resource_name(uuid))));
        }
        Ok(parsed.swap_remove(0))
    }

    async fn clean(&self, _uuid: &str, _kind: RunKind) -> Result<()> {
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, RuntimeContext};
    use crate::converter::{Converter, ConverterSettings, RuntimeTarget};
    use crate::flow::Plugins;

    fn docker_resource() -> Resource {
        let yaml = r#"
kind: operation
version: 1.1
params:
  epochs: {value: 3}
component:
  kind: component
  version: 1.1
  inputs:
    - {name: epochs, type: int}
  run:
    kind: job
    container:
      image: python:3.11
      command: [python, train.py]
      args: ["--epochs={{ epochs }}"]
      workingDir: /code
"#;
        let compilation = Compiler::default().compile_text(yaml, &[]).unwrap();
        let mut compiled = compilation.compiled;
        compiled.plugins = Some(Plugins {
            auth: Some(false),
            collect_artifacts: Some(false),
            collect_logs: Some(false),
            collect_resources: Some(false),
            ..Default::default()
        });
        let runtime = RuntimeContext::new("u1", "acme", "mnist");
        let compiled = Compiler::default().resolve(&compiled, &runtime).unwrap();
        let converter = Converter::new(ConverterSettings {
            target: RuntimeTarget::Docker,
            ..Default::default()
        });
        converter.convert(&compiled, &runtime).unwrap()
    }

    #[test]
    fn test_docker_plan() {
        let plan = DockerExecutor::plan(&docker_resource()).unwrap();
        assert!(plan.inits.is_empty());
        let main = &plan.main;
        assert_eq!(&main[..4], &["run", "-d", "--name", "plx-operation-u1"]);
        let entrypoint = main.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(main[entrypoint + 1], "python");
        assert_eq!(&main[entrypoint + 2..], &["python:3.11", "train.py", "--epochs=3"]);
        assert!(main.windows(2).any(|w| w[0] == "-w" && w[1] == "/code"));
        assert!(main
            .windows(2)
            .any(|w| w[0] == "-e" && w[1] == "POLYAXON_RUN_INSTANCE=acme.mnist.runs.u1"));
    }

    #[test]
    fn test_classify_docker_errors() {
        let conflict = classify(
            "docker: Error response from daemon: Conflict. The container name \"/plx\" is already in use".into(),
        );
        assert!(conflict.is_conflict());
        let missing = classify("Error: No such container: plx-operation-u1".into());
        assert!(missing.is_not_found());
        assert_eq!(classify("boom".into()).status(), None);
    }

    #[tokio::test]
    async fn test_dry_run_accepts() {
        let executor = DryRunExecutor;
        let resource = docker_resource();
        executor.create("u1", RunKind::Job, &resource).await.unwrap();
        executor.stop("u1", RunKind::Job).await.unwrap();
        let view = executor.get("u1", RunKind::Job).await.unwrap();
        assert_eq!(view["name"], "plx-operation-u1");
    }
}
