//! Runtime conversion.
//!
//! Projects a resolved [`CompiledOperation`] onto pod-level resources for
//! the active runtime: a main container, platform init containers, an
//! optional sidecar, and one pod per replica group for distributed runs.

pub mod env;
mod init;
mod sidecar;

pub use init::{context_volume_name, ARTIFACTS_INIT_NAME, AUTH_INIT_NAME};
pub use sidecar::SIDECAR_NAME;

use std::collections::HashMap;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::compiler::{RuntimeContext, CONTEXT_ARTIFACTS_ROOT};
use crate::connections::{Connection, ConnectionSchema, ResourceRef};
use crate::error::{Error, Result};
use crate::flow::{CompiledOperation, Init, Job, Plugins, Run, RunKind, TerminationSpec};
use crate::k8s::{Container, ContainerPort, EnvVar, ObjectMeta, PodSpec, Volume, VolumeMount};
use crate::parser::stringify;

pub const MAIN_CONTAINER: &str = "polyaxon-main";
pub const ARTIFACTS_VOLUME: &str = "plx-artifacts-context";
pub const AUTH_VOLUME: &str = "plx-auth-context";
pub const AUTH_CONTEXT_PATH: &str = "/plx-context/.auth";
const SHM_VOLUME: &str = "plx-dshm";
const SHM_PATH: &str = "/dev/shm";
const DOCKER_VOLUME: &str = "plx-docker";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub const DEFAULT_INIT_IMAGE: &str = "polyaxon/polyaxon-init:latest";
pub const DEFAULT_SIDECAR_IMAGE: &str = "polyaxon/polyaxon-sidecar:latest";

/// Runtime a resource is built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTarget {
    #[default]
    Kubernetes,
    Docker,
}

impl RuntimeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeTarget::Kubernetes => "kubernetes",
            RuntimeTarget::Docker => "docker",
        }
    }

    pub fn is_kubernetes(&self) -> bool {
        *self == RuntimeTarget::Kubernetes
    }

    pub fn supports_sidecar(&self) -> bool {
        self.is_kubernetes()
    }

    /// Reject run kinds this runtime cannot execute.
    pub fn check(&self, kind: RunKind) -> Result<()> {
        if kind == RunKind::Dag {
            return Err(Error::Compiler(format!(
                "a dag run is scheduled by the control plane and cannot be converted for the {} runtime",
                self.as_str()
            )));
        }
        if *self == RuntimeTarget::Docker && kind != RunKind::Job {
            return Err(Error::Compiler(format!(
                "the docker runtime supports only job runs, got `{}`",
                kind
            )));
        }
        Ok(())
    }
}

impl FromStr for RuntimeTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(RuntimeTarget::Kubernetes),
            "docker" => Ok(RuntimeTarget::Docker),
            other => Err(Error::Config(format!("unknown runtime `{}`", other))),
        }
    }
}

/// Agent-level knobs the converter injects into every resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ConverterSettings {
    pub target: RuntimeTarget,
    pub namespace: Option<String>,
    pub host: Option<String>,
    /// Secret holding the service token under the `token` key.
    pub auth_secret: Option<String>,
    pub init_image: String,
    pub sidecar_image: String,
    pub sleep_interval: u64,
    pub sync_interval: u64,
    pub log_level: Option<String>,
    pub no_api: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub secrets: Vec<ResourceRef>,
    pub config_maps: Vec<ResourceRef>,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            target: RuntimeTarget::default(),
            namespace: None,
            host: None,
            auth_secret: None,
            init_image: DEFAULT_INIT_IMAGE.to_string(),
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            sleep_interval: 10,
            sync_interval: 10,
            log_level: None,
            no_api: false,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            secrets: vec![],
            config_maps: vec![],
        }
    }
}

/// One replica group: a pod template and how many copies to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub replicas: u32,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

/// A converted run, ready for an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub kind: RunKind,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub termination: TerminationSpec,
    pub replicas: IndexMap<String, Replica>,
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The single pod of a job or service.
    pub fn main(&self) -> Option<&Replica> {
        self.replicas.get("main")
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Name of the resource created for a run.
pub fn resource_name(uuid: &str) -> String {
    format!("plx-operation-{}", uuid)
}

/// Volumes and mounts accumulated while building one pod.
pub struct PodAssembly {
    pub pod: PodSpec,
    /// Context mounts shared with the main container.
    pub main_mounts: Vec<VolumeMount>,
    claimed: HashMap<String, usize>,
}

impl PodAssembly {
    fn new() -> Self {
        Self {
            pod: PodSpec::default(),
            main_mounts: Vec::new(),
            claimed: HashMap::new(),
        }
    }

    pub fn artifacts_mount(&mut self) -> VolumeMount {
        self.pod.add_volume(Volume::empty_dir(ARTIFACTS_VOLUME));
        VolumeMount::new(ARTIFACTS_VOLUME, CONTEXT_ARTIFACTS_ROOT)
    }

    pub fn auth_mount(&mut self) -> VolumeMount {
        self.pod.add_volume(Volume::empty_dir(AUTH_VOLUME));
        VolumeMount::new(AUTH_VOLUME, AUTH_CONTEXT_PATH)
    }

    /// Mount for an init's context. Default paths are exclusive; explicit
    /// paths may be shared and resolve to the same volume.
    pub fn claim_mount(&mut self, index: usize, explicit: Option<&str>, default: String) -> Result<VolumeMount> {
        let path = explicit.map(str::to_string).unwrap_or(default);
        if path == CONTEXT_ARTIFACTS_ROOT {
            let mount = self.artifacts_mount();
            self.share(mount.clone());
            return Ok(mount);
        }
        if explicit.is_none() {
            if let Some(previous) = self.claimed.insert(path.clone(), index) {
                return Err(Error::Converter(format!(
                    "default mount path `{}` is already claimed by run.init[{}]; set an explicit `path`",
                    path, previous
                )));
            }
        }
        let name = context_volume_name(&path);
        self.pod.add_volume(Volume::empty_dir(name.clone()));
        let mount = VolumeMount::new(name, path);
        self.share(mount.clone());
        Ok(mount)
    }

    fn share(&mut self, mount: VolumeMount) {
        if !self.main_mounts.iter().any(|m| m.mount_path == mount.mount_path) {
            self.main_mounts.push(mount);
        }
    }

    /// Volumes a connection needs: its claim or host path and mounted secrets.
    pub fn connection_mounts(&mut self, connection: &Connection) -> Result<Vec<VolumeMount>> {
        let mut mounts = Vec::new();
        if connection.is_mount() {
            if let ConnectionSchema::Claim(schema) = connection.typed_schema()? {
                let name = format!("plx-connection-{}", connection.name);
                let volume = match (&schema.volume_claim, &schema.host_path) {
                    (Some(claim), _) => Volume::claim(name.clone(), claim, schema.read_only),
                    (None, Some(host)) => Volume::host_path(name.clone(), host),
                    (None, None) => {
                        return Err(Error::Converter(format!(
                            "connection `{}` has neither a volume claim nor a host path",
                            connection.name
                        )))
                    }
                };
                self.pod.add_volume(volume);
                mounts.push(VolumeMount::new(name, schema.mount_path.clone()).read_only(schema.read_only));
            }
        }
        if let Some(secret) = connection.secret.as_ref().filter(|s| s.is_mounted()) {
            mounts.push(self.mount_secret(secret));
        }
        if let Some(config_map) = connection.config_map.as_ref().filter(|c| c.is_mounted()) {
            mounts.push(self.mount_config_map(config_map));
        }
        Ok(mounts)
    }

    fn mount_secret(&mut self, secret: &ResourceRef) -> VolumeMount {
        let name = secret.volume_name("plx-secret");
        self.pod.add_volume(Volume::secret(name.clone(), &secret.name, &secret.items));
        VolumeMount::new(name, secret.mount_path.clone().unwrap_or_default()).read_only(true)
    }

    fn mount_config_map(&mut self, config_map: &ResourceRef) -> VolumeMount {
        let name = config_map.volume_name("plx-config");
        self.pod
            .add_volume(Volume::config_map(name.clone(), &config_map.name, &config_map.items));
        VolumeMount::new(name, config_map.mount_path.clone().unwrap_or_default()).read_only(true)
    }
}

/// What every container of one pod needs to know.
pub struct UnitContext<'a> {
    pub settings: &'a ConverterSettings,
    pub runtime: &'a RuntimeContext,
    pub plugins: &'a Plugins,
    pub store: Option<&'a Connection>,
    /// Connections the main container references.
    pub connections: Vec<&'a Connection>,
    /// Base, auth and proxy env shared by platform containers.
    pub platform_env: Vec<EnvVar>,
    catalog: &'a IndexMap<String, Connection>,
}

impl<'a> UnitContext<'a> {
    pub fn connection(&self, name: &str) -> Result<&'a Connection> {
        lookup(self.catalog, name)
    }

    pub fn init_container(&self, name: &str) -> Container {
        let mut container = Container::named(name).with_image(self.settings.init_image.clone());
        container.image_pull_policy = Some("IfNotPresent".to_string());
        container.env = self.platform_env.clone();
        container
    }
}

fn lookup<'a>(catalog: &'a IndexMap<String, Connection>, name: &str) -> Result<&'a Connection> {
    catalog.get(name).ok_or_else(|| {
        Error::Converter(format!(
            "connection `{}` is not defined in the agent's connection catalog",
            name
        ))
    })
}

/// The converter: settings plus the connection catalog.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    settings: ConverterSettings,
    connections: IndexMap<String, Connection>,
    artifacts_store: Option<String>,
}

impl Converter {
    pub fn new(settings: ConverterSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn with_connections(mut self, connections: impl IntoIterator<Item = Connection>) -> Self {
        for connection in connections {
            self.connections.insert(connection.name.clone(), connection);
        }
        self
    }

    pub fn with_artifacts_store(mut self, store: Option<Connection>) -> Self {
        if let Some(store) = store {
            self.artifacts_store = Some(store.name.clone());
            self.connections.insert(store.name.clone(), store);
        }
        self
    }

    pub fn settings(&self) -> &ConverterSettings {
        &self.settings
    }

    pub fn connections(&self) -> &IndexMap<String, Connection> {
        &self.connections
    }

    pub fn artifacts_store(&self) -> Option<&Connection> {
        self.artifacts_store
            .as_deref()
            .and_then(|name| self.connections.get(name))
    }

    /// Convert a resolved operation into a runtime resource.
    #[instrument(skip_all, fields(run_uuid = %runtime.uuid, runtime = self.settings.target.as_str()))]
    pub fn convert(&self, compiled: &CompiledOperation, runtime: &RuntimeContext) -> Result<Resource> {
        let kind = compiled.run.kind();
        self.settings.target.check(kind)?;
        let name = resource_name(&runtime.uuid);
        let plugins = compiled.plugins();
        let metadata = self.metadata(&name, compiled, runtime, kind);

        let mut replicas = IndexMap::new();
        for (role, job) in compiled.run.units() {
            let spec = self
                .pod(compiled, runtime, &plugins, &name, &job)
                .map_err(|e| if kind.is_distributed() { e.at(&format!("run.{}", role)) } else { e })?;
            let mut replica_meta = metadata.clone();
            if kind.is_distributed() {
                replica_meta.name = format!("{}-{}", name, role);
                replica_meta
                    .labels
                    .insert("operation.polyaxon.com/replica".to_string(), role.clone());
            }
            if let Some(environment) = &job.environment {
                environment.apply_to_meta(&mut replica_meta);
            }
            replicas.insert(
                role.clone(),
                Replica {
                    replicas: replica_count(&compiled.run, &role),
                    metadata: replica_meta,
                    spec,
                },
            );
        }

        let termination = compiled
            .termination
            .as_ref()
            .map(|t| t.to_spec())
            .unwrap_or_default();
        debug!(name = %name, kind = %kind, replicas = replicas.len(), "Converted operation");
        Ok(Resource {
            kind,
            metadata,
            termination,
            replicas,
        })
    }

    fn metadata(&self, name: &str, compiled: &CompiledOperation, runtime: &RuntimeContext, kind: RunKind) -> ObjectMeta {
        let mut labels = IndexMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), name.to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), runtime.uuid.clone());
        labels.insert("app.kubernetes.io/part-of".to_string(), "polyaxon-runs".to_string());
        labels.insert("app.kubernetes.io/component".to_string(), "polyaxon-workers".to_string());
        labels.insert("app.kubernetes.io/managed-by".to_string(), "polyaxon-agent".to_string());
        labels.insert("operation.polyaxon.com/uuid".to_string(), runtime.uuid.clone());
        labels.insert("operation.polyaxon.com/kind".to_string(), kind.as_str().to_string());

        let mut annotations = IndexMap::new();
        annotations.insert(
            "operation.polyaxon.com/project".to_string(),
            format!("{}.{}", runtime.owner_name, runtime.project_name),
        );
        if let Some(op_name) = runtime.name.as_ref().or(compiled.name.as_ref()) {
            annotations.insert("operation.polyaxon.com/name".to_string(), op_name.clone());
        }
        ObjectMeta {
            name: name.to_string(),
            namespace: runtime
                .namespace
                .clone()
                .or_else(|| compiled.namespace.clone())
                .or_else(|| self.settings.namespace.clone()),
            labels,
            annotations,
        }
    }

    fn pod(
        &self,
        compiled: &CompiledOperation,
        runtime: &RuntimeContext,
        plugins: &Plugins,
        name: &str,
        job: &Job,
    ) -> Result<PodSpec> {
        let store = self.artifacts_store();
        let mut names: Vec<String> = job.connections.clone();
        for io in compiled.inputs.iter().chain(compiled.outputs.iter()) {
            if let Some(connection) = &io.connection {
                if !names.contains(connection) {
                    names.push(connection.clone());
                }
            }
        }
        let connections = names
            .iter()
            .map(|n| lookup(&self.connections, n).map_err(|e| e.at("run.connections")))
            .collect::<Result<Vec<_>>>()?;

        let mut platform_env = env::base_env(runtime, &self.settings, plugins, name, store);
        if plugins.auth() {
            platform_env.extend(env::auth_env(&self.settings));
        }
        platform_env.extend(env::proxy_env(&self.settings));

        let ctx = UnitContext {
            settings: &self.settings,
            runtime,
            plugins,
            store,
            connections,
            platform_env,
            catalog: &self.connections,
        };
        let mut asm = PodAssembly::new();

        if plugins.auth() {
            let container = init::auth_init(&ctx, &mut asm);
            asm.pod.init_containers.push(container);
        }
        if plugins.collect_artifacts() {
            let store = store.ok_or_else(|| {
                Error::Converter("collecting artifacts requires an artifacts store".into())
            })?;
            let container = init::artifacts_init(&ctx, &mut asm, store)?;
            asm.pod.init_containers.push(container);
        }
        let mut inits = job.init.clone();
        inits.extend(io_inits(compiled));
        for (i, item) in inits.iter().enumerate() {
            let container = init::init_container(&ctx, &mut asm, i, item)?;
            asm.pod.init_containers.push(container);
        }

        let main = self.main_container(&ctx, &mut asm, compiled, job)?;
        let sidecar = sidecar::sidecar(&ctx, &mut asm)?;
        asm.pod.containers.push(main);
        asm.pod.containers.extend(sidecar);
        asm.pod.containers.extend(job.sidecars.iter().cloned());
        for volume in &job.volumes {
            asm.pod.add_volume(volume.clone());
        }
        if let Some(environment) = &job.environment {
            environment.apply_to_pod(&mut asm.pod);
        }
        Ok(asm.pod)
    }

    fn main_container(
        &self,
        ctx: &UnitContext<'_>,
        asm: &mut PodAssembly,
        compiled: &CompiledOperation,
        job: &Job,
    ) -> Result<Container> {
        let mut container = job.container.clone();
        container.name = Some(MAIN_CONTAINER.to_string());
        if container.image.is_none() {
            return Err(Error::Converter("run.container: an image is required".into()));
        }
        container.args.retain(|arg| !arg.trim().is_empty());

        let user_env = std::mem::take(&mut container.env);
        for var in &ctx.platform_env {
            container.set_env(var.clone());
        }
        for var in env::connections_env(&ctx.connections)? {
            container.set_env(var);
        }
        for var in env::extra_items_env(&self.settings) {
            container.set_env(var);
        }
        for io in compiled.inputs.iter().chain(compiled.outputs.iter()) {
            let to_env = io
                .to_env
                .clone()
                .or_else(|| compiled.params.get(&io.name).and_then(|p| p.to_env.clone()));
            if let (Some(to_env), Some(value)) = (to_env, &io.value) {
                container.set_env(EnvVar::new(to_env, stringify(value)));
            }
        }
        for var in user_env {
            container.set_env(var);
        }
        for source in env::env_from(&ctx.connections, &self.settings) {
            if !container.env_from.contains(&source) {
                container.env_from.push(source);
            }
        }

        for mount in asm.main_mounts.clone() {
            container.add_mount(mount);
        }
        if ctx.plugins.collect_artifacts() {
            container.add_mount(asm.artifacts_mount());
        }
        if ctx.plugins.auth() {
            container.add_mount(asm.auth_mount());
        }
        for connection in &ctx.connections {
            for mount in asm.connection_mounts(connection)? {
                container.add_mount(mount);
            }
        }
        if ctx.plugins.mount_artifacts_store() {
            if let Some(store) = ctx.store {
                for mount in asm.connection_mounts(store)? {
                    container.add_mount(mount);
                }
            }
        }
        for secret in self.settings.secrets.iter().filter(|s| s.is_mounted()) {
            container.add_mount(asm.mount_secret(secret));
        }
        for config_map in self.settings.config_maps.iter().filter(|c| c.is_mounted()) {
            container.add_mount(asm.mount_config_map(config_map));
        }
        if ctx.plugins.shm() && self.settings.target.is_kubernetes() {
            asm.pod.add_volume(Volume::memory(SHM_VOLUME));
            container.add_mount(VolumeMount::new(SHM_VOLUME, SHM_PATH));
        }
        if ctx.plugins.docker() {
            asm.pod.add_volume(Volume::host_path(DOCKER_VOLUME, DOCKER_SOCKET));
            container.add_mount(VolumeMount::new(DOCKER_VOLUME, DOCKER_SOCKET));
        }

        if let Run::Service(service) = &compiled.run {
            for port in &service.ports {
                if !container.ports.iter().any(|p| p.container_port == *port) {
                    container.ports.push(ContainerPort {
                        container_port: *port,
                        name: None,
                        protocol: None,
                    });
                }
            }
        }
        Ok(container)
    }
}

/// Store inits for IO entries marked `toInit` with a connection.
fn io_inits(compiled: &CompiledOperation) -> Vec<Init> {
    let mut inits = Vec::new();
    for io in compiled.inputs.iter().chain(compiled.outputs.iter()) {
        let param = compiled.params.get(&io.name);
        let to_init = io.to_init || param.map(|p| p.to_init).unwrap_or(false);
        let connection = param
            .and_then(|p| p.connection.clone())
            .or_else(|| io.connection.clone());
        let (true, Some(connection), Some(value)) = (to_init, connection, io.value.as_ref()) else {
            continue;
        };
        let paths = match value {
            Value::String(_) => vec![value.clone()],
            Value::Array(items) => items.clone(),
            _ => continue,
        };
        inits.push(Init {
            paths: Some(paths),
            connection: Some(connection),
            ..Default::default()
        });
    }
    inits
}

fn replica_count(run: &Run, role: &str) -> u32 {
    match run {
        Run::Service(service) => service.replicas.unwrap_or(1),
        other => other
            .distributed()
            .and_then(|d| d.replicas.get(role))
            .and_then(|r| r.replicas)
            .unwrap_or(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOptions, Compiler};
    use crate::connections::ConnectionKind;

    fn store() -> Connection {
        Connection::bucket("store1", ConnectionKind::S3, "s3://bucket")
    }

    fn converter(settings: ConverterSettings) -> Converter {
        Converter::new(settings)
            .with_artifacts_store(Some(store()))
            .with_connections([
                Connection::git("repo", "https://github.com/org/project.git"),
                Connection::claim("data", "data-pvc", "/data"),
            ])
    }

    fn convert_with(converter: &Converter, yaml: &str) -> Result<Resource> {
        let compiler = Compiler::new(CompileOptions::default())
            .with_connections(converter.connections().values().cloned())
            .with_artifacts_store(converter.artifacts_store().cloned());
        let compilation = compiler.compile_text(yaml, &[])?;
        let runtime = RuntimeContext::new("8f3a", "acme", "mnist");
        let compiled = compiler.resolve(&compilation.compiled, &runtime)?;
        converter.convert(&compiled, &runtime)
    }

    fn convert(yaml: &str) -> Result<Resource> {
        convert_with(&converter(ConverterSettings::default()), yaml)
    }

    fn main_container(resource: &Resource) -> &Container {
        resource.main().unwrap().spec.main_container().unwrap()
    }

    #[test]
    fn test_main_container() {
        let resource = convert(
            r#"
kind: operation
params:
  lr: {value: 0.1}
component:
  inputs:
    - {name: lr, type: float, isOptional: true, value: 0.01, toEnv: LR}
    - {name: verbose, type: bool, isOptional: true, isFlag: true, value: false}
  run:
    kind: job
    connections: [data]
    container:
      image: python
      command: [python, train.py]
      args: ["{{ params.lr.as_arg }}", "{{ params.verbose.as_arg }}"]
"#,
        )
        .unwrap();
        assert_eq!(resource.name(), "plx-operation-8f3a");
        assert_eq!(resource.metadata.labels["operation.polyaxon.com/uuid"], "8f3a");

        let main = main_container(&resource);
        assert_eq!(main.name.as_deref(), Some(MAIN_CONTAINER));
        assert_eq!(main.args, vec!["--lr=0.1"]);
        let env = |name: &str| main.get_env(name).and_then(|e| e.value.clone());
        assert_eq!(env(env::ENV_RUN_INSTANCE).as_deref(), Some("acme.mnist.runs.8f3a"));
        assert_eq!(env("LR").as_deref(), Some("0.1"));
        assert!(env(env::ENV_CONNECTION_CATALOG).unwrap().contains("data-pvc"));
        assert!(main.volume_mounts.iter().any(|m| m.mount_path == "/data"));
        assert!(main.volume_mounts.iter().any(|m| m.mount_path == CONTEXT_ARTIFACTS_ROOT));
    }

    #[test]
    fn test_auth_init_exactly_once() {
        let resource = convert(
            r#"
kind: component
run:
  kind: job
  init:
    - connection: repo
    - artifacts: {files: ["/foo"]}
    - file: {content: "print(1)", filename: main.py}
  container: {image: python}
"#,
        )
        .unwrap();
        let inits = &resource.main().unwrap().spec.init_containers;
        let names: Vec<&str> = inits.iter().filter_map(|c| c.name.as_deref()).collect();
        assert_eq!(names.iter().filter(|n| **n == AUTH_INIT_NAME).count(), 1);
        assert_eq!(names[0], AUTH_INIT_NAME);
        assert_eq!(names[1], ARTIFACTS_INIT_NAME);
        assert_eq!(inits.len(), 5);

        assert!(inits[2].args.contains(&"https://github.com/org/project.git".to_string()));
        // the default store shares the artifacts context
        let store_init = &inits[3];
        assert!(store_init
            .volume_mounts
            .iter()
            .any(|m| m.name == ARTIFACTS_VOLUME && m.mount_path == CONTEXT_ARTIFACTS_ROOT));
        assert!(store_init.args.contains(&"store1".to_string()));
    }

    #[test]
    fn test_identical_paths_share_one_volume() {
        let resource = convert(
            r#"
kind: component
run:
  kind: job
  init:
    - file: {content: "a", filename: a.txt}
      path: /plx-context/shared
    - file: {content: "b", filename: b.txt}
      path: /plx-context/shared
  container: {image: busybox}
"#,
        )
        .unwrap();
        let pod = &resource.main().unwrap().spec;
        let volume = context_volume_name("/plx-context/shared");
        assert_eq!(pod.volumes.iter().filter(|v| v.name == volume).count(), 1);
        let main = main_container(&resource);
        assert_eq!(
            main.volume_mounts
                .iter()
                .filter(|m| m.mount_path == "/plx-context/shared")
                .count(),
            1
        );
    }

    #[test]
    fn test_conflicting_default_mounts() {
        let err = convert(
            r#"
kind: component
run:
  kind: job
  init:
    - connection: repo
    - connection: repo
  container: {image: busybox}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Converter(_)));
        assert!(err.to_string().contains("run.init[1]"));
        assert!(err.to_string().contains("explicit"));
    }

    #[test]
    fn test_missing_connection() {
        let err = convert(
            r#"
kind: component
run:
  kind: job
  connections: [unknown]
  container: {image: busybox}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Converter(_)));
        assert!(err.to_string().contains("unknown"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_docker_runtime() {
        let docker = converter(ConverterSettings {
            target: RuntimeTarget::Docker,
            ..Default::default()
        });
        let resource = convert_with(&docker, "kind: component\nrun: {kind: job, container: {image: busybox}}").unwrap();
        let pod = &resource.main().unwrap().spec;
        assert_eq!(pod.containers.len(), 1);

        let err = convert_with(
            &docker,
            "kind: component\nrun: {kind: service, ports: [8080], container: {image: nginx}}",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Compiler(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_sidecar_and_plugins() {
        let resource = convert("kind: component\nrun: {kind: job, container: {image: busybox}}").unwrap();
        let pod = &resource.main().unwrap().spec;
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name.as_deref(), Some(SIDECAR_NAME));
        assert!(pod.containers[1].args.contains(&MAIN_CONTAINER.to_string()));

        let bare = Converter::new(ConverterSettings::default());
        let resource = convert_with(
            &bare,
            r#"
kind: component
plugins: {auth: false, collectArtifacts: false, collectLogs: false, collectResources: false}
run: {kind: job, container: {image: busybox}}
"#,
        )
        .unwrap();
        let pod = &resource.main().unwrap().spec;
        assert!(pod.init_containers.is_empty());
        assert_eq!(pod.containers.len(), 1);
    }

    #[test]
    fn test_distributed_replicas() {
        let resource = convert(
            r#"
kind: component
termination: {maxRetries: 3, timeout: 600}
run:
  kind: pytorchjob
  master:
    replicas: 1
    container: {image: pytorch, args: ["--role={{ globals.replica }}"]}
  worker:
    replicas: 2
    container: {image: pytorch, args: ["--role={{ globals.replica }}"]}
"#,
        )
        .unwrap();
        assert_eq!(resource.kind, RunKind::Pytorchjob);
        assert_eq!(resource.termination.backoff_limit, Some(3));
        assert_eq!(resource.termination.active_deadline_seconds, Some(600));
        assert_eq!(resource.replicas.len(), 2);
        let worker = &resource.replicas["worker"];
        assert_eq!(worker.replicas, 2);
        assert_eq!(worker.metadata.name, "plx-operation-8f3a-worker");
        assert_eq!(worker.spec.main_container().unwrap().args, vec!["--role=worker"]);
        let auth_inits = worker
            .spec
            .init_containers
            .iter()
            .filter(|c| c.name.as_deref() == Some(AUTH_INIT_NAME))
            .count();
        assert_eq!(auth_inits, 1);
    }

    #[test]
    fn test_runtime_target_parsing() {
        assert_eq!("docker".parse::<RuntimeTarget>().unwrap(), RuntimeTarget::Docker);
        assert_eq!("K8S".parse::<RuntimeTarget>().unwrap(), RuntimeTarget::Kubernetes);
        assert!("nomad".parse::<RuntimeTarget>().is_err());
        assert!(RuntimeTarget::Kubernetes.check(RunKind::Dag).is_err());
    }
}
