use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use polyflow::agent::{
    heartbeat, Agent, ControlPlane, DockerExecutor, DryRunExecutor, Executor, Handlers,
    HttpControlPlane, KubernetesExecutor,
};
use polyflow::compiler::{CompileOptions, Compiler, RuntimeContext};
use polyflow::config::Config;
use polyflow::converter::{Converter, RuntimeTarget};
use polyflow::flow::{read_preset, read_spec_file, Param};
use polyflow::shutdown::ShutdownCoordinator;
use polyflow::telemetry::{init_logging, LogConfig};

#[derive(Parser)]
#[command(name = "polyflow")]
#[command(about = "Compile ML workflow specs and reconcile runs on a container runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/polyflow/config.toml)
    #[arg(long, global = true, env = "POLYFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconcile agent until SIGINT/SIGTERM
    Agent,
    /// Compile a spec and print the result as JSON
    Compile {
        /// Path to a component, operation or compiled operation (YAML or JSON)
        file: PathBuf,
        /// Preset files applied in order
        #[arg(long = "preset")]
        presets: Vec<PathBuf>,
        /// Parameter values (key=value, value parsed as YAML)
        #[arg(short, long = "param", value_parser = parse_var)]
        params: Vec<(String, String)>,
        /// Leave hub references to the control plane
        #[arg(long)]
        ignore_hub_validation: bool,
        /// Also run the runtime pass
        #[arg(long)]
        resolve: bool,
        /// Run uuid for the runtime pass (random when omitted)
        #[arg(long)]
        uuid: Option<String>,
        /// Print the runtime resource instead of the compiled operation
        #[arg(long)]
        convert: bool,
    },
    /// Exit 0 when the agent heartbeat is fresh
    Pong,
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid parameter format '{}'. Expected key=value", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&LogConfig::new("info"));

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = e
                .downcast_ref::<polyflow::Error>()
                .map(|err| err.exit_code())
                .unwrap_or(1);
            eprintln!("Error: {:#}", e);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Agent => {
            cmd_agent(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compile {
            file,
            presets,
            params,
            ignore_hub_validation,
            resolve,
            uuid,
            convert,
        } => {
            let uuid = (resolve || convert || uuid.is_some())
                .then(|| uuid.unwrap_or_else(|| Uuid::new_v4().simple().to_string()));
            let output = cmd_compile(
                &config,
                &file,
                &presets,
                params,
                ignore_hub_validation,
                uuid.as_deref(),
                convert,
            )?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pong => {
            let path = config.heartbeat_path();
            if heartbeat::pong(&path, config.heartbeat_freshness())? {
                println!("pong");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("Heartbeat at {} is stale or missing", path.display());
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn compiler_for(config: &Config, ignore_hub_validation: bool) -> polyflow::Result<Compiler> {
    Ok(Compiler::new(CompileOptions {
        ignore_hub_validation,
        is_template: false,
    })
    .with_connections(config.agent.connections.clone())
    .with_artifacts_store(config.artifacts_store()?))
}

fn converter_for(config: &Config) -> polyflow::Result<Converter> {
    Ok(Converter::new(config.to_converter_settings()?)
        .with_connections(config.agent.connections.clone())
        .with_artifacts_store(config.artifacts_store()?))
}

fn cmd_compile(
    config: &Config,
    file: &Path,
    presets: &[PathBuf],
    params: Vec<(String, String)>,
    ignore_hub_validation: bool,
    uuid: Option<&str>,
    convert: bool,
) -> anyhow::Result<Value> {
    let compiler = compiler_for(config, ignore_hub_validation)?;
    let spec = read_spec_file(file)?;
    let mut preset_ops = Vec::new();
    for path in presets {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read preset {}", path.display()))?;
        preset_ops.push(read_preset(&content)?);
    }

    let compilation = if params.is_empty() {
        compiler.compile_spec(spec, &preset_ops)?
    } else {
        let mut op = spec.into_operation()?;
        for (name, raw) in params {
            let value: Value = serde_yaml::from_str(&raw).unwrap_or(Value::String(raw));
            op.params.insert(name, Param::literal(value));
        }
        compiler.compile(op, &preset_ops)?
    };

    let Some(uuid) = uuid else {
        return Ok(serde_json::to_value(&compilation.compiled)?);
    };
    let (owner, project) = run_owner(config);
    let runtime = RuntimeContext::new(uuid, owner, project);
    let resolved = compiler.resolve(&compilation.compiled, &runtime)?;
    if convert {
        let resource = converter_for(config)?.convert(&resolved, &runtime)?;
        Ok(resource.to_value()?)
    } else {
        Ok(serde_json::to_value(&resolved)?)
    }
}

/// Owner and project from `owner.project.runs.uuid`, when set.
fn run_owner(config: &Config) -> (String, String) {
    config
        .client
        .run_instance
        .as_deref()
        .and_then(|instance| {
            let mut parts = instance.splitn(3, '.');
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .unwrap_or_else(|| ("local".to_string(), "default".to_string()))
}

async fn cmd_agent(config: Config) -> anyhow::Result<()> {
    let (owner, agent_id) = config.agent.owner_and_id()?;
    let host = config
        .client
        .host
        .clone()
        .ok_or_else(|| polyflow::Error::Config("control plane host is not set (POLYAXON_HOST)".into()))?;
    let control_plane: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
        host,
        owner,
        agent_id,
        config.client.token.as_deref(),
        Duration::from_secs(config.client.timeout_secs),
    )?);

    let converter = converter_for(&config)?;
    let executor: Arc<dyn Executor> = if config.client.no_op {
        Arc::new(DryRunExecutor)
    } else {
        match converter.settings().target {
            RuntimeTarget::Docker => Arc::new(DockerExecutor::default()),
            RuntimeTarget::Kubernetes => Arc::new(KubernetesExecutor::new(config.kube_settings())?),
        }
    };
    executor.refresh().await?;

    let handlers = Handlers::new(compiler_for(&config, false)?, converter, control_plane.clone(), executor);
    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    info!(
        runtime = %config.agent.runtime,
        no_op = config.client.no_op,
        "Starting agent"
    );
    let agent = Agent::new(control_plane, handlers, config.agent_settings(), shutdown);
    agent.run().await?;
    Ok(())
}
