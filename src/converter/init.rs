//! Init containers: auth, artifacts path and one per `Init` directive.

use ring::digest::{digest, SHA256};
use serde_json::json;

use super::env::{connections_env, env_from, ENV_SSH_PATH};
use super::{PodAssembly, UnitContext};
use crate::compiler::{CONTEXT_ARTIFACTS_ROOT, CONTEXT_ROOT};
use crate::connections::Connection;
use crate::error::{Error, Result};
use crate::flow::{Init, InitDirective};
use crate::k8s::{Container, EnvVar};

pub const AUTH_INIT_NAME: &str = "polyaxon-init-auth";
pub const ARTIFACTS_INIT_NAME: &str = "polyaxon-init-artifacts";
const INIT_PREFIX: &str = "polyaxon-init";

/// Volume name for a context mount path; equal paths share one volume.
pub fn context_volume_name(path: &str) -> String {
    let hash = digest(&SHA256, path.trim_end_matches('/').as_bytes());
    format!("init-{}", &hex::encode(hash.as_ref())[..16])
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Writes the service token into the shared auth context.
pub fn auth_init(ctx: &UnitContext<'_>, asm: &mut PodAssembly) -> Container {
    let mut container = ctx
        .init_container(AUTH_INIT_NAME)
        .with_args(strings(["polyaxon", "initializer", "auth"]));
    container.add_mount(asm.auth_mount());
    container
}

/// Creates the run's output directory, pulling prior contents on auto-resume.
pub fn artifacts_init(ctx: &UnitContext<'_>, asm: &mut PodAssembly, store: &Connection) -> Result<Container> {
    let store_path = store.store_path().ok_or_else(|| {
        Error::Converter(format!(
            "artifacts store `{}` of kind `{}` has no store path",
            store.name, store.kind
        ))
    })?;
    let mut args = strings(["polyaxon", "initializer", "path"]);
    push_flag(&mut args, "--connection-name", store.name.clone());
    push_flag(&mut args, "--connection-kind", store.kind.as_str());
    push_flag(&mut args, "--path-to", ctx.runtime.run_outputs_path());
    if ctx.plugins.auto_resume() {
        push_flag(&mut args, "--path-from", format!("{}/{}", store_path, ctx.runtime.uuid));
        args.push("--sync".to_string());
    }

    let mut container = ctx.init_container(ARTIFACTS_INIT_NAME).with_args(args);
    container.add_mount(asm.artifacts_mount());
    for mount in asm.connection_mounts(store)? {
        container.add_mount(mount);
    }
    attach_connection(&mut container, store, ctx)?;
    Ok(container)
}

/// Build the init container for one directive.
pub fn init_container(
    ctx: &UnitContext<'_>,
    asm: &mut PodAssembly,
    index: usize,
    init: &Init,
) -> Result<Container> {
    let at = |e: Error| e.at(&format!("run.init[{}]", index));
    let connection = init
        .connection
        .as_deref()
        .map(|name| ctx.connection(name))
        .transpose()
        .map_err(at)?;

    let container = match init.directive().map_err(at)? {
        InitDirective::Git => git_init(ctx, asm, index, init, connection),
        InitDirective::Store => {
            let connection = connection.ok_or_else(|| {
                Error::Converter("store init has no connection and no artifacts store is configured".into())
            });
            connection.and_then(|c| store_init(ctx, asm, index, init, c))
        }
        InitDirective::Connection => match connection {
            Some(c) if c.is_git() => git_init(ctx, asm, index, init, Some(c)),
            Some(c) if c.kind.is_artifact_store() => store_init(ctx, asm, index, init, c),
            Some(c) => Err(Error::Converter(format!(
                "connection `{}` of kind `{}` cannot initialize a run",
                c.name, c.kind
            ))),
            None => Err(Error::Converter("init requires a connection".into())),
        },
        InitDirective::Dockerfile => dockerfile_init(ctx, asm, index, init),
        InitDirective::File => file_init(ctx, asm, index, init),
        InitDirective::Tensorboard => tensorboard_init(ctx, asm, index, init),
        InitDirective::Custom => custom_init(ctx, asm, index, init, connection),
    };
    container.map_err(at)
}

fn init_name(kind: &str, index: usize) -> String {
    format!("{}-{}-{}", INIT_PREFIX, kind, index)
}

fn attach_connection(container: &mut Container, connection: &Connection, ctx: &UnitContext<'_>) -> Result<()> {
    for var in connections_env(&[connection])? {
        container.set_env(var);
    }
    for source in env_from(&[connection], ctx.settings) {
        if !container.env_from.contains(&source) {
            container.env_from.push(source);
        }
    }
    Ok(())
}

fn git_init(
    ctx: &UnitContext<'_>,
    asm: &mut PodAssembly,
    index: usize,
    init: &Init,
    connection: Option<&Connection>,
) -> Result<Container> {
    let base = connection.and_then(Connection::git_schema).unwrap_or_default();
    let schema = match &init.git {
        Some(overrides) => base.patch(overrides),
        None => base,
    };
    let url = schema
        .url
        .clone()
        .ok_or_else(|| Error::Converter("git init requires a repository url".into()))?;
    let repo = schema
        .repo_name()
        .or_else(|| connection.map(|c| c.name.clone()))
        .unwrap_or_else(|| "repo".to_string());
    let mount = asm.claim_mount(index, init.path.as_deref(), format!("{}/{}", CONTEXT_ROOT, repo))?;

    let mut args = strings(["polyaxon", "initializer", "git"]);
    push_flag(&mut args, "--repo-path", mount.mount_path.clone());
    push_flag(&mut args, "--url", url);
    if let Some(revision) = &schema.revision {
        push_flag(&mut args, "--revision", revision.clone());
    }
    if !schema.flags.is_empty() {
        push_flag(&mut args, "--flags", serde_json::to_string(&schema.flags)?);
    }

    let mut container = ctx.init_container(&init_name("git", index)).with_args(args);
    container.add_mount(mount);
    if let Some(connection) = connection {
        push_flag(&mut container.args, "--connection", connection.name.clone());
        for m in asm.connection_mounts(connection)? {
            container.add_mount(m);
        }
        attach_connection(&mut container, connection, ctx)?;
        if let Some(path) = connection.secret.as_ref().and_then(|s| s.mount_path.clone()) {
            if schema.is_ssh() {
                container.set_env(EnvVar::new(ENV_SSH_PATH, path));
            }
        }
    }
    Ok(container)
}

fn store_init(
    ctx: &UnitContext<'_>,
    asm: &mut PodAssembly,
    index: usize,
    init: &Init,
    connection: &Connection,
) -> Result<Container> {
    let is_default_store = ctx.store.map(|s| s.name == connection.name).unwrap_or(false);
    let default_path = if is_default_store {
        CONTEXT_ARTIFACTS_ROOT.to_string()
    } else {
        format!("{}/{}", CONTEXT_ROOT, connection.name)
    };
    let mount = asm.claim_mount(index, init.path.as_deref(), default_path)?;

    let mut args = strings(["polyaxon", "initializer", "path"]);
    push_flag(&mut args, "--connection-name", connection.name.clone());
    push_flag(&mut args, "--connection-kind", connection.kind.as_str());
    push_flag(&mut args, "--path-to", mount.mount_path.clone());
    if let Some(root) = connection.store_path() {
        push_flag(&mut args, "--store-path", root);
    }
    if let Some(artifacts) = &init.artifacts {
        if !artifacts.files.is_empty() {
            push_flag(&mut args, "--files", serde_json::to_string(&artifacts.files)?);
        }
        if !artifacts.dirs.is_empty() {
            push_flag(&mut args, "--dirs", serde_json::to_string(&artifacts.dirs)?);
        }
        if let Some(workers) = artifacts.workers {
            push_flag(&mut args, "--workers", workers.to_string());
        }
    }
    let pairs: Vec<[String; 2]> = init
        .path_pairs()
        .into_iter()
        .map(|(from, to)| {
            let to = to.unwrap_or_else(|| from.clone());
            [from, to]
        })
        .collect();
    if !pairs.is_empty() {
        push_flag(&mut args, "--paths", serde_json::to_string(&pairs)?);
    }

    let mut container = ctx.init_container(&init_name("store", index)).with_args(args);
    container.add_mount(mount);
    for m in asm.connection_mounts(connection)? {
        container.add_mount(m);
    }
    attach_connection(&mut container, connection, ctx)?;
    Ok(container)
}

fn dockerfile_init(ctx: &UnitContext<'_>, asm: &mut PodAssembly, index: usize, init: &Init) -> Result<Container> {
    let Some(dockerfile) = &init.dockerfile else {
        return Err(Error::Converter("dockerfile init has no dockerfile".into()));
    };
    let mount = asm.claim_mount(index, init.path.as_deref(), format!("{}/dockerfile", CONTEXT_ROOT))?;
    let mut args = strings(["polyaxon", "docker", "generate"]);
    push_flag(&mut args, "--build-context", serde_json::to_string(dockerfile)?);
    push_flag(&mut args, "--destination", mount.mount_path.clone());
    push_flag(&mut args, "--copy-path", ctx.runtime.run_outputs_path());

    let mut container = ctx.init_container(&init_name("dockerfile", index)).with_args(args);
    container.add_mount(mount);
    container.add_mount(asm.artifacts_mount());
    Ok(container)
}

fn file_init(ctx: &UnitContext<'_>, asm: &mut PodAssembly, index: usize, init: &Init) -> Result<Container> {
    let Some(file) = &init.file else {
        return Err(Error::Converter("file init has no file".into()));
    };
    let mount = asm.claim_mount(index, init.path.as_deref(), format!("{}/file", CONTEXT_ROOT))?;
    let context = json!({
        "filename": file.filename(),
        "content": file.content,
        "kind": file.kind,
        "chmod": file.chmod,
    });
    let mut args = strings(["polyaxon", "initializer", "file"]);
    push_flag(&mut args, "--file-context", serde_json::to_string(&context)?);
    push_flag(&mut args, "--filepath", mount.mount_path.clone());
    push_flag(&mut args, "--copy-path", ctx.runtime.run_outputs_path());

    let mut container = ctx.init_container(&init_name("file", index)).with_args(args);
    container.add_mount(mount);
    container.add_mount(asm.artifacts_mount());
    Ok(container)
}

fn tensorboard_init(ctx: &UnitContext<'_>, asm: &mut PodAssembly, index: usize, init: &Init) -> Result<Container> {
    let Some(tensorboard) = &init.tensorboard else {
        return Err(Error::Converter("tensorboard init has no tensorboard".into()));
    };
    let store = ctx
        .store
        .ok_or_else(|| Error::Converter("tensorboard init requires an artifacts store".into()))?;
    let store_path = store.store_path().unwrap_or_default();
    let mount = asm.claim_mount(index, init.path.as_deref(), format!("{}/tensorboard", CONTEXT_ROOT))?;

    let mut args = strings(["polyaxon", "initializer", "tensorboard"]);
    push_flag(&mut args, "--context-from", store_path);
    push_flag(&mut args, "--context-to", mount.mount_path.clone());
    push_flag(&mut args, "--connection-kind", store.kind.as_str());
    push_flag(&mut args, "--uuids", tensorboard.uuids.join(","));
    if tensorboard.use_names {
        args.push("--use-names".to_string());
    }
    if let Some(prefix) = &tensorboard.path_prefix {
        push_flag(&mut args, "--path-prefix", prefix.clone());
    }
    if !tensorboard.plugins.is_empty() {
        push_flag(&mut args, "--plugins", tensorboard.plugins.join(","));
    }

    let mut container = ctx.init_container(&init_name("tensorboard", index)).with_args(args);
    container.add_mount(mount);
    for m in asm.connection_mounts(store)? {
        container.add_mount(m);
    }
    attach_connection(&mut container, store, ctx)?;
    Ok(container)
}

fn custom_init(
    ctx: &UnitContext<'_>,
    asm: &mut PodAssembly,
    index: usize,
    init: &Init,
    connection: Option<&Connection>,
) -> Result<Container> {
    let Some(user) = &init.container else {
        return Err(Error::Converter("custom init has no container".into()));
    };
    let mut container = user.clone();
    if container.name.is_none() {
        container.name = Some(init_name("custom", index));
    }
    if container.image.is_none() {
        return Err(Error::Converter("custom init container requires an image".into()));
    }
    if let Some(path) = init.path.as_deref() {
        let mount = asm.claim_mount(index, Some(path), path.to_string())?;
        container.add_mount(mount);
    }
    if ctx.plugins.collect_artifacts() {
        container.add_mount(asm.artifacts_mount());
    }
    for var in &ctx.platform_env {
        if container.get_env(&var.name).is_none() {
            container.env.push(var.clone());
        }
    }
    let connections: Vec<&Connection> = match connection {
        Some(c) => vec![c],
        None => ctx.connections.clone(),
    };
    for connection in connections {
        for m in asm.connection_mounts(connection)? {
            container.add_mount(m);
        }
        attach_connection(&mut container, connection, ctx)?;
    }
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_volume_name_is_stable() {
        let a = context_volume_name("/plx-context/data");
        assert_eq!(a, context_volume_name("/plx-context/data/"));
        assert_ne!(a, context_volume_name("/plx-context/other"));
        assert!(a.starts_with("init-"));
        assert_eq!(a.len(), "init-".len() + 16);
    }
}
