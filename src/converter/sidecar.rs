//! Log, metric and artifact streaming sidecar.

use super::env::connections_env;
use super::{PodAssembly, UnitContext, MAIN_CONTAINER};
use crate::error::Result;
use crate::k8s::Container;

pub const SIDECAR_NAME: &str = "polyaxon-sidecar";

/// The sidecar, or `None` when no collector is enabled or the runtime has no sidecars.
pub fn sidecar(ctx: &UnitContext<'_>, asm: &mut PodAssembly) -> Result<Option<Container>> {
    if !ctx.settings.target.supports_sidecar() || !ctx.plugins.needs_sidecar() {
        return Ok(None);
    }
    let overrides = ctx.plugins.sidecar.clone().unwrap_or_default();
    let sleep_interval = overrides.sleep_interval.unwrap_or(ctx.settings.sleep_interval);
    let sync_interval = overrides.sync_interval.unwrap_or(ctx.settings.sync_interval);

    let mut container = Container::named(SIDECAR_NAME)
        .with_image(ctx.settings.sidecar_image.clone())
        .with_args([
            "polyaxon".to_string(),
            "sidecar".to_string(),
            "--container-id".to_string(),
            MAIN_CONTAINER.to_string(),
            "--sleep-interval".to_string(),
            sleep_interval.to_string(),
            "--sync-interval".to_string(),
            sync_interval.to_string(),
        ]);
    container.image_pull_policy = Some("IfNotPresent".to_string());
    container.env = ctx.platform_env.clone();

    if ctx.plugins.auth() {
        container.add_mount(asm.auth_mount());
    }
    if ctx.plugins.collect_artifacts() {
        container.add_mount(asm.artifacts_mount());
        if let Some(store) = ctx.store {
            for mount in asm.connection_mounts(store)? {
                container.add_mount(mount);
            }
            for var in connections_env(&[store])? {
                container.set_env(var);
            }
        }
    }
    Ok(Some(container))
}
