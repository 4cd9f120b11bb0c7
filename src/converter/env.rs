//! Env var assembly for platform-injected and main containers.

use serde_json::Value;

use super::ConverterSettings;
use crate::compiler::RuntimeContext;
use crate::connections::{Connection, ResourceRef};
use crate::error::Result;
use crate::flow::Plugins;
use crate::k8s::{EnvFromSource, EnvVar};

pub const ENV_RUN_INSTANCE: &str = "POLYAXON_RUN_INSTANCE";
pub const ENV_K8S_NAMESPACE: &str = "POLYAXON_K8S_NAMESPACE";
pub const ENV_K8S_POD_ID: &str = "POLYAXON_K8S_POD_ID";
pub const ENV_RESOURCE_NAME: &str = "POLYAXON_RESOURCE_NAME";
pub const ENV_NO_API: &str = "POLYAXON_NO_API";
pub const ENV_LOG_LEVEL: &str = "POLYAXON_LOG_LEVEL";
pub const ENV_HOST: &str = "POLYAXON_HOST";
pub const ENV_AUTH_TOKEN: &str = "POLYAXON_AUTH_TOKEN";
pub const ENV_HEADER: &str = "POLYAXON_HEADER";
pub const ENV_ARTIFACTS_STORE_NAME: &str = "POLYAXON_ARTIFACTS_STORE_NAME";
pub const ENV_COLLECT_ARTIFACTS: &str = "POLYAXON_COLLECT_ARTIFACTS";
pub const ENV_COLLECT_RESOURCES: &str = "POLYAXON_COLLECT_RESOURCES";
pub const ENV_CONNECTION_CATALOG: &str = "POLYAXON_CONNECTION_CATALOG";
pub const ENV_SSH_PATH: &str = "SSH_PATH";

/// Header value marking calls from platform-injected containers.
const INTERNAL_HEADER: &str = "X_POLYAXON_INTERNAL";
/// Key of the service token inside the auth secret.
const AUTH_TOKEN_KEY: &str = "token";

/// Run identity, namespace and logging switches.
pub fn base_env(
    runtime: &RuntimeContext,
    settings: &ConverterSettings,
    plugins: &Plugins,
    resource_name: &str,
    store: Option<&Connection>,
) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar::new(
            ENV_RUN_INSTANCE,
            format!(
                "{}.{}.runs.{}",
                runtime.owner_name, runtime.project_name, runtime.uuid
            ),
        ),
        EnvVar::new(ENV_RESOURCE_NAME, resource_name),
    ];
    if let Some(namespace) = runtime.namespace.as_ref().or(settings.namespace.as_ref()) {
        env.push(EnvVar::new(ENV_K8S_NAMESPACE, namespace.clone()));
    }
    if settings.target.is_kubernetes() {
        env.push(EnvVar::from_field(ENV_K8S_POD_ID, "metadata.name"));
    }
    if settings.no_api {
        env.push(EnvVar::new(ENV_NO_API, "true"));
    }
    if let Some(level) = plugins.log_level.as_ref().or(settings.log_level.as_ref()) {
        env.push(EnvVar::new(ENV_LOG_LEVEL, level.clone()));
    }
    if let Some(store) = store {
        env.push(EnvVar::new(ENV_ARTIFACTS_STORE_NAME, store.name.clone()));
    }
    env.push(EnvVar::new(ENV_COLLECT_ARTIFACTS, plugins.collect_artifacts().to_string()));
    env.push(EnvVar::new(ENV_COLLECT_RESOURCES, plugins.collect_resources().to_string()));
    env
}

/// Service auth: host, token and the internal header.
pub fn auth_env(settings: &ConverterSettings) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(host) = &settings.host {
        env.push(EnvVar::new(ENV_HOST, host.clone()));
    }
    if let Some(secret) = &settings.auth_secret {
        env.push(EnvVar::from_secret(ENV_AUTH_TOKEN, secret, AUTH_TOKEN_KEY));
    }
    env.push(EnvVar::new(ENV_HEADER, INTERNAL_HEADER));
    env
}

pub fn proxy_env(settings: &ConverterSettings) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(proxy) = &settings.http_proxy {
        env.push(EnvVar::new("HTTP_PROXY", proxy.clone()));
    }
    if let Some(proxy) = &settings.https_proxy {
        env.push(EnvVar::new("HTTPS_PROXY", proxy.clone()));
    }
    if let Some(no_proxy) = &settings.no_proxy {
        env.push(EnvVar::new("NO_PROXY", no_proxy.clone()));
    }
    env
}

/// The JSON catalog of every connection plus their own env vars.
pub fn connections_env(connections: &[&Connection]) -> Result<Vec<EnvVar>> {
    if connections.is_empty() {
        return Ok(vec![]);
    }
    let catalog: Vec<Value> = connections.iter().map(|c| c.catalog_entry()).collect();
    let mut env = vec![EnvVar::new(
        ENV_CONNECTION_CATALOG,
        serde_json::to_string(&serde_json::json!({ "connections": catalog }))?,
    )];
    for connection in connections {
        env.extend(connection.env_vars());
    }
    Ok(env)
}

/// `envFrom` sources for wholesale secrets and config maps.
pub fn env_from(connections: &[&Connection], settings: &ConverterSettings) -> Vec<EnvFromSource> {
    let mut sources = Vec::new();
    let mut push = |source: EnvFromSource| {
        if !sources.contains(&source) {
            sources.push(source);
        }
    };
    let secrets = connections
        .iter()
        .filter_map(|c| c.secret.as_ref())
        .chain(settings.secrets.iter());
    for secret in secrets.filter(|s| s.is_env_from()) {
        push(EnvFromSource::secret(&secret.name));
    }
    let config_maps = connections
        .iter()
        .filter_map(|c| c.config_map.as_ref())
        .chain(settings.config_maps.iter());
    for config_map in config_maps.filter(|c| c.is_env_from()) {
        push(EnvFromSource::config_map(&config_map.name));
    }
    sources
}

/// Keyed items of the agent's extra secrets and config maps.
pub fn extra_items_env(settings: &ConverterSettings) -> Vec<EnvVar> {
    let keyed = |r: &&ResourceRef| !r.is_mounted() && !r.items.is_empty();
    let mut env = Vec::new();
    for secret in settings.secrets.iter().filter(keyed) {
        for key in &secret.items {
            env.push(EnvVar::from_secret(key.clone(), &secret.name, key));
        }
    }
    for config_map in settings.config_maps.iter().filter(keyed) {
        for key in &config_map.items {
            env.push(EnvVar::from_config_map(key.clone(), &config_map.name, key));
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionKind;

    #[test]
    fn test_base_env() {
        let runtime = RuntimeContext::new("u1", "acme", "mnist");
        let settings = ConverterSettings {
            namespace: Some("polyaxon".into()),
            no_api: true,
            ..Default::default()
        };
        let env = base_env(&runtime, &settings, &Plugins::default(), "plx-operation-u1", None);
        let get = |name: &str| env.iter().find(|e| e.name == name).and_then(|e| e.value.clone());
        assert_eq!(get(ENV_RUN_INSTANCE).as_deref(), Some("acme.mnist.runs.u1"));
        assert_eq!(get(ENV_K8S_NAMESPACE).as_deref(), Some("polyaxon"));
        assert_eq!(get(ENV_NO_API).as_deref(), Some("true"));
        assert!(get(ENV_LOG_LEVEL).is_none());
        assert!(env.iter().any(|e| e.name == ENV_K8S_POD_ID && e.value_from.is_some()));
    }

    #[test]
    fn test_catalog_and_env_from() {
        let store = Connection::bucket("store", ConnectionKind::S3, "s3://bucket")
            .with_secret(ResourceRef::new("aws-creds"));
        let mut keyed = Connection::bucket("gcs", ConnectionKind::Gcs, "gs://bucket");
        keyed.secret = Some(ResourceRef {
            name: "gcs-creds".into(),
            items: vec!["GC_KEY".into()],
            ..Default::default()
        });
        let env = connections_env(&[&store, &keyed]).unwrap();
        let catalog = env.iter().find(|e| e.name == ENV_CONNECTION_CATALOG).unwrap();
        let parsed: Value = serde_json::from_str(catalog.value.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["connections"][0]["name"], "store");
        assert!(env.iter().any(|e| e.name == "GC_KEY"));

        let sources = env_from(&[&store, &keyed], &ConverterSettings::default());
        assert_eq!(sources, vec![EnvFromSource::secret("aws-creds")]);
    }

    #[test]
    fn test_proxy_and_auth() {
        let settings = ConverterSettings {
            https_proxy: Some("http://proxy:3128".into()),
            host: Some("https://polyaxon.local".into()),
            auth_secret: Some("agent-secret".into()),
            ..Default::default()
        };
        let proxy = proxy_env(&settings);
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy[0].name, "HTTPS_PROXY");
        let auth = auth_env(&settings);
        assert!(auth.iter().any(|e| e.name == ENV_AUTH_TOKEN && e.value_from.is_some()));
        assert!(auth.iter().any(|e| e.name == ENV_HEADER));
    }
}
