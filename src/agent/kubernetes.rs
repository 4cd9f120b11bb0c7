//! Kubernetes driver: runs are submitted as `Operation` custom resources
//! and reconciled into pods by the cluster-side operator.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Certificate, Client, Response};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use super::executor::Executor;
use crate::converter::{resource_name, Resource};
use crate::error::{Error, Result};
use crate::flow::RunKind;

pub const OPERATION_GROUP: &str = "core.polyaxon.com";
pub const OPERATION_VERSION: &str = "v1";
pub const OPERATION_PLURAL: &str = "operations";
pub const OPERATION_KIND: &str = "Operation";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where and how to reach the API server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubeSettings {
    /// API server URL; in-cluster discovery when unset.
    pub api: Option<String>,
    pub namespace: String,
    pub token_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub timeout: Duration,
}

pub struct KubernetesExecutor {
    client: Client,
    api: String,
    namespace: String,
    token_path: Option<PathBuf>,
    headers: RwLock<HeaderMap>,
}

fn read_token(path: &Path) -> Result<HeaderMap> {
    let token = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read token {}: {}", path.display(), e)))?;
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
        .map_err(|e| Error::Config(format!("invalid token in {}: {}", path.display(), e)))?;
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

impl KubernetesExecutor {
    pub fn new(settings: KubeSettings) -> Result<Self> {
        let in_cluster = Path::new(SERVICE_ACCOUNT_DIR);
        let api = match settings.api {
            Some(api) => api,
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    Error::Config("no kubernetes api configured and not running in a cluster".into())
                })?;
                let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
                format!("https://{}:{}", host, port)
            }
        };
        let token_path = settings.token_path.or_else(|| {
            let path = in_cluster.join("token");
            path.exists().then_some(path)
        });
        let ca_path = settings.ca_path.or_else(|| {
            let path = in_cluster.join("ca.crt");
            path.exists().then_some(path)
        });

        let mut builder = Client::builder().timeout(settings.timeout);
        if let Some(ca_path) = &ca_path {
            let pem = std::fs::read(ca_path)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }
        let headers = match &token_path {
            Some(path) => read_token(path)?,
            None => HeaderMap::new(),
        };
        Ok(Self {
            client: builder.build()?,
            api: api.trim_end_matches('/').to_string(),
            namespace: settings.namespace,
            token_path,
            headers: RwLock::new(headers),
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}",
            self.api, OPERATION_GROUP, OPERATION_VERSION, self.namespace, OPERATION_PLURAL
        )
    }

    fn item_url(&self, uuid: &str) -> String {
        format!("{}/{}", self.collection_url(), resource_name(uuid))
    }

    fn headers(&self) -> HeaderMap {
        self.headers.read().map(|h| h.clone()).unwrap_or_default()
    }

    /// The custom resource wrapping a converted run.
    pub fn manifest(&self, kind: RunKind, resource: &Resource) -> Result<Value> {
        let mut body = resource.to_value()?;
        if let Value::Object(map) = &mut body {
            map.remove("kind");
            map.insert("apiVersion".into(), json!(format!("{}/{}", OPERATION_GROUP, OPERATION_VERSION)));
            map.insert("kind".into(), json!(OPERATION_KIND));
            map.insert("runKind".into(), json!(kind.as_str()));
            if let Some(Value::Object(meta)) = map.get_mut("metadata") {
                meta.entry("namespace").or_insert_with(|| json!(self.namespace));
            }
        }
        Ok(body)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = request.headers(self.headers()).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::executor(Some(status.as_u16()), body))
    }

    async fn merge_patch(&self, uuid: &str, body: &Value) -> Result<()> {
        let request = self
            .client
            .patch(self.item_url(uuid))
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(body)?);
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn create(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        let manifest = self.manifest(kind, resource)?;
        self.send(self.client.post(self.collection_url()).json(&manifest)).await?;
        info!(run_uuid = %uuid, resource = %resource.name(), "Created operation resource");
        Ok(())
    }

    async fn apply(&self, uuid: &str, kind: RunKind, resource: &Resource) -> Result<()> {
        let manifest = self.manifest(kind, resource)?;
        match self.merge_patch(uuid, &manifest).await {
            Err(e) if e.is_not_found() => self.create(uuid, kind, resource).await,
            other => other,
        }
    }

    async fn stop(&self, uuid: &str, _kind: RunKind) -> Result<()> {
        self.send(self.client.delete(self.item_url(uuid))).await?;
        debug!(run_uuid = %uuid, "Deleted operation resource");
        Ok(())
    }

    async fn get(&self, uuid: &str, _kind: RunKind) -> Result<Value> {
        Ok(self.send(self.client.get(self.item_url(uuid))).await?.json().await?)
    }

    /// Drop finalizers so a stuck resource can be garbage collected.
    async fn clean(&self, uuid: &str, _kind: RunKind) -> Result<()> {
        match self.merge_patch(uuid, &json!({"metadata": {"finalizers": null}})).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Re-read the service account token, which the kubelet rotates.
    async fn refresh(&self) -> Result<()> {
        let Some(path) = &self.token_path else {
            return Ok(());
        };
        let headers = read_token(path)?;
        if let Ok(mut current) = self.headers.write() {
            *current = headers;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::Replica;
    use crate::flow::TerminationSpec;
    use crate::k8s::{ObjectMeta, PodSpec};
    use indexmap::IndexMap;

    fn executor(token_path: Option<PathBuf>) -> KubernetesExecutor {
        KubernetesExecutor::new(KubeSettings {
            api: Some("https://k8s.local:6443/".into()),
            namespace: "polyaxon".into(),
            token_path,
            ca_path: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn resource() -> Resource {
        let mut replicas = IndexMap::new();
        replicas.insert(
            "main".to_string(),
            Replica {
                replicas: 1,
                metadata: ObjectMeta::default(),
                spec: PodSpec::default(),
            },
        );
        Resource {
            kind: RunKind::Job,
            metadata: ObjectMeta {
                name: resource_name("u1"),
                ..Default::default()
            },
            termination: TerminationSpec::default(),
            replicas,
        }
    }

    #[test]
    fn test_urls() {
        let executor = executor(None);
        assert_eq!(
            executor.item_url("u1"),
            "https://k8s.local:6443/apis/core.polyaxon.com/v1/namespaces/polyaxon/operations/plx-operation-u1"
        );
    }

    #[test]
    fn test_manifest() {
        let manifest = executor(None).manifest(RunKind::Job, &resource()).unwrap();
        assert_eq!(manifest["apiVersion"], "core.polyaxon.com/v1");
        assert_eq!(manifest["kind"], "Operation");
        assert_eq!(manifest["runKind"], "job");
        assert_eq!(manifest["metadata"]["namespace"], "polyaxon");
        assert_eq!(manifest["replicas"]["main"]["replicas"], 1);
    }

    #[tokio::test]
    async fn test_refresh_rereads_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();
        let executor = executor(Some(path.clone()));
        assert_eq!(executor.headers().get(AUTHORIZATION).unwrap(), "Bearer first");

        std::fs::write(&path, "second").unwrap();
        executor.refresh().await.unwrap();
        assert_eq!(executor.headers().get(AUTHORIZATION).unwrap(), "Bearer second");
    }
}
