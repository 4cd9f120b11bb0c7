//! Control plane client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::state::{AgentState, StatusCondition};
use crate::error::{Error, Result};

/// The API the agent polls for work and reports run statuses to.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch this agent's current state.
    async fn get_state(&self) -> Result<AgentState>;

    /// Append a status condition to a run.
    async fn post_status(
        &self,
        owner: &str,
        project: &str,
        uuid: &str,
        condition: &StatusCondition,
    ) -> Result<()>;

    /// Create a new run from an operation payload.
    async fn create_run(&self, owner: &str, project: &str, content: &Value) -> Result<Value>;
}

/// `ControlPlane` over the REST API.
pub struct HttpControlPlane {
    client: Client,
    host: String,
    owner: String,
    agent_id: String,
    headers: HeaderMap,
}

impl HttpControlPlane {
    pub fn new(
        host: impl Into<String>,
        owner: impl Into<String>,
        agent_id: impl Into<String>,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Config(format!("invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            agent_id: agent_id.into(),
            headers,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.host, path)
    }
}

/// 5xx responses are retryable; other failures keep their status.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        return Err(Error::Transient(format!("control plane returned {}: {}", status, body)));
    }
    Err(Error::executor(Some(status.as_u16()), body))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_state(&self) -> Result<AgentState> {
        let url = self.url(&format!("orgs/{}/agents/{}/state", self.owner, self.agent_id));
        debug!(url = %url, "Polling agent state");
        let response = self.client.get(&url).headers(self.headers.clone()).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post_status(
        &self,
        owner: &str,
        project: &str,
        uuid: &str,
        condition: &StatusCondition,
    ) -> Result<()> {
        let url = self.url(&format!("{}/{}/runs/{}/statuses", owner, project, uuid));
        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&json!({ "condition": condition }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn create_run(&self, owner: &str, project: &str, content: &Value) -> Result<Value> {
        let url = self.url(&format!("{}/{}/runs", owner, project));
        let body = json!({
            "content": serde_json::to_string(content)?,
            "isManaged": true,
        });
        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_and_auth() {
        let client = HttpControlPlane::new(
            "https://polyaxon.local/",
            "acme",
            "agent-1",
            Some("secret"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url("orgs/acme/agents/agent-1/state"),
            "https://polyaxon.local/api/v1/orgs/acme/agents/agent-1/state"
        );
        assert_eq!(client.headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    }

    #[test]
    fn test_invalid_token() {
        let err = HttpControlPlane::new("http://x", "o", "a", Some("bad\ntoken"), Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
