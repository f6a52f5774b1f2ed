// Wire boundary for the research agent. `HttpTransport` speaks the
// Interactions REST API; tests swap in `testing::MockTransport`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ClientError, Result};
use crate::job::JobHandle;
use crate::types::{AgentConfig, ErrorEnvelope, Interaction, InteractionInput, InteractionRequest};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Deep-research agent id.
pub const DEFAULT_AGENT: &str = "deep-research-pro-preview-12-2025";

/// Per-request ceiling. Jobs run for minutes; individual calls never should.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ResearchTransport: Send + Sync {
    /// Queue a background research job. Returns the raw submission response.
    async fn submit(
        &self,
        query: &str,
        output_schema: Option<&serde_json::Value>,
    ) -> Result<Interaction>;

    /// Fetch the current state of a job.
    async fn fetch(&self, handle: &JobHandle) -> Result<Interaction>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    agent: String,
}

impl HttpTransport {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, DEFAULT_BASE_URL, DEFAULT_AGENT)
    }

    pub fn with_endpoint(
        api_key: String,
        base_url: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: agent.into(),
        }
    }
}

/// Read a non-2xx body and pull out the agent's error message if it sent one.
async fn error_message(resp: reqwest::Response) -> String {
    let body = resp.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or(body)
}

/// Rate limiting and server errors are transport-class; the rest are final.
fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn submit_error(status: reqwest::StatusCode, message: String) -> ClientError {
    if is_transient_status(status) {
        ClientError::TransportError(format!("submission returned {status}: {message}"))
    } else {
        ClientError::SubmissionRejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn poll_error(status: reqwest::StatusCode, message: String) -> ClientError {
    if is_transient_status(status) {
        ClientError::TransportError(format!("poll returned {status}: {message}"))
    } else {
        ClientError::RemoteFailed(format!("poll returned {status}: {message}"))
    }
}

#[async_trait]
impl ResearchTransport for HttpTransport {
    async fn submit(
        &self,
        query: &str,
        output_schema: Option<&serde_json::Value>,
    ) -> Result<Interaction> {
        let body = InteractionRequest {
            agent: &self.agent,
            input: InteractionInput {
                kind: "text",
                text: query,
            },
            background: true,
            agent_config: output_schema.cloned().map(AgentConfig::json_output),
        };

        let url = format!("{}/interactions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(submit_error(status, error_message(resp).await));
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn fetch(&self, handle: &JobHandle) -> Result<Interaction> {
        let url = format!("{}/interactions/{}", self.base_url, handle);
        let resp = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(poll_error(status, error_message(resp).await));
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
