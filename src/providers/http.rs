use std::{env, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    error::AgentCallError,
    providers::{AgentClient, AgentDirectory},
    types::{AgentResponse, ChatMessage, StreamOptions},
};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5099/api/agents";

#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpAgentConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl HttpAgentConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Reads `DENKPROBE_ENDPOINT`, `DENKPROBE_API_KEY` and `DENKPROBE_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = env::var("DENKPROBE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(api_key) = env::var("DENKPROBE_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Ok(timeout_ms) = env::var("DENKPROBE_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }
        config
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct StreamRequestBody<'a> {
    messages: &'a [ChatMessage],
    options: &'a StreamOptions,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Agent reached over HTTP: `POST {endpoint}/{id}/stream` with `{messages, options}`,
/// answered by an [`AgentResponse`] JSON body.
#[derive(Debug, Clone)]
pub struct HttpAgent {
    client: Client,
    config: Arc<HttpAgentConfig>,
    id: String,
}

impl HttpAgent {
    pub fn new(id: impl Into<String>, config: HttpAgentConfig) -> Result<Self, AgentCallError> {
        let client = build_client(&config)?;
        Ok(Self {
            client,
            config: Arc::new(config),
            id: id.into(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/{}/stream",
            self.config.endpoint.trim_end_matches('/'),
            self.id.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.config.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn build_client(config: &HttpAgentConfig) -> Result<Client, AgentCallError> {
    Ok(Client::builder().timeout(config.request_timeout).build()?)
}

#[async_trait]
impl AgentClient for HttpAgent {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
    ) -> Result<AgentResponse, AgentCallError> {
        let body = StreamRequestBody { messages, options };
        let response = self
            .with_default_headers(self.client.post(self.url()))
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<ErrorEnvelope>(&text) {
                return Err(AgentCallError::Agent(error.error.message));
            }
            return Err(AgentCallError::Agent(format!("unexpected status {status}: {text}")));
        }

        Ok(response.json().await?)
    }

    fn name(&self) -> &str {
        &self.id
    }
}

/// Hands out [`HttpAgent`]s for any id, sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    config: Arc<HttpAgentConfig>,
}

impl HttpDirectory {
    pub fn new(config: HttpAgentConfig) -> Result<Self, AgentCallError> {
        let client = build_client(&config)?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

impl AgentDirectory for HttpDirectory {
    fn agent(&self, id: &str) -> Result<Arc<dyn AgentClient>, AgentCallError> {
        let id = id.strip_prefix("agents:").unwrap_or(id).trim();
        if id.is_empty() {
            return Err(AgentCallError::UnknownAgent(id.to_string()));
        }
        Ok(Arc::new(HttpAgent {
            client: self.client.clone(),
            config: self.config.clone(),
            id: id.to_string(),
        }))
    }
}
