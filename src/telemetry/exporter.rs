use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::error::ProviderError;

use super::ExportItem;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/traces/ingest";

/// Destination for batches drained by the
/// [`BatchTraceProcessor`](super::BatchTraceProcessor).
#[async_trait]
pub trait TraceExporter: Send + Sync {
    async fn export(&self, items: Vec<ExportItem>);
}

/// Minimal HTTP seam used by [`BackendSpanExporter`]. Returns the response
/// status, or an error string when no response arrived.
#[async_trait]
pub trait TraceTransport: Send + Sync {
    async fn post(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> Result<u16, String>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TraceTransport for ReqwestTransport {
    async fn post(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> Result<u16, String> {
        let mut request = self.client.post(endpoint).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone)]
pub struct BackendExporterConfig {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub endpoint: String,
    /// Total attempts per batch, including the first. Every batch is sent
    /// at least once, so `0` behaves like `1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackendExporterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            organization: None,
            project: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackendExporterConfig {
    /// Reads `AGENT_TRACING_API_KEY` (falling back to `OPENAI_API_KEY`),
    /// `OPENAI_ORG_ID`, `OPENAI_PROJECT_ID` and `AGENT_TRACING_ENDPOINT`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            api_key: var("AGENT_TRACING_API_KEY").or_else(|| var("OPENAI_API_KEY")),
            organization: var("OPENAI_ORG_ID"),
            project: var("OPENAI_PROJECT_ID"),
            endpoint: var("AGENT_TRACING_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            ..Self::default()
        }
    }
}

/// Posts batches to the tracing ingest endpoint as `{"data": [...]}`.
///
/// Server errors and network failures are retried with exponential backoff
/// capped at `max_delay`; client errors are logged and the batch is dropped.
pub struct BackendSpanExporter {
    config: BackendExporterConfig,
    transport: Box<dyn TraceTransport>,
}

impl std::fmt::Debug for BackendSpanExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSpanExporter")
            .field("endpoint", &self.config.endpoint)
            .field("has_api_key", &self.config.api_key.is_some())
            .finish()
    }
}

impl BackendSpanExporter {
    pub fn new(config: BackendExporterConfig) -> Result<Self, ProviderError> {
        Ok(Self::with_transport(config, ReqwestTransport::new()?))
    }

    pub fn with_transport(
        config: BackendExporterConfig,
        transport: impl TraceTransport + 'static,
    ) -> Self {
        Self {
            config,
            transport: Box::new(transport),
        }
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(BackendExporterConfig::from_env())
    }

    pub fn set_api_key(&mut self, api_key: impl Into<String>) {
        self.config.api_key = Some(api_key.into());
    }

    fn headers(&self, api_key: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("OpenAI-Beta".to_string(), "traces=v1".to_string()),
        ];
        if let Some(org) = &self.config.organization {
            headers.push(("OpenAI-Organization".to_string(), org.clone()));
        }
        if let Some(project) = &self.config.project {
            headers.push(("OpenAI-Project".to_string(), project.clone()));
        }
        headers
    }
}

#[async_trait]
impl TraceExporter for BackendSpanExporter {
    async fn export(&self, items: Vec<ExportItem>) {
        if items.is_empty() {
            return;
        }
        let Some(api_key) = self.config.api_key.as_deref() else {
            warn!(count = items.len(), "no tracing API key configured, skipping trace export");
            return;
        };

        let headers = self.headers(api_key);
        let body = json!({ "data": items });
        let max_attempts = self.config.max_retries.max(1);
        let mut delay = self.config.base_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self
                .transport
                .post(&self.config.endpoint, &headers, &body)
                .await
            {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(count = items.len(), "exported trace batch");
                    return;
                }
                Ok(status) if (400..500).contains(&status) => {
                    error!(status, "trace export rejected by client error, dropping batch");
                    return;
                }
                Ok(status) => {
                    warn!(status, attempt, "trace export failed with server error");
                }
                Err(err) => {
                    warn!(error = %err, attempt, "trace export request failed");
                }
            }

            if attempt >= max_attempts {
                error!(attempts = attempt, "trace export giving up after retries");
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_delay);
        }
    }
}

/// Logs every exported record at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSpanExporter;

#[async_trait]
impl TraceExporter for ConsoleSpanExporter {
    async fn export(&self, items: Vec<ExportItem>) {
        for item in items {
            match &item {
                ExportItem::Trace(trace) => {
                    info!(trace_id = %trace.id, workflow = %trace.workflow_name, "trace")
                }
                ExportItem::Span(span) => {
                    let payload = serde_json::to_string(&span.span_data).unwrap_or_default();
                    info!(
                        span_id = %span.id,
                        trace_id = %span.trace_id,
                        parent_id = span.parent_id.as_deref().unwrap_or("-"),
                        %payload,
                        "span"
                    )
                }
            }
        }
    }
}
