//! HTTP client for the coordinator control API
//!
//! Used by the `submit`, `stats` and `nodes` subcommands.

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;
use thiserror::Error;

use super::api::{NodesResponse, StatsResponse, SubmitRequest, SubmitResponse};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::{NodeRole, NodeSummary};

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the control client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator base URL, e.g. `http://127.0.0.1:8080`
    pub coordinator_url: String,

    pub timeout: Duration,

    /// Retries for network failures and 5xx answers
    pub retry_count: u32,

    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Response envelope of the control API
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

// ============================================================================
// Client Errors
// ============================================================================

/// Control client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FleetErrorTrait for ClientError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Init(_) | Self::InvalidResponse(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) => ErrorCategory::Network,
            Self::Http { status, .. } if *status < 500 => ErrorCategory::Input,
            Self::Http { .. } => ErrorCategory::Network,
            Self::Init(_) => ErrorCategory::Config,
            Self::InvalidResponse(_) => ErrorCategory::Serialization,
        }
    }
}

// ============================================================================
// Control Client
// ============================================================================

/// Client for a running coordinator
pub struct ControlClient {
    config: ClientConfig,
    http_client: Client,
}

impl ControlClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Submit URLs at `priority`
    pub async fn submit(&self, urls: Vec<String>, priority: i64) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}/api/urls", self.config.coordinator_url);
        let body = SubmitRequest { urls, priority };
        self.send_with_retry(|| self.http_client.post(&url).json(&body))
            .await
    }

    pub async fn stats(&self) -> Result<StatsResponse, ClientError> {
        let url = format!("{}/api/stats", self.config.coordinator_url);
        self.send_with_retry(|| self.http_client.get(&url)).await
    }

    /// Active nodes, optionally filtered by role
    pub async fn nodes(&self, role: Option<NodeRole>) -> Result<Vec<NodeSummary>, ClientError> {
        let url = format!("{}/api/nodes", self.config.coordinator_url);
        let response: NodesResponse = self
            .send_with_retry(|| {
                let request = self.http_client.get(&url);
                match role {
                    Some(role) => request.query(&[("role", role.as_str())]),
                    None => request,
                }
            })
            .await?;
        Ok(response.nodes)
    }

    /// Send with retries on network errors and 5xx; 4xx fails at once
    async fn send_with_retry<T, F>(&self, build: F) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response
                        .text()
                        .await
                        .map_err(|e| ClientError::Network(e.to_string()))?;

                    if status.is_success() {
                        return unwrap_envelope(&text);
                    }

                    let error = ClientError::Http {
                        status: status.as_u16(),
                        message: error_message(&text),
                    };
                    if !error.is_recoverable() {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(e) => {
                    last_error = Some(ClientError::Network(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::Network("Unknown error".to_string())))
    }
}

fn unwrap_envelope<T: DeserializeOwned>(text: &str) -> Result<T, ClientError> {
    let envelope: Envelope<T> =
        serde_json::from_str(text).map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

    match (envelope.success, envelope.data) {
        (true, Some(data)) => Ok(data),
        _ => Err(ClientError::InvalidResponse(
            envelope.error.unwrap_or_else(|| "missing data".to_string()),
        )),
    }
}

/// Error text from an error body, or the raw body
fn error_message(text: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    serde_json::from_str::<ErrorBody>(text)
        .map(|body| body.error)
        .unwrap_or_else(|_| text.to_string())
}
