//! Page fetching collaborators used by workers and the local traversal runner
//!
//! The coordination core only depends on the [`Fetcher`] and
//! [`RobotsChecker`] traits. [`HttpFetcher`] and [`HttpRobotsChecker`] are the
//! production implementations; tests plug in fakes.
//!
//! [`PoliteFetcher`] composes a fetcher with the robots check, the per-host
//! [`PolitenessGate`] and a per-task timeout. Everything that visits a page
//! goes through it.

pub mod http;
pub mod robots;

pub use http::{extract_links, HttpFetcher};
pub use robots::HttpRobotsChecker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::CrawlerConfig;
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::TaskResult;
use crate::politeness::PolitenessGate;

/// Reason recorded on tasks skipped because robots.txt disallows them
pub const SKIPPED_BY_ROBOTS: &str = "disallowed by robots.txt";

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while fetching a page
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// Fetch did not finish within the allowed time (seconds)
    #[error("Fetch timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Body could not be decoded as text
    #[error("Decoding error: {0}")]
    Decode(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),

    /// Server answered 429
    #[error("Rate limited")]
    RateLimited,
}

impl FleetErrorTrait for FetchError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) | Self::RateLimited => true,
            Self::HttpStatus(status) => matches!(status, 500 | 502 | 503 | 504),
            Self::InvalidUrl(_) | Self::Decode(_) | Self::Client(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Http(_) | Self::HttpStatus(_) | Self::Timeout(_) | Self::RateLimited => {
                ErrorCategory::Network
            }
            Self::InvalidUrl(_) => ErrorCategory::Input,
            Self::Decode(_) => ErrorCategory::Serialization,
            Self::Client(_) => ErrorCategory::Config,
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// A single fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub proxy: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// A fetched page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub status_code: u16,
    pub content: String,
    /// Absolute http(s) links found on the page, in document order
    pub links: Vec<String>,
    pub headers: HashMap<String, String>,
}

/// Fetches pages. Implementations must be safe to call under a timeout.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// robots.txt policy
#[async_trait]
pub trait RobotsChecker: Send + Sync {
    async fn can_fetch(&self, url: &str) -> bool;
}

// ============================================================================
// Page Visits
// ============================================================================

/// Outcome of visiting one URL
#[derive(Debug, Clone, PartialEq)]
pub struct PageVisit {
    pub url: String,
    pub depth: u32,
    pub status_code: u16,
    pub links: Vec<String>,
    pub content_length: usize,
    pub elapsed_ms: u64,
    /// Set when the page was not fetched on purpose
    pub skipped: Option<String>,
}

impl PageVisit {
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Convert into the result stored on a completed task
    pub fn into_result(self) -> TaskResult {
        TaskResult {
            status_code: self.status_code,
            content_length: self.content_length,
            elapsed_ms: self.elapsed_ms,
            links: self.links,
            skipped: self.skipped,
        }
    }
}

/// Visits pages on behalf of workers and traversal strategies
#[async_trait]
pub trait PageVisitor: Send + Sync {
    async fn visit(&self, url: &str, depth: u32) -> Result<PageVisit, FetchError>;
}

/// Shared handle to a page visitor
pub type SharedVisitor = Arc<dyn PageVisitor>;

/// Fetcher wrapped with robots.txt, politeness and a timeout
pub struct PoliteFetcher {
    fetcher: Arc<dyn Fetcher>,
    robots: Option<Arc<dyn RobotsChecker>>,
    gate: Arc<PolitenessGate>,
    timeout: Duration,
}

impl PoliteFetcher {
    pub fn new(fetcher: Arc<dyn Fetcher>, gate: Arc<PolitenessGate>, timeout: Duration) -> Self {
        Self {
            fetcher,
            robots: None,
            gate,
            timeout,
        }
    }

    /// Consult `robots` before every fetch
    pub fn with_robots(mut self, robots: Arc<dyn RobotsChecker>) -> Self {
        self.robots = Some(robots);
        self
    }

    pub fn gate(&self) -> &Arc<PolitenessGate> {
        &self.gate
    }

    /// HTTP fetcher with the configured delay, task timeout and robots policy
    pub fn from_config(config: &CrawlerConfig) -> Result<Self, FetchError> {
        let fetcher = Arc::new(HttpFetcher::new(config)?);
        let gate = Arc::new(PolitenessGate::new(config.delay()));
        let visitor = Self::new(fetcher, gate, config.task_timeout());

        if config.respect_robots {
            let robots = HttpRobotsChecker::new(&config.user_agent, config.request_timeout())?;
            Ok(visitor.with_robots(Arc::new(robots)))
        } else {
            Ok(visitor)
        }
    }
}

#[async_trait]
impl PageVisitor for PoliteFetcher {
    async fn visit(&self, url: &str, depth: u32) -> Result<PageVisit, FetchError> {
        if let Some(robots) = &self.robots {
            if !robots.can_fetch(url).await {
                tracing::debug!(url = %url, "Skipping URL disallowed by robots.txt");
                return Ok(PageVisit {
                    url: url.to_string(),
                    depth,
                    status_code: 0,
                    links: Vec::new(),
                    content_length: 0,
                    elapsed_ms: 0,
                    skipped: Some(SKIPPED_BY_ROBOTS.to_string()),
                });
            }
        }

        self.gate.wait_for_host(url).await;

        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.fetcher.fetch(FetchRequest::new(url)))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout.as_secs()))??;

        Ok(PageVisit {
            url: url.to_string(),
            depth,
            status_code: response.status_code,
            content_length: response.content.len(),
            links: response.links,
            elapsed_ms: start.elapsed().as_millis() as u64,
            skipped: None,
        })
    }
}
