//! Unified error handling for the fleetcrawl crate
//!
//! Every component owns a domain-specific error enum; this module wraps them
//! into a single [`Error`] so that the binary and the control API can handle
//! failures uniformly.
//!
//! # Architecture
//!
//! - [`FleetErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::coordinator::CoordinatorError;
pub use crate::fetcher::FetchError;
pub use crate::frontier::FrontierError;
pub use crate::queue::QueueError;
pub use crate::registry::RegistryError;
pub use crate::transport::TransportError;
pub use crate::worker::WorkerError;

/// Common trait for all fleetcrawl error types
pub trait FleetErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Shared state errors (Redis, pool, Lua replies)
    Storage,
    /// Encoding and decoding of records and messages
    Serialization,
    /// Malformed caller input
    Input,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Serialization => "serialization",
            Self::Input => "input",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the fleetcrawl crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Frontier error: {0}")]
    Frontier(#[from] FrontierError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Fetch(e) => e.is_recoverable(),
            Self::Coordinator(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_recoverable(),
            Self::Frontier(e) => e.is_recoverable(),
            Self::Config(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Queue(e) => e.category(),
            Self::Registry(e) => e.category(),
            Self::Transport(e) => e.category(),
            Self::Fetch(e) => e.category(),
            Self::Coordinator(e) => e.category(),
            Self::Worker(e) => e.category(),
            Self::Frontier(e) => e.category(),
            Self::Config(e) => e.category(),
            Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
