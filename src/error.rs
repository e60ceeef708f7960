//! Typed error taxonomy for the pipeline.
//!
//! Orchestration code works in `anyhow::Result` and adds context as errors
//! travel upward. The variants here mark the failure *class* so callers
//! (the sync machine, the HTTP layer, retry loops) can tell a missing
//! credential from a transient upstream failure via `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source type could not be determined from its hint or extension.
    #[error("unsupported input type for '{path}': {detail}")]
    UnsupportedType { path: String, detail: String },

    /// An API key or token required by an operation is empty.
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// A required configuration value (URL, table, folder) is empty.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Malformed input file or payload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Non-2xx response from a remote service.
    #[error("{service} returned HTTP {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("document extraction failed: {0}")]
    Extract(String),
}

impl PipelineError {
    /// Rate limits and server-side failures are worth another attempt;
    /// everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Builds an [`PipelineError::Http`], truncating very long bodies.
    pub fn http(service: &'static str, status: u16, body: &str) -> Self {
        PipelineError::Http {
            service,
            status,
            body: body.chars().take(500).collect(),
        }
    }
}
