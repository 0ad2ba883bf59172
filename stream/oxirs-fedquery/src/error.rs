//! Error types for federated planning and execution

use thiserror::Error;

/// Errors raised while planning or executing a federated query.
///
/// Only [`FederationError::SelectionFailed`] influences planning (the query is
/// left unrewritten). Every other kind is per-endpoint: the executor records it
/// in the query's [`ErrorLog`](crate::executor::ErrorLog) and carries on.
#[derive(Error, Debug)]
pub enum FederationError {
    /// Hard failure while computing candidate endpoints
    #[error("Source selection failed: {0}")]
    SelectionFailed(String),

    /// Network or protocol failure for one endpoint
    #[error("Transport to {endpoint} failed: {reason}")]
    TransportFailed { endpoint: String, reason: String },

    /// Request exceeded its per-request timeout
    #[error("Request to {endpoint} timed out after {millis} ms")]
    Timeout { endpoint: String, millis: u64 },

    /// Remote payload could not be decoded into bindings
    #[error("Malformed response from {endpoint}: {reason}")]
    ResponseParseFailed { endpoint: String, reason: String },

    /// Endpoint variable never resolved to any value
    #[error("Undefined service endpoint: ?{0}")]
    UndefinedEndpoint(String),

    /// Failure reported by an embedded local engine
    #[error("Local engine for {endpoint} failed: {source}")]
    Local {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    /// HTTP client construction or request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration or annotation value
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FederationError {
    pub fn transport(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        FederationError::TransportFailed {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        FederationError::ResponseParseFailed {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that concern a single endpoint and must not abort siblings
    pub fn is_endpoint_failure(&self) -> bool {
        !matches!(
            self,
            FederationError::SelectionFailed(_) | FederationError::Configuration(_)
        )
    }

    /// Endpoint the error is attributed to, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            FederationError::TransportFailed { endpoint, .. }
            | FederationError::Timeout { endpoint, .. }
            | FederationError::ResponseParseFailed { endpoint, .. }
            | FederationError::Local { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

/// Result type for federation operations
pub type Result<T> = std::result::Result<T, FederationError>;
