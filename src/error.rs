//! Error types for the aggregation engine.

use thiserror::Error;

use crate::domain::provider::ProviderId;
use crate::domain::request::RequestId;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the aggregation engine.
///
/// Provider-level failures never show up here: they are recorded as
/// [`ProviderOutcome`](crate::domain::result::ProviderOutcome) rows instead.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// No aggregation job exists for the request (it was never started)
    #[error("Aggregation job not found for request: {0}")]
    JobNotFound(RequestId),

    /// Request is in an invalid state for the requested operation
    #[error("Invalid state transition: request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// A result was reported for a provider outside the request's snapshot
    #[error("Provider '{1}' is not part of the snapshot for request {0}")]
    UnknownProvider(RequestId, ProviderId),

    /// The provider registry has no provider with this id
    #[error("Provider not registered: {0}")]
    ProviderNotRegistered(ProviderId),

    /// Validation error (e.g., blank coverage type, malformed form data)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Storage backend failed; callers may retry
    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BroadsideError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only storage failures qualify; everything else is a logic or input error.
    pub fn is_transient(&self) -> bool {
        matches!(self, BroadsideError::Storage(_))
    }
}

/// Error-chain serialization for persisted failure messages.
///
/// Used to keep an adapter's full error chain in the recorded failure message.
pub mod error_serialization {
    use anyhow::Error;
    use serde::Serialize;

    /// Serialized error format that preserves error message and source chain.
    #[derive(Debug, Clone, Serialize)]
    pub struct SerializedError {
        /// The main error message
        pub message: String,
        /// Chain of source errors, if any
        pub sources: Vec<String>,
    }

    /// Serializes an anyhow::Error to a JSON string.
    pub fn serialize_error(error: &Error) -> String {
        let serialized = SerializedError {
            message: error.to_string(),
            sources: error.chain().skip(1).map(|e| e.to_string()).collect(),
        };
        serde_json::to_string(&serialized).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}","sources":[]}}"#,
                error.to_string().replace('"', "\\\"")
            )
        })
    }

}
