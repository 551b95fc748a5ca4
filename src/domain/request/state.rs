//! Request types for the aggregation engine.
//!
//! A customer's ask moves through `Pending -> InProgress -> Completed`, or to
//! `Failed` when the fan-out could not be started. Each state is a distinct type
//! so only the transitions that make sense for it can be called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BroadsideError, Result};

/// Persisted status of a request, as clients observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }

    /// Completed and Failed never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "IN_PROGRESS" => Ok(RequestStatus::InProgress),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// Marker trait for valid request states.
pub trait RequestState: Send + Sync {}

/// A customer quote request.
///
/// The generic parameter `T` is the current state of the request.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteRequest<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// The normalized, intake-validated request data.
    pub data: RequestData,
}

/// Normalized request data handed to every provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    pub id: RequestId,

    /// Coverage being quoted (e.g. "traffic", "casco", "home")
    pub coverage_type: String,

    /// Normalized form parameters; always a JSON object
    pub form: serde_json::Value,

    /// Customer who submitted the request, when known
    pub user_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Intake input for a new request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInput {
    pub coverage_type: String,
    pub form: serde_json::Value,
    pub user_id: Option<String>,
}

impl RequestInput {
    /// Check the input and build the pending request it describes.
    pub fn into_pending(self) -> Result<QuoteRequest<Pending>> {
        let coverage_type = self.coverage_type.trim();
        if coverage_type.is_empty() {
            return Err(BroadsideError::ValidationError(
                "coverage type must not be blank".to_string(),
            ));
        }
        if !self.form.is_object() {
            return Err(BroadsideError::ValidationError(format!(
                "form data must be a JSON object, got {}",
                json_kind(&self.form)
            )));
        }

        Ok(QuoteRequest {
            state: Pending {},
            data: RequestData {
                id: RequestId::from(Uuid::new_v4()),
                coverage_type: coverage_type.to_string(),
                form: self.form,
                user_id: self.user_id,
                created_at: Utc::now(),
            },
        })
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ============================================================================
// Request States
// ============================================================================

/// Created by intake, fan-out not started yet.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl RequestState for Pending {}

/// Fan-out has started against a fixed provider snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct InProgress {
    pub started_at: DateTime<Utc>,
    /// Size of the provider snapshot captured at fan-out time
    pub total_providers: usize,
    /// Overall deadline after which missing providers are recorded as timed out
    pub deadline_at: Option<DateTime<Utc>>,
}

impl RequestState for InProgress {}

/// Every snapshot provider has reported (or zero providers were enabled).
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_providers: usize,
}

impl RequestState for Completed {}

/// The fan-out could not be started.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl RequestState for Failed {}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request")]
pub enum AnyQuoteRequest {
    Pending(QuoteRequest<Pending>),
    InProgress(QuoteRequest<InProgress>),
    Completed(QuoteRequest<Completed>),
    Failed(QuoteRequest<Failed>),
}

impl AnyQuoteRequest {
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyQuoteRequest::Pending(r) => &r.data,
            AnyQuoteRequest::InProgress(r) => &r.data,
            AnyQuoteRequest::Completed(r) => &r.data,
            AnyQuoteRequest::Failed(r) => &r.data,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyQuoteRequest::Pending(_) => RequestStatus::Pending,
            AnyQuoteRequest::InProgress(_) => RequestStatus::InProgress,
            AnyQuoteRequest::Completed(_) => RequestStatus::Completed,
            AnyQuoteRequest::Failed(_) => RequestStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Take as a Pending request, or report the state it is actually in.
    pub fn into_pending(self) -> Result<QuoteRequest<Pending>> {
        match self {
            AnyQuoteRequest::Pending(r) => Ok(r),
            other => Err(BroadsideError::InvalidState(
                other.id(),
                other.status().to_string(),
                RequestStatus::Pending.to_string(),
            )),
        }
    }
}

impl From<QuoteRequest<Pending>> for AnyQuoteRequest {
    fn from(r: QuoteRequest<Pending>) -> Self {
        AnyQuoteRequest::Pending(r)
    }
}

impl From<QuoteRequest<InProgress>> for AnyQuoteRequest {
    fn from(r: QuoteRequest<InProgress>) -> Self {
        AnyQuoteRequest::InProgress(r)
    }
}

impl From<QuoteRequest<Completed>> for AnyQuoteRequest {
    fn from(r: QuoteRequest<Completed>) -> Self {
        AnyQuoteRequest::Completed(r)
    }
}

impl From<QuoteRequest<Failed>> for AnyQuoteRequest {
    fn from(r: QuoteRequest<Failed>) -> Self {
        AnyQuoteRequest::Failed(r)
    }
}
