//! Per-provider results.
//!
//! Every (request, provider) pair in a snapshot ends with exactly one
//! [`ProviderResult`]. Its [`ProviderOutcome`] is a closed variant: a price, a
//! typed failure, or a timeout synthesized by the engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::provider::ProviderId;
use super::request::RequestId;

/// Why a provider failed to produce a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FailureKind {
    /// Connection refused, DNS failure, TLS error or similar transport problem.
    Network,

    /// The provider answered with a non-success HTTP status.
    HttpStatus { status: u16 },

    /// The provider answered, but not with a quote we can read.
    InvalidResponse,

    /// The provider explicitly declined to quote this risk.
    Declined,

    /// The provider call panicked or was torn down unexpectedly.
    TaskTerminated,

    /// The provider's outcome could not be persisted after repeated retries.
    StorageWrite,
}

impl FailureKind {
    /// Low-cardinality label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::HttpStatus { .. } => "http_status",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::Declined => "declined",
            FailureKind::TaskTerminated => "task_terminated",
            FailureKind::StorageWrite => "storage_write",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::HttpStatus { status } => write!(f, "http_status({})", status),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What a single provider call came to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderOutcome {
    Success {
        price: Decimal,
        currency: String,
        raw_details: serde_json::Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
    /// The call did not return within its deadline.
    Timeout { timeout_ms: u64 },
}

impl ProviderOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProviderOutcome::Success { .. } => OutcomeKind::Success,
            ProviderOutcome::Failure { .. } => OutcomeKind::Failure,
            ProviderOutcome::Timeout { .. } => OutcomeKind::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success { .. })
    }
}

/// Outcome discriminant, as stored in the `outcome` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "SUCCESS",
            OutcomeKind::Failure => "FAILURE",
            OutcomeKind::Timeout => "TIMEOUT",
        }
    }

    /// Lowercase label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(OutcomeKind::Success),
            "FAILURE" => Ok(OutcomeKind::Failure),
            "TIMEOUT" => Ok(OutcomeKind::Timeout),
            _ => Err(format!("Invalid outcome: {}", s)),
        }
    }
}

/// One provider's persisted answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub outcome: ProviderOutcome,
    /// Wall time spent on the call
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ProviderResult {
    pub fn new(
        request_id: RequestId,
        provider_id: ProviderId,
        outcome: ProviderOutcome,
        duration: Duration,
    ) -> Self {
        Self {
            request_id,
            provider_id,
            outcome,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            completed_at: Utc::now(),
        }
    }

    /// The same slot, recorded as a failure because its real outcome could not be stored.
    pub fn into_storage_failure(self, error: &str) -> Self {
        Self {
            outcome: ProviderOutcome::Failure {
                kind: FailureKind::StorageWrite,
                message: format!(
                    "{} outcome could not be stored: {}",
                    self.outcome.kind().as_str(),
                    error
                ),
            },
            completed_at: Utc::now(),
            ..self
        }
    }
}

/// Completion count for a request, as seen by the writer that just reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub completed: usize,
    pub total: usize,
    /// False when the provider had already reported and nothing changed.
    pub inserted: bool,
}

impl Tally {
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}
