//! State transitions for quote requests using the typestate pattern.
//!
//! Each request state is a distinct type parameter on `QuoteRequest<State>`, so
//! only the transitions valid for a state can be called on it:
//!
//! ```text
//! QuoteRequest<Pending> ──start()──────────────────────> QuoteRequest<InProgress> + AggregationJob
//!        │                                                        │
//!        │                                                        └──(job finalized)──> COMPLETED
//!        ├──complete_without_providers()──> QuoteRequest<Completed>
//!        └──fail()────────────────────────> QuoteRequest<Failed>
//! ```
//!
//! `InProgress -> Completed` is not a method on the request: it is decided by
//! the aggregation job's counter, see [`AggregationJob::finalize`].
//!
//! Every transition is a compare-and-set in storage against the `PENDING`
//! status, so two engines racing to start the same request cannot both win.
//!
//! # Retry Configuration
//!
//! Result writes are retried with exponential backoff configured via
//! [`RetryConfig`]:
//!
//! ```rust
//! # use broadside::domain::request::transitions::RetryConfig;
//! let config = RetryConfig {
//!     max_retries: 3,
//!     backoff_ms: 100,       // Start with 100ms
//!     backoff_factor: 2,     // Double each time (100ms, 200ms, 400ms)
//!     max_backoff_ms: 2000,  // Cap at 2 seconds
//! };
//! assert_eq!(config.backoff(2).as_millis(), 400);
//! ```

use std::time::Duration;

use chrono::Utc;

use crate::domain::job::{AggregationJob, JobLease};
use crate::domain::provider::ProviderSnapshot;
use crate::error::Result;
use crate::manager::Storage;

use super::state::{Completed, Failed, InProgress, Pending, QuoteRequest};

impl QuoteRequest<Pending> {
    /// Begin fan-out against `snapshot`.
    ///
    /// Persists the `IN_PROGRESS` transition together with the aggregation job
    /// (total = snapshot size, completed = 0) in one step. Fails with
    /// `InvalidState` if the request has already left `PENDING`.
    pub async fn start<S: Storage + ?Sized>(
        self,
        snapshot: ProviderSnapshot,
        deadline: Option<Duration>,
        lease: JobLease,
        storage: &S,
    ) -> Result<(QuoteRequest<InProgress>, AggregationJob)> {
        let started_at = Utc::now();
        let deadline_at = deadline.and_then(|d| started_at.checked_add_signed(chrono_duration(d)));

        let job = AggregationJob {
            request_id: self.data.id,
            snapshot,
            completed: 0,
            started_at,
            deadline_at,
            finalized_at: None,
            lease: Some(lease),
        };
        let request = QuoteRequest {
            data: self.data,
            state: InProgress {
                started_at,
                total_providers: job.total(),
                deadline_at,
            },
        };

        storage.start_job(&request, &job).await?;
        Ok((request, job))
    }

    /// Complete immediately because no providers were enabled.
    pub async fn complete_without_providers<S: Storage + ?Sized>(
        self,
        storage: &S,
    ) -> Result<QuoteRequest<Completed>> {
        let now = Utc::now();
        let request = QuoteRequest {
            data: self.data,
            state: Completed {
                started_at: now,
                completed_at: now,
                total_providers: 0,
            },
        };
        storage.complete_without_providers(&request).await?;
        Ok(request)
    }

    /// Mark the request as failed before any provider was called.
    pub async fn fail<S: Storage + ?Sized>(
        self,
        reason: String,
        storage: &S,
    ) -> Result<QuoteRequest<Failed>> {
        let request = QuoteRequest {
            data: self.data,
            state: Failed {
                failed_at: Utc::now(),
                reason,
            },
        };
        storage.fail_request(&request).await?;
        Ok(request)
    }
}

/// Configuration for retry behavior of result writes.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl From<&crate::engine::EngineConfig> for RetryConfig {
    fn from(config: &crate::engine::EngineConfig) -> Self {
        RetryConfig {
            max_retries: config.result_write_max_retries,
            backoff_ms: config.result_write_backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `backoff_ms * factor^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
