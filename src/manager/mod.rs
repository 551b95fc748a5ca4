//! Storage trait for the aggregation engine.
//!
//! This module defines the `Storage` trait: the durable state behind requests,
//! aggregation jobs and provider results. Every multi-step state change the
//! engine relies on (start, record, finalize) is a single atomic storage call,
//! so several engine processes can share one store safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::job::{AggregationJob, EngineId};
use crate::domain::progress::Progress;
use crate::domain::request::{
    AnyQuoteRequest, Completed, Failed, InProgress, Pending, QuoteRequest, RequestId, RequestInput,
};
use crate::domain::result::{ProviderResult, Tally};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

/// Storage trait for persisting and querying requests, jobs and results.
///
/// Transition methods are compare-and-set operations: they check the request's
/// current status in the same atomic step that changes it, and fail with
/// `InvalidState` when the precondition no longer holds.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Validate intake input and persist it as a new `PENDING` request.
    ///
    /// Nothing is written when validation fails.
    #[tracing::instrument(skip(self, input), fields(coverage_type = %input.coverage_type))]
    async fn create_request(&self, input: RequestInput) -> Result<RequestId> {
        let request = input.into_pending()?;
        self.insert_request(&request).await?;
        tracing::info!(request_id = %request.data.id, "Request created");
        Ok(request.data.id)
    }

    /// Persist a new pending request.
    async fn insert_request(&self, request: &QuoteRequest<Pending>) -> Result<()>;

    /// Get a request in whatever state it is in.
    async fn get_request(&self, id: RequestId) -> Result<AnyQuoteRequest>;

    /// Atomically move the request `PENDING -> IN_PROGRESS` and create its job.
    async fn start_job(&self, request: &QuoteRequest<InProgress>, job: &AggregationJob)
    -> Result<()>;

    /// Atomically move the request `PENDING -> COMPLETED` with an empty, finalized job.
    async fn complete_without_providers(&self, request: &QuoteRequest<Completed>) -> Result<()>;

    /// Atomically move the request `PENDING -> FAILED`.
    async fn fail_request(&self, request: &QuoteRequest<Failed>) -> Result<()>;

    /// Persist one provider's result and bump the job's completed counter.
    ///
    /// Insert and increment happen in one atomic step. A second report for the
    /// same (request, provider) pair changes nothing and returns a tally with
    /// `inserted = false`.
    ///
    /// # Errors
    /// - `JobNotFound` if the request was never started
    /// - `UnknownProvider` if the provider is not in the job's snapshot
    async fn record_result(&self, result: &ProviderResult) -> Result<Tally>;

    /// Compare-and-set `IN_PROGRESS -> COMPLETED` for a job whose counter has
    /// reached its total.
    ///
    /// Returns whether this call performed the transition. Exactly one of any
    /// number of concurrent callers gets `true`.
    async fn finalize_job(&self, request_id: RequestId, completed_at: DateTime<Utc>)
    -> Result<bool>;

    /// Get the aggregation job behind a started request.
    async fn get_job(&self, request_id: RequestId) -> Result<AggregationJob>;

    /// All persisted provider results for a request, in completion order.
    async fn get_results(&self, request_id: RequestId) -> Result<Vec<ProviderResult>>;

    /// Status plus completed/total counts for a request.
    async fn get_progress(&self, request_id: RequestId) -> Result<Progress>;

    /// Extend the leases this engine holds on the given unfinalized jobs.
    ///
    /// Returns how many leases were extended; jobs that were finalized or
    /// claimed by another engine are skipped.
    async fn renew_leases(
        &self,
        owner: EngineId,
        request_ids: &[RequestId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Atomically take over up to `limit` unfinalized jobs whose lease has expired.
    async fn claim_orphaned_jobs(
        &self,
        owner: EngineId,
        limit: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<AggregationJob>>;
}
