//! Drives one aggregation job: fan-out, per-call timeouts, durable result
//! writes, the overall deadline and finalization.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::ProviderAdapter;
use crate::domain::job::AggregationJob;
use crate::domain::provider::{Provider, ProviderId};
use crate::domain::request::{RequestData, RetryConfig};
use crate::domain::result::{FailureKind, ProviderOutcome, ProviderResult, Tally};
use crate::error::Result;
use crate::manager::Storage;

/// Everything a provider task needs, shared by all tasks of one job.
pub(crate) struct JobRunner<S, A> {
    pub(crate) storage: Arc<S>,
    pub(crate) adapter: Arc<A>,
    pub(crate) retry: RetryConfig,
    /// Per-call timeout for providers without their own override
    pub(crate) default_timeout: Duration,
    pub(crate) request: Arc<RequestData>,
    pub(crate) job: Arc<AggregationJob>,
}

impl<S, A> Clone for JobRunner<S, A> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            adapter: self.adapter.clone(),
            retry: self.retry.clone(),
            default_timeout: self.default_timeout,
            request: self.request.clone(),
            job: self.job.clone(),
        }
    }
}

impl<S, A> JobRunner<S, A>
where
    S: Storage + 'static,
    A: ProviderAdapter,
{
    /// Call every provider in `providers` and record what each one came to.
    ///
    /// Returns once every provider has a recorded result, the overall deadline
    /// has forced the remaining ones to `TIMEOUT`, or `shutdown` fires. At the
    /// deadline only calls still waiting on their provider are dropped; results
    /// already being written are allowed to land first. On
    /// shutdown nothing is recorded: the job's lease lapses and another engine
    /// (or this one, after restart) resumes it.
    #[tracing::instrument(skip_all, fields(request_id = %self.job.request_id, providers = providers.len()))]
    pub(crate) async fn drive(self, providers: Vec<Provider>, shutdown: CancellationToken) {
        if self.job.deadline_passed(Utc::now()) {
            tracing::warn!("Overall deadline already passed, expiring outstanding providers");
            self.expire().await;
            return;
        }
        if providers.is_empty() {
            // Every provider already reported; only finalization is missing
            self.finalize().await;
            return;
        }

        let started = Instant::now();
        let deadline = self.job.deadline_at.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or_default();
            started + remaining
        });
        let deadline_reached = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(deadline_reached);

        // Cancelled at the deadline; stops calls, never writes
        let expired = CancellationToken::new();
        let mut deadline_hit = false;

        let mut tasks = JoinSet::new();
        let mut slots: HashMap<tokio::task::Id, ProviderId> = HashMap::new();
        for provider in providers {
            let runner = self.clone();
            let provider_id = provider.id.clone();
            let expired = expired.clone();
            let handle =
                tasks.spawn(async move { runner.call_and_record(provider, expired).await });
            slots.insert(handle.id(), provider_id);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tasks.abort_all();
                    tracing::info!(
                        in_flight = tasks.len(),
                        "Shutdown signal received, abandoning provider calls"
                    );
                    return;
                }
                _ = &mut deadline_reached, if !deadline_hit => {
                    deadline_hit = true;
                    expired.cancel();
                    tracing::warn!(
                        in_flight = tasks.len(),
                        "Overall request deadline reached, draining result writes"
                    );
                }
                joined = tasks.join_next_with_id() => match joined {
                    None => {
                        if deadline_hit {
                            self.expire().await;
                        }
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(join_error)) if join_error.is_panic() => {
                        let task_id = join_error.id();
                        let message = panic_message(join_error.into_panic());
                        let Some(provider_id) = slots.get(&task_id).cloned() else {
                            tracing::error!(message = %message, "Untracked provider task panicked");
                            continue;
                        };
                        tracing::error!(provider_id = %provider_id, message = %message, "Provider task panicked");
                        counter!(
                            "broadside_provider_calls_total",
                            "provider" => provider_id.to_string(),
                            "outcome" => "failure"
                        )
                        .increment(1);
                        let result = ProviderResult::new(
                            self.job.request_id,
                            provider_id,
                            ProviderOutcome::Failure {
                                kind: FailureKind::TaskTerminated,
                                message,
                            },
                            started.elapsed(),
                        );
                        self.record(result).await;
                    }
                    Some(Err(join_error)) => {
                        tracing::debug!(error = %join_error, "Provider task cancelled");
                    }
                },
            }
        }
    }

    /// Call one provider under its deadline, then record the outcome.
    ///
    /// Gives up without recording if `expired` fires while the provider has
    /// not answered yet.
    async fn call_and_record(self, provider: Provider, expired: CancellationToken) {
        let timeout = provider
            .endpoint
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let started = Instant::now();
        let call = tokio::time::timeout(timeout, self.adapter.call(&provider, &self.request, timeout));
        let called = tokio::select! {
            biased;
            _ = expired.cancelled() => {
                tracing::debug!(provider_id = %provider.id, "Overall deadline reached while calling provider");
                return;
            }
            called = call => called,
        };
        let outcome = match called {
            Ok(Ok(quote)) => ProviderOutcome::from(quote),
            Ok(Err(error)) => {
                tracing::info!(
                    provider_id = %provider.id,
                    kind = %error.kind,
                    message = %error.message,
                    "Provider call failed"
                );
                ProviderOutcome::from(error)
            }
            Err(_) => {
                tracing::info!(provider_id = %provider.id, timeout_ms, "Provider call timed out");
                ProviderOutcome::Timeout { timeout_ms }
            }
        };
        let elapsed = started.elapsed();

        counter!(
            "broadside_provider_calls_total",
            "provider" => provider.id.to_string(),
            "outcome" => outcome.kind().label()
        )
        .increment(1);
        histogram!(
            "broadside_provider_call_duration_seconds",
            "provider" => provider.id.to_string()
        )
        .record(elapsed.as_secs_f64());

        let result = ProviderResult::new(self.job.request_id, provider.id, outcome, elapsed);
        self.record(result).await;
    }

    /// Persist a provider result and finalize if it was the last one.
    ///
    /// A result whose write keeps failing is replaced by a `StorageWrite`
    /// failure for the same slot, so the counter can still reach its total.
    /// Returns `None` only when not even that could be stored; the job then
    /// stays unfinalized until recovery picks it up.
    pub(crate) async fn record(&self, result: ProviderResult) -> Option<Tally> {
        let provider_id = result.provider_id.clone();

        let tally = match self.write_result(&result).await {
            Ok(tally) => tally,
            Err(e) if e.is_transient() => {
                tracing::error!(
                    provider_id = %provider_id,
                    error = %e,
                    "Result write retries exhausted, recording storage failure instead"
                );
                let fallback = result.into_storage_failure(&e.to_string());
                match self.write_result(&fallback).await {
                    Ok(tally) => tally,
                    Err(e) => {
                        tracing::error!(
                            provider_id = %provider_id,
                            error = %e,
                            "Failed to record provider slot, leaving it for recovery"
                        );
                        return None;
                    }
                }
            }
            Err(e) => {
                tracing::error!(provider_id = %provider_id, error = %e, "Provider result rejected");
                return None;
            }
        };

        if !tally.inserted {
            tracing::debug!(provider_id = %provider_id, "Provider already reported, result ignored");
            return Some(tally);
        }

        tracing::debug!(
            provider_id = %provider_id,
            completed = tally.completed,
            total = tally.total,
            "Provider result recorded"
        );
        if tally.is_complete() {
            self.finalize().await;
        }
        Some(tally)
    }

    async fn write_result(&self, result: &ProviderResult) -> Result<Tally> {
        self.with_retries("record_result", Some(&result.provider_id), move || {
            self.storage.record_result(result)
        })
        .await
    }

    /// Run the single-fire finalization, retrying transient storage errors.
    pub(crate) async fn finalize(&self) -> bool {
        match self
            .with_retries("finalize", None, move || self.job.finalize(self.storage.as_ref()))
            .await
        {
            Ok(true) => {
                counter!("broadside_requests_finalized_total", "status" => "COMPLETED").increment(1);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to finalize request, leaving it for recovery"
                );
                false
            }
        }
    }

    /// Record `TIMEOUT` for every snapshot provider without a result, then finalize.
    async fn expire(&self) {
        let results = match self
            .with_retries("get_results", None, move || {
                self.storage.get_results(self.job.request_id)
            })
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read results at deadline");
                return;
            }
        };

        let outstanding: Vec<ProviderId> = self
            .job
            .outstanding(&results)
            .into_iter()
            .map(|p| p.id.clone())
            .collect();
        if outstanding.is_empty() {
            self.finalize().await;
            return;
        }

        let budget = self
            .job
            .deadline_at
            .map(|at| at - self.job.started_at)
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        let timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);

        tracing::warn!(
            outstanding = outstanding.len(),
            timeout_ms,
            "Recording outstanding providers as timed out"
        );
        for provider_id in outstanding {
            counter!(
                "broadside_provider_calls_total",
                "provider" => provider_id.to_string(),
                "outcome" => "timeout"
            )
            .increment(1);
            let result = ProviderResult::new(
                self.job.request_id,
                provider_id,
                ProviderOutcome::Timeout { timeout_ms },
                budget,
            );
            self.record(result).await;
        }
    }

    /// Retry a storage operation on transient errors with exponential backoff.
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        provider_id: Option<&ProviderId>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    if let Some(provider_id) = provider_id {
                        counter!(
                            "broadside_result_write_retries_total",
                            "provider" => provider_id.to_string()
                        )
                        .increment(1);
                    }
                    tracing::warn!(
                        operation,
                        attempt,
                        max_retries = self.retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("provider task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("provider task panicked: {}", s)
    } else {
        "provider task panicked".to_string()
    }
}
