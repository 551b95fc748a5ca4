//! Orchestrator: the process-wide entry point of the aggregation engine.
//!
//! `start_aggregation` captures a provider snapshot, durably moves the request
//! to `IN_PROGRESS` together with its aggregation job, and hands the fan-out to
//! a background [`JobRunner`]. It returns before any provider completes.
//!
//! `run` adds the restart-safety loop: lease renewal for jobs this engine is
//! driving, recovery of jobs whose engine died, and periodic status logging.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::adapter::ProviderAdapter;
use crate::domain::job::{AggregationJob, EngineId, JobLease};
use crate::domain::progress::Progress;
use crate::domain::provider::{Provider, ProviderSnapshot};
use crate::domain::request::transitions::chrono_duration;
use crate::domain::request::{Pending, QuoteRequest, RequestData, RequestId, RequestStatus};
use crate::domain::result::ProviderResult;
use crate::error::{BroadsideError, Result};
use crate::manager::Storage;
use crate::registry::ProviderRegistry;

mod progress;
mod runner;

pub use progress::ProgressReporter;
use runner::JobRunner;

/// Configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for each provider call in milliseconds, unless the provider overrides it
    pub provider_timeout_ms: u64,

    /// Overall deadline per request in milliseconds; providers still missing
    /// when it passes are recorded as timed out. None disables it.
    pub request_deadline_ms: Option<u64>,

    /// Maximum number of retries for a failing result write
    pub result_write_max_retries: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub result_write_backoff_ms: u64,

    /// Factor by which the backoff is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// How long a job lease lasts without renewal (milliseconds). An engine
    /// that dies stops renewing, and its jobs become claimable after this.
    pub lease_ms: u64,

    /// Interval for renewing leases on jobs this engine is driving (milliseconds)
    pub lease_renewal_interval_ms: u64,

    /// Interval for polling storage for orphaned jobs (milliseconds)
    pub recovery_interval_ms: u64,

    /// Maximum number of orphaned jobs to claim in each iteration
    pub recovery_batch_size: usize,

    /// Interval for logging engine status (jobs in flight) in milliseconds
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 10_000,
            request_deadline_ms: Some(30_000),
            result_write_max_retries: 3,
            result_write_backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 2_000,
            lease_ms: 60_000,                  // 1 minute
            lease_renewal_interval_ms: 10_000, // Renew every 10 seconds
            recovery_interval_ms: 5_000,       // Poll every 5 seconds
            recovery_batch_size: 10,
            status_log_interval_ms: Some(5_000),
        }
    }
}

/// The aggregation engine.
///
/// Any number of orchestrators may share one storage backend; compare-and-set
/// transitions and leases keep them from driving the same job twice.
pub struct Orchestrator<S, R, A>
where
    S: Storage,
    R: ProviderRegistry,
    A: ProviderAdapter,
{
    engine_id: EngineId,
    storage: Arc<S>,
    registry: Arc<R>,
    adapter: Arc<A>,
    config: EngineConfig,
    reporter: ProgressReporter<S>,
    /// Requests whose jobs this engine is currently driving
    running: Arc<DashSet<RequestId>>,
    /// Supervising task per running job
    supervisors: Mutex<JoinSet<()>>,
    /// Cancelled on shutdown; stops every supervising task
    jobs_token: CancellationToken,
}

impl<S, R, A> Orchestrator<S, R, A>
where
    S: Storage + 'static,
    R: ProviderRegistry + 'static,
    A: ProviderAdapter,
{
    pub fn new(storage: Arc<S>, registry: Arc<R>, adapter: Arc<A>) -> Self {
        Self {
            engine_id: EngineId::from(uuid::Uuid::new_v4()),
            reporter: ProgressReporter::new(storage.clone()),
            storage,
            registry,
            adapter,
            config: EngineConfig::default(),
            running: Arc::new(DashSet::new()),
            supervisors: Mutex::new(JoinSet::new()),
            jobs_token: CancellationToken::new(),
        }
    }

    /// Set a custom configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn progress_reporter(&self) -> &ProgressReporter<S> {
        &self.reporter
    }

    /// Number of jobs this engine is currently driving.
    pub fn jobs_in_flight(&self) -> usize {
        self.running.len()
    }

    /// Start fanning a pending request out to every enabled provider.
    ///
    /// Returns the request's progress right after the fan-out was scheduled:
    /// `IN_PROGRESS 0/N`, or `COMPLETED 0/0` when no provider is enabled.
    ///
    /// # Errors
    /// - `RequestNotFound` if the request does not exist
    /// - `Shutdown` if the engine's background loop has stopped
    /// - `InvalidState` if the request is not `PENDING` (including a second
    ///   start racing the first); nothing is fanned out again
    /// - the underlying error if the registry or storage failed before any
    ///   provider was called; the request is then marked `FAILED`
    #[tracing::instrument(skip(self), fields(engine_id = %self.engine_id, request_id = %request_id))]
    pub async fn start_aggregation(&self, request_id: RequestId) -> Result<Progress> {
        if self.jobs_token.is_cancelled() {
            return Err(BroadsideError::Shutdown);
        }
        let pending = self.storage.get_request(request_id).await?.into_pending()?;

        let providers = match self.registry.list_enabled_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                self.fail_before_fan_out(pending, &e).await;
                return Err(e);
            }
        };
        let snapshot = ProviderSnapshot::capture(providers);

        if snapshot.is_empty() {
            let fallback = pending.clone();
            return match pending.complete_without_providers(self.storage.as_ref()).await {
                Ok(_) => {
                    tracing::info!("No providers enabled, request completed with zero results");
                    counter!("broadside_requests_finalized_total", "status" => "COMPLETED")
                        .increment(1);
                    Ok(Progress {
                        request_id,
                        status: RequestStatus::Completed,
                        completed: 0,
                        total: 0,
                    })
                }
                Err(e) => {
                    self.fail_before_fan_out(fallback, &e).await;
                    Err(e)
                }
            };
        }

        let fallback = pending.clone();
        let deadline = self.config.request_deadline_ms.map(Duration::from_millis);
        let (request, job) = match pending
            .start(snapshot, deadline, self.new_lease(), self.storage.as_ref())
            .await
        {
            Ok(started) => started,
            Err(e) => {
                self.fail_before_fan_out(fallback, &e).await;
                return Err(e);
            }
        };

        let total = job.total();
        tracing::info!(
            total,
            providers = ?job.snapshot.ids(),
            deadline_at = ?job.deadline_at,
            "Fan-out started"
        );

        let providers: Vec<Provider> = job.snapshot.iter().cloned().collect();
        self.spawn_job(job, request.data, providers);

        Ok(Progress {
            request_id,
            status: RequestStatus::InProgress,
            completed: 0,
            total,
        })
    }

    /// Status and completed/total counts for a request.
    pub async fn get_progress(&self, request_id: RequestId) -> Result<Progress> {
        self.reporter.get_progress(request_id).await
    }

    /// Provider results persisted so far for a request.
    pub async fn get_results(&self, request_id: RequestId) -> Result<Vec<ProviderResult>> {
        self.reporter.get_results(request_id).await
    }

    /// Take over jobs whose engine stopped renewing their lease, and resume them.
    ///
    /// Only providers without a persisted result are called again. A job whose
    /// overall deadline has passed is finalized with the missing providers
    /// recorded as timed out.
    ///
    /// Returns how many jobs were resumed.
    #[tracing::instrument(skip(self), fields(engine_id = %self.engine_id))]
    pub async fn recover_orphaned_jobs(&self) -> Result<usize> {
        if self.jobs_token.is_cancelled() {
            return Err(BroadsideError::Shutdown);
        }
        let now = Utc::now();
        let lease_expires_at = now + chrono_duration(Duration::from_millis(self.config.lease_ms));
        let jobs = self
            .storage
            .claim_orphaned_jobs(
                self.engine_id,
                self.config.recovery_batch_size,
                now,
                lease_expires_at,
            )
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        // Persisted snapshots carry no api keys; take the current ones from the registry
        let registered = match self.registry.list_enabled_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::warn!(error = %e, "Registry unavailable, resuming without provider credentials");
                Vec::new()
            }
        };

        let mut resumed = 0;
        for job in jobs {
            let request_id = job.request_id;
            if self.running.contains(&request_id) {
                continue;
            }

            let request = match self.storage.get_request(request_id).await {
                Ok(request) => request.data().clone(),
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to load orphaned request");
                    continue;
                }
            };
            let results = match self.storage.get_results(request_id).await {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to load results of orphaned request");
                    continue;
                }
            };

            let outstanding: Vec<Provider> = job
                .outstanding(&results)
                .into_iter()
                .map(|p| p.clone().with_credentials_from(&registered))
                .collect();
            tracing::info!(
                request_id = %request_id,
                completed = job.completed,
                total = job.total(),
                outstanding = outstanding.len(),
                "Resuming orphaned job"
            );
            counter!("broadside_jobs_recovered_total").increment(1);

            self.spawn_job(job, request, outstanding);
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Run the engine's background work until `shutdown_token` is cancelled.
    ///
    /// This spawns lease renewal and (optionally) status logging, then polls
    /// for orphaned jobs. On shutdown every job this engine drives is stopped
    /// without recording anything, so its lease lapses and it can be resumed.
    ///
    /// # Example
    /// ```ignore
    /// let orchestrator = Arc::new(Orchestrator::new(storage, registry, adapter));
    /// let shutdown = CancellationToken::new();
    /// let handle = orchestrator.clone().run(shutdown.clone());
    ///
    /// // Serve requests...
    ///
    /// shutdown.cancel();
    /// handle.await??;
    /// ```
    pub fn run(self: Arc<Self>, shutdown_token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run_loop(shutdown_token).await })
    }

    #[tracing::instrument(skip_all, fields(engine_id = %self.engine_id))]
    async fn run_loop(self: Arc<Self>, shutdown_token: CancellationToken) -> Result<()> {
        tracing::info!("Engine starting background loop");

        // Spawn periodic lease renewal for jobs we are driving
        let storage = self.storage.clone();
        let running = self.running.clone();
        let engine_id = self.engine_id;
        let lease_ms = self.config.lease_ms;
        let renewal_interval_ms = self.config.lease_renewal_interval_ms;
        let shutdown_signal = shutdown_token.clone();
        let renewal_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(renewal_interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let ids: Vec<RequestId> = running.iter().map(|entry| *entry.key()).collect();
                        if ids.is_empty() {
                            continue;
                        }
                        let expires_at = Utc::now() + chrono_duration(Duration::from_millis(lease_ms));
                        match storage.renew_leases(engine_id, &ids, expires_at).await {
                            Ok(renewed) => {
                                tracing::trace!(renewed, running = ids.len(), "Leases renewed");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to renew leases");
                            }
                        }
                    }
                    _ = shutdown_signal.cancelled() => {
                        tracing::info!("Shutting down lease renewal");
                        break;
                    }
                }
            }
        });

        // Spawn periodic status logging task if configured
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let running = self.running.clone();
            let shutdown_signal = shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            tracing::debug!(
                                engine_id = %engine_id,
                                jobs_in_flight = running.len(),
                                "Engine status"
                            );
                        }
                        _ = shutdown_signal.cancelled() => break,
                    }
                }
            });
        }

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.recovery_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_supervisors();
                    match self.recover_orphaned_jobs().await {
                        Ok(0) => {}
                        Ok(resumed) => tracing::info!(resumed, "Resumed orphaned jobs"),
                        Err(e) => tracing::error!(error = %e, "Failed to claim orphaned jobs"),
                    }
                }
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping engine");
                    break;
                }
            }
        }

        self.jobs_token.cancel();
        let mut supervisors = std::mem::take(&mut *self.supervisors.lock());
        while let Some(joined) = supervisors.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job supervisor panicked");
            }
        }

        if let Err(e) = renewal_handle.await {
            tracing::error!(error = %e, "Lease renewal task panicked");
        }
        Ok(())
    }

    fn new_lease(&self) -> JobLease {
        JobLease {
            owner: self.engine_id,
            expires_at: Utc::now() + chrono_duration(Duration::from_millis(self.config.lease_ms)),
        }
    }

    /// Best-effort `PENDING -> FAILED` after the fan-out could not start.
    async fn fail_before_fan_out(&self, pending: QuoteRequest<Pending>, error: &BroadsideError) {
        // Someone else moved the request on; it is not ours to fail
        if matches!(error, BroadsideError::InvalidState(..)) {
            return;
        }

        let request_id = pending.data.id;
        tracing::error!(request_id = %request_id, error = %error, "Fan-out could not start, failing request");
        match pending.fail(error.to_string(), self.storage.as_ref()).await {
            Ok(_) => {
                counter!("broadside_requests_finalized_total", "status" => "FAILED").increment(1);
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to mark request as failed");
            }
        }
    }

    /// Hand a started (or recovered) job to a background supervising task.
    fn spawn_job(&self, job: AggregationJob, request: RequestData, providers: Vec<Provider>) {
        let request_id = job.request_id;
        let runner = JobRunner {
            storage: self.storage.clone(),
            adapter: self.adapter.clone(),
            retry: (&self.config).into(),
            default_timeout: Duration::from_millis(self.config.provider_timeout_ms),
            request: Arc::new(request),
            job: Arc::new(job),
        };

        let running = self.running.clone();
        running.insert(request_id);
        gauge!("broadside_jobs_in_flight").set(running.len() as f64);

        let shutdown = self.jobs_token.clone();
        let mut supervisors = self.supervisors.lock();
        reap_finished(&mut supervisors);
        supervisors.spawn(async move {
            // Ensure we stop renewing the lease when this job ends
            let _guard = scopeguard::guard((), |_| {
                running.remove(&request_id);
                gauge!("broadside_jobs_in_flight").set(running.len() as f64);
            });
            runner.drive(providers, shutdown).await;
        });
    }

    /// Drop finished supervisors from the join set.
    fn reap_supervisors(&self) {
        reap_finished(&mut self.supervisors.lock());
    }
}

fn reap_finished(supervisors: &mut JoinSet<()>) {
    while let Some(joined) = supervisors.try_join_next() {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Job supervisor panicked");
        }
    }
}
