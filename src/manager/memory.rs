//! In-process storage backend.
//!
//! Everything lives behind a single mutex, which makes every trait method
//! trivially atomic. Used by tests and single-process deployments; it also
//! carries fault injection so tests can exercise the engine's retry paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::Storage;
use crate::domain::job::{AggregationJob, EngineId, JobLease};
use crate::domain::progress::Progress;
use crate::domain::provider::ProviderSnapshot;
use crate::domain::request::{
    AnyQuoteRequest, Completed, Failed, InProgress, Pending, QuoteRequest, RequestId,
    RequestStatus,
};
use crate::domain::result::{ProviderResult, Tally};
use crate::error::{BroadsideError, Result};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, AnyQuoteRequest>,
    jobs: HashMap<RequestId, AggregationJob>,
    results: HashMap<RequestId, Vec<ProviderResult>>,
}

#[derive(Default)]
struct Faults {
    job_starts: AtomicUsize,
    result_writes: AtomicUsize,
    finalizations: AtomicUsize,
    result_write_attempts: AtomicUsize,
}

/// Storage held in process memory.
///
/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<Inner>>,
    faults: Arc<Faults>,
}

fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected(operation: &str) -> BroadsideError {
    BroadsideError::Storage(anyhow::anyhow!("injected {} failure", operation))
}

fn expect_pending(request: Option<&AnyQuoteRequest>, id: RequestId) -> Result<()> {
    match request {
        None => Err(BroadsideError::RequestNotFound(id)),
        Some(AnyQuoteRequest::Pending(_)) => Ok(()),
        Some(other) => Err(BroadsideError::InvalidState(
            id,
            other.status().to_string(),
            RequestStatus::Pending.to_string(),
        )),
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` job starts fail with a transient storage error.
    pub fn fail_next_job_starts(&self, n: usize) {
        self.faults.job_starts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` result writes fail with a transient storage error.
    pub fn fail_next_result_writes(&self, n: usize) {
        self.faults.result_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` finalization attempts fail with a transient storage error.
    pub fn fail_next_finalizations(&self, n: usize) {
        self.faults.finalizations.store(n, Ordering::SeqCst);
    }

    /// Total `record_result` calls seen, including failed ones.
    pub fn result_write_attempts(&self) -> usize {
        self.faults.result_write_attempts.load(Ordering::SeqCst)
    }

    /// Expire every lease right away, as if its engine had died.
    pub fn expire_leases(&self) {
        let now = Utc::now();
        for job in self.inner.lock().jobs.values_mut() {
            if let Some(lease) = job.lease.as_mut() {
                lease.expires_at = now;
            }
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_request(&self, request: &QuoteRequest<Pending>) -> Result<()> {
        self.inner
            .lock()
            .requests
            .insert(request.data.id, request.clone().into());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyQuoteRequest> {
        self.inner
            .lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or(BroadsideError::RequestNotFound(id))
    }

    async fn start_job(
        &self,
        request: &QuoteRequest<InProgress>,
        job: &AggregationJob,
    ) -> Result<()> {
        if take_fault(&self.faults.job_starts) {
            return Err(injected("job start"));
        }

        let id = request.data.id;
        let mut inner = self.inner.lock();
        expect_pending(inner.requests.get(&id), id)?;

        inner.requests.insert(id, request.clone().into());
        inner.jobs.insert(id, job.clone());
        Ok(())
    }

    async fn complete_without_providers(&self, request: &QuoteRequest<Completed>) -> Result<()> {
        let id = request.data.id;
        let mut inner = self.inner.lock();
        expect_pending(inner.requests.get(&id), id)?;

        inner.requests.insert(id, request.clone().into());
        inner.jobs.insert(
            id,
            AggregationJob {
                request_id: id,
                snapshot: ProviderSnapshot::default(),
                completed: 0,
                started_at: request.state.started_at,
                deadline_at: None,
                finalized_at: Some(request.state.completed_at),
                lease: None,
            },
        );
        Ok(())
    }

    async fn fail_request(&self, request: &QuoteRequest<Failed>) -> Result<()> {
        let id = request.data.id;
        let mut inner = self.inner.lock();
        expect_pending(inner.requests.get(&id), id)?;

        inner.requests.insert(id, request.clone().into());
        Ok(())
    }

    async fn record_result(&self, result: &ProviderResult) -> Result<Tally> {
        self.faults
            .result_write_attempts
            .fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.faults.result_writes) {
            return Err(injected("result write"));
        }

        let id = result.request_id;
        let mut inner = self.inner.lock();
        let Inner { jobs, results, .. } = &mut *inner;

        let job = jobs.get_mut(&id).ok_or(BroadsideError::JobNotFound(id))?;
        if !job.snapshot.contains(&result.provider_id) {
            return Err(BroadsideError::UnknownProvider(
                id,
                result.provider_id.clone(),
            ));
        }

        let rows = results.entry(id).or_default();
        let inserted = if rows.iter().any(|r| r.provider_id == result.provider_id) {
            false
        } else {
            rows.push(result.clone());
            job.completed += 1;
            true
        };

        Ok(Tally {
            completed: job.completed,
            total: job.total(),
            inserted,
        })
    }

    async fn finalize_job(
        &self,
        request_id: RequestId,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        if take_fault(&self.faults.finalizations) {
            return Err(injected("finalization"));
        }

        let mut inner = self.inner.lock();
        let Inner { requests, jobs, .. } = &mut *inner;

        let job = jobs
            .get_mut(&request_id)
            .ok_or(BroadsideError::JobNotFound(request_id))?;
        if job.is_finalized() {
            return Ok(false);
        }
        if !job.is_complete() {
            return Err(BroadsideError::InvalidState(
                request_id,
                format!("{}/{} providers reported", job.completed, job.total()),
                "all providers reported".to_string(),
            ));
        }

        let request = requests
            .remove(&request_id)
            .ok_or(BroadsideError::RequestNotFound(request_id))?;
        let in_progress = match request {
            AnyQuoteRequest::InProgress(r) => r,
            other => {
                let actual = other.status().to_string();
                requests.insert(request_id, other);
                return Err(BroadsideError::InvalidState(
                    request_id,
                    actual,
                    RequestStatus::InProgress.to_string(),
                ));
            }
        };

        requests.insert(
            request_id,
            QuoteRequest {
                data: in_progress.data,
                state: Completed {
                    started_at: in_progress.state.started_at,
                    completed_at,
                    total_providers: in_progress.state.total_providers,
                },
            }
            .into(),
        );
        job.finalized_at = Some(completed_at);
        Ok(true)
    }

    async fn get_job(&self, request_id: RequestId) -> Result<AggregationJob> {
        self.inner
            .lock()
            .jobs
            .get(&request_id)
            .cloned()
            .ok_or(BroadsideError::JobNotFound(request_id))
    }

    async fn get_results(&self, request_id: RequestId) -> Result<Vec<ProviderResult>> {
        let inner = self.inner.lock();
        if !inner.requests.contains_key(&request_id) {
            return Err(BroadsideError::RequestNotFound(request_id));
        }
        Ok(inner.results.get(&request_id).cloned().unwrap_or_default())
    }

    async fn get_progress(&self, request_id: RequestId) -> Result<Progress> {
        let inner = self.inner.lock();
        let request = inner
            .requests
            .get(&request_id)
            .ok_or(BroadsideError::RequestNotFound(request_id))?;
        let (completed, total) = inner
            .jobs
            .get(&request_id)
            .map(|job| (job.completed, job.total()))
            .unwrap_or((0, 0));

        Ok(Progress {
            request_id,
            status: request.status(),
            completed,
            total,
        })
    }

    async fn renew_leases(
        &self,
        owner: EngineId,
        request_ids: &[RequestId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut renewed = 0;
        for id in request_ids {
            if let Some(job) = inner.jobs.get_mut(id)
                && !job.is_finalized()
                && let Some(lease) = job.lease.as_mut()
                && lease.owner == owner
            {
                lease.expires_at = expires_at;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn claim_orphaned_jobs(
        &self,
        owner: EngineId,
        limit: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<AggregationJob>> {
        let mut inner = self.inner.lock();

        let mut orphaned: Vec<&mut AggregationJob> = inner
            .jobs
            .values_mut()
            .filter(|job| {
                !job.is_finalized() && job.lease.is_none_or(|lease| lease.is_expired(now))
            })
            .collect();
        orphaned.sort_by_key(|job| job.started_at);

        Ok(orphaned
            .into_iter()
            .take(limit)
            .map(|job| {
                job.lease = Some(JobLease {
                    owner,
                    expires_at: lease_expires_at,
                });
                job.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::{EndpointConfig, Provider, ProviderId};
    use crate::domain::request::RequestInput;
    use crate::domain::result::ProviderOutcome;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn input() -> RequestInput {
        RequestInput {
            coverage_type: "traffic".to_string(),
            form: json!({"plate": "34ABC123"}),
            user_id: None,
        }
    }

    fn snapshot(ids: &[&str]) -> ProviderSnapshot {
        ProviderSnapshot::capture(
            ids.iter()
                .map(|id| Provider::new(*id, *id, EndpointConfig::new("https://quotes.test")))
                .collect(),
        )
    }

    fn lease(owner: EngineId) -> JobLease {
        JobLease {
            owner,
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        }
    }

    fn timeout_result(request_id: RequestId, provider: &str) -> ProviderResult {
        ProviderResult::new(
            request_id,
            ProviderId::from(provider),
            ProviderOutcome::Timeout { timeout_ms: 100 },
            Duration::from_millis(100),
        )
    }

    async fn started(
        storage: &InMemoryStorage,
        providers: &[&str],
    ) -> (RequestId, AggregationJob) {
        let id = storage.create_request(input()).await.unwrap();
        let pending = storage.get_request(id).await.unwrap().into_pending().unwrap();
        let owner = EngineId::from(Uuid::new_v4());
        let (_, job) = pending
            .start(snapshot(providers), None, lease(owner), storage)
            .await
            .unwrap();
        (id, job)
    }

    #[tokio::test]
    async fn test_create_request_validates_before_persisting() {
        let storage = InMemoryStorage::new();
        let err = storage
            .create_request(RequestInput {
                coverage_type: String::new(),
                ..input()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BroadsideError::ValidationError(_)));
        assert!(storage.inner.lock().requests.is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa"]).await;

        let stale = QuoteRequest {
            data: storage.get_request(id).await.unwrap().data().clone(),
            state: Pending {},
        };
        let err = stale
            .start(snapshot(&["axa"]), None, lease(EngineId::from(Uuid::new_v4())), &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidState(_, ref actual, _) if actual == "IN_PROGRESS"));
    }

    #[tokio::test]
    async fn test_record_result_is_idempotent_per_provider() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa", "allianz"]).await;

        let first = storage.record_result(&timeout_result(id, "axa")).await.unwrap();
        assert_eq!(
            first,
            Tally {
                completed: 1,
                total: 2,
                inserted: true
            }
        );

        let duplicate = storage.record_result(&timeout_result(id, "axa")).await.unwrap();
        assert!(!duplicate.inserted);
        assert_eq!(duplicate.completed, 1);
        assert_eq!(storage.get_results(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_result_rejects_provider_outside_snapshot() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa"]).await;

        let err = storage
            .record_result(&timeout_result(id, "sompo"))
            .await
            .unwrap_err();
        assert!(matches!(err, BroadsideError::UnknownProvider(_, _)));
    }

    #[tokio::test]
    async fn test_finalize_requires_all_results_and_fires_once() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa", "allianz"]).await;

        storage.record_result(&timeout_result(id, "axa")).await.unwrap();
        let err = storage.finalize_job(id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidState(_, _, _)));

        storage.record_result(&timeout_result(id, "allianz")).await.unwrap();
        assert!(storage.finalize_job(id, Utc::now()).await.unwrap());
        assert!(!storage.finalize_job(id, Utc::now()).await.unwrap());

        let progress = storage.get_progress(id).await.unwrap();
        assert_eq!(progress.status, RequestStatus::Completed);
        assert_eq!((progress.completed, progress.total), (2, 2));
        assert!(progress.is_done());
    }

    #[tokio::test]
    async fn test_injected_faults_are_transient_and_counted() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa"]).await;
        storage.fail_next_result_writes(1);

        let err = storage
            .record_result(&timeout_result(id, "axa"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(storage.record_result(&timeout_result(id, "axa")).await.is_ok());
        assert_eq!(storage.result_write_attempts(), 2);
    }

    #[tokio::test]
    async fn test_expired_leases_are_claimed_once() {
        let storage = InMemoryStorage::new();
        let (id, _) = started(&storage, &["axa"]).await;
        let rescuer = EngineId::from(Uuid::new_v4());
        let later = Utc::now() + chrono::Duration::seconds(60);

        let none = storage
            .claim_orphaned_jobs(rescuer, 10, Utc::now(), later)
            .await
            .unwrap();
        assert!(none.is_empty());

        storage.expire_leases();
        let claimed = storage
            .claim_orphaned_jobs(rescuer, 10, Utc::now(), later)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].request_id, id);
        assert_eq!(claimed[0].lease.map(|l| l.owner), Some(rescuer));

        let again = storage
            .claim_orphaned_jobs(EngineId::from(Uuid::new_v4()), 10, Utc::now(), later)
            .await
            .unwrap();
        assert!(again.is_empty());

        assert_eq!(storage.renew_leases(rescuer, &[id], later).await.unwrap(), 1);
    }
}
