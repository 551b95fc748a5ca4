//! Aggregation job: the durable coordination record behind one in-flight request.
//!
//! A job owns the provider snapshot and the completed counter for its request.
//! It is written when fan-out starts, updated by each provider completion, and
//! finalized exactly once when the counter reaches the snapshot size. Clients
//! never read it directly; they see request rows and provider results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::{Provider, ProviderSnapshot};
use super::request::RequestId;
use super::result::ProviderResult;
use crate::error::Result;
use crate::manager::Storage;

/// Unique identifier for an engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(pub Uuid);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for EngineId {
    fn from(uuid: Uuid) -> Self {
        EngineId(uuid)
    }
}

impl std::ops::Deref for EngineId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Which engine is driving a job, and until when.
///
/// A job whose lease has expired without being finalized is considered
/// orphaned (its engine died) and may be claimed by another engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    pub owner: EngineId,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Durable coordination state for one request's fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationJob {
    pub request_id: RequestId,
    pub snapshot: ProviderSnapshot,
    /// Number of providers with a persisted result
    pub completed: usize,
    pub started_at: DateTime<Utc>,
    /// Overall deadline; missing providers are recorded as timed out once it passes
    pub deadline_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub lease: Option<JobLease>,
}

impl AggregationJob {
    pub fn total(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total()
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|deadline| deadline <= now)
    }

    /// Snapshot providers that have no result among `results` yet.
    pub fn outstanding<'a>(&'a self, results: &[ProviderResult]) -> Vec<&'a Provider> {
        self.snapshot
            .iter()
            .filter(|p| !results.iter().any(|r| r.provider_id == p.id))
            .collect()
    }

    /// Move the request to `COMPLETED`.
    ///
    /// Safe to call from any number of racing completions: only one caller
    /// observes `true`, everyone else gets `false`.
    pub async fn finalize<S: Storage + ?Sized>(&self, storage: &S) -> Result<bool> {
        let finalized = storage.finalize_job(self.request_id, Utc::now()).await?;
        if finalized {
            tracing::info!(
                request_id = %self.request_id,
                total = self.total(),
                "Request finalized"
            );
        } else {
            tracing::debug!(
                request_id = %self.request_id,
                "Request already finalized by another completion"
            );
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::{EndpointConfig, ProviderId};
    use crate::domain::result::ProviderOutcome;
    use std::time::Duration;

    fn job(providers: &[&str]) -> AggregationJob {
        AggregationJob {
            request_id: RequestId::from(Uuid::new_v4()),
            snapshot: ProviderSnapshot::capture(
                providers
                    .iter()
                    .map(|id| Provider::new(*id, *id, EndpointConfig::new("https://quotes.test")))
                    .collect(),
            ),
            completed: 0,
            started_at: Utc::now(),
            deadline_at: None,
            finalized_at: None,
            lease: None,
        }
    }

    #[test]
    fn test_outstanding_excludes_reported_providers() {
        let job = job(&["axa", "allianz", "mapfre"]);
        let reported = vec![ProviderResult::new(
            job.request_id,
            ProviderId::from("allianz"),
            ProviderOutcome::Timeout { timeout_ms: 10 },
            Duration::from_millis(10),
        )];

        let outstanding: Vec<_> = job
            .outstanding(&reported)
            .into_iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(
            outstanding,
            vec![ProviderId::from("axa"), ProviderId::from("mapfre")]
        );
    }

    #[test]
    fn test_deadline_and_lease_expiry() {
        let now = Utc::now();
        let mut job = job(&["axa"]);
        assert!(!job.deadline_passed(now));

        job.deadline_at = Some(now - chrono::Duration::seconds(1));
        assert!(job.deadline_passed(now));

        let lease = JobLease {
            owner: EngineId::from(Uuid::new_v4()),
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + chrono::Duration::seconds(30)));
    }
}
