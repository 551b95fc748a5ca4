//! PostgreSQL implementation of Storage and ProviderRegistry.
//!
//! Every compare-and-set transition is a single conditional `UPDATE` inside a
//! transaction; result recording locks the job row (`FOR UPDATE`) so that the
//! insert and the counter increment are serialized per request.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::Storage;
use crate::domain::job::{AggregationJob, EngineId, JobLease};
use crate::domain::progress::Progress;
use crate::domain::provider::{EndpointConfig, Provider, ProviderId, ProviderSnapshot};
use crate::domain::request::{
    AnyQuoteRequest, Completed, Failed, InProgress, Pending, QuoteRequest, RequestData, RequestId,
    RequestStatus,
};
use crate::domain::result::{ProviderOutcome, ProviderResult, Tally};
use crate::error::{BroadsideError, Result};
use crate::registry::ProviderRegistry;

mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

/// PostgreSQL implementation of the Storage and ProviderRegistry traits.
///
/// Reads that clients poll (progress, results) go to the read pool; every
/// transition and anything that must see its own writes uses the write pool.
///
/// # Example
/// ```ignore
/// use broadside::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/broadside").await?;
/// broadside::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
///
/// let orchestrator = Orchestrator::new(storage.clone(), storage.clone(), adapter);
/// ```
#[derive(Clone)]
pub struct PostgresStorage<P: PoolProvider = PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresStorage<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    /// Get the write pool.
    pub fn pool(&self) -> &PgPool {
        self.pools.write()
    }

    /// Add a provider, or update the one with the same id keeping its position.
    pub async fn register_provider(&self, provider: &Provider) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO providers (id, name, endpoint, enabled)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, endpoint = EXCLUDED.endpoint, enabled = EXCLUDED.enabled
            "#,
        )
        .bind(&*provider.id)
        .bind(&provider.name)
        .bind(Json(&provider.endpoint))
        .bind(provider.enabled)
        .execute(self.pools.write())
        .await
        .map_err(db_err("Failed to register provider"))?;
        Ok(())
    }

    /// Enable or disable a provider for future requests.
    pub async fn set_provider_enabled(&self, id: &ProviderId, enabled: bool) -> Result<()> {
        let updated = sqlx::query("UPDATE providers SET enabled = $2 WHERE id = $1")
            .bind(&**id)
            .bind(enabled)
            .execute(self.pools.write())
            .await
            .map_err(db_err("Failed to update provider"))?
            .rows_affected();
        if updated == 0 {
            return Err(BroadsideError::ProviderNotRegistered(id.clone()));
        }
        tracing::info!(provider_id = %id, enabled, "Provider availability changed");
        Ok(())
    }

    /// Report why a conditional request update matched nothing.
    async fn status_mismatch(
        tx: &mut Transaction<'_, Postgres>,
        id: RequestId,
        expected: RequestStatus,
    ) -> BroadsideError {
        let status: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM quote_requests WHERE id = $1")
                .bind(*id)
                .fetch_optional(&mut **tx)
                .await;
        match status {
            Ok(Some(actual)) => BroadsideError::InvalidState(id, actual, expected.to_string()),
            Ok(None) => BroadsideError::RequestNotFound(id),
            Err(e) => db_err("Failed to read request status")(e),
        }
    }

    /// Conditionally move a request out of `PENDING` inside `tx`.
    async fn leave_pending(
        tx: &mut Transaction<'_, Postgres>,
        id: RequestId,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<()> {
        let updated = query
            .execute(&mut **tx)
            .await
            .map_err(db_err("Failed to update request"))?
            .rows_affected();
        if updated == 0 {
            return Err(Self::status_mismatch(tx, id, RequestStatus::Pending).await);
        }
        Ok(())
    }
}

impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> BroadsideError {
    move |e| BroadsideError::Storage(anyhow!("{}: {}", context, e))
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn request_from_row(row: &PgRow) -> Result<AnyQuoteRequest> {
    let decode = db_err("Failed to decode request row");
    let id = RequestId(row.try_get("id").map_err(&decode)?);
    let status: String = row.try_get("status").map_err(&decode)?;
    let data = RequestData {
        id,
        coverage_type: row.try_get("coverage_type").map_err(&decode)?,
        form: row.try_get("form").map_err(&decode)?,
        user_id: row.try_get("user_id").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
    };
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(&decode)?;
    let total: Option<i32> = row.try_get("total_providers").map_err(&decode)?;
    let total_providers = total.unwrap_or(0).max(0) as usize;

    let status: RequestStatus = status
        .parse()
        .map_err(|e: String| BroadsideError::Other(anyhow!(e)))?;
    let request: AnyQuoteRequest = match status {
        RequestStatus::Pending => QuoteRequest {
            data,
            state: Pending {},
        }
        .into(),
        RequestStatus::InProgress => QuoteRequest {
            data,
            state: InProgress {
                started_at: started_at.unwrap_or_else(Utc::now),
                total_providers,
                deadline_at: row.try_get("deadline_at").map_err(&decode)?,
            },
        }
        .into(),
        RequestStatus::Completed => {
            let completed_at: Option<DateTime<Utc>> =
                row.try_get("completed_at").map_err(&decode)?;
            let completed_at = completed_at.unwrap_or_else(Utc::now);
            QuoteRequest {
                data,
                state: Completed {
                    started_at: started_at.unwrap_or(completed_at),
                    completed_at,
                    total_providers,
                },
            }
            .into()
        }
        RequestStatus::Failed => {
            let failed_at: Option<DateTime<Utc>> = row.try_get("failed_at").map_err(&decode)?;
            let reason: Option<String> = row.try_get("failure_reason").map_err(&decode)?;
            QuoteRequest {
                data,
                state: Failed {
                    failed_at: failed_at.unwrap_or_else(Utc::now),
                    reason: reason.unwrap_or_default(),
                },
            }
            .into()
        }
    };
    Ok(request)
}

fn job_from_row(row: &PgRow) -> Result<AggregationJob> {
    let decode = db_err("Failed to decode job row");
    let snapshot: Json<ProviderSnapshot> = row.try_get("snapshot").map_err(&decode)?;
    let completed: i32 = row.try_get("completed").map_err(&decode)?;
    let lease_owner: Option<Uuid> = row.try_get("lease_owner").map_err(&decode)?;
    let lease_expires_at: Option<DateTime<Utc>> =
        row.try_get("lease_expires_at").map_err(&decode)?;

    Ok(AggregationJob {
        request_id: RequestId(row.try_get("request_id").map_err(&decode)?),
        snapshot: snapshot.0,
        completed: completed.max(0) as usize,
        started_at: row.try_get("started_at").map_err(&decode)?,
        deadline_at: row.try_get("deadline_at").map_err(&decode)?,
        finalized_at: row.try_get("finalized_at").map_err(&decode)?,
        lease: lease_owner.zip(lease_expires_at).map(|(owner, expires_at)| JobLease {
            owner: EngineId(owner),
            expires_at,
        }),
    })
}

fn result_from_row(row: &PgRow) -> Result<ProviderResult> {
    let decode = db_err("Failed to decode result row");
    let outcome: Json<ProviderOutcome> = row.try_get("details").map_err(&decode)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(&decode)?;
    let provider_id: String = row.try_get("provider_id").map_err(&decode)?;

    Ok(ProviderResult {
        request_id: RequestId(row.try_get("request_id").map_err(&decode)?),
        provider_id: ProviderId(provider_id),
        outcome: outcome.0,
        duration_ms: duration_ms.max(0) as u64,
        completed_at: row.try_get("completed_at").map_err(&decode)?,
    })
}

const JOB_COLUMNS: &str = "request_id, snapshot, completed, started_at, deadline_at, \
                           finalized_at, lease_owner, lease_expires_at";

#[async_trait]
impl<P: PoolProvider> Storage for PostgresStorage<P> {
    async fn insert_request(&self, request: &QuoteRequest<Pending>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quote_requests (id, coverage_type, form, user_id, status, created_at)
            VALUES ($1, $2, $3, $4, 'PENDING', $5)
            "#,
        )
        .bind(*request.data.id)
        .bind(&request.data.coverage_type)
        .bind(&request.data.form)
        .bind(&request.data.user_id)
        .bind(request.data.created_at)
        .execute(self.pools.write())
        .await
        .map_err(db_err("Failed to insert request"))?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyQuoteRequest> {
        let row = sqlx::query("SELECT * FROM quote_requests WHERE id = $1")
            .bind(*id)
            .fetch_optional(self.pools.write())
            .await
            .map_err(db_err("Failed to fetch request"))?
            .ok_or(BroadsideError::RequestNotFound(id))?;
        request_from_row(&row)
    }

    #[tracing::instrument(skip(self, request, job), fields(request_id = %request.data.id, total = job.total()))]
    async fn start_job(
        &self,
        request: &QuoteRequest<InProgress>,
        job: &AggregationJob,
    ) -> Result<()> {
        let id = request.data.id;
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(db_err("Failed to begin transaction"))?;

        Self::leave_pending(
            &mut tx,
            id,
            sqlx::query(
                r#"
                UPDATE quote_requests
                SET status = 'IN_PROGRESS', started_at = $2, total_providers = $3, deadline_at = $4
                WHERE id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(*id)
            .bind(request.state.started_at)
            .bind(to_i32(request.state.total_providers))
            .bind(request.state.deadline_at),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO aggregation_jobs
                (request_id, snapshot, total, completed, started_at, deadline_at, lease_owner, lease_expires_at)
            VALUES ($1, $2, $3, 0, $4, $5, $6, $7)
            "#,
        )
        .bind(*id)
        .bind(Json(&job.snapshot))
        .bind(to_i32(job.total()))
        .bind(job.started_at)
        .bind(job.deadline_at)
        .bind(job.lease.map(|l| *l.owner))
        .bind(job.lease.map(|l| l.expires_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert aggregation job"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit job start"))?;
        Ok(())
    }

    async fn complete_without_providers(&self, request: &QuoteRequest<Completed>) -> Result<()> {
        let id = request.data.id;
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(db_err("Failed to begin transaction"))?;

        Self::leave_pending(
            &mut tx,
            id,
            sqlx::query(
                r#"
                UPDATE quote_requests
                SET status = 'COMPLETED', started_at = $2, completed_at = $3, total_providers = 0
                WHERE id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(*id)
            .bind(request.state.started_at)
            .bind(request.state.completed_at),
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO aggregation_jobs (request_id, snapshot, total, completed, started_at, finalized_at)
            VALUES ($1, '[]'::jsonb, 0, 0, $2, $3)
            "#,
        )
        .bind(*id)
        .bind(request.state.started_at)
        .bind(request.state.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert empty aggregation job"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit empty completion"))?;
        Ok(())
    }

    async fn fail_request(&self, request: &QuoteRequest<Failed>) -> Result<()> {
        let id = request.data.id;
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(db_err("Failed to begin transaction"))?;

        Self::leave_pending(
            &mut tx,
            id,
            sqlx::query(
                r#"
                UPDATE quote_requests
                SET status = 'FAILED', failed_at = $2, failure_reason = $3
                WHERE id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(*id)
            .bind(request.state.failed_at)
            .bind(&request.state.reason),
        )
        .await?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit request failure"))?;
        Ok(())
    }

    async fn record_result(&self, result: &ProviderResult) -> Result<Tally> {
        let id = result.request_id;
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(db_err("Failed to begin transaction"))?;

        // Lock the job row: serializes insert-and-increment per request
        let row = sqlx::query(
            "SELECT snapshot, total, completed FROM aggregation_jobs WHERE request_id = $1 FOR UPDATE",
        )
        .bind(*id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("Failed to lock aggregation job"))?
        .ok_or(BroadsideError::JobNotFound(id))?;

        let decode = db_err("Failed to decode job row");
        let snapshot: Json<ProviderSnapshot> = row.try_get("snapshot").map_err(&decode)?;
        let total: i32 = row.try_get("total").map_err(&decode)?;
        let mut completed: i32 = row.try_get("completed").map_err(&decode)?;

        if !snapshot.0.contains(&result.provider_id) {
            return Err(BroadsideError::UnknownProvider(
                id,
                result.provider_id.clone(),
            ));
        }

        let (price, currency): (Option<Decimal>, Option<&str>) = match &result.outcome {
            ProviderOutcome::Success {
                price, currency, ..
            } => (Some(*price), Some(currency.as_str())),
            _ => (None, None),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO provider_results
                (request_id, provider_id, outcome, price, currency, details, duration_ms, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (request_id, provider_id) DO NOTHING
            "#,
        )
        .bind(*id)
        .bind(&*result.provider_id)
        .bind(result.outcome.kind().as_str())
        .bind(price)
        .bind(currency)
        .bind(Json(&result.outcome))
        .bind(i64::try_from(result.duration_ms).unwrap_or(i64::MAX))
        .bind(result.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert provider result"))?
        .rows_affected()
            == 1;

        if inserted {
            completed = sqlx::query_scalar(
                "UPDATE aggregation_jobs SET completed = completed + 1 WHERE request_id = $1 RETURNING completed",
            )
            .bind(*id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("Failed to increment completed counter"))?;
        }

        tx.commit()
            .await
            .map_err(db_err("Failed to commit provider result"))?;

        Ok(Tally {
            completed: completed.max(0) as usize,
            total: total.max(0) as usize,
            inserted,
        })
    }

    async fn finalize_job(
        &self,
        request_id: RequestId,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(db_err("Failed to begin transaction"))?;

        let claimed = sqlx::query(
            r#"
            UPDATE aggregation_jobs
            SET finalized_at = $2
            WHERE request_id = $1 AND finalized_at IS NULL AND completed = total
            "#,
        )
        .bind(*request_id)
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to finalize aggregation job"))?
        .rows_affected();

        if claimed == 0 {
            let row = sqlx::query(
                "SELECT finalized_at IS NOT NULL AS finalized, completed, total FROM aggregation_jobs WHERE request_id = $1",
            )
            .bind(*request_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("Failed to read aggregation job"))?
            .ok_or(BroadsideError::JobNotFound(request_id))?;

            let decode = db_err("Failed to decode job row");
            let finalized: bool = row.try_get("finalized").map_err(&decode)?;
            if finalized {
                return Ok(false);
            }
            let completed: i32 = row.try_get("completed").map_err(&decode)?;
            let total: i32 = row.try_get("total").map_err(&decode)?;
            return Err(BroadsideError::InvalidState(
                request_id,
                format!("{}/{} providers reported", completed, total),
                "all providers reported".to_string(),
            ));
        }

        let updated = sqlx::query(
            r#"
            UPDATE quote_requests
            SET status = 'COMPLETED', completed_at = $2
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(*request_id)
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to complete request"))?
        .rows_affected();
        if updated == 0 {
            // Dropping the transaction rolls back the job update
            return Err(Self::status_mismatch(&mut tx, request_id, RequestStatus::InProgress).await);
        }

        tx.commit()
            .await
            .map_err(db_err("Failed to commit finalization"))?;
        Ok(true)
    }

    async fn get_job(&self, request_id: RequestId) -> Result<AggregationJob> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM aggregation_jobs WHERE request_id = $1",
            JOB_COLUMNS
        ))
        .bind(*request_id)
        .fetch_optional(self.pools.write())
        .await
        .map_err(db_err("Failed to fetch aggregation job"))?
        .ok_or(BroadsideError::JobNotFound(request_id))?;
        job_from_row(&row)
    }

    async fn get_results(&self, request_id: RequestId) -> Result<Vec<ProviderResult>> {
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM quote_requests WHERE id = $1")
            .bind(*request_id)
            .fetch_optional(self.pools.read())
            .await
            .map_err(db_err("Failed to fetch request"))?;
        if exists.is_none() {
            return Err(BroadsideError::RequestNotFound(request_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT request_id, provider_id, details, duration_ms, completed_at
            FROM provider_results
            WHERE request_id = $1
            ORDER BY seq
            "#,
        )
        .bind(*request_id)
        .fetch_all(self.pools.read())
        .await
        .map_err(db_err("Failed to fetch provider results"))?;

        rows.iter().map(result_from_row).collect()
    }

    async fn get_progress(&self, request_id: RequestId) -> Result<Progress> {
        let row = sqlx::query(
            r#"
            SELECT r.status,
                   COALESCE(j.total, 0) AS total,
                   (SELECT COUNT(*) FROM provider_results pr WHERE pr.request_id = r.id) AS completed
            FROM quote_requests r
            LEFT JOIN aggregation_jobs j ON j.request_id = r.id
            WHERE r.id = $1
            "#,
        )
        .bind(*request_id)
        .fetch_optional(self.pools.read())
        .await
        .map_err(db_err("Failed to fetch progress"))?
        .ok_or(BroadsideError::RequestNotFound(request_id))?;

        let decode = db_err("Failed to decode progress row");
        let status: String = row.try_get("status").map_err(&decode)?;
        let total: i32 = row.try_get("total").map_err(&decode)?;
        let completed: i64 = row.try_get("completed").map_err(&decode)?;

        Ok(Progress {
            request_id,
            status: status
                .parse()
                .map_err(|e: String| BroadsideError::Other(anyhow!(e)))?,
            completed: completed.max(0) as usize,
            total: total.max(0) as usize,
        })
    }

    async fn renew_leases(
        &self,
        owner: EngineId,
        request_ids: &[RequestId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize> {
        let ids: Vec<Uuid> = request_ids.iter().map(|id| **id).collect();
        let renewed = sqlx::query(
            r#"
            UPDATE aggregation_jobs
            SET lease_expires_at = $3
            WHERE request_id = ANY($2) AND lease_owner = $1 AND finalized_at IS NULL
            "#,
        )
        .bind(*owner)
        .bind(&ids)
        .bind(expires_at)
        .execute(self.pools.write())
        .await
        .map_err(db_err("Failed to renew leases"))?
        .rows_affected();
        Ok(renewed as usize)
    }

    async fn claim_orphaned_jobs(
        &self,
        owner: EngineId,
        limit: usize,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<AggregationJob>> {
        let rows = sqlx::query(
            r#"
            WITH orphaned AS (
                SELECT request_id
                FROM aggregation_jobs
                WHERE finalized_at IS NULL
                    AND (lease_expires_at IS NULL OR lease_expires_at <= $2)
                ORDER BY started_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE aggregation_jobs j
            SET lease_owner = $1, lease_expires_at = $3
            FROM orphaned o
            WHERE j.request_id = o.request_id
            RETURNING j.request_id, j.snapshot, j.completed, j.started_at, j.deadline_at,
                      j.finalized_at, j.lease_owner, j.lease_expires_at
            "#,
        )
        .bind(*owner)
        .bind(now)
        .bind(lease_expires_at)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pools.write())
        .await
        .map_err(db_err("Failed to claim orphaned jobs"))?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl<P: PoolProvider> ProviderRegistry for PostgresStorage<P> {
    async fn list_enabled_providers(&self) -> Result<Vec<Provider>> {
        let rows = sqlx::query(
            "SELECT id, name, endpoint, enabled FROM providers WHERE enabled ORDER BY position",
        )
        .fetch_all(self.pools.read())
        .await
        .map_err(db_err("Failed to list providers"))?;

        rows.iter()
            .map(|row| {
                let decode = db_err("Failed to decode provider row");
                let id: String = row.try_get("id").map_err(&decode)?;
                let endpoint: Json<EndpointConfig> = row.try_get("endpoint").map_err(&decode)?;
                Ok(Provider {
                    id: ProviderId(id),
                    name: row.try_get("name").map_err(&decode)?,
                    endpoint: endpoint.0,
                    enabled: row.try_get("enabled").map_err(&decode)?,
                })
            })
            .collect()
    }
}
