//! Read/write pool routing for [`PostgresStorage`](super::PostgresStorage).
//!
//! Progress polling is by far the most frequent query the engine serves, so it
//! can be pointed at a replica. Transitions, result recording, lease work and
//! anything that must observe its own writes always go to the primary.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Provides the pools a [`PostgresStorage`](super::PostgresStorage) talks to.
///
/// A plain [`PgPool`] implements this by serving both roles.
///
/// # Example
///
/// ```ignore
/// use broadside::PoolProvider;
/// use sqlx::PgPool;
///
/// #[derive(Clone)]
/// struct ReplicatedPools {
///     primary: PgPool,
///     replica: Option<PgPool>,
/// }
///
/// impl PoolProvider for ReplicatedPools {
///     fn read(&self) -> &PgPool {
///         self.replica.as_ref().unwrap_or(&self.primary)
///     }
///
///     fn write(&self) -> &PgPool {
///         &self.primary
///     }
/// }
/// ```
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for progress and result reads that tolerate replica lag.
    fn read(&self) -> &PgPool;

    /// Primary pool: writes, transactions, `FOR UPDATE` reads.
    fn write(&self) -> &PgPool;
}

/// Pools for tests whose read side refuses writes.
///
/// Both pools point at the same database, but every connection in the read
/// pool runs with `default_transaction_read_only = on`. A write routed through
/// `read()` by mistake fails the test instead of passing silently.
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    replica: PgPool,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let replica = PgPoolOptions::new()
            .max_connections(pool.options().get_max_connections())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(pool.connect_options().as_ref().clone())
            .await?;

        Ok(Self {
            primary: pool,
            replica,
        })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.replica
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}
