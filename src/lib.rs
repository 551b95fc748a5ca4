//! Quote aggregation engine for insurance price comparison.
//!
//! This crate takes one customer quote request, fans it out concurrently to
//! every enabled insurance provider, records exactly one result per provider
//! (a price, a typed failure, or a timeout), and finalizes the request exactly
//! once when every provider has reported. Clients poll for incremental
//! progress and partial results while the fan-out runs.
//!
//! Aggregation jobs are durable and leased, so a request whose engine dies
//! mid-flight is resumed by another engine instead of hanging in progress.

pub mod adapter;
pub mod domain;
pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;

// Re-export commonly used types
pub use adapter::{
    HttpProviderAdapter, MockProviderAdapter, ProviderAdapter, ProviderError, ProviderQuote,
};
pub use domain::job::{AggregationJob, EngineId, JobLease};
pub use domain::progress::Progress;
pub use domain::provider::{EndpointConfig, Provider, ProviderId, ProviderSnapshot};
pub use domain::request::{AnyQuoteRequest, RequestId, RequestInput, RequestStatus};
pub use domain::result::{FailureKind, OutcomeKind, ProviderOutcome, ProviderResult, Tally};
pub use engine::{EngineConfig, Orchestrator, ProgressReporter};
pub use error::{BroadsideError, Result};
pub use manager::{InMemoryStorage, Storage};
pub use registry::{InMemoryProviderRegistry, ProviderRegistry};

#[cfg(feature = "postgres")]
pub use manager::postgres::{PoolProvider, PostgresStorage, TestDbPools};

/// Get the broadside database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
