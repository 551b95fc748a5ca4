//! Core domain types for the quote aggregation engine.
//!
//! This module contains pure domain types with no transport dependencies:
//! - Providers and the per-request provider snapshot
//! - Request typestate machine
//! - Aggregation jobs and their leases
//! - Per-provider results and progress

pub mod job;
pub mod progress;
pub mod provider;
pub mod request;
pub mod result;
