//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for quote requests:
//! - Request types and states (typestate pattern)
//! - State transition methods
//! - Intake input and validation

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
pub use transitions::RetryConfig;
