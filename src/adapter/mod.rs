//! Provider adapter abstraction.
//!
//! This module defines the `ProviderAdapter` trait: "given a normalized request
//! and a deadline, produce a quote or fail". Each insurance provider gets one
//! implementation (or shares the generic [`HttpProviderAdapter`]); tests use
//! [`MockProviderAdapter`].
//!
//! Adapters never see storage and never decide about timeouts on their own:
//! the engine wraps every call in its deadline and converts elapsed calls into
//! `TIMEOUT` results.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::provider::Provider;
use crate::domain::request::RequestData;
use crate::domain::result::{FailureKind, ProviderOutcome};

mod http;
mod mock;

pub use http::HttpProviderAdapter;
pub use mock::{MockCall, MockProviderAdapter};

/// A price offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuote {
    pub price: Decimal,
    pub currency: String,
    /// Provider-specific details (coverage limits, policy terms, ...)
    pub raw_details: serde_json::Value,
}

impl ProviderQuote {
    pub fn new(price: Decimal, currency: impl Into<String>) -> Self {
        Self {
            price,
            currency: currency.into(),
            raw_details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, raw_details: serde_json::Value) -> Self {
        self.raw_details = raw_details;
        self
    }
}

/// Why a provider call produced no quote.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Declined, message)
    }
}

impl From<ProviderQuote> for ProviderOutcome {
    fn from(quote: ProviderQuote) -> Self {
        ProviderOutcome::Success {
            price: quote.price,
            currency: quote.currency,
            raw_details: quote.raw_details,
        }
    }
}

impl From<ProviderError> for ProviderOutcome {
    fn from(error: ProviderError) -> Self {
        ProviderOutcome::Failure {
            kind: error.kind,
            message: error.message,
        }
    }
}

/// Trait for calling one insurance provider.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the fan-out logic testable without making real network calls.
///
/// # Example
/// ```ignore
/// let adapter = HttpProviderAdapter::new();
/// let quote = adapter.call(&provider, &request.data, Duration::from_secs(10)).await?;
/// println!("{} {}", quote.price, quote.currency);
/// ```
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Ask `provider` for a quote on `request`.
    ///
    /// `timeout` is the budget the engine will enforce for this call; adapters
    /// may use it to size their own transport deadlines but must not rely on
    /// being allowed to run past it.
    async fn call(
        &self,
        provider: &Provider,
        request: &RequestData,
        timeout: Duration,
    ) -> Result<ProviderQuote, ProviderError>;
}

#[async_trait]
impl<T: ProviderAdapter + ?Sized> ProviderAdapter for std::sync::Arc<T> {
    async fn call(
        &self,
        provider: &Provider,
        request: &RequestData,
        timeout: Duration,
    ) -> Result<ProviderQuote, ProviderError> {
        (**self).call(provider, request, timeout).await
    }
}
