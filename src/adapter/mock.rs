//! Mock provider adapter for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{ProviderAdapter, ProviderError, ProviderQuote};
use crate::domain::provider::{Provider, ProviderId};
use crate::domain::request::{RequestData, RequestId};
use crate::domain::result::FailureKind;

type MockResult = Result<ProviderQuote, ProviderError>;

/// Mock adapter for testing.
///
/// Responses are configured per provider id and handed out in FIFO order.
/// A response can be immediate, delayed (driven by tokio's clock, so paused-time
/// tests stay deterministic), held until a trigger fires, never complete, or
/// panic.
///
/// # Example
/// ```ignore
/// let mock = MockProviderAdapter::new();
/// mock.add_response("axa", Ok(ProviderQuote::new(dec!(1500), "TRY")));
/// mock.add_delayed_response("allianz", Duration::from_secs(2), Err(ProviderError::network("refused")));
/// mock.add_hanging_response("mapfre");
/// ```
#[derive(Clone, Default)]
pub struct MockProviderAdapter {
    responses: Arc<Mutex<HashMap<ProviderId, VecDeque<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

enum MockResponse {
    /// Immediate response
    Immediate(MockResult),
    /// Response after a fixed delay
    Delayed { response: MockResult, delay: Duration },
    /// Response that waits for a trigger signal before completing
    Triggered {
        response: MockResult,
        trigger: oneshot::Receiver<()>,
    },
    /// Never completes
    Hang,
    /// Panics inside the call
    Panic(String),
}

/// Record of a call made to the mock adapter.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub provider_id: ProviderId,
    pub request_id: RequestId,
    pub timeout: Duration,
    /// Api key the call would authenticate with
    pub api_key: Option<String>,
}

impl MockProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, provider_id: impl Into<ProviderId>, response: MockResponse) {
        self.responses
            .lock()
            .entry(provider_id.into())
            .or_default()
            .push_back(response);
    }

    /// Add a response returned as soon as the provider is called.
    pub fn add_response(&self, provider_id: impl Into<ProviderId>, response: MockResult) {
        self.push(provider_id, MockResponse::Immediate(response));
    }

    /// Add a response returned `delay` after the provider is called.
    pub fn add_delayed_response(
        &self,
        provider_id: impl Into<ProviderId>,
        delay: Duration,
        response: MockResult,
    ) {
        self.push(provider_id, MockResponse::Delayed { response, delay });
    }

    /// Add a response that will wait for a manual trigger before completing.
    ///
    /// Returns a sender that when triggered (by sending `()` or dropping) will
    /// cause the call to complete with the given response.
    pub fn add_response_with_trigger(
        &self,
        provider_id: impl Into<ProviderId>,
        response: MockResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            provider_id,
            MockResponse::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    /// Add a call that never returns; only the engine's timeout ends it.
    pub fn add_hanging_response(&self, provider_id: impl Into<ProviderId>) {
        self.push(provider_id, MockResponse::Hang);
    }

    /// Add a call that panics with `message`.
    pub fn add_panic(&self, provider_id: impl Into<ProviderId>, message: impl Into<String>) {
        self.push(provider_id, MockResponse::Panic(message.into()));
    }

    /// Get all calls that have been made to this mock adapter.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to one provider.
    pub fn calls_for(&self, provider_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| &*c.provider_id == provider_id)
            .count()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Get the number of calls currently in-flight.
    ///
    /// Aborted calls drop out of this count, which makes it useful for
    /// asserting that the engine tore down outstanding work.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    async fn call(
        &self,
        provider: &Provider,
        request: &RequestData,
        timeout: Duration,
    ) -> MockResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // Guard to ensure we decrement even if aborted/panicked
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            provider_id: provider.id.clone(),
            request_id: request.id,
            timeout,
            api_key: provider.endpoint.api_key.clone(),
        });

        let mock_response = self
            .responses
            .lock()
            .get_mut(&provider.id)
            .and_then(|queue| queue.pop_front());

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Delayed { response, delay }) => {
                tokio::time::sleep(delay).await;
                response
            }
            Some(MockResponse::Triggered { response, trigger }) => {
                // Wait for trigger (ignore the result - we proceed either way)
                let _ = trigger.await;
                response
            }
            Some(MockResponse::Hang) => futures::future::pending().await,
            Some(MockResponse::Panic(message)) => panic!("{}", message),
            None => Err(ProviderError::new(
                FailureKind::InvalidResponse,
                format!("No mock response configured for provider {}", provider.id),
            )),
        }
    }
}
