//! Generic JSON-over-HTTP provider adapter using reqwest.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ProviderAdapter, ProviderError, ProviderQuote};
use crate::domain::provider::Provider;
use crate::domain::request::{RequestData, RequestId};
use crate::domain::result::FailureKind;
use crate::error::error_serialization::serialize_error;

/// Upper bound on how much of an error body is kept in the failure message.
const MAX_ERROR_BODY_LEN: usize = 1024;

/// Production adapter for providers exposing a JSON quote endpoint.
///
/// POSTs `{request_id, coverage_type, form}` to the provider's endpoint URL and
/// expects a body with at least `price` and `currency`. A body of the form
/// `{"declined": true, "reason": "..."}` is treated as an explicit decline.
///
/// The call budget is enforced by the engine's wrapper, not by the client, so
/// a slow provider surfaces as `TIMEOUT` rather than a transport error.
#[derive(Clone, Default)]
pub struct HttpProviderAdapter {
    client: reqwest::Client,
}

impl HttpProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS roots, connection pool limits).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
struct QuotePayload<'a> {
    request_id: RequestId,
    coverage_type: &'a str,
    form: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct QuoteBody {
    #[serde(default)]
    declined: bool,
    #[serde(default)]
    reason: Option<String>,
    price: Option<Decimal>,
    currency: Option<String>,
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    #[tracing::instrument(skip(self, provider, request), fields(request_id = %request.id, provider_id = %provider.id))]
    async fn call(
        &self,
        provider: &Provider,
        request: &RequestData,
        timeout: Duration,
    ) -> Result<ProviderQuote, ProviderError> {
        tracing::debug!(
            url = %provider.endpoint.url,
            timeout_ms = timeout.as_millis() as u64,
            "Requesting quote"
        );

        let mut req = self
            .client
            .post(&provider.endpoint.url)
            .json(&QuotePayload {
                request_id: request.id,
                coverage_type: &request.coverage_type,
                form: &request.form,
            });

        // Only add Authorization header if an api key is configured
        if let Some(api_key) = provider.endpoint.api_key.as_deref()
            && !api_key.is_empty()
        {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, "Quote request failed");
            ProviderError::network(serialize_error(&e.into()))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(serialize_error(&e.into())))?;

        if !status.is_success() {
            tracing::info!(status = status.as_u16(), "Provider returned error status");
            return Err(ProviderError::new(
                FailureKind::HttpStatus {
                    status: status.as_u16(),
                },
                truncate(&body, MAX_ERROR_BODY_LEN),
            ));
        }

        let quote = parse_quote(&body)?;
        tracing::debug!(price = %quote.price, currency = %quote.currency, "Quote received");
        Ok(quote)
    }
}

/// Decode a provider's success body.
fn parse_quote(body: &str) -> Result<ProviderQuote, ProviderError> {
    let invalid = |message: String| ProviderError::new(FailureKind::InvalidResponse, message);

    let raw_details: serde_json::Value =
        serde_json::from_str(body).map_err(|e| invalid(format!("body is not JSON: {}", e)))?;
    let parsed: QuoteBody = serde_json::from_value(raw_details.clone())
        .map_err(|e| invalid(format!("unexpected quote shape: {}", e)))?;

    if parsed.declined {
        return Err(ProviderError::declined(
            parsed.reason.unwrap_or_else(|| "declined by provider".to_string()),
        ));
    }

    match (parsed.price, parsed.currency) {
        (Some(price), Some(currency)) if !currency.trim().is_empty() => Ok(ProviderQuote {
            price,
            currency,
            raw_details,
        }),
        (None, _) => Err(invalid("quote has no price".to_string())),
        _ => Err(invalid("quote has no currency".to_string())),
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::EndpointConfig;
    use crate::domain::request::RequestInput;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn request() -> RequestData {
        RequestInput {
            coverage_type: "traffic".to_string(),
            form: json!({"plate": "34ABC123"}),
            user_id: None,
        }
        .into_pending()
        .unwrap()
        .data
    }

    fn provider_at(addr: std::net::SocketAddr, api_key: Option<&str>) -> Provider {
        let mut endpoint = EndpointConfig::new(format!("http://{addr}/quote"));
        endpoint.api_key = api_key.map(str::to_string);
        Provider::new("axa", "AXA", endpoint)
    }

    /// Read one HTTP/1.1 request (headers plus Content-Length body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending a full request");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + content_length {
                    return String::from_utf8(buf).unwrap();
                }
            }
        }
    }

    /// Serve a single canned response and hand back the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (
        std::net::SocketAddr,
        tokio::task::JoinHandle<String>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut stream).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            raw
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_call_posts_payload_with_bearer_token() {
        let (addr, server) =
            serve_once("200 OK", r#"{"price": "1250.00", "currency": "TRY", "plan": "gold"}"#).await;
        let request = request();

        let quote = HttpProviderAdapter::new()
            .call(&provider_at(addr, Some("secret-key")), &request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(quote.price, dec!(1250.00));
        assert_eq!(quote.currency, "TRY");
        assert_eq!(quote.raw_details["plan"], "gold");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /quote "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer secret-key"));
        let body: serde_json::Value = serde_json::from_str(raw.split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body["request_id"], json!(request.id));
        assert_eq!(body["coverage_type"], "traffic");
        assert_eq!(body["form"]["plate"], "34ABC123");
    }

    #[tokio::test]
    async fn test_call_without_api_key_sends_no_authorization() {
        let (addr, server) = serve_once("200 OK", r#"{"price": 10, "currency": "EUR"}"#).await;

        HttpProviderAdapter::new()
            .call(&provider_at(addr, None), &request(), Duration::from_secs(5))
            .await
            .unwrap();

        let raw = server.await.unwrap();
        assert!(!raw.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_error_status_maps_to_http_status() {
        let (addr, server) = serve_once("503 Service Unavailable", r#"{"error": "maintenance"}"#).await;

        let err = HttpProviderAdapter::new()
            .call(&provider_at(addr, None), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::HttpStatus { status: 503 });
        assert!(err.message.contains("maintenance"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpProviderAdapter::new()
            .call(&provider_at(addr, None), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Network);
    }

    #[tokio::test]
    async fn test_slow_provider_is_left_to_the_caller_deadline() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            std::future::pending::<()>().await;
        });

        // The budget handed to the adapter is shorter than the caller's
        // wrapper. The adapter must not turn it into its own error first.
        let outcome = tokio::time::timeout(
            Duration::from_millis(300),
            HttpProviderAdapter::new().call(
                &provider_at(addr, None),
                &request(),
                Duration::from_millis(20),
            ),
        )
        .await;

        assert!(outcome.is_err(), "adapter returned early: {:?}", outcome);
        server.abort();
    }

    #[test]
    fn test_parse_quote_keeps_full_body_as_details() {
        let quote =
            parse_quote(r#"{"price": "1500.00", "currency": "TRY", "deductible": 250}"#).unwrap();
        assert_eq!(quote.price, dec!(1500.00));
        assert_eq!(quote.currency, "TRY");
        assert_eq!(quote.raw_details["deductible"], 250);
    }

    #[test]
    fn test_parse_quote_accepts_numeric_price() {
        let quote = parse_quote(r#"{"price": 980.5, "currency": "EUR"}"#).unwrap();
        assert_eq!(quote.price, dec!(980.5));
    }

    #[test]
    fn test_parse_quote_rejects_missing_fields() {
        let err = parse_quote(r#"{"currency": "TRY"}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
        assert!(err.message.contains("no price"));

        let err = parse_quote(r#"{"price": 10, "currency": " "}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);

        let err = parse_quote("<html>oops</html>").unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
    }

    #[test]
    fn test_parse_quote_recognizes_decline() {
        let err = parse_quote(r#"{"declined": true, "reason": "vehicle too old"}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::Declined);
        assert_eq!(err.message, "vehicle too old");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("çççç", 3), "ç...");
    }
}
