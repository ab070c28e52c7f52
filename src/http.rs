//! HTTP client abstraction for outbound deliveries.
//!
//! This module defines the `HttpClient` trait to abstract the delivery POST,
//! enabling testability with mock implementations.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::delivery::signature::SIGNATURE_HEADER;
use crate::error::Result;
use crate::request::RequestId;

/// Default `User-Agent` sent with every delivery.
pub const DEFAULT_USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

/// One outbound delivery call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Request the delivery belongs to (for logging).
    pub request_id: RequestId,
    pub url: String,
    /// Exact bytes to transmit. The signature is computed over these.
    pub body: Bytes,
    /// Hex HMAC-SHA256 of `body`, if the target has a secret.
    pub signature: Option<String>,
    /// Most response-body bytes worth reading; the rest is discarded unread.
    pub response_limit: usize,
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string, possibly cut at the request's `response_limit`
    pub body: String,
    /// Set when the status arrived but reading the body failed.
    pub body_error: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            body_error: None,
        }
    }

    pub fn with_body_error(mut self, error: impl Into<String>) -> Self {
        self.body_error = Some(error.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing outbound deliveries.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the delivery engine testable without making real HTTP calls.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new();
/// let response = client.execute(&outbound, 30_000).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `request.body` to `request.url` as JSON.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The request fails due to network issues
    /// - The request times out
    /// - The URL is invalid
    ///
    /// Any status code, including 4xx and 5xx, is an `Ok` response. Once the
    /// status is received the call is `Ok` even if the body cannot be read.
    async fn execute(&self, request: &OutboundRequest, timeout_ms: u64) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    user_agent: String,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id, url = %request.url))]
    async fn execute(&self, request: &OutboundRequest, timeout_ms: u64) -> Result<HttpResponse> {
        tracing::debug!(
            timeout_ms = timeout_ms,
            body_len = request.body.len(),
            signed = request.signature.is_some(),
            "Sending delivery"
        );

        let mut req = self
            .client
            .post(&request.url)
            .timeout(Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .body(request.body.clone());

        if let Some(signature) = &request.signature {
            req = req.header(SIGNATURE_HEADER, signature);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(
                error = %e,
                timeout = e.is_timeout(),
                connect = e.is_connect(),
                "Delivery request failed"
            );
            e
        })?;

        let status = response.status().as_u16();
        let (body, body_error) = read_capped(response, request.response_limit).await;
        if let Some(error) = &body_error {
            tracing::warn!(status, error = %error, "Failed to read delivery response body");
        }

        tracing::debug!(
            status = status,
            response_len = body.len(),
            "Delivery request completed"
        );

        Ok(HttpResponse {
            status,
            body,
            body_error,
        })
    }
}

/// Read at most `limit` body bytes. A read failure keeps what arrived so far.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> (String, Option<String>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut error = None;
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                error = Some(e.to_string());
                break;
            }
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), error)
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Mock HTTP client for testing.
///
/// Responses are queued per URL and returned in FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response("https://hooks.example.com/done", Ok(HttpResponse::new(500, "busy")));
/// mock.add_response("https://hooks.example.com/done", Ok(HttpResponse::new(200, "ok")));
/// ```
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    Immediate(Result<HttpResponse>),
    Triggered {
        response: Result<HttpResponse>,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub request_id: RequestId,
    pub url: String,
    pub body: Bytes,
    pub signature: Option<String>,
    pub timeout_ms: u64,
    /// When the call was made, on the tokio clock.
    pub at: tokio::time::Instant,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a response for `url`.
    pub fn add_response(&self, url: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(MockResponse::Immediate(response));
    }

    /// Queue the same status `times` times.
    pub fn add_statuses(&self, url: &str, status: u16, times: usize) {
        for _ in 0..times {
            self.add_response(url, Ok(HttpResponse::new(status, format!("status {}", status))));
        }
    }

    /// Queue a response that waits for a manual trigger before completing.
    ///
    /// The call completes when the returned sender fires or is dropped.
    pub fn add_response_with_trigger(
        &self,
        url: &str,
        response: Result<HttpResponse>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(MockResponse::Triggered {
                response,
                trigger: rx,
            });
        tx
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls currently waiting on a response.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &OutboundRequest, timeout_ms: u64) -> Result<HttpResponse> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            request_id: request.request_id,
            url: request.url.clone(),
            body: request.body.clone(),
            signature: request.signature.clone(),
            timeout_ms,
            at: tokio::time::Instant::now(),
        });

        let mock_response = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&request.url)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match mock_response {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                // Proceed whether the trigger fired or was dropped.
                let _ = trigger.await;
                response
            }
            None => Err(crate::error::VolleyError::Other(anyhow::anyhow!(
                "No mock response configured for {}",
                request.url
            ))),
        }
    }
}
