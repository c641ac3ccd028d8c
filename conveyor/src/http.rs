//! HTTP client abstraction for outbound requests.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request execution,
//! enabling testability with mock implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{ConveyorError, Result};

/// A single outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (e.g., "POST", "GET")
    pub method: String,
    /// Full request URL
    pub url: String,
    /// Header name/value pairs, sent verbatim
    pub headers: Vec<(String, String)>,
    /// Request body; empty means no body is sent
    pub body: String,
}

impl HttpRequest {
    /// Start a request with no headers and no body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append an `Authorization: Bearer` header.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Set a raw body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_string(value)?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(body))
    }
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing HTTP requests.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes delivery logic testable without making real HTTP calls.
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute an HTTP request.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The request fails due to network issues
    /// - The request times out
    /// - The method or URL is invalid
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
///
/// This implementation makes real HTTP requests to external endpoints.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a new reqwest-based HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        let method: reqwest::Method = request.method.parse().map_err(|_| {
            tracing::error!(method = %request.method, "Invalid HTTP method");
            ConveyorError::InvalidEvent(format!("invalid HTTP method '{}'", request.method))
        })?;

        let mut req = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in &request.headers {
            req = req.header(name, value);
        }

        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %request.url, error = %e, "HTTP request failed");
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(
            status = status,
            response_len = body.len(),
            "HTTP request completed"
        );

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock HTTP client for testing.
///
/// Allows configuring predetermined responses for specific requests without
/// making actual HTTP calls.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "POST https://crm.example.com/services/oauth2/token",
///     Ok(HttpResponse {
///         status: 200,
///         body: r#"{"access_token": "tok", "expires_in": 5400}"#.to_string(),
///     }),
/// );
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout_ms: u64,
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a predetermined response for a specific method and URL.
    ///
    /// The key is formatted as "{method} {url}". Multiple responses can be
    /// added for the same key - they will be returned in FIFO order.
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Clear all recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Get the number of calls made to a specific method and URL.
    pub fn call_count_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| format!("{} {}", c.method, c.url) == key)
            .count()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        // Record this call
        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout_ms,
        });

        // Look up the response
        let key = format!("{} {}", request.method, request.url);
        let mut responses = self.responses.lock();

        if let Some(response_queue) = responses.get_mut(&key) {
            if !response_queue.is_empty() {
                return response_queue.remove(0);
            }
        }

        // No response configured - return a default error
        Err(ConveyorError::Internal(format!(
            "No mock response configured for {} {}",
            request.method, request.url
        )))
    }
}
