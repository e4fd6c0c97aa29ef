//! Delivery of queued actions to the remote API.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use offsync_common::{DeliveryError, Error, HttpMethod, Result};

use crate::queue::QueuedAction;

/// Result of a single delivery attempt.
pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// The request a queued action describes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub payload: Value,
}

impl ActionRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            payload,
        }
    }
}

impl From<&QueuedAction> for ActionRequest {
    fn from(action: &QueuedAction) -> Self {
        Self::new(action.method, action.endpoint.clone(), action.payload.clone())
    }
}

/// Transport used by the sync engine to reach the server.
///
/// Implementations make exactly one attempt per call and classify every
/// failure; retry policy belongs to the sync engine alone.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "http", "scripted").
    fn name(&self) -> &str;

    /// Perform the request.
    ///
    /// # Returns
    /// The decoded response body, or `None` for an empty body.
    ///
    /// # Errors
    /// - `DeliveryError::Transient` for network errors and retryable statuses
    /// - `DeliveryError::Timeout` when the request timed out
    /// - `DeliveryError::Permanent` when the server rejected the request
    async fn send(&self, request: &ActionRequest) -> DeliveryResult<Option<Value>>;
}

/// Classify a non-success HTTP status.
///
/// 408, 429 and 5xx are worth retrying; any other 4xx means the request
/// itself is wrong and will never succeed.
pub fn classify_status(status: u16, body: &str) -> DeliveryError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(body.trim(), 200))
    };

    match status {
        408 | 429 => DeliveryError::Transient(message),
        400..=499 => DeliveryError::Permanent {
            status: Some(status),
            message,
        },
        _ => DeliveryError::Transient(message),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// JSON-over-HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url`.
    ///
    /// Endpoints are resolved relative to the base URL, so `/sales` against
    /// `https://api.example.com/v1` targets `https://api.example.com/v1/sales`.
    ///
    /// # Errors
    /// - Base URL cannot carry a path (e.g. `mailto:`)
    /// - HTTP client construction failed
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid base URL: {}", base_url)));
        }

        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Resolve an endpoint against the base URL.
    pub fn url_for(&self, endpoint: &str) -> DeliveryResult<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| DeliveryError::permanent(format!("Invalid endpoint '{}': {}", endpoint, e)))
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &ActionRequest) -> DeliveryResult<Option<Value>> {
        let url = self.url_for(&request.endpoint)?;
        debug!("{} {}", request.method, url);

        let mut builder = self.client.request(Self::method(request.method), url);
        if !request.payload.is_null() {
            builder = builder.json(&request.payload);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout.as_millis() as u64)
            } else {
                DeliveryError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout.as_millis() as u64)
            } else {
                DeliveryError::Transient(format!("Failed to read response body: {}", e))
            }
        })?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(
            serde_json::from_str(&body).unwrap_or(Value::String(body)),
        ))
    }
}

/// In-memory transport for testing and demos.
///
/// Responses are taken from a per-endpoint script first, then from a global
/// script, then from the fallback (success with no body by default). Every
/// request is recorded.
pub struct ScriptedTransport {
    by_endpoint: Mutex<HashMap<String, VecDeque<DeliveryResult<Option<Value>>>>>,
    script: Mutex<VecDeque<DeliveryResult<Option<Value>>>>,
    fallback: Mutex<DeliveryResult<Option<Value>>>,
    delay: Option<Duration>,
    sent: Mutex<Vec<ActionRequest>>,
}

impl ScriptedTransport {
    /// Create a transport that accepts every request.
    pub fn new() -> Self {
        Self {
            by_endpoint: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(None)),
            delay: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every `send`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response for the next request to any endpoint.
    pub fn push_response(&self, response: DeliveryResult<Option<Value>>) {
        lock(&self.script).push_back(response);
    }

    /// Queue a response for the next request to `endpoint`.
    pub fn respond_to(&self, endpoint: impl Into<String>, response: DeliveryResult<Option<Value>>) {
        lock(&self.by_endpoint)
            .entry(endpoint.into())
            .or_default()
            .push_back(response);
    }

    /// Response used once the scripts run out.
    pub fn set_fallback(&self, response: DeliveryResult<Option<Value>>) {
        *lock(&self.fallback) = response;
    }

    /// Requests received so far, in order.
    pub fn sent(&self) -> Vec<ActionRequest> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &ActionRequest) -> DeliveryResult<Option<Value>> {
        lock(&self.sent).push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.by_endpoint)
            .get_mut(&request.endpoint)
            .and_then(|responses| responses.pop_front());
        if let Some(response) = scripted {
            return response;
        }
        if let Some(response) = lock(&self.script).pop_front() {
            return response;
        }
        lock(&self.fallback).clone()
    }
}
