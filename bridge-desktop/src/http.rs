//! HTTP Client Implementation using Reqwest
//!
//! Connection pooling, TLS, per-request timeouts, and the session cookie
//! jar. The jar is owned here and clearable in place, so a confirmed
//! logout can drop the session cookie without rebuilding the client.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse},
    session::CookieSession,
};
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Cookie store that can be emptied while the client keeps using it.
///
/// `reqwest`'s own `Jar` has no clear operation; this wrapper swaps the
/// inner jar for a fresh one under a write lock instead.
#[derive(Default)]
pub struct SessionJar {
    inner: RwLock<reqwest::cookie::Jar>,
}

impl SessionJar {
    /// Drop every cookie held by the jar.
    pub fn clear(&self) {
        let mut jar = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *jar = reqwest::cookie::Jar::default();
    }
}

impl CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        let jar = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        jar.set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &url::Url) -> Option<HeaderValue> {
        let jar = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        jar.cookies(url)
    }
}

/// Reqwest-based HTTP client implementation
///
/// Provides HTTP operations with:
/// - Connection pooling via reqwest
/// - TLS support by default
/// - A clearable session cookie jar
///
/// Transport errors are mapped so the core's retry policy can tell
/// timeouts and connection failures apart from everything else. The
/// transport itself never retries; selective retry is the caller's
/// decision.
pub struct ReqwestHttpClient {
    client: Client,
    jar: Arc<SessionJar>,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new HTTP client with custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        let jar = Arc::new(SessionJar::default());
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent("lango-core/0.1.0")
            .cookie_provider(Arc::clone(&jar))
            .build()
            .expect("Failed to build HTTP client");

        Self { client, jar }
    }

    /// Convert bridge HttpMethod to reqwest Method
    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    /// Build reqwest request from bridge request
    fn build_request(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = Self::convert_method(request.method);
        let mut req = self.client.request(method, &request.url);

        for (key, value) in request.headers {
            req = req.header(key, value);
        }

        if let Some(body) = request.body {
            req = req.body(body);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(url = %request.url, "Executing HTTP request");

        let req_builder = self.build_request(request);

        match req_builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                    .collect();

                let body = response
                    .bytes()
                    .await
                    .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;

                Ok(HttpResponse {
                    status,
                    headers,
                    body,
                })
            }
            Err(e) => {
                warn!(error = %e, "HTTP request failed");

                if e.is_timeout() {
                    Err(BridgeError::Timeout(e.to_string()))
                } else if e.is_connect() {
                    Err(BridgeError::Connection(e.to_string()))
                } else {
                    Err(BridgeError::OperationFailed(e.to_string()))
                }
            }
        }
    }
}

impl CookieSession for ReqwestHttpClient {
    fn clear_session(&self) {
        self.jar.clear();
        debug!("Session cookie jar cleared");
    }
}
