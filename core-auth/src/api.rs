//! Typed REST surface of the remote auth service.
//!
//! Thin request/response layer over the host-provided [`HttpClient`]: it
//! builds endpoint URLs, serializes JSON bodies, and maps every outcome
//! onto the [`AuthError`] taxonomy. The session itself travels in an HTTP
//! cookie owned by the transport; nothing here handles credentials beyond
//! putting them in a request body.

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{AuthError, Result};
use crate::types::{
    AuthResponse, ErrorEnvelope, LoginRequest, OAuthInitResponse, SignupRequest, StatusResponse,
};

/// Per-request timeout for auth endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed client for the six auth endpoints.
///
/// Stateless apart from configuration; safe to share behind an `Arc`.
pub struct AuthApi {
    base_url: Url,
    platform: String,
    http: Arc<dyn HttpClient>,
}

impl AuthApi {
    /// Create an API client rooted at `base_url`.
    ///
    /// `platform` identifies this client to the OAuth init endpoint
    /// (`?platform=<client>`), e.g. `"desktop"`.
    pub fn new(base_url: Url, platform: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        let mut base_url = base_url;
        // Url::join treats a base without a trailing slash as a file path
        // and would drop its last segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            base_url,
            platform: platform.into(),
            http,
        }
    }

    /// `POST auth/login` - exchange a username/password for a session.
    #[instrument(skip(self, password), fields(username = %username))]
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse> {
        let url = self.endpoint("auth/login")?;
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let request = HttpRequest::new(HttpMethod::Post, url)
            .json(&body)
            .map_err(|e| AuthError::EncodingFailed(e.to_string()))?;

        self.send(request).await
    }

    /// `POST auth/signup` - register a new account. Does not authenticate.
    #[instrument(skip(self, password), fields(username = %username))]
    pub async fn signup(&self, username: &str, email: &str, password: &str) -> Result<AuthResponse> {
        let url = self.endpoint("auth/signup")?;
        let body = SignupRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let request = HttpRequest::new(HttpMethod::Post, url)
            .json(&body)
            .map_err(|e| AuthError::EncodingFailed(e.to_string()))?;

        self.send(request).await
    }

    /// `GET auth/status` - the server's authoritative session state.
    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<StatusResponse> {
        let url = self.endpoint("auth/status")?;
        let request = HttpRequest::new(HttpMethod::Get, url);

        self.send(request).await
    }

    /// `GET auth/google/login?platform=<client>` - obtain the provider
    /// authorization URL.
    #[instrument(skip(self))]
    pub async fn oauth_init(&self) -> Result<OAuthInitResponse> {
        let mut url = self.endpoint_url("auth/google/login")?;
        url.query_pairs_mut()
            .append_pair("platform", &self.platform);
        let request = HttpRequest::new(HttpMethod::Get, url.to_string());

        self.send(request).await
    }

    /// `GET auth/google/callback?code=&state=` - exchange an authorization
    /// code and state token for a session.
    #[instrument(skip(self, code, state))]
    pub async fn oauth_callback(&self, code: &str, state: &str) -> Result<AuthResponse> {
        let mut url = self.endpoint_url("auth/google/callback")?;
        url.query_pairs_mut()
            .append_pair("code", code)
            .append_pair("state", state);
        let request = HttpRequest::new(HttpMethod::Get, url.to_string());

        self.send(request).await
    }

    /// `POST auth/logout` - terminate the session on the server.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<AuthResponse> {
        let url = self.endpoint("auth/logout")?;
        let request = HttpRequest::new(HttpMethod::Post, url);

        self.send(request).await
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        self.endpoint_url(path).map(|url| url.to_string())
    }

    fn endpoint_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Execute a request and decode the response, mapping every failure
    /// onto the error taxonomy:
    ///
    /// - transport failure → `RequestFailed` (the one retryable class)
    /// - non-2xx with a decodable envelope → `Backend`
    /// - non-2xx without one → `InvalidResponse`
    /// - 2xx with an unexpected body shape → `DecodingFailed`
    async fn send<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let request = request.timeout(REQUEST_TIMEOUT);

        let response = self
            .http
            .execute(request)
            .await
            .map_err(AuthError::transport)?;

        if !response.is_success() {
            return Err(Self::map_failure(&response));
        }

        response.json().map_err(|e| {
            warn!(status = response.status, "Response body did not match expected shape");
            AuthError::DecodingFailed(e.to_string())
        })
    }

    fn map_failure(response: &HttpResponse) -> AuthError {
        match response.json::<ErrorEnvelope>() {
            Ok(envelope) => {
                debug!(
                    status = response.status,
                    code = envelope.code.as_deref().unwrap_or(""),
                    "Server rejected request"
                );
                AuthError::Backend {
                    code: envelope.code,
                    message: envelope.message,
                    details: envelope.details,
                }
            }
            Err(_) => {
                warn!(
                    status = response.status,
                    "Non-success response without a decodable error envelope"
                );
                AuthError::InvalidResponse {
                    status: response.status,
                }
            }
        }
    }
}
