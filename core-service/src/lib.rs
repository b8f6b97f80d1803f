//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP transport,
//! cookie jar, credential vault) into the shared Rust core. Desktop apps
//! typically enable the `desktop-shims` feature (which depends on
//! `bridge-desktop`); other hosts inject their own adapters.

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{
    http::HttpClient,
    session::{CookieSession, CredentialVault},
};
use core_auth::{AuthApi, AuthStateMachine, RetryPolicy};
use core_runtime::events::EventBus;
use tracing::info;
use url::Url;

/// Default API base URL, overridable via `LANGO_API_BASE_URL`.
const DEFAULT_BASE_URL: &str = "https://api.lango.app/v1/";

/// Client platform tag sent to the OAuth init endpoint, overridable via
/// `LANGO_CLIENT_PLATFORM`.
const DEFAULT_PLATFORM: &str = "desktop";

/// Configuration for the client core.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the remote service's REST API.
    pub base_url: Url,
    /// Platform tag identifying this client to the OAuth init endpoint.
    pub platform: String,
    /// Total attempts for retry-eligible network calls.
    pub max_retries: u32,
    /// Base backoff delay; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
    /// Event bus buffer size.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            platform: DEFAULT_PLATFORM.to_string(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            event_buffer: core_runtime::events::DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("LANGO_API_BASE_URL") {
            config.base_url = Url::parse(&base_url).map_err(|e| {
                CoreError::InitializationFailed(format!("LANGO_API_BASE_URL is invalid: {}", e))
            })?;
        }
        if let Ok(platform) = std::env::var("LANGO_CLIENT_PLATFORM") {
            config.platform = platform;
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }
}

/// Aggregated handle to all bridge dependencies the core requires.
pub struct CoreDependencies {
    pub http_client: Arc<dyn HttpClient>,
    /// Optional: session cookie jar, cleared on confirmed logout.
    pub cookie_session: Option<Arc<dyn CookieSession>>,
    /// Optional: credential vault, cleared on confirmed logout.
    pub vault: Option<Arc<dyn CredentialVault>>,
}

impl CoreDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            http_client,
            cookie_session: None,
            vault: None,
        }
    }

    pub fn with_cookie_session(mut self, cookie_session: Arc<dyn CookieSession>) -> Self {
        self.cookie_session = Some(cookie_session);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct AuthService {
    machine: Arc<AuthStateMachine>,
    event_bus: EventBus,
}

impl AuthService {
    /// Wire the auth state machine from configuration and bridges.
    pub fn new(config: ClientConfig, deps: CoreDependencies) -> Self {
        let event_bus = EventBus::new(config.event_buffer);
        let api = AuthApi::new(config.base_url.clone(), config.platform.clone(), deps.http_client);

        let mut machine = AuthStateMachine::new(api, event_bus.clone())
            .with_retry_policy(RetryPolicy::new(config.max_retries, config.base_delay));
        if let Some(cookie_session) = deps.cookie_session {
            machine = machine.with_cookie_session(cookie_session);
        }
        if let Some(vault) = deps.vault {
            machine = machine.with_vault(vault);
        }

        info!(base_url = %config.base_url, platform = %config.platform, "Auth service initialized");

        Self {
            machine: Arc::new(machine),
            event_bus,
        }
    }

    /// Wire the service with the default desktop bridges.
    #[cfg(feature = "desktop-shims")]
    pub fn desktop(config: ClientConfig) -> Self {
        let http_client = Arc::new(bridge_desktop::ReqwestHttpClient::new());
        let cookie_session: Arc<dyn CookieSession> = Arc::clone(&http_client) as _;
        let vault = Arc::new(bridge_desktop::KeyringVault::new());

        let deps = CoreDependencies::new(http_client)
            .with_cookie_session(cookie_session)
            .with_vault(vault);

        Self::new(config, deps)
    }

    /// The authentication state machine.
    pub fn machine(&self) -> Arc<AuthStateMachine> {
        Arc::clone(&self.machine)
    }

    /// The event bus carrying auth and session events.
    pub fn event_bus(&self) -> EventBus {
        self.event_bus.clone()
    }
}
