//! # Authentication State Machine
//!
//! Orchestrates login, signup, logout, OAuth initiation, OAuth callback
//! handling, and the startup bootstrap against the remote auth service.
//!
//! ## Overview
//!
//! The machine owns the client's belief about the session ([`AuthSession`])
//! behind a single write lock, so two network completions racing on the
//! authenticated flag can never interleave inconsistently. The one piece of
//! state that is touched *before* completions serialize on that lock - the
//! processed-authorization-code set - carries its own mutex inside
//! [`CodeDeduplicationStore`].
//!
//! Every commit that follows a suspension point re-validates the session
//! under the write lock first: an authorization URL obtained while another
//! path authenticated the session is discarded, and a duplicate callback
//! arriving after authentication is dropped without a network call.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AuthApi, AuthStateMachine};
//! use core_runtime::events::EventBus;
//! use std::sync::Arc;
//! # use bridge_traits::http::HttpClient;
//! # async fn example(http_client: Arc<dyn HttpClient>) -> core_auth::Result<()> {
//! let api = AuthApi::new(
//!     url::Url::parse("https://api.lango.app/v1/").unwrap(),
//!     "desktop",
//!     http_client,
//! );
//! let machine = AuthStateMachine::new(api, EventBus::new(100));
//!
//! machine.bootstrap().await?;
//! let user = machine.login("alice", "secret").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use bridge_traits::session::{CookieSession, CredentialVault};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, SessionEvent};

use crate::api::AuthApi;
use crate::bootstrap::SessionBootstrapper;
use crate::dedup::CodeDeduplicationStore;
use crate::error::{AuthError, Result};
use crate::retry::RetryPolicy;
use crate::types::{AuthPhase, AuthResponse, AuthSession, User};

/// Authentication orchestrator.
///
/// All session mutations happen behind the internal write lock; callers
/// observe state through cloned [`session`](Self::session) snapshots and
/// the event bus. Constructed explicitly with its collaborators so tests
/// can substitute a scripted transport.
pub struct AuthStateMachine {
    api: Arc<AuthApi>,
    retry: RetryPolicy,
    dedup: CodeDeduplicationStore,
    bootstrapper: SessionBootstrapper,
    session: RwLock<AuthSession>,
    event_bus: EventBus,
    cookie_session: Option<Arc<dyn CookieSession>>,
    vault: Option<Arc<dyn CredentialVault>>,
    /// Replaced wholesale by `cancel_all`; operations clone the token they
    /// started under, so a cancel only reaches work already in flight.
    cancel: StdMutex<CancellationToken>,
}

impl AuthStateMachine {
    /// Creates a new state machine over the given API client.
    ///
    /// The session starts unauthenticated. Collaborators for cookie and
    /// vault clearing are optional and attached with the `with_*` builders.
    pub fn new(api: AuthApi, event_bus: EventBus) -> Self {
        let api = Arc::new(api);
        let retry = RetryPolicy::default();

        Self {
            bootstrapper: SessionBootstrapper::new(Arc::clone(&api), retry.clone()),
            api,
            retry,
            dedup: CodeDeduplicationStore::new(),
            session: RwLock::new(AuthSession::default()),
            event_bus,
            cookie_session: None,
            vault: None,
            cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    /// Replace the retry policy used for retry-eligible network calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.bootstrapper = SessionBootstrapper::new(Arc::clone(&self.api), retry.clone());
        self.retry = retry;
        self
    }

    /// Attach the session cookie jar, cleared on confirmed logout.
    pub fn with_cookie_session(mut self, cookie_session: Arc<dyn CookieSession>) -> Self {
        self.cookie_session = Some(cookie_session);
        self
    }

    /// Attach the credential vault, cleared on confirmed logout.
    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// A snapshot of the current session state.
    pub async fn session(&self) -> AuthSession {
        self.session.read().await.clone()
    }

    /// Exchange a username/password for an authenticated session.
    ///
    /// Retried on transient transport failures. On success the user is
    /// stored and the session becomes authenticated; on rejection or
    /// exhausted retries the error is surfaced and the session stays
    /// unauthenticated.
    #[instrument(skip(self, password), fields(username = %username))]
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        {
            let mut session = self.session.write().await;
            session.leave_failed();
            session.phase = AuthPhase::Authenticating;
            session.last_error = None;
        }
        self.emit(CoreEvent::Auth(AuthEvent::SigningIn {
            username: username.to_string(),
        }));

        let api = Arc::clone(&self.api);
        let username_owned = username.to_string();
        let password_owned = password.to_string();
        let outcome = self
            .guarded(self.retry.run(move || {
                let api = Arc::clone(&api);
                let username = username_owned.clone();
                let password = password_owned.clone();
                async move { api.login(&username, &password).await }
            }))
            .await;

        match outcome {
            Ok(AuthResponse {
                success: true,
                user: Some(user),
                ..
            }) => {
                {
                    let mut session = self.session.write().await;
                    session.phase = AuthPhase::Authenticated;
                    session.current_user = Some(user.clone());
                    session.pending_oauth_url = None;
                    session.last_error = None;
                }
                info!("Login succeeded");
                self.emit(CoreEvent::Auth(AuthEvent::SignedIn {
                    username: user.username.clone(),
                }));
                Ok(user)
            }
            Ok(AuthResponse {
                success: true,
                user: None,
                ..
            }) => Err(self
                .fail(AuthError::DecodingFailed(
                    "login response missing user".to_string(),
                ))
                .await),
            Ok(response) => {
                let error = AuthError::Backend {
                    code: None,
                    message: response
                        .message
                        .unwrap_or_else(|| "login rejected".to_string()),
                    details: None,
                };
                Err(self.fail(error).await)
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(error) => Err(self.fail(error).await),
        }
    }

    /// Register a new account.
    ///
    /// Fire-and-forget: registration never authenticates the session; the
    /// caller is expected to log in afterwards. Not retried - a replayed
    /// signup is a side-effecting duplicate.
    #[instrument(skip(self, password), fields(username = %username, email = %email))]
    pub async fn signup(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let api = Arc::clone(&self.api);
        let username_owned = username.to_string();
        let email_owned = email.to_string();
        let password_owned = password.to_string();
        let outcome = self
            .guarded(async move {
                api.signup(&username_owned, &email_owned, &password_owned)
                    .await
            })
            .await;

        match outcome {
            Ok(response) if response.success => {
                info!("Signup completed");
                self.emit(CoreEvent::Auth(AuthEvent::SignupCompleted {
                    username: username.to_string(),
                }));
                Ok(())
            }
            Ok(response) => {
                let error = AuthError::Backend {
                    code: None,
                    message: response
                        .message
                        .unwrap_or_else(|| "signup rejected".to_string()),
                    details: None,
                };
                self.surface(&error).await;
                Err(error)
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(error) => {
                self.surface(&error).await;
                Err(error)
            }
        }
    }

    /// Terminate the session on the server, then clear local state.
    ///
    /// Valid from any state. Local state - session, cookie jar, credential
    /// vault - is cleared only on confirmed success; on failure the session
    /// stays authenticated and the error is surfaced, so client and server
    /// never silently diverge.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let api = Arc::clone(&self.api);
        let outcome = self
            .guarded(self.retry.run(move || {
                let api = Arc::clone(&api);
                async move { api.logout().await }
            }))
            .await;

        match outcome {
            Ok(response) if response.success => {
                {
                    let mut session = self.session.write().await;
                    session.phase = AuthPhase::Unauthenticated;
                    session.current_user = None;
                    session.pending_oauth_url = None;
                    session.last_error = None;
                }
                if let Some(cookie_session) = &self.cookie_session {
                    cookie_session.clear_session();
                }
                if let Some(vault) = &self.vault {
                    if let Err(error) = vault.clear().await {
                        warn!(%error, "Failed to clear credential vault after logout");
                    }
                }
                info!("Logout confirmed; local session cleared");
                self.emit(CoreEvent::Auth(AuthEvent::SignedOut));
                self.emit(CoreEvent::Session(SessionEvent::Ended));
                Ok(())
            }
            Ok(response) => {
                let error = AuthError::Backend {
                    code: None,
                    message: response
                        .message
                        .unwrap_or_else(|| "logout rejected".to_string()),
                    details: None,
                };
                self.surface(&error).await;
                Err(error)
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(error) => {
                self.surface(&error).await;
                Err(error)
            }
        }
    }

    /// Request an authorization URL and enter the OAuth flow.
    ///
    /// Returns `Ok(None)` without a network call if the session is already
    /// authenticated - re-triggering a provider consent screen for a
    /// logged-in user is never useful. The URL is committed only after a
    /// re-check under the write lock, since another path may have
    /// authenticated while the request was in flight.
    #[instrument(skip(self))]
    pub async fn initiate_oauth_login(&self) -> Result<Option<Url>> {
        {
            let mut session = self.session.write().await;
            if session.is_authenticated() {
                debug!("OAuth initiation skipped: already authenticated");
                return Ok(None);
            }
            session.leave_failed();
        }

        let api = Arc::clone(&self.api);
        let init = match self
            .guarded(self.retry.run(move || {
                let api = Arc::clone(&api);
                async move { api.oauth_init().await }
            }))
            .await
        {
            Ok(init) => init,
            Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
            Err(error) => {
                self.surface(&error).await;
                return Err(error);
            }
        };

        let auth_url = match Url::parse(&init.auth_url) {
            Ok(url) if url.has_host() => url,
            _ => {
                let error = AuthError::InvalidUrl(init.auth_url);
                self.surface(&error).await;
                return Err(error);
            }
        };

        {
            let mut session = self.session.write().await;
            if session.is_authenticated() {
                debug!("Discarding authorization URL: session authenticated during request");
                return Ok(None);
            }
            session.pending_oauth_url = Some(auth_url.clone());
            session.phase = AuthPhase::AwaitingOAuthRedirect;
        }

        info!("OAuth flow initiated, awaiting provider redirect");
        self.emit(CoreEvent::Auth(AuthEvent::OAuthFlowStarted {
            auth_url: auth_url.to_string(),
        }));
        Ok(Some(auth_url))
    }

    /// Handle the provider redirect carrying an authorization code.
    ///
    /// The idempotency-critical path: the external redirect can be
    /// delivered more than once, and a given code must trigger at most one
    /// exchange. Duplicates - a code already processed, or any delivery
    /// while an exchange is in flight - are dropped silently; they are
    /// expected re-delivery, not failures.
    #[instrument(skip(self, code, state))]
    pub async fn handle_oauth_callback(&self, code: &str, state: &str) -> Result<()> {
        // A late or duplicate redirect must never disturb a live session.
        {
            let mut session = self.session.write().await;
            if session.is_authenticated() {
                session.pending_oauth_url = None;
                debug!("OAuth callback ignored: session already authenticated");
                return Ok(());
            }
        }

        if !self.dedup.try_begin_processing(code) {
            debug!("OAuth callback dropped as duplicate");
            return Ok(());
        }

        {
            let mut session = self.session.write().await;
            session.leave_failed();
            session.phase = AuthPhase::ProcessingOAuthCallback;
        }

        // Single attempt: the code is one-time-use, and a retry after an
        // ambiguous transport failure could double-spend it. A failed
        // exchange re-permits a fresh delivery of the same code instead.
        let api = Arc::clone(&self.api);
        let code_owned = code.to_string();
        let state_owned = state.to_string();
        let outcome = self
            .guarded(async move { api.oauth_callback(&code_owned, &state_owned).await })
            .await;

        match outcome {
            Ok(AuthResponse {
                success: true,
                user,
                ..
            }) => {
                let username = user.as_ref().map(|u| u.username.clone());
                {
                    let mut session = self.session.write().await;
                    session.phase = AuthPhase::Authenticated;
                    session.current_user = user;
                    session.pending_oauth_url = None;
                    session.last_error = None;
                }
                self.dedup.end_processing(code, true);
                info!("OAuth exchange succeeded");
                if let Some(username) = username {
                    self.emit(CoreEvent::Auth(AuthEvent::SignedIn { username }));
                }
                self.confirm_session().await;
                Ok(())
            }
            Ok(response) => {
                let error = AuthError::Backend {
                    code: None,
                    message: response
                        .message
                        .unwrap_or_else(|| "authorization code exchange rejected".to_string()),
                    details: None,
                };
                self.dedup.end_processing(code, false);
                Err(self.fail_oauth(error).await)
            }
            Err(AuthError::Cancelled) => {
                // Abandoned, not unwound: release the in-flight claim so a
                // fresh delivery may retry; the session is left untouched.
                self.dedup.end_processing(code, false);
                Err(AuthError::Cancelled)
            }
            Err(error) => {
                self.dedup.end_processing(code, false);
                Err(self.fail_oauth(error).await)
            }
        }
    }

    /// Reconcile local state with the server's session status at startup.
    ///
    /// If an interactive flow already authenticated the session, the
    /// result only ever refreshes the user - a slow background check never
    /// downgrades a fast foreground login. Failures are surfaced only if
    /// the machine is still unauthenticated when they arrive.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<()> {
        info!("Bootstrapping session state");

        match self.guarded(self.bootstrapper.probe()).await {
            Ok(status) => {
                let signed_in = {
                    let mut session = self.session.write().await;
                    if session.is_authenticated() {
                        if status.authenticated {
                            if let Some(user) = status.user {
                                session.current_user = Some(user);
                            }
                        } else {
                            debug!("Stale bootstrap result ignored: session already authenticated");
                        }
                        None
                    } else if status.authenticated {
                        session.phase = AuthPhase::Authenticated;
                        session.current_user = status.user.clone();
                        session.pending_oauth_url = None;
                        session.last_error = None;
                        status.user.map(|user| user.username)
                    } else {
                        session.phase = AuthPhase::Unauthenticated;
                        session.current_user = None;
                        None
                    }
                };
                if let Some(username) = signed_in {
                    self.emit(CoreEvent::Auth(AuthEvent::SignedIn { username }));
                }
                Ok(())
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(error) => {
                if self.session.read().await.is_authenticated() {
                    debug!(%error, "Bootstrap failure ignored: session already authenticated");
                    Ok(())
                } else {
                    self.surface(&error).await;
                    Err(error)
                }
            }
        }
    }

    /// Abandon every in-flight network operation and its pending retries.
    ///
    /// Session state is not mutated: abandoned futures are dropped at their
    /// next suspension point, so their completions can never be applied.
    /// Operations started after this call proceed normally.
    pub fn cancel_all(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        debug!("Cancelled all in-flight auth operations");
    }

    /// Confirmation round-trip after a successful code exchange.
    ///
    /// The exchange response and the session-cookie propagation are not
    /// atomic at the transport layer; asking the server once more closes
    /// that race. The server's answer is authoritative here, and the
    /// pending URL is defensively re-cleared. A failed confirmation is
    /// non-fatal - the exchange itself already succeeded.
    async fn confirm_session(&self) {
        let api = Arc::clone(&self.api);
        let outcome = self
            .guarded(self.retry.run(move || {
                let api = Arc::clone(&api);
                async move { api.status().await }
            }))
            .await;

        match outcome {
            Ok(status) => {
                let mut session = self.session.write().await;
                if status.authenticated {
                    if let Some(user) = status.user {
                        session.current_user = Some(user);
                    }
                } else {
                    warn!("Session cookie did not survive the exchange; reconciling to unauthenticated");
                    session.phase = AuthPhase::Unauthenticated;
                    session.current_user = None;
                }
                session.pending_oauth_url = None;
            }
            Err(error) => {
                debug!(%error, "Session confirmation check failed");
            }
        }
    }

    /// Run `operation` under the current cancellation token.
    async fn guarded<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match token.run_until_cancelled(operation).await {
            Some(result) => result,
            None => Err(AuthError::Cancelled),
        }
    }

    /// Record and publish an error without changing phase.
    async fn surface(&self, error: &AuthError) {
        {
            let mut session = self.session.write().await;
            session.last_error = Some(error.to_string());
        }
        self.emit(CoreEvent::Auth(AuthEvent::AuthFailed {
            message: error.to_string(),
            recoverable: error.is_transient(),
        }));
    }

    /// Enter the transient `Failed` phase and publish the error.
    async fn fail(&self, error: AuthError) -> AuthError {
        {
            let mut session = self.session.write().await;
            session.phase = AuthPhase::Failed {
                reason: error.to_string(),
            };
            session.last_error = Some(error.to_string());
        }
        self.emit(CoreEvent::Auth(AuthEvent::AuthFailed {
            message: error.to_string(),
            recoverable: error.is_transient(),
        }));
        error
    }

    /// Like [`fail`](Self::fail), additionally tearing down the OAuth flow
    /// state so a failed exchange never leaves a stuck pending URL.
    async fn fail_oauth(&self, error: AuthError) -> AuthError {
        {
            let mut session = self.session.write().await;
            session.phase = AuthPhase::Failed {
                reason: error.to_string(),
            };
            session.current_user = None;
            session.pending_oauth_url = None;
            session.last_error = Some(error.to_string());
        }
        self.emit(CoreEvent::Auth(AuthEvent::AuthFailed {
            message: error.to_string(),
            recoverable: error.is_transient(),
        }));
        error
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine; events are observation, not control flow.
        let _ = self.event_bus.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
    use bytes::Bytes;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    const ALICE: &str =
        r#"{"id": "550e8400-e29b-41d4-a716-446655440000", "username": "alice"}"#;

    /// Scripted backend: replies are queued per endpoint path and every
    /// arrival is recorded.
    struct MockBackend {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<String>>,
    }

    enum Reply {
        Json(u16, String),
        Transport,
        DelayedJson(Duration, u16, String),
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script(&self, path: &str, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(reply);
        }

        fn calls_to(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }
    }

    fn response(status: u16, body: String) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body),
        }
    }

    #[async_trait]
    impl HttpClient for MockBackend {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            let path = Url::parse(&request.url)
                .unwrap()
                .path()
                .trim_start_matches('/')
                .to_string();

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                self.calls.lock().unwrap().push(path.clone());
                replies.get_mut(&path).and_then(|queue| queue.pop_front())
            };

            match reply {
                Some(Reply::Json(status, body)) => Ok(response(status, body)),
                Some(Reply::DelayedJson(delay, status, body)) => {
                    sleep(delay).await;
                    Ok(response(status, body))
                }
                Some(Reply::Transport) => {
                    Err(BridgeError::Connection("connection refused".to_string()))
                }
                None => Ok(response(
                    500,
                    format!(r#"{{"message": "endpoint not scripted: {}"}}"#, path),
                )),
            }
        }
    }

    struct FlagJar {
        cleared: AtomicBool,
    }

    impl CookieSession for FlagJar {
        fn clear_session(&self) {
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    mockall::mock! {
        Vault {}

        #[async_trait]
        impl CredentialVault for Vault {
            async fn store(&self, key: &str, value: &[u8]) -> BridgeResult<()>;
            async fn load(&self, key: &str) -> BridgeResult<Option<Vec<u8>>>;
            async fn remove(&self, key: &str) -> BridgeResult<()>;
            async fn clear(&self) -> BridgeResult<()>;
        }
    }

    fn machine_over(backend: Arc<MockBackend>) -> AuthStateMachine {
        let api = AuthApi::new(
            Url::parse("https://api.lango.test/").unwrap(),
            "desktop",
            backend,
        );
        AuthStateMachine::new(api, EventBus::new(32))
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn success_with_alice() -> Reply {
        Reply::Json(200, format!(r#"{{"success": true, "user": {}}}"#, ALICE))
    }

    fn status_authenticated() -> Reply {
        Reply::Json(200, format!(r#"{{"authenticated": true, "user": {}}}"#, ALICE))
    }

    #[tokio::test]
    async fn test_login_success() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        let user = machine.login("alice", "secret").await.unwrap();
        assert_eq!(user.username, "alice");

        let session = machine.session().await;
        assert!(session.is_authenticated());
        assert_eq!(session.current_user.unwrap().username, "alice");
        assert!(session.last_error.is_none());
        assert_eq!(backend.calls_to("auth/login"), 1);
    }

    #[tokio::test]
    async fn test_login_backend_error_not_retried() {
        let backend = MockBackend::new();
        backend.script(
            "auth/login",
            Reply::Json(
                401,
                r#"{"code": "401", "message": "invalid credentials"}"#.to_string(),
            ),
        );
        let machine = machine_over(Arc::clone(&backend));

        let err = machine.login("alice", "wrong").await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Backend {
                code: Some("401".to_string()),
                message: "invalid credentials".to_string(),
                details: None,
            }
        );

        let session = machine.session().await;
        assert!(!session.is_authenticated());
        assert!(session.current_user.is_none());
        assert_eq!(session.last_error.as_deref(), Some("invalid credentials"));
        // Application errors get exactly one attempt.
        assert_eq!(backend.calls_to("auth/login"), 1);
    }

    #[tokio::test]
    async fn test_login_recovers_from_transient_failures() {
        let backend = MockBackend::new();
        backend.script("auth/login", Reply::Transport);
        backend.script("auth/login", Reply::Transport);
        backend.script("auth/login", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        machine.login("alice", "secret").await.unwrap();
        assert!(machine.session().await.is_authenticated());
        assert_eq!(backend.calls_to("auth/login"), 3);
    }

    #[tokio::test]
    async fn test_login_retry_exhaustion() {
        let backend = MockBackend::new();
        for _ in 0..3 {
            backend.script("auth/login", Reply::Transport);
        }
        let machine = machine_over(Arc::clone(&backend));

        let err = machine.login("alice", "secret").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!machine.session().await.is_authenticated());
        assert_eq!(backend.calls_to("auth/login"), 3);
    }

    #[tokio::test]
    async fn test_signup_does_not_authenticate() {
        let backend = MockBackend::new();
        backend.script(
            "auth/signup",
            Reply::Json(200, r#"{"success": true, "message": "created"}"#.to_string()),
        );
        let machine = machine_over(Arc::clone(&backend));
        let mut events = machine.event_bus.subscribe();

        machine
            .signup("alice", "alice@example.com", "secret")
            .await
            .unwrap();

        let session = machine.session().await;
        assert!(!session.is_authenticated());
        assert_eq!(session.phase, AuthPhase::Unauthenticated);

        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::SignupCompleted {
                username: "alice".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_signup_failure_surfaces_error_without_transition() {
        let backend = MockBackend::new();
        backend.script(
            "auth/signup",
            Reply::Json(403, r#"{"message": "signups are disabled"}"#.to_string()),
        );
        let machine = machine_over(Arc::clone(&backend));

        let err = machine
            .signup("alice", "alice@example.com", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Backend { .. }));

        let session = machine.session().await;
        assert_eq!(session.phase, AuthPhase::Unauthenticated);
        assert_eq!(session.last_error.as_deref(), Some("signups are disabled"));
    }

    #[tokio::test]
    async fn test_logout_confirmed_clears_session_and_collaborators() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        backend.script(
            "auth/logout",
            Reply::Json(200, r#"{"success": true}"#.to_string()),
        );

        let jar = Arc::new(FlagJar {
            cleared: AtomicBool::new(false),
        });
        let mut vault = MockVault::new();
        vault.expect_clear().times(1).returning(|| Ok(()));

        let machine = machine_over(Arc::clone(&backend))
            .with_cookie_session(Arc::clone(&jar) as Arc<dyn CookieSession>)
            .with_vault(Arc::new(vault));
        let mut events = machine.event_bus.subscribe();

        machine.login("alice", "secret").await.unwrap();
        machine.logout().await.unwrap();

        let session = machine.session().await;
        assert!(!session.is_authenticated());
        assert!(session.current_user.is_none());
        assert!(jar.cleared.load(Ordering::SeqCst));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&CoreEvent::Auth(AuthEvent::SignedOut)));
        assert!(seen.contains(&CoreEvent::Session(SessionEvent::Ended)));
    }

    #[tokio::test]
    async fn test_logout_network_failure_keeps_session_authenticated() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        for _ in 0..3 {
            backend.script("auth/logout", Reply::Transport);
        }

        let jar = Arc::new(FlagJar {
            cleared: AtomicBool::new(false),
        });
        let machine = machine_over(Arc::clone(&backend))
            .with_cookie_session(Arc::clone(&jar) as Arc<dyn CookieSession>);

        machine.login("alice", "secret").await.unwrap();
        let err = machine.logout().await.unwrap_err();
        assert!(err.is_transient());

        let session = machine.session().await;
        assert!(session.is_authenticated());
        assert_eq!(session.current_user.unwrap().username, "alice");
        assert!(session.last_error.is_some());
        assert!(!jar.cleared.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_logout_server_rejection_keeps_session_authenticated() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        backend.script(
            "auth/logout",
            Reply::Json(
                200,
                r#"{"success": false, "message": "session busy"}"#.to_string(),
            ),
        );
        let machine = machine_over(Arc::clone(&backend));

        machine.login("alice", "secret").await.unwrap();
        let err = machine.logout().await.unwrap_err();
        assert!(matches!(err, AuthError::Backend { .. }));
        assert!(machine.session().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_initiate_oauth_sets_pending_url() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/login",
            Reply::Json(
                200,
                r#"{"authUrl": "https://accounts.example.com/authorize?state=xyz"}"#.to_string(),
            ),
        );
        let machine = machine_over(Arc::clone(&backend));

        let url = machine.initiate_oauth_login().await.unwrap().unwrap();
        assert_eq!(url.host_str(), Some("accounts.example.com"));

        let session = machine.session().await;
        assert_eq!(session.phase, AuthPhase::AwaitingOAuthRedirect);
        assert_eq!(session.pending_oauth_url, Some(url));
    }

    #[tokio::test]
    async fn test_initiate_oauth_noop_when_authenticated() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        machine.login("alice", "secret").await.unwrap();
        let url = machine.initiate_oauth_login().await.unwrap();
        assert!(url.is_none());
        assert_eq!(backend.calls_to("auth/google/login"), 0);
    }

    #[tokio::test]
    async fn test_initiate_oauth_rejects_malformed_url_without_transition() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/login",
            Reply::Json(200, r#"{"authUrl": "not a url"}"#.to_string()),
        );
        let machine = machine_over(Arc::clone(&backend));

        let err = machine.initiate_oauth_login().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidUrl(_)));

        let session = machine.session().await;
        assert_eq!(session.phase, AuthPhase::Unauthenticated);
        assert!(session.pending_oauth_url.is_none());
    }

    #[tokio::test]
    async fn test_initiate_oauth_rejects_url_without_host() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/login",
            Reply::Json(200, r#"{"authUrl": "mailto:someone@example.com"}"#.to_string()),
        );
        let machine = machine_over(Arc::clone(&backend));

        let err = machine.initiate_oauth_login().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_oauth_callback_success() {
        let backend = MockBackend::new();
        backend.script("auth/google/callback", success_with_alice());
        backend.script("auth/status", status_authenticated());
        let machine = machine_over(Arc::clone(&backend));

        machine
            .handle_oauth_callback("code-1", "state-1")
            .await
            .unwrap();

        let session = machine.session().await;
        assert!(session.is_authenticated());
        assert_eq!(session.current_user.unwrap().username, "alice");
        assert!(session.pending_oauth_url.is_none());
        assert_eq!(backend.calls_to("auth/google/callback"), 1);
        // Confirmation round-trip happened.
        assert_eq!(backend.calls_to("auth/status"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_callbacks_exchange_exactly_once() {
        let backend = MockBackend::new();
        backend.script("auth/google/callback", success_with_alice());
        backend.script("auth/status", status_authenticated());
        let machine = machine_over(Arc::clone(&backend));

        let (first, second) = tokio::join!(
            machine.handle_oauth_callback("code-1", "state-1"),
            machine.handle_oauth_callback("code-1", "state-1"),
        );
        first.unwrap();
        second.unwrap();

        assert!(machine.session().await.is_authenticated());
        assert_eq!(backend.calls_to("auth/google/callback"), 1);
    }

    #[tokio::test]
    async fn test_callback_dropped_while_exchange_in_flight() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/callback",
            Reply::DelayedJson(
                Duration::from_millis(50),
                200,
                format!(r#"{{"success": true, "user": {}}}"#, ALICE),
            ),
        );
        backend.script("auth/status", status_authenticated());
        let machine = machine_over(Arc::clone(&backend));

        let (first, second) = tokio::join!(
            machine.handle_oauth_callback("code-1", "state-1"),
            async {
                // Arrives while the first exchange is suspended in flight.
                sleep(Duration::from_millis(10)).await;
                machine.handle_oauth_callback("code-1", "state-1").await
            },
        );
        first.unwrap();
        second.unwrap();

        assert!(machine.session().await.is_authenticated());
        assert_eq!(backend.calls_to("auth/google/callback"), 1);
    }

    #[tokio::test]
    async fn test_failed_exchange_permits_retry_with_same_code() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/callback",
            Reply::Json(400, r#"{"message": "code expired"}"#.to_string()),
        );
        backend.script("auth/google/callback", success_with_alice());
        backend.script("auth/status", status_authenticated());
        let machine = machine_over(Arc::clone(&backend));

        let err = machine
            .handle_oauth_callback("code-1", "state-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Backend { .. }));

        let session = machine.session().await;
        assert!(!session.is_authenticated());
        assert!(session.pending_oauth_url.is_none());

        // A fresh delivery of the same code may proceed.
        machine
            .handle_oauth_callback("code-1", "state-1")
            .await
            .unwrap();
        assert!(machine.session().await.is_authenticated());
        assert_eq!(backend.calls_to("auth/google/callback"), 2);
    }

    #[tokio::test]
    async fn test_late_callback_never_disturbs_authenticated_session() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        machine.login("alice", "secret").await.unwrap();
        let before = machine.session().await;

        machine
            .handle_oauth_callback("code-stale", "state-stale")
            .await
            .unwrap();

        let after = machine.session().await;
        assert!(after.is_authenticated());
        assert_eq!(after.current_user, before.current_user);
        assert_eq!(backend.calls_to("auth/google/callback"), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_applies_authenticated_status() {
        let backend = MockBackend::new();
        backend.script("auth/status", status_authenticated());
        let machine = machine_over(Arc::clone(&backend));

        machine.bootstrap().await.unwrap();

        let session = machine.session().await;
        assert!(session.is_authenticated());
        assert_eq!(session.current_user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_bootstrap_applies_unauthenticated_status() {
        let backend = MockBackend::new();
        backend.script(
            "auth/status",
            Reply::Json(200, r#"{"authenticated": false}"#.to_string()),
        );
        let machine = machine_over(Arc::clone(&backend));

        machine.bootstrap().await.unwrap();
        assert!(!machine.session().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_surfaced_only_when_unauthenticated() {
        let backend = MockBackend::new();
        for _ in 0..3 {
            backend.script("auth/status", Reply::Transport);
        }
        let machine = machine_over(Arc::clone(&backend));

        let err = machine.bootstrap().await.unwrap_err();
        assert!(err.is_transient());
        assert!(machine.session().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_ignored_when_authenticated() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        for _ in 0..3 {
            backend.script("auth/status", Reply::Transport);
        }
        let machine = machine_over(Arc::clone(&backend));

        machine.login("alice", "secret").await.unwrap();
        machine.bootstrap().await.unwrap();
        assert!(machine.session().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_slow_bootstrap_never_downgrades_oauth_login() {
        let backend = MockBackend::new();
        // The bootstrap probe reads a stale cookie state, slowly.
        backend.script(
            "auth/status",
            Reply::DelayedJson(
                Duration::from_millis(100),
                200,
                r#"{"authenticated": false}"#.to_string(),
            ),
        );
        // The post-exchange confirmation sees the propagated cookie.
        backend.script("auth/status", status_authenticated());
        backend.script("auth/google/callback", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        let (bootstrap, callback) = tokio::join!(
            machine.bootstrap(),
            machine.handle_oauth_callback("code-1", "state-1"),
        );
        bootstrap.unwrap();
        callback.unwrap();

        let session = machine.session().await;
        assert!(session.is_authenticated());
        assert_eq!(session.current_user.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_cancel_all_abandons_in_flight_login() {
        let backend = MockBackend::new();
        backend.script(
            "auth/login",
            Reply::DelayedJson(
                Duration::from_secs(5),
                200,
                format!(r#"{{"success": true, "user": {}}}"#, ALICE),
            ),
        );
        let machine = Arc::new(machine_over(Arc::clone(&backend)));

        let task = tokio::spawn({
            let machine = Arc::clone(&machine);
            async move { machine.login("alice", "secret").await }
        });

        sleep(Duration::from_millis(20)).await;
        machine.cancel_all();

        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), AuthError::Cancelled);

        // Cancellation itself mutates nothing: the machine stays in the
        // phase the operation had reached, and the abandoned completion is
        // never applied.
        sleep(Duration::from_millis(50)).await;
        let session = machine.session().await;
        assert_eq!(session.phase, AuthPhase::Authenticating);
        assert!(!session.is_authenticated());
        assert!(session.current_user.is_none());
    }

    #[tokio::test]
    async fn test_operations_after_cancel_proceed_normally() {
        let backend = MockBackend::new();
        backend.script("auth/login", success_with_alice());
        let machine = machine_over(Arc::clone(&backend));

        machine.cancel_all();
        machine.login("alice", "secret").await.unwrap();
        assert!(machine.session().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_cancelled_exchange_releases_dedup_claim() {
        let backend = MockBackend::new();
        backend.script(
            "auth/google/callback",
            Reply::DelayedJson(
                Duration::from_secs(5),
                200,
                r#"{"success": true}"#.to_string(),
            ),
        );
        let machine = Arc::new(machine_over(Arc::clone(&backend)));

        let task = tokio::spawn({
            let machine = Arc::clone(&machine);
            async move { machine.handle_oauth_callback("code-1", "state-1").await }
        });

        sleep(Duration::from_millis(20)).await;
        machine.cancel_all();
        assert_eq!(task.await.unwrap().unwrap_err(), AuthError::Cancelled);

        // A fresh delivery of the same code may retry.
        backend.script("auth/google/callback", success_with_alice());
        backend.script("auth/status", status_authenticated());
        machine
            .handle_oauth_callback("code-1", "state-1")
            .await
            .unwrap();
        assert!(machine.session().await.is_authenticated());
    }
}
