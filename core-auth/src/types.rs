use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

/// An authenticated user as returned by the remote service.
///
/// The state machine treats this as opaque data; it is stored on successful
/// authentication and handed back to the UI layer unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Server-issued identifier.
    pub id: Uuid,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Phase of the authentication state machine.
///
/// # State Transitions
///
/// ```text
/// Unauthenticated -> Authenticating ----------> Authenticated
///        |                                           ^
///        v                                           |
/// AwaitingOAuthRedirect -> ProcessingOAuthCallback --+
///
/// (any failure) -> Failed -> Unauthenticated on the next operation
/// ```
///
/// `Failed` is transient: it is observable in a session snapshot after an
/// operation surfaces its error, and the machine re-enters
/// `Unauthenticated` when the next operation begins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthPhase {
    /// No authenticated session.
    #[default]
    Unauthenticated,
    /// A password credential exchange is in flight.
    Authenticating,
    /// An authorization URL has been obtained; waiting for the provider
    /// redirect to deliver a code.
    AwaitingOAuthRedirect,
    /// An authorization code is being exchanged for a session.
    ProcessingOAuthCallback,
    /// The session is authenticated.
    Authenticated,
    /// The last operation failed; the error has been surfaced.
    Failed { reason: String },
}

impl AuthPhase {
    /// Check if the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthPhase::Authenticated)
    }

    /// Check if an operation is in progress.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AuthPhase::Authenticating
                | AuthPhase::AwaitingOAuthRedirect
                | AuthPhase::ProcessingOAuthCallback
        )
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPhase::Unauthenticated => write!(f, "Unauthenticated"),
            AuthPhase::Authenticating => write!(f, "Authenticating..."),
            AuthPhase::AwaitingOAuthRedirect => write!(f, "Awaiting OAuth Redirect"),
            AuthPhase::ProcessingOAuthCallback => write!(f, "Processing OAuth Callback"),
            AuthPhase::Authenticated => write!(f, "Authenticated"),
            AuthPhase::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

/// Client-side belief about the authenticated session.
///
/// Mutated exclusively by the state machine behind its write lock; exposed
/// to callers as a cloned snapshot.
///
/// Invariants: `current_user` is present only while the phase is
/// `Authenticated`, and once authenticated any subsequent OAuth URL set is
/// discarded, so `pending_oauth_url` and an authenticated phase are never
/// both active for the same flow.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    pub phase: AuthPhase,
    pub current_user: Option<User>,
    /// Set once an OAuth authorization URL has been obtained; cleared the
    /// instant a callback is accepted or the flow errors.
    pub pending_oauth_url: Option<Url>,
    /// Message of the most recently surfaced error, for render-side
    /// consumption. Cleared when an operation succeeds.
    pub last_error: Option<String>,
}

impl AuthSession {
    /// Check if the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.phase.is_authenticated()
    }

    /// Re-enter `Unauthenticated` from a surfaced failure. Called at the
    /// start of every operation; other phases are left untouched.
    pub(crate) fn leave_failed(&mut self) {
        if matches!(self.phase, AuthPhase::Failed { .. }) {
            self.phase = AuthPhase::Unauthenticated;
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Request body for `POST auth/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Request body for `POST auth/signup`.
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Response envelope shared by login, signup, logout, and the OAuth
/// callback exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

/// Response body for `GET auth/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub authenticated: bool,
    #[serde(default)]
    pub user: Option<User>,
}

/// Response body for `GET auth/google/login`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthInitResponse {
    pub auth_url: String,
}

/// Uniform error envelope for non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}
