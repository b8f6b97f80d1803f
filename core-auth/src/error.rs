use bridge_traits::BridgeError;
use thiserror::Error;

/// Failures produced by the authentication subsystem.
///
/// The taxonomy separates the one retry-eligible class - transport-layer
/// failures - from everything else. Application-level rejections arrive as
/// [`AuthError::Backend`] and carry the server's envelope verbatim for the
/// UI layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A constructed or provider-returned URL is malformed. Never retried.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connectivity/timeout-class transport failure. The only variant the
    /// retry policy treats as transient.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Well-formed transport but an unexpected status without a decodable
    /// error envelope. Not retried.
    #[error("Invalid response from server (status {status})")]
    InvalidResponse { status: u16 },

    /// Response payload did not match the expected shape. Not retried;
    /// programmer-visible bug class.
    #[error("Failed to decode response: {0}")]
    DecodingFailed(String),

    /// Request payload could not be serialized. Not retried.
    #[error("Failed to encode request: {0}")]
    EncodingFailed(String),

    /// Application-level rejection (bad credentials, disabled signups,
    /// expired code). Surfaced verbatim to the UI; never retried.
    #[error("{message}")]
    Backend {
        code: Option<String>,
        message: String,
        details: Option<String>,
    },

    /// The operation was abandoned by `cancel_all`. No state was mutated.
    #[error("Operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether the retry policy may re-issue the failed operation.
    ///
    /// Only transport-layer failures qualify; retrying an application-level
    /// rejection wastes a round trip and can duplicate side effects.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::RequestFailed(_))
    }

    /// Map a transport-layer bridge failure into the retryable class.
    pub(crate) fn transport(err: BridgeError) -> Self {
        AuthError::RequestFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
