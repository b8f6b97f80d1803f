//! Session-Scoped Storage Collaborators
//!
//! Two small contracts the auth subsystem needs from the host platform:
//! the session cookie jar (cleared on confirmed logout) and a secure vault
//! for any locally cached credential material.

use async_trait::async_trait;

use crate::error::Result;

/// Access to the HTTP session cookie jar.
///
/// The remote service maintains the session via a cookie; the transport
/// layer owns the jar. The core only ever needs one operation: dropping
/// the session cookie after the server has confirmed a logout, so a stale
/// cookie cannot resurrect the session on the next request.
pub trait CookieSession: Send + Sync {
    /// Discard every cookie held for the service, including the session
    /// cookie. Subsequent requests go out unauthenticated.
    fn clear_session(&self);
}

/// Secure persistence for locally cached credential material
/// (Keychain/Keystore/Secret Service on the respective platforms).
///
/// The auth subsystem itself is cookie-based and stores nothing here
/// during normal operation; the vault exists so collaborators that cache
/// a token can have it cleared on confirmed logout.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::session::CredentialVault;
///
/// async fn forget_user(vault: &dyn CredentialVault) -> Result<()> {
///     vault.clear().await
/// }
/// ```
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Store a secret under `key`, overwriting any previous value.
    async fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve the secret stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the secret stored under `key`. Removing a missing key is
    /// not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every secret the vault holds for this application.
    async fn clear(&self) -> Result<()>;
}
