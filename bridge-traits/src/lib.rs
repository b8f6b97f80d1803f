//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the core library and platform-specific
//! implementations. Each trait represents a capability the core requires but that
//! must be implemented differently per platform (desktop today; mobile later).
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP operations with TLS and the
//!   session cookie jar
//! - [`CookieSession`](session::CookieSession) - Explicit session-cookie clearing
//!   on confirmed logout
//! - [`CredentialVault`](session::CredentialVault) - Secure storage for locally
//!   cached credential material (Keychain/Keystore)
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform-specific errors to `BridgeError` and keep transport
//! failures (timeout, connection) distinguishable from everything else - the
//! core's retry policy classifies on that distinction.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent
//! usage across async tasks.

pub mod error;
pub mod http;
pub mod session;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use session::{CookieSession, CredentialVault};
