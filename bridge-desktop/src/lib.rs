//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! This crate provides production-ready implementations of the bridge traits
//! using desktop-appropriate libraries:
//! - `HttpClient` and `CookieSession` using `reqwest` with a clearable
//!   session cookie jar
//! - `CredentialVault` using the `keyring` crate
//!
//! ## Feature Flags
//!
//! - `secure-store`: Enable OS keychain integration (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::ReqwestHttpClient;
//! use bridge_traits::HttpClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new();
//!
//!     // Use in core configuration
//! }
//! ```

mod http;

#[cfg(feature = "secure-store")]
mod vault;

pub use http::{ReqwestHttpClient, SessionJar};

#[cfg(feature = "secure-store")]
pub use vault::KeyringVault;
