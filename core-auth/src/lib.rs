//! # Authentication Module
//!
//! Session management for the Lango client: password login/signup, Google
//! OAuth hand-off, logout, and the startup session bootstrap, all against
//! a cookie-based remote auth service.
//!
//! ## Overview
//!
//! The [`AuthStateMachine`] orchestrates every credential path and owns the
//! client's belief about the session. Around it:
//!
//! - [`AuthApi`] - the typed REST surface over the host's `HttpClient`
//! - [`RetryPolicy`] - bounded, transient-only retry with increasing backoff
//! - [`CodeDeduplicationStore`] - at-most-once processing of OAuth
//!   authorization codes under duplicate redirect delivery
//! - [`SessionBootstrapper`] - the startup status probe, applied without
//!   ever downgrading a session an interactive flow just established
//!
//! ## Features
//!
//! - At-most-once authorization-code exchange; duplicates dropped silently
//! - Double-check re-validation before every post-suspension state commit
//! - Selective retry: transport failures only, never application rejections
//! - Cancellation that abandons in-flight work without mutating state
//! - Auth state events on the runtime event bus

pub mod api;
pub mod bootstrap;
pub mod dedup;
pub mod error;
pub mod machine;
pub mod retry;
pub mod types;

pub use api::AuthApi;
pub use bootstrap::SessionBootstrapper;
pub use dedup::CodeDeduplicationStore;
pub use error::{AuthError, Result};
pub use machine::AuthStateMachine;
pub use retry::RetryPolicy;
pub use types::{AuthPhase, AuthSession, User};
