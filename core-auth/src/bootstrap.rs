//! Startup Session Reconciliation
//!
//! At process start the client's belief about authentication is whatever a
//! previous run left in the cookie jar. The bootstrapper asks the server
//! for the authoritative answer; the state machine applies it without ever
//! letting a slow background probe undo a fast foreground login.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::api::AuthApi;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::StatusResponse;

/// Queries the server's session status at startup.
///
/// The probe itself is side-effect free and retried on transient transport
/// failures; interpreting the result - including the no-downgrade rule when
/// an interactive flow finished first - is the state machine's job.
pub struct SessionBootstrapper {
    api: Arc<AuthApi>,
    retry: RetryPolicy,
}

impl SessionBootstrapper {
    pub fn new(api: Arc<AuthApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Fetch the authoritative session status.
    #[instrument(skip(self))]
    pub async fn probe(&self) -> Result<StatusResponse> {
        debug!("Probing server session status");

        let api = Arc::clone(&self.api);
        let status = self
            .retry
            .run(move || {
                let api = Arc::clone(&api);
                async move { api.status().await }
            })
            .await?;

        debug!(
            authenticated = status.authenticated,
            "Session status probe completed"
        );
        Ok(status)
    }
}
