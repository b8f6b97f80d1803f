//! Authorization-Code Deduplication
//!
//! The provider redirect can be delivered more than once (system dialogs
//! re-firing, duplicate URL-scheme activations), and a duplicate must never
//! trigger a second token exchange. This store provides the atomic
//! check-and-insert that makes the callback path idempotent.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Thread-safe set of already-processed authorization codes plus a single
/// in-flight flag.
///
/// Codes are inserted *before* the exchange request is issued and removed
/// only when that exchange fails, so a legitimate retry with the same code
/// (a fresh delivery after a failed exchange) can proceed while a duplicate
/// of a successful one is dropped.
///
/// Unlike the rest of the session state, this store is touched from
/// multiple completion contexts before they serialize on the machine's
/// write lock, so it carries its own mutex. The critical section only
/// mutates the in-memory set; there is never I/O or an await inside the
/// lock.
///
/// Entries accumulate for the process lifetime: codes are one-time-use by
/// the provider, so the set stays small within a single app session.
#[derive(Debug, Default)]
pub struct CodeDeduplicationStore {
    inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    processed: HashSet<String>,
    in_flight: bool,
}

impl CodeDeduplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `code` for processing.
    ///
    /// Returns `false` - the caller must abort - if an exchange is already
    /// in flight or the code has been processed before. Otherwise marks an
    /// exchange in flight, records the code, and returns `true`.
    pub fn try_begin_processing(&self, code: &str) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if state.in_flight {
            debug!("authorization code rejected: an exchange is already in flight");
            return false;
        }
        if state.processed.contains(code) {
            debug!("authorization code rejected: already processed");
            return false;
        }

        state.in_flight = true;
        state.processed.insert(code.to_string());
        true
    }

    /// Release the in-flight flag after an exchange completes.
    ///
    /// A failed exchange removes the code from the processed set so a fresh
    /// delivery of the same code may retry it.
    pub fn end_processing(&self, code: &str, succeeded: bool) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        state.in_flight = false;
        if !succeeded {
            state.processed.remove(code);
        }
    }

    /// Whether `code` is currently recorded as processed.
    pub fn has_processed(&self, code: &str) -> bool {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.processed.contains(code)
    }
}
