//! Secure Credential Storage using OS Keychain

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    session::CredentialVault,
};
use keyring::Entry;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// Keyring-based credential vault implementation
///
/// Uses platform-specific secure storage:
/// - macOS: Keychain
/// - Windows: Credential Manager (DPAPI)
/// - Linux: Secret Service (libsecret)
///
/// The keyring API cannot enumerate entries, so the vault tracks the keys
/// it has stored in-process; `clear` covers those. Entries written by a
/// previous process must be removed by key.
pub struct KeyringVault {
    service_name: String,
    known_keys: Mutex<HashSet<String>>,
}

impl KeyringVault {
    /// Create a new vault with the default service name
    pub fn new() -> Self {
        Self::with_service_name("lango-client-core")
    }

    /// Create a new vault with a custom service name
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            known_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Get a keyring entry for the given key
    fn entry(&self, key: &str) -> std::result::Result<Entry, keyring::Error> {
        Entry::new(&self.service_name, key)
    }

    /// Convert keyring error to BridgeError
    fn map_keyring_error(e: keyring::Error) -> BridgeError {
        BridgeError::OperationFailed(format!("Keyring error: {}", e))
    }

    fn delete_entry(&self, key: &str) -> Result<()> {
        let entry = self.entry(key).map_err(Self::map_keyring_error)?;

        match entry.delete_credential() {
            Ok(_) => {
                debug!(key = key, "Deleted secret from keyring");
                Ok(())
            }
            // Already gone; removal is idempotent.
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Self::map_keyring_error(e)),
        }
    }
}

impl Default for KeyringVault {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialVault for KeyringVault {
    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        // Keyring only supports strings, so binary data is base64 encoded
        let encoded = base64_encode(value);

        let entry = self.entry(key).map_err(Self::map_keyring_error)?;
        entry
            .set_password(&encoded)
            .map_err(Self::map_keyring_error)?;

        self.known_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());

        debug!(key = key, "Stored secret in keyring");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = self.entry(key).map_err(Self::map_keyring_error)?;

        match entry.get_password() {
            Ok(encoded) => {
                let decoded = base64_decode(&encoded).map_err(|e| {
                    error!(key = key, error = %e, "Failed to decode secret");
                    BridgeError::OperationFailed(format!("Failed to decode secret: {}", e))
                })?;

                debug!(key = key, "Retrieved secret from keyring");
                Ok(Some(decoded))
            }
            Err(keyring::Error::NoEntry) => {
                debug!(key = key, "Secret not found in keyring");
                Ok(None)
            }
            Err(e) => Err(Self::map_keyring_error(e)),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.delete_entry(key)?;
        self.known_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let keys: Vec<String> = {
            let known = self.known_keys.lock().unwrap_or_else(PoisonError::into_inner);
            known.iter().cloned().collect()
        };

        for key in &keys {
            self.delete_entry(key)?;
        }

        self.known_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        debug!(count = keys.len(), "Cleared credential vault");
        Ok(())
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(data)
}

fn base64_decode(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(data)
}
