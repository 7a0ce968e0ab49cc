//! Durable Credential Storage
//!
//! Persists the current [`TokenPair`], the signed-in [`User`] and the
//! per-installation [`DeviceId`] through the host [`SecureStore`]
//! (Keychain, Keystore, libsecret...).
//!
//! ## Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `{namespace}.auth.tokens` | JSON `{"accessToken": .., "refreshToken": ..}` |
//! | `{namespace}.auth.user` | JSON user record |
//! | `{namespace}.auth.deviceId` | UTF-8 device id |
//!
//! Both tokens live under one key so a write replaces the pair in a single
//! store operation; readers never see an access token from one pair next to
//! the refresh token of another.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{CredentialStore, TokenPair};
//! use std::sync::Arc;
//! # use bridge_traits::storage::SecureStore;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let store = CredentialStore::new(secure_store, "rentdesk");
//!
//! store
//!     .set(&TokenPair::new("access", Some("refresh".to_string())))
//!     .await?;
//! assert!(store.get().await?.is_some());
//!
//! store.clear().await?;
//! store.clear().await?; // idempotent
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{DeviceId, TokenPair, User};
use bridge_traits::storage::SecureStore;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TOKENS_KEY: &str = "auth.tokens";
const USER_KEY: &str = "auth.user";
const DEVICE_ID_KEY: &str = "auth.deviceId";

/// Namespaced access to persisted credentials.
///
/// Cloning shares the device id cache.
#[derive(Clone)]
pub struct CredentialStore {
    secure_store: Arc<dyn SecureStore>,
    namespace: String,
    device_id: Arc<Mutex<Option<DeviceId>>>,
}

impl CredentialStore {
    /// Create a store writing under `namespace`.
    pub fn new(secure_store: Arc<dyn SecureStore>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        debug!(namespace = %namespace, "Initializing CredentialStore");
        Self {
            secure_store,
            namespace,
            device_id: Arc::new(Mutex::new(None)),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}.{}", self.namespace, suffix)
    }

    /// Current token pair, if any.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(pair))` when a readable pair is stored
    /// - `Ok(None)` when nothing is stored
    /// - `Err(TokenCorrupted)` when the stored record could not be parsed;
    ///   the record is deleted before returning
    /// - `Err(SecureStorageUnavailable)` when the host store failed
    pub async fn get(&self) -> Result<Option<TokenPair>> {
        self.read_json(TOKENS_KEY).await
    }

    /// Replace the stored token pair.
    pub async fn set(&self, pair: &TokenPair) -> Result<()> {
        let json = serde_json::to_vec(pair).map_err(|e| {
            warn!(error = %e, "Failed to serialize tokens");
            AuthError::Serialization(e.to_string())
        })?;

        self.write(TOKENS_KEY, &json).await?;

        info!(
            has_refresh_token = pair.refresh_token().is_some(),
            "Tokens stored securely"
        );
        Ok(())
    }

    /// Delete the stored token pair. Succeeds when nothing is stored.
    pub async fn clear(&self) -> Result<()> {
        self.delete(TOKENS_KEY).await?;
        info!("Tokens deleted securely");
        Ok(())
    }

    pub async fn get_user(&self) -> Result<Option<User>> {
        self.read_json(USER_KEY).await
    }

    pub async fn set_user(&self, user: &User) -> Result<()> {
        let json = serde_json::to_vec(user).map_err(|e| {
            warn!(error = %e, "Failed to serialize user record");
            AuthError::Serialization(e.to_string())
        })?;
        self.write(USER_KEY, &json).await
    }

    pub async fn clear_user(&self) -> Result<()> {
        self.delete(USER_KEY).await
    }

    /// Per-installation device id, generated and persisted on first use.
    ///
    /// Not touched by [`clear`](Self::clear); the id outlives sessions.
    pub async fn device_id(&self) -> Result<DeviceId> {
        let mut cached = self.device_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let key = self.key(DEVICE_ID_KEY);
        let stored = self.secure_store.get_secret(&key).await.map_err(|e| {
            warn!(error = %e, "Failed to read device id from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let existing = stored
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let id = match existing {
            Some(id) => DeviceId::from(id),
            None => {
                let id = DeviceId::generate();
                self.write(DEVICE_ID_KEY, id.as_str().as_bytes()).await?;
                info!(device_id = %id, "Generated new device id");
                id
            }
        };

        *cached = Some(id.clone());
        Ok(id)
    }

    async fn read_json<T: DeserializeOwned>(&self, suffix: &str) -> Result<Option<T>> {
        let key = self.key(suffix);

        let data = self.secure_store.get_secret(&key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to read from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })?;

        let Some(data) = data else {
            debug!(key = %key, "No entry found in storage");
            return Ok(None);
        };

        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Failed to deserialize stored entry, it may be corrupted"
                );

                if let Err(delete_err) = self.secure_store.delete_secret(&key).await {
                    warn!(
                        key = %key,
                        error = %delete_err,
                        "Failed to delete corrupted entry"
                    );
                }

                Err(AuthError::TokenCorrupted(e.to_string()))
            }
        }
    }

    async fn write(&self, suffix: &str, value: &[u8]) -> Result<()> {
        let key = self.key(suffix);
        self.secure_store.set_secret(&key, value).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to write to secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })
    }

    async fn delete(&self, suffix: &str) -> Result<()> {
        let key = self.key(suffix);
        self.secure_store.delete_secret(&key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to delete from secure storage");
            AuthError::SecureStorageUnavailable(e.to_string())
        })
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
