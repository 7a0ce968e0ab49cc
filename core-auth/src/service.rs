//! Auth service façade.
//!
//! Wires the host bridges from a [`CoreConfig`] into the credential store,
//! identity client, refresh coordinator, authorization pipeline and session
//! manager.

use crate::api::ApiBase;
use crate::codec::TokenCodec;
use crate::coordinator::{RefreshCoordinator, RefreshPolicy};
use crate::credential_store::CredentialStore;
use crate::error::Result;
use crate::identity::{HttpIdentityProvider, IdentityProvider};
use crate::pipeline::AuthorizedClient;
use crate::session::{SessionManager, SessionSettings};
use crate::types::AuthSession;
use bridge_traits::lifecycle::LifecycleObserver;
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// Primary entry point for host applications.
///
/// ```no_run
/// use core_auth::{AuthService, Credentials};
/// use core_runtime::config::CoreConfig;
///
/// # async fn example(config: CoreConfig) -> core_auth::Result<()> {
/// let auth = AuthService::from_config(&config).await?;
/// let session = auth.start().await?;
///
/// if !session.is_authenticated {
///     auth.session_manager()
///         .login(&Credentials::email("owner@rentdesk.app", "secret"))
///         .await?;
/// }
///
/// let buildings: serde_json::Value = auth.client().get_json("/buildings").await?;
/// # Ok(())
/// # }
/// ```
pub struct AuthService {
    session: Arc<SessionManager>,
    events: EventBus,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AuthService {
    /// Build the service talking to the backend over `config.http_client`.
    pub async fn from_config(config: &CoreConfig) -> Result<Self> {
        let identity = Arc::new(HttpIdentityProvider::new(
            config.http_client.clone(),
            ApiBase::new(config.api_base_url.clone()),
            config.auth.request_timeout,
        ));
        Self::with_identity_provider(config, identity).await
    }

    /// Build the service with a custom identity provider.
    pub async fn with_identity_provider(
        config: &CoreConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = &config.auth;

        let events = EventBus::new(config.event_buffer_size);
        let store = CredentialStore::new(
            config.secure_store.clone(),
            settings.storage_namespace.clone(),
        );
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            identity.clone(),
            TokenCodec::new(config.clock.clone()),
            events.clone(),
            RefreshPolicy {
                cooldown: settings.refresh_cooldown,
                max_transient_failures: settings.max_transient_refresh_failures,
            },
        );
        let client = AuthorizedClient::new(
            config.http_client.clone(),
            ApiBase::new(config.api_base_url.clone()),
            coordinator.clone(),
            store.clone(),
        )
        .with_refresh_threshold(settings.request_refresh_threshold)
        .with_timeout(settings.request_timeout);

        let session = SessionManager::new(
            store,
            identity,
            coordinator,
            client,
            events.clone(),
            SessionSettings {
                proactive_refresh_threshold: settings.proactive_refresh_threshold,
                platform: settings.platform.clone(),
                app_version: settings.app_version.clone(),
            },
        )
        .await;

        info!(api = %config.api_base_url, "Auth service created");
        Ok(Self {
            session,
            events,
            lifecycle_observer: config.lifecycle_observer.clone(),
            watcher: Mutex::new(None),
        })
    }

    /// Restore the session and, when a lifecycle observer is configured,
    /// start watching foreground transitions. Calling it again re-reads
    /// stored credentials but keeps the existing watcher.
    pub async fn start(&self) -> Result<AuthSession> {
        let session = self.session.initialize().await?;

        if let Some(observer) = &self.lifecycle_observer {
            let mut watcher = self.watcher.lock().await;
            if watcher.is_none() {
                *watcher = Some(self.session.watch_lifecycle(observer.clone()).await?);
            }
        }

        Ok(session)
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn client(&self) -> &AuthorizedClient {
        self.session.client()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        self.session.coordinator()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }
}

impl Drop for AuthService {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("session", &self.session)
            .field("watching_lifecycle", &self.lifecycle_observer.is_some())
            .finish()
    }
}
