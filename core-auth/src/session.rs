//! Session Lifecycle
//!
//! [`SessionManager`] owns the in-memory [`AuthSession`] and ties the other
//! parts together:
//!
//! - **start-up**: restore the session from persisted credentials; a missing
//!   or undecodable token means signed out
//! - **login**: store the new pair through the coordinator, persist the user
//! - **foreground**: probe token freshness, subject to the refresh cooldown
//! - **teardown**: on logout or terminal refresh failure, clear stored
//!   credentials, reset the session and run every registered
//!   [`SessionResetHook`]
//!
//! The remote logout call is best-effort. Local teardown always runs.

use crate::coordinator::{RefreshCoordinator, RefreshFailureListener};
use crate::credential_store::CredentialStore;
use crate::error::{AuthError, Result};
use crate::identity::IdentityProvider;
use crate::pipeline::AuthorizedClient;
use crate::types::{AuthSession, Credentials, DeviceInfo, User};
use async_trait::async_trait;
use bridge_traits::lifecycle::{LifecycleObserver, LifecycleState};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, LifecycleEvent, SignOutReason};
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Domain state owned by the rest of the application that must be dropped
/// whenever the session ends (cached buildings, members, draft wizards...).
pub trait SessionResetHook: Send + Sync {
    fn on_session_reset(&self, reason: SignOutReason);
}

/// Settings for [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Remaining lifetime below which start-up and foreground probes refresh
    pub proactive_refresh_threshold: Duration,
    /// Reported in the login device payload
    pub platform: String,
    pub app_version: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            proactive_refresh_threshold: Duration::from_secs(300),
            platform: std::env::consts::OS.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileResponse {
    Wrapped { user: User },
    Bare(User),
}

impl ProfileResponse {
    fn into_user(self) -> User {
        match self {
            ProfileResponse::Wrapped { user } | ProfileResponse::Bare(user) => user,
        }
    }
}

pub struct SessionManager {
    store: CredentialStore,
    identity: Arc<dyn IdentityProvider>,
    coordinator: RefreshCoordinator,
    client: AuthorizedClient,
    events: EventBus,
    settings: SessionSettings,
    session: RwLock<AuthSession>,
    hooks: RwLock<Vec<Arc<dyn SessionResetHook>>>,
}

impl SessionManager {
    /// Create the manager and register it as the coordinator's failure
    /// listener.
    pub async fn new(
        store: CredentialStore,
        identity: Arc<dyn IdentityProvider>,
        coordinator: RefreshCoordinator,
        client: AuthorizedClient,
        events: EventBus,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            identity,
            coordinator,
            client,
            events,
            settings,
            session: RwLock::new(AuthSession::default()),
            hooks: RwLock::new(Vec::new()),
        });

        let weak = Arc::downgrade(&manager);
        let listener: Weak<dyn RefreshFailureListener> = weak;
        manager.coordinator.set_failure_listener(listener).await;
        manager
    }

    /// Restore the session from persisted credentials.
    ///
    /// A token expiring within the proactive threshold is refreshed before
    /// returning. A transient refresh failure keeps the session; a terminal
    /// one ends it.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<AuthSession> {
        let device_id = self.store.device_id().await?;

        let tokens = match self.store.get().await {
            Ok(tokens) => tokens,
            Err(AuthError::TokenCorrupted(reason)) => {
                warn!(reason = %reason, "Stored credentials unreadable, starting signed out");
                self.emit(AuthEvent::SignedOut {
                    reason: SignOutReason::CredentialsMissing,
                });
                None
            }
            Err(e) => return Err(e),
        };

        let Some(pair) = tokens else {
            *self.session.write().await = AuthSession::signed_out(&device_id);
            debug!("No stored credentials");
            return Ok(self.session().await);
        };

        if let Err(e) = self.coordinator.codec().decode(pair.access_token()) {
            warn!(error = %e, "Stored access token cannot be decoded, signing out");
            self.coordinator.sign_out().await?;
            self.store.clear_user().await?;
            *self.session.write().await = AuthSession::signed_out(&device_id);
            self.emit(AuthEvent::SignedOut {
                reason: SignOutReason::CredentialsMissing,
            });
            return Ok(self.session().await);
        }

        let user = self.store.get_user().await.unwrap_or_else(|e| {
            warn!(error = %e, "Stored user record unreadable");
            None
        });
        *self.session.write().await = AuthSession::signed_in(&device_id, user);
        info!("Session restored from stored credentials");

        self.probe_freshness().await;
        Ok(self.session().await)
    }

    /// Sign in and persist the resulting credentials.
    #[instrument(skip(self, credentials), fields(login = %credentials.login_hint()))]
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthSession> {
        let device_id = self.store.device_id().await?;
        let device = DeviceInfo {
            device_id: device_id.clone(),
            platform: self.settings.platform.clone(),
            app_version: self.settings.app_version.clone(),
        };

        let outcome = self.identity.login(credentials, &device).await?;
        self.coordinator.install_credentials(&outcome.tokens).await?;

        match &outcome.user {
            Some(user) => self.store.set_user(user).await?,
            None => self.store.clear_user().await?,
        }

        let user_id = outcome.user.as_ref().map(|u| u.id.clone()).or_else(|| {
            self.coordinator
                .codec()
                .decode(outcome.tokens.access_token())
                .ok()
                .and_then(|claims| claims.subject)
        });

        let session = AuthSession::signed_in(&device_id, outcome.user);
        *self.session.write().await = session.clone();

        info!("User signed in");
        self.emit(AuthEvent::SignedIn { user_id });
        Ok(session)
    }

    /// Sign out. Succeeds when already signed out.
    ///
    /// The server is told first when an access token is stored; a failure
    /// there is logged and local teardown continues.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        match self.coordinator.current_token().await {
            Ok(Some(token)) => self.notify_server(&token).await,
            Ok(None) => debug!("No stored token, skipping remote logout"),
            Err(e) => warn!(error = %e, "Could not read token for remote logout"),
        }

        self.teardown(SignOutReason::UserRequested).await
    }

    async fn notify_server(&self, token: &str) {
        let device_id = match self.store.device_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Device id unavailable, skipping remote logout");
                return;
            }
        };

        if let Err(e) = self.identity.logout(Some(token), &device_id).await {
            warn!(error = %e, "Remote logout failed, continuing with local sign-out");
        }
    }

    /// Local teardown. In-memory state is always reset; the first storage
    /// error is returned afterwards.
    async fn teardown(&self, reason: SignOutReason) -> Result<()> {
        // On terminal refresh failure the coordinator has already cleared the
        // stored pair.
        let tokens_cleared = match reason {
            SignOutReason::SessionExpired => Ok(()),
            _ => self.coordinator.sign_out().await,
        };
        let user_cleared = self.store.clear_user().await;

        let was_authenticated = {
            let mut session = self.session.write().await;
            let was = session.is_authenticated;
            session.is_authenticated = false;
            session.user = None;
            was
        };

        for hook in self.hooks.read().await.iter() {
            hook.on_session_reset(reason);
        }

        if was_authenticated {
            info!(?reason, "Session ended");
            self.emit(AuthEvent::SignedOut { reason });
        }

        tokens_cleared.and(user_cleared)
    }

    /// React to an app lifecycle transition.
    pub async fn handle_lifecycle_change(&self, state: LifecycleState) {
        if state.is_foreground() {
            self.emit_lifecycle(LifecycleEvent::Foregrounded);
            if self.is_authenticated().await {
                self.probe_freshness().await;
            }
        } else {
            self.emit_lifecycle(LifecycleEvent::Backgrounded);
        }
    }

    /// Spawn a task feeding `observer`'s transitions into
    /// [`handle_lifecycle_change`](Self::handle_lifecycle_change).
    ///
    /// The task holds the manager weakly and ends with the stream or when the
    /// manager is dropped.
    pub async fn watch_lifecycle(
        self: &Arc<Self>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Result<JoinHandle<()>> {
        let mut changes = observer
            .subscribe_changes()
            .await
            .map_err(|e| AuthError::Platform(e.to_string()))?;
        let manager = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            while let Some(state) = changes.next().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_lifecycle_change(state).await;
            }
            debug!("Lifecycle watcher stopped");
        }))
    }

    /// Reload the signed-in user from `GET /auth/me`.
    #[instrument(skip(self))]
    pub async fn fetch_profile(&self) -> Result<User> {
        let user = self
            .client
            .get_json::<ProfileResponse>("/auth/me")
            .await?
            .into_user();

        self.store.set_user(&user).await?;
        let mut session = self.session.write().await;
        if session.is_authenticated {
            session.user = Some(user.clone());
        }
        Ok(user)
    }

    pub async fn add_reset_hook(&self, hook: Arc<dyn SessionResetHook>) {
        self.hooks.write().await.push(hook);
    }

    pub async fn session(&self) -> AuthSession {
        self.session.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.is_authenticated
    }

    pub fn client(&self) -> &AuthorizedClient {
        &self.client
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    async fn probe_freshness(&self) {
        match self
            .coordinator
            .ensure_fresh(self.settings.proactive_refresh_threshold)
            .await
        {
            Ok(_) => {}
            // Terminal failures already ended the session via the listener
            Err(e) if e.is_terminal() => debug!(error = %e, "Freshness probe ended session"),
            Err(e) => warn!(error = %e, "Freshness probe failed, session kept"),
        }
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.emit(CoreEvent::Auth(event));
    }

    fn emit_lifecycle(&self, event: LifecycleEvent) {
        let _ = self.events.emit(CoreEvent::Lifecycle(event));
    }
}

#[async_trait]
impl RefreshFailureListener for SessionManager {
    async fn on_refresh_failed(&self, error: &AuthError) {
        debug!(error = %error, "Tearing down session after refresh failure");
        if let Err(e) = self.teardown(SignOutReason::SessionExpired).await {
            warn!(error = %e, "Teardown after refresh failure incomplete");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
