//! Single-Flight Token Refresh
//!
//! [`RefreshCoordinator`] owns the in-memory refresh state and is the only
//! component that writes refreshed credentials. At most one refresh call is
//! in flight at any time; every caller that needs a fresh token while it runs
//! awaits the same shared future and receives the same outcome.
//!
//! ```text
//!   ensure_fresh ─┐                        ┌─> Ok(access_token)  (all waiters)
//!   force_refresh ┼─> in flight? ─ yes ─> join
//!   after 401 ────┘        │ no
//!                          └─> spawn driver ─> IdentityProvider::refresh
//!                                               │
//!                          success: store.set, resolve Ok
//!                          transient: resolve Err, start cooldown (proactive)
//!                          terminal: store.clear, notify listener once, resolve Err
//! ```
//!
//! The driver runs on its own task, so a waiter that stops polling (its own
//! request timed out, its task was aborted) never cancels the refresh for the
//! others.

use crate::codec::TokenCodec;
use crate::credential_store::CredentialStore;
use crate::error::{AuthError, Result};
use crate::identity::IdentityProvider;
use crate::types::TokenPair;
use async_trait::async_trait;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, RefreshTrigger};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;

/// Receives terminal refresh failures. The session manager registers itself
/// here to tear the session down.
#[async_trait]
pub trait RefreshFailureListener: Send + Sync {
    async fn on_refresh_failed(&self, error: &AuthError);
}

/// Tunables for [`RefreshCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Window after a failed proactive refresh during which no new proactive
    /// refresh starts
    pub cooldown: Duration,
    /// Consecutive transient failures before giving up on the session
    pub max_transient_failures: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            max_transient_failures: 3,
        }
    }
}

/// Point-in-time view of the coordinator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSnapshot {
    pub in_flight: bool,
    pub last_attempt: Option<Instant>,
    pub cooling_down: bool,
    pub consecutive_transient_failures: u32,
    pub terminal_error: Option<AuthError>,
}

struct InFlight {
    epoch: u64,
    future: SharedRefresh,
    resolver: oneshot::Sender<Result<String>>,
}

#[derive(Default)]
struct RefreshState {
    in_flight: Option<InFlight>,
    /// Bumped whenever a refresh starts or credentials change
    epoch: u64,
    last_attempt: Option<Instant>,
    proactive_failure_at: Option<Instant>,
    consecutive_transient_failures: u32,
    /// Set by a terminal failure, cleared by login or sign-out
    terminal: Option<AuthError>,
}

impl RefreshState {
    fn reset_failures(&mut self) {
        self.consecutive_transient_failures = 0;
        self.proactive_failure_at = None;
    }
}

/// What a caller needs from the coordinator.
enum Need {
    /// Refresh only if the stored token expires within the threshold
    Fresh(Duration),
    /// Refresh unless the stored token already differs from this one
    Replacing(String),
    /// Refresh unconditionally
    Forced,
}

struct Inner {
    store: CredentialStore,
    identity: Arc<dyn IdentityProvider>,
    codec: TokenCodec,
    events: EventBus,
    policy: RefreshPolicy,
    state: Mutex<RefreshState>,
    listener: RwLock<Option<Weak<dyn RefreshFailureListener>>>,
}

/// Guarantees at most one refresh call in flight and fans its outcome out to
/// every waiter.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        identity: Arc<dyn IdentityProvider>,
        codec: TokenCodec,
        events: EventBus,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                identity,
                codec,
                events,
                policy,
                state: Mutex::new(RefreshState::default()),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Register the party notified on terminal refresh failure.
    ///
    /// Held weakly; the listener usually owns the coordinator.
    pub async fn set_failure_listener(&self, listener: Weak<dyn RefreshFailureListener>) {
        *self.inner.listener.write().await = Some(listener);
    }

    /// A usable access token, refreshed first if it expires within
    /// `threshold`.
    ///
    /// Joins a refresh already in flight. During the cooldown that follows a
    /// failed proactive refresh the stored token is returned as-is; a
    /// rejection by the server then drives a forced refresh.
    ///
    /// # Errors
    ///
    /// - `NotAuthenticated` when no credentials are stored
    /// - the terminal error of the last failed refresh, until the next login
    /// - the error of the refresh this call started or joined
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self, threshold: Duration) -> Result<String> {
        self.acquire(Need::Fresh(threshold)).await
    }

    /// Refresh unconditionally, or join the refresh in flight. Not subject
    /// to the cooldown.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self) -> Result<String> {
        self.acquire(Need::Forced).await
    }

    /// Forced refresh after the server rejected `rejected`.
    ///
    /// If another caller already replaced the stored token, that token is
    /// returned without a second refresh call.
    #[instrument(skip_all)]
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String> {
        self.acquire(Need::Replacing(rejected.to_string())).await
    }

    /// Fail the refresh in flight (if any) and every later waiter with
    /// `error`, clear stored credentials and notify the failure listener.
    ///
    /// A no-op when the session has already failed terminally and nothing is
    /// in flight, so the logout path runs once.
    pub async fn notify_refresh_failed(&self, error: AuthError) {
        let mut state = self.inner.state.lock().await;
        let flight = state.in_flight.take();
        if flight.is_none() && state.terminal.is_some() {
            debug!("Refresh failure already handled");
            return;
        }
        self.enter_terminal(state, flight.map(|f| f.resolver), error)
            .await;
    }

    /// Store credentials from a fresh login.
    ///
    /// Resolves any refresh still in flight with the new token and forgets
    /// earlier failures.
    pub async fn install_credentials(&self, pair: &TokenPair) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.store.set(pair).await?;

        let flight = state.in_flight.take();
        state.epoch += 1;
        state.terminal = None;
        state.reset_failures();
        drop(state);

        if let Some(flight) = flight {
            let _ = flight.resolver.send(Ok(pair.access_token().to_string()));
        }
        Ok(())
    }

    /// Clear stored credentials and all refresh state. Idempotent.
    ///
    /// A refresh still in flight resolves with `NotAuthenticated` and its
    /// result is discarded.
    pub async fn sign_out(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let flight = state.in_flight.take();
        state.epoch += 1;
        state.terminal = None;
        state.last_attempt = None;
        state.reset_failures();
        let result = self.inner.store.clear().await;
        drop(state);

        if let Some(flight) = flight {
            let _ = flight.resolver.send(Err(AuthError::NotAuthenticated));
        }
        result
    }

    /// Stored access token without any freshness check.
    pub async fn current_token(&self) -> Result<Option<String>> {
        Ok(self
            .inner
            .store
            .get()
            .await?
            .map(|pair| pair.access_token().to_string()))
    }

    pub async fn snapshot(&self) -> RefreshSnapshot {
        let state = self.inner.state.lock().await;
        RefreshSnapshot {
            in_flight: state.in_flight.is_some(),
            last_attempt: state.last_attempt,
            cooling_down: self.cooling_down(&state),
            consecutive_transient_failures: state.consecutive_transient_failures,
            terminal_error: state.terminal.clone(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.inner.codec
    }

    async fn acquire(&self, need: Need) -> Result<String> {
        loop {
            let observed_epoch = {
                let state = self.inner.state.lock().await;
                if let Some(flight) = &state.in_flight {
                    let joined = flight.future.clone();
                    drop(state);
                    debug!("Joining refresh in flight");
                    return joined.await;
                }
                state.epoch
            };

            // Storage I/O happens outside the lock; the epoch check below
            // catches anything that changed meanwhile.
            let pair = match self.inner.store.get().await {
                Ok(Some(pair)) => pair,
                Ok(None) => return Err(self.signed_out_error().await),
                Err(e @ AuthError::TokenCorrupted(_)) => {
                    self.notify_refresh_failed(e.clone()).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let token = pair.access_token().to_string();

            let trigger = match &need {
                Need::Fresh(threshold) => {
                    if !self.inner.codec.is_expiring_soon(&token, *threshold) {
                        return Ok(token);
                    }
                    RefreshTrigger::Proactive
                }
                Need::Replacing(rejected) => {
                    if token != *rejected {
                        debug!("Rejected token already replaced");
                        return Ok(token);
                    }
                    RefreshTrigger::Forced
                }
                Need::Forced => RefreshTrigger::Forced,
            };

            let mut state = self.inner.state.lock().await;
            if let Some(flight) = &state.in_flight {
                let joined = flight.future.clone();
                drop(state);
                return joined.await;
            }
            if state.epoch != observed_epoch {
                continue;
            }
            if trigger == RefreshTrigger::Proactive && self.cooling_down(&state) {
                debug!("Proactive refresh suppressed during cooldown");
                return Ok(token);
            }

            let future = self.start_refresh(&mut state, trigger);
            drop(state);
            return future.await;
        }
    }

    fn start_refresh(&self, state: &mut RefreshState, trigger: RefreshTrigger) -> SharedRefresh {
        let (resolver, receiver) = oneshot::channel();
        let future = receiver
            .map(|outcome| outcome.unwrap_or(Err(AuthError::RefreshAborted)))
            .boxed()
            .shared();

        state.epoch += 1;
        state.last_attempt = Some(Instant::now());
        let epoch = state.epoch;
        state.in_flight = Some(InFlight {
            epoch,
            future: future.clone(),
            resolver,
        });

        info!(?trigger, "Starting token refresh");
        self.emit(AuthEvent::TokenRefreshing { trigger });

        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(coordinator.request_new_pair())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("Token refresh task panicked");
                    Err(AuthError::RefreshAborted)
                });
            coordinator.settle(epoch, trigger, outcome).await;
        });

        future
    }

    async fn request_new_pair(&self) -> Result<TokenPair> {
        let current = self
            .inner
            .store
            .get()
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        let refresh_token = current
            .refresh_token()
            .ok_or(AuthError::NoRefreshToken)?
            .to_string();
        let device_id = self.inner.store.device_id().await?;

        let fresh = self
            .inner
            .identity
            .refresh(&refresh_token, &device_id)
            .await?;
        Ok(fresh.with_refresh_fallback(Some(refresh_token)))
    }

    async fn settle(&self, epoch: u64, trigger: RefreshTrigger, outcome: Result<TokenPair>) {
        let mut state = self.inner.state.lock().await;
        let flight = match state.in_flight.take() {
            Some(flight) if flight.epoch == epoch => flight,
            other => {
                state.in_flight = other;
                debug!("Discarding result of superseded refresh");
                return;
            }
        };

        let outcome = match outcome {
            Ok(pair) => self.inner.store.set(&pair).await.map(|()| pair),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(pair) => {
                state.epoch += 1;
                state.terminal = None;
                state.reset_failures();
                drop(state);

                let token = pair.access_token().to_string();
                let expires_at = self.inner.codec.decode(&token).ok().map(|c| c.expires_at);
                let _ = flight.resolver.send(Ok(token));
                info!(?expires_at, "Token refresh succeeded");
                self.emit(AuthEvent::TokenRefreshed { expires_at });
            }
            Err(e) if e.is_terminal() => {
                self.enter_terminal(state, Some(flight.resolver), e).await;
            }
            Err(e) => {
                state.consecutive_transient_failures += 1;
                let attempts = state.consecutive_transient_failures;
                if trigger == RefreshTrigger::Proactive {
                    state.proactive_failure_at = Some(Instant::now());
                }

                if attempts >= self.inner.policy.max_transient_failures {
                    let exhausted = AuthError::RefreshRetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    };
                    self.enter_terminal(state, Some(flight.resolver), exhausted)
                        .await;
                    return;
                }
                drop(state);

                warn!(error = %e, attempts, "Token refresh failed, session kept");
                let _ = flight.resolver.send(Err(e.clone()));
                self.emit(AuthEvent::AuthError {
                    message: e.to_string(),
                    recoverable: true,
                });
            }
        }
    }

    async fn enter_terminal(
        &self,
        mut state: MutexGuard<'_, RefreshState>,
        resolver: Option<oneshot::Sender<Result<String>>>,
        error: AuthError,
    ) {
        state.epoch += 1;
        state.terminal = Some(error.clone());
        state.reset_failures();
        if let Err(e) = self.inner.store.clear().await {
            warn!(error = %e, "Failed to clear credentials after refresh failure");
        }
        drop(state);

        warn!(error = %error, "Token refresh failed terminally, ending session");
        self.emit(AuthEvent::SessionExpired {
            message: error.to_string(),
        });
        self.emit(AuthEvent::AuthError {
            message: error.to_string(),
            recoverable: false,
        });

        // Waiters observe the error only once the session is torn down
        let listener = self
            .inner
            .listener
            .read()
            .await
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_refresh_failed(&error).await;
        }
        if let Some(resolver) = resolver {
            let _ = resolver.send(Err(error));
        }
    }

    async fn signed_out_error(&self) -> AuthError {
        self.inner
            .state
            .lock()
            .await
            .terminal
            .clone()
            .unwrap_or(AuthError::NotAuthenticated)
    }

    fn cooling_down(&self, state: &RefreshState) -> bool {
        state
            .proactive_failure_at
            .is_some_and(|at| at.elapsed() < self.inner.policy.cooldown)
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.inner.events.emit(CoreEvent::Auth(event));
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_token, FixedClock, MemorySecureStore, ScriptedIdentity, NOW};
    use bridge_traits::storage::SecureStore;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOON: Duration = Duration::from_secs(120);

    struct Harness {
        backend: Arc<MemorySecureStore>,
        store: CredentialStore,
        identity: Arc<ScriptedIdentity>,
        events: EventBus,
        coordinator: RefreshCoordinator,
    }

    fn harness(policy: RefreshPolicy) -> Harness {
        let backend = Arc::new(MemorySecureStore::new());
        let store = CredentialStore::new(backend.clone(), "test");
        let identity = Arc::new(ScriptedIdentity::new());
        let events = EventBus::new(64);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            identity.clone(),
            TokenCodec::new(Arc::new(FixedClock::at(NOW))),
            events.clone(),
            policy,
        );
        Harness {
            backend,
            store,
            identity,
            events,
            coordinator,
        }
    }

    async fn seed(store: &CredentialStore, expires_in: i64) -> String {
        let access = make_token(NOW + expires_in, Some("u1"));
        store
            .set(&TokenPair::new(access.clone(), Some("r1".into())))
            .await
            .unwrap();
        access
    }

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RefreshFailureListener for CountingListener {
        async fn on_refresh_failed(&self, _error: &AuthError) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_without_refresh() {
        let h = harness(RefreshPolicy::default());
        let access = seed(&h.store, 3600).await;

        let token = h.coordinator.ensure_fresh(SOON).await.unwrap();

        assert_eq!(token, access);
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_stored() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 60).await;
        let new_access = make_token(NOW + 3600, Some("u1"));
        h.identity
            .push_refresh(Ok(TokenPair::new(new_access.clone(), None)));
        let mut events = h.events.subscribe();

        let token = h.coordinator.ensure_fresh(SOON).await.unwrap();

        assert_eq!(token, new_access);
        let stored = h.store.get().await.unwrap().unwrap();
        assert_eq!(stored.access_token(), new_access);
        // Not rotated: previous refresh token kept
        assert_eq!(stored.refresh_token(), Some("r1"));
        assert_eq!(h.identity.last_refresh_token().as_deref(), Some("r1"));

        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshing {
                trigger: RefreshTrigger::Proactive
            })
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshed {
                expires_at: Some(NOW + 3600)
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 60).await;
        let new_access = make_token(NOW + 3600, None);
        h.identity.set_delay(Duration::from_millis(20));
        h.identity
            .push_refresh(Ok(TokenPair::new(new_access.clone(), Some("r2".into()))));

        let results = join_all((0..10).map(|_| h.coordinator.ensure_fresh(SOON))).await;

        assert_eq!(h.identity.refresh_calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), new_access);
        }
    }

    #[tokio::test]
    async fn test_terminal_failure_fans_out_and_clears_once() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 60).await;
        let listener = Arc::new(CountingListener::default());
        let weak = Arc::downgrade(&listener);
        let weak: Weak<dyn RefreshFailureListener> = weak;
        h.coordinator.set_failure_listener(weak).await;
        h.identity.set_delay(Duration::from_millis(20));
        h.identity
            .push_refresh(Err(AuthError::RefreshRejected("revoked".into())));

        let results = join_all((0..5).map(|_| h.coordinator.ensure_fresh(SOON))).await;

        for result in results {
            assert_eq!(
                result.unwrap_err(),
                AuthError::RefreshRejected("revoked".into())
            );
        }
        assert_eq!(h.identity.refresh_calls(), 1);
        assert_eq!(h.backend.delete_count("test.auth.tokens"), 1);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        // Later callers see the same terminal error without another attempt
        let later = h.coordinator.force_refresh().await.unwrap_err();
        assert_eq!(later, AuthError::RefreshRejected("revoked".into()));
        assert_eq!(h.identity.refresh_calls(), 1);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_terminal() {
        let h = harness(RefreshPolicy::default());
        h.store
            .set(&TokenPair::new(make_token(NOW + 10, None), None))
            .await
            .unwrap();

        let err = h.coordinator.ensure_fresh(SOON).await.unwrap_err();

        assert_eq!(err, AuthError::NoRefreshToken);
        assert_eq!(h.identity.refresh_calls(), 0);
        assert_eq!(h.store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_not_authenticated_without_credentials() {
        let h = harness(RefreshPolicy::default());

        assert_eq!(
            h.coordinator.ensure_fresh(SOON).await.unwrap_err(),
            AuthError::NotAuthenticated
        );
        assert_eq!(
            h.coordinator.force_refresh().await.unwrap_err(),
            AuthError::NotAuthenticated
        );
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_proactive_refresh() {
        let h = harness(RefreshPolicy::default());
        let access = seed(&h.store, 60).await;
        h.identity.push_refresh(Err(AuthError::Network("offline".into())));

        let first = h.coordinator.ensure_fresh(SOON).await;
        assert_eq!(first.unwrap_err(), AuthError::Network("offline".into()));

        // Within cooldown: stored token handed back, no network call
        let second = h.coordinator.ensure_fresh(SOON).await.unwrap();
        assert_eq!(second, access);
        assert_eq!(h.identity.refresh_calls(), 1);
        assert!(h.coordinator.snapshot().await.cooling_down);

        // Credentials survive a transient failure
        assert!(h.store.get().await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        h.identity
            .push_refresh(Ok(TokenPair::new(make_token(NOW + 3600, None), None)));
        h.coordinator.ensure_fresh(SOON).await.unwrap();
        assert_eq!(h.identity.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_ignores_cooldown() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 60).await;
        h.identity.push_refresh(Err(AuthError::Network("offline".into())));
        let _ = h.coordinator.ensure_fresh(SOON).await;

        let fresh = make_token(NOW + 3600, None);
        h.identity
            .push_refresh(Ok(TokenPair::new(fresh.clone(), None)));

        assert_eq!(h.coordinator.force_refresh().await.unwrap(), fresh);
        assert_eq!(h.identity.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_escalate_after_budget() {
        let h = harness(RefreshPolicy {
            cooldown: Duration::ZERO,
            max_transient_failures: 2,
        });
        seed(&h.store, 60).await;
        h.identity.push_refresh(Err(AuthError::Network("502".into())));
        h.identity.push_refresh(Err(AuthError::Network("503".into())));

        let first = h.coordinator.force_refresh().await.unwrap_err();
        assert!(!first.is_terminal());
        assert_eq!(h.coordinator.snapshot().await.consecutive_transient_failures, 1);

        let second = h.coordinator.force_refresh().await.unwrap_err();
        assert_eq!(
            second,
            AuthError::RefreshRetriesExhausted {
                attempts: 2,
                last_error: "Network error: 503".into()
            }
        );
        assert_eq!(h.store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_success_resets_transient_counter() {
        let h = harness(RefreshPolicy {
            cooldown: Duration::ZERO,
            max_transient_failures: 2,
        });
        seed(&h.store, 60).await;
        h.identity.push_refresh(Err(AuthError::Network("502".into())));
        h.identity
            .push_refresh(Ok(TokenPair::new(make_token(NOW + 60, None), None)));
        h.identity.push_refresh(Err(AuthError::Network("503".into())));

        let _ = h.coordinator.force_refresh().await;
        h.coordinator.force_refresh().await.unwrap();
        let third = h.coordinator.force_refresh().await.unwrap_err();

        assert!(!third.is_terminal());
        assert!(h.store.get().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_after_rejection_reuses_replaced_token() {
        let h = harness(RefreshPolicy::default());
        let rejected = seed(&h.store, 3600).await;
        let replacement = make_token(NOW + 7200, None);
        h.store
            .set(&TokenPair::new(replacement.clone(), Some("r2".into())))
            .await
            .unwrap();

        let token = h.coordinator.refresh_after_rejection(&rejected).await.unwrap();

        assert_eq!(token, replacement);
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_sign_out_resolves_waiters_and_discards_result() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 60).await;
        h.identity.set_delay(Duration::from_millis(50));
        h.identity
            .push_refresh(Ok(TokenPair::new(make_token(NOW + 3600, None), None)));

        let waiter = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.force_refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.coordinator.sign_out().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Err(AuthError::NotAuthenticated));
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The late refresh result must not resurrect the session
        assert_eq!(h.store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_credentials_clears_terminal_error() {
        let h = harness(RefreshPolicy::default());
        h.coordinator
            .notify_refresh_failed(AuthError::RefreshRejected("revoked".into()))
            .await;
        assert!(h.coordinator.snapshot().await.terminal_error.is_some());

        let pair = TokenPair::new(make_token(NOW + 3600, None), Some("r9".into()));
        h.coordinator.install_credentials(&pair).await.unwrap();

        assert_eq!(h.coordinator.snapshot().await.terminal_error, None);
        assert_eq!(
            h.coordinator.ensure_fresh(SOON).await.unwrap(),
            pair.access_token()
        );
    }

    #[tokio::test]
    async fn test_notify_refresh_failed_runs_logout_once() {
        let h = harness(RefreshPolicy::default());
        seed(&h.store, 3600).await;
        let listener = Arc::new(CountingListener::default());
        let weak = Arc::downgrade(&listener);
        let weak: Weak<dyn RefreshFailureListener> = weak;
        h.coordinator.set_failure_listener(weak).await;

        let error = AuthError::RefreshRejected("revoked".into());
        h.coordinator.notify_refresh_failed(error.clone()).await;
        h.coordinator.notify_refresh_failed(error).await;

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.delete_count("test.auth.tokens"), 1);
    }

    #[tokio::test]
    async fn test_corrupted_credentials_end_session() {
        let h = harness(RefreshPolicy::default());
        h.backend
            .set_secret("test.auth.tokens", b"garbage")
            .await
            .unwrap();

        let err = h.coordinator.ensure_fresh(SOON).await.unwrap_err();

        assert!(matches!(err, AuthError::TokenCorrupted(_)));
        assert!(h.coordinator.snapshot().await.terminal_error.is_some());
    }
}
