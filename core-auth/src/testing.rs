//! In-crate fakes shared by unit tests.

use crate::error::{AuthError, Result};
use crate::identity::IdentityProvider;
use crate::types::{Credentials, DeviceId, DeviceInfo, LoginOutcome, TokenPair};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::lifecycle::{LifecycleChangeStream, LifecycleObserver, LifecycleState};
use bridge_traits::storage::SecureStore;
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use mockall::mock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub const NOW: i64 = 1_700_000_000;

mock! {
    pub HttpClient {}

    #[async_trait]
    impl HttpClient for HttpClient {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
    }
}

/// JWT-shaped token with the given `exp` and optional `sub`.
pub fn make_token(exp: i64, sub: Option<&str>) -> String {
    let mut claims = serde_json::json!({ "exp": exp, "iat": exp - 900 });
    if let Some(sub) = sub {
        claims["sub"] = serde_json::Value::from(sub);
    }
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

pub struct FixedClock {
    secs: AtomicI64,
}

impl FixedClock {
    pub fn at(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.secs.load(Ordering::SeqCst), 0).unwrap()
    }
}

#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    deletes: Mutex<HashMap<String, usize>>,
    fail_next: Mutex<Option<String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// How many times `delete_secret` was called for `key`.
    pub fn delete_count(&self, key: &str) -> usize {
        self.deletes.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Make the next operation fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    fn check(&self) -> BridgeResult<()> {
        match self.fail_next.lock().unwrap().take() {
            Some(message) => Err(BridgeError::OperationFailed(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
        self.check()?;
        *self
            .deletes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Identity provider answering from scripted outcomes.
pub struct ScriptedIdentity {
    refresh_outcomes: Mutex<VecDeque<Result<TokenPair>>>,
    login_outcome: Mutex<Option<Result<LoginOutcome>>>,
    logout_outcome: Mutex<Result<()>>,
    delay: Mutex<Duration>,
    last_refresh_token: Mutex<Option<String>>,
    last_device: Mutex<Option<DeviceInfo>>,
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
}

impl ScriptedIdentity {
    pub fn new() -> Self {
        Self {
            refresh_outcomes: Mutex::new(VecDeque::new()),
            login_outcome: Mutex::new(None),
            logout_outcome: Mutex::new(Ok(())),
            delay: Mutex::new(Duration::ZERO),
            last_refresh_token: Mutex::new(None),
            last_device: Mutex::new(None),
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_refresh(&self, outcome: Result<TokenPair>) {
        self.refresh_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_login(&self, outcome: Result<LoginOutcome>) {
        *self.login_outcome.lock().unwrap() = Some(outcome);
    }

    pub fn set_logout(&self, outcome: Result<()>) {
        *self.logout_outcome.lock().unwrap() = outcome;
    }

    /// Latency applied to every refresh call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().unwrap().clone()
    }

    pub fn last_device(&self) -> Option<DeviceInfo> {
        self.last_device.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentity {
    async fn login(&self, _credentials: &Credentials, device: &DeviceInfo) -> Result<LoginOutcome> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_device.lock().unwrap() = Some(device.clone());
        self.login_outcome
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(AuthError::InvalidResponse("no scripted login".into())))
    }

    async fn refresh(&self, refresh_token: &str, _device_id: &DeviceId) -> Result<TokenPair> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.refresh_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AuthError::Network("no scripted refresh".into())))
    }

    async fn logout(&self, _access_token: Option<&str>, _device_id: &DeviceId) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.logout_outcome.lock().unwrap().clone()
    }
}

/// Lifecycle observer fed from a channel.
pub struct ChannelLifecycle {
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<LifecycleState>>>,
}

impl ChannelLifecycle {
    pub fn new() -> (Self, mpsc::UnboundedSender<LifecycleState>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                receiver: tokio::sync::Mutex::new(Some(receiver)),
            },
            sender,
        )
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<LifecycleState>);

#[async_trait]
impl LifecycleChangeStream for ChannelStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        self.0.recv().await
    }
}

#[async_trait]
impl LifecycleObserver for ChannelLifecycle {
    async fn get_state(&self) -> BridgeResult<LifecycleState> {
        Ok(LifecycleState::Foreground)
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn LifecycleChangeStream>> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| BridgeError::NotAvailable("already subscribed".into()))?;
        Ok(Box::new(ChannelStream(receiver)))
    }
}
