//! In-memory RentDesk backend and host bridges for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::lifecycle::{LifecycleChangeStream, LifecycleObserver, LifecycleState};
use bridge_traits::storage::SecureStore;
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use core_auth::AuthService;
use core_runtime::config::CoreConfig;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const START: i64 = 1_750_000_000;
pub const PASSWORD: &str = "correct-horse";
pub const BASE_URL: &str = "https://api.rentdesk.test/v1";

pub struct TestClock(AtomicI64);

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(START)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn unix(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.unix(), 0).unwrap()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    deletes: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn delete_count(&self, key: &str) -> usize {
        self.deletes.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
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

#[derive(Default)]
struct BackendState {
    serial: u64,
    /// access token -> expiry
    access: HashMap<String, i64>,
    refresh: HashSet<String>,
    refresh_status: Option<u16>,
    refresh_calls: usize,
    logout_calls: usize,
    /// (path, Authorization header) for every call
    log: Vec<(String, Option<String>)>,
}

/// Fake backend implementing the identity endpoints plus `/rooms`.
pub struct FakeBackend {
    clock: Arc<TestClock>,
    access_ttl: i64,
    refresh_latency: Duration,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new(clock: Arc<TestClock>) -> Arc<Self> {
        Self::with_latency(clock, Duration::from_millis(10))
    }

    pub fn with_latency(clock: Arc<TestClock>, refresh_latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            access_ttl: 900,
            refresh_latency,
            state: Mutex::new(BackendState::default()),
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    pub fn logout_calls(&self) -> usize {
        self.state.lock().unwrap().logout_calls
    }

    /// Bearer tokens sent to `path`, in arrival order.
    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, auth)| auth.clone())
            .collect()
    }

    /// Invalidate every access token server-side.
    pub fn revoke_access_tokens(&self) {
        self.state.lock().unwrap().access.clear();
    }

    /// Answer `/auth/refresh` with `status` from now on.
    pub fn fail_refresh_with(&self, status: u16) {
        self.state.lock().unwrap().refresh_status = Some(status);
    }

    fn issue(&self, state: &mut BackendState) -> (String, String) {
        state.serial += 1;
        let exp = self.clock.unix() + self.access_ttl;
        let claims = json!({ "sub": "owner-1", "exp": exp, "jti": state.serial });
        let access = format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let refresh = format!("refresh-{}", state.serial);
        state.access.insert(access.clone(), exp);
        state.refresh.insert(refresh.clone());
        (access, refresh)
    }

    fn authorized(&self, state: &BackendState, request: &HttpRequest) -> bool {
        request
            .header_value("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .and_then(|token| state.access.get(token))
            .is_some_and(|exp| *exp >= self.clock.unix())
    }

    fn route(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let body: Value = request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null);
        let mut state = self.state.lock().unwrap();
        state.log.push((
            path.to_string(),
            request.header_value("authorization").map(str::to_string),
        ));

        match (request.method, path) {
            (HttpMethod::Post, "/auth/login") => {
                if body["password"] != PASSWORD {
                    return respond(401, json!({ "message": "Invalid email or password" }));
                }
                let (access, refresh) = self.issue(&mut state);
                respond(
                    200,
                    json!({
                        "user": { "id": "owner-1", "email": body["email"], "fullName": "Owner" },
                        "accessToken": access,
                        "refreshToken": refresh,
                    }),
                )
            }
            (HttpMethod::Post, "/auth/refresh") => {
                state.refresh_calls += 1;
                if let Some(status) = state.refresh_status {
                    return respond(status, json!({ "message": "Refresh token revoked" }));
                }
                let presented = body["refreshToken"].as_str().unwrap_or_default().to_string();
                if !state.refresh.remove(&presented) {
                    return respond(401, json!({ "message": "Unknown refresh token" }));
                }
                let (access, refresh) = self.issue(&mut state);
                respond(200, json!({ "accessToken": access, "refreshToken": refresh }))
            }
            (HttpMethod::Post, "/auth/logout") => {
                state.logout_calls += 1;
                HttpResponse::new(204, "")
            }
            (HttpMethod::Get, "/auth/me") if self.authorized(&state, request) => respond(
                200,
                json!({ "user": { "id": "owner-1", "fullName": "Owner Renamed" } }),
            ),
            (HttpMethod::Get, "/rooms") if self.authorized(&state, request) => {
                respond(200, json!([{ "id": 1, "name": "101" }, { "id": 2, "name": "102" }]))
            }
            (_, "/auth/me") | (_, "/rooms") => respond(401, json!({ "message": "Unauthorized" })),
            _ => respond(404, json!({ "message": "Not found" })),
        }
    }
}

fn respond(status: u16, body: Value) -> HttpResponse {
    HttpResponse::new(status, body.to_string())
}

#[async_trait]
impl HttpClient for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
        let path = url
            .path()
            .strip_prefix("/v1")
            .unwrap_or(url.path())
            .to_string();

        if path == "/auth/refresh" && !self.refresh_latency.is_zero() {
            tokio::time::sleep(self.refresh_latency).await;
        }

        Ok(self.route(&path, &request))
    }
}

/// Lifecycle observer driven by the test.
pub struct ManualLifecycle {
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<LifecycleState>>>,
}

impl ManualLifecycle {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<LifecycleState>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                receiver: tokio::sync::Mutex::new(Some(receiver)),
            }),
            sender,
        )
    }
}

struct ManualStream(mpsc::UnboundedReceiver<LifecycleState>);

#[async_trait]
impl LifecycleChangeStream for ManualStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        self.0.recv().await
    }
}

#[async_trait]
impl LifecycleObserver for ManualLifecycle {
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
        Ok(Box::new(ManualStream(receiver)))
    }
}

pub struct Harness {
    pub clock: Arc<TestClock>,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemoryStore>,
    pub service: AuthService,
}

pub fn config(
    clock: &Arc<TestClock>,
    backend: &Arc<FakeBackend>,
    store: &Arc<MemoryStore>,
) -> CoreConfig {
    CoreConfig::builder()
        .api_base_url(BASE_URL)
        .http_client(backend.clone())
        .secure_store(store.clone())
        .clock(clock.clone())
        .build()
        .unwrap()
}

pub async fn harness() -> Harness {
    let clock = TestClock::new();
    let backend = FakeBackend::new(clock.clone());
    let store = MemoryStore::new();
    let service = AuthService::from_config(&config(&clock, &backend, &store))
        .await
        .unwrap();

    Harness {
        clock,
        backend,
        store,
        service,
    }
}
