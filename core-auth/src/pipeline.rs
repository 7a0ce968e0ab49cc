//! Authorization Pipeline
//!
//! Every outgoing API request walks a small state machine:
//!
//! ```text
//! Unsent ─> Authorized ─> Sent ─┬─> Succeeded
//!                               └─> AuthRejected ─> Retrying ─> Sent ─┬─> Succeeded
//!                                                                     └─> Failed
//! ```
//!
//! `Unsent → Authorized` asks the [`RefreshCoordinator`] for a token that is
//! valid for at least the request threshold. A `401` on a request that has
//! not been retried yet hands the rejected token back to the coordinator and
//! replays the request once with whatever it returns. A second `401` ends
//! the request with [`AuthError::Unauthorized`]; it is never retried again.
//!
//! Any other status, error or not, is returned unchanged.

use crate::api::{api_error, decode_body, ApiBase};
use crate::coordinator::RefreshCoordinator;
use crate::credential_store::CredentialStore;
use crate::error::{AuthError, Result};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// How a request is authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// `Authorization: Bearer <access token>`
    #[default]
    Bearer,
    /// Bearer plus `X-Device-Id`
    DeviceScoped,
    /// No credentials; never refreshed or retried
    Anonymous,
}

/// A request against the backend API.
///
/// ```
/// use core_auth::{ApiRequest, AuthMode};
///
/// let request = ApiRequest::post("/rooms/12/tenants")
///     .json(&serde_json::json!({ "memberId": "m-7" }))
///     .unwrap()
///     .device_scoped();
///
/// assert_eq!(request.auth_mode(), AuthMode::DeviceScoped);
/// ```
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: HttpMethod,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    auth: AuthMode,
    timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            auth: AuthMode::Bearer,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| AuthError::Serialization(e.to_string()))?;
        self.body = Some(Bytes::from(bytes));
        Ok(self.header("Content-Type", "application/json"))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.auth = AuthMode::Anonymous;
        self
    }

    pub fn device_scoped(mut self) -> Self {
        self.auth = AuthMode::DeviceScoped;
        self
    }

    /// Override the client's default timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

/// Where a request currently is in its lifecycle.
enum Phase {
    Unsent,
    Authorized { token: Option<String> },
    Sent {
        response: HttpResponse,
        token: Option<String>,
    },
    AuthRejected { token: String },
    Retrying { token: String },
}

/// HTTP client that authorizes, refreshes and replays requests.
#[derive(Clone)]
pub struct AuthorizedClient {
    http: Arc<dyn HttpClient>,
    api: ApiBase,
    coordinator: RefreshCoordinator,
    store: CredentialStore,
    refresh_threshold: Duration,
    timeout: Duration,
}

impl AuthorizedClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        api: ApiBase,
        coordinator: RefreshCoordinator,
        store: CredentialStore,
    ) -> Self {
        Self {
            http,
            api,
            coordinator,
            store,
            refresh_threshold: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }

    /// Remaining token lifetime below which a request refreshes first.
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request`, refreshing and replaying at most once on `401`.
    ///
    /// # Errors
    ///
    /// - the coordinator's error when no usable token could be obtained
    /// - [`AuthError::Unauthorized`] when the replayed request was rejected too
    /// - [`AuthError::Network`] on transport failure
    #[instrument(skip(self, request), fields(method = request.method.as_str(), path = %request.path))]
    pub async fn send(&self, request: &ApiRequest) -> Result<HttpResponse> {
        let mut retried = false;
        let mut phase = Phase::Unsent;

        loop {
            phase = match phase {
                Phase::Unsent => {
                    let token = match request.auth {
                        AuthMode::Anonymous => None,
                        AuthMode::Bearer | AuthMode::DeviceScoped => Some(
                            self.coordinator
                                .ensure_fresh(self.refresh_threshold)
                                .await?,
                        ),
                    };
                    Phase::Authorized { token }
                }
                Phase::Authorized { token } => {
                    let response = self.dispatch(request, token.as_deref()).await?;
                    Phase::Sent { response, token }
                }
                Phase::Sent { response, token } => match token {
                    Some(token) if response.is_unauthorized() => {
                        if retried {
                            warn!("Request rejected again after token refresh");
                            return Err(AuthError::Unauthorized);
                        }
                        Phase::AuthRejected { token }
                    }
                    _ => {
                        debug!(status = response.status, "Request completed");
                        return Ok(response);
                    }
                },
                Phase::AuthRejected { token } => {
                    debug!("Access token rejected, refreshing");
                    let fresh = self.coordinator.refresh_after_rejection(&token).await?;
                    retried = true;
                    Phase::Retrying { token: fresh }
                }
                Phase::Retrying { token } => {
                    let response = self.dispatch(request, Some(&token)).await?;
                    Phase::Sent {
                        response,
                        token: Some(token),
                    }
                }
            };
        }
    }

    /// Send and decode a JSON response. Non-2xx maps to [`AuthError::Api`].
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(api_error(&response));
        }
        decode_body(&response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(&ApiRequest::get(path)).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(&ApiRequest::post(path).json(body)?).await
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<HttpResponse> {
        let http = self.build(request, token).await?;
        self.http.execute(http).await.map_err(|e| {
            warn!(error = %e, "Request failed before a response arrived");
            AuthError::Network(e.to_string())
        })
    }

    async fn build(&self, request: &ApiRequest, token: Option<&str>) -> Result<HttpRequest> {
        let url = self.api.url_for(&request.path)?;
        let mut http = HttpRequest::new(request.method, url)
            .timeout(request.timeout.unwrap_or(self.timeout));

        if !request.has_header("Accept") {
            http = http.header("Accept", "application/json");
        }
        if request.body.is_some() && !request.has_header("Content-Type") {
            http = http.header("Content-Type", "application/json");
        }
        for (name, value) in &request.headers {
            http = http.header(name.clone(), value.clone());
        }
        if let Some(body) = &request.body {
            http = http.body(body.clone());
        }

        if let Some(token) = token {
            http = http.bearer_token(token);
        }
        if request.auth == AuthMode::DeviceScoped {
            let device_id = self.store.device_id().await?;
            http = http.header("X-Device-Id", device_id.as_str());
        }

        Ok(http)
    }
}

impl std::fmt::Debug for AuthorizedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedClient")
            .field("api", &self.api.as_url().as_str())
            .field("refresh_threshold", &self.refresh_threshold)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
