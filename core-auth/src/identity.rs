//! Identity Provider Client
//!
//! The remote identity provider exposes three operations:
//!
//! | Operation | Endpoint | Body |
//! |-----------|----------|------|
//! | login | `POST /auth/login` | `{ email \| phoneNumber, password, device }` |
//! | refresh | `POST /auth/refresh` | `{ refreshToken, deviceId }` |
//! | logout | `POST /auth/logout` | `{ deviceId }` + `X-Device-Id` |
//!
//! Login and refresh are sent anonymously; they never pass through the
//! authorization pipeline, so a failing refresh cannot recurse into
//! another refresh.
//!
//! # Refresh failure classification
//!
//! - transport errors, `408`, `429` and `5xx` → [`AuthError::Network`] (transient)
//! - any other `4xx` → [`AuthError::RefreshRejected`] (terminal)
//! - `2xx` without an `accessToken` → [`AuthError::RefreshRejected`]

use crate::api::{api_error, error_message, ApiBase};
use crate::error::{AuthError, Result};
use crate::types::{Credentials, DeviceId, DeviceInfo, LoginOutcome, TokenPair, User};
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Remote identity operations used by the coordinator and session manager.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange credentials for a token pair.
    async fn login(&self, credentials: &Credentials, device: &DeviceInfo) -> Result<LoginOutcome>;

    /// Exchange a refresh token for a new pair. The returned pair carries no
    /// refresh token when the server did not rotate it.
    async fn refresh(&self, refresh_token: &str, device_id: &DeviceId) -> Result<TokenPair>;

    /// Tell the server the device signed out.
    async fn logout(&self, access_token: Option<&str>, device_id: &DeviceId) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    device_id: &'a DeviceId,
}

/// [`IdentityProvider`] over the host [`HttpClient`].
pub struct HttpIdentityProvider {
    http: Arc<dyn HttpClient>,
    api: ApiBase,
    timeout: Duration,
}

impl HttpIdentityProvider {
    pub fn new(http: Arc<dyn HttpClient>, api: ApiBase, timeout: Duration) -> Self {
        Self { http, api, timeout }
    }

    fn request(&self, method: HttpMethod, path: &str) -> Result<HttpRequest> {
        Ok(HttpRequest::new(method, self.api.url_for(path)?)
            .header("Accept", "application/json")
            .timeout(self.timeout))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http.execute(request).await.map_err(|e| {
            warn!(error = %e, "Identity provider unreachable");
            AuthError::Network(e.to_string())
        })
    }
}

fn with_json<T: Serialize>(request: HttpRequest, body: &T) -> Result<HttpRequest> {
    request
        .json(body)
        .map_err(|e| AuthError::Serialization(e.to_string()))
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.trim().is_empty())
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip(self, credentials, device), fields(login = %credentials.login_hint()))]
    async fn login(&self, credentials: &Credentials, device: &DeviceInfo) -> Result<LoginOutcome> {
        let body = match credentials {
            Credentials::Email { email, .. } => json!({
                "email": email,
                "password": credentials.password(),
                "device": device,
            }),
            Credentials::Phone { phone_number, .. } => json!({
                "phoneNumber": phone_number,
                "password": credentials.password(),
                "device": device,
            }),
        };

        let request = with_json(self.request(HttpMethod::Post, "/auth/login")?, &body)?;
        let response = self.send(request).await?;

        if !response.is_success() {
            warn!(status = response.status, "Login rejected");
            return Err(api_error(&response));
        }

        let parsed: LoginResponse = response
            .json()
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        let access_token = non_empty(parsed.access_token).ok_or_else(|| {
            AuthError::InvalidResponse("login response has no access token".to_string())
        })?;

        info!(
            has_refresh_token = parsed.refresh_token.is_some(),
            has_user = parsed.user.is_some(),
            "Login succeeded"
        );

        Ok(LoginOutcome {
            tokens: TokenPair::new(access_token, non_empty(parsed.refresh_token)),
            user: parsed.user,
        })
    }

    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str, device_id: &DeviceId) -> Result<TokenPair> {
        debug!("Refreshing access token");

        let request = with_json(
            self.request(HttpMethod::Post, "/auth/refresh")?,
            &RefreshRequest {
                refresh_token,
                device_id,
            },
        )?;
        let response = self.send(request).await?;
        let status = response.status;

        if response.is_success() {
            let parsed: RefreshResponse = response
                .json()
                .map_err(|e| AuthError::RefreshRejected(format!("unreadable response: {}", e)))?;

            let access_token = non_empty(parsed.access_token).ok_or_else(|| {
                AuthError::RefreshRejected("response has no access token".to_string())
            })?;

            info!(
                rotated = parsed.refresh_token.is_some(),
                "Access token refreshed"
            );
            return Ok(TokenPair::new(access_token, non_empty(parsed.refresh_token)));
        }

        let message = error_message(&response);
        if status == 408 || status == 429 || response.is_server_error() {
            warn!(status, error = %message, "Token refresh failed, will retry later");
            return Err(AuthError::Network(format!("{}: {}", status, message)));
        }

        warn!(status, error = %message, "Token refresh rejected");
        Err(AuthError::RefreshRejected(format!("{}: {}", status, message)))
    }

    #[instrument(skip(self, access_token))]
    async fn logout(&self, access_token: Option<&str>, device_id: &DeviceId) -> Result<()> {
        let mut request = with_json(
            self.request(HttpMethod::Post, "/auth/logout")?
                .header("X-Device-Id", device_id.as_str()),
            &json!({ "deviceId": device_id }),
        )?;
        if let Some(token) = access_token {
            request = request.bearer_token(token);
        }

        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(api_error(&response));
        }

        debug!("Remote logout acknowledged");
        Ok(())
    }
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("api", &self.api.as_url().as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}
