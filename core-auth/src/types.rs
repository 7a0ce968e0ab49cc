use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-installation identifier sent with login, refresh and logout.
///
/// Generated once and persisted; it survives logout so the backend can
/// recognise the same device across sessions.
///
/// # Examples
///
/// ```
/// use core_auth::DeviceId;
///
/// let generated = DeviceId::generate();
/// assert_eq!(generated.as_str().len(), 36);
///
/// let restored = DeviceId::from("c0ffee00-0000-4000-8000-000000000000");
/// assert_eq!(restored.to_string(), "c0ffee00-0000-4000-8000-000000000000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new random device id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access/refresh token pair.
///
/// Replaced as a whole, never mutated in place. A missing refresh token
/// means the server did not issue (or rotate) one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Keep `previous` as the refresh token when this pair carries none.
    pub fn with_refresh_fallback(mut self, previous: Option<String>) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous;
        }
        self
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Backend user record returned by login and `/auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default, alias = "name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Device metadata attached to login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub platform: String,
    pub app_version: String,
}

/// Login credentials. Users sign in with either an email or a phone number.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Email { email: String, password: String },
    Phone { phone_number: String, password: String },
}

impl Credentials {
    pub fn email(email: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Email {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn phone(phone_number: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Phone {
            phone_number: phone_number.into(),
            password: password.into(),
        }
    }

    /// Identifier safe to log.
    pub fn login_hint(&self) -> String {
        match self {
            Credentials::Email { email, .. } => {
                core_runtime::logging::redact_if_sensitive("email", email)
            }
            Credentials::Phone { .. } => "[REDACTED]".to_string(),
        }
    }

    pub(crate) fn password(&self) -> &str {
        match self {
            Credentials::Email { password, .. } | Credentials::Phone { password, .. } => password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login_hint())
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: Option<User>,
}

/// In-memory view of the current session.
///
/// Mutated only by the session manager on login, logout and refresh failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    pub is_authenticated: bool,
    /// Empty until the session manager has been initialized.
    pub device_id: String,
    pub user: Option<User>,
}

impl AuthSession {
    pub fn signed_out(device_id: &DeviceId) -> Self {
        Self {
            is_authenticated: false,
            device_id: device_id.to_string(),
            user: None,
        }
    }

    pub fn signed_in(device_id: &DeviceId, user: Option<User>) -> Self {
        Self {
            is_authenticated: true,
            device_id: device_id.to_string(),
            user,
        }
    }
}
