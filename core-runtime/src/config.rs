//! # Core Configuration Module
//!
//! Provides configuration management for the RentDesk core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all host bridges and auth settings. It enforces
//! fail-fast validation so a misconfigured host fails at start-up instead of
//! on the first authenticated request.
//!
//! ## Required Dependencies
//!
//! - API base URL - absolute `http`/`https` URL of the backend
//! - `SecureStore` - credential persistence
//! - `HttpClient` - transport for the identity provider and API calls
//!
//! When the `desktop-shims` feature is enabled, `KeyringSecureStore` and
//! `ReqwestHttpClient` are injected automatically if not provided.
//!
//! ## Optional Dependencies
//!
//! - `LifecycleObserver` - foreground notifications for proactive refresh
//! - `Clock` - time source (default: `SystemClock`)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .api_base_url("https://api.rentdesk.app/v1")
//!     .refresh_cooldown(Duration::from_secs(5))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Missing base URL is rejected at build time
//! let config = CoreConfig::builder()
//!     .build()
//!     .expect("Should fail - missing API base URL");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, LifecycleObserver, SecureStore, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Environment variable consulted by [`CoreConfigBuilder::api_base_url_from_env`].
pub const API_BASE_URL_ENV: &str = "RENTDESK_API_BASE_URL";

const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;
const MAX_REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Tunables for the credential lifecycle.
///
/// Defaults mirror the mobile app: requests refresh when the token has less
/// than 30 seconds left, foreground probes use a five minute window, and a
/// failed proactive refresh suppresses further proactive attempts for five
/// seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// Remaining lifetime below which a request refreshes before sending
    pub request_refresh_threshold: Duration,

    /// Remaining lifetime below which a foreground probe refreshes
    pub proactive_refresh_threshold: Duration,

    /// Window after a failed proactive refresh during which no new proactive
    /// refresh is started
    pub refresh_cooldown: Duration,

    /// Consecutive transient refresh failures tolerated before the session is
    /// torn down
    pub max_transient_refresh_failures: u32,

    /// Timeout applied to every outgoing HTTP request
    pub request_timeout: Duration,

    /// Prefix for every secure-store key owned by the auth core
    pub storage_namespace: String,

    /// Platform reported in the login device payload
    pub platform: String,

    /// App version reported in the login device payload
    pub app_version: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            request_refresh_threshold: Duration::from_secs(30),
            proactive_refresh_threshold: Duration::from_secs(300),
            refresh_cooldown: Duration::from_secs(5),
            max_transient_refresh_failures: 3,
            request_timeout: Duration::from_secs(10),
            storage_namespace: "rentdesk".to_string(),
            platform: std::env::consts::OS.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AuthSettings {
    /// Validates the settings
    pub fn validate(&self) -> Result<()> {
        if self.request_refresh_threshold.is_zero() {
            return Err(Error::Config(
                "Request refresh threshold must be greater than 0".to_string(),
            ));
        }

        if self.proactive_refresh_threshold.is_zero() {
            return Err(Error::Config(
                "Proactive refresh threshold must be greater than 0".to_string(),
            ));
        }

        if self.refresh_cooldown > MAX_REFRESH_COOLDOWN {
            return Err(Error::Config(
                "Refresh cooldown exceeds maximum of 60 seconds".to_string(),
            ));
        }

        if self.max_transient_refresh_failures == 0 {
            return Err(Error::Config(
                "Transient refresh failure budget must be at least 1".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.storage_namespace.is_empty()
            || self.storage_namespace.chars().any(char::is_whitespace)
        {
            return Err(Error::Config(
                "Storage namespace must be non-empty and contain no whitespace".to_string(),
            ));
        }

        Ok(())
    }
}

/// Core configuration for the RentDesk core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Backend base URL every request path is joined onto
    pub api_base_url: Url,

    /// HTTP transport
    pub http_client: Arc<dyn HttpClient>,

    /// Secure credential storage
    pub secure_store: Arc<dyn SecureStore>,

    /// App lifecycle observer (optional)
    pub lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,

    /// Time source for token expiry checks
    pub clock: Arc<dyn Clock>,

    /// Credential lifecycle tunables
    pub auth: AuthSettings,

    /// Capacity of the event bus broadcast channel
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field(
                "lifecycle_observer",
                &self
                    .lifecycle_observer
                    .as_ref()
                    .map(|_| "LifecycleObserver { ... }"),
            )
            .field("auth", &self.auth)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.api_base_url)?;

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        self.auth.validate()
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("API base URL cannot be empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", trimmed, e)))?;
    validate_base_url(&url)?;
    Ok(url)
}

fn validate_base_url(url: &Url) -> Result<()> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Config(format!(
                "API base URL must use http or https, got '{}'",
                other
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(Error::Config("API base URL must include a host".to_string()));
    }

    Ok(())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store(namespace: &str) -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::with_service_name(namespace));
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store(_namespace: &str) -> Result<Arc<dyn SecureStore>> {
    Err(Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for credential persistence. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default KeyringSecureStore. \
                 Mobile: inject platform-native secure storage (Keychain/Keystore)."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout)
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: ensure the 'desktop-shims' feature is enabled. \
                 Mobile: inject platform-native adapter."
            .to_string(),
    })
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    api_base_url: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
    clock: Option<Arc<dyn Clock>>,
    auth: AuthSettings,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Sets the backend base URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .api_base_url("https://api.rentdesk.app/v1");
    /// ```
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Reads the base URL from `RENTDESK_API_BASE_URL` when it is set.
    ///
    /// An explicit [`api_base_url`](Self::api_base_url) call made earlier is
    /// overridden; a missing variable leaves the builder untouched.
    pub fn api_base_url_from_env(mut self) -> Self {
        if let Ok(value) = std::env::var(API_BASE_URL_ENV) {
            self.api_base_url = Some(value);
        }
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the reqwest-based desktop client is used when the
    /// `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure store implementation.
    ///
    /// The secure store persists the token pair and device id. It must
    /// provide platform-appropriate security (Keychain on iOS, Keystore on
    /// Android, etc.).
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Sets the lifecycle observer implementation (optional).
    pub fn lifecycle_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle_observer = Some(observer);
        self
    }

    /// Sets the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces all auth settings at once.
    pub fn auth_settings(mut self, settings: AuthSettings) -> Self {
        self.auth = settings;
        self
    }

    /// Default: 30 seconds
    pub fn request_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.auth.request_refresh_threshold = threshold;
        self
    }

    /// Default: 5 minutes
    pub fn proactive_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.auth.proactive_refresh_threshold = threshold;
        self
    }

    /// Default: 5 seconds. Zero disables the cooldown.
    pub fn refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.auth.refresh_cooldown = cooldown;
        self
    }

    /// Default: 3
    pub fn max_transient_refresh_failures(mut self, failures: u32) -> Self {
        self.auth.max_transient_refresh_failures = failures;
        self
    }

    /// Default: 10 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.auth.request_timeout = timeout;
        self
    }

    /// Default: `"rentdesk"`
    pub fn storage_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.auth.storage_namespace = namespace.into();
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.auth.platform = platform.into();
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.auth.app_version = version.into();
        self
    }

    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(CoreConfig)` on success, or an error if:
    /// - The API base URL is missing, relative or not http(s)
    /// - A required bridge is missing and no desktop default is available
    /// - An auth setting is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let raw_url = self.api_base_url.ok_or_else(|| {
            Error::Config(format!(
                "API base URL is required. Use .api_base_url() or set {}.",
                API_BASE_URL_ENV
            ))
        })?;
        let api_base_url = parse_base_url(&raw_url)?;

        // Settings are checked before any default bridge is constructed.
        self.auth.validate()?;

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store(&self.auth.storage_namespace)?,
        };

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(self.auth.request_timeout)?,
        };

        let config = CoreConfig {
            api_base_url,
            http_client,
            secure_store,
            lifecycle_observer: self.lifecycle_observer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            auth: self.auth,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
