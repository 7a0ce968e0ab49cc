//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `SecureStore` using the `keyring` crate
//! - `LifecycleObserver` driven by the host window layer (focus gained/lost)
//!
//! ## Feature Flags
//!
//! - `secure-store`: Enable OS keychain integration (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{KeyringSecureStore, ReqwestHttpClient};
//! use std::sync::Arc;
//!
//! let http_client = Arc::new(ReqwestHttpClient::new()?);
//! let secure_store = Arc::new(KeyringSecureStore::with_service_name("rentdesk"));
//! ```

mod http;
mod lifecycle;

#[cfg(feature = "secure-store")]
mod secure_store;

pub use http::ReqwestHttpClient;
pub use lifecycle::DesktopLifecycleObserver;

#[cfg(feature = "secure-store")]
pub use secure_store::KeyringSecureStore;
