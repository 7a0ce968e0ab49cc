//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host platform.
//!
//! ## Overview
//!
//! This crate defines the contract between the RentDesk core and the host
//! application. Each trait is a capability the auth core needs but that is
//! provided differently per platform (desktop, iOS, Android).
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP with per-request timeout
//! - [`SecureStore`](storage::SecureStore) - Credential persistence (Keychain/Keystore)
//! - [`LifecycleObserver`](lifecycle::LifecycleObserver) - App foreground/background transitions
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ Available |
//! | iOS      | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Adapters convert
//! their platform errors into it and never include secret material in messages.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so a single adapter can be shared
//! behind an `Arc` across tasks.

pub mod error;
pub mod http;
pub mod lifecycle;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use lifecycle::{LifecycleChangeStream, LifecycleObserver, LifecycleState};
pub use storage::SecureStore;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
