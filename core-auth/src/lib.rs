//! # Authentication Module
//!
//! Client-side credential lifecycle for the RentDesk backend.
//!
//! ## Overview
//!
//! Every authenticated API call goes through [`AuthorizedClient`], which asks
//! the [`RefreshCoordinator`] for a usable access token, attaches it and
//! replays the call once if the server answers `401`. The coordinator makes
//! sure only one refresh call runs at a time no matter how many requests
//! notice an expiring token together, and hands its outcome to all of them.
//! When a refresh fails for good, the [`SessionManager`] tears the session
//! down exactly once.
//!
//! ## Components
//!
//! - [`codec`]: expiry extraction from JWT-shaped access tokens (unverified,
//!   scheduling only)
//! - [`CredentialStore`]: token pair, user record and device id in the host
//!   secure store
//! - [`HttpIdentityProvider`]: `/auth/login`, `/auth/refresh`, `/auth/logout`
//! - [`RefreshCoordinator`]: single-flight refresh with cooldown
//! - [`AuthorizedClient`]: per-request authorization state machine
//! - [`SessionManager`]: start-up, login, logout, foreground probes
//! - [`AuthService`]: wiring from a `CoreConfig`

pub mod api;
pub mod codec;
pub mod coordinator;
pub mod credential_store;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod types;

pub use codec::{DecodeError, DecodedClaims, TokenCodec};
pub use coordinator::{RefreshCoordinator, RefreshFailureListener, RefreshPolicy, RefreshSnapshot};
pub use credential_store::CredentialStore;
pub use error::{AuthError, Result};
pub use identity::{HttpIdentityProvider, IdentityProvider};
pub use pipeline::{ApiRequest, AuthMode, AuthorizedClient};
pub use service::AuthService;
pub use session::{SessionManager, SessionResetHook, SessionSettings};
pub use types::{AuthSession, Credentials, DeviceId, DeviceInfo, LoginOutcome, TokenPair, User};

#[cfg(test)]
pub(crate) mod testing;
