//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (currently `core-auth`). Host applications can depend on
//! `rentdesk-workspace` and enable `desktop-shims` to get the reqwest/keyring
//! adapters wired as defaults without touching each crate.

#[cfg(feature = "desktop-shims")]
pub use core_auth;
