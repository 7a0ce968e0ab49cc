//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the RentDesk core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the auth core depends on. It
//! establishes the configuration, logging conventions and event broadcasting
//! used throughout the workspace.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
