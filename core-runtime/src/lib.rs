//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the sync and analysis workers:
//! - Logging and tracing infrastructure
//! - Worker configuration
//! - Event bus (notification broadcaster)
//! - Retry with classification and exponential backoff
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the logging conventions, configuration defaults, and event
//! broadcasting mechanisms used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod retry;

pub use error::{Error, Result};
