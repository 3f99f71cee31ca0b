//! # Synced Library Module
//!
//! Owns the local store kept consistent with the remote file service.
//!
//! ## Overview
//!
//! This module manages:
//! - SQLite schema and migrations (folders, items, analysis results, sync jobs)
//! - Repository patterns for synced folders, items and analysis results
//! - Domain models and their conversion from remote listings

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::{LibraryError, Result};
