//! Workspace umbrella crate.
//!
//! Re-exports the [`core_service`] façade so host applications can depend on
//! `folder-sync-workspace` without wiring each workspace crate individually.

pub use core_service::*;
