//! # Analysis Module
//!
//! Drives the downstream face-detection pipeline over synced items.
//!
//! ## Components
//!
//! - **Circuit Breaker** (`circuit_breaker`): Isolates the worker from a failing detection service
//! - **Analysis Orchestrator** (`orchestrator`): Polls pending items and analyzes them with
//!   bounded concurrency and per-item retry

pub mod circuit_breaker;
pub mod error;
pub mod orchestrator;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use error::{AnalysisError, Result};
pub use orchestrator::{AnalysisOrchestrator, AnalysisStats, CycleOutcome};
