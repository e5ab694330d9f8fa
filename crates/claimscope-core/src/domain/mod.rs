//! Domain models for Claimscope.
//!
//! Persisted entities (claims, runs, artifacts, traces) live in
//! `claimscope-state`; this module holds the engine's error taxonomy.

pub mod error;

pub use error::{ConfigError, EngineError, FailureKind, Result, ScheduleError};
