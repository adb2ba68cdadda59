//! Core types for the office kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, ThreadStateId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for defaults, teams and logging

mod config;
mod errors;
mod ids;

pub use config::{Config, KernelDefaults, ObservabilityConfig, TeamConfig, TeamKind};
pub use errors::{Error, Result};
pub use ids::{ProcessId, ThreadStateId};
