//! Configuration structures.
//!
//! Configuration is loaded from JSON documents; every section falls back to
//! its defaults when omitted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::Result;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Kernel-wide defaults (timeouts, sweep interval).
    #[serde(default)]
    pub defaults: KernelDefaults,

    /// Teams to construct for an office.
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Kernel-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelDefaults {
    /// Sourcing timeout for managed objects that do not configure their own.
    #[serde(with = "humantime_serde")]
    pub managed_object_timeout: Duration,

    /// Timeout for asynchronous flows awaiting their completion callback.
    #[serde(with = "humantime_serde")]
    pub asynchronous_flow_timeout: Duration,

    /// Interval between asset manager sweeps.
    #[serde(with = "humantime_serde")]
    pub asset_sweep_interval: Duration,

    /// How long shutdown waits for in-flight processes to drain.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for KernelDefaults {
    fn default() -> Self {
        Self {
            managed_object_timeout: Duration::from_secs(30),
            asynchronous_flow_timeout: Duration::from_secs(30),
            asset_sweep_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Team declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: TeamKind,
}

/// Kind of worker pool backing a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    /// Jobs run on the thread that assigns them.
    Passive,
    /// Fixed pool of dedicated worker threads.
    WorkerPool { size: usize },
    /// Jobs run on the ambient tokio runtime's blocking pool.
    Runtime,
}
