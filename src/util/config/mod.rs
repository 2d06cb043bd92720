//! Engine configuration
//!
//! Plain serde struct with per-field defaults; usable as `Default` or
//! loaded from a JSON fragment by operational tooling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker-pool and admission tuning for one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads in the pool.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Start-queue entries a worker runs per iteration before taking one
    /// Yield entry.
    #[serde(default = "default_start_burst")]
    pub start_burst: usize,
    /// Bounded worker wait, milliseconds; keeps workers responsive to
    /// external watchdogs.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Sleep-queue scan period, milliseconds.
    #[serde(default = "default_sleep_scan_ms")]
    pub sleep_scan_ms: u64,
    /// CPU allowance for the terminal detach handler, in slices.
    #[serde(default = "default_detach_quantum")]
    pub detach_quantum: u32,
    /// How long a reset retries before giving up, milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_num_workers() -> usize {
    3
}

fn default_start_burst() -> usize {
    5
}

fn default_idle_timeout_ms() -> u64 {
    100
}

fn default_sleep_scan_ms() -> u64 {
    25
}

fn default_detach_quantum() -> u32 {
    16
}

fn default_reset_timeout_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            start_burst: default_start_burst(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sleep_scan_ms: default_sleep_scan_ms(),
            detach_quantum: default_detach_quantum(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse from a JSON fragment; missing fields take defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Bounded worker wait.
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sleep-queue scan period.
    #[inline]
    pub fn sleep_scan_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_scan_ms)
    }

    /// Reset retry budget.
    #[inline]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}
