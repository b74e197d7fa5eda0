// Tunable parameters for a client session.
//
// Every timing constant and queue bound the engine uses lives in
// `ClientConfig`. Defaults match the relay's reference client; a JSON file
// (or string) can override any subset of fields thanks to `#[serde(default)]`.
//
// See also: `scheduler.rs` for how the starvation budget and thresholds are
// applied, `heartbeat.rs` for the ping and liveness intervals.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// What to do when a send queue is already at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new frame; its callback reports `QueueFull`.
    #[default]
    Reject,
    /// Evict the oldest queued frame (its callback reports `QueueFull`) and
    /// accept the new one.
    DropOldest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Frames per priority queue.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,

    /// Starvation budget the scheduler starts from and resets to.
    pub initial_starvation_budget: u32,
    /// State-update frames are served only while the budget is above this.
    pub state_update_threshold: u32,
    /// Reliable frames are served only while the budget is above this.
    pub reliable_threshold: u32,

    pub ping_interval_ms: u64,
    pub liveness_check_interval_ms: u64,
    /// How long without a heartbeat echo before the session counts as
    /// disconnected.
    pub liveness_grace_ms: u64,
    pub liveness_timeout_enabled: bool,

    /// Socket read timeout. Bounds how long a worker loop can go without
    /// noticing cancellation.
    pub poll_interval_ms: u64,
    /// How long `disconnect` waits for each worker loop before detaching it.
    pub shutdown_join_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            overflow_policy: OverflowPolicy::Reject,
            initial_starvation_budget: 8,
            state_update_threshold: 5,
            reliable_threshold: 3,
            ping_interval_ms: 5000,
            liveness_check_interval_ms: 3000,
            liveness_grace_ms: 15_000,
            liveness_timeout_enabled: true,
            poll_interval_ms: 100,
            shutdown_join_timeout_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(ClientError::Config)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_millis(self.liveness_grace_ms)
    }

    /// Never zero: a zero socket timeout means "block forever" to std.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_timeout_ms)
    }
}
