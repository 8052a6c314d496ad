//! Synchronization configuration.

use std::time::Duration;

/// Configuration for the block synchronization core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the scheduler tick.
    pub tick_period: Duration,
    /// Linear ancestor probes before falling back to binary search.
    pub linear_ancestor_window: u32,
    /// Blocks fetched per request (the download window).
    pub blocks_per_request: u32,
    /// Maximum successful probes per measurement phase.
    pub candidates_per_measurement: usize,
    /// Ceiling on the exponential remeasurement backoff.
    pub max_measurement_delta: Duration,
    /// First remeasurement delay; doubles after each measurement phase.
    pub initial_measurement_delta: Duration,
    /// If non-empty, only peers with these display names are sync candidates.
    pub peer_allowlist: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(10),
            linear_ancestor_window: 3,
            blocks_per_request: 20,
            candidates_per_measurement: 8,
            max_measurement_delta: Duration::from_secs(60 * 60),
            initial_measurement_delta: Duration::from_secs(120),
            peer_allowlist: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Remeasurement delay after `phases` completed measurement phases.
    ///
    /// Doubles per phase, capped at `max_measurement_delta`.
    pub fn measurement_backoff(&self, phases: u32) -> Duration {
        let doublings = phases.saturating_sub(1).min(31);
        self.initial_measurement_delta
            .saturating_mul(1u32 << doublings)
            .min(self.max_measurement_delta)
    }

    /// Whether a peer passes the optional display-name allowlist.
    pub fn allows_peer(&self, display_name: &str) -> bool {
        self.peer_allowlist.is_empty() || self.peer_allowlist.iter().any(|n| n == display_name)
    }
}
