//! Heartbeat cadence configuration. The actual loop lives on `NodeManager`
//! (it needs direct access to the connection counter and metrics collector);
//! this module is the knob the CLI/config layer tunes it through.

use std::time::Duration;

/// Tunable heartbeat cadence. `ttl_secs` should stay a small multiple of
/// `interval_secs` so a handful of missed beats are tolerated before a node
/// is considered gone, without leaving long-dead nodes in the directory.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl HeartbeatConfig {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            ttl_secs: interval_secs * 3,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(super::manager::HEARTBEAT_INTERVAL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_three_times_interval_by_default() {
        let config = HeartbeatConfig::new(30);
        assert_eq!(config.ttl_secs, 90);
    }
}
