//! Runtime knobs for the dynamic cache, read from `ORKA_*` environment variables.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total attempts for a cached Get (first try included).
    pub get_attempts: u32,
    /// Fixed gap between Get attempts.
    pub get_retry_delay: Duration,
    /// Capacity of each watcher's event queue; also bounds a single coalesced batch.
    pub event_queue_cap: usize,
    /// Upper bound on the bootstrap sync wait. `None` waits until shutdown.
    pub sync_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            get_attempts: 3,
            get_retry_delay: Duration::from_secs(1),
            event_queue_cap: 2048,
            sync_timeout: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            get_attempts: env_parse::<u32>("ORKA_GET_ATTEMPTS").unwrap_or(d.get_attempts).max(1),
            get_retry_delay: env_parse::<u64>("ORKA_GET_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.get_retry_delay),
            event_queue_cap: env_parse::<usize>("ORKA_EVENT_QUEUE_CAP").unwrap_or(d.event_queue_cap).max(1),
            sync_timeout: env_parse::<u64>("ORKA_SYNC_TIMEOUT_SECS").map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_get_budget() {
        let c = CacheConfig::default();
        assert_eq!(c.get_attempts, 3);
        assert_eq!(c.get_retry_delay, Duration::from_secs(1));
        assert!(c.sync_timeout.is_none());
    }
}
