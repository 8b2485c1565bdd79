//! Engine configuration types for Wayflow.
//!
//! `EngineConfig` represents `wayflow.toml`, controlling scheduler timing,
//! per-session concurrency and the session pool's spawn queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Loaded from `~/.wayflow/wayflow.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the session ticker re-checks delayed states, in milliseconds.
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,

    /// Maximum number of steps of one session executing at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Capacity of the session pool's spawn request queue.
    #[serde(default = "default_spawn_queue_capacity")]
    pub spawn_queue_capacity: usize,

    /// Trace every session, regardless of the workflow's own trace flag.
    #[serde(default)]
    pub trace: bool,

    /// Default retention for finished sessions, in seconds (0 = forever).
    #[serde(default)]
    pub keep_sessions_secs: u64,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_worker_interval_ms() -> u64 {
    250
}

fn default_max_workers() -> usize {
    16
}

fn default_spawn_queue_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_interval_ms: default_worker_interval_ms(),
            max_workers: default_max_workers(),
            spawn_queue_capacity: default_spawn_queue_capacity(),
            trace: false,
            keep_sessions_secs: 0,
            otel: false,
        }
    }
}

impl EngineConfig {
    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_interval_ms, 250);
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.spawn_queue_capacity, 64);
        assert!(!config.trace);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
worker_interval_ms = 10
max_workers = 4
trace = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_interval(), Duration::from_millis(10));
        assert_eq!(config.max_workers, 4);
        assert!(config.trace);
        assert_eq!(config.spawn_queue_capacity, 64);
    }

    #[test]
    fn test_worker_interval_never_zero() {
        let config = EngineConfig {
            worker_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.worker_interval(), Duration::from_millis(1));
    }
}
