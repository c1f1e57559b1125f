// ABOUTME: Engine configuration with serde support and sensible defaults
// ABOUTME: Controls default timeouts, probe polling and the label prefix

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine-wide defaults. Per-specification values take precedence where
/// the specification sets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Grace period granted to a sandbox on stop before the runtime
    /// kills it.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Upper bound on the blocking readiness wait after start.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Interval between readiness probe attempts.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Prefix for the labels the engine stamps on every sandbox.
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_ready_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_label_prefix() -> String {
    "berth.sandbox".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            label_prefix: default_label_prefix(),
        }
    }
}

impl EngineConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.label_prefix, "berth.sandbox");
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "ready_timeout_secs": 5 }"#).expect("valid config");
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }
}
