//! Engine configuration.

use rustkit_common::{Result, RustKitError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`ServiceWorkerJobs`](crate::ServiceWorkerJobs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Name of the engine sequence thread.
    pub thread_name: String,

    /// URL schemes treated as potentially trustworthy in addition to https/wss,
    /// loopback hosts and `file:`.
    pub trusted_schemes: Vec<String>,

    /// A registration is stale once its last update check is older than this.
    pub registration_stale_after_secs: u64,

    /// Upper bound on waiting for a worker to start. `None` waits indefinitely.
    pub worker_start_timeout_ms: Option<u64>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            thread_name: "ServiceWorkerJobs".to_string(),
            trusted_schemes: vec!["h5vcc-embedded".to_string()],
            registration_stale_after_secs: 86_400,
            worker_start_timeout_ms: None,
        }
    }
}

impl JobsConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RustKitError::config_with_source("invalid service worker jobs config", e))
    }

    pub fn registration_stale_after(&self) -> Duration {
        Duration::from_secs(self.registration_stale_after_secs)
    }

    pub fn worker_start_timeout(&self) -> Option<Duration> {
        self.worker_start_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_worker_start_timeout(mut self, timeout: Duration) -> Self {
        self.worker_start_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn is_trusted_scheme(&self, scheme: &str) -> bool {
        self.trusted_schemes
            .iter()
            .any(|trusted| trusted.eq_ignore_ascii_case(scheme))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.thread_name, "ServiceWorkerJobs");
        assert!(config.is_trusted_scheme("h5vcc-embedded"));
        assert_eq!(config.registration_stale_after(), Duration::from_secs(86_400));
        assert_eq!(config.worker_start_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = JobsConfig::from_json_str(r#"{"worker_start_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.worker_start_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.trusted_schemes, vec!["h5vcc-embedded".to_string()]);
    }

    #[test]
    fn test_start_timeout_saturates() {
        let config = JobsConfig::default().with_worker_start_timeout(Duration::MAX);
        assert_eq!(config.worker_start_timeout_ms, Some(u64::MAX));

        let config = JobsConfig::default().with_worker_start_timeout(Duration::from_millis(75));
        assert_eq!(config.worker_start_timeout(), Some(Duration::from_millis(75)));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = JobsConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
