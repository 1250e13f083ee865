//! Manager configuration.
//!
//! Configuration can be built in code or loaded from environment variables
//! with sensible defaults.

use crate::error::{Error, Result};
use std::time::Duration;

/// Host addressed when none is configured (the local machine).
pub const DEFAULT_HOST: &str = ".";

/// The Hyper-V management namespace.
pub const DEFAULT_NAMESPACE: &str = r"root\virtualization\v2";

/// Backoff schedule for job polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before the second poll.
    /// Default: 50 ms
    pub initial_interval: Duration,
    /// Upper bound on the delay between polls.
    /// Default: 1 second
    pub max_interval: Duration,
    /// Growth factor applied after every poll.
    /// Default: 2
    pub multiplier: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl PollConfig {
    /// Delay to use after waiting `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll initial interval must be > 0".into(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(Error::InvalidConfig(
                "poll max interval must be >= initial interval".into(),
            ));
        }
        if self.multiplier == 0 {
            return Err(Error::InvalidConfig("poll multiplier must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for a [`Manager`](crate::Manager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Host running the management service (default: `.`).
    pub host: String,
    /// Management namespace (default: `root\virtualization\v2`).
    pub namespace: String,
    /// Job polling backoff.
    pub poll: PollConfig,
    /// Deadline for any single job; `None` waits indefinitely.
    pub job_timeout: Option<Duration>,
    /// Logical processors assumed for the CPU sanity check; `None` counts
    /// the local machine's.
    pub host_processors: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll: PollConfig::default(),
            job_timeout: None,
            host_processors: None,
        }
    }
}

impl ManagerConfig {
    /// Create a new config builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `HALYARD_HOST` | `.` |
    /// | `HALYARD_NAMESPACE` | `root\virtualization\v2` |
    /// | `HALYARD_POLL_INITIAL_MS` | `50` |
    /// | `HALYARD_POLL_MAX_MS` | `1000` |
    /// | `HALYARD_JOB_TIMEOUT_SECS` | unset |
    /// | `HALYARD_HOST_PROCESSORS` | unset |
    pub fn from_env() -> Self {
        let default = Self::default();

        let initial_interval = std::env::var("HALYARD_POLL_INITIAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.poll.initial_interval);

        let max_interval = std::env::var("HALYARD_POLL_MAX_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.poll.max_interval);

        Self {
            host: std::env::var("HALYARD_HOST").unwrap_or(default.host),
            namespace: std::env::var("HALYARD_NAMESPACE").unwrap_or(default.namespace),
            poll: PollConfig {
                initial_interval,
                max_interval,
                ..default.poll
            },
            job_timeout: std::env::var("HALYARD_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            host_processors: std::env::var("HALYARD_HOST_PROCESSORS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host is required".into()));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::InvalidConfig("namespace is required".into()));
        }
        self.poll.validate()?;
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig("job timeout must be > 0".into()));
        }
        if self.host_processors == Some(0) {
            return Err(Error::InvalidConfig("host processors must be > 0".into()));
        }
        Ok(())
    }

    /// Logical processors the CPU sanity check compares against.
    pub fn available_processors(&self) -> usize {
        self.host_processors.unwrap_or_else(num_cpus::get)
    }
}

/// Builder for ManagerConfig.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the management host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the management namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the job polling backoff bounds.
    pub fn poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.config.poll.initial_interval = initial;
        self.config.poll.max_interval = max;
        self
    }

    /// Set the deadline for any single job.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = Some(timeout);
        self
    }

    /// Override the host's logical processor count.
    pub fn host_processors(mut self, count: usize) -> Self {
        self.config.host_processors = Some(count);
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.host, ".");
        assert_eq!(config.namespace, r"root\virtualization\v2");
        assert_eq!(config.poll.initial_interval, Duration::from_millis(50));
        assert_eq!(config.poll.max_interval, Duration::from_secs(1));
        assert!(config.job_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let poll = PollConfig::default();
        let mut interval = poll.initial_interval;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(interval.as_millis());
            interval = poll.next_interval(interval);
        }
        assert_eq!(seen, [50, 100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_builder_success() {
        let config = ManagerConfig::builder()
            .host("HV01")
            .poll_interval(Duration::from_millis(10), Duration::from_millis(200))
            .job_timeout(Duration::from_secs(30))
            .host_processors(16)
            .build()
            .expect("should build successfully");

        assert_eq!(config.host, "HV01");
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.available_processors(), 16);
    }

    #[test]
    fn test_builder_validation() {
        assert!(ManagerConfig::builder().host("").build().is_err());
        assert!(ManagerConfig::builder().namespace(" ").build().is_err());
        assert!(ManagerConfig::builder()
            .poll_interval(Duration::ZERO, Duration::from_secs(1))
            .build()
            .is_err());
        assert!(ManagerConfig::builder()
            .poll_interval(Duration::from_secs(2), Duration::from_secs(1))
            .build()
            .is_err());
        assert!(ManagerConfig::builder()
            .job_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ManagerConfig::builder().host_processors(0).build().is_err());
    }

    #[test]
    fn test_available_processors_defaults_to_host() {
        assert_eq!(
            ManagerConfig::default().available_processors(),
            num_cpus::get()
        );
    }

    #[test]
    fn test_from_env_uses_defaults() {
        std::env::remove_var("HALYARD_HOST");
        std::env::remove_var("HALYARD_NAMESPACE");
        std::env::remove_var("HALYARD_POLL_INITIAL_MS");
        std::env::remove_var("HALYARD_POLL_MAX_MS");
        std::env::remove_var("HALYARD_JOB_TIMEOUT_SECS");
        std::env::remove_var("HALYARD_HOST_PROCESSORS");

        let config = ManagerConfig::from_env();
        assert_eq!(config, ManagerConfig::default());
    }
}
