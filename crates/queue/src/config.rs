//! Processor configuration, resolved once at construction.

use std::time::Duration;

use sluice_core::{check_identifier, FaultPolicy, QueueSettings, MAX_DURATION_SECS};

use crate::budget::memory_ceiling;
use crate::error::QueueError;

/// Named settings with documented defaults.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Namespace for batch keys, the lock and the health-check hook.
    /// ASCII letters, digits and `-`. Default: `sluice`.
    pub identifier: String,
    /// Wall-clock budget per pass. Default: 20s.
    pub time_limit: Duration,
    /// Lock lifetime; must exceed `time_limit`. Default: 60s.
    pub lock_ttl: Duration,
    /// Health-check interval. Default: 5 minutes.
    pub health_check_interval: Duration,
    /// Memory ceiling in bytes. Default: 32000 MiB.
    pub memory_ceiling: u64,
    /// Handling of non-fatal handler failures. Default: retry.
    pub fault_policy: FaultPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for ProcessorConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            identifier: settings.identifier.clone(),
            time_limit: Duration::from_secs(settings.time_limit_secs),
            lock_ttl: Duration::from_secs(settings.lock_ttl_secs),
            health_check_interval: Duration::from_secs(settings.health_check_interval_secs),
            memory_ceiling: memory_ceiling(settings.memory_limit.as_deref()),
            fault_policy: settings.fault_policy,
        }
    }
}

impl ProcessorConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the ceiling from shorthand such as `256M` or `-1`.
    pub fn memory_limit(mut self, limit: &str) -> Self {
        self.memory_ceiling = memory_ceiling(Some(limit));
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Name of the recurring health-check entry for this queue.
    pub fn health_check_hook(&self) -> String {
        format!("{}_health_check", self.identifier)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        check_identifier(&self.identifier)?;
        let max = Duration::from_secs(MAX_DURATION_SECS);
        for (name, value) in [
            ("time limit", self.time_limit),
            ("lock ttl", self.lock_ttl),
            ("health check interval", self.health_check_interval),
        ] {
            if value > max {
                return Err(QueueError::Config(format!("{name} ({value:?}) exceeds {max:?}")));
            }
        }
        if self.lock_ttl <= self.time_limit {
            return Err(QueueError::Config(format!(
                "lock ttl ({:?}) must exceed the pass time limit ({:?})",
                self.lock_ttl, self.time_limit
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(QueueError::Config("health check interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.identifier, "sluice");
        assert_eq!(config.time_limit, Duration::from_secs(20));
        assert_eq!(config.lock_ttl, Duration::from_secs(60));
        assert_eq!(config.health_check_interval, Duration::from_secs(300));
        assert_eq!(config.memory_ceiling, 32_000 * 1024 * 1024);
        assert_eq!(config.fault_policy, FaultPolicy::Retry);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_settings_parses_memory_limit() {
        let settings = QueueSettings {
            memory_limit: Some("256M".into()),
            ..QueueSettings::default()
        };
        assert_eq!(ProcessorConfig::from(&settings).memory_ceiling, 256 * 1024 * 1024);
    }

    #[test]
    fn ttl_not_exceeding_time_limit_is_rejected() {
        let config = ProcessorConfig::new("q")
            .time_limit(Duration::from_secs(30))
            .lock_ttl(Duration::from_secs(30));
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn overlapping_identifiers_are_rejected() {
        // Every batch key of a queue named `a_batch` would start with `a_batch_`.
        assert!(matches!(ProcessorConfig::new("a_batch").validate(), Err(QueueError::Config(_))));
        assert!(ProcessorConfig::new("a-batch").validate().is_ok());
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let config = ProcessorConfig::new("q").lock_ttl(Duration::MAX);
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));

        let config = ProcessorConfig::new("q").health_check_interval(Duration::from_secs(u64::MAX));
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn hook_name_is_namespaced() {
        assert_eq!(ProcessorConfig::new("mail").health_check_hook(), "mail_health_check");
    }
}
