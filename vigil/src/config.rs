//! Monitor configuration.
//!
//! Durations are plain millisecond counts so the JSON file stays flat. For
//! the signed settings `-1` means "disabled" (or "unlimited" for the event
//! cap); any other negative value is replaced by its default with a warning.

use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use vigil_common::{
    DEFAULT_MAX_TRACE_EVENTS_PER_OPERATION, DEFAULT_SCHEDULER_PERIOD_MILLIS,
    DEFAULT_STACK_TRACE_INITIAL_DELAY_MILLIS, DEFAULT_STACK_TRACE_PERIOD_MILLIS,
    DEFAULT_STUCK_THRESHOLD_MILLIS, DEFAULT_THRESHOLD_MILLIS, DEFAULT_TRACE_PREFIX_CAPACITY,
    DEFAULT_TRACE_SUFFIX_CAPACITY,
};

use crate::domain::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// New operations are not monitored while `false`.
    pub enabled: bool,
    /// Completed operations at least this long are collected.
    pub threshold_millis: i64,
    /// Active operations at least this long are reported stuck, once.
    pub stuck_threshold_millis: i64,
    pub stack_trace_initial_delay_millis: i64,
    /// `0` samples on every scheduler tick.
    pub stack_trace_period_millis: i64,
    pub max_trace_events_per_operation: i64,
    pub warn_on_trace_event_outside_operation: bool,
    pub scheduler_period_millis: u64,
    pub trace_prefix_capacity: usize,
    pub trace_suffix_capacity: usize,
    /// Also merge every sample into the monitor-wide hotspot tree.
    pub global_hotspots: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_millis: DEFAULT_THRESHOLD_MILLIS,
            stuck_threshold_millis: DEFAULT_STUCK_THRESHOLD_MILLIS,
            stack_trace_initial_delay_millis: DEFAULT_STACK_TRACE_INITIAL_DELAY_MILLIS,
            stack_trace_period_millis: DEFAULT_STACK_TRACE_PERIOD_MILLIS,
            max_trace_events_per_operation: DEFAULT_MAX_TRACE_EVENTS_PER_OPERATION,
            warn_on_trace_event_outside_operation: false,
            scheduler_period_millis: DEFAULT_SCHEDULER_PERIOD_MILLIS,
            trace_prefix_capacity: DEFAULT_TRACE_PREFIX_CAPACITY,
            trace_suffix_capacity: DEFAULT_TRACE_SUFFIX_CAPACITY,
            global_hotspots: false,
        }
    }
}

/// `-1` (or any negative) disables the setting.
fn millis_setting(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}

fn sanitize_signed(name: &str, value: i64, default: i64) -> i64 {
    if value < -1 {
        warn!("Invalid {name} {value}, using default {default}");
        default
    } else {
        value
    }
}

impl MonitorConfig {
    /// Load a JSON config file; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed { path: display.clone(), source })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|source| ConfigError::ParseFailed { path: display, source })?;
        Ok(config.sanitized())
    }

    /// Replace out-of-range values by their defaults.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.threshold_millis =
            sanitize_signed("thresholdMillis", self.threshold_millis, defaults.threshold_millis);
        self.stuck_threshold_millis = sanitize_signed(
            "stuckThresholdMillis",
            self.stuck_threshold_millis,
            defaults.stuck_threshold_millis,
        );
        self.stack_trace_initial_delay_millis = sanitize_signed(
            "stackTraceInitialDelayMillis",
            self.stack_trace_initial_delay_millis,
            defaults.stack_trace_initial_delay_millis,
        );
        self.stack_trace_period_millis = sanitize_signed(
            "stackTracePeriodMillis",
            self.stack_trace_period_millis,
            defaults.stack_trace_period_millis,
        );
        self.max_trace_events_per_operation = sanitize_signed(
            "maxTraceEventsPerOperation",
            self.max_trace_events_per_operation,
            defaults.max_trace_events_per_operation,
        );
        if self.scheduler_period_millis == 0 {
            warn!("schedulerPeriodMillis must be positive, using default");
            self.scheduler_period_millis = defaults.scheduler_period_millis;
        }
        self
    }

    #[must_use]
    pub fn threshold(&self) -> Option<Duration> {
        millis_setting(self.threshold_millis)
    }

    #[must_use]
    pub fn stuck_threshold(&self) -> Option<Duration> {
        millis_setting(self.stuck_threshold_millis)
    }

    #[must_use]
    pub fn stack_trace_initial_delay(&self) -> Option<Duration> {
        millis_setting(self.stack_trace_initial_delay_millis)
    }

    #[must_use]
    pub fn stack_trace_period(&self) -> Option<Duration> {
        millis_setting(self.stack_trace_period_millis)
    }

    /// Delay and period, when stack sampling is enabled.
    #[must_use]
    pub fn stack_sampling(&self) -> Option<(Duration, Duration)> {
        self.stack_trace_initial_delay().zip(self.stack_trace_period())
    }

    /// `None` means unlimited.
    #[must_use]
    pub fn max_trace_events(&self) -> Option<usize> {
        usize::try_from(self.max_trace_events_per_operation).ok()
    }

    #[must_use]
    pub fn scheduler_period(&self) -> Duration {
        Duration::from_millis(self.scheduler_period_millis.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.threshold(), Some(Duration::from_secs(3)));
        assert_eq!(config.stuck_threshold(), Some(Duration::from_secs(180)));
        assert_eq!(
            config.stack_sampling(),
            Some((Duration::from_secs(5), Duration::from_secs(1)))
        );
        assert_eq!(config.max_trace_events(), Some(2000));
    }

    #[test]
    fn test_minus_one_disables() {
        let config = MonitorConfig {
            threshold_millis: -1,
            stuck_threshold_millis: -1,
            stack_trace_period_millis: -1,
            max_trace_events_per_operation: -1,
            ..MonitorConfig::default()
        };
        assert_eq!(config.threshold(), None);
        assert_eq!(config.stuck_threshold(), None);
        assert_eq!(config.stack_sampling(), None);
        assert_eq!(config.max_trace_events(), None);
    }

    #[test]
    fn test_sanitized_replaces_invalid_values() {
        let config = MonitorConfig {
            threshold_millis: -7,
            scheduler_period_millis: 0,
            stack_trace_period_millis: 0,
            ..MonitorConfig::default()
        }
        .sanitized();
        assert_eq!(config.threshold_millis, DEFAULT_THRESHOLD_MILLIS);
        assert_eq!(config.scheduler_period_millis, DEFAULT_SCHEDULER_PERIOD_MILLIS);
        assert_eq!(config.stack_trace_period_millis, 0);
    }

    #[test]
    fn test_zero_stack_trace_period_samples_every_tick() {
        let config = MonitorConfig {
            stack_trace_initial_delay_millis: 0,
            stack_trace_period_millis: 0,
            ..MonitorConfig::default()
        }
        .sanitized();
        assert_eq!(config.stack_sampling(), Some((Duration::ZERO, Duration::ZERO)));
    }

    #[test]
    fn test_from_file_fills_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"thresholdMillis": 50, "stuckThresholdMillis": -1}}"#).unwrap();

        let config = MonitorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.threshold(), Some(Duration::from_millis(50)));
        assert_eq!(config.stuck_threshold(), None);
        assert_eq!(config.trace_prefix_capacity, DEFAULT_TRACE_PREFIX_CAPACITY);
    }

    #[test]
    fn test_from_file_errors() {
        let missing = MonitorConfig::from_file("/nonexistent/vigil.json");
        assert!(matches!(missing, Err(ConfigError::ReadFailed { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let garbage = MonitorConfig::from_file(file.path());
        assert!(matches!(garbage, Err(ConfigError::ParseFailed { .. })));
    }
}
