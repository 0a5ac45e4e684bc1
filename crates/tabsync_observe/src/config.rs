//! Configuration for the coordination layer.

use crate::error::{ObserveError, ObserveResult};
use std::time::Duration;

/// Timing and sizing configuration for one coordinator.
///
/// Two presets exist: [`ObserveConfig::default`] for short-lived browser-like
/// hosts and [`ObserveConfig::desktop`] for long-running processes, which
/// tolerate longer stalls and hibernate when idle.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tabsync_observe::ObserveConfig;
///
/// let config = ObserveConfig::default()
///     .with_node_timeout(Duration::from_secs(10))
///     .with_heartbeat_interval(Duration::from_secs(9));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ObserveConfig {
    /// A node whose last heartbeat is older than this is considered stale.
    pub node_timeout: Duration,
    /// Extra wait after first marking a node stale before deleting it.
    pub grace_period: Duration,
    /// Base interval of the poll loop.
    pub poll_interval: Duration,
    /// Interval of the heartbeat loop. Must be shorter than `node_timeout`.
    pub heartbeat_interval: Duration,
    /// Random extra delay added to each poll, as a fraction of
    /// `poll_interval` (0.5 means up to 50%).
    pub poll_jitter: f64,
    /// Maximum number of change records per delivered batch.
    pub batch_limit: usize,
    /// When set, an idle poll loop sleeps `multiplier × poll_interval`.
    pub hibernate_multiplier: Option<u32>,
    /// How long [`ReplyHandle::wait`](crate::ReplyHandle::wait) waits.
    pub reply_timeout: Duration,
}

impl ObserveConfig {
    /// Preset for long-running desktop processes.
    #[must_use]
    pub fn desktop() -> Self {
        Self {
            node_timeout: Duration::from_secs(25),
            grace_period: Duration::from_secs(23),
            heartbeat_interval: Duration::from_secs(24),
            hibernate_multiplier: Some(60),
            ..Self::default()
        }
    }

    /// Sets the node timeout.
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Sets the grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the poll jitter fraction.
    #[must_use]
    pub fn with_poll_jitter(mut self, jitter: f64) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Sets the batch limit.
    #[must_use]
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Enables or disables idle hibernation.
    #[must_use]
    pub fn with_hibernation(mut self, multiplier: Option<u32>) -> Self {
        self.hibernate_multiplier = multiplier;
        self
    }

    /// Sets the intercomm reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Checks that the values can work together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the heartbeat interval is not shorter than
    /// the node timeout, the batch limit is zero, or the jitter is outside
    /// `0.0..=1.0`.
    pub fn validate(&self) -> ObserveResult<()> {
        if self.heartbeat_interval >= self.node_timeout {
            return Err(ObserveError::invalid_config(format!(
                "heartbeat interval {:?} must be shorter than node timeout {:?}",
                self.heartbeat_interval, self.node_timeout
            )));
        }
        if self.batch_limit == 0 {
            return Err(ObserveError::invalid_config("batch limit must be positive"));
        }
        if !(0.0..=1.0).contains(&self.poll_jitter) {
            return Err(ObserveError::invalid_config(format!(
                "poll jitter {} must be within 0.0..=1.0",
                self.poll_jitter
            )));
        }
        Ok(())
    }

    /// Returns how long an idle poll loop may sleep.
    #[must_use]
    pub fn hibernate_interval(&self) -> Option<Duration> {
        self.hibernate_multiplier
            .map(|m| self.poll_interval.saturating_mul(m))
    }
}

impl Default for ObserveConfig {
    fn default() -> Self {
        let node_timeout = Duration::from_secs(5);
        Self {
            node_timeout,
            grace_period: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: node_timeout - Duration::from_secs(1),
            poll_jitter: 0.5,
            batch_limit: 1000,
            hibernate_multiplier: None,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ObserveConfig::default();
        assert_eq!(config.node_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(4));
        assert_eq!(config.batch_limit, 1000);
        assert!(config.hibernate_interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn desktop_preset() {
        let config = ObserveConfig::desktop();
        assert_eq!(config.node_timeout, Duration::from_secs(25));
        assert_eq!(config.grace_period, Duration::from_secs(23));
        assert_eq!(config.hibernate_interval(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let config = ObserveConfig::default().with_heartbeat_interval(Duration::from_secs(5));
        assert!(matches!(
            config.validate(),
            Err(ObserveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_batch_and_bad_jitter() {
        assert!(ObserveConfig::default().with_batch_limit(0).validate().is_err());
        assert!(ObserveConfig::default().with_poll_jitter(1.5).validate().is_err());
    }
}
