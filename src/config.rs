//! Supervision settings for the tail coordinator.

use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Restart and health settings applied by [`TailCoordinator`].
///
/// Every field has a default, so a TOML document only needs to name the
/// values it overrides:
///
/// ```
/// let config = filetail::TailConfig::from_toml_str("max_retries = 5").unwrap();
/// assert_eq!(config.max_retries, 5);
/// assert_eq!(config.backoff_base_ms, 100);
/// ```
///
/// [`TailCoordinator`]: crate::TailCoordinator
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TailConfig {
    /// Consecutive restarts allowed before a path is abandoned.
    pub max_retries: u32,
    /// A failure this long after the previous one starts a fresh budget.
    pub retry_window_ms: u64,
    /// Delay before the first restart; doubled on each further attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the restart delay.
    pub backoff_max_ms: u64,
    /// Time spent watching after which the retry counter resets.
    pub healthy_dwell_ms: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig {
            max_retries: 3,
            retry_window_ms: 30_000,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            healthy_dwell_ms: 5_000,
        }
    }
}

impl TailConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: TailConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.healthy_dwell_ms == 0 {
            return Err(Error::InvalidConfig(
                "healthy_dwell_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub(crate) fn healthy_dwell(&self) -> Duration {
        Duration::from_millis(self.healthy_dwell_ms)
    }

    /// Delay before restart number `attempt` (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TailConfig::from_toml_str("").unwrap();
        assert_eq!(config, TailConfig::default());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_overrides() {
        let config = TailConfig::from_toml_str(
            r#"
            max_retries = 1
            backoff_base_ms = 10
            backoff_max_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff_base_ms, 10);
        assert_eq!(config.healthy_dwell_ms, 5_000);
    }

    #[test]
    fn test_rejects_unknown_and_invalid() {
        assert!(matches!(
            TailConfig::from_toml_str("max_retires = 2"),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            TailConfig::from_toml_str("backoff_base_ms = 10\nbackoff_max_ms = 5"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            TailConfig::from_toml_str("healthy_dwell_ms = 0"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = TailConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..TailConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(config.backoff(60), Duration::from_millis(350));
    }
}
