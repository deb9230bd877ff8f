//! Deadlock retry with exponential backoff
//!
//! Lock timeouts in the store surface as `Deadlock`, the one retryable
//! error. Commit, refresh, compaction and the indexer wrap their attempts
//! in [`retry_on_deadlock`], which sleeps a jittered, capped exponential
//! delay between attempts.

use itemdb_core::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Deadlock retry behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries, `None` to retry until the deadlock clears
    pub max_retries: Option<usize>,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Add up to half the delay again at random
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay_ms: 10,
            max_delay_ms: 200,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// No retries at all
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Disable jitter, making delays deterministic
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    fn sleep_for(&self, attempt: usize) -> Duration {
        let base = self.calculate_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(extra)
    }

    fn allows(&self, attempt: usize) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}

/// Run `op` until it succeeds or fails with something other than a deadlock.
///
/// `op` receives the attempt number starting at 0. `what` names the
/// operation in the retry warning.
pub fn retry_on_deadlock<T, F>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Err(e) if e.is_retryable() && config.allows(attempt) => {
                let delay = config.sleep_for(attempt);
                warn!(
                    target: "itemdb::store",
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Deadlock, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemdb_core::ItemDbError;

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(100);
        assert_eq!(config.calculate_delay(0).as_millis(), 10);
        assert_eq!(config.calculate_delay(1).as_millis(), 20);
        assert_eq!(config.calculate_delay(2).as_millis(), 40);
        assert_eq!(config.calculate_delay(3).as_millis(), 80);
        assert_eq!(config.calculate_delay(4).as_millis(), 100);
        assert_eq!(config.calculate_delay(70).as_millis(), 100);
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let config = RetryConfig::new().with_base_delay_ms(40).with_max_delay_ms(40);
        for _ in 0..50 {
            let d = config.sleep_for(0).as_millis();
            assert!((40..=60).contains(&d));
        }
    }

    #[test]
    fn test_retries_deadlocks_only() {
        let config = RetryConfig::new().with_base_delay_ms(0);
        let mut calls = 0;
        let out = retry_on_deadlock(&config, "test", |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(ItemDbError::Deadlock)
            } else {
                Ok(attempt)
            }
        })
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls, 4);

        let err = retry_on_deadlock::<(), _>(&config, "test", |_| {
            Err(ItemDbError::InvalidOperation("nope".into()))
        })
        .unwrap_err();
        assert!(matches!(err, ItemDbError::InvalidOperation(_)));
    }

    #[test]
    fn test_bounded_retries_give_up() {
        let config = RetryConfig::no_retry();
        let err = retry_on_deadlock::<(), _>(&config, "test", |_| Err(ItemDbError::Deadlock)).unwrap_err();
        assert!(err.is_retryable());
    }
}
