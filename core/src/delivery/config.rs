// Retry policy for the delivery queue

use super::DeliveryError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempts before an item is marked failed
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Wait after the n-th failed attempt (n = 1..=5)
pub const RETRY_DELAYS_MS: [u64; 5] = [1_000, 2_000, 4_000, 8_000, 16_000];

/// Wait used once the schedule above runs out
pub const FALLBACK_DELAY_MS: u64 = 30_000;

/// Period of the background processing pass
pub const PROCESS_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    pub max_retry_attempts: u32,
    pub retry_delays_ms: Vec<u64>,
    pub fallback_delay_ms: u64,
    pub process_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            retry_delays_ms: RETRY_DELAYS_MS.to_vec(),
            fallback_delay_ms: FALLBACK_DELAY_MS,
            process_interval_ms: PROCESS_INTERVAL_MS,
        }
    }
}

impl DeliveryConfig {
    /// Delay in millis before the next attempt, given the retry count
    /// *after* the failure was recorded (1 for the first failure).
    pub fn backoff_for(&self, retry_count: u32) -> u64 {
        let index = retry_count.saturating_sub(1) as usize;
        self.retry_delays_ms
            .get(index)
            .copied()
            .unwrap_or(self.fallback_delay_ms)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.max_retry_attempts == 0 {
            return Err(DeliveryError::InvalidConfig(
                "maxRetryAttempts must be at least 1".into(),
            ));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(DeliveryError::InvalidConfig(
                "retryDelaysMs must not be empty".into(),
            ));
        }
        if self.process_interval_ms == 0 {
            return Err(DeliveryError::InvalidConfig(
                "processIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }
}
