use std::time::Duration;

use super::RetryPolicy;
use crate::error::DiscoveryError;

/// 指数退避：`base * 2^attempt`，不超过 `max_delay`
///
/// etcd lease 丢失后的重新注册使用它，`max_delay` 取 lease TTL。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
