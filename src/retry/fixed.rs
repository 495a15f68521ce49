use std::time::Duration;

use super::RetryPolicy;
use crate::error::DiscoveryError;

/// 固定间隔重试，etcd watch 流重建使用
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
