//! 重试策略模块
//!
//! etcd watch 重建、lease 续期失败后的重新注册都通过这里决定是否继续重试以及退避时长。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}

/// 等待 `duration`，期间被取消则返回 `false`
pub async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
