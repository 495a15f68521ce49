//! etcd 前缀 watcher
//!
//! 每批事件都重新读取整个前缀，而不是逐条应用 put/delete，
//! 这样即使 revision 被压缩或漏掉事件，拿到的也是完整列表。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::list_instances;
use super::store::{EtcdStore, WatchEvents};
use crate::error::{DiscoveryError, Result};
use crate::registry::instance::ServiceInstance;
use crate::registry::trait_def::Watcher;
use crate::retry::{FixedRetryPolicy, RetryPolicy, sleep_or_cancelled};

struct WatchState {
    events: Option<WatchEvents>,
    /// 第一次 `next()` 直接返回当前列表
    first: bool,
    /// 连续失败次数，收到事件后清零
    failures: usize,
    last_error: Option<DiscoveryError>,
    exhausted: bool,
}

/// etcd watcher
pub struct EtcdWatcher {
    store: Arc<dyn EtcdStore>,
    service_name: String,
    prefix: String,
    /// 流重建策略：非可重试错误直接放弃
    policy: FixedRetryPolicy,
    cancel: CancellationToken,
    state: Mutex<WatchState>,
}

impl EtcdWatcher {
    pub async fn new(
        store: Arc<dyn EtcdStore>,
        service_name: impl Into<String>,
        prefix: impl Into<String>,
        max_retry: usize,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let events = store.watch_prefix(&prefix).await?;

        Ok(Self {
            store,
            service_name: service_name.into(),
            prefix,
            policy: FixedRetryPolicy::new(max_retry, retry_interval),
            cancel,
            state: Mutex::new(WatchState {
                events: Some(events),
                first: true,
                failures: 0,
                last_error: None,
                exhausted: false,
            }),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn fetch(&self) -> Result<Vec<ServiceInstance>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DiscoveryError::WatcherStopped),
            result = list_instances(self.store.as_ref(), &self.prefix) => result,
        }
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::WatcherStopped);
        }

        let mut state = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
            state = self.state.lock() => state,
        };

        if state.exhausted {
            return Err(DiscoveryError::WatcherStopped);
        }
        if state.first {
            state.first = false;
            return self.fetch().await;
        }

        loop {
            if let Some(events) = state.events.as_mut() {
                let event = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
                    event = events.next() => event,
                };

                match event {
                    Some(Ok(())) => {
                        state.failures = 0;
                        return self.fetch().await;
                    }
                    Some(Err(e)) => {
                        warn!(
                            service_name = %self.service_name,
                            error = %e,
                            "etcd watch stream failed"
                        );
                        state.last_error = Some(e);
                    }
                    None => {
                        warn!(service_name = %self.service_name, "etcd watch stream closed");
                        state.last_error = Some(DiscoveryError::transient("watch stream closed"));
                    }
                }
                state.events = None;
                state.failures += 1;
            }

            let attempt = state.failures.saturating_sub(1);
            let error = state
                .last_error
                .clone()
                .unwrap_or_else(|| DiscoveryError::transient("watch stream closed"));
            if !self.policy.should_retry(attempt, &error) {
                state.exhausted = true;
                return Err(DiscoveryError::ExhaustedRetry {
                    service_name: self.service_name.clone(),
                    attempts: state.failures,
                    reason: error.to_string(),
                });
            }

            if !sleep_or_cancelled(&self.cancel, self.policy.backoff_duration(attempt)).await {
                return Err(DiscoveryError::WatcherStopped);
            }

            let rewatch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
                result = self.store.watch_prefix(&self.prefix) => result,
            };
            match rewatch {
                Ok(events) => {
                    info!(
                        service_name = %self.service_name,
                        failures = state.failures,
                        "🔄 etcd watch re-established"
                    );
                    state.events = Some(events);
                    // 断开期间可能漏掉事件，直接返回最新列表
                    return self.fetch().await;
                }
                Err(e) => {
                    warn!(
                        service_name = %self.service_name,
                        error = %e,
                        "failed to re-establish etcd watch"
                    );
                    state.last_error = Some(e);
                    state.failures += 1;
                }
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        // 正在 next() 的调用会自行退出并释放流
        if let Ok(mut state) = self.state.try_lock() {
            state.events = None;
        }
        Ok(())
    }
}
