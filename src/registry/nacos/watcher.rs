//! Nacos watcher：把订阅回调桥接成阻塞的 `next()`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::{NacosInstance, NamingClient, SelectInstancesParam, SubscribeCallback, SubscribeParam};
use super::to_service_instances;
use crate::error::{DiscoveryError, Result};
use crate::registry::instance::ServiceInstance;
use crate::registry::trait_def::Watcher;

/// Nacos watcher
///
/// 回调只往容量为 1 的通道里放一个信号，`next()` 收到信号后重新查询，
/// 返回的总是实时查询结果。
pub struct NacosWatcher {
    client: Arc<dyn NamingClient>,
    service_name: String,
    group: String,
    clusters: Vec<String>,
    kind: String,
    subscription: u64,
    event: Mutex<mpsc::Receiver<()>>,
    cancel: CancellationToken,
    unsubscribed: AtomicBool,
}

impl NacosWatcher {
    pub async fn new(
        client: Arc<dyn NamingClient>,
        service_name: &str,
        group: &str,
        clusters: Vec<String>,
        kind: &str,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        let callback: SubscribeCallback = Arc::new(move |_: &[NacosInstance]| {
            // 已有待读信号时丢弃
            let _ = tx.try_send(());
        });

        let subscription = client
            .subscribe(
                SubscribeParam {
                    service_name: service_name.to_string(),
                    group_name: group.to_string(),
                    clusters: clusters.clone(),
                },
                callback,
            )
            .await?;

        Ok(Self {
            client,
            service_name: service_name.to_string(),
            group: group.to_string(),
            clusters,
            kind: kind.to_string(),
            subscription,
            event: Mutex::new(rx),
            cancel: CancellationToken::new(),
            unsubscribed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Watcher for NacosWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::WatcherStopped);
        }

        let mut event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
            event = self.event.lock() => event,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
            signal = event.recv() => {
                if signal.is_none() {
                    return Err(DiscoveryError::WatcherStopped);
                }
            }
        }

        let query = SelectInstancesParam {
            service_name: self.service_name.clone(),
            group_name: self.group.clone(),
            clusters: self.clusters.clone(),
            healthy_only: true,
        };
        let instances = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::WatcherStopped),
            result = self.client.select_instances(query) => result?,
        };
        Ok(to_service_instances(instances, &self.kind))
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Ok(mut event) = self.event.try_lock() {
            event.close();
        }
        if !self.unsubscribed.swap(true, Ordering::AcqRel) {
            self.client.unsubscribe(self.subscription).await?;
            debug!(service_name = %self.service_name, "nacos watcher stopped");
        }
        Ok(())
    }
}

impl Drop for NacosWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.unsubscribed.swap(true, Ordering::AcqRel) {
            let client = Arc::clone(&self.client);
            let subscription = self.subscription;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = client.unsubscribe(subscription).await;
                });
            }
        }
    }
}
