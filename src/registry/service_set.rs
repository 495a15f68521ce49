//! 服务集合：单个服务名的快照缓存与扇出广播
//!
//! 后台发现循环是快照的唯一写入者；每个 watcher 持有一个容量为 1 的信号通道，
//! 广播时非阻塞写入，通道已满说明已有待读信号，直接跳过即可。
//! watcher 收到信号后总是读取最新快照，因此同一 watcher 不会看到比已读更旧的数据。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::instance::ServiceInstance;
use super::trait_def::Watcher;
use crate::error::{DiscoveryError, Result};

/// 单个服务名的快照 + 订阅者集合
pub struct ServiceSet {
    service_name: String,
    /// 读取无需加锁
    services: ArcSwap<Vec<ServiceInstance>>,
    /// 订阅者集合，增删需持锁
    watchers: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_watcher_id: AtomicU64,
    /// 请求发现循环立即刷新
    refresh: Notify,
}

impl ServiceSet {
    pub fn new(service_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.into(),
            services: ArcSwap::from_pointee(Vec::new()),
            watchers: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(0),
            refresh: Notify::new(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.services.load_full()
    }

    /// 替换快照并通知所有订阅者
    pub fn broadcast(&self, services: Vec<ServiceInstance>) {
        self.services.store(Arc::new(services));

        let watchers = self.lock_watchers();
        for event in watchers.values() {
            // 通道满时已有未读信号，无需重复
            let _ = event.try_send(());
        }
        tracing::debug!(
            service_name = %self.service_name,
            watchers = watchers.len(),
            "service set broadcast"
        );
    }

    /// 新增订阅者
    ///
    /// 已有非空快照时立即放入一个信号，避免新 watcher 一直等到下一次变化。
    pub fn subscribe(self: &Arc<Self>, cancel: CancellationToken) -> SetWatcher {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.lock_watchers().insert(id, tx.clone());

        if !self.snapshot().is_empty() {
            let _ = tx.try_send(());
        }

        SetWatcher {
            id,
            set: Arc::clone(self),
            event: tokio::sync::Mutex::new(rx),
            cancel,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_watchers().remove(&id);
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.lock_watchers().len()
    }

    /// 请求发现循环跳过当前等待，立即查询一次
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// 等待刷新请求
    pub async fn refresh_requested(&self) {
        self.refresh.notified().await
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<()>>> {
        // 持锁期间不会 panic，中毒时直接取回数据
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 基于 [`ServiceSet`] 的 watcher
pub struct SetWatcher {
    id: u64,
    set: Arc<ServiceSet>,
    event: tokio::sync::Mutex<mpsc::Receiver<()>>,
    cancel: CancellationToken,
}

impl SetWatcher {
    pub fn service_name(&self) -> &str {
        self.set.service_name()
    }
}

#[async_trait]
impl Watcher for SetWatcher {
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
            _ = self.cancel.cancelled() => Err(DiscoveryError::WatcherStopped),
            signal = event.recv() => match signal {
                Some(()) => Ok(self.set.snapshot().as_ref().clone()),
                None => Err(DiscoveryError::WatcherStopped),
            },
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.set.unsubscribe(self.id);
        Ok(())
    }
}

impl Drop for SetWatcher {
    fn drop(&mut self) {
        self.set.unsubscribe(self.id);
    }
}
