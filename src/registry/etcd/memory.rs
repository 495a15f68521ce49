//! 内存版 etcd，用于单元测试

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::store::{EtcdStore, WatchEvents};
use crate::error::{DiscoveryError, Result};

#[derive(Default)]
struct State {
    /// key -> (value, lease)
    kv: BTreeMap<String, (Vec<u8>, i64)>,
    /// lease -> ttl
    leases: HashMap<i64, i64>,
    next_lease: i64,
    watches: Vec<(String, mpsc::UnboundedSender<Result<()>>)>,
    failing_watches: usize,
}

impl State {
    fn notify(&mut self, key: &str) {
        self.watches
            .retain(|(prefix, tx)| !key.starts_with(prefix.as_str()) || tx.send(Ok(())).is_ok());
    }

    fn drop_lease(&mut self, lease_id: i64) {
        self.leases.remove(&lease_id);
        let expired: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, (_, lease))| *lease == lease_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.kv.remove(&key);
            self.notify(&key);
        }
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
    keep_alive_calls: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.state().kv.keys().cloned().collect()
    }

    pub(crate) fn lease_of(&self, key: &str) -> Option<i64> {
        self.state().kv.get(key).map(|(_, lease)| *lease)
    }

    pub(crate) fn lease_count(&self) -> usize {
        self.state().leases.len()
    }

    pub(crate) fn keep_alive_calls(&self) -> usize {
        self.keep_alive_calls.load(Ordering::SeqCst)
    }

    /// 模拟 lease 过期
    pub(crate) fn expire_lease(&self, lease_id: i64) {
        self.state().drop_lease(lease_id);
    }

    pub(crate) fn put_raw(&self, key: &str, value: Vec<u8>) {
        let mut state = self.state();
        state.kv.insert(key.to_string(), (value, 0));
        state.notify(key);
    }

    pub(crate) fn delete_raw(&self, key: &str) {
        let mut state = self.state();
        if state.kv.remove(key).is_some() {
            state.notify(key);
        }
    }

    /// 所有 watch 流收到一个错误后结束
    pub(crate) fn break_watches(&self, reason: &str) {
        let mut state = self.state();
        for (_, tx) in state.watches.drain(..) {
            let _ = tx.send(Err(DiscoveryError::transient(reason)));
        }
    }

    /// 接下来 `n` 次 watch 请求失败
    pub(crate) fn fail_next_watches(&self, n: usize) {
        self.state().failing_watches = n;
    }
}

#[async_trait]
impl EtcdStore for MemoryStore {
    async fn grant(&self, ttl: i64) -> Result<i64> {
        let mut state = self.state();
        state.next_lease += 1;
        let lease_id = state.next_lease;
        state.leases.insert(lease_id, ttl);
        Ok(lease_id)
    }

    async fn keep_alive(&self, lease_id: i64) -> Result<i64> {
        self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().leases.get(&lease_id).copied().unwrap_or(0))
    }

    async fn revoke(&self, lease_id: i64) -> Result<()> {
        let mut state = self.state();
        if !state.leases.contains_key(&lease_id) {
            return Err(DiscoveryError::transient("requested lease not found"));
        }
        state.drop_lease(lease_id);
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()> {
        let mut state = self.state();
        if lease_id != 0 && !state.leases.contains_key(&lease_id) {
            return Err(DiscoveryError::transient("requested lease not found"));
        }
        state.kv.insert(key.to_string(), (value, lease_id));
        state.notify(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_raw(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .state()
            .kv
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, (value, _))| value.clone())
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchEvents> {
        let mut state = self.state();
        if state.failing_watches > 0 {
            state.failing_watches -= 1;
            return Err(DiscoveryError::transient("etcd unavailable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.watches.push((prefix.to_string(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
