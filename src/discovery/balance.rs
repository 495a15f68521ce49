//! tonic 负载均衡 Channel 适配
//!
//! 比较前后两次地址集合，把差异作为 `Change::Insert` / `Change::Remove`
//! 发送给 `Channel::balance_channel` 返回的 sender。
//! 安全地址使用系统根证书建立 TLS 连接。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tonic::transport::channel::Change;
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::{debug, error};

use super::{Address, ResolvedState, ResolverSink};
use crate::error::{DiscoveryError, Result};

type ChangeSender = mpsc::Sender<Change<String, tonic::transport::Endpoint>>;

/// 驱动 tonic 负载均衡 Channel 的 [`ResolverSink`]
pub struct BalanceChannelSink {
    tx: ChangeSender,
    current: Mutex<HashSet<String>>,
}

impl BalanceChannelSink {
    pub fn new(tx: ChangeSender) -> Self {
        Self {
            tx,
            current: Mutex::new(HashSet::new()),
        }
    }

    /// 创建负载均衡 Channel 以及对应的 sink
    pub fn channel(capacity: usize) -> (Channel, Self) {
        let (channel, tx) = Channel::balance_channel(capacity);
        (channel, Self::new(tx))
    }

    fn endpoint(address: &Address) -> Result<tonic::transport::Endpoint> {
        let scheme = if address.secure { "https" } else { "http" };
        let endpoint =
            tonic::transport::Endpoint::from_shared(format!("{}://{}", scheme, address.addr))
                .map_err(|e| {
                    DiscoveryError::config(format!("invalid address {}: {}", address.addr, e))
                })?;
        if !address.secure {
            return Ok(endpoint);
        }
        endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| DiscoveryError::config(format!("tls config for {}: {}", address.addr, e)))
    }

    async fn send(&self, change: Change<String, tonic::transport::Endpoint>) -> Result<()> {
        self.tx
            .send(change)
            .await
            .map_err(|_| DiscoveryError::transient("balance channel closed"))
    }
}

#[async_trait]
impl ResolverSink for BalanceChannelSink {
    async fn update_state(&self, state: ResolvedState) -> Result<()> {
        let mut current = self.current.lock().await;
        let next: HashMap<&str, &Address> = state
            .addresses
            .iter()
            .map(|address| (address.addr.as_str(), address))
            .collect();

        let removed: Vec<String> = current
            .iter()
            .filter(|addr| !next.contains_key(addr.as_str()))
            .cloned()
            .collect();
        for addr in removed {
            self.send(Change::Remove(addr.clone())).await?;
            current.remove(&addr);
            debug!(addr = %addr, "endpoint removed from balance channel");
        }

        for address in &state.addresses {
            if current.contains(&address.addr) {
                continue;
            }
            let endpoint = Self::endpoint(address)?;
            self.send(Change::Insert(address.addr.clone(), endpoint)).await?;
            current.insert(address.addr.clone());
            debug!(addr = %address.addr, "endpoint added to balance channel");
        }
        Ok(())
    }

    fn report_error(&self, error: DiscoveryError) {
        error!(error = %error, "❌ Service discovery error");
    }
}
