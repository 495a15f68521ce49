//! etcd 存储接口
//!
//! 注册与 watch 只依赖这里的几个 KV / lease 操作，真实实现基于 `etcd_client`。

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use futures::stream::{self, BoxStream};

use crate::config::EtcdConfig;
use crate::error::{DiscoveryError, Result};

/// 前缀 watch 事件流
///
/// 每个 `Ok(())` 表示一批变化；`Err` 之后流结束，需要重新 watch。
pub type WatchEvents = BoxStream<'static, Result<()>>;

/// etcd 操作抽象
#[async_trait]
pub trait EtcdStore: Send + Sync {
    /// 申请 lease，返回 lease ID
    async fn grant(&self, ttl: i64) -> Result<i64>;

    /// 续期一次，返回剩余 TTL；0 表示 lease 已失效
    async fn keep_alive(&self, lease_id: i64) -> Result<i64>;

    async fn revoke(&self, lease_id: i64) -> Result<()>;

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 读取前缀下所有 value
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>>;

    /// watch 前缀
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchEvents>;
}

/// 基于 `etcd_client::Client` 的实现
#[derive(Clone)]
pub struct EtcdClientStore {
    client: Client,
}

impl EtcdClientStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(username.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| DiscoveryError::config(format!("connect etcd {:?}: {}", config.endpoints, e)))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl EtcdStore for EtcdClientStore {
    async fn grant(&self, ttl: i64) -> Result<i64> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl, None).await?;
        Ok(lease.id())
    }

    async fn keep_alive(&self, lease_id: i64) -> Result<i64> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(DiscoveryError::transient("lease keepalive stream closed")),
        }
    }

    async fn revoke(&self, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease_id);
        client.put(key, value, Some(options)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp.kvs().iter().map(|kv| kv.value().to_vec()).collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchEvents> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        // watcher 必须与流一起保留，否则服务端会取消 watch
        let events = stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) if resp.canceled() => {
                        let reason = if resp.compact_revision() > 0 {
                            format!("revision compacted at {}", resp.compact_revision())
                        } else {
                            format!("watch canceled: {}", resp.cancel_reason())
                        };
                        return Some((Err(DiscoveryError::Transient(reason)), None));
                    }
                    // created 确认，没有事件
                    Ok(Some(resp)) if resp.events().is_empty() => continue,
                    Ok(Some(_)) => return Some((Ok(()), Some((watcher, stream)))),
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), None)),
                }
            }
        });
        Ok(Box::pin(events))
    }
}
