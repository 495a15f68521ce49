//! 服务发现客户端模块
//!
//! 把 `discovery:///<service-name>` 形式的目标解析为实时地址列表：
//!
//! ```text
//! Builder::build → Discovery::watch → Resolver（后台循环 Watcher::next）→ ResolverSink
//! ```
//!
//! [`BalanceChannelSink`] 把地址更新转换为 `tonic::transport::channel::Change`，
//! 可以直接驱动 `tonic::transport::Channel::balance_channel`。

pub mod balance;
pub mod builder;
pub mod resolver;

pub use balance::BalanceChannelSink;
pub use builder::{Builder, DISCOVERY_SCHEME, parse_target};
pub use resolver::{Resolver, ResolverPhase};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{DiscoveryError, Result};

/// 解析出的单个地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// `host:port`
    pub addr: String,
    /// 服务名
    pub server_name: String,
    /// endpoint 的 scheme（grpc / http）
    pub scheme: String,
    /// 是否需要 TLS
    pub secure: bool,
    /// 实例 metadata
    pub attributes: HashMap<String, String>,
}

/// 一次地址更新
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedState {
    pub addresses: Vec<Address>,
}

impl ResolvedState {
    pub fn addrs(&self) -> Vec<&str> {
        self.addresses.iter().map(|a| a.addr.as_str()).collect()
    }
}

/// 地址更新的接收方（RPC 客户端的连接管理层）
#[async_trait]
pub trait ResolverSink: Send + Sync {
    /// 推送新的地址列表
    async fn update_state(&self, state: ResolvedState) -> Result<()>;

    /// 报告解析错误
    fn report_error(&self, error: DiscoveryError);
}
