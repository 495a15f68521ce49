//! 服务注册发现错误处理模块
//!
//! 所有后端适配器、Watcher 与 Resolver 共用同一错误类型，
//! 通过 [`DiscoveryError::is_transient`] / [`DiscoveryError::is_terminal`]
//! 区分可内部重试的错误与需要调用方重新建立 watch 的错误。

use thiserror::Error;

/// 服务发现结果类型
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// 服务注册发现统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// 配置错误（目标地址、后端配置格式错误），不重试
    #[error("config error: {0}")]
    Config(String),

    /// 该服务从未被 watch 过
    #[error("service {0} not resolved in registry")]
    NotResolved(String),

    /// 已 watch 但当前没有任何实例
    #[error("service {0} not found in registry")]
    NotFound(String),

    /// 后端拒绝注册/注销
    #[error("registration error: {0}")]
    Registration(String),

    /// 网络抖动、超时、revision 被压缩等可重试错误
    #[error("transient backend error: {0}")]
    Transient(String),

    /// watch 流在重试预算内无法恢复
    #[error("watch for {service_name} not re-established after {attempts} attempts: {reason}")]
    ExhaustedRetry {
        service_name: String,
        attempts: usize,
        reason: String,
    },

    /// watcher 已停止（cancel scope 已关闭）
    #[error("watcher stopped")]
    WatcherStopped,

    /// 操作超时
    #[error("timeout: {0}")]
    Timeout(String),

    /// 实例序列化 / 反序列化失败
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DiscoveryError {
    pub fn config(msg: impl Into<String>) -> Self {
        DiscoveryError::Config(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        DiscoveryError::Registration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        DiscoveryError::Transient(msg.into())
    }

    /// 是否可以在内部重试（对 Resolver 表现为"暂无更新"）
    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::Transient(_) | DiscoveryError::Timeout(_))
    }

    /// 是否为终止性错误，watcher 之后不会再产出数据
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::WatcherStopped | DiscoveryError::ExhaustedRetry { .. }
        )
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DiscoveryError::Timeout(err.to_string())
        } else {
            DiscoveryError::Transient(err.to_string())
        }
    }
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        DiscoveryError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(DiscoveryError::transient("conn reset").is_transient());
        assert!(DiscoveryError::Timeout("5s".into()).is_transient());
        assert!(!DiscoveryError::registration("rejected").is_transient());

        assert!(DiscoveryError::WatcherStopped.is_terminal());
        let exhausted = DiscoveryError::ExhaustedRetry {
            service_name: "bar".into(),
            attempts: 3,
            reason: "compacted".into(),
        };
        assert!(exhausted.is_terminal());
        assert!(!DiscoveryError::NotFound("bar".into()).is_terminal());
    }

    #[test]
    fn display_carries_service_name() {
        assert_eq!(
            DiscoveryError::NotResolved("bar".into()).to_string(),
            "service bar not resolved in registry"
        );
        assert_eq!(
            DiscoveryError::NotFound("bar".into()).to_string(),
            "service bar not found in registry"
        );
    }
}
