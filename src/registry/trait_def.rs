//! 服务注册发现 Trait 定义

use std::sync::Arc;

use async_trait::async_trait;

use super::instance::ServiceInstance;
use crate::error::Result;

/// 服务注册 Trait
#[async_trait]
pub trait Registry: Send + Sync {
    /// 注册服务实例；相同 ID 重复注册视为成功
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// 注销服务实例；未知 ID 由后端决定是否视为成功
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;
}

/// 服务发现 Trait
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 获取服务当前的实例快照
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// 订阅服务变化
    ///
    /// 如果已经存在非空快照，返回的 watcher 第一次调用 `next()` 时会立即拿到它。
    async fn watch(&self, service_name: &str) -> Result<Arc<dyn Watcher>>;

    /// 请求后端立即刷新一次（可选，默认无操作）
    fn resolve_now(&self, _service_name: &str) {}
}

/// 服务变化订阅句柄
///
/// `next()` 是阻塞调用，同一时刻只应有一个消费者；
/// `stop()` 可以与正在进行的 `next()` 并发调用，且可重复调用。
#[async_trait]
pub trait Watcher: Send + Sync {
    /// 等待下一次实例列表
    ///
    /// 返回终止性错误（见 [`DiscoveryError::is_terminal`](crate::DiscoveryError::is_terminal)）
    /// 后，watcher 不会再产出数据。
    async fn next(&self) -> Result<Vec<ServiceInstance>>;

    /// 停止 watch
    async fn stop(&self) -> Result<()>;
}
