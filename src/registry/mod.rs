//! 服务注册发现模块
//!
//! 支持多种服务注册发现后端：Consul、etcd 和 Nacos。
//! 每个后端同时实现 [`Registry`] 与 [`Discovery`]，上层只依赖 trait。

pub mod consul;
pub mod endpoint;
pub mod etcd;
pub mod instance;
pub mod nacos;
pub mod service_set;
pub mod trait_def;

use std::sync::Arc;

pub use consul::{ConsulClient, ConsulRegistry};
pub use endpoint::{Endpoint, SCHEME_GRPC, SCHEME_HTTP};
pub use etcd::{EtcdClientStore, EtcdRegistry, EtcdStore, EtcdWatcher};
pub use instance::ServiceInstance;
pub use nacos::{NacosHttpClient, NacosRegistry, NacosWatcher, NamingClient};
pub use service_set::{ServiceSet, SetWatcher};
pub use trait_def::{Discovery, Registry, Watcher};

use crate::config::{BackendType, DiscoveryConfig};
use crate::error::{DiscoveryError, Result};

/// 同时具备注册与发现能力的后端
pub trait ServiceRegistry: Registry + Discovery {
    fn as_registry(self: Arc<Self>) -> Arc<dyn Registry>;
    fn as_discovery(self: Arc<Self>) -> Arc<dyn Discovery>;
}

impl<T> ServiceRegistry for T
where
    T: Registry + Discovery + 'static,
{
    fn as_registry(self: Arc<Self>) -> Arc<dyn Registry> {
        self
    }

    fn as_discovery(self: Arc<Self>) -> Arc<dyn Discovery> {
        self
    }
}

/// 根据配置创建服务注册发现后端
pub async fn create_registry(config: &DiscoveryConfig) -> Result<Arc<dyn ServiceRegistry>> {
    config.validate()?;

    match config.backend {
        BackendType::Consul => {
            let consul = config
                .consul
                .clone()
                .ok_or_else(|| DiscoveryError::config("missing consul config"))?;
            Ok(Arc::new(ConsulRegistry::new(consul)?))
        }
        BackendType::Etcd => {
            let etcd = config
                .etcd
                .clone()
                .ok_or_else(|| DiscoveryError::config("missing etcd config"))?;
            Ok(Arc::new(EtcdRegistry::connect(etcd).await?))
        }
        BackendType::Nacos => {
            let nacos = config
                .nacos
                .clone()
                .ok_or_else(|| DiscoveryError::config("missing nacos config"))?;
            Ok(Arc::new(NacosRegistry::connect(nacos)?))
        }
    }
}
