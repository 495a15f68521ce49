//! Flare Service Registry & Discovery
//!
//! 为 RPC 服务提供注册与发现：
//!
//! - [`registry`]：`Registry` / `Discovery` / `Watcher` 端口，以及 Consul、etcd、Nacos 适配器
//! - [`discovery`]：把 `discovery:///<service-name>` 解析为实时地址列表的 Resolver 与 Builder
//! - [`driver`]：解析注册中心目标字符串，注册本地服务并返回 Builder
//!
//! ```no_run
//! use std::sync::Arc;
//! use flare_servicerd::{BalanceChannelSink, DiscoveryDriver};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registered = DiscoveryDriver
//!     .register_service("consul://127.0.0.1:8500/order", "grpc://127.0.0.1:36790")
//!     .await?
//!     .expect("target is not empty");
//!
//! let (channel, sink) = BalanceChannelSink::channel(16);
//! let resolver = registered
//!     .builder()
//!     .build("discovery:///user", Arc::new(sink))
//!     .await?;
//! # drop(channel);
//! resolver.close().await;
//! registered.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod logging;
pub mod registry;
pub mod retry;

pub use config::{BackendType, ConsulConfig, DiscoveryConfig, EtcdConfig, NacosConfig};
pub use discovery::{
    Address, BalanceChannelSink, Builder, ResolvedState, Resolver, ResolverPhase, ResolverSink,
};
pub use driver::{DiscoveryDriver, RegisteredService, parse_server_method};
pub use error::{DiscoveryError, Result};
pub use logging::init_logging;
pub use registry::{
    ConsulRegistry, Discovery, Endpoint, EtcdRegistry, NacosRegistry, Registry, ServiceInstance,
    ServiceRegistry, ServiceSet, Watcher, create_registry,
};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
