//! Resolver 构建器

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::ResolverSink;
use super::resolver::{Resolver, ResolverOptions};
use crate::error::{DiscoveryError, Result};
use crate::registry::{Discovery, SCHEME_GRPC};

/// 目标 scheme：`discovery:///<service-name>`
pub const DISCOVERY_SCHEME: &str = "discovery";

const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// 为 `discovery:///<service-name>` 目标创建 [`Resolver`]
pub struct Builder {
    discovery: Arc<dyn Discovery>,
    timeout: Duration,
    insecure: bool,
    endpoint_scheme: String,
    debug_log: bool,
}

impl Builder {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            timeout: DEFAULT_WATCH_TIMEOUT,
            insecure: false,
            endpoint_scheme: SCHEME_GRPC.to_string(),
            debug_log: true,
        }
    }

    /// 地址不使用 TLS
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// 创建 watcher 的超时时间
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 只解析该 scheme 的 endpoint，默认 `grpc`
    pub fn with_endpoint_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.endpoint_scheme = scheme.into();
        self
    }

    /// 关闭地址更新日志
    pub fn disable_debug_log(mut self) -> Self {
        self.debug_log = false;
        self
    }

    pub fn scheme(&self) -> &'static str {
        DISCOVERY_SCHEME
    }

    /// 创建 watcher 并启动 resolver
    pub async fn build(&self, target: &str, sink: Arc<dyn ResolverSink>) -> Result<Resolver> {
        let service_name = parse_target(target)?;

        let watcher = tokio::time::timeout(self.timeout, self.discovery.watch(&service_name))
            .await
            .map_err(|_| DiscoveryError::Timeout("discovery create watcher overtime".to_string()))??;

        let resolver = Resolver::start(
            service_name,
            Arc::clone(&self.discovery),
            watcher,
            sink,
            ResolverOptions {
                scheme: self.endpoint_scheme.clone(),
                insecure: self.insecure,
                debug_log: self.debug_log,
            },
        )
        .await;

        info!(target = %target, service_name = %resolver.service_name(), "✅ Resolver started");
        Ok(resolver)
    }
}

/// 从 `discovery://[authority]/<service-name>` 中取出服务名
pub fn parse_target(target: &str) -> Result<String> {
    let rest = target
        .strip_prefix(DISCOVERY_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .ok_or_else(|| {
            DiscoveryError::config(format!(
                "invalid target {}, expected {}:///<service-name>",
                target, DISCOVERY_SCHEME
            ))
        })?;

    let path = rest.split_once('/').map(|(_, path)| path).unwrap_or_default();
    let service_name = path.trim_matches('/');
    if service_name.is_empty() {
        return Err(DiscoveryError::config(format!(
            "target {} has no service name",
            target
        )));
    }
    Ok(service_name.to_string())
}
