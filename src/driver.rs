//! 注册中心驱动入口
//!
//! 解析 `consul://` / `etcd://` / `nacos://` 目标，把本地服务注册上去，
//! 并返回一个指向同一注册中心的 [`Builder`]，供客户端解析
//! `discovery:///<service-name>`。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, anyhow, bail};
use tracing::{info, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::Builder;
use crate::registry::{Endpoint, SCHEME_GRPC, SCHEME_HTTP, ServiceInstance, ServiceRegistry, create_registry};

pub const DRIVER_NAME: &str = "flare-servicerd-driver";

/// 注册中心驱动
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryDriver;

impl DiscoveryDriver {
    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// 把 `endpoint` 注册到 `target` 指向的注册中心
    ///
    /// 空目标表示不使用注册中心，返回 `None`。
    pub async fn register_service(
        &self,
        target: &str,
        endpoint: &str,
    ) -> anyhow::Result<Option<RegisteredService>> {
        if target.is_empty() {
            return Ok(None);
        }

        let config = DiscoveryConfig::parse_target(target)?;
        let mark = endpoint_mark(endpoint)?;
        let id = format!("{}_{}", config.service_name, mark);

        let registry = create_registry(&config)
            .await
            .with_context(|| format!("connect {} registry", config.backend.as_str()))?;

        let instance = ServiceInstance::new(id, config.service_name.clone(), [endpoint]);
        registry
            .register(&instance)
            .await
            .with_context(|| format!("register {} to {}", instance.id, config.backend.as_str()))?;

        let builder = Builder::new(Arc::clone(&registry).as_discovery()).with_insecure(true);

        info!(
            backend = config.backend.as_str(),
            service_name = %instance.name,
            instance_id = %instance.id,
            endpoint = %endpoint,
            "✅ Service registered"
        );

        Ok(Some(RegisteredService {
            registry,
            instance,
            builder,
            deregistered: AtomicBool::new(false),
        }))
    }
}

/// 已注册的服务
///
/// 调用 [`shutdown`](Self::shutdown) 注销；直接 drop 时在后台注销。
pub struct RegisteredService {
    registry: Arc<dyn ServiceRegistry>,
    instance: ServiceInstance,
    builder: Builder,
    deregistered: AtomicBool,
}

impl RegisteredService {
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn registry(&self) -> Arc<dyn ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// 注销服务，可重复调用
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.deregistered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry
            .deregister(&self.instance)
            .await
            .with_context(|| format!("deregister {}", self.instance.id))?;
        info!(instance_id = %self.instance.id, "🛑 Service deregistered");
        Ok(())
    }
}

impl Drop for RegisteredService {
    fn drop(&mut self) {
        if self.deregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let instance = self.instance.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = registry.deregister(&instance).await {
                    warn!(instance_id = %instance.id, error = %e, "Failed to deregister on drop");
                }
            });
        }
    }
}

/// 由 endpoint 生成实例 ID 后缀：`<scheme>_<host>`
///
/// 只接受 grpc / http。
pub fn endpoint_mark(endpoint: &str) -> anyhow::Result<String> {
    let parsed = Endpoint::parse(endpoint)?;
    if parsed.scheme != SCHEME_GRPC && parsed.scheme != SCHEME_HTTP {
        bail!(
            "invalid service protocol: {}, only supports grpc, http, e.g. grpc://localhost:36790",
            parsed.scheme
        );
    }
    Ok(format!("{}_{}", parsed.scheme, parsed.host))
}

/// 把请求地址拆成 (server, method)
///
/// - `localhost:36789/api/busi/TransIn` → (`localhost:36789`, `/api/busi/TransIn`)
/// - `grpc://localhost:36790/api.Busi/TransIn` → (`grpc://localhost:36790/api.Busi`, `/TransIn`)
pub fn parse_server_method(uri: &str) -> anyhow::Result<(String, String)> {
    if !uri.contains("//") {
        let sep = uri
            .find('/')
            .ok_or_else(|| anyhow!("bad url: '{}'. no '/' found", uri))?;
        return Ok((uri[..sep].to_string(), uri[sep..].to_string()));
    }

    let url = reqwest::Url::parse(uri).with_context(|| format!("bad url: '{}'", uri))?;
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = url.path();
    let index = path
        .get(1..)
        .and_then(|rest| rest.find('/'))
        .map(|i| i + 1)
        .unwrap_or(0);
    Ok((
        format!("{}://{}{}", url.scheme(), authority, &path[..index]),
        path[index..].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_mark_uses_scheme_and_host() {
        assert_eq!(endpoint_mark("grpc://127.0.0.1:36790").unwrap(), "grpc_127.0.0.1");
        assert_eq!(endpoint_mark("http://foobar.com:36789").unwrap(), "http_foobar.com");
        assert!(endpoint_mark("tcp://127.0.0.1:36790").is_err());
        assert!(endpoint_mark("grpc://127.0.0.1").is_err());
    }

    #[test]
    fn splits_plain_server_method() {
        let (server, method) = parse_server_method("localhost:36789/api/busi/TransIn").unwrap();
        assert_eq!(server, "localhost:36789");
        assert_eq!(method, "/api/busi/TransIn");

        assert!(parse_server_method("localhost:36789").is_err());
    }

    #[test]
    fn splits_scheme_server_method() {
        let (server, method) =
            parse_server_method("grpc://localhost:36790/api.Busi/TransIn").unwrap();
        assert_eq!(server, "grpc://localhost:36790/api.Busi");
        assert_eq!(method, "/TransIn");

        let (server, method) =
            parse_server_method("discovery:///dtmservice/api.Busi/TransIn").unwrap();
        assert_eq!(server, "discovery:///dtmservice");
        assert_eq!(method, "/api.Busi/TransIn");
    }

    #[tokio::test]
    async fn empty_target_registers_nothing() {
        let driver = DiscoveryDriver;
        assert_eq!(driver.name(), DRIVER_NAME);
        assert!(
            driver
                .register_service("", "grpc://127.0.0.1:36790")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn invalid_targets_are_rejected() {
        let driver = DiscoveryDriver;
        assert!(
            driver
                .register_service("zookeeper://127.0.0.1:2181/svc", "grpc://127.0.0.1:36790")
                .await
                .is_err()
        );
        assert!(
            driver
                .register_service("consul://127.0.0.1:8500/svc", "tcp://127.0.0.1:36790")
                .await
                .is_err()
        );
    }
}
