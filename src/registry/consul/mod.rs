//! Consul 服务注册发现实现
//!
//! 每个被 watch 的服务名对应一个 [`ServiceSet`] 和一个后台阻塞查询循环，
//! 所有 watcher 共享循环拉到的快照。循环随注册中心一起存活，
//! 调用 [`ConsulRegistry::shutdown`] 或 drop 注册中心时结束。

mod client;

pub use client::ConsulClient;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::instance::ServiceInstance;
use super::service_set::ServiceSet;
use super::trait_def::{Discovery, Registry, Watcher};
use crate::config::ConsulConfig;
use crate::error::{DiscoveryError, Result};
use crate::retry::sleep_or_cancelled;

/// Consul 服务注册发现
pub struct ConsulRegistry {
    client: ConsulClient,
    config: ConsulConfig,
    enable_health_check: bool,
    registry: RwLock<HashMap<String, Arc<ServiceSet>>>,
    shutdown: CancellationToken,
}

impl ConsulRegistry {
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let client = ConsulClient::new(&config)?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: ConsulClient, config: ConsulConfig) -> Self {
        Self {
            client,
            enable_health_check: config.health_check,
            config,
            registry: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 是否在注册时附带 TCP 健康检查
    pub fn with_health_check(mut self, enable: bool) -> Self {
        self.enable_health_check = enable;
        self
    }

    pub fn client(&self) -> &ConsulClient {
        &self.client
    }

    /// 所有已缓存且非空的服务快照
    pub fn list_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.read_registry()
            .iter()
            .filter_map(|(name, set)| {
                let services = set.snapshot();
                (!services.is_empty()).then(|| (name.clone(), services.as_ref().clone()))
            })
            .collect()
    }

    /// 停止所有后台查询循环
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(
                services = self.read_registry().len(),
                "🛑 Consul registry shutting down"
            );
        }
        self.shutdown.cancel();
    }

    fn read_registry(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ServiceSet>>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_registry(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ServiceSet>>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        self.client
            .register(instance, self.enable_health_check)
            .await?;

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            endpoints = ?instance.endpoints,
            "✅ Service registered with Consul"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let timeout = self.config.deregister_timeout();
        match tokio::time::timeout(timeout, self.client.deregister(&instance.id)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DiscoveryError::Timeout(format!(
                    "consul deregister {} exceeded {:?}",
                    instance.id, timeout
                )));
            }
        }

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            "✅ Service deregistered from Consul"
        );
        Ok(())
    }
}

#[async_trait]
impl Discovery for ConsulRegistry {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let registry = self.read_registry();
        let set = registry
            .get(service_name)
            .ok_or_else(|| DiscoveryError::NotResolved(service_name.to_string()))?;

        let services = set.snapshot();
        if services.is_empty() {
            return Err(DiscoveryError::NotFound(service_name.to_string()));
        }
        Ok(services.as_ref().clone())
    }

    async fn watch(&self, service_name: &str) -> Result<Arc<dyn Watcher>> {
        if self.shutdown.is_cancelled() {
            return Err(DiscoveryError::WatcherStopped);
        }

        let (set, created) = {
            let mut registry = self.write_registry();
            match registry.get(service_name) {
                Some(set) => (Arc::clone(set), false),
                None => {
                    let set = ServiceSet::new(service_name);
                    registry.insert(service_name.to_string(), Arc::clone(&set));
                    (set, true)
                }
            }
        };

        let watcher = set.subscribe(self.shutdown.child_token());

        if created {
            debug!(service_name = %service_name, "starting consul resolve loop");
            tokio::spawn(resolve(
                self.client.clone(),
                self.config.clone(),
                Arc::clone(&set),
                self.shutdown.child_token(),
            ));
        }

        Ok(Arc::new(watcher))
    }

    fn resolve_now(&self, service_name: &str) {
        if let Some(set) = self.read_registry().get(service_name) {
            set.request_refresh();
        }
    }
}

/// 单个服务名的阻塞查询循环
async fn resolve(
    client: ConsulClient,
    config: ConsulConfig,
    set: Arc<ServiceSet>,
    cancel: CancellationToken,
) {
    let service_name = set.service_name().to_string();
    let mut index = 0u64;

    // 首次查询用短超时，尽快拿到初始快照
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = client.service(&service_name, 0, config.wait(), config.first_query_timeout()) => result,
    };
    match first {
        Ok((services, last_index)) => {
            if !services.is_empty() {
                set.broadcast(services);
            }
            index = last_index;
        }
        Err(e) => {
            warn!(service_name = %service_name, error = %e, "consul initial query failed");
        }
    }

    let mut immediate = false;
    loop {
        if !immediate && !sleep_or_cancelled(&cancel, config.poll_interval()).await {
            break;
        }

        let (query_index, timeout) = if immediate {
            (0, config.first_query_timeout())
        } else {
            (index, config.long_query_timeout())
        };
        immediate = false;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = set.refresh_requested(), if query_index != 0 => {
                debug!(service_name = %service_name, "consul resolve_now requested");
                immediate = true;
                continue;
            }
            result = client.service(&service_name, query_index, config.wait(), timeout) => result,
        };

        let (services, last_index) = match result {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    service_name = %service_name,
                    index = index,
                    error = %e,
                    "consul query failed, retrying"
                );
                if !sleep_or_cancelled(&cancel, config.retry_interval()).await {
                    break;
                }
                continue;
            }
        };

        if last_index != index {
            debug!(
                service_name = %service_name,
                index = last_index,
                instances = services.len(),
                "consul service changed"
            );
            set.broadcast(services);
        }

        // 索引回退说明服务端状态重置，从头开始阻塞查询
        index = if last_index < index { 0 } else { last_index };
    }

    debug!(service_name = %service_name, "consul resolve loop stopped");
}
