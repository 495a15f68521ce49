//! Nacos 服务注册发现实现
//!
//! 每个 endpoint 注册为一个 Nacos 实例，服务名为 `{name}.{scheme}`，
//! 实例 ID、scheme、版本写入 metadata 的 `id` / `kind` / `version`。

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod watcher;

pub use client::{
    DeregisterInstanceParam, NacosHttpClient, NacosInstance, NamingClient, RegisterInstanceParam,
    SelectInstancesParam, SubscribeCallback, SubscribeParam,
};
pub use watcher::NacosWatcher;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::endpoint::Endpoint;
use super::instance::ServiceInstance;
use super::trait_def::{Discovery, Registry, Watcher};
use crate::config::NacosConfig;
use crate::error::{DiscoveryError, Result};

const META_ID: &str = "id";
const META_KIND: &str = "kind";
const META_VERSION: &str = "version";

/// Nacos 服务注册发现
pub struct NacosRegistry {
    client: Arc<dyn NamingClient>,
    group: String,
    cluster: String,
    weight: f64,
    kind: String,
}

impl NacosRegistry {
    /// 使用 HTTP 客户端连接 Nacos
    pub fn connect(config: NacosConfig) -> Result<Self> {
        let client = NacosHttpClient::new(config.clone())?;
        info!(server = %config.base_url(), namespace = %config.namespace_id, "✅ Nacos naming client created");
        Ok(Self::with_client(Arc::new(client), &config))
    }

    pub fn with_client(client: Arc<dyn NamingClient>, config: &NacosConfig) -> Self {
        Self {
            client,
            group: config.group.clone(),
            cluster: config.cluster.clone(),
            weight: config.weight,
            kind: config.kind.clone(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// metadata 中没有 `kind` 时使用的 scheme
    pub fn with_default_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

#[async_trait]
impl Registry for NacosRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        if instance.name.is_empty() {
            return Err(DiscoveryError::registration(
                "nacos: service instance name can not be empty",
            ));
        }

        for raw in &instance.endpoints {
            let endpoint = Endpoint::parse(raw)?;

            let mut metadata = instance.metadata.clone();
            metadata.insert(META_ID.to_string(), instance.id.clone());
            metadata.insert(META_KIND.to_string(), endpoint.scheme.clone());
            metadata.insert(META_VERSION.to_string(), instance.version.clone());

            self.client
                .register_instance(RegisterInstanceParam {
                    ip: endpoint.host.clone(),
                    port: endpoint.port,
                    service_name: format!("{}.{}", instance.name, endpoint.scheme),
                    group_name: self.group.clone(),
                    cluster_name: self.cluster.clone(),
                    weight: self.weight,
                    enable: true,
                    healthy: true,
                    ephemeral: true,
                    metadata,
                })
                .await
                .map_err(|e| {
                    DiscoveryError::registration(format!(
                        "register instance {} at {}: {}",
                        instance.id, raw, e
                    ))
                })?;
        }

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            endpoints = ?instance.endpoints,
            "✅ Service registered with Nacos"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        for raw in &instance.endpoints {
            let endpoint = Endpoint::parse(raw)?;
            self.client
                .deregister_instance(DeregisterInstanceParam {
                    ip: endpoint.host.clone(),
                    port: endpoint.port,
                    service_name: format!("{}.{}", instance.name, endpoint.scheme),
                    group_name: self.group.clone(),
                    cluster_name: self.cluster.clone(),
                    ephemeral: true,
                })
                .await
                .map_err(|e| {
                    DiscoveryError::registration(format!(
                        "deregister instance {} at {}: {}",
                        instance.id, raw, e
                    ))
                })?;
        }

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            "✅ Service deregistered from Nacos"
        );
        Ok(())
    }
}

#[async_trait]
impl Discovery for NacosRegistry {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let instances = self
            .client
            .select_instances(SelectInstancesParam {
                service_name: service_name.to_string(),
                group_name: self.group.clone(),
                clusters: Vec::new(),
                healthy_only: true,
            })
            .await?;
        Ok(to_service_instances(instances, &self.kind))
    }

    async fn watch(&self, service_name: &str) -> Result<Arc<dyn Watcher>> {
        let watcher = NacosWatcher::new(
            Arc::clone(&self.client),
            service_name,
            &self.group,
            vec![self.cluster.clone()],
            &self.kind,
        )
        .await?;
        Ok(Arc::new(watcher))
    }
}

/// Nacos 实例转换为 [`ServiceInstance`]
///
/// ID 优先取 metadata 中的 `id`（并从 metadata 移除），否则用 Nacos 实例 ID；
/// scheme 优先取 metadata 中的 `kind`，否则用 `default_kind`。
pub(crate) fn to_service_instances(
    instances: Vec<NacosInstance>,
    default_kind: &str,
) -> Vec<ServiceInstance> {
    instances
        .into_iter()
        .map(|mut nacos| {
            let kind = nacos
                .metadata
                .get(META_KIND)
                .cloned()
                .unwrap_or_else(|| default_kind.to_string());
            let id = nacos
                .metadata
                .remove(META_ID)
                .unwrap_or_else(|| nacos.instance_id.clone());
            let version = nacos.metadata.get(META_VERSION).cloned().unwrap_or_default();
            let endpoint = Endpoint::new(kind, nacos.ip, nacos.port);

            ServiceInstance::new(id, nacos.service_name, [endpoint.to_string()])
                .with_version(version)
                .with_metadata(nacos.metadata)
        })
        .collect()
}
