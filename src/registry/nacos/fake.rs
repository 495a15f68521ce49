//! 内存版 Nacos 命名服务，用于单元测试

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use super::client::{
    DeregisterInstanceParam, NacosInstance, NamingClient, RegisterInstanceParam,
    SelectInstancesParam, SubscribeCallback, SubscribeParam,
};
use crate::error::{DiscoveryError, Result};

#[derive(Default)]
pub(crate) struct FakeNaming {
    services: Mutex<HashMap<String, Vec<NacosInstance>>>,
    registered: Mutex<Vec<RegisterInstanceParam>>,
    subscribers: Mutex<HashMap<u64, (String, SubscribeCallback)>>,
    next_subscription: AtomicU64,
    reject_deregister: AtomicBool,
}

impl FakeNaming {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn registered(&self) -> Vec<RegisterInstanceParam> {
        self.registered.lock().unwrap().clone()
    }

    /// 之后的注销请求全部返回服务端错误
    pub(crate) fn reject_deregister(&self) {
        self.reject_deregister.store(true, Ordering::SeqCst);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// 直接替换某个服务的实例列表并通知订阅者
    pub(crate) fn set_instances(&self, service_name: &str, instances: Vec<NacosInstance>) {
        self.services
            .lock()
            .unwrap()
            .insert(service_name.to_string(), instances);
        self.notify(service_name);
    }

    fn list(&self, service_name: &str) -> Vec<NacosInstance> {
        self.services
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    fn notify(&self, service_name: &str) {
        let callbacks: Vec<SubscribeCallback> = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|(name, _)| name == service_name)
            .map(|(_, callback)| callback.clone())
            .collect();
        let instances = self.list(service_name);
        for callback in callbacks {
            callback(&instances);
        }
    }
}

#[async_trait]
impl NamingClient for FakeNaming {
    async fn register_instance(&self, param: RegisterInstanceParam) -> Result<()> {
        let instance = NacosInstance {
            instance_id: format!(
                "{}#{}#{}#{}@@{}",
                param.ip, param.port, param.cluster_name, param.group_name, param.service_name
            ),
            ip: param.ip.clone(),
            port: param.port,
            weight: param.weight,
            healthy: param.healthy,
            enabled: param.enable,
            ephemeral: param.ephemeral,
            cluster_name: param.cluster_name.clone(),
            service_name: param.service_name.clone(),
            metadata: param.metadata.clone(),
        };
        {
            let mut services = self.services.lock().unwrap();
            let list = services.entry(param.service_name.clone()).or_default();
            list.retain(|i| !(i.ip == instance.ip && i.port == instance.port));
            list.push(instance);
        }
        self.registered.lock().unwrap().push(param.clone());
        self.notify(&param.service_name);
        Ok(())
    }

    async fn deregister_instance(&self, param: DeregisterInstanceParam) -> Result<()> {
        if self.reject_deregister.load(Ordering::SeqCst) {
            return Err(DiscoveryError::transient("nacos /v1/ns/instance failed: 500"));
        }
        if let Some(list) = self.services.lock().unwrap().get_mut(&param.service_name) {
            list.retain(|i| !(i.ip == param.ip && i.port == param.port));
        }
        self.notify(&param.service_name);
        Ok(())
    }

    async fn select_instances(&self, param: SelectInstancesParam) -> Result<Vec<NacosInstance>> {
        Ok(self
            .list(&param.service_name)
            .into_iter()
            .filter(|i| !param.healthy_only || (i.healthy && i.enabled))
            .collect())
    }

    async fn subscribe(&self, param: SubscribeParam, callback: SubscribeCallback) -> Result<u64> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, (param.service_name.clone(), callback.clone()));
        // 与 SDK 一致，订阅后立即推送一次当前列表
        callback(&self.list(&param.service_name));
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: u64) -> Result<()> {
        self.subscribers.lock().unwrap().remove(&subscription);
        Ok(())
    }
}
