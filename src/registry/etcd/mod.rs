//! etcd 服务注册发现实现
//!
//! 实例以 JSON 写入 `{namespace}/{name}/{id}`，绑定一个带 TTL 的 lease。
//! 每次注册启动一个可取消的续期任务；lease 丢失后按指数退避重新注册，
//! 进程崩溃时由 lease 过期自动清理。

#[cfg(test)]
pub(crate) mod memory;
mod store;
mod watcher;

pub use store::{EtcdClientStore, EtcdStore, WatchEvents};
pub use watcher::EtcdWatcher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::instance::ServiceInstance;
use super::trait_def::{Discovery, Registry, Watcher};
use crate::config::EtcdConfig;
use crate::error::Result;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy, sleep_or_cancelled};

/// 一次注册持有的 lease 与续期任务
struct Registration {
    lease_id: Arc<AtomicI64>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// etcd 服务注册发现
pub struct EtcdRegistry {
    store: Arc<dyn EtcdStore>,
    config: EtcdConfig,
    registrations: Mutex<HashMap<String, Registration>>,
    shutdown: CancellationToken,
}

impl EtcdRegistry {
    /// 连接 etcd 并创建注册中心
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdClientStore::connect(&config).await?;
        info!(endpoints = ?config.endpoints, "✅ Connected to etcd");
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<dyn EtcdStore>, config: EtcdConfig) -> Self {
        Self {
            store,
            config,
            registrations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 服务前缀，末尾带 `/`，避免 `bar` 匹配到 `bar2`
    fn service_prefix(&self, service_name: &str) -> String {
        format!(
            "{}/{}/",
            self.config.namespace.trim_end_matches('/'),
            service_name
        )
    }

    fn service_key(&self, instance: &ServiceInstance) -> String {
        format!("{}{}", self.service_prefix(&instance.name), instance.id)
    }

    /// 实例当前持有的 lease
    pub fn lease_id(&self, instance: &ServiceInstance) -> Option<i64> {
        let key = self.service_key(instance);
        self.lock_registrations()
            .get(&key)
            .map(|r| r.lease_id.load(Ordering::Acquire))
    }

    /// 取消所有续期任务（key 随 lease 过期）
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        self.config.validate()?;
        let key = self.service_key(instance);
        let value = serde_json::to_vec(instance)?;

        let lease_id = self.store.grant(self.config.ttl).await?;
        if let Err(e) = self.store.put(&key, value.clone(), lease_id).await {
            let _ = self.store.revoke(lease_id).await;
            return Err(e);
        }

        let lease = Arc::new(AtomicI64::new(lease_id));
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(keep_alive(
            KeepAlive {
                store: Arc::clone(&self.store),
                key: key.clone(),
                value,
                ttl: self.config.ttl,
                lease: Arc::clone(&lease),
                policy: ExponentialBackoffPolicy::new(
                    self.config.max_retry,
                    self.config.retry_interval(),
                    Duration::from_secs(self.config.ttl.max(1) as u64),
                ),
            },
            cancel.clone(),
        ));

        let previous = self.lock_registrations().insert(
            key.clone(),
            Registration {
                lease_id: lease,
                cancel,
                handle,
            },
        );

        // 重复注册：key 已绑定到新 lease，撤销旧 lease 不会删掉它
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let old_lease = previous.lease_id.load(Ordering::Acquire);
            if let Err(e) = self.store.revoke(old_lease).await {
                warn!(key = %key, lease_id = old_lease, error = %e, "failed to revoke previous lease");
            }
        }

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            lease_id = lease_id,
            ttl = self.config.ttl,
            "✅ Service registered with etcd"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.service_key(instance);
        let registration = self.lock_registrations().remove(&key);

        if let Some(registration) = &registration {
            registration.cancel.cancel();
        }

        self.store.delete(&key).await?;

        if let Some(registration) = registration {
            let lease_id = registration.lease_id.load(Ordering::Acquire);
            if let Err(e) = self.store.revoke(lease_id).await {
                warn!(key = %key, lease_id = lease_id, error = %e, "failed to revoke lease");
            }
            let _ = registration.handle.await;
        }

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            "✅ Service deregistered from etcd"
        );
        Ok(())
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        list_instances(self.store.as_ref(), &self.service_prefix(service_name)).await
    }

    async fn watch(&self, service_name: &str) -> Result<Arc<dyn Watcher>> {
        let watcher = EtcdWatcher::new(
            Arc::clone(&self.store),
            service_name,
            self.service_prefix(service_name),
            self.config.max_retry,
            self.config.retry_interval(),
            self.shutdown.child_token(),
        )
        .await?;
        Ok(Arc::new(watcher))
    }
}

/// 读取前缀下的全部实例，无法解析的记录跳过
pub(crate) async fn list_instances(
    store: &dyn EtcdStore,
    prefix: &str,
) -> Result<Vec<ServiceInstance>> {
    let values = store.get_prefix(prefix).await?;
    let mut instances = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_slice::<ServiceInstance>(&value) {
            Ok(instance) => instances.push(instance),
            Err(e) => warn!(prefix = %prefix, error = %e, "skip malformed instance record"),
        }
    }
    Ok(instances)
}

struct KeepAlive {
    store: Arc<dyn EtcdStore>,
    key: String,
    value: Vec<u8>,
    ttl: i64,
    lease: Arc<AtomicI64>,
    policy: ExponentialBackoffPolicy,
}

/// 续期循环，间隔为 TTL 的三分之一
async fn keep_alive(ctx: KeepAlive, cancel: CancellationToken) {
    let interval = Duration::from_millis(((ctx.ttl.max(0) as u64) * 1000 / 3).max(1));

    loop {
        if !sleep_or_cancelled(&cancel, interval).await {
            break;
        }

        let lease_id = ctx.lease.load(Ordering::Acquire);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = ctx.store.keep_alive(lease_id) => result,
        };

        match result {
            Ok(ttl) if ttl > 0 => {
                debug!(key = %ctx.key, lease_id = lease_id, ttl = ttl, "lease kept alive");
                continue;
            }
            Ok(_) => warn!(key = %ctx.key, lease_id = lease_id, "lease expired, re-registering"),
            Err(e) => {
                // 下一轮再试，lease 真正过期时会拿到 ttl = 0
                warn!(key = %ctx.key, lease_id = lease_id, error = %e, "lease keepalive failed");
                continue;
            }
        }

        if !reregister(&ctx, &cancel).await {
            break;
        }
    }

    debug!(key = %ctx.key, "keepalive task stopped");
}

/// 重新申请 lease 并写回记录；放弃或被取消时返回 `false`
async fn reregister(ctx: &KeepAlive, cancel: &CancellationToken) -> bool {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = grant_and_put(ctx) => result,
        };

        match result {
            Ok(lease_id) => {
                ctx.lease.store(lease_id, Ordering::Release);
                info!(key = %ctx.key, lease_id = lease_id, "🔄 Service re-registered with etcd");
                return true;
            }
            Err(e) => {
                if !ctx.policy.should_retry(attempt, &e) {
                    error!(
                        key = %ctx.key,
                        attempts = attempt + 1,
                        error = %e,
                        "❌ giving up re-registering service"
                    );
                    return false;
                }
                let backoff = ctx.policy.backoff_duration(attempt);
                attempt += 1;
                warn!(key = %ctx.key, attempt = attempt, error = %e, "re-register failed, backing off");
                if !sleep_or_cancelled(cancel, backoff).await {
                    return false;
                }
            }
        }
    }
}

async fn grant_and_put(ctx: &KeepAlive) -> Result<i64> {
    let lease_id = ctx.store.grant(ctx.ttl).await?;
    ctx.store.put(&ctx.key, ctx.value.clone(), lease_id).await?;
    Ok(lease_id)
}

impl std::fmt::Debug for EtcdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRegistry")
            .field("endpoints", &self.config.endpoints)
            .field("namespace", &self.config.namespace)
            .field("registrations", &self.lock_registrations().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::error::DiscoveryError;
    use tokio::time::{sleep, timeout};

    fn config() -> EtcdConfig {
        let mut config = EtcdConfig::new(["memory"]);
        config.ttl = 1;
        config.max_retry = 3;
        config.retry_interval_ms = 10;
        config
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "bar", ["grpc://127.0.0.1:8282"]).with_version("v1")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !check() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn register_writes_leased_record() {
        let store = Arc::new(MemoryStore::new());
        let registry = EtcdRegistry::with_store(store.clone(), config());
        let foo = instance("foo");

        registry.register(&foo).await.unwrap();

        let lease = registry.lease_id(&foo).unwrap();
        assert_eq!(store.lease_of("/microservices/bar/foo"), Some(lease));
        let services = registry.get_service("bar").await.unwrap();
        assert_eq!(services, vec![foo.clone()]);

        registry.deregister(&foo).await.unwrap();
        assert!(store.keys().is_empty());
        assert_eq!(store.lease_count(), 0);
        assert!(registry.get_service("bar").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected_before_granting_lease() {
        let store = Arc::new(MemoryStore::new());
        let mut config = config();
        config.ttl = 0;
        let registry = EtcdRegistry::with_store(store.clone(), config);

        let err = registry.register(&instance("foo")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));
        assert_eq!(store.lease_count(), 0);
        assert!(registry.lease_id(&instance("foo")).is_none());
    }

    #[tokio::test]
    async fn prefix_does_not_match_longer_names() {
        let store = Arc::new(MemoryStore::new());
        let registry = EtcdRegistry::with_store(store, config());
        registry.register(&instance("foo")).await.unwrap();
        let mut other = instance("foo2");
        other.name = "bar2".into();
        registry.register(&other).await.unwrap();

        let services = registry.get_service("bar").await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "foo");
    }

    #[tokio::test]
    async fn reregister_same_id_keeps_single_record() {
        let store = Arc::new(MemoryStore::new());
        let registry = EtcdRegistry::with_store(store.clone(), config());
        let foo = instance("foo");

        registry.register(&foo).await.unwrap();
        let first = registry.lease_id(&foo).unwrap();
        registry.register(&foo).await.unwrap();
        let second = registry.lease_id(&foo).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.keys(), vec!["/microservices/bar/foo".to_string()]);
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn deregister_unknown_instance_succeeds() {
        let registry = EtcdRegistry::with_store(Arc::new(MemoryStore::new()), config());
        registry.deregister(&instance("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn keepalive_reregisters_after_lease_loss() {
        let store = Arc::new(MemoryStore::new());
        let registry = EtcdRegistry::with_store(store.clone(), config());
        let foo = instance("foo");
        registry.register(&foo).await.unwrap();
        let lost = registry.lease_id(&foo).unwrap();

        store.expire_lease(lost);
        assert!(store.keys().is_empty());

        eventually(|| !store.keys().is_empty()).await;
        let renewed = registry.lease_id(&foo).unwrap();
        assert_ne!(renewed, lost);
        assert_eq!(store.lease_of("/microservices/bar/foo"), Some(renewed));
    }

    #[tokio::test]
    async fn dropping_registry_stops_keepalive() {
        let store = Arc::new(MemoryStore::new());
        let registry = EtcdRegistry::with_store(store.clone(), config());
        registry.register(&instance("foo")).await.unwrap();

        eventually(|| store.keep_alive_calls() > 0).await;
        drop(registry);
        sleep(Duration::from_millis(50)).await;

        let calls = store.keep_alive_calls();
        sleep(Duration::from_millis(800)).await;
        assert_eq!(store.keep_alive_calls(), calls);
    }
}
