//! Nacos 命名服务客户端
//!
//! [`NamingClient`] 只包含注册发现用到的几个操作；
//! [`NacosHttpClient`] 基于 Nacos open API (v1) 实现，
//! 临时实例通过后台心跳保活，订阅通过轮询实例列表模拟。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NacosConfig;
use crate::error::{DiscoveryError, Result};
use crate::retry::sleep_or_cancelled;

/// 服务端返回的分组分隔符，如 `DEFAULT_GROUP@@bar.grpc`
const GROUP_SEPARATOR: &str = "@@";

/// 心跳返回此 code 表示实例已不存在，需要重新注册
const BEAT_RESOURCE_NOT_FOUND: i64 = 20404;

/// Nacos 实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NacosInstance {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    pub cluster_name: String,
    pub service_name: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RegisterInstanceParam {
    pub ip: String,
    pub port: u16,
    pub service_name: String,
    pub group_name: String,
    pub cluster_name: String,
    pub weight: f64,
    pub enable: bool,
    pub healthy: bool,
    pub ephemeral: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DeregisterInstanceParam {
    pub ip: String,
    pub port: u16,
    pub service_name: String,
    pub group_name: String,
    pub cluster_name: String,
    pub ephemeral: bool,
}

#[derive(Debug, Clone)]
pub struct SelectInstancesParam {
    pub service_name: String,
    pub group_name: String,
    pub clusters: Vec<String>,
    pub healthy_only: bool,
}

#[derive(Debug, Clone)]
pub struct SubscribeParam {
    pub service_name: String,
    pub group_name: String,
    pub clusters: Vec<String>,
}

/// 订阅回调，参数为最新的健康实例列表
pub type SubscribeCallback = Arc<dyn Fn(&[NacosInstance]) + Send + Sync>;

/// Nacos 命名服务操作
#[async_trait]
pub trait NamingClient: Send + Sync {
    async fn register_instance(&self, param: RegisterInstanceParam) -> Result<()>;

    async fn deregister_instance(&self, param: DeregisterInstanceParam) -> Result<()>;

    async fn select_instances(&self, param: SelectInstancesParam) -> Result<Vec<NacosInstance>>;

    /// 订阅服务变化，返回订阅 ID
    async fn subscribe(&self, param: SubscribeParam, callback: SubscribeCallback) -> Result<u64>;

    async fn unsubscribe(&self, subscription: u64) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_ttl: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServiceInfo {
    hosts: Vec<NacosInstance>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct BeatResponse {
    code: i64,
    client_beat_interval: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BeatInfo<'a> {
    service_name: String,
    ip: &'a str,
    port: u16,
    cluster: &'a str,
    weight: f64,
    metadata: &'a HashMap<String, String>,
    scheduled: bool,
}

struct ClientInner {
    http: reqwest::Client,
    config: NacosConfig,
    base_url: String,
    token: tokio::sync::Mutex<Option<(String, Instant)>>,
    beats: Mutex<HashMap<String, CancellationToken>>,
    subscriptions: Mutex<HashMap<u64, CancellationToken>>,
    next_subscription: AtomicU64,
    shutdown: CancellationToken,
}

/// 基于 HTTP open API 的 Nacos 客户端
pub struct NacosHttpClient {
    inner: Arc<ClientInner>,
}

impl NacosHttpClient {
    pub fn new(config: NacosConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DiscoveryError::config(format!("build nacos http client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: config.base_url(),
                config,
                token: tokio::sync::Mutex::new(None),
                beats: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Drop for NacosHttpClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl NamingClient for NacosHttpClient {
    async fn register_instance(&self, param: RegisterInstanceParam) -> Result<()> {
        self.inner.register(&param).await?;

        if param.ephemeral {
            let key = beat_key(&param.group_name, &param.service_name, &param.ip, param.port);
            let cancel = self.inner.shutdown.child_token();
            if let Some(previous) = self.inner.lock_beats().insert(key, cancel.clone()) {
                previous.cancel();
            }
            tokio::spawn(beat(Arc::clone(&self.inner), param, cancel));
        }
        Ok(())
    }

    async fn deregister_instance(&self, param: DeregisterInstanceParam) -> Result<()> {
        let key = beat_key(&param.group_name, &param.service_name, &param.ip, param.port);
        if let Some(cancel) = self.inner.lock_beats().remove(&key) {
            cancel.cancel();
        }

        let params = vec![
            ("serviceName", param.service_name.clone()),
            ("groupName", param.group_name.clone()),
            ("clusterName", param.cluster_name.clone()),
            ("ip", param.ip.clone()),
            ("port", param.port.to_string()),
            ("ephemeral", param.ephemeral.to_string()),
        ];
        self.inner
            .send(
                reqwest::Method::DELETE,
                "/v1/ns/instance",
                params,
                DiscoveryError::Registration,
            )
            .await?;
        debug!(service_name = %param.service_name, ip = %param.ip, port = param.port, "nacos instance deregistered");
        Ok(())
    }

    async fn select_instances(&self, param: SelectInstancesParam) -> Result<Vec<NacosInstance>> {
        self.inner.select(&param).await
    }

    async fn subscribe(&self, param: SubscribeParam, callback: SubscribeCallback) -> Result<u64> {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        self.inner.lock_subscriptions().insert(id, cancel.clone());

        tokio::spawn(poll(Arc::clone(&self.inner), param, callback, cancel));
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: u64) -> Result<()> {
        if let Some(cancel) = self.inner.lock_subscriptions().remove(&subscription) {
            cancel.cancel();
        }
        Ok(())
    }
}

impl ClientInner {
    fn lock_beats(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.beats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 配置了用户名密码时获取（并缓存）accessToken
    async fn access_token(&self) -> Result<Option<String>> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(Some(token.clone()));
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/auth/login", self.base_url))
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::config(format!(
                "nacos login failed: {} {}",
                status,
                body.trim()
            )));
        }
        let login: LoginResponse = response.json().await?;

        // 提前十分之一过期，避免边界上用到失效 token
        let ttl = Duration::from_secs(login.token_ttl.max(1));
        let expires_at = Instant::now() + ttl - ttl / 10;
        *cached = Some((login.access_token.clone(), expires_at));
        debug!("nacos access token refreshed");
        Ok(Some(login.access_token))
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
        rejected: fn(String) -> DiscoveryError,
    ) -> Result<String> {
        if !self.config.namespace_id.is_empty() {
            params.push(("namespaceId", self.config.namespace_id.clone()));
        }
        if let Some(token) = self.access_token().await? {
            params.push(("accessToken", token));
        }

        let response = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }

        let message = format!("nacos {} failed: {} {}", path, status, body.trim());
        if status.is_server_error() {
            Err(DiscoveryError::Transient(message))
        } else {
            Err(rejected(message))
        }
    }

    async fn register(&self, param: &RegisterInstanceParam) -> Result<()> {
        let metadata = serde_json::to_string(&param.metadata)?;
        let params = vec![
            ("serviceName", param.service_name.clone()),
            ("groupName", param.group_name.clone()),
            ("clusterName", param.cluster_name.clone()),
            ("ip", param.ip.clone()),
            ("port", param.port.to_string()),
            ("weight", param.weight.to_string()),
            ("enabled", param.enable.to_string()),
            ("healthy", param.healthy.to_string()),
            ("ephemeral", param.ephemeral.to_string()),
            ("metadata", metadata),
        ];
        self.send(
            reqwest::Method::POST,
            "/v1/ns/instance",
            params,
            DiscoveryError::Registration,
        )
        .await?;
        Ok(())
    }

    async fn select(&self, param: &SelectInstancesParam) -> Result<Vec<NacosInstance>> {
        let mut params = vec![
            ("serviceName", param.service_name.clone()),
            ("groupName", param.group_name.clone()),
            ("healthyOnly", param.healthy_only.to_string()),
        ];
        if !param.clusters.is_empty() {
            params.push(("clusters", param.clusters.join(",")));
        }

        let body = self
            .send(
                reqwest::Method::GET,
                "/v1/ns/instance/list",
                params,
                DiscoveryError::Transient,
            )
            .await?;
        let info: ServiceInfo = serde_json::from_str(&body)?;

        Ok(info
            .hosts
            .into_iter()
            .filter(|host| !param.healthy_only || (host.healthy && host.enabled))
            .map(|mut host| {
                host.service_name = strip_group(&host.service_name).to_string();
                host
            })
            .collect())
    }

    /// 发送一次心跳，返回服务端建议的下次间隔
    async fn send_beat(&self, param: &RegisterInstanceParam) -> Result<Option<Duration>> {
        let grouped = format!("{}{}{}", param.group_name, GROUP_SEPARATOR, param.service_name);
        let beat = serde_json::to_string(&BeatInfo {
            service_name: grouped.clone(),
            ip: &param.ip,
            port: param.port,
            cluster: &param.cluster_name,
            weight: param.weight,
            metadata: &param.metadata,
            scheduled: false,
        })?;
        let params = vec![
            ("serviceName", grouped),
            ("groupName", param.group_name.clone()),
            ("ephemeral", "true".to_string()),
            ("beat", beat),
        ];

        let body = self
            .send(
                reqwest::Method::PUT,
                "/v1/ns/instance/beat",
                params,
                DiscoveryError::Transient,
            )
            .await?;
        let response: BeatResponse = serde_json::from_str(&body).unwrap_or_default();

        if response.code == BEAT_RESOURCE_NOT_FOUND {
            warn!(service_name = %param.service_name, ip = %param.ip, port = param.port, "nacos instance lost, re-registering");
            self.register(param).await?;
        }
        Ok((response.client_beat_interval > 0)
            .then(|| Duration::from_millis(response.client_beat_interval)))
    }
}

/// 临时实例心跳循环
async fn beat(inner: Arc<ClientInner>, param: RegisterInstanceParam, cancel: CancellationToken) {
    let mut interval = inner.config.beat_interval();
    loop {
        if !sleep_or_cancelled(&cancel, interval).await {
            break;
        }
        match inner.send_beat(&param).await {
            Ok(Some(next)) => interval = next,
            Ok(None) => {}
            Err(e) => {
                warn!(service_name = %param.service_name, error = %e, "nacos beat failed");
            }
        }
    }
    debug!(service_name = %param.service_name, ip = %param.ip, port = param.port, "nacos beat stopped");
}

/// 订阅轮询：列表变化时回调，首次查询总是回调
async fn poll(
    inner: Arc<ClientInner>,
    param: SubscribeParam,
    callback: SubscribeCallback,
    cancel: CancellationToken,
) {
    let select = SelectInstancesParam {
        service_name: param.service_name.clone(),
        group_name: param.group_name.clone(),
        clusters: param.clusters.clone(),
        healthy_only: true,
    };
    let mut last: Option<Vec<NacosInstance>> = None;

    info!(service_name = %param.service_name, group = %param.group_name, "📡 nacos subscription started");
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = inner.select(&select) => result,
        };
        match result {
            Ok(mut instances) => {
                instances.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
                if last.as_ref() != Some(&instances) {
                    callback(&instances);
                    last = Some(instances);
                }
            }
            Err(e) => {
                warn!(service_name = %param.service_name, error = %e, "nacos subscription poll failed");
            }
        }
        if !sleep_or_cancelled(&cancel, inner.config.subscribe_interval()).await {
            break;
        }
    }
    debug!(service_name = %param.service_name, "nacos subscription stopped");
}

fn beat_key(group: &str, service: &str, ip: &str, port: u16) -> String {
    format!("{}{}{}#{}#{}", group, GROUP_SEPARATOR, service, ip, port)
}

fn strip_group(service_name: &str) -> &str {
    service_name
        .split_once(GROUP_SEPARATOR)
        .map(|(_, name)| name)
        .unwrap_or(service_name)
}
