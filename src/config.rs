//! 服务注册发现配置
//!
//! 支持两种来源：TOML 配置文件（[`DiscoveryConfig::load_from_file`]），
//! 以及注册中心目标字符串（[`DiscoveryConfig::parse_target`]），例如
//! `consul://127.0.0.1:8500/dtmservice?token=xxx`、
//! `etcd://127.0.0.1:2379/dtmservice?username=u&password=p`、
//! `nacos://127.0.0.1:8848/dtmservice?namespaceID=ns&username=u&password=p`。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// 未指定服务名时使用的默认值
pub const DEFAULT_SERVICE_NAME: &str = "flare-service";

/// 注册中心类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Consul,
    Etcd,
    Nacos,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Consul => "consul",
            BackendType::Etcd => "etcd",
            BackendType::Nacos => "nacos",
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "consul" => Ok(BackendType::Consul),
            "etcd" => Ok(BackendType::Etcd),
            "nacos" => Ok(BackendType::Nacos),
            _ => Err(DiscoveryError::config(format!(
                "invalid registry type: {}, only supports consul, etcd, nacos, \
                 e.g. consul://127.0.0.1:8500/dtmservice",
                s
            ))),
        }
    }
}

/// 服务注册发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// 注册到注册中心的服务名
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// 后端类型
    pub backend: BackendType,

    pub consul: Option<ConsulConfig>,
    pub etcd: Option<EtcdConfig>,
    pub nacos: Option<NacosConfig>,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

/// Consul 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// 地址（含端口），如 `127.0.0.1:8500`
    pub address: String,
    #[serde(default = "default_http_scheme")]
    pub scheme: String,
    /// ACL token（以 Bearer 方式发送）
    pub token: Option<String>,
    pub datacenter: Option<String>,
    /// 注册时是否附带 TCP 健康检查
    #[serde(default = "default_true")]
    pub health_check: bool,
    /// 阻塞查询 wait 参数（秒）
    #[serde(default = "default_consul_wait")]
    pub wait_time: u64,
    /// 首次查询超时（毫秒）
    #[serde(default = "default_first_query_timeout_ms")]
    pub first_query_timeout_ms: u64,
    /// 两次阻塞查询之间的间隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    /// 查询失败后的重试间隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub retry_interval_ms: u64,
    /// 注销超时（秒）
    #[serde(default = "default_deregister_timeout")]
    pub deregister_timeout: u64,
}

impl ConsulConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scheme: default_http_scheme(),
            token: None,
            datacenter: None,
            health_check: true,
            wait_time: default_consul_wait(),
            first_query_timeout_ms: default_first_query_timeout_ms(),
            poll_interval_ms: default_interval_ms(),
            retry_interval_ms: default_interval_ms(),
            deregister_timeout: default_deregister_timeout(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t: &String| !t.is_empty());
        self
    }

    /// HTTP API 根地址
    pub fn base_url(&self) -> String {
        if self.address.contains("://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}", self.scheme, self.address.trim_end_matches('/'))
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_time)
    }

    pub fn first_query_timeout(&self) -> Duration {
        Duration::from_millis(self.first_query_timeout_ms)
    }

    /// 阻塞查询的客户端超时：wait 加上服务端抖动余量
    pub fn long_query_timeout(&self) -> Duration {
        self.wait() + self.wait() / 16 + Duration::from_secs(5)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn deregister_timeout(&self) -> Duration {
        Duration::from_secs(self.deregister_timeout)
    }
}

/// etcd 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// 地址列表（含端口），如 `["127.0.0.1:2379"]`
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// key 前缀
    #[serde(default = "default_etcd_namespace")]
    pub namespace: String,
    /// lease TTL（秒）
    #[serde(default = "default_etcd_ttl")]
    pub ttl: i64,
    /// watch 重建 / lease 重新注册的最大重试次数
    #[serde(default = "default_max_retry")]
    pub max_retry: usize,
    /// 重试间隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub retry_interval_ms: u64,
    /// 连接超时（秒）
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl EtcdConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            username: None,
            password: None,
            namespace: default_etcd_namespace(),
            ttl: default_etcd_ttl(),
            max_retry: default_max_retry(),
            retry_interval_ms: default_interval_ms(),
            dial_timeout: default_dial_timeout(),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into()).filter(|u: &String| !u.is_empty());
        self.password = Some(password.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// lease 续期间隔取 TTL 的三分之一，TTL 至少 1 秒
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::config("etcd endpoints cannot be empty"));
        }
        if self.ttl < 1 {
            return Err(DiscoveryError::config(format!(
                "etcd ttl must be at least 1 second, got {}",
                self.ttl
            )));
        }
        Ok(())
    }
}

/// Nacos 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NacosConfig {
    /// 主机（不含端口）
    pub host: String,
    pub port: u16,
    #[serde(default = "default_http_scheme")]
    pub scheme: String,
    #[serde(default = "default_nacos_context_path")]
    pub context_path: String,
    /// 命名空间 ID，空表示 public
    #[serde(default)]
    pub namespace_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_nacos_group")]
    pub group: String,
    #[serde(default = "default_nacos_cluster")]
    pub cluster: String,
    #[serde(default = "default_nacos_weight")]
    pub weight: f64,
    /// metadata 中缺少 kind 时使用的 scheme
    #[serde(default = "default_kind")]
    pub kind: String,
    /// 临时实例心跳间隔（秒）
    #[serde(default = "default_beat_interval")]
    pub beat_interval: u64,
    /// 订阅轮询间隔（毫秒）
    #[serde(default = "default_interval_ms")]
    pub subscribe_interval_ms: u64,
    /// 请求超时（毫秒）
    #[serde(default = "default_nacos_timeout_ms")]
    pub timeout_ms: u64,
}

impl NacosConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: default_http_scheme(),
            context_path: default_nacos_context_path(),
            namespace_id: String::new(),
            username: None,
            password: None,
            group: default_nacos_group(),
            cluster: default_nacos_cluster(),
            weight: default_nacos_weight(),
            kind: default_kind(),
            beat_interval: default_beat_interval(),
            subscribe_interval_ms: default_interval_ms(),
            timeout_ms: default_nacos_timeout_ms(),
        }
    }

    pub fn with_namespace(mut self, namespace_id: impl Into<String>) -> Self {
        self.namespace_id = namespace_id.into();
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into()).filter(|u: &String| !u.is_empty());
        self.password = Some(password.into()).filter(|p: &String| !p.is_empty());
        self
    }

    /// open API 根地址，如 `http://127.0.0.1:8848/nacos`
    pub fn base_url(&self) -> String {
        let path = self.context_path.trim_matches('/');
        if path.is_empty() {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/{}", self.scheme, self.host, self.port, path)
        }
    }

    pub fn beat_interval(&self) -> Duration {
        Duration::from_secs(self.beat_interval)
    }

    pub fn subscribe_interval(&self) -> Duration {
        Duration::from_millis(self.subscribe_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_http_scheme() -> String {
    "http".to_string()
}

fn default_consul_wait() -> u64 {
    60
}

fn default_first_query_timeout_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_deregister_timeout() -> u64 {
    5
}

fn default_etcd_namespace() -> String {
    "/microservices".to_string()
}

fn default_etcd_ttl() -> i64 {
    15
}

fn default_max_retry() -> usize {
    5
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_nacos_context_path() -> String {
    "/nacos".to_string()
}

fn default_nacos_group() -> String {
    "DEFAULT_GROUP".to_string()
}

fn default_nacos_cluster() -> String {
    "DEFAULT".to_string()
}

fn default_nacos_weight() -> f64 {
    100.0
}

fn default_kind() -> String {
    "grpc".to_string()
}

fn default_beat_interval() -> u64 {
    5
}

fn default_nacos_timeout_ms() -> u64 {
    5_000
}

impl DiscoveryConfig {
    /// 从 TOML 文件加载
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::config(format!("read {}: {}", path, e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DiscoveryConfig =
            toml::from_str(content).map_err(|e| DiscoveryError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 检查所选后端的配置段是否存在
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(DiscoveryError::config("service_name cannot be empty"));
        }
        match self.backend {
            BackendType::Consul => {
                let consul = self
                    .consul
                    .as_ref()
                    .ok_or_else(|| DiscoveryError::config("missing [consul] section"))?;
                if consul.address.is_empty() {
                    return Err(DiscoveryError::config("consul address is empty"));
                }
            }
            BackendType::Etcd => {
                let etcd = self
                    .etcd
                    .as_ref()
                    .ok_or_else(|| DiscoveryError::config("missing [etcd] section"))?;
                etcd.validate()?;
            }
            BackendType::Nacos => {
                let nacos = self
                    .nacos
                    .as_ref()
                    .ok_or_else(|| DiscoveryError::config("missing [nacos] section"))?;
                if nacos.host.is_empty() {
                    return Err(DiscoveryError::config("nacos host is empty"));
                }
            }
        }
        Ok(())
    }

    /// 解析注册中心目标字符串
    pub fn parse_target(target: &str) -> Result<Self> {
        let url = reqwest::Url::parse(target)
            .map_err(|e| DiscoveryError::config(format!("invalid target {}: {}", target, e)))?;

        let backend: BackendType = url.scheme().parse()?;

        let service_name = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .unwrap_or_else(default_service_name);

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DiscoveryError::config("registry address is empty"))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| DiscoveryError::config(format!("port is empty: {}", host)))?;
        let addr = format!("{}:{}", host, port);

        let param = |key: &str| -> String {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };

        let mut config = DiscoveryConfig {
            service_name,
            backend,
            consul: None,
            etcd: None,
            nacos: None,
        };
        match backend {
            BackendType::Consul => {
                config.consul = Some(ConsulConfig::new(addr).with_token(param("token")));
            }
            BackendType::Etcd => {
                config.etcd =
                    Some(EtcdConfig::new([addr]).with_auth(param("username"), param("password")));
            }
            BackendType::Nacos => {
                config.nacos = Some(
                    NacosConfig::new(host, port)
                        .with_namespace(param("namespaceID"))
                        .with_auth(param("username"), param("password")),
                );
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_consul_target() {
        let config =
            DiscoveryConfig::parse_target("consul://127.0.0.1:8500/dtmservice?token=abc").unwrap();
        assert_eq!(config.backend, BackendType::Consul);
        assert_eq!(config.service_name, "dtmservice");
        let consul = config.consul.unwrap();
        assert_eq!(consul.address, "127.0.0.1:8500");
        assert_eq!(consul.token.as_deref(), Some("abc"));
        assert_eq!(consul.base_url(), "http://127.0.0.1:8500");
    }

    #[test]
    fn parses_etcd_target_with_auth() {
        let config =
            DiscoveryConfig::parse_target("etcd://127.0.0.1:2379/order?username=root&password=p%40ss")
                .unwrap();
        assert_eq!(config.backend, BackendType::Etcd);
        assert_eq!(config.service_name, "order");
        let etcd = config.etcd.unwrap();
        assert_eq!(etcd.endpoints, vec!["127.0.0.1:2379".to_string()]);
        assert_eq!(etcd.username.as_deref(), Some("root"));
        assert_eq!(etcd.password.as_deref(), Some("p@ss"));
        assert_eq!(etcd.namespace, "/microservices");
    }

    #[test]
    fn parses_nacos_target() {
        let config = DiscoveryConfig::parse_target(
            "nacos://192.168.1.10:8848/a/b/user?namespaceID=3454d2b5&username=nacos&password=nacos",
        )
        .unwrap();
        assert_eq!(config.service_name, "user");
        let nacos = config.nacos.unwrap();
        assert_eq!(nacos.host, "192.168.1.10");
        assert_eq!(nacos.port, 8848);
        assert_eq!(nacos.namespace_id, "3454d2b5");
        assert_eq!(nacos.base_url(), "http://192.168.1.10:8848/nacos");
    }

    #[test]
    fn default_service_name_without_path() {
        let config = DiscoveryConfig::parse_target("etcd://127.0.0.1:2379").unwrap();
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert!(config.etcd.unwrap().username.is_none());
    }

    #[test]
    fn rejects_bad_targets() {
        assert!(matches!(
            DiscoveryConfig::parse_target("zookeeper://127.0.0.1:2181/svc"),
            Err(DiscoveryError::Config(_))
        ));
        assert!(matches!(
            DiscoveryConfig::parse_target("consul://127.0.0.1/svc"),
            Err(DiscoveryError::Config(_))
        ));
        assert!(DiscoveryConfig::parse_target("::not a url::").is_err());
    }

    #[test]
    fn loads_toml_with_defaults() {
        let config = DiscoveryConfig::from_toml_str(
            r#"
            service_name = "bar"
            backend = "etcd"

            [etcd]
            endpoints = ["127.0.0.1:2379"]
            ttl = 30
            "#,
        )
        .unwrap();
        let etcd = config.etcd.unwrap();
        assert_eq!(etcd.ttl, 30);
        assert_eq!(etcd.max_retry, 5);
        assert_eq!(etcd.retry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn toml_rejects_non_positive_etcd_ttl() {
        for ttl in ["0", "-5"] {
            let err = DiscoveryConfig::from_toml_str(&format!(
                r#"
                service_name = "bar"
                backend = "etcd"

                [etcd]
                endpoints = ["127.0.0.1:2379"]
                ttl = {}
                "#,
                ttl
            ))
            .unwrap_err();
            assert!(matches!(err, DiscoveryError::Config(ref msg) if msg.contains("ttl")));
        }
    }

    #[test]
    fn toml_missing_backend_section_fails() {
        let err = DiscoveryConfig::from_toml_str("backend = \"nacos\"").unwrap_err();
        assert_eq!(err, DiscoveryError::config("missing [nacos] section"));
    }
}
