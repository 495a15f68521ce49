//! Consul HTTP API 客户端

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConsulConfig;
use crate::error::{DiscoveryError, Result};
use crate::registry::endpoint::Endpoint;
use crate::registry::instance::ServiceInstance;

/// 阻塞查询返回的变更索引
const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul 内置的 TaggedAddresses，不是服务自己的地址
const RESERVED_TAGGED_ADDRESSES: [&str; 4] = ["lan_ipv4", "wan_ipv4", "lan_ipv6", "wan_ipv6"];

const VERSION_TAG_PREFIX: &str = "version=";

#[allow(non_snake_case)]
#[derive(Debug, Serialize)]
struct AgentServiceRegistration {
    ID: String,
    Name: String,
    Tags: Vec<String>,
    Address: String,
    Port: u16,
    Meta: HashMap<String, String>,
    TaggedAddresses: BTreeMap<String, ServiceAddress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    Checks: Vec<AgentServiceCheck>,
}

#[allow(non_snake_case)]
#[derive(Debug, Serialize, Deserialize, Clone)]
struct ServiceAddress {
    Address: String,
    Port: u16,
}

#[allow(non_snake_case)]
#[derive(Debug, Serialize)]
struct AgentServiceCheck {
    TCP: String,
    Interval: String,
    Timeout: String,
    DeregisterCriticalServiceAfter: String,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct ServiceEntry {
    Service: AgentService,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct AgentService {
    ID: String,
    Service: String,
    #[serde(default)]
    Tags: Option<Vec<String>>,
    #[serde(default)]
    Address: String,
    #[serde(default)]
    Port: u16,
    #[serde(default)]
    Meta: Option<HashMap<String, String>>,
    #[serde(default)]
    TaggedAddresses: Option<BTreeMap<String, ServiceAddress>>,
}

/// Consul HTTP API 客户端
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DiscoveryError::config(format!("build consul http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        builder
    }

    /// 注册服务实例
    pub async fn register(&self, instance: &ServiceInstance, health_check: bool) -> Result<()> {
        let mut tagged_addresses = BTreeMap::new();
        let mut checks = Vec::new();
        let mut primary: Option<Endpoint> = None;

        for raw in &instance.endpoints {
            let endpoint = Endpoint::parse(raw)?;
            tagged_addresses.insert(
                endpoint.scheme.clone(),
                ServiceAddress {
                    Address: raw.clone(),
                    Port: endpoint.port,
                },
            );
            if health_check {
                checks.push(AgentServiceCheck {
                    TCP: endpoint.address(),
                    Interval: "10s".to_string(),
                    Timeout: "5s".to_string(),
                    DeregisterCriticalServiceAfter: "600s".to_string(),
                });
            }
            if primary.is_none() {
                primary = Some(endpoint);
            }
        }

        let (address, port) = primary
            .map(|endpoint| (endpoint.host, endpoint.port))
            .unwrap_or_default();

        let registration = AgentServiceRegistration {
            ID: instance.id.clone(),
            Name: instance.name.clone(),
            Tags: vec![format!("{}{}", VERSION_TAG_PREFIX, instance.version)],
            Address: address,
            Port: port,
            Meta: instance.metadata.clone(),
            TaggedAddresses: tagged_addresses,
            Checks: checks,
        };

        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(&registration)
            .send()
            .await?;
        check_status(response, "register", DiscoveryError::Registration).await?;
        Ok(())
    }

    /// 注销服务实例
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{}", service_id),
            )
            .send()
            .await?;
        check_status(response, "deregister", DiscoveryError::Registration).await?;
        Ok(())
    }

    /// 阻塞查询健康实例
    ///
    /// `index` 为 0 时立即返回；否则服务端会挂起直到数据变化或 `wait` 到期。
    /// 返回实例列表和新的变更索引。
    pub async fn service(
        &self,
        service_name: &str,
        index: u64,
        wait: Duration,
        timeout: Duration,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let mut builder = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/health/service/{}", service_name),
            )
            .query(&[("passing", "1")])
            .timeout(timeout);
        if index > 0 {
            builder = builder.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs().max(1))),
            ]);
        }

        let response = builder.send().await?;
        let response = check_status(response, "query", DiscoveryError::Transient).await?;
        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<ServiceEntry> = response.json().await?;
        let services = entries
            .into_iter()
            .map(|entry| entry.Service.into_instance())
            .collect();
        Ok((services, last_index))
    }

    /// 目录中的所有服务名及其 tags
    pub async fn catalog_services(&self) -> Result<HashMap<String, Vec<String>>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/catalog/services")
            .send()
            .await?;
        let services = check_status(response, "catalog", DiscoveryError::Transient)
            .await?
            .json()
            .await?;
        Ok(services)
    }
}

impl AgentService {
    fn into_instance(self) -> ServiceInstance {
        let version = self
            .Tags
            .unwrap_or_default()
            .into_iter()
            .find_map(|tag| tag.strip_prefix(VERSION_TAG_PREFIX).map(str::to_string))
            .unwrap_or_default();

        let mut endpoints: Vec<String> = self
            .TaggedAddresses
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| !RESERVED_TAGGED_ADDRESSES.contains(&key.as_str()))
            .map(|(_, addr)| addr.Address)
            .collect();
        if endpoints.is_empty() && !self.Address.is_empty() {
            let host = Endpoint::new("http", self.Address, self.Port);
            endpoints.push(host.to_string());
        }

        ServiceInstance::new(self.ID, self.Service, endpoints)
            .with_version(version)
            .with_metadata(self.Meta.unwrap_or_default())
    }
}

/// 非 2xx 响应转换为错误；5xx / 429 总是可重试，其余交给 `rejected` 决定
async fn check_status(
    response: reqwest::Response,
    op: &str,
    rejected: fn(String) -> DiscoveryError,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("consul {} failed: {} {}", op, status, body.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(DiscoveryError::Transient(message))
    } else {
        Err(rejected(message))
    }
}
