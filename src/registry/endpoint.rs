//! 服务地址解析：`<scheme>://<host>:<port>`

use std::fmt;
use std::str::FromStr;

use crate::error::{DiscoveryError, Result};

pub const SCHEME_GRPC: &str = "grpc";
pub const SCHEME_HTTP: &str = "http";

/// 解析后的服务地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: String,
    /// 主机（IPv6 不带方括号）
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// 解析 `grpc://127.0.0.1:8282` 形式的地址
    pub fn parse(raw: &str) -> Result<Self> {
        let uri: http::Uri = raw
            .parse()
            .map_err(|e| DiscoveryError::config(format!("invalid endpoint {}: {}", raw, e)))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| DiscoveryError::config(format!("endpoint {} has no scheme", raw)))?;
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DiscoveryError::config(format!("endpoint {} has no host", raw)))?;
        let port = uri
            .port_u16()
            .ok_or_else(|| DiscoveryError::config(format!("endpoint {} has no port", raw)))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }

    /// `host:port`，IPv6 加方括号
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address())
    }
}
