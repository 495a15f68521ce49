//! 服务实例定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 服务实例
///
/// 一次注册对应一个实例；同名服务可以有多个实例。
/// 构造后不再修改，后端适配器重建实例时会生成新的值。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceInstance {
    /// 实例 ID（每次注册唯一）
    pub id: String,

    /// 服务名（如 "bar"），多个实例共享
    pub name: String,

    /// 版本
    #[serde(default)]
    pub version: String,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// 服务地址，格式 `<scheme>://<host>:<port>`，如 `grpc://127.0.0.1:8282`
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            metadata: HashMap::new(),
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 设置元数据（整体替换）
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 添加一条元数据
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 第一个匹配 scheme 的地址
    pub fn endpoint_with_scheme(&self, scheme: &str) -> Option<&str> {
        let prefix = format!("{}://", scheme);
        self.endpoints
            .iter()
            .map(String::as_str)
            .find(|endpoint| endpoint.starts_with(&prefix))
    }
}
