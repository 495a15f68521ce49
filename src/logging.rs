//! 日志初始化
//!
//! 过滤规则优先读取 `RUST_LOG`，否则使用传入的默认值。
//! 开启 `json-log` feature 时输出 JSON 格式。

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{DiscoveryError, Result};

/// 安装全局 tracing subscriber，并把 `log` 记录桥接到 tracing
///
/// 重复调用返回 `DiscoveryError::Config`。
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| DiscoveryError::config(format!("invalid log filter {}: {}", default_filter, e)))?;

    #[cfg(feature = "json-log")]
    let layer = fmt::layer().json().with_target(true);
    #[cfg(not(feature = "json-log"))]
    let layer = fmt::layer().with_target(true);

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| DiscoveryError::config(format!("logging already initialized: {}", e)))?;

    tracing_log::LogTracer::init()
        .map_err(|e| DiscoveryError::config(format!("log bridge already initialized: {}", e)))?;
    Ok(())
}
