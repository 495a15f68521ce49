//! Resolver：把 Watcher 产出的实例列表转换为地址更新
//!
//! 状态：`Init --build--> Watching --close--> Closed`。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Address, ResolvedState, ResolverSink};
use crate::error::DiscoveryError;
use crate::registry::{Discovery, Endpoint, ServiceInstance, Watcher};
use crate::retry::sleep_or_cancelled;

/// 可重试错误后的等待时间
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverPhase {
    Init,
    Watching,
    Closed,
}

pub(crate) struct ResolverOptions {
    pub scheme: String,
    pub insecure: bool,
    pub debug_log: bool,
}

struct Inner {
    service_name: String,
    discovery: Arc<dyn Discovery>,
    watcher: Arc<dyn Watcher>,
    sink: Arc<dyn ResolverSink>,
    options: ResolverOptions,
    cancel: CancellationToken,
    phase: Mutex<ResolverPhase>,
    /// 上一次成功推送的状态，相同内容不重复推送
    last: tokio::sync::Mutex<Option<ResolvedState>>,
}

/// 单个目标的解析器
pub struct Resolver {
    inner: Arc<Inner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Resolver {
    /// 同步读取一次实例列表，然后启动后台 watch 循环
    pub(crate) async fn start(
        service_name: String,
        discovery: Arc<dyn Discovery>,
        watcher: Arc<dyn Watcher>,
        sink: Arc<dyn ResolverSink>,
        options: ResolverOptions,
    ) -> Self {
        let inner = Arc::new(Inner {
            service_name,
            discovery,
            watcher,
            sink,
            options,
            cancel: CancellationToken::new(),
            phase: Mutex::new(ResolverPhase::Init),
            last: tokio::sync::Mutex::new(None),
        });

        match inner.discovery.get_service(&inner.service_name).await {
            Ok(services) => inner.update(services).await,
            Err(e) => {
                debug!(service_name = %inner.service_name, error = %e, "initial get_service failed, waiting for watcher");
            }
        }

        inner.set_phase(ResolverPhase::Watching);
        let task = tokio::spawn(Arc::clone(&inner).watch());

        Self {
            inner,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn phase(&self) -> ResolverPhase {
        self.inner.phase()
    }

    /// 请求后端立即刷新（后端不支持时无操作）
    pub fn resolve_now(&self) {
        self.inner.discovery.resolve_now(&self.inner.service_name);
    }

    /// 停止 watcher 并等待后台循环退出，可重复调用
    pub async fn close(&self) {
        if self.inner.set_phase(ResolverPhase::Closed) == ResolverPhase::Closed {
            return;
        }

        self.inner.cancel.cancel();
        if let Err(e) = self.inner.watcher.stop().await {
            warn!(service_name = %self.inner.service_name, error = %e, "failed to stop watcher");
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        info!(service_name = %self.inner.service_name, "🛑 Resolver closed");
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if self.inner.set_phase(ResolverPhase::Closed) == ResolverPhase::Closed {
            return;
        }
        self.inner.cancel.cancel();

        let watcher = Arc::clone(&self.inner.watcher);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = watcher.stop().await;
            });
        }
    }
}

impl Inner {
    fn phase(&self) -> ResolverPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 切换状态，返回旧状态
    fn set_phase(&self, phase: ResolverPhase) -> ResolverPhase {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *current == ResolverPhase::Closed {
            return ResolverPhase::Closed;
        }
        std::mem::replace(&mut *current, phase)
    }

    async fn watch(self: Arc<Self>) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.watcher.next() => result,
            };

            match result {
                Ok(services) => self.update(services).await,
                Err(e) if e.is_terminal() => {
                    if matches!(e, DiscoveryError::ExhaustedRetry { .. }) {
                        error!(service_name = %self.service_name, error = %e, "❌ Resolver watch exhausted");
                        self.sink.report_error(e);
                    } else if !self.cancel.is_cancelled() {
                        warn!(service_name = %self.service_name, "watcher stopped unexpectedly");
                    }
                    break;
                }
                Err(e) => {
                    warn!(service_name = %self.service_name, error = %e, "failed to watch discovery endpoint");
                    if !sleep_or_cancelled(&self.cancel, RETRY_DELAY).await {
                        break;
                    }
                }
            }
        }
        debug!(service_name = %self.service_name, "resolver loop stopped");
    }

    async fn update(&self, services: Vec<ServiceInstance>) {
        let addresses = self.build_addresses(&services);
        if addresses.is_empty() {
            warn!(
                service_name = %self.service_name,
                instances = services.len(),
                "🔍 Zero endpoint found, refused to write"
            );
            return;
        }

        let state = ResolvedState { addresses };
        let mut last = self.last.lock().await;
        if last.as_ref() == Some(&state) {
            return;
        }

        match self.sink.update_state(state.clone()).await {
            Ok(()) => {
                if self.options.debug_log {
                    info!(
                        service_name = %self.service_name,
                        addrs = ?state.addrs(),
                        "🔄 Resolver updated"
                    );
                }
                *last = Some(state);
            }
            Err(e) => {
                error!(service_name = %self.service_name, error = %e, "failed to update resolver state");
                self.sink.report_error(e);
            }
        }
    }

    /// 每个实例取第一个匹配 scheme 的 endpoint，按 `host:port` 去重
    fn build_addresses(&self, services: &[ServiceInstance]) -> Vec<Address> {
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();

        for instance in services {
            let Some(raw) = instance.endpoint_with_scheme(&self.options.scheme) else {
                continue;
            };
            let endpoint = match Endpoint::parse(raw) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "skip invalid endpoint");
                    continue;
                }
            };

            let addr = endpoint.address();
            if !seen.insert(addr.clone()) {
                continue;
            }
            addresses.push(Address {
                addr,
                server_name: instance.name.clone(),
                scheme: endpoint.scheme,
                secure: !self.options.insecure,
                attributes: instance.metadata.clone(),
            });
        }
        addresses
    }
}
