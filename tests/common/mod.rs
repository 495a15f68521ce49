#![allow(dead_code)] // 每个测试文件只用到其中一部分

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use flare_servicerd::{ConsulConfig, DiscoveryError, ResolvedState, ResolverSink, Result};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 内存版 Consul agent，支持 `index` / `wait` 阻塞查询
pub struct FakeConsul {
    pub addr: String,
    state: Arc<ConsulState>,
    handle: JoinHandle<()>,
}

struct ConsulState {
    services: Mutex<BTreeMap<String, Value>>,
    index: watch::Sender<u64>,
    queries: AtomicUsize,
    fail_queries: AtomicUsize,
}

impl ConsulState {
    fn bump(&self) {
        self.index.send_modify(|index| *index += 1);
    }
}

impl FakeConsul {
    pub async fn start() -> Self {
        let (index, _) = watch::channel(1u64);
        let state = Arc::new(ConsulState {
            services: Mutex::new(BTreeMap::new()),
            index,
            queries: AtomicUsize::new(0),
            fail_queries: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/v1/agent/service/register", put(register))
            .route("/v1/agent/service/deregister/{id}", put(deregister))
            .route("/v1/health/service/{name}", get(health_service))
            .route("/v1/catalog/services", get(catalog_services))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake consul listener");
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                eprintln!("fake consul server error: {}", err);
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// 测试用配置：短 wait、短轮询间隔
    pub fn config(&self) -> ConsulConfig {
        let mut config = ConsulConfig::new(self.addr.clone());
        config.health_check = false;
        config.wait_time = 2;
        config.first_query_timeout_ms = 1_000;
        config.poll_interval_ms = 20;
        config.retry_interval_ms = 20;
        config.deregister_timeout = 1;
        config
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.state
            .services
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    pub fn registration(&self, id: &str) -> Option<Value> {
        self.state.services.lock().unwrap().get(id).cloned()
    }

    /// 直接写入一个实例（模拟其他进程注册）
    pub fn put_service(&self, id: &str, name: &str, endpoint: &str) {
        let registration = json!({
            "ID": id,
            "Name": name,
            "Tags": ["version=v1"],
            "Address": "127.0.0.1",
            "Port": 0,
            "Meta": {},
            "TaggedAddresses": { "grpc": { "Address": endpoint, "Port": 0 } },
        });
        self.state
            .services
            .lock()
            .unwrap()
            .insert(id.to_string(), registration);
        self.state.bump();
    }

    pub fn remove_service(&self, id: &str) {
        self.remove_services(&[id]);
    }

    /// 一次性删除多个实例，只产生一次索引变化
    pub fn remove_services(&self, ids: &[&str]) {
        {
            let mut services = self.state.services.lock().unwrap();
            for id in ids {
                services.remove(*id);
            }
        }
        self.state.bump();
    }

    pub fn query_count(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// 接下来的 `n` 次健康查询返回 500
    pub fn fail_next_queries(&self, n: usize) {
        self.state.fail_queries.store(n, Ordering::SeqCst);
    }
}

impl Drop for FakeConsul {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn register(State(state): State<Arc<ConsulState>>, Json(body): Json<Value>) -> StatusCode {
    let Some(id) = body.get("ID").and_then(Value::as_str).map(str::to_string) else {
        return StatusCode::BAD_REQUEST;
    };
    state.services.lock().unwrap().insert(id, body);
    state.bump();
    StatusCode::OK
}

async fn deregister(State(state): State<Arc<ConsulState>>, Path(id): Path<String>) -> StatusCode {
    if state.services.lock().unwrap().remove(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.bump();
    StatusCode::OK
}

async fn health_service(
    State(state): State<Arc<ConsulState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.queries.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .fail_queries
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Json(json!([])));
    }

    let index = params
        .get("index")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let wait = params
        .get("wait")
        .and_then(|v| v.trim_end_matches('s').parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5));

    if index > 0 {
        let mut rx = state.index.subscribe();
        let _ = tokio::time::timeout(wait, rx.wait_for(|current| *current > index)).await;
    }

    let current = *state.index.borrow();
    let entries: Vec<Value> = state
        .services
        .lock()
        .unwrap()
        .values()
        .filter(|registration| registration["Name"] == name.as_str())
        .map(|registration| {
            json!({
                "Service": {
                    "ID": registration["ID"],
                    "Service": registration["Name"],
                    "Tags": registration["Tags"],
                    "Address": registration["Address"],
                    "Port": registration["Port"],
                    "Meta": registration["Meta"],
                    "TaggedAddresses": registration["TaggedAddresses"],
                }
            })
        })
        .collect();

    let mut headers = HeaderMap::new();
    headers.insert("X-Consul-Index", HeaderValue::from(current));
    (StatusCode::OK, headers, Json(Value::Array(entries)))
}

async fn catalog_services(State(state): State<Arc<ConsulState>>) -> Json<Value> {
    let mut catalog: BTreeMap<String, Value> = BTreeMap::new();
    for registration in state.services.lock().unwrap().values() {
        if let Some(name) = registration["Name"].as_str() {
            catalog.insert(name.to_string(), registration["Tags"].clone());
        }
    }
    Json(json!(catalog))
}

/// 记录所有更新的 sink
#[derive(Default)]
pub struct RecordingSink {
    pub states: Mutex<Vec<ResolvedState>>,
    pub errors: Mutex<Vec<DiscoveryError>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<Vec<String>> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|state| state.addrs().into_iter().map(str::to_string).collect())
            .collect()
    }
}

#[async_trait]
impl ResolverSink for RecordingSink {
    async fn update_state(&self, state: ResolvedState) -> Result<()> {
        self.states.lock().unwrap().push(state);
        Ok(())
    }

    fn report_error(&self, error: DiscoveryError) {
        self.errors.lock().unwrap().push(error);
    }
}

/// 轮询直到条件满足或超时
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
