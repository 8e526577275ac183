//! Common helpers for integration tests.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ethlogspy::{proxy, Config, Contract, Services};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// In-process stand-in for the upstream node: canned JSON-RPC answers over
/// HTTP and WebSocket on one port, `newHeads` pushes driven by the test.
pub struct MockNode {
    pub addr: SocketAddr,
    pub http_url: String,
    pub ws_url: String,
    state: Arc<MockState>,
}

struct MockState {
    block_number: AtomicU64,
    logs: Mutex<Vec<Value>>,
    requests: Mutex<Vec<Vec<u8>>>,
    last_response: Mutex<Vec<u8>>,
    heads: broadcast::Sender<Value>,
}

impl MockNode {
    pub async fn spawn() -> MockNode {
        let (heads, _) = broadcast::channel(16);
        let state = Arc::new(MockState {
            block_number: AtomicU64::new(0),
            logs: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            last_response: Mutex::new(Vec::new()),
            heads,
        });
        // The node serves WebSocket upgrades and JSON-RPC POSTs on "/";
        // forwarded requests may carry any other path.
        let app = Router::new()
            .route("/", get(node_ws_handler).post(node_http_handler))
            .fallback(node_http_handler)
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockNode {
            addr,
            http_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}"),
            state,
        }
    }

    pub fn set_block_number(&self, n: u64) {
        self.state.block_number.store(n, Ordering::SeqCst);
    }

    /// Result served for every `eth_getLogs` call.
    pub fn set_logs(&self, logs: Vec<Value>) {
        *self.state.logs.lock().unwrap() = logs;
    }

    /// Push a `newHeads` header to every live subscriber.
    pub fn push_head(&self, hash: &str, number: u64) {
        let _ = self.state.heads.send(json!({
            "hash": hash,
            "number": format!("0x{number:x}"),
        }));
    }

    /// True once at least one WebSocket client is attached.
    pub fn has_ws_subscriber(&self) -> bool {
        self.state.heads.receiver_count() > 0
    }

    /// Raw bodies received over HTTP, in arrival order.
    pub fn request_bodies(&self) -> Vec<Vec<u8>> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn saw_method(&self, method: &str) -> bool {
        self.request_bodies()
            .iter()
            .any(|b| String::from_utf8_lossy(b).contains(method))
    }

    /// Exact bytes of the most recent HTTP response body.
    pub fn last_response_body(&self) -> Vec<u8> {
        self.state.last_response.lock().unwrap().clone()
    }
}

async fn node_ws_handler(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn node_http_handler(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    state.requests.lock().unwrap().push(body.to_vec());
    let request: Value = serde_json::from_slice(&body).unwrap_or(json!({}));
    let payload = serde_json::to_vec(&respond(&state, &request)).unwrap();
    *state.last_response.lock().unwrap() = payload.clone();
    (
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response()
}

fn respond(state: &MockState, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let result = match request["method"].as_str().unwrap_or("") {
        "eth_blockNumber" => {
            json!(format!("0x{:x}", state.block_number.load(Ordering::SeqCst)))
        }
        "eth_getLogs" => json!(state.logs.lock().unwrap().clone()),
        "eth_getBlockByHash" => {
            let hash = request["params"][0].as_str().unwrap_or("0x0");
            json!({
                "hash": hash,
                "number": format!("0x{:x}", state.block_number.load(Ordering::SeqCst)),
            })
        }
        _ => json!("0x1"),
    };
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn handle_ws(state: Arc<MockState>, mut socket: WebSocket) {
    let mut heads = state.heads.subscribe();
    let mut subscribed = false;
    loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(Message::Text(text))) = message else { break };
                let request: Value = match serde_json::from_str(text.as_str()) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let reply = if request["method"].as_str() == Some("eth_subscribe") {
                    subscribed = true;
                    json!({"jsonrpc": "2.0", "id": request["id"], "result": "0xmocksub1"})
                } else {
                    respond(&state, &request)
                };
                if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
            head = heads.recv() => {
                let Ok(header) = head else { continue };
                if !subscribed {
                    continue;
                }
                let push = json!({
                    "jsonrpc": "2.0",
                    "method": "eth_subscription",
                    "params": {"subscription": "0xmocksub1", "result": header},
                });
                if socket.send(Message::Text(push.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A full proxy stack wired to the mock node, listening on an ephemeral port.
pub struct TestProxy {
    pub url: String,
    pub ws_url: String,
    pub services: Arc<Services>,
}

pub async fn spawn_proxy(node: &MockNode, contracts: Vec<Contract>, from_block: u64) -> TestProxy {
    let mut config = Config::default();
    config.store.connection = "sqlite::memory:".into();
    config.node.host = node.addr.ip().to_string();
    config.node.port = node.addr.port();
    config.server.from_block = from_block;
    config.contracts = contracts;
    let services = Services::init(config).await.unwrap();
    let state = proxy::ProxyState::new(Arc::clone(&services)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        proxy::serve_on(state, listener, std::future::pending()).await.unwrap();
    });
    TestProxy {
        url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        services,
    }
}

/// Reqwest client that does not use system proxy settings.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("reqwest client")
}

/// Wire-shaped log object as the node would serve it.
pub fn log_json(block_number: u64, log_index: u64, address: &str, removed: bool) -> Value {
    json!({
        "removed": removed,
        "logIndex": format!("0x{log_index:x}"),
        "transactionIndex": "0x0",
        "blockNumber": format!("0x{block_number:x}"),
        "blockHash": format!("0xblock{block_number:02x}"),
        "address": address,
        "data": "0x00",
        "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
    })
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}
