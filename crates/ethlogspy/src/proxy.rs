//! Listener and request router.
//!
//! One port serves both protocols: `/ws` upgrades to WebSocket, everything
//! else is HTTP. `eth_getLogs` POST bodies and WebSocket frames go through
//! the query engine; every other request, and every engine failure, is
//! forwarded to the upstream node and the upstream's answer relayed verbatim.
//! An intercepted request therefore never observes a locally-generated error.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tower_http::cors::{Any, CorsLayer};

use crate::error::Error;
use crate::rpc::LogRequest;
use crate::services::Services;

/// Forwarded bodies are buffered; JSON-RPC payloads stay far below this.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct ProxyState {
    services: Arc<Services>,
    client: reqwest::Client,
    http_upstream: String,
    ws_upstream: String,
}

impl ProxyState {
    pub fn new(services: Arc<Services>) -> Result<Arc<Self>, Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
        let http_upstream = services.config.node_http_url();
        let ws_upstream = services.config.node_ws_url();
        Ok(Arc::new(Self {
            services,
            client,
            http_upstream,
            ws_upstream,
        }))
    }
}

/// Bind the configured port and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<ProxyState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let port = state.services.config.server.port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind :{port}"))?;
    serve_on(state, listener, shutdown).await
}

/// Serve on an already-bound listener (tests bind an ephemeral port).
pub async fn serve_on(
    state: Arc<ProxyState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let cors = cors_layer(&state.services.config.server.cors_origin)?;
    let app = router(state).layer(cors);
    tracing::info!(addr = %listener.local_addr()?, "starting ethlogspy server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}

fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .route("/ws/{*rest}", any(ws_handler))
        .fallback(http_handler)
        .with_state(state)
}

fn cors_layer(origin: &str) -> Result<CorsLayer, Error> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return Ok(layer.allow_origin(Any));
    }
    let value: HeaderValue = origin
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid CORS origin: {origin}")))?;
    Ok(layer.allow_origin(value))
}

/// Try the engine for an `eth_getLogs` body. `None` means "not ours":
/// unparsable, a different method, or an engine failure that the upstream
/// should answer instead.
async fn intercept(state: &ProxyState, raw: &[u8]) -> Option<String> {
    let request: LogRequest = serde_json::from_slice(raw).ok()?;
    tracing::debug!(method = %request.method, "new request incoming");
    if !request.is_get_logs() {
        return None;
    }
    match state.services.engine.serve(&request).await {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(reason = %e, "serving eth_getLogs locally failed, passing through");
            None
        }
    }
}

async fn http_handler(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(reason = %e, "error while reading request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if parts.method == Method::POST {
        if let Some(payload) = intercept(&state, &bytes).await {
            return (
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                payload,
            )
                .into_response();
        }
    }
    forward(&state, parts, bytes).await
}

/// Relay the original request to the upstream node and its response back,
/// body verbatim.
async fn forward(state: &ProxyState, parts: axum::http::request::Parts, body: Bytes) -> Response {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.http_upstream, path_and_query);
    let mut upstream = state.client.request(parts.method.clone(), &url);
    for (name, value) in parts.headers.iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    let response = match upstream.body(body).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(reason = %e, "upstream forward failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(reason = %e, "error while reading upstream response");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

async fn ws_handler(State(state): State<Arc<ProxyState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection loop. Intercepted frames are answered from the engine;
/// everything else rides a dedicated upstream WebSocket whose traffic
/// (responses and subscription pushes) is pumped back to the client. One
/// writer task keeps client-bound frames in order.
async fn handle_socket(state: Arc<ProxyState>, socket: WebSocket) {
    let upstream = match connect_async(&state.ws_upstream).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::error!(reason = %e, "upstream websocket connect failed");
            return;
        }
    };
    let (mut up_sink, mut up_stream) = upstream.split();
    let (client_sink, mut client_stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<WsMessage>(32);
    let writer = tokio::spawn(async move {
        let mut client_sink = client_sink;
        while let Some(message) = rx.recv().await {
            if client_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let pump_tx = tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(message) = up_stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(reason = %e, "upstream websocket read failed");
                    break;
                }
            };
            let forwarded = match message {
                UpstreamMessage::Text(text) => WsMessage::Text(text.into()),
                UpstreamMessage::Binary(bytes) => WsMessage::Binary(bytes.into()),
                UpstreamMessage::Close(_) => break,
                _ => continue,
            };
            if pump_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = client_stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(reason = %e, "error while reading message");
                break;
            }
        };
        match message {
            WsMessage::Text(text) => {
                if let Some(payload) = intercept(&state, text.as_bytes()).await {
                    if tx.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                    continue;
                }
                if up_sink
                    .send(UpstreamMessage::Text(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    tracing::error!("upstream websocket write failed");
                    break;
                }
            }
            WsMessage::Binary(bytes) => {
                if up_sink
                    .send(UpstreamMessage::Binary(bytes.to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    pump.abort();
    writer.abort();
    let _ = up_sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_accepts_wildcard_and_concrete_origins() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("https://dapp.example").is_ok());
        assert!(matches!(
            cors_layer("not a header value\n").unwrap_err(),
            Error::ConfigInvalid(_)
        ));
    }
}
