//! Typed facade over the upstream JSON-RPC node.
//!
//! Used by the synchroniser and by `latest`/`pending` resolution in the query
//! engine. Opaque forwarding of everything else is the router's job, not this
//! client's. Upstream error messages are passed through verbatim.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::Error;
use crate::rpc::{parse_hex_u64, Log};

/// Deadline for the startup connectivity check and the subscribe handshake.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Query shape for `eth_getLogs` against the node. Topics are positional;
/// each position carries its alternatives.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<String>,
    pub topics: Vec<Vec<String>>,
}

/// Header delivered by the `newHeads` subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: String,
    pub number: u64,
}

pub struct NodeClient {
    http_url: String,
    ws_url: String,
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(http_url: String, ws_url: String) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
        Ok(Self {
            http_url,
            ws_url,
            client,
        })
    }

    async fn call(&self, method: &str, params: Value, id: u64) -> Result<Value, Error> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        let resp = self.client.post(&self.http_url).json(&body).send().await?;
        let json: Value = resp.json().await?;
        if let Some(err) = json.get("error") {
            return Err(Error::UpstreamUnreachable(err.to_string()));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| Error::UpstreamUnreachable("missing result".into()))
    }

    pub async fn current_block_number(&self) -> Result<u64, Error> {
        let result = self.call("eth_blockNumber", json!([]), 1).await?;
        let s = result
            .as_str()
            .ok_or_else(|| Error::UpstreamUnreachable("blockNumber not a string".into()))?;
        parse_hex_u64(s).map_err(Error::UpstreamUnreachable)
    }

    pub async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, Error> {
        let filter = build_filter(query);
        let result = self.call("eth_getLogs", json!([filter]), 2).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `eth_getBlockByHash` without transaction bodies; `None` when the node
    /// no longer knows the hash (reorged away between header and fetch).
    pub async fn block_by_hash(&self, hash: &str) -> Result<Option<Value>, Error> {
        let result = self.call("eth_getBlockByHash", json!([hash, false]), 3).await?;
        Ok(match result {
            Value::Null => None,
            block => Some(block),
        })
    }

    /// Startup probe with a hard deadline; failure here is fatal.
    pub async fn check_connectivity(&self) -> Result<u64, Error> {
        timeout(CONNECT_DEADLINE, self.current_block_number())
            .await
            .map_err(|_| {
                Error::UpstreamUnreachable(format!(
                    "no response from {} within {:?}",
                    self.http_url, CONNECT_DEADLINE
                ))
            })?
    }

    /// Open a `newHeads` subscription over WebSocket. The handshake (connect
    /// plus subscribe confirmation) runs under the connect deadline.
    pub async fn subscribe_new_heads(&self) -> Result<HeadStream, Error> {
        let (mut ws, _) = timeout(CONNECT_DEADLINE, connect_async(&self.ws_url))
            .await
            .map_err(|_| Error::UpstreamUnreachable("subscribe connect deadline".into()))?
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| Error::UpstreamUnreachable(format!("send subscribe: {e}")))?;
        let confirmation = timeout(CONNECT_DEADLINE, ws.next())
            .await
            .map_err(|_| Error::UpstreamUnreachable("subscribe confirmation deadline".into()))?
            .ok_or_else(|| Error::UpstreamUnreachable("socket closed during subscribe".into()))?
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
        let text = match confirmation {
            Message::Text(t) => t,
            other => {
                return Err(Error::UpstreamUnreachable(format!(
                    "unexpected subscribe reply: {other:?}"
                )))
            }
        };
        let reply: Value = serde_json::from_str(&text)?;
        if let Some(err) = reply.get("error") {
            return Err(Error::UpstreamUnreachable(err.to_string()));
        }
        if reply.get("result").and_then(|r| r.as_str()).is_none() {
            return Err(Error::UpstreamUnreachable("subscribe returned no id".into()));
        }
        Ok(HeadStream { ws })
    }
}

/// Live `newHeads` stream. Dropping it closes the subscription.
pub struct HeadStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl HeadStream {
    /// Next header; `None` when the upstream closed the socket.
    pub async fn next(&mut self) -> Option<Result<BlockHeader, Error>> {
        while let Some(message) = self.ws.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => return Some(Err(Error::UpstreamUnreachable(e.to_string()))),
            };
            let text = match message {
                Message::Text(t) => t,
                Message::Close(_) => return None,
                _ => continue,
            };
            let value: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => return Some(Err(Error::Serialisation(e))),
            };
            if value.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                continue;
            }
            let Some(result) = value.get("params").and_then(|p| p.get("result")) else {
                continue;
            };
            return Some(parse_header(result));
        }
        None
    }
}

fn build_filter(query: &FilterQuery) -> Value {
    let mut filter = json!({});
    if let Some(from) = query.from_block {
        filter["fromBlock"] = Value::String(format!("0x{from:x}"));
    }
    if let Some(to) = query.to_block {
        filter["toBlock"] = Value::String(format!("0x{to:x}"));
    }
    if !query.addresses.is_empty() {
        filter["address"] = json!(query.addresses);
    }
    if !query.topics.is_empty() {
        filter["topics"] = json!(query.topics);
    }
    filter
}

fn parse_header(result: &Value) -> Result<BlockHeader, Error> {
    let hash = result
        .get("hash")
        .and_then(|h| h.as_str())
        .ok_or_else(|| Error::UpstreamUnreachable("header missing hash".into()))?
        .to_lowercase();
    let number = result
        .get("number")
        .and_then(|n| n.as_str())
        .ok_or_else(|| Error::UpstreamUnreachable("header missing number".into()))
        .and_then(|n| parse_hex_u64(n).map_err(Error::UpstreamUnreachable))?;
    Ok(BlockHeader { hash, number })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_only_present_fields() {
        let filter = build_filter(&FilterQuery {
            from_block: Some(0),
            to_block: Some(16),
            ..Default::default()
        });
        assert_eq!(filter["fromBlock"], "0x0");
        assert_eq!(filter["toBlock"], "0x10");
        assert!(filter.get("address").is_none());
        assert!(filter.get("topics").is_none());
    }

    #[test]
    fn filter_keeps_topics_positional() {
        let filter = build_filter(&FilterQuery {
            addresses: vec!["0xabc".into()],
            topics: vec![vec!["0xsig".into()], vec!["0xfrom1".into(), "0xfrom2".into()]],
            ..Default::default()
        });
        assert_eq!(filter["address"], json!(["0xabc"]));
        assert_eq!(
            filter["topics"],
            json!([["0xsig"], ["0xfrom1", "0xfrom2"]])
        );
    }

    #[test]
    fn header_parses_from_subscription_payload() {
        let header = parse_header(&json!({"hash": "0xAB", "number": "0x2a"})).unwrap();
        assert_eq!(
            header,
            BlockHeader {
                hash: "0xab".into(),
                number: 42
            }
        );
        assert!(parse_header(&json!({"number": "0x2a"})).is_err());
    }
}
