//! EthLogSpy: caching reverse proxy for the Ethereum JSON-RPC interface.
//!
//! Sits between clients and a node, forwarding all traffic except
//! `eth_getLogs`, which is served from a local sqlite index behind a
//! short-TTL response cache, falling back to the node whenever the index
//! cannot answer. A background synchroniser backfills missing history and
//! follows the chain head over a `newHeads` subscription to keep the index
//! current. HTTP POST and WebSocket traffic are intercepted alike.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod proxy;
pub mod rpc;
pub mod services;
pub mod store;
pub mod sync;

pub use cache::ResponseCache;
pub use config::{Config, Contract};
pub use engine::LogQueryEngine;
pub use error::Error;
pub use node::{BlockHeader, FilterQuery, HeadStream, NodeClient};
pub use rpc::{BlockTag, Log, LogFilter, LogRequest, LogResponse, TopicEntry};
pub use services::Services;
pub use store::{LogStore, Scope, StoreFilter};
pub use sync::{ReconnectionConfig, Synchroniser};
