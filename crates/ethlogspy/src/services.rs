//! Shared collaborators, built once at startup and passed by reference.
//!
//! Replaces process-wide globals: everything a request or the synchroniser
//! touches hangs off this aggregate. Construction order is store, node
//! (with the fatal connectivity probe), cache, engine; shutdown releases in
//! reverse after the caller has stopped the synchroniser task.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::engine::LogQueryEngine;
use crate::error::Error;
use crate::node::NodeClient;
use crate::store::LogStore;
use crate::sync::{ReconnectionConfig, Synchroniser};

pub struct Services {
    pub config: Config,
    pub node: Arc<NodeClient>,
    pub store: Arc<LogStore>,
    pub cache: Arc<ResponseCache>,
    pub engine: LogQueryEngine,
}

impl Services {
    pub async fn init(config: Config) -> Result<Arc<Self>, Error> {
        tracing::info!(connection = %config.store.connection, "opening log store");
        let store = Arc::new(LogStore::open(&config.store.connection).await?);
        tracing::info!(url = %config.node_http_url(), "initializing node client");
        let node = Arc::new(NodeClient::new(
            config.node_http_url(),
            config.node_ws_url(),
        )?);
        let block = node.check_connectivity().await?;
        tracing::info!(block, "connected to upstream node");
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(config.cache.ttl_secs)));
        let engine = LogQueryEngine::new(
            Arc::clone(&node),
            Arc::clone(&store),
            Arc::clone(&cache),
            config.contracts.clone(),
            config.server.from_block,
        );
        Ok(Arc::new(Self {
            config,
            node,
            store,
            cache,
            engine,
        }))
    }

    pub fn synchroniser(&self) -> Synchroniser {
        Synchroniser::new(
            Arc::clone(&self.node),
            Arc::clone(&self.store),
            self.config.contracts.clone(),
            self.config.server.from_block,
            ReconnectionConfig::default(),
        )
    }

    /// Callers abort the synchroniser task before this; closing the store
    /// releases the last held resource.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
