//! The `eth_getLogs` serving pipeline: response cache, then the local index,
//! with every failure reported back to the router as recoverable so it can
//! fall through to the upstream node. The client always gets a valid
//! response; this engine's only job is answering locally when it can.
//!
//! Both transports share this engine: the HTTP handler writes the returned
//! payload as the response body, the WebSocket loop sends it as one frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::cache::ResponseCache;
use crate::config::Contract;
use crate::error::Error;
use crate::node::NodeClient;
use crate::rpc::{BlockTag, LogFilter, LogRequest, LogResponse};
use crate::store::{LogStore, Scope, StoreFilter};

/// Deadline for a single index query.
const QUERY_DEADLINE: Duration = Duration::from_secs(5);

pub struct LogQueryEngine {
    node: Arc<NodeClient>,
    store: Arc<LogStore>,
    cache: Arc<ResponseCache>,
    contracts: Vec<Contract>,
    from_block: u64,
}

impl LogQueryEngine {
    pub fn new(
        node: Arc<NodeClient>,
        store: Arc<LogStore>,
        cache: Arc<ResponseCache>,
        contracts: Vec<Contract>,
        from_block: u64,
    ) -> Self {
        Self {
            node,
            store,
            cache,
            contracts,
            from_block,
        }
    }

    /// Serve an already-classified `eth_getLogs` request, returning the
    /// serialised `{id, jsonrpc, result}` payload. Any `Err` means "let the
    /// upstream answer instead".
    pub async fn serve(&self, request: &LogRequest) -> Result<String, Error> {
        let key = request.canonical_key()?;
        if let Some(payload) = self.cache.get(&key).await {
            tracing::debug!(id = request.id, "eth_getLogs served from cache");
            return Ok(payload);
        }
        let filter = request.params.first().cloned().unwrap_or_default();
        // `latest` is resolved once per request and reused for the coverage
        // check, so a request never sees two different tips.
        let mut tip = None;
        let store_filter = self.translate(&filter, &mut tip).await?;
        let scope = self.scope_for(&filter);
        self.check_coverage(&scope, &store_filter, &mut tip).await?;
        let logs = timeout(QUERY_DEADLINE, self.store.query(&store_filter))
            .await
            .map_err(|_| Error::StoreUnavailable("index query deadline exceeded".into()))??;
        tracing::debug!(id = request.id, hits = logs.len(), "eth_getLogs served from index");
        let response = LogResponse {
            id: request.id,
            jsonrpc: request.jsonrpc.clone(),
            result: logs,
        };
        let payload = serde_json::to_string(&response)?;
        self.cache.insert(key, payload.clone()).await;
        Ok(payload)
    }

    /// Wire filter to store query. Literal hex becomes a number, `earliest`
    /// becomes 0, `latest`/`pending` resolve against the node; an absent
    /// bound stays unbounded. Topics stay positional.
    async fn translate(
        &self,
        filter: &LogFilter,
        tip: &mut Option<u64>,
    ) -> Result<StoreFilter, Error> {
        let from_block = match filter.from_block {
            None => None,
            Some(tag) => Some(self.resolve(tag, tip).await?),
        };
        let to_block = match filter.to_block {
            None => None,
            Some(tag) => Some(self.resolve(tag, tip).await?),
        };
        let topics = filter
            .topics
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.as_ref().map(|e| e.alternatives()))
            .collect();
        Ok(StoreFilter {
            from_block,
            to_block,
            address: filter
                .address
                .as_deref()
                .filter(|a| !a.is_empty())
                .map(str::to_lowercase),
            topics,
        })
    }

    async fn resolve(&self, tag: BlockTag, tip: &mut Option<u64>) -> Result<u64, Error> {
        match tag {
            BlockTag::Number(n) => Ok(n),
            BlockTag::Earliest => Ok(0),
            BlockTag::Latest | BlockTag::Pending => self.latest(tip).await,
        }
    }

    async fn latest(&self, tip: &mut Option<u64>) -> Result<u64, Error> {
        if let Some(n) = *tip {
            return Ok(n);
        }
        let n = self.node.current_block_number().await?;
        *tip = Some(n);
        Ok(n)
    }

    /// The checkpoint scope answering for this filter: the contract's own
    /// scope when the filter names a tracked contract, the global scope
    /// otherwise. With contracts configured the global checkpoint never
    /// advances, so untracked addresses naturally fall through.
    fn scope_for(&self, filter: &LogFilter) -> Scope {
        if let Some(address) = &filter.address {
            let address = address.to_lowercase();
            if self.contracts.iter().any(|c| c.address == address) {
                return Scope::Contract(address);
            }
        }
        Scope::Global
    }

    /// Refuse to serve locally unless the index provably covers the whole
    /// requested range; a partial local answer would silently drop logs the
    /// upstream would have returned.
    async fn check_coverage(
        &self,
        scope: &Scope,
        store_filter: &StoreFilter,
        tip: &mut Option<u64>,
    ) -> Result<(), Error> {
        let checkpoint = self.store.get_checkpoint(scope).await?;
        let upper = match store_filter.to_block {
            Some(n) => n,
            None => self.latest(tip).await?,
        };
        if upper > checkpoint {
            return Err(Error::NotCovered(format!(
                "toBlock {upper} past checkpoint {checkpoint}"
            )));
        }
        let floor = match scope {
            Scope::Global => self.from_block,
            Scope::Contract(_) => 0,
        };
        let lower = store_filter.from_block.unwrap_or(0);
        if lower < floor {
            return Err(Error::NotCovered(format!(
                "fromBlock {lower} before first indexed block {floor}"
            )));
        }
        Ok(())
    }
}
