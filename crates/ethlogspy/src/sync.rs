//! Log synchroniser: startup backfill plus the `newHeads` follower.
//!
//! Exactly one synchroniser task runs, so checkpoint writes are never
//! concurrent. The follower re-ingests blocks the backfill may already have
//! covered; the store's idempotent insert absorbs the overlap. Subscription
//! failures are never fatal: the loop logs, backs off with jitter, and
//! resubscribes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha3::{Digest, Keccak256};
use tokio::time::sleep;

use crate::config::Contract;
use crate::error::Error;
use crate::node::{FilterQuery, NodeClient};
use crate::rpc::Log;
use crate::store::{LogStore, Scope};

/// Reconnection backoff bounds for the head subscription.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// `topics[0]` value for a human-readable event signature.
pub fn event_signature_topic(signature: &str) -> String {
    let hash = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(hash))
}

pub struct Synchroniser {
    node: Arc<NodeClient>,
    store: Arc<LogStore>,
    contracts: Vec<Contract>,
    from_block: u64,
    reconnection: ReconnectionConfig,
}

impl Synchroniser {
    pub fn new(
        node: Arc<NodeClient>,
        store: Arc<LogStore>,
        contracts: Vec<Contract>,
        from_block: u64,
        reconnection: ReconnectionConfig,
    ) -> Self {
        Self {
            node,
            store,
            contracts,
            from_block,
            reconnection,
        }
    }

    /// Startup entry point: a full backfill is only needed when the index
    /// holds nothing at all.
    pub async fn backfill_if_empty(&self) -> Result<(), Error> {
        if !self.store.is_empty().await? {
            tracing::info!("index already populated, skipping backfill");
            return Ok(());
        }
        let start = std::time::Instant::now();
        tracing::info!("syncing index with node logs");
        self.backfill().await?;
        tracing::info!(elapsed = ?start.elapsed(), "log sync successful");
        Ok(())
    }

    /// One backfill pass. Unrestricted when no contracts are configured,
    /// otherwise one pass per (contract, signature) pair. Running it twice
    /// yields the same set of `(block_hash, log_index)` records.
    pub async fn backfill(&self) -> Result<(), Error> {
        if self.contracts.is_empty() {
            self.backfill_all().await
        } else {
            self.backfill_contracts().await
        }
    }

    async fn backfill_all(&self) -> Result<(), Error> {
        let tip = self.node.current_block_number().await?;
        let checkpoint = self.store.get_checkpoint(&Scope::Global).await?;
        let from = self.from_block.max(checkpoint);
        tracing::info!(from, to = tip, "retrieving all logs");
        let logs = self
            .node
            .filter_logs(&FilterQuery {
                from_block: Some(from),
                to_block: Some(tip),
                ..Default::default()
            })
            .await?;
        let inserted = self.insert_batch(logs).await;
        tracing::info!(count = inserted, "logs stored");
        self.store.set_checkpoint(&Scope::Global, tip).await?;
        Ok(())
    }

    async fn backfill_contracts(&self) -> Result<(), Error> {
        let tip = self.node.current_block_number().await?;
        for contract in &self.contracts {
            let scope = Scope::Contract(contract.address.clone());
            let from = self.store.get_checkpoint(&scope).await?;
            for signature in &contract.signatures {
                let topic = event_signature_topic(signature);
                tracing::info!(
                    contract = %contract.address,
                    signature = %signature,
                    from,
                    to = tip,
                    "retrieving contract logs"
                );
                let logs = self
                    .node
                    .filter_logs(&FilterQuery {
                        from_block: Some(from),
                        to_block: Some(tip),
                        addresses: vec![contract.address.clone()],
                        topics: vec![vec![topic]],
                    })
                    .await?;
                self.insert_batch(logs).await;
            }
            // The contract's checkpoint moves only once every signature for
            // it has been absorbed up to the tip.
            self.store.set_checkpoint(&scope, tip).await?;
            tracing::info!(contract = %contract.address, to = tip, "contract logs retrieved");
        }
        Ok(())
    }

    /// Head-follower loop. Runs until the task is aborted at shutdown.
    pub async fn run(self: Arc<Self>) {
        let initial = Duration::from_secs(self.reconnection.initial_backoff_secs);
        let max = Duration::from_secs(self.reconnection.max_backoff_secs);
        let mut backoff = initial;
        loop {
            match self.follow_heads_once().await {
                Ok(()) => {
                    tracing::info!("head subscription closed, resubscribing");
                    backoff = initial;
                }
                Err(e) => {
                    tracing::warn!(reason = %e, "head subscription failed, reconnecting");
                }
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(max);
        }
    }

    async fn follow_heads_once(&self) -> Result<(), Error> {
        let mut heads = self.node.subscribe_new_heads().await?;
        tracing::info!("blockchain head subscription established");
        while let Some(header) = heads.next().await {
            let header = header?;
            tracing::debug!(hash = %header.hash, number = header.number, "new block received");
            match self.node.block_by_hash(&header.hash).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(hash = %header.hash, "head vanished before confirmation");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(hash = %header.hash, reason = %e, "block confirmation failed");
                    continue;
                }
            }
            if let Err(e) = self.ingest_block(header.number).await {
                tracing::warn!(block = header.number, reason = %e, "block ingest failed");
            }
        }
        Ok(())
    }

    /// Pull and store every log of one block. No address or topic
    /// restriction: the per-block volume is small and one query beats one
    /// per tracked contract.
    async fn ingest_block(&self, number: u64) -> Result<(), Error> {
        let logs = self
            .node
            .filter_logs(&FilterQuery {
                from_block: Some(number),
                to_block: Some(number),
                ..Default::default()
            })
            .await?;
        self.insert_batch(logs).await;
        self.advance_checkpoints(number).await;
        Ok(())
    }

    /// Insert logs one by one; an individual failure is logged and skipped,
    /// never aborting the batch.
    async fn insert_batch(&self, logs: Vec<Log>) -> usize {
        let mut inserted = 0;
        for log in logs {
            let log = log.normalized();
            if let Err(e) = self.store.insert(&log).await {
                tracing::error!(
                    block_hash = %log.block_hash,
                    log_index = log.log_index,
                    reason = %e,
                    "error while inserting log, skipping"
                );
                continue;
            }
            inserted += 1;
        }
        inserted
    }

    /// A block's logs are in the index; move every relevant checkpoint at or
    /// past it. Store-side MAX keeps this monotonic.
    async fn advance_checkpoints(&self, block_number: u64) {
        let scopes: Vec<Scope> = if self.contracts.is_empty() {
            vec![Scope::Global]
        } else {
            self.contracts
                .iter()
                .map(|c| Scope::Contract(c.address.clone()))
                .collect()
        };
        for scope in scopes {
            if let Err(e) = self.store.set_checkpoint(&scope, block_number).await {
                tracing::error!(reason = %e, "error while advancing checkpoint");
            }
        }
    }
}
