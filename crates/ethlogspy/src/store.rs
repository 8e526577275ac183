//! Persistent, append-oriented log index on sqlite.
//!
//! `logs` keys on `(block_hash, log_index)`; re-inserting an existing log
//! upserts in place, so duplicate deliveries are idempotent and a reorg
//! re-delivery with `removed = true` wins. Topics live in four positional
//! columns, which makes the JSON-RPC positional topic filter a direct column
//! match. `checkpoints` holds the highest fully absorbed block per scope and
//! only ever moves forward.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::Error;
use crate::rpc::Log;

/// Checkpoint scope: the global singleton when no contracts are configured,
/// or one per tracked contract address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Contract(String),
}

impl Scope {
    fn key(&self) -> String {
        match self {
            Scope::Global => "0".into(),
            Scope::Contract(address) => address.to_lowercase(),
        }
    }
}

/// Translated store query: exact address, inclusive block range, positional
/// topic alternatives (`None` = wildcard position).
#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub address: Option<String>,
    pub topics: Vec<Option<Vec<String>>>,
}

pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    /// Open (and create if missing) the index at `connection`, which is either
    /// a `sqlite:` URL or a bare file path.
    pub async fn open(connection: &str) -> Result<Self, Error> {
        let options = if connection.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(connection)
                .map_err(|e| Error::StoreUnavailable(format!("{connection}: {e}")))?
        } else {
            SqliteConnectOptions::new().filename(connection)
        };
        let options = options.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                block_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                transaction_index INTEGER NOT NULL,
                address TEXT NOT NULL,
                data TEXT NOT NULL,
                topic0 TEXT,
                topic1 TEXT,
                topic2 TEXT,
                topic3 TEXT,
                removed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (block_hash, log_index)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS logs_block_number ON logs (block_number)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS logs_address ON logs (address)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                scope TEXT PRIMARY KEY,
                block_number INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert on `(block_hash, log_index)`. The most recent delivery wins,
    /// which is what carries a reorg's `removed` flag into the index.
    pub async fn insert(&self, log: &Log) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO logs (
                block_hash, log_index, block_number, transaction_index,
                address, data, topic0, topic1, topic2, topic3, removed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (block_hash, log_index) DO UPDATE SET
                block_number = excluded.block_number,
                transaction_index = excluded.transaction_index,
                address = excluded.address,
                data = excluded.data,
                topic0 = excluded.topic0,
                topic1 = excluded.topic1,
                topic2 = excluded.topic2,
                topic3 = excluded.topic3,
                removed = excluded.removed",
        )
        .bind(&log.block_hash)
        .bind(log.log_index as i64)
        .bind(log.block_number as i64)
        .bind(log.transaction_index as i64)
        .bind(&log.address)
        .bind(&log.data)
        .bind(log.topics.first().cloned())
        .bind(log.topics.get(1).cloned())
        .bind(log.topics.get(2).cloned())
        .bind(log.topics.get(3).cloned())
        .bind(log.removed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply the filter and return matching logs ordered by
    /// `(block_number, log_index)`.
    pub async fn query(&self, filter: &StoreFilter) -> Result<Vec<Log>, Error> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT block_hash, log_index, block_number, transaction_index,
                    address, data, topic0, topic1, topic2, topic3, removed
             FROM logs WHERE 1 = 1",
        );
        if let Some(address) = &filter.address {
            qb.push(" AND address = ").push_bind(address.to_lowercase());
        }
        if let Some(from) = filter.from_block {
            qb.push(" AND block_number >= ").push_bind(from as i64);
        }
        if let Some(to) = filter.to_block {
            qb.push(" AND block_number <= ").push_bind(to as i64);
        }
        for (position, entry) in filter.topics.iter().enumerate().take(4) {
            let Some(alternatives) = entry else { continue };
            if alternatives.is_empty() {
                continue;
            }
            qb.push(format!(" AND topic{position} IN ("));
            let mut separated = qb.separated(", ");
            for alternative in alternatives {
                separated.push_bind(alternative.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY block_number ASC, log_index ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_log).collect()
    }

    /// Highest block fully absorbed for the scope. Missing reads as 0.
    pub async fn get_checkpoint(&self, scope: &Scope) -> Result<u64, Error> {
        let row = sqlx::query("SELECT block_number FROM checkpoints WHERE scope = ?")
            .bind(scope.key())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>(0)? as u64),
            None => Ok(0),
        }
    }

    /// Create-or-update; the stored value never decreases.
    pub async fn set_checkpoint(&self, scope: &Scope, block_number: u64) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO checkpoints (scope, block_number) VALUES (?, ?)
             ON CONFLICT (scope) DO UPDATE SET
                block_number = MAX(block_number, excluded.block_number)",
        )
        .bind(scope.key())
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the index holds any logs at all; decides the startup backfill.
    pub async fn is_empty(&self) -> Result<bool, Error> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM logs)")
            .fetch_one(&self.pool)
            .await?;
        let exists: i64 = row.try_get(0)?;
        Ok(exists == 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> Result<Log, Error> {
    let topics = [
        row.try_get::<Option<String>, _>("topic0")?,
        row.try_get::<Option<String>, _>("topic1")?,
        row.try_get::<Option<String>, _>("topic2")?,
        row.try_get::<Option<String>, _>("topic3")?,
    ]
    .into_iter()
    .flatten()
    .collect();
    Ok(Log {
        removed: row.try_get::<bool, _>("removed")?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: row.try_get("block_hash")?,
        address: row.try_get("address")?,
        data: row.try_get("data")?,
        topics,
    })
}
