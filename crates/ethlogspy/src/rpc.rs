//! JSON-RPC wire types for the intercepted `eth_getLogs` path.
//!
//! The request envelope is parsed once at the boundary; its `serde_json`
//! serialisation (fixed field order, no whitespace) doubles as the response
//! cache key, so identical requests with different raw formatting canonicalise
//! to the same key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Error;

/// Parsed JSON-RPC request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<LogFilter>,
    #[serde(default)]
    pub id: i64,
}

impl LogRequest {
    /// True if this envelope is an `eth_getLogs` call (method match is
    /// case-insensitive, as in the original proxy).
    pub fn is_get_logs(&self) -> bool {
        self.method.eq_ignore_ascii_case("eth_getlogs")
    }

    /// Canonical cache-key material: the serialisation of the parsed envelope,
    /// not the raw body. Block tags keep their original literal form
    /// (`"latest"` stays `"latest"`).
    pub fn canonical_key(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `eth_getLogs` filter object as received on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_block: Option<BlockTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<BlockTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<Option<TopicEntry>>>,
}

/// One positional topic constraint: a single value or a list of alternatives.
/// `null` positions are carried as `None` in the surrounding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicEntry {
    One(String),
    Any(Vec<String>),
}

impl TopicEntry {
    /// Alternatives for this position, lowercased.
    pub fn alternatives(&self) -> Vec<String> {
        match self {
            TopicEntry::One(t) => vec![t.to_lowercase()],
            TopicEntry::Any(ts) => ts.iter().map(|t| t.to_lowercase()).collect(),
        }
    }
}

/// Polymorphic `fromBlock`/`toBlock` value, parsed once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Earliest,
    Latest,
    Pending,
}

impl Serialize for BlockTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockTag::Number(n) => serializer.serialize_str(&format!("0x{n:x}")),
            BlockTag::Earliest => serializer.serialize_str("earliest"),
            BlockTag::Latest => serializer.serialize_str("latest"),
            BlockTag::Pending => serializer.serialize_str("pending"),
        }
    }
}

impl<'de> Deserialize<'de> for BlockTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        match &v {
            Value::String(s) => match s.as_str() {
                "earliest" => Ok(BlockTag::Earliest),
                "latest" => Ok(BlockTag::Latest),
                "pending" => Ok(BlockTag::Pending),
                other => parse_hex_u64(other)
                    .map(BlockTag::Number)
                    .map_err(|e| serde::de::Error::custom(format!("block tag: {e}"))),
            },
            Value::Number(n) => n
                .as_u64()
                .map(BlockTag::Number)
                .ok_or_else(|| serde::de::Error::custom("block number out of range")),
            _ => Err(serde::de::Error::custom("block tag must be a string or number")),
        }
    }
}

/// The canonical indexed log record. `(block_hash, log_index)` is the
/// identity; hex fields are lowercase and 0x-prefixed. The wire shape matches
/// the Ethereum JSON-RPC log object (camelCase, hex-quantity strings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    #[serde(default)]
    pub removed: bool,
    #[serde(with = "hex_u64")]
    pub log_index: u64,
    #[serde(with = "hex_u64")]
    pub transaction_index: u64,
    #[serde(with = "hex_u64")]
    pub block_number: u64,
    pub block_hash: String,
    pub address: String,
    pub data: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Log {
    /// Lowercase all hex fields. Applied on ingest so the index never holds
    /// mixed-case values.
    pub fn normalized(mut self) -> Log {
        self.block_hash = self.block_hash.to_lowercase();
        self.address = self.address.to_lowercase();
        self.data = self.data.to_lowercase();
        for topic in &mut self.topics {
            *topic = topic.to_lowercase();
        }
        self
    }
}

/// Response envelope for an intercepted `eth_getLogs` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub id: i64,
    pub jsonrpc: String,
    pub result: Vec<Log>,
}

/// Hex-quantity (de)serialisation for u64 fields ("0x10" <-> 16).
mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{v:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_hex_u64(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a 0x-prefixed (or bare) hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let t = s.strip_prefix("0x").unwrap_or(s);
    if t.is_empty() {
        return Err(format!("empty hex quantity: {s:?}"));
    }
    u64::from_str_radix(t, 16).map_err(|e| format!("parse hex quantity {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tag_forms() {
        let tags: Vec<BlockTag> =
            serde_json::from_str(r#"["0x10", "earliest", "latest", "pending", 7]"#).unwrap();
        assert_eq!(
            tags,
            vec![
                BlockTag::Number(16),
                BlockTag::Earliest,
                BlockTag::Latest,
                BlockTag::Pending,
                BlockTag::Number(7),
            ]
        );
        assert!(serde_json::from_str::<BlockTag>(r#""0xzz""#).is_err());
    }

    #[test]
    fn canonical_key_ignores_raw_formatting() {
        let a: LogRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"eth_getLogs","params":[{"fromBlock":"0x0","toBlock":"latest"}],"id":1}"#,
        )
        .unwrap();
        let b: LogRequest = serde_json::from_str(
            r#"{
                "id": 1,
                "method": "eth_getLogs",
                "params": [ { "toBlock": "latest", "fromBlock": "0x00" } ],
                "jsonrpc": "2.0"
            }"#,
        )
        .unwrap();
        assert_eq!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
    }

    #[test]
    fn canonical_key_keeps_latest_literal() {
        let req: LogRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"eth_getLogs","params":[{"toBlock":"latest"}],"id":1}"#,
        )
        .unwrap();
        assert!(req.canonical_key().unwrap().contains("\"latest\""));
    }

    #[test]
    fn topic_entries_allow_null_and_alternatives() {
        let f: LogFilter = serde_json::from_str(
            r#"{"topics":[null,"0xAA",["0xBB","0xCC"]]}"#,
        )
        .unwrap();
        let topics = f.topics.unwrap();
        assert!(topics[0].is_none());
        assert_eq!(topics[1].as_ref().unwrap().alternatives(), vec!["0xaa"]);
        assert_eq!(
            topics[2].as_ref().unwrap().alternatives(),
            vec!["0xbb", "0xcc"]
        );
    }

    #[test]
    fn log_round_trips_wire_shape() {
        let raw = r#"{
            "removed": false,
            "logIndex": "0x1",
            "transactionIndex": "0x0",
            "blockNumber": "0x5",
            "blockHash": "0xABCD",
            "address": "0xDEAD",
            "data": "0x00",
            "topics": ["0xFFEE"]
        }"#;
        let log: Log = serde_json::from_str::<Log>(raw).unwrap().normalized();
        assert_eq!(log.block_number, 5);
        assert_eq!(log.address, "0xdead");
        assert_eq!(log.topics, vec!["0xffee"]);
        let wire = serde_json::to_value(&log).unwrap();
        assert_eq!(wire["blockNumber"], "0x5");
        assert_eq!(wire["logIndex"], "0x1");
    }

    #[test]
    fn get_logs_detection_is_case_insensitive() {
        let req: LogRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"ETH_getLogs","params":[],"id":2}"#,
        )
        .unwrap();
        assert!(req.is_get_logs());
    }
}
