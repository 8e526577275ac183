//! Error kinds shared across the proxy.
//!
//! Startup errors (`ConfigInvalid`, and `UpstreamUnreachable` during the initial
//! connectivity check) are fatal. Everything else is recoverable: the router
//! answers an intercepted request by falling through to the upstream node, and
//! the synchroniser logs and retries. The query engine never surfaces an error
//! to a client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("upstream node unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("log store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("requested range not covered by the local index: {0}")]
    NotCovered(String),
    #[error("serialisation failed: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::UpstreamUnreachable(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}
