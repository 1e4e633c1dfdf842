//! Error types for tnet

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Local State Store Errors ===
    #[error("State store error: {0}")]
    Store(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("State store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("Refusing to record the local node as a remote peer: {0}")]
    SelfReference(String),

    #[error("Replica edge references unknown peer: {0}")]
    UnknownPeer(String),

    // === Content Store Errors ===
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Pin failed for {content_id}: {reason}")]
    Pin { content_id: String, reason: String },

    #[error("Content store error: {0}")]
    ContentStore(String),

    // === Gossip Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Config Errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Does this error leave the local state store in an unknown condition?
    ///
    /// A task that hits a fatal error stops; everything else is logged and
    /// retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::RocksDb(_) | Error::StoreCorrupted(_)
        )
    }

    /// Is this a per-tick failure that the next pass will retry?
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ContentNotFound(_)
                | Error::Pin { .. }
                | Error::ContentStore(_)
                | Error::Http(_)
                | Error::Timeout(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::StoreCorrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_fatal() {
        assert!(Error::Store("poisoned".into()).is_fatal());
        assert!(Error::StoreCorrupted("bad record".into()).is_fatal());
        assert!(!Error::Transport("down".into()).is_fatal());
        assert!(!Error::MalformedMessage("no peer_id".into()).is_fatal());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Transport("down".into()).is_transient());
        assert!(Error::Pin {
            content_id: "cid".into(),
            reason: "unreachable".into()
        }
        .is_transient());
        assert!(!Error::Store("x".into()).is_transient());
        assert!(!Error::InvalidConfig("x".into()).is_transient());
    }
}
