//! Persistence for the Rusty Beacon node: the append-only beacon chain
//! (sled) and the on-disk key material (plain files under the node's base
//! directory).

use thiserror::Error;

pub mod chain;
pub mod keys;

pub use chain::{ChainStore, Cursor};
pub use keys::FileKeyStore;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Append skipped or rewound the round sequence.
    #[error("beacon out of order: expected round {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    /// The exact same `(round, signature)` record is already stored.
    #[error("duplicate beacon for round {0}")]
    Duplicate(u64),

    /// No record for the requested round.
    #[error("no beacon for round {0}")]
    NotFound(u64),

    /// Underlying database failure.
    #[error("storage error: {0}")]
    Db(#[from] sled::Error),

    /// Filesystem failure in the key store.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record did not decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A share on disk does not belong to the group on disk (torn
    /// transactional write, or manual tampering).
    #[error("share/group mismatch: {0}")]
    Mismatch(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}
