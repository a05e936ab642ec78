//! The Rusty Beacon node: round scheduling and partial-signature
//! aggregation, peer catch-up, the public query surface and the
//! orchestrator that supervises DKG → beacon → reshare → beacon.

use thiserror::Error;

pub mod beacon;
pub mod orchestrator;
pub mod query;
pub mod sync;
pub mod time;

pub use orchestrator::{Node, NodeConfig};
pub use query::QueryService;

use rusty_beacon_crypto::CryptoError;
use rusty_beacon_dkg::DkgError;
use rusty_beacon_net::NetError;
use rusty_beacon_store::StoreError;
use rusty_beacon_types::GroupError;

/// Top-level node errors; lower layers keep their typed errors and the
/// orchestrator decides what is fatal.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dkg error: {0}")]
    Dkg(#[from] DkgError),

    #[error("transport error: {0}")]
    Net(#[from] NetError),

    #[error("group error: {0}")]
    Group(#[from] GroupError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Operation needs a group but no DKG has completed yet.
    #[error("no group configured")]
    NoGroup,

    /// Control operation not valid in the current phase.
    #[error("invalid in phase {0}")]
    WrongPhase(String),

    /// Catch-up exhausted every peer without reaching the target round.
    #[error("sync failed: no peer could serve rounds up to {0}")]
    SyncFailed(u64),

    /// Node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}
