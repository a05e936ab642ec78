//! Shared data model and wire types for the Rusty Beacon network.
//!
//! Everything that crosses a crate boundary or the wire lives here:
//! identities and groups, beacons and partial beacons, DKG packets and the
//! chain descriptor. Encoding is bincode for the wire and the chain store;
//! the structs stay encoding-agnostic.

use serde::{Deserialize, Serialize};

pub mod beacon;
pub mod dkg;
pub mod group;
pub mod scheme;

pub use beacon::{Beacon, FollowEvent, PartialBeacon};
pub use dkg::{DkgPacket, DkgPayload, DkgPhase, SessionId};
pub use group::{ChainInfo, Group, GroupProposal, Identity};
pub use scheme::Scheme;

/// 32-byte digest used throughout the protocol.
pub type Hash = [u8; 32];

/// Compressed G2 point bytes (public keys, polynomial commitments).
pub const G2_SIZE: usize = 96;
/// Compressed G1 point bytes (signatures, partial signatures).
pub const G1_SIZE: usize = 48;

/// Big-endian encoding of a round number, the canonical integer form in
/// every hashed message.
pub fn round_bytes(round: u64) -> [u8; 8] {
    round.to_be_bytes()
}

/// Top-level phase of a node, reported over the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    /// Keys loaded, no group yet.
    Bootstrapping,
    /// Waiting for a DKG to be triggered or to finish.
    AwaitingDkg,
    /// Beacon engine running with the current group.
    RunningBeacon,
    /// Resharing in progress; beacon keeps running on the old share.
    Resharing,
    /// Shut down.
    Stopped,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodePhase::Bootstrapping => "bootstrapping",
            NodePhase::AwaitingDkg => "awaiting-dkg",
            NodePhase::RunningBeacon => "running",
            NodePhase::Resharing => "resharing",
            NodePhase::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Node status snapshot returned by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub phase: NodePhase,
    pub last_round: u64,
    pub chain_hash: Hash,
    pub peers_reachable: usize,
}

/// Errors for group and identity validation.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("threshold {threshold} out of bounds for {nodes} nodes")]
    BadThreshold { threshold: u32, nodes: usize },
    #[error("duplicate address in group: {0}")]
    DuplicateAddress(String),
    #[error("address not in group: {0}")]
    UnknownAddress(String),
    #[error("empty group")]
    Empty,
}
