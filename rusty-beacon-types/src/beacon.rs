//! Beacon and partial-beacon records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{round_bytes, Hash};

/// One emitted round: the threshold signature plus its chain bookkeeping.
///
/// `randomness` is not stored; it is recomputed as `sha256(signature)` on
/// demand so the chain record stays canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    /// Round number, starting at 1 (0 is the genesis record).
    pub round: u64,
    /// Signature of round `round - 1`. Persisted for every scheme, but only
    /// an input to signing under the chained scheme.
    #[serde(with = "serde_bytes")]
    pub previous_signature: Vec<u8>,
    /// Threshold BLS signature over the scheme's message for `round`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Beacon {
    /// The public random output for this round.
    pub fn randomness(&self) -> Hash {
        Sha256::digest(&self.signature).into()
    }

    /// Globally unique message id for gossip dedup: `blake3(chain_hash || be64(round))`.
    pub fn message_id(&self, chain_hash: &Hash) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(chain_hash);
        hasher.update(&round_bytes(self.round));
        *hasher.finalize().as_bytes()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// One item of a follow stream.
///
/// `SkippedTo` tells a slow follower the stream jumped ahead to keep
/// memory bounded; the follower reopens from an earlier round if it needs
/// the gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowEvent {
    Beacon(Beacon),
    SkippedTo(u64),
}

/// One participant's contribution to a round, signed with its share.
///
/// Lives only until the round's aggregator reaches the threshold or the
/// round window closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBeacon {
    pub round: u64,
    /// 1-based signing index of the sender in the current group.
    pub signer_index: u32,
    /// Partial BLS signature, compressed G1.
    #[serde(with = "serde_bytes")]
    pub partial_signature: Vec<u8>,
}
