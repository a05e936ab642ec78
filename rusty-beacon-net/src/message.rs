//! The node-to-node message set.

use serde::{Deserialize, Serialize};

use rusty_beacon_types::{Beacon, DkgPacket, Hash, PartialBeacon};

use crate::NetError;

/// A beacon in flight through the relay, tagged with its dedup id
/// (`blake3(chain_hash || be64(round))`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPacket {
    pub id: Hash,
    pub beacon: Beacon,
}

impl GossipPacket {
    pub fn new(chain_hash: &Hash, beacon: Beacon) -> Self {
        GossipPacket {
            id: beacon.message_id(chain_hash),
            beacon,
        }
    }
}

/// Everything one node sends another outside the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// A signer's contribution to the current round.
    Partial(PartialBeacon),
    /// DKG/resharing traffic.
    Dkg(DkgPacket),
    /// A completed beacon being relayed.
    Gossip(GossipPacket),
}

impl NodeMessage {
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
