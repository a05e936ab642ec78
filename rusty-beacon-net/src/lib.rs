//! Networking edge of the Rusty Beacon node.
//!
//! The wire protocol itself is a collaborator, not part of the core: this
//! crate defines the message set, the [`transport`] traits every transport
//! implements, an in-process implementation used by tests and local
//! clusters, and the gossip [`relay`] that fans freshly produced beacons
//! out to followers.

use thiserror::Error;

pub mod message;
pub mod relay;
pub mod transport;

pub use message::{GossipPacket, NodeMessage};
pub use relay::{Relay, RelayConfig};
pub use transport::{LocalBus, PeerClient, PublicApi, Transport};

/// Transport-layer errors. Retried with backoff by the caller; never fatal
/// at the node level.
#[derive(Debug, Error)]
pub enum NetError {
    /// Peer could not be reached or refused the connection.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Request did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// No transport route for the address.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Message failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for NetError {
    fn from(e: bincode::Error) -> Self {
        NetError::Codec(e.to_string())
    }
}
