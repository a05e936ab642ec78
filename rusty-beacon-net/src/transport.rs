//! Transport traits and the in-process implementation.
//!
//! A transport gives the node a [`PeerClient`] per group member: fire one
//! message, open a follow stream, or fetch the chain descriptor. The wire
//! framing behind those calls is interchangeable; [`LocalBus`] routes
//! everything through channels inside one process, which is what the
//! cluster tests and the `simulate` subcommand run on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use rusty_beacon_types::{ChainInfo, FollowEvent};

use crate::message::NodeMessage;
use crate::NetError;

/// Handle to one remote peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fire-and-forget delivery of one message.
    async fn send(&self, msg: NodeMessage) -> Result<(), NetError>;

    /// Open a follow stream from `from_round` onward (the peer's public
    /// query surface).
    async fn follow(&self, from_round: u64) -> Result<mpsc::Receiver<FollowEvent>, NetError>;

    /// The peer's chain descriptor.
    async fn chain_info(&self) -> Result<ChainInfo, NetError>;
}

/// Connection factory, one per node.
pub trait Transport: Send + Sync {
    fn client(&self, address: &str) -> Result<Arc<dyn PeerClient>, NetError>;
}

/// The read-only surface a node exposes to peers and clients; implemented
/// by the node's query service and served verbatim by every transport.
#[async_trait]
pub trait PublicApi: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo, NetError>;
    async fn follow(&self, from_round: u64) -> Result<mpsc::Receiver<FollowEvent>, NetError>;
}

struct LocalEndpoint {
    inbox: mpsc::Sender<NodeMessage>,
    api: Arc<dyn PublicApi>,
}

/// In-process transport: a shared registry of node endpoints.
#[derive(Clone, Default)]
pub struct LocalBus {
    endpoints: Arc<RwLock<HashMap<String, Arc<LocalEndpoint>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node under `address`. Replaces any previous registration,
    /// which is how a restarted node reclaims its slot.
    pub async fn register(
        &self,
        address: &str,
        inbox: mpsc::Sender<NodeMessage>,
        api: Arc<dyn PublicApi>,
    ) {
        self.endpoints
            .write()
            .await
            .insert(address.to_string(), Arc::new(LocalEndpoint { inbox, api }));
    }

    /// Detach a node; subsequent sends to it fail as unreachable.
    pub async fn unregister(&self, address: &str) {
        self.endpoints.write().await.remove(address);
    }
}

struct LocalClient {
    address: String,
    bus: LocalBus,
}

impl LocalClient {
    async fn endpoint(&self) -> Result<Arc<LocalEndpoint>, NetError> {
        self.bus
            .endpoints
            .read()
            .await
            .get(&self.address)
            .cloned()
            .ok_or_else(|| NetError::Unreachable(self.address.clone()))
    }
}

#[async_trait]
impl PeerClient for LocalClient {
    async fn send(&self, msg: NodeMessage) -> Result<(), NetError> {
        let endpoint = self.endpoint().await?;
        endpoint
            .inbox
            .send(msg)
            .await
            .map_err(|_| NetError::Unreachable(self.address.clone()))
    }

    async fn follow(&self, from_round: u64) -> Result<mpsc::Receiver<FollowEvent>, NetError> {
        let endpoint = self.endpoint().await?;
        endpoint.api.follow(from_round).await
    }

    async fn chain_info(&self) -> Result<ChainInfo, NetError> {
        let endpoint = self.endpoint().await?;
        endpoint.api.chain_info().await
    }
}

impl Transport for LocalBus {
    fn client(&self, address: &str) -> Result<Arc<dyn PeerClient>, NetError> {
        // resolution is lazy: the peer may register later or go away;
        // each call on the client checks the registry
        Ok(Arc::new(LocalClient {
            address: address.to_string(),
            bus: self.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_beacon_types::PartialBeacon;

    struct NoApi;

    #[async_trait]
    impl PublicApi for NoApi {
        async fn chain_info(&self) -> Result<ChainInfo, NetError> {
            Err(NetError::Timeout)
        }
        async fn follow(&self, _from: u64) -> Result<mpsc::Receiver<FollowEvent>, NetError> {
            Err(NetError::Timeout)
        }
    }

    #[tokio::test]
    async fn local_bus_routes_messages() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.register("a:1", tx, Arc::new(NoApi)).await;

        let client = bus.client("a:1").unwrap();
        let msg = NodeMessage::Partial(PartialBeacon {
            round: 3,
            signer_index: 1,
            partial_signature: vec![0u8; 48],
        });
        client.send(msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn unregistered_peer_is_unreachable() {
        let bus = LocalBus::new();
        let client = bus.client("gone:1").unwrap();
        let msg = NodeMessage::Partial(PartialBeacon {
            round: 1,
            signer_index: 1,
            partial_signature: vec![],
        });
        assert!(matches!(
            client.send(msg.clone()).await,
            Err(NetError::Unreachable(_))
        ));

        // registration after client creation makes it reachable
        let (tx, mut rx) = mpsc::channel(1);
        bus.register("gone:1", tx, Arc::new(NoApi)).await;
        client.send(msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), msg);

        bus.unregister("gone:1").await;
        assert!(client.send(msg).await.is_err());
    }
}
