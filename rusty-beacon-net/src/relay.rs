//! Best-effort gossip relay with bounded dedup.
//!
//! Locally produced beacons go out on a priority lane that is never
//! dropped; re-forwarded gossip rides a rate-limited lane that sheds load
//! under pressure. Dedup is an insertion-order LRU over recent message
//! ids: once an id falls off the ring its reappearance counts as new,
//! which is acceptable because beacon ids are unique `(chain_hash, round)`
//! digests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch, RwLock};

use rusty_beacon_types::Hash;

use crate::message::{GossipPacket, NodeMessage};
use crate::transport::Transport;
use crate::NetError;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Neighbors each message fans out to.
    pub fanout: usize,
    /// Recent message ids remembered for dedup.
    pub buffer_size: usize,
    /// Bound on queued re-forwarded messages.
    pub rate_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fanout: 12,
            buffer_size: 100,
            rate_limit: 20,
        }
    }
}

impl RelayConfig {
    /// The safe dedup capacity for a group of `n` nodes: two full fanout
    /// generations must fit inside the ring.
    pub fn recommended_buffer(n: usize, fanout: usize) -> usize {
        2 * n * fanout
    }
}

/// Insertion-order LRU set of message ids.
struct SeenCache {
    capacity: usize,
    order: VecDeque<Hash>,
    set: HashSet<Hash>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        SeenCache {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`; returns false when it was already present.
    fn insert(&mut self, id: Hash) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct Shared {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    neighbors: RwLock<Vec<String>>,
    seen: Mutex<SeenCache>,
    delivery_tx: mpsc::Sender<GossipPacket>,
    priority_tx: mpsc::Sender<GossipPacket>,
    gossip_tx: mpsc::Sender<GossipPacket>,
}

/// Fanout pub-sub of beacons over the node's transport.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

impl Relay {
    /// Create the relay and spawn its sender task. Returns the relay and
    /// the local delivery stream (arrival order, not restartable).
    pub fn new(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        group_size_hint: Option<usize>,
        shutdown: watch::Receiver<bool>,
    ) -> (Relay, mpsc::Receiver<GossipPacket>) {
        if let Some(n) = group_size_hint {
            let recommended = RelayConfig::recommended_buffer(n, config.fanout);
            if config.buffer_size < recommended {
                warn!(
                    "relay dedup buffer {} below the safe bound {} for {} nodes",
                    config.buffer_size, recommended, n
                );
            }
        }

        let (delivery_tx, delivery_rx) = mpsc::channel(64);
        let (priority_tx, priority_rx) = mpsc::channel(config.rate_limit.max(1));
        let (gossip_tx, gossip_rx) = mpsc::channel(config.rate_limit.max(1));
        let seen = Mutex::new(SeenCache::new(config.buffer_size));
        let shared = Arc::new(Shared {
            config,
            transport,
            neighbors: RwLock::new(Vec::new()),
            seen,
            delivery_tx,
            priority_tx,
            gossip_tx,
        });

        tokio::spawn(sender_loop(shared.clone(), priority_rx, gossip_rx, shutdown));
        (Relay { shared }, delivery_rx)
    }

    /// Inject a locally produced message: recorded for dedup and sent on
    /// the priority lane, which is never shed.
    pub async fn publish(&self, packet: GossipPacket) -> Result<(), NetError> {
        {
            let mut seen = self.shared.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.insert(packet.id);
        }
        self.shared
            .priority_tx
            .send(packet)
            .await
            .map_err(|_| NetError::Unreachable("relay closed".to_string()))
    }

    /// Feed an incoming packet: if its id is new, deliver locally and
    /// queue a re-forward; otherwise drop it.
    pub async fn ingest(&self, packet: GossipPacket) {
        let fresh = {
            let mut seen = self.shared.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.insert(packet.id)
        };
        if !fresh {
            debug!("relay: duplicate {} dropped", hex::encode(&packet.id[..8]));
            return;
        }
        if self.shared.delivery_tx.send(packet.clone()).await.is_err() {
            return;
        }
        // forwarding is best effort: overflow sheds gossip, never delivery
        if let Err(mpsc::error::TrySendError::Full(p)) = self.shared.gossip_tx.try_send(packet) {
            debug!(
                "relay: rate limited, not re-forwarding {}",
                hex::encode(&p.id[..8])
            );
        }
    }

    /// Atomically replace the neighbor set the fanout samples from.
    pub async fn new_neighbors(&self, peers: Vec<String>) {
        *self.shared.neighbors.write().await = peers;
    }
}

async fn sender_loop(
    shared: Arc<Shared>,
    mut priority_rx: mpsc::Receiver<GossipPacket>,
    mut gossip_rx: mpsc::Receiver<GossipPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(packet) = priority_rx.recv() => forward(&shared, packet).await,
            Some(packet) = gossip_rx.recv() => forward(&shared, packet).await,
            else => break,
        }
    }
    debug!("relay sender stopped");
}

/// Send to a fresh fanout sample of the current neighbors.
async fn forward(shared: &Shared, packet: GossipPacket) {
    let sample: Vec<String> = {
        let neighbors = shared.neighbors.read().await;
        neighbors
            .choose_multiple(&mut rand::thread_rng(), shared.config.fanout)
            .cloned()
            .collect()
    };
    for address in sample {
        let client = match shared.transport.client(&address) {
            Ok(c) => c,
            Err(e) => {
                debug!("relay: no route to {address}: {e}");
                continue;
            }
        };
        if let Err(e) = client.send(NodeMessage::Gossip(packet.clone())).await {
            debug!("relay: forward to {address} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerClient;
    use async_trait::async_trait;
    use rusty_beacon_types::{Beacon, ChainInfo, FollowEvent};
    use std::time::Duration;

    fn packet(round: u64) -> GossipPacket {
        GossipPacket::new(
            &[9u8; 32],
            Beacon {
                round,
                previous_signature: vec![0u8; 48],
                signature: vec![round as u8; 48],
            },
        )
    }

    #[test]
    fn seen_cache_dedups_and_evicts() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert([1u8; 32]));
        assert!(!cache.insert([1u8; 32]));
        assert!(cache.insert([2u8; 32]));
        // third insert evicts the oldest id
        assert!(cache.insert([3u8; 32]));
        assert!(cache.insert([1u8; 32]), "evicted id must count as new");
    }

    #[derive(Clone, Default)]
    struct CaptureTransport {
        sent: Arc<Mutex<Vec<(String, NodeMessage)>>>,
    }

    struct CaptureClient {
        address: String,
        sent: Arc<Mutex<Vec<(String, NodeMessage)>>>,
    }

    #[async_trait]
    impl PeerClient for CaptureClient {
        async fn send(&self, msg: NodeMessage) -> Result<(), NetError> {
            self.sent.lock().unwrap().push((self.address.clone(), msg));
            Ok(())
        }
        async fn follow(
            &self,
            _from: u64,
        ) -> Result<mpsc::Receiver<FollowEvent>, NetError> {
            Err(NetError::Timeout)
        }
        async fn chain_info(&self) -> Result<ChainInfo, NetError> {
            Err(NetError::Timeout)
        }
    }

    impl Transport for CaptureTransport {
        fn client(&self, address: &str) -> Result<Arc<dyn PeerClient>, NetError> {
            Ok(Arc::new(CaptureClient {
                address: address.to_string(),
                sent: self.sent.clone(),
            }))
        }
    }

    async fn wait_for_sends(
        transport: &CaptureTransport,
        at_least: usize,
    ) -> Vec<(String, NodeMessage)> {
        for _ in 0..100 {
            {
                let sent = transport.sent.lock().unwrap();
                if sent.len() >= at_least {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transport.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn publish_fans_out_to_a_sample() {
        let transport = CaptureTransport::default();
        let (_tx, shutdown) = watch::channel(false);
        let config = RelayConfig {
            fanout: 3,
            ..Default::default()
        };
        let (relay, _deliveries) =
            Relay::new(config, Arc::new(transport.clone()), Some(5), shutdown);
        relay
            .new_neighbors((0..5).map(|i| format!("n{i}:1")).collect())
            .await;

        relay.publish(packet(1)).await.unwrap();
        let sent = wait_for_sends(&transport, 3).await;
        assert_eq!(sent.len(), 3);
        // distinct neighbors
        let mut addrs: Vec<&String> = sent.iter().map(|(a, _)| a).collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 3);
    }

    #[tokio::test]
    async fn ingest_delivers_once_and_reforwards() {
        let transport = CaptureTransport::default();
        let (_tx, shutdown) = watch::channel(false);
        let config = RelayConfig {
            fanout: 2,
            ..Default::default()
        };
        let (relay, mut deliveries) =
            Relay::new(config, Arc::new(transport.clone()), None, shutdown);
        relay
            .new_neighbors(vec!["a:1".to_string(), "b:1".to_string()])
            .await;

        let p = packet(4);
        relay.ingest(p.clone()).await;
        relay.ingest(p.clone()).await; // duplicate

        assert_eq!(deliveries.recv().await.unwrap(), p);
        // the duplicate produced no second delivery
        assert!(deliveries.try_recv().is_err());

        let sent = wait_for_sends(&transport, 2).await;
        assert_eq!(sent.len(), 2, "one fanout generation, not two");
    }

    #[tokio::test]
    async fn publish_of_an_ingested_id_is_deduped_on_ingest() {
        let transport = CaptureTransport::default();
        let (_tx, shutdown) = watch::channel(false);
        let (relay, mut deliveries) = Relay::new(
            RelayConfig::default(),
            Arc::new(transport.clone()),
            None,
            shutdown,
        );

        relay.publish(packet(7)).await.unwrap();
        // the same beacon coming back from a neighbor is dropped
        relay.ingest(packet(7)).await;
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn gossip_overflow_never_sheds_delivery() {
        let transport = CaptureTransport::default();
        // sender task sees shutdown immediately and exits, so the gossip
        // lane fills up while deliveries keep flowing
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = RelayConfig {
            rate_limit: 2,
            ..Default::default()
        };
        let (relay, mut deliveries) =
            Relay::new(config, Arc::new(transport.clone()), None, shutdown);

        for round in 0..5 {
            relay.ingest(packet(round)).await;
        }
        for _ in 0..5 {
            assert!(deliveries.recv().await.is_some());
        }
    }
}
