//! The node orchestrator: owns the stores, supervises the engines and
//! exposes the remote control surface.
//!
//! Only the orchestrator writes the key store; engines receive immutable
//! group/share snapshots and are replaced whole at reconfiguration
//! boundaries (DKG completion, reshare completion, shutdown).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use rusty_beacon_crypto::{KeyPair, PublicPoly, Share};
use rusty_beacon_dkg::{run_session, DkgBoard, DkgSession, OldGroup};
use rusty_beacon_net::{
    GossipPacket, NodeMessage, PublicApi, Relay, RelayConfig, Transport,
};
use rusty_beacon_store::{ChainStore, FileKeyStore, StoreError};
use rusty_beacon_types::{
    Beacon, DkgPacket, Group, GroupProposal, Identity, NodePhase, NodeStatus, PartialBeacon,
    SessionId,
};

use crate::beacon::BeaconEngine;
use crate::query::QueryService;
use crate::{sync, NodeError};

/// How long a peer gets to answer the status ping.
const PING_TIMEOUT: Duration = Duration::from_millis(500);
/// DKG packets parked until the local session starts.
const PENDING_DKG_CAP: usize = 256;

/// Static node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable dial address, also this node's identity address.
    pub address: String,
    /// Whether peers should dial us with TLS.
    pub tls: bool,
    /// Base directory for keys, group and chain.
    pub base_dir: PathBuf,
    pub relay: RelayConfig,
}

/// One beacon node.
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    keys: FileKeyStore,
    chain: Arc<ChainStore>,
    transport: Arc<dyn Transport>,
    phase: RwLock<NodePhase>,
    group: Arc<RwLock<Option<Group>>>,
    share: RwLock<Option<Share>>,
    beacons_tx: broadcast::Sender<Beacon>,
    relay: Relay,
    query: Arc<QueryService>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    inbox_tx: mpsc::Sender<NodeMessage>,
    partial_tx: RwLock<Option<mpsc::Sender<PartialBeacon>>>,
    dkg_tx: RwLock<Option<mpsc::Sender<DkgPacket>>>,
    pending_dkg: Mutex<VecDeque<DkgPacket>>,
    engine_stop: RwLock<Option<watch::Sender<bool>>>,
}

impl Node {
    /// Boot a node: load or create keys, open the stores, spawn the
    /// message dispatch and gossip tasks, and resume the beacon if a
    /// group and share are already on disk.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Node>, NodeError> {
        let keys = FileKeyStore::open(&config.base_dir)?;
        let keypair = if keys.has_keypair() {
            keys.load_keypair()?
        } else {
            info!("no long-term key found, generating one");
            let kp = KeyPair::generate(&mut OsRng);
            keys.save_keypair(&kp)?;
            kp
        };
        let chain = Arc::new(ChainStore::open(config.base_dir.join("chain"))?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (beacons_tx, _) = broadcast::channel(64);
        let group: Arc<RwLock<Option<Group>>> = Arc::new(RwLock::new(None));
        let (relay, deliveries) = Relay::new(
            config.relay.clone(),
            transport.clone(),
            None,
            shutdown_rx.clone(),
        );
        let query = Arc::new(QueryService::new(
            chain.clone(),
            group.clone(),
            beacons_tx.clone(),
        ));
        let (inbox_tx, inbox_rx) = mpsc::channel(256);

        let node = Arc::new(Node {
            config,
            keypair,
            keys,
            chain,
            transport,
            phase: RwLock::new(NodePhase::Bootstrapping),
            group,
            share: RwLock::new(None),
            beacons_tx,
            relay,
            query,
            shutdown_tx,
            shutdown_rx: shutdown_rx.clone(),
            inbox_tx,
            partial_tx: RwLock::new(None),
            dkg_tx: RwLock::new(None),
            pending_dkg: Mutex::new(VecDeque::new()),
            engine_stop: RwLock::new(None),
        });

        tokio::spawn(node.clone().dispatch(inbox_rx, shutdown_rx.clone()));
        tokio::spawn(node.clone().apply_gossip(deliveries, shutdown_rx));

        node.recover().await?;
        Ok(node)
    }

    /// Crash recovery: resume the beacon from persisted state, discard any
    /// dangling DKG snapshot (its deadline has long passed).
    async fn recover(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.keys.load_dkg_state()?.is_some() {
            warn!("discarding stale in-flight dkg state from a previous run");
            self.keys.clear_dkg_state()?;
        }

        if !self.keys.has_group() {
            *self.phase.write().await = NodePhase::AwaitingDkg;
            info!("no group on disk, awaiting dkg");
            return Ok(());
        }

        let group = self.keys.load_group()?;
        group.validate()?;
        let share = self.keys.load_share(&group)?;
        self.chain.put_genesis(&group.genesis_seed)?;
        info!(
            "resuming beacon for chain {} at round {}",
            hex::encode(&group.chain_hash()[..8]),
            self.chain.last_round()?
        );
        self.install_group(group, share).await
    }

    /// The sender the transport host wires inbound messages into.
    pub fn inbox(&self) -> mpsc::Sender<NodeMessage> {
        self.inbox_tx.clone()
    }

    /// The public query surface, for transports to serve.
    pub fn public_api(self: &Arc<Self>) -> Arc<dyn PublicApi> {
        self.query.clone()
    }

    pub fn query(&self) -> Arc<QueryService> {
        self.query.clone()
    }

    /// This node's self-signed identity.
    pub fn identity(&self) -> Identity {
        self.keypair
            .identity(self.config.address.clone(), self.config.tls)
    }

    /// Subscribe to locally appended beacons.
    pub fn beacons(&self) -> broadcast::Receiver<Beacon> {
        self.beacons_tx.subscribe()
    }

    /// Route inbound messages to the right engine.
    async fn dispatch(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<NodeMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbox.recv() => {
                    let msg = match msg {
                        Some(m) => m,
                        None => break,
                    };
                    match msg {
                        NodeMessage::Partial(partial) => {
                            let guard = self.partial_tx.read().await;
                            if let Some(tx) = guard.as_ref() {
                                // bounded by group size; overflow means
                                // duplicates or late arrivals, dropped
                                let _ = tx.try_send(partial);
                            }
                        }
                        NodeMessage::Dkg(packet) => {
                            let guard = self.dkg_tx.read().await;
                            match guard.as_ref() {
                                Some(tx) => {
                                    let _ = tx.send(packet).await;
                                }
                                None => {
                                    // session not started yet; park it
                                    let mut pending = self
                                        .pending_dkg
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner());
                                    if pending.len() >= PENDING_DKG_CAP {
                                        pending.pop_front();
                                    }
                                    pending.push_back(packet);
                                }
                            }
                        }
                        NodeMessage::Gossip(packet) => {
                            self.relay.ingest(packet).await;
                        }
                    }
                }
            }
        }
        debug!("dispatch task stopped");
    }

    /// Verify and append beacons delivered by the relay.
    async fn apply_gossip(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<GossipPacket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let packet = tokio::select! {
                _ = shutdown.changed() => break,
                p = deliveries.recv() => match p {
                    Some(p) => p,
                    None => break,
                },
            };
            let group = { self.group.read().await.clone() };
            let group = match group {
                Some(g) => g,
                None => continue,
            };
            let group_pk = match rusty_beacon_crypto::decode_g2(group.public_key()) {
                Ok(pk) => pk,
                Err(_) => continue,
            };
            let beacon = packet.beacon;
            if beacon.round == 0 {
                continue;
            }
            if let Err(e) = sync::verify_beacon(&self.chain, &group, &group_pk, &beacon) {
                debug!("gossip beacon for round {} rejected: {e}", beacon.round);
                continue;
            }
            match self.chain.put(&beacon) {
                Ok(()) => {
                    let _ = self.beacons_tx.send(beacon);
                }
                Err(StoreError::Duplicate(_)) => {}
                Err(e) => debug!("gossip beacon not appended: {e}"),
            }
        }
        debug!("gossip apply task stopped");
    }

    /// Install a new group/share pair and (re)start the beacon engine.
    async fn install_group(self: &Arc<Self>, group: Group, share: Share) -> Result<(), NodeError> {
        let recommended =
            RelayConfig::recommended_buffer(group.len(), self.config.relay.fanout);
        if self.config.relay.buffer_size < recommended {
            warn!(
                "relay dedup buffer {} below the safe bound {} for this group",
                self.config.relay.buffer_size, recommended
            );
        }
        let peers: Vec<String> = group
            .nodes
            .iter()
            .map(|n| n.address.clone())
            .filter(|a| *a != self.config.address)
            .collect();
        self.relay.new_neighbors(peers).await;

        // stop the previous engine before the new one takes the chain
        if let Some(stop) = self.engine_stop.write().await.take() {
            let _ = stop.send(true);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (partial_tx, partial_rx) = mpsc::channel(group.len().max(1) * 2);
        let engine = BeaconEngine::new(
            self.config.address.clone(),
            group.clone(),
            share.clone(),
            self.chain.clone(),
            self.transport.clone(),
            self.relay.clone(),
            self.beacons_tx.clone(),
        )?;

        *self.group.write().await = Some(group);
        *self.share.write().await = Some(share);
        *self.partial_tx.write().await = Some(partial_tx);
        *self.engine_stop.write().await = Some(stop_tx);
        *self.phase.write().await = NodePhase::RunningBeacon;

        tokio::spawn(engine.run(partial_rx, stop_rx));
        Ok(())
    }

    /// Initiate a fresh DKG with the given proposal and session timeout.
    /// Every participant must be told the same proposal and timeout.
    pub async fn init_dkg(
        self: &Arc<Self>,
        proposal: GroupProposal,
        as_leader: bool,
        timeout: Duration,
    ) -> Result<Group, NodeError> {
        {
            let phase = *self.phase.read().await;
            if !matches!(phase, NodePhase::AwaitingDkg | NodePhase::Bootstrapping) {
                return Err(NodeError::WrongPhase(phase.to_string()));
            }
        }
        proposal.validate()?;
        let session_id = SessionId::derive(&proposal.digest()?, timeout.as_secs());
        if as_leader {
            info!("leading dkg session {session_id} with {} nodes", proposal.nodes.len());
        } else {
            info!("joining dkg session {session_id}");
        }

        let peers = session_peers(&proposal.nodes, None, &self.config.address);
        let session = DkgSession::fresh(self.keypair.clone(), proposal, session_id)?;
        let output = self.run_dkg(session, peers, timeout).await?;

        let share = output.share.ok_or(NodeError::NoGroup)?;
        self.keys.save_group_and_share(&output.group, &share)?;
        self.chain.put_genesis(&output.group.genesis_seed)?;
        info!(
            "dkg complete, chain {}",
            hex::encode(&output.group.chain_hash()[..8])
        );
        self.install_group(output.group.clone(), share).await?;
        Ok(output.group)
    }

    /// Initiate a reshare from `old_group` (ours by default) to the new
    /// proposal. Joining nodes pass the old group descriptor they fetched
    /// from the running network.
    pub async fn init_reshare(
        self: &Arc<Self>,
        old_group: Option<Group>,
        proposal: GroupProposal,
        as_leader: bool,
        timeout: Duration,
    ) -> Result<Group, NodeError> {
        let our_group = { self.group.read().await.clone() };
        let old_group = match old_group.or(our_group) {
            Some(g) => g,
            None => return Err(NodeError::NoGroup),
        };
        proposal.validate()?;

        let old_public = PublicPoly::from_bytes(&old_group.commits)?;
        let old_share = { self.share.read().await.clone() };
        let session_id = SessionId::derive(&proposal.digest()?, timeout.as_secs());
        if as_leader {
            info!("leading reshare session {session_id}");
        } else {
            info!("joining reshare session {session_id}");
        }

        {
            let mut phase = self.phase.write().await;
            if *phase == NodePhase::RunningBeacon {
                *phase = NodePhase::Resharing;
            }
        }

        let peers = session_peers(
            &proposal.nodes,
            Some(old_group.nodes.as_slice()),
            &self.config.address,
        );
        let old = OldGroup {
            group: old_group,
            public: old_public,
            share: old_share,
        };
        let session =
            DkgSession::reshare(self.keypair.clone(), old, proposal, session_id)?;
        let result = self.run_dkg(session, peers, timeout).await;

        let output = match result {
            Ok(o) => o,
            Err(e) => {
                // the old group and share stay in force
                let mut phase = self.phase.write().await;
                if *phase == NodePhase::Resharing {
                    *phase = NodePhase::RunningBeacon;
                }
                return Err(e);
            }
        };

        match output.share {
            Some(share) => {
                self.keys.save_group_and_share(&output.group, &share)?;
                self.chain.put_genesis(&output.group.genesis_seed)?;
                info!("reshare complete, share index {}", share.index);
                self.install_group(output.group.clone(), share).await?;
            }
            None => {
                // we dealt but are not part of the new group
                info!("reshare complete, this node leaves the group");
                if let Some(stop) = self.engine_stop.write().await.take() {
                    let _ = stop.send(true);
                }
                *self.phase.write().await = NodePhase::AwaitingDkg;
            }
        }
        Ok(output.group)
    }

    /// Common DKG/reshare session execution.
    async fn run_dkg(
        self: &Arc<Self>,
        session: DkgSession,
        peers: Vec<String>,
        timeout: Duration,
    ) -> Result<rusty_beacon_dkg::DkgOutput, NodeError> {
        self.keys.save_dkg_state(&session.snapshot()?)?;

        let (dkg_tx, dkg_rx) = mpsc::channel(256);
        *self.dkg_tx.write().await = Some(dkg_tx.clone());
        // replay packets that raced the session start
        let parked: Vec<DkgPacket> = {
            let mut pending = self.pending_dkg.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        for packet in parked {
            let _ = dkg_tx.send(packet).await;
        }

        let board = Arc::new(TransportBoard {
            transport: self.transport.clone(),
            peers,
        });
        let phase_timeout = timeout / 3;
        let result = run_session(
            session,
            board,
            dkg_rx,
            phase_timeout,
            self.shutdown_rx.clone(),
            &mut OsRng,
        )
        .await;

        *self.dkg_tx.write().await = None;
        self.keys.clear_dkg_state()?;
        Ok(result?)
    }

    /// Current share (authenticated local call).
    pub async fn share(&self) -> Result<Share, NodeError> {
        self.share.read().await.clone().ok_or(NodeError::NoGroup)
    }

    /// Current group descriptor.
    pub async fn group_file(&self) -> Result<Group, NodeError> {
        self.group.read().await.clone().ok_or(NodeError::NoGroup)
    }

    /// Phase, chain tip and peer reachability.
    pub async fn status(&self) -> NodeStatus {
        let phase = *self.phase.read().await;
        let last_round = self.chain.last_round().unwrap_or(0);
        let group = { self.group.read().await.clone() };
        let (chain_hash, peers_reachable) = match group {
            None => ([0u8; 32], 0),
            Some(g) => {
                let mut reachable = 0;
                for node in &g.nodes {
                    if node.address == self.config.address {
                        continue;
                    }
                    let ok = match self.transport.client(&node.address) {
                        Ok(client) => {
                            tokio::time::timeout(PING_TIMEOUT, client.chain_info())
                                .await
                                .map(|r| r.is_ok())
                                .unwrap_or(false)
                        }
                        Err(_) => false,
                    };
                    if ok {
                        reachable += 1;
                    }
                }
                (g.chain_hash(), reachable)
            }
        };
        NodeStatus {
            phase,
            last_round,
            chain_hash,
            peers_reachable,
        }
    }

    /// Graceful stop: stop the engines, flush the chain, release the
    /// transport.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        info!("shutting down");
        if let Some(stop) = self.engine_stop.write().await.take() {
            let _ = stop.send(true);
        }
        let _ = self.shutdown_tx.send(true);
        self.chain.flush()?;
        *self.phase.write().await = NodePhase::Stopped;
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }
}

/// Union of dealer and holder addresses, minus our own.
fn session_peers(
    holders: &[Identity],
    dealers: Option<&[Identity]>,
    own_address: &str,
) -> Vec<String> {
    let mut peers: Vec<String> = holders
        .iter()
        .chain(dealers.unwrap_or(&[]).iter())
        .map(|n| n.address.clone())
        .filter(|a| a != own_address)
        .collect();
    peers.sort();
    peers.dedup();
    peers
}

/// Broadcasts DKG packets to every session participant over the transport.
struct TransportBoard {
    transport: Arc<dyn Transport>,
    peers: Vec<String>,
}

#[async_trait]
impl DkgBoard for TransportBoard {
    async fn broadcast(&self, packet: DkgPacket) {
        for address in &self.peers {
            let client = match self.transport.client(address) {
                Ok(c) => c,
                Err(e) => {
                    debug!("dkg broadcast: no route to {address}: {e}");
                    continue;
                }
            };
            if let Err(e) = client.send(NodeMessage::Dkg(packet.clone())).await {
                debug!("dkg broadcast to {address} failed: {e}");
            }
        }
    }
}
