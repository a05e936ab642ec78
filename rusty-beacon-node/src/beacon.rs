//! The beacon engine: one round per period, partial-signature aggregation,
//! threshold recovery and the chain append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bls12_381::G2Projective;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use rusty_beacon_crypto::{decode_g2, tbls, Share};
use rusty_beacon_net::{GossipPacket, NodeMessage, Relay, Transport};
use rusty_beacon_store::{ChainStore, StoreError};
use rusty_beacon_types::{Beacon, Group, Hash, PartialBeacon};

use crate::{sync, time, NodeError};

/// Partial-broadcast retry spacing.
const BROADCAST_RETRY: Duration = Duration::from_millis(250);

/// Collects partials for one round; first valid signature per index wins.
struct RoundAggregator {
    msg: Hash,
    partials: HashMap<u32, Vec<u8>>,
}

impl RoundAggregator {
    fn new(msg: Hash) -> Self {
        RoundAggregator {
            msg,
            partials: HashMap::new(),
        }
    }
}

/// Produces one beacon per round for a fixed group/share snapshot. The
/// orchestrator replaces the whole engine at reconfiguration boundaries.
pub struct BeaconEngine {
    address: String,
    group: Group,
    share: Share,
    group_pk: G2Projective,
    chain_hash: Hash,
    chain: Arc<ChainStore>,
    transport: Arc<dyn Transport>,
    relay: Relay,
    beacons_tx: broadcast::Sender<Beacon>,
}

impl BeaconEngine {
    pub fn new(
        address: String,
        group: Group,
        share: Share,
        chain: Arc<ChainStore>,
        transport: Arc<dyn Transport>,
        relay: Relay,
        beacons_tx: broadcast::Sender<Beacon>,
    ) -> Result<Self, NodeError> {
        let group_pk = decode_g2(group.public_key())?;
        let chain_hash = group.chain_hash();
        Ok(BeaconEngine {
            address,
            group,
            share,
            group_pk,
            chain_hash,
            chain,
            transport,
            relay,
            beacons_tx,
        })
    }

    /// Run until shutdown. `partial_rx` carries partials from peers, fed
    /// by the orchestrator's dispatch task.
    pub async fn run(
        self,
        mut partial_rx: mpsc::Receiver<PartialBeacon>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let genesis = self.group.genesis_time;
        let period = self.group.period;
        let mut aggregators: HashMap<u64, RoundAggregator> = HashMap::new();

        // join the round in flight, or wait for round 1
        let now = time::now_unix();
        let mut round = if now < genesis {
            1
        } else {
            time::round_at(now, genesis, period)
        };
        info!(
            "beacon engine up as index {} of {} nodes, starting at round {round}",
            self.share.index,
            self.group.len()
        );

        loop {
            let starts_at = time::time_of_round(round, genesis, period);
            if self
                .wait_for_round(starts_at, &mut partial_rx, &mut aggregators, &mut shutdown)
                .await
                .is_err()
            {
                break;
            }
            self.start_round(round, &mut aggregators, &shutdown).await;
            round += 1;
        }
        info!("beacon engine stopped");
    }

    /// Sleep until the round boundary while feeding arriving partials into
    /// their aggregators.
    async fn wait_for_round(
        &self,
        starts_at: u64,
        partial_rx: &mut mpsc::Receiver<PartialBeacon>,
        aggregators: &mut HashMap<u64, RoundAggregator>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), NodeError> {
        loop {
            let now = time::now_unix();
            if now >= starts_at {
                return Ok(());
            }
            let remaining = Duration::from_secs(starts_at - now);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return Ok(()),
                _ = shutdown.changed() => return Err(NodeError::ShuttingDown),
                partial = partial_rx.recv() => match partial {
                    Some(p) => self.handle_partial(p, aggregators).await,
                    None => return Err(NodeError::ShuttingDown),
                },
            }
        }
    }

    /// Kick off round `round`: catch up if the chain is behind, sign our
    /// partial, broadcast it and count it into the aggregator.
    async fn start_round(
        &self,
        round: u64,
        aggregators: &mut HashMap<u64, RoundAggregator>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let last = match self.chain.last_round() {
            Ok(l) => l,
            Err(e) => {
                warn!("round {round}: chain unavailable: {e}");
                return;
            }
        };

        // rounds whose window closed without a threshold are abandoned
        let stale: Vec<u64> = aggregators.keys().copied().filter(|&r| r < round).collect();
        for r in stale {
            aggregators.remove(&r);
            if r > last {
                warn!("round {r} expired without reaching the threshold");
            }
        }

        if last >= round {
            // gossip or sync already completed this round
            return;
        }

        if last < round - 1 {
            if self.group.scheme.chained() {
                // the round message needs the previous signature first
                if let Err(e) = sync::catch_up(
                    &self.chain,
                    &self.group,
                    &self.transport,
                    &self.address,
                    round - 1,
                    shutdown,
                )
                .await
                {
                    warn!("round {round}: catch-up failed, skipping: {e}");
                    return;
                }
            } else {
                // unchained rounds sign independently; fill the gap in
                // the background
                let chain = self.chain.clone();
                let group = self.group.clone();
                let transport = self.transport.clone();
                let address = self.address.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        sync::catch_up(&chain, &group, &transport, &address, round - 1, &shutdown)
                            .await
                    {
                        debug!("background sync failed: {e}");
                    }
                });
            }
        }

        let msg = match self.round_message(round) {
            Ok(m) => m,
            Err(e) => {
                warn!("round {round}: cannot build message: {e}");
                return;
            }
        };

        let partial = PartialBeacon {
            round,
            signer_index: self.share.index,
            partial_signature: tbls::sign_partial(&self.share.private, &msg),
        };
        debug!("round {round}: broadcasting partial as index {}", self.share.index);
        self.broadcast_partial(partial.clone());
        self.handle_partial(partial, aggregators).await;
    }

    /// The canonical message for `round` under the group's scheme.
    fn round_message(&self, round: u64) -> Result<Hash, NodeError> {
        let previous = if self.group.scheme.chained() {
            self.chain.get(round - 1)?.signature
        } else {
            Vec::new()
        };
        Ok(self.group.scheme.message_for(round, &previous))
    }

    /// Fire-and-forget send to every other group member, with one retry.
    fn broadcast_partial(&self, partial: PartialBeacon) {
        for node in &self.group.nodes {
            if node.address == self.address {
                continue;
            }
            let address = node.address.clone();
            let transport = self.transport.clone();
            let msg = NodeMessage::Partial(partial.clone());
            tokio::spawn(async move {
                for attempt in 0..2 {
                    let client = match transport.client(&address) {
                        Ok(c) => c,
                        Err(_) => return,
                    };
                    match client.send(msg.clone()).await {
                        Ok(()) => return,
                        Err(e) if attempt == 0 => {
                            debug!("partial to {address} failed, retrying: {e}");
                            tokio::time::sleep(BROADCAST_RETRY).await;
                        }
                        Err(e) => debug!("partial to {address} dropped: {e}"),
                    }
                }
            });
        }
    }

    /// Verify and count one partial; completes the round at threshold.
    async fn handle_partial(
        &self,
        partial: PartialBeacon,
        aggregators: &mut HashMap<u64, RoundAggregator>,
    ) {
        let round = partial.round;
        let last = match self.chain.last_round() {
            Ok(l) => l,
            Err(_) => return,
        };
        if round <= last {
            return; // late arrival for a finished round
        }
        let wall = time::round_at(time::now_unix(), self.group.genesis_time, self.group.period);
        if round > wall + 1 {
            debug!("partial for far-future round {round} dropped");
            return;
        }
        if partial.signer_index == 0 || partial.signer_index > self.group.len() as u32 {
            debug!("partial with out-of-range index {} dropped", partial.signer_index);
            return;
        }

        let aggregator = match aggregators.entry(round) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let msg = match self.round_message(round) {
                    Ok(m) => m,
                    Err(_) => {
                        // chained and we lack round-1: sync will fill it
                        debug!("partial for round {round} arrived before its chain context");
                        return;
                    }
                };
                v.insert(RoundAggregator::new(msg))
            }
        };

        if aggregator.partials.contains_key(&partial.signer_index) {
            return; // first valid partial per index wins
        }
        if let Err(e) = tbls::verify_partial(
            &self.share.public,
            partial.signer_index,
            &aggregator.msg,
            &partial.partial_signature,
        ) {
            debug!(
                "invalid partial for round {round} from index {}: {e}",
                partial.signer_index
            );
            return;
        }
        aggregator
            .partials
            .insert(partial.signer_index, partial.partial_signature);

        let threshold = self.group.threshold as usize;
        if aggregator.partials.len() >= threshold {
            let partials: Vec<(u32, Vec<u8>)> = aggregator
                .partials
                .iter()
                .map(|(i, s)| (*i, s.clone()))
                .collect();
            let msg = aggregator.msg;
            match self.finalize_round(round, &msg, &partials) {
                Ok(()) => {
                    aggregators.retain(|&r, _| r > round);
                }
                Err(e) => debug!("round {round} not finalized: {e}"),
            }
        }
    }

    /// Recover the threshold signature, verify it against the group key
    /// and append. The final verification is non-negotiable: an invalid
    /// signature must never reach the chain.
    fn finalize_round(
        &self,
        round: u64,
        msg: &Hash,
        partials: &[(u32, Vec<u8>)],
    ) -> Result<(), NodeError> {
        let threshold = self.group.threshold as usize;
        let signature = tbls::recover(threshold, partials)?;
        tbls::verify(&self.group_pk, msg, &signature)?;

        let previous = self.chain.get(round - 1)?;
        let beacon = Beacon {
            round,
            previous_signature: previous.signature,
            signature,
        };

        match self.chain.put(&beacon) {
            Ok(()) => {}
            // sync or gossip got there first; same round, same signature
            Err(StoreError::Duplicate(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!(
            "round {round} complete, randomness {}",
            hex::encode(&beacon.randomness()[..8])
        );

        let _ = self.beacons_tx.send(beacon.clone());
        let packet = GossipPacket::new(&self.chain_hash, beacon);
        let relay = self.relay.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.publish(packet).await {
                debug!("relay publish failed: {e}");
            }
        });
        Ok(())
    }
}
