//! Catch-up: pull missing beacons from peers and verify before appending.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use tokio::sync::watch;

use rusty_beacon_crypto::{decode_g2, tbls};
use rusty_beacon_net::Transport;
use rusty_beacon_store::{ChainStore, StoreError};
use rusty_beacon_types::{Beacon, FollowEvent, Group};

use crate::NodeError;

/// Pause between peers after a failed attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Pull beacons until the chain holds `target` (inclusive). Peers are
/// tried in random order; a peer serving a beacon that fails verification
/// is dropped immediately.
pub async fn catch_up(
    chain: &ChainStore,
    group: &Group,
    transport: &Arc<dyn Transport>,
    own_address: &str,
    target: u64,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), NodeError> {
    if chain.last_round()? >= target {
        return Ok(());
    }
    let group_pk = decode_g2(group.public_key())?;

    let mut peers: Vec<String> = group
        .nodes
        .iter()
        .map(|n| n.address.clone())
        .filter(|a| a != own_address)
        .collect();
    peers.shuffle(&mut rand::thread_rng());

    info!(
        "sync: chain at {}, target {}, {} peers",
        chain.last_round()?,
        target,
        peers.len()
    );

    for address in &peers {
        if *shutdown.borrow() {
            return Err(NodeError::ShuttingDown);
        }
        match pull_from(chain, group, &group_pk, transport, address, target).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("sync: peer {address} failed: {e}");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    if chain.last_round()? >= target {
        Ok(())
    } else {
        Err(NodeError::SyncFailed(target))
    }
}

/// Follow one peer until the target round; every beacon is verified under
/// the group key (and against the local chain tip for the chained scheme)
/// before it is appended.
async fn pull_from(
    chain: &ChainStore,
    group: &Group,
    group_pk: &bls12_381::G2Projective,
    transport: &Arc<dyn Transport>,
    address: &str,
    target: u64,
) -> Result<(), NodeError> {
    let client = transport.client(address)?;
    let mut last = chain.last_round()?;
    let mut stream = client.follow(last + 1).await?;

    while last < target {
        let event = match stream.recv().await {
            Some(e) => e,
            None => return Err(NodeError::SyncFailed(target)),
        };
        let beacon = match event {
            FollowEvent::Beacon(b) => b,
            FollowEvent::SkippedTo(round) => {
                // the peer fell behind on our follow stream and jumped;
                // it cannot serve the gap we need
                debug!("sync: peer {address} skipped to {round}");
                return Err(NodeError::SyncFailed(target));
            }
        };
        if beacon.round != last + 1 {
            debug!(
                "sync: peer {address} sent round {} while expecting {}",
                beacon.round,
                last + 1
            );
            return Err(NodeError::SyncFailed(target));
        }

        verify_beacon(chain, group, group_pk, &beacon)?;

        match chain.put(&beacon) {
            Ok(()) => {}
            // gossip or the beacon engine appended it first
            Err(StoreError::Duplicate(_)) => {}
            Err(e) => return Err(e.into()),
        }
        last = beacon.round;
    }
    info!("sync: caught up to round {last} from {address}");
    Ok(())
}

/// Signature (and chain linkage) check for a beacon received from outside
/// the aggregator: synced ranges and gossip both go through here.
pub(crate) fn verify_beacon(
    chain: &ChainStore,
    group: &Group,
    group_pk: &bls12_381::G2Projective,
    beacon: &Beacon,
) -> Result<(), NodeError> {
    if group.scheme.chained() {
        let prev = chain.get(beacon.round - 1)?;
        if beacon.previous_signature != prev.signature {
            warn!(
                "sync: round {} previous_signature does not match our chain",
                beacon.round
            );
            return Err(NodeError::Crypto(
                rusty_beacon_crypto::CryptoError::InvalidSignature,
            ));
        }
    }
    let msg = group
        .scheme
        .message_for(beacon.round, &beacon.previous_signature);
    tbls::verify(group_pk, &msg, &beacon.signature)?;
    Ok(())
}
