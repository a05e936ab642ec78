//! The public query surface: chain info, get-by-round, latest and follow
//! streams. Read-only; everything it serves carries the exact stored
//! signature bytes so clients verify independently.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, mpsc, RwLock};

use rusty_beacon_net::{NetError, PublicApi};
use rusty_beacon_store::{ChainStore, StoreError};
use rusty_beacon_types::{Beacon, ChainInfo, FollowEvent, Group};

use crate::NodeError;

/// Read-only view over the chain store plus the live beacon feed.
pub struct QueryService {
    chain: Arc<ChainStore>,
    group: Arc<RwLock<Option<Group>>>,
    beacons: broadcast::Sender<Beacon>,
}

impl QueryService {
    pub fn new(
        chain: Arc<ChainStore>,
        group: Arc<RwLock<Option<Group>>>,
        beacons: broadcast::Sender<Beacon>,
    ) -> Self {
        QueryService {
            chain,
            group,
            beacons,
        }
    }

    /// The chain descriptor clients verify against.
    pub async fn chain_info(&self) -> Result<ChainInfo, NodeError> {
        let group = self.group.read().await;
        match group.as_ref() {
            Some(g) => Ok(g.chain_info()),
            None => Err(NodeError::NoGroup),
        }
    }

    /// Beacon for `round`, or the latest one when `round == 0`.
    pub fn public_rand(&self, round: u64) -> Result<Beacon, NodeError> {
        if round == 0 {
            return match self.chain.last()? {
                Some((last, beacon)) if last > 0 => Ok(beacon),
                // only the genesis record exists: no randomness yet
                _ => Err(NodeError::Store(StoreError::NotFound(0))),
            };
        }
        Ok(self.chain.get(round)?)
    }

    /// Open a follow stream from `from_round` onward: stored beacons
    /// first, then the live feed. A slow consumer gets a `SkippedTo`
    /// notification instead of unbounded buffering.
    pub fn follow(&self, from_round: u64) -> mpsc::Receiver<FollowEvent> {
        let (tx, rx) = mpsc::channel(32);
        let chain = self.chain.clone();
        // subscribe before reading the store so nothing falls in between
        let live = self.beacons.subscribe();
        tokio::spawn(run_follow(chain, live, tx, from_round));
        rx
    }
}

async fn run_follow(
    chain: Arc<ChainStore>,
    mut live: broadcast::Receiver<Beacon>,
    tx: mpsc::Sender<FollowEvent>,
    from_round: u64,
) {
    let mut next = from_round;

    // replay the stored range
    for item in chain.cursor(next) {
        let beacon = match item {
            Ok(b) => b,
            Err(e) => {
                debug!("follow: cursor error: {e}");
                return;
            }
        };
        next = beacon.round + 1;
        if tx.send(FollowEvent::Beacon(beacon)).await.is_err() {
            return;
        }
    }

    // then the live feed
    loop {
        match live.recv().await {
            Ok(beacon) => {
                if beacon.round < next {
                    continue; // already replayed from the store
                }
                // a hole can open if the live feed raced the replay;
                // backfill from the store
                while beacon.round > next {
                    match chain.get(next) {
                        Ok(b) => {
                            next = b.round + 1;
                            if tx.send(FollowEvent::Beacon(b)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => break,
                    }
                }
                if beacon.round < next {
                    continue; // the backfill already covered it
                }
                next = beacon.round + 1;
                if tx.send(FollowEvent::Beacon(beacon)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let latest = chain.last_round().unwrap_or(next);
                debug!("follow: consumer lagged {skipped} beacons, skipping to {latest}");
                if tx.send(FollowEvent::SkippedTo(latest)).await.is_err() {
                    return;
                }
                next = latest;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[async_trait]
impl PublicApi for QueryService {
    async fn chain_info(&self) -> Result<ChainInfo, NetError> {
        QueryService::chain_info(self)
            .await
            .map_err(|e| NetError::Unreachable(e.to_string()))
    }

    async fn follow(&self, from_round: u64) -> Result<mpsc::Receiver<FollowEvent>, NetError> {
        Ok(QueryService::follow(self, from_round))
    }
}
