//! Append-only beacon chain over a sled tree.
//!
//! Records are keyed by the big-endian round number, so sled's ordered
//! iteration is chain order. The store enforces the next-round-expected
//! invariant on append and flushes before reporting success, which is the
//! durability contract the beacon engine relies on.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use rusty_beacon_types::{round_bytes, Beacon};

use crate::StoreError;

const BEACONS_TREE: &str = "beacons";

/// The per-node beacon log.
pub struct ChainStore {
    db: sled::Db,
    beacons: sled::Tree,
    // serializes the check-then-insert in `put`; readers go lock-free
    append: Mutex<()>,
}

impl ChainStore {
    /// Open (or create) the chain store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let beacons = db.open_tree(BEACONS_TREE)?;
        Ok(ChainStore {
            db,
            beacons,
            append: Mutex::new(()),
        })
    }

    /// Seed the chain with the round-0 genesis record whose signature is
    /// the group's genesis seed. No-op if the chain already has records.
    pub fn put_genesis(&self, seed: &[u8; 32]) -> Result<(), StoreError> {
        let _guard = self.append.lock().unwrap_or_else(|e| e.into_inner());
        if !self.beacons.is_empty() {
            return Ok(());
        }
        let genesis = Beacon {
            round: 0,
            previous_signature: Vec::new(),
            signature: seed.to_vec(),
        };
        self.beacons.insert(round_bytes(0), genesis.encode()?)?;
        self.beacons.flush()?;
        debug!("chain seeded with genesis record");
        Ok(())
    }

    /// Append the next beacon.
    ///
    /// Returns `OutOfOrder` unless `beacon.round` is exactly one past the
    /// last stored round (or 0 on an empty chain), and `Duplicate` when the
    /// identical record is already stored. The record is flushed before
    /// this returns.
    pub fn put(&self, beacon: &Beacon) -> Result<(), StoreError> {
        let _guard = self.append.lock().unwrap_or_else(|e| e.into_inner());
        match self.last_inner()? {
            None => {
                if beacon.round != 0 {
                    return Err(StoreError::OutOfOrder {
                        expected: 0,
                        got: beacon.round,
                    });
                }
            }
            Some((last_round, last)) => {
                if beacon.round <= last_round {
                    let stored = if beacon.round == last_round {
                        last
                    } else {
                        self.get(beacon.round)?
                    };
                    if stored.signature == beacon.signature {
                        return Err(StoreError::Duplicate(beacon.round));
                    }
                    return Err(StoreError::OutOfOrder {
                        expected: last_round + 1,
                        got: beacon.round,
                    });
                }
                if beacon.round != last_round + 1 {
                    return Err(StoreError::OutOfOrder {
                        expected: last_round + 1,
                        got: beacon.round,
                    });
                }
            }
        }
        self.beacons
            .insert(round_bytes(beacon.round), beacon.encode()?)?;
        self.beacons.flush()?;
        Ok(())
    }

    /// Fetch the beacon for `round`.
    pub fn get(&self, round: u64) -> Result<Beacon, StoreError> {
        match self.beacons.get(round_bytes(round))? {
            Some(bytes) => Ok(Beacon::decode(&bytes)?),
            None => Err(StoreError::NotFound(round)),
        }
    }

    /// Highest stored round and its beacon; `None` on an empty chain.
    pub fn last(&self) -> Result<Option<(u64, Beacon)>, StoreError> {
        self.last_inner()
    }

    fn last_inner(&self) -> Result<Option<(u64, Beacon)>, StoreError> {
        match self.beacons.last()? {
            Some((key, bytes)) => {
                let round = decode_round_key(&key)?;
                Ok(Some((round, Beacon::decode(&bytes)?)))
            }
            None => Ok(None),
        }
    }

    /// Highest stored round, 0 on an empty chain.
    pub fn last_round(&self) -> Result<u64, StoreError> {
        Ok(self.last_inner()?.map(|(r, _)| r).unwrap_or(0))
    }

    /// Lazy scan of stored beacons from `from` upward, in round order.
    /// A cursor is not restartable; open a new one to re-read.
    pub fn cursor(&self, from: u64) -> Cursor {
        Cursor {
            inner: self.beacons.range(round_bytes(from).to_vec()..),
        }
    }

    /// Number of stored records (the genesis record included).
    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    /// Flush any buffered writes; called once more on shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.beacons.flush()?;
        self.db.flush()?;
        Ok(())
    }
}

fn decode_round_key(key: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("bad round key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Iterator over stored beacons in strictly increasing round order.
pub struct Cursor {
    inner: sled::Iter,
}

impl Iterator for Cursor {
    type Item = Result<Beacon, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok((_, bytes)) => Some(Beacon::decode(&bytes).map_err(StoreError::from)),
            Err(e) => Some(Err(StoreError::Db(e))),
        }
    }
}
