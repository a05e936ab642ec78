//! Round arithmetic relative to the chain genesis.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The round in effect at wall time `now`: 0 before genesis, 1 from
/// genesis until one period in, and so on.
pub fn round_at(now: u64, genesis_time: u64, period: u64) -> u64 {
    if now < genesis_time || period == 0 {
        return 0;
    }
    (now - genesis_time) / period + 1
}

/// Wall time at which `round` begins. Round 0 maps to genesis as well.
pub fn time_of_round(round: u64, genesis_time: u64, period: u64) -> u64 {
    if round <= 1 {
        return genesis_time;
    }
    genesis_time + (round - 1) * period
}

/// The next round strictly after `now`, with its start time.
pub fn next_round(now: u64, genesis_time: u64, period: u64) -> (u64, u64) {
    let current = round_at(now, genesis_time, period);
    let next = current + 1;
    (next, time_of_round(next, genesis_time, period))
}
