//! Dealer/holder status bookkeeping for one session.

use std::collections::BTreeSet;

/// Tracks, per (dealer, holder) pair, whether the holder stands behind the
/// dealer's share for it. Everything starts as approved; complaints flip
/// entries off and justifications flip them back on.
#[derive(Debug, Clone)]
pub struct StatusMatrix {
    holders: u32,
    // (dealer, holder) pairs currently under complaint; 1-based indices
    complaints: BTreeSet<(u32, u32)>,
}

impl StatusMatrix {
    pub fn new(holders: u32) -> Self {
        StatusMatrix {
            holders,
            complaints: BTreeSet::new(),
        }
    }

    pub fn set(&mut self, dealer: u32, holder: u32, approved: bool) {
        if approved {
            self.complaints.remove(&(dealer, holder));
        } else {
            self.complaints.insert((dealer, holder));
        }
    }

    pub fn approved(&self, dealer: u32, holder: u32) -> bool {
        !self.complaints.contains(&(dealer, holder))
    }

    /// Whether every holder approves of this dealer.
    pub fn dealer_clear(&self, dealer: u32) -> bool {
        !self.complaints.iter().any(|&(d, _)| d == dealer)
    }

    /// Open complaints against `dealer`, as holder indices.
    pub fn complaints_against(&self, dealer: u32) -> Vec<u32> {
        self.complaints
            .iter()
            .filter(|&&(d, _)| d == dealer)
            .map(|&(_, h)| h)
            .collect()
    }

    pub fn has_complaints(&self) -> bool {
        !self.complaints.is_empty()
    }

    pub fn holders(&self) -> u32 {
        self.holders
    }
}
