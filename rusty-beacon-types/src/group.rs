//! Identities, groups and the public chain descriptor.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{round_bytes, GroupError, Hash, Scheme};

/// Domain prefix for the self-signature carried by an [`Identity`].
pub const IDENTITY_AUTH_DOMAIN: &[u8] = b"rusty-beacon:identity";

/// A node's long-term public identity.
///
/// Identities are immutable and compared by address. The signature is a BLS
/// signature under `public_key` over the identity's auth digest, proving
/// possession of the matching secret key at enrollment time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable dial address, e.g. `host:port`.
    pub address: String,
    /// Long-term public key, compressed G2.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Whether the node serves TLS on `address`.
    pub tls: bool,
    /// BLS signature (compressed G1) over [`Identity::auth_digest`].
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Identity {
    /// The digest the identity signature commits to.
    pub fn auth_digest(address: &str, public_key: &[u8], tls: bool) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_AUTH_DOMAIN);
        hasher.update(address.as_bytes());
        hasher.update(public_key);
        hasher.update([tls as u8]);
        hasher.finalize().into()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Identity {}

/// The ordered participant set plus the chain's cryptographic parameters.
///
/// A group is created whole at DKG completion and replaced whole at reshare
/// completion; engines receive immutable snapshots and never mutate one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Ordered identities; a participant's signing index is its position
    /// plus one (index 0 is reserved for the secret itself).
    pub nodes: Vec<Identity>,
    /// Number of valid partial signatures required to produce a beacon.
    pub threshold: u32,
    /// Seconds between rounds.
    pub period: u64,
    /// Unix time of round 1.
    pub genesis_time: u64,
    /// Fixed 32-byte seed chosen at the first-ever DKG; round 1's
    /// `previous_signature` under the chained scheme.
    pub genesis_seed: Hash,
    /// Unix time at which this group took over from the previous one, if
    /// it was produced by a reshare.
    pub transition_time: Option<u64>,
    /// Message-construction rule in force.
    pub scheme: Scheme,
    /// Public polynomial commitments, compressed G2, constant term first.
    /// `public_key()` is the constant term.
    pub commits: Vec<Vec<u8>>,
}

impl Group {
    /// Validate the structural invariants: `t >= n/2 + 1`, `t <= n`,
    /// unique addresses.
    pub fn validate(&self) -> Result<(), GroupError> {
        let n = self.nodes.len();
        if n == 0 {
            return Err(GroupError::Empty);
        }
        let min = (n / 2 + 1) as u32;
        if self.threshold < min || self.threshold as usize > n {
            return Err(GroupError::BadThreshold {
                threshold: self.threshold,
                nodes: n,
            });
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|o| o.address == node.address) {
                return Err(GroupError::DuplicateAddress(node.address.clone()));
            }
        }
        Ok(())
    }

    /// The group public key: the constant term of the public polynomial.
    pub fn public_key(&self) -> &[u8] {
        &self.commits[0]
    }

    /// 1-based signing index of `address`, if it is a member.
    pub fn index_of(&self, address: &str) -> Option<u32> {
        self.nodes
            .iter()
            .position(|n| n.address == address)
            .map(|p| p as u32 + 1)
    }

    /// Member at a 1-based signing index.
    pub fn node_at(&self, index: u32) -> Option<&Identity> {
        if index == 0 {
            return None;
        }
        self.nodes.get(index as usize - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deterministic digest identifying this chain; see [`ChainInfo`].
    pub fn chain_hash(&self) -> Hash {
        chain_hash(
            self.public_key(),
            self.period,
            self.genesis_time,
            &self.genesis_seed,
            self.scheme,
        )
    }

    /// Digest over the full group descriptor, nodes and commitments
    /// included. Unlike [`Group::chain_hash`] this changes on every
    /// reshare, which makes it the right handle for "is this share for
    /// that group" checks.
    pub fn fingerprint(&self) -> Result<Hash, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// The public descriptor clients verify beacons against.
    pub fn chain_info(&self) -> ChainInfo {
        ChainInfo {
            public_key: self.public_key().to_vec(),
            period: self.period,
            genesis_time: self.genesis_time,
            genesis_seed: self.genesis_seed,
            scheme_id: self.scheme.id().to_string(),
            chain_hash: self.chain_hash(),
        }
    }
}

/// A group descriptor before any key material exists: what a DKG or
/// reshare is asked to produce. Same structural invariants as [`Group`],
/// minus the commitments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProposal {
    pub nodes: Vec<Identity>,
    pub threshold: u32,
    pub period: u64,
    pub genesis_time: u64,
    pub scheme: Scheme,
    /// Set on reshare proposals: when the new group takes over.
    pub transition_time: Option<u64>,
}

impl GroupProposal {
    pub fn validate(&self) -> Result<(), GroupError> {
        let n = self.nodes.len();
        if n == 0 {
            return Err(GroupError::Empty);
        }
        let min = (n / 2 + 1) as u32;
        if self.threshold < min || self.threshold as usize > n {
            return Err(GroupError::BadThreshold {
                threshold: self.threshold,
                nodes: n,
            });
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|o| o.address == node.address) {
                return Err(GroupError::DuplicateAddress(node.address.clone()));
            }
        }
        Ok(())
    }

    /// Digest all participants agree on before the session starts; the
    /// session id is derived from it.
    pub fn digest(&self) -> Result<Hash, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// 1-based signing index of `address` in the proposed group.
    pub fn index_of(&self, address: &str) -> Option<u32> {
        self.nodes
            .iter()
            .position(|n| n.address == address)
            .map(|p| p as u32 + 1)
    }

    /// Promote the proposal to a full group once the DKG produced the
    /// public polynomial.
    pub fn into_group(self, genesis_seed: Hash, commits: Vec<Vec<u8>>) -> Group {
        Group {
            nodes: self.nodes,
            threshold: self.threshold,
            period: self.period,
            genesis_time: self.genesis_time,
            genesis_seed,
            transition_time: self.transition_time,
            scheme: self.scheme,
            commits,
        }
    }
}

/// `sha256(public_key || be64(period) || be64(genesis_time) || seed || scheme_id)`
pub fn chain_hash(
    public_key: &[u8],
    period: u64,
    genesis_time: u64,
    genesis_seed: &Hash,
    scheme: Scheme,
) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(round_bytes(period));
    hasher.update(round_bytes(genesis_time));
    hasher.update(genesis_seed);
    hasher.update(scheme.id().as_bytes());
    hasher.finalize().into()
}

/// Everything a client needs to verify the chain offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub period: u64,
    pub genesis_time: u64,
    pub genesis_seed: Hash,
    pub scheme_id: String,
    pub chain_hash: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(addr: &str) -> Identity {
        Identity {
            address: addr.to_string(),
            public_key: vec![0u8; crate::G2_SIZE],
            tls: false,
            signature: vec![0u8; crate::G1_SIZE],
        }
    }

    fn group(n: usize, t: u32) -> Group {
        Group {
            nodes: (0..n).map(|i| identity(&format!("node-{}:8080", i))).collect(),
            threshold: t,
            period: 2,
            genesis_time: 1_700_000_000,
            genesis_seed: [7u8; 32],
            transition_time: None,
            scheme: Scheme::Chained,
            commits: vec![vec![1u8; crate::G2_SIZE]; t as usize],
        }
    }

    #[test]
    fn threshold_bounds() {
        assert!(group(5, 3).validate().is_ok());
        assert!(group(5, 5).validate().is_ok());
        // below n/2+1
        assert!(matches!(
            group(5, 2).validate(),
            Err(GroupError::BadThreshold { .. })
        ));
        // above n
        assert!(matches!(
            group(5, 6).validate(),
            Err(GroupError::BadThreshold { .. })
        ));
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut g = group(4, 3);
        g.nodes[3].address = g.nodes[0].address.clone();
        assert!(matches!(g.validate(), Err(GroupError::DuplicateAddress(_))));
    }

    #[test]
    fn indices_are_one_based() {
        let g = group(3, 2);
        assert_eq!(g.index_of("node-0:8080"), Some(1));
        assert_eq!(g.index_of("node-2:8080"), Some(3));
        assert_eq!(g.index_of("nobody:1"), None);
        assert_eq!(g.node_at(0), None);
        assert_eq!(g.node_at(1).unwrap().address, "node-0:8080");
    }

    #[test]
    fn chain_hash_is_parameter_sensitive() {
        let g = group(3, 2);
        let mut g2 = g.clone();
        g2.period = 3;
        assert_ne!(g.chain_hash(), g2.chain_hash());
        let mut g3 = g.clone();
        g3.scheme = Scheme::Unchained;
        assert_ne!(g.chain_hash(), g3.chain_hash());
        assert_eq!(g.chain_hash(), g.chain_info().chain_hash);
    }
}
