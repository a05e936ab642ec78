//! DKG and resharing wire packets.
//!
//! One session moves through deal, response and justification phases; each
//! packet is signed under the sender's long-term key and carries the session
//! id so stray packets from other sessions can be dropped on arrival.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Hash;

/// Unique identifier for a DKG or resharing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub crate::Hash);

impl SessionId {
    /// Derive the session id all participants agree on from the proposed
    /// group parameters and the session deadline.
    pub fn derive(proposal_digest: &crate::Hash, deadline_unix: u64) -> SessionId {
        let mut hasher = Sha256::new();
        hasher.update(b"rusty-beacon:dkg-session");
        hasher.update(proposal_digest);
        hasher.update(deadline_unix.to_be_bytes());
        SessionId(hasher.finalize().into())
    }
}

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Phases of a DKG session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DkgPhase {
    /// No session.
    Fresh,
    /// A proposal was built locally or received from the leader.
    Proposed,
    /// Proposal accepted; waiting for the session start.
    Accepting,
    /// Dealers send encrypted shares and commitments.
    Dealing,
    /// Share holders verify deals and publish approvals or complaints.
    Responding,
    /// Accused dealers reveal the disputed shares in clear.
    Justifying,
    /// Terminal: success or failure.
    Finished,
}

/// A share of the dealer's secret polynomial, encrypted to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShare {
    /// 1-based index of the recipient in the (new) group.
    pub recipient_index: u32,
    /// Ephemeral ECDH public key, compressed G2.
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
    /// Share scalar XORed with the derived keystream.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Deal-phase payload: one dealer's commitments plus a share per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Commitment polynomial, compressed G2 points, constant term first.
    pub commits: Vec<Vec<u8>>,
    pub shares: Vec<EncryptedShare>,
}

/// Verdict on one dealer's deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealStatus {
    Approve,
    /// The deal's share for us failed verification. The witness is the
    /// ECDH point shared with the dealer's ephemeral key, plus a DLEQ
    /// proof that it was derived with our long-term key, which lets any
    /// third party re-run the decryption and check the mismatch.
    Complaint {
        #[serde(with = "serde_bytes")]
        witness: Vec<u8>,
        #[serde(with = "serde_bytes")]
        dleq_challenge: Vec<u8>,
        #[serde(with = "serde_bytes")]
        dleq_response: Vec<u8>,
    },
}

/// Response-phase payload: one share holder's verdict on every dealer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// `(dealer_index, status)` pairs, one per deal examined.
    pub statuses: Vec<(u32, DealStatus)>,
}

/// Justification-phase payload: the accused dealer's cleartext shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    /// `(recipient_index, share_scalar_bytes)` for each complaint against us.
    pub shares: Vec<(u32, Vec<u8>)>,
}

/// The three packet bodies, tagged by phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgPayload {
    Deal(Deal),
    Response(Response),
    Justification(Justification),
}

impl DkgPayload {
    /// The phase this payload belongs to.
    pub fn phase(&self) -> DkgPhase {
        match self {
            DkgPayload::Deal(_) => DkgPhase::Dealing,
            DkgPayload::Response(_) => DkgPhase::Responding,
            DkgPayload::Justification(_) => DkgPhase::Justifying,
        }
    }
}

/// Signed DKG packet as it travels between participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgPacket {
    pub session_id: SessionId,
    /// Sender's 1-based index: in the dealer group for deals and
    /// justifications, in the new group for responses.
    pub sender_index: u32,
    pub payload: DkgPayload,
    /// BLS signature under the sender's long-term key over [`DkgPacket::signing_digest`].
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl DkgPacket {
    /// Digest covered by the packet signature.
    pub fn signing_digest(
        session_id: &SessionId,
        sender_index: u32,
        payload: &DkgPayload,
    ) -> Result<Hash, bincode::Error> {
        let mut hasher = Sha256::new();
        hasher.update(b"rusty-beacon:dkg-packet");
        hasher.update(session_id);
        hasher.update(sender_index.to_be_bytes());
        hasher.update(bincode::serialize(payload)?);
        Ok(hasher.finalize().into())
    }
}
