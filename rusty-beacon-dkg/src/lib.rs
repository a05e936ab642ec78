//! Distributed key generation and resharing for the Rusty Beacon network.
//!
//! The protocol is Pedersen's joint-Feldman VSS with verifiable complaints:
//! dealers commit to secret polynomials in G2 and distribute encrypted
//! evaluations; recipients verify and either approve or complain with a
//! decryption witness; accused dealers justify in clear; whoever survives
//! forms the qualified set whose polynomials sum (fresh DKG) or interpolate
//! (reshare) into the group key material.
//!
//! [`session::DkgSession`] is the pure state machine, [`driver`] the async
//! task that feeds it packets and enforces phase deadlines.

use thiserror::Error;

pub mod driver;
pub mod session;
mod status;

pub use driver::{run_session, DkgBoard};
pub use session::{DkgOutput, DkgSession, OldGroup};

use rusty_beacon_crypto::CryptoError;
use rusty_beacon_types::DkgPhase;

/// Errors raised by the DKG engine.
#[derive(Debug, Error)]
pub enum DkgError {
    /// Packet belongs to another session; dropped silently by the driver.
    #[error("packet for a different session")]
    WrongSession,

    /// Packet arrived for a phase that already passed.
    #[error("packet out of phase: session is in {current:?}")]
    OutOfPhase { current: DkgPhase },

    /// This node is neither a dealer nor a share holder of the session.
    #[error("local node is not a participant of this session")]
    NotAParticipant,

    /// Sender index does not map to a participant.
    #[error("unknown sender index {0}")]
    UnknownSender(u32),

    /// Packet signature did not verify under the sender's long-term key.
    #[error("bad packet signature from index {0}")]
    BadPacketSignature(u32),

    /// Fewer qualified dealers than the threshold requires.
    #[error("qualified set too small: {have} dealers, need {need}")]
    NotEnoughDealers { have: usize, need: usize },

    /// A qualified dealer's share for this node never arrived.
    #[error("no usable share from qualified dealer {0}")]
    MissingShare(u32),

    /// Reshare output did not preserve the group public key.
    #[error("resharing did not preserve the group public key")]
    ReshareInconsistent,

    /// Session ended without a result (deadline, shutdown, operator).
    #[error("dkg session aborted: {0}")]
    Aborted(String),

    /// Proposal failed structural validation.
    #[error("invalid group proposal: {0}")]
    Proposal(#[from] rusty_beacon_types::GroupError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
