//! BLS12-381 primitives for the Rusty Beacon network.
//!
//! Public keys and polynomial commitments live in G2, signatures and
//! partial signatures in G1 (min-sig orientation). On top of the pairing
//! sit Shamir polynomials, threshold BLS, ECIES share encryption for DKG
//! deals and Chaum-Pedersen DLEQ proofs for verifiable complaints.

use thiserror::Error;

pub mod dleq;
pub mod ecies;
pub mod keypair;
pub mod pairing;
pub mod poly;
pub mod share;
pub mod tbls;

pub use dleq::DleqProof;
pub use keypair::KeyPair;
pub use pairing::{decode_g1, decode_g2, decode_scalar, encode_g1, encode_g2, hash_to_g1};
pub use poly::{PrivatePoly, PublicPoly};
pub use share::Share;

/// Errors raised by the crypto layer. Always fatal for the specific
/// operation; callers never retry with the same inputs.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input bytes did not decode to a point on the curve.
    #[error("invalid point encoding")]
    InvalidPoint,

    /// Signature did not verify under the given key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Fewer than threshold valid shares at recovery.
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    /// Share bytes did not decode to a field scalar.
    #[error("invalid share scalar")]
    InvalidShare,

    /// Two shares claim the same signing index.
    #[error("duplicate share index {0}")]
    DuplicateIndex(u32),

    /// Index 0 is the secret itself and never a valid signing index.
    #[error("index zero is reserved")]
    ZeroIndex,

    /// A zero-knowledge proof failed verification.
    #[error("invalid proof")]
    InvalidProof,
}
