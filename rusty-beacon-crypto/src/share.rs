//! A participant's piece of the distributed signing key.

use bls12_381::{G2Projective, Scalar};

use crate::poly::PublicPoly;
use crate::CryptoError;

/// One participant's share of the group key: its private scalar plus the
/// joint public polynomial everyone agreed on.
///
/// Invariants: `public.public_key() == group public key` and
/// `public.eval(index) == private · G2`. Never leaves the node.
#[derive(Clone)]
pub struct Share {
    /// 1-based signing index in the group.
    pub index: u32,
    /// `f(index)` for the joint secret polynomial `f`.
    pub private: Scalar,
    /// The joint public commitment polynomial.
    pub public: PublicPoly,
}

impl Share {
    /// The group public key this share belongs to.
    pub fn public_key(&self) -> &G2Projective {
        self.public.public_key()
    }

    /// This participant's public key share `P(index)`.
    pub fn public_share(&self) -> G2Projective {
        self.public.eval(self.index)
    }

    /// Check the share against its own commitment polynomial.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.index == 0 {
            return Err(CryptoError::ZeroIndex);
        }
        if G2Projective::generator() * self.private == self.public_share() {
            Ok(())
        } else {
            Err(CryptoError::InvalidShare)
        }
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("threshold", &self.public.threshold())
            .finish()
    }
}
