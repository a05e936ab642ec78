//! Chaum-Pedersen discrete-log-equality proofs on G2.
//!
//! A complainer in the DKG reveals its ECDH point `S = sk · E` and proves
//! `log_G(PK) == log_E(S)` without revealing `sk`, so any verifier can
//! re-run the share decryption against the dealer's ciphertext.

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand_core::RngCore;
use sha2::{Digest, Sha512};

use crate::pairing::{decode_scalar, encode_g2};
use crate::CryptoError;

const CHALLENGE_DOMAIN: &[u8] = b"rusty-beacon:dleq";

/// Non-interactive proof that two public points share a discrete log
/// across two bases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DleqProof {
    challenge: Scalar,
    response: Scalar,
}

/// Fiat-Shamir challenge over the full transcript.
fn challenge(
    base1: &G2Projective,
    base2: &G2Projective,
    public1: &G2Projective,
    public2: &G2Projective,
    commit1: &G2Projective,
    commit2: &G2Projective,
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_DOMAIN);
    for point in [base1, base2, public1, public2, commit1, commit2] {
        hasher.update(encode_g2(point));
    }
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_wide(&wide)
}

impl DleqProof {
    /// Prove `public1 = secret · base1` and `public2 = secret · base2`.
    pub fn prove<R: RngCore>(
        base1: &G2Projective,
        base2: &G2Projective,
        secret: &Scalar,
        rng: &mut R,
    ) -> (G2Projective, G2Projective, DleqProof) {
        let public1 = base1 * secret;
        let public2 = base2 * secret;
        let w = Scalar::random(rng);
        let commit1 = base1 * w;
        let commit2 = base2 * w;
        let c = challenge(base1, base2, &public1, &public2, &commit1, &commit2);
        let response = w - c * secret;
        (public1, public2, DleqProof { challenge: c, response })
    }

    /// Verify against the claimed publics.
    pub fn verify(
        &self,
        base1: &G2Projective,
        base2: &G2Projective,
        public1: &G2Projective,
        public2: &G2Projective,
    ) -> Result<(), CryptoError> {
        let commit1 = base1 * self.response + public1 * self.challenge;
        let commit2 = base2 * self.response + public2 * self.challenge;
        let c = challenge(base1, base2, public1, public2, &commit1, &commit2);
        if c == self.challenge {
            Ok(())
        } else {
            Err(CryptoError::InvalidProof)
        }
    }

    /// `(challenge, response)` wire encoding, 32 bytes each.
    pub fn to_bytes(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.challenge.to_bytes().to_vec(),
            self.response.to_bytes().to_vec(),
        )
    }

    pub fn from_bytes(challenge: &[u8], response: &[u8]) -> Result<Self, CryptoError> {
        Ok(DleqProof {
            challenge: decode_scalar(challenge).map_err(|_| CryptoError::InvalidProof)?,
            response: decode_scalar(response).map_err(|_| CryptoError::InvalidProof)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn prove_and_verify() {
        let secret = Scalar::random(&mut OsRng);
        let base1 = G2Projective::generator();
        let base2 = G2Projective::generator() * Scalar::from(5u64);

        let (p1, p2, proof) = DleqProof::prove(&base1, &base2, &secret, &mut OsRng);
        assert_eq!(p1, base1 * secret);
        assert_eq!(p2, base2 * secret);
        proof.verify(&base1, &base2, &p1, &p2).unwrap();
    }

    #[test]
    fn mismatched_publics_rejected() {
        let secret = Scalar::random(&mut OsRng);
        let other = Scalar::random(&mut OsRng);
        let base1 = G2Projective::generator();
        let base2 = G2Projective::generator() * Scalar::from(9u64);

        let (p1, _, proof) = DleqProof::prove(&base1, &base2, &secret, &mut OsRng);
        // claim a second public computed with a different scalar
        let bogus = base2 * other;
        assert!(matches!(
            proof.verify(&base1, &base2, &p1, &bogus),
            Err(CryptoError::InvalidProof)
        ));
    }

    #[test]
    fn proof_bytes_round_trip() {
        let secret = Scalar::random(&mut OsRng);
        let base1 = G2Projective::generator();
        let base2 = G2Projective::generator() * Scalar::from(3u64);
        let (p1, p2, proof) = DleqProof::prove(&base1, &base2, &secret, &mut OsRng);

        let (c, z) = proof.to_bytes();
        let back = DleqProof::from_bytes(&c, &z).unwrap();
        back.verify(&base1, &base2, &p1, &p2).unwrap();
    }
}
