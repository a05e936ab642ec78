//! Threshold BLS: partial signing, partial verification, recovery and
//! final verification.

use bls12_381::{G2Projective, Scalar};

use crate::pairing::{check_pairing, decode_g1, encode_g1, hash_to_g1};
use crate::poly::{recover_g1_at_zero, PublicPoly};
use crate::CryptoError;

/// Sign `msg` with a share: `σ_i = s_i · H(msg)`, compressed G1.
pub fn sign_partial(share: &Scalar, msg: &[u8]) -> Vec<u8> {
    encode_g1(&(hash_to_g1(msg) * share))
}

/// Verify a partial signature against the public polynomial evaluated at
/// the signer's index: `e(σ_i, G2) == e(H(msg), P(i))`.
pub fn verify_partial(
    public: &PublicPoly,
    index: u32,
    msg: &[u8],
    partial: &[u8],
) -> Result<(), CryptoError> {
    if index == 0 {
        return Err(CryptoError::ZeroIndex);
    }
    let sig = decode_g1(partial)?;
    if check_pairing(&sig, &hash_to_g1(msg), &public.eval(index)) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Recover the full signature from `threshold` valid partials at distinct
/// indices, by Lagrange interpolation at 0 in G1.
///
/// The caller is expected to have verified each partial; recovery itself
/// cannot tell a bad share from a good one, which is why the beacon engine
/// re-verifies the recovered signature before any append.
pub fn recover(threshold: usize, partials: &[(u32, Vec<u8>)]) -> Result<Vec<u8>, CryptoError> {
    if partials.len() < threshold {
        return Err(CryptoError::InsufficientShares {
            have: partials.len(),
            need: threshold,
        });
    }
    let points = partials
        .iter()
        .map(|(i, bytes)| Ok((*i, decode_g1(bytes)?)))
        .collect::<Result<Vec<_>, CryptoError>>()?;
    let sig = recover_g1_at_zero(threshold, &points)?;
    Ok(encode_g1(&sig))
}

/// Verify a full signature against the group public key.
pub fn verify(public_key: &G2Projective, msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let sig = decode_g1(signature)?;
    if check_pairing(&sig, &hash_to_g1(msg), public_key) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}
