//! Point codecs, hash-to-curve and the pairing check.

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use sha2_09::Sha256;

use crate::CryptoError;

/// Domain separation tag for signature hashing, shared by every signer on
/// the network. Matches the ciphersuite name of the G1 min-sig BLS suite.
pub const SIG_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Uniform hash of an arbitrary message onto G1 (expand-message XMD with
/// SHA-256, then simplified SWU map).
pub fn hash_to_g1(msg: &[u8]) -> G1Projective {
    <G1Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(msg, SIG_DST)
}

/// Compressed encoding of a G1 point (48 bytes).
pub fn encode_g1(point: &G1Projective) -> Vec<u8> {
    G1Affine::from(point).to_compressed().to_vec()
}

/// Compressed encoding of a G2 point (96 bytes).
pub fn encode_g2(point: &G2Projective) -> Vec<u8> {
    G2Affine::from(point).to_compressed().to_vec()
}

/// Decode a compressed G1 point, rejecting off-curve encodings.
pub fn decode_g1(bytes: &[u8]) -> Result<G1Projective, CryptoError> {
    let arr: [u8; 48] = bytes.try_into().map_err(|_| CryptoError::InvalidPoint)?;
    let affine = G1Affine::from_compressed(&arr);
    if bool::from(affine.is_some()) {
        Ok(G1Projective::from(affine.unwrap()))
    } else {
        Err(CryptoError::InvalidPoint)
    }
}

/// Decode a compressed G2 point, rejecting off-curve encodings.
pub fn decode_g2(bytes: &[u8]) -> Result<G2Projective, CryptoError> {
    let arr: [u8; 96] = bytes.try_into().map_err(|_| CryptoError::InvalidPoint)?;
    let affine = G2Affine::from_compressed(&arr);
    if bool::from(affine.is_some()) {
        Ok(G2Projective::from(affine.unwrap()))
    } else {
        Err(CryptoError::InvalidPoint)
    }
}

/// Decode a scalar from its 32-byte little-endian encoding.
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar, CryptoError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidShare)?;
    let scalar = Scalar::from_bytes(&arr);
    if bool::from(scalar.is_some()) {
        Ok(scalar.unwrap())
    } else {
        Err(CryptoError::InvalidShare)
    }
}

/// The BLS verification equation: `e(sig, G2) == e(H(msg), pk)`.
pub fn check_pairing(
    signature: &G1Projective,
    msg_point: &G1Projective,
    public_key: &G2Projective,
) -> bool {
    let lhs = pairing(&G1Affine::from(signature), &G2Affine::generator());
    let rhs = pairing(&G1Affine::from(msg_point), &G2Affine::from(public_key));
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff::Field;
    use rand::rngs::OsRng;

    #[test]
    fn hash_to_g1_is_deterministic_and_spread() {
        let a = hash_to_g1(b"round-1");
        let b = hash_to_g1(b"round-1");
        let c = hash_to_g1(b"round-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!bool::from(a.is_identity()));
    }

    #[test]
    fn g1_codec_round_trip() {
        let p = hash_to_g1(b"codec");
        let bytes = encode_g1(&p);
        assert_eq!(bytes.len(), 48);
        assert_eq!(decode_g1(&bytes).unwrap(), p);
    }

    #[test]
    fn g2_codec_round_trip() {
        let s = Scalar::random(&mut OsRng);
        let p = G2Projective::generator() * s;
        let bytes = encode_g2(&p);
        assert_eq!(bytes.len(), 96);
        assert_eq!(decode_g2(&bytes).unwrap(), p);
    }

    #[test]
    fn bad_encodings_are_rejected() {
        assert!(matches!(decode_g1(&[0u8; 47]), Err(CryptoError::InvalidPoint)));
        assert!(matches!(decode_g1(&[0xffu8; 48]), Err(CryptoError::InvalidPoint)));
        assert!(matches!(decode_g2(&[0xffu8; 96]), Err(CryptoError::InvalidPoint)));
        assert!(matches!(decode_scalar(&[0xffu8; 32]), Err(CryptoError::InvalidShare)));
    }
}
