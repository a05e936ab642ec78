//! Ephemeral-ECDH encryption of dealt shares.
//!
//! A dealer encrypts each share to its recipient's long-term G2 key:
//! pick an ephemeral scalar `e`, derive a keystream from `e · PK_j` with
//! SHA-256, and XOR it over the 32-byte share scalar. The recipient
//! recomputes the point as `sk_j · E` from the attached ephemeral public
//! key. The derived point doubles as the complaint witness — see
//! [`crate::dleq`].

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand_core::RngCore;
use sha2::{Digest, Sha256};

use crate::pairing::{decode_g2, decode_scalar, encode_g2};
use crate::CryptoError;

const KDF_DOMAIN: &[u8] = b"rusty-beacon:ecies";

/// Keystream derived from the shared ECDH point.
fn keystream(shared: &G2Projective) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(encode_g2(shared));
    hasher.finalize().into()
}

fn xor(bytes: &[u8; 32], stream: &[u8; 32]) -> Vec<u8> {
    bytes.iter().zip(stream.iter()).map(|(b, s)| b ^ s).collect()
}

/// Encrypt a share scalar to a recipient's public key. Returns the
/// compressed ephemeral public key and the ciphertext.
pub fn encrypt<R: RngCore>(
    recipient: &G2Projective,
    share: &Scalar,
    rng: &mut R,
) -> (Vec<u8>, Vec<u8>) {
    let eph = Scalar::random(rng);
    let eph_pub = G2Projective::generator() * eph;
    let shared = recipient * eph;
    let ct = xor(&share.to_bytes(), &keystream(&shared));
    (encode_g2(&eph_pub), ct)
}

/// Decrypt with the recipient's long-term secret.
pub fn decrypt(secret: &Scalar, ephemeral: &[u8], ciphertext: &[u8]) -> Result<Scalar, CryptoError> {
    let eph_pub = decode_g2(ephemeral)?;
    decrypt_with_point(&(eph_pub * secret), ciphertext)
}

/// Decrypt with the ECDH point itself. Third parties use this to re-run a
/// decryption from a complaint witness.
pub fn decrypt_with_point(shared: &G2Projective, ciphertext: &[u8]) -> Result<Scalar, CryptoError> {
    if ciphertext.len() != 32 {
        return Err(CryptoError::InvalidShare);
    }
    let mut ct = [0u8; 32];
    ct.copy_from_slice(ciphertext);
    decode_scalar(&xor(&ct, &keystream(shared)))
}
