//! Long-term node keypairs.
//!
//! Nodes authenticate everything — identities, DKG packets — with the same
//! BLS keys they hold shares against: secret scalar, public key in G2,
//! signatures in G1 over pre-hashed digests.

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand_core::RngCore;

use rusty_beacon_types::Identity;

use crate::pairing::{decode_g2, decode_scalar, encode_g1, encode_g2, hash_to_g1};
use crate::{tbls, CryptoError};

/// A node's long-term keypair.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: G2Projective,
}

impl KeyPair {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        let public = G2Projective::generator() * secret;
        KeyPair { secret, public }
    }

    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    pub fn public(&self) -> &G2Projective {
        &self.public
    }

    /// Compressed public key bytes as they appear in an [`Identity`].
    pub fn public_bytes(&self) -> Vec<u8> {
        encode_g2(&self.public)
    }

    /// BLS signature over a pre-hashed digest, compressed G1.
    pub fn sign(&self, digest: &[u8]) -> Vec<u8> {
        encode_g1(&(hash_to_g1(digest) * self.secret))
    }

    /// Verify a signature made by [`KeyPair::sign`] under `public_key`.
    pub fn verify(public_key: &[u8], digest: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let pk = decode_g2(public_key)?;
        tbls::verify(&pk, digest, signature)
    }

    /// Build this node's self-signed identity.
    pub fn identity(&self, address: String, tls: bool) -> Identity {
        let public_key = self.public_bytes();
        let digest = Identity::auth_digest(&address, &public_key, tls);
        let signature = self.sign(&digest);
        Identity {
            address,
            public_key,
            tls,
            signature,
        }
    }

    /// Check an identity's self-signature.
    pub fn verify_identity(identity: &Identity) -> Result<(), CryptoError> {
        let digest =
            Identity::auth_digest(&identity.address, &identity.public_key, identity.tls);
        Self::verify(&identity.public_key, &digest, &identity.signature)
    }

    /// 32-byte secret scalar, for the key store.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = decode_scalar(bytes)?;
        let public = G2Projective::generator() * secret;
        Ok(KeyPair { secret, public })
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish()
    }
}
