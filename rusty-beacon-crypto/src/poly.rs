//! Shamir secret-sharing polynomials and Lagrange recovery.
//!
//! Private polynomials live over the BLS12-381 scalar field; their public
//! commitments live in G2. Evaluation indices are 1-based: index 0 is the
//! secret itself and is never handed out as a share.

use bls12_381::{G1Projective, G2Projective, Scalar};
use ff::Field;
use rand_core::RngCore;

use crate::pairing::{decode_g2, encode_g2};
use crate::CryptoError;

/// A secret polynomial of degree `t - 1`; the constant term is the secret.
#[derive(Clone)]
pub struct PrivatePoly {
    coeffs: Vec<Scalar>,
}

impl PrivatePoly {
    /// Fresh random polynomial of the given degree.
    pub fn random<R: RngCore>(degree: usize, rng: &mut R) -> Self {
        let coeffs = (0..=degree).map(|_| Scalar::random(&mut *rng)).collect();
        PrivatePoly { coeffs }
    }

    /// Random polynomial with a fixed constant term. Used by reshare
    /// dealers, whose "secret" is their current share.
    pub fn with_constant<R: RngCore>(secret: Scalar, degree: usize, rng: &mut R) -> Self {
        let mut poly = Self::random(degree, rng);
        poly.coeffs[0] = secret;
        poly
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    /// The constant term.
    pub fn secret(&self) -> &Scalar {
        &self.coeffs[0]
    }

    /// Horner evaluation at `x = index`. Index 0 would reveal the secret
    /// and is rejected at the call sites that take untrusted indices.
    pub fn eval(&self, index: u32) -> Scalar {
        let x = Scalar::from(index as u64);
        let mut acc = Scalar::zero();
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        acc
    }

    /// Commit every coefficient to G2.
    pub fn commit(&self) -> PublicPoly {
        PublicPoly {
            commits: self
                .coeffs
                .iter()
                .map(|c| G2Projective::generator() * c)
                .collect(),
        }
    }
}

/// The public commitment polynomial `P(x) = Σ commits[k] · x^k` in G2.
///
/// `P(0)` is the group public key and `P(i)` the public key share of
/// participant `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicPoly {
    commits: Vec<G2Projective>,
}

impl PublicPoly {
    pub fn new(commits: Vec<G2Projective>) -> Self {
        PublicPoly { commits }
    }

    /// All-identity polynomial of the given length, the neutral element
    /// for [`PublicPoly::add`].
    pub fn zero(len: usize) -> Self {
        PublicPoly {
            commits: vec![G2Projective::identity(); len],
        }
    }

    /// Number of coefficients (`t` for a threshold-`t` polynomial).
    pub fn threshold(&self) -> usize {
        self.commits.len()
    }

    pub fn coeff(&self, k: usize) -> &G2Projective {
        &self.commits[k]
    }

    /// The group public key `P(0)`.
    pub fn public_key(&self) -> &G2Projective {
        &self.commits[0]
    }

    /// Horner evaluation in the exponent at `x = index`.
    pub fn eval(&self, index: u32) -> G2Projective {
        let x = Scalar::from(index as u64);
        let mut acc = G2Projective::identity();
        for commit in self.commits.iter().rev() {
            acc = acc * x + commit;
        }
        acc
    }

    /// Coefficient-wise sum; the shorter polynomial is padded with the
    /// identity.
    pub fn add(&mut self, other: &PublicPoly) {
        if other.commits.len() > self.commits.len() {
            self.commits
                .resize(other.commits.len(), G2Projective::identity());
        }
        for (acc, c) in self.commits.iter_mut().zip(other.commits.iter()) {
            *acc += c;
        }
    }

    /// Compressed wire form, constant term first.
    pub fn to_bytes(&self) -> Vec<Vec<u8>> {
        self.commits.iter().map(encode_g2).collect()
    }

    pub fn from_bytes(commits: &[Vec<u8>]) -> Result<Self, CryptoError> {
        let commits = commits
            .iter()
            .map(|b| decode_g2(b))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PublicPoly { commits })
    }
}

/// Lagrange basis coefficients at x = 0 for the given distinct indices.
fn lagrange_at_zero(indices: &[u32]) -> Result<Vec<Scalar>, CryptoError> {
    let mut basis = Vec::with_capacity(indices.len());
    for (j, &xj) in indices.iter().enumerate() {
        if xj == 0 {
            return Err(CryptoError::ZeroIndex);
        }
        let xj_s = Scalar::from(xj as u64);
        let mut num = Scalar::one();
        let mut den = Scalar::one();
        for (m, &xm) in indices.iter().enumerate() {
            if m == j {
                continue;
            }
            if xm == xj {
                return Err(CryptoError::DuplicateIndex(xm));
            }
            let xm_s = Scalar::from(xm as u64);
            num *= xm_s;
            den *= xm_s - xj_s;
        }
        let den_inv = den.invert();
        if !bool::from(den_inv.is_some()) {
            // distinct non-zero indices make this unreachable
            return Err(CryptoError::DuplicateIndex(xj));
        }
        basis.push(num * den_inv.unwrap());
    }
    Ok(basis)
}

/// Sorts shares by index and keeps the first `t`; errors below `t`.
fn select<T: Clone>(threshold: usize, shares: &[(u32, T)]) -> Result<Vec<(u32, T)>, CryptoError> {
    if shares.len() < threshold {
        return Err(CryptoError::InsufficientShares {
            have: shares.len(),
            need: threshold,
        });
    }
    let mut sorted = shares.to_vec();
    sorted.sort_by_key(|(i, _)| *i);
    sorted.truncate(threshold);
    Ok(sorted)
}

/// Recover the secret `f(0)` from `t` scalar shares at distinct indices.
pub fn recover_scalar_at_zero(
    threshold: usize,
    shares: &[(u32, Scalar)],
) -> Result<Scalar, CryptoError> {
    let picked = select(threshold, shares)?;
    let indices: Vec<u32> = picked.iter().map(|(i, _)| *i).collect();
    let basis = lagrange_at_zero(&indices)?;
    let mut acc = Scalar::zero();
    for ((_, share), lambda) in picked.iter().zip(basis.iter()) {
        acc += share * lambda;
    }
    Ok(acc)
}

/// Recover `f(0) · G1` from `t` G1 shares at distinct indices; this is how
/// a threshold signature is assembled from partials.
pub fn recover_g1_at_zero(
    threshold: usize,
    shares: &[(u32, G1Projective)],
) -> Result<G1Projective, CryptoError> {
    let picked = select(threshold, shares)?;
    let indices: Vec<u32> = picked.iter().map(|(i, _)| *i).collect();
    let basis = lagrange_at_zero(&indices)?;
    let mut acc = G1Projective::identity();
    for ((_, share), lambda) in picked.iter().zip(basis.iter()) {
        acc += share * lambda;
    }
    Ok(acc)
}

/// Recover `f(0) · G2` from `t` G2 shares at distinct indices. Resharing
/// uses this to reassemble commitment polynomials in the exponent.
pub fn recover_g2_at_zero(
    threshold: usize,
    shares: &[(u32, G2Projective)],
) -> Result<G2Projective, CryptoError> {
    let picked = select(threshold, shares)?;
    let indices: Vec<u32> = picked.iter().map(|(i, _)| *i).collect();
    let basis = lagrange_at_zero(&indices)?;
    let mut acc = G2Projective::identity();
    for ((_, share), lambda) in picked.iter().zip(basis.iter()) {
        acc += share * lambda;
    }
    Ok(acc)
}
