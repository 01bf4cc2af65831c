//! # Crypto
//!
//! Hash and signature capabilities used to authenticate payloads. The verifier only depends on
//! the [`HashPrimitive`] and [`SignaturePrimitive`] traits; [`Sha256Hash`] and [`TrustAnchor`]
//! are the implementations used in practice.

use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;

use crate::error::TrustError;

pub mod keys;

pub use keys::Environment;

/// Length of a digest
pub const DIGEST_SIZE: usize = 32;

/// A SHA-256 digest
pub type Digest = [u8; DIGEST_SIZE];

/// Computes a fixed-size digest over a byte buffer
pub trait HashPrimitive {
    /// Digest of `data`
    fn digest(&self, data: &[u8]) -> Digest;
}

/// Verifies a signature over a digest
pub trait SignaturePrimitive {
    /// Succeeds only if `signature` is valid for `digest`
    fn verify(&self, digest: &Digest, signature: &[u8]) -> Result<(), TrustError>;
}

/// SHA-256
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl HashPrimitive for Sha256Hash {
    fn digest(&self, data: &[u8]) -> Digest {
        Sha256::digest(data).into()
    }
}

/// Compares two digests in constant time
pub fn digest_eq(a: &Digest, b: &Digest) -> bool {
    a.ct_eq(b).into()
}

/// RSA-2048 public key that payload signatures must verify against
///
/// Signatures are RSASSA-PKCS1-v1_5 with a SHA-256 digest info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    /// Verification key
    key: RsaPublicKey,
}

impl TrustAnchor {
    /// Embedded key for `environment`
    pub fn for_environment(environment: Environment) -> Result<Self, TrustError> {
        Self::from_mincrypt(environment.key_blob())
    }

    /// Decodes a mincrypt key blob
    pub fn from_mincrypt(blob: &[u8]) -> Result<Self, TrustError> {
        keys::decode_mincrypt(blob).map(Self::from_public_key)
    }

    /// Wraps an already decoded key
    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self { key }
    }
}

impl SignaturePrimitive for TrustAnchor {
    fn verify(&self, digest: &Digest, signature: &[u8]) -> Result<(), TrustError> {
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|_| TrustError::SignatureInvalid)
    }
}
