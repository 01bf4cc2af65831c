//! Embedded trust anchors
//!
//! Keys are stored in the mincrypt layout the console-side verifier uses:
//!
//! ```text
//! 0x000  n0inv   u32        -1 / n mod 2^32
//! 0x004  n       64 x u32   modulus, least significant word first
//! 0x104  rr      64 x u32   R^2 mod n, least significant word first
//! ```
//!
//! Words are big-endian. The public exponent is not stored and is always 65537.

use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::TrustError;

/// Byte length of an RSA-2048 modulus
pub const MODULUS_SIZE: usize = 0x100;
/// Byte length of a mincrypt key blob
pub const MINCRYPT_KEY_SIZE: usize = 4 + 2 * MODULUS_SIZE;
/// Number of 32-bit words in the modulus
const WORDS: usize = MODULUS_SIZE / 4;

/// Which service the client talks to, and therefore which key signs its payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Live service
    #[default]
    Production,
    /// Development service
    Development,
}

impl Environment {
    /// Default service domain
    pub fn domain(self) -> &'static str {
        match self {
            Environment::Production => "zpltest.xyz",
            Environment::Development => "nwfc.wiinoma.com",
        }
    }

    /// Embedded signing key blob
    pub fn key_blob(self) -> &'static [u8; MINCRYPT_KEY_SIZE] {
        match self {
            Environment::Production => &PRODUCTION_KEY,
            Environment::Development => &DEVELOPMENT_KEY,
        }
    }
}

/// Reads the big-endian word at word index `index`
fn word(blob: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_be_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
}

/// Converts a least-significant-word-first array into big-endian bytes
fn words_to_be(blob: &[u8], first_word: usize) -> Vec<u8> {
    (0..WORDS)
        .rev()
        .flat_map(|i| word(blob, first_word + i).to_be_bytes())
        .collect()
}

/// Decodes and sanity-checks a mincrypt key blob
pub fn decode_mincrypt(blob: &[u8]) -> Result<RsaPublicKey, TrustError> {
    if blob.len() != MINCRYPT_KEY_SIZE {
        return Err(TrustError::InvalidKey("key blob has the wrong length"));
    }
    let n0inv = word(blob, 0);
    if word(blob, 1).wrapping_mul(n0inv) != u32::MAX {
        return Err(TrustError::InvalidKey("n0inv does not match the modulus"));
    }

    let n = BigUint::from_bytes_be(&words_to_be(blob, 1));
    let rr = BigUint::from_bytes_be(&words_to_be(blob, 1 + WORDS));
    let r_squared = BigUint::from_bytes_be(&[1]) << (2 * MODULUS_SIZE * 8);
    if r_squared % &n != rr {
        return Err(TrustError::InvalidKey("rr does not match the modulus"));
    }

    RsaPublicKey::new(n, BigUint::from_bytes_be(&[0x01, 0x00, 0x01]))
        .map_err(|_| TrustError::InvalidKey("modulus rejected"))
}

/// Production payload signing key
pub static PRODUCTION_KEY: [u8; MINCRYPT_KEY_SIZE] = [
    0xfa, 0xb0, 0x97, 0x03, 0xe0, 0x25, 0xf4, 0x55, 0x67, 0x8f, 0xa0, 0x59,
    0xc8, 0xee, 0x2b, 0x54, 0x06, 0xde, 0x15, 0x75, 0xb4, 0x30, 0x31, 0xed,
    0xad, 0x6a, 0x29, 0xeb, 0x92, 0x3a, 0x39, 0x7a, 0xa2, 0x10, 0x6a, 0x03,
    0xff, 0x93, 0xa6, 0x15, 0xd3, 0x40, 0x81, 0x63, 0xd1, 0xa1, 0xe0, 0x73,
    0xd3, 0x93, 0x82, 0x55, 0x5b, 0xb0, 0x2d, 0x83, 0x40, 0xc9, 0x58, 0x8f,
    0x19, 0xdf, 0x3d, 0x85, 0x42, 0x86, 0x44, 0xb7, 0x4b, 0x4c, 0xee, 0xf4,
    0x30, 0xe3, 0x05, 0xb9, 0x61, 0x55, 0x89, 0x95, 0xc3, 0x57, 0x7b, 0x79,
    0x79, 0x59, 0x0b, 0x82, 0x86, 0x6e, 0xfe, 0x5d, 0xec, 0xa7, 0x66, 0x80,
    0xb4, 0x82, 0x0d, 0x75, 0xb9, 0x59, 0xa5, 0x83, 0x85, 0xe6, 0x10, 0x07,
    0x74, 0xf2, 0x4a, 0x52, 0x50, 0x7f, 0x1b, 0xde, 0xe1, 0xf3, 0xfb, 0xd2,
    0x8f, 0x3f, 0x22, 0x75, 0x30, 0x08, 0x29, 0xd7, 0x39, 0xe4, 0xe8, 0x18,
    0x5c, 0x96, 0xfc, 0x07, 0xe4, 0xfe, 0xbd, 0x91, 0xe5, 0x9d, 0x04, 0xda,
    0xbd, 0x99, 0x64, 0x65, 0x23, 0xe4, 0xa6, 0x10, 0x8a, 0x84, 0x76, 0x73,
    0x8f, 0xea, 0x07, 0x23, 0x1c, 0x94, 0x70, 0x93, 0x96, 0x82, 0x1e, 0x94,
    0xc5, 0x27, 0x00, 0x25, 0x61, 0x1c, 0xd4, 0x7d, 0xad, 0x51, 0x34, 0xbf,
    0xea, 0xc0, 0x3a, 0xd3, 0xbd, 0x77, 0x23, 0xfc, 0x1b, 0x86, 0xd1, 0x03,
    0x99, 0xc0, 0x41, 0x58, 0x7d, 0x61, 0x8c, 0xb9, 0xf6, 0x7e, 0x91, 0x64,
    0x0c, 0x56, 0xe7, 0xb5, 0xc8, 0xe4, 0xf5, 0xb4, 0x2c, 0x15, 0xf4, 0x6a,
    0x3d, 0xbd, 0xfd, 0xa1, 0x00, 0x33, 0x87, 0x6d, 0x08, 0x02, 0x93, 0x40,
    0x53, 0x19, 0xea, 0xa6, 0x7d, 0xcc, 0x59, 0x3e, 0xd7, 0x9a, 0xfd, 0x07,
    0x3d, 0xdd, 0xcd, 0x27, 0xa6, 0x7e, 0xba, 0x61, 0xcb, 0xe2, 0x6c, 0x36,
    0x6f, 0x35, 0x04, 0x22, 0xe6, 0xe6, 0xce, 0x41, 0x99, 0x7a, 0x79, 0xe2,
    0x14, 0x56, 0x8e, 0xb7, 0x38, 0xce, 0xa8, 0x2f, 0xcf, 0x2d, 0x26, 0xd9,
    0xd2, 0x01, 0x3e, 0xe6, 0x29, 0x31, 0x60, 0xef, 0x76, 0x33, 0x9d, 0x1a,
    0xac, 0x8a, 0x3e, 0x3b, 0x5a, 0xea, 0xc1, 0x1d, 0x10, 0x0f, 0x11, 0xeb,
    0x92, 0xdf, 0xcb, 0x57, 0x3f, 0x7f, 0x67, 0xf3, 0x84, 0xd5, 0x88, 0xec,
    0x55, 0xc6, 0x88, 0x37, 0xa8, 0xae, 0x7d, 0xd6, 0xb8, 0xb3, 0x9f, 0xa9,
    0x2f, 0x0a, 0x0a, 0xe2, 0x60, 0x42, 0x84, 0x98, 0x1f, 0xb8, 0xfa, 0x67,
    0xdc, 0xcd, 0x16, 0xe5, 0xdd, 0x39, 0x27, 0xff, 0x61, 0x83, 0x7c, 0xd3,
    0x1c, 0x26, 0xef, 0x49, 0xbd, 0x77, 0x22, 0x2a, 0xc2, 0xd0, 0x22, 0x84,
    0xd9, 0x58, 0x0d, 0xd1, 0xfe, 0x49, 0x92, 0x4e, 0xdd, 0x66, 0xa1, 0x0f,
    0x60, 0x22, 0x56, 0x43, 0xca, 0xc3, 0xa4, 0x11, 0x2f, 0x02, 0x73, 0x85,
    0xe4, 0x7e, 0xc5, 0xbb, 0xad, 0xe8, 0xe0, 0xa7, 0x02, 0x3f, 0x42, 0xf0,
    0xfb, 0xb8, 0x3f, 0x29, 0xb3, 0xd6, 0x5b, 0xd0, 0x3b, 0x39, 0x70, 0xcd,
    0xcb, 0x4f, 0xdd, 0xf2, 0xe1, 0x7c, 0xf8, 0xee, 0xde, 0x0f, 0x88, 0x28,
    0xab, 0x01, 0x2e, 0xcd, 0xca, 0xf4, 0x60, 0x57, 0xc1, 0xd3, 0x64, 0x82,
    0xa6, 0x1b, 0x10, 0xa2, 0x93, 0xef, 0xf1, 0x56, 0x3a, 0x0e, 0x25, 0xe5,
    0x84, 0xf7, 0x2e, 0xb4, 0x14, 0x01, 0x87, 0xda, 0x7b, 0x28, 0xcc, 0xb9,
    0xd4, 0xde, 0x7c, 0xc6, 0x16, 0xee, 0x05, 0xae, 0x18, 0x7e, 0x39, 0x85,
    0x4f, 0xa0, 0x10, 0x44, 0x09, 0x21, 0xe8, 0xb1, 0x81, 0x4a, 0x8b, 0xc2,
    0xe3, 0xa3, 0x73, 0x75, 0x8c, 0xbe, 0x60, 0x32, 0xbc, 0x41, 0x16, 0x94,
    0x0a, 0xe9, 0xc9, 0x6a, 0x0f, 0x83, 0xe7, 0x4d, 0x2e, 0xb8, 0xa8, 0x52,
    0xe9, 0x5d, 0xda, 0x96, 0x68, 0x0d, 0x4b, 0xd7, 0x0c, 0x14, 0xbe, 0xb6,
];

/// Development payload signing key
pub static DEVELOPMENT_KEY: [u8; MINCRYPT_KEY_SIZE] = [
    0x3f, 0x32, 0xeb, 0x87, 0xb9, 0x75, 0x15, 0xc9, 0x60, 0x17, 0x7c, 0xcf,
    0x52, 0x18, 0x36, 0x66, 0x8e, 0xe9, 0x26, 0xe8, 0x58, 0x1f, 0xff, 0x84,
    0xca, 0x63, 0x63, 0x9f, 0x4f, 0xa5, 0x77, 0x41, 0xe4, 0x4e, 0x5c, 0x49,
    0xb7, 0x54, 0x15, 0xf5, 0x74, 0x70, 0xbc, 0xf4, 0xce, 0x5e, 0x66, 0x78,
    0xf1, 0xe5, 0xfe, 0x3a, 0x98, 0x18, 0xbd, 0x8f, 0x9a, 0xb7, 0x52, 0x99,
    0x7c, 0x80, 0x00, 0x81, 0xf3, 0xc0, 0xce, 0xf1, 0x8b, 0xac, 0x43, 0x18,
    0x44, 0x95, 0x7e, 0xb8, 0x06, 0x41, 0x0e, 0xa7, 0x3e, 0x0e, 0xc0, 0x68,
    0x01, 0x69, 0x88, 0x86, 0x81, 0x2f, 0xfe, 0x5d, 0xfb, 0x62, 0xcf, 0x0e,
    0xdf, 0x4b, 0x1c, 0x67, 0x0f, 0x09, 0xaf, 0x37, 0x40, 0x60, 0x06, 0x34,
    0xe4, 0xc8, 0x98, 0x55, 0xf3, 0xd0, 0xb5, 0xfe, 0x8c, 0x92, 0x92, 0xe0,
    0x69, 0xd9, 0x02, 0x7d, 0xe5, 0x1e, 0x55, 0x00, 0x1c, 0xdf, 0x44, 0xd6,
    0x51, 0x4b, 0xd6, 0xd3, 0xe2, 0xbc, 0xc0, 0xca, 0xf8, 0x42, 0x90, 0xee,
    0x90, 0xf7, 0xc5, 0xce, 0x6d, 0xd2, 0x3d, 0x9e, 0x26, 0x6d, 0x97, 0xe0,
    0xc0, 0x82, 0x8c, 0x63, 0xdc, 0xd6, 0x80, 0x67, 0xc7, 0x58, 0x72, 0xd2,
    0xbe, 0x2f, 0xe4, 0x39, 0x5a, 0x6c, 0x0d, 0x8a, 0xb4, 0x88, 0xef, 0x3d,
    0xd2, 0xde, 0xda, 0x48, 0x62, 0xda, 0x9e, 0x5f, 0xce, 0x3e, 0xd9, 0x09,
    0x1e, 0xc6, 0x74, 0x4d, 0x74, 0xd2, 0x6f, 0xba, 0x83, 0xc0, 0x4b, 0x7e,
    0xe0, 0x76, 0x2c, 0x45, 0xa8, 0x32, 0xac, 0xbc, 0x8d, 0x65, 0xdf, 0xdc,
    0x9d, 0x00, 0x2e, 0x8a, 0xf8, 0x4b, 0x82, 0x35, 0xbd, 0xe3, 0x04, 0x91,
    0xae, 0x3d, 0x5b, 0xe9, 0xef, 0x85, 0xc2, 0xb1, 0xd5, 0xd4, 0xf6, 0x1d,
    0x30, 0xbc, 0xcd, 0x3e, 0x38, 0xf8, 0x51, 0x55, 0xfc, 0x5a, 0x1b, 0x64,
    0x3f, 0x64, 0x37, 0x2e, 0xe5, 0xe7, 0x0d, 0x68, 0x88, 0xfc, 0x55, 0x3d,
    0x69, 0x5e, 0x4d, 0xcd, 0x18, 0xea, 0xd3, 0xd7, 0x41, 0x4c, 0x64, 0x82,
    0x9f, 0x4f, 0xc9, 0x97, 0x0a, 0xe9, 0x74, 0x3c, 0x94, 0xf9, 0x82, 0x7f,
    0x3e, 0x89, 0x9a, 0x4e, 0x62, 0x0e, 0x99, 0xb9, 0x4f, 0xbb, 0xef, 0x05,
    0x18, 0x1f, 0x61, 0xc7, 0xe1, 0xed, 0xf8, 0x70, 0xbf, 0x81, 0xe6, 0x9c,
    0x58, 0xb4, 0x9a, 0xdf, 0x30, 0xdc, 0xbe, 0xb3, 0x38, 0x9f, 0x53, 0x57,
    0x7c, 0xa7, 0x1e, 0xe5, 0xd9, 0x11, 0x67, 0x09, 0x09, 0xc0, 0xc6, 0x20,
    0x69, 0x60, 0xda, 0xd3, 0x1d, 0x87, 0x0e, 0xed, 0x15, 0xf0, 0x85, 0x2c,
    0x68, 0xcd, 0x18, 0xa6, 0x07, 0x04, 0xc1, 0xf9, 0xa4, 0xfb, 0x74, 0x56,
    0x98, 0xd7, 0x46, 0xfc, 0x31, 0x47, 0x6a, 0x09, 0x04, 0xa3, 0x76, 0x3b,
    0x26, 0x83, 0x34, 0xde, 0xd2, 0x22, 0xf2, 0x3f, 0xd4, 0xd9, 0xbb, 0xf0,
    0xba, 0x3f, 0xb3, 0x1e, 0x96, 0x44, 0x04, 0xa1, 0xc8, 0x40, 0xb2, 0x0c,
    0x8a, 0x07, 0xea, 0x16, 0x7d, 0x57, 0x49, 0x9e, 0x6b, 0xec, 0xd3, 0xe1,
    0x77, 0x29, 0x35, 0x6f, 0x82, 0xd7, 0xb8, 0x5a, 0x2b, 0xf3, 0x1a, 0x79,
    0xf9, 0x84, 0xaf, 0x7a, 0x35, 0x85, 0x26, 0xb4, 0xfc, 0x58, 0x2f, 0x89,
    0x2a, 0x97, 0xc8, 0x49, 0xb3, 0x61, 0xbd, 0xf5, 0xda, 0xe9, 0x87, 0x9b,
    0xea, 0x5c, 0x4c, 0x15, 0x19, 0x1f, 0x76, 0x0c, 0x01, 0x6f, 0x32, 0x80,
    0x73, 0xd1, 0xc4, 0x4a, 0x87, 0x32, 0x1e, 0xd6, 0xdf, 0xd9, 0x0a, 0x27,
    0x66, 0xb2, 0x74, 0xc1, 0xca, 0xae, 0x16, 0xca, 0x17, 0x66, 0x09, 0xe9,
    0x37, 0xca, 0x20, 0xfe, 0xa2, 0xa6, 0x7b, 0x2c, 0xd9, 0x6d, 0x91, 0x26,
    0xe6, 0x61, 0xdd, 0xbb, 0x11, 0x18, 0x7c, 0xfb, 0x8f, 0x43, 0x71, 0x6b,
    0x6a, 0xa2, 0x0a, 0xd3, 0xc6, 0x98, 0x94, 0xd8, 0x63, 0xb0, 0x49, 0xf5,
];
