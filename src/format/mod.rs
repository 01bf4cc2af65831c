//! # Format
//!
//! Binary layout of WWFC payloads. Every multi-byte field is big-endian and every struct is
//! packed, so fields are read one at a time through [`Cursor`] rather than by layout.
//!
//! ```text
//! 0x000  magic "WWFC/Payload"       12
//! 0x00C  total_size                  4
//! 0x010  RSA-2048 signature        256
//! 0x110  salt                       32   <- signed region starts here
//! 0x130  payload info             0x70
//! 0x1A0  body (GOT, fixups, patch list, data, code)
//! ```
//!
//! Parsing never mutates anything, and nothing inside the signed region is trusted by these
//! functions beyond the bounds needed to locate it.

use std::fmt;

use crate::error::FormatError;

pub mod info;
pub mod record;
pub mod reloc;

pub use info::{parse_info, GameId, PayloadInfo};
pub use record::{iterate_patches, PatchLevel, PatchOp, PatchRecord, PatchRecords, PatchType};

/// Header magic
pub const MAGIC: &[u8; 12] = b"WWFC/Payload";
/// Length of the RSA-2048 signature
pub const SIGNATURE_SIZE: usize = 0x100;
/// Length of the salt (one SHA-256 digest)
pub const SALT_SIZE: usize = 0x20;
/// Length of the fixed header
pub const HEADER_SIZE: usize = MAGIC.len() + 4 + SIGNATURE_SIZE;
/// Offset of the salt, which is also where the signed region starts
pub const SALT_OFFSET: usize = HEADER_SIZE;
/// Offset of [`PayloadInfo`]
pub const INFO_OFFSET: usize = SALT_OFFSET + SALT_SIZE;
/// Length of [`PayloadInfo`]
pub const INFO_SIZE: usize = 0x70;
/// First byte after the fixed prefix
pub const BODY_OFFSET: usize = INFO_OFFSET + INFO_SIZE;
/// Largest payload a client will buffer
pub const PAYLOAD_BLOCK_SIZE: usize = 0x20000;

/// Big-endian field reader over a byte slice
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    /// Underlying bytes
    bytes: &'a [u8],
    /// Offset of the next read
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Creates a cursor positioned at `offset`
    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, pos: offset }
    }

    /// Offset of the next read
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Takes the next `len` bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FormatError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Skips `len` bytes
    pub fn skip(&mut self, len: usize) -> Result<(), FormatError> {
        self.take(len).map(|_| ())
    }

    /// Reads a fixed-size array
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads one byte
    pub fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a big-endian `u32`
    pub fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_be_bytes(self.array()?))
    }
}

/// Per-session random value that binds a payload to one negotiation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Salt(pub [u8; SALT_SIZE]);

impl Salt {
    /// Draws a fresh salt from the OS random source
    pub fn random() -> Result<Self, getrandom::Error> {
        let mut bytes = [0; SALT_SIZE];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Salt as lowercase hex, the form used in requests
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compares against another salt without leaking where they differ
    pub fn ct_eq(&self, other: &Salt) -> bool {
        subtle::ConstantTimeEq::ct_eq(&self.0[..], &other.0[..]).into()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", self.to_hex())
    }
}

/// Fixed payload header
#[derive(Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Byte length of the whole payload, header included
    pub total_size: u32,
    /// RSA-2048 signature over the SHA-256 of `[salt..total_size)`
    pub signature: [u8; SIGNATURE_SIZE],
    /// Salt at the start of the signed region
    pub salt: Salt,
}

impl PayloadHeader {
    /// The signed region of `bytes`. Only valid for the buffer this header was parsed from.
    pub fn signed_region<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[SALT_OFFSET..self.total_size as usize]
    }
}

impl fmt::Debug for PayloadHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadHeader")
            .field("total_size", &self.total_size)
            .field("salt", &self.salt)
            .finish_non_exhaustive()
    }
}

/// Parses the header and salt, checking the magic and that `total_size` is exactly the
/// number of bytes received.
pub fn parse(bytes: &[u8]) -> Result<PayloadHeader, FormatError> {
    let mut cursor = Cursor::new(bytes);
    if cursor.take(MAGIC.len())? != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let total_size = cursor.u32()?;
    if total_size as usize != bytes.len() {
        return Err(FormatError::LengthMismatch {
            declared: total_size,
            actual: bytes.len(),
        });
    }
    // must hold at least the fixed prefix for the info block to be addressable
    if bytes.len() < BODY_OFFSET {
        return Err(FormatError::Truncated {
            offset: bytes.len(),
            needed: BODY_OFFSET - bytes.len(),
        });
    }
    let signature = cursor.array()?;
    let salt = Salt(cursor.array()?);
    Ok(PayloadHeader {
        total_size,
        signature,
        salt,
    })
}
