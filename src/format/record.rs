//! Patch records: the typed instructions that describe each memory modification

use std::ops::{BitAnd, BitOr, Range};

use crate::error::FormatError;

use super::Cursor;

/// Size of one packed `wwfc_patch`
pub const RECORD_SIZE: usize = 16;

/// `wwfc_patch_level` bits. `CRITICAL` is the absence of any bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PatchLevel(pub u8);

impl PatchLevel {
    /// Always applied, regardless of configuration
    pub const CRITICAL: Self = Self(0x00);
    /// Fixes bugs in the game
    pub const BUGFIX: Self = Self(0x01);
    /// Needed for parity with clients on a regular patcher
    pub const PARITY: Self = Self(0x02);
    /// Additional features
    pub const FEATURE: Self = Self(0x04);
    /// Support patches that may be redundant depending on the patcher
    pub const SUPPORT: Self = Self(0x08);
    /// Patch has already been applied elsewhere and must be skipped
    pub const DISABLED: Self = Self(0x10);

    /// Every bit a configuration can enable
    pub const OPTIONAL: Self = Self(0x0F);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether a record at this level runs under the enabled `mask`
    ///
    /// Disabled records never run, critical records always do, anything else needs one of
    /// its bits enabled.
    pub fn is_enabled(self, mask: PatchLevel) -> bool {
        if self.contains(Self::DISABLED) {
            false
        } else if self == Self::CRITICAL {
            true
        } else {
            self.intersects(mask & Self::OPTIONAL)
        }
    }
}

impl BitOr for PatchLevel {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for PatchLevel {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// `wwfc_patch_type`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchType {
    /// Copy bytes into memory
    Write = 0,
    /// Unconditional branch
    Branch = 1,
    /// Branch out plus a branch back
    BranchHook = 2,
    /// Branch with link
    Call = 3,
    /// Load a register and branch through the count register
    BranchCtr = 4,
    /// Same as [`PatchType::BranchCtr`] with link
    BranchCtrLink = 5,
}

impl TryFrom<u8> for PatchType {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Write,
            1 => Self::Branch,
            2 => Self::BranchHook,
            3 => Self::Call,
            4 => Self::BranchCtr,
            5 => Self::BranchCtrLink,
            other => return Err(FormatError::UnknownPatchType(other)),
        })
    }
}

/// Arguments of a record, interpreted according to its type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    /// Copy `len` bytes found at `source` (an address in the payload image)
    Write {
        /// Address of the data inside the payload image
        source: u32,
        /// Number of bytes
        len: u32,
    },
    /// `b target`
    Branch {
        /// Branch destination
        target: u32,
    },
    /// `b target` at the record address, and `b address+len` at `return_site`
    BranchHook {
        /// Hook destination
        target: u32,
        /// Where the branch back is written
        return_site: u32,
    },
    /// `bl target`
    Call {
        /// Call destination
        target: u32,
    },
    /// Load `target` into `register` and branch through it
    BranchCtr {
        /// Branch destination
        target: u32,
        /// Scratch register
        register: u32,
    },
    /// Load `target` into `register` and call through it
    BranchCtrLink {
        /// Call destination
        target: u32,
        /// Scratch register
        register: u32,
    },
}

impl PatchOp {
    /// Resolves the raw argument words for `kind`
    pub fn new(kind: PatchType, arg0: u32, arg1: u32) -> Self {
        match kind {
            PatchType::Write => Self::Write {
                source: arg0,
                len: arg1,
            },
            PatchType::Branch => Self::Branch { target: arg0 },
            PatchType::BranchHook => Self::BranchHook {
                target: arg0,
                return_site: arg1,
            },
            PatchType::Call => Self::Call { target: arg0 },
            PatchType::BranchCtr => Self::BranchCtr {
                target: arg0,
                register: arg1,
            },
            PatchType::BranchCtrLink => Self::BranchCtrLink {
                target: arg0,
                register: arg1,
            },
        }
    }

    /// Record type of this op
    pub fn kind(&self) -> PatchType {
        match self {
            Self::Write { .. } => PatchType::Write,
            Self::Branch { .. } => PatchType::Branch,
            Self::BranchHook { .. } => PatchType::BranchHook,
            Self::Call { .. } => PatchType::Call,
            Self::BranchCtr { .. } => PatchType::BranchCtr,
            Self::BranchCtrLink { .. } => PatchType::BranchCtrLink,
        }
    }
}

/// One decoded `wwfc_patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    /// Gating level
    pub level: PatchLevel,
    /// Target address
    pub address: u32,
    /// Typed arguments
    pub op: PatchOp,
}

impl PatchRecord {
    /// Decodes one record from exactly [`RECORD_SIZE`] bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(bytes);
        let level = PatchLevel(cursor.u8()?);
        let kind = PatchType::try_from(cursor.u8()?)?;
        cursor.skip(2)?;
        let address = cursor.u32()?;
        let arg0 = cursor.u32()?;
        let arg1 = cursor.u32()?;
        Ok(Self {
            level,
            address,
            op: PatchOp::new(kind, arg0, arg1),
        })
    }
}

/// Lazy, restartable sequence of records over a patch list
#[derive(Debug, Clone)]
pub struct PatchRecords<'a> {
    /// Remaining, unread records
    remaining: std::slice::ChunksExact<'a, u8>,
}

impl<'a> Iterator for PatchRecords<'a> {
    type Item = Result<PatchRecord, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.remaining.next().map(PatchRecord::decode)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.remaining.size_hint()
    }
}

impl ExactSizeIterator for PatchRecords<'_> {}

/// Iterates the records in `range` of `bytes`. Clone the iterator before advancing it to walk
/// the list a second time.
pub fn iterate_patches(bytes: &[u8], range: Range<u32>) -> Result<PatchRecords<'_>, FormatError> {
    let Range { start, end } = range;
    if end < start {
        return Err(FormatError::RangeInverted {
            name: "patch_list",
            start,
            end,
        });
    }
    let len = end - start;
    if len as usize % RECORD_SIZE != 0 {
        return Err(FormatError::Misaligned {
            name: "patch_list",
            len,
            unit: RECORD_SIZE as u32,
        });
    }
    let list = bytes
        .get(start as usize..end as usize)
        .ok_or(FormatError::RangeOutOfBounds {
            name: "patch_list",
            start,
            end,
        })?;
    Ok(PatchRecords {
        remaining: list.chunks_exact(RECORD_SIZE),
    })
}
