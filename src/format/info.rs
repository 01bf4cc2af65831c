//! Payload info block: identity, version gating and the offsets of the body regions

use std::fmt;
use std::ops::Range;

use crate::error::{CompatibilityError, FormatError};

use super::Cursor;

/// Payload format this verifier implements
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

/// 12-byte NUL-padded game/build name, e.g. `RMCPD00`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GameId([u8; 12]);

impl GameId {
    /// Builds an id from an ASCII name of 1 to 12 bytes
    pub fn new(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > 12 || !name.is_ascii() || bytes.contains(&0) {
            return None;
        }
        let mut raw = [0; 12];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(Self(raw))
    }

    /// Wraps the raw field as found in a payload
    pub fn from_raw(raw: [u8; 12]) -> Self {
        Self(raw)
    }

    /// Raw NUL-padded field
    pub fn as_raw(&self) -> &[u8; 12] {
        &self.0
    }

    /// Name up to the first NUL
    pub fn name(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(12);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GameId({:?})", self.name())
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Parsed `wwfc_payload_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    /// Format version the payload was built with
    pub format_version: u32,
    /// Oldest format version the payload is still compatible with
    pub format_version_compat: u32,
    /// Target game/build
    pub name: GameId,
    /// Payload version
    pub version: u32,
    /// Global offset table, as payload offsets
    pub got: Range<u32>,
    /// Fixup table, as payload offsets
    pub fixup: Range<u32>,
    /// Patch record array, as payload offsets
    pub patch_list: Range<u32>,
    /// Entry point relative to the load address, used when the payload is relocated
    pub entry_point: u32,
    /// Absolute entry point, used when the payload is not relocated
    pub entry_point_no_got: u32,
    /// Human-readable build time
    pub build_timestamp: String,
}

impl PayloadInfo {
    /// Checks the payload targets `game`
    pub fn check_game(&self, game: &GameId) -> Result<(), CompatibilityError> {
        if self.name != *game {
            return Err(CompatibilityError::GameIdMismatch {
                expected: game.name(),
                actual: self.name.name(),
            });
        }
        Ok(())
    }

    /// Checks this verifier can interpret the payload format
    pub fn check_format(&self) -> Result<(), CompatibilityError> {
        if self.format_version_compat > SUPPORTED_FORMAT_VERSION
            || self.format_version < self.format_version_compat
        {
            return Err(CompatibilityError::UnsupportedFormat {
                format_version: self.format_version,
                compat: self.format_version_compat,
                supported: SUPPORTED_FORMAT_VERSION,
            });
        }
        Ok(())
    }

    /// Entry point for a payload loaded at `load_address`, or the absolute one if unrelocated
    pub fn entry(&self, load_address: Option<u32>) -> u32 {
        match load_address {
            Some(base) => base.wrapping_add(self.entry_point),
            None => self.entry_point_no_got,
        }
    }
}

/// Parses the info block at `offset` and validates its region offsets against `total_size`.
pub fn parse_info(bytes: &[u8], offset: usize) -> Result<PayloadInfo, FormatError> {
    let mut cursor = Cursor::at(bytes, offset);
    let format_version = cursor.u32()?;
    let format_version_compat = cursor.u32()?;
    let name = GameId::from_raw(cursor.array()?);
    let version = cursor.u32()?;
    let got = cursor.u32()?..cursor.u32()?;
    let fixup = cursor.u32()?..cursor.u32()?;
    let patch_list = cursor.u32()?..cursor.u32()?;
    let entry_point = cursor.u32()?;
    let entry_point_no_got = cursor.u32()?;
    cursor.skip(0x18)?;
    let stamp: [u8; 0x20] = cursor.array()?;
    let stamp_end = stamp.iter().position(|b| *b == 0).unwrap_or(stamp.len());
    let build_timestamp = String::from_utf8_lossy(&stamp[..stamp_end]).into_owned();

    let total_size = bytes.len() as u32;
    // the body starts after the info block, wherever the caller found it
    let body_start = cursor.position() as u32;
    let regions = [
        ("got", &got, 4),
        ("fixup", &fixup, 4),
        ("patch_list", &patch_list, super::record::RECORD_SIZE as u32),
    ];
    for (name, range, unit) in regions {
        check_range(name, range, body_start, total_size)?;
        let len = range.end - range.start;
        if len % unit != 0 {
            return Err(FormatError::Misaligned { name, len, unit });
        }
    }
    for (i, &(first, a, _)) in regions.iter().enumerate() {
        for &(second, b, _) in &regions[i + 1..] {
            if !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end {
                return Err(FormatError::RangesOverlap { first, second });
            }
        }
    }

    Ok(PayloadInfo {
        format_version,
        format_version_compat,
        name,
        version,
        got,
        fixup,
        patch_list,
        entry_point,
        entry_point_no_got,
        build_timestamp,
    })
}

/// Validates one half-open range. Empty ranges only need to end inside the payload.
fn check_range(
    name: &'static str,
    range: &Range<u32>,
    body_start: u32,
    total_size: u32,
) -> Result<(), FormatError> {
    let Range { start, end } = *range;
    if end < start {
        return Err(FormatError::RangeInverted { name, start, end });
    }
    let in_bounds = if start == end {
        end <= total_size
    } else {
        start >= body_start && end <= total_size
    };
    if !in_bounds {
        return Err(FormatError::RangeOutOfBounds { name, start, end });
    }
    Ok(())
}
