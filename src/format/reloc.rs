//! Relocation of a verified payload image to its load address
//!
//! Every word in the GOT is an offset that becomes an absolute address once the payload is
//! loaded. Every fixup entry is the payload offset of some other word (typically a pointer in a
//! patch record or in data) that needs the same treatment.

use crate::error::FormatError;

use super::{PayloadInfo, BODY_OFFSET};

/// Returns a copy of `bytes` relocated to `base`
///
/// `bytes` must already be authenticated; relocation changes signed bytes.
pub fn relocate(bytes: &[u8], info: &PayloadInfo, base: u32) -> Result<Vec<u8>, FormatError> {
    let mut image = bytes.to_vec();

    for offset in (info.got.start..info.got.end).step_by(4) {
        add_word(&mut image, offset, base)?;
    }

    let table = bytes
        .get(info.fixup.start as usize..info.fixup.end as usize)
        .ok_or(FormatError::RangeOutOfBounds {
            name: "fixup",
            start: info.fixup.start,
            end: info.fixup.end,
        })?;
    let fixups: Vec<u32> = table
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    for offset in fixups {
        if (offset as usize) < BODY_OFFSET || offset % 4 != 0 {
            return Err(FormatError::FixupOutOfBounds { offset });
        }
        add_word(&mut image, offset, base)?;
    }

    Ok(image)
}

/// Adds `base` to the big-endian word at `offset`
fn add_word(image: &mut [u8], offset: u32, base: u32) -> Result<(), FormatError> {
    let start = offset as usize;
    let word = image
        .get_mut(start..start + 4)
        .ok_or(FormatError::FixupOutOfBounds { offset })?;
    let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]).wrapping_add(base);
    word.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
