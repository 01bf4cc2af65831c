//! This module contains an in-memory target image

use std::ops::Range;

use thiserror::Error;

use super::{range_end, AddressSpace};

/// Errors when accessing an [`ImageBuffer`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Access falls outside the image
    #[error("{len:#x} bytes at {address:#x} are outside the image")]
    OutOfBounds {
        /// Start of the access
        address: u32,
        /// Length of the access
        len: usize,
    },
}

/// Target memory image held in a byte buffer, mapped at `base`
///
/// Used to patch a copy of the target (and in tests). Instruction cache flushes are only
/// recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    /// Address of the first byte
    base: u32,
    /// Image contents
    bytes: Vec<u8>,
    /// Every range passed to [`AddressSpace::flush_instruction_cache`]
    flushed: Vec<Range<u32>>,
}

impl ImageBuffer {
    /// Wraps `bytes` as the image mapped at `base`
    pub fn new(base: u32, bytes: Vec<u8>) -> Self {
        Self {
            base,
            bytes,
            flushed: Vec::new(),
        }
    }

    /// Zero-filled image of `len` bytes at `base`
    pub fn zeroed(base: u32, len: usize) -> Self {
        Self::new(base, vec![0; len])
    }

    /// Image contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Ranges flushed so far, in order
    pub fn flushed(&self) -> &[Range<u32>] {
        &self.flushed
    }

    /// Buffer indices for `[address, address + len)`
    fn span(&self, address: u32, len: usize) -> Result<Range<usize>, ImageError> {
        if !self.contains(address, len) {
            return Err(ImageError::OutOfBounds { address, len });
        }
        let start = (address - self.base) as usize;
        Ok(start..start + len)
    }
}

impl AddressSpace for ImageBuffer {
    type Error = ImageError;

    fn contains(&self, address: u32, len: usize) -> bool {
        let image_end = self.base as u64 + self.bytes.len() as u64;
        match range_end(address, len) {
            Some(end) => address >= self.base && end <= image_end,
            None => false,
        }
    }

    fn read(&self, address: u32, len: usize) -> Result<Vec<u8>, Self::Error> {
        let span = self.span(address, len)?;
        Ok(self.bytes[span].to_vec())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let span = self.span(address, bytes.len())?;
        self.bytes[span].copy_from_slice(bytes);
        Ok(())
    }

    fn flush_instruction_cache(&mut self, address: u32, len: usize) {
        self.flushed.push(address..address.saturating_add(len as u32));
    }
}
