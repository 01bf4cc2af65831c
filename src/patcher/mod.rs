//! # Patcher
//!
//! This module covers the target address spaces patches are written into, and the engine that
//! turns patch records into writes.
//!
//! Every write goes through a [`Journal`], which saves the bytes it overwrites and puts them back
//! when dropped unless the batch is committed.

use std::error::Error;

pub mod engine;
pub mod image;
pub mod mem;

pub use engine::{ApplySummary, Batch, PatchEngine, PayloadImage, PlannedWrite};
pub use image::ImageBuffer;
pub use mem::ProcessMemory;

/// Memory that patches can be written into, addressed with target (32-bit) addresses
pub trait AddressSpace {
    /// Error type that can occur when reading or writing
    type Error: Error + Send + Sync + 'static;

    /// Whether `[address, address + len)` is backed by this address space
    fn contains(&self, address: u32, len: usize) -> bool;

    /// Reads `len` bytes at `address`
    fn read(&self, address: u32, len: usize) -> Result<Vec<u8>, Self::Error>;

    /// Overwrites the bytes at `address`
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Makes written code at `[address, address + len)` visible to instruction fetch
    fn flush_instruction_cache(&mut self, address: u32, len: usize);
}

impl<A: AddressSpace + ?Sized> AddressSpace for &mut A {
    type Error = A::Error;

    fn contains(&self, address: u32, len: usize) -> bool {
        (**self).contains(address, len)
    }

    fn read(&self, address: u32, len: usize) -> Result<Vec<u8>, Self::Error> {
        (**self).read(address, len)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        (**self).write(address, bytes)
    }

    fn flush_instruction_cache(&mut self, address: u32, len: usize) {
        (**self).flush_instruction_cache(address, len)
    }
}

/// End address of `[address, address + len)`, or `None` if it runs past 4 GiB
pub(crate) fn range_end(address: u32, len: usize) -> Option<u64> {
    let end = address as u64 + len as u64;
    (end <= 1 << 32).then_some(end)
}

/// Records the original bytes under every write so the writes can be undone
///
/// When this journal is dropped without [`Journal::commit`], every write is reverted in reverse
/// order.
pub struct Journal<'a, A: AddressSpace + ?Sized> {
    /// Address space being written
    space: &'a mut A,
    /// `(address, original bytes)` for every write so far
    saved: Vec<(u32, Vec<u8>)>,
}

impl<'a, A: AddressSpace + ?Sized> Journal<'a, A> {
    /// Starts an empty journal over `space`
    pub fn new(space: &'a mut A) -> Self {
        Self {
            space,
            saved: Vec::new(),
        }
    }

    /// Saves the bytes at `address` and overwrites them with `bytes`
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), A::Error> {
        let original = self.space.read(address, bytes.len())?;
        self.space.write(address, bytes)?;
        self.saved.push((address, original));
        Ok(())
    }

    /// Number of writes that would be reverted on drop
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Flushes `[address, address + len)` in the underlying address space
    pub fn flush_instruction_cache(&mut self, address: u32, len: usize) {
        self.space.flush_instruction_cache(address, len);
    }

    /// Keeps every write
    pub fn commit(mut self) {
        self.saved.clear();
    }
}

impl<A: AddressSpace + ?Sized> Drop for Journal<'_, A> {
    fn drop(&mut self) {
        while let Some((address, original)) = self.saved.pop() {
            // the bytes were just read from here, so writing them back should not fail
            if let Err(e) = self.space.write(address, &original) {
                tracing::warn!(address, error = %e, "failed to restore patched bytes");
            }
        }
    }
}
