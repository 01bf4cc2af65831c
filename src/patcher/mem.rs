//! This module contains an address space over live host memory, which adjusts memory
//! permissions to patch read-only code

use std::fmt;
use std::ptr;

use region::Protection;
use thiserror::Error;

use super::{range_end, AddressSpace};

/// Errors when patching process memory
#[derive(Debug, Error)]
pub enum ProcessMemoryError {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Access falls outside the mapped block
    #[error("{len:#x} bytes at {address:#x} are outside the mapped block")]
    OutOfBounds {
        /// Start of the access
        address: u32,
        /// Length of the access
        len: usize,
    },
}

/// Host hook that invalidates the instruction cache for a host memory range
pub type FlushHook = Box<dyn FnMut(*const u8, usize) + Send>;

/// A block of host memory that the target sees at `origin`
///
/// Writes change the protection of the affected pages to read-write-execute for the duration
/// of the copy, then restore it. Instruction cache invalidation is delegated to the host's
/// [`FlushHook`]; without one, flushes are a no-op (correct on hosts with coherent caches).
pub struct ProcessMemory {
    /// First host byte of the block
    ptr: *mut u8,
    /// Length of the block
    len: usize,
    /// Target address of `ptr`
    origin: u32,
    /// Host instruction cache flush
    flush: Option<FlushHook>,
}

// Safety: the creator of a `ProcessMemory` guarantees it is the only writer of the block
unsafe impl Send for ProcessMemory {}

impl ProcessMemory {
    /// Maps `len` host bytes at `ptr` to target addresses starting at `origin`
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the lifetime of the returned
    /// value, and must not be memory tracked by Rust (or memory whose changes Rust can observe
    /// through a shared reference).
    ///
    /// The patched code must not be executing while it is written; quiescing other threads is
    /// the caller's responsibility.
    pub unsafe fn new(ptr: *mut u8, len: usize, origin: u32) -> Self {
        Self {
            ptr,
            len,
            origin,
            flush: None,
        }
    }

    /// Sets the host instruction cache flush
    pub fn with_flush_hook(mut self, flush: FlushHook) -> Self {
        self.flush = Some(flush);
        self
    }

    /// Host pointer for `[address, address + len)`
    fn host(&self, address: u32, len: usize) -> Result<*mut u8, ProcessMemoryError> {
        if !self.contains(address, len) {
            return Err(ProcessMemoryError::OutOfBounds { address, len });
        }
        // Safety: `contains` guarantees the offset is inside the block
        Ok(unsafe { self.ptr.add((address - self.origin) as usize) })
    }
}

impl fmt::Debug for ProcessMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemory")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("origin", &self.origin)
            .field("flush", &self.flush.is_some())
            .finish()
    }
}

impl AddressSpace for ProcessMemory {
    type Error = ProcessMemoryError;

    fn contains(&self, address: u32, len: usize) -> bool {
        let block_end = self.origin as u64 + self.len as u64;
        match range_end(address, len) {
            Some(end) => address >= self.origin && end <= block_end,
            None => false,
        }
    }

    fn read(&self, address: u32, len: usize) -> Result<Vec<u8>, Self::Error> {
        let location = self.host(address, len)?;
        let mut bytes = vec![0; len];
        // Safety: `new`'s contract makes the whole block readable
        unsafe { ptr::copy(location, bytes.as_mut_ptr(), len) };
        Ok(bytes)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        let location = self.host(address, bytes.len())?;
        unsafe {
            // Safety: the guard restores the old protection when dropped, after the copy
            let _guard =
                region::protect_with_handle(location, bytes.len(), Protection::READ_WRITE_EXECUTE)?;
            ptr::copy(bytes.as_ptr(), location, bytes.len());
        }
        Ok(())
    }

    fn flush_instruction_cache(&mut self, address: u32, len: usize) {
        let Ok(location) = self.host(address, len) else {
            return;
        };
        if let Some(flush) = self.flush.as_mut() {
            flush(location as *const u8, len);
        }
    }
}
