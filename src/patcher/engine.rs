//! # Patch engine
//!
//! Applies a payload's patch records to an [`AddressSpace`] in two passes:
//!
//! 1. [`PatchEngine::plan`] encodes every enabled record into a [`Batch`] of writes and checks
//!    that every write lands inside a permitted region. Nothing is written.
//! 2. [`PatchEngine::commit`] performs the writes through a [`Journal`], rolling everything back
//!    if any write fails, then flushes the instruction cache over everything written.
//!
//! A batch is either applied completely or not at all.

use std::fmt;
use std::ops::Range;

use tracing::{debug, info};

use crate::code::{EncodeError, InstructionEncoder};
use crate::error::{ApplyError, FormatError, PayloadError};
use crate::format::{PatchLevel, PatchOp, PatchRecord, PatchRecords};

use super::{range_end, AddressSpace, Journal};

/// The verified payload bytes that WRITE records copy from
#[derive(Debug, Clone, Copy)]
pub struct PayloadImage<'a> {
    /// Payload, relocated if `load_address` is set
    bytes: &'a [u8],
    /// Where the payload itself is loaded in the target, if anywhere
    load_address: Option<u32>,
}

impl<'a> PayloadImage<'a> {
    /// A payload that is only read from; WRITE sources are payload offsets
    pub fn unloaded(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            load_address: None,
        }
    }

    /// A payload that is also written into the target at `load_address`; WRITE sources are
    /// target addresses inside the loaded payload
    pub fn loaded(bytes: &'a [u8], load_address: u32) -> Self {
        Self {
            bytes,
            load_address: Some(load_address),
        }
    }

    /// Target address of the first payload byte (0 when not loaded)
    pub fn base(&self) -> u32 {
        self.load_address.unwrap_or(0)
    }

    /// The `len` bytes that a WRITE record with source `address` copies
    fn source(&self, address: u32, len: u32) -> Result<&'a [u8], FormatError> {
        let out_of_bounds = FormatError::WriteSourceOutOfBounds {
            source_address: address,
            len,
        };
        let start = address.checked_sub(self.base()).ok_or(out_of_bounds.clone())? as usize;
        self.bytes
            .get(start..start + len as usize)
            .ok_or(out_of_bounds)
    }
}

/// One write of a batch
#[derive(Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    /// Target address
    pub address: u32,
    /// Bytes to write
    pub bytes: Vec<u8>,
}

impl fmt::Debug for PlannedWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlannedWrite({:#x}, {})", self.address, hex::encode(&self.bytes))
    }
}

/// Every write of a payload, validated and ready to commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Writes in record order
    writes: Vec<PlannedWrite>,
    /// Records that produced writes
    applied: usize,
    /// Records skipped by level gating
    skipped: usize,
}

impl Batch {
    /// Writes in record order
    pub fn writes(&self) -> &[PlannedWrite] {
        &self.writes
    }

    /// Records that will be applied
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Records skipped by level gating
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Result of a committed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplySummary {
    /// Records applied
    pub applied: usize,
    /// Records skipped by level gating
    pub skipped: usize,
    /// Total bytes written, payload image included
    pub bytes_written: usize,
}

/// Turns patch records into writes for one architecture and configuration
pub struct PatchEngine {
    /// Branch encoder for the target
    encoder: Box<dyn InstructionEncoder + Send + Sync>,
    /// Enabled optional levels
    mask: PatchLevel,
    /// Where writes may land; empty means anywhere in the address space
    regions: Vec<Range<u32>>,
}

impl fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEngine")
            .field("mask", &self.mask)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl PatchEngine {
    /// Creates an engine that only applies critical records, anywhere in the address space
    pub fn new(encoder: Box<dyn InstructionEncoder + Send + Sync>) -> Self {
        Self {
            encoder,
            mask: PatchLevel::CRITICAL,
            regions: Vec::new(),
        }
    }

    /// Enables the optional levels in `mask`
    pub fn with_mask(mut self, mask: PatchLevel) -> Self {
        self.mask = mask;
        self
    }

    /// Restricts writes to `regions`
    pub fn with_regions(mut self, regions: Vec<Range<u32>>) -> Self {
        self.regions = regions;
        self
    }

    /// Enabled optional levels
    pub fn mask(&self) -> PatchLevel {
        self.mask
    }

    /// Pass 1: encodes every enabled record and validates every write
    ///
    /// If `image` is loaded, writing the payload itself at its load address is the first write
    /// of the batch.
    pub fn plan<A: AddressSpace + ?Sized>(
        &self,
        space: &A,
        image: &PayloadImage<'_>,
        records: PatchRecords<'_>,
    ) -> Result<Batch, PayloadError> {
        let mut batch = Batch::default();
        if let Some(load_address) = image.load_address {
            batch.writes.push(PlannedWrite {
                address: load_address,
                bytes: image.bytes.to_vec(),
            });
        }

        for record in records {
            let record = record?;
            if !record.level.is_enabled(self.mask) {
                debug!(address = record.address, level = record.level.0, "skipping patch");
                batch.skipped += 1;
                continue;
            }
            self.encode(&record, image, &mut batch.writes)?;
            batch.applied += 1;
        }

        self.validate(space, &batch)?;
        debug!(
            writes = batch.writes.len(),
            applied = batch.applied,
            skipped = batch.skipped,
            "planned patch batch"
        );
        Ok(batch)
    }

    /// Pass 2: writes a planned batch, all or nothing, then flushes the instruction cache
    pub fn commit<A: AddressSpace + ?Sized>(
        &self,
        space: &mut A,
        batch: &Batch,
    ) -> Result<ApplySummary, ApplyError> {
        // the batch may have been planned against a different space
        self.validate(&*space, batch)?;

        let mut journal = Journal::new(space);
        for write in &batch.writes {
            journal
                .write(write.address, &write.bytes)
                .map_err(|e| ApplyError::Write {
                    address: write.address,
                    reason: e.to_string(),
                })?;
        }
        for write in &batch.writes {
            journal.flush_instruction_cache(write.address, write.bytes.len());
        }
        journal.commit();

        let summary = ApplySummary {
            applied: batch.applied,
            skipped: batch.skipped,
            bytes_written: batch.writes.iter().map(|w| w.bytes.len()).sum(),
        };
        info!(
            applied = summary.applied,
            skipped = summary.skipped,
            bytes = summary.bytes_written,
            "applied patches"
        );
        Ok(summary)
    }

    /// Plans and commits in one step
    pub fn apply<A: AddressSpace + ?Sized>(
        &self,
        space: &mut A,
        image: &PayloadImage<'_>,
        records: PatchRecords<'_>,
    ) -> Result<ApplySummary, PayloadError> {
        let batch = self.plan(&*space, image, records)?;
        Ok(self.commit(space, &batch)?)
    }

    /// Appends the writes for one record
    fn encode(
        &self,
        record: &PatchRecord,
        image: &PayloadImage<'_>,
        writes: &mut Vec<PlannedWrite>,
    ) -> Result<(), PayloadError> {
        let address = record.address;
        let encoder = &self.encoder;
        let bytes = match record.op {
            PatchOp::Write { source, len } => image.source(source, len)?.to_vec(),
            PatchOp::Branch { target } => encoded(encoder.branch(address, target, false))?,
            PatchOp::BranchHook {
                target,
                return_site,
            } => {
                let resume = address.wrapping_add(encoder.branch_len());
                writes.push(PlannedWrite {
                    address: return_site,
                    bytes: encoded(encoder.branch(return_site, resume, false))?,
                });
                encoded(encoder.branch(address, target, false))?
            }
            PatchOp::Call { target } => encoded(encoder.branch(address, target, true))?,
            PatchOp::BranchCtr { target, register } => {
                encoded(encoder.indirect_branch(address, target, register, false))?
            }
            PatchOp::BranchCtrLink { target, register } => {
                encoded(encoder.indirect_branch(address, target, register, true))?
            }
        };
        writes.push(PlannedWrite { address, bytes });
        Ok(())
    }

    /// Checks that every write of `batch` is in a permitted region of `space`
    fn validate<A: AddressSpace + ?Sized>(
        &self,
        space: &A,
        batch: &Batch,
    ) -> Result<(), ApplyError> {
        for write in &batch.writes {
            let len = write.bytes.len();
            let permitted = match range_end(write.address, len) {
                Some(end) => {
                    space.contains(write.address, len)
                        && (self.regions.is_empty()
                            || self.regions.iter().any(|region| {
                                write.address >= region.start && end <= region.end as u64
                            }))
                }
                None => false,
            };
            if !permitted {
                return Err(ApplyError::OutOfRegion {
                    address: write.address,
                    len,
                });
            }
        }
        Ok(())
    }
}

/// Lifts an encoder error into the batch error
fn encoded(bytes: Result<Vec<u8>, EncodeError>) -> Result<Vec<u8>, PayloadError> {
    bytes.map_err(|e| ApplyError::Encode(e).into())
}
