//! # Code
//!
//! Machine-code emission for the branch-type patch records. The patch engine only knows about
//! "a branch from here to there" and "load a register and branch through it"; an
//! [`InstructionEncoder`] turns those into bytes for one architecture.

use iced_x86::IcedError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ppc;
pub mod x86;

/// Errors while encoding a branch
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    /// Target is outside the reach of a relative branch
    #[error("branch from {from:#x} to {to:#x} is out of range")]
    BranchOutOfRange {
        /// Branch site
        from: u32,
        /// Branch target
        to: u32,
    },
    /// Branch site or target is not instruction aligned
    #[error("branch from {from:#x} to {to:#x} is misaligned")]
    Misaligned {
        /// Branch site
        from: u32,
        /// Branch target
        to: u32,
    },
    /// Register operand does not name a usable register
    #[error("invalid register {0}")]
    InvalidRegister(u32),
    /// Error from the x86 encoder
    #[error("{0}")]
    IcedError(#[from] IcedError),
}

/// Encodes control-flow instructions for one target architecture
pub trait InstructionEncoder {
    /// Length in bytes of the sequence written by [`InstructionEncoder::branch`]
    fn branch_len(&self) -> u32;

    /// Encodes a direct branch at `from` to `to`, saving the return address when `link` is set
    fn branch(&self, from: u32, to: u32, link: bool) -> Result<Vec<u8>, EncodeError>;

    /// Encodes a sequence at `at` that loads `to` into `register` and branches through it
    fn indirect_branch(
        &self,
        at: u32,
        to: u32,
        register: u32,
        link: bool,
    ) -> Result<Vec<u8>, EncodeError>;
}

/// Architectures with a built-in encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 32-bit big-endian PowerPC (Broadway/Gekko)
    #[default]
    PowerPc,
    /// 32-bit x86
    X86,
}

impl Arch {
    /// Encoder for this architecture
    pub fn encoder(self) -> Box<dyn InstructionEncoder + Send + Sync> {
        match self {
            Arch::PowerPc => Box::new(ppc::Broadway),
            Arch::X86 => Box::new(x86::X86),
        }
    }
}
