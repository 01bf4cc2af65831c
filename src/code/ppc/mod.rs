//! PowerPC (Broadway) instruction encoding

use super::{EncodeError, InstructionEncoder};

/// Reach of `b`/`bl`: a signed 26-bit byte displacement
const BRANCH_REACH: i64 = 0x0200_0000;

/// `b`
const OP_B: u32 = 0x4800_0000;
/// `addis rD, 0, imm` (`lis`)
const OP_LIS: u32 = 0x3C00_0000;
/// `ori rA, rS, imm`
const OP_ORI: u32 = 0x6000_0000;
/// `mtspr CTR, rS` (`mtctr`)
const OP_MTCTR: u32 = 0x7C09_03A6;
/// `bcctr 20, 0` (`bctr`)
const OP_BCTR: u32 = 0x4E80_0420;
/// LK bit
const LINK: u32 = 1;

/// Encoder for the Wii's Broadway CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct Broadway;

/// `b`/`bl` from `from` to `to`
pub fn branch(from: u32, to: u32, link: bool) -> Result<u32, EncodeError> {
    if from % 4 != 0 || to % 4 != 0 {
        return Err(EncodeError::Misaligned { from, to });
    }
    let offset = to as i64 - from as i64;
    if !(-BRANCH_REACH..BRANCH_REACH).contains(&offset) {
        return Err(EncodeError::BranchOutOfRange { from, to });
    }
    Ok(OP_B | (offset as u32 & 0x03FF_FFFC) | if link { LINK } else { 0 })
}

/// `lis r, to@h; ori r, r, to@l; mtctr r; bctr[l]`
pub fn branch_ctr(to: u32, register: u32, link: bool) -> Result<[u32; 4], EncodeError> {
    if register > 31 {
        return Err(EncodeError::InvalidRegister(register));
    }
    let rd = register << 21;
    Ok([
        OP_LIS | rd | (to >> 16),
        OP_ORI | rd | (register << 16) | (to & 0xFFFF),
        OP_MTCTR | rd,
        OP_BCTR | if link { LINK } else { 0 },
    ])
}

impl InstructionEncoder for Broadway {
    fn branch_len(&self) -> u32 {
        4
    }

    fn branch(&self, from: u32, to: u32, link: bool) -> Result<Vec<u8>, EncodeError> {
        Ok(branch(from, to, link)?.to_be_bytes().to_vec())
    }

    fn indirect_branch(
        &self,
        at: u32,
        to: u32,
        register: u32,
        link: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        if at % 4 != 0 {
            return Err(EncodeError::Misaligned { from: at, to });
        }
        Ok(branch_ctr(to, register, link)?
            .iter()
            .flat_map(|word| word.to_be_bytes())
            .collect())
    }
}
