//! 32-bit x86 instruction encoding, via iced-x86

use iced_x86::{Code, Encoder, Instruction, Register};

use super::{EncodeError, InstructionEncoder};

/// Length of `jmp rel32`/`call rel32`
const REL32_LEN: u32 = 5;

/// Registers addressable by the register operand of `BRANCH_CTR` records
const REGISTERS: [Register; 8] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
];

/// Encoder for 32-bit x86 targets
#[derive(Debug, Clone, Copy, Default)]
pub struct X86;

/// Encodes `instructions` back to back starting at `ip`
fn encode(instructions: &[Instruction], ip: u32) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new(32);
    let mut rip = ip as u64;
    for instruction in instructions {
        rip += encoder.encode(instruction, rip)? as u64;
    }
    Ok(encoder.take_buffer())
}

impl InstructionEncoder for X86 {
    fn branch_len(&self) -> u32 {
        REL32_LEN
    }

    fn branch(&self, from: u32, to: u32, link: bool) -> Result<Vec<u8>, EncodeError> {
        let code = if link {
            Code::Call_rel32_32
        } else {
            Code::Jmp_rel32_32
        };
        encode(&[Instruction::with_branch(code, to as u64)?], from)
    }

    fn indirect_branch(
        &self,
        at: u32,
        to: u32,
        register: u32,
        link: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        let reg = *REGISTERS
            .get(register as usize)
            .ok_or(EncodeError::InvalidRegister(register))?;
        let jump = if link { Code::Call_rm32 } else { Code::Jmp_rm32 };
        encode(
            &[
                Instruction::with2(Code::Mov_r32_imm32, reg, to)?,
                Instruction::with1(jump, reg)?,
            ],
            at,
        )
    }
}
