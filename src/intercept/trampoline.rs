//! This module contains the code generators for the patch site, the
//! per-hook entry stub and the relocated continuation

use std::mem;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, Instruction,
    InstructionBlock,
};

use super::AttachError;

/// Bytes of the `jmp rel32` planted at the target.
pub(crate) const PATCH_LEN: usize = 5;

/// Longest x86-64 instruction.
const MAX_INSTR_LEN: usize = 15;

/// Bytes of target code to examine: enough to cover the patch even when its
/// last byte starts the longest possible instruction.
pub(crate) const PROLOGUE_WINDOW: usize = PATCH_LEN + MAX_INSTR_LEN - 1;

/// Offset of the relocated continuation within a slot; the entry stub
/// occupies the front.
pub(crate) const CONTINUATION_OFFSET: usize = 32;

/// `jmp rel32` opcode.
const JMP_REL32: u8 = 0xe9;

/// Single-byte `nop`, used to blank the stolen tail behind the patch.
const NOP: u8 = 0x90;

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating the per-hook entry stub
struct EntryStub {
    /// `mov r11, imm64` opcode (REX.WB + B8+r)
    mov: [u8; 2],
    /// Hook descriptor address loaded into `r11`
    descriptor: usize,
    /// Absolute jmp through the qword that follows (`jmp [rip + 0]`)
    jmp: [u8; 6],
    /// Entry thunk address
    thunk: usize,
}

/// Byte length of the per-hook entry stub.
pub(crate) const STUB_LEN: usize = mem::size_of::<EntryStub>();

/// Generates the per-hook entry stub and returns its bytecode.
///
/// The stub loads the hook descriptor into `r11`, a pure scratch register at
/// a function entry under the SysV ABI, then jumps to the shared entry thunk.
pub(crate) fn encode_stub(descriptor: usize, thunk: usize) -> [u8; STUB_LEN] {
    // Safety: the struct is packed, so it has no padding and a stable layout
    unsafe {
        mem::transmute(EntryStub {
            mov: [0x49, 0xbb],
            descriptor,
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            thunk,
        })
    }
}

/// Whole instructions covering the patch span at a target.
pub(crate) struct StolenPrologue {
    /// Decoded instructions, in order
    instructions: Vec<Instruction>,
    /// Their total byte length at the target
    pub(crate) len: usize,
}

/// Decodes whole instructions at `target` until at least [`PATCH_LEN`] bytes
/// are covered.
///
/// `bytes` holds the leading bytes of the target ([`PROLOGUE_WINDOW`] of
/// them). Fails when they do not decode as valid instructions. Instructions
/// past an early `ret` are still stolen; their relocated copies simply never
/// run.
pub(crate) fn steal_prologue(target: usize, bytes: &[u8]) -> Result<StolenPrologue, AttachError> {
    let mut decoder = Decoder::with_ip(64, bytes, target as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < PATCH_LEN {
        if !decoder.can_decode() {
            return Err(AttachError::InvalidInstruction { address: target + len });
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(AttachError::InvalidInstruction { address: target + len });
        }
        len += instruction.len();
        instructions.push(instruction);
    }

    Ok(StolenPrologue { instructions, len })
}

/// Re-encodes the stolen prologue at `continuation_address` and appends the
/// jump back to the unpatched remainder of the target.
///
/// The block encoder fixes rip-relative operands and branch displacements
/// for the new location.
pub(crate) fn encode_continuation(
    prologue: &StolenPrologue,
    target: usize,
    continuation_address: usize,
    capacity: usize,
) -> Result<Vec<u8>, AttachError> {
    let mut instructions = prologue.instructions.clone();
    let resume = (target + prologue.len) as u64;
    instructions.push(Instruction::with_branch(Code::Jmp_rel32_64, resume)?);

    let block = InstructionBlock::new(&instructions, continuation_address as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    if encoded.code_buffer.len() > capacity {
        return Err(AttachError::ContinuationTooLarge { address: target });
    }
    Ok(encoded.code_buffer)
}

/// Builds the bytes written over the target entry: a `jmp rel32` to the stub
/// and `nop`s over the rest of the stolen span.
pub(crate) fn encode_patch(
    target: usize,
    stub: usize,
    stolen_len: usize,
) -> Result<Vec<u8>, AttachError> {
    let next = target.wrapping_add(PATCH_LEN);
    let displacement = (stub as i64).wrapping_sub(next as i64);
    let displacement =
        i32::try_from(displacement).map_err(|_| AttachError::StubOutOfReach { address: target })?;

    let mut patch = vec![NOP; stolen_len];
    patch[0] = JMP_REL32;
    patch[1..PATCH_LEN].copy_from_slice(&displacement.to_le_bytes());
    Ok(patch)
}
