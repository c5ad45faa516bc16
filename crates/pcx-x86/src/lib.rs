//! 16/32-bit x86 instruction decoding.
//!
//! The decoder turns a byte stream into a [`DecodedInst`]: a closed [`Op`] variant plus the
//! operand descriptors captured at decode time (register indices, [`Pointer`] addressing
//! parameters, sign-extended immediates). It never touches processor state; effective addresses
//! are resolved later, on every execution, by the CPU core.
//!
//! Opcode coverage is deliberately partial. Anything the dispatch table does not know about is
//! reported as [`DecodeError::Unimplemented`] together with a disassembled mnemonic so the caller
//! can produce a useful diagnostic.

#![forbid(unsafe_code)]

mod cursor;
pub mod disasm;
mod error;
pub mod flags;
pub mod inst;
mod modrm;
pub mod prefix;
mod table;

pub use cursor::{ByteSource, SliceCursor};
pub use error::DecodeError;
pub use flags::FlagSet;
pub use inst::{
    AluOp, BitOp, CodeSize, Cond, ControlReg, DecodedInst, FlagCtl, FpuArith, FpuOp, FpuSrc,
    LoopKind, MulDivOp, Op, Operand, Pointer, PortArg, Rep, SegReg, ShiftCount, ShiftOp, StringOp,
    Width,
};
pub use prefix::Prefixes;

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

/// Decode exactly one instruction from `src`, which must be positioned at an instruction
/// boundary. On success the cursor has advanced by the instruction's encoded length.
pub fn decode(src: &mut dyn ByteSource, code_size: CodeSize) -> Result<DecodedInst, DecodeError> {
    table::decode_one(src, code_size)
}

/// Convenience wrapper for decoding from an in-memory slice.
pub fn decode_bytes(bytes: &[u8], code_size: CodeSize) -> Result<DecodedInst, DecodeError> {
    let mut cursor = SliceCursor::new(bytes);
    decode(&mut cursor, code_size)
}
