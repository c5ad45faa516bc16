//! Per-instruction executables.
//!
//! An [`Executable`] is one decoded instruction bound to its position inside a code block. While
//! a block runs, `cpu.eip` holds the block's starting offset and is only written by the
//! instruction that leaves the block (or by the block itself on fall-through), which keeps
//! blocks position independent and makes fault unwinding a single addition.

pub mod alu;
pub mod control;
mod operand;
pub(crate) mod stack;
mod string;
mod system;
pub mod x87;

use std::fmt;

use pcx_x86::{ByteSource, CodeSize, DecodeError, DecodedInst, FlagSet, Op};

use crate::exception::Exception;
use crate::flags::LazyFlags;
use crate::mem::CpuBus;
use crate::state::CpuState;

use operand::{read, write};

/// How an executable left the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Continue with the next instruction of the block.
    None,
    ConditionalTaken,
    ConditionalNotTaken,
    Jump,
    Call,
    Return,
    /// The instruction faulted; `eip` points at it and a pending fault is recorded.
    Fault,
}

impl Branch {
    /// Whether control left the block.
    pub fn ends_block(self) -> bool {
        self != Branch::None
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Executable {
    block_start: u32,
    eip: u32,
    offset: u32,
    inst: DecodedInst,
    stage_flags: bool,
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}(+{:#x}): {}", self.eip, self.offset, self.inst)?;
        if !self.stage_flags {
            f.write_str(" [flags elided]")?;
        }
        Ok(())
    }
}

impl Executable {
    /// Bind an already decoded instruction to its place in a block. `offset` is the distance
    /// from the block start in bytes.
    pub fn new(block_start: u32, eip: u32, offset: u32, inst: DecodedInst) -> Self {
        Self {
            block_start,
            eip,
            offset,
            inst,
            stage_flags: true,
        }
    }

    /// Decode one instruction from `src` at `eip`.
    pub fn decode(
        block_start: u32,
        eip: u32,
        offset: u32,
        code_size: CodeSize,
        src: &mut dyn ByteSource,
    ) -> Result<Self, DecodeError> {
        let inst = pcx_x86::decode(src, code_size)?;
        Ok(Self::new(block_start, eip, offset, inst))
    }

    pub fn block_start(&self) -> u32 {
        self.block_start
    }

    /// Offset of the instruction at decode time.
    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn next_offset(&self) -> u32 {
        self.offset + u32::from(self.inst.len)
    }

    pub fn byte_len(&self) -> u32 {
        u32::from(self.inst.len)
    }

    pub fn inst(&self) -> &DecodedInst {
        &self.inst
    }

    pub fn stages_flags(&self) -> bool {
        self.stage_flags
    }

    /// Copy of this executable that skips staging its arithmetic flags. Only valid when every
    /// flag it writes is overwritten before being read.
    pub fn without_flag_staging(&self) -> Self {
        Self {
            stage_flags: false,
            ..self.clone()
        }
    }

    /// Whether the instruction's flag output goes through [`FlagState::stage`] (rather than
    /// direct sets), i.e. whether flag staging can be elided at all.
    ///
    /// [`FlagState::stage`]: crate::flags::FlagState::stage
    pub fn stages_lazily(&self) -> bool {
        match self.inst.op {
            Op::Alu { .. }
            | Op::Test { .. }
            | Op::Inc { .. }
            | Op::Dec { .. }
            | Op::Neg { .. }
            | Op::DoubleShift { .. }
            | Op::String { .. } => true,
            Op::Shift { op, .. } => !op.is_rotate(),
            _ => false,
        }
    }

    pub(crate) fn stage(&self, cpu: &mut CpuState, lazy: LazyFlags, mask: FlagSet) {
        if self.stage_flags {
            cpu.flags.stage(lazy, mask);
        }
    }

    /// Run the instruction. On a fault, `eip` is moved to this instruction, the fault is
    /// recorded on the processor and [`Branch::Fault`] is returned.
    pub fn execute(&self, cpu: &mut CpuState, bus: &mut dyn CpuBus) -> Branch {
        match self.run(cpu, bus) {
            Ok(branch) => branch,
            Err(exception) => {
                let eip = cpu.eip.wrapping_add(self.offset) & cpu.code_size().ip_mask();
                cpu.eip = eip;
                cpu.raise(exception, eip);
                Branch::Fault
            }
        }
    }

    fn run(&self, cpu: &mut CpuState, bus: &mut dyn CpuBus) -> Result<Branch, Exception> {
        match &self.inst.op {
            Op::Mov { dst, src, width } => {
                let value = read(cpu, bus, src, *width)?;
                write(cpu, bus, dst, *width, value)?;
            }
            Op::Alu { op, dst, src, width } => self.exec_alu(cpu, bus, *op, dst, src, *width)?,
            Op::Test { lhs, rhs, width } => self.exec_test(cpu, bus, lhs, rhs, *width)?,
            Op::Inc { dst, width } => self.exec_inc_dec(cpu, bus, dst, *width, false)?,
            Op::Dec { dst, width } => self.exec_inc_dec(cpu, bus, dst, *width, true)?,
            Op::Not { dst, width } => self.exec_not(cpu, bus, dst, *width)?,
            Op::Neg { dst, width } => self.exec_neg(cpu, bus, dst, *width)?,
            Op::Shift {
                op,
                dst,
                count,
                width,
            } => self.exec_shift(cpu, bus, *op, dst, *count, *width)?,
            Op::DoubleShift {
                left,
                dst,
                src,
                count,
                width,
            } => self.exec_double_shift(cpu, bus, *left, dst, *src, *count, *width)?,
            Op::MulDiv { op, src, width } => self.exec_mul_div(cpu, bus, *op, src, *width)?,
            Op::Imul {
                dst,
                src,
                imm,
                width,
            } => self.exec_imul(cpu, bus, *dst, src, *imm, *width)?,
            Op::Bit {
                op,
                base,
                bit,
                width,
            } => self.exec_bit(cpu, bus, *op, base, bit, *width)?,
            Op::Movx {
                dst,
                src,
                src_width,
                width,
                signed,
            } => {
                let value = read(cpu, bus, src, *src_width)?;
                let value = if *signed {
                    src_width.sign_extend(value)
                } else {
                    value
                };
                cpu.write_gpr(*dst, *width, value);
            }
            Op::Lea { dst, ptr, width } => {
                let ea = ptr.effective_address(&cpu.gpr);
                cpu.write_gpr(*dst, *width, ea);
            }
            Op::Xchg { a, b, width } => {
                let va = read(cpu, bus, a, *width)?;
                let vb = read(cpu, bus, b, *width)?;
                // Memory operands come first so a faulting store leaves registers untouched.
                if b.is_mem() {
                    write(cpu, bus, b, *width, va)?;
                    write(cpu, bus, a, *width, vb)?;
                } else {
                    write(cpu, bus, a, *width, vb)?;
                    write(cpu, bus, b, *width, va)?;
                }
            }
            Op::Push { src, width } => stack::exec_push(cpu, bus, src, *width)?,
            Op::Pop { dst, width } => stack::exec_pop(cpu, bus, dst, *width)?,
            Op::PushSeg { seg, width } => self.exec_push_seg(cpu, bus, *seg, *width)?,
            Op::PopSeg { seg, width } => self.exec_pop_seg(cpu, bus, *seg, *width)?,
            Op::MovToSeg { seg, src } => self.exec_mov_to_seg(cpu, bus, *seg, src)?,
            Op::MovFromSeg { dst, seg, width } => {
                self.exec_mov_from_seg(cpu, bus, dst, *seg, *width)?
            }
            Op::Pusha { width } => stack::exec_pusha(cpu, bus, *width)?,
            Op::Popa { width } => stack::exec_popa(cpu, bus, *width)?,
            Op::Pushf { width } => self.exec_pushf(cpu, bus, *width)?,
            Op::Popf { width } => self.exec_popf(cpu, bus, *width)?,
            Op::Lahf => self.exec_lahf(cpu),
            Op::Sahf => self.exec_sahf(cpu),
            Op::Cbw { width } => self.exec_cbw(cpu, *width),
            Op::Cwd { width } => self.exec_cwd(cpu, *width),
            Op::FlagCtl(ctl) => self.exec_flag_ctl(cpu, *ctl)?,
            Op::Jcc { cond, rel, width } => return self.exec_jcc(cpu, *cond, *rel, *width),
            Op::Jmp { rel, width } => return self.exec_jmp(cpu, *rel, *width),
            Op::JmpIndirect { target, width } => {
                return self.exec_jmp_indirect(cpu, bus, target, *width)
            }
            Op::JmpFar {
                selector,
                offset,
                width,
            } => return self.exec_jmp_far(cpu, bus, *selector, *offset, *width),
            Op::Call { rel, width } => return self.exec_call(cpu, bus, *rel, *width),
            Op::CallIndirect { target, width } => {
                return self.exec_call_indirect(cpu, bus, target, *width)
            }
            Op::Ret { pop, width } => return self.exec_ret(cpu, bus, *pop, *width),
            Op::Loop {
                kind,
                rel,
                width,
                addr32,
            } => return self.exec_loop(cpu, *kind, *rel, *width, *addr32),
            Op::Setcc { cond, dst } => {
                let value = u32::from(control::condition(cpu, *cond));
                write(cpu, bus, dst, pcx_x86::Width::W8, value)?;
            }
            Op::Enter {
                frame,
                nesting,
                width,
            } => stack::exec_enter(cpu, bus, *frame, *nesting, *width)?,
            Op::Leave { width } => stack::exec_leave(cpu, bus, *width)?,
            Op::In { port, width } => self.exec_in(cpu, bus, *port, *width)?,
            Op::Out { port, width } => self.exec_out(cpu, bus, *port, *width)?,
            Op::String {
                op,
                width,
                rep,
                segment,
                addr32,
            } => self.exec_string(cpu, bus, *op, *width, *rep, *segment, *addr32)?,
            Op::MovToCr { cr, src } => return self.exec_mov_to_cr(cpu, *cr, *src),
            Op::MovFromCr { dst, cr } => self.exec_mov_from_cr(cpu, *dst, *cr)?,
            Op::Lgdt { ptr, width } => {
                cpu.gdtr = self.load_table_register(cpu, bus, ptr, *width)?;
            }
            Op::Lidt { ptr, width } => {
                cpu.idtr = self.load_table_register(cpu, bus, ptr, *width)?;
            }
            Op::Hlt => return self.exec_hlt(cpu),
            Op::Nop => {}
            Op::Fpu(op) => self.exec_fpu(cpu, bus, op)?,
        }
        Ok(Branch::None)
    }
}
