use pcx_x86::inst::gpr::{EAX, EDI, ESI};
use pcx_x86::{FlagSet, Rep, SegReg, StringOp, Width};

use super::Executable;
use crate::addr::Access;
use crate::exception::Exception;
use crate::flags::{LazyFlags, FLAG_DF};
use crate::interp::alu::alu;
use crate::mem::{read_sized, write_sized, CpuBus};
use crate::state::CpuState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RepMode {
    None,
    Rep,
    Repe,
    Repne,
}

fn effective_rep_mode(op: StringOp, rep: Rep) -> RepMode {
    match (op, rep) {
        (_, Rep::None) => RepMode::None,
        (StringOp::Cmps | StringOp::Scas, Rep::Repe) => RepMode::Repe,
        (StringOp::Cmps | StringOp::Scas, Rep::Repne) => RepMode::Repne,
        _ => RepMode::Rep,
    }
}

struct StringCtx {
    width: Width,
    segment: SegReg,
    addr_width: Width,
    step: u32,
}

impl StringCtx {
    fn index(&self, cpu: &CpuState, reg: u8) -> u32 {
        cpu.read_gpr(reg, self.addr_width)
    }

    fn advance(&self, cpu: &mut CpuState, reg: u8) {
        let next = self.index(cpu, reg).wrapping_add(self.step);
        cpu.write_gpr(reg, self.addr_width, next);
    }

    fn source(&self, cpu: &CpuState) -> Result<u32, Exception> {
        cpu.translate(self.segment, self.index(cpu, ESI), self.width.bytes(), Access::Read)
    }

    /// The destination operand is always ES:DI, regardless of segment overrides.
    fn dest(&self, cpu: &CpuState, access: Access) -> Result<u32, Exception> {
        cpu.translate(SegReg::Es, self.index(cpu, EDI), self.width.bytes(), access)
    }
}

impl Executable {
    /// One string instruction, including all of its repetitions.
    ///
    /// Registers are updated after every element, so a fault part-way through leaves a state
    /// from which re-executing the instruction resumes the copy.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn exec_string(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: StringOp,
        width: Width,
        rep: Rep,
        segment: SegReg,
        addr32: bool,
    ) -> Result<(), Exception> {
        let mode = effective_rep_mode(op, rep);
        let step = if cpu.flags.bit(FLAG_DF) {
            width.bytes().wrapping_neg()
        } else {
            width.bytes()
        };
        let ctx = StringCtx {
            width,
            segment,
            addr_width: if addr32 { Width::W32 } else { Width::W16 },
            step,
        };

        loop {
            if mode != RepMode::None && cpu.count_reg(addr32) == 0 {
                break;
            }

            let compared = match op {
                StringOp::Movs => {
                    let src = ctx.source(cpu)?;
                    let value = read_sized(bus, src, width)?;
                    let dst = ctx.dest(cpu, Access::Write)?;
                    write_sized(bus, dst, width, value)?;
                    ctx.advance(cpu, ESI);
                    ctx.advance(cpu, EDI);
                    None
                }
                StringOp::Stos => {
                    let dst = ctx.dest(cpu, Access::Write)?;
                    write_sized(bus, dst, width, cpu.read_gpr(EAX, width))?;
                    ctx.advance(cpu, EDI);
                    None
                }
                StringOp::Lods => {
                    let src = ctx.source(cpu)?;
                    let value = read_sized(bus, src, width)?;
                    cpu.write_gpr(EAX, width, value);
                    ctx.advance(cpu, ESI);
                    None
                }
                StringOp::Cmps => {
                    let src = ctx.source(cpu)?;
                    let a = read_sized(bus, src, width)?;
                    let dst = ctx.dest(cpu, Access::Read)?;
                    let b = read_sized(bus, dst, width)?;
                    ctx.advance(cpu, ESI);
                    ctx.advance(cpu, EDI);
                    Some(self.stage_compare(cpu, a, b, width))
                }
                StringOp::Scas => {
                    let dst = ctx.dest(cpu, Access::Read)?;
                    let b = read_sized(bus, dst, width)?;
                    let a = cpu.read_gpr(EAX, width);
                    ctx.advance(cpu, EDI);
                    Some(self.stage_compare(cpu, a, b, width))
                }
            };

            if mode == RepMode::None {
                break;
            }
            let remaining = cpu.count_reg(addr32).wrapping_sub(1);
            cpu.set_count_reg(addr32, remaining);
            match (mode, compared) {
                (RepMode::Repe, Some(equal)) if !equal => break,
                (RepMode::Repne, Some(equal)) if equal => break,
                _ => {}
            }
        }
        Ok(())
    }

    /// Stage `a - b` and report whether the operands were equal.
    fn stage_compare(&self, cpu: &mut CpuState, a: u32, b: u32, width: Width) -> bool {
        let (result, lazy): (u32, LazyFlags) = alu(pcx_x86::AluOp::Cmp, a, b, false, width);
        self.stage(cpu, lazy, FlagSet::ARITH);
        result == 0
    }
}
