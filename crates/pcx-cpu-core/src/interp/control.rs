//! Control transfers.
//!
//! Branch targets are computed from the block-relative position of the instruction:
//! `eip` holds the block's start while the block runs, so the fall-through address is
//! `eip + next_offset`.

use pcx_x86::{Cond, FlagSet, LoopKind, Operand, SegReg, Width};

use super::operand::read;
use super::stack::{peek, push};
use super::{Branch, Executable};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState};

/// Evaluate a condition code, resolving only the flags it needs.
pub fn condition(cpu: &mut CpuState, cond: Cond) -> bool {
    let f = &mut cpu.flags;
    match cond {
        Cond::O => f.get(FlagSet::OF),
        Cond::No => !f.get(FlagSet::OF),
        Cond::B => f.get(FlagSet::CF),
        Cond::Ae => !f.get(FlagSet::CF),
        Cond::E => f.get(FlagSet::ZF),
        Cond::Ne => !f.get(FlagSet::ZF),
        Cond::Be => f.get(FlagSet::CF) || f.get(FlagSet::ZF),
        Cond::A => !f.get(FlagSet::CF) && !f.get(FlagSet::ZF),
        Cond::S => f.get(FlagSet::SF),
        Cond::Ns => !f.get(FlagSet::SF),
        Cond::P => f.get(FlagSet::PF),
        Cond::Np => !f.get(FlagSet::PF),
        Cond::L => f.get(FlagSet::SF) != f.get(FlagSet::OF),
        Cond::Ge => f.get(FlagSet::SF) == f.get(FlagSet::OF),
        Cond::Le => f.get(FlagSet::ZF) || f.get(FlagSet::SF) != f.get(FlagSet::OF),
        Cond::G => !f.get(FlagSet::ZF) && f.get(FlagSet::SF) == f.get(FlagSet::OF),
    }
}

impl Executable {
    /// Offset of the following instruction.
    pub(super) fn fall_through(&self, cpu: &CpuState) -> u32 {
        cpu.eip.wrapping_add(self.next_offset()) & cpu.code_size().ip_mask()
    }

    fn relative_target(&self, cpu: &CpuState, rel: i32, width: Width) -> u32 {
        let next = cpu.eip.wrapping_add(self.next_offset());
        width.truncate(next.wrapping_add(rel as u32))
    }

    /// Set `eip` to `target` after checking it against the CS limit.
    fn transfer(cpu: &mut CpuState, target: u32) -> Result<(), Exception> {
        if target > cpu.seg(SegReg::Cs).cache.limit {
            return Err(Exception::GeneralProtection(0));
        }
        cpu.eip = target;
        Ok(())
    }

    pub(super) fn exec_jcc(
        &self,
        cpu: &mut CpuState,
        cond: Cond,
        rel: i32,
        width: Width,
    ) -> Result<Branch, Exception> {
        if condition(cpu, cond) {
            let target = self.relative_target(cpu, rel, width);
            Self::transfer(cpu, target)?;
            Ok(Branch::ConditionalTaken)
        } else {
            cpu.eip = self.fall_through(cpu);
            Ok(Branch::ConditionalNotTaken)
        }
    }

    pub(super) fn exec_jmp(&self, cpu: &mut CpuState, rel: i32, width: Width) -> Result<Branch, Exception> {
        let target = self.relative_target(cpu, rel, width);
        Self::transfer(cpu, target)?;
        Ok(Branch::Jump)
    }

    pub(super) fn exec_jmp_indirect(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        target: &Operand,
        width: Width,
    ) -> Result<Branch, Exception> {
        let target = read(cpu, bus, target, width)?;
        Self::transfer(cpu, target)?;
        Ok(Branch::Jump)
    }

    pub(super) fn exec_jmp_far(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        selector: u16,
        offset: u32,
        width: Width,
    ) -> Result<Branch, Exception> {
        let saved = *cpu.seg(SegReg::Cs);
        cpu.load_segment(bus, SegReg::Cs, selector)?;
        if let Err(e) = Self::transfer(cpu, width.truncate(offset)) {
            *cpu.seg_mut(SegReg::Cs) = saved;
            return Err(e);
        }
        Ok(Branch::Jump)
    }

    pub(super) fn exec_call(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        rel: i32,
        width: Width,
    ) -> Result<Branch, Exception> {
        let target = self.relative_target(cpu, rel, width);
        self.call_to(cpu, bus, target, width)
    }

    pub(super) fn exec_call_indirect(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        target: &Operand,
        width: Width,
    ) -> Result<Branch, Exception> {
        let target = read(cpu, bus, target, width)?;
        self.call_to(cpu, bus, target, width)
    }

    fn call_to(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        target: u32,
        width: Width,
    ) -> Result<Branch, Exception> {
        if target > cpu.seg(SegReg::Cs).cache.limit {
            return Err(Exception::GeneralProtection(0));
        }
        let ret = width.truncate(self.fall_through(cpu));
        push(cpu, bus, ret, width)?;
        cpu.eip = target;
        Ok(Branch::Call)
    }

    pub(super) fn exec_ret(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        pop: u16,
        width: Width,
    ) -> Result<Branch, Exception> {
        let target = peek(cpu, bus, width, 0)?;
        Self::transfer(cpu, target)?;
        let sp = cpu
            .sp()
            .wrapping_add(width.bytes())
            .wrapping_add(u32::from(pop));
        cpu.set_sp(sp);
        Ok(Branch::Return)
    }

    pub(super) fn exec_loop(
        &self,
        cpu: &mut CpuState,
        kind: LoopKind,
        rel: i32,
        width: Width,
        addr32: bool,
    ) -> Result<Branch, Exception> {
        let count = cpu.count_reg(addr32);
        let (take, remaining) = if kind == LoopKind::Jcxz {
            (count == 0, None)
        } else {
            let remaining = count.wrapping_sub(1) & if addr32 { u32::MAX } else { 0xFFFF };
            let take = remaining != 0
                && match kind {
                    LoopKind::Loope => cpu.flags.get(FlagSet::ZF),
                    LoopKind::Loopne => !cpu.flags.get(FlagSet::ZF),
                    _ => true,
                };
            (take, Some(remaining))
        };
        if take {
            let target = self.relative_target(cpu, rel, width);
            Self::transfer(cpu, target)?;
        }
        if let Some(remaining) = remaining {
            cpu.set_count_reg(addr32, remaining);
        }
        if take {
            Ok(Branch::ConditionalTaken)
        } else {
            cpu.eip = self.fall_through(cpu);
            Ok(Branch::ConditionalNotTaken)
        }
    }

    pub(super) fn exec_hlt(&self, cpu: &mut CpuState) -> Result<Branch, Exception> {
        if cpu.mode() == CpuMode::Virtual8086 {
            return Err(Exception::GeneralProtection(0));
        }
        cpu.halted = true;
        cpu.eip = self.fall_through(cpu);
        Ok(Branch::Jump)
    }
}
