//! Segment registers, EFLAGS transfers, port I/O and control registers.

use pcx_x86::inst::gpr::{EAX, EDX};
use pcx_x86::{ControlReg, FlagCtl, FlagSet, Operand, Pointer, PortArg, SegReg, Width};
use tracing::trace;

use super::operand::{read, write};
use super::stack::{peek, push};
use super::{Branch, Executable};
use crate::addr::Access;
use crate::exception::Exception;
use crate::flags::{
    FLAG_AC, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_RF, FLAG_TF, FLAG_VM,
};
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, DescriptorTable, CR0_ET};

/// EFLAGS bits `popf` may change in each operand size (CPL 0).
fn popf_mask(width: Width) -> u32 {
    let low = FlagSet::ARITH.eflags_mask() | FLAG_TF | FLAG_IF | FLAG_DF | FLAG_IOPL | FLAG_NT;
    match width {
        Width::W32 => low | FLAG_AC | FLAG_ID,
        _ => low,
    }
}

impl Executable {
    pub(super) fn exec_mov_to_seg(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        seg: SegReg,
        src: &Operand,
    ) -> Result<(), Exception> {
        if seg == SegReg::Cs {
            return Err(Exception::InvalidOpcode);
        }
        let selector = read(cpu, bus, src, Width::W16)? as u16;
        cpu.load_segment(bus, seg, selector)
    }

    pub(super) fn exec_mov_from_seg(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dst: &Operand,
        seg: SegReg,
        width: Width,
    ) -> Result<(), Exception> {
        // Memory destinations are always 16 bits wide.
        let width = if dst.is_mem() { Width::W16 } else { width };
        let selector = u32::from(cpu.seg(seg).selector);
        write(cpu, bus, dst, width, selector)
    }

    pub(super) fn exec_push_seg(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        seg: SegReg,
        width: Width,
    ) -> Result<(), Exception> {
        let selector = u32::from(cpu.seg(seg).selector);
        push(cpu, bus, selector, width)
    }

    pub(super) fn exec_pop_seg(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        seg: SegReg,
        width: Width,
    ) -> Result<(), Exception> {
        let selector = peek(cpu, bus, width, 0)? as u16;
        cpu.load_segment(bus, seg, selector)?;
        cpu.set_sp(cpu.sp().wrapping_add(width.bytes()));
        Ok(())
    }

    pub(super) fn exec_pushf(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        width: Width,
    ) -> Result<(), Exception> {
        if cpu.mode() == CpuMode::Virtual8086 && cpu.eflags() & FLAG_IOPL != FLAG_IOPL {
            return Err(Exception::GeneralProtection(0));
        }
        let value = cpu.eflags() & !(FLAG_RF | FLAG_VM);
        push(cpu, bus, width.truncate(value), width)
    }

    pub(super) fn exec_popf(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        width: Width,
    ) -> Result<(), Exception> {
        if cpu.mode() == CpuMode::Virtual8086 && cpu.eflags() & FLAG_IOPL != FLAG_IOPL {
            return Err(Exception::GeneralProtection(0));
        }
        let value = peek(cpu, bus, width, 0)?;
        let mut mask = popf_mask(width);
        if cpu.mode() == CpuMode::Virtual8086 {
            mask &= !FLAG_IOPL;
        }
        let old = cpu.eflags();
        cpu.set_eflags((old & !mask) | (value & mask));
        cpu.set_sp(cpu.sp().wrapping_add(width.bytes()));
        Ok(())
    }

    pub(super) fn exec_lahf(&self, cpu: &mut CpuState) {
        let low = cpu.eflags() & 0xFF;
        cpu.write_gpr(4, Width::W8, low);
    }

    pub(super) fn exec_sahf(&self, cpu: &mut CpuState) {
        let ah = cpu.read_gpr(4, Width::W8);
        for flag in [FlagSet::CF, FlagSet::PF, FlagSet::AF, FlagSet::ZF, FlagSet::SF] {
            cpu.flags.set(flag, ah & flag.eflags_mask() != 0);
        }
    }

    pub(super) fn exec_flag_ctl(&self, cpu: &mut CpuState, ctl: FlagCtl) -> Result<(), Exception> {
        match ctl {
            FlagCtl::Clc => cpu.flags.set(FlagSet::CF, false),
            FlagCtl::Stc => cpu.flags.set(FlagSet::CF, true),
            FlagCtl::Cmc => {
                let cf = cpu.flags.get(FlagSet::CF);
                cpu.flags.set(FlagSet::CF, !cf);
            }
            FlagCtl::Cli | FlagCtl::Sti => {
                if cpu.mode() == CpuMode::Virtual8086 && cpu.eflags() & FLAG_IOPL != FLAG_IOPL {
                    return Err(Exception::GeneralProtection(0));
                }
                cpu.flags.set_bit(FLAG_IF, ctl == FlagCtl::Sti);
            }
            FlagCtl::Cld => cpu.flags.set_bit(FLAG_DF, false),
            FlagCtl::Std => cpu.flags.set_bit(FLAG_DF, true),
        }
        Ok(())
    }

    pub(super) fn exec_cbw(&self, cpu: &mut CpuState, width: Width) {
        let half = if width == Width::W32 { Width::W16 } else { Width::W8 };
        let value = half.sign_extend(cpu.read_gpr(EAX, half));
        cpu.write_gpr(EAX, width, value);
    }

    pub(super) fn exec_cwd(&self, cpu: &mut CpuState, width: Width) {
        let negative = cpu.read_gpr(EAX, width) & width.sign_bit() != 0;
        cpu.write_gpr(EDX, width, if negative { u32::MAX } else { 0 });
    }

    pub(super) fn exec_in(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        port: PortArg,
        width: Width,
    ) -> Result<(), Exception> {
        let port = self.port(cpu, port)?;
        let value = bus.io_read(port, width)?;
        trace!(port, ?width, value, "port in");
        cpu.write_gpr(EAX, width, value);
        Ok(())
    }

    pub(super) fn exec_out(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        port: PortArg,
        width: Width,
    ) -> Result<(), Exception> {
        let port = self.port(cpu, port)?;
        let value = cpu.read_gpr(EAX, width);
        trace!(port, ?width, value, "port out");
        bus.io_write(port, width, value)
    }

    /// Resolve the port operand. Without an I/O permission bitmap, virtual-8086 code needs
    /// IOPL 3 for any port access.
    fn port(&self, cpu: &mut CpuState, port: PortArg) -> Result<u16, Exception> {
        if cpu.mode() == CpuMode::Virtual8086 && cpu.eflags() & FLAG_IOPL != FLAG_IOPL {
            return Err(Exception::GeneralProtection(0));
        }
        Ok(match port {
            PortArg::Imm(p) => u16::from(p),
            PortArg::Dx => cpu.read_gpr(EDX, Width::W16) as u16,
        })
    }

    /// `mov crN, reg`. Always ends the block: a CR0 write can change how the following bytes
    /// decode.
    pub(super) fn exec_mov_to_cr(
        &self,
        cpu: &mut CpuState,
        cr: ControlReg,
        src: u8,
    ) -> Result<Branch, Exception> {
        if cpu.mode() == CpuMode::Virtual8086 {
            return Err(Exception::GeneralProtection(0));
        }
        let mut value = cpu.read_gpr(src, Width::W32);
        if cr == ControlReg::Cr0 {
            value |= CR0_ET;
        }
        cpu.cr[cr.index()] = value;
        cpu.eip = self.fall_through(cpu);
        Ok(Branch::Jump)
    }

    pub(super) fn exec_mov_from_cr(
        &self,
        cpu: &mut CpuState,
        dst: u8,
        cr: ControlReg,
    ) -> Result<(), Exception> {
        if cpu.mode() == CpuMode::Virtual8086 {
            return Err(Exception::GeneralProtection(0));
        }
        cpu.write_gpr(dst, Width::W32, cpu.cr[cr.index()]);
        Ok(())
    }

    /// Read the 6-byte pseudo-descriptor operand of `lgdt`/`lidt`. With a 16-bit operand size
    /// only 24 bits of base are used.
    pub(super) fn load_table_register(
        &self,
        cpu: &CpuState,
        bus: &mut dyn CpuBus,
        ptr: &Pointer,
        width: Width,
    ) -> Result<DescriptorTable, Exception> {
        if cpu.mode() == CpuMode::Virtual8086 {
            return Err(Exception::GeneralProtection(0));
        }
        let limit_addr = cpu.linear(ptr, 2, Access::Read)?;
        let base_addr = cpu.linear_displaced(ptr, 2, 4, Access::Read)?;
        let limit = bus.read_u16(limit_addr)?;
        let mut base = bus.read_u32(base_addr)?;
        if width == Width::W16 {
            base &= 0x00FF_FFFF;
        }
        Ok(DescriptorTable { base, limit })
    }
}
