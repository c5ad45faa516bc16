use pcx_x86::{Operand, Width};

use crate::addr::Access;
use crate::exception::Exception;
use crate::mem::{read_sized, write_sized, CpuBus};
use crate::state::CpuState;

/// A resolved operand location. Memory operands are translated once so read-modify-write
/// sequences touch the same linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Place {
    Reg(u8),
    Mem(u32),
}

pub(crate) fn locate(
    cpu: &CpuState,
    op: &Operand,
    width: Width,
    access: Access,
) -> Result<Place, Exception> {
    match op {
        Operand::Reg(r) => Ok(Place::Reg(*r)),
        Operand::Mem(ptr) => cpu.linear(ptr, width.bytes(), access).map(Place::Mem),
        Operand::Imm(_) => Err(Exception::InvalidOpcode),
    }
}

pub(crate) fn load(
    cpu: &CpuState,
    bus: &mut dyn CpuBus,
    place: Place,
    width: Width,
) -> Result<u32, Exception> {
    match place {
        Place::Reg(r) => Ok(cpu.read_gpr(r, width)),
        Place::Mem(addr) => read_sized(bus, addr, width),
    }
}

pub(crate) fn store(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    place: Place,
    width: Width,
    value: u32,
) -> Result<(), Exception> {
    match place {
        Place::Reg(r) => {
            cpu.write_gpr(r, width, value);
            Ok(())
        }
        Place::Mem(addr) => write_sized(bus, addr, width, value),
    }
}

pub(crate) fn read(
    cpu: &CpuState,
    bus: &mut dyn CpuBus,
    op: &Operand,
    width: Width,
) -> Result<u32, Exception> {
    match op {
        Operand::Imm(v) => Ok(width.truncate(*v)),
        _ => {
            let place = locate(cpu, op, width, Access::Read)?;
            load(cpu, bus, place, width)
        }
    }
}

pub(crate) fn write(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    op: &Operand,
    width: Width,
    value: u32,
) -> Result<(), Exception> {
    let place = locate(cpu, op, width, Access::Write)?;
    store(cpu, bus, place, width, value)
}
