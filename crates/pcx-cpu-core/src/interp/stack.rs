use pcx_x86::inst::gpr::{EBP, ESP};
use pcx_x86::{Operand, SegReg, Width};

use super::operand::{read, write};
use crate::addr::Access;
use crate::exception::Exception;
use crate::mem::{read_sized, write_sized, CpuBus};
use crate::state::CpuState;

pub(crate) fn push(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    value: u32,
    width: Width,
) -> Result<(), Exception> {
    let sp = cpu.sp().wrapping_sub(width.bytes()) & cpu.stack_mask();
    let addr = cpu.translate(SegReg::Ss, sp, width.bytes(), Access::Write)?;
    write_sized(bus, addr, width, value)?;
    cpu.set_sp(sp);
    Ok(())
}

/// Read the stack `depth` bytes above the current top without popping.
pub(crate) fn peek(
    cpu: &CpuState,
    bus: &mut dyn CpuBus,
    width: Width,
    depth: u32,
) -> Result<u32, Exception> {
    let sp = cpu.sp().wrapping_add(depth) & cpu.stack_mask();
    let addr = cpu.translate(SegReg::Ss, sp, width.bytes(), Access::Read)?;
    read_sized(bus, addr, width)
}

pub(crate) fn pop(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<u32, Exception> {
    let value = peek(cpu, bus, width, 0)?;
    cpu.set_sp(cpu.sp().wrapping_add(width.bytes()));
    Ok(value)
}

/// Run a multi-step stack sequence, restoring ESP if any step faults.
fn atomically<T>(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    f: impl FnOnce(&mut CpuState, &mut dyn CpuBus) -> Result<T, Exception>,
) -> Result<T, Exception> {
    let saved = cpu.gpr[usize::from(ESP)];
    let result = f(cpu, bus);
    if result.is_err() {
        cpu.gpr[usize::from(ESP)] = saved;
    }
    result
}

pub(super) fn exec_push(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    src: &Operand,
    width: Width,
) -> Result<(), Exception> {
    // `push esp` stores the value from before the decrement.
    let value = read(cpu, bus, src, width)?;
    push(cpu, bus, value, width)
}

pub(super) fn exec_pop(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: &Operand,
    width: Width,
) -> Result<(), Exception> {
    atomically(cpu, bus, |cpu, bus| {
        let value = pop(cpu, bus, width)?;
        write(cpu, bus, dst, width, value)
    })
}

pub(super) fn exec_pusha(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    width: Width,
) -> Result<(), Exception> {
    let snapshot: [u32; 8] = std::array::from_fn(|i| cpu.read_gpr(i as u8, width));
    atomically(cpu, bus, |cpu, bus| {
        for value in snapshot {
            push(cpu, bus, value, width)?;
        }
        Ok(())
    })
}

pub(super) fn exec_popa(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Exception> {
    let mut values = [0u32; 8];
    atomically(cpu, bus, |cpu, bus| {
        for slot in values.iter_mut().rev() {
            *slot = pop(cpu, bus, width)?;
        }
        Ok(())
    })?;
    for (i, value) in values.iter().enumerate() {
        // The saved stack pointer is discarded.
        if i != usize::from(ESP) {
            cpu.write_gpr(i as u8, width, *value);
        }
    }
    Ok(())
}

pub(super) fn exec_enter(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    frame: u16,
    nesting: u8,
    width: Width,
) -> Result<(), Exception> {
    let nesting = nesting % 32;
    let bytes = width.bytes();
    atomically(cpu, bus, |cpu, bus| {
        let bp = cpu.read_gpr(EBP, width);
        push(cpu, bus, bp, width)?;
        let frame_ptr = cpu.sp();
        if nesting > 0 {
            let mut walk = bp;
            for _ in 1..nesting {
                walk = walk.wrapping_sub(bytes);
                let addr = cpu.translate(
                    SegReg::Ss,
                    walk & cpu.stack_mask(),
                    bytes,
                    Access::Read,
                )?;
                let outer = read_sized(bus, addr, width)?;
                push(cpu, bus, outer, width)?;
            }
            push(cpu, bus, frame_ptr, width)?;
        }
        let top = cpu.sp().wrapping_sub(u32::from(frame)) & cpu.stack_mask();
        // The new frame must be writable before anything is committed.
        cpu.translate(SegReg::Ss, top, 1, Access::Write)?;
        cpu.write_gpr(EBP, width, frame_ptr);
        cpu.set_sp(top);
        Ok(())
    })
}

pub(super) fn exec_leave(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<(), Exception> {
    atomically(cpu, bus, |cpu, bus| {
        let bp = cpu.gpr[usize::from(EBP)];
        cpu.set_sp(bp);
        let saved = pop(cpu, bus, width)?;
        cpu.write_gpr(EBP, width, saved);
        Ok(())
    })
}
