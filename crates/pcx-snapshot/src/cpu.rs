use std::io::{Read, Write};

use pcx_cpu_core::flags::{FlagOp, FlagState, LazyFlags};
use pcx_cpu_core::state::{DescriptorTable, FpuState};
use pcx_cpu_core::{CpuState, Segment, SegmentCache};
use pcx_x86::{FlagSet, Width};

use crate::error::{Result, SnapshotError};
use crate::io::{ReadLeExt, WriteLeExt};

pub const CPU_SNAPSHOT_MAGIC: [u8; 4] = *b"PCXC";
pub const CPU_SNAPSHOT_VERSION: u16 = 1;

/// Writes every architectural field of `cpu` in the fixed v1 order.
///
/// Lazy flag inputs are written as they are, not materialized, so a restored processor
/// resolves exactly the same flags. Pending faults and interrupts are not part of the state.
pub fn save_cpu<W: Write + ?Sized>(cpu: &CpuState, w: &mut W) -> Result<()> {
    w.write_all(&CPU_SNAPSHOT_MAGIC)?;
    w.write_u16_le(CPU_SNAPSHOT_VERSION)?;

    for reg in cpu.gpr {
        w.write_u32_le(reg)?;
    }
    w.write_u32_le(cpu.eip)?;
    write_flags(w, &cpu.flags)?;
    for seg in &cpu.segments {
        write_segment(w, seg)?;
    }
    write_table(w, cpu.gdtr)?;
    write_table(w, cpu.idtr)?;
    for cr in cpu.cr {
        w.write_u32_le(cr)?;
    }
    for dr in cpu.dr {
        w.write_u32_le(dr)?;
    }
    write_fpu(w, &cpu.fpu)?;
    w.write_bool(cpu.halted)?;
    Ok(())
}

pub fn restore_cpu<R: Read + ?Sized>(r: &mut R) -> Result<CpuState> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != CPU_SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = r.read_u16_le()?;
    if version != CPU_SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let mut cpu = CpuState::new();
    for reg in &mut cpu.gpr {
        *reg = r.read_u32_le()?;
    }
    cpu.eip = r.read_u32_le()?;
    cpu.flags = read_flags(r)?;
    for seg in &mut cpu.segments {
        *seg = read_segment(r)?;
    }
    cpu.gdtr = read_table(r)?;
    cpu.idtr = read_table(r)?;
    for cr in &mut cpu.cr {
        *cr = r.read_u32_le()?;
    }
    for dr in &mut cpu.dr {
        *dr = r.read_u32_le()?;
    }
    cpu.fpu = read_fpu(r)?;
    cpu.halted = r.read_bool("halted flag")?;
    Ok(cpu)
}

fn write_flags<W: Write + ?Sized>(w: &mut W, flags: &FlagState) -> Result<()> {
    w.write_u32_le(flags.raw)?;
    w.write_u8(flags.lazy.op.code())?;
    w.write_u8(flags.lazy.width.bits() as u8)?;
    w.write_u32_le(flags.lazy.op1)?;
    w.write_u32_le(flags.lazy.op2)?;
    w.write_u32_le(flags.lazy.result)?;
    w.write_u16_le(flags.dirty.bits())?;
    Ok(())
}

fn read_flags<R: Read + ?Sized>(r: &mut R) -> Result<FlagState> {
    let raw = r.read_u32_le()?;
    let op = FlagOp::from_code(r.read_u8()?)
        .ok_or(SnapshotError::Corrupt("lazy flag operation"))?;
    let width =
        Width::from_bits(r.read_u8()?).ok_or(SnapshotError::Corrupt("lazy flag width"))?;
    let lazy = LazyFlags {
        op,
        width,
        op1: r.read_u32_le()?,
        op2: r.read_u32_le()?,
        result: r.read_u32_le()?,
    };
    let dirty =
        FlagSet::from_bits(r.read_u16_le()?).ok_or(SnapshotError::Corrupt("dirty flag mask"))?;
    Ok(FlagState { raw, lazy, dirty })
}

fn write_segment<W: Write + ?Sized>(w: &mut W, seg: &Segment) -> Result<()> {
    w.write_u16_le(seg.selector)?;
    w.write_u32_le(seg.cache.base)?;
    w.write_u32_le(seg.cache.limit)?;
    w.write_u8(seg.cache.access)?;
    w.write_bool(seg.cache.big)?;
    Ok(())
}

fn read_segment<R: Read + ?Sized>(r: &mut R) -> Result<Segment> {
    Ok(Segment {
        selector: r.read_u16_le()?,
        cache: SegmentCache {
            base: r.read_u32_le()?,
            limit: r.read_u32_le()?,
            access: r.read_u8()?,
            big: r.read_bool("segment size bit")?,
        },
    })
}

fn write_table<W: Write + ?Sized>(w: &mut W, table: DescriptorTable) -> Result<()> {
    w.write_u32_le(table.base)?;
    w.write_u16_le(table.limit)
}

fn read_table<R: Read + ?Sized>(r: &mut R) -> Result<DescriptorTable> {
    Ok(DescriptorTable {
        base: r.read_u32_le()?,
        limit: r.read_u16_le()?,
    })
}

fn write_fpu<W: Write + ?Sized>(w: &mut W, fpu: &FpuState) -> Result<()> {
    for value in fpu.st {
        w.write_u64_le(value.to_bits())?;
    }
    w.write_u8(fpu.top)?;
    w.write_u16_le(fpu.status)?;
    w.write_u16_le(fpu.control)?;
    w.write_u16_le(fpu.tag)?;
    Ok(())
}

fn read_fpu<R: Read + ?Sized>(r: &mut R) -> Result<FpuState> {
    let mut st = [0.0; 8];
    for value in &mut st {
        *value = f64::from_bits(r.read_u64_le()?);
    }
    let top = r.read_u8()?;
    if top > 7 {
        return Err(SnapshotError::Corrupt("fpu stack top"));
    }
    Ok(FpuState {
        st,
        top,
        status: r.read_u16_le()?,
        control: r.read_u16_le()?,
        tag: r.read_u16_le()?,
    })
}
