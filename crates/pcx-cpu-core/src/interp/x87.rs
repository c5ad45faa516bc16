//! x87 subset: loads, stores, the four basic arithmetic operations, compares and `fstsw ax`.
//!
//! Exceptions are always handled with the masked response: the status word records them and
//! the operation produces its default result. Unmasked delivery (#MF) is not modelled.

use pcx_x86::inst::gpr::EAX;
use pcx_x86::{FpuArith, FpuOp, FpuSrc, Width};

use super::Executable;
use crate::addr::Access;
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuState, FpuState};

pub const FSW_IE: u16 = 1 << 0;
pub const FSW_ZE: u16 = 1 << 2;
pub const FSW_SF: u16 = 1 << 6;
pub const FSW_C0: u16 = 1 << 8;
pub const FSW_C1: u16 = 1 << 9;
pub const FSW_C2: u16 = 1 << 10;
pub const FSW_C3: u16 = 1 << 14;
const FSW_TOP_SHIFT: u16 = 11;
const FSW_CONDITION: u16 = FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3;

const TAG_VALID: u16 = 0b00;
const TAG_ZERO: u16 = 0b01;
const TAG_SPECIAL: u16 = 0b10;
const TAG_EMPTY: u16 = 0b11;

impl FpuState {
    fn phys(&self, i: u8) -> usize {
        usize::from((self.top + i) & 7)
    }

    fn tag_of(&self, phys: usize) -> u16 {
        (self.tag >> (phys * 2)) & 0b11
    }

    fn set_tag(&mut self, phys: usize, tag: u16) {
        self.tag = (self.tag & !(0b11 << (phys * 2))) | (tag << (phys * 2));
    }

    fn tag_for(value: f64) -> u16 {
        if value == 0.0 {
            TAG_ZERO
        } else if value.is_finite() {
            TAG_VALID
        } else {
            TAG_SPECIAL
        }
    }

    pub fn is_empty(&self, i: u8) -> bool {
        self.tag_of(self.phys(i)) == TAG_EMPTY
    }

    /// `st(i)`. Reading an empty register is a stack underflow and yields the default NaN.
    pub fn st(&mut self, i: u8) -> f64 {
        if self.is_empty(i) {
            self.status |= FSW_IE | FSW_SF;
            self.status &= !FSW_C1;
            return f64::NAN;
        }
        self.st[self.phys(i)]
    }

    pub fn set_st(&mut self, i: u8, value: f64) {
        let phys = self.phys(i);
        self.st[phys] = value;
        self.set_tag(phys, Self::tag_for(value));
    }

    pub fn push(&mut self, value: f64) {
        let top = (self.top + 7) & 7;
        let value = if self.tag_of(usize::from(top)) != TAG_EMPTY {
            // Stack overflow.
            self.status |= FSW_IE | FSW_SF | FSW_C1;
            f64::NAN
        } else {
            value
        };
        self.top = top;
        self.set_st(0, value);
    }

    pub fn pop(&mut self) {
        let phys = self.phys(0);
        self.set_tag(phys, TAG_EMPTY);
        self.top = (self.top + 1) & 7;
    }

    /// The status word with TOP folded in.
    pub fn status_word(&self) -> u16 {
        (self.status & !(7 << FSW_TOP_SHIFT)) | (u16::from(self.top) << FSW_TOP_SHIFT)
    }

    pub fn reset(&mut self) {
        *self = FpuState::default();
    }
}

/// `a <op> b` with the masked exception response; returns the result and the status bits
/// raised.
pub fn fpu_arith(op: FpuArith, a: f64, b: f64) -> (f64, u16) {
    let (lhs, rhs) = match op {
        FpuArith::Subr | FpuArith::Divr => (b, a),
        _ => (a, b),
    };
    let result = match op {
        FpuArith::Add => lhs + rhs,
        FpuArith::Sub | FpuArith::Subr => lhs - rhs,
        FpuArith::Mul => lhs * rhs,
        FpuArith::Div | FpuArith::Divr => lhs / rhs,
    };
    let mut raised = 0;
    if result.is_nan() && !lhs.is_nan() && !rhs.is_nan() {
        // inf - inf, 0 * inf, 0 / 0, inf / inf
        raised |= FSW_IE;
    }
    if matches!(op, FpuArith::Div | FpuArith::Divr)
        && rhs == 0.0
        && lhs.is_finite()
        && lhs != 0.0
    {
        raised |= FSW_ZE;
    }
    (result, raised)
}

/// Condition bits for comparing `a` with `b`: C3 for equal, C0 for less, all three (and IE)
/// for unordered.
pub fn fpu_compare(a: f64, b: f64) -> u16 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Greater) => 0,
        Some(std::cmp::Ordering::Less) => FSW_C0,
        Some(std::cmp::Ordering::Equal) => FSW_C3,
        None => FSW_C3 | FSW_C2 | FSW_C0 | FSW_IE,
    }
}

impl Executable {
    fn fpu_source(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        src: &FpuSrc,
    ) -> Result<f64, Exception> {
        match src {
            FpuSrc::M32(ptr) => {
                let addr = cpu.linear(ptr, 4, Access::Read)?;
                Ok(f64::from(f32::from_bits(bus.read_u32(addr)?)))
            }
            FpuSrc::M64(ptr) => {
                let addr = cpu.linear(ptr, 8, Access::Read)?;
                Ok(f64::from_bits(bus.read_u64(addr)?))
            }
            FpuSrc::St(i) => Ok(cpu.fpu.st(*i)),
        }
    }

    pub(super) fn exec_fpu(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: &FpuOp,
    ) -> Result<(), Exception> {
        match op {
            FpuOp::Load(src) => {
                let value = self.fpu_source(cpu, bus, src)?;
                cpu.fpu.push(value);
            }
            FpuOp::LoadOne => cpu.fpu.push(1.0),
            FpuOp::LoadZero => cpu.fpu.push(0.0),
            FpuOp::Store { dst, pop } => {
                let value = cpu.fpu.st(0);
                match dst {
                    FpuSrc::M32(ptr) => {
                        let addr = cpu.linear(ptr, 4, Access::Write)?;
                        bus.write_u32(addr, (value as f32).to_bits())?;
                    }
                    FpuSrc::M64(ptr) => {
                        let addr = cpu.linear(ptr, 8, Access::Write)?;
                        bus.write_u64(addr, value.to_bits())?;
                    }
                    FpuSrc::St(i) => cpu.fpu.set_st(*i, value),
                }
                if *pop {
                    cpu.fpu.pop();
                }
            }
            FpuOp::Xch(i) => {
                let a = cpu.fpu.st(0);
                let b = cpu.fpu.st(*i);
                cpu.fpu.set_st(0, b);
                cpu.fpu.set_st(*i, a);
            }
            FpuOp::Arith { op, dst, src, pop } => {
                let b = self.fpu_source(cpu, bus, src)?;
                let a = cpu.fpu.st(*dst);
                let (result, raised) = fpu_arith(*op, a, b);
                cpu.fpu.status |= raised;
                cpu.fpu.set_st(*dst, result);
                if *pop {
                    cpu.fpu.pop();
                }
            }
            FpuOp::Compare { src, pop } => {
                let b = self.fpu_source(cpu, bus, src)?;
                let a = cpu.fpu.st(0);
                let bits = fpu_compare(a, b);
                cpu.fpu.status = (cpu.fpu.status & !FSW_CONDITION) | bits;
                if *pop {
                    cpu.fpu.pop();
                }
            }
            FpuOp::StswAx => {
                let word = cpu.fpu.status_word();
                cpu.write_gpr(EAX, Width::W16, u32::from(word));
            }
            FpuOp::Init => cpu.fpu.reset(),
        }
        Ok(())
    }
}
