//! Integer arithmetic: the flag-staging ALU operations plus the directly-flagged rotate,
//! multiply, divide and bit-test families.

use pcx_x86::inst::gpr::{EAX, EDX};
use pcx_x86::{AluOp, BitOp, FlagSet, MulDivOp, Operand, ShiftCount, ShiftOp, Width};

use super::operand::{load, locate, read, store, Place};
use super::Executable;
use crate::addr::Access;
use crate::exception::Exception;
use crate::flags::{FlagOp, LazyFlags};
use crate::mem::CpuBus;
use crate::state::CpuState;

/// `a <op> b` for the eight group-1 operations. `carry` is the incoming CF for `adc`/`sbb`.
pub fn alu(op: AluOp, a: u32, b: u32, carry: bool, width: Width) -> (u32, LazyFlags) {
    let a = width.truncate(a);
    let b = width.truncate(b);
    let c = u32::from(carry);
    let (kind, result) = match op {
        AluOp::Add => (FlagOp::Add, a.wrapping_add(b)),
        AluOp::Adc => (FlagOp::Adc, a.wrapping_add(b).wrapping_add(c)),
        AluOp::Sub | AluOp::Cmp => (FlagOp::Sub, a.wrapping_sub(b)),
        AluOp::Sbb => (FlagOp::Sbb, a.wrapping_sub(b).wrapping_sub(c)),
        AluOp::And => (FlagOp::Logic, a & b),
        AluOp::Or => (FlagOp::Logic, a | b),
        AluOp::Xor => (FlagOp::Logic, a ^ b),
    };
    let result = width.truncate(result);
    (result, LazyFlags::new(kind, width, a, b, result))
}

/// Masked shift count; 0 means the instruction has no effect at all.
pub fn masked_count(count: u32) -> u32 {
    count & 0x1F
}

/// `shl`/`shr`/`sar` by a masked, non-zero count.
pub fn shift(op: ShiftOp, a: u32, count: u32, width: Width) -> (u32, LazyFlags) {
    debug_assert!(count != 0 && count < 32);
    let a = width.truncate(a);
    let (kind, result) = match op {
        ShiftOp::Shl | ShiftOp::Sal => (FlagOp::Shl, (u64::from(a) << count) as u32),
        ShiftOp::Shr => (FlagOp::Shr, a >> count),
        _ => {
            let signed = width.sign_extend(a) as i32;
            (FlagOp::Sar, (signed >> count) as u32)
        }
    };
    let result = width.truncate(result);
    (result, LazyFlags::new(kind, width, a, count, result))
}

/// Outcome of a rotate: the new value, CF, and OF when the architecture defines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotated {
    pub result: u32,
    pub cf: bool,
    pub of: Option<bool>,
}

/// `rol`/`ror`/`rcl`/`rcr`. Returns `None` when the masked count is zero (no state changes).
///
/// Through-carry rotates reduce the count modulo `bits + 1`; a reduced count of zero still
/// "executes" but leaves value and CF unchanged.
pub fn rotate(op: ShiftOp, a: u32, cf: bool, count: u32, width: Width) -> Option<Rotated> {
    let masked = masked_count(count);
    if masked == 0 {
        return None;
    }
    let bits = width.bits();
    let mask = width.mask();
    let sign = width.sign_bit();
    let a = width.truncate(a);
    let msb = |v: u32| v & sign != 0;
    let next_msb = |v: u32| v & (sign >> 1) != 0;

    Some(match op {
        ShiftOp::Rol => {
            let n = masked % bits;
            let r = if n == 0 {
                a
            } else {
                ((a << n) | (a >> (bits - n))) & mask
            };
            let cf = r & 1 != 0;
            Rotated {
                result: r,
                cf,
                of: (masked == 1).then(|| msb(r) ^ cf),
            }
        }
        ShiftOp::Ror => {
            let n = masked % bits;
            let r = if n == 0 {
                a
            } else {
                ((a >> n) | (a << (bits - n))) & mask
            };
            Rotated {
                result: r,
                cf: msb(r),
                of: (masked == 1).then(|| msb(r) ^ next_msb(r)),
            }
        }
        ShiftOp::Rcl | ShiftOp::Rcr => {
            let total = bits + 1;
            let n = masked % total;
            let full = (1u64 << total) - 1;
            let v = (u64::from(cf) << bits) | u64::from(a);
            let v = if n == 0 {
                v
            } else if op == ShiftOp::Rcl {
                ((v << n) | (v >> (total - n))) & full
            } else {
                ((v >> n) | (v << (total - n))) & full
            };
            let r = (v as u32) & mask;
            let cf = (v >> bits) & 1 != 0;
            let of = (n == 1).then(|| {
                if op == ShiftOp::Rcl {
                    msb(r) ^ cf
                } else {
                    msb(r) ^ next_msb(r)
                }
            });
            Rotated { result: r, cf, of }
        }
        _ => return None,
    })
}

/// Unsigned divide of a double-width dividend. Raises #DE on a zero divisor or a quotient that
/// does not fit.
pub fn div_unsigned(dividend: u64, divisor: u32, width: Width) -> Result<(u32, u32), Exception> {
    let divisor = u64::from(width.truncate(divisor));
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let quotient = dividend / divisor;
    if quotient > u64::from(width.mask()) {
        return Err(Exception::DivideError);
    }
    Ok((quotient as u32, (dividend % divisor) as u32))
}

/// Signed divide; the quotient must fit the signed range of `width`.
pub fn div_signed(dividend: i64, divisor: u32, width: Width) -> Result<(u32, u32), Exception> {
    let divisor = i64::from(width.sign_extend(divisor) as i32);
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let quotient = dividend.checked_div(divisor).ok_or(Exception::DivideError)?;
    let max = i64::from(width.sign_bit()) - 1;
    if quotient > max || quotient < -max - 1 {
        return Err(Exception::DivideError);
    }
    let remainder = dividend % divisor;
    Ok((
        width.truncate(quotient as u32),
        width.truncate(remainder as u32),
    ))
}

fn shift_count(cpu: &CpuState, count: ShiftCount) -> u32 {
    match count {
        ShiftCount::One => 1,
        ShiftCount::Imm(n) => u32::from(n),
        ShiftCount::Cl => cpu.read_gpr(pcx_x86::inst::gpr::ECX, Width::W8),
    }
}

impl Executable {
    pub(super) fn exec_alu(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: AluOp,
        dst: &Operand,
        src: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let writes = op != AluOp::Cmp;
        let access = if writes { Access::Write } else { Access::Read };
        let place = locate(cpu, dst, width, access)?;
        let a = load(cpu, bus, place, width)?;
        let b = read(cpu, bus, src, width)?;
        let carry = matches!(op, AluOp::Adc | AluOp::Sbb) && cpu.flags.get(FlagSet::CF);
        let (result, lazy) = alu(op, a, b, carry, width);
        if writes {
            store(cpu, bus, place, width, result)?;
        }
        self.stage(cpu, lazy, FlagSet::ARITH);
        Ok(())
    }

    pub(super) fn exec_test(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        lhs: &Operand,
        rhs: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let a = read(cpu, bus, lhs, width)?;
        let b = read(cpu, bus, rhs, width)?;
        self.stage(cpu, LazyFlags::logic(width, a & b), FlagSet::ARITH);
        Ok(())
    }

    /// `inc`/`dec`: CF keeps its previous value.
    pub(super) fn exec_inc_dec(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dst: &Operand,
        width: Width,
        dec: bool,
    ) -> Result<(), Exception> {
        let place = locate(cpu, dst, width, Access::Write)?;
        let a = load(cpu, bus, place, width)?;
        let op = if dec { AluOp::Sub } else { AluOp::Add };
        let (result, lazy) = alu(op, a, 1, false, width);
        store(cpu, bus, place, width, result)?;
        self.stage(cpu, lazy, FlagSet::OSZAP);
        Ok(())
    }

    pub(super) fn exec_not(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dst: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let place = locate(cpu, dst, width, Access::Write)?;
        let a = load(cpu, bus, place, width)?;
        store(cpu, bus, place, width, !a & width.mask())
    }

    pub(super) fn exec_neg(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dst: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let place = locate(cpu, dst, width, Access::Write)?;
        let a = load(cpu, bus, place, width)?;
        let (result, lazy) = alu(AluOp::Sub, 0, a, false, width);
        store(cpu, bus, place, width, result)?;
        self.stage(cpu, lazy, FlagSet::ARITH);
        Ok(())
    }

    pub(super) fn exec_shift(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: ShiftOp,
        dst: &Operand,
        count: ShiftCount,
        width: Width,
    ) -> Result<(), Exception> {
        let place = locate(cpu, dst, width, Access::Write)?;
        let a = load(cpu, bus, place, width)?;
        let count = shift_count(cpu, count);

        if op.is_rotate() {
            let cf = op.through_carry() && cpu.flags.get(FlagSet::CF);
            let Some(rot) = rotate(op, a, cf, count, width) else {
                return Ok(());
            };
            store(cpu, bus, place, width, rot.result)?;
            cpu.flags.set(FlagSet::CF, rot.cf);
            if let Some(of) = rot.of {
                cpu.flags.set(FlagSet::OF, of);
            }
            return Ok(());
        }

        let count = masked_count(count);
        if count == 0 {
            return Ok(());
        }
        let (result, lazy) = shift(op, a, count, width);
        store(cpu, bus, place, width, result)?;
        self.stage(cpu, lazy, FlagSet::ARITH);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn exec_double_shift(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        left: bool,
        dst: &Operand,
        src: u8,
        count: ShiftCount,
        width: Width,
    ) -> Result<(), Exception> {
        let place = locate(cpu, dst, width, Access::Write)?;
        let a = load(cpu, bus, place, width)?;
        let fill = cpu.read_gpr(src, width);
        let count = masked_count(shift_count(cpu, count));
        if count == 0 {
            return Ok(());
        }
        let bits = width.bits();
        let (kind, result) = if left {
            let v = (u64::from(a) << bits) | u64::from(fill);
            (FlagOp::Shld, ((v << count) >> bits) as u32)
        } else {
            let v = (u64::from(fill) << bits) | u64::from(a);
            (FlagOp::Shrd, (v >> count) as u32)
        };
        let result = width.truncate(result);
        store(cpu, bus, place, width, result)?;
        self.stage(
            cpu,
            LazyFlags::new(kind, width, a, count, result),
            FlagSet::ARITH,
        );
        Ok(())
    }

    /// One-operand `mul`/`imul`/`div`/`idiv` on AL/AX/EAX (with AH/DX/EDX as the high half).
    pub(super) fn exec_mul_div(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: MulDivOp,
        src: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let s = read(cpu, bus, src, width)?;
        let bits = width.bits();

        // Double-width accumulator: AX for bytes, DX:AX or EDX:EAX otherwise.
        let acc = match width {
            Width::W8 => u64::from(cpu.read_gpr(EAX, Width::W16)),
            _ => {
                (u64::from(cpu.read_gpr(EDX, width)) << bits)
                    | u64::from(cpu.read_gpr(EAX, width))
            }
        };
        let set_acc = |cpu: &mut CpuState, lo: u32, hi: u32| match width {
            Width::W8 => cpu.write_gpr(EAX, Width::W16, (lo & 0xFF) | ((hi & 0xFF) << 8)),
            _ => {
                cpu.write_gpr(EAX, width, lo);
                cpu.write_gpr(EDX, width, hi);
            }
        };

        match op {
            MulDivOp::Mul => {
                let a = u64::from(cpu.read_gpr(EAX, width));
                let product = a * u64::from(s);
                let hi = (product >> bits) as u32 & width.mask();
                set_acc(cpu, product as u32 & width.mask(), hi);
                cpu.flags.set(FlagSet::CF, hi != 0);
                cpu.flags.set(FlagSet::OF, hi != 0);
            }
            MulDivOp::Imul => {
                let a = i64::from(width.sign_extend(cpu.read_gpr(EAX, width)) as i32);
                let b = i64::from(width.sign_extend(s) as i32);
                let product = a * b;
                let lo = product as u32 & width.mask();
                let hi = (product >> bits) as u32 & width.mask();
                let fits = i64::from(width.sign_extend(lo) as i32) == product;
                set_acc(cpu, lo, hi);
                cpu.flags.set(FlagSet::CF, !fits);
                cpu.flags.set(FlagSet::OF, !fits);
            }
            MulDivOp::Div => {
                let (q, r) = div_unsigned(acc, s, width)?;
                set_acc(cpu, q, r);
            }
            MulDivOp::Idiv => {
                let total = bits * 2;
                let dividend = ((acc << (64 - total)) as i64) >> (64 - total);
                let (q, r) = div_signed(dividend, s, width)?;
                set_acc(cpu, q, r);
            }
        }
        Ok(())
    }

    /// Two- and three-operand `imul`.
    pub(super) fn exec_imul(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dst: u8,
        src: &Operand,
        imm: Option<u32>,
        width: Width,
    ) -> Result<(), Exception> {
        let s = read(cpu, bus, src, width)?;
        let (a, b) = match imm {
            Some(imm) => (s, imm),
            None => (cpu.read_gpr(dst, width), s),
        };
        let product =
            i64::from(width.sign_extend(a) as i32) * i64::from(width.sign_extend(b) as i32);
        let result = product as u32 & width.mask();
        let fits = i64::from(width.sign_extend(result) as i32) == product;
        cpu.write_gpr(dst, width, result);
        cpu.flags.set(FlagSet::CF, !fits);
        cpu.flags.set(FlagSet::OF, !fits);
        Ok(())
    }

    pub(super) fn exec_bit(
        &self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        op: BitOp,
        base: &Operand,
        bit: &Operand,
        width: Width,
    ) -> Result<(), Exception> {
        let bits = width.bits();
        let access = if op == BitOp::Bt {
            Access::Read
        } else {
            Access::Write
        };
        let (place, index) = match (base, bit) {
            // A register bit offset addresses a bit string that may extend past the operand.
            (Operand::Mem(ptr), Operand::Reg(r)) => {
                let offset = width.sign_extend(cpu.read_gpr(*r, width)) as i32;
                let shift = bits.trailing_zeros();
                let displacement = (offset >> shift) * width.bytes() as i32;
                let addr = cpu.linear_displaced(ptr, displacement, width.bytes(), access)?;
                (Place::Mem(addr), offset as u32 & (bits - 1))
            }
            _ => {
                let index = read(cpu, bus, bit, width)? & (bits - 1);
                (locate(cpu, base, width, access)?, index)
            }
        };
        let value = load(cpu, bus, place, width)?;
        let selected = 1u32 << index;
        let updated = match op {
            BitOp::Bt => value,
            BitOp::Bts => value | selected,
            BitOp::Btr => value & !selected,
            BitOp::Btc => value ^ selected,
        };
        if op != BitOp::Bt {
            store(cpu, bus, place, width, updated)?;
        }
        cpu.flags.set(FlagSet::CF, value & selected != 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_sets_borrow() {
        let (r, lazy) = alu(AluOp::Sub, 1, 2, false, Width::W16);
        assert_eq!(r, 0xFFFF);
        assert!(lazy.resolve(FlagSet::CF));
        assert!(lazy.resolve(FlagSet::SF));
    }

    #[test]
    fn sar_fills_with_sign() {
        let (r, _) = shift(ShiftOp::Sar, 0x80, 3, Width::W8);
        assert_eq!(r, 0xF0);
        let (r, lazy) = shift(ShiftOp::Shl, 0x8000_0001, 1, Width::W32);
        assert_eq!(r, 2);
        assert!(lazy.resolve(FlagSet::CF));
    }

    #[test]
    fn rcl_by_nine_on_a_byte_is_identity() {
        let rot = rotate(ShiftOp::Rcl, 0xA5, true, 9, Width::W8).unwrap();
        assert_eq!(rot.result, 0xA5);
        assert!(rot.cf);
        assert_eq!(rot.of, None);
    }

    #[test]
    fn rcr_one_moves_carry_into_msb() {
        let rot = rotate(ShiftOp::Rcr, 0x01, true, 1, Width::W8).unwrap();
        assert_eq!(rot.result, 0x80);
        assert!(rot.cf);
        assert_eq!(rot.of, Some(true));
    }

    #[test]
    fn rol_count_zero_after_mask_is_none() {
        assert_eq!(rotate(ShiftOp::Rol, 1, false, 32, Width::W32), None);
        let rot = rotate(ShiftOp::Rol, 0x81, false, 1, Width::W8).unwrap();
        assert_eq!(rot.result, 0x03);
        assert!(rot.cf);
    }

    #[test]
    fn divide_errors() {
        assert_eq!(div_unsigned(10, 0, Width::W8), Err(Exception::DivideError));
        assert_eq!(div_unsigned(0x100, 1, Width::W8), Err(Exception::DivideError));
        assert_eq!(div_unsigned(0xFF, 1, Width::W8), Ok((0xFF, 0)));
        assert_eq!(div_signed(-128, 0xFF, Width::W8), Err(Exception::DivideError));
        assert_eq!(div_signed(i64::MIN, u32::MAX, Width::W32), Err(Exception::DivideError));
        // -7 / 2 = -3 rem -1
        assert_eq!(div_signed(-7, 2, Width::W16), Ok((0xFFFD, 0xFFFF)));
    }
}
