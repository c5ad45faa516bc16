//! Lazy arithmetic flags.
//!
//! Flag-producing instructions do not compute CF/PF/AF/ZF/SF/OF eagerly. They stage a
//! [`LazyFlags`] record (operation kind, width, operands and result) together with the set of
//! flags that record defines. A flag is only computed when something reads it, and the computed
//! value is then cached in the raw EFLAGS word.

use pcx_x86::{FlagSet, Width};

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// Bits that always read as zero (3, 5, 15 and everything above ID).
const FLAG_ZERO_BITS: u32 = (1 << 3) | (1 << 5) | (1 << 15) | !((FLAG_ID << 1) - 1);

/// Individual arithmetic flags in a fixed order.
pub const ARITH_FLAGS: [FlagSet; 6] = [
    FlagSet::CF,
    FlagSet::PF,
    FlagSet::AF,
    FlagSet::ZF,
    FlagSet::SF,
    FlagSet::OF,
];

/// Which operation produced a staged flag record.
///
/// `inc`/`dec` stage `Add`/`Sub` with an operand of 1 and a mask that excludes CF; `neg` stages
/// `Sub` with a zero first operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FlagOp {
    #[default]
    None = 0,
    Add = 1,
    Adc = 2,
    Sub = 3,
    Sbb = 4,
    Logic = 5,
    Shl = 6,
    Shr = 7,
    Sar = 8,
    Shld = 9,
    Shrd = 10,
}

impl FlagOp {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<FlagOp> {
        Some(match code {
            0 => FlagOp::None,
            1 => FlagOp::Add,
            2 => FlagOp::Adc,
            3 => FlagOp::Sub,
            4 => FlagOp::Sbb,
            5 => FlagOp::Logic,
            6 => FlagOp::Shl,
            7 => FlagOp::Shr,
            8 => FlagOp::Sar,
            9 => FlagOp::Shld,
            10 => FlagOp::Shrd,
            _ => return None,
        })
    }
}

/// Everything needed to recompute the arithmetic flags of one operation.
///
/// For shifts `op2` is the masked, non-zero shift count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyFlags {
    pub op: FlagOp,
    pub width: Width,
    pub op1: u32,
    pub op2: u32,
    pub result: u32,
}

impl Default for LazyFlags {
    fn default() -> Self {
        Self {
            op: FlagOp::None,
            width: Width::W32,
            op1: 0,
            op2: 0,
            result: 0,
        }
    }
}

pub fn parity(v: u32) -> bool {
    (v as u8).count_ones() % 2 == 0
}

impl LazyFlags {
    pub fn new(op: FlagOp, width: Width, op1: u32, op2: u32, result: u32) -> Self {
        Self {
            op,
            width,
            op1,
            op2,
            result,
        }
    }

    /// Record for a bitwise operation; only the result matters.
    pub fn logic(width: Width, result: u32) -> Self {
        Self::new(FlagOp::Logic, width, 0, 0, result)
    }

    /// Compute a single arithmetic flag. Pure: nothing is cached.
    pub fn resolve(&self, flag: FlagSet) -> bool {
        let r = self.width.truncate(self.result);
        if flag == FlagSet::CF {
            self.carry()
        } else if flag == FlagSet::PF {
            parity(r)
        } else if flag == FlagSet::AF {
            self.aux_carry()
        } else if flag == FlagSet::ZF {
            r == 0
        } else if flag == FlagSet::SF {
            r & self.width.sign_bit() != 0
        } else if flag == FlagSet::OF {
            self.overflow()
        } else {
            false
        }
    }

    /// EFLAGS bits for every flag in `mask`.
    pub fn resolve_bits(&self, mask: FlagSet) -> u32 {
        ARITH_FLAGS
            .iter()
            .filter(|f| mask.contains(**f) && self.resolve(**f))
            .fold(0, |acc, f| acc | f.eflags_mask())
    }

    fn carry(&self) -> bool {
        let w = self.width;
        let mask = u64::from(w.mask());
        let bits = w.bits();
        let a = self.op1 & w.mask();
        let b = self.op2 & w.mask();
        let r = self.result & w.mask();
        match self.op {
            FlagOp::None | FlagOp::Logic => false,
            FlagOp::Add => r < a,
            FlagOp::Adc => {
                let carry_in = r.wrapping_sub(a).wrapping_sub(b) & w.mask();
                u64::from(a) + u64::from(b) + u64::from(carry_in) > mask
            }
            FlagOp::Sub => a < b,
            FlagOp::Sbb => {
                let borrow_in = a.wrapping_sub(b).wrapping_sub(r) & w.mask();
                u64::from(a) < u64::from(b) + u64::from(borrow_in)
            }
            // Last bit shifted out of the top: bit (bits - count) of the source.
            FlagOp::Shl | FlagOp::Shld => {
                (u64::from(a) << self.op2.min(63)) >> bits & 1 != 0
            }
            FlagOp::Shr | FlagOp::Shrd => {
                u64::from(a) >> self.op2.saturating_sub(1).min(63) & 1 != 0
            }
            FlagOp::Sar => {
                let signed = i64::from(w.sign_extend(a) as i32);
                signed >> self.op2.saturating_sub(1).min(63) & 1 != 0
            }
        }
    }

    fn aux_carry(&self) -> bool {
        match self.op {
            FlagOp::Add | FlagOp::Adc | FlagOp::Sub | FlagOp::Sbb => {
                (self.op1 ^ self.op2 ^ self.result) & 0x10 != 0
            }
            _ => false,
        }
    }

    fn overflow(&self) -> bool {
        let sign = self.width.sign_bit();
        let (a, b, r) = (self.op1, self.op2, self.result);
        match self.op {
            FlagOp::Add | FlagOp::Adc => (a ^ r) & (b ^ r) & sign != 0,
            FlagOp::Sub | FlagOp::Sbb => (a ^ b) & (a ^ r) & sign != 0,
            FlagOp::Shl => (r & sign != 0) ^ self.carry(),
            FlagOp::Shr => a & sign != 0,
            FlagOp::Shld | FlagOp::Shrd => (a ^ r) & sign != 0,
            FlagOp::None | FlagOp::Logic | FlagOp::Sar => false,
        }
    }
}

/// EFLAGS with lazily evaluated arithmetic bits.
///
/// Bits in `dirty` are stale in `raw` and must be taken from `lazy`. Every other bit of `raw` is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagState {
    pub raw: u32,
    pub lazy: LazyFlags,
    pub dirty: FlagSet,
}

impl Default for FlagState {
    fn default() -> Self {
        Self {
            raw: FLAG_RESERVED1,
            lazy: LazyFlags::default(),
            dirty: FlagSet::empty(),
        }
    }
}

impl FlagState {
    /// Read an arithmetic flag, resolving and caching it if it is stale.
    pub fn get(&mut self, flag: FlagSet) -> bool {
        if self.dirty.contains(flag) {
            let value = self.lazy.resolve(flag);
            self.write_raw(flag.eflags_mask(), value);
            self.dirty.remove(flag);
            value
        } else {
            self.raw & flag.eflags_mask() != 0
        }
    }

    /// Read an arithmetic flag without caching it.
    pub fn peek(&self, flag: FlagSet) -> bool {
        if self.dirty.contains(flag) {
            self.lazy.resolve(flag)
        } else {
            self.raw & flag.eflags_mask() != 0
        }
    }

    /// Set an arithmetic flag directly; it stops being stale.
    pub fn set(&mut self, flag: FlagSet, value: bool) {
        self.write_raw(flag.eflags_mask(), value);
        self.dirty.remove(flag);
    }

    /// Set a non-arithmetic EFLAGS bit (IF, DF, TF, ...).
    pub fn set_bit(&mut self, bit: u32, value: bool) {
        self.write_raw(bit, value);
    }

    pub fn bit(&self, bit: u32) -> bool {
        self.raw & bit != 0
    }

    /// Replace the staged record with `lazy`, defining the flags in `mask`.
    ///
    /// Flags still stale from the previous record but not covered by `mask` are materialised
    /// first, so partial writers (`inc`, `dec`) keep the older CF.
    pub fn stage(&mut self, lazy: LazyFlags, mask: FlagSet) {
        let carried = self.dirty - mask;
        if !carried.is_empty() {
            self.materialize_bits(carried);
        }
        self.lazy = lazy;
        self.dirty = mask;
    }

    /// Resolve every stale flag into `raw`.
    pub fn materialize(&mut self) {
        self.materialize_bits(self.dirty);
    }

    fn materialize_bits(&mut self, bits: FlagSet) {
        for flag in ARITH_FLAGS.iter().filter(|f| bits.contains(**f)) {
            let value = self.lazy.resolve(*flag);
            self.write_raw(flag.eflags_mask(), value);
        }
        self.dirty.remove(bits);
    }

    /// The full EFLAGS word, materialising stale bits.
    pub fn eflags(&mut self) -> u32 {
        self.materialize();
        self.raw
    }

    /// The full EFLAGS word without touching the cached state.
    pub fn peek_eflags(&self) -> u32 {
        let mask = self.dirty.eflags_mask();
        (self.raw & !mask) | self.lazy.resolve_bits(self.dirty)
    }

    /// Overwrite EFLAGS entirely. Reserved bits are forced to their fixed values.
    pub fn set_eflags(&mut self, value: u32) {
        self.raw = (value & !FLAG_ZERO_BITS) | FLAG_RESERVED1;
        self.dirty = FlagSet::empty();
    }

    fn write_raw(&mut self, bit: u32, value: bool) {
        if value {
            self.raw |= bit;
        } else {
            self.raw &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add8(a: u32, b: u32) -> LazyFlags {
        LazyFlags::new(FlagOp::Add, Width::W8, a, b, (a + b) & 0xFF)
    }

    #[test]
    fn add_carry_overflow_and_aux() {
        let f = add8(0xFF, 0x01);
        assert!(f.resolve(FlagSet::CF));
        assert!(f.resolve(FlagSet::ZF));
        assert!(f.resolve(FlagSet::AF));
        assert!(!f.resolve(FlagSet::OF));

        let f = add8(0x7F, 0x01);
        assert!(!f.resolve(FlagSet::CF));
        assert!(f.resolve(FlagSet::OF));
        assert!(f.resolve(FlagSet::SF));
    }

    #[test]
    fn adc_with_full_operand_and_carry_in_wraps() {
        // 5 + 0xFF + 1 = 5 with carry out.
        let f = LazyFlags::new(FlagOp::Adc, Width::W8, 5, 0xFF, 5);
        assert!(f.resolve(FlagSet::CF));
        // 5 + 0xFF + 0 = 4 with carry out.
        let f = LazyFlags::new(FlagOp::Adc, Width::W8, 5, 0xFF, 4);
        assert!(f.resolve(FlagSet::CF));
        // 1 + 1 + 1 = 3, no carry.
        let f = LazyFlags::new(FlagOp::Adc, Width::W8, 1, 1, 3);
        assert!(!f.resolve(FlagSet::CF));
    }

    #[test]
    fn sbb_borrow_in_is_recovered() {
        // 0 - 0xFF - 1 = 0 with borrow.
        let f = LazyFlags::new(FlagOp::Sbb, Width::W8, 0, 0xFF, 0);
        assert!(f.resolve(FlagSet::CF));
        assert!(f.resolve(FlagSet::ZF));
        let f = LazyFlags::new(FlagOp::Sbb, Width::W16, 5, 3, 1);
        assert!(!f.resolve(FlagSet::CF));
    }

    #[test]
    fn shift_carry_is_last_bit_out() {
        // shl al, 1 with 0x80
        let f = LazyFlags::new(FlagOp::Shl, Width::W8, 0x80, 1, 0);
        assert!(f.resolve(FlagSet::CF));
        assert!(f.resolve(FlagSet::OF));
        // shr eax, 4 with 0x18
        let f = LazyFlags::new(FlagOp::Shr, Width::W32, 0x18, 4, 1);
        assert!(f.resolve(FlagSet::CF));
        // sar al, 7 with 0x80 shifts sign copies out.
        let f = LazyFlags::new(FlagOp::Sar, Width::W8, 0x80, 7, 0xFF);
        assert!(f.resolve(FlagSet::CF));
        assert!(!f.resolve(FlagSet::OF));
    }

    #[test]
    fn inc_preserves_previous_carry() {
        let mut flags = FlagState::default();
        flags.stage(add8(0xFF, 1), FlagSet::ARITH);
        // inc al from 0x00
        flags.stage(add8(0, 1), FlagSet::OSZAP);
        assert!(flags.get(FlagSet::CF), "CF from the add survives inc");
        assert!(!flags.get(FlagSet::ZF));
    }

    #[test]
    fn get_caches_and_clears_dirty_bit() {
        let mut flags = FlagState::default();
        flags.stage(add8(1, 1), FlagSet::ARITH);
        assert!(!flags.get(FlagSet::ZF));
        assert!(!flags.dirty.contains(FlagSet::ZF));
        assert!(flags.dirty.contains(FlagSet::CF));
        flags.set(FlagSet::CF, true);
        assert!(flags.get(FlagSet::CF));
        let mut copy = flags;
        assert_eq!(flags.peek_eflags(), copy.eflags());
    }

    #[test]
    fn set_eflags_forces_reserved_bits() {
        let mut flags = FlagState::default();
        flags.set_eflags(0xFFFF_FFFF);
        let v = flags.eflags();
        assert_eq!(v & 0x2, 0x2);
        assert_eq!(v & (1 << 3), 0);
        assert_eq!(v & (1 << 15), 0);
        assert_eq!(v & (1 << 22), 0);
    }

    #[test]
    fn flag_op_codes_round_trip() {
        for code in 0..=10 {
            assert_eq!(FlagOp::from_code(code).map(FlagOp::code), Some(code));
        }
        assert_eq!(FlagOp::from_code(11), None);
    }
}
