//! Segment-relative address resolution.
//!
//! A [`Pointer`] captured at decode time is turned into a linear address here, on every
//! execution, from the live register file and segment caches.

use pcx_x86::{Pointer, SegReg};

use crate::exception::Exception;
use crate::state::{CpuMode, CpuState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl CpuState {
    /// Translate `len` bytes at `seg:offset` to a linear address, checking the segment's
    /// presence, type and limit. Violations on SS raise #SS(0), everything else #GP(0).
    pub fn translate(
        &self,
        seg: SegReg,
        offset: u32,
        len: u32,
        access: Access,
    ) -> Result<u32, Exception> {
        let cache = &self.seg(seg).cache;
        let fault = if seg == SegReg::Ss {
            Exception::StackFault(0)
        } else {
            Exception::GeneralProtection(0)
        };
        if self.mode() == CpuMode::Protected {
            if !cache.present() {
                return Err(fault);
            }
            let allowed = match access {
                Access::Read => cache.readable(),
                Access::Write => cache.writable(),
                Access::Execute => cache.is_code(),
            };
            if !allowed {
                return Err(fault);
            }
        }
        let last = u64::from(offset) + u64::from(len.max(1)) - 1;
        if last > u64::from(cache.limit) {
            return Err(fault);
        }
        Ok(cache.base.wrapping_add(offset))
    }

    /// Linear address of a memory operand.
    pub fn linear(&self, ptr: &Pointer, len: u32, access: Access) -> Result<u32, Exception> {
        self.linear_displaced(ptr, 0, len, access)
    }

    /// Like [`CpuState::linear`] with an extra byte displacement applied before the address-size
    /// wrap (used for bit-string operands and multi-part loads like `lgdt`).
    pub fn linear_displaced(
        &self,
        ptr: &Pointer,
        extra: i32,
        len: u32,
        access: Access,
    ) -> Result<u32, Exception> {
        let mut ea = ptr.effective_address(&self.gpr).wrapping_add(extra as u32);
        if !ptr.addr32 {
            ea &= 0xFFFF;
        }
        self.translate(ptr.segment, ea, len, access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SegmentCache;
    use pcx_x86::inst::gpr::EBX;

    fn ptr16(disp: i32) -> Pointer {
        Pointer {
            base: Some(EBX),
            index: None,
            scale: 0,
            disp,
            segment: SegReg::Ds,
            addr32: false,
        }
    }

    #[test]
    fn real_mode_adds_shifted_selector() {
        let mut cpu = CpuState::new();
        *cpu.seg_mut(SegReg::Ds) = crate::state::Segment::real(0x1000);
        cpu.gpr[usize::from(EBX)] = 0x20;
        assert_eq!(cpu.linear(&ptr16(4), 2, Access::Read), Ok(0x10024));
    }

    #[test]
    fn sixteen_bit_offsets_wrap_inside_the_segment() {
        let cpu = CpuState::new();
        let p = ptr16(-2);
        // bx = 0: offset wraps to 0xFFFE.
        assert_eq!(cpu.linear(&p, 2, Access::Read), Ok(0xFFFE));
        // A word at 0xFFFF crosses the 64K limit.
        assert_eq!(
            cpu.linear(&ptr16(-1), 2, Access::Read),
            Err(Exception::GeneralProtection(0))
        );
    }

    #[test]
    fn protected_mode_checks_type_and_limit() {
        let mut cpu = CpuState::flat32();
        cpu.seg_mut(SegReg::Ds).cache.limit = 0xFFF;
        assert!(cpu.translate(SegReg::Ds, 0xFFC, 4, Access::Write).is_ok());
        assert_eq!(
            cpu.translate(SegReg::Ds, 0xFFD, 4, Access::Write),
            Err(Exception::GeneralProtection(0))
        );
        // Code segments are never writable.
        assert_eq!(
            cpu.translate(SegReg::Cs, 0, 1, Access::Write),
            Err(Exception::GeneralProtection(0))
        );
        cpu.seg_mut(SegReg::Ss).cache = SegmentCache {
            limit: 0xF,
            ..SegmentCache::flat_data32()
        };
        assert_eq!(
            cpu.translate(SegReg::Ss, 0x10, 1, Access::Read),
            Err(Exception::StackFault(0))
        );
    }

    #[test]
    fn unusable_segment_faults_in_protected_mode() {
        let mut cpu = CpuState::flat32();
        cpu.seg_mut(SegReg::Es).cache.access = 0;
        assert_eq!(
            cpu.translate(SegReg::Es, 0, 1, Access::Read),
            Err(Exception::GeneralProtection(0))
        );
    }
}
