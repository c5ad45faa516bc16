//! Segment register loads and GDT descriptor parsing.

use pcx_x86::SegReg;
use tracing::trace;

use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, Segment, SegmentCache, ACCESS_PRESENT, ACCESS_S};

const SELECTOR_TI: u16 = 1 << 2;

/// Decode an 8-byte segment descriptor into its cached form.
pub fn parse_descriptor(raw: u64) -> SegmentCache {
    let limit_lo = (raw & 0xFFFF) as u32;
    let base_lo = ((raw >> 16) & 0xFF_FFFF) as u32;
    let access = (raw >> 40) as u8;
    let flags = (raw >> 52) as u8 & 0xF;
    let limit_hi = ((raw >> 48) & 0xF) as u32;
    let base_hi = ((raw >> 56) & 0xFF) as u32;

    let mut limit = limit_lo | (limit_hi << 16);
    if flags & 0x8 != 0 {
        limit = (limit << 12) | 0xFFF;
    }
    SegmentCache {
        base: base_lo | (base_hi << 24),
        limit,
        access,
        big: flags & 0x4 != 0,
    }
}

impl CpuState {
    /// Fetch the GDT descriptor named by `selector`.
    pub fn read_descriptor(
        &self,
        bus: &mut dyn CpuBus,
        selector: u16,
    ) -> Result<SegmentCache, Exception> {
        let code = selector & !3;
        // Local descriptor tables are not supported.
        if selector & SELECTOR_TI != 0 {
            return Err(Exception::GeneralProtection(code));
        }
        let offset = u32::from(selector & !7);
        if offset + 7 > u32::from(self.gdtr.limit) {
            return Err(Exception::GeneralProtection(code));
        }
        let raw = bus.read_u64(self.gdtr.base.wrapping_add(offset))?;
        Ok(parse_descriptor(raw))
    }

    /// Load a segment register the way `mov sreg`, `pop sreg` and far transfers do.
    ///
    /// In protected mode a null selector is accepted for data segments (leaving them unusable)
    /// and rejected for CS and SS.
    pub fn load_segment(
        &mut self,
        bus: &mut dyn CpuBus,
        seg: SegReg,
        selector: u16,
    ) -> Result<(), Exception> {
        if self.mode() != CpuMode::Protected {
            *self.seg_mut(seg) = Segment::real(selector);
            return Ok(());
        }

        let code = selector & !3;
        if code == 0 {
            if matches!(seg, SegReg::Cs | SegReg::Ss) {
                return Err(Exception::GeneralProtection(0));
            }
            *self.seg_mut(seg) = Segment {
                selector,
                cache: SegmentCache::default(),
            };
            return Ok(());
        }

        let cache = self.read_descriptor(bus, selector)?;
        if cache.access & ACCESS_S == 0 {
            return Err(Exception::GeneralProtection(code));
        }
        let type_ok = match seg {
            SegReg::Cs => cache.is_code(),
            SegReg::Ss => cache.writable(),
            _ => cache.readable(),
        };
        if !type_ok {
            return Err(Exception::GeneralProtection(code));
        }
        if cache.access & ACCESS_PRESENT == 0 {
            return Err(if seg == SegReg::Ss {
                Exception::StackFault(code)
            } else {
                Exception::SegmentNotPresent(code)
            });
        }

        trace!(?seg, selector, base = cache.base, limit = cache.limit, "segment load");
        *self.seg_mut(seg) = Segment { selector, cache };
        Ok(())
    }
}
