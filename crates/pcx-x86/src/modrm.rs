use crate::inst::gpr::{EBP, EBX, EDI, ESI, ESP};
use crate::inst::{Operand, Pointer, SegReg};
use crate::table::DecodeCtx;
use crate::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ModRm {
    pub mod_bits: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(b: u8) -> Self {
        Self {
            mod_bits: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }

    pub fn is_reg(self) -> bool {
        self.mod_bits == 3
    }
}

impl DecodeCtx<'_> {
    /// The r/m side of a ModRM byte as an operand.
    pub(crate) fn rm_operand(&mut self, m: ModRm) -> Result<Operand, DecodeError> {
        if m.is_reg() {
            Ok(Operand::Reg(m.rm))
        } else {
            Ok(Operand::Mem(self.pointer(m)?))
        }
    }

    /// Decode the memory form of a ModRM byte (plus SIB and displacement) into a [`Pointer`].
    pub(crate) fn pointer(&mut self, m: ModRm) -> Result<Pointer, DecodeError> {
        debug_assert!(!m.is_reg());
        if self.addr32 {
            self.pointer32(m)
        } else {
            self.pointer16(m)
        }
    }

    fn pointer16(&mut self, m: ModRm) -> Result<Pointer, DecodeError> {
        let (base, index) = match m.rm {
            0 => (Some(EBX), Some(ESI)),
            1 => (Some(EBX), Some(EDI)),
            2 => (Some(EBP), Some(ESI)),
            3 => (Some(EBP), Some(EDI)),
            4 => (Some(ESI), None),
            5 => (Some(EDI), None),
            6 if m.mod_bits == 0 => (None, None),
            6 => (Some(EBP), None),
            _ => (Some(EBX), None),
        };
        let disp = match (m.mod_bits, base) {
            (0, None) => i32::from(self.read_u16()? as i16),
            (0, _) => 0,
            (1, _) => i32::from(self.read_u8()? as i8),
            _ => i32::from(self.read_u16()? as i16),
        };
        let default = if base == Some(EBP) {
            SegReg::Ss
        } else {
            SegReg::Ds
        };
        Ok(Pointer {
            base,
            index,
            scale: if index.is_some() { 1 } else { 0 },
            disp,
            segment: self.segment_or(default),
            addr32: false,
        })
    }

    fn pointer32(&mut self, m: ModRm) -> Result<Pointer, DecodeError> {
        let mut base = Some(m.rm);
        let mut index = None;
        let mut scale = 0;
        if m.rm == ESP {
            let sib = self.read_u8()?;
            let ss = sib >> 6;
            let idx = (sib >> 3) & 7;
            let b = sib & 7;
            if idx != ESP {
                index = Some(idx);
                scale = 1 << ss;
            }
            base = if b == EBP && m.mod_bits == 0 {
                None
            } else {
                Some(b)
            };
        } else if m.rm == EBP && m.mod_bits == 0 {
            base = None;
        }
        let disp = match (m.mod_bits, base) {
            (0, None) => self.read_u32()? as i32,
            (0, _) => 0,
            (1, _) => i32::from(self.read_u8()? as i8),
            _ => self.read_u32()? as i32,
        };
        let default = match base {
            Some(ESP) | Some(EBP) => SegReg::Ss,
            _ => SegReg::Ds,
        };
        Ok(Pointer {
            base,
            index,
            scale,
            disp,
            segment: self.segment_or(default),
            addr32: true,
        })
    }
}
