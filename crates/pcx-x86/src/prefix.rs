use bitflags::bitflags;

use crate::inst::SegReg;
use crate::{ByteSource, DecodeError, MAX_INST_LEN};

bitflags! {
    /// Legacy prefixes seen before the opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prefixes: u16 {
        const OPSIZE = 1 << 0;
        const ADDRSIZE = 1 << 1;
        const LOCK = 1 << 2;
        const REP = 1 << 3;
        const REPNE = 1 << 4;
        const SEG_ES = 1 << 5;
        const SEG_CS = 1 << 6;
        const SEG_SS = 1 << 7;
        const SEG_DS = 1 << 8;
        const SEG_FS = 1 << 9;
        const SEG_GS = 1 << 10;

        const SEGMENTS = Self::SEG_ES.bits()
            | Self::SEG_CS.bits()
            | Self::SEG_SS.bits()
            | Self::SEG_DS.bits()
            | Self::SEG_FS.bits()
            | Self::SEG_GS.bits();
        const REPEATS = Self::REP.bits() | Self::REPNE.bits();
    }
}

impl Prefixes {
    /// Segment override, if any.
    pub fn segment(self) -> Option<SegReg> {
        const ORDER: [(Prefixes, SegReg); 6] = [
            (Prefixes::SEG_ES, SegReg::Es),
            (Prefixes::SEG_CS, SegReg::Cs),
            (Prefixes::SEG_SS, SegReg::Ss),
            (Prefixes::SEG_DS, SegReg::Ds),
            (Prefixes::SEG_FS, SegReg::Fs),
            (Prefixes::SEG_GS, SegReg::Gs),
        ];
        ORDER
            .iter()
            .find(|(bit, _)| self.contains(*bit))
            .map(|(_, seg)| *seg)
    }

    fn for_segment(seg: SegReg) -> Prefixes {
        match seg {
            SegReg::Es => Prefixes::SEG_ES,
            SegReg::Cs => Prefixes::SEG_CS,
            SegReg::Ss => Prefixes::SEG_SS,
            SegReg::Ds => Prefixes::SEG_DS,
            SegReg::Fs => Prefixes::SEG_FS,
            SegReg::Gs => Prefixes::SEG_GS,
        }
    }
}

/// Result of prefix scanning: the accumulated prefixes, the first non-prefix byte, and the number
/// of bytes consumed including that byte.
pub(crate) struct Scanned {
    pub prefixes: Prefixes,
    pub opcode: u8,
    pub consumed: usize,
}

/// Consume legacy prefixes up to and including the first opcode byte.
///
/// Within a group (segment, repeat) the last prefix wins, matching hardware.
pub(crate) fn scan_prefixes(
    src: &mut dyn ByteSource,
    raw: &mut Vec<u8>,
) -> Result<Scanned, DecodeError> {
    let mut prefixes = Prefixes::empty();
    loop {
        if raw.len() >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = src.next_u8()?;
        raw.push(b);
        match b {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {
                let seg = match b {
                    0x26 => SegReg::Es,
                    0x2E => SegReg::Cs,
                    0x36 => SegReg::Ss,
                    0x3E => SegReg::Ds,
                    0x64 => SegReg::Fs,
                    _ => SegReg::Gs,
                };
                prefixes.remove(Prefixes::SEGMENTS);
                prefixes.insert(Prefixes::for_segment(seg));
            }
            0x66 => prefixes.insert(Prefixes::OPSIZE),
            0x67 => prefixes.insert(Prefixes::ADDRSIZE),
            0xF0 => prefixes.insert(Prefixes::LOCK),
            0xF2 => {
                prefixes.remove(Prefixes::REPEATS);
                prefixes.insert(Prefixes::REPNE);
            }
            0xF3 => {
                prefixes.remove(Prefixes::REPEATS);
                prefixes.insert(Prefixes::REP);
            }
            _ => {
                return Ok(Scanned {
                    prefixes,
                    opcode: b,
                    consumed: raw.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SliceCursor;

    #[test]
    fn last_segment_override_wins() {
        let mut raw = Vec::new();
        let mut c = SliceCursor::new(&[0x26, 0x64, 0x8B, 0x00]);
        let s = scan_prefixes(&mut c, &mut raw).unwrap();
        assert_eq!(s.prefixes.segment(), Some(SegReg::Fs));
        assert_eq!(s.opcode, 0x8B);
        assert_eq!(s.consumed, 3);
    }

    #[test]
    fn repne_then_rep_keeps_rep() {
        let mut raw = Vec::new();
        let mut c = SliceCursor::new(&[0xF2, 0xF3, 0xA4]);
        let s = scan_prefixes(&mut c, &mut raw).unwrap();
        assert!(s.prefixes.contains(Prefixes::REP));
        assert!(!s.prefixes.contains(Prefixes::REPNE));
    }

    #[test]
    fn fifteen_prefixes_is_too_long() {
        let bytes = [0x66u8; 16];
        let mut raw = Vec::new();
        let mut c = SliceCursor::new(&bytes);
        assert!(matches!(
            scan_prefixes(&mut c, &mut raw),
            Err(DecodeError::TooLong)
        ));
    }
}
