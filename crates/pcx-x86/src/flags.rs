use bitflags::bitflags;

bitflags! {
    /// The six arithmetic status flags, using their EFLAGS bit positions.
    ///
    /// Used both as the CPU's "stale bits" mask and as per-instruction read/write sets for flag
    /// liveness analysis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlagSet: u16 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const OF = 1 << 11;

        const ARITH = Self::CF.bits()
            | Self::PF.bits()
            | Self::AF.bits()
            | Self::ZF.bits()
            | Self::SF.bits()
            | Self::OF.bits();
        /// Everything `inc`/`dec` define (all but CF).
        const OSZAP = Self::ARITH.bits() & !Self::CF.bits();
        /// The flags `lahf`/`sahf` move through AH.
        const SZAPC = Self::ARITH.bits() & !Self::OF.bits();
    }
}

impl FlagSet {
    /// The EFLAGS bits covered by this set.
    pub fn eflags_mask(self) -> u32 {
        u32::from(self.bits())
    }
}
