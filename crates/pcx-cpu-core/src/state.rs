use pcx_x86::inst::gpr::{ESP, ECX};
use pcx_x86::{CodeSize, FlagSet, SegReg, Width};

use crate::exception::{Exception, PendingFault};
use crate::flags::{FlagState, FLAG_IF, FLAG_VM};

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;

/// Descriptor access byte bits, as cached in [`SegmentCache::access`].
pub const ACCESS_ACCESSED: u8 = 1 << 0;
/// Readable for code segments, writable for data segments.
pub const ACCESS_RW: u8 = 1 << 1;
pub const ACCESS_EXEC: u8 = 1 << 3;
pub const ACCESS_S: u8 = 1 << 4;
pub const ACCESS_PRESENT: u8 = 1 << 7;

/// Operating mode, derived from CR0.PE and EFLAGS.VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
}

/// Hidden part of a segment register, loaded from a descriptor (or synthesised from the
/// selector in real and virtual-8086 mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentCache {
    pub base: u32,
    /// Byte-granular limit (the G bit has already been applied).
    pub limit: u32,
    pub access: u8,
    /// D/B bit: 32-bit default operand size for code, 32-bit stack pointer for stacks.
    pub big: bool,
}

impl SegmentCache {
    /// Present, writable, accessed data segment used outside protected mode.
    pub const REAL_DATA_ACCESS: u8 = ACCESS_PRESENT | ACCESS_S | ACCESS_RW | ACCESS_ACCESSED;

    pub fn real(selector: u16) -> Self {
        Self {
            base: u32::from(selector) << 4,
            limit: 0xFFFF,
            access: Self::REAL_DATA_ACCESS,
            big: false,
        }
    }

    pub fn flat_code32() -> Self {
        Self {
            base: 0,
            limit: u32::MAX,
            access: ACCESS_PRESENT | ACCESS_S | ACCESS_EXEC | ACCESS_RW | ACCESS_ACCESSED,
            big: true,
        }
    }

    pub fn flat_data32() -> Self {
        Self {
            base: 0,
            limit: u32::MAX,
            access: Self::REAL_DATA_ACCESS,
            big: true,
        }
    }

    pub fn present(&self) -> bool {
        self.access & ACCESS_PRESENT != 0
    }

    pub fn is_code(&self) -> bool {
        self.access & ACCESS_EXEC != 0
    }

    pub fn writable(&self) -> bool {
        !self.is_code() && self.access & ACCESS_RW != 0
    }

    pub fn readable(&self) -> bool {
        !self.is_code() || self.access & ACCESS_RW != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub selector: u16,
    pub cache: SegmentCache,
}

impl Segment {
    pub fn real(selector: u16) -> Self {
        Self {
            selector,
            cache: SegmentCache::real(selector),
        }
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

pub const FPU_DEFAULT_CONTROL: u16 = 0x037F;
pub const FPU_TAG_EMPTY: u16 = 0xFFFF;

/// x87 register stack. Values are held as `f64`; the 80-bit extended format is not modelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpuState {
    pub st: [f64; 8],
    pub top: u8,
    pub control: u16,
    /// Status word without the TOP field, which lives in `top`.
    pub status: u16,
    /// Two bits per physical register, `11` = empty.
    pub tag: u16,
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            st: [0.0; 8],
            top: 0,
            control: FPU_DEFAULT_CONTROL,
            status: 0,
            tag: FPU_TAG_EMPTY,
        }
    }
}

/// Architectural state of one 32-bit x86 processor.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub flags: FlagState,
    pub segments: [Segment; 6],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    /// CR0..CR4 (CR1 is reserved and always reads zero).
    pub cr: [u32; 5],
    pub dr: [u32; 8],
    pub fpu: FpuState,
    pub halted: bool,
    pending_fault: Option<PendingFault>,
    pending_irq: Option<u8>,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    /// Real-mode state with all segments at zero.
    pub fn new() -> Self {
        Self {
            gpr: [0; 8],
            eip: 0,
            flags: FlagState::default(),
            segments: [Segment::real(0); 6],
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3FF,
            },
            cr: [CR0_ET, 0, 0, 0, 0],
            dr: [0; 8],
            fpu: FpuState::default(),
            halted: false,
            pending_fault: None,
            pending_irq: None,
        }
    }

    /// Protected mode with flat 4 GiB code and data segments, as left behind by a typical
    /// bootloader.
    pub fn flat32() -> Self {
        let mut cpu = Self::new();
        cpu.cr[0] |= CR0_PE;
        for seg in SegReg::ALL {
            let (selector, cache) = if seg == SegReg::Cs {
                (0x08, SegmentCache::flat_code32())
            } else {
                (0x10, SegmentCache::flat_data32())
            };
            cpu.segments[seg.index()] = Segment { selector, cache };
        }
        cpu
    }

    pub fn mode(&self) -> CpuMode {
        if self.cr[0] & CR0_PE == 0 {
            CpuMode::Real
        } else if self.flags.bit(FLAG_VM) {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    /// Default operand size of the current code segment.
    pub fn code_size(&self) -> CodeSize {
        CodeSize::from_big(self.mode() == CpuMode::Protected && self.seg(SegReg::Cs).cache.big)
    }

    pub fn seg(&self, seg: SegReg) -> &Segment {
        &self.segments[seg.index()]
    }

    pub fn seg_mut(&mut self, seg: SegReg) -> &mut Segment {
        &mut self.segments[seg.index()]
    }

    /// `cs.base + eip`.
    pub fn linear_ip(&self) -> u32 {
        self.seg(SegReg::Cs).cache.base.wrapping_add(self.eip)
    }

    /// Read a register of the given width. Byte registers 4..8 are AH/CH/DH/BH.
    pub fn read_gpr(&self, index: u8, width: Width) -> u32 {
        let i = usize::from(index & 7);
        match width {
            Width::W8 if i >= 4 => (self.gpr[i - 4] >> 8) & 0xFF,
            Width::W8 => self.gpr[i] & 0xFF,
            Width::W16 => self.gpr[i] & 0xFFFF,
            Width::W32 => self.gpr[i],
        }
    }

    /// Write a register of the given width, leaving the untouched bytes intact.
    pub fn write_gpr(&mut self, index: u8, width: Width, value: u32) {
        let i = usize::from(index & 7);
        match width {
            Width::W8 if i >= 4 => {
                let r = &mut self.gpr[i - 4];
                *r = (*r & !0xFF00) | ((value & 0xFF) << 8);
            }
            Width::W8 => {
                let r = &mut self.gpr[i];
                *r = (*r & !0xFF) | (value & 0xFF);
            }
            Width::W16 => {
                let r = &mut self.gpr[i];
                *r = (*r & !0xFFFF) | (value & 0xFFFF);
            }
            Width::W32 => self.gpr[i] = value,
        }
    }

    pub fn stack_mask(&self) -> u32 {
        if self.seg(SegReg::Ss).cache.big {
            u32::MAX
        } else {
            0xFFFF
        }
    }

    pub fn sp(&self) -> u32 {
        self.gpr[usize::from(ESP)] & self.stack_mask()
    }

    /// Update the stack pointer; with a 16-bit stack only SP changes.
    pub fn set_sp(&mut self, value: u32) {
        let mask = self.stack_mask();
        let r = &mut self.gpr[usize::from(ESP)];
        *r = (*r & !mask) | (value & mask);
    }

    /// CX or ECX, depending on the address size.
    pub fn count_reg(&self, addr32: bool) -> u32 {
        self.read_gpr(ECX, if addr32 { Width::W32 } else { Width::W16 })
    }

    pub fn set_count_reg(&mut self, addr32: bool, value: u32) {
        self.write_gpr(ECX, if addr32 { Width::W32 } else { Width::W16 }, value);
    }

    pub fn eflags(&mut self) -> u32 {
        self.flags.eflags()
    }

    pub fn set_eflags(&mut self, value: u32) {
        self.flags.set_eflags(value);
    }

    pub fn get_flag(&mut self, flag: FlagSet) -> bool {
        self.flags.get(flag)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.flags.bit(FLAG_IF)
    }

    /// Record a fault for the dispatcher. A second fault before delivery replaces the first.
    pub fn raise(&mut self, exception: Exception, eip: u32) {
        self.pending_fault = Some(PendingFault { exception, eip });
    }

    pub fn pending_fault(&self) -> Option<&PendingFault> {
        self.pending_fault.as_ref()
    }

    pub fn take_pending_fault(&mut self) -> Option<PendingFault> {
        self.pending_fault.take()
    }

    /// Latch an external interrupt vector; delivered at the next block boundary with IF set.
    pub fn assert_irq(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    pub fn pending_irq(&self) -> Option<u8> {
        self.pending_irq
    }

    pub fn take_irq(&mut self) -> Option<u8> {
        self.pending_irq.take()
    }
}
