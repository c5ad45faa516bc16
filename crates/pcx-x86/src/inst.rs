//! Decoded instruction model.

use crate::{FlagSet, Prefixes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub const fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }

    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    pub const fn truncate(self, v: u32) -> u32 {
        v & self.mask()
    }

    /// Sign-extend the low `bits()` of `v` to 32 bits.
    pub const fn sign_extend(self, v: u32) -> u32 {
        match self {
            Width::W8 => v as u8 as i8 as i32 as u32,
            Width::W16 => v as u16 as i16 as i32 as u32,
            Width::W32 => v,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Width> {
        match bits {
            8 => Some(Width::W8),
            16 => Some(Width::W16),
            32 => Some(Width::W32),
            _ => None,
        }
    }
}

/// Default operand/address size of the code segment being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSize {
    Bits16,
    Bits32,
}

impl CodeSize {
    pub fn from_big(big: bool) -> Self {
        if big {
            CodeSize::Bits32
        } else {
            CodeSize::Bits16
        }
    }

    pub fn ip_mask(self) -> u32 {
        match self {
            CodeSize::Bits16 => 0xFFFF,
            CodeSize::Bits32 => 0xFFFF_FFFF,
        }
    }

    pub fn bitness(self) -> u32 {
        match self {
            CodeSize::Bits16 => 16,
            CodeSize::Bits32 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u8) -> Option<SegReg> {
        SegReg::ALL.get(usize::from(i)).copied()
    }
}

/// General-purpose register numbering used throughout (the ModRM encoding order).
pub mod gpr {
    pub const EAX: u8 = 0;
    pub const ECX: u8 = 1;
    pub const EDX: u8 = 2;
    pub const EBX: u8 = 3;
    pub const ESP: u8 = 4;
    pub const EBP: u8 = 5;
    pub const ESI: u8 = 6;
    pub const EDI: u8 = 7;
}

/// Memory operand addressing parameters, fixed at decode time.
///
/// The effective address is recomputed from the live register file on every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub base: Option<u8>,
    pub index: Option<u8>,
    /// 0 when there is no index register, otherwise 1, 2, 4 or 8.
    pub scale: u8,
    pub disp: i32,
    pub segment: SegReg,
    pub addr32: bool,
}

impl Pointer {
    /// `disp + base + scale * index`, truncated to the address size.
    pub fn effective_address(&self, gpr: &[u32; 8]) -> u32 {
        let mut ea = self.disp as u32;
        if let Some(base) = self.base {
            ea = ea.wrapping_add(gpr[usize::from(base)]);
        }
        if let Some(index) = self.index {
            ea = ea.wrapping_add(gpr[usize::from(index)].wrapping_mul(u32::from(self.scale)));
        }
        if self.addr32 {
            ea
        } else {
            ea & 0xFFFF
        }
    }

    /// Absolute `[moffs]` style operand.
    pub fn absolute(offset: u32, segment: SegReg, addr32: bool) -> Self {
        Self {
            base: None,
            index: None,
            scale: 0,
            disp: offset as i32,
            segment,
            addr32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Register index 0..8. For byte operands, 4..8 select AH/CH/DH/BH.
    Reg(u8),
    Mem(Pointer),
    /// Already sign-extended to the operation width and truncated to it.
    Imm(u32),
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Decode from the 3-bit group index (opcode bits 5:3 or ModRM.reg).
    pub fn from_index(i: u8) -> AluOp {
        match i & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sal,
    Sar,
}

impl ShiftOp {
    pub fn from_index(i: u8) -> ShiftOp {
        match i & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            6 => ShiftOp::Sal,
            _ => ShiftOp::Sar,
        }
    }

    pub fn is_rotate(self) -> bool {
        matches!(
            self,
            ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr
        )
    }

    pub fn through_carry(self) -> bool {
        matches!(self, ShiftOp::Rcl | ShiftOp::Rcr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftCount {
    One,
    Imm(u8),
    Cl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulDivOp {
    Mul,
    Imul,
    Div,
    Idiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

/// Condition codes in encoding order (`opcode & 0xF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub fn from_nibble(n: u8) -> Cond {
        const ALL: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ];
        ALL[usize::from(n & 0xF)]
    }

    /// Flags the condition depends on.
    pub fn reads(self) -> FlagSet {
        match self {
            Cond::O | Cond::No => FlagSet::OF,
            Cond::B | Cond::Ae => FlagSet::CF,
            Cond::E | Cond::Ne => FlagSet::ZF,
            Cond::Be | Cond::A => FlagSet::CF | FlagSet::ZF,
            Cond::S | Cond::Ns => FlagSet::SF,
            Cond::P | Cond::Np => FlagSet::PF,
            Cond::L | Cond::Ge => FlagSet::SF | FlagSet::OF,
            Cond::Le | Cond::G => FlagSet::ZF | FlagSet::SF | FlagSet::OF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Loop,
    Loope,
    Loopne,
    Jcxz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rep {
    None,
    /// `F3`: `rep` for movs/stos/lods, `repe` for cmps/scas.
    Repe,
    /// `F2`.
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagCtl {
    Clc,
    Stc,
    Cmc,
    Cli,
    Sti,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortArg {
    Imm(u8),
    Dx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlReg {
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

impl ControlReg {
    pub fn from_index(i: u8) -> Option<ControlReg> {
        match i {
            0 => Some(ControlReg::Cr0),
            2 => Some(ControlReg::Cr2),
            3 => Some(ControlReg::Cr3),
            4 => Some(ControlReg::Cr4),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            ControlReg::Cr0 => 0,
            ControlReg::Cr2 => 2,
            ControlReg::Cr3 => 3,
            ControlReg::Cr4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuArith {
    Add,
    Mul,
    Sub,
    Subr,
    Div,
    Divr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuSrc {
    M32(Pointer),
    M64(Pointer),
    St(u8),
}

impl FpuSrc {
    fn is_mem(&self) -> bool {
        !matches!(self, FpuSrc::St(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuOp {
    Load(FpuSrc),
    LoadOne,
    LoadZero,
    /// `fst`/`fstp`; the destination is never a 32-bit register.
    Store { dst: FpuSrc, pop: bool },
    Xch(u8),
    /// `st(dst) = st(dst) <op> src`.
    Arith {
        op: FpuArith,
        dst: u8,
        src: FpuSrc,
        pop: bool,
    },
    Compare { src: FpuSrc, pop: bool },
    StswAx,
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Mov { dst: Operand, src: Operand, width: Width },
    Alu { op: AluOp, dst: Operand, src: Operand, width: Width },
    Test { lhs: Operand, rhs: Operand, width: Width },
    Inc { dst: Operand, width: Width },
    Dec { dst: Operand, width: Width },
    Not { dst: Operand, width: Width },
    Neg { dst: Operand, width: Width },
    Shift { op: ShiftOp, dst: Operand, count: ShiftCount, width: Width },
    /// `shld`/`shrd`; `src` is a register index.
    DoubleShift { left: bool, dst: Operand, src: u8, count: ShiftCount, width: Width },
    /// One-operand group 3 form operating on the accumulator.
    MulDiv { op: MulDivOp, src: Operand, width: Width },
    /// Two- and three-operand signed multiply into a register.
    Imul { dst: u8, src: Operand, imm: Option<u32>, width: Width },
    Bit { op: BitOp, base: Operand, bit: Operand, width: Width },
    Movx { dst: u8, src: Operand, src_width: Width, width: Width, signed: bool },
    Lea { dst: u8, ptr: Pointer, width: Width },
    Xchg { a: Operand, b: Operand, width: Width },
    Push { src: Operand, width: Width },
    Pop { dst: Operand, width: Width },
    PushSeg { seg: SegReg, width: Width },
    PopSeg { seg: SegReg, width: Width },
    MovToSeg { seg: SegReg, src: Operand },
    MovFromSeg { dst: Operand, seg: SegReg, width: Width },
    Pusha { width: Width },
    Popa { width: Width },
    Pushf { width: Width },
    Popf { width: Width },
    Lahf,
    Sahf,
    /// `cbw` (W16) / `cwde` (W32).
    Cbw { width: Width },
    /// `cwd` (W16) / `cdq` (W32).
    Cwd { width: Width },
    FlagCtl(FlagCtl),
    Jcc { cond: Cond, rel: i32, width: Width },
    Jmp { rel: i32, width: Width },
    JmpIndirect { target: Operand, width: Width },
    JmpFar { selector: u16, offset: u32, width: Width },
    Call { rel: i32, width: Width },
    CallIndirect { target: Operand, width: Width },
    Ret { pop: u16, width: Width },
    Loop { kind: LoopKind, rel: i32, width: Width, addr32: bool },
    Setcc { cond: Cond, dst: Operand },
    Enter { frame: u16, nesting: u8, width: Width },
    Leave { width: Width },
    In { port: PortArg, width: Width },
    Out { port: PortArg, width: Width },
    String { op: StringOp, width: Width, rep: Rep, segment: SegReg, addr32: bool },
    MovToCr { cr: ControlReg, src: u8 },
    MovFromCr { dst: u8, cr: ControlReg },
    Lgdt { ptr: Pointer, width: Width },
    Lidt { ptr: Pointer, width: Width },
    Hlt,
    Nop,
    Fpu(FpuOp),
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInst {
    pub op: Op,
    pub len: u8,
    pub prefixes: Prefixes,
    /// Primary opcode, or `0x0Fxx` for the two-byte map.
    pub opcode: u16,
}

impl DecodedInst {
    /// Whether executing this instruction can end a block (any non-fall-through outcome, or a
    /// state change that alters how the following bytes must be decoded).
    pub fn is_branch(&self) -> bool {
        matches!(
            self.op,
            Op::Jcc { .. }
                | Op::Jmp { .. }
                | Op::JmpIndirect { .. }
                | Op::JmpFar { .. }
                | Op::Call { .. }
                | Op::CallIndirect { .. }
                | Op::Ret { .. }
                | Op::Loop { .. }
                | Op::Hlt
                | Op::MovToCr { .. }
        )
    }

    /// Arithmetic flags whose current value the instruction consumes.
    pub fn flags_read(&self) -> FlagSet {
        match self.op {
            Op::Alu {
                op: AluOp::Adc | AluOp::Sbb,
                ..
            } => FlagSet::CF,
            Op::Shift { op, .. } if op.through_carry() => FlagSet::CF,
            Op::Jcc { cond, .. } | Op::Setcc { cond, .. } => cond.reads(),
            Op::Loop {
                kind: LoopKind::Loope | LoopKind::Loopne,
                ..
            } => FlagSet::ZF,
            Op::FlagCtl(FlagCtl::Cmc) => FlagSet::CF,
            Op::Lahf => FlagSet::SZAPC,
            Op::Pushf { .. } => FlagSet::ARITH,
            _ => FlagSet::empty(),
        }
    }

    /// Arithmetic flags the instruction always overwrites, whatever its operands.
    ///
    /// Forms whose effect depends on a runtime count (shifts by CL, repeated string compares)
    /// report nothing.
    pub fn flags_written(&self) -> FlagSet {
        match self.op {
            Op::Alu { .. } | Op::Test { .. } | Op::Neg { .. } => FlagSet::ARITH,
            Op::Inc { .. } | Op::Dec { .. } => FlagSet::OSZAP,
            Op::Shift {
                op, count, width, ..
            } => {
                let masked = match count {
                    ShiftCount::One => 1,
                    ShiftCount::Imm(n) => n & 0x1F,
                    ShiftCount::Cl => return FlagSet::empty(),
                };
                if masked == 0 {
                    FlagSet::empty()
                } else if op.is_rotate() {
                    let reduced = if op.through_carry() {
                        masked % (width.bits() as u8 + 1)
                    } else {
                        masked
                    };
                    if reduced == 1 {
                        FlagSet::CF | FlagSet::OF
                    } else {
                        FlagSet::CF
                    }
                } else {
                    FlagSet::ARITH
                }
            }
            Op::DoubleShift {
                count: ShiftCount::Imm(n),
                ..
            } if n & 0x1F != 0 => FlagSet::ARITH,
            Op::MulDiv {
                op: MulDivOp::Mul | MulDivOp::Imul,
                ..
            }
            | Op::Imul { .. } => FlagSet::CF | FlagSet::OF,
            Op::Bit { .. } => FlagSet::CF,
            Op::FlagCtl(FlagCtl::Clc | FlagCtl::Stc | FlagCtl::Cmc) => FlagSet::CF,
            Op::Sahf => FlagSet::SZAPC,
            Op::Popf { .. } => FlagSet::ARITH,
            Op::String {
                op: StringOp::Cmps | StringOp::Scas,
                rep: Rep::None,
                ..
            } => FlagSet::ARITH,
            _ => FlagSet::empty(),
        }
    }

    /// Whether executing the instruction can raise a processor fault.
    pub fn may_fault(&self) -> bool {
        fn mem(o: &Operand) -> bool {
            o.is_mem()
        }
        match &self.op {
            Op::Mov { dst, src, .. }
            | Op::Alu { dst, src, .. }
            | Op::Xchg { a: dst, b: src, .. } => mem(dst) || mem(src),
            Op::Test { lhs, rhs, .. } => mem(lhs) || mem(rhs),
            Op::Inc { dst, .. }
            | Op::Dec { dst, .. }
            | Op::Not { dst, .. }
            | Op::Neg { dst, .. }
            | Op::Shift { dst, .. }
            | Op::DoubleShift { dst, .. }
            | Op::Setcc { dst, .. } => mem(dst),
            Op::MulDiv {
                op: MulDivOp::Mul | MulDivOp::Imul,
                src,
                ..
            } => mem(src),
            Op::Imul { src, .. } | Op::Movx { src, .. } => mem(src),
            Op::Bit { base, .. } => mem(base),
            Op::MovFromSeg { dst, .. } => mem(dst),
            Op::Lea { .. }
            | Op::Cbw { .. }
            | Op::Cwd { .. }
            | Op::FlagCtl(FlagCtl::Clc | FlagCtl::Stc | FlagCtl::Cmc | FlagCtl::Cld | FlagCtl::Std)
            | Op::Lahf
            | Op::Sahf
            | Op::Nop
            | Op::MovFromCr { .. } => false,
            Op::Fpu(op) => match op {
                FpuOp::Load(src) | FpuOp::Compare { src, .. } => src.is_mem(),
                FpuOp::Store { dst, .. } => dst.is_mem(),
                FpuOp::Arith { src, .. } => src.is_mem(),
                _ => false,
            },
            _ => true,
        }
    }
}
