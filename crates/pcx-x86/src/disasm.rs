//! Human-readable rendering of decoded instructions.
//!
//! [`DecodedInst`] implements `Display` for trace logging. For bytes the dispatch table cannot
//! decode, [`iced_mnemonic`] asks `iced-x86` for a full disassembly so diagnostics name the
//! instruction that was hit.

use core::fmt;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::inst::{
    AluOp, BitOp, CodeSize, Cond, FlagCtl, FpuArith, FpuOp, FpuSrc, LoopKind, MulDivOp, Op,
    Operand, Pointer, PortArg, Rep, SegReg, ShiftCount, ShiftOp, StringOp, Width,
};
use crate::DecodedInst;

/// Disassemble the first instruction in `bytes` with iced, returning the Intel-syntax text and
/// the instruction length. `None` if iced considers the bytes invalid too.
pub fn iced_mnemonic(bytes: &[u8], code_size: CodeSize) -> Option<(String, usize)> {
    let mut decoder = Decoder::with_ip(code_size.bitness(), bytes, 0, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();
    formatter.format(&instruction, &mut text);
    Some((text, instruction.len()))
}

pub fn reg_name(index: u8, width: Width) -> &'static str {
    const R8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
    const R16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
    const R32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    let i = usize::from(index & 7);
    match width {
        Width::W8 => R8[i],
        Width::W16 => R16[i],
        Width::W32 => R32[i],
    }
}

fn seg_name(seg: SegReg) -> &'static str {
    match seg {
        SegReg::Es => "es",
        SegReg::Cs => "cs",
        SegReg::Ss => "ss",
        SegReg::Ds => "ds",
        SegReg::Fs => "fs",
        SegReg::Gs => "gs",
    }
}

fn size_name(width: Width) -> &'static str {
    match width {
        Width::W8 => "byte",
        Width::W16 => "word",
        Width::W32 => "dword",
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let aw = if self.addr32 { Width::W32 } else { Width::W16 };
        write!(f, "{}:[", seg_name(self.segment))?;
        let mut first = true;
        if let Some(base) = self.base {
            f.write_str(reg_name(base, aw))?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(reg_name(index, aw))?;
            if self.scale > 1 {
                write!(f, "*{}", self.scale)?;
            }
            first = false;
        }
        if first {
            write!(f, "{:#x}", self.disp as u32 & aw.mask())?;
        } else if self.disp < 0 {
            write!(f, "-{:#x}", self.disp.unsigned_abs())?;
        } else if self.disp > 0 {
            write!(f, "+{:#x}", self.disp)?;
        }
        f.write_str("]")
    }
}

struct WithSize<'a>(&'a Operand, Width);

impl fmt::Display for WithSize<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Operand::Reg(r) => f.write_str(reg_name(*r, self.1)),
            Operand::Mem(p) => write!(f, "{} ptr {p}", size_name(self.1)),
            Operand::Imm(v) => write!(f, "{v:#x}"),
        }
    }
}

fn alu_name(op: AluOp) -> &'static str {
    match op {
        AluOp::Add => "add",
        AluOp::Or => "or",
        AluOp::Adc => "adc",
        AluOp::Sbb => "sbb",
        AluOp::And => "and",
        AluOp::Sub => "sub",
        AluOp::Xor => "xor",
        AluOp::Cmp => "cmp",
    }
}

fn shift_name(op: ShiftOp) -> &'static str {
    match op {
        ShiftOp::Rol => "rol",
        ShiftOp::Ror => "ror",
        ShiftOp::Rcl => "rcl",
        ShiftOp::Rcr => "rcr",
        ShiftOp::Shl => "shl",
        ShiftOp::Shr => "shr",
        ShiftOp::Sal => "sal",
        ShiftOp::Sar => "sar",
    }
}

fn cond_suffix(cond: Cond) -> &'static str {
    match cond {
        Cond::O => "o",
        Cond::No => "no",
        Cond::B => "b",
        Cond::Ae => "ae",
        Cond::E => "e",
        Cond::Ne => "ne",
        Cond::Be => "be",
        Cond::A => "a",
        Cond::S => "s",
        Cond::Ns => "ns",
        Cond::P => "p",
        Cond::Np => "np",
        Cond::L => "l",
        Cond::Ge => "ge",
        Cond::Le => "le",
        Cond::G => "g",
    }
}

fn count_text(count: ShiftCount) -> String {
    match count {
        ShiftCount::One => "1".to_string(),
        ShiftCount::Imm(n) => format!("{n:#x}"),
        ShiftCount::Cl => "cl".to_string(),
    }
}

fn fpu_src(src: &FpuSrc) -> String {
    match src {
        FpuSrc::M32(p) => format!("dword ptr {p}"),
        FpuSrc::M64(p) => format!("qword ptr {p}"),
        FpuSrc::St(i) => format!("st({i})"),
    }
}

fn rel_text(rel: i32) -> String {
    if rel < 0 {
        format!("$-{:#x}", rel.unsigned_abs())
    } else {
        format!("$+{rel:#x}")
    }
}

impl fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Op::Mov { dst, src, width } => {
                write!(f, "mov {}, {}", WithSize(dst, *width), WithSize(src, *width))
            }
            Op::Alu {
                op,
                dst,
                src,
                width,
            } => write!(
                f,
                "{} {}, {}",
                alu_name(*op),
                WithSize(dst, *width),
                WithSize(src, *width)
            ),
            Op::Test { lhs, rhs, width } => {
                write!(f, "test {}, {}", WithSize(lhs, *width), WithSize(rhs, *width))
            }
            Op::Inc { dst, width } => write!(f, "inc {}", WithSize(dst, *width)),
            Op::Dec { dst, width } => write!(f, "dec {}", WithSize(dst, *width)),
            Op::Not { dst, width } => write!(f, "not {}", WithSize(dst, *width)),
            Op::Neg { dst, width } => write!(f, "neg {}", WithSize(dst, *width)),
            Op::Shift {
                op,
                dst,
                count,
                width,
            } => write!(
                f,
                "{} {}, {}",
                shift_name(*op),
                WithSize(dst, *width),
                count_text(*count)
            ),
            Op::DoubleShift {
                left,
                dst,
                src,
                count,
                width,
            } => write!(
                f,
                "{} {}, {}, {}",
                if *left { "shld" } else { "shrd" },
                WithSize(dst, *width),
                reg_name(*src, *width),
                count_text(*count)
            ),
            Op::MulDiv { op, src, width } => {
                let name = match op {
                    MulDivOp::Mul => "mul",
                    MulDivOp::Imul => "imul",
                    MulDivOp::Div => "div",
                    MulDivOp::Idiv => "idiv",
                };
                write!(f, "{name} {}", WithSize(src, *width))
            }
            Op::Imul {
                dst,
                src,
                imm,
                width,
            } => {
                write!(f, "imul {}, {}", reg_name(*dst, *width), WithSize(src, *width))?;
                if let Some(imm) = imm {
                    write!(f, ", {imm:#x}")?;
                }
                Ok(())
            }
            Op::Bit {
                op,
                base,
                bit,
                width,
            } => {
                let name = match op {
                    BitOp::Bt => "bt",
                    BitOp::Bts => "bts",
                    BitOp::Btr => "btr",
                    BitOp::Btc => "btc",
                };
                write!(f, "{name} {}, {}", WithSize(base, *width), WithSize(bit, *width))
            }
            Op::Movx {
                dst,
                src,
                src_width,
                width,
                signed,
            } => write!(
                f,
                "{} {}, {}",
                if *signed { "movsx" } else { "movzx" },
                reg_name(*dst, *width),
                WithSize(src, *src_width)
            ),
            Op::Lea { dst, ptr, width } => write!(f, "lea {}, {ptr}", reg_name(*dst, *width)),
            Op::Xchg { a, b, width } => {
                write!(f, "xchg {}, {}", WithSize(a, *width), WithSize(b, *width))
            }
            Op::Push { src, width } => write!(f, "push {}", WithSize(src, *width)),
            Op::Pop { dst, width } => write!(f, "pop {}", WithSize(dst, *width)),
            Op::PushSeg { seg, .. } => write!(f, "push {}", seg_name(*seg)),
            Op::PopSeg { seg, .. } => write!(f, "pop {}", seg_name(*seg)),
            Op::MovToSeg { seg, src } => {
                write!(f, "mov {}, {}", seg_name(*seg), WithSize(src, Width::W16))
            }
            Op::MovFromSeg { dst, seg, width } => {
                write!(f, "mov {}, {}", WithSize(dst, *width), seg_name(*seg))
            }
            Op::Pusha { width } => f.write_str(if *width == Width::W32 { "pushad" } else { "pusha" }),
            Op::Popa { width } => f.write_str(if *width == Width::W32 { "popad" } else { "popa" }),
            Op::Pushf { width } => f.write_str(if *width == Width::W32 { "pushfd" } else { "pushf" }),
            Op::Popf { width } => f.write_str(if *width == Width::W32 { "popfd" } else { "popf" }),
            Op::Lahf => f.write_str("lahf"),
            Op::Sahf => f.write_str("sahf"),
            Op::Cbw { width } => f.write_str(if *width == Width::W32 { "cwde" } else { "cbw" }),
            Op::Cwd { width } => f.write_str(if *width == Width::W32 { "cdq" } else { "cwd" }),
            Op::FlagCtl(ctl) => f.write_str(match ctl {
                FlagCtl::Clc => "clc",
                FlagCtl::Stc => "stc",
                FlagCtl::Cmc => "cmc",
                FlagCtl::Cli => "cli",
                FlagCtl::Sti => "sti",
                FlagCtl::Cld => "cld",
                FlagCtl::Std => "std",
            }),
            Op::Jcc { cond, rel, .. } => write!(f, "j{} {}", cond_suffix(*cond), rel_text(*rel)),
            Op::Jmp { rel, .. } => write!(f, "jmp {}", rel_text(*rel)),
            Op::JmpIndirect { target, width } => write!(f, "jmp {}", WithSize(target, *width)),
            Op::JmpFar {
                selector, offset, ..
            } => write!(f, "jmp far {selector:#06x}:{offset:#x}"),
            Op::Call { rel, .. } => write!(f, "call {}", rel_text(*rel)),
            Op::CallIndirect { target, width } => write!(f, "call {}", WithSize(target, *width)),
            Op::Ret { pop: 0, .. } => f.write_str("ret"),
            Op::Ret { pop, .. } => write!(f, "ret {pop:#x}"),
            Op::Loop { kind, rel, .. } => {
                let name = match kind {
                    LoopKind::Loop => "loop",
                    LoopKind::Loope => "loope",
                    LoopKind::Loopne => "loopne",
                    LoopKind::Jcxz => "jcxz",
                };
                write!(f, "{name} {}", rel_text(*rel))
            }
            Op::Setcc { cond, dst } => {
                write!(f, "set{} {}", cond_suffix(*cond), WithSize(dst, Width::W8))
            }
            Op::Enter { frame, nesting, .. } => write!(f, "enter {frame:#x}, {nesting}"),
            Op::Leave { .. } => f.write_str("leave"),
            Op::In { port, width } => match port {
                PortArg::Imm(p) => write!(f, "in {}, {p:#x}", reg_name(0, *width)),
                PortArg::Dx => write!(f, "in {}, dx", reg_name(0, *width)),
            },
            Op::Out { port, width } => match port {
                PortArg::Imm(p) => write!(f, "out {p:#x}, {}", reg_name(0, *width)),
                PortArg::Dx => write!(f, "out dx, {}", reg_name(0, *width)),
            },
            Op::String { op, width, rep, .. } => {
                let prefix = match (rep, op) {
                    (Rep::None, _) => "",
                    (Rep::Repe, StringOp::Cmps | StringOp::Scas) => "repe ",
                    (Rep::Repe, _) => "rep ",
                    (Rep::Repne, _) => "repne ",
                };
                let name = match op {
                    StringOp::Movs => "movs",
                    StringOp::Cmps => "cmps",
                    StringOp::Stos => "stos",
                    StringOp::Lods => "lods",
                    StringOp::Scas => "scas",
                };
                let suffix = match width {
                    Width::W8 => "b",
                    Width::W16 => "w",
                    Width::W32 => "d",
                };
                write!(f, "{prefix}{name}{suffix}")
            }
            Op::MovToCr { cr, src } => write!(f, "mov cr{}, {}", cr.index(), reg_name(*src, Width::W32)),
            Op::MovFromCr { dst, cr } => write!(f, "mov {}, cr{}", reg_name(*dst, Width::W32), cr.index()),
            Op::Lgdt { ptr, .. } => write!(f, "lgdt {ptr}"),
            Op::Lidt { ptr, .. } => write!(f, "lidt {ptr}"),
            Op::Hlt => f.write_str("hlt"),
            Op::Nop => f.write_str("nop"),
            Op::Fpu(op) => match op {
                FpuOp::Load(src) => write!(f, "fld {}", fpu_src(src)),
                FpuOp::LoadOne => f.write_str("fld1"),
                FpuOp::LoadZero => f.write_str("fldz"),
                FpuOp::Store { dst, pop } => {
                    write!(f, "{} {}", if *pop { "fstp" } else { "fst" }, fpu_src(dst))
                }
                FpuOp::Xch(i) => write!(f, "fxch st({i})"),
                FpuOp::Arith { op, dst, src, pop } => {
                    let name = match op {
                        FpuArith::Add => "fadd",
                        FpuArith::Mul => "fmul",
                        FpuArith::Sub => "fsub",
                        FpuArith::Subr => "fsubr",
                        FpuArith::Div => "fdiv",
                        FpuArith::Divr => "fdivr",
                    };
                    let p = if *pop { "p" } else { "" };
                    write!(f, "{name}{p} st({dst}), {}", fpu_src(src))
                }
                FpuOp::Compare { src, pop } => {
                    write!(f, "{} {}", if *pop { "fcomp" } else { "fcom" }, fpu_src(src))
                }
                FpuOp::StswAx => f.write_str("fnstsw ax"),
                FpuOp::Init => f.write_str("fninit"),
            },
        }
    }
}
