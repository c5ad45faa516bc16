//! Opcode dispatch table.
//!
//! 512 slots: `[0x000..0x100)` is the one-byte map, `[0x100..0x200)` the `0F xx` map. Each slot
//! holds a constructor that consumes the rest of the instruction (ModRM, SIB, displacement,
//! immediates) and returns the decoded [`Op`]. Group opcodes discriminate on ModRM.reg inside
//! their constructor.

use crate::inst::gpr::EAX;
use crate::inst::{
    AluOp, BitOp, CodeSize, Cond, ControlReg, FlagCtl, FpuArith, FpuOp, FpuSrc, LoopKind,
    MulDivOp, Op, Operand, Pointer, PortArg, Rep, SegReg, ShiftCount, ShiftOp, StringOp, Width,
};
use crate::modrm::ModRm;
use crate::prefix::{scan_prefixes, Prefixes};
use crate::{disasm, ByteSource, DecodeError, DecodedInst, MAX_INST_LEN};

pub(crate) struct DecodeCtx<'a> {
    src: &'a mut dyn ByteSource,
    raw: Vec<u8>,
    pub prefixes: Prefixes,
    pub opsize32: bool,
    pub addr32: bool,
    pub opcode: u16,
    code_size: CodeSize,
}

impl DecodeCtx<'_> {
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.raw.len() >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = self.src.next_u8()?;
        self.raw.push(b);
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.read_u16()?;
        let hi = self.read_u16()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    /// Immediate of the operation width.
    fn imm(&mut self, width: Width) -> Result<u32, DecodeError> {
        match width {
            Width::W8 => self.read_u8().map(u32::from),
            Width::W16 => self.read_u16().map(u32::from),
            Width::W32 => self.read_u32(),
        }
    }

    /// 8-bit immediate sign-extended to `width`.
    fn imm8_sext(&mut self, width: Width) -> Result<u32, DecodeError> {
        let b = self.read_u8()?;
        Ok(width.truncate(Width::W8.sign_extend(u32::from(b))))
    }

    /// Relative displacement of the operand size (`rel16`/`rel32`).
    fn rel(&mut self) -> Result<i32, DecodeError> {
        if self.opsize32 {
            Ok(self.read_u32()? as i32)
        } else {
            Ok(i32::from(self.read_u16()? as i16))
        }
    }

    fn rel8(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from(self.read_u8()? as i8))
    }

    fn op_width(&self) -> Width {
        if self.opsize32 {
            Width::W32
        } else {
            Width::W16
        }
    }

    /// `W8` for the even opcode of a byte/full pair, the operand size otherwise.
    fn byte_or_full(&self) -> Width {
        if self.opcode & 1 == 0 {
            Width::W8
        } else {
            self.op_width()
        }
    }

    fn modrm(&mut self) -> Result<ModRm, DecodeError> {
        Ok(ModRm::from_byte(self.read_u8()?))
    }

    pub fn segment_or(&self, default: SegReg) -> SegReg {
        self.prefixes.segment().unwrap_or(default)
    }

    fn rep(&self) -> Rep {
        if self.prefixes.contains(Prefixes::REP) {
            Rep::Repe
        } else if self.prefixes.contains(Prefixes::REPNE) {
            Rep::Repne
        } else {
            Rep::None
        }
    }

    /// Build the diagnostic for an opcode the table does not cover.
    fn unimplemented(&mut self) -> DecodeError {
        let mut window = self.raw.clone();
        let mut more = [0u8; MAX_INST_LEN];
        let room = MAX_INST_LEN.saturating_sub(window.len());
        let n = self.src.lookahead(&mut more[..room]);
        window.extend_from_slice(&more[..n]);

        let (mnemonic, bytes) = match disasm::iced_mnemonic(&window, self.code_size) {
            Some((text, len)) => (text, window[..len.min(window.len())].to_vec()),
            None => ("(bad)".to_string(), self.raw.clone()),
        };
        DecodeError::Unimplemented {
            opcode: self.opcode,
            bytes,
            mnemonic,
        }
    }
}

type Ctor = fn(&mut DecodeCtx<'_>) -> Result<Op, DecodeError>;

static TABLE: [Option<Ctor>; 512] = build_table();

macro_rules! fill {
    ($t:ident, $lo:expr, $hi:expr, $f:expr) => {{
        let mut i: usize = $lo;
        while i <= $hi {
            $t[i] = Some($f as Ctor);
            i += 1;
        }
    }};
}

const TWO_BYTE: usize = 0x100;

const fn build_table() -> [Option<Ctor>; 512] {
    let mut t: [Option<Ctor>; 512] = [None; 512];

    // ALU classic forms: 00-05, 08-0D, ... 38-3D.
    let mut row = 0;
    while row < 8 {
        fill!(t, row * 8, row * 8 + 5, alu_classic);
        row += 1;
    }
    fill!(t, 0x06, 0x06, push_seg);
    fill!(t, 0x07, 0x07, pop_seg);
    fill!(t, 0x0E, 0x0E, push_seg);
    fill!(t, 0x16, 0x16, push_seg);
    fill!(t, 0x17, 0x17, pop_seg);
    fill!(t, 0x1E, 0x1E, push_seg);
    fill!(t, 0x1F, 0x1F, pop_seg);
    fill!(t, 0x40, 0x4F, inc_dec_reg);
    fill!(t, 0x50, 0x57, push_reg);
    fill!(t, 0x58, 0x5F, pop_reg);
    fill!(t, 0x60, 0x61, pusha_popa);
    fill!(t, 0x68, 0x68, push_imm);
    fill!(t, 0x6A, 0x6A, push_imm);
    fill!(t, 0x69, 0x69, imul_imm);
    fill!(t, 0x6B, 0x6B, imul_imm);
    fill!(t, 0x70, 0x7F, jcc_short);
    fill!(t, 0x80, 0x83, group1);
    fill!(t, 0x84, 0x85, test_rm);
    fill!(t, 0x86, 0x87, xchg_rm);
    fill!(t, 0x88, 0x8B, mov_rm);
    fill!(t, 0x8C, 0x8C, mov_from_seg);
    fill!(t, 0x8D, 0x8D, lea);
    fill!(t, 0x8E, 0x8E, mov_to_seg);
    fill!(t, 0x8F, 0x8F, pop_rm);
    fill!(t, 0x90, 0x97, xchg_acc);
    fill!(t, 0x98, 0x99, convert);
    fill!(t, 0x9B, 0x9B, nop);
    fill!(t, 0x9C, 0x9F, flags_transfer);
    fill!(t, 0xA0, 0xA3, mov_moffs);
    fill!(t, 0xA4, 0xA7, string);
    fill!(t, 0xA8, 0xA9, test_acc);
    fill!(t, 0xAA, 0xAF, string);
    fill!(t, 0xB0, 0xBF, mov_reg_imm);
    fill!(t, 0xC0, 0xC1, group2);
    fill!(t, 0xC2, 0xC3, ret);
    fill!(t, 0xC6, 0xC7, mov_rm_imm);
    fill!(t, 0xC8, 0xC9, enter_leave);
    fill!(t, 0xD0, 0xD3, group2);
    fill!(t, 0xD8, 0xDF, x87);
    fill!(t, 0xE0, 0xE3, loop_rel);
    fill!(t, 0xE4, 0xE7, port_io);
    fill!(t, 0xE8, 0xE9, call_jmp_rel);
    fill!(t, 0xEA, 0xEA, jmp_far);
    fill!(t, 0xEB, 0xEB, call_jmp_rel);
    fill!(t, 0xEC, 0xEF, port_io);
    fill!(t, 0xF4, 0xF4, hlt);
    fill!(t, 0xF5, 0xF5, flag_ctl);
    fill!(t, 0xF6, 0xF7, group3);
    fill!(t, 0xF8, 0xFD, flag_ctl);
    fill!(t, 0xFE, 0xFF, group45);

    fill!(t, TWO_BYTE + 0x01, TWO_BYTE + 0x01, descriptor_table);
    fill!(t, TWO_BYTE + 0x20, TWO_BYTE + 0x20, mov_cr);
    fill!(t, TWO_BYTE + 0x22, TWO_BYTE + 0x22, mov_cr);
    fill!(t, TWO_BYTE + 0x80, TWO_BYTE + 0x8F, jcc_near);
    fill!(t, TWO_BYTE + 0x90, TWO_BYTE + 0x9F, setcc);
    fill!(t, TWO_BYTE + 0xA0, TWO_BYTE + 0xA0, push_seg);
    fill!(t, TWO_BYTE + 0xA1, TWO_BYTE + 0xA1, pop_seg);
    fill!(t, TWO_BYTE + 0xA3, TWO_BYTE + 0xA3, bit_reg);
    fill!(t, TWO_BYTE + 0xA4, TWO_BYTE + 0xA5, double_shift);
    fill!(t, TWO_BYTE + 0xA8, TWO_BYTE + 0xA8, push_seg);
    fill!(t, TWO_BYTE + 0xA9, TWO_BYTE + 0xA9, pop_seg);
    fill!(t, TWO_BYTE + 0xAB, TWO_BYTE + 0xAB, bit_reg);
    fill!(t, TWO_BYTE + 0xAC, TWO_BYTE + 0xAD, double_shift);
    fill!(t, TWO_BYTE + 0xAF, TWO_BYTE + 0xAF, imul_rm);
    fill!(t, TWO_BYTE + 0xB3, TWO_BYTE + 0xB3, bit_reg);
    fill!(t, TWO_BYTE + 0xB6, TWO_BYTE + 0xB7, movx);
    fill!(t, TWO_BYTE + 0xBA, TWO_BYTE + 0xBA, bit_imm);
    fill!(t, TWO_BYTE + 0xBB, TWO_BYTE + 0xBB, bit_reg);
    fill!(t, TWO_BYTE + 0xBE, TWO_BYTE + 0xBF, movx);
    t
}

pub(crate) fn decode_one(
    src: &mut dyn ByteSource,
    code_size: CodeSize,
) -> Result<DecodedInst, DecodeError> {
    let mut raw = Vec::with_capacity(MAX_INST_LEN);
    let scanned = scan_prefixes(src, &mut raw)?;
    debug_assert_eq!(scanned.consumed, raw.len());
    let big = code_size == CodeSize::Bits32;
    let mut ctx = DecodeCtx {
        src,
        raw,
        prefixes: scanned.prefixes,
        opsize32: big ^ scanned.prefixes.contains(Prefixes::OPSIZE),
        addr32: big ^ scanned.prefixes.contains(Prefixes::ADDRSIZE),
        opcode: u16::from(scanned.opcode),
        code_size,
    };
    if scanned.opcode == 0x0F {
        let second = ctx.read_u8()?;
        ctx.opcode = 0x0F00 | u16::from(second);
    }
    let slot = if ctx.opcode > 0xFF {
        TWO_BYTE + usize::from(ctx.opcode & 0xFF)
    } else {
        usize::from(ctx.opcode)
    };
    let op = match TABLE[slot] {
        Some(ctor) => ctor(&mut ctx)?,
        None => return Err(ctx.unimplemented()),
    };
    Ok(DecodedInst {
        op,
        len: ctx.raw.len() as u8,
        prefixes: ctx.prefixes,
        opcode: ctx.opcode,
    })
}

fn low(c: &DecodeCtx<'_>) -> u8 {
    c.opcode as u8
}

fn alu_classic(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let op = AluOp::from_index(low(c) >> 3);
    let width = c.byte_or_full();
    match low(c) & 7 {
        0 | 1 => {
            let m = c.modrm()?;
            let dst = c.rm_operand(m)?;
            Ok(Op::Alu {
                op,
                dst,
                src: Operand::Reg(m.reg),
                width,
            })
        }
        2 | 3 => {
            let m = c.modrm()?;
            let src = c.rm_operand(m)?;
            Ok(Op::Alu {
                op,
                dst: Operand::Reg(m.reg),
                src,
                width,
            })
        }
        _ => {
            let imm = c.imm(width)?;
            Ok(Op::Alu {
                op,
                dst: Operand::Reg(EAX),
                src: Operand::Imm(imm),
                width,
            })
        }
    }
}

fn group1(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    let op = AluOp::from_index(m.reg);
    let width = match low(c) {
        0x81 | 0x83 => c.op_width(),
        _ => Width::W8,
    };
    let dst = c.rm_operand(m)?;
    let imm = if low(c) == 0x83 {
        c.imm8_sext(width)?
    } else {
        c.imm(width)?
    };
    Ok(Op::Alu {
        op,
        dst,
        src: Operand::Imm(imm),
        width,
    })
}

fn seg_for_push_pop(opcode: u16) -> SegReg {
    match opcode {
        0x06 | 0x07 => SegReg::Es,
        0x0E => SegReg::Cs,
        0x16 | 0x17 => SegReg::Ss,
        0x1E | 0x1F => SegReg::Ds,
        0x0FA0 | 0x0FA1 => SegReg::Fs,
        _ => SegReg::Gs,
    }
}

fn push_seg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::PushSeg {
        seg: seg_for_push_pop(c.opcode),
        width: c.op_width(),
    })
}

fn pop_seg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::PopSeg {
        seg: seg_for_push_pop(c.opcode),
        width: c.op_width(),
    })
}

fn inc_dec_reg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let dst = Operand::Reg(low(c) & 7);
    let width = c.op_width();
    Ok(if low(c) < 0x48 {
        Op::Inc { dst, width }
    } else {
        Op::Dec { dst, width }
    })
}

fn push_reg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::Push {
        src: Operand::Reg(low(c) & 7),
        width: c.op_width(),
    })
}

fn pop_reg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::Pop {
        dst: Operand::Reg(low(c) & 7),
        width: c.op_width(),
    })
}

fn pusha_popa(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    Ok(if low(c) == 0x60 {
        Op::Pusha { width }
    } else {
        Op::Popa { width }
    })
}

fn push_imm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let imm = if low(c) == 0x6A {
        c.imm8_sext(width)?
    } else {
        c.imm(width)?
    };
    Ok(Op::Push {
        src: Operand::Imm(imm),
        width,
    })
}

fn imul_imm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let m = c.modrm()?;
    let src = c.rm_operand(m)?;
    let imm = if low(c) == 0x6B {
        c.imm8_sext(width)?
    } else {
        c.imm(width)?
    };
    Ok(Op::Imul {
        dst: m.reg,
        src,
        imm: Some(imm),
        width,
    })
}

fn imul_rm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let m = c.modrm()?;
    let src = c.rm_operand(m)?;
    Ok(Op::Imul {
        dst: m.reg,
        src,
        imm: None,
        width,
    })
}

fn jcc_short(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let cond = Cond::from_nibble(low(c));
    let rel = c.rel8()?;
    Ok(Op::Jcc {
        cond,
        rel,
        width: c.op_width(),
    })
}

fn jcc_near(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let cond = Cond::from_nibble(low(c));
    let rel = c.rel()?;
    Ok(Op::Jcc {
        cond,
        rel,
        width: c.op_width(),
    })
}

fn setcc(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let cond = Cond::from_nibble(low(c));
    let m = c.modrm()?;
    let dst = c.rm_operand(m)?;
    Ok(Op::Setcc { cond, dst })
}

fn test_rm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let lhs = c.rm_operand(m)?;
    Ok(Op::Test {
        lhs,
        rhs: Operand::Reg(m.reg),
        width,
    })
}

fn test_acc(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let imm = c.imm(width)?;
    Ok(Op::Test {
        lhs: Operand::Reg(EAX),
        rhs: Operand::Imm(imm),
        width,
    })
}

fn xchg_rm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let a = c.rm_operand(m)?;
    Ok(Op::Xchg {
        a,
        b: Operand::Reg(m.reg),
        width,
    })
}

fn xchg_acc(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    if low(c) == 0x90 {
        return Ok(Op::Nop);
    }
    Ok(Op::Xchg {
        a: Operand::Reg(EAX),
        b: Operand::Reg(low(c) & 7),
        width: c.op_width(),
    })
}

fn nop(_: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::Nop)
}

fn mov_rm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let rm = c.rm_operand(m)?;
    let reg = Operand::Reg(m.reg);
    let (dst, src) = if low(c) < 0x8A { (rm, reg) } else { (reg, rm) };
    Ok(Op::Mov { dst, src, width })
}

fn mov_from_seg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    let Some(seg) = SegReg::from_index(m.reg) else {
        return Err(c.unimplemented());
    };
    let dst = c.rm_operand(m)?;
    let width = if dst.is_mem() { Width::W16 } else { c.op_width() };
    Ok(Op::MovFromSeg { dst, seg, width })
}

fn mov_to_seg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    let seg = match SegReg::from_index(m.reg) {
        Some(SegReg::Cs) | None => return Err(c.unimplemented()),
        Some(seg) => seg,
    };
    let src = c.rm_operand(m)?;
    Ok(Op::MovToSeg { seg, src })
}

fn lea(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    if m.is_reg() {
        return Err(c.unimplemented());
    }
    let ptr = c.pointer(m)?;
    Ok(Op::Lea {
        dst: m.reg,
        ptr,
        width: c.op_width(),
    })
}

fn pop_rm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    if m.reg != 0 {
        return Err(c.unimplemented());
    }
    let dst = c.rm_operand(m)?;
    Ok(Op::Pop {
        dst,
        width: c.op_width(),
    })
}

fn convert(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    Ok(if low(c) == 0x98 {
        Op::Cbw { width }
    } else {
        Op::Cwd { width }
    })
}

fn flags_transfer(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    Ok(match low(c) {
        0x9C => Op::Pushf { width },
        0x9D => Op::Popf { width },
        0x9E => Op::Sahf,
        _ => Op::Lahf,
    })
}

fn mov_moffs(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let offset = if c.addr32 {
        c.read_u32()?
    } else {
        u32::from(c.read_u16()?)
    };
    let mem = Operand::Mem(Pointer::absolute(
        offset,
        c.segment_or(SegReg::Ds),
        c.addr32,
    ));
    let acc = Operand::Reg(EAX);
    let (dst, src) = if low(c) < 0xA2 { (acc, mem) } else { (mem, acc) };
    Ok(Op::Mov { dst, src, width })
}

fn string(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let op = match low(c) {
        0xA4 | 0xA5 => StringOp::Movs,
        0xA6 | 0xA7 => StringOp::Cmps,
        0xAA | 0xAB => StringOp::Stos,
        0xAC | 0xAD => StringOp::Lods,
        _ => StringOp::Scas,
    };
    Ok(Op::String {
        op,
        width: c.byte_or_full(),
        rep: c.rep(),
        segment: c.segment_or(SegReg::Ds),
        addr32: c.addr32,
    })
}

fn mov_reg_imm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = if low(c) < 0xB8 {
        Width::W8
    } else {
        c.op_width()
    };
    let imm = c.imm(width)?;
    Ok(Op::Mov {
        dst: Operand::Reg(low(c) & 7),
        src: Operand::Imm(imm),
        width,
    })
}

fn mov_rm_imm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    if m.reg != 0 {
        return Err(c.unimplemented());
    }
    let dst = c.rm_operand(m)?;
    let imm = c.imm(width)?;
    Ok(Op::Mov {
        dst,
        src: Operand::Imm(imm),
        width,
    })
}

fn group2(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let op = ShiftOp::from_index(m.reg);
    let dst = c.rm_operand(m)?;
    let count = match low(c) {
        0xC0 | 0xC1 => ShiftCount::Imm(c.read_u8()?),
        0xD0 | 0xD1 => ShiftCount::One,
        _ => ShiftCount::Cl,
    };
    Ok(Op::Shift {
        op,
        dst,
        count,
        width,
    })
}

fn double_shift(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let m = c.modrm()?;
    let dst = c.rm_operand(m)?;
    let count = if low(c) & 1 == 0 {
        ShiftCount::Imm(c.read_u8()?)
    } else {
        ShiftCount::Cl
    };
    Ok(Op::DoubleShift {
        left: low(c) < 0xA8,
        dst,
        src: m.reg,
        count,
        width,
    })
}

fn bit_reg(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let op = match low(c) {
        0xA3 => BitOp::Bt,
        0xAB => BitOp::Bts,
        0xB3 => BitOp::Btr,
        _ => BitOp::Btc,
    };
    let width = c.op_width();
    let m = c.modrm()?;
    let base = c.rm_operand(m)?;
    Ok(Op::Bit {
        op,
        base,
        bit: Operand::Reg(m.reg),
        width,
    })
}

fn bit_imm(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let m = c.modrm()?;
    let op = match m.reg {
        4 => BitOp::Bt,
        5 => BitOp::Bts,
        6 => BitOp::Btr,
        7 => BitOp::Btc,
        _ => return Err(c.unimplemented()),
    };
    let base = c.rm_operand(m)?;
    let bit = c.read_u8()?;
    Ok(Op::Bit {
        op,
        base,
        bit: Operand::Imm(u32::from(bit)),
        width,
    })
}

fn movx(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let m = c.modrm()?;
    let src = c.rm_operand(m)?;
    Ok(Op::Movx {
        dst: m.reg,
        src,
        src_width: if low(c) & 1 == 0 {
            Width::W8
        } else {
            Width::W16
        },
        width,
        signed: low(c) >= 0xBE,
    })
}

fn ret(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let pop = if low(c) == 0xC2 { c.read_u16()? } else { 0 };
    Ok(Op::Ret {
        pop,
        width: c.op_width(),
    })
}

fn enter_leave(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    if low(c) == 0xC9 {
        return Ok(Op::Leave { width });
    }
    let frame = c.read_u16()?;
    let nesting = c.read_u8()? & 0x1F;
    Ok(Op::Enter {
        frame,
        nesting,
        width,
    })
}

fn loop_rel(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let kind = match low(c) {
        0xE0 => LoopKind::Loopne,
        0xE1 => LoopKind::Loope,
        0xE2 => LoopKind::Loop,
        _ => LoopKind::Jcxz,
    };
    let rel = c.rel8()?;
    Ok(Op::Loop {
        kind,
        rel,
        width: c.op_width(),
        addr32: c.addr32,
    })
}

fn port_io(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let port = if low(c) < 0xE8 {
        PortArg::Imm(c.read_u8()?)
    } else {
        PortArg::Dx
    };
    Ok(if low(c) & 2 == 0 {
        Op::In { port, width }
    } else {
        Op::Out { port, width }
    })
}

fn call_jmp_rel(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    Ok(match low(c) {
        0xE8 => Op::Call {
            rel: c.rel()?,
            width,
        },
        0xE9 => Op::Jmp {
            rel: c.rel()?,
            width,
        },
        _ => Op::Jmp {
            rel: c.rel8()?,
            width,
        },
    })
}

fn jmp_far(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.op_width();
    let offset = c.imm(width)?;
    let selector = c.read_u16()?;
    Ok(Op::JmpFar {
        selector,
        offset,
        width,
    })
}

fn hlt(_: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::Hlt)
}

fn flag_ctl(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    Ok(Op::FlagCtl(match low(c) {
        0xF5 => FlagCtl::Cmc,
        0xF8 => FlagCtl::Clc,
        0xF9 => FlagCtl::Stc,
        0xFA => FlagCtl::Cli,
        0xFB => FlagCtl::Sti,
        0xFC => FlagCtl::Cld,
        _ => FlagCtl::Std,
    }))
}

fn group3(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let rm = c.rm_operand(m)?;
    Ok(match m.reg {
        0 | 1 => Op::Test {
            lhs: rm,
            rhs: Operand::Imm(c.imm(width)?),
            width,
        },
        2 => Op::Not { dst: rm, width },
        3 => Op::Neg { dst: rm, width },
        r => Op::MulDiv {
            op: match r {
                4 => MulDivOp::Mul,
                5 => MulDivOp::Imul,
                6 => MulDivOp::Div,
                _ => MulDivOp::Idiv,
            },
            src: rm,
            width,
        },
    })
}

fn group45(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let width = c.byte_or_full();
    let m = c.modrm()?;
    let byte_form = low(c) == 0xFE;
    match m.reg {
        0 => Ok(Op::Inc {
            dst: c.rm_operand(m)?,
            width,
        }),
        1 => Ok(Op::Dec {
            dst: c.rm_operand(m)?,
            width,
        }),
        2 if !byte_form => Ok(Op::CallIndirect {
            target: c.rm_operand(m)?,
            width,
        }),
        4 if !byte_form => Ok(Op::JmpIndirect {
            target: c.rm_operand(m)?,
            width,
        }),
        6 if !byte_form => Ok(Op::Push {
            src: c.rm_operand(m)?,
            width,
        }),
        _ => Err(c.unimplemented()),
    }
}

fn descriptor_table(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    if m.is_reg() {
        return Err(c.unimplemented());
    }
    let width = c.op_width();
    match m.reg {
        2 => Ok(Op::Lgdt {
            ptr: c.pointer(m)?,
            width,
        }),
        3 => Ok(Op::Lidt {
            ptr: c.pointer(m)?,
            width,
        }),
        _ => Err(c.unimplemented()),
    }
}

fn mov_cr(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    // The r/m field always names a register here, whatever the mod bits say.
    let m = c.modrm()?;
    let Some(cr) = ControlReg::from_index(m.reg) else {
        return Err(c.unimplemented());
    };
    Ok(if low(c) == 0x22 {
        Op::MovToCr { cr, src: m.rm }
    } else {
        Op::MovFromCr { dst: m.rm, cr }
    })
}

/// `D8`/`DC` ModRM.reg ordering for the memory and `st(0), st(i)` forms.
fn fpu_arith(reg: u8) -> Option<FpuArith> {
    match reg {
        0 => Some(FpuArith::Add),
        1 => Some(FpuArith::Mul),
        4 => Some(FpuArith::Sub),
        5 => Some(FpuArith::Subr),
        6 => Some(FpuArith::Div),
        7 => Some(FpuArith::Divr),
        _ => None,
    }
}

/// `DC`/`DE` register forms write `st(i)` and swap the sub/subr and div/divr encodings.
fn fpu_arith_to_sti(reg: u8) -> Option<FpuArith> {
    match reg {
        4 => Some(FpuArith::Subr),
        5 => Some(FpuArith::Sub),
        6 => Some(FpuArith::Divr),
        7 => Some(FpuArith::Div),
        r => fpu_arith(r),
    }
}

fn x87(c: &mut DecodeCtx<'_>) -> Result<Op, DecodeError> {
    let m = c.modrm()?;
    let esc = low(c);
    let op = if m.is_reg() {
        let i = m.rm;
        match (esc, m.reg) {
            (0xD8, 2 | 3) => Some(FpuOp::Compare {
                src: FpuSrc::St(i),
                pop: m.reg == 3,
            }),
            (0xD8, r) => fpu_arith(r).map(|op| FpuOp::Arith {
                op,
                dst: 0,
                src: FpuSrc::St(i),
                pop: false,
            }),
            (0xD9, 0) => Some(FpuOp::Load(FpuSrc::St(i))),
            (0xD9, 1) => Some(FpuOp::Xch(i)),
            (0xD9, 5) if i == 0 => Some(FpuOp::LoadOne),
            (0xD9, 5) if i == 6 => Some(FpuOp::LoadZero),
            (0xDB, 4) if i == 3 => Some(FpuOp::Init),
            (0xDC | 0xDE, r) => fpu_arith_to_sti(r).map(|op| FpuOp::Arith {
                op,
                dst: i,
                src: FpuSrc::St(0),
                pop: esc == 0xDE,
            }),
            (0xDD, 2 | 3) => Some(FpuOp::Store {
                dst: FpuSrc::St(i),
                pop: m.reg == 3,
            }),
            (0xDF, 4) if i == 0 => Some(FpuOp::StswAx),
            _ => None,
        }
    } else {
        let ptr = c.pointer(m)?;
        let mem = match esc {
            0xD8 | 0xD9 => FpuSrc::M32(ptr),
            _ => FpuSrc::M64(ptr),
        };
        match (esc, m.reg) {
            (0xD8 | 0xDC, 2 | 3) => Some(FpuOp::Compare {
                src: mem,
                pop: m.reg == 3,
            }),
            (0xD8 | 0xDC, r) => fpu_arith(r).map(|op| FpuOp::Arith {
                op,
                dst: 0,
                src: mem,
                pop: false,
            }),
            (0xD9 | 0xDD, 0) => Some(FpuOp::Load(mem)),
            (0xD9 | 0xDD, 2 | 3) => Some(FpuOp::Store {
                dst: mem,
                pop: m.reg == 3,
            }),
            _ => None,
        }
    };
    match op {
        Some(op) => Ok(Op::Fpu(op)),
        None => Err(c.unimplemented()),
    }
}
