use pcx_x86::inst::gpr::{EAX, ECX};
use pcx_x86::{
    decode_bytes, AluOp, CodeSize, Cond, DecodeError, FlagSet, FpuArith, FpuOp, FpuSrc, MulDivOp,
    Op, Operand, Rep, ShiftCount, ShiftOp, SliceCursor, StringOp, Width,
};
use proptest::prelude::*;

#[test]
fn operand_size_prefix_flips_default_width() {
    // mov eax, 1 in 32-bit code
    let inst = decode_bytes(&[0xB8, 1, 0, 0, 0], CodeSize::Bits32).unwrap();
    assert_eq!(inst.len, 5);
    assert_eq!(
        inst.op,
        Op::Mov {
            dst: Operand::Reg(EAX),
            src: Operand::Imm(1),
            width: Width::W32
        }
    );

    // The same encoding in 16-bit code is `mov ax, 1` followed by unrelated bytes.
    let inst = decode_bytes(&[0xB8, 1, 0, 0, 0], CodeSize::Bits16).unwrap();
    assert_eq!(inst.len, 3);

    // 66 B8 imm32 in 16-bit code.
    let inst = decode_bytes(&[0x66, 0xB8, 1, 0, 0, 0], CodeSize::Bits16).unwrap();
    assert_eq!(inst.len, 6);
    assert!(matches!(inst.op, Op::Mov { width: Width::W32, .. }));
}

#[test]
fn group1_imm8_is_sign_extended_to_operand_width() {
    // add ecx, -1
    let inst = decode_bytes(&[0x83, 0xC1, 0xFF], CodeSize::Bits32).unwrap();
    assert_eq!(
        inst.op,
        Op::Alu {
            op: AluOp::Add,
            dst: Operand::Reg(ECX),
            src: Operand::Imm(0xFFFF_FFFF),
            width: Width::W32
        }
    );
    // ... and truncated to 16 bits in 16-bit code.
    let inst = decode_bytes(&[0x83, 0xC1, 0xFF], CodeSize::Bits16).unwrap();
    assert!(matches!(
        inst.op,
        Op::Alu {
            src: Operand::Imm(0xFFFF),
            width: Width::W16,
            ..
        }
    ));
}

#[test]
fn branches_are_classified_for_block_termination() {
    let jmp = decode_bytes(&[0xEB, 0xFE], CodeSize::Bits32).unwrap();
    assert!(jmp.is_branch());
    assert_eq!(
        jmp.op,
        Op::Jmp {
            rel: -2,
            width: Width::W32
        }
    );

    let jne = decode_bytes(&[0x0F, 0x85, 0x10, 0, 0, 0], CodeSize::Bits32).unwrap();
    assert!(jne.is_branch());
    assert_eq!(jne.len, 6);
    assert!(matches!(jne.op, Op::Jcc { cond: Cond::Ne, rel: 0x10, .. }));
    assert_eq!(jne.flags_read(), FlagSet::ZF);

    let add = decode_bytes(&[0x01, 0xC8], CodeSize::Bits32).unwrap();
    assert!(!add.is_branch());
}

#[test]
fn flag_metadata_describes_partial_and_conditional_writers() {
    let inc = decode_bytes(&[0x40], CodeSize::Bits32).unwrap();
    assert_eq!(inc.flags_written(), FlagSet::OSZAP);
    assert!(!inc.may_fault());

    let adc = decode_bytes(&[0x11, 0xC8], CodeSize::Bits32).unwrap();
    assert_eq!(adc.flags_read(), FlagSet::CF);
    assert_eq!(adc.flags_written(), FlagSet::ARITH);

    // shl eax, cl may leave every flag untouched.
    let shl_cl = decode_bytes(&[0xD3, 0xE0], CodeSize::Bits32).unwrap();
    assert!(matches!(
        shl_cl.op,
        Op::Shift {
            op: ShiftOp::Shl,
            count: ShiftCount::Cl,
            ..
        }
    ));
    assert!(shl_cl.flags_written().is_empty());

    // rcl al, 10 reduces to a one-bit rotate (10 mod 9), so OF is defined.
    let rcl = decode_bytes(&[0xC0, 0xD0, 10], CodeSize::Bits32).unwrap();
    assert_eq!(rcl.flags_written(), FlagSet::CF | FlagSet::OF);
    assert_eq!(rcl.flags_read(), FlagSet::CF);

    let div = decode_bytes(&[0xF7, 0xF1], CodeSize::Bits32).unwrap();
    assert!(matches!(div.op, Op::MulDiv { op: MulDivOp::Div, .. }));
    assert!(div.may_fault(), "div always may raise #DE");

    let store = decode_bytes(&[0x89, 0x03], CodeSize::Bits32).unwrap();
    assert!(store.may_fault());
}

#[test]
fn rep_prefixed_string_ops_keep_their_repeat_kind() {
    let inst = decode_bytes(&[0xF3, 0xA6], CodeSize::Bits16).unwrap();
    assert!(matches!(
        inst.op,
        Op::String {
            op: StringOp::Cmps,
            rep: Rep::Repe,
            width: Width::W8,
            addr32: false,
            ..
        }
    ));
    assert!(inst.flags_written().is_empty());

    let inst = decode_bytes(&[0xAF], CodeSize::Bits32).unwrap();
    assert_eq!(inst.flags_written(), FlagSet::ARITH);
}

#[test]
fn x87_register_forms_swap_reversed_operations() {
    // fsubp st(1), st(0) is DE E9: in the DE map ModRM.reg 5 subtracts st(0) from st(i).
    let inst = decode_bytes(&[0xDE, 0xE9], CodeSize::Bits32).unwrap();
    assert_eq!(
        inst.op,
        Op::Fpu(FpuOp::Arith {
            op: FpuArith::Sub,
            dst: 1,
            src: FpuSrc::St(0),
            pop: true
        })
    );

    // fdiv qword ptr [eax]
    let inst = decode_bytes(&[0xDC, 0x30], CodeSize::Bits32).unwrap();
    assert!(matches!(
        inst.op,
        Op::Fpu(FpuOp::Arith {
            op: FpuArith::Div,
            dst: 0,
            src: FpuSrc::M64(_),
            pop: false
        })
    ));
}

#[test]
fn unknown_opcode_reports_mnemonic_and_raw_bytes() {
    // cpuid is not in the dispatch table.
    let err = decode_bytes(&[0x0F, 0xA2, 0x90], CodeSize::Bits32).unwrap_err();
    match &err {
        DecodeError::Unimplemented {
            opcode,
            bytes,
            mnemonic,
        } => {
            assert_eq!(*opcode, 0x0FA2);
            assert_eq!(bytes, &vec![0x0F, 0xA2]);
            assert_eq!(mnemonic, "cpuid");
        }
        other => panic!("unexpected {other:?}"),
    }
    let text = err.to_string();
    assert!(text.contains("cpuid"), "{text}");
    assert!(text.contains("0f a2"), "{text}");
}

#[test]
fn undefined_group_member_is_unimplemented() {
    // FE /2 has no byte form.
    let err = decode_bytes(&[0xFE, 0xD0], CodeSize::Bits32).unwrap_err();
    assert!(err.is_unimplemented());
}

#[test]
fn truncated_instruction_is_eof() {
    assert_eq!(
        decode_bytes(&[0x81, 0xC0, 0x01], CodeSize::Bits32),
        Err(DecodeError::UnexpectedEof)
    );
}

proptest! {
    #[test]
    fn decoding_arbitrary_bytes_is_deterministic_and_bounded(
        bytes in proptest::collection::vec(any::<u8>(), 1..24),
        big in any::<bool>(),
    ) {
        let size = CodeSize::from_big(big);
        let mut c1 = SliceCursor::new(&bytes);
        let first = pcx_x86::decode(&mut c1, size);
        let second = decode_bytes(&bytes, size);
        prop_assert_eq!(&first, &second);
        if let Ok(inst) = first {
            prop_assert!(usize::from(inst.len) <= pcx_x86::MAX_INST_LEN);
            prop_assert_eq!(usize::from(inst.len), c1.position());
        }
    }
}
