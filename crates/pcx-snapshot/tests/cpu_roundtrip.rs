use std::io::Cursor;

use pcx_cpu_core::interp::alu::alu;
use pcx_cpu_core::{BlockAssembler, CodeBlock, CpuState, FlatBus, Segment};
use pcx_snapshot::{restore_cpu, save_cpu, SnapshotError, CPU_SNAPSHOT_MAGIC};
use pcx_x86::{AluOp, FlagSet, SegReg, Width};
use proptest::prelude::*;

/// Header, registers, flags, six segments, two tables, control and debug registers, x87, halt.
const V1_LEN: usize = 6 + 32 + 4 + 20 + 6 * 12 + 2 * 6 + 5 * 4 + 8 * 4 + (8 * 8 + 1 + 3 * 2) + 1;

fn encode(cpu: &CpuState) -> Vec<u8> {
    let mut out = Vec::new();
    save_cpu(cpu, &mut out).unwrap();
    out
}

/// A real-mode processor that has run a little code, leaving lazy flags and x87 state behind.
fn busy_cpu() -> CpuState {
    let mut bus = FlatBus::new(0x20000);
    // add ax, bx; fld1; fldz; hlt
    bus.load(0x7C00, &[0x01, 0xD8, 0xD9, 0xE8, 0xD9, 0xEE, 0xF4]);
    let mut cpu = CpuState::new();
    *cpu.seg_mut(SegReg::Ds) = Segment::real(0x1234);
    cpu.eip = 0x7C00;
    cpu.gpr = [0xFFFF, 0, 0, 1, 0x7000, 0xBEEF, 0x10, 0x20];
    cpu.dr[7] = 0x400;
    cpu.gdtr.base = 0x8000;
    cpu.gdtr.limit = 0x27;
    let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
    block.execute(&mut cpu, &mut bus);
    assert!(cpu.halted);
    cpu
}

#[test]
fn layout_starts_with_magic_version_and_registers() {
    let cpu = busy_cpu();
    let bytes = encode(&cpu);
    assert_eq!(bytes.len(), V1_LEN);
    assert_eq!(&bytes[..4], &CPU_SNAPSHOT_MAGIC);
    assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
    assert_eq!(&bytes[6..10], &cpu.gpr[0].to_le_bytes());
    assert_eq!(&bytes[38..42], &cpu.eip.to_le_bytes());
    assert_eq!(*bytes.last().unwrap(), 1, "halted");
}

#[test]
fn lazy_flags_survive_unresolved() {
    let mut cpu = busy_cpu();
    assert!(!cpu.flags.dirty.is_empty(), "add left its flags pending");

    let mut restored = restore_cpu(&mut Cursor::new(encode(&cpu))).unwrap();
    assert_eq!(restored, cpu);
    assert_eq!(restored.flags.dirty, cpu.flags.dirty);
    assert_eq!(restored.eflags(), cpu.eflags());
    assert_eq!(restored.fpu.st(0), 0.0);
    assert_eq!(restored.fpu.st(1), 1.0);
}

#[test]
fn restored_state_reencodes_identically() {
    let cpu = busy_cpu();
    let bytes = encode(&cpu);
    let restored = restore_cpu(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(encode(&restored), bytes);
}

#[test]
fn wrong_magic_is_rejected() {
    let mut bytes = encode(&CpuState::new());
    bytes[0] = b'X';
    assert!(matches!(
        restore_cpu(&mut Cursor::new(bytes)),
        Err(SnapshotError::BadMagic)
    ));
}

#[test]
fn future_versions_are_rejected() {
    let mut bytes = encode(&CpuState::new());
    bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
    assert!(matches!(
        restore_cpu(&mut Cursor::new(bytes)),
        Err(SnapshotError::UnsupportedVersion(2))
    ));
}

#[test]
fn invalid_lazy_width_is_corrupt() {
    let mut bytes = encode(&CpuState::new());
    // raw flags u32 then the operation byte, then the width byte.
    bytes[6 + 32 + 4 + 4 + 1] = 12;
    assert!(matches!(
        restore_cpu(&mut Cursor::new(bytes)),
        Err(SnapshotError::Corrupt("lazy flag width"))
    ));
}

#[test]
fn truncated_input_is_an_io_error() {
    let bytes = encode(&CpuState::flat32());
    for len in [0, 5, 40, V1_LEN - 1] {
        assert!(
            matches!(
                restore_cpu(&mut Cursor::new(&bytes[..len])),
                Err(SnapshotError::Io(_))
            ),
            "length {len}"
        );
    }
}

fn op_strategy() -> impl Strategy<Value = AluOp> {
    (0u8..8).prop_map(AluOp::from_index)
}

fn width_strategy() -> impl Strategy<Value = Width> {
    prop_oneof![Just(Width::W8), Just(Width::W16), Just(Width::W32)]
}

proptest! {
    #[test]
    fn any_lazy_record_round_trips(
        op in op_strategy(),
        a in any::<u32>(),
        b in any::<u32>(),
        width in width_strategy(),
        mask_bits in any::<u16>(),
        gpr in any::<[u32; 8]>(),
    ) {
        let mut cpu = CpuState::flat32();
        cpu.gpr = gpr;
        let (_, lazy) = alu(op, a, b, false, width);
        let mask = FlagSet::from_bits_truncate(mask_bits);
        cpu.flags.stage(lazy, mask);

        let mut restored = restore_cpu(&mut Cursor::new(encode(&cpu))).unwrap();
        prop_assert_eq!(&restored, &cpu);
        prop_assert_eq!(restored.eflags(), cpu.eflags());
    }
}
