use pcx_cpu_core::flags::{FlagOp, FlagState, LazyFlags};
use pcx_cpu_core::interp::alu::{alu, div_signed, div_unsigned, rotate};
use pcx_cpu_core::{BlockAssembler, Branch, CodeBlock, CpuState, Exception, FlatBus};
use pcx_x86::{AluOp, FlagSet, ShiftOp, Width};
use proptest::prelude::*;

const ARITH_MASK: u32 = 0x8D5;

fn width_strategy() -> impl Strategy<Value = Width> {
    prop_oneof![Just(Width::W8), Just(Width::W16), Just(Width::W32)]
}

fn alu_op_strategy() -> impl Strategy<Value = AluOp> {
    (0u8..8).prop_map(AluOp::from_index)
}

fn bit(flag: FlagSet, value: bool) -> u32 {
    if value {
        flag.eflags_mask()
    } else {
        0
    }
}

fn szp(r: u32, width: Width) -> u32 {
    bit(FlagSet::ZF, r == 0)
        | bit(FlagSet::SF, r & width.sign_bit() != 0)
        | bit(FlagSet::PF, (r as u8).count_ones() % 2 == 0)
}

fn signed(v: u32, width: Width) -> i64 {
    i64::from(width.sign_extend(v) as i32)
}

fn fits_signed(v: i64, width: Width) -> bool {
    let max = i64::from(width.sign_bit()) - 1;
    v <= max && v >= -max - 1
}

/// Every arithmetic flag of `a <op> b`, computed from scratch with wide arithmetic.
fn eager_alu(op: AluOp, a: u32, b: u32, carry: bool, width: Width) -> (u32, u32) {
    let a = a & width.mask();
    let b = b & width.mask();
    let c = u32::from(carry);
    match op {
        AluOp::Add | AluOp::Adc => {
            let c = if op == AluOp::Adc { c } else { 0 };
            let wide = u64::from(a) + u64::from(b) + u64::from(c);
            let r = (wide as u32) & width.mask();
            let flags = szp(r, width)
                | bit(FlagSet::CF, wide > u64::from(width.mask()))
                | bit(FlagSet::AF, (a & 0xF) + (b & 0xF) + c > 0xF)
                | bit(
                    FlagSet::OF,
                    !fits_signed(signed(a, width) + signed(b, width) + i64::from(c), width),
                );
            (r, flags)
        }
        AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
            let c = if op == AluOp::Sbb { c } else { 0 };
            let r = a.wrapping_sub(b).wrapping_sub(c) & width.mask();
            let flags = szp(r, width)
                | bit(FlagSet::CF, u64::from(a) < u64::from(b) + u64::from(c))
                | bit(FlagSet::AF, (a & 0xF) < (b & 0xF) + c)
                | bit(
                    FlagSet::OF,
                    !fits_signed(signed(a, width) - signed(b, width) - i64::from(c), width),
                );
            (r, flags)
        }
        AluOp::And | AluOp::Or | AluOp::Xor => {
            let r = match op {
                AluOp::And => a & b,
                AluOp::Or => a | b,
                _ => a ^ b,
            };
            (r, szp(r, width))
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Alu(AluOp, u32, u32, Width),
    Inc(u32, Width),
    Dec(u32, Width),
    Read(u8),
    Cache(u8),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (alu_op_strategy(), any::<u32>(), any::<u32>(), width_strategy())
            .prop_map(|(op, a, b, w)| Step::Alu(op, a, b, w)),
        1 => (any::<u32>(), width_strategy()).prop_map(|(a, w)| Step::Inc(a, w)),
        1 => (any::<u32>(), width_strategy()).prop_map(|(a, w)| Step::Dec(a, w)),
        2 => (0u8..6).prop_map(Step::Read),
        1 => (0u8..6).prop_map(Step::Cache),
    ]
}

const FLAGS: [FlagSet; 6] = [
    FlagSet::CF,
    FlagSet::PF,
    FlagSet::AF,
    FlagSet::ZF,
    FlagSet::SF,
    FlagSet::OF,
];

proptest! {
    #[test]
    fn single_alu_op_matches_eager(
        op in alu_op_strategy(),
        a in any::<u32>(),
        b in any::<u32>(),
        carry in any::<bool>(),
        width in width_strategy(),
    ) {
        let (result, lazy) = alu(op, a, b, carry, width);
        let (expected, flags) = eager_alu(op, a, b, carry, width);
        prop_assert_eq!(result, expected);
        prop_assert_eq!(lazy.resolve_bits(FlagSet::ARITH), flags);
    }

    #[test]
    fn lazy_history_never_disagrees_with_eager(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let mut lazy = FlagState::default();
        let mut eager = 0u32;

        for step in steps {
            match step {
                Step::Alu(op, a, b, width) => {
                    let carry = lazy.get(FlagSet::CF);
                    prop_assert_eq!(carry, eager & FlagSet::CF.eflags_mask() != 0);
                    let (_, record) = alu(op, a, b, carry, width);
                    lazy.stage(record, FlagSet::ARITH);
                    eager = eager_alu(op, a, b, carry, width).1;
                }
                Step::Inc(a, width) | Step::Dec(a, width) => {
                    let (kind, alu_op) = match step {
                        Step::Inc(..) => (FlagOp::Add, AluOp::Add),
                        _ => (FlagOp::Sub, AluOp::Sub),
                    };
                    let (r, _) = alu(alu_op, a, 1, false, width);
                    lazy.stage(LazyFlags::new(kind, width, a & width.mask(), 1, r), FlagSet::OSZAP);
                    let oszap = FlagSet::OSZAP.eflags_mask();
                    let fresh = eager_alu(alu_op, a, 1, false, width).1;
                    eager = (eager & !oszap) | (fresh & oszap);
                }
                Step::Read(i) => {
                    let flag = FLAGS[usize::from(i)];
                    prop_assert_eq!(lazy.peek(flag), eager & flag.eflags_mask() != 0);
                }
                Step::Cache(i) => {
                    let flag = FLAGS[usize::from(i)];
                    prop_assert_eq!(lazy.get(flag), eager & flag.eflags_mask() != 0);
                }
            }
            prop_assert_eq!(lazy.peek_eflags() & ARITH_MASK, eager);
        }
        prop_assert_eq!(lazy.eflags() & ARITH_MASK, eager);
    }

    #[test]
    fn rotate_through_carry_is_periodic_in_width_plus_one(
        left in any::<bool>(),
        x in any::<u32>(),
        cf in any::<bool>(),
        count in 1u32..32,
        width in prop_oneof![Just(Width::W8), Just(Width::W16)],
    ) {
        let op = if left { ShiftOp::Rcl } else { ShiftOp::Rcr };
        let full = rotate(op, x, cf, count, width).unwrap();
        let reduced = count % (width.bits() + 1);
        if reduced == 0 {
            prop_assert_eq!(full.result, x & width.mask());
            prop_assert_eq!(full.cf, cf);
        } else {
            let short = rotate(op, x, cf, reduced, width).unwrap();
            prop_assert_eq!((full.result, full.cf), (short.result, short.cf));
        }
    }

    #[test]
    fn rotate_through_carry_matches_single_steps(
        left in any::<bool>(),
        x in any::<u32>(),
        cf in any::<bool>(),
        count in 1u32..32,
        width in width_strategy(),
    ) {
        let op = if left { ShiftOp::Rcl } else { ShiftOp::Rcr };
        let mut value = x & width.mask();
        let mut carry = cf;
        for _ in 0..count {
            let step = rotate(op, value, carry, 1, width).unwrap();
            value = step.result;
            carry = step.cf;
        }
        let whole = rotate(op, x, cf, count, width).unwrap();
        prop_assert_eq!((whole.result, whole.cf), (value, carry));
    }

    #[test]
    fn unsigned_divide_faults_exactly_when_the_quotient_does_not_fit(
        dividend in any::<u64>(),
        divisor in any::<u32>(),
        width in width_strategy(),
    ) {
        let dividend = dividend & ((1u64 << (2 * width.bits())) - 1);
        let d = u64::from(divisor & width.mask());
        match div_unsigned(dividend, divisor, width) {
            Err(e) => {
                prop_assert_eq!(e, Exception::DivideError);
                prop_assert!(d == 0 || dividend / d > u64::from(width.mask()));
            }
            Ok((q, r)) => {
                prop_assert!(d != 0);
                prop_assert_eq!(u64::from(q) * d + u64::from(r), dividend);
                prop_assert!(u64::from(r) < d);
            }
        }
    }

    #[test]
    fn signed_divide_faults_exactly_when_the_quotient_does_not_fit(
        dividend in any::<i64>(),
        divisor in any::<u32>(),
        width in width_strategy(),
    ) {
        let shift = 64 - 2 * width.bits();
        let dividend = (dividend << shift) >> shift;
        let d = signed(divisor, width);
        match div_signed(dividend, divisor, width) {
            Err(e) => {
                prop_assert_eq!(e, Exception::DivideError);
                prop_assert!(dividend.checked_div(d).map_or(true, |q| !fits_signed(q, width)));
            }
            Ok((q, r)) => {
                prop_assert!(d != 0);
                prop_assert_eq!(signed(q, width) * d + signed(r, width), dividend);
            }
        }
    }

    #[test]
    fn faulting_div_instruction_leaves_registers_alone(
        eax in any::<u32>(),
        edx in any::<u32>(),
        ecx in any::<u32>(),
    ) {
        let mut bus = FlatBus::new(0x2000);
        // div ecx
        bus.load(0x1000, &[0xF7, 0xF1]);
        let mut cpu = CpuState::flat32();
        cpu.eip = 0x1000;
        cpu.gpr[0] = eax;
        cpu.gpr[1] = ecx;
        cpu.gpr[2] = edx;
        let before = cpu.gpr;
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        let dividend = (u64::from(edx) << 32) | u64::from(eax);
        let fits = ecx != 0 && dividend / u64::from(ecx) <= u64::from(u32::MAX);

        let branch = block.execute(&mut cpu, &mut bus);
        if fits {
            prop_assert_eq!(branch, Branch::None);
            prop_assert_eq!(u64::from(cpu.gpr[0]), dividend / u64::from(ecx));
            prop_assert_eq!(u64::from(cpu.gpr[2]), dividend % u64::from(ecx));
        } else {
            prop_assert_eq!(branch, Branch::Fault);
            prop_assert_eq!(cpu.gpr, before);
        }
    }
}
