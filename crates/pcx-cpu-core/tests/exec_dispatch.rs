use std::cell::RefCell;
use std::rc::Rc;

use pcx_cpu_core::exec::{
    Event, ExecDispatcher, ExecError, RealModeIvt, RecordingDispatch, RunStop, StepOutcome,
};
use pcx_cpu_core::interp::x87::{FSW_IE, FSW_ZE};
use pcx_cpu_core::jit::JitConfig;
use pcx_cpu_core::{
    BlockAssembler, Branch, CodeBlock, CpuBus, CpuState, Exception, FlatBus, PendingFault,
    PortDevice,
};
use pcx_x86::{SegReg, Width};
use proptest::prelude::*;

fn dispatcher() -> ExecDispatcher {
    ExecDispatcher::new(JitConfig {
        worker_threads: 0,
        ..JitConfig::with_threshold(16)
    })
}

fn real_mode(bus: &mut FlatBus, ip: u16, code: &[u8]) -> CpuState {
    bus.load(u32::from(ip), code);
    let mut cpu = CpuState::new();
    cpu.eip = u32::from(ip);
    cpu.gpr[4] = 0x7000;
    cpu
}

fn set_vector(bus: &mut FlatBus, vector: u8, cs: u16, ip: u16) {
    let entry = u32::from(vector) * 4;
    bus.write_u16(entry, ip).unwrap();
    bus.write_u16(entry + 2, cs).unwrap();
}

#[test]
fn divide_error_is_delivered_through_the_ivt() {
    let mut bus = FlatBus::new(0x20000);
    // handler: mov bx, 0x55; hlt
    bus.load(0x500, &[0xBB, 0x55, 0x00, 0xF4]);
    set_vector(&mut bus, 0, 0, 0x500);
    // xor dx, dx; mov ax, 10; xor cx, cx; div cx; hlt
    let code = [0x31, 0xD2, 0xB8, 0x0A, 0x00, 0x31, 0xC9, 0xF7, 0xF1, 0xF4];
    let mut cpu = real_mode(&mut bus, 0x7C00, &code);

    let mut ivt = RealModeIvt::new();
    let exit = dispatcher().run(&mut cpu, &mut bus, &mut ivt, 100).unwrap();

    assert_eq!(exit.stop, RunStop::Halted);
    assert_eq!(exit.blocks, 2);
    assert_eq!(exit.instructions, 3 + 2);
    assert!(ivt.unhandled.is_empty());
    assert_eq!(cpu.gpr[3] & 0xFFFF, 0x55);
    assert_eq!(cpu.gpr[0] & 0xFFFF, 10, "faulting div leaves AX alone");
    // Return frame: IP of the div, CS 0.
    assert_eq!(cpu.sp(), 0x7000 - 6);
    assert_eq!(bus.read_u16(0x7000 - 6).unwrap(), 0x7C07);
    assert_eq!(bus.read_u16(0x7000 - 4).unwrap(), 0);
}

#[test]
fn external_interrupt_wakes_a_halted_processor() {
    let mut bus = FlatBus::new(0x20000);
    // handler: mov cx, 0x77; hlt
    bus.load(0x600, &[0xB9, 0x77, 0x00, 0xF4]);
    set_vector(&mut bus, 8, 0, 0x600);
    // sti; hlt
    let mut cpu = real_mode(&mut bus, 0x7C00, &[0xFB, 0xF4]);

    let mut ivt = RealModeIvt::new();
    let mut exec = dispatcher();
    let exit = exec.run(&mut cpu, &mut bus, &mut ivt, 100).unwrap();
    assert_eq!(exit.stop, RunStop::Halted);
    assert!(cpu.halted);

    cpu.assert_irq(8);
    assert_eq!(
        exec.step(&mut cpu, &mut bus, &mut ivt).unwrap(),
        StepOutcome::InterruptDelivered
    );
    assert!(!cpu.halted);
    assert!(!cpu.interrupts_enabled());
    exec.run(&mut cpu, &mut bus, &mut ivt, 100).unwrap();
    assert_eq!(cpu.gpr[1] & 0xFFFF, 0x77);
    assert_eq!(bus.read_u16(0x7000 - 6).unwrap(), 0x7C02, "returns after the hlt");
}

#[test]
fn interrupts_stay_pending_while_if_is_clear() {
    let mut bus = FlatBus::new(0x20000);
    let mut cpu = real_mode(&mut bus, 0x7C00, &[0xF4]);
    cpu.assert_irq(8);
    let mut ivt = RealModeIvt::new();
    let exit = dispatcher().run(&mut cpu, &mut bus, &mut ivt, 10).unwrap();
    assert_eq!(exit.stop, RunStop::Halted);
    assert_eq!(cpu.pending_irq(), Some(8));
}

/// Records writes and answers every read with a fixed byte.
struct Latch(Rc<RefCell<Vec<(u16, Width, u32)>>>);

impl PortDevice for Latch {
    fn read(&mut self, _port: u16, _width: Width) -> u32 {
        0x5A
    }

    fn write(&mut self, port: u16, width: Width, value: u32) {
        self.0.borrow_mut().push((port, width, value));
    }
}

#[test]
fn port_io_reaches_registered_devices() {
    let mut bus = FlatBus::new(0x20000);
    let writes = Rc::new(RefCell::new(Vec::new()));
    bus.ports_mut()
        .register(0x80..=0x80, Box::new(Latch(Rc::clone(&writes))));
    // mov al, 0x41; out 0x80, al; mov dx, 0x80; in al, dx; mov dx, 0x81; in al, dx; hlt
    let code = [
        0xB0, 0x41, 0xE6, 0x80, 0xBA, 0x80, 0x00, 0xEC, 0x88, 0xC3, 0xBA, 0x81, 0x00, 0xEC, 0xF4,
    ];
    let mut cpu = real_mode(&mut bus, 0x7C00, &code);

    let exit = dispatcher()
        .run(&mut cpu, &mut bus, &mut RecordingDispatch::new(), 10)
        .unwrap();
    assert_eq!(exit.stop, RunStop::Halted);
    assert_eq!(*writes.borrow(), vec![(0x80, Width::W8, 0x41)]);
    assert_eq!(cpu.gpr[3] & 0xFF, 0x5A, "read from the device");
    assert_eq!(cpu.gpr[0] & 0xFF, 0xFF, "unclaimed ports float high");
}

#[test]
fn rep_movs_fault_leaves_a_resumable_state() {
    let mut bus = FlatBus::new(0x1000);
    bus.load(0x100, b"abcd");
    // rep movsb; hlt
    bus.load(0x10, &[0xF3, 0xA4, 0xF4]);
    let mut cpu = CpuState::flat32();
    cpu.eip = 0x10;
    cpu.gpr[6] = 0x100;
    cpu.gpr[7] = 0xFFE;
    cpu.gpr[1] = 4;

    let mut exec = dispatcher();
    let mut record = RecordingDispatch::new();
    let outcome = exec.step(&mut cpu, &mut bus, &mut record).unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Block {
            tier: pcx_cpu_core::BlockTier::Interpreted,
            entry: 0x10,
            branch: Branch::Fault,
            instructions: 0,
        }
    );
    assert_eq!(
        record.events,
        vec![Event::Fault(PendingFault {
            exception: Exception::PageFault {
                addr: 0x1000,
                code: 2
            },
            eip: 0x10,
        })]
    );
    assert_eq!(cpu.eip, 0x10);
    assert_eq!((cpu.gpr[1], cpu.gpr[6], cpu.gpr[7]), (2, 0x102, 0x1000));
    assert_eq!(bus.slice(0xFFE, 2), b"ab");

    // A handler that "maps" the destination elsewhere lets the copy finish.
    cpu.halted = false;
    cpu.gpr[7] = 0x200;
    let exit = exec.run(&mut cpu, &mut bus, &mut record, 10).unwrap();
    assert_eq!(exit.stop, RunStop::Halted);
    assert_eq!(cpu.gpr[1], 0);
    assert_eq!(bus.slice(0x200, 2), b"cd");
    assert_eq!(record.events.len(), 1);
}

const GDT: u32 = 0x800;

fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    u64::from(limit & 0xFFFF)
        | (u64::from(base & 0xFF_FFFF) << 16)
        | (u64::from(access) << 40)
        | (u64::from((limit >> 16) & 0xF) << 48)
        | (u64::from(flags & 0xF) << 52)
        | (u64::from(base >> 24) << 56)
}

fn protected(code: &[u8]) -> (CpuState, FlatBus) {
    let mut bus = FlatBus::new(0x10000);
    let gdt = [
        0,
        descriptor(0, 0xFFFFF, 0x9A, 0xC),
        descriptor(0, 0xFFFFF, 0x92, 0xC),
        // Present bit clear.
        descriptor(0, 0xFFFFF, 0x12, 0xC),
    ];
    for (i, entry) in gdt.iter().enumerate() {
        bus.load(GDT + i as u32 * 8, &entry.to_le_bytes());
    }
    bus.load(0x1000, code);
    let mut cpu = CpuState::flat32();
    cpu.gdtr.base = GDT;
    cpu.gdtr.limit = 0x1F;
    cpu.eip = 0x1000;
    cpu.gpr[4] = 0x9000;
    (cpu, bus)
}

fn first_fault(cpu: &mut CpuState, bus: &mut FlatBus) -> PendingFault {
    let mut record = RecordingDispatch::new();
    dispatcher().run(cpu, bus, &mut record, 10).unwrap();
    let fault = *record.faults().next().expect("a fault");
    fault
}

#[test]
fn not_present_data_segment_faults_with_its_selector() {
    // mov ax, 0x18; mov ds, ax; hlt
    let (mut cpu, mut bus) = protected(&[0x66, 0xB8, 0x18, 0x00, 0x8E, 0xD8, 0xF4]);
    let fault = first_fault(&mut cpu, &mut bus);
    assert_eq!(fault.exception, Exception::SegmentNotPresent(0x18));
    assert_eq!(fault.eip, 0x1004);
    assert_eq!(cpu.seg(SegReg::Ds).selector, 0x10, "ds keeps its old value");
}

#[test]
fn null_stack_selector_is_a_general_protection_fault() {
    // xor eax, eax; mov ss, ax; hlt
    let (mut cpu, mut bus) = protected(&[0x31, 0xC0, 0x8E, 0xD0, 0xF4]);
    let fault = first_fault(&mut cpu, &mut bus);
    assert_eq!(fault.exception, Exception::GeneralProtection(0));
    assert_eq!(fault.eip, 0x1002);
}

#[test]
fn selector_past_the_gdt_limit_faults() {
    // mov ax, 0x28; mov es, ax; hlt
    let (mut cpu, mut bus) = protected(&[0x66, 0xB8, 0x28, 0x00, 0x8E, 0xC0, 0xF4]);
    let fault = first_fault(&mut cpu, &mut bus);
    assert_eq!(fault.exception, Exception::GeneralProtection(0x28));
}

#[test]
fn near_jump_past_the_code_limit_faults_before_moving_eip() {
    // jmp near +0x100
    let (mut cpu, mut bus) = protected(&[0xE9, 0x00, 0x01, 0x00, 0x00]);
    cpu.seg_mut(SegReg::Cs).cache.limit = 0x10FF;
    let fault = first_fault(&mut cpu, &mut bus);
    assert_eq!(fault.exception, Exception::GeneralProtection(0));
    assert_eq!(fault.eip, 0x1000);
    assert_eq!(cpu.eip, 0x1000);
}

#[test]
fn fpu_divide_by_zero_and_invalid_are_flagged() {
    // fld1; fldz; fdivp st(1), st(0); fnstsw ax; hlt
    let (mut cpu, mut bus) = protected(&[0xD9, 0xE8, 0xD9, 0xEE, 0xDE, 0xF9, 0xDF, 0xE0, 0xF4]);
    dispatcher()
        .run(&mut cpu, &mut bus, &mut RecordingDispatch::new(), 10)
        .unwrap();
    let sw = (cpu.gpr[0] & 0xFFFF) as u16;
    assert_ne!(sw & FSW_ZE, 0);
    assert_eq!(sw & FSW_IE, 0);
    assert_eq!((sw >> 11) & 7, 7, "one value left on the stack");
    assert_eq!(cpu.fpu.st(0), f64::INFINITY);

    // fldz; fldz; fdivp st(1), st(0); fnstsw ax; hlt
    let (mut cpu, mut bus) = protected(&[0xD9, 0xEE, 0xD9, 0xEE, 0xDE, 0xF9, 0xDF, 0xE0, 0xF4]);
    dispatcher()
        .run(&mut cpu, &mut bus, &mut RecordingDispatch::new(), 10)
        .unwrap();
    let sw = (cpu.gpr[0] & 0xFFFF) as u16;
    assert_ne!(sw & FSW_IE, 0);
    assert_eq!(sw & FSW_ZE, 0);
    assert!(cpu.fpu.st(0).is_nan());
}

#[test]
fn unimplemented_first_instruction_stops_execution() {
    // cpuid
    let (mut cpu, mut bus) = protected(&[0x0F, 0xA2]);
    let err = dispatcher()
        .step(&mut cpu, &mut bus, &mut RecordingDispatch::new())
        .unwrap_err();
    let ExecError::Unimplemented { linear, error } = err;
    assert_eq!(linear, 0x1000);
    assert!(error.is_unimplemented());
    assert!(error.to_string().contains("cpuid"));
}

proptest! {
    #[test]
    fn assembly_is_deterministic(
        code in prop::collection::vec(any::<u8>(), 1..48),
        big in any::<bool>(),
    ) {
        let assemble = || {
            let mut bus = FlatBus::new(0x1000);
            bus.load(0x100, &code);
            let mut cpu = if big { CpuState::flat32() } else { CpuState::new() };
            cpu.eip = 0x100;
            BlockAssembler::default()
                .assemble(&cpu, &mut bus)
                .map(|block| (block.x86_count(), block.x86_length(), block.executables().to_vec()))
        };
        prop_assert_eq!(assemble(), assemble());
    }
}
