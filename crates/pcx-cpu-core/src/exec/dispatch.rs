//! Delivery of faults and external interrupts to guest handlers.

use pcx_x86::{SegReg, Width};
use tracing::{debug, warn};

use crate::exception::{Exception, PendingFault};
use crate::flags::{FLAG_IF, FLAG_TF};
use crate::interp::stack::push;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, Segment};

/// Something the dispatcher has to hand to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A processor fault; `cpu.eip` already points at the faulting instruction.
    Fault(PendingFault),
    /// An external interrupt, taken at a block boundary.
    Interrupt(u8),
}

impl Event {
    pub fn vector(&self) -> u8 {
        match self {
            Event::Fault(fault) => fault.exception.vector(),
            Event::Interrupt(vector) => *vector,
        }
    }
}

/// Transfers control to the guest handler for an event.
pub trait ExceptionDispatch {
    fn deliver(&mut self, cpu: &mut CpuState, bus: &mut dyn CpuBus, event: Event);
}

/// Real-mode delivery through the interrupt vector table.
///
/// Other modes have no handler here; the event is logged and the processor halts.
#[derive(Debug, Default)]
pub struct RealModeIvt {
    /// Events that could not be delivered.
    pub unhandled: Vec<Event>,
}

impl RealModeIvt {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(cpu: &mut CpuState, bus: &mut dyn CpuBus, vector: u8) -> Result<(), Exception> {
        let slot = u32::from(vector) * 4;
        if slot + 3 > u32::from(cpu.idtr.limit) {
            return Err(Exception::GeneralProtection(u16::from(vector) * 8 + 2));
        }
        let entry = cpu.idtr.base.wrapping_add(slot);
        let ip = bus.read_u16(entry)?;
        let cs = bus.read_u16(entry.wrapping_add(2))?;

        let flags = cpu.eflags() & 0xFFFF;
        let ret_cs = u32::from(cpu.seg(SegReg::Cs).selector);
        let ret_ip = cpu.eip & 0xFFFF;
        push(cpu, bus, flags, Width::W16)?;
        push(cpu, bus, ret_cs, Width::W16)?;
        push(cpu, bus, ret_ip, Width::W16)?;

        cpu.flags.set_bit(FLAG_IF, false);
        cpu.flags.set_bit(FLAG_TF, false);
        *cpu.seg_mut(SegReg::Cs) = Segment::real(cs);
        cpu.eip = u32::from(ip);
        Ok(())
    }
}

impl ExceptionDispatch for RealModeIvt {
    fn deliver(&mut self, cpu: &mut CpuState, bus: &mut dyn CpuBus, event: Event) {
        if cpu.mode() != CpuMode::Real {
            warn!(?event, mode = ?cpu.mode(), "no handler for event outside real mode");
            self.unhandled.push(event);
            cpu.halted = true;
            return;
        }
        let vector = event.vector();
        match Self::enter(cpu, bus, vector) {
            Ok(()) => debug!(vector, cs = cpu.seg(SegReg::Cs).selector, ip = cpu.eip, "delivered"),
            Err(err) => {
                warn!(vector, %err, "fault while delivering event");
                self.unhandled.push(event);
                cpu.halted = true;
            }
        }
    }
}

/// Records every event and halts the processor.
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    pub events: Vec<Event>,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> impl Iterator<Item = &PendingFault> {
        self.events.iter().filter_map(|event| match event {
            Event::Fault(fault) => Some(fault),
            Event::Interrupt(_) => None,
        })
    }
}

impl ExceptionDispatch for RecordingDispatch {
    fn deliver(&mut self, cpu: &mut CpuState, _bus: &mut dyn CpuBus, event: Event) {
        self.events.push(event);
        cpu.halted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatBus;

    #[test]
    fn ivt_delivery_pushes_a_return_frame() {
        let mut bus = FlatBus::new(0x20000);
        // Vector 0 -> 1234:0010
        bus.load(0, &[0x10, 0x00, 0x34, 0x12]);
        let mut cpu = CpuState::new();
        *cpu.seg_mut(SegReg::Cs) = Segment::real(0x0700);
        cpu.eip = 0x42;
        cpu.gpr[4] = 0x8000;
        cpu.flags.set_bit(FLAG_IF, true);

        let mut ivt = RealModeIvt::new();
        let fault = PendingFault {
            exception: Exception::DivideError,
            eip: 0x42,
        };
        ivt.deliver(&mut cpu, &mut bus, Event::Fault(fault));

        assert!(ivt.unhandled.is_empty());
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x1234);
        assert_eq!(cpu.eip, 0x10);
        assert!(!cpu.interrupts_enabled());
        assert_eq!(cpu.sp(), 0x8000 - 6);
        assert_eq!(bus.slice(0x7FFA, 6), &[0x42, 0x00, 0x00, 0x07, 0x02, 0x02]);
    }

    #[test]
    fn protected_mode_events_halt() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = CpuState::flat32();
        let mut ivt = RealModeIvt::new();
        ivt.deliver(&mut cpu, &mut bus, Event::Interrupt(0x20));
        assert!(cpu.halted);
        assert_eq!(ivt.unhandled, vec![Event::Interrupt(0x20)]);
    }
}
