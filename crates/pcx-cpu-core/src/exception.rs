//! Architectural exceptions raised by instruction execution and block assembly.

use thiserror::Error;

/// A processor exception, carrying its error code where the architecture defines one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Exception {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DB debug")]
    Debug,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#NP segment not present ({0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault ({0:#06x})")]
    StackFault(u16),
    #[error("#GP general protection ({0:#06x})")]
    GeneralProtection(u16),
    /// Raised by buses for accesses that hit nothing; `code` follows the page fault error code
    /// layout (bit 1 set for writes).
    #[error("#PF at {addr:#010x} (code {code:#x})")]
    PageFault { addr: u32, code: u16 },
}

impl Exception {
    pub const fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
        }
    }

    pub const fn error_code(self) -> Option<u16> {
        match self {
            Exception::SegmentNotPresent(code)
            | Exception::StackFault(code)
            | Exception::GeneralProtection(code) => Some(code),
            Exception::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// A fault recorded by an executable, waiting for the dispatcher to deliver it.
///
/// `eip` is the offset of the faulting instruction; the processor's `eip` has already been
/// unwound to it when this is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFault {
    pub exception: Exception,
    pub eip: u32,
}
