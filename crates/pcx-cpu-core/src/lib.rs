#![forbid(unsafe_code)]

//! Architectural state, block interpreter and background block compiler for a 32-bit x86 PC.
//!
//! Execution is organised around code blocks: straight runs of decoded instructions ending at the
//! first control transfer. [`exec::ExecDispatcher`] fetches the block for the current `cs:eip`
//! from the code cache (assembling it on a miss), runs it through its execution-counting wrapper
//! and delivers any fault it raised. Hot blocks are rebuilt off-thread by the [`jit`] workers.
//!
//! [`state::CpuState`] is owned by the interpreter thread alone; the workers only ever see block
//! metadata.

mod addr;
mod exception;
mod segment;

pub mod block;
pub mod exec;
pub mod flags;
pub mod interp;
pub mod jit;
pub mod mem;
pub mod state;

pub use addr::Access;
pub use block::{AssembleError, BlockAssembler, BlockKey, BlockTier, CodeBlock, InterpretedBlock};
pub use exception::{Exception, PendingFault};
pub use interp::{Branch, Executable};
pub use mem::{CpuBus, FlatBus, IoPortMap, PageVersionTracker, PortDevice};
pub use segment::parse_descriptor;
pub use state::{CpuMode, CpuState, Segment, SegmentCache};
