//! The block-at-a-time execution loop.

mod dispatch;

pub use dispatch::{Event, ExceptionDispatch, RealModeIvt, RecordingDispatch};

use pcx_x86::DecodeError;
use thiserror::Error;
use tracing::warn;

use crate::block::{AssembleError, BlockTier, CodeBlock};
use crate::exception::PendingFault;
use crate::interp::Branch;
use crate::jit::{CodeBlockManager, JitConfig};
use crate::mem::CpuBus;
use crate::state::CpuState;

/// The only failure that stops execution. Processor faults are delivered to the guest instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("cannot execute instruction at {linear:#010x}: {error}")]
    Unimplemented { linear: u32, error: DecodeError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    InterruptDelivered,
    /// The processor is halted with nothing to wake it.
    Halted,
    Block {
        tier: BlockTier,
        /// `eip` the block was entered at.
        entry: u32,
        branch: Branch,
        /// Instructions that completed; a faulting instruction does not count.
        instructions: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    Halted,
    /// Ran the requested number of blocks.
    Budget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    pub stop: RunStop,
    pub blocks: u64,
    pub instructions: u64,
}

#[derive(Debug)]
pub struct ExecDispatcher {
    blocks: CodeBlockManager,
}

impl ExecDispatcher {
    pub fn new(config: JitConfig) -> Self {
        Self {
            blocks: CodeBlockManager::new(config),
        }
    }

    pub fn blocks(&self) -> &CodeBlockManager {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut CodeBlockManager {
        &mut self.blocks
    }

    /// Deliver a pending interrupt or run one block.
    pub fn step(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dispatch: &mut dyn ExceptionDispatch,
    ) -> Result<StepOutcome, ExecError> {
        if cpu.interrupts_enabled() {
            if let Some(vector) = cpu.take_irq() {
                cpu.halted = false;
                dispatch.deliver(cpu, bus, Event::Interrupt(vector));
                return Ok(StepOutcome::InterruptDelivered);
            }
        }
        if cpu.halted {
            return Ok(StepOutcome::Halted);
        }

        let entry = cpu.eip;
        let block = match self.blocks.get_block(cpu, bus) {
            Ok(block) => block,
            Err(AssembleError::Fault(exception)) => {
                let fault = PendingFault {
                    exception,
                    eip: entry,
                };
                dispatch.deliver(cpu, bus, Event::Fault(fault));
                return Ok(StepOutcome::Block {
                    tier: BlockTier::Interpreted,
                    entry,
                    branch: Branch::Fault,
                    instructions: 0,
                });
            }
            Err(AssembleError::Decode(error)) => {
                let linear = cpu.linear_ip();
                warn!(linear, %error, "stopping at unimplemented instruction");
                return Err(ExecError::Unimplemented { linear, error });
            }
        };

        let (current, branch) = self.blocks.execute_installed(&block, cpu, bus);
        let mut instructions = current.x86_count() as u64;
        if branch == Branch::Fault {
            if let Some(fault) = cpu.take_pending_fault() {
                instructions = retired_before(current.as_ref(), entry, fault.eip, cpu);
                dispatch.deliver(cpu, bus, Event::Fault(fault));
            }
        }
        Ok(StepOutcome::Block {
            tier: current.tier(),
            entry,
            branch,
            instructions,
        })
    }

    /// Step until the processor halts or `max_blocks` blocks have run.
    pub fn run(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        dispatch: &mut dyn ExceptionDispatch,
        max_blocks: u64,
    ) -> Result<RunExit, ExecError> {
        let mut exit = RunExit {
            stop: RunStop::Budget,
            blocks: 0,
            instructions: 0,
        };
        while exit.blocks < max_blocks {
            match self.step(cpu, bus, dispatch)? {
                StepOutcome::Halted => {
                    exit.stop = RunStop::Halted;
                    break;
                }
                StepOutcome::InterruptDelivered => {}
                StepOutcome::Block { instructions, .. } => {
                    exit.blocks += 1;
                    exit.instructions += instructions;
                }
            }
        }
        Ok(exit)
    }
}

/// Executables of `block` that ran before the one at `fault_eip`.
fn retired_before(block: &dyn CodeBlock, entry: u32, fault_eip: u32, cpu: &CpuState) -> u64 {
    let offset = fault_eip.wrapping_sub(entry) & cpu.code_size().ip_mask();
    block
        .executables()
        .iter()
        .take_while(|exe| exe.offset() < offset)
        .count() as u64
}
