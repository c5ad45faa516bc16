//! Recompilation strategies run by the background workers.

use std::fmt;
use std::sync::Arc;

use pcx_x86::FlagSet;

use crate::block::{BlockKey, BlockTier, CodeBlock};
use crate::interp::Executable;
use crate::mem::PageStamp;

/// Turns a block into a faster equivalent. Runs on worker threads and never sees processor
/// state.
pub trait BlockOptimizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `None` means the block has nothing worth rewriting.
    fn optimize(&self, block: &dyn CodeBlock) -> Option<Arc<dyn CodeBlock>>;
}

/// A block rebuilt by an optimizer.
#[derive(Debug, Clone)]
pub struct OptimizedBlock {
    key: BlockKey,
    executables: Vec<Executable>,
    length: u32,
    pages: Vec<PageStamp>,
    optimizer: &'static str,
}

impl OptimizedBlock {
    pub fn new(source: &dyn CodeBlock, executables: Vec<Executable>, optimizer: &'static str) -> Self {
        Self {
            key: source.key(),
            executables,
            length: source.x86_length(),
            pages: source.pages().to_vec(),
            optimizer,
        }
    }

    pub fn optimizer(&self) -> &'static str {
        self.optimizer
    }
}

impl CodeBlock for OptimizedBlock {
    fn key(&self) -> BlockKey {
        self.key
    }

    fn executables(&self) -> &[Executable] {
        &self.executables
    }

    fn x86_length(&self) -> u32 {
        self.length
    }

    fn pages(&self) -> &[PageStamp] {
        &self.pages
    }

    fn tier(&self) -> BlockTier {
        BlockTier::Optimized
    }
}

/// Re-emits the same executables. Never rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOptimizer;

impl BlockOptimizer for IdentityOptimizer {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn optimize(&self, block: &dyn CodeBlock) -> Option<Arc<dyn CodeBlock>> {
        Some(Arc::new(OptimizedBlock::new(
            block,
            block.executables().to_vec(),
            self.name(),
        )))
    }
}

/// Drops lazy flag staging from instructions whose flag outputs are all overwritten before
/// anything reads them.
///
/// Liveness runs backwards from the block exit, where every arithmetic flag is live. An
/// instruction that may fault also makes every flag live, since the fault handler sees them,
/// and is itself never rewritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagLivenessOptimizer;

impl FlagLivenessOptimizer {
    /// Indices of the executables whose staging can be skipped.
    pub fn dead_flag_writers(executables: &[Executable]) -> Vec<usize> {
        let mut live = FlagSet::ARITH;
        let mut dead = Vec::new();
        for (i, exe) in executables.iter().enumerate().rev() {
            let inst = exe.inst();
            let written = inst.flags_written();
            let faults = inst.may_fault();
            if !faults
                && exe.stages_lazily()
                && exe.stages_flags()
                && !written.is_empty()
                && (written & live).is_empty()
            {
                dead.push(i);
            }
            live = (live - written) | inst.flags_read();
            if faults {
                live = FlagSet::ARITH;
            }
        }
        dead.reverse();
        dead
    }
}

impl BlockOptimizer for FlagLivenessOptimizer {
    fn name(&self) -> &'static str {
        "flag-liveness"
    }

    fn optimize(&self, block: &dyn CodeBlock) -> Option<Arc<dyn CodeBlock>> {
        let dead = Self::dead_flag_writers(block.executables());
        if dead.is_empty() {
            return None;
        }
        let executables = block
            .executables()
            .iter()
            .enumerate()
            .map(|(i, exe)| {
                if dead.binary_search(&i).is_ok() {
                    exe.without_flag_staging()
                } else {
                    exe.clone()
                }
            })
            .collect();
        Some(Arc::new(OptimizedBlock::new(block, executables, self.name())))
    }
}

/// Which optimizer the background workers run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    #[default]
    Identity,
    FlagLiveness,
}

impl OptimizerKind {
    pub fn build(self) -> Arc<dyn BlockOptimizer> {
        match self {
            OptimizerKind::Identity => Arc::new(IdentityOptimizer),
            OptimizerKind::FlagLiveness => Arc::new(FlagLivenessOptimizer),
        }
    }
}

impl std::str::FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(OptimizerKind::Identity),
            "flag-liveness" => Ok(OptimizerKind::FlagLiveness),
            other => Err(format!("unknown optimizer `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockAssembler;
    use crate::mem::FlatBus;
    use crate::state::CpuState;

    fn assemble(code: &[u8]) -> crate::block::InterpretedBlock {
        let mut bus = FlatBus::new(0x1000);
        bus.load(0x100, code);
        let mut cpu = CpuState::flat32();
        cpu.eip = 0x100;
        BlockAssembler::default().assemble(&cpu, &mut bus).unwrap()
    }

    #[test]
    fn overwritten_flags_are_dead() {
        // add eax, ebx; sub ecx, edx; cmp eax, ecx; jz +0
        let block = assemble(&[0x01, 0xD8, 0x29, 0xD1, 0x39, 0xC8, 0x74, 0x00]);
        assert_eq!(FlagLivenessOptimizer::dead_flag_writers(block.executables()), vec![0, 1]);
    }

    #[test]
    fn flags_read_in_between_stay_live() {
        // add eax, ebx; adc ecx, edx; cmp eax, ecx; jz +0
        let block = assemble(&[0x01, 0xD8, 0x11, 0xD1, 0x39, 0xC8, 0x74, 0x00]);
        assert_eq!(FlagLivenessOptimizer::dead_flag_writers(block.executables()), vec![1]);
    }

    #[test]
    fn nothing_to_elide_is_rejected() {
        // add eax, ebx; jmp +0
        let block = assemble(&[0x01, 0xD8, 0xEB, 0x00]);
        assert!(FlagLivenessOptimizer.optimize(&block).is_none());
        let same = IdentityOptimizer.optimize(&block).unwrap();
        assert_eq!(same.tier(), BlockTier::Optimized);
        assert_eq!(same.executables(), block.executables());
    }

    #[test]
    fn optimizer_names_parse() {
        for kind in [OptimizerKind::Identity, OptimizerKind::FlagLiveness] {
            assert_eq!(kind.build().name().parse::<OptimizerKind>(), Ok(kind));
        }
        assert!("llvm".parse::<OptimizerKind>().is_err());
    }
}
