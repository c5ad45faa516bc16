use std::sync::Arc;

use tracing::trace;

use crate::block::{AssembleError, BlockAssembler, BlockKey, CodeBlock};
use crate::interp::Branch;
use crate::jit::cache::{CacheStats, CodeCache};
use crate::jit::compiler::{BackgroundCompiler, CompilerStats};
use crate::jit::counting::{CountingBlock, NoCompile};
use crate::jit::JitConfig;
use crate::mem::CpuBus;
use crate::state::CpuState;

/// Front door to the block tiers: looks blocks up, assembles and wraps them on a miss, and runs
/// them through their counting wrapper.
#[derive(Debug)]
pub struct CodeBlockManager {
    config: JitConfig,
    assembler: BlockAssembler,
    cache: CodeCache,
    compiler: Option<BackgroundCompiler>,
}

impl CodeBlockManager {
    pub fn new(config: JitConfig) -> Self {
        let assembler = BlockAssembler {
            max_instructions: config.max_block_instructions,
            max_bytes: config.max_block_bytes,
        };
        let compiler = config
            .enabled
            .then(|| BackgroundCompiler::new(&config, config.optimizer.build()));
        Self {
            cache: CodeCache::new(config.cache_max_blocks),
            assembler,
            compiler,
            config,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn compiler(&self) -> Option<&BackgroundCompiler> {
        self.compiler.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn compiler_stats(&self) -> CompilerStats {
        self.compiler
            .as_ref()
            .map(BackgroundCompiler::stats)
            .unwrap_or_default()
    }

    /// The wrapper for the block at the processor's current `cs:eip`.
    ///
    /// A block that does not [fit](CodeBlock::fits) the current code segment is run from a
    /// fresh, uncached wrapper instead: its bytes under this alias are not the cached ones.
    pub fn get_block(
        &mut self,
        cpu: &CpuState,
        bus: &mut dyn CpuBus,
    ) -> Result<Arc<CountingBlock>, AssembleError> {
        let key = BlockKey::for_state(cpu);
        if let Some(block) = self.cache.lookup(&key, &*bus) {
            if block.current().fits(cpu) {
                return Ok(block);
            }
            trace!(start = key.start, eip = cpu.eip, "cached block does not fit this alias");
            return self.assemble_uncached(cpu, bus);
        }
        trace!(start = key.start, mode = ?key.mode, "code cache miss");

        let block = self.assembler.assemble(cpu, bus)?;
        if !block.fits(cpu) {
            trace!(start = key.start, "block wraps the instruction pointer, not caching it");
            return Ok(Arc::new(CountingBlock::new(Arc::new(block), 0)));
        }
        let threshold = if self.config.enabled {
            self.config.compile_threshold
        } else {
            0
        };
        let wrapped = Arc::new(CountingBlock::new(Arc::new(block), threshold));
        for evicted in self.cache.insert(Arc::clone(&wrapped)) {
            trace!(start = evicted.start, "evicted block");
        }
        Ok(wrapped)
    }

    fn assemble_uncached(
        &self,
        cpu: &CpuState,
        bus: &mut dyn CpuBus,
    ) -> Result<Arc<CountingBlock>, AssembleError> {
        let block = self.assembler.assemble(cpu, bus)?;
        Ok(Arc::new(CountingBlock::new(Arc::new(block), 0)))
    }

    pub fn execute(
        &self,
        block: &Arc<CountingBlock>,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
    ) -> Branch {
        self.execute_installed(block, cpu, bus).1
    }

    /// Run `block`, returning the installed block that ran along with its branch.
    pub fn execute_installed(
        &self,
        block: &Arc<CountingBlock>,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
    ) -> (Arc<dyn CodeBlock>, Branch) {
        match &self.compiler {
            Some(compiler) => block.execute_installed(cpu, bus, compiler),
            None => block.execute_installed(cpu, bus, &NoCompile),
        }
    }

    /// Drop cached blocks overlapping `[addr, addr + len)`.
    pub fn invalidate_range(&mut self, addr: u32, len: u32) -> usize {
        self.cache.invalidate_range(addr, len)
    }

    pub fn flush(&mut self) {
        self.cache.clear();
    }
}
