//! Block tiers: the code-block cache, execution counting and background recompilation.
//!
//! Every cached block sits behind a [`CountingBlock`]. Each time a wrapper's count reaches a
//! multiple of [`JitConfig::compile_threshold`] it offers itself to the [`BackgroundCompiler`],
//! whose workers rebuild the hottest queued blocks with a [`BlockOptimizer`] and swap the result
//! into the wrapper.

pub mod cache;
pub mod compiler;
pub mod counting;
pub mod manager;
pub mod optimize;
pub mod queue;

use std::time::Duration;

pub use cache::{CacheStats, CodeCache};
pub use compiler::{BackgroundCompiler, CompilerStats};
pub use counting::{CompileRequestSink, CompileState, CountingBlock, NoCompile};
pub use manager::CodeBlockManager;
pub use optimize::{
    BlockOptimizer, FlagLivenessOptimizer, IdentityOptimizer, OptimizedBlock, OptimizerKind,
};
pub use queue::{Admission, CompilerQueue, HeatTable, Offer, Taken};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// When false, wrappers still count executions but never request compilation.
    pub enabled: bool,
    /// A wrapper requests compilation each time its count reaches a multiple of this.
    pub compile_threshold: u64,
    pub queue_capacity: usize,
    /// Queue entries whose halved heat drops below this are evicted.
    pub decay_floor: u64,
    /// Background worker threads. Zero leaves compilation to explicit
    /// [`BackgroundCompiler::compile_pending`] calls.
    pub worker_threads: usize,
    /// How long an idle worker waits for work before checking for shutdown.
    pub idle_wait: Duration,
    /// Code-block cache capacity; the least recently used block goes first. Zero is unbounded.
    pub cache_max_blocks: usize,
    pub max_block_instructions: usize,
    pub max_block_bytes: u32,
    pub optimizer: OptimizerKind,
}

impl JitConfig {
    /// Defaults with a different threshold; the decay floor follows it.
    pub fn with_threshold(compile_threshold: u64) -> Self {
        Self {
            compile_threshold,
            decay_floor: (compile_threshold / 2).max(1),
            ..Self::default()
        }
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compile_threshold: 1024,
            queue_capacity: 256,
            decay_floor: 512,
            worker_threads: 1,
            idle_wait: Duration::from_millis(30),
            cache_max_blocks: 4096,
            max_block_instructions: 256,
            max_block_bytes: 4096,
            optimizer: OptimizerKind::Identity,
        }
    }
}
