//! The execution-counting wrapper every cached block lives behind.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::{BlockKey, BlockTier, CodeBlock};
use crate::interp::Branch;
use crate::mem::CpuBus;
use crate::state::CpuState;

/// Where a wrapper is in the background compilation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompileState {
    /// Running the assembled block; not waiting for a worker.
    Cold = 0,
    Queued = 1,
    /// A worker swapped in an optimized block.
    Compiled = 2,
    /// The optimizer had nothing to offer. The wrapper may be queued again.
    Rejected = 3,
}

impl CompileState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CompileState::Queued,
            2 => CompileState::Compiled,
            3 => CompileState::Rejected,
            _ => CompileState::Cold,
        }
    }
}

/// Receiver of compile requests raised on the interpreter thread. Must never block.
pub trait CompileRequestSink {
    /// Offer `block`, which has run `heat` times. Returns whether it was queued.
    fn request_compile(&self, block: &Arc<CountingBlock>, heat: u64) -> bool;
}

/// Sink used when no compiler is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompile;

impl CompileRequestSink for NoCompile {
    fn request_compile(&self, _block: &Arc<CountingBlock>, _heat: u64) -> bool {
        false
    }
}

/// Wraps the block for one cache key, counts its executions and asks for a compile each time
/// the count reaches a multiple of the threshold.
///
/// The interpreter always goes through the wrapper, so installing an optimized block is a
/// single reference swap that the very next execution observes.
#[derive(Debug)]
pub struct CountingBlock {
    key: BlockKey,
    length: u32,
    target: RwLock<Arc<dyn CodeBlock>>,
    count: AtomicU64,
    state: AtomicU8,
    threshold: u64,
}

impl CountingBlock {
    /// A `threshold` of zero never requests compilation.
    pub fn new(block: Arc<dyn CodeBlock>, threshold: u64) -> Self {
        Self {
            key: block.key(),
            length: block.x86_length(),
            target: RwLock::new(block),
            count: AtomicU64::new(0),
            state: AtomicU8::new(CompileState::Cold as u8),
            threshold,
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn x86_length(&self) -> u32 {
        self.length
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn state(&self) -> CompileState {
        CompileState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The block currently installed.
    pub fn current(&self) -> Arc<dyn CodeBlock> {
        Arc::clone(&self.target.read())
    }

    pub fn tier(&self) -> BlockTier {
        self.target.read().tier()
    }

    pub fn is_still_valid(&self, bus: &dyn CpuBus) -> bool {
        self.target.read().is_still_valid(bus)
    }

    /// Run the installed block once, requesting a compile when the count crosses the threshold.
    pub fn execute(
        self: &Arc<Self>,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        sink: &dyn CompileRequestSink,
    ) -> Branch {
        self.execute_installed(cpu, bus, sink).1
    }

    /// Like [`execute`](Self::execute), also returning the block that actually ran. A worker may
    /// install a new block at any point, so [`current`](Self::current) read before or after
    /// can name a different one.
    pub fn execute_installed(
        self: &Arc<Self>,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
        sink: &dyn CompileRequestSink,
    ) -> (Arc<dyn CodeBlock>, Branch) {
        let count = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if self.threshold != 0 && count % self.threshold == 0 {
            self.request(count, sink);
        }
        let block = self.current();
        let branch = block.execute(cpu, bus);
        (block, branch)
    }

    fn request(self: &Arc<Self>, heat: u64, sink: &dyn CompileRequestSink) {
        for from in [CompileState::Cold, CompileState::Rejected] {
            if self.transition(from, CompileState::Queued) {
                if !sink.request_compile(self, heat) {
                    self.state.store(from as u8, Ordering::Release);
                }
                return;
            }
        }
    }

    fn transition(&self, from: CompileState, to: CompileState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Swap in an optimized block.
    pub fn install(&self, block: Arc<dyn CodeBlock>) {
        *self.target.write() = block;
        self.state.store(CompileState::Compiled as u8, Ordering::Release);
    }

    pub fn reject(&self) {
        self.state.store(CompileState::Rejected as u8, Ordering::Release);
    }

    /// Called when the queue drops the wrapper without compiling it.
    pub fn dequeued(&self) {
        self.transition(CompileState::Queued, CompileState::Cold);
    }
}
