//! Background recompilation of hot blocks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::jit::counting::{CompileRequestSink, CountingBlock};
use crate::jit::optimize::BlockOptimizer;
use crate::jit::queue::{Admission, CompilerQueue, Popped};
use crate::jit::JitConfig;

/// Point-in-time copy of the compiler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompilerStats {
    pub enqueued: u64,
    /// Requests refused because the queue was full, busy or closed.
    pub dropped: u64,
    pub displaced: u64,
    /// Wrappers that decayed out of the queue.
    pub evicted: u64,
    pub compiled: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    displaced: AtomicU64,
    evicted: AtomicU64,
    compiled: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CompilerStats {
        CompilerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            compiled: self.compiled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Shared {
    queue: CompilerQueue,
    optimizer: Arc<dyn BlockOptimizer>,
    counters: Counters,
    shutdown: AtomicBool,
    idle_wait: Duration,
}

impl Shared {
    /// Compile one popped wrapper. Whatever happens, the wrapper keeps a runnable block.
    fn compile(&self, popped: Popped) {
        self.counters
            .evicted
            .fetch_add(popped.evicted as u64, Ordering::Relaxed);
        let block = popped.block;
        let source = block.current();
        let start = block.key().start;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.optimizer.optimize(source.as_ref())
        }));
        match result {
            Ok(Some(optimized)) => {
                block.install(optimized);
                self.counters.compiled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    start,
                    heat = popped.heat,
                    optimizer = self.optimizer.name(),
                    "installed optimized block"
                );
            }
            Ok(None) => {
                block.reject();
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(start, optimizer = self.optimizer.name(), "optimizer rejected block");
            }
            Err(_) => {
                block.reject();
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(start, optimizer = self.optimizer.name(), "optimizer panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Some(popped) = shared.queue.pop_wait(shared.idle_wait) {
            shared.compile(popped);
        }
    }
}

/// Owns the compiler queue and the worker threads draining it.
///
/// With zero workers nothing is compiled until [`compile_pending`](Self::compile_pending) is
/// called, which makes promotion deterministic for tests.
#[derive(Debug)]
pub struct BackgroundCompiler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundCompiler {
    pub fn new(config: &JitConfig, optimizer: Arc<dyn BlockOptimizer>) -> Self {
        let shared = Arc::new(Shared {
            queue: CompilerQueue::new(config.queue_capacity, config.decay_floor),
            optimizer,
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
            idle_wait: config.idle_wait,
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads {
            let worker = Arc::clone(&shared);
            match thread::Builder::new()
                .name(format!("pcx-compiler-{i}"))
                .spawn(move || worker_loop(worker))
            {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(%err, "failed to spawn compiler worker"),
            }
        }
        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn optimizer(&self) -> &dyn BlockOptimizer {
        self.shared.optimizer.as_ref()
    }

    pub fn stats(&self) -> CompilerStats {
        self.shared.counters.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Compile everything currently queued on the calling thread. Returns how many wrappers
    /// were processed.
    pub fn compile_pending(&self) -> usize {
        let mut n = 0;
        while let Some(popped) = self.shared.queue.try_pop() {
            self.shared.compile(popped);
            n += 1;
        }
        n
    }
}

impl CompileRequestSink for BackgroundCompiler {
    fn request_compile(&self, block: &Arc<CountingBlock>, heat: u64) -> bool {
        let counters = &self.shared.counters;
        match self.shared.queue.try_push(block, heat) {
            Admission::Accepted => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Admission::Displaced => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                counters.displaced.fetch_add(1, Ordering::Relaxed);
                true
            }
            Admission::Dropped => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("compiler worker panicked");
            }
        }
    }
}
