//! Code-block cache keyed by linear start address and processor mode, with LRU reuse.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::block::BlockKey;
use crate::jit::counting::CountingBlock;
use crate::mem::CpuBus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Blocks dropped because the code under them changed.
    pub invalidations: u64,
    /// Blocks dropped to stay within capacity.
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot {
    block: Arc<CountingBlock>,
    stamp: u64,
}

/// Owned by the interpreter thread. Workers only ever see the wrappers themselves, so an
/// evicted wrapper that is still queued simply dies once the worker lets go of it.
#[derive(Debug)]
pub struct CodeCache {
    max_blocks: usize,
    map: FxHashMap<BlockKey, Slot>,
    lru: BTreeMap<u64, BlockKey>,
    next_stamp: u64,
    stats: CacheStats,
}

impl CodeCache {
    /// `max_blocks == 0` means unbounded.
    pub fn new(max_blocks: usize) -> Self {
        Self {
            max_blocks,
            map: FxHashMap::default(),
            lru: BTreeMap::new(),
            next_stamp: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn bump(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Find a block, dropping it instead if the code under it was overwritten since it was
    /// assembled.
    pub fn lookup(&mut self, key: &BlockKey, bus: &dyn CpuBus) -> Option<Arc<CountingBlock>> {
        let Some(slot) = self.map.get(key) else {
            self.stats.misses += 1;
            return None;
        };
        if !slot.block.is_still_valid(bus) {
            trace!(start = key.start, "dropping stale block");
            self.remove(key);
            self.stats.invalidations += 1;
            self.stats.misses += 1;
            return None;
        }

        let stamp = self.bump();
        let slot = self.map.get_mut(key)?;
        self.lru.remove(&slot.stamp);
        slot.stamp = stamp;
        self.lru.insert(stamp, *key);
        self.stats.hits += 1;
        Some(Arc::clone(&slot.block))
    }

    /// Insert (or replace) a block as the most recently used one. Returns the keys evicted to
    /// make room.
    pub fn insert(&mut self, block: Arc<CountingBlock>) -> Vec<BlockKey> {
        let key = block.key();
        self.remove(&key);

        let stamp = self.bump();
        self.lru.insert(stamp, key);
        self.map.insert(key, Slot { block, stamp });

        let mut evicted = Vec::new();
        while self.max_blocks != 0 && self.map.len() > self.max_blocks {
            let Some((_, oldest)) = self.lru.pop_first() else {
                break;
            };
            self.map.remove(&oldest);
            self.stats.evictions += 1;
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, key: &BlockKey) -> Option<Arc<CountingBlock>> {
        let slot = self.map.remove(key)?;
        self.lru.remove(&slot.stamp);
        Some(slot.block)
    }

    /// Drop every block with code bytes in `[addr, addr + len)`. Returns how many went.
    pub fn invalidate_range(&mut self, addr: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let end = u64::from(addr) + u64::from(len);
        let doomed: Vec<BlockKey> = self
            .map
            .iter()
            .filter(|(key, slot)| {
                let start = u64::from(key.start);
                let block_end = start + u64::from(slot.block.x86_length());
                start < end && u64::from(addr) < block_end
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        self.stats.invalidations += doomed.len() as u64;
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.lru.clear();
    }
}
