//! The compiler queue: a fixed-capacity table of hot wrappers, hottest first out.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::jit::counting::CountingBlock;

/// Result of offering an item to a [`HeatTable`].
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    Accepted,
    /// Accepted in place of the coldest entry, which is handed back.
    Displaced(T),
    /// The table is full of entries at least as hot.
    Rejected(T),
}

/// An extracted entry plus whatever decayed out of the table as a side effect.
#[derive(Debug, PartialEq, Eq)]
pub struct Taken<T> {
    pub item: T,
    pub heat: u64,
    pub evicted: Vec<T>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    item: T,
    heat: u64,
    /// Execution count at the last refresh.
    seen: u64,
}

/// Bounded admission and decaying extraction.
///
/// A full table only admits an item hotter than its coldest entry. Taking the hottest entry
/// halves every other entry's heat and evicts those that fall below `decay_floor`. The heat
/// offered is the item's execution count; [`refresh`](Self::refresh) adds whatever it has run
/// since, so decay only discounts history.
#[derive(Debug, Clone)]
pub struct HeatTable<T> {
    entries: Vec<Entry<T>>,
    capacity: usize,
    decay_floor: u64,
}

impl<T> HeatTable<T> {
    pub fn new(capacity: usize, decay_floor: u64) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            decay_floor,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_heat(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.heat).min()
    }

    pub fn heats(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.heat)
    }

    /// Credit every entry with the executions `count` reports since it was last seen.
    pub fn refresh(&mut self, count: impl Fn(&T) -> u64) {
        for entry in &mut self.entries {
            let now = count(&entry.item);
            if now > entry.seen {
                entry.heat = entry.heat.saturating_add(now - entry.seen);
                entry.seen = now;
            }
        }
    }

    pub fn offer(&mut self, item: T, heat: u64) -> Offer<T> {
        if self.capacity == 0 {
            return Offer::Rejected(item);
        }
        let entry = Entry {
            item,
            heat,
            seen: heat,
        };
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return Offer::Accepted;
        }
        let coldest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.heat)
            .map(|(i, e)| (i, e.heat));
        match coldest {
            Some((i, min)) if heat > min => {
                let old = std::mem::replace(&mut self.entries[i], entry);
                Offer::Displaced(old.item)
            }
            _ => Offer::Rejected(entry.item),
        }
    }

    pub fn take_hottest(&mut self) -> Option<Taken<T>> {
        let hottest = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.heat)
            .map(|(i, _)| i)?;
        let taken = self.entries.swap_remove(hottest);

        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(self.capacity);
        for mut entry in self.entries.drain(..) {
            entry.heat /= 2;
            if entry.heat < self.decay_floor {
                evicted.push(entry.item);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        Some(Taken {
            item: taken.item,
            heat: taken.heat,
            evicted,
        })
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|e| e.item).collect()
    }
}

/// How the queue handled a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Accepted; the coldest wrapper was pushed out and is `Cold` again.
    Displaced,
    /// Not queued: the table was full of hotter entries, the lock was busy or the queue is
    /// closed.
    Dropped,
}

/// A wrapper handed to a worker.
#[derive(Debug)]
pub struct Popped {
    pub block: Arc<CountingBlock>,
    pub heat: u64,
    /// Wrappers that decayed out of the queue during this pop.
    pub evicted: usize,
}

#[derive(Debug)]
struct Inner {
    table: HeatTable<Arc<CountingBlock>>,
    closed: bool,
}

/// [`HeatTable`] of wrappers shared between the interpreter and the workers.
///
/// Pushing never blocks: a contended lock drops the request, and the wrapper is offered again
/// the next time its count reaches a multiple of the threshold.
#[derive(Debug)]
pub struct CompilerQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl CompilerQueue {
    pub fn new(capacity: usize, decay_floor: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: HeatTable::new(capacity, decay_floor),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_push(&self, block: &Arc<CountingBlock>, heat: u64) -> Admission {
        let Some(mut inner) = self.inner.try_lock() else {
            return Admission::Dropped;
        };
        if inner.closed {
            return Admission::Dropped;
        }
        inner.table.refresh(|queued| queued.count());
        let admission = match inner.table.offer(Arc::clone(block), heat) {
            Offer::Accepted => Admission::Accepted,
            Offer::Displaced(old) => {
                old.dequeued();
                Admission::Displaced
            }
            Offer::Rejected(_) => return Admission::Dropped,
        };
        drop(inner);
        debug!(start = block.key().start, heat, "queued block for compilation");
        self.ready.notify_one();
        admission
    }

    /// Take the hottest wrapper, waiting up to `timeout` for one to arrive.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Popped> {
        let mut inner = self.inner.lock();
        if inner.table.is_empty() && !inner.closed {
            self.ready.wait_for(&mut inner, timeout);
        }
        Self::pop_locked(&mut inner)
    }

    pub fn try_pop(&self) -> Option<Popped> {
        Self::pop_locked(&mut self.inner.lock())
    }

    fn pop_locked(inner: &mut Inner) -> Option<Popped> {
        inner.table.refresh(|queued| queued.count());
        let taken = inner.table.take_hottest()?;
        for block in &taken.evicted {
            block.dequeued();
        }
        if !taken.evicted.is_empty() {
            debug!(evicted = taken.evicted.len(), "compiler queue decay");
        }
        Some(Popped {
            block: taken.item,
            heat: taken.heat,
            evicted: taken.evicted.len(),
        })
    }

    /// Refuse further pushes, drop everything queued and wake all waiters.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for block in inner.table.drain() {
            block.dequeued();
        }
        drop(inner);
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_table_keeps_the_hottest() {
        let mut table = HeatTable::new(2, 0);
        assert_eq!(table.offer('a', 10), Offer::Accepted);
        assert_eq!(table.offer('b', 20), Offer::Accepted);
        assert_eq!(table.offer('c', 5), Offer::Rejected('c'));
        assert_eq!(table.offer('d', 10), Offer::Rejected('d'));
        assert_eq!(table.offer('e', 30), Offer::Displaced('a'));
        let mut heats: Vec<u64> = table.heats().collect();
        heats.sort_unstable();
        assert_eq!(heats, vec![20, 30]);
    }

    #[test]
    fn take_hottest_halves_and_evicts_the_rest() {
        let mut table = HeatTable::new(4, 8);
        table.offer("hot", 100);
        table.offer("warm", 40);
        table.offer("cool", 15);
        let taken = table.take_hottest().unwrap();
        assert_eq!(taken.item, "hot");
        assert_eq!(taken.heat, 100);
        assert_eq!(taken.evicted, vec!["cool"]);
        assert_eq!(table.heats().collect::<Vec<_>>(), vec![20]);

        let taken = table.take_hottest().unwrap();
        assert_eq!((taken.item, taken.heat), ("warm", 20));
        assert!(table.take_hottest().is_none());
    }

    #[test]
    fn refresh_credits_executions_since_admission() {
        let mut table = HeatTable::new(2, 0);
        table.offer("early", 16);
        table.offer("late", 32);
        let live = |item: &&str| if *item == "early" { 1000 } else { 40 };
        table.refresh(live);
        let taken = table.take_hottest().unwrap();
        assert_eq!((taken.item, taken.heat), ("early", 1000));
        // 32 + 8 executions, halved by the pop.
        assert_eq!(table.heats().collect::<Vec<_>>(), vec![20]);

        // Refreshing again without new executions changes nothing.
        table.refresh(live);
        assert_eq!(table.heats().collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let mut table = HeatTable::new(0, 1);
        assert_eq!(table.offer(1, u64::MAX), Offer::Rejected(1));
        assert!(table.is_empty());
    }
}
