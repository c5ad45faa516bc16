use std::sync::Arc;
use std::time::Duration;

use pcx_cpu_core::jit::{
    Admission, CompileRequestSink, CompileState, CompilerQueue, CountingBlock, HeatTable, Offer,
};
use pcx_cpu_core::{BlockAssembler, CpuBus, CpuState, FlatBus};
use proptest::prelude::*;

fn block_at(bus: &mut FlatBus, eip: u32) -> Arc<CountingBlock> {
    bus.load(eip, &[0xC3]);
    let mut cpu = CpuState::flat32();
    cpu.eip = eip;
    let block = BlockAssembler::default().assemble(&cpu, bus).unwrap();
    Arc::new(CountingBlock::new(Arc::new(block), 1))
}

/// Puts a wrapper into the queue the way the interpreter does: through the counting wrapper's
/// own request path, so its state is `Queued` while it sits there.
struct Enqueue<'a>(&'a CompilerQueue);

impl CompileRequestSink for Enqueue<'_> {
    fn request_compile(&self, block: &Arc<CountingBlock>, heat: u64) -> bool {
        self.0.try_push(block, heat) != Admission::Dropped
    }
}

fn run_once(block: &Arc<CountingBlock>, queue: &CompilerQueue) {
    let mut bus = FlatBus::new(0x10000);
    bus.write_u32(0x8000, block.key().start).unwrap();
    let mut cpu = CpuState::flat32();
    cpu.eip = block.key().start;
    cpu.gpr[4] = 0x8000;
    block.execute(&mut cpu, &mut bus, &Enqueue(queue));
}

#[test]
fn displaced_and_decayed_wrappers_go_cold() {
    let mut bus = FlatBus::new(0x10000);
    let cold = block_at(&mut bus, 0x1000);
    let warm = block_at(&mut bus, 0x2000);
    let hot = block_at(&mut bus, 0x3000);
    let queue = CompilerQueue::new(2, 10);

    run_once(&cold, &queue);
    run_once(&warm, &queue);
    assert_eq!(cold.state(), CompileState::Queued);
    assert_eq!(queue.len(), 2);

    // Heat is the execution count, one each so far. `hot` is dropped at heat 1 and displaces
    // the first of the others at heat 2; later runs find it already queued.
    for _ in 0..4 {
        run_once(&hot, &queue);
    }
    assert_eq!(hot.state(), CompileState::Queued);
    let displaced = [&cold, &warm]
        .iter()
        .filter(|b| b.state() == CompileState::Cold)
        .count();
    assert_eq!(displaced, 1);

    let popped = queue.try_pop().unwrap();
    assert!(Arc::ptr_eq(&popped.block, &hot));
    // The remaining entry (heat 1) halves below the floor and is evicted.
    assert_eq!(popped.evicted, 1);
    assert!(queue.is_empty());
    assert_eq!(cold.state(), CompileState::Cold);
    assert_eq!(warm.state(), CompileState::Cold);
}

#[test]
fn executions_after_queueing_count_toward_priority() {
    let mut bus = FlatBus::new(0x10000);
    let early = block_at(&mut bus, 0x1000);
    let late = block_at(&mut bus, 0x2000);
    let queue = CompilerQueue::new(4, 0);

    // Queued at heat 1, then keeps running while it waits.
    for _ in 0..10 {
        run_once(&early, &queue);
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.try_push(&late, 5), Admission::Accepted);

    let popped = queue.try_pop().unwrap();
    assert!(Arc::ptr_eq(&popped.block, &early));
    assert_eq!(popped.heat, 10);
}

#[test]
fn closed_queue_refuses_pushes_and_releases_waiters() {
    let mut bus = FlatBus::new(0x10000);
    let block = block_at(&mut bus, 0x1000);
    let queue = Arc::new(CompilerQueue::new(4, 1));

    let waiter = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.pop_wait(Duration::from_secs(30)).is_none())
    };
    std::thread::sleep(Duration::from_millis(20));
    queue.close();
    assert!(waiter.join().unwrap());

    assert_eq!(queue.try_push(&block, 100), Admission::Dropped);
    assert!(queue.is_empty());
}

#[test]
fn push_wakes_a_waiting_worker() {
    let mut bus = FlatBus::new(0x10000);
    let block = block_at(&mut bus, 0x1000);
    let queue = Arc::new(CompilerQueue::new(4, 1));

    let waiter = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while std::time::Instant::now() < deadline {
                if let Some(popped) = queue.pop_wait(Duration::from_millis(50)) {
                    return Some(popped.heat);
                }
            }
            None
        })
    };
    while queue.try_push(&block, 7) == Admission::Dropped {
        std::thread::yield_now();
    }
    assert_eq!(waiter.join().unwrap(), Some(7));
}

proptest! {
    #[test]
    fn full_table_minimum_never_drops(
        capacity in 1usize..8,
        initial in prop::collection::vec(any::<u64>(), 8),
        candidates in prop::collection::vec(any::<u64>(), 1..32),
    ) {
        let mut table = HeatTable::new(capacity, 0);
        for (i, heat) in initial.iter().take(capacity).enumerate() {
            prop_assert_eq!(table.offer(i, *heat), Offer::Accepted);
        }
        for (i, heat) in candidates.into_iter().enumerate() {
            let before = table.min_heat().unwrap();
            let outcome = table.offer(100 + i, heat);
            let after = table.min_heat().unwrap();
            prop_assert!(after >= before.min(heat));
            prop_assert_eq!(table.len(), capacity);
            match outcome {
                Offer::Rejected(_) => {
                    prop_assert!(heat <= before);
                    prop_assert_eq!(after, before);
                }
                Offer::Displaced(_) => prop_assert!(heat > before),
                Offer::Accepted => prop_assert!(false, "full table accepted without displacing"),
            }
        }
    }

    #[test]
    fn decayed_entries_leave_exactly_once(
        heats in prop::collection::vec(0u64..1_000, 1..16),
        floor in 1u64..64,
    ) {
        let mut table = HeatTable::new(heats.len(), floor);
        for (i, heat) in heats.iter().enumerate() {
            table.offer(i, *heat);
        }

        let mut seen = Vec::new();
        while let Some(taken) = table.take_hottest() {
            seen.push(taken.item);
            seen.extend(taken.evicted);
            for heat in table.heats() {
                prop_assert!(heat >= floor);
            }
        }
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..heats.len()).collect::<Vec<_>>());
    }

    #[test]
    fn extraction_is_hottest_first(heats in prop::collection::vec(any::<u64>(), 1..16)) {
        let mut table = HeatTable::new(heats.len(), 0);
        for (i, heat) in heats.iter().enumerate() {
            table.offer(i, *heat);
        }
        let max = *heats.iter().max().unwrap();
        let taken = table.take_hottest().unwrap();
        prop_assert_eq!(taken.heat, max);
        prop_assert_eq!(heats[taken.item], max);
        prop_assert!(taken.evicted.is_empty());
    }
}
