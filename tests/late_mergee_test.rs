//! A packet that joins an already-running stage via `try_merge` only needs
//! the tail of the run it joined mid-flight; the prefix it missed is
//! replayed when it is recycled back onto the container's queue and the
//! stage runs again.

use std::sync::Arc;

use qpipe::{
    ContainerConfig, FifoConfig, IdentityFilter, LocalPagePool, Packet, PagePool, Stage, StageAdaptor, StageContainer,
    StageFactory, TupleFifo, TuplePage,
};

mod common;
use common::SharedPlan;

/// Emits tuples one at a time, pausing after each output call so a test can
/// inject a late mergee mid-run with a real `std::thread::sleep`-based
/// rendezvous instead of a synchronization primitive the production code
/// doesn't otherwise need.
struct TrickleStage {
    total: u32,
    pause_after: u32,
    pause_once: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Stage for TrickleStage {
    fn process(&mut self, adaptor: &StageAdaptor) -> qpipe::QPipeResult<()> {
        let mut emitted = 0u32;
        while emitted < self.total {
            let mut page = TuplePage::new(adaptor.page_pool().alloc()?, 4);
            page.append_tuple(&emitted.to_be_bytes())?;
            emitted += 1;
            adaptor.output(page)?;

            if emitted == self.pause_after
                && !self.pause_once.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
        Ok(())
    }
}

struct TrickleFactory {
    total: u32,
    pause_after: u32,
    pause_once: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl StageFactory for TrickleFactory {
    fn create_stage(&self) -> Box<dyn Stage> {
        Box::new(TrickleStage {
            total: self.total,
            pause_after: self.pause_after,
            pause_once: Arc::clone(&self.pause_once),
        })
    }
}

#[test]
fn late_mergee_receives_only_the_tail_then_the_prefix_on_replay() {
    let pool: Arc<dyn PagePool> = Arc::new(LocalPagePool::new(4096, 8));
    let pause_once = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let container = StageContainer::new(
        "scan",
        Box::new(TrickleFactory {
            total: 6,
            pause_after: 3,
            pause_once: Arc::clone(&pause_once),
        }),
        Arc::clone(&pool),
        ContainerConfig::default(),
    );

    let primary_fifo = Arc::new(TupleFifo::new(Arc::clone(&pool), 4, FifoConfig::default()));
    let primary_out = Arc::clone(&primary_fifo);
    container.enqueue(Packet::new("scan", primary_fifo, Arc::new(IdentityFilter), Arc::new(SharedPlan), true));

    let handles = container.spawn_workers(1);

    // Give the primary a head start so it is mid-run (paused after 3
    // tuples) before the late packet is enqueued.
    std::thread::sleep(std::time::Duration::from_millis(15));

    let late_fifo = Arc::new(TupleFifo::new(Arc::clone(&pool), 4, FifoConfig::default()));
    let late_out = Arc::clone(&late_fifo);
    container.enqueue(Packet::new("scan", late_fifo, Arc::new(IdentityFilter), Arc::new(SharedPlan), true));

    // Drain both consumers concurrently on their own threads, the way the
    // teacher's own multi-reader tests collect results, rather than
    // serializing the two drains on the test's main thread.
    let (sender, receiver) = crossbeam::channel::unbounded();
    let primary_sender = sender.clone();
    let primary_reader = std::thread::spawn(move || {
        primary_sender.send(("primary", common::collect_u32(&primary_out))).unwrap();
    });
    let late_sender = sender;
    let late_reader = std::thread::spawn(move || {
        late_sender.send(("late", common::collect_u32(&late_out))).unwrap();
    });

    let mut results = std::collections::HashMap::new();
    for _ in 0..2 {
        let (name, tuples) = receiver.recv().unwrap();
        results.insert(name, tuples);
    }
    primary_reader.join().unwrap();
    late_reader.join().unwrap();

    assert_eq!(results["primary"], (0..6).collect::<Vec<_>>());
    // The late packet missed the first run's prefix; it gets recycled and
    // replayed on a second run of the same stage, so it should still see
    // every tuple by the time both runs finish.
    assert_eq!(results["late"], (0..6).collect::<Vec<_>>());

    container.shutdown();
    for h in handles {
        h.join().unwrap();
    }
}
