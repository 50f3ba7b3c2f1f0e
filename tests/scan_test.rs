//! End-to-end: a single packet runs through a `Dispatcher` and receives
//! exactly the tuples its stage emits.

mod common;

use std::sync::Arc;

use common::{collect_u32, identity_filter, CountingFactory, SharedPlan};
use qpipe::{ContainerConfig, Dispatcher, FifoConfig, LocalPagePool, Packet, PagePool, StageContainer, TupleFifo};

#[test]
fn single_packet_scan_emits_everything() {
    let pool: Arc<dyn PagePool> = Arc::new(LocalPagePool::new(4096, 8));
    let container = StageContainer::new(
        "scan",
        Box::new(CountingFactory { total: 25, chunk: 4 }),
        Arc::clone(&pool),
        ContainerConfig::default(),
    );
    let handles = container.spawn_workers(2);

    let mut dispatcher = Dispatcher::new();
    dispatcher.register_stage("scan", Arc::clone(&container));

    let fifo = Arc::new(TupleFifo::new(Arc::clone(&pool), 4, FifoConfig::default()));
    let consumer = Arc::clone(&fifo);
    let packet = Packet::new("scan", fifo, identity_filter(), Arc::new(SharedPlan), true);
    dispatcher.dispatch_packet(packet).unwrap();

    assert_eq!(collect_u32(&consumer), (0..25).collect::<Vec<_>>());

    container.shutdown();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn dispatch_to_unregistered_packet_type_fails() {
    let pool: Arc<dyn PagePool> = Arc::new(LocalPagePool::new(4096, 8));
    let dispatcher = Dispatcher::new();
    let fifo = Arc::new(TupleFifo::new(pool, 4, FifoConfig::default()));
    let packet = Packet::new("join", fifo, identity_filter(), Arc::new(SharedPlan), true);
    assert!(dispatcher.dispatch_packet(packet).is_err());
}
