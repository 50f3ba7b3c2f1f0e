//! `StageContainer`: one per packet type. Owns a queue of packet lists
//! waiting to run, the set of adaptors currently running (consulted for
//! work-sharing before a packet is queued), and a pool of worker threads
//! that drain the queue.
//!
//! Grounded on `original_source/src/engine/core/stage_container.cpp`
//! (`enqueue`, `run`, `cleanup`, `abort_queries`). The original's container
//! lock guards both `_container_queue` and `_container_current_stages`
//! together in a single critical section per `enqueue`/`dequeue` call; kept
//! that way here via one `Mutex<ContainerState>` rather than two separate
//! locks, so the scan-then-insert sequence in `enqueue` stays atomic.
//!
//! `shutdown()` (ADDED) is this crate's explicit replacement for the
//! original's unfinished "TODO: check for container shutdown" in `run()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::adaptor::StageAdaptor;
use crate::config::ContainerConfig;
use crate::error::QPipeError;
use crate::packet::Packet;
use crate::page::PagePool;
use crate::stage::StageFactory;

struct ContainerState {
    queue: VecDeque<Vec<Packet>>,
    current_stages: Vec<Arc<StageAdaptor>>,
}

pub struct StageContainer {
    name: String,
    factory: Box<dyn StageFactory>,
    pool: Arc<dyn PagePool>,
    state: Mutex<ContainerState>,
    queue_nonempty: Condvar,
    shutting_down: AtomicBool,
}

impl StageContainer {
    pub fn new(
        name: impl Into<String>,
        factory: Box<dyn StageFactory>,
        pool: Arc<dyn PagePool>,
        _cfg: ContainerConfig,
    ) -> Arc<Self> {
        Arc::new(StageContainer {
            name: name.into(),
            factory,
            pool,
            state: Mutex::new(ContainerState {
                queue: VecDeque::new(),
                current_stages: Vec::new(),
            }),
            queue_nonempty: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a packet. If it can share work with an already-running
    /// stage or another queued packet list with a compatible plan, it is
    /// folded in; otherwise it starts a new packet list of its own.
    pub fn enqueue(&self, mut packet: Packet) {
        let mut st = self.state.lock().unwrap();

        if !packet.is_merge_enabled() {
            log::trace!(
                target: "qpipe::container",
                "container '{}': packet {} has merging disabled, queued standalone",
                self.name,
                packet.packet_id
            );
            st.queue.push_back(vec![packet]);
            self.queue_nonempty.notify_one();
            return;
        }

        for adaptor in st.current_stages.iter() {
            match adaptor.try_merge(packet) {
                Ok(()) => return,
                Err(returned) => packet = returned,
            }
        }

        for list in st.queue.iter_mut() {
            if list[0].is_mergeable(&packet) {
                log::debug!(
                    target: "qpipe::container",
                    "container '{}': packet {} merged into queued list headed by {}",
                    self.name,
                    packet.packet_id,
                    list[0].packet_id
                );
                list.push(packet);
                return;
            }
        }

        log::trace!(
            target: "qpipe::container",
            "container '{}': packet {} queued as a new list",
            self.name,
            packet.packet_id
        );
        st.queue.push_back(vec![packet]);
        self.queue_nonempty.notify_one();
    }

    /// Queues a packet list directly, skipping the merge scan. Used to
    /// recycle late mergees after a run completes: the original does not
    /// re-scan them for new merge opportunities either (see DESIGN.md).
    fn enqueue_no_merge(&self, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.queue.push_back(packets);
        self.queue_nonempty.notify_one();
    }

    fn dequeue(&self) -> Option<Vec<Packet>> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(list) = st.queue.pop_front() {
                log::trace!(
                    target: "qpipe::container",
                    "container '{}': dequeued a list of {} packet(s)",
                    self.name,
                    list.len()
                );
                return Some(list);
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return None;
            }
            st = self.queue_nonempty.wait(st).unwrap();
        }
    }

    fn register(&self, adaptor: Arc<StageAdaptor>) {
        self.state.lock().unwrap().current_stages.push(adaptor);
    }

    fn unregister(&self, adaptor: &Arc<StageAdaptor>) {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.current_stages.iter().position(|a| Arc::ptr_eq(a, adaptor)) {
            st.current_stages.remove(pos);
        }
    }

    /// Spawns `worker_count` worker threads that each loop: dequeue a
    /// packet list, run a fresh `Stage` over it, clean up. Returns once
    /// `shutdown()` is called and every thread observes an empty queue.
    pub fn spawn_workers(self: &Arc<Self>, worker_count: usize) -> Vec<thread::JoinHandle<()>> {
        (0..worker_count)
            .map(|i| {
                let container = Arc::clone(self);
                thread::Builder::new()
                    .name(format!("{}-worker-{}", container.name, i))
                    .spawn(move || container.worker_loop())
                    .expect("failed to spawn stage container worker thread")
            })
            .collect()
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let packet_list = match self.dequeue() {
                Some(list) => list,
                None => break,
            };

            let adaptor = Arc::new(StageAdaptor::new(self.name.clone(), packet_list, Arc::clone(&self.pool)));
            self.register(Arc::clone(&adaptor));

            let mut stage = self.factory.create_stage();
            let result = stage.process(&adaptor);

            self.unregister(&adaptor);

            match result {
                Ok(()) | Err(QPipeError::StopRequested) => {
                    let requeue = adaptor.finish();
                    self.enqueue_no_merge(requeue);
                }
                Err(err) => {
                    log::warn!(target: "qpipe::container", "stage '{}' failed: {}", self.name, err);
                    adaptor.abort();
                }
            }
        }
    }

    /// Signals every worker thread to exit once its current run (if any)
    /// finishes and the queue is empty. Does not cancel in-flight runs;
    /// combine with `StageAdaptor::cancel` (reachable through the running
    /// adaptor) if an immediate stop is required.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.queue_nonempty.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
