//! `StageAdaptor`: the per-run coordinator between a running `Stage` and
//! the packets currently sharing its work (the primary packet that started
//! the run, plus whatever mergees joined before or during it).
//!
//! Grounded on `original_source/include/engine/core/stage_container.h`'s
//! nested `stage_adaptor_t` and `src/engine/core/stage_container.cpp`'s
//! `try_merge`/`output_page`/`finish_packet`/`cleanup`/`abort_queries`.
//!
//! The primary packet is split out of the mergee list into its own field:
//! the original keeps a single `packet_list_t` with the primary at the
//! front and erases entries (including possibly the primary) as they
//! finish mid-run, but still needs `get_packet()` to keep returning the
//! primary for the rest of the run even after its own output has finished.
//! Modeling that with one shared list would mean `get_packet()` returning
//! an `Option` that can flip to `None` mid-run for no reason a `Stage`
//! author should have to handle; keeping the primary in its own,
//! never-removed field sidesteps that awkwardness while preserving the
//! same finish-ordering semantics (tracked instead by a `primary_finished`
//! flag in `AdaptorState`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::QPipeError;
use crate::page::PagePool;
use crate::packet::{Packet, NEXT_TUPLE_INITIAL_VALUE};
use crate::tuple::TuplePage;

struct AdaptorState {
    primary_finished: bool,
    mergees: Vec<Packet>,
    next_tuple: u64,
    accepting_packets: bool,
}

pub struct StageAdaptor {
    container_name: String,
    primary: Packet,
    pool: Arc<dyn PagePool>,
    state: Mutex<AdaptorState>,
    cancelled: AtomicBool,
}

impl StageAdaptor {
    /// `packet_list` must be non-empty; its first element becomes the
    /// primary packet.
    pub(crate) fn new(container_name: String, mut packet_list: Vec<Packet>, pool: Arc<dyn PagePool>) -> Self {
        assert!(!packet_list.is_empty(), "a stage adaptor needs at least one packet");
        let mut primary = packet_list.remove(0);
        primary.next_tuple_on_merge = NEXT_TUPLE_INITIAL_VALUE;
        for p in packet_list.iter_mut() {
            p.next_tuple_on_merge = NEXT_TUPLE_INITIAL_VALUE;
        }

        StageAdaptor {
            container_name,
            primary,
            pool,
            state: Mutex::new(AdaptorState {
                primary_finished: false,
                mergees: packet_list,
                next_tuple: NEXT_TUPLE_INITIAL_VALUE,
                accepting_packets: true,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// The packet that started this run. Stable for the whole lifetime of
    /// the adaptor, regardless of whether its output has already finished.
    pub fn get_packet(&self) -> &Packet {
        &self.primary
    }

    /// A `PagePool` a `Stage` can use to build its own output pages before
    /// handing them to [`StageAdaptor::output`].
    pub fn page_pool(&self) -> &Arc<dyn PagePool> {
        &self.pool
    }

    /// Stops accepting new mergees. Typically called by a `Stage` once it
    /// has consumed enough of its input that joining late would require
    /// replaying data already missed.
    pub fn stop_accepting_packets(&self) {
        self.state.lock().unwrap().accepting_packets = false;
    }

    pub fn check_for_cancellation(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Attempts to fold `packet` into this run's working set. On success,
    /// the packet's output will start receiving tuples from the next
    /// `output()` call onward. On failure, ownership is handed back so the
    /// caller can try another stage or enqueue it fresh.
    pub fn try_merge(&self, mut packet: Packet) -> Result<(), Packet> {
        let mut st = self.state.lock().unwrap();
        if !st.accepting_packets || st.primary_finished || !self.primary.is_mergeable(&packet) {
            return Err(packet);
        }
        packet.next_tuple_on_merge = st.next_tuple;
        log::debug!(
            target: "qpipe::adaptor",
            "container '{}': packet {} merged into run of {} at next_tuple={}",
            self.container_name,
            packet.packet_id,
            self.primary.packet_id,
            st.next_tuple
        );
        st.mergees.push(packet);
        Ok(())
    }

    /// Hands a freshly-produced page of tuples to the adaptor, which
    /// selects, projects, and fans it out to every packet currently in the
    /// working set. Returns `Err(QPipeError::StopRequested)` once no
    /// packets remain to serve (the caller should treat this as a normal
    /// end of `process`, not a failure).
    pub fn output(&self, page: TuplePage) -> Result<(), QPipeError> {
        struct Target {
            id: String,
            output_buffer: Arc<crate::fifo::TupleFifo>,
            output_filter: Arc<dyn crate::packet::OutputFilter>,
            next_tuple_needed: u64,
        }

        let next_tuple_after;
        let targets: Vec<Target> = {
            let mut st = self.state.lock().unwrap();
            st.next_tuple += page.tuple_count() as u64;
            next_tuple_after = st.next_tuple;

            let mut t = Vec::with_capacity(st.mergees.len() + 1);
            if !st.primary_finished {
                t.push(Target {
                    id: self.primary.packet_id.clone(),
                    output_buffer: Arc::clone(&self.primary.output_buffer),
                    output_filter: Arc::clone(&self.primary.output_filter),
                    next_tuple_needed: self.primary.next_tuple_needed,
                });
            }
            for p in &st.mergees {
                t.push(Target {
                    id: p.packet_id.clone(),
                    output_buffer: Arc::clone(&p.output_buffer),
                    output_filter: Arc::clone(&p.output_filter),
                    next_tuple_needed: p.next_tuple_needed,
                });
            }
            t
        };

        let mut finished_ids: Vec<String> = Vec::new();
        for target in &targets {
            let mut target_done = false;
            for tup in page.iter() {
                let src = tup.as_slice();
                if !target.output_filter.select(src) {
                    continue;
                }
                match target.output_buffer.allocate_with(|dest| {
                    target.output_filter.project(dest, src);
                }) {
                    Ok(()) => {}
                    Err(QPipeError::TerminatedFifo { .. }) => {
                        log::trace!(
                            target: "qpipe::adaptor",
                            "container '{}': target {} walked away, marking finished",
                            self.container_name,
                            target.id
                        );
                        target_done = true;
                        break;
                    }
                    Err(err) => {
                        // Not a routine "consumer went away" signal — a real
                        // fault (e.g. BadAlloc) that should abort the whole
                        // run rather than be papered over as one finished
                        // target.
                        log::error!(
                            target: "qpipe::adaptor",
                            "container '{}': target {} output failed fatally: {}",
                            self.container_name,
                            target.id,
                            err
                        );
                        return Err(err);
                    }
                }
            }
            if !target_done
                && target.next_tuple_needed != 0
                && next_tuple_after == target.next_tuple_needed
            {
                target_done = true;
            }
            if target_done {
                let _ = target.output_buffer.send_eof();
                finished_ids.push(target.id.clone());
            }
        }

        let mut st = self.state.lock().unwrap();
        if finished_ids.iter().any(|id| *id == self.primary.packet_id) {
            st.primary_finished = true;
        }
        st.mergees.retain(|p| !finished_ids.contains(&p.packet_id));
        if !finished_ids.is_empty() {
            log::debug!(
                target: "qpipe::adaptor",
                "container '{}': {} target(s) finished after output ({} remaining)",
                self.container_name,
                finished_ids.len(),
                st.mergees.len() + if st.primary_finished { 0 } else { 1 }
            );
        }

        let any_active = !st.primary_finished || !st.mergees.is_empty();
        if !any_active {
            log::debug!(target: "qpipe::adaptor", "container '{}': no targets left, requesting stop", self.container_name);
            return Err(QPipeError::StopRequested);
        }
        Ok(())
    }

    /// Called once a `Stage::process` call returns `Ok(())` (or the
    /// `StopRequested` sentinel, which containers treat the same way).
    /// Sends EOF to every packet that has been present since the run
    /// began, and returns the late mergees that should be recycled back
    /// onto the container's queue (not re-scanned for further merge
    /// opportunities, matching the original).
    pub(crate) fn finish(&self) -> Vec<Packet> {
        let mut st = self.state.lock().unwrap();
        if !st.primary_finished {
            let _ = self.primary.output_buffer.send_eof();
        }

        let mergees = std::mem::take(&mut st.mergees);
        let mut requeue = Vec::new();
        for mut p in mergees {
            if p.next_tuple_on_merge == NEXT_TUPLE_INITIAL_VALUE {
                let _ = p.output_buffer.send_eof();
            } else {
                p.next_tuple_needed = p.next_tuple_on_merge;
                p.next_tuple_on_merge = crate::packet::NEXT_TUPLE_UNINITIALIZED;
                requeue.push(p);
            }
        }
        log::debug!(
            target: "qpipe::adaptor",
            "container '{}': run for {} finished, {} late mergee(s) recycled",
            self.container_name,
            self.primary.packet_id,
            requeue.len()
        );
        requeue
    }

    /// Called when `Stage::process` returns a real error: terminates every
    /// packet's output buffer instead of sending EOF, so consumers see an
    /// abnormal close rather than a clean end of stream.
    pub(crate) fn abort(&self) {
        log::warn!(
            target: "qpipe::adaptor",
            "container '{}': aborting run for {}, terminating all mergee output buffers",
            self.container_name,
            self.primary.packet_id
        );
        let _ = self.primary.output_buffer.terminate();
        let mut st = self.state.lock().unwrap();
        for p in std::mem::take(&mut st.mergees) {
            let _ = p.output_buffer.terminate();
        }
    }
}
