//! Packets: the unit of work submitted to a `StageContainer`, and the
//! output filtering/merge-compatibility machinery attached to them.
//!
//! Grounded on `original_source/include/engine/core/packet.h` (`packet_t`)
//! and `include/engine/functors.h` (`tuple_filter_t`/`trivial_filter_t`).
//!
//! Unlike the original, `Packet` carries no `destroy_subpackets`/
//! `terminate_inputs` hooks: those exist in the original to manage a
//! concrete packet subtype's upstream input buffers, which this core
//! doesn't model (operator-specific packet fields are out of scope). Ending
//! a packet's lifetime here is just letting the last `Arc` clone of its
//! fields drop.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fifo::TupleFifo;

/// Identifies the query plan a packet belongs to, for merge compatibility.
/// Two packets are candidates for work-sharing when their plans compare
/// equal.
pub trait Plan: Send + Sync {
    fn plan_eq(&self, other: &dyn Plan) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// Selects and projects tuples on their way out of a stage to a particular
/// packet's consumer. The default implementation passes every tuple through
/// unchanged, mirroring `trivial_filter_t`.
pub trait OutputFilter: Send + Sync {
    fn select(&self, _tuple: &[u8]) -> bool {
        true
    }

    fn project(&self, dest: &mut [u8], src: &[u8]) {
        dest.copy_from_slice(src);
    }
}

/// The default, pass-everything-through filter.
pub struct IdentityFilter;

impl OutputFilter for IdentityFilter {}

/// A packet has been present in a stage's working set since the stage
/// began running (as opposed to having joined mid-run via `try_merge`).
pub const NEXT_TUPLE_UNINITIALIZED: u64 = 0;
pub const NEXT_TUPLE_INITIAL_VALUE: u64 = 1;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique packet id, for debugging/logging only.
pub fn next_packet_id() -> String {
    format!("p{}", NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed))
}

/// A unit of work: a request to run some packet type's stage and receive
/// its output (after `output_filter` has been applied) through
/// `output_buffer`.
pub struct Packet {
    pub packet_id: String,
    pub packet_type: String,
    pub output_buffer: Arc<TupleFifo>,
    pub output_filter: Arc<dyn OutputFilter>,
    pub plan: Arc<dyn Plan>,
    merge_enabled: bool,
    pub(crate) next_tuple_on_merge: u64,
    pub(crate) next_tuple_needed: u64,
}

impl Packet {
    pub fn new(
        packet_type: impl Into<String>,
        output_buffer: Arc<TupleFifo>,
        output_filter: Arc<dyn OutputFilter>,
        plan: Arc<dyn Plan>,
        merge_enabled: bool,
    ) -> Self {
        Packet {
            packet_id: next_packet_id(),
            packet_type: packet_type.into(),
            output_buffer,
            output_filter,
            plan,
            merge_enabled,
            next_tuple_on_merge: NEXT_TUPLE_UNINITIALIZED,
            next_tuple_needed: NEXT_TUPLE_UNINITIALIZED,
        }
    }

    pub fn is_merge_enabled(&self) -> bool {
        self.merge_enabled
    }

    pub fn disable_merging(&mut self) {
        self.merge_enabled = false;
    }

    /// True if `self` (already the head of some working set) would accept
    /// `other` as a mergee.
    pub fn is_mergeable(&self, other: &Packet) -> bool {
        self.merge_enabled && self.plan.plan_eq(other.plan.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FifoConfig;
    use crate::page::LocalPagePool;

    struct NumberedPlan(u32);
    impl Plan for NumberedPlan {
        fn plan_eq(&self, other: &dyn Plan) -> bool {
            other.as_any().downcast_ref::<NumberedPlan>().map_or(false, |o| o.0 == self.0)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn packet(plan_id: u32, merge_enabled: bool) -> Packet {
        let pool = Arc::new(LocalPagePool::new(4096, 4));
        let fifo = Arc::new(TupleFifo::new(pool, 8, FifoConfig::default()));
        Packet::new(
            "scan",
            fifo,
            Arc::new(IdentityFilter),
            Arc::new(NumberedPlan(plan_id)),
            merge_enabled,
        )
    }

    #[test]
    fn mergeable_iff_plans_match_and_enabled() {
        let a = packet(1, true);
        let b = packet(1, true);
        let c = packet(2, true);
        assert!(a.is_mergeable(&b));
        assert!(!a.is_mergeable(&c));

        let d = packet(1, false);
        assert!(!d.is_mergeable(&b));
    }

    #[test]
    fn ids_are_unique() {
        let a = packet(1, true);
        let b = packet(1, true);
        assert_ne!(a.packet_id, b.packet_id);
    }
}
