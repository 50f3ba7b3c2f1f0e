//! Routes packets to the `StageContainer` registered for their packet
//! type.
//!
//! Grounded on `original_source/include/engine/dispatcher.h`
//! (`dispatcher_t`), redesigned per the registered behavior change: the
//! original is a lazily-initialized singleton reached through static
//! wrapper methods (`instance()` double-checks a `static dispatcher_t*` and
//! allocates on first use). This crate builds a `Dispatcher` value
//! explicitly, populates it with `register_stage` before any worker
//! threads are spawned, and shares it via an explicitly-passed
//! `Arc<Dispatcher>` — no lazy init, no global state, no locking needed on
//! the dispatch hot path since registration only ever happens through
//! `&mut self` before the `Arc` is created.

use std::collections::HashMap;
use std::sync::Arc;

use crate::container::StageContainer;
use crate::error::{QPipeError, QPipeResult};
use crate::packet::Packet;

#[derive(Default)]
pub struct Dispatcher {
    containers: HashMap<String, Arc<StageContainer>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            containers: HashMap::new(),
        }
    }

    /// Registers the container responsible for a packet type. Must happen
    /// before the dispatcher is shared across threads — there is
    /// deliberately no lock protecting this map.
    pub fn register_stage(&mut self, packet_type: impl Into<String>, container: Arc<StageContainer>) {
        self.containers.insert(packet_type.into(), container);
    }

    pub fn container(&self, packet_type: &str) -> Option<&Arc<StageContainer>> {
        self.containers.get(packet_type)
    }

    /// Routes a packet to its container's queue.
    pub fn dispatch_packet(&self, packet: Packet) -> QPipeResult<()> {
        match self.containers.get(packet.packet_type.as_str()) {
            Some(container) => {
                container.enqueue(packet);
                Ok(())
            }
            None => Err(QPipeError::missing_dispatch(packet.packet_type.clone())),
        }
    }
}
