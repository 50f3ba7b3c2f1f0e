//! Shared scaffolding for the black-box tests: a trivial "emit N integers"
//! stage, a plan that considers itself compatible with any other instance
//! of the same struct, and a filter that only passes values in a range.
//! Mirrors the small-db convention of factoring black-box test setup into
//! `tests/common.rs`.

use std::any::Any;
use std::sync::Arc;

use qpipe::{IdentityFilter, OutputFilter, Plan, QPipeResult, Stage, StageAdaptor, StageFactory, TuplePage};

pub struct SharedPlan;

impl Plan for SharedPlan {
    fn plan_eq(&self, other: &dyn Plan) -> bool {
        other.as_any().downcast_ref::<SharedPlan>().is_some()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Passes through only tuples whose big-endian u32 value falls in
/// `[lo, hi)`.
pub struct RangeFilter {
    pub lo: u32,
    pub hi: u32,
}

impl OutputFilter for RangeFilter {
    fn select(&self, tuple: &[u8]) -> bool {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(tuple);
        let v = u32::from_be_bytes(arr);
        v >= self.lo && v < self.hi
    }
}

/// Emits tuples `0..total` as big-endian u32s, `chunk` per output page.
pub struct CountingStage {
    pub total: u32,
    pub chunk: u32,
}

impl Stage for CountingStage {
    fn process(&mut self, adaptor: &StageAdaptor) -> QPipeResult<()> {
        let mut emitted = 0u32;
        while emitted < self.total {
            let mut page = TuplePage::new(adaptor.page_pool().alloc()?, 4);
            let mut in_page = 0u32;
            while in_page < self.chunk && emitted < self.total && !page.is_full() {
                page.append_tuple(&emitted.to_be_bytes())?;
                emitted += 1;
                in_page += 1;
            }
            adaptor.output(page)?;
        }
        Ok(())
    }
}

pub struct CountingFactory {
    pub total: u32,
    pub chunk: u32,
}

impl StageFactory for CountingFactory {
    fn create_stage(&self) -> Box<dyn Stage> {
        Box::new(CountingStage {
            total: self.total,
            chunk: self.chunk,
        })
    }
}

pub fn identity_filter() -> Arc<dyn OutputFilter> {
    Arc::new(IdentityFilter)
}

pub fn collect_u32(fifo: &qpipe::TupleFifo) -> Vec<u32> {
    let mut out = Vec::new();
    while let Some(bytes) = fifo.get_tuple_copy().unwrap() {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&bytes);
        out.push(u32::from_be_bytes(arr));
    }
    out
}
