//! The contract a query operator implements to plug into a
//! `StageContainer`: `Stage` is the per-run worker body, `StageFactory`
//! produces one fresh `Stage` per packet list a container dequeues.
//!
//! Grounded on `original_source/include/engine/core/stage_factory.h`
//! (`stage_factory_t`); `stage_t` itself did not survive the original
//! source filtering (only its factory and its container-facing adaptor
//! did), so the `Stage` trait here is reconstructed from how
//! `stage_container.cpp` drives it: one blocking `process` call per
//! dequeued packet list, fed a `&StageAdaptor` to read its primary packet's
//! metadata from and push output pages through.

use crate::adaptor::StageAdaptor;
use crate::error::QPipeResult;

/// A stage's worker body. `process` runs once per packet list a
/// `StageContainer` dequeues (one primary packet plus whatever mergees
/// joined before the stage started, or joined later through
/// `StageAdaptor::try_merge`). It should keep producing output pages and
/// handing them to `adaptor.output(..)` until its own input is exhausted or
/// `adaptor.output(..)` reports `Err(QPipeError::StopRequested)` (every
/// mergee has gone away).
pub trait Stage: Send {
    fn process(&mut self, adaptor: &StageAdaptor) -> QPipeResult<()>;
}

/// Produces a fresh `Stage` for each packet list a container dequeues.
/// Implementations are typically zero-sized or hold only shared,
/// read-only configuration (e.g. a table handle), since per-run state lives
/// in the `Stage` value itself.
pub trait StageFactory: Send + Sync {
    fn create_stage(&self) -> Box<dyn Stage>;
}

/// Wraps a plain closure as a `StageFactory`, for tests and simple stages
/// that need no extra construction state.
pub struct FnStageFactory<F>(pub F)
where
    F: Fn() -> Box<dyn Stage> + Send + Sync;

impl<F> StageFactory for FnStageFactory<F>
where
    F: Fn() -> Box<dyn Stage> + Send + Sync,
{
    fn create_stage(&self) -> Box<dyn Stage> {
        (self.0)()
    }
}
