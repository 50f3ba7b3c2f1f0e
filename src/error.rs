//! Error types for the QPipe execution core.
//!
//! Mirrors `small-db`'s original `error.rs` in spirit (a hand-written
//! `Display` + `std::error::Error` impl, no `thiserror`) but adds a captured
//! `backtrace::Backtrace` on every variant that represents a real fault,
//! following the `SmallError::new(...).show_backtrace()` idiom used
//! elsewhere in the teacher's transaction machinery.

use std::fmt;

use backtrace::Backtrace;

pub type QPipeResult<T> = Result<T, QPipeError>;

/// Errors produced by the QPipe execution core.
///
/// `TerminatedFifo` and `StopRequested` are routine control flow (a
/// consumer walked away, or a stage ran out of mergees to serve) and carry
/// no backtrace. Every other variant represents a fault and captures one at
/// construction time so a log line can show where it originated.
#[derive(Debug)]
pub enum QPipeError {
    /// An operation was attempted on a `TupleFifo` that the other end has
    /// already terminated or sent EOF on.
    TerminatedFifo { context: String },

    /// A `Stage::process` call has no mergees left to serve and should
    /// stop. Containers treat this the same as `Ok(())`.
    StopRequested,

    /// A `PagePool` could not produce a page.
    BadAlloc {
        context: String,
        backtrace: Backtrace,
    },

    /// A stage body returned an error while processing a packet list.
    StageFailure {
        container: String,
        source: String,
        backtrace: Backtrace,
    },

    /// `Dispatcher::dispatch_packet` was asked to route a packet type that
    /// was never registered.
    MissingDispatch {
        packet_type: String,
        backtrace: Backtrace,
    },

    /// An internal invariant was violated.
    InvariantViolation {
        context: String,
        backtrace: Backtrace,
    },
}

impl QPipeError {
    pub fn terminated_fifo(context: impl Into<String>) -> Self {
        QPipeError::TerminatedFifo {
            context: context.into(),
        }
    }

    pub fn bad_alloc(context: impl Into<String>) -> Self {
        QPipeError::BadAlloc {
            context: context.into(),
            backtrace: Backtrace::new(),
        }
    }

    pub fn stage_failure(container: impl Into<String>, source: impl Into<String>) -> Self {
        QPipeError::StageFailure {
            container: container.into(),
            source: source.into(),
            backtrace: Backtrace::new(),
        }
    }

    pub fn missing_dispatch(packet_type: impl Into<String>) -> Self {
        QPipeError::MissingDispatch {
            packet_type: packet_type.into(),
            backtrace: Backtrace::new(),
        }
    }

    pub fn invariant_violation(context: impl Into<String>) -> Self {
        QPipeError::InvariantViolation {
            context: context.into(),
            backtrace: Backtrace::new(),
        }
    }

    /// True for errors that represent ordinary shutdown/abort signaling
    /// rather than a fault worth logging at error level.
    pub fn is_routine(&self) -> bool {
        matches!(self, QPipeError::TerminatedFifo { .. } | QPipeError::StopRequested)
    }
}

impl fmt::Display for QPipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QPipeError::TerminatedFifo { context } => {
                write!(f, "tuple fifo terminated: {}", context)
            }
            QPipeError::StopRequested => write!(f, "stage has no mergees left to serve"),
            QPipeError::BadAlloc { context, .. } => write!(f, "page allocation failed: {}", context),
            QPipeError::StageFailure { container, source, .. } => {
                write!(f, "stage '{}' failed: {}", container, source)
            }
            QPipeError::MissingDispatch { packet_type, .. } => {
                write!(f, "no stage container registered for packet type '{}'", packet_type)
            }
            QPipeError::InvariantViolation { context, .. } => {
                write!(f, "invariant violated: {}", context)
            }
        }
    }
}

impl std::error::Error for QPipeError {}

/// Debug builds panic on a broken invariant; release builds log and abort
/// the process. There is no recoverable path for a broken invariant, so we
/// don't thread a `Result` through callers for it.
pub fn check_invariant(cond: bool, context: impl Fn() -> String) {
    if cond {
        return;
    }
    let message = context();
    if cfg!(debug_assertions) {
        panic!("invariant violated: {}", message);
    } else {
        log::error!("invariant violated: {}; aborting", message);
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = QPipeError::bad_alloc("pool exhausted");
        assert!(err.to_string().contains("pool exhausted"));
    }

    #[test]
    fn routine_errors_are_flagged() {
        assert!(QPipeError::terminated_fifo("x").is_routine());
        assert!(QPipeError::StopRequested.is_routine());
        assert!(!QPipeError::bad_alloc("x").is_routine());
    }
}
