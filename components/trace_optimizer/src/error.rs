//! Error types for trace optimization.

use thiserror::Error;
use trace_ir::IrError;

/// Errors raised while optimizing a trace.
///
/// `InvalidLoop` is not a bug in the optimizer: it means the trace is
/// statically unreachable (a guard on a constant condition can never pass),
/// so compilation of this trace should be abandoned and the interpreter
/// should record a fresh one.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The input trace violated an IR invariant.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// A guard needed a snapshot, but an interpreter frame slot was never
    /// recorded before the guard was reached.
    #[error("frame {frame} slot {slot} has no recorded value at guard")]
    UnresolvedSlot {
        /// Identifier of the frame whose slot is missing.
        frame: u32,
        /// Index of the missing slot.
        slot: u32,
    },

    /// Optimization proved a guard can never pass, so the trace as recorded
    /// describes an impossible execution.
    #[error("trace is unreachable: {0}")]
    InvalidLoop(String),
}
