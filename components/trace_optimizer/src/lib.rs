//! Trace optimization for the tracing JIT.
//!
//! Takes a recorded linear [`Trace`](trace_ir::Trace) of a hot loop and
//! rewrites it into a leaner equivalent, while building the deoptimization
//! metadata that lets a failing guard fall back to the interpreter at
//! exactly the right point:
//!
//! - pure stage: constant folding and common-subexpression elimination.
//! - virtual stage: escape analysis; allocations that never leak are
//!   deleted and their fields tracked symbolically.
//! - heap stage: redundant load/store elimination with conservative alias
//!   invalidation.
//! - bounds stage: integer interval propagation, overflow-check demotion
//!   and removal of implied guards.
//! - resume: structurally shared snapshots and rebuild recipes per
//!   surviving guard.
//! - unroll: loop peeling, so facts proven in iteration one hold from
//!   iteration two onward.
//!
//! ```
//! use trace_ir::{Opcode, Const, TraceBuilder};
//! use trace_optimizer::Optimizer;
//!
//! let mut b = TraceBuilder::new();
//! let i0 = b.input();
//! let a = b.op2(Opcode::IntAdd, i0.into(), Const::Int(1).into());
//! let dup = b.op2(Opcode::IntAdd, i0.into(), Const::Int(1).into());
//! let sum = b.op2(Opcode::IntAdd, a.into(), dup.into());
//! b.finish(vec![sum.into()]);
//!
//! let out = Optimizer::optimize(&b.build()).unwrap();
//! // the duplicated add was eliminated
//! let adds = out.trace.ops.iter().filter(|o| o.opcode == Opcode::IntAdd).count();
//! assert_eq!(adds, 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod bounds;
mod error;
mod facts;
mod heap;
mod intbound;
mod optimizer;
mod pure;
mod resume;
mod unroll;
mod virtualize;

pub use error::CompileError;
pub use intbound::IntBound;
pub use optimizer::{
    ExportedFact, ExportedField, ExportedItem, ExportedOperand, ExportedPure, ExportedState,
    OptimizedTrace, Optimizer, OptimizerStats,
};
pub use resume::{GuardResume, RecipeShape, RecipeSlot, SlotValue, Snapshot, VirtualRecipe};
pub use unroll::{optimize_peeled, PeeledLoop};
pub use virtualize::{VirtualContent, VirtualId, VirtualState};
