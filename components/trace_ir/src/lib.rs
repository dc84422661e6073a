//! Trace intermediate representation for the tracing JIT.
//!
//! This crate provides:
//! - Boxes and constants: SSA-style value handles and literals
//! - Operations: a closed opcode set with layout/call descriptors
//! - Traces: linear operation sequences with structural validation
//! - A reference evaluator for differential testing and deoptimization
//!
//! # Example
//!
//! ```
//! use trace_ir::{TraceBuilder, Opcode, Const, eval};
//!
//! let mut b = TraceBuilder::new();
//! let i0 = b.input();
//! let i1 = b.op2(Opcode::IntAdd, i0.into(), Const::Int(1).into());
//! b.finish(vec![i1.into()]);
//! let trace = b.build();
//! trace.validate().unwrap();
//!
//! let mut heap = eval::Heap::new();
//! let out = eval::evaluate(
//!     &trace,
//!     &[eval::RtValue::Int(41)],
//!     &mut heap,
//!     &mut eval::NoCalls,
//! )
//! .unwrap();
//! assert_eq!(out.values, vec![eval::RtValue::Int(42)]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod builder;
mod descr;
pub mod eval;
mod operation;
mod trace;
mod value;

pub use builder::TraceBuilder;
pub use descr::{ArrayDescr, CallDescr, ClassDescr, ClassId, EffectInfo, FieldDescr, FrameDescr};
pub use operation::{Descr, IrError, Opcode, Operand, Operation, SnapshotRef};
pub use trace::Trace;
pub use value::{BoxFactory, BoxId, Const, SlotKind};
