//! Loop peeling.
//!
//! A loop trace is optimized twice. The first pass produces the *preamble*,
//! the cold entry copy. Its end-of-trace facts are exported, rebased onto
//! back-edge argument positions, and used to seed a second pass over a
//! renamed copy of the same operations, the *steady state* loop. Facts that
//! hold at the end of iteration one are then available at the top of
//! iteration two, which is where loop-invariant code motion, cross-
//! iteration CSE and bounds-based guard removal actually pay off.
//!
//! Seeded facts are assumptions, not theorems: after the steady pass, each
//! one must be re-derived by the pass itself or it is dropped and the pass
//! redone with the surviving subset. The retreat is bounded and ends at the
//! empty seed, which is trivially sound.

use std::collections::HashMap;

use tracing::debug;
use trace_ir::{BoxId, IrError, Opcode, Operand, Trace};

use crate::error::CompileError;
use crate::intbound::IntBound;
use crate::optimizer::{ExportedState, OptimizedTrace, Optimizer};

/// A peeled loop: run the preamble once, then the body forever.
#[derive(Debug)]
pub struct PeeledLoop {
    /// Entry copy, executed for the first iteration.
    pub preamble: OptimizedTrace,
    /// Steady-state copy targeted by the preamble's (and its own) back
    /// edge.
    pub body: OptimizedTrace,
}

/// Peel and optimize a loop trace (one whose terminal is `jump`).
///
/// Straight-line traces ending in `finish` have nothing to peel; optimize
/// those with [`Optimizer::optimize`] directly.
pub fn optimize_peeled(trace: &Trace) -> Result<PeeledLoop, CompileError> {
    if trace.terminal().map(|t| t.opcode) != Some(Opcode::Jump) {
        return Err(
            IrError::MalformedTrace("peeling requires a jump-terminated loop trace".into()).into(),
        );
    }

    let mut pre_opt = Optimizer::new();
    let mut preamble = pre_opt.run(trace)?;
    let mut assumed = pre_opt.export_state(&preamble);
    let positions = assumed.args.len();

    for attempt in 0..3u32 {
        if attempt == 2 {
            assumed = ExportedState::unknown(positions);
        }
        let (steady, steady_inputs) = rename_body(trace)?;
        let mut opt = Optimizer::new();
        opt.import_state(&assumed, &steady_inputs);
        let mut body = match opt.run(&steady) {
            Ok(body) => body,
            // a seeded fact made some guard statically impossible; the
            // fact only held for the first iteration
            Err(CompileError::InvalidLoop(reason)) if attempt < 2 => {
                debug!(attempt, %reason, "seed contradicted the loop body, dropping it");
                assumed = ExportedState::unknown(positions);
                continue;
            }
            Err(e) => return Err(e),
        };
        match weaken(&assumed, &opt.export_state(&body)) {
            None => {
                // stable: wire the threaded invariants through both copies
                for &(pre_box, carried) in opt.threaded_values() {
                    if let Some(jump) = preamble.trace.ops.last_mut() {
                        jump.args.push(Operand::Box(pre_box));
                    }
                    body.trace.inputs.push(carried);
                    if let Some(jump) = body.trace.ops.last_mut() {
                        jump.args.push(Operand::Box(carried));
                    }
                }
                return Ok(PeeledLoop { preamble, body });
            }
            Some(weaker) => {
                debug!(attempt, "facts not re-derived across the back edge, weakening");
                assumed = weaker;
            }
        }
    }
    // the empty seed re-derives trivially; reaching here is a logic error
    Err(CompileError::InvalidLoop(
        "loop peeling failed to stabilize".into(),
    ))
}

/// Fresh-named copy of a loop trace: new input boxes, every operation
/// cloned with substituted operands.
fn rename_body(trace: &Trace) -> Result<(Trace, Vec<BoxId>), CompileError> {
    let mut factory = trace.box_factory();
    let mut subst: HashMap<BoxId, Operand> = HashMap::new();
    let inputs: Vec<BoxId> = trace
        .inputs
        .iter()
        .map(|&b| {
            let fresh = factory.fresh();
            subst.insert(b, Operand::Box(fresh));
            fresh
        })
        .collect();
    let mut ops = Vec::with_capacity(trace.ops.len());
    for op in &trace.ops {
        let cloned = op.clone_with_substitution(&subst, &mut factory)?;
        if let (Some(old), Some(new)) = (op.result, cloned.result) {
            subst.insert(old, Operand::Box(new));
        }
        ops.push(cloned);
    }
    Ok((Trace::new(inputs.clone(), ops), inputs))
}

/// Compare assumptions against what the steady pass re-derived. `None`
/// means every assumed fact held; otherwise the surviving subset is
/// returned. Threaded pure values are invariant by construction and are
/// never dropped.
fn weaken(assumed: &ExportedState, derived: &ExportedState) -> Option<ExportedState> {
    let mut out = assumed.clone();
    let mut changed = false;

    for (i, fact) in out.args.iter_mut().enumerate() {
        let d = derived.args.get(i).cloned().unwrap_or_default();
        if let Some(c) = fact.constant {
            if d.constant != Some(c) {
                fact.constant = None;
                fact.bounds = IntBound::unbounded();
                changed = true;
            }
        }
        if let Some(class) = fact.class {
            if d.class != Some(class) {
                fact.class = None;
                changed = true;
            }
        }
        if fact.nonnull && !d.nonnull {
            fact.nonnull = false;
            changed = true;
        }
        if !d.bounds.contained_in(&fact.bounds) {
            fact.bounds = IntBound::unbounded();
            changed = true;
        }
    }

    let before = out.heap_fields.len();
    out.heap_fields.retain(|f| derived.heap_fields.contains(f));
    changed |= out.heap_fields.len() != before;

    let before = out.heap_items.len();
    out.heap_items.retain(|f| derived.heap_items.contains(f));
    changed |= out.heap_items.len() != before;

    let before = out.lengths.len();
    out.lengths.retain(|l| derived.lengths.contains(l));
    changed |= out.lengths.len() != before;

    if changed {
        Some(out)
    } else {
        None
    }
}
