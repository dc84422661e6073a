//! Integer interval propagation and guard finalization.
//!
//! This stage runs last before emission. It assigns an interval to every
//! integer result, folds comparisons whose outcome the intervals already
//! decide, demotes overflow-checked arithmetic to plain arithmetic when
//! overflow is impossible (dropping the paired `guard_no_overflow`), and
//! decides every guard: implied guards vanish, impossible guards abort
//! compilation, the rest are emitted and then refine the known facts.
//!
//! Refinement from an emitted guard happens strictly *after* its snapshot
//! is frozen: the snapshot describes the state in which the guard is about
//! to fail, where the guarded fact does not hold.

use tracing::debug;
use trace_ir::{BoxId, Const, Opcode, Operand, Operation};

use crate::error::CompileError;
use crate::intbound::IntBound;
use crate::optimizer::Core;

/// Run one operation through the bounds stage.
pub(crate) fn apply(core: &mut Core, op: Operation) -> Result<Option<Operation>, CompileError> {
    let demoted_prev = std::mem::take(&mut core.last_ovf_demoted);
    use Opcode::*;
    match op.opcode {
        IntAdd | IntSub | IntMul | IntNeg => {
            let bounds = arith_bounds(core, op.opcode, &op.args);
            if let Some(result) = op.result {
                core.facts.set_bounds(result, bounds);
            }
            Ok(Some(op))
        }
        IntAnd => {
            // masking with a non-negative constant bounds the result
            if let Some(result) = op.result {
                let a = core.facts.bounds(arg(&op, 0));
                let b = core.facts.bounds(arg(&op, 1));
                for mask in [a, b] {
                    if let Some(hi) = mask.upper {
                        if mask.lower.is_some_and(|lo| lo >= 0) {
                            core.facts.refine_bounds(result, &IntBound::range(0, hi));
                        }
                    }
                }
            }
            Ok(Some(op))
        }
        IntAddOvf | IntSubOvf | IntMulOvf => demote_overflow(core, op),
        IntLt | IntLe | IntEq | IntNe | IntGt | IntGe => {
            let a = core.facts.bounds(arg(&op, 0));
            let b = core.facts.bounds(arg(&op, 1));
            let same = same_box(&op);
            let decided = match op.opcode {
                IntLt => {
                    if same {
                        Some(false)
                    } else if a.known_lt(&b) {
                        Some(true)
                    } else if a.known_ge(&b) {
                        Some(false)
                    } else {
                        None
                    }
                }
                IntLe => {
                    if same || a.known_le(&b) {
                        Some(true)
                    } else if a.known_gt(&b) {
                        Some(false)
                    } else {
                        None
                    }
                }
                IntGt => {
                    if same {
                        Some(false)
                    } else if a.known_gt(&b) {
                        Some(true)
                    } else if a.known_le(&b) {
                        Some(false)
                    } else {
                        None
                    }
                }
                IntGe => {
                    if same || a.known_ge(&b) {
                        Some(true)
                    } else if a.known_lt(&b) {
                        Some(false)
                    } else {
                        None
                    }
                }
                IntEq => {
                    if same {
                        Some(true)
                    } else if a.known_ne(&b) {
                        Some(false)
                    } else {
                        None
                    }
                }
                _ => {
                    if same {
                        Some(false)
                    } else if a.known_ne(&b) {
                        Some(true)
                    } else {
                        None
                    }
                }
            };
            finish_comparison(core, op, decided)
        }
        IntIsTrue | IntIsZero => {
            let b = core.facts.bounds(arg(&op, 0));
            let nonzero = !b.contains(0);
            let decided = if nonzero {
                Some(op.opcode == IntIsTrue)
            } else {
                None
            };
            finish_comparison(core, op, decided)
        }
        GuardNoOverflow => {
            if demoted_prev {
                core.stats.guards_elided += 1;
                Ok(None)
            } else {
                Ok(Some(op))
            }
        }
        GuardTrue | GuardFalse => {
            let wanted = op.opcode == GuardTrue;
            match arg(&op, 0) {
                Operand::Const(c) => {
                    if c.is_true() == wanted {
                        core.stats.guards_elided += 1;
                        Ok(None)
                    } else {
                        Err(CompileError::InvalidLoop(format!(
                            "guard on constant condition {c:?} can never pass"
                        )))
                    }
                }
                Operand::Box(cond) => {
                    match provable_truth(core, cond) {
                        Some(truth) if truth == wanted => {
                            core.stats.guards_elided += 1;
                            Ok(None)
                        }
                        Some(_) => Err(CompileError::InvalidLoop(
                            "guard contradicts known bounds".into(),
                        )),
                        None => Ok(Some(op)),
                    }
                }
            }
        }
        GuardValue => {
            let (a, b) = (arg(&op, 0), arg(&op, 1));
            if a == b {
                core.stats.guards_elided += 1;
                return Ok(None);
            }
            if let (Operand::Const(x), Operand::Const(y)) = (a, b) {
                // constants compare by identity, see Const's Eq
                return if x == y {
                    core.stats.guards_elided += 1;
                    Ok(None)
                } else {
                    Err(CompileError::InvalidLoop(format!(
                        "guard_value {x:?} != {y:?} can never pass"
                    )))
                };
            }
            Ok(Some(op))
        }
        GuardNonnull => {
            let base = arg(&op, 0);
            if core.facts.known_nonnull(base) {
                core.stats.guards_elided += 1;
                return Ok(None);
            }
            if base == Operand::Const(Const::Null) {
                return Err(CompileError::InvalidLoop("guard_nonnull on null".into()));
            }
            Ok(Some(op))
        }
        GuardIsnull => {
            let base = arg(&op, 0);
            if base == Operand::Const(Const::Null) {
                core.stats.guards_elided += 1;
                return Ok(None);
            }
            if core.facts.known_nonnull(base) {
                return Err(CompileError::InvalidLoop(
                    "guard_isnull on a proven non-null reference".into(),
                ));
            }
            Ok(Some(op))
        }
        GuardClass => {
            let Some(class) = op.class_descr() else {
                return Ok(Some(op));
            };
            if let Operand::Box(b) = arg(&op, 0) {
                match core.facts.value(b).known_class {
                    Some(known) if known == class.id => {
                        core.stats.guards_elided += 1;
                        return Ok(None);
                    }
                    Some(_) => {
                        return Err(CompileError::InvalidLoop(
                            "guard_class contradicts a previous class guard".into(),
                        ))
                    }
                    None => {}
                }
            }
            Ok(Some(op))
        }
        _ => Ok(Some(op)),
    }
}

/// Refine facts from a guard that is now emitted (snapshot already frozen).
pub(crate) fn after_guard(core: &mut Core, op: &Operation) -> Result<(), CompileError> {
    use Opcode::*;
    match op.opcode {
        GuardTrue | GuardFalse => {
            let truth = op.opcode == GuardTrue;
            if let Operand::Box(cond) = arg(op, 0) {
                // the condition box itself is now a known 0/1
                core.facts
                    .set_constant(cond, Const::Int(truth as i64));
                if let Some((def_opcode, def_args)) = core.defs.get(&cond).cloned() {
                    refine_comparison(core, def_opcode, &def_args, truth)?;
                }
            }
            Ok(())
        }
        GuardValue => {
            if let (Operand::Box(b), expected) = (arg(op, 0), arg(op, 1)) {
                match expected {
                    Operand::Const(c) => core.facts.set_constant(b, c),
                    Operand::Box(e) => merge_boxes(core, e, b),
                }
            }
            Ok(())
        }
        GuardClass => {
            if let (Operand::Box(b), Some(class)) = (arg(op, 0), op.class_descr()) {
                let entry = core.facts.entry(b);
                entry.known_class = Some(class.id);
                entry.known_nonnull = true;
            }
            Ok(())
        }
        GuardNonnull => {
            if let Operand::Box(b) = arg(op, 0) {
                core.facts.entry(b).known_nonnull = true;
            }
            Ok(())
        }
        GuardIsnull => {
            if let Operand::Box(b) = arg(op, 0) {
                core.facts.set_constant(b, Const::Null);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn arg(op: &Operation, i: usize) -> Operand {
    op.args.get(i).copied().unwrap_or(Operand::Const(Const::Null))
}

/// Two boxes are proven to hold the same value. Alias `y` to `x` and
/// merge their cached heap facts so loads through either box forward.
fn merge_boxes(core: &mut Core, x: BoxId, y: BoxId) {
    let keep = core.facts.canonical(x);
    let gone = core.facts.canonical(y);
    if keep != gone {
        core.facts.set_alias(gone, Operand::Box(keep));
        core.heap.merge(keep, gone);
    }
}

fn same_box(op: &Operation) -> bool {
    match (op.args.first(), op.args.get(1)) {
        (Some(Operand::Box(a)), Some(Operand::Box(b))) => a == b,
        _ => false,
    }
}

fn arith_bounds(core: &Core, opcode: Opcode, args: &[Operand]) -> IntBound {
    let a = args
        .first()
        .map(|&a| core.facts.bounds(a))
        .unwrap_or_default();
    let b = args
        .get(1)
        .map(|&b| core.facts.bounds(b))
        .unwrap_or_default();
    match opcode {
        Opcode::IntAdd => a.add(&b),
        Opcode::IntSub => a.sub(&b),
        Opcode::IntMul => a.mul(&b),
        Opcode::IntNeg => a.neg(),
        _ => IntBound::unbounded(),
    }
}

/// Rewrite `int_*_ovf` into the plain opcode when the operand intervals
/// prove overflow impossible, flagging the demotion so the trailing
/// `guard_no_overflow` is dropped.
fn demote_overflow(core: &mut Core, mut op: Operation) -> Result<Option<Operation>, CompileError> {
    let a = core.facts.bounds(arg(&op, 0));
    let b = core.facts.bounds(arg(&op, 1));

    // all-constant operands: decide now
    if let (Some(x), Some(y)) = (a.as_exact(), b.as_exact()) {
        let folded = op.opcode.fold(&[Const::Int(x), Const::Int(y)]);
        return match folded {
            Some(c) => {
                if let Some(result) = op.result {
                    core.facts.set_constant(result, c);
                }
                core.stats.constants_folded += 1;
                core.last_ovf_demoted = true;
                Ok(None)
            }
            None => Err(CompileError::InvalidLoop(
                "overflow-checked arithmetic on constants always overflows".into(),
            )),
        };
    }

    // the wrapping interval ops only produce a bound when no input pair
    // can overflow, which is exactly the demotion condition
    let (plain, safe) = match op.opcode {
        Opcode::IntAddOvf => {
            let sum = a.add(&b);
            (Opcode::IntAdd, (!sum.is_unbounded()).then_some(sum))
        }
        Opcode::IntSubOvf => {
            let diff = a.sub(&b);
            (Opcode::IntSub, (!diff.is_unbounded()).then_some(diff))
        }
        _ => {
            let prod = a.mul(&b);
            (Opcode::IntMul, (!prod.is_unbounded()).then_some(prod))
        }
    };

    match safe {
        Some(bounds) => {
            debug!(opcode = ?op.opcode, "overflow provably impossible, demoting");
            op.opcode = plain;
            if let Some(result) = op.result {
                core.facts.set_bounds(result, bounds);
            }
            core.last_ovf_demoted = true;
            Ok(Some(op))
        }
        None => {
            // the guard stays; once it passes the result cannot have
            // wrapped, so one-sided bounds remain valid here
            if let Some(result) = op.result {
                let bounds = match op.opcode {
                    Opcode::IntAddOvf => a.add_nowrap(&b),
                    Opcode::IntSubOvf => a.sub_nowrap(&b),
                    _ => a.mul(&b),
                };
                core.facts.set_bounds(result, bounds);
            }
            Ok(Some(op))
        }
    }
}

fn finish_comparison(
    core: &mut Core,
    op: Operation,
    decided: Option<bool>,
) -> Result<Option<Operation>, CompileError> {
    match (decided, op.result) {
        (Some(truth), Some(result)) => {
            core.facts.set_constant(result, Const::Int(truth as i64));
            core.stats.constants_folded += 1;
            Ok(None)
        }
        _ => {
            if let Some(result) = op.result {
                core.facts.set_bounds(result, IntBound::range(0, 1));
            }
            Ok(Some(op))
        }
    }
}

/// Truth of a comparison box, if its recorded defining operation is decided
/// by the current intervals.
fn provable_truth(core: &Core, cond: BoxId) -> Option<bool> {
    let bounds = core.facts.bounds(Operand::Box(cond));
    if !bounds.contains(0) {
        return Some(true);
    }
    if bounds.as_exact() == Some(0) {
        return Some(false);
    }
    let (opcode, args) = core.defs.get(&cond)?;
    let a = core.facts.bounds(*args.first()?);
    let b = core.facts.bounds(*args.get(1)?);
    match opcode {
        Opcode::IntLt if a.known_lt(&b) => Some(true),
        Opcode::IntLt if a.known_ge(&b) => Some(false),
        Opcode::IntLe if a.known_le(&b) => Some(true),
        Opcode::IntLe if a.known_gt(&b) => Some(false),
        Opcode::IntGt if a.known_gt(&b) => Some(true),
        Opcode::IntGt if a.known_le(&b) => Some(false),
        Opcode::IntGe if a.known_ge(&b) => Some(true),
        Opcode::IntGe if a.known_lt(&b) => Some(false),
        Opcode::IntEq if a.known_ne(&b) => Some(false),
        Opcode::IntNe if a.known_ne(&b) => Some(true),
        _ => None,
    }
}

/// Backward refinement: a comparison result is now known; narrow the
/// intervals (or aliases) of its operands accordingly.
fn refine_comparison(
    core: &mut Core,
    opcode: Opcode,
    args: &[Operand],
    truth: bool,
) -> Result<(), CompileError> {
    use Opcode::*;
    let a = args.first().copied().unwrap_or(Operand::Const(Const::Null));
    let b = args.get(1).copied().unwrap_or(Operand::Const(Const::Null));
    let ba = core.facts.bounds(a);
    let bb = core.facts.bounds(b);

    // normalize to the relation that is true
    let relation = match (opcode, truth) {
        (IntLt, true) | (IntGe, false) => Some(IntLt),
        (IntLe, true) | (IntGt, false) => Some(IntLe),
        (IntGt, true) | (IntLe, false) => Some(IntGt),
        (IntGe, true) | (IntLt, false) => Some(IntGe),
        (IntEq, true) | (IntNe, false) => Some(IntEq),
        (IntNe, true) | (IntEq, false) => Some(IntNe),
        _ => None,
    };

    match relation {
        Some(IntLt) => {
            refine(core, a, |x| {
                x.make_lt(&bb);
            });
            refine(core, b, |x| {
                x.make_gt(&ba);
            });
        }
        Some(IntLe) => {
            refine(core, a, |x| {
                x.make_le(&bb);
            });
            refine(core, b, |x| {
                x.make_ge(&ba);
            });
        }
        Some(IntGt) => {
            refine(core, a, |x| {
                x.make_gt(&bb);
            });
            refine(core, b, |x| {
                x.make_lt(&ba);
            });
        }
        Some(IntGe) => {
            refine(core, a, |x| {
                x.make_ge(&bb);
            });
            refine(core, b, |x| {
                x.make_le(&ba);
            });
        }
        Some(IntEq) => {
            refine(core, a, |x| {
                x.intersect(&bb);
            });
            refine(core, b, |x| {
                x.intersect(&ba);
            });
        }
        Some(IntNe) => {}
        _ => match (opcode, truth) {
            (PtrEq, true) | (PtrNe, false) => {
                if let (Operand::Box(x), Operand::Box(y)) = (a, b) {
                    merge_boxes(core, x, y);
                }
            }
            (IntIsTrue, truth) => {
                if let Operand::Box(x) = a {
                    if truth {
                        exclude_zero(core, x);
                    } else {
                        core.facts.set_constant(x, Const::Int(0));
                    }
                }
            }
            (IntIsZero, truth) => {
                if let Operand::Box(x) = a {
                    if truth {
                        core.facts.set_constant(x, Const::Int(0));
                    } else {
                        exclude_zero(core, x);
                    }
                }
            }
            _ => {}
        },
    }

    // a refinement that empties an interval means the guard can never pass
    for operand in [a, b] {
        if core.facts.bounds(operand).is_empty() {
            return Err(CompileError::InvalidLoop(
                "guard refinement produced an empty interval".into(),
            ));
        }
    }
    Ok(())
}

fn refine(core: &mut Core, operand: Operand, f: impl FnOnce(&mut IntBound)) {
    if let Operand::Box(b) = operand {
        let mut bounds = core.facts.bounds(operand);
        f(&mut bounds);
        core.facts.refine_bounds(b, &bounds);
    }
}

/// Nudge an interval off zero when an endpoint sits on it.
fn exclude_zero(core: &mut Core, b: BoxId) {
    let bounds = core.facts.bounds(Operand::Box(b));
    if bounds.lower == Some(0) {
        core.facts
            .refine_bounds(b, &IntBound { lower: Some(1), upper: None });
    } else if bounds.upper == Some(0) {
        core.facts
            .refine_bounds(b, &IntBound { lower: None, upper: Some(-1) });
    }
}
