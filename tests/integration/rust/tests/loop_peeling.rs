//! Loop Peeling Tests
//!
//! A peeled loop is a preamble trace followed by a steady-state body. These
//! tests execute the original loop trace N times through the reference
//! evaluator, then the preamble once plus the body N-1 times, and require
//! identical loop-carried values and identical guard exits.

use trace_ir::eval::{evaluate, EvalError, ExitKind, Heap, NoCalls, RtValue};
use trace_ir::{Const, Opcode, Operand, Trace, TraceBuilder};
use trace_optimizer::{optimize_peeled, PeeledLoop};

fn int(v: i64) -> Operand {
    Operand::Const(Const::Int(v))
}

/// What repeated execution of a loop produced: the carried values after
/// each completed pass, and whether a guard eventually tripped.
struct LoopRun {
    passes: Vec<Vec<RtValue>>,
    guard_tripped: bool,
}

fn run_repeatedly(trace: &Trace, start: &[RtValue], max_passes: usize) -> LoopRun {
    let mut heap = Heap::new();
    let mut state = start.to_vec();
    let mut passes = Vec::new();
    for _ in 0..max_passes {
        match evaluate(trace, &state, &mut heap, &mut NoCalls) {
            Ok(out) => {
                assert_eq!(out.exit, ExitKind::Jump);
                state = out.values.clone();
                passes.push(out.values);
            }
            Err(EvalError::GuardFailed { .. }) => {
                return LoopRun {
                    passes,
                    guard_tripped: true,
                };
            }
            Err(e) => panic!("evaluator error: {e:?}"),
        }
    }
    LoopRun {
        passes,
        guard_tripped: false,
    }
}

/// Run the peeled form: preamble once, then the body until `max_passes`
/// total passes have completed or a guard trips.
fn run_peeled(peeled: &PeeledLoop, start: &[RtValue], max_passes: usize) -> LoopRun {
    let mut heap = Heap::new();
    let mut passes = Vec::new();

    let mut state = match evaluate(&peeled.preamble.trace, start, &mut heap, &mut NoCalls) {
        Ok(out) => {
            assert_eq!(out.exit, ExitKind::Jump);
            passes.push(out.values.clone());
            out.values
        }
        Err(EvalError::GuardFailed { .. }) => {
            return LoopRun {
                passes,
                guard_tripped: true,
            }
        }
        Err(e) => panic!("evaluator error: {e:?}"),
    };

    while passes.len() < max_passes {
        match evaluate(&peeled.body.trace, &state, &mut heap, &mut NoCalls) {
            Ok(out) => {
                assert_eq!(out.exit, ExitKind::Jump);
                state = out.values.clone();
                passes.push(out.values);
            }
            Err(EvalError::GuardFailed { .. }) => {
                return LoopRun {
                    passes,
                    guard_tripped: true,
                }
            }
            Err(e) => panic!("evaluator error: {e:?}"),
        }
    }
    LoopRun {
        passes,
        guard_tripped: false,
    }
}

/// Assert that original and peeled runs agree on the first
/// `carried` loop-carried positions of every completed pass.
fn assert_same_run(trace: &Trace, start: &[RtValue], max_passes: usize) {
    integration_tests::init_tracing();
    let carried = trace.inputs.len();
    let peeled = optimize_peeled(trace).expect("peeling failed");

    let original = run_repeatedly(trace, start, max_passes);
    let rewritten = run_peeled(&peeled, start, max_passes);

    assert_eq!(original.guard_tripped, rewritten.guard_tripped);
    assert_eq!(original.passes.len(), rewritten.passes.len());
    for (a, b) in original.passes.iter().zip(&rewritten.passes) {
        assert_eq!(&a[..carried], &b[..carried]);
    }
}

#[test]
fn test_counter_loop_runs_identically() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let i1 = b.op2(Opcode::IntAdd, i.into(), int(1));
    b.jump(vec![i1.into()]);
    let trace = b.build();

    assert_same_run(&trace, &[RtValue::Int(0)], 10);
}

#[test]
fn test_guarded_loop_exits_on_the_same_iteration() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let cond = b.op2(Opcode::IntLt, i.into(), n.into());
    b.guard(Opcode::GuardTrue, vec![cond.into()]);
    let i1 = b.op2(Opcode::IntAdd, i.into(), int(1));
    b.jump(vec![i1.into(), n.into()]);
    let trace = b.build();

    assert_same_run(&trace, &[RtValue::Int(0), RtValue::Int(6)], 100);
}

#[test]
fn test_invariant_work_is_hoisted_out_of_the_body() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let k = b.input();
    let step = b.op2(Opcode::IntMul, k.into(), int(2));
    let i1 = b.op2(Opcode::IntAdd, i.into(), step.into());
    b.jump(vec![i1.into(), k.into()]);
    let trace = b.build();

    let peeled = optimize_peeled(&trace).unwrap();
    // the multiply runs once in the preamble and is carried into the body
    assert!(!peeled.body.trace.ops.iter().any(|o| o.opcode == Opcode::IntMul));
    assert_eq!(peeled.body.trace.inputs.len(), 3);

    assert_same_run(&trace, &[RtValue::Int(1), RtValue::Int(3)], 8);
}

#[test]
fn test_overflow_guard_stays_without_a_range_proof() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let i1 = b.op2(Opcode::IntAddOvf, i.into(), int(1));
    b.guard(Opcode::GuardNoOverflow, vec![]);
    b.jump(vec![i1.into()]);
    let trace = b.build();

    // nothing bounds the counter across the back edge, so the check stays
    let peeled = optimize_peeled(&trace).unwrap();
    assert!(peeled
        .body
        .trace
        .ops
        .iter()
        .any(|o| o.opcode == Opcode::GuardNoOverflow));

    assert_same_run(&trace, &[RtValue::Int(i64::MAX - 3)], 10);
}

#[test]
fn test_bounded_counter_loses_its_overflow_guard() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let low = b.op2(Opcode::IntLt, int(0), i.into());
    b.guard(Opcode::GuardTrue, vec![low.into()]);
    let high = b.op2(Opcode::IntLt, i.into(), int(1000));
    b.guard(Opcode::GuardTrue, vec![high.into()]);
    let i1 = b.op2(Opcode::IntAddOvf, i.into(), int(1));
    b.guard(Opcode::GuardNoOverflow, vec![]);
    b.jump(vec![i1.into()]);
    let trace = b.build();

    // the range checks prove the add cannot overflow in the body either
    let peeled = optimize_peeled(&trace).unwrap();
    assert!(!peeled
        .body
        .trace
        .ops
        .iter()
        .any(|o| o.opcode == Opcode::GuardNoOverflow || o.opcode == Opcode::IntAddOvf));

    assert_same_run(&trace, &[RtValue::Int(995)], 20);
}

#[test]
fn test_store_survives_the_back_edge() {
    use trace_ir::{ClassDescr, ClassId, SlotKind};

    let class = ClassDescr::new(ClassId(0), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();

    // each iteration reads what the previous one stored; the stored value
    // is loop-carried, so the body's load folds to the carried input
    let mut b = TraceBuilder::new();
    let i = b.input();
    let obj = b.input();
    let v = b.get_field(obj.into(), fd);
    let i1 = b.op2(Opcode::IntAdd, i.into(), v.into());
    b.set_field(obj.into(), i1.into(), fd);
    b.jump(vec![i1.into(), obj.into()]);
    let trace = b.build();

    let peeled = optimize_peeled(&trace).unwrap();
    assert!(!peeled
        .body
        .trace
        .ops
        .iter()
        .any(|o| o.opcode == Opcode::GetField));
    assert!(peeled
        .body
        .trace
        .ops
        .iter()
        .any(|o| o.opcode == Opcode::SetField));

    let run = |passes: usize, peel: bool| -> (RtValue, RtValue) {
        let mut heap = Heap::new();
        let o = heap.alloc_object(&class);
        heap.set_field(o, 0, RtValue::Int(5)).unwrap();
        let mut state = vec![RtValue::Int(0), RtValue::Obj(o)];
        if peel {
            state = evaluate(&peeled.preamble.trace, &state, &mut heap, &mut NoCalls)
                .unwrap()
                .values;
            for _ in 1..passes {
                state = evaluate(&peeled.body.trace, &state, &mut heap, &mut NoCalls)
                    .unwrap()
                    .values;
            }
        } else {
            for _ in 0..passes {
                state = evaluate(&trace, &state, &mut heap, &mut NoCalls)
                    .unwrap()
                    .values;
            }
        }
        (state[0], heap.get_field(o, 0).unwrap())
    };

    assert_eq!(run(4, false), run(4, true));
}
