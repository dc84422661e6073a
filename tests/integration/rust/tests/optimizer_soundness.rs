//! Optimizer Soundness Tests
//!
//! Every test builds a trace, optimizes it, runs both versions through the
//! reference evaluator on the same inputs, and asserts identical outcomes.
//! An optimization that changes an observable result is a miscompile.

use trace_ir::eval::{evaluate, CallHandler, EvalError, EvalOutcome, Heap, NoCalls, RtValue};
use trace_ir::{
    ArrayDescr, CallDescr, ClassDescr, ClassId, Const, EffectInfo, Opcode, Operand, SlotKind,
    Trace, TraceBuilder,
};
use trace_optimizer::Optimizer;

fn int(v: i64) -> Operand {
    Operand::Const(Const::Int(v))
}

/// Run `trace` and its optimized form on the same inputs and assert that
/// both exit the same way with the same values.
fn assert_equivalent(trace: &Trace, inputs: &[RtValue]) -> EvalOutcome {
    integration_tests::init_tracing();
    let optimized = Optimizer::optimize(trace).expect("optimization failed");

    let mut heap_a = Heap::new();
    let before = evaluate(trace, inputs, &mut heap_a, &mut NoCalls);
    let mut heap_b = Heap::new();
    let after = evaluate(&optimized.trace, inputs, &mut heap_b, &mut NoCalls);

    match (before, after) {
        (Ok(a), Ok(b)) => {
            assert_eq!(a.exit, b.exit);
            assert_eq!(a.values, b.values);
            a
        }
        (Err(EvalError::GuardFailed { .. }), Err(EvalError::GuardFailed { .. })) => EvalOutcome {
            exit: trace_ir::eval::ExitKind::Finish,
            values: vec![],
            guards_passed: 0,
        },
        (a, b) => panic!("divergent outcomes: {a:?} vs {b:?}"),
    }
}

#[test]
fn test_cse_preserves_result() {
    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let a = b.op2(Opcode::IntAdd, i0.into(), int(3));
    let c = b.op2(Opcode::IntAdd, i0.into(), int(3));
    let s = b.op2(Opcode::IntMul, a.into(), c.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(4)]);
    assert_eq!(out.values, vec![RtValue::Int(49)]);

    let optimized = Optimizer::optimize(&trace).unwrap();
    let adds = optimized
        .trace
        .ops
        .iter()
        .filter(|o| o.opcode == Opcode::IntAdd)
        .count();
    assert_eq!(adds, 1);
}

#[test]
fn test_constant_folding_preserves_result() {
    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let k = b.op2(Opcode::IntMul, int(6), int(7));
    let s = b.op2(Opcode::IntAdd, i0.into(), k.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(-2)]);
    assert_eq!(out.values, vec![RtValue::Int(40)]);
}

#[test]
fn test_redundant_load_is_forwarded_soundly() {
    let class = ClassDescr::new(ClassId(0), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let obj = b.new_object(class);
    b.set_field(obj.into(), i0.into(), fd);
    let v1 = b.get_field(obj.into(), fd);
    let v2 = b.get_field(obj.into(), fd);
    let s = b.op2(Opcode::IntAdd, v1.into(), v2.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(21)]);
    assert_eq!(out.values, vec![RtValue::Int(42)]);

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode == Opcode::GetField));
}

#[test]
fn test_stores_to_distinct_fields_do_not_alias() {
    let class = ClassDescr::new(ClassId(1), vec![SlotKind::Int, SlotKind::Int]);
    let f0 = class.field(0).unwrap();
    let f1 = class.field(1).unwrap();

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let obj = b.new_object(class);
    b.set_field(obj.into(), i0.into(), f0);
    b.set_field(obj.into(), int(100), f1);
    let v = b.get_field(obj.into(), f0);
    b.finish(vec![v.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(7)]);
    assert_eq!(out.values, vec![RtValue::Int(7)]);
}

#[test]
fn test_array_cells_are_forwarded_per_index() {
    let ad = ArrayDescr {
        elem: SlotKind::Int,
    };

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let arr = b.new_array(ad, int(3));
    b.set_item(arr.into(), int(0), i0.into(), ad);
    b.set_item(arr.into(), int(1), int(-5), ad);
    let v0 = b.get_item(arr.into(), int(0), ad);
    let v1 = b.get_item(arr.into(), int(1), ad);
    let len = b.array_len(arr.into(), ad);
    let s = b.op2(Opcode::IntAdd, v0.into(), v1.into());
    let s = b.op2(Opcode::IntAdd, s.into(), len.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(10)]);
    assert_eq!(out.values, vec![RtValue::Int(8)]);
}

#[test]
fn test_implied_guard_elision_keeps_the_exit_condition() {
    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let c1 = b.op2(Opcode::IntLt, i0.into(), int(10));
    b.guard(Opcode::GuardTrue, vec![c1.into()]);
    let c2 = b.op2(Opcode::IntLt, i0.into(), int(20));
    b.guard(Opcode::GuardTrue, vec![c2.into()]);
    b.finish(vec![i0.into()]);
    let trace = b.build();

    // the second guard is implied by the first and must be dropped
    let optimized = Optimizer::optimize(&trace).unwrap();
    let guards = optimized
        .trace
        .ops
        .iter()
        .filter(|o| o.opcode.is_guard())
        .count();
    assert_eq!(guards, 1);

    // passing and failing inputs behave identically in both versions
    assert_equivalent(&trace, &[RtValue::Int(5)]);
    assert_equivalent(&trace, &[RtValue::Int(15)]);
}

#[test]
fn test_overflow_demotion_preserves_arithmetic() {
    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let low = b.op2(Opcode::IntLt, int(0), i0.into());
    b.guard(Opcode::GuardTrue, vec![low.into()]);
    let high = b.op2(Opcode::IntLt, i0.into(), int(1000));
    b.guard(Opcode::GuardTrue, vec![high.into()]);
    let s = b.op2(Opcode::IntAddOvf, i0.into(), int(1));
    b.guard(Opcode::GuardNoOverflow, vec![]);
    b.finish(vec![s.into()]);
    let trace = b.build();

    let out = assert_equivalent(&trace, &[RtValue::Int(41)]);
    assert_eq!(out.values, vec![RtValue::Int(42)]);

    // the bounded operands make the overflow check unnecessary
    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized
        .trace
        .ops
        .iter()
        .any(|o| o.opcode == Opcode::IntAddOvf || o.opcode == Opcode::GuardNoOverflow));
}

#[test]
fn test_wrapping_add_does_not_imply_sign() {
    // plain int_add wraps, so a positive operand does not make the sum
    // positive and the sign guard below must survive
    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let pos = b.op2(Opcode::IntLt, int(0), i0.into());
    b.guard(Opcode::GuardTrue, vec![pos.into()]);
    let s = b.op2(Opcode::IntAdd, i0.into(), int(1));
    let neg = b.op2(Opcode::IntLt, s.into(), int(0));
    b.guard(Opcode::GuardFalse, vec![neg.into()]);
    b.finish(vec![s.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    let guards = optimized
        .trace
        .ops
        .iter()
        .filter(|o| o.opcode.is_guard())
        .count();
    assert_eq!(guards, 2);

    // i64::MAX + 1 wraps negative and both versions must deopt
    assert_equivalent(&trace, &[RtValue::Int(i64::MAX)]);
    let out = assert_equivalent(&trace, &[RtValue::Int(5)]);
    assert_eq!(out.values, vec![RtValue::Int(6)]);
}

/// Call handler that increments a heap field, so a cached load across the
/// call would observe a stale value.
struct FieldBumper;

impl CallHandler for FieldBumper {
    fn call(
        &mut self,
        _descr: &CallDescr,
        args: &[RtValue],
        heap: &mut Heap,
    ) -> Result<RtValue, EvalError> {
        let RtValue::Obj(obj) = args[0] else {
            return Err(EvalError::TypeError(0));
        };
        let RtValue::Int(v) = heap.get_field(obj, 0)? else {
            return Err(EvalError::TypeError(0));
        };
        heap.set_field(obj, 0, RtValue::Int(v + 1))?;
        Ok(RtValue::Int(0))
    }
}

#[test]
fn test_side_effecting_call_invalidates_cached_loads() {
    let class = ClassDescr::new(ClassId(2), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();
    let cd = CallDescr {
        target: 9,
        effect: EffectInfo::Default,
    };

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let obj = b.new_object(class);
    b.set_field(obj.into(), i0.into(), fd);
    b.call(cd, vec![obj.into()]);
    let v = b.get_field(obj.into(), fd);
    b.finish(vec![v.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();

    let mut heap_a = Heap::new();
    let before = evaluate(&trace, &[RtValue::Int(10)], &mut heap_a, &mut FieldBumper).unwrap();
    let mut heap_b = Heap::new();
    let after = evaluate(
        &optimized.trace,
        &[RtValue::Int(10)],
        &mut heap_b,
        &mut FieldBumper,
    )
    .unwrap();

    // the call bumped the field; both versions must see the new value
    assert_eq!(before.values, vec![RtValue::Int(11)]);
    assert_eq!(after.values, before.values);
}

#[test]
fn test_heap_inert_call_keeps_cached_loads() {
    let class = ClassDescr::new(ClassId(3), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();
    let cd = CallDescr {
        target: 4,
        effect: EffectInfo::HeapInert,
    };

    struct ReturnsZero;
    impl CallHandler for ReturnsZero {
        fn call(
            &mut self,
            _descr: &CallDescr,
            _args: &[RtValue],
            _heap: &mut Heap,
        ) -> Result<RtValue, EvalError> {
            Ok(RtValue::Int(0))
        }
    }

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let obj = b.new_object(class);
    b.set_field(obj.into(), i0.into(), fd);
    b.call(cd, vec![obj.into()]);
    let v = b.get_field(obj.into(), fd);
    b.finish(vec![v.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    // the load after a heap-inert call is still forwarded from the store
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode == Opcode::GetField));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(3)],
        &mut heap,
        &mut ReturnsZero,
    )
    .unwrap();
    assert_eq!(out.values, vec![RtValue::Int(3)]);
}
