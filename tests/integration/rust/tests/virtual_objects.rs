//! Virtual Object Tests
//!
//! Allocations whose objects never escape must vanish from the optimized
//! trace, escaping ones must come back byte-for-byte identical, and elided
//! allocations referenced by a guard must be rebuildable on deoptimization.

use trace_ir::eval::{evaluate, CallHandler, EvalError, Heap, NoCalls, RtValue};
use trace_ir::{
    ArrayDescr, CallDescr, ClassDescr, ClassId, Const, EffectInfo, FieldDescr, FrameDescr, Opcode,
    Operand, SlotKind, TraceBuilder,
};
use trace_optimizer::Optimizer;

fn int(v: i64) -> Operand {
    Operand::Const(Const::Int(v))
}

#[test]
fn test_transparent_allocation_folds_away() {
    let class = ClassDescr::new(ClassId(0), vec![SlotKind::Int, SlotKind::Int]);
    let f0 = class.field(0).unwrap();
    let f1 = class.field(1).unwrap();

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let i1 = b.input();
    let p = b.new_object(class);
    b.set_field(p.into(), i0.into(), f0);
    b.set_field(p.into(), i1.into(), f1);
    let x = b.get_field(p.into(), f0);
    let y = b.get_field(p.into(), f1);
    let s = b.op2(Opcode::IntAdd, x.into(), y.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| {
        matches!(
            o.opcode,
            Opcode::NewObject | Opcode::SetField | Opcode::GetField
        )
    }));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(30), RtValue::Int(12)],
        &mut heap,
        &mut NoCalls,
    )
    .unwrap();
    assert_eq!(out.values, vec![RtValue::Int(42)]);
}

#[test]
fn test_escaping_allocation_is_rebuilt_with_its_stores() {
    let class = ClassDescr::new(ClassId(1), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();
    let cd = CallDescr {
        target: 2,
        effect: EffectInfo::Default,
    };

    struct ReadsField;
    impl CallHandler for ReadsField {
        fn call(
            &mut self,
            _descr: &CallDescr,
            args: &[RtValue],
            heap: &mut Heap,
        ) -> Result<RtValue, EvalError> {
            let RtValue::Obj(obj) = args[0] else {
                return Err(EvalError::TypeError(0));
            };
            heap.get_field(obj, 0)
        }
    }

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let p = b.new_object(class);
    b.set_field(p.into(), i0.into(), fd);
    let r = b.call(cd, vec![p.into()]);
    b.finish(vec![r.into()]);
    let trace = b.build();

    // the call forces the object; the allocation and its store reappear
    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(optimized.trace.ops.iter().any(|o| o.opcode == Opcode::NewObject));
    assert!(optimized.trace.ops.iter().any(|o| o.opcode == Opcode::SetField));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(7)],
        &mut heap,
        &mut ReadsField,
    )
    .unwrap();
    assert_eq!(out.values, vec![RtValue::Int(7)]);
}

#[test]
fn test_virtual_array_reads_fold_away() {
    let ad = ArrayDescr {
        elem: SlotKind::Int,
    };

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let arr = b.new_array(ad, int(2));
    b.set_item(arr.into(), int(0), i0.into(), ad);
    let v = b.get_item(arr.into(), int(0), ad);
    let unset = b.get_item(arr.into(), int(1), ad);
    let len = b.array_len(arr.into(), ad);
    let s = b.op2(Opcode::IntAdd, v.into(), len.into());
    let s = b.op2(Opcode::IntAdd, s.into(), unset.into());
    b.finish(vec![s.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| {
        matches!(
            o.opcode,
            Opcode::NewArray | Opcode::SetItem | Opcode::GetItem | Opcode::ArrayLen
        )
    }));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(5)],
        &mut heap,
        &mut NoCalls,
    )
    .unwrap();
    // 5 + len 2 + default 0
    assert_eq!(out.values, vec![RtValue::Int(7)]);
}

#[test]
fn test_class_guard_on_virtual_is_free() {
    let class = ClassDescr::new(ClassId(4), vec![SlotKind::Int]);
    let fd = class.field(0).unwrap();

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let p = b.new_object(class.clone());
    b.set_field(p.into(), i0.into(), fd);
    b.guard_class(p.into(), class);
    let v = b.get_field(p.into(), fd);
    b.finish(vec![v.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode.is_guard()));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(9)],
        &mut heap,
        &mut NoCalls,
    )
    .unwrap();
    assert_eq!(out.values, vec![RtValue::Int(9)]);
}

#[test]
fn test_point_guard_folds_then_call_forces() {
    // new Point(x = i0); b = p.x; guard b == i0 folds away because the
    // load forwards to i0; the later call still sees a real object
    let class = ClassDescr::new(ClassId(3), vec![SlotKind::Int, SlotKind::Int]);
    let fx = class.field(0).unwrap();
    let fy = class.field(1).unwrap();
    let cd = CallDescr {
        target: 6,
        effect: EffectInfo::Default,
    };

    struct SumsFields;
    impl CallHandler for SumsFields {
        fn call(
            &mut self,
            _descr: &CallDescr,
            args: &[RtValue],
            heap: &mut Heap,
        ) -> Result<RtValue, EvalError> {
            let RtValue::Obj(obj) = args[0] else {
                return Err(EvalError::TypeError(0));
            };
            let (RtValue::Int(x), RtValue::Int(y)) =
                (heap.get_field(obj, 0)?, heap.get_field(obj, 1)?)
            else {
                return Err(EvalError::TypeError(0));
            };
            Ok(RtValue::Int(x + y))
        }
    }

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let p = b.new_object(class);
    b.set_field(p.into(), i0.into(), fx);
    b.set_field(p.into(), int(2), fy);
    let x = b.get_field(p.into(), fx);
    let eq = b.op2(Opcode::IntEq, x.into(), i0.into());
    b.guard(Opcode::GuardTrue, vec![eq.into()]);
    let r = b.call(cd, vec![p.into()]);
    b.finish(vec![r.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode.is_guard()));
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode == Opcode::GetField));
    assert!(optimized.trace.ops.iter().any(|o| o.opcode == Opcode::NewObject));

    let mut heap = Heap::new();
    let out = evaluate(
        &optimized.trace,
        &[RtValue::Int(40)],
        &mut heap,
        &mut SumsFields,
    )
    .unwrap();
    assert_eq!(out.values, vec![RtValue::Int(42)]);
}

#[test]
fn test_deopt_rebuilds_linked_virtual_objects() {
    // two objects pointing at each other, both elided; a failing guard
    // must be able to rebuild the pair with the cycle intact
    let class = ClassDescr::new(ClassId(5), vec![SlotKind::Ref, SlotKind::Int]);
    let link = class.field(0).unwrap();
    let val = class.field(1).unwrap();

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    b.enter_frame(FrameDescr {
        frame_id: 0,
        num_slots: 1,
    });
    let a = b.new_object(class.clone());
    let c = b.new_object(class);
    b.set_field(a.into(), c.into(), link);
    b.set_field(c.into(), a.into(), link);
    b.set_field(a.into(), i0.into(), val);
    b.set_field(c.into(), int(99), val);
    b.record_slot(0, a.into());
    let cond = b.op2(Opcode::IntLt, i0.into(), int(10));
    b.guard(Opcode::GuardTrue, vec![cond.into()]);
    b.leave_frame();
    b.finish(vec![i0.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(!optimized.trace.ops.iter().any(|o| o.opcode == Opcode::NewObject));

    // the guard actually fails for i0 = 15
    let mut heap = Heap::new();
    let err = evaluate(
        &optimized.trace,
        &[RtValue::Int(15)],
        &mut heap,
        &mut NoCalls,
    )
    .unwrap_err();
    let EvalError::GuardFailed { position } = err else {
        panic!("expected a guard failure, got {err:?}");
    };

    // rebuild the interpreter state the failing guard describes
    let snap = optimized.trace.ops[position].resume.unwrap();
    let resume = &optimized.resumes[snap.0 as usize];
    let mut resolver = |b| {
        assert_eq!(b, i0);
        RtValue::Int(15)
    };
    let frames = resume.frame_values(&mut heap, &mut resolver).unwrap();
    assert_eq!(frames.len(), 1);

    let RtValue::Obj(obj_a) = frames[0].1[0] else {
        panic!("slot 0 should hold the rebuilt object");
    };
    let RtValue::Obj(obj_c) = heap.get_field(obj_a, 0).unwrap() else {
        panic!("link field should hold the partner object");
    };
    assert_eq!(heap.get_field(obj_a, 1).unwrap(), RtValue::Int(15));
    assert_eq!(heap.get_field(obj_c, 1).unwrap(), RtValue::Int(99));
    assert_eq!(heap.get_field(obj_c, 0).unwrap(), RtValue::Obj(obj_a));
}

#[test]
fn test_bad_field_index_load_keeps_the_trap() {
    let class = ClassDescr::new(ClassId(7), vec![SlotKind::Int]);
    let f0 = class.field(0).unwrap();
    let bad = FieldDescr {
        class: ClassId(7),
        index: 5,
        kind: SlotKind::Int,
    };

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let p = b.new_object(class);
    b.set_field(p.into(), i0.into(), f0);
    let v = b.get_field(p.into(), bad);
    b.finish(vec![v.into()]);
    let trace = b.build();

    // the load must not fold to a slot default; the allocation escapes
    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(optimized.trace.ops.iter().any(|o| o.opcode == Opcode::GetField));

    let mut heap_a = Heap::new();
    let before = evaluate(&trace, &[RtValue::Int(1)], &mut heap_a, &mut NoCalls).unwrap_err();
    let mut heap_b = Heap::new();
    let after = evaluate(
        &optimized.trace,
        &[RtValue::Int(1)],
        &mut heap_b,
        &mut NoCalls,
    )
    .unwrap_err();
    assert!(matches!(before, EvalError::BadField(..)));
    assert!(matches!(after, EvalError::BadField(..)));
}

#[test]
fn test_bad_field_index_store_is_not_absorbed() {
    let class = ClassDescr::new(ClassId(8), vec![SlotKind::Int]);
    let bad = FieldDescr {
        class: ClassId(8),
        index: 3,
        kind: SlotKind::Int,
    };

    let mut b = TraceBuilder::new();
    let i0 = b.input();
    let p = b.new_object(class);
    b.set_field(p.into(), i0.into(), bad);
    b.finish(vec![i0.into()]);
    let trace = b.build();

    let optimized = Optimizer::optimize(&trace).unwrap();
    assert!(optimized.trace.ops.iter().any(|o| o.opcode == Opcode::SetField));

    let mut heap = Heap::new();
    let err = evaluate(&optimized.trace, &[RtValue::Int(1)], &mut heap, &mut NoCalls).unwrap_err();
    assert!(matches!(err, EvalError::BadField(..)));
}
