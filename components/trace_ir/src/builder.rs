//! Trace construction, as used by the recorder and by tests.

use crate::descr::{ArrayDescr, CallDescr, ClassDescr, FieldDescr, FrameDescr};
use crate::operation::{Descr, Opcode, Operand, Operation};
use crate::trace::Trace;
use crate::value::{BoxFactory, BoxId};

/// Incremental builder for recorded traces.
///
/// The recorder appends one operation per interpreted primitive; result
/// boxes are allocated on the fly. The builder performs no checking;
/// [`Trace::validate`] runs over the finished product.
///
/// # Example
///
/// ```
/// use trace_ir::{TraceBuilder, Opcode, Const};
///
/// let mut b = TraceBuilder::new();
/// let i0 = b.input();
/// let i1 = b.op2(Opcode::IntAdd, i0.into(), Const::Int(1).into());
/// b.finish(vec![i1.into()]);
/// let trace = b.build();
/// assert!(trace.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TraceBuilder {
    factory: BoxFactory,
    inputs: Vec<BoxId>,
    ops: Vec<Operation>,
}

impl TraceBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a live trace input; returns its box.
    pub fn input(&mut self) -> BoxId {
        let b = self.factory.fresh();
        self.inputs.push(b);
        b
    }

    /// Append a result-less operation.
    pub fn emit(&mut self, opcode: Opcode, args: Vec<Operand>) {
        self.ops.push(Operation::new(opcode, args, None));
    }

    /// Append a unary operation, returning its result box.
    pub fn op1(&mut self, opcode: Opcode, a: Operand) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(Operation::new(opcode, vec![a], Some(res)));
        res
    }

    /// Append a binary operation, returning its result box.
    pub fn op2(&mut self, opcode: Opcode, a: Operand, b: Operand) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(Operation::new(opcode, vec![a, b], Some(res)));
        res
    }

    /// Append a guard.
    pub fn guard(&mut self, opcode: Opcode, args: Vec<Operand>) {
        self.ops.push(Operation::new(opcode, args, None));
    }

    /// Append a `guard_value` pinning `v` to constant `expected`.
    pub fn guard_value(&mut self, v: Operand, expected: Operand) {
        self.guard(Opcode::GuardValue, vec![v, expected]);
    }

    /// Append a `guard_class`.
    pub fn guard_class(&mut self, v: Operand, class: ClassDescr) {
        self.ops.push(
            Operation::new(Opcode::GuardClass, vec![v], None).with_descr(Descr::Class(class)),
        );
    }

    /// Allocate an object of `class`, returning its box.
    pub fn new_object(&mut self, class: ClassDescr) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(
            Operation::new(Opcode::NewObject, vec![], Some(res)).with_descr(Descr::Class(class)),
        );
        res
    }

    /// Allocate an array of `len` elements, returning its box.
    pub fn new_array(&mut self, descr: ArrayDescr, len: Operand) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(
            Operation::new(Opcode::NewArray, vec![len], Some(res)).with_descr(Descr::Array(descr)),
        );
        res
    }

    /// Load a field, returning the result box.
    pub fn get_field(&mut self, base: Operand, fd: FieldDescr) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(
            Operation::new(Opcode::GetField, vec![base], Some(res)).with_descr(Descr::Field(fd)),
        );
        res
    }

    /// Store a field.
    pub fn set_field(&mut self, base: Operand, value: Operand, fd: FieldDescr) {
        self.ops.push(
            Operation::new(Opcode::SetField, vec![base, value], None)
                .with_descr(Descr::Field(fd)),
        );
    }

    /// Load an array element, returning the result box.
    pub fn get_item(&mut self, base: Operand, index: Operand, ad: ArrayDescr) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(
            Operation::new(Opcode::GetItem, vec![base, index], Some(res))
                .with_descr(Descr::Array(ad)),
        );
        res
    }

    /// Store an array element.
    pub fn set_item(&mut self, base: Operand, index: Operand, value: Operand, ad: ArrayDescr) {
        self.ops.push(
            Operation::new(Opcode::SetItem, vec![base, index, value], None)
                .with_descr(Descr::Array(ad)),
        );
    }

    /// Array length, returning the result box.
    pub fn array_len(&mut self, base: Operand, ad: ArrayDescr) -> BoxId {
        let res = self.factory.fresh();
        self.ops.push(
            Operation::new(Opcode::ArrayLen, vec![base], Some(res)).with_descr(Descr::Array(ad)),
        );
        res
    }

    /// Call into the host runtime, returning the result box.
    pub fn call(&mut self, descr: CallDescr, args: Vec<Operand>) -> BoxId {
        let res = self.factory.fresh();
        self.ops
            .push(Operation::new(Opcode::Call, args, Some(res)).with_descr(Descr::Call(descr)));
        res
    }

    /// Record that the interpreter inlined into a new frame.
    pub fn enter_frame(&mut self, frame: FrameDescr) {
        self.ops.push(
            Operation::new(Opcode::EnterFrame, vec![], None).with_descr(Descr::Frame(frame)),
        );
    }

    /// Record that the interpreter left the innermost inlined frame.
    pub fn leave_frame(&mut self) {
        self.ops.push(Operation::new(Opcode::LeaveFrame, vec![], None));
    }

    /// Note that slot `slot` of the innermost frame now logically holds
    /// `value`.
    pub fn record_slot(&mut self, slot: u32, value: Operand) {
        self.ops
            .push(Operation::new(Opcode::RecordSlot { slot }, vec![value], None));
    }

    /// Terminate with a back edge.
    pub fn jump(&mut self, args: Vec<Operand>) {
        self.ops.push(Operation::new(Opcode::Jump, args, None));
    }

    /// Terminate by leaving the trace.
    pub fn finish(&mut self, args: Vec<Operand>) {
        self.ops.push(Operation::new(Opcode::Finish, args, None));
    }

    /// Finish building.
    pub fn build(self) -> Trace {
        Trace::new(self.inputs, self.ops)
    }
}
