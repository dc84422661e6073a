//! Reference evaluator.
//!
//! Runs traces directly over a model heap. This is not the production
//! execution path (that is native code generated elsewhere); it exists so
//! optimized and unoptimized traces can be executed against each other in
//! differential tests, and so the deoptimizer has a heap surface to
//! materialize virtual objects into.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::descr::{ArrayDescr, CallDescr, ClassDescr, ClassId};
use crate::operation::{Opcode, Operand, Operation};
use crate::trace::Trace;
use crate::value::{BoxId, Const, SlotKind};

/// Handle to an object in the model heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub u32);

/// A concrete runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtValue {
    /// Machine integer
    Int(i64),
    /// Double-precision float
    Float(f64),
    /// Null reference
    Null,
    /// Heap reference
    Obj(ObjId),
}

impl From<Const> for RtValue {
    fn from(c: Const) -> RtValue {
        match c {
            Const::Int(v) => RtValue::Int(v),
            Const::Float(v) => RtValue::Float(v),
            Const::Null => RtValue::Null,
        }
    }
}

impl RtValue {
    fn from_const(c: Const) -> RtValue {
        c.into()
    }

    fn as_const(self) -> Option<Const> {
        match self {
            RtValue::Int(v) => Some(Const::Int(v)),
            RtValue::Float(v) => Some(Const::Float(v)),
            RtValue::Null => Some(Const::Null),
            RtValue::Obj(_) => None,
        }
    }
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtValue::Int(v) => write!(f, "{}", v),
            RtValue::Float(v) => write!(f, "{}f", v),
            RtValue::Null => write!(f, "null"),
            RtValue::Obj(o) => write!(f, "obj{}", o.0),
        }
    }
}

#[derive(Debug, Clone)]
enum HeapCell {
    Object { class: ClassId, fields: Vec<RtValue> },
    Array { items: Vec<RtValue> },
}

/// Model heap: a flat store of objects and arrays created from
/// descriptors.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    cells: Vec<HeapCell>,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object of `class` with defaulted fields.
    pub fn alloc_object(&mut self, class: &ClassDescr) -> ObjId {
        let fields = class
            .fields
            .iter()
            .map(|kind| RtValue::from_const(kind.default_const()))
            .collect();
        self.push(HeapCell::Object {
            class: class.id,
            fields,
        })
    }

    /// Allocate an array of `len` defaulted elements.
    pub fn alloc_array(&mut self, descr: &ArrayDescr, len: usize) -> ObjId {
        let items = vec![RtValue::from_const(descr.elem.default_const()); len];
        self.push(HeapCell::Array { items })
    }

    fn push(&mut self, cell: HeapCell) -> ObjId {
        let id = ObjId(self.cells.len() as u32);
        self.cells.push(cell);
        id
    }

    /// Class of an object.
    pub fn class_of(&self, obj: ObjId) -> Result<ClassId, EvalError> {
        match self.cell(obj)? {
            HeapCell::Object { class, .. } => Ok(*class),
            HeapCell::Array { .. } => Err(EvalError::NotAnObject(obj)),
        }
    }

    /// Read a field.
    pub fn get_field(&self, obj: ObjId, index: u32) -> Result<RtValue, EvalError> {
        match self.cell(obj)? {
            HeapCell::Object { fields, .. } => fields
                .get(index as usize)
                .copied()
                .ok_or(EvalError::BadField(obj, index)),
            HeapCell::Array { .. } => Err(EvalError::NotAnObject(obj)),
        }
    }

    /// Write a field.
    pub fn set_field(&mut self, obj: ObjId, index: u32, value: RtValue) -> Result<(), EvalError> {
        match self.cell_mut(obj)? {
            HeapCell::Object { fields, .. } => {
                let slot = fields
                    .get_mut(index as usize)
                    .ok_or(EvalError::BadField(obj, index))?;
                *slot = value;
                Ok(())
            }
            HeapCell::Array { .. } => Err(EvalError::NotAnObject(obj)),
        }
    }

    /// Read an array element.
    pub fn get_item(&self, obj: ObjId, index: i64) -> Result<RtValue, EvalError> {
        match self.cell(obj)? {
            HeapCell::Array { items } => items
                .get(usize::try_from(index).map_err(|_| EvalError::BadIndex(obj, index))?)
                .copied()
                .ok_or(EvalError::BadIndex(obj, index)),
            HeapCell::Object { .. } => Err(EvalError::NotAnArray(obj)),
        }
    }

    /// Write an array element.
    pub fn set_item(&mut self, obj: ObjId, index: i64, value: RtValue) -> Result<(), EvalError> {
        match self.cell_mut(obj)? {
            HeapCell::Array { items } => {
                let idx =
                    usize::try_from(index).map_err(|_| EvalError::BadIndex(obj, index))?;
                let slot = items.get_mut(idx).ok_or(EvalError::BadIndex(obj, index))?;
                *slot = value;
                Ok(())
            }
            HeapCell::Object { .. } => Err(EvalError::NotAnArray(obj)),
        }
    }

    /// Length of an array.
    pub fn array_len(&self, obj: ObjId) -> Result<i64, EvalError> {
        match self.cell(obj)? {
            HeapCell::Array { items } => Ok(items.len() as i64),
            HeapCell::Object { .. } => Err(EvalError::NotAnArray(obj)),
        }
    }

    fn cell(&self, obj: ObjId) -> Result<&HeapCell, EvalError> {
        self.cells.get(obj.0 as usize).ok_or(EvalError::DanglingRef(obj))
    }

    fn cell_mut(&mut self, obj: ObjId) -> Result<&mut HeapCell, EvalError> {
        self.cells
            .get_mut(obj.0 as usize)
            .ok_or(EvalError::DanglingRef(obj))
    }
}

/// Callback surface for `call` operations.
pub trait CallHandler {
    /// Execute a call with the given concrete arguments.
    fn call(
        &mut self,
        descr: &CallDescr,
        args: &[RtValue],
        heap: &mut Heap,
    ) -> Result<RtValue, EvalError>;
}

/// Handler that rejects every call; the default for traces without calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCalls;

impl CallHandler for NoCalls {
    fn call(
        &mut self,
        descr: &CallDescr,
        _args: &[RtValue],
        _heap: &mut Heap,
    ) -> Result<RtValue, EvalError> {
        Err(EvalError::UnexpectedCall(descr.target))
    }
}

/// Evaluation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// A guard condition did not hold
    #[error("guard at position {position} failed")]
    GuardFailed {
        /// Index of the failing operation in the trace
        position: usize,
    },
    /// A box was read before any operation defined it
    #[error("undefined box {0}")]
    UndefinedBox(BoxId),
    /// Operand had the wrong kind for the operation
    #[error("type error at position {0}")]
    TypeError(usize),
    /// Reference beyond the heap
    #[error("dangling reference obj{}", .0 .0)]
    DanglingRef(ObjId),
    /// Field access on a non-object
    #[error("obj{} is not an object", .0 .0)]
    NotAnObject(ObjId),
    /// Element access on a non-array
    #[error("obj{} is not an array", .0 .0)]
    NotAnArray(ObjId),
    /// Field index out of range
    #[error("obj{} has no field {1}", .0 .0)]
    BadField(ObjId, u32),
    /// Array index out of range
    #[error("index {1} out of range for obj{}", .0 .0)]
    BadIndex(ObjId, i64),
    /// A `call` was executed under the `NoCalls` handler
    #[error("unexpected call to target {0}")]
    UnexpectedCall(u32),
    /// Malformed operation encountered mid-trace
    #[error("malformed operation at position {0}")]
    Malformed(usize),
}

/// How a trace run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// `finish` was reached; values are the finish arguments
    Finish,
    /// The back edge was reached; values are the jump arguments
    Jump,
}

/// Result of one pass over a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    /// How the trace exited
    pub exit: ExitKind,
    /// The terminal operation's evaluated arguments
    pub values: Vec<RtValue>,
    /// Number of guards that were evaluated (and passed)
    pub guards_passed: usize,
}

/// Evaluate one pass over `trace`, binding `inputs` to the label boxes.
pub fn evaluate(
    trace: &Trace,
    inputs: &[RtValue],
    heap: &mut Heap,
    calls: &mut dyn CallHandler,
) -> Result<EvalOutcome, EvalError> {
    if inputs.len() != trace.inputs.len() {
        return Err(EvalError::Malformed(0));
    }
    let mut env: HashMap<BoxId, RtValue> = HashMap::new();
    for (&b, &v) in trace.inputs.iter().zip(inputs) {
        env.insert(b, v);
    }

    let mut guards_passed = 0usize;
    let mut overflowed = false;

    fn read(
        env: &HashMap<BoxId, RtValue>,
        op: &Operation,
        i: usize,
        pos: usize,
    ) -> Result<RtValue, EvalError> {
        match op.args.get(i).copied().ok_or(EvalError::Malformed(pos))? {
            Operand::Const(c) => Ok(RtValue::from_const(c)),
            Operand::Box(b) => env.get(&b).copied().ok_or(EvalError::UndefinedBox(b)),
        }
    }

    fn read_all(
        env: &HashMap<BoxId, RtValue>,
        op: &Operation,
        pos: usize,
    ) -> Result<Vec<RtValue>, EvalError> {
        (0..op.args.len()).map(|i| read(env, op, i, pos)).collect()
    }

    fn define(env: &mut HashMap<BoxId, RtValue>, op: &Operation, v: RtValue) {
        if let Some(res) = op.result {
            env.insert(res, v);
        }
    }

    for (pos, op) in trace.ops.iter().enumerate() {
        let arg = |i: usize| read(&env, op, i, pos);
        let all_args = || read_all(&env, op, pos);

        match op.opcode {
            Opcode::Jump | Opcode::Finish => {
                return Ok(EvalOutcome {
                    exit: if op.opcode == Opcode::Jump {
                        ExitKind::Jump
                    } else {
                        ExitKind::Finish
                    },
                    values: all_args()?,
                    guards_passed,
                });
            }
            Opcode::EnterFrame | Opcode::LeaveFrame | Opcode::RecordSlot { .. } => {}
            Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf => {
                let (a, b) = match (arg(0)?, arg(1)?) {
                    (RtValue::Int(a), RtValue::Int(b)) => (a, b),
                    _ => return Err(EvalError::TypeError(pos)),
                };
                let checked = match op.opcode {
                    Opcode::IntAddOvf => a.checked_add(b),
                    Opcode::IntSubOvf => a.checked_sub(b),
                    _ => a.checked_mul(b),
                };
                // the flag reflects the most recent checked op only
                match checked {
                    Some(v) => {
                        overflowed = false;
                        define(&mut env, op, RtValue::Int(v));
                    }
                    None => {
                        // wrapped result, flagged for the following guard
                        overflowed = true;
                        let wrapped = match op.opcode {
                            Opcode::IntAddOvf => a.wrapping_add(b),
                            Opcode::IntSubOvf => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        define(&mut env, op, RtValue::Int(wrapped));
                    }
                }
            }
            Opcode::GuardNoOverflow => {
                if overflowed {
                    return Err(EvalError::GuardFailed { position: pos });
                }
                guards_passed += 1;
            }
            Opcode::GuardTrue | Opcode::GuardFalse => {
                let truth = match arg(0)? {
                    RtValue::Int(v) => v != 0,
                    _ => return Err(EvalError::TypeError(pos)),
                };
                if truth != (op.opcode == Opcode::GuardTrue) {
                    return Err(EvalError::GuardFailed { position: pos });
                }
                guards_passed += 1;
            }
            Opcode::GuardValue => {
                if arg(0)? != arg(1)? {
                    return Err(EvalError::GuardFailed { position: pos });
                }
                guards_passed += 1;
            }
            Opcode::GuardClass => {
                let class = op.class_descr().ok_or(EvalError::Malformed(pos))?;
                match arg(0)? {
                    RtValue::Obj(obj) if heap.class_of(obj)? == class.id => {}
                    _ => return Err(EvalError::GuardFailed { position: pos }),
                }
                guards_passed += 1;
            }
            Opcode::GuardNonnull => {
                if matches!(arg(0)?, RtValue::Null) {
                    return Err(EvalError::GuardFailed { position: pos });
                }
                guards_passed += 1;
            }
            Opcode::GuardIsnull => {
                if !matches!(arg(0)?, RtValue::Null) {
                    return Err(EvalError::GuardFailed { position: pos });
                }
                guards_passed += 1;
            }
            Opcode::NewObject => {
                let class = op.class_descr().ok_or(EvalError::Malformed(pos))?;
                let obj = heap.alloc_object(class);
                define(&mut env, op, RtValue::Obj(obj));
            }
            Opcode::NewArray => {
                let descr = op.array_descr().ok_or(EvalError::Malformed(pos))?;
                let len = match arg(0)? {
                    RtValue::Int(v) if v >= 0 => v as usize,
                    _ => return Err(EvalError::TypeError(pos)),
                };
                let obj = heap.alloc_array(descr, len);
                define(&mut env, op, RtValue::Obj(obj));
            }
            Opcode::GetField => {
                let fd = op.field_descr().ok_or(EvalError::Malformed(pos))?;
                let obj = expect_obj(arg(0)?, pos)?;
                let v = heap.get_field(obj, fd.index)?;
                define(&mut env, op, v);
            }
            Opcode::SetField => {
                let fd = op.field_descr().ok_or(EvalError::Malformed(pos))?;
                let obj = expect_obj(arg(0)?, pos)?;
                heap.set_field(obj, fd.index, arg(1)?)?;
            }
            Opcode::GetItem => {
                let obj = expect_obj(arg(0)?, pos)?;
                let index = expect_int(arg(1)?, pos)?;
                let v = heap.get_item(obj, index)?;
                define(&mut env, op, v);
            }
            Opcode::SetItem => {
                let obj = expect_obj(arg(0)?, pos)?;
                let index = expect_int(arg(1)?, pos)?;
                heap.set_item(obj, index, arg(2)?)?;
            }
            Opcode::ArrayLen => {
                let obj = expect_obj(arg(0)?, pos)?;
                define(&mut env, op, RtValue::Int(heap.array_len(obj)?));
            }
            Opcode::PtrEq | Opcode::PtrNe => {
                let same = match (arg(0)?, arg(1)?) {
                    (RtValue::Obj(a), RtValue::Obj(b)) => a == b,
                    (RtValue::Null, RtValue::Null) => true,
                    (RtValue::Null, RtValue::Obj(_)) | (RtValue::Obj(_), RtValue::Null) => false,
                    _ => return Err(EvalError::TypeError(pos)),
                };
                let v = same == (op.opcode == Opcode::PtrEq);
                define(&mut env, op, RtValue::Int(v as i64));
            }
            Opcode::Call => {
                let descr = *op.call_descr().ok_or(EvalError::Malformed(pos))?;
                let argv = all_args()?;
                let v = calls.call(&descr, &argv, heap)?;
                define(&mut env, op, v);
            }
            Opcode::SameAs => {
                let v = arg(0)?;
                define(&mut env, op, v);
            }
            _ => {
                // pure arithmetic and comparisons share the constant folder
                let consts: Option<Vec<Const>> =
                    all_args()?.into_iter().map(RtValue::as_const).collect();
                let consts = consts.ok_or(EvalError::TypeError(pos))?;
                let folded = op
                    .opcode
                    .fold(&consts)
                    .ok_or(EvalError::TypeError(pos))?;
                define(&mut env, op, RtValue::from_const(folded));
            }
        }
    }
    Err(EvalError::Malformed(trace.ops.len()))
}

fn expect_obj(v: RtValue, pos: usize) -> Result<ObjId, EvalError> {
    match v {
        RtValue::Obj(o) => Ok(o),
        _ => Err(EvalError::TypeError(pos)),
    }
}

fn expect_int(v: RtValue, pos: usize) -> Result<i64, EvalError> {
    match v {
        RtValue::Int(i) => Ok(i),
        _ => Err(EvalError::TypeError(pos)),
    }
}
