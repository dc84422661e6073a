//! Operations: opcodes, operands and the substitution primitive.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::descr::{ArrayDescr, CallDescr, ClassDescr, FieldDescr, FrameDescr};
use crate::value::{BoxFactory, BoxId, Const};

/// Errors raised by structural IR operations.
///
/// These are programming-error class failures: a malformed trace or an
/// incomplete substitution means the caller built something inconsistent,
/// and the only sane reaction is to abandon the current compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// A substitution map did not cover every box operand of an operation.
    #[error("substitution does not cover {missing} used by {opcode:?}")]
    IncompleteSubstitution {
        /// Opcode of the operation being cloned
        opcode: Opcode,
        /// First operand box the map failed to remap
        missing: BoxId,
    },
    /// A trace failed structural validation.
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
}

/// An operand: either a box or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Reference to the value of another operation or a trace input
    Box(BoxId),
    /// Inline literal
    Const(Const),
}

impl Operand {
    /// The box id, if this operand is a box.
    pub fn as_box(self) -> Option<BoxId> {
        match self {
            Operand::Box(b) => Some(b),
            Operand::Const(_) => None,
        }
    }

    /// The constant, if this operand is one.
    pub fn as_const(self) -> Option<Const> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Box(_) => None,
        }
    }
}

impl From<BoxId> for Operand {
    fn from(b: BoxId) -> Self {
        Operand::Box(b)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Box(b) => write!(f, "{}", b),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// Descriptor attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Descr {
    /// Field access descriptor (`get_field`/`set_field`)
    Field(FieldDescr),
    /// Array access descriptor (`new_array`/`get_item`/`set_item`/`array_len`)
    Array(ArrayDescr),
    /// Class descriptor (`new_object`, `guard_class`)
    Class(ClassDescr),
    /// Call descriptor (`call`)
    Call(CallDescr),
    /// Frame descriptor (`enter_frame`)
    Frame(FrameDescr),
}

/// Opaque handle to the frozen deoptimization snapshot of a guard.
///
/// Assigned by the optimizer's snapshot builder; indexes into the resume
/// table returned alongside the optimized trace. `None` on recorded input
/// traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotRef(pub u32);

/// The closed set of trace opcodes.
///
/// Kept as a plain tagged union: optimizer stages dispatch over it with
/// explicit `match` arms, so adding an opcode is a compile-checked change
/// in every stage rather than a silently-missed method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // integer arithmetic (wrapping)
    /// Wrapping integer addition
    IntAdd,
    /// Wrapping integer subtraction
    IntSub,
    /// Wrapping integer multiplication
    IntMul,
    /// Integer negation
    IntNeg,
    /// Bitwise and
    IntAnd,
    /// Bitwise or
    IntOr,
    /// Bitwise xor
    IntXor,
    // overflow-checked arithmetic, always followed by guard_no_overflow
    /// Integer addition that records overflow for the following guard
    IntAddOvf,
    /// Integer subtraction that records overflow for the following guard
    IntSubOvf,
    /// Integer multiplication that records overflow for the following guard
    IntMulOvf,
    // integer comparisons, result is 0 or 1
    /// Signed less-than
    IntLt,
    /// Signed less-or-equal
    IntLe,
    /// Integer equality
    IntEq,
    /// Integer inequality
    IntNe,
    /// Signed greater-than
    IntGt,
    /// Signed greater-or-equal
    IntGe,
    /// Truth test: 1 if the operand is nonzero
    IntIsTrue,
    /// Zero test: 1 if the operand is zero
    IntIsZero,
    // float arithmetic
    /// Float addition
    FloatAdd,
    /// Float subtraction
    FloatSub,
    /// Float multiplication
    FloatMul,
    /// Float negation
    FloatNeg,
    // pointer comparisons
    /// Reference identity
    PtrEq,
    /// Reference non-identity
    PtrNe,
    // guards
    /// Deoptimize if the operand is zero
    GuardTrue,
    /// Deoptimize if the operand is nonzero
    GuardFalse,
    /// Deoptimize if the operand differs from the attached constant
    GuardValue,
    /// Deoptimize if the operand's class differs from the class descriptor
    GuardClass,
    /// Deoptimize if the operand is null
    GuardNonnull,
    /// Deoptimize if the operand is not null
    GuardIsnull,
    /// Deoptimize if the preceding checked operation overflowed
    GuardNoOverflow,
    // heap
    /// Allocate an object of the attached class descriptor
    NewObject,
    /// Allocate an array; argument is the length
    NewArray,
    /// Load a field
    GetField,
    /// Store a field
    SetField,
    /// Array length
    ArrayLen,
    /// Load an array element; arguments are base and index
    GetItem,
    /// Store an array element; arguments are base, index and value
    SetItem,
    // calls
    /// Call into the host runtime, effects per the call descriptor
    Call,
    /// Identity copy; always optimized away
    SameAs,
    // resume markers, consumed by the snapshot builder
    /// The recorder inlined into a new interpreter frame
    EnterFrame,
    /// The recorder left the innermost inlined frame
    LeaveFrame,
    /// The logical value of slot `slot` of the innermost frame changed
    RecordSlot {
        /// Frame slot index
        slot: u32,
    },
    // trace delimiters
    /// Back edge: transfer to the loop header with the given arguments
    Jump,
    /// Leave the trace with the given values
    Finish,
}

impl Opcode {
    /// Side-effect-free and result depends only on the operands: eligible
    /// for common-subexpression elimination and constant folding.
    ///
    /// Overflow-checked arithmetic is excluded; it is paired with its
    /// `guard_no_overflow` and handled separately. `array_len` is pure
    /// because array lengths never change after allocation.
    pub fn is_pure(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IntAdd
                | IntSub
                | IntMul
                | IntNeg
                | IntAnd
                | IntOr
                | IntXor
                | IntLt
                | IntLe
                | IntEq
                | IntNe
                | IntGt
                | IntGe
                | IntIsTrue
                | IntIsZero
                | FloatAdd
                | FloatSub
                | FloatMul
                | FloatNeg
                | PtrEq
                | PtrNe
                | ArrayLen
                | SameAs
        )
    }

    /// True for guard opcodes, whose runtime failure deoptimizes.
    pub fn is_guard(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            GuardTrue
                | GuardFalse
                | GuardValue
                | GuardClass
                | GuardNonnull
                | GuardIsnull
                | GuardNoOverflow
        )
    }

    /// True for operations that write state visible outside the trace.
    pub fn has_side_effects(self) -> bool {
        use Opcode::*;
        matches!(self, SetField | SetItem | Call)
    }

    /// True for the overflow-checked arithmetic trio.
    pub fn is_overflow_checked(self) -> bool {
        use Opcode::*;
        matches!(self, IntAddOvf | IntSubOvf | IntMulOvf)
    }

    /// True for the frame markers consumed by the snapshot builder.
    pub fn is_resume_marker(self) -> bool {
        use Opcode::*;
        matches!(self, EnterFrame | LeaveFrame | RecordSlot { .. })
    }

    /// True for the two terminal opcodes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Finish)
    }

    /// Evaluate this opcode over constant arguments.
    ///
    /// This is the single source of arithmetic truth shared by the
    /// constant folder and the reference evaluator. Returns `None` for
    /// opcodes that are not foldable, for kind mismatches, and for
    /// overflow-checked opcodes whose result would overflow.
    pub fn fold(self, args: &[Const]) -> Option<Const> {
        use Opcode::*;
        let int = |i: usize| args.get(i).copied().and_then(Const::as_int);
        let float = |i: usize| match args.get(i).copied() {
            Some(Const::Float(v)) => Some(v),
            _ => None,
        };
        let bool_int = |b: bool| Const::Int(b as i64);
        Some(match self {
            IntAdd => Const::Int(int(0)?.wrapping_add(int(1)?)),
            IntSub => Const::Int(int(0)?.wrapping_sub(int(1)?)),
            IntMul => Const::Int(int(0)?.wrapping_mul(int(1)?)),
            IntNeg => Const::Int(int(0)?.wrapping_neg()),
            IntAnd => Const::Int(int(0)? & int(1)?),
            IntOr => Const::Int(int(0)? | int(1)?),
            IntXor => Const::Int(int(0)? ^ int(1)?),
            IntAddOvf => Const::Int(int(0)?.checked_add(int(1)?)?),
            IntSubOvf => Const::Int(int(0)?.checked_sub(int(1)?)?),
            IntMulOvf => Const::Int(int(0)?.checked_mul(int(1)?)?),
            IntLt => bool_int(int(0)? < int(1)?),
            IntLe => bool_int(int(0)? <= int(1)?),
            IntEq => bool_int(int(0)? == int(1)?),
            IntNe => bool_int(int(0)? != int(1)?),
            IntGt => bool_int(int(0)? > int(1)?),
            IntGe => bool_int(int(0)? >= int(1)?),
            IntIsTrue => bool_int(int(0)? != 0),
            IntIsZero => bool_int(int(0)? == 0),
            FloatAdd => Const::Float(float(0)? + float(1)?),
            FloatSub => Const::Float(float(0)? - float(1)?),
            FloatMul => Const::Float(float(0)? * float(1)?),
            FloatNeg => Const::Float(-float(0)?),
            PtrEq => match (args.first()?, args.get(1)?) {
                (Const::Null, Const::Null) => bool_int(true),
                _ => return None,
            },
            PtrNe => match (args.first()?, args.get(1)?) {
                (Const::Null, Const::Null) => bool_int(false),
                _ => return None,
            },
            SameAs => *args.first()?,
            _ => return None,
        })
    }
}

/// One trace operation: opcode, operands, optional result, optional
/// descriptor, and (for guards, after optimization) the snapshot handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// What the operation does
    pub opcode: Opcode,
    /// Ordered operands
    pub args: Vec<Operand>,
    /// The box this operation defines, if it produces a value
    pub result: Option<BoxId>,
    /// Attached layout/call/frame descriptor, if the opcode needs one
    pub descr: Option<Descr>,
    /// Frozen deoptimization snapshot, filled in by the optimizer on guards
    pub resume: Option<SnapshotRef>,
}

impl Operation {
    /// Create an operation without a descriptor.
    pub fn new(opcode: Opcode, args: Vec<Operand>, result: Option<BoxId>) -> Self {
        Self {
            opcode,
            args,
            result,
            descr: None,
            resume: None,
        }
    }

    /// Attach a descriptor.
    pub fn with_descr(mut self, descr: Descr) -> Self {
        self.descr = Some(descr);
        self
    }

    /// The field descriptor, if the attached descriptor is one.
    pub fn field_descr(&self) -> Option<&FieldDescr> {
        match self.descr {
            Some(Descr::Field(ref fd)) => Some(fd),
            _ => None,
        }
    }

    /// The array descriptor, if the attached descriptor is one.
    pub fn array_descr(&self) -> Option<&ArrayDescr> {
        match self.descr {
            Some(Descr::Array(ref ad)) => Some(ad),
            _ => None,
        }
    }

    /// The class descriptor, if the attached descriptor is one.
    pub fn class_descr(&self) -> Option<&ClassDescr> {
        match self.descr {
            Some(Descr::Class(ref cd)) => Some(cd),
            _ => None,
        }
    }

    /// The call descriptor, if the attached descriptor is one.
    pub fn call_descr(&self) -> Option<&CallDescr> {
        match self.descr {
            Some(Descr::Call(ref cd)) => Some(cd),
            _ => None,
        }
    }

    /// The frame descriptor, if the attached descriptor is one.
    pub fn frame_descr(&self) -> Option<&FrameDescr> {
        match self.descr {
            Some(Descr::Frame(ref fd)) => Some(fd),
            _ => None,
        }
    }

    /// Clone this operation, remapping every box operand through `subst`
    /// and allocating a fresh result box from `factory`.
    ///
    /// This is the duplication primitive used by loop peeling: the second
    /// body copy is the first with all operands renamed. Every box operand
    /// must be covered by the map; a gap is an
    /// [`IrError::IncompleteSubstitution`], which is a caller bug, never a
    /// runtime condition.
    pub fn clone_with_substitution(
        &self,
        subst: &HashMap<BoxId, Operand>,
        factory: &mut BoxFactory,
    ) -> Result<Operation, IrError> {
        let mut args = Vec::with_capacity(self.args.len());
        for &arg in &self.args {
            match arg {
                Operand::Const(c) => args.push(Operand::Const(c)),
                Operand::Box(b) => match subst.get(&b) {
                    Some(&mapped) => args.push(mapped),
                    None => {
                        return Err(IrError::IncompleteSubstitution {
                            opcode: self.opcode,
                            missing: b,
                        })
                    }
                },
            }
        }
        Ok(Operation {
            opcode: self.opcode,
            args,
            result: self.result.map(|_| factory.fresh()),
            descr: self.descr.clone(),
            resume: None,
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(res) = self.result {
            write!(f, "{} = ", res)?;
        }
        write!(f, "{:?}(", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}
