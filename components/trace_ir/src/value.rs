//! Boxes, constants and slot kinds.
//!
//! A [`BoxId`] is an SSA-style handle to the value produced by exactly one
//! operation (or declared as a trace input). Boxes never own data: every
//! operation referencing one shares the same identity for the duration of
//! a single optimizer run.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity-based handle to a traced value.
///
/// Ids are handed out monotonically by a [`BoxFactory`], which makes them
/// usable as indices into dense per-box fact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxId(pub u32);

impl BoxId {
    /// Index form, for dense tables keyed by box id.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Allocates fresh box ids with monotonically increasing numbers.
#[derive(Debug, Clone, Default)]
pub struct BoxFactory {
    next: u32,
}

impl BoxFactory {
    /// Create a factory starting at id 0.
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Create a factory whose ids start after `first_free`.
    ///
    /// Used when extending an already-recorded trace: cloned operations must
    /// not collide with existing boxes.
    pub fn starting_at(first_free: u32) -> Self {
        Self { next: first_free }
    }

    /// Allocate the next box id.
    pub fn fresh(&mut self) -> BoxId {
        let id = BoxId(self.next);
        self.next += 1;
        id
    }

    /// Number of ids handed out so far (also the next id to be produced).
    pub fn len(&self) -> usize {
        self.next as usize
    }

    /// True if no id was handed out yet.
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}

/// The machine-level kind of a field, array element or frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Signed machine integer slot
    Int,
    /// Double-precision float slot
    Float,
    /// Heap reference slot
    Ref,
}

impl SlotKind {
    /// The value a freshly allocated slot of this kind holds.
    pub fn default_const(self) -> Const {
        match self {
            SlotKind::Int => Const::Int(0),
            SlotKind::Float => Const::Float(0.0),
            SlotKind::Ref => Const::Null,
        }
    }
}

/// An immutable literal, interchangeable with a box as an operand.
#[derive(Debug, Clone, Copy)]
pub enum Const {
    /// Signed machine integer
    Int(i64),
    /// Double-precision float
    Float(f64),
    /// The null reference sentinel
    Null,
}

impl Const {
    /// Integer payload, if this is an integer constant.
    pub fn as_int(self) -> Option<i64> {
        match self {
            Const::Int(v) => Some(v),
            _ => None,
        }
    }

    /// True for `Int(0)`, `Float(0.0)` and `Null`.
    pub fn is_zeroish(self) -> bool {
        match self {
            Const::Int(v) => v == 0,
            Const::Float(v) => v.to_bits() == 0.0f64.to_bits(),
            Const::Null => true,
        }
    }

    /// Truth value used by `guard_true`/`guard_false`: nonzero integers are
    /// true, everything else false.
    pub fn is_true(self) -> bool {
        matches!(self, Const::Int(v) if v != 0)
    }
}

// Floats compare and hash by bit pattern: two constants are the "same
// operation input" for CSE purposes iff they are bitwise identical.
impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Null, Const::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Const::Int(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            Const::Float(v) => {
                state.write_u8(1);
                v.to_bits().hash(state);
            }
            Const::Null => state.write_u8(2),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Float(v) => write!(f, "{}f", v),
            Const::Null => write!(f, "null"),
        }
    }
}
