//! Type and layout descriptors.
//!
//! Descriptors are the only view the optimizer has of the host runtime's
//! object model: it never sees object layout directly, only the class,
//! field, array and call descriptors the recorder attached to operations.

use crate::value::SlotKind;

/// Identifier of an object class, as assigned by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Shape of an object class: its identity plus the kinds of its fields,
/// in field-index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescr {
    /// Class identity
    pub id: ClassId,
    /// Field kinds indexed by field number
    pub fields: Vec<SlotKind>,
}

impl ClassDescr {
    /// Create a class descriptor.
    pub fn new(id: ClassId, fields: Vec<SlotKind>) -> Self {
        Self { id, fields }
    }

    /// Number of fields instances of this class carry.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Descriptor of field `index`, if it exists.
    pub fn field(&self, index: u32) -> Option<FieldDescr> {
        self.fields.get(index as usize).map(|kind| FieldDescr {
            class: self.id,
            index,
            kind: *kind,
        })
    }
}

/// A single field of a class: which class, which slot, what kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescr {
    /// Owning class
    pub class: ClassId,
    /// Field number within the class
    pub index: u32,
    /// Kind of value stored in the field
    pub kind: SlotKind,
}

/// Element layout of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayDescr {
    /// Kind of the array's elements
    pub elem: SlotKind,
}

/// Heap effect annotation of a call, provided by the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectInfo {
    /// May read and write arbitrary heap locations
    Default,
    /// Never writes the heap (may still read it)
    HeapInert,
    /// No observable effect at all; result depends only on the arguments
    Pure,
}

/// Descriptor of a call target and its effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDescr {
    /// Opaque callee token, meaningful to the host runtime
    pub target: u32,
    /// What the call may do to the heap
    pub effect: EffectInfo,
}

impl CallDescr {
    /// True if the call provably leaves every heap fact intact.
    pub fn leaves_heap_alone(&self) -> bool {
        matches!(self.effect, EffectInfo::HeapInert | EffectInfo::Pure)
    }

    /// True if passing a not-yet-allocated object into this call is safe.
    ///
    /// Only fully effect-free calls qualify; anything that might read the
    /// object through a real pointer needs the object materialized first.
    pub fn tolerates_virtual_args(&self) -> bool {
        matches!(self.effect, EffectInfo::Pure)
    }
}

/// Descriptor of one interpreter frame crossed by inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescr {
    /// Frame identifier, meaningful to the interpreter
    pub frame_id: u32,
    /// Number of live slots the frame carries
    pub num_slots: u32,
}
