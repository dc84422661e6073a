//! Deoptimization snapshots.
//!
//! While the optimizer walks a trace it maintains a shadow stack of the
//! interpreter frames the recorder was inlining, fed by the `enter_frame`,
//! `leave_frame` and `record_slot` markers. Every guard that survives
//! optimization freezes that stack into an immutable [`Snapshot`] chain.
//! Frames that did not change between two guards share one `Rc`'d snapshot,
//! so a long chain of guards costs one small snapshot per *changed* frame,
//! not a full copy of the stack.
//!
//! Virtual objects that are still unallocated at a guard are described by
//! [`VirtualRecipe`]s: instructions for rebuilding the object graph on
//! demand if that guard ever fails.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::trace;
use trace_ir::eval::{EvalError, Heap, ObjId, RtValue};
use trace_ir::{ArrayDescr, BoxId, ClassDescr, Const, FrameDescr, IrError, Operand, Operation, SnapshotRef};

use crate::error::CompileError;
use crate::facts::FactTable;
use crate::virtualize::{VirtualArena, VirtualContent};

/// One recorded value of an interpreter frame slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotValue {
    /// Live trace box; the deoptimizer reads it from the guard's register
    /// map, or rebuilds it from a recipe if the box was virtual.
    Box(BoxId),
    /// Compile-time constant.
    Const(Const),
}

/// Frozen state of one interpreter frame at a guard.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    /// Which frame this is.
    pub frame: FrameDescr,
    /// One value per frame slot.
    pub slots: Vec<SlotValue>,
    /// Snapshot of the next-outer frame, shared between guards.
    pub parent: Option<Rc<Snapshot>>,
}

/// How to rebuild one elided allocation during deoptimization.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualRecipe {
    /// What to allocate.
    pub shape: RecipeShape,
    /// One entry per field or element, in layout order.
    pub slots: Vec<RecipeSlot>,
}

/// Allocation kind of a recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum RecipeShape {
    /// A fixed-layout object of the given class.
    Object(ClassDescr),
    /// An array with a length that was constant at optimization time.
    Array {
        /// Element descriptor.
        elem: ArrayDescr,
        /// Compile-time length.
        len: i64,
    },
}

/// One slot of a recipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecipeSlot {
    /// Live box read from the failing guard's environment.
    Box(BoxId),
    /// Constant.
    Const(Const),
    /// Back-reference to another recipe of the same guard. Recipes may
    /// reference each other cyclically; materialization allocates every
    /// object before filling any slot.
    Virtual(u32),
}

/// Complete deoptimization record of one guard: the frame chain plus the
/// recipes for every virtual object the chain mentions.
#[derive(Debug)]
pub struct GuardResume {
    /// Innermost frame snapshot; outer frames hang off `parent`.
    pub chain: Option<Rc<Snapshot>>,
    /// Rebuild instructions for virtual objects referenced by the chain.
    pub recipes: Vec<VirtualRecipe>,
    /// Which recipe rebuilds which (virtual) box.
    pub recipe_of: FxHashMap<BoxId, u32>,
}

impl GuardResume {
    /// Frame snapshots ordered outermost first, the order in which the
    /// interpreter stack is rebuilt.
    pub fn frames(&self) -> Vec<&Snapshot> {
        let mut out = Vec::new();
        let mut cur = self.chain.as_deref();
        while let Some(snap) = cur {
            out.push(snap);
            cur = snap.parent.as_deref();
        }
        out.reverse();
        out
    }

    /// Allocate every recipe object in `heap` and fill their slots.
    ///
    /// All allocations happen before any slot is written, so mutually
    /// referencing recipes come out correctly linked. `resolver` supplies
    /// the runtime value of live boxes.
    pub fn materialize(
        &self,
        heap: &mut Heap,
        resolver: &mut dyn FnMut(BoxId) -> RtValue,
    ) -> Result<Vec<RtValue>, EvalError> {
        let objs: Vec<ObjId> = self
            .recipes
            .iter()
            .map(|r| match &r.shape {
                RecipeShape::Object(class) => heap.alloc_object(class),
                RecipeShape::Array { elem, len } => heap.alloc_array(elem, *len as usize),
            })
            .collect();
        for (r, &obj) in self.recipes.iter().zip(&objs) {
            for (i, slot) in r.slots.iter().enumerate() {
                let value = self.slot_rt(slot, &objs, resolver);
                match &r.shape {
                    RecipeShape::Object(_) => heap.set_field(obj, i as u32, value)?,
                    RecipeShape::Array { .. } => heap.set_item(obj, i as i64, value)?,
                }
            }
        }
        Ok(objs.into_iter().map(RtValue::Obj).collect())
    }

    /// Rebuild the interpreter frames of this guard, outermost first,
    /// materializing virtual objects as needed.
    pub fn frame_values(
        &self,
        heap: &mut Heap,
        resolver: &mut dyn FnMut(BoxId) -> RtValue,
    ) -> Result<Vec<(FrameDescr, Vec<RtValue>)>, EvalError> {
        let materialized = self.materialize(heap, resolver)?;
        let mut out = Vec::new();
        for snap in self.frames() {
            let values = snap
                .slots
                .iter()
                .map(|slot| match *slot {
                    SlotValue::Const(c) => c.into(),
                    SlotValue::Box(b) => match self.recipe_of.get(&b) {
                        Some(&idx) => materialized[idx as usize],
                        None => resolver(b),
                    },
                })
                .collect();
            out.push((snap.frame, values));
        }
        Ok(out)
    }

    fn slot_rt(
        &self,
        slot: &RecipeSlot,
        objs: &[ObjId],
        resolver: &mut dyn FnMut(BoxId) -> RtValue,
    ) -> RtValue {
        match *slot {
            RecipeSlot::Const(c) => c.into(),
            RecipeSlot::Box(b) => resolver(b),
            RecipeSlot::Virtual(idx) => RtValue::Obj(objs[idx as usize]),
        }
    }
}

struct FrameState {
    descr: FrameDescr,
    slots: Vec<Option<Operand>>,
    /// Snapshot reused verbatim while no slot of this frame changes.
    frozen: Option<Rc<Snapshot>>,
}

/// Shadow frame stack and the table of per-guard resume records.
#[derive(Default)]
pub(crate) struct ResumeBuilder {
    frames: Vec<FrameState>,
    table: Vec<GuardResume>,
}

impl ResumeBuilder {
    /// Consume one resume marker operation.
    pub fn record(&mut self, op: &Operation) -> Result<(), CompileError> {
        use trace_ir::Opcode::*;
        match op.opcode {
            EnterFrame => {
                let descr = *op.frame_descr().ok_or_else(|| {
                    IrError::MalformedTrace("enter_frame without frame descriptor".into())
                })?;
                self.frames.push(FrameState {
                    descr,
                    slots: vec![None; descr.num_slots as usize],
                    frozen: None,
                });
            }
            LeaveFrame => {
                if self.frames.pop().is_none() {
                    return Err(IrError::MalformedTrace(
                        "leave_frame with no open frame".into(),
                    )
                    .into());
                }
            }
            RecordSlot { slot } => {
                let frame = self.frames.last_mut().ok_or_else(|| {
                    IrError::MalformedTrace("record_slot with no open frame".into())
                })?;
                let cell = frame.slots.get_mut(slot as usize).ok_or_else(|| {
                    IrError::MalformedTrace(format!(
                        "record_slot {slot} out of range for frame {}",
                        frame.descr.frame_id
                    ))
                })?;
                *cell = Some(*op.args.first().ok_or_else(|| {
                    IrError::MalformedTrace("record_slot without a value".into())
                })?);
                frame.frozen = None;
            }
            _ => {
                return Err(
                    IrError::MalformedTrace(format!("{:?} is not a resume marker", op.opcode))
                        .into(),
                )
            }
        }
        Ok(())
    }

    /// Freeze the current frame stack for a guard being emitted.
    ///
    /// Frames untouched since the previous freeze reuse their existing
    /// `Rc<Snapshot>`; only re-recorded frames (and their inner frames,
    /// whose parent link changed) are rebuilt.
    pub fn freeze(
        &mut self,
        facts: &FactTable,
        virtuals: &VirtualArena,
    ) -> Result<SnapshotRef, CompileError> {
        let mut parent: Option<Rc<Snapshot>> = None;
        for frame in &mut self.frames {
            let reusable = frame.frozen.as_ref().is_some_and(|rc| match (&rc.parent, &parent) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            });
            if reusable {
                parent = frame.frozen.clone();
                continue;
            }
            let mut slots = Vec::with_capacity(frame.slots.len());
            for (i, cell) in frame.slots.iter().enumerate() {
                let operand = cell.ok_or(CompileError::UnresolvedSlot {
                    frame: frame.descr.frame_id,
                    slot: i as u32,
                })?;
                slots.push(match facts.resolve(operand) {
                    Operand::Const(c) => SlotValue::Const(c),
                    Operand::Box(b) => SlotValue::Box(b),
                });
            }
            let rc = Rc::new(Snapshot {
                frame: frame.descr,
                slots,
                parent: parent.take(),
            });
            frame.frozen = Some(rc.clone());
            parent = Some(rc);
        }

        let (recipes, recipe_of) = build_recipes(parent.as_deref(), facts, virtuals);
        let idx = self.table.len() as u32;
        trace!(guard = idx, recipes = recipes.len(), "froze snapshot");
        self.table.push(GuardResume {
            chain: parent,
            recipes,
            recipe_of,
        });
        Ok(SnapshotRef(idx))
    }

    /// Hand over the accumulated per-guard records.
    pub fn take_table(&mut self) -> Vec<GuardResume> {
        std::mem::take(&mut self.table)
    }
}

/// Build rebuild recipes for every virtual box the snapshot chain mentions,
/// transitively. Indices are assigned on first visit, before recursing into
/// slot contents, so cyclic object graphs terminate.
fn build_recipes(
    chain: Option<&Snapshot>,
    facts: &FactTable,
    virtuals: &VirtualArena,
) -> (Vec<VirtualRecipe>, FxHashMap<BoxId, u32>) {
    let mut index_of: FxHashMap<BoxId, u32> = FxHashMap::default();
    let mut pending: Vec<BoxId> = Vec::new();

    let mut cur = chain;
    while let Some(snap) = cur {
        for slot in &snap.slots {
            if let SlotValue::Box(b) = *slot {
                if facts.virtual_of(Operand::Box(b)).is_some() && !index_of.contains_key(&b) {
                    index_of.insert(b, pending.len() as u32);
                    pending.push(b);
                }
            }
        }
        cur = snap.parent.as_deref();
    }

    let mut recipes: Vec<VirtualRecipe> = Vec::new();
    let mut i = 0;
    while i < pending.len() {
        let b = pending[i];
        i += 1;
        // virtual_of returned Some for everything queued
        let Some(vid) = facts.virtual_of(Operand::Box(b)) else {
            continue;
        };
        let state = virtuals.get(vid);
        let (shape, raw_slots) = match &state.content {
            VirtualContent::Object { class, fields } => {
                let filled: Vec<Operand> = fields
                    .iter()
                    .enumerate()
                    .map(|(idx, slot)| {
                        slot.unwrap_or_else(|| Operand::Const(class.fields[idx].default_const()))
                    })
                    .collect();
                (RecipeShape::Object(class.clone()), filled)
            }
            VirtualContent::Array { elem, items } => {
                let filled: Vec<Operand> = items
                    .iter()
                    .map(|slot| slot.unwrap_or(Operand::Const(elem.elem.default_const())))
                    .collect();
                (
                    RecipeShape::Array {
                        elem: *elem,
                        len: items.len() as i64,
                    },
                    filled,
                )
            }
        };
        let slots = raw_slots
            .into_iter()
            .map(|operand| match facts.resolve(operand) {
                Operand::Const(c) => RecipeSlot::Const(c),
                Operand::Box(inner) => {
                    if facts.virtual_of(Operand::Box(inner)).is_some() {
                        let idx = *index_of.entry(inner).or_insert_with(|| {
                            pending.push(inner);
                            (pending.len() - 1) as u32
                        });
                        RecipeSlot::Virtual(idx)
                    } else {
                        RecipeSlot::Box(inner)
                    }
                }
            })
            .collect();
        recipes.push(VirtualRecipe { shape, slots });
    }
    (recipes, index_of)
}
