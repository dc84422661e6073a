//! Heap fact caching: redundant load and store elimination.
//!
//! Tracks, per real (non-virtual) base box, the last value known to live in
//! each field and constant-indexed array element. A repeated load forwards
//! the cached value; a store of the value already cached is dropped. Facts
//! are invalidated conservatively: a store kills facts of every other base
//! that could alias, and a call that may touch the heap kills all field and
//! element facts. Array lengths are immutable and survive call barriers.

use rustc_hash::FxHashMap;
use tracing::debug;
use trace_ir::{BoxId, ClassId, Const, Opcode, Operand, Operation};

use crate::optimizer::Core;

/// The forwarding caches. Keys use canonical base boxes.
#[derive(Debug, Default)]
pub(crate) struct HeapFacts {
    fields: FxHashMap<(BoxId, ClassId, u32), Operand>,
    items: FxHashMap<(BoxId, i64), Operand>,
    lengths: FxHashMap<BoxId, i64>,
}

impl HeapFacts {
    pub fn note_field(&mut self, base: BoxId, class: ClassId, index: u32, value: Operand) {
        self.fields.insert((base, class, index), value);
    }

    pub fn note_item(&mut self, base: BoxId, index: i64, value: Operand) {
        self.items.insert((base, index), value);
    }

    pub fn note_length(&mut self, base: BoxId, len: i64) {
        self.lengths.insert(base, len);
    }

    /// A store through `base` may alias any other base with the same field.
    fn invalidate_field(&mut self, base: BoxId, class: ClassId, index: u32) {
        self.fields
            .retain(|&(b, c, i), _| b == base || (c, i) != (class, index));
    }

    fn invalidate_item(&mut self, base: BoxId, index: i64) {
        self.items.retain(|&(b, i), _| b == base || i != index);
    }

    /// Two bases were proven to be the same object; pool their facts.
    pub fn merge(&mut self, keep: BoxId, gone: BoxId) {
        let moved: Vec<_> = self
            .fields
            .iter()
            .filter(|((b, _, _), _)| *b == gone)
            .map(|(&(_, c, i), &v)| ((keep, c, i), v))
            .collect();
        self.fields.retain(|&(b, _, _), _| b != gone);
        for (k, v) in moved {
            self.fields.entry(k).or_insert(v);
        }
        let moved: Vec<_> = self
            .items
            .iter()
            .filter(|((b, _), _)| *b == gone)
            .map(|(&(_, i), &v)| ((keep, i), v))
            .collect();
        self.items.retain(|&(b, _), _| b != gone);
        for (k, v) in moved {
            self.items.entry(k).or_insert(v);
        }
        if let Some(len) = self.lengths.remove(&gone) {
            self.lengths.entry(keep).or_insert(len);
        }
    }

    /// Field facts, for end-of-trace export.
    pub fn field_entries(&self) -> impl Iterator<Item = (BoxId, ClassId, u32, Operand)> + '_ {
        self.fields.iter().map(|(&(b, c, i), &v)| (b, c, i, v))
    }

    /// Element facts, for end-of-trace export.
    pub fn item_entries(&self) -> impl Iterator<Item = (BoxId, i64, Operand)> + '_ {
        self.items.iter().map(|(&(b, i), &v)| (b, i, v))
    }

    /// Known array lengths, for end-of-trace export.
    pub fn length_entries(&self) -> impl Iterator<Item = (BoxId, i64)> + '_ {
        self.lengths.iter().map(|(&b, &l)| (b, l))
    }

    fn clear_for_call(&mut self) {
        self.fields.clear();
        self.items.clear();
        // array lengths cannot change, whatever the call does
    }
}

/// Run one operation through the heap stage. Bases are never unforced
/// virtuals here; the virtual stage intercepted those.
pub(crate) fn apply(core: &mut Core, op: Operation) -> Option<Operation> {
    match op.opcode {
        Opcode::GetField => {
            let (Some(base), Some(fd), Some(result)) =
                (base_box(&op), op.field_descr().copied(), op.result)
            else {
                return Some(op);
            };
            let key = (base, fd.class, fd.index);
            if let Some(&cached) = core.heap.fields.get(&key) {
                core.facts.set_alias(result, cached);
                core.stats.loads_eliminated += 1;
                return None;
            }
            core.heap.fields.insert(key, Operand::Box(result));
            Some(op)
        }
        Opcode::SetField => {
            let (Some(base), Some(fd), Some(&value)) =
                (base_box(&op), op.field_descr().copied(), op.args.get(1))
            else {
                return Some(op);
            };
            let key = (base, fd.class, fd.index);
            if core.heap.fields.get(&key) == Some(&value) {
                // storing what the field already holds
                core.stats.stores_eliminated += 1;
                return None;
            }
            core.heap.invalidate_field(base, fd.class, fd.index);
            core.heap.fields.insert(key, value);
            Some(op)
        }
        Opcode::GetItem => {
            let (Some(base), Some(result)) = (base_box(&op), op.result) else {
                return Some(op);
            };
            let Some(index) = const_index(&op) else {
                return Some(op);
            };
            let key = (base, index);
            if let Some(&cached) = core.heap.items.get(&key) {
                core.facts.set_alias(result, cached);
                core.stats.loads_eliminated += 1;
                return None;
            }
            core.heap.items.insert(key, Operand::Box(result));
            Some(op)
        }
        Opcode::SetItem => {
            let (Some(base), Some(&value)) = (base_box(&op), op.args.get(2)) else {
                return Some(op);
            };
            let Some(index) = const_index(&op) else {
                // store at an unknown index may hit any tracked element
                core.heap.items.clear();
                return Some(op);
            };
            let key = (base, index);
            if core.heap.items.get(&key) == Some(&value) {
                core.stats.stores_eliminated += 1;
                return None;
            }
            core.heap.invalidate_item(base, index);
            core.heap.items.insert(key, value);
            Some(op)
        }
        Opcode::ArrayLen => {
            let (Some(base), Some(result)) = (base_box(&op), op.result) else {
                return Some(op);
            };
            if let Some(&len) = core.heap.lengths.get(&base) {
                core.facts.set_constant(result, Const::Int(len));
                core.stats.loads_eliminated += 1;
                return None;
            }
            Some(op)
        }
        Opcode::NewArray => {
            // real allocation with a constant length the virtual stage
            // chose not to keep (or a forwarded one)
            if let (Some(result), Some(len)) = (
                op.result,
                op.args.first().and_then(|a| a.as_const()).and_then(Const::as_int),
            ) {
                core.heap.lengths.insert(result, len);
            }
            Some(op)
        }
        Opcode::Call => {
            let inert = op.call_descr().is_some_and(|d| d.leaves_heap_alone());
            if !inert {
                debug!("call barrier: dropping heap facts");
                core.heap.clear_for_call();
            }
            Some(op)
        }
        _ => Some(op),
    }
}

fn base_box(op: &Operation) -> Option<BoxId> {
    op.args.first().and_then(|a| a.as_box())
}

fn const_index(op: &Operation) -> Option<i64> {
    op.args.get(1).and_then(|a| a.as_const()).and_then(Const::as_int)
}
