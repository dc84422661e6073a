//! Virtual allocations and escape analysis.
//!
//! An allocation whose result never escapes the trace does not need to
//! happen at all: the optimizer keeps the would-be object as a
//! [`VirtualState`] in a side arena, answers field and element accesses out
//! of that state, and only materializes the object ("forces" it) when a
//! store, a call, or the trace exit lets a reference leak to code it cannot
//! see. Guards never force: an unforced virtual at a guard is described by
//! a rebuild recipe in the guard's resume record instead.

use tracing::debug;
use trace_ir::{ArrayDescr, BoxId, ClassDescr, Const, Descr, Opcode, Operand, Operation};

use crate::error::CompileError;
use crate::optimizer::Core;

/// Index into the optimizer's virtual arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualId(pub(crate) u32);

/// Tracked contents of one unmaterialized allocation. A `None` slot was
/// never written and holds the layout's default value.
#[derive(Debug, Clone)]
pub enum VirtualContent {
    /// Fixed-layout object.
    Object {
        /// Class of the elided `new_object`.
        class: ClassDescr,
        /// Last stored operand per field.
        fields: Vec<Option<Operand>>,
    },
    /// Array with a length known at optimization time.
    Array {
        /// Element descriptor of the elided `new_array`.
        elem: ArrayDescr,
        /// Last stored operand per element.
        items: Vec<Option<Operand>>,
    },
}

/// One virtual allocation.
#[derive(Debug, Clone)]
pub struct VirtualState {
    /// The box the elided allocation would have defined.
    pub source: BoxId,
    /// Field or element contents.
    pub content: VirtualContent,
    /// Set once the allocation has been materialized.
    pub forced: bool,
}

/// Arena of virtual states, owned by the optimizer core.
#[derive(Debug, Default)]
pub struct VirtualArena {
    states: Vec<VirtualState>,
}

impl VirtualArena {
    pub(crate) fn alloc(&mut self, state: VirtualState) -> VirtualId {
        let id = VirtualId(self.states.len() as u32);
        self.states.push(state);
        id
    }

    pub(crate) fn get(&self, id: VirtualId) -> &VirtualState {
        &self.states[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: VirtualId) -> &mut VirtualState {
        &mut self.states[id.0 as usize]
    }
}

/// What the virtual stage decided about a field or element read.
enum Read {
    /// The access hit a tracked slot; use this operand.
    Value(Operand),
    /// The base must be materialized and the operation kept.
    Escape,
}

/// Run one operation through the virtual stage.
///
/// Returns `None` when the operation was fully absorbed (elided allocation,
/// access answered from a virtual state, statically decided guard).
pub(crate) fn apply(core: &mut Core, op: Operation) -> Result<Option<Operation>, CompileError> {
    match op.opcode {
        Opcode::NewObject => {
            let Some(class) = op.class_descr().cloned() else {
                return Ok(Some(op));
            };
            let Some(result) = op.result else {
                return Ok(Some(op));
            };
            let fields = vec![None; class.field_count()];
            let class_id = class.id;
            let vid = core.virtuals.alloc(VirtualState {
                source: result,
                content: VirtualContent::Object { class, fields },
                forced: false,
            });
            let entry = core.facts.entry(result);
            entry.virtual_slot = Some(vid);
            entry.known_class = Some(class_id);
            entry.known_nonnull = true;
            core.stats.virtuals_created += 1;
            Ok(None)
        }
        Opcode::NewArray => {
            let (Some(elem), Some(result)) = (op.array_descr().copied(), op.result) else {
                return Ok(Some(op));
            };
            // only constant-length arrays can stay virtual
            let len = match op.args.first().and_then(|a| a.as_const()).and_then(Const::as_int)
            {
                Some(len) if len >= 0 => len,
                _ => return Ok(Some(op)),
            };
            let vid = core.virtuals.alloc(VirtualState {
                source: result,
                content: VirtualContent::Array {
                    elem,
                    items: vec![None; len as usize],
                },
                forced: false,
            });
            let entry = core.facts.entry(result);
            entry.virtual_slot = Some(vid);
            entry.known_nonnull = true;
            core.stats.virtuals_created += 1;
            Ok(None)
        }
        Opcode::GetField => {
            let (Some(vid), Some(fd), Some(result)) =
                (virtual_base(core, &op), op.field_descr().copied(), op.result)
            else {
                // real base: the heap stage takes over
                return Ok(Some(op));
            };
            let read = match &core.virtuals.get(vid).content {
                VirtualContent::Object { fields, .. } => {
                    match fields.get(fd.index as usize).copied() {
                        Some(slot) => Read::Value(
                            slot.unwrap_or(Operand::Const(fd.kind.default_const())),
                        ),
                        // out of range: keep the op and let it trap
                        None => Read::Escape,
                    }
                }
                VirtualContent::Array { .. } => Read::Escape,
            };
            match read {
                Read::Value(value) => {
                    core.facts.set_alias(result, value);
                    core.stats.loads_eliminated += 1;
                    Ok(None)
                }
                Read::Escape => {
                    force_operand(core, op.args[0])?;
                    Ok(Some(op))
                }
            }
        }
        Opcode::SetField => {
            let value = op.args.get(1).copied();
            let base_virtual = virtual_base(core, &op);
            let writable = match (base_virtual, op.field_descr()) {
                (Some(vid), Some(fd)) => match &core.virtuals.get(vid).content {
                    VirtualContent::Object { fields, .. } => {
                        let index = fd.index as usize;
                        (index < fields.len()).then_some((vid, index))
                    }
                    VirtualContent::Array { .. } => None,
                },
                _ => None,
            };
            match (writable, value) {
                (Some((vid, index)), Some(value)) => {
                    if let VirtualContent::Object { fields, .. } =
                        &mut core.virtuals.get_mut(vid).content
                    {
                        fields[index] = Some(value);
                    }
                    core.stats.stores_eliminated += 1;
                    Ok(None)
                }
                _ => {
                    // a real base or bad index escapes the value and traps
                    if base_virtual.is_some() {
                        force_operand(core, op.args[0])?;
                    }
                    if let Some(value) = value {
                        force_operand(core, value)?;
                    }
                    Ok(Some(op))
                }
            }
        }
        Opcode::GetItem => {
            let (Some(vid), Some(result)) = (virtual_base(core, &op), op.result) else {
                return Ok(Some(op));
            };
            let read = match (const_index(&op, 1), &core.virtuals.get(vid).content) {
                (Some(index), VirtualContent::Array { elem, items }) => {
                    match usize::try_from(index).ok().and_then(|i| items.get(i).copied()) {
                        Some(slot) => Read::Value(
                            slot.unwrap_or(Operand::Const(elem.elem.default_const())),
                        ),
                        // out of range: keep the op and let it trap
                        None => Read::Escape,
                    }
                }
                _ => Read::Escape,
            };
            match read {
                Read::Value(value) => {
                    core.facts.set_alias(result, value);
                    core.stats.loads_eliminated += 1;
                    Ok(None)
                }
                Read::Escape => {
                    force_operand(core, op.args[0])?;
                    Ok(Some(op))
                }
            }
        }
        Opcode::SetItem => {
            let value = op.args.get(2).copied();
            let base_virtual = virtual_base(core, &op);
            let writable = match (base_virtual, const_index(&op, 1)) {
                (Some(vid), Some(index)) => match &core.virtuals.get(vid).content {
                    VirtualContent::Array { items, .. } => usize::try_from(index)
                        .ok()
                        .filter(|&i| i < items.len())
                        .map(|i| (vid, i)),
                    VirtualContent::Object { .. } => None,
                },
                _ => None,
            };
            match (writable, value) {
                (Some((vid, index)), Some(value)) => {
                    if let VirtualContent::Array { items, .. } =
                        &mut core.virtuals.get_mut(vid).content
                    {
                        items[index] = Some(value);
                    }
                    core.stats.stores_eliminated += 1;
                    Ok(None)
                }
                _ => {
                    if base_virtual.is_some() {
                        force_operand(core, op.args[0])?;
                    }
                    if let Some(value) = value {
                        force_operand(core, value)?;
                    }
                    Ok(Some(op))
                }
            }
        }
        Opcode::ArrayLen => {
            let (Some(vid), Some(result)) = (virtual_base(core, &op), op.result) else {
                return Ok(Some(op));
            };
            let len = match &core.virtuals.get(vid).content {
                VirtualContent::Array { items, .. } => Some(items.len() as i64),
                VirtualContent::Object { .. } => None,
            };
            match len {
                Some(len) => {
                    core.facts.set_constant(result, Const::Int(len));
                    core.stats.loads_eliminated += 1;
                    Ok(None)
                }
                None => Ok(Some(op)),
            }
        }
        Opcode::PtrEq | Opcode::PtrNe => {
            let (Some(&a), Some(&b), Some(result)) =
                (op.args.first(), op.args.get(1), op.result)
            else {
                return Ok(Some(op));
            };
            match ptr_identity(core, a, b) {
                Some(same) => {
                    let truth = same == (op.opcode == Opcode::PtrEq);
                    core.facts.set_constant(result, Const::Int(truth as i64));
                    core.stats.constants_folded += 1;
                    Ok(None)
                }
                None => Ok(Some(op)),
            }
        }
        Opcode::GuardClass => {
            let (Some(class), Some(&base)) = (op.class_descr(), op.args.first()) else {
                return Ok(Some(op));
            };
            if let Some(vid) = core.facts.virtual_of(base) {
                let matches = match &core.virtuals.get(vid).content {
                    VirtualContent::Object { class: have, .. } => have.id == class.id,
                    VirtualContent::Array { .. } => false,
                };
                return if matches {
                    core.stats.guards_elided += 1;
                    Ok(None)
                } else {
                    Err(CompileError::InvalidLoop(format!(
                        "guard_class {:?} on a virtual of a different class",
                        class.id
                    )))
                };
            }
            Ok(Some(op))
        }
        Opcode::GuardNonnull => {
            let Some(&base) = op.args.first() else {
                return Ok(Some(op));
            };
            if core.facts.virtual_of(base).is_some() {
                core.stats.guards_elided += 1;
                return Ok(None);
            }
            Ok(Some(op))
        }
        Opcode::GuardIsnull => {
            let Some(&base) = op.args.first() else {
                return Ok(Some(op));
            };
            if core.facts.virtual_of(base).is_some() {
                return Err(CompileError::InvalidLoop(
                    "guard_isnull on a virtual allocation".into(),
                ));
            }
            Ok(Some(op))
        }
        Opcode::GuardValue => {
            // identity guards pin the object; it has to exist
            if let Some(&arg) = op.args.first() {
                force_operand(core, arg)?;
            }
            Ok(Some(op))
        }
        Opcode::Call => {
            let tolerant = op.call_descr().is_some_and(|d| d.tolerates_virtual_args());
            if !tolerant {
                for arg in op.args.clone() {
                    force_operand(core, arg)?;
                }
            }
            Ok(Some(op))
        }
        _ => Ok(Some(op)),
    }
}

fn virtual_base(core: &Core, op: &Operation) -> Option<VirtualId> {
    op.args.first().and_then(|&base| core.facts.virtual_of(base))
}

fn const_index(op: &Operation, arg: usize) -> Option<i64> {
    op.args.get(arg).and_then(|a| a.as_const()).and_then(Const::as_int)
}

/// Static pointer identity: `Some(true/false)` when provable, `None` when
/// it has to be decided at runtime. An unforced virtual is a fresh
/// allocation no pre-existing reference can alias.
fn ptr_identity(core: &Core, a: Operand, b: Operand) -> Option<bool> {
    let va = core.facts.virtual_of(a);
    let vb = core.facts.virtual_of(b);
    if va.is_some() || vb.is_some() {
        return Some(va.is_some() && vb.is_some() && va == vb && a == b);
    }
    match (a, b) {
        (Operand::Box(x), Operand::Box(y)) if x == y => Some(true),
        _ => None,
    }
}

/// Materialize the virtual behind `operand`, if there is one, together with
/// every virtual reachable from its slots.
pub(crate) fn force_operand(core: &mut Core, operand: Operand) -> Result<(), CompileError> {
    let resolved = core.facts.resolve(operand);
    let Some(root) = core.facts.virtual_of(resolved) else {
        return Ok(());
    };
    force_virtual(core, root)
}

fn force_virtual(core: &mut Core, root: VirtualId) -> Result<(), CompileError> {
    let order = collect_reachable(core, root);

    // Drop the virtual marker on every box first: stores emitted below must
    // see real boxes when slots reference members of the same group.
    for &vid in &order {
        core.virtuals.get_mut(vid).forced = true;
        let source = core.virtuals.get(vid).source;
        let canonical = core.facts.canonical(source);
        core.facts.entry(canonical).virtual_slot = None;
    }

    // Allocations before any store, so cyclic references come out linked.
    for &vid in &order {
        let state = core.virtuals.get(vid).clone();
        debug!(source = %state.source, "forcing virtual allocation");
        let alloc = match &state.content {
            VirtualContent::Object { class, .. } => {
                Operation::new(Opcode::NewObject, vec![], Some(state.source))
                    .with_descr(Descr::Class(class.clone()))
            }
            VirtualContent::Array { elem, items } => {
                core.heap.note_length(state.source, items.len() as i64);
                Operation::new(
                    Opcode::NewArray,
                    vec![Operand::Const(Const::Int(items.len() as i64))],
                    Some(state.source),
                )
                .with_descr(Descr::Array(*elem))
            }
        };
        core.emit(alloc);
        core.stats.virtuals_forced += 1;
    }

    for &vid in &order {
        let state = core.virtuals.get(vid).clone();
        match &state.content {
            VirtualContent::Object { class, fields } => {
                for (i, slot) in fields.iter().enumerate() {
                    let Some(raw) = *slot else { continue };
                    let value = core.facts.resolve(raw);
                    // a freshly allocated field already holds the default
                    if value == Operand::Const(class.fields[i].default_const()) {
                        continue;
                    }
                    let Some(fd) = class.field(i as u32) else { continue };
                    core.emit(
                        Operation::new(
                            Opcode::SetField,
                            vec![Operand::Box(state.source), value],
                            None,
                        )
                        .with_descr(Descr::Field(fd)),
                    );
                    core.heap.note_field(state.source, fd.class, fd.index, value);
                }
            }
            VirtualContent::Array { elem, items } => {
                for (i, slot) in items.iter().enumerate() {
                    let Some(raw) = *slot else { continue };
                    let value = core.facts.resolve(raw);
                    if value == Operand::Const(elem.elem.default_const()) {
                        continue;
                    }
                    core.emit(
                        Operation::new(
                            Opcode::SetItem,
                            vec![
                                Operand::Box(state.source),
                                Operand::Const(Const::Int(i as i64)),
                                value,
                            ],
                            None,
                        )
                        .with_descr(Descr::Array(*elem)),
                    );
                    core.heap.note_item(state.source, i as i64, value);
                }
            }
        }
    }
    Ok(())
}

/// Not-yet-forced virtuals reachable from `root` through slot operands,
/// children before parents where the graph is acyclic.
fn collect_reachable(core: &Core, root: VirtualId) -> Vec<VirtualId> {
    let mut order = Vec::new();
    let mut visited = vec![root];
    let mut stack = vec![(root, 0usize)];
    loop {
        let Some(&(vid, next)) = stack.last() else { break };
        let children = virtual_children(core, vid);
        if next < children.len() {
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let child = children[next];
            if !visited.contains(&child) {
                visited.push(child);
                stack.push((child, 0));
            }
        } else {
            stack.pop();
            order.push(vid);
        }
    }
    order
}

fn virtual_children(core: &Core, vid: VirtualId) -> Vec<VirtualId> {
    let slots: Vec<Operand> = match &core.virtuals.get(vid).content {
        VirtualContent::Object { fields, .. } => fields.iter().copied().flatten().collect(),
        VirtualContent::Array { items, .. } => items.iter().copied().flatten().collect(),
    };
    slots
        .into_iter()
        .filter_map(|s| core.facts.virtual_of(core.facts.resolve(s)))
        .filter(|child| !core.virtuals.get(*child).forced)
        .collect()
}
