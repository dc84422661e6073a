//! Per-box derived facts.
//!
//! The optimizer keeps one [`OptValue`] per SSA box in a dense table indexed
//! by the box id. Facts only ever grow stronger while a trace is processed:
//! a box may gain a constant, a class, or tighter integer bounds, but a fact
//! is never retracted.

use trace_ir::{BoxId, ClassId, Const, Operand};

use crate::intbound::IntBound;
use crate::virtualize::VirtualId;

/// Everything the optimizer has proven about one box.
#[derive(Debug, Clone, Default)]
pub struct OptValue {
    /// Known constant value, when the box is proven constant.
    pub constant: Option<Const>,
    /// Another box this one is proven equal to. Aliases always point at a
    /// canonical representative, so chains are at most one link long.
    pub alias: Option<BoxId>,
    /// Proven runtime class of a reference box.
    pub known_class: Option<ClassId>,
    /// Whether a reference box is proven non-null.
    pub known_nonnull: bool,
    /// Integer interval for an integer box.
    pub bounds: IntBound,
    /// Set while the box denotes an unforced virtual allocation.
    pub virtual_slot: Option<VirtualId>,
}

/// Dense table of [`OptValue`] entries indexed by [`BoxId`].
#[derive(Debug, Default)]
pub struct FactTable {
    values: Vec<OptValue>,
}

impl FactTable {
    pub fn new() -> Self {
        FactTable::default()
    }

    /// Mutable entry for `b`, growing the table as needed.
    pub fn entry(&mut self, b: BoxId) -> &mut OptValue {
        let idx = b.index();
        if idx >= self.values.len() {
            self.values.resize_with(idx + 1, OptValue::default);
        }
        &mut self.values[idx]
    }

    /// Shared view of the facts for `b`. Boxes never seen before report the
    /// empty fact set.
    pub fn value(&self, b: BoxId) -> &OptValue {
        static EMPTY: OptValue = OptValue {
            constant: None,
            alias: None,
            known_class: None,
            known_nonnull: false,
            bounds: IntBound { lower: None, upper: None },
            virtual_slot: None,
        };
        self.values.get(b.index()).unwrap_or(&EMPTY)
    }

    /// Canonical representative of `b` under the alias relation.
    pub fn canonical(&self, b: BoxId) -> BoxId {
        let mut cur = b;
        while let Some(next) = self.value(cur).alias {
            cur = next;
        }
        cur
    }

    /// Canonical form of an operand: aliases are followed and boxes proven
    /// constant collapse to their constant.
    pub fn resolve(&self, operand: Operand) -> Operand {
        match operand {
            Operand::Const(c) => Operand::Const(c),
            Operand::Box(b) => {
                let b = self.canonical(b);
                match self.value(b).constant {
                    Some(c) => Operand::Const(c),
                    None => Operand::Box(b),
                }
            }
        }
    }

    /// Record that `from` always holds the same value as `to`.
    pub fn set_alias(&mut self, from: BoxId, to: Operand) {
        match self.resolve(to) {
            Operand::Const(c) => self.set_constant(from, c),
            Operand::Box(target) => {
                if target != from {
                    self.entry(from).alias = Some(target);
                }
            }
        }
    }

    /// Record that `b` is the constant `c`.
    pub fn set_constant(&mut self, b: BoxId, c: Const) {
        let b = self.canonical(b);
        let entry = self.entry(b);
        entry.constant = Some(c);
        if let Const::Int(v) = c {
            entry.bounds = IntBound::exact(v);
        }
        if !matches!(c, Const::Null) {
            entry.known_nonnull = true;
        }
    }

    /// Integer interval for an operand. Constants give exact bounds; unknown
    /// boxes are unbounded.
    pub fn bounds(&self, operand: Operand) -> IntBound {
        match self.resolve(operand) {
            Operand::Const(Const::Int(v)) => IntBound::exact(v),
            Operand::Const(_) => IntBound::unbounded(),
            Operand::Box(b) => self.value(b).bounds,
        }
    }

    /// Narrow the interval of `b` by intersecting with `narrow`.
    pub fn refine_bounds(&mut self, b: BoxId, narrow: &IntBound) {
        let b = self.canonical(b);
        let entry = self.entry(b);
        entry.bounds.intersect(narrow);
        if let Some(v) = entry.bounds.as_exact() {
            if entry.constant.is_none() {
                entry.constant = Some(Const::Int(v));
            }
        }
    }

    /// Replace the interval of `b` with `bounds`. Used when defining a fresh
    /// result box whose value was just computed.
    pub fn set_bounds(&mut self, b: BoxId, bounds: IntBound) {
        let b = self.canonical(b);
        self.entry(b).bounds = bounds;
    }

    /// Whether the operand is proven to be a non-null reference.
    pub fn known_nonnull(&self, operand: Operand) -> bool {
        match self.resolve(operand) {
            Operand::Const(c) => !matches!(c, Const::Null),
            Operand::Box(b) => {
                let v = self.value(b);
                v.known_nonnull || v.known_class.is_some() || v.virtual_slot.is_some()
            }
        }
    }

    /// The virtual id of an operand, when it denotes an unforced virtual.
    pub fn virtual_of(&self, operand: Operand) -> Option<VirtualId> {
        match operand {
            Operand::Const(_) => None,
            Operand::Box(b) => self.value(self.canonical(b)).virtual_slot,
        }
    }
}
