//! Constant folding and common-subexpression elimination.
//!
//! Pure operations over constant operands fold away entirely. Pure
//! operations seen before (same opcode, same canonical operands) are
//! replaced by an alias to the earlier result. Calls whose descriptor marks
//! them pure participate too, keyed additionally on the call target.
//!
//! A second table holds entries imported from a preamble pass during loop
//! peeling: hitting one of those does not reuse a box of the current trace
//! but requests that the preamble's value be threaded in as an extra
//! loop-carried input.

use rustc_hash::FxHashMap;
use tracing::trace;
use trace_ir::{BoxId, Const, Opcode, Operand, Operation};

use crate::optimizer::Core;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PureKey {
    pub opcode: Opcode,
    pub args: Vec<Operand>,
    /// Call target for pure calls; `None` for ordinary operations.
    pub target: Option<u32>,
}

impl PureKey {
    /// Canonical key: commutative operations order their two operands so
    /// `a + b` and `b + a` collide.
    pub fn new(opcode: Opcode, mut args: Vec<Operand>, target: Option<u32>) -> Self {
        if is_commutative(opcode) && args.len() == 2 && operand_rank(&args[1]) < operand_rank(&args[0])
        {
            args.swap(0, 1);
        }
        PureKey { opcode, args, target }
    }
}

fn is_commutative(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        IntAdd | IntMul | IntAnd | IntOr | IntXor | IntEq | IntNe | FloatAdd | FloatMul | PtrEq
            | PtrNe
    )
}

/// Stable ordering for commutative-key normalization: boxes by id, then
/// constants.
fn operand_rank(operand: &Operand) -> (u8, u64) {
    match operand {
        Operand::Box(b) => (0, b.0 as u64),
        Operand::Const(Const::Int(v)) => (1, *v as u64),
        Operand::Const(Const::Float(v)) => (2, v.to_bits()),
        Operand::Const(Const::Null) => (3, 0),
    }
}

/// CSE tables for one optimizer run.
#[derive(Debug, Default)]
pub(crate) struct PureCache {
    table: FxHashMap<PureKey, BoxId>,
    imported: FxHashMap<PureKey, BoxId>,
}

impl PureCache {
    /// Seed an entry from a preamble pass. `value` is a box of the
    /// *preamble* trace.
    pub fn seed(&mut self, key: PureKey, value: BoxId) {
        self.imported.insert(key, value);
    }

    /// Entries of the local table, for end-of-trace export.
    pub fn entries(&self) -> impl Iterator<Item = (&PureKey, &BoxId)> {
        self.table.iter()
    }
}

/// Run one operation through the pure stage.
pub(crate) fn apply(core: &mut Core, op: Operation) -> Option<Operation> {
    if op.opcode == Opcode::SameAs {
        if let (Some(result), Some(&arg)) = (op.result, op.args.first()) {
            core.facts.set_alias(result, arg);
            core.stats.pure_hits += 1;
        }
        return None;
    }

    let target = match op.opcode {
        Opcode::Call => match op.call_descr() {
            Some(d) if d.tolerates_virtual_args() => Some(d.target),
            _ => return Some(op),
        },
        _ if op.opcode.is_pure() => None,
        _ => return Some(op),
    };

    let result = op.result?;

    // all-constant operands fold away
    if target.is_none() {
        let consts: Option<Vec<Const>> = op.args.iter().map(|a| a.as_const()).collect();
        if let Some(consts) = consts {
            if let Some(folded) = op.opcode.fold(&consts) {
                core.facts.set_constant(result, folded);
                core.stats.constants_folded += 1;
                return None;
            }
        }
    }

    let key = PureKey::new(op.opcode, op.args.clone(), target);
    if let Some(&prior) = core.pure.table.get(&key) {
        core.facts.set_alias(result, Operand::Box(prior));
        core.stats.pure_hits += 1;
        return None;
    }
    if let Some(&preamble_box) = core.pure.imported.get(&key) {
        // value proven in the preamble: thread it through the loop header
        // instead of recomputing
        let carried = core.factory.fresh();
        trace!(%preamble_box, %carried, "threading loop-invariant pure value");
        core.threads.push((preamble_box, carried));
        core.pure.imported.remove(&key);
        core.pure.table.insert(key, carried);
        core.facts.set_alias(result, Operand::Box(carried));
        core.stats.pure_hits += 1;
        return None;
    }
    core.pure.table.insert(key, result);
    Some(op)
}
