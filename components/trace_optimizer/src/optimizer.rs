//! The optimizer core: one forward pass, four stages, one output buffer.
//!
//! Every input operation has its operands canonicalized against the fact
//! table, then flows through the pure, virtual, heap and bounds stages in
//! that fixed order. Any stage may absorb the operation; whatever survives
//! is appended to the output. Guards that survive get a frozen
//! deoptimization snapshot attached first, and only then strengthen the
//! fact table, so the snapshot describes the world in which the guard is
//! about to fail.

use rustc_hash::FxHashMap;
use tracing::debug;
use trace_ir::{
    BoxFactory, BoxId, ClassId, Const, Opcode, Operand, Operation, SnapshotRef, Trace,
};

use crate::bounds;
use crate::error::CompileError;
use crate::facts::FactTable;
use crate::heap::{self, HeapFacts};
use crate::intbound::IntBound;
use crate::pure::{self, PureCache, PureKey};
use crate::resume::{GuardResume, ResumeBuilder};
use crate::virtualize::{self, VirtualArena};

/// Counters describing what one optimizer run did.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizerStats {
    /// Operations read from the input trace.
    pub ops_in: usize,
    /// Operations written to the output trace.
    pub ops_emitted: usize,
    /// Pure operations folded to a constant.
    pub constants_folded: usize,
    /// Pure operations replaced by an earlier result.
    pub pure_hits: usize,
    /// Field/element loads answered from cached facts or virtual state.
    pub loads_eliminated: usize,
    /// Stores absorbed into virtual state or proven redundant.
    pub stores_eliminated: usize,
    /// Guards emitted with a snapshot.
    pub guards_emitted: usize,
    /// Guards proven implied and dropped.
    pub guards_elided: usize,
    /// Allocations kept virtual at creation.
    pub virtuals_created: usize,
    /// Virtuals later materialized by an escape.
    pub virtuals_forced: usize,
}

/// Shared mutable state of one optimizer run, seen by every stage.
pub(crate) struct Core {
    pub facts: FactTable,
    pub virtuals: VirtualArena,
    pub heap: HeapFacts,
    pub pure: PureCache,
    pub factory: BoxFactory,
    pub out: Vec<Operation>,
    pub resume: ResumeBuilder,
    /// Defining operation of emitted comparison results, for backward
    /// refinement when a guard pins the result down.
    pub defs: FxHashMap<BoxId, (Opcode, Vec<Operand>)>,
    /// Set by an overflow-checked op that was demoted; consumed by the
    /// following `guard_no_overflow`.
    pub last_ovf_demoted: bool,
    /// Loop-invariant values requested from the preamble during peeling:
    /// `(preamble box, carried box in this trace)`.
    pub threads: Vec<(BoxId, BoxId)>,
    pub stats: OptimizerStats,
}

impl Core {
    fn new() -> Self {
        Core {
            facts: FactTable::new(),
            virtuals: VirtualArena::default(),
            heap: HeapFacts::default(),
            pure: PureCache::default(),
            factory: BoxFactory::new(),
            out: Vec::new(),
            resume: ResumeBuilder::default(),
            defs: FxHashMap::default(),
            last_ovf_demoted: false,
            threads: Vec::new(),
            stats: OptimizerStats::default(),
        }
    }

    /// Append an operation to the output, recording comparison definitions.
    pub(crate) fn emit(&mut self, op: Operation) {
        if let Some(result) = op.result {
            if is_refinable_comparison(op.opcode) {
                self.defs.insert(result, (op.opcode, op.args.clone()));
            }
        }
        self.stats.ops_emitted += 1;
        self.out.push(op);
    }

    fn freeze_snapshot(&mut self) -> Result<SnapshotRef, CompileError> {
        let Core {
            resume,
            facts,
            virtuals,
            ..
        } = self;
        resume.freeze(facts, virtuals)
    }
}

fn is_refinable_comparison(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | IntIsTrue | IntIsZero | PtrEq | PtrNe
    )
}

/// An optimized trace plus the resume table its guards index into.
#[derive(Debug)]
pub struct OptimizedTrace {
    /// The rewritten operations.
    pub trace: Trace,
    /// One deoptimization record per emitted guard, indexed by the guard's
    /// [`SnapshotRef`].
    pub resumes: Vec<GuardResume>,
}

/// End-of-trace facts in a shape independent of box identities, keyed by
/// back-edge argument position. This is what loop peeling carries from the
/// preamble pass into the steady-state pass.
#[derive(Debug, Clone, Default)]
pub struct ExportedState {
    /// One fact set per back-edge argument.
    pub args: Vec<ExportedFact>,
    /// Loop-invariant pure values available for threading.
    pub pure_values: Vec<ExportedPure>,
    /// Field facts whose base and value are loop-carried.
    pub heap_fields: Vec<ExportedField>,
    /// Element facts whose base and value are loop-carried.
    pub heap_items: Vec<ExportedItem>,
    /// Known lengths of loop-carried arrays.
    pub lengths: Vec<(usize, i64)>,
}

impl ExportedState {
    /// A state carrying no facts at all for `n` arguments. Seeding with
    /// this is always sound.
    pub fn unknown(n: usize) -> Self {
        ExportedState {
            args: vec![ExportedFact::default(); n],
            ..ExportedState::default()
        }
    }
}

/// Facts about one back-edge argument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportedFact {
    /// Proven constant value.
    pub constant: Option<Const>,
    /// Proven class.
    pub class: Option<ClassId>,
    /// Proven non-null.
    pub nonnull: bool,
    /// Integer interval.
    pub bounds: IntBound,
}

/// A position-relative operand in an exported fact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExportedOperand {
    /// The value of back-edge argument `i`.
    Carried(usize),
    /// A constant.
    Const(Const),
}

/// A pure value the preamble computed from loop-invariant operands.
#[derive(Debug, Clone)]
pub struct ExportedPure {
    /// Opcode of the pure operation.
    pub opcode: Opcode,
    /// Operands, all invariant.
    pub args: Vec<ExportedOperand>,
    /// Call target for pure calls.
    pub target: Option<u32>,
    /// Preamble box holding the value.
    pub value: BoxId,
}

/// An exported field fact.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedField {
    /// Back-edge position of the base reference.
    pub base: usize,
    /// Class of the field.
    pub class: ClassId,
    /// Field index.
    pub index: u32,
    /// Cached content.
    pub value: ExportedOperand,
}

/// An exported array element fact.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedItem {
    /// Back-edge position of the base reference.
    pub base: usize,
    /// Element index.
    pub index: i64,
    /// Cached content.
    pub value: ExportedOperand,
}

/// One-shot trace optimizer.
///
/// A single `Optimizer` performs a single [`run`](Optimizer::run); the fact
/// state it accumulates stays readable afterwards through
/// [`export_state`](Optimizer::export_state), which is how loop peeling
/// hands facts from one pass to the next.
#[derive(Default)]
pub struct Optimizer {
    pub(crate) core: Core,
}

impl Default for Core {
    fn default() -> Self {
        Core::new()
    }
}

impl Optimizer {
    /// Fresh optimizer with no facts.
    pub fn new() -> Self {
        Optimizer { core: Core::new() }
    }

    /// Optimize `trace` in one pass.
    pub fn optimize(trace: &Trace) -> Result<OptimizedTrace, CompileError> {
        let mut opt = Optimizer::new();
        opt.run(trace)
    }

    /// Counters for the completed run.
    pub fn stats(&self) -> &OptimizerStats {
        &self.core.stats
    }

    /// Optimize `trace`, producing the rewritten trace and its resume
    /// table.
    pub fn run(&mut self, trace: &Trace) -> Result<OptimizedTrace, CompileError> {
        trace.validate()?;
        self.core.factory = trace.box_factory();
        for &b in &trace.inputs {
            self.core.facts.entry(b);
        }
        for op in &trace.ops {
            self.dispatch(op)?;
        }
        let ops = std::mem::take(&mut self.core.out);
        debug!(
            ops_in = self.core.stats.ops_in,
            ops_out = ops.len(),
            guards = self.core.stats.guards_emitted,
            "optimization pass complete"
        );
        Ok(OptimizedTrace {
            trace: Trace::new(trace.inputs.clone(), ops),
            resumes: self.core.resume.take_table(),
        })
    }

    fn dispatch(&mut self, original: &Operation) -> Result<(), CompileError> {
        let core = &mut self.core;
        core.stats.ops_in += 1;
        let mut op = original.clone();
        for arg in &mut op.args {
            *arg = core.facts.resolve(*arg);
        }

        if op.opcode.is_resume_marker() {
            return core.resume.record(&op);
        }
        if op.opcode.is_terminal() {
            // anything leaving the trace must physically exist
            for arg in op.args.clone() {
                virtualize::force_operand(core, arg)?;
            }
            core.emit(op);
            return Ok(());
        }

        let Some(op) = pure::apply(core, op) else {
            return Ok(());
        };
        let Some(op) = virtualize::apply(core, op)? else {
            return Ok(());
        };
        let Some(op) = heap::apply(core, op) else {
            return Ok(());
        };
        let Some(mut op) = bounds::apply(core, op)? else {
            return Ok(());
        };

        if op.opcode.is_guard() {
            let snap = core.freeze_snapshot()?;
            op.resume = Some(snap);
            core.stats.guards_emitted += 1;
            bounds::after_guard(core, &op)?;
        }
        core.emit(op);
        Ok(())
    }

    /// Export the end-of-trace facts of a completed run, keyed by back-edge
    /// argument position. Returns the empty state for `finish` traces.
    pub fn export_state(&self, out: &OptimizedTrace) -> ExportedState {
        let Some(term) = out.trace.terminal() else {
            return ExportedState::default();
        };
        if term.opcode != Opcode::Jump {
            return ExportedState::default();
        }
        let facts = &self.core.facts;

        let mut carried: FxHashMap<BoxId, usize> = FxHashMap::default();
        let mut invariant = vec![false; term.args.len()];
        for (i, &a) in term.args.iter().enumerate() {
            if let Operand::Box(b) = facts.resolve(a) {
                carried.entry(b).or_insert(i);
                invariant[i] = out.trace.inputs.get(i) == Some(&b);
            }
        }

        let args = term
            .args
            .iter()
            .map(|&a| match facts.resolve(a) {
                Operand::Const(c) => ExportedFact {
                    constant: Some(c),
                    nonnull: !matches!(c, Const::Null),
                    bounds: match c {
                        Const::Int(v) => IntBound::exact(v),
                        _ => IntBound::unbounded(),
                    },
                    class: None,
                },
                Operand::Box(b) => {
                    let v = facts.value(b);
                    ExportedFact {
                        constant: None,
                        class: v.known_class,
                        nonnull: v.known_nonnull,
                        bounds: v.bounds,
                    }
                }
            })
            .collect();

        // an operand is exportable if it is constant or loop-carried
        let export_operand = |operand: Operand| -> Option<ExportedOperand> {
            match facts.resolve(operand) {
                Operand::Const(c) => Some(ExportedOperand::Const(c)),
                Operand::Box(b) => carried.get(&b).map(|&i| ExportedOperand::Carried(i)),
            }
        };
        // pure threading additionally needs operands that never change
        let export_invariant = |operand: Operand| -> Option<ExportedOperand> {
            match facts.resolve(operand) {
                Operand::Const(c) => Some(ExportedOperand::Const(c)),
                Operand::Box(b) => carried
                    .get(&b)
                    .filter(|&&i| invariant[i])
                    .map(|&i| ExportedOperand::Carried(i)),
            }
        };

        let mut pure_values = Vec::new();
        for (key, &value) in self.core.pure.entries() {
            let args: Option<Vec<ExportedOperand>> =
                key.args.iter().map(|&a| export_invariant(a)).collect();
            let (Some(args), Operand::Box(value)) = (args, facts.resolve(Operand::Box(value)))
            else {
                continue;
            };
            pure_values.push(ExportedPure {
                opcode: key.opcode,
                args,
                target: key.target,
                value,
            });
        }

        let mut heap_fields = Vec::new();
        for (base, class, index, value) in self.core.heap.field_entries() {
            let (Some(&pos), Some(value)) =
                (carried.get(&facts.canonical(base)), export_operand(value))
            else {
                continue;
            };
            heap_fields.push(ExportedField {
                base: pos,
                class,
                index,
                value,
            });
        }

        let mut heap_items = Vec::new();
        for (base, index, value) in self.core.heap.item_entries() {
            let (Some(&pos), Some(value)) =
                (carried.get(&facts.canonical(base)), export_operand(value))
            else {
                continue;
            };
            heap_items.push(ExportedItem {
                base: pos,
                index,
                value,
            });
        }

        let mut lengths = Vec::new();
        for (base, len) in self.core.heap.length_entries() {
            if let Some(&pos) = carried.get(&facts.canonical(base)) {
                lengths.push((pos, len));
            }
        }

        ExportedState {
            args,
            pure_values,
            heap_fields,
            heap_items,
            lengths,
        }
    }

    /// Seed this (fresh) optimizer with exported facts, binding position
    /// `i` of the state to `inputs[i]`. Call before [`run`](Optimizer::run).
    pub fn import_state(&mut self, state: &ExportedState, inputs: &[BoxId]) {
        for (i, fact) in state.args.iter().enumerate() {
            let Some(&b) = inputs.get(i) else { break };
            if let Some(c) = fact.constant {
                self.core.facts.set_constant(b, c);
            }
            let entry = self.core.facts.entry(b);
            if let Some(class) = fact.class {
                entry.known_class = Some(class);
            }
            if fact.nonnull {
                entry.known_nonnull = true;
            }
            self.core.facts.refine_bounds(b, &fact.bounds);
        }

        let inst = |facts: &FactTable, eo: ExportedOperand| -> Option<Operand> {
            match eo {
                ExportedOperand::Const(c) => Some(Operand::Const(c)),
                ExportedOperand::Carried(i) => {
                    inputs.get(i).map(|&b| facts.resolve(Operand::Box(b)))
                }
            }
        };

        for f in &state.heap_fields {
            let (Some(&base), Some(value)) =
                (inputs.get(f.base), inst(&self.core.facts, f.value))
            else {
                continue;
            };
            self.core.heap.note_field(base, f.class, f.index, value);
        }
        for f in &state.heap_items {
            let (Some(&base), Some(value)) =
                (inputs.get(f.base), inst(&self.core.facts, f.value))
            else {
                continue;
            };
            self.core.heap.note_item(base, f.index, value);
        }
        for &(pos, len) in &state.lengths {
            if let Some(&base) = inputs.get(pos) {
                self.core.heap.note_length(base, len);
            }
        }
        for p in &state.pure_values {
            let args: Option<Vec<Operand>> = p
                .args
                .iter()
                .map(|&a| inst(&self.core.facts, a))
                .collect();
            let Some(args) = args else { continue };
            self.core.pure.seed(PureKey::new(p.opcode, args, p.target), p.value);
        }
    }

    /// Values this run requested to be threaded in from a preamble:
    /// `(preamble box, loop-carried box of this trace)`.
    pub fn threaded_values(&self) -> &[(BoxId, BoxId)] {
        &self.core.threads
    }
}
