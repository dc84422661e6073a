//! Linear traces and their structural validation.

use std::collections::HashSet;
use std::fmt;

use crate::operation::{IrError, Opcode, Operand, Operation};
use crate::value::{BoxFactory, BoxId};

/// A recorded linear trace.
///
/// Bounded by an implicit label declaring the live inputs and a terminal
/// `jump` (back-edge arguments) or `finish`. The optimizer never mutates a
/// trace in place; it always produces a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Boxes declared live at the trace head (the label's arguments)
    pub inputs: Vec<BoxId>,
    /// Operations in recorded order, last one `jump` or `finish`
    pub ops: Vec<Operation>,
}

impl Trace {
    /// Create a trace from parts.
    pub fn new(inputs: Vec<BoxId>, ops: Vec<Operation>) -> Self {
        Self { inputs, ops }
    }

    /// The terminal operation, if the trace is non-empty.
    pub fn terminal(&self) -> Option<&Operation> {
        self.ops.last()
    }

    /// A box factory whose ids start above every box used in this trace.
    pub fn box_factory(&self) -> BoxFactory {
        let mut max = 0u32;
        let mut bump = |b: BoxId| max = max.max(b.0 + 1);
        for &b in &self.inputs {
            bump(b);
        }
        for op in &self.ops {
            if let Some(res) = op.result {
                bump(res);
            }
            for arg in &op.args {
                if let Operand::Box(b) = *arg {
                    bump(b);
                }
            }
        }
        BoxFactory::starting_at(max)
    }

    /// Structural sanity check.
    ///
    /// Verifies that every box has a single definition, that no box is
    /// used before it is defined, that the trace ends in `jump` or
    /// `finish` with no operations after it, and that frame markers are
    /// balanced. Violations abort the compilation attempt.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut defined: HashSet<BoxId> = HashSet::new();
        for &input in &self.inputs {
            if !defined.insert(input) {
                return Err(IrError::MalformedTrace(format!(
                    "input {} declared twice",
                    input
                )));
            }
        }

        let terminal = match self.ops.last() {
            Some(op) if op.opcode.is_terminal() => op,
            Some(op) => {
                return Err(IrError::MalformedTrace(format!(
                    "trace ends in {:?}, not jump/finish",
                    op.opcode
                )))
            }
            None => return Err(IrError::MalformedTrace("empty trace".to_string())),
        };
        let _ = terminal;

        let mut open_frames: u32 = 0;
        for (pos, op) in self.ops.iter().enumerate() {
            if op.opcode.is_terminal() && pos + 1 != self.ops.len() {
                return Err(IrError::MalformedTrace(format!(
                    "{:?} at position {} is not the last operation",
                    op.opcode, pos
                )));
            }
            for arg in &op.args {
                if let Operand::Box(b) = *arg {
                    if !defined.contains(&b) {
                        return Err(IrError::MalformedTrace(format!(
                            "{} used at position {} before definition",
                            b, pos
                        )));
                    }
                }
            }
            if let Some(res) = op.result {
                if !defined.insert(res) {
                    return Err(IrError::MalformedTrace(format!(
                        "{} defined twice (position {})",
                        res, pos
                    )));
                }
            }
            match op.opcode {
                Opcode::EnterFrame => open_frames += 1,
                Opcode::LeaveFrame => {
                    open_frames = open_frames.checked_sub(1).ok_or_else(|| {
                        IrError::MalformedTrace(format!(
                            "leave_frame at position {} without a matching enter_frame",
                            pos
                        ))
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label(")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", input)?;
        }
        writeln!(f, ")")?;
        for op in &self.ops {
            writeln!(f, "  {}", op)?;
        }
        Ok(())
    }
}
