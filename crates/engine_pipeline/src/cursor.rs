//! Position within a built schedule.

use serde::Serialize;

use crate::pipeline::PipelineOp;

/// Where a pipeline is in its schedule.
///
/// `At { op, index }` names the op being executed and an index into the
/// flattened system list. Between ops the main thread leaves the cursor at
/// the last system that ran; [`Cursor::next_system`] moves it past that
/// system, into the next op when the current one is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Cursor {
    /// Nothing ran yet. The next advance lands on the first system.
    #[default]
    NotStarted,
    At {
        op: usize,
        index: usize,
    },
    /// Every op ran.
    Finished,
}

impl Cursor {
    /// Cursor at the first system of `ops`.
    #[must_use]
    pub fn start(ops: &[PipelineOp]) -> Self {
        match ops.first() {
            Some(first) => Cursor::At {
                op: 0,
                index: first.offset,
            },
            None => Cursor::Finished,
        }
    }

    /// Advance past the current system.
    pub fn next_system(&mut self, ops: &[PipelineOp]) {
        *self = match *self {
            Cursor::NotStarted => Cursor::start(ops),
            Cursor::Finished => Cursor::Finished,
            Cursor::At { op, index } => {
                let index = index + 1;
                let current = &ops[op];
                if index < current.offset + current.count {
                    Cursor::At { op, index }
                } else if op + 1 < ops.len() {
                    Cursor::At { op: op + 1, index }
                } else {
                    Cursor::Finished
                }
            }
        };
    }

    /// The op the cursor is in, if any.
    #[must_use]
    pub fn op(&self) -> Option<usize> {
        match self {
            Cursor::At { op, .. } => Some(*op),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Cursor::Finished)
    }
}
