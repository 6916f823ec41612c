//! The three interpreter stacks: operands, labels and call frames.
//!
//! Conceptually one machine stack partitioned by label and frame markers;
//! labels snapshot the operand height they were entered at so branches can
//! truncate back to it, and frames snapshot the label depth so returns can
//! unwind the labels of the current call only.

use std::sync::Arc;

use crate::error::TrapCode;
use crate::func::{FuncBody, FuncRef};
use crate::instance::{ModuleInstance, TagRef};
use crate::value::{FromValue, Value};

/// The operand stack, capped by configuration.
pub(crate) struct ValueStack {
    values: Vec<Value>,
    limit: usize,
}

impl ValueStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            values: Vec::with_capacity(1024.min(limit)),
            limit,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn push(&mut self, value: Value) -> Result<(), TrapCode> {
        if self.values.len() >= self.limit {
            return Err(TrapCode::StackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.values
            .pop()
            .expect("validation keeps the operand stack non-empty here")
    }

    /// Pops a typed operand; validation proved the type.
    pub(crate) fn pop_as<T: FromValue>(&mut self) -> T {
        self.pop()
            .try_into()
            .expect("validation proved the operand type")
    }

    pub(crate) fn peek(&self) -> &Value {
        self.values
            .last()
            .expect("validation keeps the operand stack non-empty here")
    }

    /// Removes the operands of a returning scope: keeps the top `keep`
    /// values and truncates everything above `height` below them.
    pub(crate) fn truncate_keep(&mut self, height: usize, keep: usize) {
        let len = self.values.len();
        debug_assert!(len >= keep && len - keep >= height);
        self.values.drain(height..len - keep);
    }

    /// Pops the top `count` values in stack order (deepest first).
    pub(crate) fn pop_n(&mut self, count: usize) -> Vec<Value> {
        let at = self.values.len() - count;
        self.values.split_off(at)
    }

    pub(crate) fn push_n(&mut self, values: Vec<Value>) -> Result<(), TrapCode> {
        for value in values {
            self.push(value)?;
        }
        Ok(())
    }
}

/// What kind of structured scope a label belongs to.
#[derive(Debug)]
pub(crate) enum LabelKind {
    Block,
    Loop,
    If,
    /// A `try` scope; `try_pc` finds the catch clauses in the jump table.
    Try { try_pc: u32 },
    /// A catch arm currently handling `exception` (for `rethrow`).
    Catch { exception: Exception },
}

/// One entry of the label stack.
#[derive(Debug)]
pub(crate) struct Label {
    /// Number of values a branch to this label carries.
    pub arity: usize,
    /// Branch target: the loop head, or one past the matching `end`.
    pub target: u32,
    /// Operand height at scope entry (block parameters already below it).
    pub height: usize,
    pub kind: LabelKind,
}

/// A thrown exception traveling up the stacks.
#[derive(Debug)]
pub(crate) struct Exception {
    pub tag: TagRef,
    pub values: Vec<Value>,
}

/// One call frame.
pub(crate) struct Frame {
    pub func: FuncRef,
    /// The defining module; resolves all module-relative indices.
    pub module: Arc<ModuleInstance>,
    pub body: Arc<FuncBody>,
    pub locals: Vec<Value>,
    pub pc: usize,
    pub return_arity: usize,
    /// Label depth at frame entry.
    pub label_base: usize,
    /// Operand height at frame entry, after the arguments were consumed.
    pub height: usize,
}

/// The frame stack, capped by configuration.
pub(crate) struct CallStack {
    frames: Vec<Frame>,
    limit: usize,
}

impl CallStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, frame: Frame) -> Result<(), TrapCode> {
        if self.frames.len() >= self.limit {
            return Err(TrapCode::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn top(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("the call stack holds the active frame")
    }

    pub(crate) fn peek(&self) -> &Frame {
        self.frames
            .last()
            .expect("the call stack holds the active frame")
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}
