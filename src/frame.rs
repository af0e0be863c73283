use std::rc::Rc;

use crate::error::{Error, TraceFrame};
use crate::instance::Instance;
use crate::module::FunctionBody;
use crate::signature::Arity;
use crate::stack::MStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlKind {
    Call,
    Block,
    Loop,
    If,
    /// A `try_table` region; holds the index of its `TryTable` instruction.
    Try(u32),
}

/// Bookkeeping for one open structured region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlFrame {
    pub kind: CtrlKind,
    /// Words carried into the region; a branch to a loop keeps these.
    pub start_values: u32,
    /// Words left behind when the region exits.
    pub end_values: u32,
    /// Operand-stack height below the region's parameters.
    pub height: usize,
}

impl CtrlFrame {
    #[inline]
    pub fn new(kind: CtrlKind, arity: Arity, stack_len: usize) -> Self {
        Self {
            kind,
            start_values: arity.params,
            end_values: arity.results,
            height: stack_len.saturating_sub(arity.params as usize),
        }
    }

    /// Words preserved by a branch that targets this region.
    #[inline]
    pub fn branch_values(&self) -> usize {
        if self.kind == CtrlKind::Loop { self.start_values as usize } else { self.end_values as usize }
    }
}

/// One wasm activation.
pub struct StackFrame {
    pub instance: Rc<Instance>,
    pub func_idx: u32,
    pub body: Rc<FunctionBody>,
    pub pc: usize,
    pub locals: Vec<u64>,
    pub ctrl: Vec<CtrlFrame>,
}

impl StackFrame {
    /// Moves the arguments off the operand stack into the local slots and
    /// zero-fills the declared locals.
    pub fn new(
        instance: Rc<Instance>,
        func_idx: u32,
        body: Rc<FunctionBody>,
        param_words: usize,
        result_words: usize,
        stack: &mut MStack,
    ) -> Result<Self, Error> {
        let mut locals = stack.pop_n(param_words)?;
        for ty in &body.locals {
            for _ in 0..ty.words() {
                locals.push(ty.zero_word());
            }
        }
        let call = CtrlFrame {
            kind: CtrlKind::Call,
            start_values: 0,
            end_values: result_words as u32,
            height: stack.len(),
        };
        Ok(Self { instance, func_idx, body, pc: 0, locals, ctrl: vec![call] })
    }

    pub fn trace(&self) -> TraceFrame {
        TraceFrame { instance: self.instance.id(), func_idx: self.func_idx, pc: self.pc }
    }
}
