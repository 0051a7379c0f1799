//! Per-activation storage.

use std::{cell::RefCell, rc::Rc};

use crate::{
    bytecode::{CodeUnit, ExceptionRange},
    cell::Cell,
    exception_private::{ExcRef, ExcType, InternalError, RunResult, TraceEntry},
    function::Function,
    inline_cache::CodeProfile,
    namespace::Globals,
    value::Value,
};

/// Where an activation is in the unwinding state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationState {
    Running,
    /// An exception was raised and a handler is being looked up.
    Unwinding,
    /// Control is inside a handler body.
    HandlerRunning,
    /// No handler matched; the exception is leaving this activation.
    Propagating,
}

/// An exception entered by a handler that has not yet executed `PopExcept`.
#[derive(Debug, Clone)]
pub(crate) struct Handled {
    pub exc: ExcRef,
    /// The range that dispatched to the handler. A later catch by a range
    /// enclosing it means control has left the handler body.
    pub range: ExceptionRange,
}

/// Mutable storage of one activation.
///
/// Slots are split into locals, derefs (the code unit's cells followed by its
/// free variables) and the operand stack, whose length never exceeds the code
/// unit's declared stack size.
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Rc<CodeUnit>,
    pub globals: Rc<Globals>,
    pub profile: Rc<RefCell<CodeProfile>>,
    pub locals: Vec<Option<Value>>,
    pub derefs: Vec<Rc<Cell>>,
    pub stack: Vec<Value>,
    /// Offset of the next instruction to fetch.
    pub pc: usize,
    /// Offset of the instruction currently executing; errors are attributed to it.
    pub instr_pc: usize,
    pub handled: Vec<Handled>,
    /// Exception the caller was handling when this activation was (re)entered.
    pub inherited: Option<ExcRef>,
    pub state: ActivationState,
    /// Offset at which an exception last propagated out of this activation.
    pub error_offset: Option<usize>,
}

impl Frame {
    /// Sets up an activation of `function` with already bound arguments.
    pub fn new(function: &Function, args: Vec<Value>, profile: Rc<RefCell<CodeProfile>>) -> RunResult<Self> {
        let code = Rc::clone(function.code());
        let mut locals: Vec<Option<Value>> = vec![None; code.local_names().len()];
        if args.len() > locals.len() {
            return Err(InternalError::Malformed("more arguments than local slots".into()).into());
        }
        for (slot, arg) in locals.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        let mut derefs: Vec<Rc<Cell>> = Vec::with_capacity(code.cell_names().len() + code.free_names().len());
        derefs.extend(code.cell_names().iter().map(|_| Rc::new(Cell::unbound())));
        for &(cell, param) in code.cell_args() {
            if let (Some(cell), Some(Some(value))) = (derefs.get(usize::from(cell)), locals.get(usize::from(param))) {
                cell.set(value.clone());
            }
        }
        derefs.extend(function.closure().iter().cloned());

        Ok(Self {
            stack: Vec::with_capacity(code.stack_size()),
            globals: Rc::clone(function.globals()),
            code,
            profile,
            locals,
            derefs,
            pc: 0,
            instr_pc: 0,
            handled: Vec::new(),
            inherited: None,
            state: ActivationState::Running,
            error_offset: None,
        })
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= self.code.stack_size() {
            return Err(InternalError::StackOverflow {
                code: self.code.name_rc(),
                offset: self.instr_pc,
            }
            .into());
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> RunResult<Value> {
        self.stack.pop().ok_or_else(|| self.underflow())
    }

    #[inline]
    pub fn peek(&self) -> RunResult<&Value> {
        self.stack.last().ok_or_else(|| self.underflow())
    }

    /// The value `depth` slots below the top; `peek_at(0)` is the top.
    #[inline]
    pub fn peek_at(&self, depth: usize) -> RunResult<&Value> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(|| self.underflow())
    }

    /// Pops `count` values, returned in push order.
    pub fn pop_n(&mut self, count: usize) -> RunResult<Vec<Value>> {
        let start = self.stack.len().checked_sub(count).ok_or_else(|| self.underflow())?;
        Ok(self.stack.split_off(start))
    }

    /// Rotates the top `count` values so the top moves to the bottom of the group.
    pub fn rotate_top(&mut self, count: usize) -> RunResult<()> {
        let start = self.stack.len().checked_sub(count).ok_or_else(|| self.underflow())?;
        self.stack[start..].rotate_right(1);
        Ok(())
    }

    fn underflow(&self) -> crate::RunError {
        InternalError::StackUnderflow {
            code: self.code.name_rc(),
            offset: self.instr_pc,
        }
        .into()
    }

    pub fn load_local(&self, slot: usize) -> RunResult<Value> {
        match self.locals.get(slot) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(ExcType::unbound_local(&self.code.local_names()[slot])),
            None => Err(InternalError::Malformed("local slot out of range".into()).into()),
        }
    }

    pub fn store_local(&mut self, slot: usize, value: Value) -> RunResult<()> {
        let target = self
            .locals
            .get_mut(slot)
            .ok_or_else(|| InternalError::Malformed("local slot out of range".into()))?;
        *target = Some(value);
        Ok(())
    }

    pub fn delete_local(&mut self, slot: usize) -> RunResult<()> {
        match self.locals.get_mut(slot) {
            Some(target @ Some(_)) => {
                *target = None;
                Ok(())
            }
            Some(None) => Err(ExcType::unbound_local(&self.code.local_names()[slot])),
            None => Err(InternalError::Malformed("local slot out of range".into()).into()),
        }
    }

    pub fn deref(&self, index: usize) -> RunResult<&Rc<Cell>> {
        self.derefs
            .get(index)
            .ok_or_else(|| InternalError::Malformed("cell index out of range".into()).into())
    }

    /// Reads a cell or free variable, distinguishing the two in the unbound error.
    pub fn load_deref(&self, index: usize) -> RunResult<Value> {
        self.deref(index)?.get().ok_or_else(|| self.unbound_deref(index))
    }

    pub fn unbound_deref(&self, index: usize) -> crate::RunError {
        let name = self.code.deref_name(index);
        if index < self.code.cell_names().len() {
            ExcType::unbound_local(name)
        } else {
            ExcType::free_variable(name)
        }
    }

    /// The exception a raise at this point would be chained to.
    pub fn current_handled(&self) -> Option<ExcRef> {
        self.handled
            .last()
            .map(|handled| Rc::clone(&handled.exc))
            .or_else(|| self.inherited.clone())
    }

    pub fn trace_entry(&self) -> TraceEntry {
        TraceEntry {
            code_name: self.code.name_rc(),
            offset: self.instr_pc,
            line: self.code.line_for(self.instr_pc),
        }
    }
}
