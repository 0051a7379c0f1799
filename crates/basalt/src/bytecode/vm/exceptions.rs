//! Unwinding, raising and exception construction.

use std::rc::Rc;

use super::{frame::Handled, ActivationState, Frame};
use crate::{
    engine::Engine,
    exception_private::{ExcRef, ExcType, Exception, RunError, RunResult},
    value::Value,
};

impl Engine {
    /// Routes `err` to the innermost handler covering the faulting offset.
    ///
    /// On a match the stack is cut back to the range's recorded depth, the
    /// exception is pushed for the handler and control resumes there; `Ok`
    /// is returned. Otherwise the error is handed back for the caller.
    pub(super) fn unwind(&mut self, frame: &mut Frame, err: RunError) -> RunResult<()> {
        let RunError::Exc(exc) = err else {
            return Err(err);
        };
        frame.state = ActivationState::Unwinding;
        if exc.context().is_none() {
            Exception::chain_context(&exc, frame.current_handled().as_ref());
        }
        exc.push_trace(frame.trace_entry());

        let Some(range) = frame.code.exception_table().find(frame.instr_pc).copied() else {
            tracing::trace!(code = frame.code.name(), offset = frame.instr_pc, exc = %exc, "exception leaves frame");
            frame.state = ActivationState::Propagating;
            frame.error_offset = Some(frame.instr_pc);
            frame.handled.clear();
            return Err(RunError::Exc(exc));
        };

        // a catch by a range enclosing a handler's own try region leaves that
        // handler and every handler entered after it
        if let Some(left) = frame.handled.iter().position(|handled| range.encloses(&handled.range)) {
            frame.handled.truncate(left);
        }
        frame.stack.truncate(usize::from(range.stack_depth));
        frame.push(Value::Exception(Rc::clone(&exc)))?;
        tracing::debug!(
            code = frame.code.name(),
            offset = frame.instr_pc,
            handler = range.handler,
            exc = %exc,
            "dispatching to handler"
        );
        frame.handled.push(Handled { exc, range });
        frame.pc = range.handler as usize;
        frame.state = ActivationState::HandlerRunning;
        Ok(())
    }

    /// `raise exc from cause`; returns the error to raise.
    pub(super) fn raise_from(&mut self, frame: &Frame, value: &Value, cause: &Value) -> RunResult<RunError> {
        let exc = exception_from_value(value)?;
        let cause = match cause {
            Value::None => None,
            other => Some(exception_from_value(other)?),
        };
        Exception::set_cause(&exc, cause);
        Exception::chain_context(&exc, frame.current_handled().as_ref());
        Ok(RunError::Exc(exc))
    }
}

/// The exception a `raise` operand denotes: an instance, or a type to instantiate.
pub(crate) fn exception_from_value(value: &Value) -> RunResult<ExcRef> {
    match value {
        Value::Exception(exc) => Ok(Rc::clone(exc)),
        Value::ExcType(exc_type) => Ok(Rc::new(Exception::new(*exc_type, None))),
        _ => Err(ExcType::TypeError.msg("exceptions must derive from BaseException")),
    }
}

/// Calls an exception type: `StopIteration(v)` carries `v`, other types take
/// their first argument as the message.
pub(crate) fn instantiate(exc_type: ExcType, args: Vec<Value>) -> Exception {
    let mut args = args.into_iter();
    match (args.next(), args.len()) {
        (None, _) => Exception::new(exc_type, None),
        (Some(payload), 0) if exc_type == ExcType::StopIteration => Exception::with_payload(exc_type, payload),
        (Some(Value::Str(message)), 0) => Exception::new(exc_type, Some(message.to_string())),
        (Some(first), 0) => Exception::new(exc_type, Some(first.repr())),
        (Some(first), _) => {
            let items: Vec<Value> = std::iter::once(first).chain(args).collect();
            Exception::new(exc_type, Some(Value::tuple(items).repr()))
        }
    }
}
