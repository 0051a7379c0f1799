//! The interpreter loop.
//!
//! Each activation runs in its own invocation of [`Engine::run_frame`]: calls
//! recurse on the Rust stack, bounded by the configured recursion depth.
//! Errors raised by an instruction unwind through the code unit's handler
//! table; if no range covers the faulting offset the error leaves the
//! activation and the caller's loop repeats the lookup at its call site.
//!
//! Submodules group the opcode families:
//! - `binary` - operators and their per-site caches
//! - `call` - calls, function creation and recursion accounting
//! - `collections` - container builds and sequence unpacking
//! - `exceptions` - unwinding, raising and exception matching
//! - `generator` - the send/throw/close protocol
//! - `names` - global, attribute and import access

mod binary;
mod call;
mod collections;
mod exceptions;
mod frame;
mod generator;
mod names;

use std::rc::Rc;

pub(crate) use exceptions::exception_from_value;
use frame::ActivationState;
pub(crate) use frame::Frame;
pub(crate) use generator::completion_signal;

use crate::{
    builtins,
    bytecode::Opcode,
    engine::Engine,
    exception_private::{ExcRef, ExcType, Exception, RunError, RunResult},
    osr::{CompiledLoop, OsrExit, OsrTransfer},
    value::Value,
};

/// How an activation is (re)entered.
#[derive(Debug)]
pub(crate) enum Resume {
    /// Start from offset 0.
    Start,
    /// Continue a suspended activation; the value becomes the result of its yield.
    Send(Value),
    /// Continue a suspended activation by raising at its yield point.
    Throw(ExcRef),
}

/// How an activation left the loop without raising.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value),
}

/// Fetches a u8 operand, advancing the frame's pc.
macro_rules! fetch_u8 {
    ($bytes:expr, $frame:expr) => {{
        let byte = $bytes[$frame.pc];
        $frame.pc += 1;
        byte
    }};
}

/// Fetches an i8 operand.
macro_rules! fetch_i8 {
    ($bytes:expr, $frame:expr) => {{
        i8::from_le_bytes([fetch_u8!($bytes, $frame)])
    }};
}

/// Fetches a u16 operand (little-endian).
macro_rules! fetch_u16 {
    ($bytes:expr, $frame:expr) => {{
        let value = u16::from_le_bytes([$bytes[$frame.pc], $bytes[$frame.pc + 1]]);
        $frame.pc += 2;
        value
    }};
}

/// Fetches an i16 operand (little-endian).
macro_rules! fetch_i16 {
    ($bytes:expr, $frame:expr) => {{
        let value = i16::from_le_bytes([$bytes[$frame.pc], $bytes[$frame.pc + 1]]);
        $frame.pc += 2;
        value
    }};
}

/// Applies a forward or backward offset, measured from the end of the
/// current instruction, to the frame's pc.
macro_rules! jump_relative {
    ($frame:expr, $offset:expr) => {{
        $frame.pc = $frame.pc.wrapping_add_signed(isize::from($offset));
    }};
}

impl Engine {
    /// Runs `frame` until it returns or yields.
    ///
    /// Raised exceptions that no handler of this activation covers come back
    /// as `Err`; internal errors are never offered to handlers.
    pub(crate) fn run_frame(&mut self, frame: &mut Frame, resume: Resume) -> RunResult<FrameExit> {
        frame.inherited = self.context.clone();
        match resume {
            Resume::Start => {}
            Resume::Send(value) => frame.push(value)?,
            Resume::Throw(exc) => self.unwind(frame, RunError::Exc(exc))?,
        }
        loop {
            match self.execute(frame) {
                Ok(exit) => return Ok(exit),
                Err(err) => {
                    if let Err(err) = self.unwind(frame, err) {
                        tracing::trace!(
                            code = frame.code.name(),
                            state = ?frame.state,
                            offset = ?frame.error_offset,
                            "activation unwound"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    /// The dispatch loop proper; every failing instruction returns `Err`
    /// with `frame.instr_pc` still pointing at it.
    #[expect(clippy::too_many_lines)]
    fn execute(&mut self, frame: &mut Frame) -> RunResult<FrameExit> {
        let code = Rc::clone(&frame.code);
        let bytes = code.bytecode();

        loop {
            frame.instr_pc = frame.pc;
            let opcode = Opcode::try_from(fetch_u8!(bytes, frame))
                .map_err(|err| RunError::internal(format!("{err} at offset {}", frame.instr_pc)))?;

            match opcode {
                // Stack
                Opcode::Pop => {
                    frame.pop()?;
                }
                Opcode::Dup => {
                    let value = frame.peek()?.clone();
                    frame.push(value)?;
                }
                Opcode::DupTwo => {
                    let second = frame.peek_at(1)?.clone();
                    let top = frame.peek()?.clone();
                    frame.push(second)?;
                    frame.push(top)?;
                }
                Opcode::Rot2 => frame.rotate_top(2)?,
                Opcode::Rot3 => frame.rotate_top(3)?,
                Opcode::Rot4 => frame.rotate_top(4)?,
                Opcode::Nop => {}

                // Constants
                Opcode::LoadConst => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(code.constant(usize::from(index)).clone())?;
                }
                Opcode::LoadNone => frame.push(Value::None)?,
                Opcode::LoadTrue => frame.push(Value::Bool(true))?,
                Opcode::LoadFalse => frame.push(Value::Bool(false))?,
                Opcode::LoadSmallInt => {
                    let value = fetch_i8!(bytes, frame);
                    frame.push(Value::Int(i64::from(value)))?;
                }
                Opcode::LoadInt => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(Value::Int(code.int(usize::from(index))))?;
                }
                Opcode::LoadFloat => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(Value::Float(code.float(usize::from(index))))?;
                }
                Opcode::LoadBigInt => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(code.big_int(usize::from(index)).clone())?;
                }
                Opcode::LoadStr => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(code.string(usize::from(index)).clone())?;
                }
                Opcode::LoadBytes => {
                    let index = fetch_u16!(bytes, frame);
                    frame.push(code.bytes(usize::from(index)).clone())?;
                }

                // Locals and cells
                Opcode::LoadLocal => {
                    let slot = fetch_u8!(bytes, frame);
                    let value = frame.load_local(usize::from(slot))?;
                    frame.push(value)?;
                }
                Opcode::LoadLocalW => {
                    let slot = fetch_u16!(bytes, frame);
                    let value = frame.load_local(usize::from(slot))?;
                    frame.push(value)?;
                }
                Opcode::StoreLocal => {
                    let slot = fetch_u8!(bytes, frame);
                    let value = frame.pop()?;
                    frame.store_local(usize::from(slot), value)?;
                }
                Opcode::StoreLocalW => {
                    let slot = fetch_u16!(bytes, frame);
                    let value = frame.pop()?;
                    frame.store_local(usize::from(slot), value)?;
                }
                Opcode::DeleteLocal => {
                    let slot = fetch_u16!(bytes, frame);
                    frame.delete_local(usize::from(slot))?;
                }
                Opcode::LoadDeref => {
                    let index = fetch_u16!(bytes, frame);
                    let value = frame.load_deref(usize::from(index))?;
                    frame.push(value)?;
                }
                Opcode::StoreDeref => {
                    let index = fetch_u16!(bytes, frame);
                    let value = frame.pop()?;
                    frame.deref(usize::from(index))?.set(value);
                }
                Opcode::DeleteDeref => {
                    let index = usize::from(fetch_u16!(bytes, frame));
                    if !frame.deref(index)?.clear() {
                        return Err(frame.unbound_deref(index));
                    }
                }
                Opcode::LoadClosure => {
                    let index = fetch_u16!(bytes, frame);
                    let cell = Rc::clone(frame.deref(usize::from(index))?);
                    frame.push(Value::Cell(cell))?;
                }

                // Globals
                Opcode::LoadGlobal | Opcode::LoadName => {
                    let index = fetch_u16!(bytes, frame);
                    let value = self.load_global(frame, usize::from(index))?;
                    frame.push(value)?;
                }
                Opcode::StoreGlobal | Opcode::StoreName => {
                    let index = fetch_u16!(bytes, frame);
                    let value = frame.pop()?;
                    frame.globals.set(code.name_at(usize::from(index)), value);
                }
                Opcode::DeleteGlobal | Opcode::DeleteName => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    if frame.globals.remove(name).is_none() {
                        return Err(ExcType::name_error(name));
                    }
                }

                // Operators
                Opcode::BinaryAdd
                | Opcode::BinarySub
                | Opcode::BinaryMul
                | Opcode::BinaryDiv
                | Opcode::BinaryFloorDiv
                | Opcode::BinaryMod
                | Opcode::BinaryPow
                | Opcode::BinaryAnd
                | Opcode::BinaryOr
                | Opcode::BinaryXor
                | Opcode::BinaryLShift
                | Opcode::BinaryRShift => self.binary(frame, opcode)?,
                Opcode::CompareEq
                | Opcode::CompareNe
                | Opcode::CompareLt
                | Opcode::CompareLe
                | Opcode::CompareGt
                | Opcode::CompareGe => self.compare(frame, opcode)?,
                Opcode::CompareIs | Opcode::CompareIsNot => {
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    frame.push(Value::Bool(lhs.is(&rhs) == (opcode == Opcode::CompareIs)))?;
                }
                Opcode::CompareIn | Opcode::CompareNotIn => {
                    let container = frame.pop()?;
                    let needle = frame.pop()?;
                    let found = self.runtime.contains(&container, &needle)?;
                    frame.push(Value::Bool(found == (opcode == Opcode::CompareIn)))?;
                }
                Opcode::UnaryNot => {
                    let value = frame.pop()?;
                    let truth = self.truthy(&value)?;
                    frame.push(Value::Bool(!truth))?;
                }
                Opcode::UnaryNeg | Opcode::UnaryPos | Opcode::UnaryInvert => self.unary(frame, opcode)?,

                // Containers
                Opcode::BuildList => {
                    let count = fetch_u16!(bytes, frame);
                    let items = frame.pop_n(usize::from(count))?;
                    frame.push(Value::list(items))?;
                }
                Opcode::BuildTuple => {
                    let count = fetch_u16!(bytes, frame);
                    let items = frame.pop_n(usize::from(count))?;
                    frame.push(Value::tuple(items))?;
                }
                Opcode::BuildDict => {
                    let count = fetch_u16!(bytes, frame);
                    self.build_dict(frame, usize::from(count))?;
                }
                Opcode::BuildSet => {
                    let count = fetch_u16!(bytes, frame);
                    self.build_set(frame, usize::from(count))?;
                }
                Opcode::UnpackSequence => {
                    let count = fetch_u8!(bytes, frame);
                    self.unpack_sequence(frame, usize::from(count))?;
                }

                // Items and attributes
                Opcode::BinarySubscr => {
                    let key = frame.pop()?;
                    let obj = frame.pop()?;
                    let value = self.runtime.get_item(&obj, &key)?;
                    frame.push(value)?;
                }
                Opcode::StoreSubscr => {
                    let key = frame.pop()?;
                    let obj = frame.pop()?;
                    let value = frame.pop()?;
                    self.runtime.set_item(&obj, &key, value)?;
                }
                Opcode::DeleteSubscr => {
                    let key = frame.pop()?;
                    let obj = frame.pop()?;
                    self.runtime.del_item(&obj, &key)?;
                }
                Opcode::LoadAttr => {
                    let index = fetch_u16!(bytes, frame);
                    let obj = frame.pop()?;
                    let value = self.load_attr(frame, &obj, usize::from(index))?;
                    frame.push(value)?;
                }
                Opcode::StoreAttr => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    let obj = frame.pop()?;
                    let value = frame.pop()?;
                    self.runtime.set_attr(&obj, name, value)?;
                }
                Opcode::DeleteAttr => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    let obj = frame.pop()?;
                    self.runtime.del_attr(&obj, name)?;
                }

                // Control flow
                Opcode::Jump => {
                    let offset = fetch_i16!(bytes, frame);
                    jump_relative!(frame, offset);
                }
                Opcode::JumpBackward => {
                    let distance = fetch_u16!(bytes, frame);
                    self.back_edge(frame, usize::from(distance))?;
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let offset = fetch_i16!(bytes, frame);
                    let value = frame.pop()?;
                    if self.truthy(&value)? == (opcode == Opcode::JumpIfTrue) {
                        jump_relative!(frame, offset);
                    }
                }
                Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                    let offset = fetch_i16!(bytes, frame);
                    let truth = self.truthy(frame.peek()?)?;
                    if truth == (opcode == Opcode::JumpIfTrueOrPop) {
                        jump_relative!(frame, offset);
                    } else {
                        frame.pop()?;
                    }
                }

                // Iteration
                Opcode::GetIter => {
                    let value = frame.pop()?;
                    let iter = self.runtime.get_iter(&value)?;
                    frame.push(iter)?;
                }
                Opcode::ForIter => {
                    let offset = fetch_i16!(bytes, frame);
                    let iter = frame.peek()?.clone();
                    match self.with_context(frame, |engine| engine.next_value(&iter))? {
                        Some(item) => frame.push(item)?,
                        None => {
                            frame.pop()?;
                            jump_relative!(frame, offset);
                        }
                    }
                }

                // Calls
                Opcode::CallFunction0 => self.call_from_stack(frame, 0)?,
                Opcode::CallFunction1 => self.call_from_stack(frame, 1)?,
                Opcode::CallFunction2 => self.call_from_stack(frame, 2)?,
                Opcode::CallFunction3 => self.call_from_stack(frame, 3)?,
                Opcode::CallFunction4 => self.call_from_stack(frame, 4)?,
                Opcode::CallFunction => {
                    let argc = fetch_u8!(bytes, frame);
                    self.call_from_stack(frame, usize::from(argc))?;
                }
                Opcode::CallFunctionVarargs => self.call_varargs(frame)?,
                Opcode::CallMethod => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    let argc = fetch_u8!(bytes, frame);
                    self.call_method(frame, name, usize::from(argc))?;
                }
                Opcode::MakeFunction => {
                    let index = fetch_u16!(bytes, frame);
                    let flags = fetch_u8!(bytes, frame);
                    self.make_function(frame, usize::from(index), flags)?;
                }

                // Exceptions
                Opcode::Raise => {
                    let value = frame.pop()?;
                    let exc = exception_from_value(&value)?;
                    Exception::chain_context(&exc, frame.current_handled().as_ref());
                    return Err(RunError::Exc(exc));
                }
                Opcode::RaiseFrom => {
                    let cause = frame.pop()?;
                    let value = frame.pop()?;
                    return Err(self.raise_from(frame, &value, &cause)?);
                }
                Opcode::Reraise => {
                    return Err(match frame.handled.last() {
                        Some(handled) => RunError::Exc(Rc::clone(&handled.exc)),
                        None => ExcType::RuntimeError.msg("No active exception to reraise"),
                    });
                }
                Opcode::CheckExcMatch => {
                    let classinfo = frame.pop()?;
                    let Value::Exception(exc) = frame.peek()? else {
                        return Err(RunError::internal("CheckExcMatch without an exception on the stack"));
                    };
                    let matched = builtins::matches_classinfo(exc.exc_type(), &classinfo)?;
                    frame.push(Value::Bool(matched))?;
                }
                Opcode::PopExcept => {
                    if frame.handled.pop().is_none() {
                        return Err(RunError::internal("PopExcept without an active handler"));
                    }
                    frame.state = if frame.handled.is_empty() {
                        ActivationState::Running
                    } else {
                        ActivationState::HandlerRunning
                    };
                }
                Opcode::LoadAssertionError => frame.push(Value::ExcType(ExcType::AssertionError))?,

                // Exits
                Opcode::ReturnValue => return Ok(FrameExit::Return(frame.pop()?)),
                Opcode::ReturnNone => return Ok(FrameExit::Return(Value::None)),
                Opcode::Yield => return Ok(FrameExit::Yield(frame.pop()?)),

                // Imports
                Opcode::ImportName => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    let module = self.runtime.import(name)?;
                    frame.push(module)?;
                }
                Opcode::ImportFrom => {
                    let name = code.name_at(usize::from(fetch_u16!(bytes, frame)));
                    let value = self.import_from(frame.peek()?, name)?;
                    frame.push(value)?;
                }
            }
        }
    }

    /// Truthiness with the bool case inlined.
    fn truthy(&self, value: &Value) -> RunResult<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => self.runtime.is_true(other),
        }
    }

    /// Runs `f` with the frame's active exception as the context of anything
    /// raised by nested activations.
    pub(crate) fn with_context<T>(&mut self, frame: &Frame, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::replace(&mut self.context, frame.current_handled());
        let result = f(self);
        self.context = saved;
        result
    }

    /// Back-edge handling: jumps to the loop header and polls OSR.
    fn back_edge(&mut self, frame: &mut Frame, distance: usize) -> RunResult<()> {
        let back_edge = frame.instr_pc;
        let header = back_edge
            .checked_sub(distance)
            .ok_or_else(|| RunError::internal("backward jump before the start of the code"))?;
        frame.pc = header;

        let Some(threshold) = self.config.osr_threshold else {
            return Ok(());
        };
        let (header_key, back_edge_key) = match (u32::try_from(header), u32::try_from(back_edge)) {
            (Ok(h), Ok(b)) => (h, b),
            _ => return Ok(()),
        };

        let entry = {
            let mut profile = frame.profile.borrow_mut();
            let decision = profile.loop_info(header_key, back_edge_key).record_iteration(threshold);
            if decision.should_compile() {
                let compiled = CompiledLoop::compile(
                    &frame.code,
                    header,
                    back_edge,
                    frame.stack.len(),
                    self.runtime.primitive_fast_paths(),
                );
                match compiled {
                    Ok(compiled) => {
                        tracing::debug!(code = frame.code.name(), header, back_edge, "compiled hot loop");
                        let compiled = Rc::new(compiled);
                        profile.loop_info(header_key, back_edge_key).mark_ready();
                        profile.add_compiled_loop(Rc::clone(&compiled));
                        Some(compiled)
                    }
                    Err(reason) => {
                        tracing::debug!(code = frame.code.name(), header, ?reason, "loop not compiled");
                        profile.loop_info(header_key, back_edge_key).mark_failed();
                        None
                    }
                }
            } else if decision.can_enter() {
                profile.compiled_loop(header_key)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        if entry.entry_depth() != frame.stack.len() {
            return Ok(());
        }

        self.stats.osr_entries += 1;
        let transfer = OsrTransfer {
            entry_pc: header_key,
            entry,
        };
        match transfer.enter(frame)? {
            OsrExit::Exit { pc } => {
                tracing::trace!(code = frame.code.name(), pc, "left compiled loop");
            }
            OsrExit::Deopt { pc } => {
                tracing::debug!(code = frame.code.name(), pc, "compiled loop deoptimized");
                self.stats.osr_deopts += 1;
                frame
                    .profile
                    .borrow_mut()
                    .loop_info(header_key, back_edge_key)
                    .record_deopt();
            }
        }
        Ok(())
    }
}
