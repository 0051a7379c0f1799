//! The generator resume protocol.
//!
//! A generator's frame is created on first resume and parked in the
//! generator between suspensions. While it runs the frame is owned by the
//! resuming call, and the generator is flagged as running so that a nested
//! resume fails instead of aliasing the frame.

use std::rc::Rc;

use super::{Frame, FrameExit, Resume};
use crate::{
    engine::Engine,
    exception_private::{ErrorKind, ExcRef, ExcType, Exception, RunError, RunResult, TraceEntry},
    generator::{Generator, GeneratorKind, GeneratorRef, GeneratorStep},
    value::Value,
};

impl Engine {
    /// Resumes `generator` with a sent value (`Resume::Send`) or an exception
    /// raised at its suspension point (`Resume::Throw`).
    pub(crate) fn resume_generator(&mut self, generator: &GeneratorRef, resume: Resume) -> RunResult<GeneratorStep> {
        let (kind, function, parked) = {
            let mut state = generator.borrow_mut();
            let kind = state.kind();
            if state.running {
                return Err(already_executing(kind));
            }
            if state.finished {
                return Err(match resume {
                    Resume::Throw(exc) if kind != GeneratorKind::Coroutine => throw_unstarted(&mut state, exc),
                    _ => exhausted(kind),
                });
            }
            if !state.started {
                match &resume {
                    Resume::Send(value) if !value.is_none() => {
                        return Err(ExcType::TypeError.msg(format!(
                            "can't send non-None value to a just-started {}",
                            kind.display_name()
                        )));
                    }
                    Resume::Throw(exc) => return Err(throw_unstarted(&mut state, Rc::clone(exc))),
                    _ => {}
                }
            }
            (kind, Rc::clone(state.function()), state.frame.take())
        };

        if let Err(err) = self.enter_activation() {
            generator.borrow_mut().frame = parked;
            return Err(err);
        }
        let (mut frame, resume) = match parked {
            Some(frame) => (frame, resume),
            None => {
                let args = generator.borrow().fresh_args();
                let profile = self.profile_for(function.code());
                match Frame::new(&function, args, profile) {
                    Ok(frame) => (frame, Resume::Start),
                    Err(err) => {
                        self.depth -= 1;
                        generator.borrow_mut().finish();
                        return Err(err);
                    }
                }
            }
        };
        {
            let mut state = generator.borrow_mut();
            state.running = true;
            state.started = true;
        }
        tracing::trace!(generator = function.name(), "resuming");

        let result = self.run_frame(&mut frame, resume);
        self.depth -= 1;

        let mut state = generator.borrow_mut();
        state.running = false;
        match result {
            Ok(FrameExit::Yield(value)) => {
                state.frame = Some(frame);
                Ok(GeneratorStep::Yielded(value))
            }
            Ok(FrameExit::Return(value)) => {
                tracing::debug!(generator = function.name(), "generator finished");
                state.finish();
                Ok(GeneratorStep::Returned(value))
            }
            Err(err) => {
                state.finish();
                Err(wrap_escaping(kind, err))
            }
        }
    }

    /// Throws `GeneratorExit` in and expects the body to finish.
    pub(crate) fn close_generator(&mut self, generator: &GeneratorRef) -> RunResult<()> {
        {
            let mut state = generator.borrow_mut();
            if state.running {
                return Err(already_executing(state.kind()));
            }
            if !state.started || state.finished {
                state.finish();
                return Ok(());
            }
        }
        let kind = generator.borrow().kind();
        let exit: ExcRef = Rc::new(Exception::new(ExcType::GeneratorExit, None));
        match self.resume_generator(generator, Resume::Throw(exit)) {
            Ok(GeneratorStep::Yielded(_)) => {
                generator.borrow_mut().finish();
                Err(Exception::new(
                    ExcType::RuntimeError,
                    Some(format!("{} ignored GeneratorExit", kind.display_name())),
                )
                .with_kind(ErrorKind::ProtocolViolation)
                .into())
            }
            Ok(GeneratorStep::Returned(_)) => Ok(()),
            Err(RunError::Exc(exc)) if exc.exc_type() == ExcType::GeneratorExit => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Raises `exc` from a generator that is not suspended at a yield, finishing it.
fn throw_unstarted(state: &mut Generator, exc: ExcRef) -> RunError {
    let code = state.function().code();
    exc.push_trace(TraceEntry {
        code_name: code.name_rc(),
        offset: 0,
        line: code.first_line(),
    });
    state.finish();
    RunError::Exc(exc)
}

fn already_executing(kind: GeneratorKind) -> RunError {
    Exception::new(
        ExcType::ValueError,
        Some(format!("{} already executing", kind.display_name())),
    )
    .with_kind(ErrorKind::ReentrancyViolation)
    .into()
}

/// Error for resuming a generator that has already finished.
fn exhausted(kind: GeneratorKind) -> RunError {
    match kind {
        GeneratorKind::Generator => ExcType::StopIteration.bare(),
        GeneratorKind::Coroutine => ExcType::RuntimeError.msg("cannot reuse already awaited coroutine"),
        GeneratorKind::AsyncGenerator => ExcType::StopAsyncIteration.bare(),
    }
}

/// A completion signal escaping the body is turned into a `RuntimeError`
/// caused by it, so it cannot be mistaken for the generator's own completion.
fn wrap_escaping(kind: GeneratorKind, err: RunError) -> RunError {
    let RunError::Exc(exc) = &err else {
        return err;
    };
    let message = match (kind, exc.exc_type()) {
        (_, ExcType::StopIteration) => format!("{} raised StopIteration", kind.display_name()),
        (GeneratorKind::AsyncGenerator, ExcType::StopAsyncIteration) => {
            "async generator raised StopAsyncIteration".to_owned()
        }
        _ => return err,
    };
    let wrapped = Rc::new(Exception::new(ExcType::RuntimeError, Some(message)));
    wrapped.set_context(Some(Rc::clone(exc)));
    Exception::set_cause(&wrapped, Some(Rc::clone(exc)));
    RunError::Exc(wrapped)
}

/// The error a completed generator's return value becomes for `send`/`throw` callers.
pub(crate) fn completion_signal(kind: GeneratorKind, value: Value) -> RunError {
    match kind {
        GeneratorKind::AsyncGenerator => ExcType::StopAsyncIteration.bare(),
        GeneratorKind::Generator | GeneratorKind::Coroutine => ExcType::stop_iteration(value),
    }
}
