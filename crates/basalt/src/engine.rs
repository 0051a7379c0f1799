//! The public engine handle.
//!
//! An [`Engine`] owns the runtime call-out layer, the per-code-unit profiles
//! that back site caches and OSR, and the bookkeeping that spans activations
//! (recursion depth and the exception being handled by the innermost caller).

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::AHashMap;
use serde::Serialize;

use crate::{
    bytecode::{
        vm::{completion_signal, exception_from_value, Resume},
        CodeUnit,
    },
    cell::Cell,
    config::EngineConfig,
    exception_private::{ExcRef, ExcType, RunResult},
    function::Function,
    generator::{GeneratorRef, GeneratorStep},
    inline_cache::CodeProfile,
    namespace::Globals,
    runtime::{DefaultRuntime, Runtime},
    value::Value,
};

/// Counters describing what the adaptive machinery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Transfers from the interpreter into a compiled loop.
    pub osr_entries: u64,
    /// Compiled loop runs that bailed out on a failed guard.
    pub osr_deopts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Sites that were resolved from `Unresolved`, counting re-resolutions.
    pub resolved_sites: u64,
}

/// A profile together with the code unit it describes; the unit is held so
/// its address stays a valid key.
struct ProfileEntry {
    _code: Rc<CodeUnit>,
    profile: Rc<RefCell<CodeProfile>>,
}

/// Executes code units.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use basalt::{CodeBuilder, Engine, EngineConfig, Opcode, Value};
///
/// let mut builder = CodeBuilder::new("f");
/// builder.emit_load_const(Value::Int(1));
/// builder.emit_load_const(Value::Int(2));
/// builder.emit(Opcode::BinaryAdd);
/// builder.emit(Opcode::ReturnValue);
/// let code = Rc::new(builder.build().unwrap());
///
/// let mut engine = Engine::new(EngineConfig::default());
/// assert_eq!(engine.invoke(&code, vec![], vec![]).unwrap(), Value::Int(3));
/// ```
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Box<dyn Runtime>,
    profiles: AHashMap<usize, ProfileEntry>,
    /// Activations currently on the Rust stack.
    pub(crate) depth: usize,
    /// Exception being handled by the activation that made the current call-out.
    pub(crate) context: Option<ExcRef>,
    pub(crate) stats: EngineStats,
}

impl Engine {
    /// An engine over [`DefaultRuntime`].
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runtime(config, DefaultRuntime::new())
    }

    #[must_use]
    pub fn with_runtime(config: EngineConfig, runtime: impl Runtime + 'static) -> Self {
        Self {
            config,
            runtime: Box::new(runtime),
            profiles: AHashMap::new(),
            depth: 0,
            context: None,
            stats: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Runs `code` with a fresh globals namespace.
    ///
    /// `closure` must hold one cell per free variable of `code`. Generator
    /// code units are not run: the result is a new, unstarted generator.
    pub fn invoke(&mut self, code: &Rc<CodeUnit>, args: Vec<Value>, closure: Vec<Rc<Cell>>) -> RunResult<Value> {
        self.invoke_with_globals(code, Rc::new(Globals::new()), args, closure)
    }

    /// Like [`invoke`](Self::invoke), resolving globals in `globals`.
    pub fn invoke_with_globals(
        &mut self,
        code: &Rc<CodeUnit>,
        globals: Rc<Globals>,
        args: Vec<Value>,
        closure: Vec<Rc<Cell>>,
    ) -> RunResult<Value> {
        tracing::debug!(code = code.name(), args = args.len(), "invoke");
        let function = Rc::new(Function::new(Rc::clone(code), globals, Vec::new(), closure)?);
        self.call_function(&function, args)
    }

    /// Calls any callable value: functions, natives, exception types and host objects.
    pub fn call(&mut self, callable: &Value, args: Vec<Value>) -> RunResult<Value> {
        self.call_value(callable, args)
    }

    /// Advances an iterator; `None` once it is exhausted.
    pub fn next_value(&mut self, iterator: &Value) -> RunResult<Option<Value>> {
        match iterator {
            Value::Iterator(iter) => iter.borrow_mut().next_value(),
            Value::Generator(generator) => {
                if generator.borrow().is_finished() {
                    return Ok(None);
                }
                match self.resume_generator(generator, Resume::Send(Value::None))? {
                    GeneratorStep::Yielded(value) => Ok(Some(value)),
                    GeneratorStep::Returned(_) => Ok(None),
                }
            }
            other => Err(ExcType::TypeError.msg(format!("'{}' object is not an iterator", other.type_name()))),
        }
    }

    /// Drains an iterable into a vector.
    pub fn iterate(&mut self, iterable: &Value) -> RunResult<Vec<Value>> {
        let iterator = self.runtime.get_iter(iterable)?;
        let mut items = Vec::new();
        while let Some(item) = self.next_value(&iterator)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Resumes a generator with `value`, reporting a return as a step rather than an error.
    pub fn generator_resume(&mut self, generator: &GeneratorRef, value: Value) -> RunResult<GeneratorStep> {
        self.resume_generator(generator, Resume::Send(value))
    }

    /// `generator.send(value)`: the next yielded value; a return surfaces as
    /// `StopIteration` carrying the returned value.
    pub fn generator_send(&mut self, generator: &GeneratorRef, value: Value) -> RunResult<Value> {
        let kind = generator.borrow().kind();
        match self.resume_generator(generator, Resume::Send(value))? {
            GeneratorStep::Yielded(value) => Ok(value),
            GeneratorStep::Returned(value) => Err(completion_signal(kind, value)),
        }
    }

    /// `generator.throw(exc)`: raises `exc` at the suspension point.
    ///
    /// `exc` may be an exception instance or an exception type.
    pub fn generator_throw(&mut self, generator: &GeneratorRef, exc: Value) -> RunResult<Value> {
        let exc = exception_from_value(&exc)?;
        exc.set_context(None);
        let kind = generator.borrow().kind();
        match self.resume_generator(generator, Resume::Throw(exc))? {
            GeneratorStep::Yielded(value) => Ok(value),
            GeneratorStep::Returned(value) => Err(completion_signal(kind, value)),
        }
    }

    /// `generator.close()`.
    pub fn generator_close(&mut self, generator: &GeneratorRef) -> RunResult<()> {
        self.close_generator(generator)
    }

    /// The shared profile of `code`, created on first execution.
    pub(crate) fn profile_for(&mut self, code: &Rc<CodeUnit>) -> Rc<RefCell<CodeProfile>> {
        let key = Rc::as_ptr(code) as usize;
        let entry = self.profiles.entry(key).or_insert_with(|| ProfileEntry {
            _code: Rc::clone(code),
            profile: Rc::new(RefCell::new(CodeProfile::new(code))),
        });
        Rc::clone(&entry.profile)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("profiles", &self.profiles.len())
            .field("depth", &self.depth)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
