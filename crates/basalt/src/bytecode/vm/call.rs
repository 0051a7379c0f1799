//! Calls, function creation and recursion accounting.

use std::{cell::RefCell, rc::Rc};

use super::{exceptions::instantiate, Frame, FrameExit, Resume};
use crate::{
    bytecode::{MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS},
    cell::Cell,
    engine::Engine,
    exception_private::{ExcType, RunError, RunResult},
    function::Function,
    generator::Generator,
    inline_cache::SiteCache,
    value::Value,
};

impl Engine {
    /// `CallFunction*`: stack `[callable, args...]` becomes `[result]`.
    pub(super) fn call_from_stack(&mut self, frame: &mut Frame, argc: usize) -> RunResult<()> {
        let args = frame.pop_n(argc)?;
        let callable = frame.pop()?;
        let direct = self.cached_call_target(frame, &callable, argc);
        let result = self.with_context(frame, |engine| match direct {
            Some(function) => engine.run_function(&function, args),
            None => engine.call_value(&callable, args),
        })?;
        frame.push(result)
    }

    /// `CallFunctionVarargs`: stack `[callable, iterable]`.
    pub(super) fn call_varargs(&mut self, frame: &mut Frame) -> RunResult<()> {
        let spread = frame.pop()?;
        let callable = frame.pop()?;
        let args = match &spread {
            Value::Tuple(items) => items.to_vec(),
            Value::List(items) => items.borrow().clone(),
            other => self.with_context(frame, |engine| engine.iterate(other))?,
        };
        let result = self.with_context(frame, |engine| engine.call_value(&callable, args))?;
        frame.push(result)
    }

    /// `CallMethod`: stack `[obj, args...]` becomes `[obj.name(args...)]`.
    pub(super) fn call_method(&mut self, frame: &mut Frame, name: &str, argc: usize) -> RunResult<()> {
        let args = frame.pop_n(argc)?;
        let obj = frame.pop()?;
        let method = self.runtime.get_attr(&obj, name)?;
        let result = self.with_context(frame, |engine| engine.call_value(&method, args))?;
        frame.push(result)
    }

    pub(super) fn make_function(&mut self, frame: &mut Frame, index: usize, flags: u8) -> RunResult<()> {
        let Value::Code(code) = frame.code.constant(index) else {
            return Err(RunError::internal("MakeFunction operand is not a code constant"));
        };
        let code = Rc::clone(code);
        let closure = if flags & MAKE_FUNCTION_CLOSURE == 0 {
            Vec::new()
        } else {
            closure_cells(&frame.pop()?)?
        };
        let defaults = if flags & MAKE_FUNCTION_DEFAULTS == 0 {
            Vec::new()
        } else {
            match frame.pop()? {
                Value::Tuple(items) => items.to_vec(),
                _ => return Err(RunError::internal("MakeFunction defaults are not a tuple")),
            }
        };
        let function = Function::new(code, Rc::clone(&frame.globals), defaults, closure)?;
        frame.push(Value::Function(Rc::new(function)))
    }

    /// A function the call site may enter without binding, if the site has
    /// resolved to exactly this target.
    fn cached_call_target(&mut self, frame: &Frame, callable: &Value, argc: usize) -> Option<Rc<Function>> {
        if !self.config.specialize {
            return None;
        }
        let mut profile = frame.profile.borrow_mut();
        let site = profile.site(frame.instr_pc)?;
        let target = match callable {
            Value::Function(function) => Some(function),
            _ => None,
        };

        let hit = match (&site.cache, target) {
            (SiteCache::Call { function: cached }, Some(function)) => Rc::ptr_eq(cached, function),
            _ => false,
        };
        if hit {
            self.stats.cache_hits += 1;
            return target.cloned();
        }
        if site.is_unresolved() {
            self.stats.resolved_sites += 1;
            return match target {
                Some(function) if function.takes_exact(argc) && function.code().flags().generator_kind().is_none() => {
                    site.cache = SiteCache::Call {
                        function: Rc::clone(function),
                    };
                    Some(Rc::clone(function))
                }
                _ => {
                    site.cache = SiteCache::Generic;
                    None
                }
            };
        }
        if !matches!(site.cache, SiteCache::Generic) {
            site.miss();
            self.stats.cache_misses += 1;
        }
        None
    }

    /// Generic call-out for any callable value.
    pub(crate) fn call_value(&mut self, callable: &Value, args: Vec<Value>) -> RunResult<Value> {
        match callable {
            Value::Function(function) => self.call_function(function, args),
            Value::Native(native) => native.call(self, args),
            Value::ExcType(exc_type) => Ok(Value::Exception(Rc::new(instantiate(*exc_type, args)))),
            Value::Object(host) => host.call(self, args),
            other => Err(ExcType::not_callable(other.type_name())),
        }
    }

    /// Binds arguments; generator functions return a fresh generator instead of running.
    pub(crate) fn call_function(&mut self, function: &Rc<Function>, args: Vec<Value>) -> RunResult<Value> {
        let bound = function.bind(args)?;
        if let Some(kind) = function.code().flags().generator_kind() {
            tracing::trace!(function = function.name(), kind = kind.type_name(), "created generator");
            let generator = Generator::new(Rc::clone(function), bound, kind);
            return Ok(Value::Generator(Rc::new(RefCell::new(generator))));
        }
        self.run_function(function, bound)
    }

    /// Runs a non-generator function on already bound arguments.
    pub(crate) fn run_function(&mut self, function: &Function, args: Vec<Value>) -> RunResult<Value> {
        self.enter_activation()?;
        let profile = self.profile_for(function.code());
        let result = Frame::new(function, args, profile).and_then(|mut frame| self.run_frame(&mut frame, Resume::Start));
        self.depth -= 1;
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(RunError::internal("yield in a code unit not flagged as a generator")),
        }
    }

    /// Counts one more nested activation, failing with `RecursionError` at the limit.
    pub(crate) fn enter_activation(&mut self) -> RunResult<()> {
        if self.depth >= self.config.max_recursion_depth {
            return Err(ExcType::recursion_error());
        }
        self.depth += 1;
        Ok(())
    }
}

fn closure_cells(value: &Value) -> RunResult<Vec<Rc<Cell>>> {
    let Value::Tuple(items) = value else {
        return Err(RunError::internal("MakeFunction closure is not a tuple"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Cell(cell) => Ok(Rc::clone(cell)),
            _ => Err(RunError::internal("MakeFunction closure holds a non-cell")),
        })
        .collect()
}
