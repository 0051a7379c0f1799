use std::{fmt, rc::Rc};

use crate::{
    bytecode::CodeUnit,
    cell::Cell,
    engine::Engine,
    exception_private::{ExcType, InternalError, RunError, RunResult},
    namespace::Globals,
    value::Value,
};

/// A function created by `MakeFunction` (or by `Engine::invoke` for a bare code unit).
///
/// Holds everything needed to start an activation: the shared code unit, the
/// globals it resolves names against, default values for trailing parameters,
/// and the cells it closes over (one per free variable of the code unit).
pub struct Function {
    code: Rc<CodeUnit>,
    globals: Rc<Globals>,
    defaults: Vec<Value>,
    closure: Vec<Rc<Cell>>,
}

impl Function {
    /// Creates a function, checking the closure against the code unit's free variables.
    pub fn new(
        code: Rc<CodeUnit>,
        globals: Rc<Globals>,
        defaults: Vec<Value>,
        closure: Vec<Rc<Cell>>,
    ) -> RunResult<Self> {
        if closure.len() != code.free_names().len() {
            return Err(InternalError::ClosureMismatch {
                code: code.name_rc(),
                expected: code.free_names().len(),
                got: closure.len(),
            }
            .into());
        }
        if defaults.len() > usize::from(code.arg_count()) {
            return Err(ExcType::TypeError.msg(format!(
                "{}() has more defaults than parameters",
                code.name()
            )));
        }
        Ok(Self {
            code,
            globals,
            defaults,
            closure,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    #[must_use]
    pub fn code(&self) -> &Rc<CodeUnit> {
        &self.code
    }

    #[must_use]
    pub fn globals(&self) -> &Rc<Globals> {
        &self.globals
    }

    #[must_use]
    pub fn closure(&self) -> &[Rc<Cell>] {
        &self.closure
    }

    /// True when a call with exactly `arg_count` positional arguments needs no binding work.
    #[must_use]
    pub(crate) fn takes_exact(&self, arg_count: usize) -> bool {
        !self.code.flags().has_varargs() && usize::from(self.code.arg_count()) == arg_count
    }

    /// Binds positional call arguments to parameter slots.
    ///
    /// Missing trailing parameters are filled from defaults, surplus arguments are
    /// collected into a tuple when the code unit takes `*args`.
    pub(crate) fn bind(&self, mut args: Vec<Value>) -> RunResult<Vec<Value>> {
        let param_count = usize::from(self.code.arg_count());
        let varargs = self.code.flags().has_varargs();
        let given = args.len();

        let extra = if given > param_count {
            if !varargs {
                return Err(self.too_many_positional(given));
            }
            args.split_off(param_count)
        } else {
            Vec::new()
        };

        if args.len() < param_count {
            let first_default = param_count - self.defaults.len();
            if args.len() < first_default {
                let missing: Vec<&str> = self.code.local_names()[args.len()..first_default]
                    .iter()
                    .map(AsRef::as_ref)
                    .collect();
                return Err(self.missing_positional(&missing));
            }
            let skip = args.len() - first_default;
            args.extend(self.defaults[skip..].iter().cloned());
        }

        if varargs {
            args.push(Value::tuple(extra));
        }
        Ok(args)
    }

    fn too_many_positional(&self, given: usize) -> RunError {
        let expected = self.code.arg_count();
        let plural = if expected == 1 { "" } else { "s" };
        let verb = if given == 1 { "was" } else { "were" };
        ExcType::TypeError.msg(format!(
            "{}() takes {expected} positional argument{plural} but {given} {verb} given",
            self.name()
        ))
    }

    fn missing_positional(&self, missing: &[&str]) -> RunError {
        let quoted: Vec<String> = missing.iter().map(|name| format!("'{name}'")).collect();
        let names = match quoted.as_slice() {
            [] => String::new(),
            [one] => one.clone(),
            [rest @ .., last] => format!("{} and {last}", rest.join(", ")),
        };
        let plural = if missing.len() == 1 { "" } else { "s" };
        ExcType::TypeError.msg(format!(
            "{}() missing {} required positional argument{plural}: {names}",
            self.name(),
            missing.len()
        ))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("defaults", &self.defaults.len())
            .field("closure", &self.closure.len())
            .finish_non_exhaustive()
    }
}

/// Signature of host functions callable from bytecode.
pub type NativeFn = dyn Fn(&mut Engine, Vec<Value>) -> RunResult<Value>;

/// A function implemented in Rust by the runtime or the host.
///
/// Natives receive the engine so they can call back into bytecode or drive
/// generators (`list(gen)`, `next(gen)`).
pub struct NativeFunction {
    name: Rc<str>,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(name: &str, func: impl Fn(&mut Engine, Vec<Value>) -> RunResult<Value> + 'static) -> Self {
        Self {
            name: Rc::from(name),
            func: Box::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
        (self.func)(engine, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;

    fn function(params: &[&str], varargs: Option<&str>, defaults: Vec<Value>) -> Function {
        let mut builder = CodeBuilder::new("f");
        for name in params {
            builder.add_param(name);
        }
        if let Some(name) = varargs {
            builder.add_varargs(name);
        }
        builder.emit_return_none();
        let code = Rc::new(builder.build().unwrap());
        Function::new(code, Rc::new(Globals::new()), defaults, vec![]).unwrap()
    }

    #[test]
    fn defaults_fill_trailing_parameters() {
        let f = function(&["a", "b", "c"], None, vec![Value::Int(2), Value::Int(3)]);
        let bound = f.bind(vec![Value::Int(1)]).unwrap();
        assert_eq!(bound, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let bound = f.bind(vec![Value::Int(1), Value::Int(9)]).unwrap();
        assert_eq!(bound, vec![Value::Int(1), Value::Int(9), Value::Int(3)]);
    }

    #[test]
    fn missing_arguments_are_named() {
        let f = function(&["a", "b", "c"], None, vec![]);
        let err = f.bind(vec![Value::Int(1)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: f() missing 2 required positional arguments: 'b' and 'c'"
        );
    }

    #[test]
    fn surplus_arguments_need_varargs() {
        let f = function(&["a"], None, vec![]);
        let err = f.bind(vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: f() takes 1 positional argument but 2 were given"
        );

        let g = function(&["a"], Some("rest"), vec![]);
        let bound = g.bind(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(bound[0], Value::Int(1));
        assert_eq!(bound[1], Value::tuple(vec![Value::Int(2), Value::Int(3)]));
    }

    #[test]
    fn closure_must_match_free_variables() {
        let mut builder = CodeBuilder::new("inner");
        builder.add_free_var("x");
        builder.emit_return_none();
        let code = Rc::new(builder.build().unwrap());
        let err = Function::new(code, Rc::new(Globals::new()), vec![], vec![]).unwrap_err();
        assert!(matches!(err, RunError::Internal(InternalError::ClosureMismatch { expected: 1, got: 0, .. })));
    }
}
