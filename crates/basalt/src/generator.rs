//! Generator, coroutine and async generator state.
//!
//! Calling a function whose code unit is flagged as a generator does not run
//! the body. It creates a [`Generator`] holding the bound arguments; the frame
//! is materialized on the first resume and persisted between suspensions. The
//! resume protocol itself lives on [`Engine`](crate::Engine).

use std::{cell::RefCell, fmt, rc::Rc};

use crate::{bytecode::vm::Frame, function::Function, value::Value};

/// Shared handle to a generator; generators are identity-bearing values.
pub type GeneratorRef = Rc<RefCell<Generator>>;

/// Flavor of a suspendable function, taken from its code flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

impl GeneratorKind {
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async_generator",
        }
    }

    /// Name used in protocol error messages ("async generator raised ...").
    pub(crate) fn display_name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async generator",
        }
    }

    /// Only plain generators take part in `for` loops.
    #[must_use]
    pub fn is_iterable(self) -> bool {
        self == Self::Generator
    }
}

/// Outcome of one resume that did not raise.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorStep {
    /// The body suspended at a yield point with this value.
    Yielded(Value),
    /// The body returned; the generator is now finished.
    Returned(Value),
}

/// Persisted state of a suspendable activation.
pub struct Generator {
    function: Rc<Function>,
    /// Arguments already bound to parameter slots; copied into the frame on first resume.
    base_args: Vec<Value>,
    kind: GeneratorKind,
    pub(crate) frame: Option<Frame>,
    pub(crate) started: bool,
    pub(crate) running: bool,
    pub(crate) finished: bool,
}

impl Generator {
    pub(crate) fn new(function: Rc<Function>, base_args: Vec<Value>, kind: GeneratorKind) -> Self {
        Self {
            function,
            base_args,
            kind,
            frame: None,
            started: false,
            running: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.function.name()
    }

    #[must_use]
    pub fn kind(&self) -> GeneratorKind {
        self.kind
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn function(&self) -> &Rc<Function> {
        &self.function
    }

    /// A fresh copy of the bound arguments for a new activation.
    pub(crate) fn fresh_args(&self) -> Vec<Value> {
        self.base_args.clone()
    }

    /// Drops the persisted frame and marks the generator finished.
    pub(crate) fn finish(&mut self) {
        self.finished = true;
        self.running = false;
        self.frame = None;
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("started", &self.started)
            .field("running", &self.running)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
