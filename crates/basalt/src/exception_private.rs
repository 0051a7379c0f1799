use std::{
    borrow::Cow,
    cell::{Cell as StdCell, RefCell},
    fmt,
    rc::Rc,
};

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Shared handle to a raised exception object.
///
/// Exceptions are identity-bearing: chaining, re-raising and cycle detection all
/// compare handles with `Rc::ptr_eq`.
pub type ExcRef = Rc<Exception>;

/// Exception types known to the engine.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>` implementations.
/// The string representation matches the variant name exactly (e.g., `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// Root of the hierarchy, matches anything in an except clause.
    BaseException,
    /// Injected by `close()`; deliberately not an `Exception` subclass.
    GeneratorExit,
    /// Primary exception class - matches any exception except `GeneratorExit`.
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    /// Subclass of NameError - for accessing local variable before assignment.
    UnboundLocalError,

    // --- ImportError hierarchy ---
    ImportError,
    ModuleNotFoundError,

    // --- iteration signals ---
    /// Completion signal of generators and iterators, may carry a payload value.
    StopIteration,
    /// Completion signal of async generators.
    StopAsyncIteration,

    // --- Standalone exception types ---
    AssertionError,
    AttributeError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit),
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::RuntimeError => matches!(self, Self::RecursionError | Self::NotImplementedError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::ImportError => matches!(self, Self::ModuleNotFoundError),
            _ => false,
        }
    }

    /// Every exception type, used to seed the builtin namespace.
    pub(crate) const ALL: [Self; 22] = [
        Self::BaseException,
        Self::GeneratorExit,
        Self::Exception,
        Self::ArithmeticError,
        Self::OverflowError,
        Self::ZeroDivisionError,
        Self::LookupError,
        Self::IndexError,
        Self::KeyError,
        Self::RuntimeError,
        Self::NotImplementedError,
        Self::RecursionError,
        Self::NameError,
        Self::UnboundLocalError,
        Self::ImportError,
        Self::ModuleNotFoundError,
        Self::StopIteration,
        Self::StopAsyncIteration,
        Self::AssertionError,
        Self::AttributeError,
        Self::TypeError,
        Self::ValueError,
    ];

    /// Builds a raised error of this type with a message.
    #[must_use]
    pub(crate) fn msg(self, message: impl Into<String>) -> RunError {
        Exception::new(self, Some(message.into())).into()
    }

    /// Builds a raised error of this type with no arguments.
    #[must_use]
    pub(crate) fn bare(self) -> RunError {
        Exception::new(self, None).into()
    }

    #[must_use]
    pub(crate) fn unbound_local(name: &str) -> RunError {
        Self::UnboundLocalError.msg(format!(
            "cannot access local variable '{name}' where it is not associated with a value"
        ))
    }

    #[must_use]
    pub(crate) fn free_variable(name: &str) -> RunError {
        Self::NameError.msg(format!(
            "cannot access free variable '{name}' where it is not associated with a value in enclosing scope"
        ))
    }

    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        Self::NameError.msg(format!("name '{name}' is not defined"))
    }

    #[must_use]
    pub(crate) fn binary_type_error(op: &str, lhs: &str, rhs: &str) -> RunError {
        Self::TypeError.msg(format!(
            "unsupported operand type(s) for {op}: '{lhs}' and '{rhs}'"
        ))
    }

    #[must_use]
    pub(crate) fn unary_type_error(op: &str, operand: &str) -> RunError {
        Self::TypeError.msg(format!("bad operand type for unary {op}: '{operand}'"))
    }

    #[must_use]
    pub(crate) fn compare_type_error(op: &str, lhs: &str, rhs: &str) -> RunError {
        Self::TypeError.msg(format!(
            "'{op}' not supported between instances of '{lhs}' and '{rhs}'"
        ))
    }

    #[must_use]
    pub(crate) fn not_callable(type_name: &str) -> RunError {
        Self::TypeError.msg(format!("'{type_name}' object is not callable"))
    }

    #[must_use]
    pub(crate) fn not_iterable(type_name: &str) -> RunError {
        Self::TypeError.msg(format!("'{type_name}' object is not iterable"))
    }

    #[must_use]
    pub(crate) fn attribute_error(type_name: &str, attr: &str) -> RunError {
        Self::AttributeError.msg(format!("'{type_name}' object has no attribute '{attr}'"))
    }

    #[must_use]
    pub(crate) fn zero_division(message: &'static str) -> RunError {
        Self::ZeroDivisionError.msg(message)
    }

    #[must_use]
    pub(crate) fn recursion_error() -> RunError {
        Self::RecursionError.msg("maximum recursion depth exceeded")
    }

    /// `StopIteration` carrying the value a generator returned.
    #[must_use]
    pub(crate) fn stop_iteration(payload: Value) -> RunError {
        Exception::with_payload(Self::StopIteration, payload).into()
    }
}

/// Abstract classification of engine errors.
///
/// Every error the engine surfaces falls into exactly one kind. All kinds but
/// `StackUsageViolation` are catchable by bytecode exception handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// A local, cell or free-variable slot was read while empty.
    UnboundVariable,
    /// The operand stack left its bounds; fatal.
    StackUsageViolation,
    /// Any failure raised by an operation call-out or by user code.
    UnhandledOperationFailure,
    /// Completion signal of a generator or iterator.
    IterationExhausted,
    /// A generator was resumed while already executing.
    ReentrancyViolation,
    /// A generator protocol rule was broken, e.g. `GeneratorExit` was ignored.
    ProtocolViolation,
}

impl ErrorKind {
    fn for_type(exc_type: ExcType) -> Self {
        match exc_type {
            ExcType::NameError | ExcType::UnboundLocalError => Self::UnboundVariable,
            ExcType::StopIteration | ExcType::StopAsyncIteration => Self::IterationExhausted,
            _ => Self::UnhandledOperationFailure,
        }
    }
}

/// One entry of an exception's traceback: the code unit and offset it passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub code_name: Rc<str>,
    pub offset: usize,
    pub line: u32,
}

/// A raised (or raisable) exception object.
///
/// The type, message and payload are fixed at construction. Context, cause and
/// traceback are filled in as the exception travels through activations.
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    payload: Option<Value>,
    kind: Option<ErrorKind>,
    context: RefCell<Option<ExcRef>>,
    cause: RefCell<Option<ExcRef>>,
    suppress_context: StdCell<bool>,
    traceback: RefCell<Vec<TraceEntry>>,
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            message,
            payload: None,
            kind: None,
            context: RefCell::new(None),
            cause: RefCell::new(None),
            suppress_context: StdCell::new(false),
            traceback: RefCell::new(Vec::new()),
        }
    }

    /// Creates an exception carrying a value, as `StopIteration(value)` does.
    #[must_use]
    pub fn with_payload(exc_type: ExcType, payload: Value) -> Self {
        let message = if payload.is_none() { None } else { Some(payload.repr()) };
        Self {
            payload: Some(payload),
            ..Self::new(exc_type, message)
        }
    }

    /// Overrides the error kind derived from the exception type.
    #[must_use]
    pub(crate) fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The value carried by a `StopIteration`, `None` when absent.
    #[must_use]
    pub fn payload(&self) -> Value {
        self.payload.clone().unwrap_or(Value::None)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind.unwrap_or_else(|| ErrorKind::for_type(self.exc_type))
    }

    #[must_use]
    pub fn context(&self) -> Option<ExcRef> {
        self.context.borrow().clone()
    }

    #[must_use]
    pub fn cause(&self) -> Option<ExcRef> {
        self.cause.borrow().clone()
    }

    #[must_use]
    pub fn suppress_context(&self) -> bool {
        self.suppress_context.get()
    }

    #[must_use]
    pub fn traceback(&self) -> Vec<TraceEntry> {
        self.traceback.borrow().clone()
    }

    pub(crate) fn set_context(&self, context: Option<ExcRef>) {
        *self.context.borrow_mut() = context;
    }

    /// Sets the explicit cause (`raise x from y`), suppressing the implicit context.
    ///
    /// A cause that would close a cycle back to `this` is dropped.
    pub(crate) fn set_cause(this: &ExcRef, cause: Option<ExcRef>) {
        this.suppress_context.set(true);
        let cause = cause.filter(|cause| !Rc::ptr_eq(this, cause) && !cause.chain_reaches(this));
        *this.cause.borrow_mut() = cause;
    }

    /// Links `this` to the exception that was being handled when it was raised.
    ///
    /// The link is omitted when it would make the chain cyclic.
    pub(crate) fn chain_context(this: &ExcRef, handled: Option<&ExcRef>) {
        let Some(handled) = handled else {
            return;
        };
        if Rc::ptr_eq(this, handled) || handled.chain_reaches(this) {
            return;
        }
        this.set_context(Some(Rc::clone(handled)));
    }

    /// Whether `target` is reachable from `self` through context or cause links.
    #[must_use]
    pub fn chain_reaches(&self, target: &ExcRef) -> bool {
        let mut seen: AHashSet<*const Self> = AHashSet::new();
        let mut pending: Vec<ExcRef> = self.links();
        while let Some(exc) = pending.pop() {
            if Rc::ptr_eq(&exc, target) {
                return true;
            }
            if seen.insert(Rc::as_ptr(&exc)) {
                pending.extend(exc.links());
            }
        }
        false
    }

    fn links(&self) -> Vec<ExcRef> {
        self.context().into_iter().chain(self.cause()).collect()
    }

    /// Appends a traceback entry unless it repeats the most recent one.
    pub(crate) fn push_trace(&self, entry: TraceEntry) {
        let mut traceback = self.traceback.borrow_mut();
        if traceback.last() != Some(&entry) {
            traceback.push(entry);
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("exc_type", &self.exc_type)
            .field("message", &self.message)
            .field("has_context", &self.context.borrow().is_some())
            .field("has_cause", &self.cause.borrow().is_some())
            .finish_non_exhaustive()
    }
}

/// Fatal consistency failures.
///
/// These never reach a bytecode exception handler: the activation is aborted
/// and the error is returned to the engine's caller as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// A push would exceed the code unit's declared stack size.
    StackOverflow { code: Rc<str>, offset: usize },
    /// A pop or peek found the operand stack empty.
    StackUnderflow { code: Rc<str>, offset: usize },
    /// A closure vector does not match the code unit's free variables.
    ClosureMismatch { code: Rc<str>, expected: usize, got: usize },
    /// Anything else that a validated code unit should make unreachable.
    Malformed(Cow<'static, str>),
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow { code, offset } => {
                write!(f, "operand stack overflow in '{code}' at offset {offset}")
            }
            Self::StackUnderflow { code, offset } => {
                write!(f, "operand stack underflow in '{code}' at offset {offset}")
            }
            Self::ClosureMismatch { code, expected, got } => {
                write!(f, "'{code}' expects {expected} closure cells, got {got}")
            }
            Self::Malformed(msg) => write!(f, "malformed code: {msg}"),
        }
    }
}

/// Runtime error: either a catchable exception or a fatal internal failure.
#[derive(Debug, Clone)]
pub enum RunError {
    /// Catchable exception.
    Exc(ExcRef),
    /// Internal consistency failure; aborts without running handlers.
    Internal(InternalError),
}

impl RunError {
    #[must_use]
    pub(crate) fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(InternalError::Malformed(msg.into()))
    }

    /// The abstract kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exc(exc) => exc.kind(),
            Self::Internal(_) => ErrorKind::StackUsageViolation,
        }
    }

    /// The exception object, if this error is catchable.
    #[must_use]
    pub fn exception(&self) -> Option<&ExcRef> {
        match self {
            Self::Exc(exc) => Some(exc),
            Self::Internal(_) => None,
        }
    }

    /// The exception type, if this error is catchable.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.exception().map(|exc| exc.exc_type())
    }
}

impl From<Exception> for RunError {
    fn from(exc: Exception) -> Self {
        Self::Exc(Rc::new(exc))
    }
}

impl From<ExcRef> for RunError {
    fn from(exc: ExcRef) -> Self {
        Self::Exc(exc)
    }
}

impl From<InternalError> for RunError {
    fn from(err: InternalError) -> Self {
        Self::Internal(err)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exc(exc) => write!(f, "{exc}"),
            Self::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn exc(exc_type: ExcType) -> ExcRef {
        Rc::new(Exception::new(exc_type, None))
    }

    #[test]
    fn subclass_hierarchy() {
        assert!(ExcType::ZeroDivisionError.is_subclass_of(ExcType::ArithmeticError));
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(ExcType::StopIteration.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(ExcType::GeneratorExit.is_subclass_of(ExcType::BaseException));
        assert!(!ExcType::KeyError.is_subclass_of(ExcType::IndexError));
    }

    #[test]
    fn exc_type_names_round_trip_through_strum() {
        let name: &'static str = ExcType::ModuleNotFoundError.into();
        assert_eq!(name, "ModuleNotFoundError");
        assert_eq!("KeyError".parse::<ExcType>().unwrap(), ExcType::KeyError);
    }

    #[test]
    fn context_is_not_linked_into_a_cycle() {
        let a = exc(ExcType::ValueError);
        let b = exc(ExcType::TypeError);
        Exception::chain_context(&b, Some(&a));
        assert!(Rc::ptr_eq(&b.context().unwrap(), &a));

        // re-raising `a` while `b` is handled would close a -> b -> a
        Exception::chain_context(&a, Some(&b));
        assert!(a.context().is_none());

        Exception::chain_context(&a, Some(&a));
        assert!(a.context().is_none());
    }

    #[test]
    fn cause_rejects_cycles_and_suppresses_context() {
        let a = exc(ExcType::ValueError);
        let b = exc(ExcType::KeyError);
        Exception::set_cause(&b, Some(Rc::clone(&a)));
        assert!(b.suppress_context());
        assert!(Rc::ptr_eq(&b.cause().unwrap(), &a));

        Exception::set_cause(&a, Some(Rc::clone(&b)));
        assert!(a.cause().is_none());
    }

    #[test]
    fn kinds_follow_exception_types() {
        assert_eq!(ExcType::unbound_local("x").kind(), ErrorKind::UnboundVariable);
        assert_eq!(ExcType::stop_iteration(Value::None).kind(), ErrorKind::IterationExhausted);
        assert_eq!(ExcType::TypeError.bare().kind(), ErrorKind::UnhandledOperationFailure);
        let reentrant: RunError = Exception::new(ExcType::ValueError, None)
            .with_kind(ErrorKind::ReentrancyViolation)
            .into();
        assert_eq!(reentrant.kind(), ErrorKind::ReentrancyViolation);
        let fatal = RunError::internal("boom");
        assert_eq!(fatal.kind(), ErrorKind::StackUsageViolation);
    }

    #[test]
    fn display_includes_type_and_message() {
        assert_eq!(
            ExcType::name_error("spam").to_string(),
            "NameError: name 'spam' is not defined"
        );
        assert_eq!(ExcType::GeneratorExit.bare().to_string(), "GeneratorExit");
    }
}
