use std::{
    cell::RefCell,
    cmp::Ordering,
    fmt::{self, Write},
    hash::{Hash, Hasher},
    rc::Rc,
};

use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

use crate::{
    bytecode::CodeUnit,
    cell::Cell,
    exception_private::{ExcRef, ExcType, RunResult},
    function::{Function, NativeFunction},
    generator::GeneratorRef,
    iter::ValueIter,
    runtime::{HostObject, Module},
};

/// Insertion-ordered mapping used for dict values.
pub type Dict = IndexMap<HashKey, Value, ahash::RandomState>;

/// Insertion-ordered set used for set values.
pub type Set = IndexSet<HashKey, ahash::RandomState>;

/// Runtime value manipulated by the engine.
///
/// Small immediates (`None`, `Bool`, `Int`, `Float`) are stored inline. Everything
/// else is reference-counted, so `clone()` is cheap and preserves identity.
/// Mutable containers use `RefCell`; the engine is single-threaded.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision integer; never holds a value that fits in `i64`.
    BigInt(Rc<BigInt>),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Value]>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Set>>),
    /// A closure cell, as pushed by `LoadClosure` before `MakeFunction`.
    Cell(Rc<Cell>),
    /// A code unit constant, consumed by `MakeFunction`.
    Code(Rc<CodeUnit>),
    Function(Rc<Function>),
    Native(Rc<NativeFunction>),
    /// An exception type, callable to create instances.
    ExcType(ExcType),
    Exception(ExcRef),
    Generator(GeneratorRef),
    Iterator(Rc<RefCell<ValueIter>>),
    Module(Rc<Module>),
    /// Object owned by the host runtime.
    Object(Rc<dyn HostObject>),
}

impl Value {
    /// Builds an integer value, demoting to `Int` when it fits.
    #[must_use]
    pub fn from_bigint(big: BigInt) -> Self {
        match big.to_i64() {
            Some(small) => Self::Int(small),
            None => Self::BigInt(Rc::new(big)),
        }
    }

    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::from(items))
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Cell(_) => "cell",
            Self::Code(_) => "code",
            Self::Function(_) => "function",
            Self::Native(_) => "builtin_function_or_method",
            Self::ExcType(_) => "type",
            Self::Exception(exc) => exc.exc_type().into(),
            Self::Generator(generator) => generator.borrow().kind().type_name(),
            Self::Iterator(_) => "iterator",
            Self::Module(_) => "module",
            Self::Object(obj) => obj.type_name(),
        }
    }

    /// Identity comparison, the semantics of `is`.
    ///
    /// Immediates compare by value, reference-counted values by pointer.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            _ => match (self.ref_addr(), other.ref_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Address of the shared allocation behind a reference-counted value.
    fn ref_addr(&self) -> Option<usize> {
        let addr = match self {
            Self::BigInt(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Str(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Bytes(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Tuple(v) => Rc::as_ptr(v).cast::<()>(),
            Self::List(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Dict(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Set(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Cell(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Code(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Function(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Native(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Exception(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Generator(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Iterator(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Module(v) => Rc::as_ptr(v).cast::<()>(),
            Self::Object(v) => Rc::as_ptr(v).cast::<()>(),
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::ExcType(_) => return None,
        };
        Some(addr as usize)
    }

    /// Python-style `repr()`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.repr_fmt(&mut out);
        out
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Float(v) => float_repr_fmt(*v, f),
            Self::Str(s) => string_repr_fmt(s, f),
            Self::Bytes(b) => bytes_repr_fmt(b, f),
            Self::Tuple(items) => {
                f.write_char('(')?;
                seq_repr_fmt(items, f)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::List(items) => {
                f.write_char('[')?;
                seq_repr_fmt(&items.borrow(), f)?;
                f.write_char(']')
            }
            Self::Dict(dict) => {
                f.write_char('{')?;
                for (i, (key, value)) in dict.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    key.value().repr_fmt(f)?;
                    f.write_str(": ")?;
                    value.repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Set(set) => {
                let set = set.borrow();
                if set.is_empty() {
                    return f.write_str("set()");
                }
                f.write_char('{')?;
                for (i, key) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    key.value().repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Cell(cell) => match cell.get() {
                Some(value) => write!(f, "<cell: {}>", value.type_name()),
                None => f.write_str("<cell: empty>"),
            },
            Self::Code(code) => write!(f, "<code object {}>", code.name()),
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Native(func) => write!(f, "<built-in function {}>", func.name()),
            Self::ExcType(t) => write!(f, "<class '{t}'>"),
            Self::Exception(exc) => match exc.message() {
                Some(message) => {
                    write!(f, "{}(", exc.exc_type())?;
                    string_repr_fmt(message, f)?;
                    f.write_char(')')
                }
                None => write!(f, "{}()", exc.exc_type()),
            },
            Self::Generator(generator) => {
                let generator = generator.borrow();
                write!(f, "<{} object {}>", generator.kind().type_name(), generator.name())
            }
            Self::Iterator(_) => f.write_str("<iterator>"),
            Self::Module(module) => write!(f, "<module '{}'>", module.name()),
            Self::Object(obj) => write!(f, "<{} object>", obj.type_name()),
        }
    }
}

fn seq_repr_fmt(items: &[Value], f: &mut impl Write) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item.repr_fmt(f)?;
    }
    Ok(())
}

fn float_repr_fmt(v: f64, f: &mut impl Write) -> fmt::Result {
    if v.is_nan() {
        f.write_str("nan")
    } else if v.is_infinite() {
        f.write_str(if v > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{v:?}")
    }
}

fn string_repr_fmt(s: &str, f: &mut impl Write) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    f.write_char(quote)?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char(quote)
}

fn bytes_repr_fmt(bytes: &[u8], f: &mut impl Write) -> fmt::Result {
    f.write_str("b'")?;
    for &b in bytes {
        match b {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            b'\t' => f.write_str("\\t")?,
            0x20..=0x7e => f.write_char(char::from(b))?,
            _ => write!(f, "\\x{b:02x}")?,
        }
    }
    f.write_char('\'')
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Value equality: numbers compare by value across representations,
/// sequences element-wise, everything else by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (Number::of(self), Number::of(other)) {
            return a.cmp_value(&b) == Some(Ordering::Equal);
        }
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v == w))
            }
            (Self::Set(a), Self::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|k| b.contains(k))
            }
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            _ => self.is(other),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Self::from_bigint(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::str(v)
    }
}

impl From<ExcRef> for Value {
    fn from(exc: ExcRef) -> Self {
        Self::Exception(exc)
    }
}

/// Borrowed numeric view used for cross-representation comparisons.
#[derive(Debug, Clone)]
pub(crate) enum Number<'a> {
    Int(i64),
    Big(&'a BigInt),
    Float(f64),
}

impl<'a> Number<'a> {
    pub(crate) fn of(value: &'a Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            Value::Int(i) => Some(Self::Int(*i)),
            Value::BigInt(b) => Some(Self::Big(b)),
            Value::Float(f) => Some(Self::Float(*f)),
            _ => None,
        }
    }

    /// Compares by mathematical value; `None` when a NaN is involved.
    pub(crate) fn cmp_value(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Big(b)) => Some(BigInt::from(*a).cmp(*b)),
            (Self::Big(a), Self::Int(b)) => Some((**a).cmp(&BigInt::from(*b))),
            (Self::Big(a), Self::Big(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Float(b)) => cmp_int_float(&BigInt::from(*a), *b),
            (Self::Big(a), Self::Float(b)) => cmp_int_float(a, *b),
            (Self::Float(a), Self::Int(b)) => cmp_int_float(&BigInt::from(*b), *a).map(Ordering::reverse),
            (Self::Float(a), Self::Big(b)) => cmp_int_float(b, *a).map(Ordering::reverse),
        }
    }
}

/// Exact integer/float comparison without rounding the integer through `f64`.
fn cmp_int_float(int: &BigInt, float: f64) -> Option<Ordering> {
    if float.is_nan() {
        return None;
    }
    if float.is_infinite() {
        return Some(if float > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    let floor = float.floor();
    // finite floats are exactly representable as big integers
    let floor_int = BigInt::from_f64(floor)?;
    match int.cmp(&floor_int) {
        Ordering::Equal if float > floor => Some(Ordering::Less),
        ordering => Some(ordering),
    }
}

/// A value validated as hashable, usable as a dict key or set member.
///
/// Numbers that compare equal hash equally regardless of representation.
#[derive(Clone)]
pub struct HashKey(Value);

impl HashKey {
    /// Wraps a value, failing with `TypeError` for unhashable (mutable) values.
    pub fn new(value: Value) -> RunResult<Self> {
        check_hashable(&value)?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

fn check_hashable(value: &Value) -> RunResult<()> {
    match value {
        Value::List(_) | Value::Dict(_) | Value::Set(_) => {
            Err(ExcType::TypeError.msg(format!("unhashable type: '{}'", value.type_name())))
        }
        Value::Tuple(items) => items.iter().try_for_each(check_hashable),
        _ => Ok(()),
    }
}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::None => state.write_u8(0),
        Value::Bool(b) => hash_int(i64::from(*b), state),
        Value::Int(i) => hash_int(*i, state),
        Value::BigInt(b) => hash_big(b, state),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                match f.to_i64() {
                    Some(i) if i.to_f64() == Some(*f) => hash_int(i, state),
                    _ => match BigInt::from_f64(*f) {
                        Some(big) if !big.is_zero() => hash_big(&big, state),
                        _ => hash_int(0, state),
                    },
                }
            } else {
                state.write_u8(2);
                state.write_u64(f.to_bits());
            }
        }
        Value::Str(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Value::Bytes(b) => {
            state.write_u8(4);
            b.hash(state);
        }
        Value::Tuple(items) => {
            state.write_u8(5);
            state.write_usize(items.len());
            for item in items.iter() {
                hash_value(item, state);
            }
        }
        Value::ExcType(t) => {
            state.write_u8(6);
            t.hash(state);
        }
        other => {
            state.write_u8(7);
            state.write_usize(other.ref_addr().unwrap_or_default());
        }
    }
}

fn hash_int<H: Hasher>(i: i64, state: &mut H) {
    state.write_u8(1);
    state.write_i64(i);
}

fn hash_big<H: Hasher>(big: &BigInt, state: &mut H) {
    match big.to_i64() {
        Some(i) => hash_int(i, state),
        None => {
            state.write_u8(8);
            state.write(&big.to_signed_bytes_le());
        }
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for HashKey {}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
