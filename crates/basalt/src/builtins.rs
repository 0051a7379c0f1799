//! The builtin namespace of [`DefaultRuntime`](crate::DefaultRuntime).

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;
use num_bigint::BigInt;

use crate::{
    engine::Engine,
    exception_private::{ExcType, RunResult},
    function::NativeFunction,
    iter::ValueIter,
    ops::{self, BinaryOp},
    value::Value,
};

type Builtin = fn(&mut Engine, Vec<Value>) -> RunResult<Value>;

const FUNCTIONS: [(&str, Builtin); 10] = [
    ("len", builtin_len),
    ("range", builtin_range),
    ("list", builtin_list),
    ("tuple", builtin_tuple),
    ("iter", builtin_iter),
    ("next", builtin_next),
    ("isinstance", builtin_isinstance),
    ("abs", builtin_abs),
    ("repr", builtin_repr),
    ("sum", builtin_sum),
];

/// Builds the builtin namespace: the functions above plus every exception type.
pub(crate) fn namespace() -> AHashMap<&'static str, Value> {
    let mut names = AHashMap::with_capacity(FUNCTIONS.len() + ExcType::ALL.len());
    for (name, func) in FUNCTIONS {
        names.insert(name, Value::Native(Rc::new(NativeFunction::new(name, func))));
    }
    for exc_type in ExcType::ALL {
        names.insert(exc_type.into(), Value::ExcType(exc_type));
    }
    names
}

fn arg_range(name: &str, args: &[Value], min: usize, max: usize) -> RunResult<()> {
    let given = args.len();
    if given < min || given > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        let plural = if min == max && min == 1 { "" } else { "s" };
        return Err(ExcType::TypeError.msg(format!(
            "{name}() takes {expected} argument{plural} ({given} given)"
        )));
    }
    Ok(())
}

fn one_arg(name: &str, args: Vec<Value>) -> RunResult<Value> {
    arg_range(name, &args, 1, 1)?;
    Ok(args.into_iter().next().unwrap_or(Value::None))
}

fn builtin_len(_: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    let value = one_arg("len", args)?;
    let len = ops::len(&value)?;
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn range_bound(value: &Value) -> RunResult<i64> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Int(i) => Ok(*i),
        Value::BigInt(_) => Err(ExcType::OverflowError.msg("Python int too large to convert to C ssize_t")),
        other => Err(ExcType::TypeError.msg(format!(
            "'{}' object cannot be interpreted as an integer",
            other.type_name()
        ))),
    }
}

fn builtin_range(_: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("range", &args, 1, 3)?;
    let bounds = args.iter().map(range_bound).collect::<RunResult<Vec<i64>>>()?;
    let (start, stop) = match bounds.as_slice() {
        [stop] => (0, *stop),
        [start, stop, ..] => (*start, *stop),
        [] => (0, 0),
    };
    let step = bounds.get(2).copied().unwrap_or(1);
    if step == 0 {
        return Err(ExcType::ValueError.msg("range() arg 3 must not be zero"));
    }
    Ok(Value::Iterator(Rc::new(RefCell::new(ValueIter::range(start, stop, step)))))
}

fn builtin_list(engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("list", &args, 0, 1)?;
    match args.first() {
        Some(iterable) => Ok(Value::list(engine.iterate(iterable)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

fn builtin_tuple(engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("tuple", &args, 0, 1)?;
    match args.first() {
        Some(Value::Tuple(items)) => Ok(Value::Tuple(Rc::clone(items))),
        Some(iterable) => Ok(Value::tuple(engine.iterate(iterable)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn builtin_iter(engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    let value = one_arg("iter", args)?;
    engine.runtime().get_iter(&value)
}

fn builtin_next(engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("next", &args, 1, 2)?;
    let mut args = args.into_iter();
    let iterator = args.next().unwrap_or(Value::None);
    let default = args.next();
    if !matches!(iterator, Value::Iterator(_) | Value::Generator(_)) {
        return Err(ExcType::TypeError.msg(format!(
            "'{}' object is not an iterator",
            iterator.type_name()
        )));
    }
    match engine.next_value(&iterator)? {
        Some(value) => Ok(value),
        None => default.ok_or_else(|| ExcType::StopIteration.bare()),
    }
}

fn builtin_isinstance(_: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("isinstance", &args, 2, 2)?;
    let Value::Exception(exc) = &args[0] else {
        check_classinfo(&args[1])?;
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(matches_classinfo(exc.exc_type(), &args[1])?))
}

fn check_classinfo(classinfo: &Value) -> RunResult<()> {
    match classinfo {
        Value::ExcType(_) => Ok(()),
        Value::Tuple(items) => items.iter().try_for_each(check_classinfo),
        _ => Err(ExcType::TypeError.msg("isinstance() arg 2 must be a type, a tuple of types, or a union")),
    }
}

/// Whether an exception type matches an except-clause style classinfo (a type or a tuple of types).
pub(crate) fn matches_classinfo(exc_type: ExcType, classinfo: &Value) -> RunResult<bool> {
    match classinfo {
        Value::ExcType(handler) => Ok(exc_type.is_subclass_of(*handler)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if matches_classinfo(exc_type, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ExcType::TypeError.msg("catching classes that do not inherit from BaseException is not allowed")),
    }
}

fn builtin_abs(_: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    match one_arg("abs", args)? {
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Int(i) => Ok(i.checked_abs().map_or_else(|| Value::from_bigint(-BigInt::from(i)), Value::Int)),
        Value::BigInt(b) => Ok(Value::from_bigint(b.magnitude().clone().into())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(ExcType::TypeError.msg(format!("bad operand type for abs(): '{}'", other.type_name()))),
    }
}

fn builtin_repr(_: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    Ok(Value::str(&one_arg("repr", args)?.repr()))
}

fn builtin_sum(engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
    arg_range("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(ExcType::TypeError.msg("sum() can't sum strings [use ''.join(seq) instead]"));
    }
    for item in engine.iterate(&args[0])? {
        total = engine.runtime().binary_op(BinaryOp::Add, &total, &item)?;
    }
    Ok(total)
}
