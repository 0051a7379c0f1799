//! Arithmetic over the numeric tower and the sequence operators.
//!
//! Integers are `i64` until an operation overflows, at which point the result is
//! computed as a `BigInt`. Big results that fit back into `i64` are demoted, so
//! `Value::BigInt` never holds a small number.

use std::rc::Rc;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use super::{BinaryOp, UnaryOp};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    value::Value,
};

/// Largest shift or exponent accepted before raising `OverflowError`.
const MAX_BIG_EXPONENT: u32 = 1 << 20;

/// Integer operand, with `bool` already widened.
enum Int<'a> {
    Small(i64),
    Big(&'a BigInt),
}

impl Int<'_> {
    fn to_big(&self) -> BigInt {
        match self {
            Self::Small(i) => BigInt::from(*i),
            Self::Big(b) => (*b).clone(),
        }
    }

    fn to_f64(&self) -> RunResult<f64> {
        match self {
            Self::Small(i) => Ok(int_to_float(*i)),
            Self::Big(b) => b
                .to_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| ExcType::OverflowError.msg("int too large to convert to float")),
        }
    }
}

#[expect(clippy::cast_precision_loss, reason = "int to float conversion rounds like Python")]
fn int_to_float(i: i64) -> f64 {
    i as f64
}

fn as_int(value: &Value) -> Option<Int<'_>> {
    match value {
        Value::Bool(b) => Some(Int::Small(i64::from(*b))),
        Value::Int(i) => Some(Int::Small(*i)),
        Value::BigInt(b) => Some(Int::Big(b)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<RunResult<f64>> {
    match value {
        Value::Float(f) => Some(Ok(*f)),
        other => as_int(other).map(|i| i.to_f64()),
    }
}

/// Python truthiness for the built-in kinds; host objects decide for themselves.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::BigInt(b) => !b.is_zero(),
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Bytes(b) => !b.is_empty(),
        Value::Tuple(items) => !items.is_empty(),
        Value::List(items) => !items.borrow().is_empty(),
        Value::Dict(dict) => !dict.borrow().is_empty(),
        Value::Set(set) => !set.borrow().is_empty(),
        Value::Object(obj) => obj.is_true(),
        _ => true,
    }
}

/// Default binary operator semantics.
pub fn binary_op(op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
        return match (a, b) {
            (Int::Small(a), Int::Small(b)) => int_binary(op, a, b),
            (a, b) => big_binary(op, &a.to_big(), &b.to_big()),
        };
    }
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
            return float_binary(op, a?, b?)
                .unwrap_or_else(|| Err(ExcType::binary_type_error(op.into(), lhs.type_name(), rhs.type_name())));
        }
    }
    sequence_binary(op, lhs, rhs)
        .unwrap_or_else(|| Err(ExcType::binary_type_error(op.into(), lhs.type_name(), rhs.type_name())))
}

/// Binary operator on two fixed-width integers, promoting to `BigInt` on overflow.
pub fn int_binary(op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
    let promote = || big_binary(op, &BigInt::from(a), &BigInt::from(b));
    match op {
        BinaryOp::Add => a.checked_add(b).map_or_else(promote, |v| Ok(Value::Int(v))),
        BinaryOp::Sub => a.checked_sub(b).map_or_else(promote, |v| Ok(Value::Int(v))),
        BinaryOp::Mul => a.checked_mul(b).map_or_else(promote, |v| Ok(Value::Int(v))),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            Ok(Value::Float(int_to_float(a) / int_to_float(b)))
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            if a == i64::MIN && b == -1 {
                return promote();
            }
            Ok(Value::Int(Integer::div_floor(&a, &b)))
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(ExcType::zero_division("integer modulo by zero"));
            }
            if b == -1 {
                return Ok(Value::Int(0));
            }
            Ok(Value::Int(Integer::mod_floor(&a, &b)))
        }
        BinaryOp::Pow => {
            if b < 0 {
                return float_pow(int_to_float(a), int_to_float(b));
            }
            match u32::try_from(b).ok().and_then(|e| a.checked_pow(e)) {
                Some(v) => Ok(Value::Int(v)),
                None => promote(),
            }
        }
        BinaryOp::And => Ok(Value::Int(a & b)),
        BinaryOp::Or => Ok(Value::Int(a | b)),
        BinaryOp::Xor => Ok(Value::Int(a ^ b)),
        BinaryOp::LShift => {
            if b < 0 {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            if b < 63 {
                let shifted = a << b;
                if shifted >> b == a {
                    return Ok(Value::Int(shifted));
                }
            }
            promote()
        }
        BinaryOp::RShift => {
            if b < 0 {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            Ok(Value::Int(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b }))
        }
    }
}

fn big_binary(op: BinaryOp, a: &BigInt, b: &BigInt) -> RunResult<Value> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b.is_zero() {
                return Err(ExcType::zero_division("division by zero"));
            }
            let (a, b) = (Int::Big(a).to_f64()?, Int::Big(b).to_f64()?);
            return Ok(Value::Float(a / b));
        }
        BinaryOp::FloorDiv => {
            if b.is_zero() {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            a.div_floor(b)
        }
        BinaryOp::Mod => {
            if b.is_zero() {
                return Err(ExcType::zero_division("integer modulo by zero"));
            }
            a.mod_floor(b)
        }
        BinaryOp::Pow => {
            if b.is_negative() {
                return float_pow(Int::Big(a).to_f64()?, Int::Big(b).to_f64()?);
            }
            a.pow(big_exponent(b)?)
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::LShift => {
            if b.is_negative() {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            a << big_exponent(b)?
        }
        BinaryOp::RShift => {
            if b.is_negative() {
                return Err(ExcType::ValueError.msg("negative shift count"));
            }
            match b.to_u32() {
                Some(shift) => a >> shift,
                None => BigInt::from(if a.is_negative() { -1 } else { 0 }),
            }
        }
    };
    Ok(Value::from_bigint(value))
}

fn big_exponent(b: &BigInt) -> RunResult<u32> {
    b.to_u32()
        .filter(|e| *e <= MAX_BIG_EXPONENT)
        .ok_or_else(|| ExcType::OverflowError.msg("exponent too large"))
}

/// Float arithmetic; `None` for operators floats do not support.
pub(crate) fn float_binary(op: BinaryOp, a: f64, b: f64) -> Option<RunResult<Value>> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Some(Err(ExcType::zero_division("float division by zero")));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Some(Err(ExcType::zero_division("float floor division by zero")));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Some(Err(ExcType::zero_division("float modulo by zero")));
            }
            float_mod(a, b)
        }
        BinaryOp::Pow => return Some(float_pow(a, b)),
        _ => return None,
    };
    Some(Ok(Value::Float(value)))
}

/// Modulo whose result takes the sign of the divisor.
fn float_mod(a: f64, b: f64) -> f64 {
    let rem = a % b;
    if rem != 0.0 && (rem < 0.0) != (b < 0.0) { rem + b } else { rem }
}

fn float_pow(a: f64, b: f64) -> RunResult<Value> {
    if a == 0.0 && b < 0.0 {
        return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
    }
    Ok(Value::Float(a.powf(b)))
}

/// Concatenation and repetition of strings, bytes, tuples and lists.
fn sequence_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Option<RunResult<Value>> {
    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Some(Ok(Value::Str(Rc::from(s))))
        }
        (BinaryOp::Add, Value::Bytes(a), Value::Bytes(b)) => Some(Ok(Value::Bytes([&a[..], &b[..]].concat().into()))),
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => Some(Ok(Value::tuple([&a[..], &b[..]].concat()))),
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let joined = [&a.borrow()[..], &b.borrow()[..]].concat();
            Some(Ok(Value::list(joined)))
        }
        (BinaryOp::Mul, seq, count) | (BinaryOp::Mul, count, seq) if as_int(count).is_some() && is_sequence(seq) => {
            Some(repeat(seq, count))
        }
        _ => None,
    }
}

fn is_sequence(value: &Value) -> bool {
    matches!(value, Value::Str(_) | Value::Bytes(_) | Value::Tuple(_) | Value::List(_))
}

fn repeat(seq: &Value, count: &Value) -> RunResult<Value> {
    let times = match as_int(count) {
        Some(Int::Small(n)) => usize::try_from(n.max(0)).map_err(|_| overflow_repeat())?,
        _ => return Err(overflow_repeat()),
    };
    Ok(match seq {
        Value::Str(s) => Value::Str(Rc::from(s.repeat(times))),
        Value::Bytes(b) => Value::Bytes(b.repeat(times).into()),
        Value::Tuple(items) => Value::tuple(repeat_items(items, times)),
        Value::List(items) => Value::list(repeat_items(&items.borrow(), times)),
        other => return Err(ExcType::binary_type_error("*", other.type_name(), count.type_name())),
    })
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    std::iter::repeat_n(items, times).flatten().cloned().collect()
}

fn overflow_repeat() -> RunError {
    ExcType::OverflowError.msg("cannot fit 'int' into an index-sized integer")
}

/// Default unary operator semantics.
pub fn unary_op(op: UnaryOp, operand: &Value) -> RunResult<Value> {
    match (op, operand) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!truthy(v))),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (op, v) => match (op, as_int(v)) {
            (UnaryOp::Neg, Some(Int::Small(i))) => Ok(i.checked_neg().map_or_else(|| Value::from_bigint(-BigInt::from(i)), Value::Int)),
            (UnaryOp::Neg, Some(Int::Big(b))) => Ok(Value::from_bigint(-b)),
            (UnaryOp::Pos, Some(i)) => Ok(Value::from_bigint(i.to_big())),
            (UnaryOp::Invert, Some(Int::Small(i))) => Ok(Value::Int(!i)),
            (UnaryOp::Invert, Some(Int::Big(b))) => Ok(Value::from_bigint(-b - BigInt::from(1))),
            _ => Err(ExcType::unary_type_error(op.into(), v.type_name())),
        },
    }
}
