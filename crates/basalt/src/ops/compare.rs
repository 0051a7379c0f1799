use std::cmp::Ordering;

use super::CompareOp;
use crate::{
    exception_private::{ExcType, RunResult},
    value::{HashKey, Number, Value},
};

/// Default rich comparison.
///
/// `==`/`!=` never fail: unrelated kinds are simply unequal. Ordering comparisons
/// are defined for numbers, strings, bytes and same-kind sequences.
pub fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<bool> {
    match op {
        CompareOp::Eq => return Ok(lhs == rhs),
        CompareOp::Ne => return Ok(lhs != rhs),
        _ => {}
    }
    match order(op, lhs, rhs)? {
        // NaN operands are unordered: every ordering comparison is false
        None => Ok(false),
        Some(ordering) => Ok(op.matches(ordering)),
    }
}

/// Total or partial ordering between two values, `TypeError` if they are not orderable.
fn order(op: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Ordering>> {
    if let (Some(a), Some(b)) = (Number::of(lhs), Number::of(rhs)) {
        return Ok(a.cmp_value(&b));
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => order_seq(op, a, b),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            order_seq(op, &a, &b)
        }
        _ => Err(ExcType::compare_type_error(op.into(), lhs.type_name(), rhs.type_name())),
    }
}

/// Lexicographic ordering: the first unequal pair decides, then length.
fn order_seq(op: CompareOp, a: &[Value], b: &[Value]) -> RunResult<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if x != y {
            return order(op, x, y);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// Default membership test, the semantics of `needle in container`.
pub fn contains(container: &Value, needle: &Value) -> RunResult<bool> {
    match container {
        Value::Str(haystack) => match needle {
            Value::Str(sub) => Ok(haystack.contains(&**sub)),
            other => Err(ExcType::TypeError.msg(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Bytes(haystack) => match needle {
            Value::Int(byte) => Ok(u8::try_from(*byte).is_ok_and(|b| haystack.contains(&b))),
            Value::Bytes(sub) => Ok(sub.is_empty() || haystack.windows(sub.len()).any(|w| w == &sub[..])),
            other => Err(ExcType::TypeError.msg(format!(
                "a bytes-like object is required, not '{}'",
                other.type_name()
            ))),
        },
        Value::Tuple(items) => Ok(items.iter().any(|item| item == needle)),
        Value::List(items) => Ok(items.borrow().iter().any(|item| item == needle)),
        Value::Dict(dict) => Ok(dict.borrow().contains_key(&HashKey::new(needle.clone())?)),
        Value::Set(set) => Ok(set.borrow().contains(&HashKey::new(needle.clone())?)),
        other => Err(ExcType::TypeError.msg(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_numbers_order_exactly() {
        assert!(compare(CompareOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CompareOp::Ge, &Value::Float(2.0), &Value::Int(2)).unwrap());
        assert!(!compare(CompareOp::Lt, &Value::Float(f64::NAN), &Value::Int(0)).unwrap());
        assert!(compare(CompareOp::Ne, &Value::Float(f64::NAN), &Value::Float(f64::NAN)).unwrap());
    }

    #[test]
    fn sequences_order_lexicographically() {
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        let c = Value::tuple(vec![Value::Int(1)]);
        assert!(compare(CompareOp::Lt, &a, &b).unwrap());
        assert!(compare(CompareOp::Gt, &a, &c).unwrap());
        assert!(compare(CompareOp::Lt, &Value::str("abc"), &Value::str("abd")).unwrap());
    }

    #[test]
    fn unrelated_kinds_are_unequal_but_unorderable() {
        assert!(!compare(CompareOp::Eq, &Value::Int(1), &Value::str("1")).unwrap());
        let err = compare(CompareOp::Lt, &Value::Int(1), &Value::str("1")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: '<' not supported between instances of 'int' and 'str'"
        );
    }

    #[test]
    fn membership() {
        assert!(contains(&Value::str("hello"), &Value::str("ell")).unwrap());
        let list = Value::list(vec![Value::Int(1), Value::Float(2.0)]);
        assert!(contains(&list, &Value::Int(2)).unwrap());
        assert!(!contains(&list, &Value::Int(3)).unwrap());
        let err = contains(&Value::Int(3), &Value::Int(3)).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: argument of type 'int' is not iterable");
        assert!(contains(&Value::list(vec![]), &Value::list(vec![])).is_ok());
    }
}
