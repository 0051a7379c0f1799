//! Iterator state for `GetIter`/`ForIter` and for natives like `list()`.
//!
//! Iteration is index based: the iterator keeps a handle to the container plus a
//! cursor, so lists may be appended to during iteration and dicts/sets can
//! detect size changes. Generators and host objects are iterated by the engine
//! directly and never appear here.

use std::{cell::RefCell, rc::Rc};

use crate::{
    exception_private::{ExcType, RunResult},
    value::{Dict, Set, Value},
};

/// Iterator over one of the built-in iterable kinds.
#[derive(Debug)]
pub struct ValueIter {
    index: usize,
    source: IterSource,
}

#[derive(Debug)]
enum IterSource {
    /// Live view: the current list length is checked on every step.
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    /// Yields one-character strings.
    Str { chars: Vec<char> },
    /// Yields byte values as ints.
    Bytes(Rc<[u8]>),
    Range { start: i64, step: i64, len: usize },
    /// Yields keys; `len` detects mutation during iteration.
    DictKeys { dict: Rc<RefCell<Dict>>, len: usize },
    Set { set: Rc<RefCell<Set>>, len: usize },
}

impl ValueIter {
    /// Creates an iterator for a built-in iterable, `None` if the value is not one.
    #[must_use]
    pub fn new(value: &Value) -> Option<Self> {
        let source = match value {
            Value::List(list) => IterSource::List(Rc::clone(list)),
            Value::Tuple(items) => IterSource::Tuple(Rc::clone(items)),
            Value::Str(s) => IterSource::Str { chars: s.chars().collect() },
            Value::Bytes(b) => IterSource::Bytes(Rc::clone(b)),
            Value::Dict(dict) => {
                let len = dict.borrow().len();
                IterSource::DictKeys {
                    dict: Rc::clone(dict),
                    len,
                }
            }
            Value::Set(set) => {
                let len = set.borrow().len();
                IterSource::Set {
                    set: Rc::clone(set),
                    len,
                }
            }
            _ => return None,
        };
        Some(Self { index: 0, source })
    }

    /// Iterator over `range(start, stop, step)`; `step` must be non-zero.
    #[must_use]
    pub fn range(start: i64, stop: i64, step: i64) -> Self {
        let span = if step > 0 {
            i128::from(stop) - i128::from(start)
        } else {
            i128::from(start) - i128::from(stop)
        };
        let step_abs = i128::from(step).abs();
        let len = if span <= 0 { 0 } else { (span + step_abs - 1) / step_abs };
        Self {
            index: 0,
            source: IterSource::Range {
                start,
                step,
                len: usize::try_from(len).unwrap_or(usize::MAX),
            },
        }
    }

    /// Advances the iterator, `Ok(None)` when exhausted.
    pub fn next_value(&mut self) -> RunResult<Option<Value>> {
        let index = self.index;
        let value = match &self.source {
            IterSource::List(list) => list.borrow().get(index).cloned(),
            IterSource::Tuple(items) => items.get(index).cloned(),
            IterSource::Str { chars } => chars.get(index).map(|c| Value::str(c.encode_utf8(&mut [0; 4]))),
            IterSource::Bytes(bytes) => bytes.get(index).map(|b| Value::Int(i64::from(*b))),
            IterSource::Range { start, step, len } => {
                if index < *len {
                    // index < len guarantees the result lies between start and stop
                    let offset = i128::try_from(index).unwrap_or(i128::MAX) * i128::from(*step);
                    i64::try_from(i128::from(*start) + offset).ok().map(Value::Int)
                } else {
                    None
                }
            }
            IterSource::DictKeys { dict, len } => {
                let dict = dict.borrow();
                if dict.len() != *len {
                    return Err(ExcType::RuntimeError.msg("dictionary changed size during iteration"));
                }
                dict.get_index(index).map(|(key, _)| key.value().clone())
            }
            IterSource::Set { set, len } => {
                let set = set.borrow();
                if set.len() != *len {
                    return Err(ExcType::RuntimeError.msg("Set changed size during iteration"));
                }
                set.get_index(index).map(|key| key.value().clone())
            }
        };
        if value.is_some() {
            self.index += 1;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut iter: ValueIter) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = iter.next_value().unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn ranges_count_in_both_directions() {
        assert_eq!(drain(ValueIter::range(0, 3, 1)), vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert_eq!(drain(ValueIter::range(5, 0, -2)), vec![Value::Int(5), Value::Int(3), Value::Int(1)]);
        assert!(drain(ValueIter::range(3, 3, 1)).is_empty());
    }

    #[test]
    fn list_iteration_sees_appends() {
        let list = Value::list(vec![Value::Int(1)]);
        let mut iter = ValueIter::new(&list).unwrap();
        assert_eq!(iter.next_value().unwrap(), Some(Value::Int(1)));
        if let Value::List(items) = &list {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(iter.next_value().unwrap(), Some(Value::Int(2)));
        assert_eq!(iter.next_value().unwrap(), None);
    }

    #[test]
    fn strings_yield_characters() {
        assert_eq!(drain(ValueIter::new(&Value::str("hé")).unwrap()), vec![Value::str("h"), Value::str("é")]);
    }

    #[test]
    fn non_iterables_are_rejected() {
        assert!(ValueIter::new(&Value::Int(1)).is_none());
    }
}
