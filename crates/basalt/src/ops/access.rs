//! Attribute, item, length and iteration defaults.

use std::{cell::RefCell, rc::Rc};

use crate::{
    exception_private::{ExcType, RunResult},
    function::NativeFunction,
    generator::GeneratorRef,
    iter::ValueIter,
    value::{HashKey, Value},
};

/// Default attribute lookup.
///
/// Methods of built-in containers and generators come back as natives bound to
/// the receiver, so `LoadAttr` followed by a call behaves like `CallMethod`.
pub fn get_attr(obj: &Value, name: &str) -> RunResult<Value> {
    let found = match obj {
        Value::Module(module) => {
            return module.get(name).ok_or_else(|| {
                ExcType::AttributeError.msg(format!("module '{}' has no attribute '{name}'", module.name()))
            });
        }
        Value::Object(host) => host.get_attr(name)?,
        Value::Exception(exc) => match name {
            "value" if exc.exc_type() == ExcType::StopIteration => Some(exc.payload()),
            "args" => Some(match exc.message() {
                Some(message) if exc.payload().is_none() => Value::tuple(vec![Value::str(message)]),
                Some(_) => Value::tuple(vec![exc.payload()]),
                None => Value::tuple(vec![]),
            }),
            "__context__" => Some(exc.context().map_or(Value::None, Value::Exception)),
            "__cause__" => Some(exc.cause().map_or(Value::None, Value::Exception)),
            "__suppress_context__" => Some(Value::Bool(exc.suppress_context())),
            _ => None,
        },
        Value::List(list) => list_method(list, name),
        Value::Dict(dict) => dict_method(dict, name),
        Value::Generator(generator) => generator_method(generator, name),
        _ => None,
    };
    found.ok_or_else(|| ExcType::attribute_error(obj.type_name(), name))
}

fn bound(name: &str, func: impl Fn(&mut crate::Engine, Vec<Value>) -> RunResult<Value> + 'static) -> Option<Value> {
    Some(Value::Native(Rc::new(NativeFunction::new(name, func))))
}

fn list_method(list: &Rc<RefCell<Vec<Value>>>, name: &str) -> Option<Value> {
    let list = Rc::clone(list);
    match name {
        "append" => bound("append", move |_, args| {
            let [item] = exact_args::<1>("append", args)?;
            list.borrow_mut().push(item);
            Ok(Value::None)
        }),
        "extend" => bound("extend", move |engine, args| {
            let [items] = exact_args::<1>("extend", args)?;
            let items = engine.iterate(&items)?;
            list.borrow_mut().extend(items);
            Ok(Value::None)
        }),
        "pop" => bound("pop", move |_, args| {
            let mut list = list.borrow_mut();
            if list.is_empty() {
                return Err(ExcType::IndexError.msg("pop from empty list"));
            }
            let index = match args.as_slice() {
                [] => list.len() - 1,
                [index] => normalize_index(index, list.len(), "list", "pop index out of range")?,
                _ => return Err(ExcType::TypeError.msg(format!("pop expected at most 1 argument, got {}", args.len()))),
            };
            Ok(list.remove(index))
        }),
        _ => None,
    }
}

fn dict_method(dict: &Rc<RefCell<crate::value::Dict>>, name: &str) -> Option<Value> {
    let dict = Rc::clone(dict);
    match name {
        "get" => bound("get", move |_, mut args| {
            if args.is_empty() || args.len() > 2 {
                return Err(ExcType::TypeError.msg(format!("get expected 1 or 2 arguments, got {}", args.len())));
            }
            let default = if args.len() == 2 { args.pop().unwrap_or(Value::None) } else { Value::None };
            let key = HashKey::new(args.swap_remove(0))?;
            Ok(dict.borrow().get(&key).cloned().unwrap_or(default))
        }),
        "keys" => bound("keys", move |_, args| {
            exact_args::<0>("keys", args)?;
            Ok(Value::list(dict.borrow().keys().map(|k| k.value().clone()).collect()))
        }),
        "values" => bound("values", move |_, args| {
            exact_args::<0>("values", args)?;
            Ok(Value::list(dict.borrow().values().cloned().collect()))
        }),
        "items" => bound("items", move |_, args| {
            exact_args::<0>("items", args)?;
            let items = dict
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.value().clone(), v.clone()]))
                .collect();
            Ok(Value::list(items))
        }),
        _ => None,
    }
}

fn generator_method(generator: &GeneratorRef, name: &str) -> Option<Value> {
    let generator = Rc::clone(generator);
    match name {
        "send" => bound("send", move |engine, args| {
            let [value] = exact_args::<1>("send", args)?;
            engine.generator_send(&generator, value)
        }),
        "throw" => bound("throw", move |engine, args| {
            let [exc] = exact_args::<1>("throw", args)?;
            engine.generator_throw(&generator, exc)
        }),
        "close" => bound("close", move |engine, args| {
            exact_args::<0>("close", args)?;
            engine.generator_close(&generator)?;
            Ok(Value::None)
        }),
        _ => None,
    }
}

/// Destructures an argument vector of exactly `N` values.
pub(crate) fn exact_args<const N: usize>(name: &str, args: Vec<Value>) -> RunResult<[Value; N]> {
    let given = args.len();
    args.try_into().map_err(|_| {
        let plural = if N == 1 { "" } else { "s" };
        ExcType::TypeError.msg(format!("{name}() takes exactly {N} argument{plural} ({given} given)"))
    })
}

/// Default attribute store; only host objects and modules accept attributes.
pub fn set_attr(obj: &Value, name: &str, value: Value) -> RunResult<()> {
    match obj {
        Value::Object(host) => host.set_attr(name, value),
        Value::Module(module) => {
            module.set(name, value);
            Ok(())
        }
        other => Err(ExcType::AttributeError.msg(format!(
            "'{}' object has no attribute '{name}' and no __dict__ for setting new attributes",
            other.type_name()
        ))),
    }
}

pub fn del_attr(obj: &Value, name: &str) -> RunResult<()> {
    match obj {
        Value::Object(host) => host.del_attr(name),
        Value::Module(module) => module
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ExcType::AttributeError.msg(format!("module '{}' has no attribute '{name}'", module.name()))),
        other => Err(ExcType::attribute_error(other.type_name(), name)),
    }
}

/// Converts a Python index into a position, counting negative indices from the end.
fn normalize_index(index: &Value, len: usize, kind: &str, out_of_range: &str) -> RunResult<usize> {
    let raw = match index {
        Value::Bool(b) => i64::from(*b),
        Value::Int(i) => *i,
        Value::BigInt(_) => return Err(ExcType::IndexError.msg(out_of_range.to_owned())),
        other => {
            return Err(ExcType::TypeError.msg(format!(
                "{kind} indices must be integers or slices, not {}",
                other.type_name()
            )));
        }
    };
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let pos = if raw < 0 { raw + len_i } else { raw };
    if (0..len_i).contains(&pos) {
        usize::try_from(pos).map_err(|_| ExcType::IndexError.msg(out_of_range.to_owned()))
    } else {
        Err(ExcType::IndexError.msg(out_of_range.to_owned()))
    }
}

/// Default subscript, `obj[key]`.
pub fn get_item(obj: &Value, key: &Value) -> RunResult<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let index = normalize_index(key, items.len(), "list", "list index out of range")?;
            Ok(items[index].clone())
        }
        Value::Tuple(items) => {
            let index = normalize_index(key, items.len(), "tuple", "tuple index out of range")?;
            Ok(items[index].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let index = normalize_index(key, chars.len(), "string", "string index out of range")?;
            Ok(Value::str(chars[index].encode_utf8(&mut [0; 4])))
        }
        Value::Bytes(bytes) => {
            let index = normalize_index(key, bytes.len(), "byte", "index out of range")?;
            Ok(Value::Int(i64::from(bytes[index])))
        }
        Value::Dict(dict) => {
            let hashed = HashKey::new(key.clone())?;
            dict.borrow()
                .get(&hashed)
                .cloned()
                .ok_or_else(|| ExcType::KeyError.msg(key.repr()))
        }
        Value::Object(host) => host.get_item(key),
        other => Err(ExcType::TypeError.msg(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Default subscript store, `obj[key] = value`.
pub fn set_item(obj: &Value, key: &Value, value: Value) -> RunResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let index = normalize_index(key, items.len(), "list", "list assignment index out of range")?;
            items[index] = value;
            Ok(())
        }
        Value::Dict(dict) => {
            let hashed = HashKey::new(key.clone())?;
            dict.borrow_mut().insert(hashed, value);
            Ok(())
        }
        other => Err(ExcType::TypeError.msg(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Default subscript delete, `del obj[key]`.
pub fn del_item(obj: &Value, key: &Value) -> RunResult<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let index = normalize_index(key, items.len(), "list", "list assignment index out of range")?;
            items.remove(index);
            Ok(())
        }
        Value::Dict(dict) => {
            let hashed = HashKey::new(key.clone())?;
            dict.borrow_mut()
                .shift_remove(&hashed)
                .map(|_| ())
                .ok_or_else(|| ExcType::KeyError.msg(key.repr()))
        }
        other => Err(ExcType::TypeError.msg(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

/// Default `len()`.
pub fn len(value: &Value) -> RunResult<usize> {
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.borrow().len(),
        Value::Dict(dict) => dict.borrow().len(),
        Value::Set(set) => set.borrow().len(),
        Value::Object(host) => host.len().ok_or_else(|| no_len(value))?,
        _ => return Err(no_len(value)),
    };
    Ok(len)
}

fn no_len(value: &Value) -> crate::RunError {
    ExcType::TypeError.msg(format!("object of type '{}' has no len()", value.type_name()))
}

/// Default `iter()`: generators and iterators are their own iterators.
pub fn get_iter(value: &Value) -> RunResult<Value> {
    match value {
        Value::Iterator(_) => Ok(value.clone()),
        Value::Generator(generator) => {
            if generator.borrow().kind().is_iterable() {
                Ok(value.clone())
            } else {
                Err(ExcType::not_iterable(value.type_name()))
            }
        }
        other => ValueIter::new(other)
            .map(|iter| Value::Iterator(Rc::new(RefCell::new(iter))))
            .ok_or_else(|| ExcType::not_iterable(other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_count_from_the_end() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(get_item(&list, &Value::Int(-1)).unwrap(), Value::Int(3));
        let err = get_item(&list, &Value::Int(3)).unwrap_err();
        assert_eq!(err.to_string(), "IndexError: list index out of range");
        let err = get_item(&list, &Value::str("0")).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: list indices must be integers or slices, not str");
    }

    #[test]
    fn dict_items_round_trip() {
        let dict = Value::Dict(Rc::default());
        set_item(&dict, &Value::str("k"), Value::Int(1)).unwrap();
        assert_eq!(get_item(&dict, &Value::str("k")).unwrap(), Value::Int(1));
        del_item(&dict, &Value::str("k")).unwrap();
        let err = get_item(&dict, &Value::str("k")).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'k'");
    }

    #[test]
    fn tuples_reject_assignment() {
        let tuple = Value::tuple(vec![Value::Int(1)]);
        let err = set_item(&tuple, &Value::Int(0), Value::Int(2)).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: 'tuple' object does not support item assignment");
    }

    #[test]
    fn missing_attributes_name_the_type() {
        let err = get_attr(&Value::Int(1), "real").unwrap_err();
        assert_eq!(err.to_string(), "AttributeError: 'int' object has no attribute 'real'");
        assert!(matches!(get_attr(&Value::list(vec![]), "append").unwrap(), Value::Native(_)));
    }

    #[test]
    fn lengths() {
        assert_eq!(len(&Value::str("hé")).unwrap(), 2);
        let err = len(&Value::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: object of type 'int' has no len()");
    }

    #[test]
    fn iter_wraps_containers() {
        assert!(matches!(get_iter(&Value::tuple(vec![])).unwrap(), Value::Iterator(_)));
        let err = get_iter(&Value::None).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: 'NoneType' object is not iterable");
    }
}
