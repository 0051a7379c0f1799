//! The operation call-out layer.
//!
//! Everything the engine does not own itself (operators, attribute and item
//! access, iteration, imports, builtins) goes through a [`Runtime`]. Each method
//! defaults to the semantics in [`crate::ops`], so a host only overrides what it
//! wants to change.

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::AHashMap;

use crate::{
    builtins,
    engine::Engine,
    exception_private::{ExcType, RunResult},
    ops::{self, BinaryOp, CompareOp, UnaryOp},
    value::Value,
};

/// External operation provider consulted by the interpreter loop.
///
/// Any method may fail with a raised exception, which the engine routes to the
/// active code unit's handler table.
pub trait Runtime {
    fn binary_op(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        ops::binary_op(op, lhs, rhs)
    }

    fn unary_op(&self, op: UnaryOp, operand: &Value) -> RunResult<Value> {
        ops::unary_op(op, operand)
    }

    fn compare(&self, op: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        ops::compare(op, lhs, rhs)
    }

    fn contains(&self, container: &Value, needle: &Value) -> RunResult<bool> {
        ops::contains(container, needle)
    }

    fn is_true(&self, value: &Value) -> RunResult<bool> {
        Ok(ops::truthy(value))
    }

    fn get_attr(&self, obj: &Value, name: &str) -> RunResult<Value> {
        ops::get_attr(obj, name)
    }

    fn set_attr(&self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        ops::set_attr(obj, name, value)
    }

    fn del_attr(&self, obj: &Value, name: &str) -> RunResult<()> {
        ops::del_attr(obj, name)
    }

    fn get_item(&self, obj: &Value, key: &Value) -> RunResult<Value> {
        ops::get_item(obj, key)
    }

    fn set_item(&self, obj: &Value, key: &Value, value: Value) -> RunResult<()> {
        ops::set_item(obj, key, value)
    }

    fn del_item(&self, obj: &Value, key: &Value) -> RunResult<()> {
        ops::del_item(obj, key)
    }

    fn get_iter(&self, value: &Value) -> RunResult<Value> {
        ops::get_iter(value)
    }

    /// Resolves `import name`.
    fn import(&self, name: &str) -> RunResult<Value> {
        Err(ExcType::ModuleNotFoundError.msg(format!("No module named '{name}'")))
    }

    /// Looks up a name that is not defined in the globals namespace.
    fn builtin(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }

    /// Whether the engine may compute int/float/str operators inline.
    ///
    /// Hosts that change the meaning of `+` on built-in kinds must return false,
    /// which forces every operator through the call-outs above.
    fn primitive_fast_paths(&self) -> bool {
        true
    }
}

/// The stock runtime: default operations, the builtin namespace and a static
/// module registry.
pub struct DefaultRuntime {
    builtins: AHashMap<&'static str, Value>,
    modules: AHashMap<Rc<str>, Rc<Module>>,
}

impl DefaultRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: builtins::namespace(),
            modules: AHashMap::new(),
        }
    }

    /// Makes a module importable by its name.
    pub fn register_module(&mut self, module: Module) {
        self.modules.insert(Rc::clone(&module.name), Rc::new(module));
    }

    /// Adds or replaces a builtin.
    pub fn add_builtin(&mut self, name: &'static str, value: Value) {
        self.builtins.insert(name, value);
    }
}

impl Default for DefaultRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for DefaultRuntime {
    fn import(&self, name: &str) -> RunResult<Value> {
        self.modules
            .get(name)
            .map(|module| Value::Module(Rc::clone(module)))
            .ok_or_else(|| ExcType::ModuleNotFoundError.msg(format!("No module named '{name}'")))
    }

    fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.get(name).cloned()
    }
}

impl fmt::Debug for DefaultRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultRuntime")
            .field("builtins", &self.builtins.len())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An importable namespace of attributes.
pub struct Module {
    name: Rc<str>,
    attrs: RefCell<AHashMap<Rc<str>, Value>>,
}

impl Module {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            attrs: RefCell::new(AHashMap::new()),
        }
    }

    /// Builder-style attribute definition.
    #[must_use]
    pub fn with_attr(self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.attrs.borrow_mut().insert(Rc::from(name), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.attrs.borrow_mut().remove(name)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module({})", self.name)
    }
}

/// An object whose behavior is defined by the host.
///
/// Objects with a fixed layout may report a shape id plus slot indices; the
/// engine then caches attribute reads per call site and skips the name lookup
/// while the shape stays the same.
pub trait HostObject {
    fn type_name(&self) -> &'static str;

    fn get_attr(&self, name: &str) -> RunResult<Option<Value>> {
        let _ = name;
        Ok(None)
    }

    fn set_attr(&self, name: &str, value: Value) -> RunResult<()> {
        let _ = value;
        Err(ExcType::attribute_error(self.type_name(), name))
    }

    fn del_attr(&self, name: &str) -> RunResult<()> {
        Err(ExcType::attribute_error(self.type_name(), name))
    }

    fn call(&self, engine: &mut Engine, args: Vec<Value>) -> RunResult<Value> {
        let _ = (engine, args);
        Err(ExcType::not_callable(self.type_name()))
    }

    fn get_item(&self, key: &Value) -> RunResult<Value> {
        let _ = key;
        Err(ExcType::TypeError.msg(format!("'{}' object is not subscriptable", self.type_name())))
    }

    fn is_true(&self) -> bool {
        true
    }

    fn len(&self) -> Option<usize> {
        None
    }

    /// Identifies the current attribute layout; `None` opts out of attribute caching.
    fn shape_id(&self) -> Option<u64> {
        None
    }

    /// Slot holding `name` under the current shape.
    fn slot_of(&self, name: &str) -> Option<usize> {
        let _ = name;
        None
    }

    fn read_slot(&self, slot: usize) -> Option<Value> {
        let _ = slot;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_modules_are_not_found() {
        let runtime = DefaultRuntime::new();
        let err = runtime.import("nope").unwrap_err();
        assert_eq!(err.to_string(), "ModuleNotFoundError: No module named 'nope'");
    }

    #[test]
    fn registered_modules_import() {
        let mut runtime = DefaultRuntime::new();
        runtime.register_module(Module::new("consts").with_attr("answer", Value::Int(42)));
        let module = runtime.import("consts").unwrap();
        assert_eq!(runtime.get_attr(&module, "answer").unwrap(), Value::Int(42));
    }

    #[test]
    fn builtins_include_exception_types() {
        let runtime = DefaultRuntime::new();
        assert_eq!(runtime.builtin("ValueError"), Some(Value::ExcType(ExcType::ValueError)));
        assert!(matches!(runtime.builtin("len"), Some(Value::Native(_))));
        assert!(runtime.builtin("spam").is_none());
    }
}
