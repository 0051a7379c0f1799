//! Closure cells.
//!
//! A cell boxes one variable that a nested function captures. The enclosing
//! frame and every closure created from it hold the same `Rc<Cell>`, so writes
//! on either side are observed by the other.

use std::cell::{Cell as Flag, RefCell};

use crate::value::Value;

/// Shared mutable box for a captured variable; may be unbound.
#[derive(Debug, Default)]
pub struct Cell {
    value: RefCell<Option<Value>>,
    /// Set after the first assignment.
    assigned: Flag<bool>,
    /// Holds while at most one assignment has happened.
    finalized: Flag<bool>,
}

impl Cell {
    /// Creates an unbound cell.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            value: RefCell::new(None),
            assigned: Flag::new(false),
            finalized: Flag::new(true),
        }
    }

    #[must_use]
    pub fn with_value(value: Value) -> Self {
        let cell = Self::unbound();
        cell.set(value);
        cell
    }

    /// Current value, `None` when unbound.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        if self.assigned.replace(true) {
            self.finalized.set(false);
        }
        *self.value.borrow_mut() = Some(value);
    }

    /// Unbinds the cell (`del x` on a captured variable); returns whether it was bound.
    pub fn clear(&self) -> bool {
        self.finalized.set(false);
        self.value.borrow_mut().take().is_some()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Whether the cell has been written at most once.
    ///
    /// Informational only: the engine never relies on it for correctness.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn unbound_until_set() {
        let cell = Cell::unbound();
        assert!(!cell.is_bound());
        assert!(cell.get().is_none());
        cell.set(Value::Int(7));
        assert_eq!(cell.get(), Some(Value::Int(7)));
    }

    #[test]
    fn shared_cell_observes_writes_from_both_holders() {
        let outer = Rc::new(Cell::with_value(Value::Int(1)));
        let inner = Rc::clone(&outer);
        outer.set(Value::Int(2));
        assert_eq!(inner.get(), Some(Value::Int(2)));
        inner.set(Value::Int(3));
        assert_eq!(outer.get(), Some(Value::Int(3)));
    }

    #[test]
    fn second_write_invalidates_finalized() {
        let cell = Cell::unbound();
        assert!(cell.is_finalized());
        cell.set(Value::None);
        assert!(cell.is_finalized());
        cell.set(Value::None);
        assert!(!cell.is_finalized());
    }

    #[test]
    fn clear_unbinds() {
        let cell = Cell::with_value(Value::Bool(true));
        assert!(cell.clear());
        assert!(!cell.clear());
        assert!(!cell.is_bound());
    }
}
