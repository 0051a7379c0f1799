use std::{
    cell::{Cell as Flag, RefCell},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;

use crate::value::Value;

static NEXT_GLOBALS_ID: AtomicU64 = AtomicU64::new(1);

/// Module-level namespace shared by every function defined against it.
///
/// Each namespace has a process-unique id and a version counter bumped on every
/// store or delete; global-name site caches are keyed on both.
#[derive(Debug)]
pub struct Globals {
    id: u64,
    version: Flag<u64>,
    names: RefCell<AHashMap<Rc<str>, Value>>,
}

impl Globals {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_GLOBALS_ID.fetch_add(1, Ordering::Relaxed),
            version: Flag::new(0),
            names: RefCell::new(AHashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.names.borrow().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.names.borrow_mut().insert(Rc::from(name), value);
        self.bump();
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.names.borrow_mut().remove(name);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.borrow().is_empty()
    }

    fn bump(&self) {
        self.version.set(self.version.get().wrapping_add(1));
    }
}

impl Default for Globals {
    fn default() -> Self {
        Self::new()
    }
}
