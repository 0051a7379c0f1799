//! Container builds and sequence unpacking.

use std::{cell::RefCell, rc::Rc};

use super::Frame;
use crate::{
    engine::Engine,
    exception_private::{ExcType, RunResult},
    value::{Dict, HashKey, Set, Value},
};

impl Engine {
    /// `BuildDict n`: pops `n` key/value pairs, later keys overwriting earlier ones.
    pub(super) fn build_dict(&mut self, frame: &mut Frame, pairs: usize) -> RunResult<()> {
        let items = frame.pop_n(pairs * 2)?;
        let mut dict = Dict::with_capacity_and_hasher(pairs, ahash::RandomState::default());
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            dict.insert(HashKey::new(key)?, value);
        }
        frame.push(Value::Dict(Rc::new(RefCell::new(dict))))
    }

    pub(super) fn build_set(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let items = frame.pop_n(count)?;
        let mut set = Set::with_capacity_and_hasher(count, ahash::RandomState::default());
        for item in items {
            set.insert(HashKey::new(item)?);
        }
        frame.push(Value::Set(Rc::new(RefCell::new(set))))
    }

    /// Replaces the top of stack with its `count` items, the first item on top.
    pub(super) fn unpack_sequence(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let seq = frame.pop()?;
        let items: Vec<Value> = match &seq {
            Value::Tuple(items) => items.to_vec(),
            Value::List(items) => items.borrow().clone(),
            other => self.with_context(frame, |engine| engine.iterate(other))?,
        };
        if items.len() < count {
            return Err(ExcType::ValueError.msg(format!(
                "not enough values to unpack (expected {count}, got {})",
                items.len()
            )));
        }
        if items.len() > count {
            return Err(ExcType::ValueError.msg(format!("too many values to unpack (expected {count})")));
        }
        for item in items.into_iter().rev() {
            frame.push(item)?;
        }
        Ok(())
    }
}
