//! Operator opcodes and their per-site caches.
//!
//! A site resolves to the operand kinds it first sees. While they keep
//! matching, the operation is computed inline; a mismatch re-opens the site
//! and repeated mismatches pin it to the runtime call-out.

use std::rc::Rc;

use super::Frame;
use crate::{
    bytecode::Opcode,
    engine::Engine,
    exception_private::{RunError, RunResult},
    inline_cache::SiteCache,
    ops::{float_binary, int_binary, BinaryOp, CompareOp},
    value::Value,
};

impl Engine {
    pub(super) fn binary(&mut self, frame: &mut Frame, opcode: Opcode) -> RunResult<()> {
        let op = opcode
            .binary_op()
            .ok_or_else(|| RunError::internal("binary dispatch on a non-operator opcode"))?;
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        let result = match self.cached_binary(frame, op, &lhs, &rhs) {
            Some(result) => result?,
            None => self.runtime.binary_op(op, &lhs, &rhs)?,
        };
        frame.push(result)
    }

    pub(super) fn compare(&mut self, frame: &mut Frame, opcode: Opcode) -> RunResult<()> {
        let op = opcode
            .compare_op()
            .ok_or_else(|| RunError::internal("compare dispatch on a non-comparison opcode"))?;
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        let result = match self.cached_compare(frame, op, &lhs, &rhs) {
            Some(result) => result,
            None => self.runtime.compare(op, &lhs, &rhs)?,
        };
        frame.push(Value::Bool(result))
    }

    pub(super) fn unary(&mut self, frame: &mut Frame, opcode: Opcode) -> RunResult<()> {
        let op = opcode
            .unary_op()
            .ok_or_else(|| RunError::internal("unary dispatch on a non-operator opcode"))?;
        let operand = frame.pop()?;
        let result = self.runtime.unary_op(op, &operand)?;
        frame.push(result)
    }

    /// Whether operator sites may compute results inline.
    fn operator_caching(&self) -> bool {
        self.config.specialize && self.runtime.primitive_fast_paths()
    }

    /// `None` when the site has no usable specialization and the runtime must decide.
    fn cached_binary(&mut self, frame: &Frame, op: BinaryOp, lhs: &Value, rhs: &Value) -> Option<RunResult<Value>> {
        if !self.operator_caching() {
            return None;
        }
        let mut profile = frame.profile.borrow_mut();
        let site = profile.site(frame.instr_pc)?;
        if site.is_unresolved() {
            site.cache = match (lhs, rhs) {
                (Value::Int(_), Value::Int(_)) => SiteCache::IntInt,
                (Value::Float(_), Value::Float(_)) if float_arithmetic(op) => SiteCache::FloatFloat,
                (Value::Str(_), Value::Str(_)) if op == BinaryOp::Add => SiteCache::StrStr,
                _ => SiteCache::Generic,
            };
            self.stats.resolved_sites += 1;
        }

        let outcome = match (&site.cache, lhs, rhs) {
            (SiteCache::Generic, ..) => return None,
            (SiteCache::IntInt, Value::Int(a), Value::Int(b)) => Some(int_binary(op, *a, *b)),
            (SiteCache::FloatFloat, Value::Float(a), Value::Float(b)) => float_binary(op, *a, *b),
            (SiteCache::StrStr, Value::Str(a), Value::Str(b)) => {
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                Some(Ok(Value::Str(Rc::from(joined))))
            }
            _ => None,
        };
        if outcome.is_some() {
            self.stats.cache_hits += 1;
        } else {
            site.miss();
            self.stats.cache_misses += 1;
        }
        outcome
    }

    fn cached_compare(&mut self, frame: &Frame, op: CompareOp, lhs: &Value, rhs: &Value) -> Option<bool> {
        if !self.operator_caching() {
            return None;
        }
        let mut profile = frame.profile.borrow_mut();
        let site = profile.site(frame.instr_pc)?;
        if site.is_unresolved() {
            site.cache = match (lhs, rhs) {
                (Value::Int(_), Value::Int(_)) => SiteCache::IntInt,
                (Value::Float(_), Value::Float(_)) => SiteCache::FloatFloat,
                (Value::Str(_), Value::Str(_)) => SiteCache::StrStr,
                _ => SiteCache::Generic,
            };
            self.stats.resolved_sites += 1;
        }

        let outcome = match (&site.cache, lhs, rhs) {
            (SiteCache::Generic, ..) => return None,
            (SiteCache::IntInt, Value::Int(a), Value::Int(b)) => Some(op.matches(a.cmp(b))),
            (SiteCache::FloatFloat, Value::Float(a), Value::Float(b)) => Some(match a.partial_cmp(b) {
                Some(ordering) => op.matches(ordering),
                None => op == CompareOp::Ne,
            }),
            (SiteCache::StrStr, Value::Str(a), Value::Str(b)) => Some(op.matches(a.as_ref().cmp(b.as_ref()))),
            _ => None,
        };
        if outcome.is_some() {
            self.stats.cache_hits += 1;
        } else {
            site.miss();
            self.stats.cache_misses += 1;
        }
        outcome
    }
}

/// Operators floats implement; bitwise ones always go to the runtime for its error.
fn float_arithmetic(op: BinaryOp) -> bool {
    !matches!(
        op,
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::LShift | BinaryOp::RShift
    )
}
