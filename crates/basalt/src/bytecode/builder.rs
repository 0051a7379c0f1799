//! `CodeBuilder` for emitting bytecode.
//!
//! The builder tracks the operand stack depth as instructions are emitted and
//! records the maximum as the code unit's stack size. After an unconditional
//! transfer (jump, return, raise) the depth at the next instruction is whatever
//! the caller declares with [`CodeBuilder::set_stack_depth`], which is also how
//! handler entry points and loop exits are described.

use num_bigint::BigInt;

use super::{
    code::{CodeError, CodeFlags, CodeParts, CodeUnit, ExceptionHandlerTable, ExceptionRange},
    op::Opcode,
};
use crate::value::Value;

/// A forward jump whose offset is patched once the target is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a jump label must be patched"]
pub struct JumpLabel(usize);

/// Incremental code unit construction.
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    ints: Vec<i64>,
    floats: Vec<f64>,
    big_ints: Vec<BigInt>,
    strings: Vec<String>,
    bytes: Vec<Vec<u8>>,
    names: Vec<String>,
    local_names: Vec<String>,
    cell_names: Vec<String>,
    free_names: Vec<String>,
    arg_count: u16,
    flags: CodeFlags,
    cell_args: Vec<(u16, u16)>,
    exception_entries: Vec<ExceptionRange>,
    lines: Vec<(u32, u32)>,
    first_line: Option<u32>,
    stack_depth: i32,
    max_stack_depth: i32,
    /// First error hit while emitting, reported by `build()`.
    error: Option<CodeError>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bytecode: Vec::new(),
            constants: Vec::new(),
            ints: Vec::new(),
            floats: Vec::new(),
            big_ints: Vec::new(),
            strings: Vec::new(),
            bytes: Vec::new(),
            names: Vec::new(),
            local_names: Vec::new(),
            cell_names: Vec::new(),
            free_names: Vec::new(),
            arg_count: 0,
            flags: CodeFlags::empty(),
            cell_args: Vec::new(),
            exception_entries: Vec::new(),
            lines: Vec::new(),
            first_line: None,
            stack_depth: 0,
            max_stack_depth: 0,
            error: None,
        }
    }

    fn fail(&mut self, error: CodeError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn index(&mut self, len: usize, what: &'static str) -> u16 {
        u16::try_from(len).unwrap_or_else(|_| {
            self.fail(CodeError::TooLarge { what });
            0
        })
    }

    /// Adds flags such as [`CodeFlags::GENERATOR`].
    pub fn set_flags(&mut self, flags: CodeFlags) {
        self.flags = self.flags | flags;
    }

    /// Declares the next positional parameter. Parameters must come before other locals.
    pub fn add_param(&mut self, name: &str) -> u16 {
        let slot = self.index(self.local_names.len(), "locals");
        self.local_names.push(name.to_owned());
        self.arg_count += 1;
        slot
    }

    /// Declares the `*args` parameter, which receives surplus positional arguments as a tuple.
    pub fn add_varargs(&mut self, name: &str) -> u16 {
        let slot = self.index(self.local_names.len(), "locals");
        self.local_names.push(name.to_owned());
        self.flags = self.flags | CodeFlags::VARARGS;
        slot
    }

    /// Returns the slot of a local, registering it on first use.
    pub fn add_local(&mut self, name: &str) -> u16 {
        if let Some(slot) = self.local_names.iter().position(|n| n == name) {
            return self.index(slot, "locals");
        }
        let slot = self.index(self.local_names.len(), "locals");
        self.local_names.push(name.to_owned());
        slot
    }

    /// Declares a cell for a variable captured by nested closures.
    ///
    /// If `name` is a parameter, the cell is initialized from the argument on
    /// entry. Cells must be declared before free variables.
    pub fn add_cell_var(&mut self, name: &str) -> u16 {
        let cell = self.index(self.cell_names.len(), "cells");
        self.cell_names.push(name.to_owned());
        let params = usize::from(self.arg_count) + usize::from(self.flags.has_varargs());
        if let Some(param) = self.local_names[..params.min(self.local_names.len())].iter().position(|n| n == name) {
            let param = self.index(param, "locals");
            self.cell_args.push((cell, param));
        }
        cell
    }

    /// Declares a free variable; returns its index in the combined cell/free space.
    pub fn add_free_var(&mut self, name: &str) -> u16 {
        let index = self.index(self.cell_names.len() + self.free_names.len(), "cells");
        self.free_names.push(name.to_owned());
        index
    }

    /// Registers a global, attribute or module name.
    pub fn add_name(&mut self, name: &str) -> u16 {
        let index = self.names.iter().position(|n| n == name).unwrap_or(self.names.len());
        if index == self.names.len() {
            self.names.push(name.to_owned());
        }
        self.index(index, "names")
    }

    pub fn add_const(&mut self, value: Value) -> u16 {
        self.constants.push(value);
        self.index(self.constants.len() - 1, "constants")
    }

    pub fn add_int(&mut self, value: i64) -> u16 {
        let index = self.ints.iter().position(|&v| v == value).unwrap_or(self.ints.len());
        if index == self.ints.len() {
            self.ints.push(value);
        }
        self.index(index, "ints")
    }

    pub fn add_float(&mut self, value: f64) -> u16 {
        let index = self
            .floats
            .iter()
            .position(|v| v.to_bits() == value.to_bits())
            .unwrap_or(self.floats.len());
        if index == self.floats.len() {
            self.floats.push(value);
        }
        self.index(index, "floats")
    }

    pub fn add_big_int(&mut self, value: BigInt) -> u16 {
        self.big_ints.push(value);
        self.index(self.big_ints.len() - 1, "big_ints")
    }

    pub fn add_str(&mut self, value: &str) -> u16 {
        let index = self.strings.iter().position(|s| s == value).unwrap_or(self.strings.len());
        if index == self.strings.len() {
            self.strings.push(value.to_owned());
        }
        self.index(index, "strings")
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> u16 {
        self.bytes.push(value.to_vec());
        self.index(self.bytes.len() - 1, "bytes")
    }

    /// Current bytecode offset; the next instruction starts here.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Records the source line of the instructions emitted from here on.
    pub fn set_location(&mut self, line: u32) {
        self.first_line.get_or_insert(line);
        let offset = u32::try_from(self.bytecode.len()).unwrap_or(u32::MAX);
        match self.lines.last_mut() {
            Some((_, last_line)) if *last_line == line => {}
            Some((last_offset, last_line)) if *last_offset == offset => *last_line = line,
            _ => self.lines.push((offset, line)),
        }
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        u16::try_from(self.stack_depth.max(0)).unwrap_or(u16::MAX)
    }

    /// Declares the stack depth at the current offset, e.g. at a handler entry.
    pub fn set_stack_depth(&mut self, depth: u16) {
        self.stack_depth = i32::from(depth);
        self.max_stack_depth = self.max_stack_depth.max(self.stack_depth);
    }

    fn adjust_stack(&mut self, offset: usize, effect: i32) {
        self.stack_depth += effect;
        if self.stack_depth < 0 {
            self.fail(CodeError::StackUnderflow { offset });
            self.stack_depth = 0;
        }
        self.max_stack_depth = self.max_stack_depth.max(self.stack_depth);
    }

    fn emit_raw(&mut self, op: Opcode, operands: &[u8], effect: i32) {
        let offset = self.bytecode.len();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(operands);
        self.adjust_stack(offset, effect);
    }

    /// Emits an instruction without operands.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert_eq!(op.operand_len(), 0, "{op:?} takes operands");
        self.emit_raw(op, &[], stack_effect(op, 0, 0));
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        debug_assert_eq!(op.operand_len(), 1, "{op:?} does not take a u8");
        self.emit_raw(op, &[operand], stack_effect(op, u32::from(operand), 0));
    }

    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.emit_raw(op, &operand.to_le_bytes(), stack_effect(op, 0, 0));
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        debug_assert_eq!(op.operand_len(), 2, "{op:?} does not take a u16");
        self.emit_raw(op, &operand.to_le_bytes(), stack_effect(op, u32::from(operand), 0));
    }

    pub fn emit_u16_u8(&mut self, op: Opcode, first: u16, second: u8) {
        debug_assert_eq!(op.operand_len(), 3, "{op:?} does not take u16 + u8");
        let [lo, hi] = first.to_le_bytes();
        self.emit_raw(op, &[lo, hi, second], stack_effect(op, u32::from(first), second));
    }

    pub fn emit_load_local(&mut self, slot: u16) {
        match u8::try_from(slot) {
            Ok(slot) => self.emit_u8(Opcode::LoadLocal, slot),
            Err(_) => self.emit_u16(Opcode::LoadLocalW, slot),
        }
    }

    pub fn emit_store_local(&mut self, slot: u16) {
        match u8::try_from(slot) {
            Ok(slot) => self.emit_u8(Opcode::StoreLocal, slot),
            Err(_) => self.emit_u16(Opcode::StoreLocalW, slot),
        }
    }

    /// Pushes an integer, inline when it fits in an i8.
    pub fn emit_load_int(&mut self, value: i64) {
        match i8::try_from(value) {
            Ok(small) => self.emit_i8(Opcode::LoadSmallInt, small),
            Err(_) => {
                let index = self.add_int(value);
                self.emit_u16(Opcode::LoadInt, index);
            }
        }
    }

    pub fn emit_load_str(&mut self, value: &str) {
        let index = self.add_str(value);
        self.emit_u16(Opcode::LoadStr, index);
    }

    pub fn emit_load_const(&mut self, value: Value) {
        let index = self.add_const(value);
        self.emit_u16(Opcode::LoadConst, index);
    }

    pub fn emit_return_none(&mut self) {
        self.emit(Opcode::ReturnNone);
    }

    /// Emits a forward jump with a placeholder offset.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        debug_assert!(op.is_relative_jump(), "{op:?} is not a relative jump");
        let label = JumpLabel(self.bytecode.len() + 1);
        self.emit_raw(op, &[0, 0], stack_effect(op, 0, 0));
        label
    }

    /// Points a forward jump at the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let instruction_end = label.0 + 2;
        let delta = self.bytecode.len() as i64 - instruction_end as i64;
        let delta = i16::try_from(delta).unwrap_or_else(|_| {
            self.fail(CodeError::TooLarge { what: "jump distance" });
            0
        });
        self.bytecode[label.0..label.0 + 2].copy_from_slice(&delta.to_le_bytes());
    }

    /// Emits a loop back-edge to `target`, an earlier instruction offset.
    pub fn emit_jump_back(&mut self, target: usize) {
        let distance = self.bytecode.len().saturating_sub(target);
        let distance = u16::try_from(distance).unwrap_or_else(|_| {
            self.fail(CodeError::TooLarge { what: "jump distance" });
            0
        });
        self.emit_u16(Opcode::JumpBackward, distance);
    }

    /// Adds a handler range. Ranges may be added in any order.
    pub fn add_exception_entry(&mut self, range: ExceptionRange) {
        self.exception_entries.push(range);
    }

    /// Finishes the code unit, validating it.
    pub fn build(mut self) -> Result<CodeUnit, CodeError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        let stack_size = u16::try_from(self.max_stack_depth).map_err(|_| CodeError::TooLarge { what: "stack slots" })?;
        // nested ranges are shorter than the ranges enclosing them
        self.exception_entries.sort_by_key(|range| range.end - range.start.min(range.end));
        CodeUnit::from_parts(CodeParts {
            name: self.name,
            bytecode: self.bytecode,
            constants: self.constants,
            ints: self.ints,
            floats: self.floats,
            big_ints: self.big_ints,
            strings: self.strings,
            bytes: self.bytes,
            names: self.names,
            local_names: self.local_names,
            cell_names: self.cell_names,
            free_names: self.free_names,
            arg_count: self.arg_count,
            flags: self.flags,
            stack_size,
            exception_table: ExceptionHandlerTable::new(self.exception_entries),
            cell_args: self.cell_args,
            lines: self.lines,
            first_line: self.first_line.unwrap_or(1),
        })
    }
}

/// Net stack effect of an instruction on the fall-through path.
fn stack_effect(op: Opcode, operand: u32, extra: u8) -> i32 {
    let n = i32::try_from(operand).unwrap_or(i32::MAX);
    match op {
        Opcode::Nop
        | Opcode::Rot2
        | Opcode::Rot3
        | Opcode::Rot4
        | Opcode::DeleteLocal
        | Opcode::DeleteDeref
        | Opcode::DeleteGlobal
        | Opcode::DeleteName
        | Opcode::UnaryNot
        | Opcode::UnaryNeg
        | Opcode::UnaryPos
        | Opcode::UnaryInvert
        | Opcode::LoadAttr
        | Opcode::Jump
        | Opcode::JumpBackward
        | Opcode::GetIter
        | Opcode::Reraise
        | Opcode::CheckExcMatch
        | Opcode::PopExcept
        | Opcode::ReturnNone
        | Opcode::Yield
        | Opcode::CallFunction0 => 0,
        Opcode::Dup
        | Opcode::LoadConst
        | Opcode::LoadNone
        | Opcode::LoadTrue
        | Opcode::LoadFalse
        | Opcode::LoadSmallInt
        | Opcode::LoadInt
        | Opcode::LoadFloat
        | Opcode::LoadBigInt
        | Opcode::LoadStr
        | Opcode::LoadBytes
        | Opcode::LoadLocal
        | Opcode::LoadLocalW
        | Opcode::LoadDeref
        | Opcode::LoadClosure
        | Opcode::LoadGlobal
        | Opcode::LoadName
        | Opcode::LoadAssertionError
        | Opcode::ForIter
        | Opcode::ImportName
        | Opcode::ImportFrom => 1,
        Opcode::DupTwo => 2,
        Opcode::Pop
        | Opcode::StoreLocal
        | Opcode::StoreLocalW
        | Opcode::StoreDeref
        | Opcode::StoreGlobal
        | Opcode::StoreName
        | Opcode::BinaryAdd
        | Opcode::BinarySub
        | Opcode::BinaryMul
        | Opcode::BinaryDiv
        | Opcode::BinaryFloorDiv
        | Opcode::BinaryMod
        | Opcode::BinaryPow
        | Opcode::BinaryAnd
        | Opcode::BinaryOr
        | Opcode::BinaryXor
        | Opcode::BinaryLShift
        | Opcode::BinaryRShift
        | Opcode::CompareEq
        | Opcode::CompareNe
        | Opcode::CompareLt
        | Opcode::CompareLe
        | Opcode::CompareGt
        | Opcode::CompareGe
        | Opcode::CompareIs
        | Opcode::CompareIsNot
        | Opcode::CompareIn
        | Opcode::CompareNotIn
        | Opcode::BinarySubscr
        | Opcode::DeleteAttr
        | Opcode::JumpIfTrue
        | Opcode::JumpIfFalse
        | Opcode::JumpIfTrueOrPop
        | Opcode::JumpIfFalseOrPop
        | Opcode::CallFunction1
        | Opcode::CallFunctionVarargs
        | Opcode::Raise
        | Opcode::ReturnValue => -1,
        Opcode::StoreAttr | Opcode::DeleteSubscr | Opcode::RaiseFrom | Opcode::CallFunction2 => -2,
        Opcode::StoreSubscr | Opcode::CallFunction3 => -3,
        Opcode::CallFunction4 => -4,
        Opcode::CallFunction => -n,
        Opcode::BuildList | Opcode::BuildTuple | Opcode::BuildSet => 1 - n,
        Opcode::BuildDict => 1 - 2 * n,
        Opcode::UnpackSequence => n - 1,
        Opcode::CallMethod => -i32::from(extra),
        Opcode::MakeFunction => 1 - i32::from(extra & 1) - i32::from((extra >> 1) & 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_maximum_stack_depth() {
        let mut b = CodeBuilder::new("f");
        b.emit_load_int(1);
        b.emit_load_int(2);
        b.emit_load_int(3);
        b.emit_u16(Opcode::BuildTuple, 3);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.stack_size(), 3);
    }

    #[test]
    fn large_ints_go_to_the_pool() {
        let mut b = CodeBuilder::new("f");
        b.emit_load_int(1_000);
        b.emit_load_int(1_000);
        b.emit(Opcode::Pop);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.bytecode()[0], Opcode::LoadInt as u8);
        assert_eq!(code.int(0), 1_000);
        // deduplicated
        assert_eq!(code.bytecode()[4..6], [0, 0]);
    }

    #[test]
    fn forward_jumps_are_patched_relative_to_instruction_end() {
        let mut b = CodeBuilder::new("f");
        b.emit(Opcode::LoadTrue);
        let label = b.emit_jump(Opcode::JumpIfFalse);
        b.emit(Opcode::Nop);
        b.patch_jump(label);
        b.emit_return_none();
        let code = b.build().unwrap();
        assert_eq!(code.bytecode()[2..4], 1i16.to_le_bytes());
    }

    #[test]
    fn back_edges_measure_from_instruction_start() {
        let mut b = CodeBuilder::new("f");
        let top = b.current_offset();
        b.emit(Opcode::Nop);
        b.emit_jump_back(top);
        let code = b.build().unwrap();
        assert_eq!(code.bytecode()[1], Opcode::JumpBackward as u8);
        assert_eq!(code.bytecode()[2..4], 1u16.to_le_bytes());
    }

    #[test]
    fn underflow_is_reported_at_build() {
        let mut b = CodeBuilder::new("f");
        b.emit(Opcode::Pop);
        b.emit_return_none();
        assert_eq!(b.build().unwrap_err(), CodeError::StackUnderflow { offset: 0 });
    }

    #[test]
    fn ranges_are_ordered_innermost_first() {
        let mut b = CodeBuilder::new("f");
        for _ in 0..4 {
            b.emit(Opcode::Nop);
        }
        b.emit_return_none();
        b.add_exception_entry(ExceptionRange::new(0, 4, 4, 0));
        b.add_exception_entry(ExceptionRange::new(1, 2, 4, 0));
        let code = b.build().unwrap();
        assert_eq!(code.exception_table().ranges()[0], ExceptionRange::new(1, 2, 4, 0));
    }

    #[test]
    fn captured_parameters_become_cell_args() {
        let mut b = CodeBuilder::new("outer");
        b.add_param("x");
        let cell = b.add_cell_var("x");
        b.emit_return_none();
        let code = b.build().unwrap();
        assert_eq!(code.cell_args(), &[(cell, 0)]);
    }

    #[test]
    fn line_table_merges_repeats() {
        let mut b = CodeBuilder::new("f");
        b.set_location(3);
        b.emit(Opcode::Nop);
        b.set_location(3);
        b.emit(Opcode::Nop);
        b.set_location(4);
        b.emit_return_none();
        let code = b.build().unwrap();
        assert_eq!(code.first_line(), 3);
        assert_eq!(code.line_for(1), 3);
        assert_eq!(code.line_for(2), 4);
    }
}
