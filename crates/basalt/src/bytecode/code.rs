//! Code units: the immutable compiled form of one function body.

use std::{fmt, ops::BitOr, rc::Rc};

use num_bigint::BigInt;

use super::op::Opcode;
use crate::{generator::GeneratorKind, value::Value};

/// Per-unit flags set by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodeFlags(u8);

impl CodeFlags {
    /// Calling the function creates a generator instead of running the body.
    pub const GENERATOR: Self = Self(1);
    /// Calling the function creates a coroutine.
    pub const COROUTINE: Self = Self(1 << 1);
    /// Calling the function creates an async generator.
    pub const ASYNC_GENERATOR: Self = Self(1 << 2);
    /// Surplus positional arguments are collected into a tuple in the slot after the parameters.
    pub const VARARGS: Self = Self(1 << 3);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn has_varargs(self) -> bool {
        self.contains(Self::VARARGS)
    }

    /// The kind of suspendable object this code creates, `None` for ordinary functions.
    #[must_use]
    pub fn generator_kind(self) -> Option<GeneratorKind> {
        if self.contains(Self::ASYNC_GENERATOR) {
            Some(GeneratorKind::AsyncGenerator)
        } else if self.contains(Self::COROUTINE) {
            Some(GeneratorKind::Coroutine)
        } else if self.contains(Self::GENERATOR) {
            Some(GeneratorKind::Generator)
        } else {
            None
        }
    }
}

impl BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One exception handler range: failures at offsets in `[start, end)` jump to
/// `handler` after truncating the operand stack to `stack_depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub stack_depth: u16,
}

impl ExceptionRange {
    #[must_use]
    pub fn new(start: u32, end: u32, handler: u32, stack_depth: u16) -> Self {
        Self {
            start,
            end,
            handler,
            stack_depth,
        }
    }

    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Whether `other` lies inside this range.
    #[must_use]
    pub fn encloses(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether `other` lies inside this range (and is not identical to it).
    fn strictly_encloses(&self, other: &Self) -> bool {
        self.encloses(other) && (self.start, self.end) != (other.start, other.end)
    }
}

/// Handler ranges of a code unit, ordered innermost-first.
///
/// Lookup is a linear scan that returns the first containing range; the
/// ordering invariant is checked when the code unit is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionHandlerTable {
    ranges: Vec<ExceptionRange>,
}

impl ExceptionHandlerTable {
    #[must_use]
    pub fn new(ranges: Vec<ExceptionRange>) -> Self {
        Self { ranges }
    }

    /// Decodes the flat triple encoding `(start, end, depth)`.
    ///
    /// The handler starts where the protected range ends; the stack depth is
    /// stored in the low 16 bits of the third word.
    pub fn from_triples(words: &[u32]) -> Result<Self, CodeError> {
        if words.len() % 3 != 0 {
            return Err(CodeError::TruncatedTable { len: words.len() });
        }
        let ranges = words
            .chunks_exact(3)
            .map(|triple| ExceptionRange::new(triple[0], triple[1], triple[1], (triple[2] & 0xffff) as u16))
            .collect();
        Ok(Self { ranges })
    }

    /// The innermost range containing `offset`.
    #[must_use]
    pub fn find(&self, offset: usize) -> Option<&ExceptionRange> {
        let offset = u32::try_from(offset).ok()?;
        self.ranges.iter().find(|range| range.contains(offset))
    }

    #[must_use]
    pub fn ranges(&self) -> &[ExceptionRange] {
        &self.ranges
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Raw material for a code unit, as produced by a compiler.
#[derive(Debug, Default)]
pub struct CodeParts {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub constants: Vec<Value>,
    pub ints: Vec<i64>,
    pub floats: Vec<f64>,
    pub big_ints: Vec<BigInt>,
    pub strings: Vec<String>,
    pub bytes: Vec<Vec<u8>>,
    /// Global, attribute and module names referenced by operands.
    pub names: Vec<String>,
    /// Parameters first (plus the varargs slot), then other locals.
    pub local_names: Vec<String>,
    pub cell_names: Vec<String>,
    pub free_names: Vec<String>,
    pub arg_count: u16,
    pub flags: CodeFlags,
    pub stack_size: u16,
    pub exception_table: ExceptionHandlerTable,
    /// `(cell index, parameter slot)`: cells initialized from an argument on entry.
    pub cell_args: Vec<(u16, u16)>,
    /// `(offset, line)` pairs sorted by offset.
    pub lines: Vec<(u32, u32)>,
    pub first_line: u32,
}

/// Immutable compiled function body, shared by every activation.
pub struct CodeUnit {
    name: Rc<str>,
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    ints: Vec<i64>,
    floats: Vec<f64>,
    big_ints: Vec<Value>,
    strings: Vec<Value>,
    bytes: Vec<Value>,
    names: Vec<Rc<str>>,
    local_names: Vec<Rc<str>>,
    cell_names: Vec<Rc<str>>,
    free_names: Vec<Rc<str>>,
    arg_count: u16,
    flags: CodeFlags,
    stack_size: u16,
    exception_table: ExceptionHandlerTable,
    cell_args: Vec<(u16, u16)>,
    lines: Vec<(u32, u32)>,
    first_line: u32,
}

fn rc_names(names: Vec<String>) -> Vec<Rc<str>> {
    names.into_iter().map(Rc::from).collect()
}

impl CodeUnit {
    /// Validates and assembles a code unit.
    pub fn from_parts(parts: CodeParts) -> Result<Self, CodeError> {
        let code = Self {
            name: Rc::from(parts.name),
            bytecode: parts.bytecode,
            constants: parts.constants,
            ints: parts.ints,
            floats: parts.floats,
            big_ints: parts.big_ints.into_iter().map(Value::from_bigint).collect(),
            strings: parts.strings.iter().map(|s| Value::str(s)).collect(),
            bytes: parts.bytes.into_iter().map(|b| Value::Bytes(b.into())).collect(),
            names: rc_names(parts.names),
            local_names: rc_names(parts.local_names),
            cell_names: rc_names(parts.cell_names),
            free_names: rc_names(parts.free_names),
            arg_count: parts.arg_count,
            flags: parts.flags,
            stack_size: parts.stack_size,
            exception_table: parts.exception_table,
            cell_args: parts.cell_args,
            lines: parts.lines,
            first_line: parts.first_line,
        };
        code.validate()?;
        Ok(code)
    }

    fn validate(&self) -> Result<(), CodeError> {
        let params = usize::from(self.arg_count) + usize::from(self.flags.has_varargs());
        if params > self.local_names.len() {
            return Err(CodeError::ParamsExceedLocals {
                params,
                locals: self.local_names.len(),
            });
        }
        for &(cell, param) in &self.cell_args {
            if usize::from(cell) >= self.cell_names.len() || usize::from(param) >= params {
                return Err(CodeError::BadCellArg { cell, param });
            }
        }

        let boundaries = self.instruction_starts()?;
        let is_start = |offset: usize| boundaries.binary_search(&offset).is_ok();

        let mut last = None;
        for &offset in &boundaries {
            let op = self.opcode_at(offset)?;
            self.validate_operands(offset, op, &is_start)?;
            last = Some(op);
        }
        match last {
            None => return Err(CodeError::Empty),
            Some(op) if !op.is_terminal() => return Err(CodeError::FallsOffEnd),
            Some(_) => {}
        }

        self.validate_handlers(&is_start)
    }

    /// Offsets of every instruction, checking that operands fit in the stream.
    fn instruction_starts(&self) -> Result<Vec<usize>, CodeError> {
        let mut starts = Vec::new();
        let mut offset = 0;
        while offset < self.bytecode.len() {
            let op = self.opcode_at(offset)?;
            let next = offset + 1 + op.operand_len();
            if next > self.bytecode.len() {
                return Err(CodeError::TruncatedOperand { offset });
            }
            starts.push(offset);
            offset = next;
        }
        Ok(starts)
    }

    fn opcode_at(&self, offset: usize) -> Result<Opcode, CodeError> {
        let byte = self.bytecode[offset];
        Opcode::try_from(byte).map_err(|_| CodeError::InvalidOpcode { offset, byte })
    }

    fn u16_at(&self, offset: usize) -> usize {
        usize::from(u16::from_le_bytes([self.bytecode[offset], self.bytecode[offset + 1]]))
    }

    fn validate_operands(&self, offset: usize, op: Opcode, is_start: &impl Fn(usize) -> bool) -> Result<(), CodeError> {
        let check = |pool: &'static str, index: usize, len: usize| {
            if index < len {
                Ok(())
            } else {
                Err(CodeError::IndexOutOfRange {
                    offset,
                    pool,
                    index,
                    len,
                })
            }
        };
        let operand = offset + 1;
        let derefs = self.cell_names.len() + self.free_names.len();
        match op {
            Opcode::LoadConst => check("constants", self.u16_at(operand), self.constants.len()),
            Opcode::LoadInt => check("ints", self.u16_at(operand), self.ints.len()),
            Opcode::LoadFloat => check("floats", self.u16_at(operand), self.floats.len()),
            Opcode::LoadBigInt => check("big_ints", self.u16_at(operand), self.big_ints.len()),
            Opcode::LoadStr => check("strings", self.u16_at(operand), self.strings.len()),
            Opcode::LoadBytes => check("bytes", self.u16_at(operand), self.bytes.len()),
            Opcode::LoadLocal | Opcode::StoreLocal => {
                check("locals", usize::from(self.bytecode[operand]), self.local_names.len())
            }
            Opcode::LoadLocalW | Opcode::StoreLocalW | Opcode::DeleteLocal => {
                check("locals", self.u16_at(operand), self.local_names.len())
            }
            Opcode::LoadDeref | Opcode::StoreDeref | Opcode::DeleteDeref | Opcode::LoadClosure => {
                check("cells", self.u16_at(operand), derefs)
            }
            Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::CallMethod => check("names", self.u16_at(operand), self.names.len()),
            Opcode::MakeFunction => {
                let index = self.u16_at(operand);
                check("constants", index, self.constants.len())?;
                if matches!(self.constants[index], Value::Code(_)) {
                    Ok(())
                } else {
                    Err(CodeError::NotACodeConstant { offset, index })
                }
            }
            Opcode::Yield if self.flags.generator_kind().is_none() => Err(CodeError::YieldOutsideGenerator { offset }),
            op if op.is_relative_jump() => {
                let delta = i16::from_le_bytes([self.bytecode[operand], self.bytecode[operand + 1]]);
                let end = offset + 1 + op.operand_len();
                self.check_target(offset, end as i64 + i64::from(delta), is_start)
            }
            Opcode::JumpBackward => {
                let distance = self.u16_at(operand);
                self.check_target(offset, offset as i64 - distance as i64, is_start)
            }
            _ => Ok(()),
        }
    }

    fn check_target(&self, offset: usize, target: i64, is_start: &impl Fn(usize) -> bool) -> Result<(), CodeError> {
        match usize::try_from(target) {
            Ok(t) if t < self.bytecode.len() => {
                if is_start(t) {
                    Ok(())
                } else {
                    Err(CodeError::JumpIntoInstruction { offset, target: t })
                }
            }
            _ => Err(CodeError::JumpOutOfBounds { offset, target }),
        }
    }

    fn validate_handlers(&self, is_start: &impl Fn(usize) -> bool) -> Result<(), CodeError> {
        let len = self.bytecode.len();
        let ranges = self.exception_table.ranges();
        for (index, range) in ranges.iter().enumerate() {
            if range.start > range.end || range.end as usize > len {
                return Err(CodeError::MalformedRange {
                    index,
                    start: range.start,
                    end: range.end,
                });
            }
            let handler = range.handler as usize;
            if handler >= len || !is_start(handler) {
                return Err(CodeError::HandlerOutOfBounds {
                    index,
                    handler: range.handler,
                });
            }
            if range.stack_depth > self.stack_size {
                return Err(CodeError::HandlerDepth {
                    index,
                    depth: range.stack_depth,
                    stack_size: self.stack_size,
                });
            }
            if let Some(inner) = ranges[index + 1..].iter().position(|later| range.strictly_encloses(later)) {
                return Err(CodeError::UnorderedRanges {
                    outer: index,
                    inner: index + 1 + inner,
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn name_rc(&self) -> Rc<str> {
        Rc::clone(&self.name)
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub(crate) fn constant(&self, index: usize) -> &Value {
        &self.constants[index]
    }

    pub(crate) fn int(&self, index: usize) -> i64 {
        self.ints[index]
    }

    pub(crate) fn float(&self, index: usize) -> f64 {
        self.floats[index]
    }

    pub(crate) fn big_int(&self, index: usize) -> &Value {
        &self.big_ints[index]
    }

    pub(crate) fn string(&self, index: usize) -> &Value {
        &self.strings[index]
    }

    pub(crate) fn bytes(&self, index: usize) -> &Value {
        &self.bytes[index]
    }

    pub(crate) fn name_at(&self, index: usize) -> &Rc<str> {
        &self.names[index]
    }

    #[must_use]
    pub fn names(&self) -> &[Rc<str>] {
        &self.names
    }

    #[must_use]
    pub fn local_names(&self) -> &[Rc<str>] {
        &self.local_names
    }

    #[must_use]
    pub fn cell_names(&self) -> &[Rc<str>] {
        &self.cell_names
    }

    #[must_use]
    pub fn free_names(&self) -> &[Rc<str>] {
        &self.free_names
    }

    /// Name of a cell or free variable by its combined index.
    pub(crate) fn deref_name(&self, index: usize) -> &str {
        match self.cell_names.get(index) {
            Some(name) => &**name,
            None => self.free_names.get(index - self.cell_names.len()).map_or("?", |name| &**name),
        }
    }

    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.arg_count
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        usize::from(self.stack_size)
    }

    #[must_use]
    pub fn exception_table(&self) -> &ExceptionHandlerTable {
        &self.exception_table
    }

    #[must_use]
    pub fn cell_args(&self) -> &[(u16, u16)] {
        &self.cell_args
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Source line of the instruction at `offset`, falling back to the first line.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> u32 {
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        match self.lines.partition_point(|&(start, _)| start <= offset) {
            0 => self.first_line,
            n => self.lines[n - 1].1,
        }
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("bytecode_len", &self.bytecode.len())
            .field("stack_size", &self.stack_size)
            .field("flags", &self.flags)
            .field("handlers", &self.exception_table.len())
            .finish_non_exhaustive()
    }
}

/// Why a code unit was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    Empty,
    FallsOffEnd,
    InvalidOpcode { offset: usize, byte: u8 },
    TruncatedOperand { offset: usize },
    JumpOutOfBounds { offset: usize, target: i64 },
    JumpIntoInstruction { offset: usize, target: usize },
    IndexOutOfRange { offset: usize, pool: &'static str, index: usize, len: usize },
    NotACodeConstant { offset: usize, index: usize },
    YieldOutsideGenerator { offset: usize },
    ParamsExceedLocals { params: usize, locals: usize },
    BadCellArg { cell: u16, param: u16 },
    TruncatedTable { len: usize },
    MalformedRange { index: usize, start: u32, end: u32 },
    HandlerOutOfBounds { index: usize, handler: u32 },
    HandlerDepth { index: usize, depth: u16, stack_size: u16 },
    /// A range is listed before a range nested inside it, so lookup would pick the outer one.
    UnorderedRanges { outer: usize, inner: usize },
    /// A pool, name table or the stack outgrew its u16 operand space.
    TooLarge { what: &'static str },
    /// The builder could not track the stack depth (negative depth).
    StackUnderflow { offset: usize },
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty bytecode"),
            Self::FallsOffEnd => write!(f, "execution can fall off the end of the bytecode"),
            Self::InvalidOpcode { offset, byte } => write!(f, "invalid opcode byte {byte} at offset {offset}"),
            Self::TruncatedOperand { offset } => write!(f, "truncated operand at offset {offset}"),
            Self::JumpOutOfBounds { offset, target } => {
                write!(f, "jump at offset {offset} targets {target}, outside the bytecode")
            }
            Self::JumpIntoInstruction { offset, target } => {
                write!(f, "jump at offset {offset} targets {target}, inside an instruction")
            }
            Self::IndexOutOfRange {
                offset,
                pool,
                index,
                len,
            } => write!(f, "{pool} index {index} at offset {offset} out of range (len {len})"),
            Self::NotACodeConstant { offset, index } => {
                write!(f, "MakeFunction at offset {offset} references non-code constant {index}")
            }
            Self::YieldOutsideGenerator { offset } => write!(f, "Yield at offset {offset} outside a generator"),
            Self::ParamsExceedLocals { params, locals } => {
                write!(f, "{params} parameters but only {locals} local slots")
            }
            Self::BadCellArg { cell, param } => write!(f, "cell argument ({cell}, {param}) out of range"),
            Self::TruncatedTable { len } => write!(f, "exception table length {len} is not a multiple of 3"),
            Self::MalformedRange { index, start, end } => {
                write!(f, "exception range {index} [{start}, {end}) is malformed")
            }
            Self::HandlerOutOfBounds { index, handler } => {
                write!(f, "exception range {index} has invalid handler offset {handler}")
            }
            Self::HandlerDepth {
                index,
                depth,
                stack_size,
            } => write!(f, "exception range {index} restores depth {depth} above stack size {stack_size}"),
            Self::UnorderedRanges { outer, inner } => {
                write!(f, "exception range {outer} encloses later range {inner}")
            }
            Self::TooLarge { what } => write!(f, "too many {what}"),
            Self::StackUnderflow { offset } => write!(f, "stack depth goes negative at offset {offset}"),
        }
    }
}

impl std::error::Error for CodeError {}
