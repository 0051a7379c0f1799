//! On-stack replacement of hot loops.
//!
//! The interpreter counts iterations of every back-edge. Once a loop crosses
//! the configured threshold its body is compiled into a [`CompiledLoop`]: the
//! region between the loop header and the back-edge, pre-decoded into a flat
//! op list whose integer fast paths need no operand decoding and no call-outs.
//! The in-flight frame is handed over as is (same locals, same operand stack)
//! and handed back at the offset where the loop exits or where a guard fails.
//!
//! A loop whose body uses anything outside the supported subset is never
//! compiled; interpretation simply continues.

use std::rc::Rc;

use crate::{
    bytecode::{CodeUnit, Opcode, vm::Frame},
    exception_private::RunResult,
    ops::{BinaryOp, CompareOp, int_binary},
    value::Value,
};

/// Default back-edge count before a loop is compiled.
pub const OSR_LOOP_THRESHOLD: u64 = 5_000;

/// Deoptimizations tolerated before a compiled loop is abandoned.
pub const MAX_OSR_DEOPTS: u32 = 8;

/// Per-loop OSR state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OsrDecision {
    /// Loop has not run yet.
    Cold = 0,
    /// Loop is below the threshold, keep counting.
    Warming = 1,
    /// Loop crossed the threshold and should be compiled.
    Hot = 2,
    /// Compiled code is available, enter it.
    Ready = 3,
    /// Compilation was rejected or the compiled loop kept deoptimizing.
    Failed = 4,
}

impl OsrDecision {
    #[inline]
    pub const fn should_compile(self) -> bool {
        matches!(self, Self::Hot)
    }

    #[inline]
    pub const fn can_enter(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Profiling record of one loop, keyed by its back-edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopInfo {
    /// Loop header bytecode offset (target of the back-edge).
    pub header_offset: u32,
    /// Offset of the `JumpBackward` instruction.
    pub back_edge_offset: u32,
    pub trip_count: u64,
    pub deopts: u32,
    pub decision: OsrDecision,
}

impl LoopInfo {
    #[inline]
    pub const fn new(header_offset: u32, back_edge_offset: u32) -> Self {
        Self {
            header_offset,
            back_edge_offset,
            trip_count: 0,
            deopts: 0,
            decision: OsrDecision::Cold,
        }
    }

    /// Record a loop iteration and return the updated decision.
    #[inline]
    pub fn record_iteration(&mut self, threshold: u64) -> OsrDecision {
        self.trip_count = self.trip_count.saturating_add(1);
        if matches!(self.decision, OsrDecision::Cold | OsrDecision::Warming) {
            self.decision = if self.trip_count >= threshold {
                OsrDecision::Hot
            } else {
                OsrDecision::Warming
            };
        }
        self.decision
    }

    pub fn mark_ready(&mut self) {
        self.decision = OsrDecision::Ready;
    }

    pub fn mark_failed(&mut self) {
        self.decision = OsrDecision::Failed;
    }

    /// Counts a deoptimization; the loop goes back to pure interpretation after too many.
    pub fn record_deopt(&mut self) {
        self.deopts = self.deopts.saturating_add(1);
        if self.deopts >= MAX_OSR_DEOPTS {
            self.mark_failed();
        }
    }
}

/// State handed over when entering compiled code.
#[derive(Debug, Clone)]
pub struct OsrTransfer {
    pub entry_pc: u32,
    pub entry: Rc<CompiledLoop>,
}

impl OsrTransfer {
    /// Runs the compiled loop on `frame`; the frame's slots and stack are used in place.
    pub(crate) fn enter(self, frame: &mut Frame) -> RunResult<OsrExit> {
        debug_assert_eq!(frame.pc, self.entry_pc as usize);
        self.entry.run(frame)
    }
}

/// How control came back from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsrExit {
    /// The loop was left; interpretation continues at `pc`.
    Exit { pc: usize },
    /// A guard failed before the instruction at `pc`, which the interpreter re-executes.
    Deopt { pc: usize },
}

/// Why a loop body could not be compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedOpcode(Opcode),
    /// Operators are off limits when the runtime owns primitive semantics.
    NoPrimitiveFastPaths,
    Malformed,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    /// Index into the op list.
    Inside(usize),
    /// Bytecode offset outside the loop region.
    Exit(usize),
}

#[derive(Debug, Clone)]
enum LoopOp {
    LoadLocal(usize),
    StoreLocal(usize),
    Push(Value),
    Pop,
    Dup,
    Rot2,
    Nop,
    Binary(BinaryOp),
    Compare(CompareOp),
    Not,
    Jump(Target),
    JumpIfTrue(Target),
    JumpIfFalse(Target),
    ForIter(Target),
}

/// A compiled loop region.
#[derive(Debug)]
pub struct CompiledLoop {
    header: u32,
    entry_depth: usize,
    /// Ops paired with the bytecode offset they were decoded from.
    ops: Vec<(usize, LoopOp)>,
}

impl CompiledLoop {
    /// Compiles the region `[header, back_edge]` of `code`.
    ///
    /// `entry_depth` is the operand stack depth at the header; the loop is
    /// only entered when the frame's stack is at that depth.
    pub fn compile(
        code: &CodeUnit,
        header: usize,
        back_edge: usize,
        entry_depth: usize,
        fast_paths: bool,
    ) -> Result<Self, Rejection> {
        let bytes = code.bytecode();
        let end = back_edge + 1 + Opcode::JumpBackward.operand_len();
        if header > back_edge || end > bytes.len() {
            return Err(Rejection::Malformed);
        }

        let mut decoded: Vec<(usize, LoopOp, Option<usize>)> = Vec::new();
        let mut pc = header;
        while pc < end {
            let opcode = Opcode::try_from(bytes[pc]).map_err(|_| Rejection::Malformed)?;
            let operands = bytes.get(pc + 1..pc + 1 + opcode.operand_len()).ok_or(Rejection::Malformed)?;
            let next = pc + 1 + operands.len();
            let u8_operand = || usize::from(operands[0]);
            let u16_operand = || usize::from(u16::from_le_bytes([operands[0], operands[1]]));
            let relative = || {
                let offset = i16::from_le_bytes([operands[0], operands[1]]);
                next.checked_add_signed(isize::from(offset))
            };
            let mut jump_target = None;
            let op = match opcode {
                Opcode::LoadLocal => LoopOp::LoadLocal(u8_operand()),
                Opcode::LoadLocalW => LoopOp::LoadLocal(u16_operand()),
                Opcode::StoreLocal => LoopOp::StoreLocal(u8_operand()),
                Opcode::StoreLocalW => LoopOp::StoreLocal(u16_operand()),
                Opcode::LoadSmallInt => LoopOp::Push(Value::Int(i64::from(i8::from_le_bytes([operands[0]])))),
                Opcode::LoadInt => LoopOp::Push(Value::Int(code.int(u16_operand()))),
                Opcode::LoadFloat => LoopOp::Push(Value::Float(code.float(u16_operand()))),
                Opcode::LoadConst => LoopOp::Push(code.constant(u16_operand()).clone()),
                Opcode::LoadNone => LoopOp::Push(Value::None),
                Opcode::LoadTrue => LoopOp::Push(Value::Bool(true)),
                Opcode::LoadFalse => LoopOp::Push(Value::Bool(false)),
                Opcode::Pop => LoopOp::Pop,
                Opcode::Dup => LoopOp::Dup,
                Opcode::Rot2 => LoopOp::Rot2,
                Opcode::Nop => LoopOp::Nop,
                Opcode::UnaryNot => LoopOp::Not,
                Opcode::BinaryAdd
                | Opcode::BinarySub
                | Opcode::BinaryMul
                | Opcode::BinaryFloorDiv
                | Opcode::BinaryMod
                | Opcode::BinaryAnd
                | Opcode::BinaryOr
                | Opcode::BinaryXor => {
                    if !fast_paths {
                        return Err(Rejection::NoPrimitiveFastPaths);
                    }
                    LoopOp::Binary(opcode.binary_op().ok_or(Rejection::Malformed)?)
                }
                Opcode::CompareEq
                | Opcode::CompareNe
                | Opcode::CompareLt
                | Opcode::CompareLe
                | Opcode::CompareGt
                | Opcode::CompareGe => {
                    if !fast_paths {
                        return Err(Rejection::NoPrimitiveFastPaths);
                    }
                    LoopOp::Compare(opcode.compare_op().ok_or(Rejection::Malformed)?)
                }
                Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::ForIter => {
                    jump_target = Some(relative().ok_or(Rejection::Malformed)?);
                    match opcode {
                        Opcode::Jump => LoopOp::Jump(Target::Exit(0)),
                        Opcode::JumpIfTrue => LoopOp::JumpIfTrue(Target::Exit(0)),
                        Opcode::JumpIfFalse => LoopOp::JumpIfFalse(Target::Exit(0)),
                        _ => LoopOp::ForIter(Target::Exit(0)),
                    }
                }
                Opcode::JumpBackward => {
                    jump_target = Some(pc.checked_sub(u16_operand()).ok_or(Rejection::Malformed)?);
                    LoopOp::Jump(Target::Exit(0))
                }
                other => return Err(Rejection::UnsupportedOpcode(other)),
            };
            decoded.push((pc, op, jump_target));
            pc = next;
        }

        let offsets: Vec<usize> = decoded.iter().map(|(pc, ..)| *pc).collect();
        let resolve = |target: usize| -> Result<Target, Rejection> {
            if (header..end).contains(&target) {
                offsets.binary_search(&target).map(Target::Inside).map_err(|_| Rejection::Malformed)
            } else {
                Ok(Target::Exit(target))
            }
        };
        let mut ops = Vec::with_capacity(decoded.len());
        for (pc, op, jump_target) in decoded {
            let op = match (op, jump_target) {
                (LoopOp::Jump(_), Some(target)) => LoopOp::Jump(resolve(target)?),
                (LoopOp::JumpIfTrue(_), Some(target)) => LoopOp::JumpIfTrue(resolve(target)?),
                (LoopOp::JumpIfFalse(_), Some(target)) => LoopOp::JumpIfFalse(resolve(target)?),
                (LoopOp::ForIter(_), Some(target)) => LoopOp::ForIter(resolve(target)?),
                (op, _) => op,
            };
            ops.push((pc, op));
        }

        Ok(Self {
            header: u32::try_from(header).map_err(|_| Rejection::Malformed)?,
            entry_depth,
            ops,
        })
    }

    #[must_use]
    pub fn header(&self) -> u32 {
        self.header
    }

    #[must_use]
    pub fn entry_depth(&self) -> usize {
        self.entry_depth
    }

    /// Executes until the loop exits or a guard fails.
    ///
    /// Guards are checked before any operand is consumed, so a deoptimized
    /// frame is exactly the frame the interpreter would have at `pc`.
    fn run(&self, frame: &mut Frame) -> RunResult<OsrExit> {
        let mut index = 0;
        loop {
            let Some((pc, op)) = self.ops.get(index) else {
                return Ok(leave(frame, self.ops.last().map_or(0, |(pc, _)| *pc)));
            };
            let pc = *pc;
            index += 1;
            match op {
                LoopOp::LoadLocal(slot) => match frame.locals.get(*slot) {
                    Some(Some(value)) => {
                        let value = value.clone();
                        frame.push(value)?;
                    }
                    _ => return Ok(deopt(frame, pc)),
                },
                LoopOp::StoreLocal(slot) => {
                    let value = frame.pop()?;
                    frame.store_local(*slot, value)?;
                }
                LoopOp::Push(value) => frame.push(value.clone())?,
                LoopOp::Pop => {
                    frame.pop()?;
                }
                LoopOp::Dup => {
                    let value = frame.peek()?.clone();
                    frame.push(value)?;
                }
                LoopOp::Rot2 => frame.rotate_top(2)?,
                LoopOp::Nop => {}
                LoopOp::Binary(op) => {
                    let result = match (frame.peek_at(1)?, frame.peek_at(0)?) {
                        (Value::Int(a), Value::Int(b)) => int_binary(*op, *a, *b).ok(),
                        _ => None,
                    };
                    let Some(result) = result else {
                        return Ok(deopt(frame, pc));
                    };
                    frame.pop_n(2)?;
                    frame.push(result)?;
                }
                LoopOp::Compare(op) => {
                    let ordering = match (frame.peek_at(1)?, frame.peek_at(0)?) {
                        (Value::Int(a), Value::Int(b)) => a.cmp(b),
                        _ => return Ok(deopt(frame, pc)),
                    };
                    frame.pop_n(2)?;
                    frame.push(Value::Bool(op.matches(ordering)))?;
                }
                LoopOp::Not => {
                    let Value::Bool(b) = *frame.peek()? else {
                        return Ok(deopt(frame, pc));
                    };
                    frame.pop()?;
                    frame.push(Value::Bool(!b))?;
                }
                LoopOp::Jump(target) => match *target {
                    Target::Inside(next) => index = next,
                    Target::Exit(exit) => return Ok(leave(frame, exit)),
                },
                LoopOp::JumpIfTrue(target) | LoopOp::JumpIfFalse(target) => {
                    let Value::Bool(cond) = *frame.peek()? else {
                        return Ok(deopt(frame, pc));
                    };
                    frame.pop()?;
                    if cond == matches!(op, LoopOp::JumpIfTrue(_)) {
                        match *target {
                            Target::Inside(next) => index = next,
                            Target::Exit(exit) => return Ok(leave(frame, exit)),
                        }
                    }
                }
                LoopOp::ForIter(target) => {
                    let Value::Iterator(iter) = frame.peek()? else {
                        return Ok(deopt(frame, pc));
                    };
                    let iter = Rc::clone(iter);
                    let item = iter.borrow_mut().next_value();
                    match item {
                        Ok(Some(item)) => frame.push(item)?,
                        Ok(None) => {
                            frame.pop()?;
                            match *target {
                                Target::Inside(next) => index = next,
                                Target::Exit(exit) => return Ok(leave(frame, exit)),
                            }
                        }
                        Err(err) => {
                            frame.instr_pc = pc;
                            frame.pc = pc + 1 + Opcode::ForIter.operand_len();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

fn leave(frame: &mut Frame, pc: usize) -> OsrExit {
    frame.pc = pc;
    OsrExit::Exit { pc }
}

fn deopt(frame: &mut Frame, pc: usize) -> OsrExit {
    frame.pc = pc;
    OsrExit::Deopt { pc }
}
