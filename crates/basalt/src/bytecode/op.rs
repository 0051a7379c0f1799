//! Opcode definitions.
//!
//! Bytecode is a raw `Vec<u8>`. The `Opcode` enum is a pure discriminant;
//! operands follow in the byte stream and are fetched separately.
//!
//! # Operand Encoding
//!
//! - 0 bytes: `BinaryAdd`, `Pop`, `LoadNone`, `Yield`
//! - 1 byte (u8/i8): `LoadLocal`, `StoreLocal`, `LoadSmallInt`, `CallFunction`
//! - 2 bytes (u16/i16, little-endian): `LoadConst`, `LoadLocalW`, `Jump`, `JumpBackward`
//! - 3 bytes (u16 + u8): `CallMethod`, `MakeFunction`
//!
//! Relative jumps (`Jump`, `JumpIf*`, `ForIter`) are measured from the end of
//! the instruction. `JumpBackward` carries an unsigned distance measured from
//! the start of the instruction.

use strum::{FromRepr, IntoStaticStr};

use crate::ops::{BinaryOp, CompareOp, UnaryOp};

/// `MakeFunction` flag: a tuple of default values is on the stack.
pub const MAKE_FUNCTION_DEFAULTS: u8 = 0b01;
/// `MakeFunction` flag: a tuple of closure cells is on the stack.
pub const MAKE_FUNCTION_CLOSURE: u8 = 0b10;

/// Opcode discriminant.
///
/// With `#[repr(u8)]` each opcode is exactly one byte; `strum::FromRepr` does the
/// byte-to-opcode conversion.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
pub enum Opcode {
    // === Stack Operations ===
    /// Discard top of stack.
    Pop,
    /// Duplicate top of stack.
    Dup,
    /// Duplicate the top two: [a, b] -> [a, b, a, b].
    DupTwo,
    /// Swap top two: [a, b] -> [b, a].
    Rot2,
    /// Rotate top three: [a, b, c] -> [c, a, b].
    Rot3,
    /// Rotate top four: [a, b, c, d] -> [d, a, b, c].
    Rot4,
    Nop,

    // === Constants & Literals ===
    /// Push from the general constant pool. Operand: u16 index.
    LoadConst,
    LoadNone,
    LoadTrue,
    LoadFalse,
    /// Push a small integer. Operand: i8.
    LoadSmallInt,
    /// Push from the integer pool. Operand: u16 index.
    LoadInt,
    /// Push from the float pool. Operand: u16 index.
    LoadFloat,
    /// Push from the big-integer pool. Operand: u16 index.
    LoadBigInt,
    /// Push from the string pool. Operand: u16 index.
    LoadStr,
    /// Push from the byte-string pool. Operand: u16 index.
    LoadBytes,

    // === Variables ===
    /// Push local. Operand: u8 slot.
    LoadLocal,
    /// Push local (wide). Operand: u16 slot.
    LoadLocalW,
    /// Pop into local. Operand: u8 slot.
    StoreLocal,
    /// Pop into local (wide). Operand: u16 slot.
    StoreLocalW,
    /// Clear a local, failing if it is already unbound. Operand: u16 slot.
    DeleteLocal,
    /// Push the contents of a cell. Operand: u16 index over cells then free variables.
    LoadDeref,
    /// Pop into a cell. Operand: u16 index.
    StoreDeref,
    /// Clear a cell. Operand: u16 index.
    DeleteDeref,
    /// Push the cell object itself, for building a closure. Operand: u16 index.
    LoadClosure,
    /// Push a global, falling back to builtins. Operand: u16 name index.
    LoadGlobal,
    /// Pop into a global. Operand: u16 name index.
    StoreGlobal,
    /// Delete a global. Operand: u16 name index.
    DeleteGlobal,
    /// Module-scope load: globals, then builtins. Operand: u16 name index.
    LoadName,
    /// Module-scope store. Operand: u16 name index.
    StoreName,
    /// Module-scope delete. Operand: u16 name index.
    DeleteName,

    // === Binary Operations ===
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryDiv,
    BinaryFloorDiv,
    BinaryMod,
    BinaryPow,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    BinaryLShift,
    BinaryRShift,

    // === Comparison Operations ===
    CompareEq,
    CompareNe,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    /// Identity: a is b.
    CompareIs,
    CompareIsNot,
    /// Membership: a in b.
    CompareIn,
    CompareNotIn,

    // === Unary Operations ===
    UnaryNot,
    UnaryNeg,
    UnaryPos,
    UnaryInvert,

    // === Collection Building ===
    /// Pop n items, push a list. Operand: u16 count.
    BuildList,
    /// Pop n items, push a tuple. Operand: u16 count.
    BuildTuple,
    /// Pop 2n items (key/value pairs), push a dict. Operand: u16 count.
    BuildDict,
    /// Pop n items, push a set. Operand: u16 count.
    BuildSet,
    /// Unpack TOS into exactly n values, first item on top. Operand: u8 count.
    UnpackSequence,

    // === Subscript & Attribute ===
    /// a[b]: pop index, pop obj, push result.
    BinarySubscr,
    /// a[b] = c. Stack: [value, obj, key].
    StoreSubscr,
    /// del a[b]: pop index, pop obj.
    DeleteSubscr,
    /// Pop obj, push obj.attr. Operand: u16 name index.
    LoadAttr,
    /// obj.attr = value. Stack: [value, obj]. Operand: u16 name index.
    StoreAttr,
    /// Pop obj, delete obj.attr. Operand: u16 name index.
    DeleteAttr,

    // === Control Flow ===
    /// Unconditional forward jump. Operand: i16 offset.
    Jump,
    /// Loop back-edge, the OSR poll point. Operand: u16 distance back from this instruction.
    JumpBackward,
    /// Jump if TOS truthy, always pop. Operand: i16 offset.
    JumpIfTrue,
    /// Jump if TOS falsy, always pop. Operand: i16 offset.
    JumpIfFalse,
    /// Jump if TOS truthy (keep), else pop. Operand: i16 offset.
    JumpIfTrueOrPop,
    /// Jump if TOS falsy (keep), else pop. Operand: i16 offset.
    JumpIfFalseOrPop,

    // === Iteration ===
    /// Replace TOS with an iterator over it.
    GetIter,
    /// Push the next item, or pop the iterator and jump when exhausted. Operand: i16 offset.
    ForIter,

    // === Function Calls ===
    /// Call TOS-0 with no arguments. Stack: [callable].
    CallFunction0,
    /// Stack: [callable, a].
    CallFunction1,
    CallFunction2,
    CallFunction3,
    CallFunction4,
    /// Call with n positional args. Operand: u8 count. Stack: [callable, args...].
    CallFunction,
    /// Call with a materialized argument tuple or list. Stack: [callable, args].
    CallFunctionVarargs,
    /// Call obj.name(args...). Operands: u16 name index, u8 count. Stack: [obj, args...].
    CallMethod,
    /// Build a function from a code constant. Operands: u16 constant index, u8 flags.
    ///
    /// Flag bit 0: a defaults tuple is on the stack. Flag bit 1: a tuple of
    /// cells is on the stack (on top of the defaults, if both).
    MakeFunction,

    // === Exception Handling ===
    /// Raise TOS (an exception or exception type).
    Raise,
    /// Raise TOS-1 with TOS as its cause. Stack: [exc, cause].
    RaiseFrom,
    /// Re-raise the exception currently being handled.
    Reraise,
    /// [exc, type] -> [exc, bool].
    CheckExcMatch,
    /// Leave an except block, restoring the previously handled exception.
    PopExcept,
    /// Push the `AssertionError` type.
    LoadAssertionError,

    // === Return & Suspension ===
    ReturnValue,
    ReturnNone,
    /// Suspend the generator with TOS; on resume the sent value is pushed.
    Yield,

    // === Imports ===
    /// Push the module named by a name index. Operand: u16.
    ImportName,
    /// Push module.name from the module on TOS (kept). Operand: u16 name index.
    ImportFrom,
}

impl Opcode {
    /// Highest assigned discriminant.
    pub const LAST: Self = Self::ImportFrom;

    /// Number of operand bytes following the opcode.
    #[must_use]
    pub fn operand_len(self) -> usize {
        match self {
            Self::LoadSmallInt
            | Self::LoadLocal
            | Self::StoreLocal
            | Self::UnpackSequence
            | Self::CallFunction => 1,
            Self::LoadConst
            | Self::LoadInt
            | Self::LoadFloat
            | Self::LoadBigInt
            | Self::LoadStr
            | Self::LoadBytes
            | Self::LoadLocalW
            | Self::StoreLocalW
            | Self::DeleteLocal
            | Self::LoadDeref
            | Self::StoreDeref
            | Self::DeleteDeref
            | Self::LoadClosure
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::BuildList
            | Self::BuildTuple
            | Self::BuildDict
            | Self::BuildSet
            | Self::LoadAttr
            | Self::StoreAttr
            | Self::DeleteAttr
            | Self::Jump
            | Self::JumpBackward
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::JumpIfTrueOrPop
            | Self::JumpIfFalseOrPop
            | Self::ForIter
            | Self::ImportName
            | Self::ImportFrom => 2,
            Self::CallMethod | Self::MakeFunction => 3,
            _ => 0,
        }
    }

    /// Whether the operand is an i16 relative jump offset.
    #[must_use]
    pub fn is_relative_jump(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpIfTrue
                | Self::JumpIfFalse
                | Self::JumpIfTrueOrPop
                | Self::JumpIfFalseOrPop
                | Self::ForIter
        )
    }

    /// The operator of a `Binary*` opcode.
    #[must_use]
    pub fn binary_op(self) -> Option<BinaryOp> {
        Some(match self {
            Self::BinaryAdd => BinaryOp::Add,
            Self::BinarySub => BinaryOp::Sub,
            Self::BinaryMul => BinaryOp::Mul,
            Self::BinaryDiv => BinaryOp::Div,
            Self::BinaryFloorDiv => BinaryOp::FloorDiv,
            Self::BinaryMod => BinaryOp::Mod,
            Self::BinaryPow => BinaryOp::Pow,
            Self::BinaryAnd => BinaryOp::And,
            Self::BinaryOr => BinaryOp::Or,
            Self::BinaryXor => BinaryOp::Xor,
            Self::BinaryLShift => BinaryOp::LShift,
            Self::BinaryRShift => BinaryOp::RShift,
            _ => return None,
        })
    }

    /// The operator of an ordering or equality `Compare*` opcode.
    #[must_use]
    pub fn compare_op(self) -> Option<CompareOp> {
        Some(match self {
            Self::CompareEq => CompareOp::Eq,
            Self::CompareNe => CompareOp::Ne,
            Self::CompareLt => CompareOp::Lt,
            Self::CompareLe => CompareOp::Le,
            Self::CompareGt => CompareOp::Gt,
            Self::CompareGe => CompareOp::Ge,
            _ => return None,
        })
    }

    #[must_use]
    pub fn unary_op(self) -> Option<UnaryOp> {
        Some(match self {
            Self::UnaryNot => UnaryOp::Not,
            Self::UnaryNeg => UnaryOp::Neg,
            Self::UnaryPos => UnaryOp::Pos,
            Self::UnaryInvert => UnaryOp::Invert,
            _ => return None,
        })
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Jump | Self::JumpBackward | Self::ReturnValue | Self::ReturnNone | Self::Raise | Self::RaiseFrom | Self::Reraise
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

/// Error returned when a byte is not an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl std::fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode byte: {}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_round_trip() {
        for byte in 0..=Opcode::LAST as u8 {
            let opcode = Opcode::try_from(byte).unwrap();
            assert_eq!(opcode as u8, byte, "opcode {opcode:?} has wrong discriminant");
        }
    }

    #[test]
    fn bytes_past_the_last_opcode_are_invalid() {
        assert_eq!(Opcode::try_from(Opcode::LAST as u8 + 1), Err(InvalidOpcodeError(Opcode::LAST as u8 + 1)));
        assert!(Opcode::try_from(255u8).is_err());
    }

    #[test]
    fn opcode_is_one_byte() {
        assert_eq!(std::mem::size_of::<Opcode>(), 1);
    }

    #[test]
    fn operand_widths() {
        assert_eq!(Opcode::BinaryAdd.operand_len(), 0);
        assert_eq!(Opcode::LoadSmallInt.operand_len(), 1);
        assert_eq!(Opcode::JumpBackward.operand_len(), 2);
        assert_eq!(Opcode::MakeFunction.operand_len(), 3);
        assert!(Opcode::ForIter.is_relative_jump());
        assert!(!Opcode::JumpBackward.is_relative_jump());
    }

    #[test]
    fn operator_opcodes_map_to_operators() {
        assert_eq!(Opcode::BinaryFloorDiv.binary_op(), Some(BinaryOp::FloorDiv));
        assert_eq!(Opcode::CompareGe.compare_op(), Some(CompareOp::Ge));
        assert_eq!(Opcode::CompareIs.compare_op(), None);
        assert_eq!(Opcode::UnaryInvert.unary_op(), Some(UnaryOp::Invert));
        assert_eq!(Opcode::Pop.binary_op(), None);
    }
}
