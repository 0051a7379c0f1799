//! Bytecode representation and the virtual machine that executes it.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum definitions
//! - `code` - Code units, flags and exception handler tables
//! - `builder` - `CodeBuilder` for emitting bytecode
//! - `vm` - Frames and the interpreter loop

mod builder;
mod code;
mod op;
pub(crate) mod vm;

pub use builder::{CodeBuilder, JumpLabel};
pub use code::{CodeError, CodeFlags, CodeParts, CodeUnit, ExceptionHandlerTable, ExceptionRange};
pub use op::{InvalidOpcodeError, Opcode, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS};
