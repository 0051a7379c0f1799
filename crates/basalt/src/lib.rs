#![doc = include_str!("../../../README.md")]
mod builtins;
mod bytecode;
mod cell;
mod config;
mod engine;
mod exception_private;
mod function;
mod generator;
mod inline_cache;
mod iter;
mod namespace;
pub mod ops;
mod osr;
mod runtime;
mod value;

pub use crate::{
    bytecode::{
        CodeBuilder, CodeError, CodeFlags, CodeParts, CodeUnit, ExceptionHandlerTable, ExceptionRange,
        InvalidOpcodeError, JumpLabel, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS, Opcode,
    },
    cell::Cell,
    config::{DEFAULT_MAX_RECURSION_DEPTH, EngineConfig},
    engine::{Engine, EngineStats},
    exception_private::{ErrorKind, ExcRef, ExcType, Exception, InternalError, RunError, RunResult, TraceEntry},
    function::{Function, NativeFunction},
    generator::{Generator, GeneratorKind, GeneratorRef, GeneratorStep},
    inline_cache::{CodeProfile, MAX_SITE_MISSES, Site, SiteCache},
    iter::ValueIter,
    namespace::Globals,
    osr::{
        CompiledLoop, LoopInfo, MAX_OSR_DEOPTS, OSR_LOOP_THRESHOLD, OsrDecision, OsrExit, OsrTransfer, Rejection,
    },
    runtime::{DefaultRuntime, HostObject, Module, Runtime},
    value::{Dict, HashKey, Set, Value},
};
