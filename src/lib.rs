#![deny(unsafe_code)]

// Per-instruction tracing, compiled out unless wasm_debug is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! trace_exec {
    ($($arg:tt)*) => {
        tracing::trace!(target: "wacore::exec", $($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! trace_exec {
    ($($arg:tt)*) => {};
}

pub(crate) use trace_exec;

mod leb128;
mod byte_iter;
mod frame;
mod interpreter;
mod ops;
mod stack;

pub mod builder;
pub mod config;
pub mod error;
pub mod exception;
pub mod instance;
pub mod instruction;
pub mod module;
pub mod signature;
pub mod value;
pub mod wasm_memory;
pub mod wasm_table;

pub use builder::{CodeBuilder, ModuleBuilder};
pub use config::Config;
pub use error::{Error, TraceFrame, Trap};
pub use exception::{Exception, Tag};
pub use instance::{
    ExportValue, Global, HostFn, Imports, Instance, InstanceId, InterruptHandle, ModuleImports, RuntimeFunction,
};
pub use instruction::{CatchKind, Handler, Instr, MemArg};
pub use module::{
    ConstExpr, DataSegment, ElementSegment, Export, ExternKind, GlobalType, Import, ImportDesc, Module, SegmentMode,
    TableType,
};
pub use signature::{BlockType, FuncType};
pub use value::{FuncAddr, ValType, Value, Word};
pub use wasm_memory::{Memory, MemoryLimits};
pub use wasm_table::{Table, TableEntry};
