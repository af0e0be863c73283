use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::exception::Exception;

/// One activation captured when a trap unwinds the call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceFrame {
    pub instance: u32,
    pub func_idx: u32,
    pub pc: usize,
}

/// A runtime fault raised while executing wasm code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    message: Cow<'static, str>,
    frames: Vec<TraceFrame>,
}

impl Trap {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self { message: message.into(), frames: Vec::new() }
    }

    pub fn message(&self) -> &str { &self.message }

    /// Call stack at the point of the trap, innermost frame first.
    pub fn frames(&self) -> &[TraceFrame] { &self.frames }
}

impl Display for Trap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        for frame in &self.frames {
            write!(f, "\n  at instance {} func {} pc {}", frame.instance, frame.func_idx, frame.pc)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Malformed(&'static str),
    Link(String),
    Uninstantiable(String),
    Trap(Trap),
    Interrupted,
    /// A wasm exception no `try_table` caught. Host functions return it to throw.
    Exception(Arc<Exception>),
}

impl Error {
    #[inline]
    pub fn trap(message: impl Into<Cow<'static, str>>) -> Self { Error::Trap(Trap::new(message)) }
    #[inline]
    pub fn malformed(message: &'static str) -> Self { Error::Malformed(message) }
    #[inline]
    pub fn link(message: impl Into<String>) -> Self { Error::Link(message.into()) }
    #[inline]
    pub fn uninstantiable(message: impl Into<String>) -> Self { Error::Uninstantiable(message.into()) }

    pub fn is_trap(&self) -> bool { matches!(self, Error::Trap(_)) }

    /// Message without the stack snapshot.
    pub fn message(&self) -> &str {
        match self {
            Error::Malformed(s) => s,
            Error::Link(s) | Error::Uninstantiable(s) => s,
            Error::Trap(t) => t.message(),
            Error::Interrupted => INTERRUPTED,
            Error::Exception(_) => UNCAUGHT_EXCEPTION,
        }
    }

    /// Attaches a call-stack snapshot unless one is already recorded.
    pub(crate) fn with_frames(self, frames: impl FnOnce() -> Vec<TraceFrame>) -> Self {
        match self {
            Error::Trap(mut t) if t.frames.is_empty() => {
                t.frames = frames();
                Error::Trap(t)
            }
            other => other,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Malformed(s) => f.write_str(s),
            Error::Link(s) | Error::Uninstantiable(s) => f.write_str(s),
            Error::Trap(t) => t.fmt(f),
            Error::Interrupted => f.write_str(INTERRUPTED),
            Error::Exception(e) => write!(f, "{UNCAUGHT_EXCEPTION} with tag {}", e.tag().ty()),
        }
    }
}

impl std::error::Error for Error {}

impl From<Trap> for Error {
    fn from(t: Trap) -> Self { Error::Trap(t) }
}

// Malformed errors
pub const ILLEGAL_OP: &str = "illegal opcode";
pub const INT_TOO_LARGE: &str = "integer too large";
pub const INT_TOO_LONG: &str = "integer representation too long";
pub const INVALID_SECTION_ID: &str = "invalid section id";
pub const INVALID_UTF8: &str = "malformed UTF-8 encoding";
pub const INVALID_VALUE_TYPE: &str = "invalid value type";
pub const JUNK_AFTER_LAST: &str = "junk after last section";
pub const MALFORMED_IMPORT_KIND: &str = "malformed import kind";
pub const MALFORMED_REF_TYPE: &str = "malformed reference type";
pub const MALFORMED_MUTABILITY: &str = "malformed mutability";
pub const MALFORMED_LIMITS: &str = "malformed limits flags";
pub const MALFORMED_ELEM_KIND: &str = "malformed elements segment kind";
pub const MALFORMED_DATA_FLAG: &str = "malformed data segment flags";
pub const FUNC_CODE_INCONSISTENT: &str = "function and code section have inconsistent lengths";
pub const DATA_COUNT_MISMATCH: &str = "data count and data section have inconsistent lengths";
pub const NO_MAGIC_HEADER: &str = "magic header not detected";
pub const SECTION_SIZE_MISMATCH: &str = "section size mismatch";
pub const TOO_MANY_LOCALS: &str = "too many locals";
pub const UNEXPECTED_END: &str = "unexpected end of section or function";
pub const UNEXPECTED_END_SHORT: &str = "unexpected end";
pub const UNKNOWN_BINARY_VERSION: &str = "unknown binary version";
pub const UNKNOWN_LABEL: &str = "unknown label";
pub const UNKNOWN_TYPE: &str = "unknown type";
pub const UNBALANCED_ELSE: &str = "else must close an if";
pub const UNBALANCED_END: &str = "unexpected end opcode";
pub const END_EXPECTED: &str = "END opcode expected";
pub const CONST_EXP_REQUIRED: &str = "constant expression required";
pub const SIMD_UNSUPPORTED: &str = "SIMD instructions are not supported";
pub const ZERO_FLAG_EXPECTED: &str = "zero byte expected";
pub const UNKNOWN_LOCAL: &str = "unknown local";
pub const UNKNOWN_GLOBAL: &str = "unknown global";
pub const MULTIPLE_MEMORIES: &str = "multiple memories";
pub const MEMORY_SIZE_LIMIT: &str = "memory size must be at most 65536 pages (4GiB)";
pub const SIZE_MIN_GREATER_THAN_MAX: &str = "size minimum must not be greater than maximum";
pub const DUPLICATE_EXPORT_NAME: &str = "duplicate export name";
pub const MALFORMED_TAG_ATTRIBUTE: &str = "malformed tag attribute";
// Trap errors
pub const DIVIDE_BY_ZERO: &str = "integer divide by zero";
pub const INDIRECT_CALL_MISMATCH: &str = "indirect call type mismatch";
pub const INTEGER_OVERFLOW: &str = "integer overflow";
pub const INVALID_CONV_TO_INT: &str = "invalid conversion to integer";
pub const INVALID_NUM_ARG: &str = "invalid number of arguments";
pub const OOB_MEMORY_ACCESS: &str = "out of bounds memory access";
pub const OOB_TABLE_ACCESS: &str = "out of bounds table access";
pub const STACK_EXHAUSTED: &str = "call stack exhausted";
pub const STACK_UNDERFLOW: &str = "stack underflow";
pub const UNDEF_ELEM: &str = "undefined element";
pub const UNINITIALIZED_ELEM: &str = "uninitialized element";
pub const UNREACHABLE: &str = "unreachable";
pub const UNALIGNED_ATOMIC: &str = "unaligned atomic";
pub const EXPECTED_SHARED_MEMORY: &str = "expected shared memory";
pub const GLOBAL_IS_IMMUTABLE: &str = "global is immutable";
pub const TYPE_MISMATCH: &str = "type mismatch";
pub const UNKNOWN_MEMORY: &str = "unknown memory";
pub const UNKNOWN_TABLE: &str = "unknown table";
pub const UNKNOWN_FUNC: &str = "unknown function";
pub const UNKNOWN_ELEM_SEGMENT: &str = "unknown elem segment";
pub const UNKNOWN_DATA_SEGMENT: &str = "unknown data segment";
pub const FUNC_NO_IMPL: &str = "function has no implementation";
pub const INTERRUPTED: &str = "thread interrupted";
pub const UNCAUGHT_EXCEPTION: &str = "uncaught exception";
pub const NULL_EXCEPTION_REF: &str = "null exception reference";
pub const UNKNOWN_TAG: &str = "unknown tag";
// Link errors
pub const INCOMPATIBLE_IMPORT: &str = "incompatible import type";
pub const UNKNOWN_IMPORT: &str = "unknown import";
