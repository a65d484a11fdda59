// This module defines the error types of the JET compiler using the thiserror crate.
// CompileError is the main error enum covering the ways a method compilation can fail:
// malformed or truncated bytecode, unknown opcodes, operand stack overflow/underflow,
// register allocation failures (all scratch registers locked), internal consistency
// violations detected at basic-block boundaries, and encoder failures. Each variant carries
// the bytecode PC or the reason so a failed compile can be reported precisely. Resolution
// failures of classes/methods/fields are NOT errors here: they are deferred to run time by
// emitting a call to the linking-error helper. CompileResult<T> is the convenience alias.

//! Error types for the JET compiler.
//!
//! Using thiserror for idiomatic error handling.

use super::register_file::RegAllocError;
use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Main error type for method compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Truncated bytecode at pc {pc}")]
    TruncatedBytecode { pc: u32 },

    #[error("Unknown opcode 0x{opcode:02x} at pc {pc}")]
    UnknownOpcode { pc: u32, opcode: u8 },

    #[error("Branch target {target} out of range at pc {pc}")]
    BadBranchTarget { pc: u32, target: i64 },

    #[error("Operand stack overflow at pc {pc} (max_stack {max_stack})")]
    StackOverflow { pc: u32, max_stack: usize },

    #[error("Operand stack underflow at pc {pc}")]
    StackUnderflow { pc: u32 },

    #[error("Local variable {index} out of range at pc {pc}")]
    BadLocal { pc: u32, index: u32 },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("Frame state inconsistent at pc {pc}: {reason}")]
    InconsistentState { pc: u32, reason: String },

    #[error("Constant pool entry {cp} unusable at pc {pc}")]
    BadConstantPool { pc: u32, cp: u16 },

    #[error("Unsupported bytecode {name} at pc {pc}")]
    Unsupported { pc: u32, name: &'static str },

    #[error("Code generation failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Method {name} filtered out")]
    Filtered { name: String },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

impl From<RegAllocError> for CompileError {
    fn from(e: RegAllocError) -> Self {
        CompileError::RegisterAllocation {
            reason: e.to_string(),
        }
    }
}
