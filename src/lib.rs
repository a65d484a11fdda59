//! JET - a one-pass baseline JIT from JVM bytecode to x86-64.
//!
//! JET compiles one method at a time straight from its bytecode, simulating the
//! operand stack and local variables over a small register file. It favours
//! compilation speed over code quality and leaves behind an info block that the
//! runtime uses for stack walking, GC root enumeration and exception dispatch.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use jet::core::{CompilationSession, CompileOptions};
//! use jet::jasm::{parse, StubRuntime};
//!
//! let module = parse(source)?;
//! let vm = StubRuntime::new(&module);
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let compiled = jet::compile_method(&module.methods[0], &vm, &CompileOptions::default(), &session)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - types, bytecode decoding, abstract frame, register file, session
//! - [`x64`] - x86-64 encoder and calling convention
//! - [`jet`] - the code generator
//! - [`runtime`] - arithmetic helpers, info block, stack-walking support
//! - [`jasm`] - textual bytecode assembler and stub VM

pub mod core;
pub mod jasm;
pub mod jet;
pub mod runtime;
pub mod x64;

pub use core::{
    CompilationSession, CompileError, CompileOptions, CompileResult, CompileStats, JType,
    MethodInfo, VmAdaptor,
};
pub use jet::{compile_method, CompiledMethod};
pub use runtime::{InfoBlock, InfoBlockError};
