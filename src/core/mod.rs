// This module is the hub of JET's target-independent infrastructure: the JVM type model and
// bytecode decoder, the abstract frame (operand stack and locals as Val slots), the register
// file with reference counts and scoped locks, the instruction-emission trait the code
// generator is written against, the VM collaborator interface describing the method being
// compiled, compile options, and the compilation session that owns the arena and the
// statistics counters. Nothing in here emits x86-64 encodings itself.

//! Core JET infrastructure shared by the code generator and the runtime support.
//!
//! # Key Components
//!
//! ## Types and bytecode (`jtype`, `bytecode`)
//! - JVM value types and descriptor parsing
//! - One-instruction-at-a-time bytecode decoding
//!
//! ## Frame model (`val`, `jframe`)
//! - Values as immediate, register or memory
//! - Operand stack and local variables with wide-value handling
//!
//! ## Register allocation (`register_file`)
//! - Reference counts per register
//! - RAII lock guards
//!
//! ## Emission (`encoder`)
//! - Backend-neutral instruction interface with patchable branches
//!
//! ## Session (`session`, `options`)
//! - Arena and injected statistics
//! - Per-compilation switches

pub mod bytecode;
pub mod encoder;
pub mod error;
pub mod jframe;
pub mod jtype;
pub mod method;
pub mod options;
pub mod register_file;
pub mod session;
pub mod val;

pub use encoder::{AluOp, CallTarget, Cond, Encoder, FpOp, OpSize, PatchRef, ShiftOp};
pub use error::{CompileError, CompileResult};
pub use jframe::{FrameError, JFrame, Shuffle};
pub use jtype::{JType, WordSize};
pub use method::{MethodInfo, VmAdaptor};
pub use options::CompileOptions;
pub use register_file::{Ar, RegAllocError, RegBitSet, RegLock, RegisterFile};
pub use session::{CompilationSession, CompileStats};
pub use val::{MemRef, Opnd, Val, ValKind};
