// This module is JET's code generator proper. compile_method() is the public entry: it
// applies the method name filter, builds a Compiler over the x86-64 encoder, runs it and
// records the outcome in the session statistics. The Compiler itself is split across files
// by bytecode family (arithmetic, stack shuffles, branches, invocation, object model,
// checks, prolog and epilog), each adding an `impl` block to the same type, while the
// supporting per-method tables (basic blocks, global register assignment, native frame
// layout, GC map builder) have their own modules.

//! Bytecode to x86-64 code generation.

pub mod bbs;
mod cg_arith;
mod cg_bb;
mod cg_br;
mod cg_call;
mod cg_checks;
mod cg_invoke;
mod cg_meth;
mod cg_obj;
mod cg_stk;
mod compiler;
pub mod gcmap;
pub mod globals;
pub mod layout;

pub use compiler::Compiler;

use crate::core::error::{CompileError, CompileResult};
use crate::core::method::{MethodInfo, VmAdaptor};
use crate::core::options::CompileOptions;
use crate::core::session::CompilationSession;
use crate::runtime::infoblock::InfoBlock;
use crate::x64::X64Encoder;

/// Native code and metadata of one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub name: String,
    pub code: Vec<u8>,
    pub info: InfoBlock,
}

/// Compile `method` to x86-64 code.
///
/// Methods rejected by the name filter return [`CompileError::Filtered`] and are
/// counted in the session statistics.
pub fn compile_method(
    method: &MethodInfo,
    vm: &dyn VmAdaptor,
    opts: &CompileOptions,
    session: &CompilationSession<'_>,
) -> CompileResult<CompiledMethod> {
    let name = method.full_name();
    if !opts.accepts(&name) {
        session.record_method_filtered();
        log::debug!("jet::compiler: {} skipped by filter", name);
        return Err(CompileError::Filtered { name });
    }

    let compiler = Compiler::new(method, vm, opts, session, X64Encoder::new())?;
    let (code, info) = compiler.compile()?;
    session.record_method_compiled(&name, method.code.len(), code.len());
    log::info!(
        "jet::compiler: {} compiled, {} bytecode bytes -> {} bytes of code",
        name,
        method.code.len(),
        code.len()
    );
    Ok(CompiledMethod { name, code, info })
}
