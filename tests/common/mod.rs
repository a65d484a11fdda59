//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bumpalo::Bump;
use iced_x86::{Code, Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, OpKind, Register};

use jet::core::method::Helper;
use jet::core::{CompilationSession, CompileOptions, CompileResult};
use jet::jasm::{parse, StubRuntime};
use jet::{compile_method, CompiledMethod};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Compile method `name` of `src` with default options and a plain stub VM.
pub fn compile(src: &str, name: &str) -> CompiledMethod {
    compile_with(src, name, &CompileOptions::default(), |vm| vm).unwrap()
}

pub fn compile_with(
    src: &str,
    name: &str,
    opts: &CompileOptions,
    configure: impl FnOnce(StubRuntime<'_>) -> StubRuntime<'_>,
) -> CompileResult<CompiledMethod> {
    init_logging();
    let module = parse(src).unwrap();
    let method = module
        .method(name)
        .unwrap_or_else(|| panic!("no method {name}"))
        .clone();
    let vm = configure(StubRuntime::new(&module));
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    compile_method(&method, &vm, opts, &session)
}

pub fn disasm(code: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    out
}

pub fn text(inst: &Instruction) -> String {
    let mut s = String::new();
    IntelFormatter::new().format(inst, &mut s);
    s
}

pub fn listing(insts: &[Instruction]) -> String {
    insts
        .iter()
        .map(|i| format!("{:4x}: {}", i.ip(), text(i)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A `mov r11, imm64; call r11` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsCall {
    /// Index of the call instruction.
    pub index: usize,
    pub target: u64,
    /// Return address, relative to the code start.
    pub ret_ip: u32,
}

impl AbsCall {
    pub fn helper(&self) -> Option<Helper> {
        StubRuntime::helper_at(self.target)
    }
}

pub fn abs_calls(insts: &[Instruction]) -> Vec<AbsCall> {
    insts
        .windows(2)
        .enumerate()
        .filter_map(|(i, w)| {
            let (mov, call) = (&w[0], &w[1]);
            let is_pair = mov.code() == Code::Mov_r64_imm64
                && mov.op0_register() == Register::R11
                && call.code() == Code::Call_rm64
                && call.op0_kind() == OpKind::Register
                && call.op0_register() == Register::R11;
            is_pair.then(|| AbsCall {
                index: i + 1,
                target: mov.immediate64(),
                ret_ip: call.next_ip() as u32,
            })
        })
        .collect()
}

pub fn helper_calls(insts: &[Instruction], helper: Helper) -> Vec<AbsCall> {
    abs_calls(insts)
        .into_iter()
        .filter(|c| c.helper() == Some(helper))
        .collect()
}

/// Instructions writing to `[rbp + disp]`.
pub fn stores_to_frame(insts: &[Instruction], disp: i32) -> Vec<usize> {
    insts
        .iter()
        .enumerate()
        .filter(|(_, i)| {
            i.op_count() == 2
                && i.op0_kind() == OpKind::Memory
                && i.memory_base() == Register::RBP
                && i.memory_index() == Register::None
                && i.memory_displacement64() as i64 == disp as i64
                && text(i).starts_with("mov")
        })
        .map(|(k, _)| k)
        .collect()
}

pub fn index_at_ip(insts: &[Instruction], ip: u32) -> Option<usize> {
    insts.iter().position(|i| i.ip() == ip as u64)
}
