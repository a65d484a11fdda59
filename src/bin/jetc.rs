//! jetc - compile a jasm file with JET and show the result.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use bumpalo::Bump;
use clap::Parser;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, OpKind};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};
use thiserror::Error;

use jet::core::bytecode::decode_all;
use jet::core::{CompilationSession, CompileError, CompileOptions};
use jet::jasm::{self, JasmError, StubRuntime};
use jet::{compile_method, CompiledMethod, MethodInfo};

#[derive(Parser)]
#[command(name = "jetc")]
#[command(about = "Compile JVM bytecode listings to x86-64 with the JET baseline compiler")]
struct Cli {
    #[arg(help = "Input .jasm file")]
    input: PathBuf,

    #[arg(short, long, help = "Only compile methods whose name contains this string")]
    method: Option<String>,

    #[arg(long, help = "Print the info block of each method")]
    info: bool,

    #[arg(long, help = "Print compilation statistics")]
    stats: bool,

    #[arg(short, long, help = "Do not print disassembly")]
    quiet: bool,

    #[arg(long, value_name = "PATH", help = "Write an ELF relocatable object")]
    emit_obj: Option<PathBuf>,

    #[arg(long, help = "Keep all locals in memory")]
    no_global_regs: bool,

    #[arg(long, help = "Emit explicit null checks only")]
    no_hw_null_checks: bool,

    #[arg(long, help = "Call helpers for all arithmetic")]
    no_inline_arith: bool,

    #[arg(long, help = "Omit back-edge safepoint polls")]
    no_polls: bool,

    #[arg(long, help = "Treat invokeinterface of class methods as a linking error")]
    strict_interface: bool,

    #[arg(long, help = "Save all scratch registers in the prolog")]
    save_scratch: bool,

    #[arg(long, help = "Resolve constant pool references at run time")]
    lazy: bool,

    #[arg(long, value_name = "BASE", value_parser = parse_hex, help = "Compressed references with this heap base")]
    compressed_refs: Option<u64>,

    #[arg(long, help = "Emit JVMTI method entry and exit notifications")]
    jvmti: bool,

    #[arg(long, help = "Give the stub VM a safepoint flag and back-edge counters")]
    safepoints: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Jasm(#[from] JasmError),

    #[error("Object emission failed: {0}")]
    Object(#[from] object::write::Error),
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("jetc: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every selected method compiled.
fn run(cli: &Cli) -> Result<bool, CliError> {
    let text = fs::read_to_string(&cli.input).map_err(|source| CliError::Read {
        path: cli.input.clone(),
        source,
    })?;
    let module = jasm::parse(&text)?;
    let vm = StubRuntime::new(&module)
        .with_lazy_resolution(cli.lazy)
        .with_compressed_refs(cli.compressed_refs)
        .with_jvmti(cli.jvmti)
        .with_safepoints(cli.safepoints);
    let opts = CompileOptions {
        global_regs: !cli.no_global_regs,
        hw_null_checks: !cli.no_hw_null_checks,
        inline_arith: !cli.no_inline_arith,
        backedge_polls: !cli.no_polls,
        jvmti_events: cli.jvmti,
        save_all_scratch: cli.save_scratch,
        lenient_interface_dispatch: !cli.strict_interface,
        name_filter: cli.method.clone(),
        ..CompileOptions::default()
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut compiled = Vec::new();
    let mut ok = true;
    for method in &module.methods {
        match compile_method(method, &vm, &opts, &session) {
            Ok(c) => {
                if !cli.quiet {
                    print_method(method, &c);
                }
                if cli.info {
                    print!("{}", c.info);
                }
                compiled.push(c);
            }
            Err(CompileError::Filtered { .. }) => {}
            Err(e) => {
                eprintln!("jetc: {}: {e}", method.full_name());
                ok = false;
            }
        }
    }

    if cli.stats {
        print!("{}", session.stats());
    }
    if let Some(path) = &cli.emit_obj {
        let bytes = build_object(&compiled)?;
        fs::write(path, &bytes).map_err(|source| CliError::Write {
            path: path.clone(),
            source,
        })?;
        println!("Wrote {} methods to {}", compiled.len(), path.display());
    }
    Ok(ok)
}

fn print_method(method: &MethodInfo, c: &CompiledMethod) {
    println!("{}: {} bytes", c.name, c.code.len());
    let names: Vec<(u32, &str)> = decode_all(&method.code)
        .map(|insts| insts.iter().map(|i| (i.pc, i.name())).collect())
        .unwrap_or_default();

    let mut decoder = Decoder::with_ip(64, &c.code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();
    let mut inst = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut inst);
        let ip = inst.ip() as u32;
        for (pc, ip_of) in &c.info.pc_map {
            if *ip_of == ip {
                let name = names
                    .iter()
                    .find(|(p, _)| p == pc)
                    .map(|(_, n)| *n)
                    .unwrap_or("?");
                println!("      ; {pc}: {name}");
            }
        }
        text.clear();
        formatter.format(&inst, &mut text);
        let start = ip as usize;
        let bytes: String = c.code[start..start + inst.len()]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let note = (inst.op_count() == 2 && inst.op1_kind() == OpKind::Immediate64)
            .then(|| StubRuntime::helper_at(inst.immediate64()))
            .flatten()
            .map(|h| format!("  ; {h:?}"))
            .unwrap_or_default();
        println!("  {ip:6x}  {bytes:<24} {text}{note}");
    }
}

/// ELF object with one text symbol and one info block symbol per method.
fn build_object(methods: &[CompiledMethod]) -> Result<Vec<u8>, CliError> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let info = obj.add_section(Vec::new(), b".jet_info".to_vec(), SectionKind::ReadOnlyData);
    for m in methods {
        let off = obj.append_section_data(text, &m.code, 16);
        obj.add_symbol(Symbol {
            name: m.name.clone().into_bytes(),
            value: off,
            size: m.code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        let block = m.info.serialize();
        let off = obj.append_section_data(info, &block, 8);
        obj.add_symbol(Symbol {
            name: format!("{}$info", m.name).into_bytes(),
            value: off,
            size: block.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: SymbolSection::Section(info),
            flags: SymbolFlags::None,
        });
    }
    Ok(obj.write()?)
}
