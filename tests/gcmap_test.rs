//! GC maps checked against the generated code: every register and stack slot a GC
//! point reports must have been written on every path reaching it.

mod common;

use std::collections::BTreeSet;

use common::*;
use iced_x86::{FlowControl, Instruction, InstructionInfoFactory, OpAccess, OpKind, Register};

use jet::core::CompileOptions;
use jet::runtime::GcPointKind;
use jet::CompiledMethod;

/// Registers and rbp-relative slots written so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Defs {
    regs: u32,
    slots: BTreeSet<i64>,
}

impl Defs {
    fn meet(&self, other: &Defs) -> Defs {
        Defs {
            regs: self.regs & other.regs,
            slots: self.slots.intersection(&other.slots).copied().collect(),
        }
    }
}

fn hw(reg: Register) -> Option<u32> {
    let n = match reg.full_register() {
        Register::RAX => 0,
        Register::RCX => 1,
        Register::RDX => 2,
        Register::RBX => 3,
        Register::RSI => 6,
        Register::RDI => 7,
        Register::R8 => 8,
        Register::R9 => 9,
        Register::R10 => 10,
        Register::R12 => 12,
        Register::R13 => 13,
        Register::R14 => 14,
        Register::R15 => 15,
        _ => return None,
    };
    Some(n)
}

fn apply(info: &mut InstructionInfoFactory, inst: &Instruction, defs: &Defs) -> Defs {
    let mut out = defs.clone();
    let used = info.info(inst);
    for r in used.used_registers() {
        if r.access() == OpAccess::Write {
            if let Some(n) = hw(r.register()) {
                out.regs |= 1 << n;
            }
        }
    }
    for m in used.used_memory() {
        if m.access() == OpAccess::Write && m.base() == Register::RBP && m.index() == Register::None {
            out.slots.insert(m.displacement() as i64);
        }
    }
    out
}

/// Must-defined state before each instruction; `None` where unreachable.
fn reaching_defs(m: &CompiledMethod, insts: &[Instruction]) -> Vec<Option<Defs>> {
    let index_of = |ip: u64| insts.iter().position(|i| i.ip() == ip);
    let mut factory = InstructionInfoFactory::new();
    let mut state: Vec<Option<Defs>> = vec![None; insts.len()];
    state[0] = Some(Defs::default());
    let mut work = vec![0usize];

    while let Some(k) = work.pop() {
        let Some(before) = state[k].clone() else {
            continue;
        };
        let inst = &insts[k];
        let after = apply(&mut factory, inst, &before);

        let mut succs = Vec::new();
        match inst.flow_control() {
            FlowControl::Next | FlowControl::Call | FlowControl::IndirectCall => succs.push(k + 1),
            FlowControl::ConditionalBranch => {
                succs.push(k + 1);
                succs.extend(index_of(inst.near_branch_target()));
            }
            FlowControl::UnconditionalBranch if inst.op0_kind() == OpKind::NearBranch64 => {
                succs.extend(index_of(inst.near_branch_target()));
            }
            _ => {}
        }
        if matches!(inst.flow_control(), FlowControl::Call | FlowControl::IndirectCall) {
            for h in m.info.handlers_at_return(inst.next_ip() as u32) {
                succs.extend(index_of(h.handler_ip as u64));
            }
        }

        for s in succs.into_iter().filter(|&s| s < insts.len()) {
            let merged = match &state[s] {
                None => after.clone(),
                Some(prev) => prev.meet(&after),
            };
            if state[s].as_ref() != Some(&merged) {
                state[s] = Some(merged);
                work.push(s);
            }
        }
    }
    state
}

/// Check every GC point of `m`; returns how many were reachable.
fn check_gc_points(m: &CompiledMethod) -> usize {
    let insts = disasm(&m.code);
    let listing = listing(&insts);
    let state = reaching_defs(m, &insts);
    let mut factory = InstructionInfoFactory::new();
    let frame = &m.info.header.frame;
    let mut checked = 0;

    for point in &m.info.gc_points {
        let defs = match point.kind {
            GcPointKind::Entry => continue,
            GcPointKind::Call => {
                let k = insts
                    .iter()
                    .position(|i| i.next_ip() == point.ip as u64)
                    .expect("call before GC point");
                state[k].as_ref().map(|d| apply(&mut factory, &insts[k], d))
            }
            GcPointKind::ImplicitNullCheck => {
                let k = index_at_ip(&insts, point.ip).expect("faulting instruction");
                state[k].clone()
            }
        };
        let Some(defs) = defs else {
            continue;
        };
        checked += 1;

        let undefined = point.regs & !defs.regs;
        assert_eq!(
            undefined, 0,
            "registers {undefined:#x} reported at {:#x} before being written:\n{listing}",
            point.ip
        );
        for pos in 0..point.depth as usize {
            if point.stack_has_ref(pos) {
                let disp = (frame.stack + 8 * pos as i32) as i64;
                assert!(
                    defs.slots.contains(&disp),
                    "stack slot {pos} reported at {:#x} before being written:\n{listing}",
                    point.ip
                );
            }
        }
    }
    checked
}

const SRC: &str = "
.class java/lang/Exception
.method A.consume()V
.method A.make()Ljava/lang/Object;
.method A.keep(Ljava/lang/Object;)V

method static A.loop(I)V
    invokestatic A.consume()V
top:
    aconst_null
    astore_1
    aload_1
    invokestatic A.keep(Ljava/lang/Object;)V
    iinc 0 -1
    iload_0
    ifgt top
    return
end

method static A.guarded(Ljava/lang/Object;)Ljava/lang/Object;
s:  invokestatic A.make()Ljava/lang/Object;
    astore_1
    aload_1
    invokestatic A.keep(Ljava/lang/Object;)V
e:  aload_1
    areturn
h:  astore_2
    aload_2
    invokestatic A.keep(Ljava/lang/Object;)V
    aload_0
    areturn
.catch s e h java/lang/Exception
end

method static A.pending()Ljava/lang/Object;
    invokestatic A.make()Ljava/lang/Object;
    invokestatic A.make()Ljava/lang/Object;
    invokestatic A.keep(Ljava/lang/Object;)V
    areturn
end
";

#[test]
fn test_ref_global_is_null_before_first_store() {
    let m = compile(SRC, "A.loop(I)V");
    let reg = m.info.global_reg_of(1).expect("local 1 in a global register");

    // The call ahead of the loop already reports the register.
    let insts = disasm(&m.code);
    let first = m
        .info
        .gc_points
        .iter()
        .find(|g| g.kind == GcPointKind::Call)
        .expect("call GC point");
    assert!(first.regs & (1 << reg) != 0);
    assert!(check_gc_points(&m) >= 2, "{}", listing(&insts));
}

#[test]
fn test_handler_entry_maps_are_defined() {
    let m = compile(SRC, "A.guarded(Ljava/lang/Object;)Ljava/lang/Object;");
    assert!(!m.info.handlers.is_empty());
    assert!(check_gc_points(&m) >= 3);
}

#[test]
fn test_stack_refs_are_spilled_before_calls() {
    let m = compile(SRC, "A.pending()Ljava/lang/Object;");
    assert!(m.info.gc_points.iter().any(|g| g.stack_has_ref(0)));
    assert!(check_gc_points(&m) >= 3);
}

#[test]
fn test_maps_hold_in_memory_only_frames() {
    let opts = CompileOptions {
        global_regs: false,
        ..CompileOptions::default()
    };
    for name in [
        "A.loop(I)V",
        "A.guarded(Ljava/lang/Object;)Ljava/lang/Object;",
        "A.pending()Ljava/lang/Object;",
    ] {
        let m = compile_with(SRC, name, &opts, |vm| vm).unwrap();
        assert!(m.info.global_regs.is_empty());
        assert!(check_gc_points(&m) > 0);
    }
}
