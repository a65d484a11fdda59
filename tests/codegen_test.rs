//! End-to-end code generation tests: jasm source in, decoded x86-64 out.

mod common;

use common::*;
use iced_x86::{Code, Instruction, Mnemonic, OpKind, Register};

use jet::core::bytecode::{DREM, IDIV};
use jet::core::method::Helper;
use jet::core::CompileOptions;
use jet::runtime::arith::{arith_helper, rt_h_dbl_a, rt_h_i32_a};
use jet::runtime::{CatchClass, GcPointKind};
use jet::{CompileError, JType};

fn branch_target(inst: &Instruction) -> Option<u32> {
    matches!(inst.op0_kind(), OpKind::NearBranch64).then(|| inst.near_branch_target() as u32)
}

fn is_cmp_minus_one(inst: &Instruction) -> bool {
    inst.mnemonic() == Mnemonic::Cmp
        && matches!(
            inst.op1_kind(),
            OpKind::Immediate8to32 | OpKind::Immediate32 | OpKind::Immediate8to64 | OpKind::Immediate32to64
        )
        && inst.immediate(1) as u32 as i32 == -1
}

/// The `call [r11 + disp]` of a virtual dispatch.
fn vtable_call(insts: &[Instruction], disp: u64) -> Option<usize> {
    insts.iter().position(|i| {
        i.code() == Code::Call_rm64
            && i.op0_kind() == OpKind::Memory
            && i.memory_base() == Register::R11
            && i.memory_displacement64() == disp
    })
}

const DIV: &str = "
method static A.div(II)I
    iload_0
    iload_1
    idiv
    ireturn
end

method static A.by_minus_one(I)I
    iload_0
    iconst_m1
    idiv
    ireturn
end

method static A.by_zero(I)I
    iload_0
    iconst_0
    idiv
    ireturn
end
";

#[test]
fn test_idiv_checks_zero_and_minus_one() {
    let m = compile(DIV, "A.div(II)I");
    let insts = disasm(&m.code);
    let listing = listing(&insts);

    let throws = helper_calls(&insts, Helper::ThrowArithmetic);
    assert_eq!(throws.len(), 1, "{listing}");
    let idiv = insts
        .iter()
        .position(|i| i.code() == Code::Idiv_rm32)
        .expect("idiv");
    assert!(throws[0].index < idiv, "zero check must come first:\n{listing}");

    let cmp = insts.iter().position(is_cmp_minus_one).expect("cmp -1");
    assert!(cmp < idiv);
    assert_eq!(insts[cmp + 1].mnemonic(), Mnemonic::Jne, "{listing}");
    assert_eq!(insts[cmp + 2].code(), Code::Neg_rm32, "{listing}");

    // The slow path sign-extends and divides.
    let cdq = insts.iter().position(|i| i.code() == Code::Cdq).expect("cdq");
    assert_eq!(cdq + 1, idiv);
    assert_eq!(branch_target(&insts[cmp + 1]), Some(insts[cdq].ip() as u32));

    // The special case agrees with the helper.
    assert_eq!(rt_h_i32_a(i32::MIN, -1, IDIV as u32), i32::MIN);
    assert_eq!(rt_h_i32_a(7, -2, IDIV as u32), -3);
}

#[test]
fn test_idiv_by_constants() {
    let insts = disasm(&compile(DIV, "A.by_minus_one(I)I").code);
    assert!(insts.iter().any(|i| i.code() == Code::Neg_rm32));
    assert!(!insts.iter().any(|i| i.mnemonic() == Mnemonic::Idiv));
    assert!(helper_calls(&insts, Helper::ThrowArithmetic).is_empty());

    let insts = disasm(&compile(DIV, "A.by_zero(I)I").code);
    assert_eq!(helper_calls(&insts, Helper::ThrowArithmetic).len(), 1);
    assert!(!insts.iter().any(|i| i.mnemonic() == Mnemonic::Idiv));
}

const FLOW: &str = "
method static A.sum(I)I
    iconst_0
    istore_1
top:
    iload_0
    ifle done
    iload_1
    iload_0
    iadd
    istore_1
    iinc 0 -1
    goto top
done:
    iload_1
    ireturn
end

method static A.pick(I)I
    iload_0
    ifeq other
    iconst_1
    goto join
other:
    iconst_2
join:
    ireturn
end
";

#[test]
fn test_loop_branches_land_on_block_starts() {
    let m = compile(FLOW, "A.sum(I)I");
    let insts = disasm(&m.code);
    let listing = listing(&insts);
    let top = m.info.bc_to_native(2).expect("loop header");
    let done = m.info.bc_to_native(16).expect("exit");

    let back: Vec<_> = insts
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Jmp && branch_target(i) == Some(top))
        .collect();
    assert_eq!(back.len(), 1, "{listing}");
    assert!(back[0].ip() as u32 > top);

    assert!(
        insts
            .iter()
            .any(|i| i.mnemonic() == Mnemonic::Jle && branch_target(i) == Some(done)),
        "{listing}"
    );
    // Both branch targets begin an instruction.
    assert!(index_at_ip(&insts, top).is_some());
    assert!(index_at_ip(&insts, done).is_some());
}

#[test]
fn test_merge_point_sees_values_in_stack_slots() {
    let m = compile(FLOW, "A.pick(I)I");
    let insts = disasm(&m.code);
    let listing = listing(&insts);
    let join = m.info.bc_to_native(9).expect("join");
    let slot = m.info.header.frame.stack;

    let stores = stores_to_frame(&insts, slot);
    assert_eq!(stores.len(), 2, "{listing}");
    for &s in &stores {
        let next = &insts[s + 1];
        let reaches_join =
            next.ip() as u32 == join || (next.mnemonic() == Mnemonic::Jmp && branch_target(next) == Some(join));
        assert!(reaches_join, "store at {:#x} does not flow to the join:\n{listing}", insts[s].ip());
    }

    // The join reads the value back from the same slot.
    let at = index_at_ip(&insts, join).expect("join instruction");
    assert!(insts[at..].iter().any(|i| {
        i.op_count() == 2
            && i.op1_kind() == OpKind::Memory
            && i.memory_base() == Register::RBP
            && i.memory_displacement64() as i64 == slot as i64
    }));
}

const CALLS: &str = "
.method java/lang/Object.toString()Ljava/lang/String; vtable 72

method static A.show(Ljava/lang/Object;)Ljava/lang/Object;
    aload_0
    invokevirtual java/lang/Object.toString()Ljava/lang/String;
    areturn
end

method static A.show_null()Ljava/lang/Object;
    aconst_null
    invokevirtual java/lang/Object.toString()Ljava/lang/String;
    areturn
end
";

#[test]
fn test_virtual_call_checks_receiver_before_dispatch() {
    let insts = disasm(&compile(CALLS, "A.show(Ljava/lang/Object;)Ljava/lang/Object;").code);
    let listing = listing(&insts);

    let npe = helper_calls(&insts, Helper::ThrowNullPointer);
    assert_eq!(npe.len(), 1, "{listing}");
    let npe = npe[0];
    assert_eq!(insts[npe.index + 1].code(), Code::Int3);

    let vt_load = insts
        .iter()
        .position(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op_count() == 2
                && i.op1_kind() == OpKind::Memory
                && i.memory_base() == Register::RDI
                && i.memory_displacement64() == 0
        })
        .expect("vtable load");
    let call = vtable_call(&insts, 72).expect("vtable call");
    assert!(npe.index < vt_load && vt_load < call, "{listing}");

    // The non-null path skips the throw and lands before the dispatch.
    let jne = &insts[npe.index - 2];
    assert_eq!(jne.mnemonic(), Mnemonic::Jne, "{listing}");
    let ok = branch_target(jne).expect("jne target");
    assert_eq!(ok as u64, insts[npe.index + 1].next_ip());
    assert!((ok as u64) <= insts[vt_load].ip());
}

#[test]
fn test_null_receiver_always_throws() {
    let insts = disasm(&compile(CALLS, "A.show_null()Ljava/lang/Object;").code);
    let npe = helper_calls(&insts, Helper::ThrowNullPointer);
    assert_eq!(npe.len(), 1);
    assert!(!insts[..npe[0].index]
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Jne));
}

const SYNC: &str = "
.class java/lang/Error

method synchronized A.guard(I)I
    iload_1
    ifne boom
    iconst_1
    ireturn
boom:
    new java/lang/Error
    athrow
end
";

#[test]
fn test_synchronized_method_releases_monitor_on_exception() {
    let m = compile(SYNC, "A.guard(I)I");
    let info = &m.info;
    let insts = disasm(&m.code);
    let listing = listing(&insts);
    assert!(info.header.flags.synchronized);

    let enters = helper_calls(&insts, Helper::MonitorEnter);
    let exits = helper_calls(&insts, Helper::MonitorExit);
    assert_eq!(enters.len(), 1, "{listing}");
    // One per return plus the catch-all.
    assert_eq!(exits.len(), 2, "{listing}");

    let catch_all: Vec<_> = info
        .handlers
        .iter()
        .filter(|h| h.class == CatchClass::Any)
        .collect();
    assert!(!catch_all.is_empty());
    let handler = catch_all[0].handler_ip;
    assert!(catch_all.iter().all(|h| h.handler_ip == handler));

    assert_eq!(info.handlers_at_return(enters[0].ret_ip).count(), 0);
    for exit in &exits {
        assert_eq!(info.handlers_at_return(exit.ret_ip).count(), 0, "{listing}");
    }

    let throws = helper_calls(&insts, Helper::Throw);
    let body_throw = throws
        .iter()
        .find(|t| t.ret_ip < handler)
        .expect("athrow in the body");
    assert!(info
        .handlers_at_return(body_throw.ret_ip)
        .any(|h| h.handler_ip == handler));
    let news = helper_calls(&insts, Helper::NewObject);
    assert_eq!(news.len(), 1);
    assert!(info.handlers_at_return(news[0].ret_ip).any(|h| h.handler_ip == handler));

    // The handler unlocks and rethrows.
    let handler_exit = exits.iter().find(|e| e.ret_ip > handler).expect("handler exit");
    assert!(throws.iter().any(|t| t.ret_ip > handler_exit.ret_ip));

    // The lock object is saved before the monitor is entered.
    let saved = stores_to_frame(&insts, info.header.frame.sync_obj);
    assert!(saved.first().is_some_and(|&s| s < enters[0].index), "{listing}");
}

const WIDE: &str = "
method static A.neg(J)J
    lload_0
    lneg
    lreturn
end

method static A.rem(DD)D
    dload_0
    dload_2
    drem
    dreturn
end
";

#[test]
fn test_long_negate_inline() {
    let insts = disasm(&compile(WIDE, "A.neg(J)J").code);
    assert!(insts.iter().any(|i| i.code() == Code::Neg_rm64), "{}", listing(&insts));
}

#[test]
fn test_double_remainder_calls_helper() {
    let insts = disasm(&compile(WIDE, "A.rem(DD)D").code);
    let target = arith_helper(JType::F64, DREM).expect("drem helper");
    assert_eq!(
        abs_calls(&insts).iter().filter(|c| c.target == target).count(),
        1,
        "{}",
        listing(&insts)
    );
    assert!(!insts.iter().any(|i| i.mnemonic() == Mnemonic::Divsd));

    assert_eq!(rt_h_dbl_a(1.5, f64::INFINITY, DREM as u32), 1.5);
    assert_eq!(rt_h_dbl_a(-3.0, f64::NEG_INFINITY, DREM as u32), -3.0);
    assert!(rt_h_dbl_a(f64::INFINITY, 2.0, DREM as u32).is_nan());
}

const OBJECTS: &str = "
.class A
.class P
.field P.x I offset 16
.static P.count I
.method A.consume(I)V

method static A.keep()Ljava/lang/Object;
    new A
    iconst_1
    invokestatic A.consume(I)V
    areturn
end

method static A.getx(LP;)I
    aload_0
    getfield P.x I
    ireturn
end

method static A.count()I
    getstatic P.count I
    ireturn
end

method static A.missing()V
    invokestatic A.nowhere()V
    return
end
";

#[test]
fn test_call_gc_point_records_stack_refs() {
    let m = compile(OBJECTS, "A.keep()Ljava/lang/Object;");
    let insts = disasm(&m.code);
    let listing = listing(&insts);

    let call = insts
        .iter()
        .find(|i| {
            i.code() == Code::Call_rm64
                && i.op0_kind() == OpKind::Memory
                && i.memory_base() == Register::R11
                && i.memory_displacement64() == 0
        })
        .expect("static call through the entry slot");
    let point = m
        .info
        .gc_point_at(call.next_ip() as u32)
        .unwrap_or_else(|| panic!("no GC point after the call:\n{listing}"));
    assert_eq!(point.kind, GcPointKind::Call);
    assert_eq!(point.depth, 1);
    assert!(point.stack_has_ref(0));

    // The allocation happens on an empty stack.
    let new = helper_calls(&insts, Helper::NewObject)[0];
    let point = m.info.gc_point_at(new.ret_ip).expect("allocation GC point");
    assert_eq!(point.depth, 0);
}

#[test]
fn test_hardware_null_check_on_field_load() {
    let m = compile(OBJECTS, "A.getx(LP;)I");
    let insts = disasm(&m.code);
    assert!(helper_calls(&insts, Helper::ThrowNullPointer).is_empty());

    let point = m
        .info
        .gc_points
        .iter()
        .find(|g| g.kind == GcPointKind::ImplicitNullCheck)
        .expect("implicit null check point");
    let at = index_at_ip(&insts, point.ip).expect("faulting instruction");
    assert!((0..insts[at].op_count()).any(|k| insts[at].op_kind(k) == OpKind::Memory));
    assert_eq!(insts[at].memory_displacement64(), 16);
}

#[test]
fn test_explicit_null_check_when_disabled() {
    let opts = CompileOptions {
        hw_null_checks: false,
        ..CompileOptions::default()
    };
    let m = compile_with(OBJECTS, "A.getx(LP;)I", &opts, |vm| vm).unwrap();
    let insts = disasm(&m.code);
    assert_eq!(helper_calls(&insts, Helper::ThrowNullPointer).len(), 1);
    assert!(!m
        .info
        .gc_points
        .iter()
        .any(|g| g.kind == GcPointKind::ImplicitNullCheck));
}

#[test]
fn test_lazy_static_access_resolves_at_run_time() {
    let opts = CompileOptions::default();
    let eager = compile_with(OBJECTS, "A.count()I", &opts, |vm| vm).unwrap();
    assert!(helper_calls(&disasm(&eager.code), Helper::ResolveField).is_empty());

    let lazy = compile_with(OBJECTS, "A.count()I", &opts, |vm| vm.with_lazy_resolution(true)).unwrap();
    assert_eq!(helper_calls(&disasm(&lazy.code), Helper::ResolveField).len(), 1);
}

#[test]
fn test_unresolved_method_becomes_linking_error() {
    let insts = disasm(&compile(OBJECTS, "A.missing()V").code);
    assert_eq!(helper_calls(&insts, Helper::ThrowLinkingError).len(), 1);
}

#[test]
fn test_name_filter_skips_method() {
    let opts = CompileOptions {
        name_filter: Some("nothing".to_string()),
        ..CompileOptions::default()
    };
    let err = compile_with(OBJECTS, "A.count()I", &opts, |vm| vm).unwrap_err();
    assert!(matches!(err, CompileError::Filtered { .. }));
}

const SWITCH: &str = "
method static A.classify(I)I
    iload_0
    tableswitch 0 other zero one two
zero:
    iconst_5
    ireturn
one:
    bipush 10
    ireturn
two:
    bipush 20
    ireturn
other:
    iconst_m1
    ireturn
end

method static A.loop(I)V
top:
    iinc 0 -1
    iload_0
    ifgt top
    return
end
";

#[test]
fn test_switch_targets_are_generated() {
    let m = compile(SWITCH, "A.classify(I)I");
    // iload_0 at 0, tableswitch at 1 padded to 4: 3 + 12 + 12 bytes.
    for pc in [28, 30, 33, 36] {
        assert!(m.info.bc_to_native(pc).is_some(), "no code for pc {pc}");
    }
}

#[test]
fn test_back_edge_polls_safepoint() {
    let opts = CompileOptions::default();
    let m = compile_with(SWITCH, "A.loop(I)V", &opts, |vm| vm.with_safepoints(true)).unwrap();
    let insts = disasm(&m.code);
    let polls = helper_calls(&insts, Helper::GcSafepoint);
    assert_eq!(polls.len(), 1, "{}", listing(&insts));
    assert!(m.info.gc_point_at(polls[0].ret_ip).is_some());

    let opts = CompileOptions {
        backedge_polls: false,
        ..CompileOptions::default()
    };
    let m = compile_with(SWITCH, "A.loop(I)V", &opts, |vm| vm.with_safepoints(true)).unwrap();
    assert!(helper_calls(&disasm(&m.code), Helper::GcSafepoint).is_empty());
}
