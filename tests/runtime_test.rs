//! Info block and stack-walking tests on compiled methods.

mod common;

use common::*;
use hashbrown::HashMap;

use jet::core::method::Helper;
use jet::runtime::{
    rt_bc2native, rt_enum, rt_get_local_var, rt_native2bc, rt_unwind, InfoBlock, InfoBlockError,
    MemoryAccess, RegContext, RegSlot, RootLoc,
};
use jet::JType;

#[derive(Default)]
struct Mem(HashMap<u64, u64>);

impl MemoryAccess for Mem {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        self.0.get(&addr).copied()
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> bool {
        self.0.insert(addr, value);
        true
    }
}

const SRC: &str = "
.class java/lang/Error
.method A.work(I)V

method synchronized A.guard(Ljava/lang/Object;I)I
    aload_1
    astore_3
    iload_2
    invokestatic A.work(I)V
    iload_2
    ifne boom
    iconst_1
    ireturn
boom:
    new java/lang/Error
    athrow
end
";

const NAME: &str = "A.guard(Ljava/lang/Object;I)I";

#[test]
fn test_info_block_round_trip() {
    let m = compile(SRC, NAME);
    let bytes = m.info.serialize();
    let back = InfoBlock::deserialize(&bytes).unwrap();
    assert_eq!(back, m.info);
    assert_eq!(back.header.code_len as usize, m.code.len());

    assert!(matches!(
        InfoBlock::deserialize(&bytes[..bytes.len() / 2]),
        Err(InfoBlockError::Truncated { .. })
    ));
}

#[test]
fn test_pc_mapping_is_monotonic_per_block() {
    let m = compile(SRC, NAME);
    let info = &m.info;
    for &(pc, ip) in &info.pc_map {
        assert_eq!(info.bc_to_native(pc), Some(ip));
        assert_eq!(rt_bc2native(info, pc), Some(info.header.code_start + ip as u64));
        // Several bytecodes may share an address; the mapping back picks one of them.
        let back = info.native_to_bc(ip).unwrap();
        assert_eq!(info.bc_to_native(back), Some(ip));
    }
    assert_eq!(rt_native2bc(info, info.header.code_start + m.code.len() as u64), None);
}

#[test]
fn test_enumerate_roots_at_call() {
    let m = compile(SRC, NAME);
    let info = &m.info;
    let insts = disasm(&m.code);
    let listing = listing(&insts);

    let call = insts
        .iter()
        .find(|i| i.mnemonic() == iced_x86::Mnemonic::Call && i.memory_base() == iced_x86::Register::R11)
        .expect("static call");
    let ret_ip = call.next_ip() as u32;
    assert!(info.gc_point_at(ret_ip).is_some(), "{listing}");

    let bp = 0x7fff_0000u64;
    let mut mem = Mem::default();
    // Every local slot claims to hold a reference.
    let words = (info.header.num_locals as usize).div_ceil(64);
    for w in 0..words {
        let addr = bp.wrapping_add_signed((info.header.frame.gc_locals + 8 * w as i32) as i64);
        mem.write_u64(addr, 0);
    }
    let mut ctx = RegContext {
        ip: info.header.code_start + ret_ip as u64,
        sp: bp - info.header.frame.frame_size as u64,
        bp,
        ..RegContext::default()
    };
    for hw in 0..16 {
        ctx.regs[hw] = RegSlot::Value(0);
    }

    let roots = rt_enum(info, &ctx, &mem).unwrap();
    let sync = bp.wrapping_add_signed(info.header.frame.sync_obj as i64);
    assert!(roots.contains(&RootLoc::Stack(sync)), "{roots:?}");

    // Local 3 holds the copied reference, in a register or a marked slot.
    match info.global_reg_of(3) {
        Some(hw) => assert!(info.gc_point_at(ret_ip).unwrap().regs & (1 << hw) != 0),
        None => {
            let word = bp.wrapping_add_signed(info.header.frame.gc_locals as i64);
            mem.write_u64(word, 1 << 3);
            let roots = rt_enum(info, &ctx, &mem).unwrap();
            let slot = bp.wrapping_add_signed((info.header.frame.locals + 24) as i64);
            assert!(roots.contains(&RootLoc::Stack(slot)));
        }
    }
}

#[test]
fn test_unwind_from_body() {
    let m = compile(SRC, NAME);
    let info = &m.info;
    let insts = disasm(&m.code);
    let throw = helper_calls(&insts, Helper::Throw)[0];

    let bp = 0x7fff_0000u64;
    let mut mem = Mem::default();
    mem.write_u64(bp, 0x7fff_1000);
    mem.write_u64(bp + 8, 0xdead_beef);
    let mut ctx = RegContext {
        ip: info.header.code_start + throw.ret_ip as u64,
        sp: bp - info.header.frame.frame_size as u64,
        bp,
        ..RegContext::default()
    };
    ctx.regs[0] = RegSlot::Value(7);

    let caller = rt_unwind(info, &ctx, &mem).unwrap();
    assert_eq!(caller.ip, 0xdead_beef);
    assert_eq!(caller.bp, 0x7fff_1000);
    assert_eq!(caller.sp, bp + 16);
    for (hw, slot) in caller.regs.iter().enumerate() {
        if info.header.saved_regs_mask & (1 << hw) != 0 {
            assert!(matches!(slot, RegSlot::Saved(_)));
        }
    }

    // At the first byte nothing has been pushed yet.
    let entry = RegContext {
        ip: info.header.code_start,
        sp: 0x1000,
        ..RegContext::default()
    };
    let mut mem = Mem::default();
    mem.write_u64(0x1000, 0x4242);
    let caller = rt_unwind(info, &entry, &mem).unwrap();
    assert_eq!((caller.ip, caller.sp), (0x4242, 0x1008));
}

#[test]
fn test_read_int_local() {
    let m = compile(SRC, NAME);
    let info = &m.info;
    let bp = 0x7fff_0000u64;
    let mut mem = Mem::default();
    let mut ctx = RegContext {
        bp,
        ..RegContext::default()
    };
    match info.global_reg_of(2) {
        Some(hw) => ctx.regs[hw as usize] = RegSlot::Value(41),
        None => {
            let slot = bp.wrapping_add_signed((info.header.frame.locals + 16) as i64);
            mem.write_u64(slot, 0xffff_ffff_0000_0029);
        }
    }
    assert_eq!(rt_get_local_var(info, &ctx, &mem, 2, JType::I32).unwrap() & 0xff, 41);
}
