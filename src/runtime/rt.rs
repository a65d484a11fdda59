//! Stack-walking support for frames of compiled methods.
//!
//! Every routine works from the method's [`InfoBlock`] plus a register context
//! captured by the VM's stack walker. Frame memory is reached through
//! [`MemoryAccess`] so the walker can run against a live thread or a snapshot.
//!
//! Three prolog states are distinguished by the instruction pointer:
//! at the first byte nothing has been pushed, one byte in only `rbp` has been
//! pushed, and from the fourth byte on `rbp` addresses the new frame. Until the
//! warm-up part of the prolog has completed, callee-save registers still hold
//! the caller's values and no GC maps apply.

use super::infoblock::{GcPointKind, InfoBlock};
use crate::core::jtype::JType;
use crate::core::register_file::Ar;
use crate::x64::calling_convention::GP_ARG_REGS;
use crate::x64::GLOBAL_GP;
use thiserror::Error;

/// Size of `push rbp`.
const PUSH_RBP_LEN: u64 = 1;
/// Size of `push rbp; mov rbp, rsp`.
const FRAME_SETUP_LEN: u64 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    #[error("ip {ip:#x} is outside the method code")]
    OutsideMethod { ip: u64 },

    #[error("ip {ip:#x} is inside the frame setup sequence")]
    InsideFrameSetup { ip: u64 },

    #[error("no GC point at ip {ip:#x}")]
    NotAGcPoint { ip: u64 },

    #[error("cannot read frame memory at {addr:#x}")]
    BadAddress { addr: u64 },

    #[error("local {index} out of range")]
    BadLocal { index: u32 },

    #[error("register {0:?} not available in context")]
    UnknownRegister(Ar),
}

/// Where a register of the context currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegSlot {
    #[default]
    Unknown,
    Value(u64),
    /// Saved in frame memory at this address.
    Saved(u64),
}

/// Register state of one frame as seen by the stack walker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegContext {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
    /// General-purpose registers by hardware number.
    pub regs: [RegSlot; 16],
}

impl RegContext {
    pub fn reg(&self, ar: Ar) -> RegSlot {
        self.regs[ar.hw() as usize]
    }

    pub fn set_reg(&mut self, ar: Ar, slot: RegSlot) {
        self.regs[ar.hw() as usize] = slot;
    }
}

/// Access to the memory of the thread being walked.
pub trait MemoryAccess {
    fn read_u64(&self, addr: u64) -> Option<u64>;

    fn write_u64(&mut self, addr: u64, value: u64) -> bool;

    fn read_u32(&self, addr: u64) -> Option<u32> {
        self.read_u64(addr).map(|v| v as u32)
    }
}

/// Location of one GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootLoc {
    /// Frame memory address.
    Stack(u64),
    /// Register of the context (hardware number) whose current value is a root.
    Register(u8),
}

fn read(mem: &dyn MemoryAccess, addr: u64) -> Result<u64, RtError> {
    mem.read_u64(addr).ok_or(RtError::BadAddress { addr })
}

fn frame_addr(bp: u64, off: i32) -> u64 {
    bp.wrapping_add_signed(off as i64)
}

/// Offset of `ip` from the code start, or an error when it is not inside the method.
fn rel_ip(info: &InfoBlock, ip: u64) -> Result<u64, RtError> {
    let start = info.header.code_start;
    match ip.checked_sub(start) {
        Some(rel) if rel < info.header.code_len as u64 => Ok(rel),
        _ => Err(RtError::OutsideMethod { ip }),
    }
}

fn in_warmup(info: &InfoBlock, rel: u64) -> bool {
    rel < info.header.warmup_len as u64
}

/// Address of the callee-save slot of `GLOBAL_GP[k]`.
fn callee_save_addr(info: &InfoBlock, bp: u64, k: usize) -> u64 {
    frame_addr(bp, info.header.frame.callee_save - 8 * k as i32)
}

/// Unwind one frame: compute the caller's context from `ctx`.
pub fn rt_unwind(
    info: &InfoBlock,
    ctx: &RegContext,
    mem: &dyn MemoryAccess,
) -> Result<RegContext, RtError> {
    let rel = rel_ip(info, ctx.ip)?;
    let mut caller = ctx.clone();
    if rel == 0 || info.header.flags.trivial {
        caller.ip = read(mem, ctx.sp)?;
        caller.sp = ctx.sp + 8;
        return Ok(caller);
    }
    if rel == PUSH_RBP_LEN {
        caller.bp = read(mem, ctx.sp)?;
        caller.ip = read(mem, ctx.sp + 8)?;
        caller.sp = ctx.sp + 16;
        return Ok(caller);
    }
    if rel < FRAME_SETUP_LEN {
        return Err(RtError::InsideFrameSetup { ip: ctx.ip });
    }
    let bp = ctx.bp;
    caller.bp = read(mem, bp)?;
    caller.ip = read(mem, bp + 8)?;
    caller.sp = bp + 16;
    if !in_warmup(info, rel) {
        for (k, &ar) in GLOBAL_GP.iter().enumerate() {
            if info.header.saved_regs_mask & (1 << ar.hw()) != 0 {
                caller.set_reg(ar, RegSlot::Saved(callee_save_addr(info, bp, k)));
            }
        }
    }
    Ok(caller)
}

fn reg_root(ctx: &RegContext, hw: u8) -> Result<RootLoc, RtError> {
    match ctx.regs[hw as usize & 15] {
        RegSlot::Saved(addr) => Ok(RootLoc::Stack(addr)),
        RegSlot::Value(_) => Ok(RootLoc::Register(hw)),
        RegSlot::Unknown => Err(RtError::UnknownRegister(Ar::gp(hw))),
    }
}

/// Enumerate the GC roots of the frame described by `ctx`.
///
/// The frame must be stopped at its entry or at a recorded GC point.
pub fn rt_enum(
    info: &InfoBlock,
    ctx: &RegContext,
    mem: &dyn MemoryAccess,
) -> Result<Vec<RootLoc>, RtError> {
    let rel = rel_ip(info, ctx.ip)?;
    let h = &info.header;
    let mut roots = Vec::new();

    if rel == 0 {
        for ar in GP_ARG_REGS {
            if h.entry_reg_args & (1 << ar.hw()) != 0 {
                roots.push(reg_root(ctx, ar.hw())?);
            }
        }
        for slot in 0..64u64 {
            if h.entry_stack_args & (1 << slot) != 0 {
                roots.push(RootLoc::Stack(ctx.sp + 8 + 8 * slot));
            }
        }
        return Ok(roots);
    }
    if in_warmup(info, rel) {
        return Err(RtError::NotAGcPoint { ip: ctx.ip });
    }
    let point = info
        .gc_point_at(rel as u32)
        .filter(|g| g.kind != GcPointKind::Entry)
        .ok_or(RtError::NotAGcPoint { ip: ctx.ip })?;

    let bp = ctx.bp;
    let f = &h.frame;
    // Locals homed in memory are tracked by the frame's own bitmap.
    let words = (h.num_locals as usize).div_ceil(64);
    for w in 0..words {
        let bits = read(mem, frame_addr(bp, f.gc_locals + 8 * w as i32))?;
        for b in 0..64 {
            let idx = w * 64 + b;
            if idx >= h.num_locals as usize {
                break;
            }
            if bits & (1u64 << b) != 0 && info.global_reg_of(idx as u16).is_none() {
                roots.push(RootLoc::Stack(frame_addr(bp, f.locals + 8 * idx as i32)));
            }
        }
    }
    for pos in 0..point.depth as usize {
        if point.stack_has_ref(pos) {
            roots.push(RootLoc::Stack(frame_addr(bp, f.stack + 8 * pos as i32)));
        }
    }
    for hw in 0..16u8 {
        if point.regs & (1 << hw) != 0 {
            roots.push(reg_root(ctx, hw)?);
        }
    }
    if h.flags.synchronized && !h.flags.is_static {
        roots.push(RootLoc::Stack(frame_addr(bp, f.sync_obj)));
    }
    if point.retval_ref {
        roots.push(RootLoc::Stack(frame_addr(bp, f.retval)));
    }
    Ok(roots)
}

fn local_addr(info: &InfoBlock, ctx: &RegContext, index: u32) -> Result<u64, RtError> {
    if index >= info.header.num_locals as u32 {
        return Err(RtError::BadLocal { index });
    }
    Ok(frame_addr(ctx.bp, info.header.frame.locals + 8 * index as i32))
}

/// Read local `index` of type `jt`.
pub fn rt_get_local_var(
    info: &InfoBlock,
    ctx: &RegContext,
    mem: &dyn MemoryAccess,
    index: u32,
    jt: JType,
) -> Result<u64, RtError> {
    if let Some(hw) = info.global_reg_of(index as u16) {
        return match ctx.regs[hw as usize] {
            RegSlot::Value(v) => Ok(v),
            RegSlot::Saved(addr) => read(mem, addr),
            RegSlot::Unknown => Err(RtError::UnknownRegister(Ar::gp(hw))),
        };
    }
    let addr = local_addr(info, ctx, index)?;
    let raw = read(mem, addr)?;
    Ok(if jt.size_bytes() <= 4 {
        raw & 0xffff_ffff
    } else {
        raw
    })
}

/// Overwrite local `index`.
pub fn rt_set_local_var(
    info: &InfoBlock,
    ctx: &mut RegContext,
    mem: &mut dyn MemoryAccess,
    index: u32,
    value: u64,
) -> Result<(), RtError> {
    if let Some(hw) = info.global_reg_of(index as u16) {
        return match ctx.regs[hw as usize] {
            RegSlot::Saved(addr) => {
                if mem.write_u64(addr, value) {
                    Ok(())
                } else {
                    Err(RtError::BadAddress { addr })
                }
            }
            _ => {
                ctx.regs[hw as usize] = RegSlot::Value(value);
                Ok(())
            }
        };
    }
    let addr = local_addr(info, ctx, index)?;
    if mem.write_u64(addr, value) {
        Ok(())
    } else {
        Err(RtError::BadAddress { addr })
    }
}

/// Prepare `ctx` for resuming at the handler at `handler_ip` with `exception`.
pub fn rt_fix_handler_context(
    info: &InfoBlock,
    ctx: &mut RegContext,
    handler_ip: u32,
    exception: u64,
) {
    ctx.ip = info.header.code_start + handler_ip as u64;
    ctx.sp = ctx.bp - info.header.frame.frame_size as u64;
    ctx.set_reg(crate::x64::EXCEPTION_REG, RegSlot::Value(exception));
}

/// Native address of the code for bytecode `pc`.
pub fn rt_bc2native(info: &InfoBlock, pc: u32) -> Option<u64> {
    info.bc_to_native(pc)
        .map(|ip| info.header.code_start + ip as u64)
}

/// Bytecode PC of the instruction at native address `ip`.
pub fn rt_native2bc(info: &InfoBlock, ip: u64) -> Option<u32> {
    let rel = ip.checked_sub(info.header.code_start)?;
    info.native_to_bc(u32::try_from(rel).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::infoblock::{FrameOffsets, GcPoint, InfoFlags, InfoHeader};
    use hashbrown::HashMap;

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

    const START: u64 = 0x40_0000;

    fn info() -> InfoBlock {
        InfoBlock {
            header: InfoHeader {
                num_locals: 3,
                max_stack: 2,
                in_slots: 1,
                code_start: START,
                code_len: 200,
                warmup_len: 40,
                flags: InfoFlags::default(),
                frame: FrameOffsets {
                    frame_size: 96,
                    callee_save: -8,
                    sync_obj: -48,
                    retval: -56,
                    scratch_save: 0,
                    gc_locals: -64,
                    locals: -88,
                    stack: -96,
                },
                saved_regs_mask: 1 << Ar::RBX.hw(),
                entry_stack_args: 0,
                entry_reg_args: 1 << Ar::RDI.hw(),
            },
            global_regs: vec![(2, Ar::RBX.hw())],
            pc_map: vec![(0, 40), (3, 60)],
            gc_points: vec![GcPoint {
                ip: 70,
                pc: 3,
                kind: GcPointKind::Call,
                depth: 1,
                stack_map: vec![1],
                regs: 1 << Ar::RBX.hw(),
                retval_ref: false,
            }],
            handlers: vec![],
        }
    }

    #[test]
    fn test_unwind_at_each_prolog_state() {
        let info = info();
        let mut mem = Mem::default();
        let sp = 0x1000;
        mem.0.insert(sp, 0xcafe);
        mem.0.insert(sp + 8, 0xbeef);

        let ctx = RegContext { ip: START, sp, bp: 0x9999, ..Default::default() };
        let c = rt_unwind(&info, &ctx, &mem).unwrap();
        assert_eq!((c.ip, c.sp, c.bp), (0xcafe, sp + 8, 0x9999));

        let ctx = RegContext { ip: START + 1, sp, bp: 0x9999, ..Default::default() };
        let c = rt_unwind(&info, &ctx, &mem).unwrap();
        assert_eq!((c.ip, c.sp, c.bp), (0xbeef, sp + 16, 0xcafe));

        let ctx = RegContext { ip: START + 2, sp, bp: 0, ..Default::default() };
        assert!(matches!(
            rt_unwind(&info, &ctx, &mem),
            Err(RtError::InsideFrameSetup { .. })
        ));
    }

    #[test]
    fn test_unwind_body_restores_callee_saves() {
        let info = info();
        let mut mem = Mem::default();
        let bp = 0x2000;
        mem.0.insert(bp, 0x3000);
        mem.0.insert(bp + 8, 0x1234);
        let mut ctx = RegContext { ip: START + 70, sp: bp - 96, bp, ..Default::default() };
        ctx.set_reg(Ar::RBX, RegSlot::Value(7));

        let c = rt_unwind(&info, &ctx, &mem).unwrap();
        assert_eq!((c.ip, c.sp, c.bp), (0x1234, bp + 16, 0x3000));
        assert_eq!(c.reg(Ar::RBX), RegSlot::Saved(bp - 8));

        // Still in the warm-up: rbx not saved yet.
        ctx.ip = START + 10;
        let c = rt_unwind(&info, &ctx, &mem).unwrap();
        assert_eq!(c.reg(Ar::RBX), RegSlot::Value(7));
    }

    #[test]
    fn test_enum_roots() {
        let info = info();
        let mut mem = Mem::default();
        let bp = 0x2000;
        // Local 0 holds a reference, local 2 lives in rbx.
        mem.0.insert(bp - 64, 0b101);
        let mut ctx = RegContext { ip: START + 70, sp: bp - 96, bp, ..Default::default() };
        ctx.set_reg(Ar::RBX, RegSlot::Value(0x5555));

        let roots = rt_enum(&info, &ctx, &mem).unwrap();
        assert_eq!(
            roots,
            vec![
                RootLoc::Stack(bp - 88),
                RootLoc::Stack(bp - 96),
                RootLoc::Register(Ar::RBX.hw()),
            ]
        );

        ctx.ip = START + 71;
        assert!(matches!(
            rt_enum(&info, &ctx, &mem),
            Err(RtError::NotAGcPoint { .. })
        ));

        let mut entry = RegContext { ip: START, sp: 0x1000, ..Default::default() };
        entry.set_reg(Ar::RDI, RegSlot::Value(0x42));
        assert_eq!(
            rt_enum(&info, &entry, &mem).unwrap(),
            vec![RootLoc::Register(Ar::RDI.hw())]
        );
    }

    #[test]
    fn test_locals_and_pc_mapping() {
        let info = info();
        let mut mem = Mem::default();
        let bp = 0x2000;
        let mut ctx = RegContext { ip: START + 70, sp: bp - 96, bp, ..Default::default() };
        ctx.set_reg(Ar::RBX, RegSlot::Saved(0x5000));
        mem.0.insert(0x5000, 99);
        mem.0.insert(bp - 80, 0xffff_ffff_0000_0007);

        assert_eq!(rt_get_local_var(&info, &ctx, &mem, 1, JType::I32).unwrap(), 7);
        assert_eq!(rt_get_local_var(&info, &ctx, &mem, 2, JType::Ref).unwrap(), 99);
        rt_set_local_var(&info, &mut ctx, &mut mem, 2, 5).unwrap();
        assert_eq!(mem.0[&0x5000], 5);
        assert!(rt_get_local_var(&info, &ctx, &mem, 9, JType::I32).is_err());

        assert_eq!(rt_bc2native(&info, 3), Some(START + 60));
        assert_eq!(rt_native2bc(&info, START + 65), Some(3));
        assert_eq!(rt_native2bc(&info, START + 5), None);

        rt_fix_handler_context(&info, &mut ctx, 120, 0xe);
        assert_eq!(ctx.ip, START + 120);
        assert_eq!(ctx.sp, bp - 96);
        assert_eq!(ctx.reg(Ar::RAX), RegSlot::Value(0xe));
    }
}
