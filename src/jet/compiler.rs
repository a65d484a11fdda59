// This module holds the per-method compiler state and the generation driver. The driver
// emits the prolog, then walks the basic blocks depth-first starting at pc 0: a block's
// fall-through successor (or the not yet generated target of an unconditional jump) is
// generated immediately after it so no jump is needed, other successors wait on a worklist,
// and exception handlers are seeded once the worklist drains. Every bytecode instruction is
// dispatched to the generator routine for its family; those routines live in the cg_*
// modules as further `impl` blocks of the same Compiler. When all blocks exist, the pending
// branch patches and switch-table entries are resolved against the recorded block offsets,
// the native handler table is derived from the pc map, and the info block is assembled.

//! Compiler state and the generation driver.

use hashbrown::HashMap;

use crate::core::bytecode::*;
use crate::core::encoder::{Encoder, PatchRef};
use crate::core::error::{CompileError, CompileResult};
use crate::core::jframe::{FrameError, JFrame, Shuffle};
use crate::core::jtype::{JType, WordSize};
use crate::core::method::{CompressedRefs, InvokeKind, JvmtiFlags, MethodInfo, ObjectLayout, VmAdaptor};
use crate::core::options::CompileOptions;
use crate::core::register_file::RegisterFile;
use crate::core::session::CompilationSession;
use crate::core::val::Val;
use crate::runtime::infoblock::{
    CatchClass, GcPoint, GcPointKind, HandlerEntry, InfoBlock, InfoFlags, InfoHeader,
};
use crate::x64::calling_convention::SigCache;
use crate::x64::scratch_regs;

use super::bbs::BlockMap;
use super::globals::GlobalAssignment;
use super::layout::FrameLayout;

/// Frame state a block is entered with.
#[derive(Debug, Clone)]
pub(super) enum EntryState {
    /// Every stack item in its own slot; per-slot types, bottom first.
    Canonical(Vec<JType>),
    /// Exact frame of the only predecessor.
    Snapshot(JFrame),
}

/// Offsets collected while emitting the method's fixed parts.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Marks {
    pub warmup_len: u32,
    pub body_start: u32,
    pub body_end: u32,
    pub saved_regs_mask: u32,
    pub entry_reg_args: u32,
    pub entry_stack_args: u64,
    pub sync_handler: Option<u32>,
}

/// One pending entry of a `tableswitch` jump table.
#[derive(Debug, Clone, Copy)]
pub(super) struct TableFixup {
    pub at: u32,
    pub table_ip: u32,
    pub target: u32,
}

pub struct Compiler<'a, 'arena, E: Encoder> {
    pub(super) method: &'a MethodInfo,
    pub(super) vm: &'a dyn VmAdaptor,
    pub(super) opts: &'a CompileOptions,
    pub(super) session: &'a CompilationSession<'arena>,
    pub(super) enc: E,
    pub(super) bbs: BlockMap<'arena>,
    pub(super) layout: FrameLayout,
    pub(super) globals: GlobalAssignment,
    pub(super) frame: JFrame,
    pub(super) rf: RegisterFile,
    pub(super) sigs: SigCache,
    pub(super) obj: ObjectLayout,
    pub(super) compressed: Option<CompressedRefs>,
    /// Bit pattern of the null reference.
    pub(super) null_bits: i64,
    pub(super) jvmti: JvmtiFlags,
    /// Local 0 holds the receiver for the whole method.
    pub(super) this_stable: bool,
    /// Pc of the instruction being generated.
    pub(super) pc: u32,
    pub(super) patches: Vec<(PatchRef, u32)>,
    pub(super) table_fixups: Vec<TableFixup>,
    pub(super) block_ip: HashMap<u32, u32>,
    pub(super) entry_states: HashMap<u32, EntryState>,
    pub(super) work: Vec<u32>,
    pub(super) fall_next: Option<u32>,
    pub(super) pc_map: Vec<(u32, u32)>,
    pub(super) gc_points: Vec<GcPoint>,
    /// Native ranges not covered by the synchronized catch-all.
    pub(super) exclusions: Vec<(u32, u32)>,
    pub(super) marks: Marks,
}

impl<'a, 'arena, E: Encoder> Compiler<'a, 'arena, E> {
    pub fn new(
        method: &'a MethodInfo,
        vm: &'a dyn VmAdaptor,
        opts: &'a CompileOptions,
        session: &'a CompilationSession<'arena>,
        enc: E,
    ) -> CompileResult<Self> {
        let bbs = BlockMap::build(&method.code, &method.handlers, session.arena())?;
        let num_locals = method.max_locals as usize;
        if method.in_slots() > num_locals {
            return Err(CompileError::BadLocal {
                pc: 0,
                index: method.in_slots() as u32 - 1,
            });
        }
        let max_stack = method.max_stack as usize;
        let layout = FrameLayout::new(num_locals, max_stack.max(1), opts.save_all_scratch);
        let globals = GlobalAssignment::assign(method, &bbs, opts);
        let this_stable = !method.flags.is_static
            && !bbs
                .insts()
                .iter()
                .any(|i| matches!(i.local_access(), Some((0, _, true))));
        let jvmti = if opts.jvmti_events {
            vm.jvmti_flags()
        } else {
            JvmtiFlags::default()
        };
        Ok(Self {
            method,
            vm,
            opts,
            session,
            enc,
            bbs,
            layout,
            globals,
            frame: JFrame::new(max_stack, num_locals, WordSize::W64),
            rf: RegisterFile::new(scratch_regs()),
            sigs: SigCache::new(),
            obj: vm.object_layout(),
            compressed: vm.compressed_refs(),
            null_bits: vm.managed_null() as i64,
            jvmti,
            this_stable,
            pc: 0,
            patches: Vec::new(),
            table_fixups: Vec::new(),
            block_ip: HashMap::new(),
            entry_states: HashMap::new(),
            work: Vec::new(),
            fall_next: None,
            pc_map: Vec::new(),
            gc_points: Vec::new(),
            exclusions: Vec::new(),
            marks: Marks::default(),
        })
    }

    /// Whether the method compiles to a bare `ret`.
    fn is_trivial(&self) -> bool {
        self.method.code == [RETURN]
            && !self.method.flags.is_synchronized
            && self.jvmti.method_entry.is_none()
            && self.jvmti.method_exit.is_none()
    }

    /// Generate the method, returning its code and info block.
    pub fn compile(mut self) -> CompileResult<(Vec<u8>, InfoBlock)> {
        if self.is_trivial() {
            self.enc.ret(0)?;
            self.pc_map.push((0, 0));
            let mut info = self.info_block(Vec::new());
            info.header.flags.trivial = true;
            return Ok((self.enc.take_code(), info));
        }

        self.gen_prolog()?;
        self.gen_blocks()?;
        self.marks.body_end = self.enc.ip();
        if self.method.flags.is_synchronized {
            self.gen_sync_catch_all()?;
        }
        self.resolve_patches()?;
        let handlers = self.handler_table()?;
        let info = self.info_block(handlers);
        Ok((self.enc.take_code(), info))
    }

    fn gen_blocks(&mut self) -> CompileResult<()> {
        self.work.push(0);
        loop {
            while let Some(pc) = self.work.pop() {
                let mut cur = Some(pc);
                while let Some(pc) = cur {
                    if self.block_ip.contains_key(&pc) {
                        break;
                    }
                    cur = self.gen_block(pc)?;
                }
            }
            let pending: Vec<u32> = self
                .method
                .handlers
                .iter()
                .map(|h| h.handler_pc)
                .filter(|pc| !self.block_ip.contains_key(pc))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            self.work.extend(pending.into_iter().rev());
        }
    }

    /// Generate one block; returns the successor to generate next without a jump.
    fn gen_block(&mut self, pc: u32) -> CompileResult<Option<u32>> {
        let bb = self
            .bbs
            .block(pc)
            .cloned()
            .ok_or_else(|| self.inconsistent(format!("no block at {pc}")))?;
        self.bb_enter(&bb)?;
        self.block_ip.insert(pc, self.enc.ip());
        log::debug!(
            "jet::compiler: bb {}..{} at {:#x} refs {} canon {}",
            bb.start,
            bb.end,
            self.enc.ip(),
            bb.ref_count,
            bb.needs_canon()
        );

        self.fall_next = None;
        let insts = self.bbs.block_insts(&bb).to_vec();
        for inst in &insts {
            self.pc = inst.pc;
            self.pc_map.push((inst.pc, self.enc.ip()));
            log::trace!(
                "jet::compiler: {:>5} {:<16} depth {}",
                inst.pc,
                inst.name(),
                self.frame.depth()
            );
            self.session.record_opcode(inst.name());
            self.gen_inst(inst)?;
            if self.opts.vcheck {
                self.vcheck()?;
            }
        }

        if let Some(last) = insts.last() {
            if last.falls_through() && !last.is_cond_branch() {
                self.bb_leave(&[last.next])?;
                self.flow_to(last.next)?;
            }
        }
        Ok(self.fall_next.take())
    }

    /// Continue at `target`: fall into it if it can be generated next, else jump.
    pub(super) fn flow_to(&mut self, target: u32) -> CompileResult<()> {
        if self.block_ip.contains_key(&target) || self.fall_next.is_some() {
            let p = self.enc.jmp()?;
            self.patches.push((p, target));
            self.work.push(target);
        } else {
            self.fall_next = Some(target);
        }
        Ok(())
    }

    pub(super) fn inconsistent(&self, reason: impl Into<String>) -> CompileError {
        CompileError::InconsistentState {
            pc: self.pc,
            reason: reason.into(),
        }
    }

    pub(super) fn frame_err(&self, e: FrameError) -> CompileError {
        frame_err(self.pc, e)
    }

    fn gen_inst(&mut self, inst: &Inst) -> CompileResult<()> {
        let op = inst.opcode;
        if let Some((idx, jt, store)) = inst.local_access() {
            return match op {
                IINC => {
                    let InstData::Iinc { delta, .. } = inst.data else {
                        return Err(self.inconsistent("iinc without operands"));
                    };
                    self.gen_iinc(idx, delta as i32)
                }
                RET => self.gen_ret(idx),
                _ if store => self.gen_st(jt, idx),
                _ => self.gen_ld(jt, idx),
            };
        }
        let cp = || inst.cp().unwrap_or(0);
        match op {
            NOP => Ok(()),
            ACONST_NULL => self.vpush(Val::imm(JType::Ref, self.null_bits)),
            ICONST_M1..=ICONST_5 => self.vpush(Val::imm_i32(op as i32 - ICONST_0 as i32)),
            LCONST_0 | LCONST_1 => self.vpush(Val::imm_i64((op - LCONST_0) as i64)),
            FCONST_0..=FCONST_2 => self.vpush(Val::imm_f32((op - FCONST_0) as f32)),
            DCONST_0 | DCONST_1 => self.vpush(Val::imm_f64((op - DCONST_0) as f64)),
            BIPUSH | SIPUSH => match inst.data {
                InstData::Imm(v) => self.vpush(Val::imm_i32(v)),
                _ => Err(self.inconsistent("push without immediate")),
            },
            LDC | LDC_W | LDC2_W => self.gen_ldc(cp(), op == LDC2_W),
            IALOAD..=SALOAD => self.gen_aload(array_elem(op - IALOAD)),
            IASTORE..=SASTORE => self.gen_astore(array_elem(op - IASTORE)),
            POP => self.gen_pop(1),
            POP2 => self.gen_pop(2),
            DUP => self.gen_shuffle(Shuffle::Dup),
            DUP_X1 => self.gen_shuffle(Shuffle::DupX1),
            DUP_X2 => self.gen_shuffle(Shuffle::DupX2),
            DUP2 => self.gen_shuffle(Shuffle::Dup2),
            DUP2_X1 => self.gen_shuffle(Shuffle::Dup2X1),
            DUP2_X2 => self.gen_shuffle(Shuffle::Dup2X2),
            SWAP => self.gen_shuffle(Shuffle::Swap),
            IADD..=LXOR => self.gen_arith(op),
            I2L..=I2S => self.gen_cnv(op),
            LCMP..=DCMPG => self.gen_cmp(op),
            IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => self.gen_if(inst),
            GOTO | GOTO_W => self.gen_goto(inst),
            JSR | JSR_W => self.gen_jsr(inst),
            TABLESWITCH => self.gen_tableswitch(inst),
            LOOKUPSWITCH => self.gen_lookupswitch(inst),
            IRETURN => self.gen_return(JType::I32),
            LRETURN => self.gen_return(JType::I64),
            FRETURN => self.gen_return(JType::F32),
            DRETURN => self.gen_return(JType::F64),
            ARETURN => self.gen_return(JType::Ref),
            RETURN => self.gen_return(JType::Void),
            GETSTATIC => self.gen_field(cp(), true, false),
            PUTSTATIC => self.gen_field(cp(), true, true),
            GETFIELD => self.gen_field(cp(), false, false),
            PUTFIELD => self.gen_field(cp(), false, true),
            INVOKEVIRTUAL => self.gen_invoke(cp(), InvokeKind::Virtual),
            INVOKESPECIAL => self.gen_invoke(cp(), InvokeKind::Special),
            INVOKESTATIC => self.gen_invoke(cp(), InvokeKind::Static),
            INVOKEINTERFACE => self.gen_invoke(cp(), InvokeKind::Interface),
            NEW => self.gen_new(cp()),
            NEWARRAY => match inst.data {
                InstData::NewArray(atype) => self.gen_newarray(atype),
                _ => Err(self.inconsistent("newarray without type")),
            },
            ANEWARRAY => self.gen_anewarray(cp()),
            ARRAYLENGTH => self.gen_arraylength(),
            ATHROW => self.gen_athrow(),
            CHECKCAST => self.gen_checkcast(cp()),
            INSTANCEOF => self.gen_instanceof(cp()),
            MONITORENTER => self.gen_monitor(true),
            MONITOREXIT => self.gen_monitor(false),
            MULTIANEWARRAY => match inst.data {
                InstData::MultiANewArray { cp, dims } => self.gen_multianewarray(cp, dims as usize),
                _ => Err(self.inconsistent("multianewarray without operands")),
            },
            _ => Err(CompileError::Unsupported {
                pc: inst.pc,
                name: inst.name(),
            }),
        }
    }

    fn resolve_patches(&mut self) -> CompileResult<()> {
        for (p, pc) in std::mem::take(&mut self.patches) {
            let ip = self.target_ip(pc)?;
            self.enc.patch(p, ip)?;
        }
        for fix in std::mem::take(&mut self.table_fixups) {
            let ip = self.target_ip(fix.target)?;
            self.enc
                .patch_data64(fix.at, ip as i64 - fix.table_ip as i64)?;
        }
        Ok(())
    }

    fn target_ip(&self, pc: u32) -> CompileResult<u32> {
        self.block_ip
            .get(&pc)
            .copied()
            .ok_or_else(|| self.inconsistent(format!("block {pc} was never generated")))
    }

    /// Native handler ranges: bytecode handlers in table order, then the catch-all.
    fn handler_table(&self) -> CompileResult<Vec<HandlerEntry>> {
        let mut by_ip = self.pc_map.clone();
        by_ip.sort_by_key(|&(pc, ip)| (ip, pc));
        let body_end = self.marks.body_end;
        let extents: Vec<(u32, u32, u32)> = by_ip
            .iter()
            .enumerate()
            .map(|(k, &(pc, ip))| {
                let end = by_ip.get(k + 1).map(|e| e.1).unwrap_or(body_end);
                (pc, ip, end)
            })
            .collect();

        let mut table = Vec::new();
        for h in &self.method.handlers {
            let handler_ip = self.target_ip(h.handler_pc)?;
            let class = match h.catch_type {
                None => CatchClass::Any,
                Some(cp) => match self.vm.resolve_class(cp) {
                    Some(c) => CatchClass::Resolved(c.0),
                    None => CatchClass::Unresolved(cp),
                },
            };
            let mut covered: Vec<(u32, u32)> = extents
                .iter()
                .filter(|&&(pc, s, e)| h.start_pc <= pc && pc < h.end_pc && s < e)
                .map(|&(_, s, e)| (s, e))
                .collect();
            covered.sort_unstable();
            for (start_ip, end_ip) in merge_ranges(covered) {
                table.push(HandlerEntry {
                    start_ip,
                    end_ip,
                    handler_ip,
                    class,
                });
            }
        }

        if let Some(handler_ip) = self.marks.sync_handler {
            let mut excl = self.exclusions.clone();
            excl.sort_unstable();
            let mut start = self.marks.body_start;
            let mut ranges = Vec::new();
            for (s, e) in excl {
                if s > start {
                    ranges.push((start, s));
                }
                start = start.max(e);
            }
            if start < body_end {
                ranges.push((start, body_end));
            }
            for (start_ip, end_ip) in ranges {
                table.push(HandlerEntry {
                    start_ip,
                    end_ip,
                    handler_ip,
                    class: CatchClass::Any,
                });
            }
        }
        Ok(table)
    }

    fn info_block(&mut self, handlers: Vec<HandlerEntry>) -> InfoBlock {
        let m = self.method;
        let mut pc_map = std::mem::take(&mut self.pc_map);
        pc_map.sort_unstable();
        let mut gc_points = std::mem::take(&mut self.gc_points);
        gc_points.sort_by_key(|g| g.ip);
        let header = InfoHeader {
            num_locals: m.max_locals,
            max_stack: m.max_stack,
            in_slots: m.in_slots() as u16,
            code_start: 0,
            code_len: self.enc.ip(),
            warmup_len: self.marks.warmup_len,
            flags: InfoFlags {
                is_static: m.flags.is_static,
                synchronized: m.flags.is_synchronized,
                trivial: false,
                has_jsr: self.bbs.has_jsr(),
                compressed_refs: self.compressed.is_some(),
                saves_scratch: self.opts.save_all_scratch,
            },
            frame: self.layout.offsets(),
            saved_regs_mask: self.marks.saved_regs_mask,
            entry_stack_args: self.marks.entry_stack_args,
            entry_reg_args: self.marks.entry_reg_args,
        };
        InfoBlock {
            header,
            global_regs: self.globals.bindings(),
            pc_map,
            gc_points,
            handlers,
        }
    }

    /// Record a GC point, keeping ips unique.
    pub(super) fn push_gc_point(&mut self, point: GcPoint) {
        self.session.record_gc_point();
        self.gc_points.push(point);
    }

    /// Whether a GC point of `kind` already sits at the current ip.
    pub(super) fn gc_point_here(&self) -> Option<GcPointKind> {
        let ip = self.enc.ip();
        self.gc_points.iter().rev().find(|g| g.ip == ip).map(|g| g.kind)
    }
}

/// Coalesce sorted, touching ranges.
fn merge_ranges(ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for (s, e) in ranges {
        match out.last_mut() {
            Some(last) if last.1 >= s => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

/// Element type of an array load/store opcode, by offset from `iaload`/`iastore`.
fn array_elem(k: u8) -> JType {
    match k {
        0 => JType::I32,
        1 => JType::I64,
        2 => JType::F32,
        3 => JType::F64,
        4 => JType::Ref,
        5 => JType::I8,
        6 => JType::U16,
        _ => JType::I16,
    }
}

pub(super) fn frame_err(pc: u32, e: FrameError) -> CompileError {
    match e {
        FrameError::Overflow { max_stack } => CompileError::StackOverflow { pc, max_stack },
        FrameError::Underflow => CompileError::StackUnderflow { pc },
        FrameError::BadLocal(index) => CompileError::BadLocal {
            pc,
            index: index as u32,
        },
        other => CompileError::InconsistentState {
            pc,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_ranges() {
        assert_eq!(
            merge_ranges(vec![(0, 4), (4, 9), (12, 15), (14, 20)]),
            vec![(0, 9), (12, 20)]
        );
        assert!(merge_ranges(Vec::new()).is_empty());
    }

    #[test]
    fn test_frame_error_mapping() {
        assert!(matches!(
            frame_err(3, FrameError::Underflow),
            CompileError::StackUnderflow { pc: 3 }
        ));
        assert!(matches!(
            frame_err(5, FrameError::Overflow { max_stack: 2 }),
            CompileError::StackOverflow { pc: 5, max_stack: 2 }
        ));
        assert!(matches!(
            frame_err(1, FrameError::BadLocal(7)),
            CompileError::BadLocal { pc: 1, index: 7 }
        ));
        assert!(matches!(
            frame_err(1, FrameError::NeedsHalves(JType::I64)),
            CompileError::InconsistentState { pc: 1, .. }
        ));
    }

    #[test]
    fn test_array_elem_types() {
        assert_eq!(array_elem(BALOAD - IALOAD), JType::I8);
        assert_eq!(array_elem(CASTORE - IASTORE), JType::U16);
        assert_eq!(array_elem(SALOAD - IALOAD), JType::I16);
        assert_eq!(array_elem(AASTORE - IASTORE), JType::Ref);
    }
}
