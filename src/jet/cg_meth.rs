// This module generates the method prolog and epilog, the catch-all handler of
// synchronized methods and athrow. The prolog builds the rbp frame with one subtraction,
// touches every page of it from the top down, and stores the callee-save registers holding
// global locals (plus, when requested, all scratch registers); the instruction after the
// last of those stores ends the warm-up range. It then writes the locals GC bitmap in full,
// moves the incoming arguments to their homes, notifies a JVMTI agent of the entry and
// finally acquires the monitor of a synchronized method. Code after that point is the body
// covered by the synthesized catch-all. Each return keeps its value in the return value slot
// while the monitor exit and JVMTI exit calls run; those calls are excluded from the
// catch-all so the monitor is released exactly once.

//! Prolog, epilog and method-level exception paths.

use crate::core::encoder::{AluOp, Cond, Encoder, OpSize, PatchRef};
use crate::core::error::CompileResult;
use crate::core::jtype::JType;
use crate::core::method::Helper;
use crate::core::register_file::Ar;
use crate::core::val::{MemRef, Opnd, Val, ValAttrs, ValKind};
use crate::runtime::infoblock::{GcPoint, GcPointKind};
use crate::x64::calling_convention::ArgLoc;
use crate::x64::{GLOBAL_GP, SCRATCH_GP};

use super::cg_call::{CallArg, Callee};
use super::compiler::{frame_err, Compiler};
use super::gcmap::GcMode;

/// Offset of the first incoming stack argument from rbp.
const IN_ARGS: i32 = 16;

impl<E: Encoder> Compiler<'_, '_, E> {
    pub(super) fn gen_prolog(&mut self) -> CompileResult<()> {
        self.push_gc_point(GcPoint {
            ip: 0,
            pc: 0,
            kind: GcPointKind::Entry,
            depth: 0,
            stack_map: Vec::new(),
            regs: 0,
            retval_ref: false,
        });
        self.enc.push(Ar::RBP)?;
        self.enc
            .mov(OpSize::S64, Opnd::Reg(Ar::RBP), Opnd::Reg(Ar::RSP))?;
        let size = self.layout.frame_size();
        self.enc.alu(
            OpSize::S64,
            AluOp::Sub,
            Opnd::Reg(Ar::RSP),
            Opnd::Imm(size as i64),
        )?;
        let tmp = self.enc.scratch_gp();
        for off in self.layout.probe_offsets() {
            self.enc.mov(
                OpSize::S64,
                Opnd::Reg(tmp),
                Opnd::Mem(MemRef::base_disp(Ar::RSP, off)),
            )?;
        }

        let used = self.globals.used();
        for (k, &r) in GLOBAL_GP.iter().enumerate() {
            if used.contains(r) {
                self.enc
                    .mov(OpSize::S64, Opnd::Mem(self.layout.callee_save(k)), Opnd::Reg(r))?;
                self.marks.saved_regs_mask |= 1 << r.hw();
            }
        }
        if self.opts.save_all_scratch {
            for (k, &r) in SCRATCH_GP.iter().enumerate() {
                if let Some(slot) = self.layout.scratch_save(k) {
                    self.enc.mov(OpSize::S64, Opnd::Mem(slot), Opnd::Reg(r))?;
                }
            }
        }
        self.marks.warmup_len = self.enc.ip();

        self.gen_args_to_homes()?;

        if let Some(flag) = self.jvmti.method_entry {
            let skip = self.gen_flag_check(flag)?;
            self.gen_call(
                Callee::Helper(Helper::MethodEntry),
                &[(JType::I64, Val::imm_i64(self.method.handle.0 as i64).into())],
                JType::Void,
                GcMode::Frame { retval_ref: false },
            )?;
            let here = self.enc.ip();
            self.enc.patch(skip, here)?;
        }

        if self.method.flags.is_synchronized {
            if !self.method.flags.is_static {
                // Exits read the receiver from its own slot; local 0 may be reassigned.
                let this = Val {
                    jt: JType::Ref,
                    kind: self.home(0),
                    attrs: ValAttrs::default(),
                };
                self.store_slot(self.layout.sync_obj(), &this)?;
            }
            let (helper, obj) = self.sync_object();
            self.gen_call(
                Callee::Helper(helper),
                &[(JType::Ref, obj.into())],
                JType::Void,
                GcMode::Frame { retval_ref: false },
            )?;
        }
        self.marks.body_start = self.enc.ip();
        log::trace!(
            "jet::cg: prolog frame {} bytes, warm-up {} bytes",
            size,
            self.marks.warmup_len
        );
        Ok(())
    }

    /// Copy the incoming arguments to the homes of their locals and write the locals
    /// bitmap.
    fn gen_args_to_homes(&mut self) -> CompileResult<()> {
        let types = self.method.arg_types();
        let sig = self.sigs.get(&types, JType::Void);
        let mut bitmap = vec![0u64; self.layout.gc_words()];
        let mut idx = 0usize;
        for (i, &jt) in types.iter().enumerate() {
            let loc = sig
                .loc(i)
                .ok_or_else(|| self.inconsistent("argument without a location"))?;
            let src = match loc {
                ArgLoc::Reg(r) => {
                    if jt.is_ref() {
                        self.marks.entry_reg_args |= 1 << r.hw();
                    }
                    Val::reg(jt, r)
                }
                ArgLoc::Stack(off) => {
                    if jt.is_ref() {
                        self.marks.entry_stack_args |= 1 << (off / 8);
                    }
                    Val::mem(jt, MemRef::base_disp(Ar::RBP, IN_ARGS + off as i32))
                }
            };
            let home = self.home(idx);
            match home {
                ValKind::Reg(g) => self.load(g, &src)?,
                ValKind::Mem(m) => {
                    self.store_slot(m, &src)?;
                    if jt.is_ref() {
                        bitmap[idx / 64] |= 1 << (idx % 64);
                    }
                }
                ValKind::Imm { .. } => return Err(self.inconsistent("immediate local home")),
            }
            let pc = self.pc;
            self.frame
                .set_local(
                    idx,
                    Val {
                        jt,
                        kind: home,
                        attrs: ValAttrs {
                            non_null: false,
                            gc_marked: true,
                        },
                    },
                )
                .map_err(|e| frame_err(pc, e))?;
            idx += jt.slots();
        }
        // The remaining locals start out as non-references, which the bitmap says already.
        for local in self.frame.locals_mut() {
            local.attrs.gc_marked = true;
        }
        for (w, bits) in bitmap.into_iter().enumerate() {
            let word = self.layout.gc_word(w * 64);
            self.enc.mov(OpSize::S64, Opnd::Mem(word), Opnd::Imm(bits as i64))?;
        }
        // Reference globals are reported at every GC point, so the ones not holding an
        // argument must not keep the caller's value.
        for idx in self.method.in_slots()..self.frame.locals().len() {
            if !self.globals.class_of(idx).is_ref() {
                continue;
            }
            if let ValKind::Reg(g) = self.home(idx) {
                self.enc
                    .mov(OpSize::S64, Opnd::Reg(g), Opnd::Imm(self.null_bits))?;
            }
        }
        Ok(())
    }

    /// `cmp byte [flag], 0; je`; returns the branch to patch past the guarded code.
    fn gen_flag_check(&mut self, flag: u64) -> CompileResult<PatchRef> {
        let tmp = self.enc.scratch_gp();
        self.enc.mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Imm(flag as i64))?;
        self.enc.alu(
            OpSize::S8,
            AluOp::Cmp,
            Opnd::Mem(MemRef::base_disp(tmp, 0)),
            Opnd::Imm(0),
        )?;
        Ok(self.enc.jcc(Cond::Eq)?)
    }

    /// Monitor helper and object of a synchronized method.
    fn sync_object(&self) -> (Helper, Val) {
        if self.method.flags.is_static {
            (
                Helper::MonitorEnterStatic,
                Val::imm_i64(self.method.class.0 as i64),
            )
        } else {
            (Helper::MonitorEnter, Val::mem(JType::Ref, self.layout.sync_obj()))
        }
    }

    /// Release the monitor of a synchronized method.
    fn gen_monitor_release(&mut self, gc: GcMode) -> CompileResult<()> {
        let (helper, obj) = self.sync_object();
        let helper = match helper {
            Helper::MonitorEnterStatic => Helper::MonitorExitStatic,
            _ => Helper::MonitorExit,
        };
        self.gen_call(Callee::Helper(helper), &[(JType::Ref, obj.into())], JType::Void, gc)?;
        Ok(())
    }

    pub(super) fn gen_return(&mut self, jt: JType) -> CompileResult<()> {
        let mut value = match jt {
            JType::Void => None,
            _ => Some(self.vpop()?),
        };
        let sync = self.method.flags.is_synchronized;
        let exit = self.jvmti.method_exit;
        let start = self.enc.ip();

        if sync || exit.is_some() {
            if let Some(v) = value {
                let slot = self.layout.retval();
                self.store_slot(slot, &v)?;
                value = Some(Val::mem(v.jt, slot));
            }
        }
        let gc = GcMode::Frame {
            retval_ref: jt.is_ref(),
        };
        if sync {
            self.gen_monitor_release(gc)?;
        }
        if let Some(flag) = exit {
            let skip = self.gen_flag_check(flag)?;
            self.gen_call(
                Callee::Helper(Helper::MethodExit),
                &[
                    (JType::I64, Val::imm_i64(self.method.handle.0 as i64).into()),
                    (JType::I64, CallArg::Lea(self.layout.retval())),
                ],
                JType::Void,
                gc,
            )?;
            let here = self.enc.ip();
            self.enc.patch(skip, here)?;
        }

        if let Some(v) = value {
            let dst = if v.jt.is_f() { Ar::xmm(0) } else { Ar::RAX };
            self.load(dst, &v)?;
        }
        let used = self.globals.used();
        for (k, &r) in GLOBAL_GP.iter().enumerate() {
            if used.contains(r) {
                self.enc
                    .mov(OpSize::S64, Opnd::Reg(r), Opnd::Mem(self.layout.callee_save(k)))?;
            }
        }
        self.enc
            .mov(OpSize::S64, Opnd::Reg(Ar::RSP), Opnd::Reg(Ar::RBP))?;
        self.enc.pop(Ar::RBP)?;
        self.enc.ret(0)?;
        if sync {
            self.exclusions.push((start, self.enc.ip()));
        }
        Ok(())
    }

    /// Catch-all handler of a synchronized method: release the monitor, then rethrow
    /// the exception arriving in rax.
    pub(super) fn gen_sync_catch_all(&mut self) -> CompileResult<()> {
        self.marks.sync_handler = Some(self.enc.ip());
        self.frame.clear_stack();
        self.rf.reset_refs();
        let slot = self.layout.retval();
        self.enc
            .mov(OpSize::S64, Opnd::Mem(slot), Opnd::Reg(Ar::RAX))?;
        self.gen_monitor_release(GcMode::Frame { retval_ref: true })?;
        self.gen_throw(Helper::Throw, &[(JType::Ref, Val::mem(JType::Ref, slot).into())])
    }

    pub(super) fn gen_athrow(&mut self) -> CompileResult<()> {
        let (v, _lock) = self.vpop_locked()?;
        self.gen_check_null(&v, None)?;
        self.gen_throw(Helper::Throw, &[(JType::Ref, v.into())])
    }
}
