// This module emits native calls to runtime helpers and managed methods. Before a call
// that returns, every scratch register referenced from the operand stack is spilled, since
// the callee may clobber all of them. Arguments are placed in three steps: stack arguments
// are stored into the outgoing area first, then register-to-register moves are performed
// as a parallel move (cycles are broken through the encoder's temporaries), and finally
// immediates, memory operands and address computations are loaded into their argument
// registers, which can no longer disturb any pending source. After the call the GC point
// for the return address is recorded and the result is bound to the return register.

//! Native call emission.

use crate::core::encoder::{AluOp, CallTarget, Encoder, OpSize};
use crate::core::error::CompileResult;
use crate::core::jtype::JType;
use crate::core::method::Helper;
use crate::core::register_file::{Ar, RegBank};
use crate::core::val::{MemRef, Opnd, Val, ValKind};
use crate::x64::calling_convention::ArgLoc;

use super::compiler::Compiler;
use super::gcmap::{self, GcMode};

/// What a call invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Callee {
    Helper(Helper),
    Abs(u64),
    /// Indirect through the code pointer stored at this address.
    Slot(u64),
    Mem(MemRef),
    Reg(Ar),
    /// Through the vtable of the receiver passed as the first argument.
    Virtual {
        vt_off: i32,
        off: i32,
        base: Option<u64>,
    },
}

impl Callee {
    fn is_noreturn(self) -> bool {
        matches!(self, Callee::Helper(h) if h.is_noreturn())
    }
}

/// One call argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum CallArg {
    Val(Val),
    /// Address of a memory operand.
    Lea(MemRef),
}

impl From<Val> for CallArg {
    fn from(v: Val) -> Self {
        CallArg::Val(v)
    }
}

impl<E: Encoder> Compiler<'_, '_, E> {
    /// Emit a call; returns the result value (not yet pushed) unless `ret` is void or the
    /// callee never returns.
    pub(super) fn gen_call(
        &mut self,
        callee: Callee,
        args: &[(JType, CallArg)],
        ret: JType,
        gc: GcMode,
    ) -> CompileResult<Option<Val>> {
        if !callee.is_noreturn() {
            self.spill_all()?;
        }
        let types: Vec<JType> = args.iter().map(|(jt, _)| *jt).collect();
        let sig = self.sigs.get(&types, ret);

        let stack_size = sig.stack_size();
        if stack_size > 0 {
            self.enc.alu(
                OpSize::S64,
                AluOp::Sub,
                Opnd::Reg(Ar::RSP),
                Opnd::Imm(stack_size as i64),
            )?;
        }

        let mut moves: Vec<(Ar, Val)> = Vec::new();
        let mut late: Vec<(Ar, CallArg)> = Vec::new();
        for (i, &(jt, arg)) in args.iter().enumerate() {
            let loc = sig
                .loc(i)
                .ok_or_else(|| self.inconsistent("argument without a location"))?;
            match (loc, arg) {
                (ArgLoc::Stack(off), CallArg::Val(v)) => {
                    let dst = MemRef::base_disp(Ar::RSP, off as i32);
                    self.store_slot(dst, &Val { jt, ..v })?;
                }
                (ArgLoc::Stack(off), CallArg::Lea(m)) => {
                    let tmp = self.enc.scratch_gp();
                    self.enc.lea(tmp, m)?;
                    let dst = MemRef::base_disp(Ar::RSP, off as i32);
                    self.enc.mov(OpSize::S64, Opnd::Mem(dst), Opnd::Reg(tmp))?;
                }
                (ArgLoc::Reg(r), CallArg::Val(v)) if matches!(v.kind, ValKind::Reg(_)) => {
                    moves.push((r, Val { jt, ..v }))
                }
                (ArgLoc::Reg(r), CallArg::Val(v)) => late.push((r, CallArg::Val(Val { jt, ..v }))),
                (ArgLoc::Reg(r), lea) => late.push((r, lea)),
            }
        }
        self.parallel_moves(moves)?;
        for (r, arg) in late {
            match arg {
                CallArg::Val(v) => self.load(r, &v)?,
                CallArg::Lea(m) => self.enc.lea(r, m)?,
            }
        }

        let ret_ip = self.emit_call(callee)?;
        if stack_size > 0 {
            self.enc.alu(
                OpSize::S64,
                AluOp::Add,
                Opnd::Reg(Ar::RSP),
                Opnd::Imm(stack_size as i64),
            )?;
        }
        if let Some(point) =
            gcmap::call_point(gc, ret_ip, self.pc, &self.frame, &self.layout, &self.globals)
        {
            self.push_gc_point(point);
        }

        if callee.is_noreturn() {
            self.enc.trap()?;
            return Ok(None);
        }
        let Some(reg) = sig.ret_reg() else {
            return Ok(None);
        };
        if ret == JType::I32 {
            // Helpers leave the upper half undefined.
            self.enc.mov(OpSize::S32, Opnd::Reg(reg), Opnd::Reg(reg))?;
        }
        Ok(Some(Val::reg(ret, reg)))
    }

    fn emit_call(&mut self, callee: Callee) -> CompileResult<u32> {
        let tmp = self.enc.scratch_gp();
        let ip = match callee {
            Callee::Helper(h) => {
                self.session.record_helper_call();
                self.enc.call(CallTarget::Abs(self.vm.helper(h)))?
            }
            Callee::Abs(addr) => {
                self.session.record_helper_call();
                self.enc.call(CallTarget::Abs(addr))?
            }
            Callee::Slot(addr) => {
                self.enc.mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Imm(addr as i64))?;
                self.enc.call(CallTarget::Mem(MemRef::base_disp(tmp, 0)))?
            }
            Callee::Mem(m) => self.enc.call(CallTarget::Mem(m))?,
            Callee::Reg(r) => self.enc.call(CallTarget::Reg(r))?,
            Callee::Virtual { vt_off, off, base } => {
                let vt = Opnd::Mem(MemRef::base_disp(Ar::RDI, vt_off));
                match base {
                    None => self.enc.mov(OpSize::S64, Opnd::Reg(tmp), vt)?,
                    Some(base) => {
                        self.enc.mov(OpSize::S32, Opnd::Reg(tmp), vt)?;
                        self.enc
                            .mov(OpSize::S64, Opnd::Reg(Ar::RAX), Opnd::Imm(base as i64))?;
                        self.enc
                            .alu(OpSize::S64, AluOp::Add, Opnd::Reg(tmp), Opnd::Reg(Ar::RAX))?;
                    }
                }
                self.enc.call(CallTarget::Mem(MemRef::base_disp(tmp, off)))?
            }
        };
        Ok(ip)
    }

    /// Register-to-register argument moves without clobbering a pending source.
    fn parallel_moves(&mut self, mut moves: Vec<(Ar, Val)>) -> CompileResult<()> {
        moves.retain(|(dst, v)| v.reg_ar() != Some(*dst));
        while !moves.is_empty() {
            let ready = moves
                .iter()
                .position(|(dst, _)| !moves.iter().any(|(_, v)| v.reg_ar() == Some(*dst)));
            match ready {
                Some(k) => {
                    let (dst, v) = moves.remove(k);
                    self.load(dst, &v)?;
                }
                None => {
                    // Every destination is still read: park one of them.
                    let dst = moves[0].0;
                    let (tmp, jt) = match dst.bank() {
                        RegBank::Gp => (self.enc.scratch_gp(), JType::I64),
                        RegBank::Fp => (self.enc.scratch_fp(), JType::F64),
                    };
                    self.load(tmp, &Val::reg(jt, dst))?;
                    for (_, src) in moves.iter_mut() {
                        if src.reg_ar() == Some(dst) {
                            src.kind = ValKind::Reg(tmp);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Call the linking-error helper for the constant-pool entry `cp`.
    pub(super) fn gen_linking_error(&mut self, cp: u16) -> CompileResult<()> {
        let opcode = self.bbs.inst_at(self.pc).map(|i| i.opcode).unwrap_or(0);
        self.gen_call(
            Callee::Helper(Helper::ThrowLinkingError),
            &[
                (JType::I32, Val::imm_i32(cp as i32).into()),
                (JType::I32, Val::imm_i32(opcode as i32).into()),
            ],
            JType::Void,
            GcMode::Throw,
        )?;
        Ok(())
    }

    /// Call a throwing helper with the given arguments.
    pub(super) fn gen_throw(&mut self, helper: Helper, args: &[(JType, CallArg)]) -> CompileResult<()> {
        self.gen_call(Callee::Helper(helper), args, JType::Void, GcMode::Throw)?;
        Ok(())
    }
}
