// This module implements the operand-stack and local-variable primitives of the code
// generator. Stack items are immediates, scratch registers (reference counted), aliases of
// a local's home (a global register or the local's frame slot) or the item's own stack
// slot. Popping releases an item's register reference; the caller pins the register with
// a lock for as long as it uses the popped value. Allocation hands out a free scratch
// register or spills the least referenced unlocked one to the own slots of every stack
// item naming it. Local stores are written through to the home immediately; any stack
// item still aliasing the old home is materialized first, and the frame's reference
// bitmap is updated unless the local's tracked kind already matches.

//! Stack, register and local-variable primitives.

use crate::core::encoder::{AluOp, Encoder, OpSize};
use crate::core::error::{CompileError, CompileResult};
use crate::core::jframe::Shuffle;
use crate::core::jtype::JType;
use crate::core::method::Constant;
use crate::core::register_file::{Ar, Pick, RegBank, RegBitSet, RegLock};
use crate::core::val::{MemRef, Opnd, Val, ValAttrs, ValKind};

use super::compiler::{frame_err, Compiler};

/// Store width of a value in a word slot.
pub(super) fn slot_size(jt: JType) -> OpSize {
    match jt {
        JType::I32 | JType::F32 => OpSize::S32,
        _ => OpSize::S64,
    }
}

/// Register width of an integer-class value.
pub(super) fn reg_size(jt: JType) -> OpSize {
    if jt == JType::I32 {
        OpSize::S32
    } else {
        OpSize::S64
    }
}

pub(super) fn bank_of(jt: JType) -> RegBank {
    if jt.is_f() {
        RegBank::Fp
    } else {
        RegBank::Gp
    }
}

impl<E: Encoder> Compiler<'_, '_, E> {
    /// Where local `idx` lives.
    pub(super) fn home(&self, idx: usize) -> ValKind {
        match self.globals.reg_of(idx) {
            Some(r) => ValKind::Reg(r),
            None => ValKind::Mem(self.layout.local(idx)),
        }
    }

    fn retain(&mut self, v: &Val) {
        if let ValKind::Reg(r) = v.kind {
            if self.rf.is_scratch(r) {
                self.rf.rref(r);
            }
        }
    }

    pub(super) fn release(&mut self, v: &Val) -> CompileResult<()> {
        if let ValKind::Reg(r) = v.kind {
            if self.rf.is_scratch(r) {
                self.rf.rfree(r)?;
            }
        }
        Ok(())
    }

    pub(super) fn vpush(&mut self, v: Val) -> CompileResult<()> {
        self.retain(&v);
        let pc = self.pc;
        self.frame.push(v).map_err(|e| frame_err(pc, e))
    }

    pub(super) fn vpop(&mut self) -> CompileResult<Val> {
        let pc = self.pc;
        let v = self.frame.pop().map_err(|e| frame_err(pc, e))?;
        self.release(&v)?;
        Ok(v)
    }

    /// Pop the top value and pin the registers it lives in.
    pub(super) fn vpop_locked(&mut self) -> CompileResult<(Val, RegLock)> {
        let v = self.vpop()?;
        let lock = self.rf.lock(v.regs());
        Ok((v, lock))
    }

    /// Copy of the value at `depth` without popping it.
    pub(super) fn vpeek(&self, depth: usize) -> CompileResult<Val> {
        self.frame
            .dip(depth)
            .copied()
            .ok_or(CompileError::StackUnderflow { pc: self.pc })
    }

    /// A register of the right bank for `jt`, pinned by the returned guard.
    pub(super) fn valloc(&mut self, jt: JType) -> CompileResult<(Ar, RegLock)> {
        let ar = match self.rf.pick(bank_of(jt))? {
            Pick::Free(ar) => ar,
            Pick::Spill(ar) => {
                self.spill(ar)?;
                ar
            }
        };
        Ok((ar, self.rf.lock_one(ar)))
    }

    /// Move every stack item held in `ar` to its own slot.
    pub(super) fn spill(&mut self, ar: Ar) -> CompileResult<()> {
        let positions: Vec<usize> = self
            .frame
            .stack()
            .iter()
            .enumerate()
            .filter(|(_, v)| v.uses(ar))
            .map(|(pos, _)| pos)
            .collect();
        if positions.is_empty() {
            return Ok(());
        }
        for pos in positions {
            self.to_own_slot(pos)?;
        }
        self.session.record_spill();
        log::debug!("jet::cg: spilled {:?} at pc {}", ar, self.pc);
        Ok(())
    }

    /// Free every scratch register referenced from the stack.
    pub(super) fn spill_all(&mut self) -> CompileResult<()> {
        let live: Vec<Ar> = self
            .rf
            .scratch()
            .iter()
            .filter(|&r| self.rf.refs(r) > 0)
            .collect();
        for r in live {
            self.spill(r)?;
        }
        Ok(())
    }

    fn to_own_slot(&mut self, pos: usize) -> CompileResult<()> {
        let v = *self
            .frame
            .at_pos(pos)
            .ok_or(CompileError::StackUnderflow { pc: self.pc })?;
        if v.is_placeholder() {
            return Ok(());
        }
        let slot = self.layout.stack_slot(pos);
        if v.kind == ValKind::Mem(slot) {
            return Ok(());
        }
        self.store_slot(slot, &v)?;
        self.release(&v)?;
        self.frame.stack_mut()[pos] = Val {
            kind: ValKind::Mem(slot),
            ..v
        };
        Ok(())
    }

    /// Materialize the item at `depth` in its own stack slot.
    pub(super) fn vswap(&mut self, depth: usize) -> CompileResult<()> {
        let pos = self
            .frame
            .pos_of(depth)
            .ok_or(CompileError::StackUnderflow { pc: self.pc })?;
        self.to_own_slot(pos)
    }

    pub(super) fn vswap_all(&mut self) -> CompileResult<()> {
        for pos in 0..self.frame.depth() {
            self.to_own_slot(pos)?;
        }
        Ok(())
    }

    /// Materialize stack items aliasing the storage `kind`.
    fn vswap_aliases(&mut self, kind: ValKind) -> CompileResult<()> {
        for pos in 0..self.frame.depth() {
            if self.frame.stack()[pos].kind == kind {
                self.to_own_slot(pos)?;
            }
        }
        Ok(())
    }

    /// Full-word store of a frame value into `dst`.
    pub(super) fn store_slot(&mut self, dst: MemRef, v: &Val) -> CompileResult<()> {
        let tmp = self.enc.scratch_gp();
        match v.kind {
            ValKind::Imm {
                caddr: Some(addr), ..
            } => {
                self.enc.mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Imm(addr as i64))?;
                self.enc
                    .mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Mem(MemRef::base_disp(tmp, 0)))?;
                self.enc.mov(OpSize::S64, Opnd::Mem(dst), Opnd::Reg(tmp))?;
            }
            ValKind::Imm { bits, .. } => {
                self.enc.mov(slot_size(v.jt), Opnd::Mem(dst), Opnd::Imm(bits))?
            }
            ValKind::Reg(r) if r.is_fp() => {
                self.enc.fmov(v.jt == JType::F64, Opnd::Mem(dst), Opnd::Reg(r))?
            }
            ValKind::Reg(r) => self.enc.mov(slot_size(v.jt), Opnd::Mem(dst), Opnd::Reg(r))?,
            ValKind::Mem(m) if m == dst => {}
            ValKind::Mem(m) => self.enc.mov(OpSize::S64, Opnd::Mem(dst), Opnd::Mem(m))?,
        }
        Ok(())
    }

    /// Load a frame value into `dst`.
    pub(super) fn load(&mut self, dst: Ar, v: &Val) -> CompileResult<()> {
        let dbl = v.jt == JType::F64;
        match v.kind {
            ValKind::Imm {
                caddr: Some(addr), ..
            } => {
                self.enc.mov(OpSize::S64, Opnd::Reg(dst), Opnd::Imm(addr as i64))?;
                self.enc
                    .mov(OpSize::S64, Opnd::Reg(dst), Opnd::Mem(MemRef::base_disp(dst, 0)))?;
            }
            ValKind::Imm { bits, .. } if dst.is_fp() => {
                self.enc.fmov(dbl, Opnd::Reg(dst), Opnd::Imm(bits))?
            }
            ValKind::Imm { bits, .. } => {
                self.enc.mov(reg_size(v.jt), Opnd::Reg(dst), Opnd::Imm(bits))?
            }
            ValKind::Reg(r) if r == dst => {}
            ValKind::Reg(r) if dst.is_fp() => self.enc.fmov(dbl, Opnd::Reg(dst), Opnd::Reg(r))?,
            ValKind::Reg(r) => self.enc.mov(reg_size(v.jt), Opnd::Reg(dst), Opnd::Reg(r))?,
            ValKind::Mem(m) if dst.is_fp() => self.enc.fmov(dbl, Opnd::Reg(dst), Opnd::Mem(m))?,
            ValKind::Mem(m) => self.enc.mov(reg_size(v.jt), Opnd::Reg(dst), Opnd::Mem(m))?,
        }
        Ok(())
    }

    /// The value in a register, loading it into a fresh one if needed.
    pub(super) fn vreg(&mut self, v: &Val) -> CompileResult<(Ar, RegLock)> {
        if let ValKind::Reg(r) = v.kind {
            return Ok((r, self.rf.lock_one(r)));
        }
        let (ar, lock) = self.valloc(v.jt)?;
        self.load(ar, v)?;
        Ok((ar, lock))
    }

    /// The value in a scratch register that may be overwritten.
    pub(super) fn vreg_mut(&mut self, v: &Val) -> CompileResult<(Ar, RegLock)> {
        if let ValKind::Reg(r) = v.kind {
            if self.rf.is_scratch(r) && self.rf.refs(r) == 0 {
                return Ok((r, self.rf.lock_one(r)));
            }
        }
        let (ar, lock) = self.valloc(v.jt)?;
        self.load(ar, v)?;
        Ok((ar, lock))
    }

    /// A result register of type `jt` computed from `v`, reusing v's register when free.
    pub(super) fn vreg_dst(&mut self, v: &Val, jt: JType) -> CompileResult<(Ar, RegLock)> {
        if let ValKind::Reg(r) = v.kind {
            if self.rf.is_scratch(r) && self.rf.refs(r) == 0 && r.bank() == bank_of(jt) {
                return Ok((r, self.rf.lock_one(r)));
            }
        }
        self.valloc(jt)
    }

    /// Operand form of a value; constant-slot values are loaded first.
    pub(super) fn vopnd(&mut self, v: &Val) -> CompileResult<(Opnd, Option<RegLock>)> {
        match v.as_opnd() {
            Some(o) => Ok((o, None)),
            None => {
                let (r, lock) = self.vreg(v)?;
                Ok((Opnd::Reg(r), Some(lock)))
            }
        }
    }

    pub(super) fn check_local(&self, idx: usize, jt: JType) -> CompileResult<()> {
        if idx + jt.slots().max(1) > self.frame.num_locals() {
            return Err(CompileError::BadLocal {
                pc: self.pc,
                index: idx as u32,
            });
        }
        Ok(())
    }

    pub(super) fn gen_ld(&mut self, jt: JType, idx: usize) -> CompileResult<()> {
        self.check_local(idx, jt)?;
        let local = self.frame.locals()[idx];
        let non_null =
            jt.is_ref() && (local.attrs.non_null || (self.this_stable && idx == 0));
        self.vpush(Val {
            jt,
            kind: self.home(idx),
            attrs: ValAttrs {
                non_null,
                gc_marked: false,
            },
        })
    }

    pub(super) fn gen_st(&mut self, jt: JType, idx: usize) -> CompileResult<()> {
        self.check_local(idx, jt)?;
        let (v, _lock) = self.vpop_locked()?;
        let jt = if v.jt == JType::RetAddr { JType::RetAddr } else { jt };
        let home = self.home(idx);
        self.vswap_aliases(home)?;
        match home {
            ValKind::Reg(g) => self.load(g, &Val { jt, ..v })?,
            ValKind::Mem(m) => self.store_slot(m, &Val { jt, ..v })?,
            ValKind::Imm { .. } => {}
        }
        if matches!(home, ValKind::Mem(_)) {
            self.update_gc_bit(idx, jt.is_ref())?;
        }
        let hi = idx + 1;
        if jt.is_wide() && matches!(self.home(hi), ValKind::Mem(_)) {
            self.update_gc_bit(hi, false)?;
        }

        let pc = self.pc;
        self.frame
            .set_local(
                idx,
                Val {
                    jt,
                    kind: home,
                    attrs: ValAttrs {
                        non_null: jt.is_ref() && v.attrs.non_null,
                        gc_marked: true,
                    },
                },
            )
            .map_err(|e| frame_err(pc, e))?;
        if jt.is_wide() {
            if let Some(upper) = self.frame.local_mut(hi) {
                upper.attrs.gc_marked = true;
            }
        }
        Ok(())
    }

    /// Set or clear the bitmap bit of memory-homed local `idx` unless it already matches.
    fn update_gc_bit(&mut self, idx: usize, need_ref: bool) -> CompileResult<()> {
        let prev = self.frame.locals()[idx];
        if prev.attrs.gc_marked && prev.jt.is_ref() == need_ref {
            return Ok(());
        }
        let word = self.layout.gc_word(idx);
        self.enc
            .bit(Opnd::Mem(word), (idx % 64) as u8, need_ref)?;
        Ok(())
    }

    pub(super) fn gen_iinc(&mut self, idx: usize, delta: i32) -> CompileResult<()> {
        self.check_local(idx, JType::I32)?;
        let home = self.home(idx);
        self.vswap_aliases(home)?;
        let dst = match home {
            ValKind::Reg(g) => Opnd::Reg(g),
            ValKind::Mem(m) => Opnd::Mem(m),
            ValKind::Imm { .. } => return Err(self.inconsistent("immediate local home")),
        };
        self.enc
            .alu(OpSize::S32, AluOp::Add, dst, Opnd::Imm(delta as i64))?;
        let pc = self.pc;
        let was_marked = self.frame.locals()[idx].attrs.gc_marked;
        self.frame
            .set_local(
                idx,
                Val {
                    jt: JType::I32,
                    kind: home,
                    attrs: ValAttrs {
                        non_null: false,
                        gc_marked: was_marked,
                    },
                },
            )
            .map_err(|e| frame_err(pc, e))?;
        Ok(())
    }

    pub(super) fn gen_pop(&mut self, slots: usize) -> CompileResult<()> {
        for _ in 0..slots {
            let pc = self.pc;
            let v = self.frame.pop_slot().map_err(|e| frame_err(pc, e))?;
            self.release(&v)?;
        }
        Ok(())
    }

    /// Stack shuffles. Consumed items living in their own slots are moved to registers
    /// first so no item ever names another position's slot.
    pub(super) fn gen_shuffle(&mut self, op: Shuffle) -> CompileResult<()> {
        let (consumed, produced) = op.pattern();
        let depth = self.frame.depth();
        if depth < consumed {
            return Err(CompileError::StackUnderflow { pc: self.pc });
        }
        let base = depth - consumed;

        let mut held = RegBitSet::new();
        for v in &self.frame.stack()[base..] {
            held = held.union(v.regs());
        }
        let mut locks = vec![self.rf.lock(held)];
        for pos in base..depth {
            let v = self.frame.stack()[pos];
            let ValKind::Mem(m) = v.kind else {
                continue;
            };
            if self.layout.stack_pos_of(&m).is_none() {
                continue;
            }
            let (ar, lock) = self.valloc(v.jt)?;
            self.load(ar, &v)?;
            self.rf.rref(ar);
            self.frame.stack_mut()[pos] = Val {
                kind: ValKind::Reg(ar),
                ..v
            };
            locks.push(lock);
        }

        let old: Vec<Val> = self.frame.stack()[base..].to_vec();
        for v in &old {
            self.release(v)?;
        }
        let pc = self.pc;
        self.frame.shuffle(op).map_err(|e| frame_err(pc, e))?;
        let new: Vec<Val> = self.frame.stack()[base..base + produced.len()].to_vec();
        for v in &new {
            self.retain(v);
        }
        Ok(())
    }

    pub(super) fn gen_ldc(&mut self, cp: u16, wide: bool) -> CompileResult<()> {
        let v = match self.vm.constant(cp) {
            Some(Constant::Int(i)) => Val::imm_i32(i),
            Some(Constant::Float(f)) => Val::imm_f32(f),
            Some(Constant::Long(l)) => Val::imm_i64(l),
            Some(Constant::Double(d)) => Val::imm_f64(d),
            Some(Constant::String(addr)) | Some(Constant::Class(addr)) => {
                Val::constant_slot(JType::Ref, addr)
            }
            None => {
                self.gen_linking_error(cp)?;
                if wide {
                    Val::imm_i64(0)
                } else {
                    Val::imm(JType::Ref, self.null_bits)
                }
            }
        };
        self.vpush(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_sizes() {
        assert_eq!(slot_size(JType::I32), OpSize::S32);
        assert_eq!(slot_size(JType::F32), OpSize::S32);
        assert_eq!(slot_size(JType::Ref), OpSize::S64);
        assert_eq!(slot_size(JType::RetAddr), OpSize::S64);
        assert_eq!(reg_size(JType::I64), OpSize::S64);
        assert_eq!(bank_of(JType::F64), RegBank::Fp);
        assert_eq!(bank_of(JType::Ref), RegBank::Gp);
    }
}
