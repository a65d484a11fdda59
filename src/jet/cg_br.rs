// This module generates conditional and unconditional branches, switches, subroutine calls
// and returns from subroutines. Operands are brought into comparable form before the frame
// is handed to the successors, because the block exit may snapshot the frame and nothing
// may be allocated after that point. A branch going backwards first polls for a safepoint
// and bumps the method's back-edge counter. tableswitch jumps through an inline table of
// 64-bit offsets relative to the table start; lookupswitch compares key by key. jsr loads
// the continuation address with a rip-relative lea and ret jumps through the local holding
// it; the continuation block is entered with the stack as it was before the jsr.

//! Branch, switch and subroutine code generation.

use crate::core::bytecode::*;
use crate::core::encoder::{AluOp, Cond, Encoder, OpSize};
use crate::core::error::CompileResult;
use crate::core::jtype::JType;
use crate::core::method::Helper;
use crate::core::register_file::RegLock;
use crate::core::val::{MemRef, Opnd, Val, ValKind};

use super::cg_call::Callee;
use super::compiler::{Compiler, TableFixup};
use super::gcmap::GcMode;

fn if_cond(op: u8) -> Cond {
    match op {
        IFEQ | IF_ICMPEQ | IF_ACMPEQ | IFNULL => Cond::Eq,
        IFNE | IF_ICMPNE | IF_ACMPNE | IFNONNULL => Cond::Ne,
        IFLT | IF_ICMPLT => Cond::Lt,
        IFGE | IF_ICMPGE => Cond::Ge,
        IFGT | IF_ICMPGT => Cond::Gt,
        _ => Cond::Le,
    }
}

fn is_back_edge(inst: &Inst) -> bool {
    inst.targets().iter().any(|&t| t <= inst.pc)
}

impl<E: Encoder> Compiler<'_, '_, E> {
    fn branch_target(&self, inst: &Inst) -> CompileResult<u32> {
        match inst.data {
            InstData::Branch(t) => Ok(t),
            _ => Err(self.inconsistent("branch without target")),
        }
    }

    /// Safepoint poll and back-edge counter bump.
    fn gen_poll(&mut self) -> CompileResult<()> {
        if !self.opts.backedge_polls {
            return Ok(());
        }
        let tmp = self.enc.scratch_gp();
        if let Some(counter) = self.vm.backedge_counter(self.method.handle) {
            self.enc
                .mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Imm(counter as i64))?;
            self.enc.alu(
                OpSize::S32,
                AluOp::Add,
                Opnd::Mem(MemRef::base_disp(tmp, 0)),
                Opnd::Imm(1),
            )?;
        }
        if let Some(flag) = self.vm.safepoint_flag() {
            // The call below happens on one path only; spill on both.
            self.spill_all()?;
            self.enc.mov(OpSize::S64, Opnd::Reg(tmp), Opnd::Imm(flag as i64))?;
            self.enc.alu(
                OpSize::S32,
                AluOp::Cmp,
                Opnd::Mem(MemRef::base_disp(tmp, 0)),
                Opnd::Imm(0),
            )?;
            let skip = self.enc.jcc(Cond::Eq)?;
            self.gen_call(
                Callee::Helper(Helper::GcSafepoint),
                &[],
                JType::Void,
                GcMode::Frame { retval_ref: false },
            )?;
            let here = self.enc.ip();
            self.enc.patch(skip, here)?;
        }
        Ok(())
    }

    pub(super) fn gen_if(&mut self, inst: &Inst) -> CompileResult<()> {
        let target = self.branch_target(inst)?;
        if is_back_edge(inst) {
            self.gen_poll()?;
        }
        let op = inst.opcode;
        let mut locks: Vec<RegLock> = Vec::new();
        let (v1, v2, sz) = match op {
            IFEQ..=IFLE => {
                let (v, l) = self.vpop_locked()?;
                locks.push(l);
                (v, Val::imm_i32(0), OpSize::S32)
            }
            IFNULL | IFNONNULL => {
                let (v, l) = self.vpop_locked()?;
                locks.push(l);
                (v, Val::imm(JType::Ref, self.null_bits), OpSize::S64)
            }
            _ => {
                let (v2, l2) = self.vpop_locked()?;
                let (v1, l1) = self.vpop_locked()?;
                locks.push(l1);
                locks.push(l2);
                let sz = if op >= IF_ACMPEQ { OpSize::S64 } else { OpSize::S32 };
                (v1, v2, sz)
            }
        };

        let mut cond = if_cond(op);
        let (a, b) = if v1.imm_bits().is_some() && v2.imm_bits().is_none() {
            cond = cond.flip();
            (v2, v1)
        } else {
            (v1, v2)
        };
        let lhs = match a.as_opnd() {
            Some(o @ (Opnd::Reg(_) | Opnd::Mem(_))) => o,
            _ => {
                let (r, l) = self.vreg(&a)?;
                locks.push(l);
                Opnd::Reg(r)
            }
        };
        let (rhs, l) = self.vopnd(&b)?;
        locks.extend(l);

        self.bb_leave(&[target, inst.next])?;
        match (lhs, rhs) {
            (Opnd::Reg(r), Opnd::Imm(0)) if b.jt != JType::Ref || self.null_bits == 0 => {
                self.enc.test(sz, Opnd::Reg(r), Opnd::Reg(r))?
            }
            _ => self.enc.alu(sz, AluOp::Cmp, lhs, rhs)?,
        }
        let p = self.enc.jcc(cond)?;
        self.patches.push((p, target));
        self.work.push(target);
        drop(locks);
        self.flow_to(inst.next)
    }

    pub(super) fn gen_goto(&mut self, inst: &Inst) -> CompileResult<()> {
        let target = self.branch_target(inst)?;
        if is_back_edge(inst) {
            self.gen_poll()?;
        }
        self.bb_leave(&[target])?;
        self.flow_to(target)
    }

    pub(super) fn gen_jsr(&mut self, inst: &Inst) -> CompileResult<()> {
        let target = self.branch_target(inst)?;
        self.vswap_all()?;
        self.record_canonical(inst.next)?;
        self.work.push(inst.next);

        let (r, lock) = self.valloc(JType::RetAddr)?;
        let p = self.enc.lea_rip(r)?;
        self.patches.push((p, inst.next));
        self.vpush(Val::reg(JType::RetAddr, r))?;
        drop(lock);
        self.bb_leave(&[target])?;
        self.flow_to(target)
    }

    pub(super) fn gen_ret(&mut self, idx: usize) -> CompileResult<()> {
        self.check_local(idx, JType::RetAddr)?;
        self.vswap_all()?;
        let dst = match self.home(idx) {
            ValKind::Reg(r) => Opnd::Reg(r),
            ValKind::Mem(m) => Opnd::Mem(m),
            ValKind::Imm { .. } => return Err(self.inconsistent("immediate local home")),
        };
        self.enc.jmp_indirect(dst)?;
        Ok(())
    }

    /// Key of a switch known at compile time.
    fn static_switch(&mut self, target: u32) -> CompileResult<()> {
        self.bb_leave(&[target])?;
        self.flow_to(target)
    }

    pub(super) fn gen_tableswitch(&mut self, inst: &Inst) -> CompileResult<()> {
        let InstData::TableSwitch {
            default,
            low,
            high,
            ref targets,
        } = inst.data
        else {
            return Err(self.inconsistent("tableswitch without table"));
        };
        if is_back_edge(inst) {
            self.gen_poll()?;
        }
        let (v, _l) = self.vpop_locked()?;
        if let Some(key) = v.imm_i32_value() {
            let t = if (low..=high).contains(&key) {
                targets[(key as i64 - low as i64) as usize]
            } else {
                default
            };
            return self.static_switch(t);
        }

        let (r, _lr) = self.vreg_mut(&v)?;
        let (base, _lb) = self.valloc(JType::I64)?;
        self.bb_leave(&inst.targets())?;

        if low != 0 {
            self.enc
                .alu(OpSize::S32, AluOp::Sub, Opnd::Reg(r), Opnd::Imm(low as i64))?;
        }
        let span = (high as i64 - low as i64) as u32;
        self.enc
            .alu(OpSize::S32, AluOp::Cmp, Opnd::Reg(r), Opnd::Imm(span as i64))?;
        let to_default = self.enc.jcc(Cond::A)?;
        self.patches.push((to_default, default));
        let table_ref = self.enc.lea_rip(base)?;
        self.enc.mov(
            OpSize::S64,
            Opnd::Reg(r),
            Opnd::Mem(MemRef::base_index(base, r, 8, 0)),
        )?;
        self.enc
            .alu(OpSize::S64, AluOp::Add, Opnd::Reg(r), Opnd::Reg(base))?;
        self.enc.jmp_indirect(Opnd::Reg(r))?;

        let table_ip = self.enc.ip();
        self.enc.patch(table_ref, table_ip)?;
        for &target in targets {
            let at = self.enc.data64(0)?;
            self.table_fixups.push(TableFixup {
                at,
                table_ip,
                target,
            });
        }
        self.work.push(default);
        self.work.extend(targets.iter().rev().copied());
        Ok(())
    }

    pub(super) fn gen_lookupswitch(&mut self, inst: &Inst) -> CompileResult<()> {
        let InstData::LookupSwitch { default, ref pairs } = inst.data else {
            return Err(self.inconsistent("lookupswitch without pairs"));
        };
        if is_back_edge(inst) {
            self.gen_poll()?;
        }
        let (v, _l) = self.vpop_locked()?;
        if let Some(key) = v.imm_i32_value() {
            let t = pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|p| p.1)
                .unwrap_or(default);
            return self.static_switch(t);
        }

        let (r, _lr) = self.vreg(&v)?;
        self.bb_leave(&inst.targets())?;
        for &(key, target) in pairs {
            self.enc
                .alu(OpSize::S32, AluOp::Cmp, Opnd::Reg(r), Opnd::Imm(key as i64))?;
            let p = self.enc.jcc(Cond::Eq)?;
            self.patches.push((p, target));
            self.work.push(target);
        }
        self.flow_to(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_if_conditions() {
        assert_eq!(if_cond(IFEQ), Cond::Eq);
        assert_eq!(if_cond(IFNONNULL), Cond::Ne);
        assert_eq!(if_cond(IF_ICMPLT), Cond::Lt);
        assert_eq!(if_cond(IF_ICMPLE), Cond::Le);
        assert_eq!(if_cond(IFGE), Cond::Ge);
        assert_eq!(if_cond(IF_ACMPEQ), Cond::Eq);
    }
}
