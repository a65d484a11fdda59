// This module generates arithmetic, conversions and comparisons. Operations on two
// immediates are folded by calling the runtime helpers at compile time. Integer division
// checks the divisor first, then runs idiv through rax/rdx with a branch around the
// instruction for a divisor of -1, whose quotient x86 cannot represent for MIN; the branch
// negates (div) or yields 0 (rem) instead. Multiplication by 0, 1 or a power of two is
// reduced. Shifts by a variable count go through cl. Float negation flips the sign bit in
// a general register. Float remainder, the three-way comparisons and the float conversions
// always call their helpers, and so does everything when inline arithmetic is disabled.
// Int results in registers are kept zero-extended to 64 bits.

//! Arithmetic, conversion and comparison code generation.

use crate::core::bytecode::*;
use crate::core::encoder::{AluOp, Cond, Encoder, FpOp, OpSize, ShiftOp};
use crate::core::error::CompileResult;
use crate::core::jtype::JType;
use crate::core::register_file::{Ar, RegBitSet};
use crate::core::val::{Opnd, Val, ValKind};
use crate::runtime::arith::{arith_helper, cmp_helper, cnv_helper, cnv_types, fold_arith, fold_cmp, fold_cnv};

use super::cg_call::Callee;
use super::cg_stk::reg_size;
use super::compiler::Compiler;
use super::gcmap::GcMode;

/// Value type and int-family opcode (`IADD`, `ISHL`, ...) of an arithmetic opcode.
fn arith_kind(op: u8) -> (JType, u8) {
    const TYPES: [JType; 4] = [JType::I32, JType::I64, JType::F32, JType::F64];
    if op <= DNEG {
        let k = op - IADD;
        (TYPES[(k % 4) as usize], IADD + k / 4 * 4)
    } else {
        let k = op - ISHL;
        (TYPES[(k % 2) as usize], ISHL + k / 2 * 2)
    }
}

fn alu_op(family: u8) -> Option<AluOp> {
    Some(match family {
        IADD => AluOp::Add,
        ISUB => AluOp::Sub,
        IAND => AluOp::And,
        IOR => AluOp::Or,
        IXOR => AluOp::Xor,
        _ => return None,
    })
}

fn fp_op(family: u8) -> Option<FpOp> {
    Some(match family {
        IADD => FpOp::Add,
        ISUB => FpOp::Sub,
        IMUL => FpOp::Mul,
        IDIV => FpOp::Div,
        _ => return None,
    })
}

fn is_commutative(family: u8) -> bool {
    matches!(family, IADD | IMUL | IAND | IOR | IXOR)
}

/// Value of an integer immediate at its own width.
fn int_imm(jt: JType, bits: i64) -> i64 {
    if jt == JType::I32 {
        bits as i32 as i64
    } else {
        bits
    }
}

impl<E: Encoder> Compiler<'_, '_, E> {
    pub(super) fn gen_arith(&mut self, op: u8) -> CompileResult<()> {
        let (jt, family) = arith_kind(op);
        match family {
            INEG => self.gen_neg(jt, op),
            ISHL | ISHR | IUSHR => self.gen_shift(jt, op, family),
            _ => self.gen_binary(jt, op, family),
        }
    }

    fn push_result(&mut self, res: Option<Val>) -> CompileResult<()> {
        let v = res.ok_or_else(|| self.inconsistent("call produced no result"))?;
        self.vpush(v)
    }

    fn gen_arith_helper(&mut self, jt: JType, op: u8, v1: &Val, v2: &Val) -> CompileResult<()> {
        let addr = arith_helper(jt, op)
            .ok_or_else(|| self.inconsistent(format!("no arithmetic helper for {jt}")))?;
        let t2 = if jt == JType::I64 && matches!(op, LSHL | LSHR | LUSHR) {
            JType::I32
        } else {
            jt
        };
        let res = self.gen_call(
            Callee::Abs(addr),
            &[
                (jt, (*v1).into()),
                (t2, (*v2).into()),
                (JType::I32, Val::imm_i32(op as i32).into()),
            ],
            jt,
            GcMode::None,
        )?;
        self.push_result(res)
    }

    fn gen_binary(&mut self, jt: JType, op: u8, family: u8) -> CompileResult<()> {
        let (v2, _l2) = self.vpop_locked()?;
        let (v1, _l1) = self.vpop_locked()?;
        let is_div = matches!(family, IDIV | IREM);

        if !jt.is_f() && is_div && !self.gen_check_div0(&v2)? {
            return self.vpush(Val::imm(jt, 0));
        }
        if let (Some(a), Some(b)) = (v1.imm_bits(), v2.imm_bits()) {
            if let Some(bits) = fold_arith(jt, op, a, b) {
                return self.vpush(Val::imm(jt, bits));
            }
        }

        if jt.is_f() {
            return match fp_op(family) {
                Some(fop) if self.opts.inline_arith => {
                    let (r, _lr) = self.vreg_mut(&v1)?;
                    let (src, _ls) = self.vopnd(&v2)?;
                    self.enc.fop(jt == JType::F64, fop, r, src)?;
                    self.vpush(Val::reg(jt, r))
                }
                _ => self.gen_arith_helper(jt, op, &v1, &v2),
            };
        }
        if !self.opts.inline_arith {
            return self.gen_arith_helper(jt, op, &v1, &v2);
        }
        if is_div {
            return self.gen_idiv(jt, family, &v1, &v2);
        }

        let (v1, v2) = if is_commutative(family) && v1.imm_bits().is_some() && v2.imm_bits().is_none() {
            (v2, v1)
        } else {
            (v1, v2)
        };
        let sz = reg_size(jt);
        if family == IMUL {
            if let Some(b) = v2.imm_bits().map(|b| int_imm(jt, b)) {
                if b == 0 {
                    return self.vpush(Val::imm(jt, 0));
                }
                if b == 1 {
                    return self.vpush(v1);
                }
                if b > 0 && b & (b - 1) == 0 {
                    let (r, _lr) = self.vreg_mut(&v1)?;
                    self.enc
                        .shift(sz, ShiftOp::Shl, Opnd::Reg(r), Some(b.trailing_zeros() as u8))?;
                    return self.vpush(Val::reg(jt, r));
                }
            }
        }

        let (r, _lr) = self.vreg_mut(&v1)?;
        let (src, _ls) = self.vopnd(&v2)?;
        match alu_op(family) {
            Some(aop) => self.enc.alu(sz, aop, Opnd::Reg(r), src)?,
            None => self.enc.imul(sz, r, src)?,
        }
        self.vpush(Val::reg(jt, r))
    }

    /// Integer division and remainder through rax/rdx.
    fn gen_idiv(&mut self, jt: JType, family: u8, v1: &Val, v2: &Val) -> CompileResult<()> {
        let sz = reg_size(jt);
        self.spill(Ar::RAX)?;
        self.spill(Ar::RDX)?;
        let _fixed = self.rf.lock(RegBitSet::of(&[Ar::RAX, Ar::RDX]));
        let minus_one = v2.imm_bits().map(|b| int_imm(jt, b) == -1);

        let mut divisor_lock = None;
        let divisor = match (minus_one, v2.kind) {
            (Some(true), _) => Opnd::Imm(-1),
            (None, ValKind::Reg(r)) if r != Ar::RAX && r != Ar::RDX => Opnd::Reg(r),
            (None, ValKind::Mem(m)) if !m.uses(Ar::RAX) && !m.uses(Ar::RDX) => Opnd::Mem(m),
            _ => {
                let (d, lock) = self.valloc(jt)?;
                self.load(d, v2)?;
                divisor_lock = Some(lock);
                Opnd::Reg(d)
            }
        };
        self.load(Ar::RAX, v1)?;

        let res = if family == IDIV { Ar::RAX } else { Ar::RDX };
        let emit_special = |c: &mut Self| -> CompileResult<()> {
            if family == IDIV {
                c.enc.neg(sz, Opnd::Reg(Ar::RAX))?;
            } else {
                c.enc
                    .alu(OpSize::S32, AluOp::Xor, Opnd::Reg(Ar::RDX), Opnd::Reg(Ar::RDX))?;
            }
            Ok(())
        };
        match minus_one {
            Some(true) => emit_special(self)?,
            Some(false) => {
                self.enc.sign_extend_acc(sz)?;
                self.enc.idiv(sz, divisor)?;
            }
            None => {
                self.enc.alu(sz, AluOp::Cmp, divisor, Opnd::Imm(-1))?;
                let slow = self.enc.jcc(Cond::Ne)?;
                emit_special(self)?;
                let done = self.enc.jmp()?;
                let here = self.enc.ip();
                self.enc.patch(slow, here)?;
                self.enc.sign_extend_acc(sz)?;
                self.enc.idiv(sz, divisor)?;
                let here = self.enc.ip();
                self.enc.patch(done, here)?;
            }
        }
        drop(divisor_lock);
        self.vpush(Val::reg(jt, res))
    }

    fn gen_shift(&mut self, jt: JType, op: u8, family: u8) -> CompileResult<()> {
        let (v2, _l2) = self.vpop_locked()?;
        let (v1, _l1) = self.vpop_locked()?;
        if let (Some(a), Some(b)) = (v1.imm_bits(), v2.imm_bits()) {
            if let Some(bits) = fold_arith(jt, op, a, b) {
                return self.vpush(Val::imm(jt, bits));
            }
        }
        if !self.opts.inline_arith {
            return self.gen_arith_helper(jt, op, &v1, &v2);
        }

        let sz = reg_size(jt);
        let sop = match family {
            ISHL => ShiftOp::Shl,
            ISHR => ShiftOp::Sar,
            _ => ShiftOp::Shr,
        };
        if let Some(n) = v2.imm_bits() {
            let mask = if jt == JType::I64 { 0x3f } else { 0x1f };
            let n = (n & mask) as u8;
            if n == 0 {
                return self.vpush(v1);
            }
            let (r, _lr) = self.vreg_mut(&v1)?;
            self.enc.shift(sz, sop, Opnd::Reg(r), Some(n))?;
            return self.vpush(Val::reg(jt, r));
        }

        self.spill(Ar::RCX)?;
        let _rcx = self.rf.lock_one(Ar::RCX);
        let (r, _lr) = match v1.kind {
            ValKind::Reg(x) if x != Ar::RCX && self.rf.is_scratch(x) && self.rf.refs(x) == 0 => {
                (x, self.rf.lock_one(x))
            }
            _ => {
                let (x, lock) = self.valloc(jt)?;
                self.load(x, &v1)?;
                (x, lock)
            }
        };
        self.load(Ar::RCX, &Val { jt: JType::I32, ..v2 })?;
        self.enc.shift(sz, sop, Opnd::Reg(r), None)?;
        self.vpush(Val::reg(jt, r))
    }

    fn gen_neg(&mut self, jt: JType, op: u8) -> CompileResult<()> {
        let (v, _l) = self.vpop_locked()?;
        if let Some(bits) = v.imm_bits().and_then(|b| fold_arith(jt, op, b, 0)) {
            return self.vpush(Val::imm(jt, bits));
        }
        if !self.opts.inline_arith {
            return self.gen_arith_helper(jt, op, &v, &Val::imm(jt, 0));
        }
        if jt.is_f() {
            let dbl = jt == JType::F64;
            let (x, _lx) = self.vreg_mut(&v)?;
            let (g, _lg) = self.valloc(JType::I64)?;
            self.enc.fbits(dbl, g, x)?;
            let (sz, bit) = if dbl { (OpSize::S64, 63) } else { (OpSize::S32, 31) };
            self.enc.bit_flip(sz, g, bit)?;
            self.enc.fbits(dbl, x, g)?;
            return self.vpush(Val::reg(jt, x));
        }
        let (r, _lr) = self.vreg_mut(&v)?;
        self.enc.neg(reg_size(jt), Opnd::Reg(r))?;
        self.vpush(Val::reg(jt, r))
    }

    pub(super) fn gen_cnv(&mut self, op: u8) -> CompileResult<()> {
        let (from, to) = cnv_types(op).ok_or_else(|| self.inconsistent("not a conversion"))?;
        let rt = to.stack_type();
        let (v, _l) = self.vpop_locked()?;
        if let Some(bits) = v.imm_bits().and_then(|b| fold_cnv(op, b)) {
            return self.vpush(Val::imm(rt, bits));
        }

        let inline = match (from, to) {
            (JType::I32, JType::I64) => Some((OpSize::S32, true)),
            (JType::I64, JType::I32) => Some((OpSize::S32, false)),
            (JType::I32, JType::I8) => Some((OpSize::S8, true)),
            (JType::I32, JType::U16) => Some((OpSize::S16, false)),
            (JType::I32, JType::I16) => Some((OpSize::S16, true)),
            _ => None,
        };
        if let (Some((from_sz, signed)), true) = (inline, self.opts.inline_arith) {
            let (src, _ls) = self.vopnd(&v)?;
            let (r, _lr) = self.vreg_dst(&v, rt)?;
            self.enc.movx(r, src, from_sz, signed)?;
            return self.vpush(Val::reg(rt, r));
        }

        let addr = cnv_helper(from, to)
            .ok_or_else(|| self.inconsistent(format!("no conversion from {from} to {to}")))?;
        let res = self.gen_call(Callee::Abs(addr), &[(from, v.into())], rt, GcMode::None)?;
        self.push_result(res)
    }

    pub(super) fn gen_cmp(&mut self, op: u8) -> CompileResult<()> {
        let jt = match op {
            LCMP => JType::I64,
            FCMPL | FCMPG => JType::F32,
            _ => JType::F64,
        };
        let (v2, _l2) = self.vpop_locked()?;
        let (v1, _l1) = self.vpop_locked()?;
        if let (Some(a), Some(b)) = (v1.imm_bits(), v2.imm_bits()) {
            if let Some(r) = fold_cmp(op, a, b) {
                return self.vpush(Val::imm_i32(r));
            }
        }
        let addr = cmp_helper(op).ok_or_else(|| self.inconsistent("not a comparison"))?;
        let res = self.gen_call(
            Callee::Abs(addr),
            &[(jt, v1.into()), (jt, v2.into())],
            JType::I32,
            GcMode::None,
        )?;
        self.push_result(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arith_kind_families() {
        assert_eq!(arith_kind(IADD), (JType::I32, IADD));
        assert_eq!(arith_kind(LSUB), (JType::I64, ISUB));
        assert_eq!(arith_kind(DREM), (JType::F64, IREM));
        assert_eq!(arith_kind(FNEG), (JType::F32, INEG));
        assert_eq!(arith_kind(LUSHR), (JType::I64, IUSHR));
        assert_eq!(arith_kind(ISHR), (JType::I32, ISHR));
        assert_eq!(arith_kind(LXOR), (JType::I64, IXOR));
    }

    #[test]
    fn test_int_imm_width() {
        assert_eq!(int_imm(JType::I32, 0xffff_ffff), -1);
        assert_eq!(int_imm(JType::I64, 0xffff_ffff), 0xffff_ffff);
        assert!(is_commutative(IMUL));
        assert!(!is_commutative(ISUB));
        assert_eq!(alu_op(IMUL), None);
        assert_eq!(fp_op(IREM), None);
    }
}
