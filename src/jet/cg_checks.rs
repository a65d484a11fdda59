// This module emits the runtime checks guarding dereferences, array accesses and integer
// division. A null check is dropped when the value is known non-null; a literal null
// throws unconditionally. Otherwise the check either relies on the dereference itself
// faulting, in which case the faulting instruction is recorded as a GC point the VM maps
// to NullPointerException, or compares and branches to a throw. The hardware form is only
// used for small offsets with uncompressed references in methods without handlers or a
// monitor, so no handler or unlock has to run for the faulting instruction. Once checked,
// every frame value denoting the same storage is marked non-null.

//! Null, bounds and zero-divisor checks.

use crate::core::encoder::{AluOp, Cond, Encoder, OpSize};
use crate::core::error::CompileResult;
use crate::core::jtype::JType;
use crate::core::method::Helper;
use crate::core::register_file::Ar;
use crate::core::session::NullCheckOutcome;
use crate::core::val::{MemRef, Opnd, Val, ValKind};

use super::compiler::Compiler;
use super::gcmap;
use super::layout::PAGE_SIZE;

/// How a null check was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NullCheck {
    /// Nothing left to do at the dereference.
    Done,
    /// The next dereference must be recorded as the faulting instruction.
    Implicit,
}

impl<E: Encoder> Compiler<'_, '_, E> {
    fn hw_null_check_ok(&self, off: Option<i32>) -> bool {
        self.opts.hw_null_checks
            && self.compressed.is_none()
            && !self.method.flags.is_synchronized
            && self.method.handlers.is_empty()
            && matches!(off, Some(o) if (0..PAGE_SIZE as i32).contains(&o))
    }

    /// Null check of `v`, whose first dereference (if any) is at offset `hw_off`.
    pub(super) fn gen_check_null(&mut self, v: &Val, hw_off: Option<i32>) -> CompileResult<NullCheck> {
        if v.attrs.non_null {
            self.session.record_null_check(NullCheckOutcome::Eliminated);
            return Ok(NullCheck::Done);
        }
        if v.imm_bits() == Some(self.null_bits) {
            self.session.record_null_check(NullCheckOutcome::Explicit);
            self.gen_throw(Helper::ThrowNullPointer, &[])?;
            return Ok(NullCheck::Done);
        }
        if self.hw_null_check_ok(hw_off) {
            self.session.record_null_check(NullCheckOutcome::Implicit);
            self.mark_non_null(v);
            return Ok(NullCheck::Implicit);
        }

        self.session.record_null_check(NullCheckOutcome::Explicit);
        match v.kind {
            ValKind::Reg(r) if self.null_bits == 0 => {
                self.enc.test(OpSize::S64, Opnd::Reg(r), Opnd::Reg(r))?
            }
            _ => {
                let (opnd, _lock) = self.vopnd(v)?;
                self.enc
                    .alu(OpSize::S64, AluOp::Cmp, opnd, Opnd::Imm(self.null_bits))?;
            }
        }
        let ok = self.enc.jcc(Cond::Ne)?;
        self.gen_throw(Helper::ThrowNullPointer, &[])?;
        let here = self.enc.ip();
        self.enc.patch(ok, here)?;
        self.mark_non_null(v);
        Ok(NullCheck::Done)
    }

    /// Record the next instruction as the faulting point of an implicit null check.
    pub(super) fn mark_implicit(&mut self, nc: NullCheck) -> CompileResult<()> {
        if nc != NullCheck::Implicit {
            return Ok(());
        }
        if self.gc_point_here().is_some() {
            let tmp = self.enc.scratch_gp();
            self.enc.mov(OpSize::S32, Opnd::Reg(tmp), Opnd::Reg(tmp))?;
        }
        let point = gcmap::implicit_null_point(self.enc.ip(), self.pc, &self.globals);
        self.push_gc_point(point);
        Ok(())
    }

    fn mark_non_null(&mut self, v: &Val) {
        if !matches!(v.kind, ValKind::Reg(_) | ValKind::Mem(_)) {
            return;
        }
        for item in self.frame.stack_mut() {
            if item.jt == JType::Ref && item.same_location(v) {
                item.attrs.non_null = true;
            }
        }
        for local in self.frame.locals_mut() {
            if local.jt == JType::Ref && local.same_location(v) {
                local.attrs.non_null = true;
            }
        }
    }

    /// Unsigned compare of `idx` against the length of the array in `arr`.
    pub(super) fn gen_check_bounds(&mut self, arr: Ar, idx: &Val, nc: NullCheck) -> CompileResult<()> {
        let len = MemRef::base_disp(arr, self.obj.array_length_offset);
        let (idx_opnd, _lock) = self.vopnd(idx)?;
        self.mark_implicit(nc)?;
        self.enc.alu(OpSize::S32, AluOp::Cmp, Opnd::Mem(len), idx_opnd)?;
        let ok = self.enc.jcc(Cond::A)?;
        self.gen_throw(Helper::ThrowArrayIndex, &[(JType::I32, (*idx).into())])?;
        let here = self.enc.ip();
        self.enc.patch(ok, here)?;
        Ok(())
    }

    /// Zero-divisor check; returns false when the divisor is a literal zero and the
    /// operation always throws.
    pub(super) fn gen_check_div0(&mut self, divisor: &Val) -> CompileResult<bool> {
        let sz = if divisor.jt == JType::I64 {
            OpSize::S64
        } else {
            OpSize::S32
        };
        match divisor.imm_bits() {
            Some(0) => {
                self.gen_throw(Helper::ThrowArithmetic, &[])?;
                return Ok(false);
            }
            Some(_) => return Ok(true),
            None => {}
        }
        match divisor.kind {
            ValKind::Reg(r) => self.enc.test(sz, Opnd::Reg(r), Opnd::Reg(r))?,
            _ => {
                let (opnd, _lock) = self.vopnd(divisor)?;
                self.enc.alu(sz, AluOp::Cmp, opnd, Opnd::Imm(0))?;
            }
        }
        let ok = self.enc.jcc(Cond::Ne)?;
        self.gen_throw(Helper::ThrowArithmetic, &[])?;
        let here = self.enc.ip();
        self.enc.patch(ok, here)?;
        Ok(true)
    }
}
