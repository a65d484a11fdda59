// This module generates field and array access, object and array allocation, type checks
// and explicit monitor operations. Memory accesses go through one load and one store
// routine that know the in-memory width of every field or element type, sign or zero
// extend sub-int values and compress or decompress references in compressed mode. When an
// access doubles as a hardware null check, everything that may emit code (allocation,
// loads of the operands) happens first and the access instruction itself is recorded as
// the faulting point. Static members of classes that are not yet initialized are preceded
// by a class-initialization call. Operations whose helper call may trigger a collection
// keep their reference operands on the abstract stack until after the call so the GC map
// covers them.

//! Objects, arrays, fields and monitors.

use crate::core::encoder::{AluOp, Encoder, OpSize};
use crate::core::error::{CompileError, CompileResult};
use crate::core::jtype::JType;
use crate::core::method::{ClassHandle, FieldInfo, Helper};
use crate::core::register_file::{Ar, RegLock};
use crate::core::val::{MemRef, Opnd, Val, ValKind};

use super::cg_call::{CallArg, Callee};
use super::cg_checks::NullCheck;
use super::compiler::Compiler;
use super::gcmap::GcMode;

/// Truncate an immediate to the store width.
fn imm_for(sz: OpSize, bits: i64) -> i64 {
    match sz {
        OpSize::S8 => bits as i8 as i64,
        OpSize::S16 => bits as i16 as i64,
        OpSize::S32 => bits as i32 as i64,
        OpSize::S64 => bits,
    }
}

const FRAME: GcMode = GcMode::Frame { retval_ref: false };

impl<E: Encoder> Compiler<'_, '_, E> {
    /// Width of a field or array element of type `jt` in the heap.
    fn mem_size(&self, jt: JType) -> OpSize {
        match jt {
            JType::Bool | JType::I8 => OpSize::S8,
            JType::I16 | JType::U16 => OpSize::S16,
            JType::I32 | JType::F32 => OpSize::S32,
            JType::Ref if self.compressed.is_some() => OpSize::S32,
            _ => OpSize::S64,
        }
    }

    /// Load a heap value of type `jt` from `m` into a fresh register.
    fn gen_mem_load(&mut self, m: MemRef, jt: JType, nc: NullCheck) -> CompileResult<Val> {
        let st = jt.stack_type();
        let (dst, _lock) = self.valloc(st)?;
        self.mark_implicit(nc)?;
        let src = Opnd::Mem(m);
        match jt {
            JType::Bool | JType::I8 => self.enc.movx(dst, src, OpSize::S8, true)?,
            JType::I16 => self.enc.movx(dst, src, OpSize::S16, true)?,
            JType::U16 => self.enc.movx(dst, src, OpSize::S16, false)?,
            JType::F32 => self.enc.fmov(false, Opnd::Reg(dst), src)?,
            JType::F64 => self.enc.fmov(true, Opnd::Reg(dst), src)?,
            JType::I32 => self.enc.mov(OpSize::S32, Opnd::Reg(dst), src)?,
            JType::Ref => match self.compressed {
                Some(c) => {
                    self.enc.mov(OpSize::S32, Opnd::Reg(dst), src)?;
                    self.enc.alu(
                        OpSize::S64,
                        AluOp::Add,
                        Opnd::Reg(dst),
                        Opnd::Imm(c.heap_base as i64),
                    )?;
                }
                None => self.enc.mov(OpSize::S64, Opnd::Reg(dst), src)?,
            },
            _ => self.enc.mov(OpSize::S64, Opnd::Reg(dst), src)?,
        }
        Ok(Val::reg(st, dst))
    }

    /// Store `v` as a heap value of type `jt` at `m`.
    fn gen_mem_store(&mut self, m: MemRef, jt: JType, v: &Val, nc: NullCheck) -> CompileResult<()> {
        let sz = self.mem_size(jt);
        let mut _lock: Option<RegLock> = None;
        let compressed_ref = jt == JType::Ref && self.compressed.is_some();
        let heap_base = self.compressed.map(|c| c.heap_base as i64).unwrap_or(0);

        let src = match v.kind {
            ValKind::Imm { bits, caddr: None } if compressed_ref => {
                Opnd::Imm(imm_for(sz, bits.wrapping_sub(heap_base)))
            }
            ValKind::Imm { bits, caddr: None }
                if sz != OpSize::S64 || i32::try_from(bits).is_ok() =>
            {
                Opnd::Imm(imm_for(sz, bits))
            }
            _ if compressed_ref => {
                let (t, l) = self.valloc(JType::I64)?;
                self.load(t, v)?;
                self.enc
                    .alu(OpSize::S64, AluOp::Sub, Opnd::Reg(t), Opnd::Imm(heap_base))?;
                _lock = Some(l);
                Opnd::Reg(t)
            }
            _ => {
                let (r, l) = self.vreg(v)?;
                _lock = Some(l);
                Opnd::Reg(r)
            }
        };

        self.mark_implicit(nc)?;
        match src {
            Opnd::Reg(r) if r.is_fp() => self.enc.fmov(jt == JType::F64, Opnd::Mem(m), src)?,
            _ => self.enc.mov(sz, Opnd::Mem(m), src)?,
        }
        Ok(())
    }

    fn class_init_check(&mut self, class: ClassHandle) -> CompileResult<()> {
        if self.vm.class_is_initialized(class) {
            return Ok(());
        }
        self.gen_call(
            Callee::Helper(Helper::ClassInit),
            &[(JType::I64, Val::imm_i64(class.0 as i64).into())],
            JType::Void,
            FRAME,
        )?;
        Ok(())
    }

    /// Resolve a class at run time; the class handle is returned in a pinned register.
    fn gen_resolve_class(&mut self, cp: u16, array_of: bool) -> CompileResult<(Val, RegLock)> {
        let v = self
            .gen_call(
                Callee::Helper(Helper::ResolveClass),
                &[
                    (JType::I32, Val::imm_i32(cp as i32).into()),
                    (JType::I32, Val::imm_i32(array_of as i32).into()),
                ],
                JType::I64,
                FRAME,
            )?
            .ok_or_else(|| self.inconsistent("class resolution without result"))?;
        let lock = self.rf.lock(v.regs());
        Ok((v, lock))
    }

    /// Class operand of an allocation or type check, or `None` after emitting a
    /// linking error.
    fn class_operand(
        &mut self,
        cp: u16,
        array_of: bool,
    ) -> CompileResult<Option<(Val, Option<RegLock>)>> {
        let resolved = if array_of {
            self.vm.resolve_array_class(cp)
        } else {
            self.vm.resolve_class(cp)
        };
        match resolved {
            Some(c) => Ok(Some((Val::imm_i64(c.0 as i64), None))),
            None if self.vm.lazy_resolution() => {
                let (v, lock) = self.gen_resolve_class(cp, array_of)?;
                Ok(Some((v, Some(lock))))
            }
            None => {
                self.gen_linking_error(cp)?;
                Ok(None)
            }
        }
    }

    pub(super) fn gen_field(&mut self, cp: u16, is_static: bool, put: bool) -> CompileResult<()> {
        let jt = self
            .vm
            .field_type(cp)
            .ok_or(CompileError::BadConstantPool { pc: self.pc, cp })?;
        if self.vm.lazy_resolution() {
            return self.gen_field_lazy(cp, jt, is_static, put);
        }
        let Some(f) = self.vm.resolve_field(cp, is_static) else {
            self.gen_linking_error(cp)?;
            let slots = (if put { jt.stack_type().slots() } else { 0 }) + usize::from(!is_static);
            self.gen_pop(slots)?;
            if !put {
                self.vpush(self.dummy_of(jt.stack_type()))?;
            }
            return Ok(());
        };
        if is_static {
            self.gen_static_field(&f, put)
        } else {
            self.gen_instance_field(&f, put)
        }
    }

    fn gen_static_field(&mut self, f: &FieldInfo, put: bool) -> CompileResult<()> {
        if !f.class_initialized {
            self.class_init_check(f.class)?;
        }
        let (base, _lb) = self.valloc(JType::I64)?;
        self.enc.mov(
            OpSize::S64,
            Opnd::Reg(base),
            Opnd::Imm(f.static_addr as i64),
        )?;
        self.gen_field_access(MemRef::base_disp(base, 0), f.jt, f.is_volatile, put, NullCheck::Done)
    }

    fn gen_instance_field(&mut self, f: &FieldInfo, put: bool) -> CompileResult<()> {
        let value = if put { Some(self.vpop_locked()?) } else { None };
        let (obj, _lo) = self.vpop_locked()?;
        let nc = self.gen_check_null(&obj, Some(f.offset))?;
        let (r, _lr) = self.vreg(&obj)?;
        let m = MemRef::base_disp(r, f.offset);
        match value {
            Some((v, _lv)) => {
                self.gen_mem_store(m, f.jt, &v, nc)?;
                if f.is_volatile {
                    self.enc.fence()?;
                }
                Ok(())
            }
            None => {
                let v = self.gen_mem_load(m, f.jt, nc)?;
                self.vpush(v)
            }
        }
    }

    fn gen_field_access(
        &mut self,
        m: MemRef,
        jt: JType,
        volatile: bool,
        put: bool,
        nc: NullCheck,
    ) -> CompileResult<()> {
        if put {
            let (v, _lv) = self.vpop_locked()?;
            self.gen_mem_store(m, jt, &v, nc)?;
            if volatile {
                self.enc.fence()?;
            }
            Ok(())
        } else {
            let v = self.gen_mem_load(m, jt, nc)?;
            self.vpush(v)
        }
    }

    /// Field access through the offset or address the runtime resolves. Volatility is
    /// unknown at compile time, so stores are always fenced.
    fn gen_field_lazy(&mut self, cp: u16, jt: JType, is_static: bool, put: bool) -> CompileResult<()> {
        self.gen_call(
            Callee::Helper(Helper::ResolveField),
            &[
                (JType::I32, Val::imm_i32(cp as i32).into()),
                (JType::I32, Val::imm_i32(is_static as i32).into()),
            ],
            JType::I64,
            FRAME,
        )?;
        let _pin = self.rf.lock_one(Ar::RAX);
        if is_static {
            return self.gen_field_access(MemRef::base_disp(Ar::RAX, 0), jt, true, put, NullCheck::Done);
        }
        let value = if put { Some(self.vpop_locked()?) } else { None };
        let (obj, _lo) = self.vpop_locked()?;
        self.gen_check_null(&obj, None)?;
        let (r, _lr) = self.vreg(&obj)?;
        let m = MemRef::base_index(r, Ar::RAX, 1, 0);
        match value {
            Some((v, _lv)) => {
                self.gen_mem_store(m, jt, &v, NullCheck::Done)?;
                self.enc.fence()?;
                Ok(())
            }
            None => {
                let v = self.gen_mem_load(m, jt, NullCheck::Done)?;
                self.vpush(v)
            }
        }
    }

    /// Address of element `idx` of the array in `a`.
    fn elem_addr(&mut self, a: Ar, idx: &Val, jt: JType) -> CompileResult<(MemRef, Option<RegLock>)> {
        let scale = self.mem_size(jt).bytes() as u8;
        let base = self.obj.array_elems_offset;
        if let Some(i) = idx.imm_i32_value() {
            let disp = base as i64 + i as i64 * scale as i64;
            if let Ok(disp) = i32::try_from(disp) {
                return Ok((MemRef::base_disp(a, disp), None));
            }
        }
        // Checked indices are non-negative, so the zero-extended register is exact.
        let (r, lock) = self.vreg(idx)?;
        Ok((MemRef::base_index(a, r, scale, base), Some(lock)))
    }

    pub(super) fn gen_aload(&mut self, jt: JType) -> CompileResult<()> {
        let (idx, _li) = self.vpop_locked()?;
        let (arr, _la) = self.vpop_locked()?;
        let nc = self.gen_check_null(&arr, Some(self.obj.array_length_offset))?;
        let (a, _lr) = self.vreg(&arr)?;
        self.gen_check_bounds(a, &idx, nc)?;
        let (m, _lx) = self.elem_addr(a, &idx, jt)?;
        let v = self.gen_mem_load(m, jt, NullCheck::Done)?;
        self.vpush(v)
    }

    pub(super) fn gen_astore(&mut self, jt: JType) -> CompileResult<()> {
        if jt == JType::Ref {
            return self.gen_aastore();
        }
        let (v, _lv) = self.vpop_locked()?;
        let (idx, _li) = self.vpop_locked()?;
        let (arr, _la) = self.vpop_locked()?;
        let nc = self.gen_check_null(&arr, Some(self.obj.array_length_offset))?;
        let (a, _lr) = self.vreg(&arr)?;
        self.gen_check_bounds(a, &idx, nc)?;
        let (m, _lx) = self.elem_addr(a, &idx, jt)?;
        self.gen_mem_store(m, jt, &v, NullCheck::Done)
    }

    /// `aastore`: the store check runs with all three operands still on the stack.
    fn gen_aastore(&mut self) -> CompileResult<()> {
        self.spill_all()?;
        let v = self.vpeek(0)?;
        let idx = self.vpeek(1)?;
        let arr = self.vpeek(2)?;
        let nc = self.gen_check_null(&arr, Some(self.obj.array_length_offset))?;
        {
            let (a, _lr) = self.vreg(&arr)?;
            self.gen_check_bounds(a, &idx, nc)?;
        }
        if v.imm_bits() != Some(self.null_bits) {
            let arr = self.vpeek(2)?;
            self.gen_call(
                Callee::Helper(Helper::ArrayStoreCheck),
                &[(JType::Ref, arr.into()), (JType::Ref, v.into())],
                JType::Void,
                FRAME,
            )?;
        }
        let (v, _lv) = self.vpop_locked()?;
        let (idx, _li) = self.vpop_locked()?;
        let (arr, _la) = self.vpop_locked()?;
        let (a, _lr) = self.vreg(&arr)?;
        let (m, _lx) = self.elem_addr(a, &idx, JType::Ref)?;
        self.gen_mem_store(m, JType::Ref, &v, NullCheck::Done)
    }

    pub(super) fn gen_arraylength(&mut self) -> CompileResult<()> {
        let (arr, _la) = self.vpop_locked()?;
        let len_off = self.obj.array_length_offset;
        let nc = self.gen_check_null(&arr, Some(len_off))?;
        let (a, _lr) = self.vreg(&arr)?;
        let (dst, _ld) = self.valloc(JType::I32)?;
        self.mark_implicit(nc)?;
        self.enc.mov(
            OpSize::S32,
            Opnd::Reg(dst),
            Opnd::Mem(MemRef::base_disp(a, len_off)),
        )?;
        self.vpush(Val::reg(JType::I32, dst))
    }

    fn push_new(&mut self, v: Option<Val>) -> CompileResult<()> {
        let v = v.ok_or_else(|| self.inconsistent("allocation without result"))?;
        self.vpush(v.with_non_null(true))
    }

    pub(super) fn gen_new(&mut self, cp: u16) -> CompileResult<()> {
        let (class, size, _pin) = match self.vm.resolve_class(cp) {
            Some(c) => {
                self.class_init_check(c)?;
                let size = self.vm.instance_size(c) as i32;
                (Val::imm_i64(c.0 as i64), size, None)
            }
            None if self.vm.lazy_resolution() => {
                let (v, lock) = self.gen_resolve_class(cp, false)?;
                (v, 0, Some(lock))
            }
            None => {
                self.gen_linking_error(cp)?;
                return self.vpush(self.dummy_of(JType::Ref));
            }
        };
        let r = self.gen_call(
            Callee::Helper(Helper::NewObject),
            &[
                (JType::I64, class.into()),
                (JType::I32, Val::imm_i32(size).into()),
            ],
            JType::Ref,
            FRAME,
        )?;
        self.push_new(r)
    }

    pub(super) fn gen_newarray(&mut self, atype: u8) -> CompileResult<()> {
        let elem = JType::from_atype(atype)
            .ok_or_else(|| self.inconsistent(format!("bad newarray type {atype}")))?;
        let class = self.vm.primitive_array_class(elem);
        let (len, _ll) = self.vpop_locked()?;
        let r = self.gen_call(
            Callee::Helper(Helper::NewArray),
            &[
                (JType::I64, Val::imm_i64(class.0 as i64).into()),
                (JType::I32, len.into()),
            ],
            JType::Ref,
            FRAME,
        )?;
        self.push_new(r)
    }

    pub(super) fn gen_anewarray(&mut self, cp: u16) -> CompileResult<()> {
        let Some((class, _pin)) = self.class_operand(cp, true)? else {
            self.gen_pop(1)?;
            return self.vpush(self.dummy_of(JType::Ref));
        };
        let (len, _ll) = self.vpop_locked()?;
        let r = self.gen_call(
            Callee::Helper(Helper::NewArray),
            &[(JType::I64, class.into()), (JType::I32, len.into())],
            JType::Ref,
            FRAME,
        )?;
        self.push_new(r)
    }

    /// `multianewarray`: the dimension counts are passed in place, as the array of their
    /// own stack slots.
    pub(super) fn gen_multianewarray(&mut self, cp: u16, dims: usize) -> CompileResult<()> {
        if dims == 0 {
            return Err(self.inconsistent("multianewarray with no dimensions"));
        }
        let Some((class, _pin)) = self.class_operand(cp, false)? else {
            self.gen_pop(dims)?;
            return self.vpush(self.dummy_of(JType::Ref));
        };
        for d in 0..dims {
            self.vswap(d)?;
        }
        let base = self
            .frame
            .depth()
            .checked_sub(dims)
            .ok_or(CompileError::StackUnderflow { pc: self.pc })?;
        let counts = self.layout.stack_slot(base);
        let r = self.gen_call(
            Callee::Helper(Helper::NewMultiArray),
            &[
                (JType::I64, class.into()),
                (JType::I32, Val::imm_i32(dims as i32).into()),
                (JType::I64, CallArg::Lea(counts)),
            ],
            JType::Ref,
            FRAME,
        )?;
        self.gen_pop(dims)?;
        self.push_new(r)
    }

    pub(super) fn gen_checkcast(&mut self, cp: u16) -> CompileResult<()> {
        if self.vpeek(0)?.imm_bits() == Some(self.null_bits) {
            return Ok(());
        }
        let Some((class, _pin)) = self.class_operand(cp, false)? else {
            return Ok(());
        };
        let obj = self.vpeek(0)?;
        self.gen_call(
            Callee::Helper(Helper::CheckCast),
            &[(JType::Ref, obj.into()), (JType::I64, class.into())],
            JType::Void,
            FRAME,
        )?;
        Ok(())
    }

    pub(super) fn gen_instanceof(&mut self, cp: u16) -> CompileResult<()> {
        if self.vpeek(0)?.imm_bits() == Some(self.null_bits) {
            self.gen_pop(1)?;
            return self.vpush(Val::imm_i32(0));
        }
        let Some((class, _pin)) = self.class_operand(cp, false)? else {
            self.gen_pop(1)?;
            return self.vpush(Val::imm_i32(0));
        };
        let obj = self.vpeek(0)?;
        let r = self
            .gen_call(
                Callee::Helper(Helper::InstanceOf),
                &[(JType::Ref, obj.into()), (JType::I64, class.into())],
                JType::I32,
                FRAME,
            )?
            .ok_or_else(|| self.inconsistent("instanceof without result"))?;
        let _lr = self.rf.lock(r.regs());
        self.gen_pop(1)?;
        self.vpush(r)
    }

    pub(super) fn gen_monitor(&mut self, enter: bool) -> CompileResult<()> {
        self.spill_all()?;
        let obj = self.vpeek(0)?;
        self.gen_check_null(&obj, None)?;
        let obj = self.vpeek(0)?;
        let helper = if enter {
            Helper::MonitorEnter
        } else {
            Helper::MonitorExit
        };
        self.gen_call(
            Callee::Helper(helper),
            &[(JType::Ref, obj.into())],
            JType::Void,
            FRAME,
        )?;
        self.gen_pop(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediates_truncate_to_store_width() {
        assert_eq!(imm_for(OpSize::S8, 0x1ff), -1);
        assert_eq!(imm_for(OpSize::S16, 0x1_8000), -0x8000);
        assert_eq!(imm_for(OpSize::S32, f32::to_bits(-1.0) as i64), -0x4080_0000);
        assert_eq!(imm_for(OpSize::S64, i64::MIN), i64::MIN);
    }
}
