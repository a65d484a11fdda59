// This module generates the four invocation bytecodes. Arguments stay on the abstract
// stack until every call that may need them as GC roots has been made: resolution helpers
// and the interface vtable lookup run with the arguments still in their stack slots, and
// only the final dispatch pops them. Operands are spilled first, so the receiver null check
// that follows reads a settled frame. Static and special calls go through the callee's
// entry slot, virtual calls through the receiver's vtable, interface calls through the
// vtable returned by the runtime for the interface class. In lazy resolution mode the
// runtime resolves the target and returns its code address, which is then called directly.
// A target that cannot be resolved turns into a linking-error throw.

//! Method invocation.

use crate::core::error::{CompileError, CompileResult};
use crate::core::encoder::Encoder;
use crate::core::jtype::JType;
use crate::core::method::{Helper, InvokeKind};
use crate::core::register_file::Ar;
use crate::core::val::{MemRef, Val};

use super::cg_call::{CallArg, Callee};
use super::compiler::Compiler;
use super::gcmap::GcMode;

fn kind_code(kind: InvokeKind) -> i32 {
    match kind {
        InvokeKind::Virtual => 0,
        InvokeKind::Special => 1,
        InvokeKind::Static => 2,
        InvokeKind::Interface => 3,
    }
}

/// Argument types as passed, receiver first.
fn passed_types(kind: InvokeKind, params: &[JType]) -> Vec<JType> {
    let mut types = Vec::with_capacity(params.len() + 1);
    if kind != InvokeKind::Static {
        types.push(JType::Ref);
    }
    types.extend(params.iter().map(|t| t.stack_type()));
    types
}

impl<E: Encoder> Compiler<'_, '_, E> {
    /// Placeholder pushed where an operation that always throws would leave a value.
    pub(super) fn dummy_of(&self, jt: JType) -> Val {
        match jt {
            JType::Ref => Val::imm(JType::Ref, self.null_bits),
            _ => Val::imm(jt.stack_type(), 0),
        }
    }

    /// The outgoing arguments as they sit on the stack, first argument first.
    fn peek_args(&self, types: &[JType]) -> CompileResult<Vec<(JType, CallArg)>> {
        let mut args = Vec::with_capacity(types.len());
        let mut depth: usize = types.iter().map(|t| t.slots()).sum();
        for &jt in types {
            depth -= jt.slots();
            let v = self.vpeek(depth)?;
            args.push((jt, CallArg::Val(v)));
        }
        Ok(args)
    }

    pub(super) fn gen_invoke(&mut self, cp: u16, kind: InvokeKind) -> CompileResult<()> {
        let (params, ret) = self
            .vm
            .method_signature(cp)
            .ok_or(CompileError::BadConstantPool { pc: self.pc, cp })?;
        let ret = ret.stack_type();
        let types = passed_types(kind, &params);
        let slots: usize = types.iter().map(|t| t.slots()).sum();

        if self.vm.lazy_resolution() {
            return self.gen_invoke_lazy(cp, kind, &types, slots, ret);
        }

        let mut kind = kind;
        let resolved = self.vm.resolve_method(kind, cp).filter(|m| {
            kind != InvokeKind::Interface
                || m.declaring_is_interface
                || self.opts.lenient_interface_dispatch
        });
        let Some(m) = resolved else {
            self.gen_linking_error(cp)?;
            self.gen_pop(slots)?;
            if ret != JType::Void {
                self.vpush(self.dummy_of(ret))?;
            }
            return Ok(());
        };
        if kind == InvokeKind::Interface && !m.declaring_is_interface {
            log::debug!(
                "jet::cg: invokeinterface at pc {} dispatched as virtual",
                self.pc
            );
            kind = InvokeKind::Virtual;
        }

        self.spill_all()?;
        if kind != InvokeKind::Static {
            let recv = self.vpeek(slots - 1)?;
            self.gen_check_null(&recv, None)?;
        }
        if kind == InvokeKind::Static
            && !m.class_initialized
            && !self.vm.class_is_initialized(m.declaring_class)
        {
            self.gen_call(
                Callee::Helper(Helper::ClassInit),
                &[(JType::I64, Val::imm_i64(m.declaring_class.0 as i64).into())],
                JType::Void,
                GcMode::Frame { retval_ref: false },
            )?;
        }

        let callee = match kind {
            InvokeKind::Static | InvokeKind::Special => Callee::Slot(m.entry_slot),
            InvokeKind::Virtual => Callee::Virtual {
                vt_off: self.obj.vtable_offset,
                off: m.vtable_offset,
                base: self.obj.vtable_base,
            },
            InvokeKind::Interface => {
                let recv = self.vpeek(slots - 1)?;
                self.gen_call(
                    Callee::Helper(Helper::InterfaceVtable),
                    &[
                        (JType::Ref, recv.into()),
                        (JType::I64, Val::imm_i64(m.declaring_class.0 as i64).into()),
                    ],
                    JType::I64,
                    GcMode::Frame { retval_ref: false },
                )?;
                Callee::Mem(MemRef::base_disp(Ar::RAX, m.vtable_offset))
            }
        };
        // The vtable returned in rax must survive the argument setup.
        let _pin = self.rf.lock_one(Ar::RAX);
        self.gen_dispatch(callee, &types, slots, ret)
    }

    fn gen_invoke_lazy(
        &mut self,
        cp: u16,
        kind: InvokeKind,
        types: &[JType],
        slots: usize,
        ret: JType,
    ) -> CompileResult<()> {
        self.spill_all()?;
        let recv = if kind == InvokeKind::Static {
            Val::imm(JType::Ref, self.null_bits)
        } else {
            let recv = self.vpeek(slots - 1)?;
            self.gen_check_null(&recv, None)?;
            recv
        };
        self.gen_call(
            Callee::Helper(Helper::ResolveMethod),
            &[
                (JType::I32, Val::imm_i32(kind_code(kind)).into()),
                (JType::I32, Val::imm_i32(cp as i32).into()),
                (JType::Ref, recv.into()),
            ],
            JType::I64,
            GcMode::Frame { retval_ref: false },
        )?;
        let _pin = self.rf.lock_one(Ar::RAX);
        self.gen_dispatch(Callee::Reg(Ar::RAX), types, slots, ret)
    }

    /// Final call: pops the arguments and pushes the result.
    fn gen_dispatch(
        &mut self,
        callee: Callee,
        types: &[JType],
        slots: usize,
        ret: JType,
    ) -> CompileResult<()> {
        let args = self.peek_args(types)?;
        self.gen_pop(slots)?;
        let result = self.gen_call(callee, &args, ret, GcMode::Frame { retval_ref: false })?;
        if let Some(v) = result {
            self.vpush(v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_types() {
        assert_eq!(
            passed_types(InvokeKind::Virtual, &[JType::I64, JType::Bool]),
            vec![JType::Ref, JType::I64, JType::I32]
        );
        assert_eq!(passed_types(InvokeKind::Static, &[]), Vec::<JType>::new());
        assert_eq!(kind_code(InvokeKind::Interface), 3);
    }
}
