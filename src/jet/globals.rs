// This module decides which local variables live in callee-save registers for the whole
// method instead of in their frame homes. Every local access is classified by the type
// class the instruction implies; a local accessed under two classes, accessed as a float,
// or overlapped by the upper half of a wide local is not a candidate. Accesses inside a
// loop (between a backward branch and its target) weigh more than straight-line ones,
// incoming arguments count once, and the best-scoring candidates receive the global
// registers in order. Reference locals are excluded when the method uses subroutines,
// since a local written by astore may then hold a return address.

//! Assignment of hot locals to callee-save registers.

use crate::core::jtype::JType;
use crate::core::method::MethodInfo;
use crate::core::options::CompileOptions;
use crate::core::register_file::{Ar, RegBitSet};
use crate::x64::GLOBAL_GP;

use super::bbs::BlockMap;

/// Weight of an access inside a loop body.
const LOOP_WEIGHT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Unused,
    Typed(JType),
    Conflict,
}

impl Class {
    fn merge(self, jt: JType) -> Class {
        match self {
            Class::Unused => Class::Typed(jt),
            Class::Typed(prev) if prev == jt => self,
            _ => Class::Conflict,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalAssignment {
    regs: Vec<Option<Ar>>,
    classes: Vec<JType>,
}

impl GlobalAssignment {
    /// No local in a register.
    pub fn none(num_locals: usize) -> Self {
        Self {
            regs: vec![None; num_locals],
            classes: vec![JType::Void; num_locals],
        }
    }

    pub fn assign(method: &MethodInfo, bbs: &BlockMap<'_>, opts: &CompileOptions) -> Self {
        let n = method.max_locals as usize;
        let mut result = Self::none(n);
        if !opts.global_regs || n == 0 {
            return result;
        }

        let mut class = vec![Class::Unused; n];
        let mut score = vec![0u32; n];

        let mut idx = 0;
        for jt in method.arg_types() {
            if idx < n {
                class[idx] = class[idx].merge(jt);
                score[idx] += 1;
            }
            if jt.is_wide() && idx + 1 < n {
                class[idx + 1] = Class::Conflict;
            }
            idx += jt.slots();
        }

        let loops: Vec<(u32, u32)> = bbs
            .insts()
            .iter()
            .flat_map(|inst| {
                inst.targets()
                    .into_iter()
                    .filter(move |&t| t <= inst.pc)
                    .map(move |t| (t, inst.pc))
            })
            .collect();

        for inst in bbs.insts() {
            let Some((i, jt, _)) = inst.local_access() else {
                continue;
            };
            if i >= n {
                continue;
            }
            class[i] = class[i].merge(jt);
            if jt.is_wide() && i + 1 < n {
                class[i + 1] = Class::Conflict;
            }
            let in_loop = loops.iter().any(|&(lo, hi)| lo <= inst.pc && inst.pc <= hi);
            score[i] += if in_loop { LOOP_WEIGHT } else { 1 };
        }

        let mut candidates: Vec<(usize, JType, u32)> = class
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match *c {
                Class::Typed(jt @ (JType::I32 | JType::I64)) => Some((i, jt, score[i])),
                Class::Typed(JType::Ref) if !bbs.has_jsr() => Some((i, JType::Ref, score[i])),
                _ => None,
            })
            .collect();
        candidates.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

        for (&(i, jt, _), &reg) in candidates.iter().zip(GLOBAL_GP.iter()) {
            result.regs[i] = Some(reg);
            result.classes[i] = jt;
        }
        log::debug!(
            "jet::globals: {} -> {:?}",
            method.full_name(),
            result.bindings()
        );
        result
    }

    pub fn reg_of(&self, idx: usize) -> Option<Ar> {
        self.regs.get(idx).copied().flatten()
    }

    /// Type class of a register-homed local; `Void` for memory-homed ones.
    pub fn class_of(&self, idx: usize) -> JType {
        self.classes.get(idx).copied().unwrap_or(JType::Void)
    }

    /// `(local, hw register)` pairs for the info block.
    pub fn bindings(&self) -> Vec<(u16, u8)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (i as u16, r.hw())))
            .collect()
    }

    pub fn used(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        for r in self.regs.iter().flatten() {
            set.set(*r);
        }
        set
    }

    /// Hardware mask of the registers holding reference locals.
    pub fn ref_mask(&self) -> u32 {
        self.regs
            .iter()
            .zip(&self.classes)
            .filter(|(_, jt)| jt.is_ref())
            .filter_map(|(r, _)| r.map(|r| 1u32 << r.hw()))
            .fold(0, |a, b| a | b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecode::*;
    use crate::core::method::{ClassHandle, MethodFlags, MethodHandle};
    use bumpalo::Bump;

    fn method(desc: &str, locals: u16, code: Vec<u8>) -> MethodInfo {
        MethodInfo {
            class_name: "T".into(),
            name: "m".into(),
            descriptor: desc.into(),
            flags: MethodFlags {
                is_static: true,
                is_synchronized: false,
            },
            handle: MethodHandle(1),
            class: ClassHandle(1),
            max_stack: 4,
            max_locals: locals,
            code,
            handlers: vec![],
        }
    }

    fn assign(m: &MethodInfo, opts: &CompileOptions) -> GlobalAssignment {
        let arena = Bump::new();
        let bbs = BlockMap::build(&m.code, &m.handlers, &arena).unwrap();
        GlobalAssignment::assign(m, &bbs, opts)
    }

    #[test]
    fn test_loop_counter_gets_first_register() {
        // static int f(int n): 0: iconst_0; 1: istore_1; 2: iinc 1 1; 5: iload_1; 6: iload_0;
        // 7: if_icmplt -5 (2); 10: iload_1; 11: ireturn
        let code = vec![
            ICONST_0, ISTORE_0 + 1, IINC, 1, 1, ILOAD_0 + 1, ILOAD_0, IF_ICMPLT, 0xff, 0xfb,
            ILOAD_0 + 1, IRETURN,
        ];
        let m = method("(I)I", 2, code);
        let g = assign(&m, &CompileOptions::default());
        assert_eq!(g.reg_of(1), Some(Ar::RBX));
        assert_eq!(g.reg_of(0), Some(Ar::R12));
        assert_eq!(g.class_of(1), JType::I32);
        assert_eq!(g.bindings(), vec![(0, Ar::R12.hw()), (1, Ar::RBX.hw())]);
        assert_eq!(g.ref_mask(), 0);
    }

    #[test]
    fn test_conflicts_and_floats_stay_in_memory() {
        // 0: fload_0; 1: fstore_1; 2: iconst_0; 3: istore_2; 4: aconst_null; 5: astore_2; 6: return
        let code = vec![
            FLOAD_0_TEST, FSTORE_1_TEST, ICONST_0, ISTORE_0 + 2, ACONST_NULL, ASTORE_0 + 2, RETURN,
        ];
        let m = method("(F)V", 3, code);
        let g = assign(&m, &CompileOptions::default());
        assert_eq!(g.used(), RegBitSet::new());
    }

    #[test]
    fn test_disabled_by_option() {
        let m = method("(I)V", 1, vec![ILOAD_0, POP, RETURN]);
        let opts = CompileOptions {
            global_regs: false,
            ..CompileOptions::default()
        };
        assert_eq!(assign(&m, &opts).reg_of(0), None);
    }

    const FLOAD_0_TEST: u8 = 0x22;
    const FSTORE_1_TEST: u8 = 0x44;
}
