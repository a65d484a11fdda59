// This module implements the calling convention shared by compiled methods and runtime
// helpers on x86-64. It follows the System V AMD64 ABI: integer, reference and long
// arguments go in RDI, RSI, RDX, RCX, R8, R9 (first 6), float and double arguments in
// XMM0-XMM7 (first 8), the rest on the stack in 8-byte slots in argument order, and the
// outgoing area is padded to keep the stack 16-byte aligned at the call instruction. The
// caller pops. Results come back in RAX or XMM0. CallSig is the per-signature
// instantiation: it records, for an ordered list of JVM argument types and a return type,
// where each argument lives and how much stack the call consumes. SigCache memoizes
// signatures per method compilation since most helper signatures repeat.

//! System V x86-64 calling convention for managed calls and helpers.

use crate::core::jtype::JType;
use crate::core::register_file::{Ar, RegBitSet};
use hashbrown::HashMap;
use std::rc::Rc;

/// Stack alignment required at call sites.
pub const STACK_ALIGN: u32 = 16;

/// Bytes per stack argument slot.
pub const STACK_SLOT: u32 = 8;

/// GP argument registers in order.
pub const GP_ARG_REGS: [Ar; 6] = [Ar::RDI, Ar::RSI, Ar::RDX, Ar::RCX, Ar::R8, Ar::R9];

/// Number of XMM argument registers (`xmm0..xmm7`).
pub const FP_ARG_COUNT: u8 = 8;

/// Where one argument is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    Reg(Ar),
    /// Byte offset from the stack pointer at the call instruction.
    Stack(u32),
}

/// Calling convention instantiated for one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSig {
    args: Vec<JType>,
    ret: JType,
    locs: Vec<ArgLoc>,
    stack_size: u32,
}

impl CallSig {
    pub fn new(args: &[JType], ret: JType) -> Self {
        let mut gp = 0usize;
        let mut fp = 0u8;
        let mut stack = 0u32;
        let mut locs = Vec::with_capacity(args.len());
        for &jt in args {
            let loc = if jt.is_f() {
                if fp < FP_ARG_COUNT {
                    fp += 1;
                    ArgLoc::Reg(Ar::xmm(fp - 1))
                } else {
                    stack += STACK_SLOT;
                    ArgLoc::Stack(stack - STACK_SLOT)
                }
            } else if gp < GP_ARG_REGS.len() {
                gp += 1;
                ArgLoc::Reg(GP_ARG_REGS[gp - 1])
            } else {
                stack += STACK_SLOT;
                ArgLoc::Stack(stack - STACK_SLOT)
            };
            locs.push(loc);
        }
        let stack_size = (stack + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        Self {
            args: args.to_vec(),
            ret,
            locs,
            stack_size,
        }
    }

    pub fn args(&self) -> &[JType] {
        &self.args
    }

    pub fn ret(&self) -> JType {
        self.ret
    }

    pub fn count(&self) -> usize {
        self.args.len()
    }

    pub fn loc(&self, i: usize) -> Option<ArgLoc> {
        self.locs.get(i).copied()
    }

    pub fn locs(&self) -> &[ArgLoc] {
        &self.locs
    }

    /// Outgoing stack bytes, already aligned.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// Caller pops the argument area.
    pub fn callee_pops(&self) -> bool {
        false
    }

    pub fn ret_reg(&self) -> Option<Ar> {
        match self.ret {
            JType::Void => None,
            t if t.is_f() => Some(Ar::XMM0),
            _ => Some(Ar::RAX),
        }
    }

    /// Registers carrying arguments.
    pub fn arg_regs(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        for loc in &self.locs {
            if let ArgLoc::Reg(r) = loc {
                set.set(*r);
            }
        }
        set
    }
}

/// Per-compilation cache of call signatures.
#[derive(Debug, Default)]
pub struct SigCache {
    sigs: HashMap<(Vec<JType>, JType), Rc<CallSig>>,
}

impl SigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, args: &[JType], ret: JType) -> Rc<CallSig> {
        let key = (args.to_vec(), ret);
        Rc::clone(
            self.sigs
                .entry(key)
                .or_insert_with(|| Rc::new(CallSig::new(args, ret))),
        )
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_args() {
        let sig = CallSig::new(&[JType::Ref, JType::F64, JType::I32, JType::F32], JType::F64);
        assert_eq!(sig.loc(0), Some(ArgLoc::Reg(Ar::RDI)));
        assert_eq!(sig.loc(1), Some(ArgLoc::Reg(Ar::XMM0)));
        assert_eq!(sig.loc(2), Some(ArgLoc::Reg(Ar::RSI)));
        assert_eq!(sig.loc(3), Some(ArgLoc::Reg(Ar::xmm(1))));
        assert_eq!(sig.stack_size(), 0);
        assert_eq!(sig.ret_reg(), Some(Ar::XMM0));
        assert!(!sig.callee_pops());
    }

    #[test]
    fn test_stack_overflow_args_aligned() {
        let args = [JType::I64; 7];
        let sig = CallSig::new(&args, JType::Void);
        assert_eq!(sig.loc(5), Some(ArgLoc::Reg(Ar::R9)));
        assert_eq!(sig.loc(6), Some(ArgLoc::Stack(0)));
        assert_eq!(sig.stack_size(), 16);
        assert_eq!(sig.ret_reg(), None);

        let eight = CallSig::new(&[JType::I32; 8], JType::I32);
        assert_eq!(eight.loc(7), Some(ArgLoc::Stack(8)));
        assert_eq!(eight.stack_size(), 16);
        assert_eq!(eight.arg_regs().count(), 6);
    }

    #[test]
    fn test_cache_shares_signatures() {
        let mut cache = SigCache::new();
        let a = cache.get(&[JType::I32, JType::I32], JType::I32);
        let b = cache.get(&[JType::I32, JType::I32], JType::I32);
        assert!(Rc::ptr_eq(&a, &b));
        cache.get(&[JType::Ref], JType::Void);
        assert_eq!(cache.len(), 2);
    }
}
