// This module defines the abstract value model of the code generator. A Val is one JVM
// operand-stack slot or local variable: a type tag, a storage kind (immediate, register or
// memory) and attribute flags. The storage kind is a closed enum so every consumer matches
// on it exhaustively instead of probing is_reg/is_mem/is_imm flags. Opnd is the
// instruction-operand view of a Val handed to the Encoder; MemRef is a base + index*scale +
// displacement address. Immediates may instead name the address of a VM-owned constant
// slot (string and class literals), in which case the value is loaded from that address.

//! Abstract values (`Val`) and instruction operands (`Opnd`).

use super::jtype::JType;
use super::register_file::{Ar, RegBitSet};
use std::fmt;

/// Memory address `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub base: Option<Ar>,
    pub index: Option<Ar>,
    pub scale: u8,
    pub disp: i32,
}

impl MemRef {
    pub fn base_disp(base: Ar, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn base_index(base: Ar, index: Ar, scale: u8, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }

    /// Registers the address depends on.
    pub fn regs(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        if let Some(b) = self.base {
            set.set(b);
        }
        if let Some(i) = self.index {
            set.set(i);
        }
        set
    }

    pub fn uses(&self, ar: Ar) -> bool {
        self.base == Some(ar) || self.index == Some(ar)
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        if let Some(b) = self.base {
            write!(f, "{b:?}")?;
            first = false;
        }
        if let Some(i) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{i:?}*{}", self.scale)?;
            first = false;
        }
        if self.disp != 0 || first {
            if self.disp < 0 {
                write!(f, "-{:#x}", -(self.disp as i64))?;
            } else {
                if !first {
                    f.write_str("+")?;
                }
                write!(f, "{:#x}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opnd {
    Reg(Ar),
    Mem(MemRef),
    Imm(i64),
}

impl Opnd {
    pub fn reg(&self) -> Option<Ar> {
        match self {
            Opnd::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn regs(&self) -> RegBitSet {
        match self {
            Opnd::Reg(r) => RegBitSet::of(&[*r]),
            Opnd::Mem(m) => m.regs(),
            Opnd::Imm(_) => RegBitSet::new(),
        }
    }
}

impl From<Ar> for Opnd {
    fn from(r: Ar) -> Self {
        Opnd::Reg(r)
    }
}

impl From<MemRef> for Opnd {
    fn from(m: MemRef) -> Self {
        Opnd::Mem(m)
    }
}

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValKind {
    /// Compile-time constant. `caddr` names a constant slot the value must be
    /// loaded from; `bits` then holds nothing meaningful.
    Imm { bits: i64, caddr: Option<u64> },
    Reg(Ar),
    Mem(MemRef),
}

/// Attribute flags of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValAttrs {
    /// Known not to be null.
    pub non_null: bool,
    /// The frame's GC bitmap already reflects this local's reference-ness.
    pub gc_marked: bool,
}

/// One abstract operand-stack slot or local variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Val {
    pub jt: JType,
    pub kind: ValKind,
    pub attrs: ValAttrs,
}

impl Val {
    pub fn imm(jt: JType, bits: i64) -> Self {
        Self {
            jt,
            kind: ValKind::Imm { bits, caddr: None },
            attrs: ValAttrs::default(),
        }
    }

    pub fn imm_i32(v: i32) -> Self {
        Self::imm(JType::I32, v as i64)
    }

    pub fn imm_i64(v: i64) -> Self {
        Self::imm(JType::I64, v)
    }

    pub fn imm_f32(v: f32) -> Self {
        Self::imm(JType::F32, v.to_bits() as i64)
    }

    pub fn imm_f64(v: f64) -> Self {
        Self::imm(JType::F64, v.to_bits() as i64)
    }

    /// Value held in a VM constant slot at `addr`.
    pub fn constant_slot(jt: JType, addr: u64) -> Self {
        Self {
            jt,
            kind: ValKind::Imm {
                bits: 0,
                caddr: Some(addr),
            },
            attrs: ValAttrs {
                non_null: true,
                gc_marked: false,
            },
        }
    }

    pub fn reg(jt: JType, ar: Ar) -> Self {
        Self {
            jt,
            kind: ValKind::Reg(ar),
            attrs: ValAttrs::default(),
        }
    }

    pub fn mem(jt: JType, m: MemRef) -> Self {
        Self {
            jt,
            kind: ValKind::Mem(m),
            attrs: ValAttrs::default(),
        }
    }

    /// Void filler occupying the second slot of a wide value on 64-bit targets.
    pub fn placeholder() -> Self {
        Self::imm(JType::Void, 0)
    }

    pub fn is_placeholder(&self) -> bool {
        self.jt == JType::Void
    }

    pub fn with_non_null(mut self, non_null: bool) -> Self {
        self.attrs.non_null = non_null;
        self
    }

    /// Plain immediate bits, if the value is a literal.
    pub fn imm_bits(&self) -> Option<i64> {
        match self.kind {
            ValKind::Imm { bits, caddr: None } => Some(bits),
            _ => None,
        }
    }

    pub fn imm_i32_value(&self) -> Option<i32> {
        self.imm_bits().map(|b| b as i32)
    }

    pub fn reg_ar(&self) -> Option<Ar> {
        match self.kind {
            ValKind::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Registers this value depends on.
    pub fn regs(&self) -> RegBitSet {
        match self.kind {
            ValKind::Reg(r) => RegBitSet::of(&[r]),
            ValKind::Mem(m) => m.regs(),
            ValKind::Imm { .. } => RegBitSet::new(),
        }
    }

    pub fn uses(&self, ar: Ar) -> bool {
        match self.kind {
            ValKind::Reg(r) => r == ar,
            ValKind::Mem(m) => m.uses(ar),
            ValKind::Imm { .. } => false,
        }
    }

    /// Whether two values denote the same storage (and therefore the same value).
    pub fn same_location(&self, other: &Val) -> bool {
        match (self.kind, other.kind) {
            (ValKind::Reg(a), ValKind::Reg(b)) => a == b,
            (ValKind::Mem(a), ValKind::Mem(b)) => a == b,
            _ => false,
        }
    }

    /// Operand view. Constant-slot immediates have no direct operand form.
    pub fn as_opnd(&self) -> Option<Opnd> {
        match self.kind {
            ValKind::Reg(r) => Some(Opnd::Reg(r)),
            ValKind::Mem(m) => Some(Opnd::Mem(m)),
            ValKind::Imm { bits, caddr: None } => Some(Opnd::Imm(bits)),
            ValKind::Imm { caddr: Some(_), .. } => None,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValKind::Imm {
                caddr: Some(addr), ..
            } => write!(f, "{}:[{:#x}]", self.jt, addr)?,
            ValKind::Imm { bits, .. } => write!(f, "{}:#{}", self.jt, bits)?,
            ValKind::Reg(r) => write!(f, "{}:{:?}", self.jt, r)?,
            ValKind::Mem(m) => write!(f, "{}:{}", self.jt, m)?,
        }
        if self.attrs.non_null {
            f.write_str("!")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_regs() {
        let v = Val::mem(JType::I32, MemRef::base_index(Ar::RCX, Ar::RDX, 4, 16));
        assert!(v.uses(Ar::RCX));
        assert!(v.uses(Ar::RDX));
        assert!(!v.uses(Ar::RAX));
        assert_eq!(v.regs().count(), 2);

        let r = Val::reg(JType::Ref, Ar::RSI);
        assert_eq!(r.reg_ar(), Some(Ar::RSI));
        assert_eq!(r.as_opnd(), Some(Opnd::Reg(Ar::RSI)));
    }

    #[test]
    fn test_immediates() {
        assert_eq!(Val::imm_i32(-5).imm_i32_value(), Some(-5));
        assert_eq!(Val::imm_f64(1.5).imm_bits(), Some(1.5f64.to_bits() as i64));
        let s = Val::constant_slot(JType::Ref, 0x1000);
        assert_eq!(s.imm_bits(), None);
        assert_eq!(s.as_opnd(), None);
        assert!(s.attrs.non_null);
        assert!(Val::placeholder().is_placeholder());
    }

    #[test]
    fn test_same_location() {
        let a = Val::mem(JType::I32, MemRef::base_disp(Ar::RBP, -8));
        let b = Val::mem(JType::Ref, MemRef::base_disp(Ar::RBP, -8));
        assert!(a.same_location(&b));
        assert!(!a.same_location(&Val::imm_i32(0)));
    }

    #[test]
    fn test_display() {
        let v = Val::mem(JType::I64, MemRef::base_disp(Ar::RBP, -0x30));
        assert_eq!(v.to_string(), "i64:[rbp-0x30]");
        let r = Val::reg(JType::Ref, Ar::RBX).with_non_null(true);
        assert_eq!(r.to_string(), "jobj:rbx!");
    }
}
