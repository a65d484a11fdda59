// This module defines the instruction-emission interface the code generator is written
// against. The Encoder trait covers the capability set the one-pass generator needs:
// moves (with sign/zero extension), integer ALU and shift operations, multiply/divide,
// SSE scalar float moves and arithmetic, GP<->XMM transfers, bit set/reset on frame memory,
// calls, returns, stack push/pop, and branches. Branches are emitted with a 32-bit relative
// displacement and return a PatchRef naming the displacement field, so forward targets can
// be resolved once the target's native offset is known; RIP-relative address loads use the
// same mechanism. Raw 64-bit data words (switch tables) can be appended and patched. One
// concrete backend exists per instruction set; the x86-64 backend lives in crate::x64.

//! Instruction emission interface with a patch-list for forward references.

use super::register_file::Ar;
use super::val::{MemRef, Opnd};
use crate::x64::encoder::EncodingError;

pub type EncResult<T> = Result<T, EncodingError>;

/// Operand size of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    S8,
    S16,
    S32,
    S64,
}

impl OpSize {
    pub fn bytes(self) -> u32 {
        match self {
            OpSize::S8 => 1,
            OpSize::S16 => 2,
            OpSize::S32 => 4,
            OpSize::S64 => 8,
        }
    }
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned below.
    B,
    /// Unsigned above or equal.
    Ae,
    /// Unsigned above.
    A,
    /// Unsigned below or equal.
    Be,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::A => Cond::Be,
            Cond::Be => Cond::A,
        }
    }

    /// Condition that holds after the comparison operands are exchanged.
    pub fn flip(self) -> Cond {
        match self {
            Cond::Lt => Cond::Gt,
            Cond::Gt => Cond::Lt,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            Cond::B => Cond::A,
            Cond::A => Cond::B,
            Cond::Be => Cond::Ae,
            Cond::Ae => Cond::Be,
            c => c,
        }
    }
}

/// Two-operand integer ALU instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    Sar,
    Shr,
}

/// Scalar SSE arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Position of a 32-bit displacement field awaiting its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchRef(pub u32);

/// Call destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Absolute address, reached through the encoder's scratch register.
    Abs(u64),
    Reg(Ar),
    Mem(MemRef),
}

/// Native instruction emission for one method body.
pub trait Encoder {
    /// Offset of the next instruction.
    fn ip(&self) -> u32;

    fn code(&self) -> &[u8];

    fn take_code(&mut self) -> Vec<u8>;

    /// Register the backend reserves for address materialization and cycle breaking.
    fn scratch_gp(&self) -> Ar;

    fn scratch_fp(&self) -> Ar;

    /// Integer move between any two operands except memory to memory.
    /// Immediates wider than 32 bits are only accepted with a register destination.
    fn mov(&mut self, sz: OpSize, dst: Opnd, src: Opnd) -> EncResult<()>;

    /// Sign- or zero-extending load of a `from`-sized value into a full register.
    fn movx(&mut self, dst: Ar, src: Opnd, from: OpSize, signed: bool) -> EncResult<()>;

    fn lea(&mut self, dst: Ar, addr: MemRef) -> EncResult<()>;

    fn alu(&mut self, sz: OpSize, op: AluOp, dst: Opnd, src: Opnd) -> EncResult<()>;

    fn test(&mut self, sz: OpSize, a: Opnd, b: Opnd) -> EncResult<()>;

    /// `dst *= src`; an immediate source uses the three-operand form.
    fn imul(&mut self, sz: OpSize, dst: Ar, src: Opnd) -> EncResult<()>;

    fn neg(&mut self, sz: OpSize, dst: Opnd) -> EncResult<()>;

    /// Shift by an immediate count, or by `cl` when `count` is `None`.
    fn shift(&mut self, sz: OpSize, op: ShiftOp, dst: Opnd, count: Option<u8>) -> EncResult<()>;

    /// Sign-extend the accumulator into the data register (`cdq`/`cqo`).
    fn sign_extend_acc(&mut self, sz: OpSize) -> EncResult<()>;

    fn idiv(&mut self, sz: OpSize, divisor: Opnd) -> EncResult<()>;

    /// Set (`bts`) or clear (`btr`) bit `bit` of a 64-bit word.
    fn bit(&mut self, dst: Opnd, bit: u8, set: bool) -> EncResult<()>;

    /// Complement bit `bit` of a register (`btc`).
    fn bit_flip(&mut self, sz: OpSize, dst: Ar, bit: u8) -> EncResult<()>;

    /// Scalar float/double move between XMM registers and memory.
    fn fmov(&mut self, dbl: bool, dst: Opnd, src: Opnd) -> EncResult<()>;

    fn fop(&mut self, dbl: bool, op: FpOp, dst: Ar, src: Opnd) -> EncResult<()>;

    /// Raw bit transfer between a GP and an XMM register, in either direction.
    fn fbits(&mut self, wide: bool, dst: Ar, src: Ar) -> EncResult<()>;

    fn push(&mut self, reg: Ar) -> EncResult<()>;

    fn pop(&mut self, reg: Ar) -> EncResult<()>;

    /// Emit a call; returns the offset of the return address.
    fn call(&mut self, target: CallTarget) -> EncResult<u32>;

    fn ret(&mut self, pop_bytes: u16) -> EncResult<()>;

    /// Unconditional jump with an unresolved displacement.
    fn jmp(&mut self) -> EncResult<PatchRef>;

    /// Conditional jump with an unresolved displacement.
    fn jcc(&mut self, cond: Cond) -> EncResult<PatchRef>;

    fn jmp_indirect(&mut self, target: Opnd) -> EncResult<()>;

    /// `lea dst, [rip + ?]` with an unresolved displacement.
    fn lea_rip(&mut self, dst: Ar) -> EncResult<PatchRef>;

    /// Point a displacement field at `target`.
    fn patch(&mut self, at: PatchRef, target: u32) -> EncResult<()>;

    /// Append a 64-bit little-endian data word; returns its offset.
    fn data64(&mut self, value: i64) -> EncResult<u32>;

    fn patch_data64(&mut self, at: u32, value: i64) -> EncResult<()>;

    /// Full memory barrier, for volatile stores.
    fn fence(&mut self) -> EncResult<()>;

    fn trap(&mut self) -> EncResult<()>;

    fn jmp_to(&mut self, target: u32) -> EncResult<()> {
        let p = self.jmp()?;
        self.patch(p, target)
    }

    fn jcc_to(&mut self, cond: Cond, target: u32) -> EncResult<()> {
        let p = self.jcc(cond)?;
        self.patch(p, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_negate_and_flip() {
        for c in [Cond::Eq, Cond::Lt, Cond::Be, Cond::Gt] {
            assert_eq!(c.negate().negate(), c);
            assert_eq!(c.flip().flip(), c);
        }
        assert_eq!(Cond::Lt.flip(), Cond::Gt);
        assert_eq!(Cond::Le.flip(), Cond::Ge);
        assert_eq!(Cond::Eq.flip(), Cond::Eq);
        assert_eq!(Cond::Ne.negate(), Cond::Eq);
    }
}
