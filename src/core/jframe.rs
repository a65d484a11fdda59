// This module models the JVM frame the code generator simulates: the operand stack as a
// sequence of Val slots (depth 0 is the top) and the fixed-size local-variable array. Wide
// values (long/double) always take two JVM slots. On a 64-bit target the value sits in the
// upper slot and a void placeholder fills the slot beneath it; on a 32-bit target ("big"
// wide types) the two slots carry the low and high halves. Every stack and local operation
// threads that duality through. The frame knows nothing about registers: reference counts
// are maintained by the code generator around the calls made here. The module also owns
// the slot permutation tables for the JVM stack-shuffle opcodes.

//! Abstract Java frame: operand stack plus local variables.

use super::jtype::{JType, WordSize};
use super::val::Val;
use std::fmt;

/// Errors raised by frame operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Overflow { max_stack: usize },
    Underflow,
    BadLocal(usize),
    /// A big wide value must be pushed/popped as two halves.
    NeedsHalves(JType),
    /// The top slots do not hold a value of the expected type.
    TypeMismatch { expected: JType, found: JType },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Overflow { max_stack } => write!(f, "stack overflow (max {max_stack})"),
            FrameError::Underflow => write!(f, "stack underflow"),
            FrameError::BadLocal(i) => write!(f, "bad local index {i}"),
            FrameError::NeedsHalves(jt) => write!(f, "{jt} must be handled as two halves"),
            FrameError::TypeMismatch { expected, found } => {
                write!(f, "expected {expected} on stack, found {found}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// JVM stack-shuffle opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
}

impl Shuffle {
    /// Number of slots consumed and, bottom to top, which consumed slot
    /// (0 = old top) lands in each produced position.
    pub fn pattern(self) -> (usize, &'static [usize]) {
        match self {
            Shuffle::Dup => (1, &[0, 0]),
            Shuffle::DupX1 => (2, &[0, 1, 0]),
            Shuffle::DupX2 => (3, &[0, 2, 1, 0]),
            Shuffle::Dup2 => (2, &[1, 0, 1, 0]),
            Shuffle::Dup2X1 => (3, &[1, 0, 2, 1, 0]),
            Shuffle::Dup2X2 => (4, &[1, 0, 3, 2, 1, 0]),
            Shuffle::Swap => (2, &[0, 1]),
        }
    }
}

/// Abstract frame state.
#[derive(Debug, Clone, PartialEq)]
pub struct JFrame {
    word: WordSize,
    max_stack: usize,
    /// Bottom first.
    stack: Vec<Val>,
    locals: Vec<Val>,
}

impl JFrame {
    pub fn new(max_stack: usize, num_locals: usize, word: WordSize) -> Self {
        Self {
            word,
            max_stack,
            stack: Vec::with_capacity(max_stack),
            locals: vec![Val::placeholder(); num_locals],
        }
    }

    pub fn word(&self) -> WordSize {
        self.word
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Number of occupied stack slots.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    /// Position (from the bottom) of the slot at `depth`.
    pub fn pos_of(&self, depth: usize) -> Option<usize> {
        self.stack.len().checked_sub(depth + 1)
    }

    pub fn dip(&self, depth: usize) -> Option<&Val> {
        let pos = self.pos_of(depth)?;
        self.stack.get(pos)
    }

    pub fn dip_mut(&mut self, depth: usize) -> Option<&mut Val> {
        let pos = self.pos_of(depth)?;
        self.stack.get_mut(pos)
    }

    pub fn at_pos(&self, pos: usize) -> Option<&Val> {
        self.stack.get(pos)
    }

    /// Type of the value on top of the stack.
    pub fn top(&self) -> Option<JType> {
        self.stack.last().map(|v| v.jt)
    }

    pub fn push_slot(&mut self, val: Val) -> Result<(), FrameError> {
        if self.stack.len() >= self.max_stack {
            return Err(FrameError::Overflow {
                max_stack: self.max_stack,
            });
        }
        self.stack.push(val);
        Ok(())
    }

    pub fn pop_slot(&mut self) -> Result<Val, FrameError> {
        self.stack.pop().ok_or(FrameError::Underflow)
    }

    /// Push a value, filling the second slot of a wide value with a placeholder.
    pub fn push(&mut self, val: Val) -> Result<(), FrameError> {
        if val.jt.is_big(self.word) {
            return Err(FrameError::NeedsHalves(val.jt));
        }
        if val.jt.is_wide() {
            if self.stack.len() + 2 > self.max_stack {
                return Err(FrameError::Overflow {
                    max_stack: self.max_stack,
                });
            }
            self.stack.push(Val::placeholder());
        }
        self.push_slot(val)
    }

    /// Push the two halves of a big wide value; `lo` ends up on top.
    pub fn push2(&mut self, lo: Val, hi: Val) -> Result<(), FrameError> {
        if self.stack.len() + 2 > self.max_stack {
            return Err(FrameError::Overflow {
                max_stack: self.max_stack,
            });
        }
        self.stack.push(hi);
        self.stack.push(lo);
        Ok(())
    }

    /// Pop one value, together with its placeholder if it is wide.
    pub fn pop(&mut self) -> Result<Val, FrameError> {
        let top = *self.stack.last().ok_or(FrameError::Underflow)?;
        if top.jt.is_big(self.word) {
            return Err(FrameError::NeedsHalves(top.jt));
        }
        let val = self.pop_slot()?;
        if val.jt.is_wide() {
            self.pop_slot()?;
        }
        Ok(val)
    }

    /// Pop the two halves of a big wide value as `(lo, hi)`.
    pub fn pop2(&mut self) -> Result<(Val, Val), FrameError> {
        if self.stack.len() < 2 {
            return Err(FrameError::Underflow);
        }
        let lo = self.pop_slot()?;
        let hi = self.pop_slot()?;
        Ok((lo, hi))
    }

    /// Drop every stack slot.
    pub fn clear_stack(&mut self) -> Vec<Val> {
        std::mem::take(&mut self.stack)
    }

    pub fn stack(&self) -> &[Val] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut [Val] {
        &mut self.stack
    }

    pub fn local(&self, idx: usize) -> Option<&Val> {
        self.locals.get(idx)
    }

    pub fn local_mut(&mut self, idx: usize) -> Option<&mut Val> {
        self.locals.get_mut(idx)
    }

    pub fn locals(&self) -> &[Val] {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut [Val] {
        &mut self.locals
    }

    /// Store `val` into local `idx`, returning every displaced slot value.
    ///
    /// A wide value also claims `idx + 1`. Overwriting either half of an older
    /// wide local invalidates the other half.
    pub fn set_local(&mut self, idx: usize, val: Val) -> Result<Vec<Val>, FrameError> {
        if val.jt.is_big(self.word) {
            return Err(FrameError::NeedsHalves(val.jt));
        }
        let width = val.jt.slots().max(1);
        if idx + width > self.locals.len() {
            return Err(FrameError::BadLocal(idx));
        }
        let mut displaced = self.invalidate_overlaps(idx, width);
        displaced.push(std::mem::replace(&mut self.locals[idx], val));
        if width == 2 {
            displaced.push(std::mem::replace(
                &mut self.locals[idx + 1],
                Val::placeholder(),
            ));
        }
        Ok(displaced)
    }

    /// Store the halves of a big wide value into `idx` (lo) and `idx + 1` (hi).
    pub fn set_local2(&mut self, idx: usize, lo: Val, hi: Val) -> Result<Vec<Val>, FrameError> {
        if idx + 2 > self.locals.len() {
            return Err(FrameError::BadLocal(idx));
        }
        let mut displaced = self.invalidate_overlaps(idx, 2);
        displaced.push(std::mem::replace(&mut self.locals[idx], lo));
        displaced.push(std::mem::replace(&mut self.locals[idx + 1], hi));
        Ok(displaced)
    }

    fn invalidate_overlaps(&mut self, idx: usize, width: usize) -> Vec<Val> {
        let mut displaced = Vec::new();
        // A wide local starting just below `idx` loses its upper slot.
        if idx > 0 && self.locals[idx - 1].jt.is_wide() && !self.is_upper_half(idx - 1) {
            displaced.push(std::mem::replace(
                &mut self.locals[idx - 1],
                Val::placeholder(),
            ));
        }
        // A wide local starting in our last slot loses its lower slot.
        let last = idx + width - 1;
        if last + 1 < self.locals.len()
            && self.locals[last].jt.is_wide()
            && !self.is_upper_half(last)
        {
            displaced.push(std::mem::replace(
                &mut self.locals[last + 1],
                Val::placeholder(),
            ));
        }
        displaced
    }

    /// Whether local `idx` is the upper half of a big value starting at `idx - 1`.
    fn is_upper_half(&self, idx: usize) -> bool {
        idx > 0
            && self.locals[idx].jt.is_big(self.word)
            && self.locals[idx - 1].jt == self.locals[idx].jt
            && (idx < 2 || !self.is_upper_half(idx - 1))
    }

    /// Apply a stack-shuffle permutation to the top slots.
    pub fn shuffle(&mut self, op: Shuffle) -> Result<(), FrameError> {
        let (consumed, layout) = op.pattern();
        if self.stack.len() < consumed {
            return Err(FrameError::Underflow);
        }
        let produced = layout.len();
        if self.stack.len() - consumed + produced > self.max_stack {
            return Err(FrameError::Overflow {
                max_stack: self.max_stack,
            });
        }
        let base = self.stack.len() - consumed;
        let old: Vec<Val> = self.stack.split_off(base);
        for &from_depth in layout {
            self.stack.push(old[consumed - 1 - from_depth]);
        }
        Ok(())
    }

    /// Values a shuffle would place on the stack, bottom to top, without mutating.
    pub fn shuffle_preview(&self, op: Shuffle) -> Result<Vec<Val>, FrameError> {
        let mut copy = self.clone();
        copy.shuffle(op)?;
        let (consumed, _) = op.pattern();
        let base = self.stack.len() - consumed;
        Ok(copy.stack[base..].to_vec())
    }
}

impl fmt::Display for JFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stack[")?;
        for (i, v) in self.stack.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("] locals[")?;
        for (i, v) in self.locals.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::Ar;

    fn frame64() -> JFrame {
        JFrame::new(8, 6, WordSize::W64)
    }

    #[test]
    fn test_wide_push_pop_w64() {
        let mut f = frame64();
        f.push(Val::imm_i32(1)).unwrap();
        f.push(Val::imm_i64(2)).unwrap();
        assert_eq!(f.depth(), 3);
        assert_eq!(f.top(), Some(JType::I64));
        assert!(f.dip(1).unwrap().is_placeholder());
        let v = f.pop().unwrap();
        assert_eq!(v.imm_bits(), Some(2));
        assert_eq!(f.depth(), 1);
    }

    #[test]
    fn test_big_halves_w32() {
        let mut f = JFrame::new(4, 4, WordSize::W32);
        let lo = Val::imm(JType::I64, 0x1111);
        let hi = Val::imm(JType::I64, 0x2222);
        assert_eq!(f.push(lo), Err(FrameError::NeedsHalves(JType::I64)));
        f.push2(lo, hi).unwrap();
        assert_eq!(f.depth(), 2);
        assert_eq!(f.dip(0).unwrap().imm_bits(), Some(0x1111));
        assert_eq!(f.dip(1).unwrap().imm_bits(), Some(0x2222));
        assert_eq!(f.pop(), Err(FrameError::NeedsHalves(JType::I64)));
        let (l, h) = f.pop2().unwrap();
        assert_eq!((l.imm_bits(), h.imm_bits()), (Some(0x1111), Some(0x2222)));
    }

    #[test]
    fn test_overflow_underflow() {
        let mut f = JFrame::new(2, 0, WordSize::W64);
        f.push(Val::imm_i32(1)).unwrap();
        assert!(matches!(f.push(Val::imm_f64(1.0)), Err(FrameError::Overflow { .. })));
        assert_eq!(f.depth(), 1);
        f.pop().unwrap();
        assert_eq!(f.pop(), Err(FrameError::Underflow));
    }

    #[test]
    fn test_set_local_wide_invalidates_neighbours() {
        let mut f = frame64();
        f.set_local(1, Val::imm_i64(7)).unwrap();
        assert!(f.local(2).unwrap().is_placeholder());
        // Overwriting the upper slot kills the long in 1.
        let displaced = f.set_local(2, Val::imm_i32(3)).unwrap();
        assert!(displaced.iter().any(|v| v.jt == JType::I64));
        assert!(f.local(1).unwrap().is_placeholder());
        assert_eq!(f.local(2).unwrap().imm_bits(), Some(3));
        assert!(f.set_local(5, Val::imm_f64(0.0)).is_err());
    }

    #[test]
    fn test_set_local2_w32() {
        let mut f = JFrame::new(4, 4, WordSize::W32);
        f.set_local2(0, Val::imm(JType::F64, 1), Val::imm(JType::F64, 2)).unwrap();
        assert_eq!(f.local(0).unwrap().imm_bits(), Some(1));
        assert_eq!(f.local(1).unwrap().imm_bits(), Some(2));
        f.set_local(2, Val::imm_i32(9)).unwrap();
        assert_eq!(f.local(1).unwrap().imm_bits(), Some(2));
    }

    fn ints(f: &JFrame) -> Vec<i64> {
        f.stack().iter().map(|v| v.imm_bits().unwrap_or(-1)).collect()
    }

    #[test]
    fn test_dup_then_pop_is_identity() {
        let mut f = frame64();
        f.push(Val::imm_i32(1)).unwrap();
        f.push(Val::reg(JType::Ref, Ar::RSI)).unwrap();
        let before = f.clone();
        f.shuffle(Shuffle::Dup).unwrap();
        f.pop().unwrap();
        assert_eq!(f, before);
    }

    #[test]
    fn test_swap_twice_is_identity() {
        let mut f = frame64();
        f.push(Val::imm_i32(1)).unwrap();
        f.push(Val::imm_i32(2)).unwrap();
        let before = f.clone();
        f.shuffle(Shuffle::Swap).unwrap();
        assert_eq!(ints(&f), vec![2, 1]);
        f.shuffle(Shuffle::Swap).unwrap();
        assert_eq!(f, before);
    }

    #[test]
    fn test_dup_x_forms() {
        let mut f = frame64();
        for i in 1..=3 {
            f.push(Val::imm_i32(i)).unwrap();
        }
        f.shuffle(Shuffle::DupX1).unwrap();
        assert_eq!(ints(&f), vec![1, 3, 2, 3]);

        let mut f = frame64();
        for i in 1..=3 {
            f.push(Val::imm_i32(i)).unwrap();
        }
        f.shuffle(Shuffle::DupX2).unwrap();
        assert_eq!(ints(&f), vec![3, 1, 2, 3]);
    }

    #[test]
    fn test_dup2_x2_round_trip_all_narrow() {
        let mut f = frame64();
        for i in 1..=4 {
            f.push(Val::imm_i32(i)).unwrap();
        }
        f.shuffle(Shuffle::Dup2X2).unwrap();
        assert_eq!(ints(&f), vec![3, 4, 1, 2, 3, 4]);
        // Compensate: drop the two copies on top, the originals are intact below.
        f.pop().unwrap();
        f.pop().unwrap();
        let mut g = frame64();
        for i in [3, 4, 1, 2] {
            g.push(Val::imm_i32(i)).unwrap();
        }
        assert_eq!(f, g);
    }

    #[test]
    fn test_dup2_x2_with_wide_values() {
        // Form 4: value2 (long) under value1 (long).
        let mut f = frame64();
        f.push(Val::imm_i64(10)).unwrap();
        f.push(Val::imm_i64(20)).unwrap();
        f.shuffle(Shuffle::Dup2X2).unwrap();
        assert_eq!(f.depth(), 6);
        assert_eq!(f.pop().unwrap().imm_bits(), Some(20));
        assert_eq!(f.pop().unwrap().imm_bits(), Some(10));
        assert_eq!(f.pop().unwrap().imm_bits(), Some(20));
        assert_eq!(f.depth(), 0);
    }

    #[test]
    fn test_dup2_on_wide_copies_pair() {
        let mut f = frame64();
        f.push(Val::imm_f64(2.5)).unwrap();
        let preview = f.shuffle_preview(Shuffle::Dup2).unwrap();
        assert_eq!(preview.len(), 4);
        f.shuffle(Shuffle::Dup2).unwrap();
        assert_eq!(f.pop().unwrap().imm_bits(), Some(2.5f64.to_bits() as i64));
        assert_eq!(f.pop().unwrap().imm_bits(), Some(2.5f64.to_bits() as i64));
    }
}
