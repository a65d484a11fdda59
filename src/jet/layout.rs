// This module computes the native stack frame of a compiled method. The frame is addressed
// from rbp and grows downwards: the callee-save spill slots for the global registers come
// first, then the monitor object slot of synchronized methods, the return value slot used by
// the epilog when a call follows the return value's computation, the optional scratch
// register save area, the bitmap words tracking which memory-homed locals hold references,
// the local variable homes and finally the operand stack slots. Every slot is 8 bytes and
// the total is rounded to 16 so calls made from the body keep the ABI alignment.

//! Native frame layout of a compiled method.

use crate::core::register_file::Ar;
use crate::core::val::MemRef;
use crate::runtime::infoblock::FrameOffsets;
use crate::x64::{GLOBAL_GP, SCRATCH_GP};

/// Bytes per frame slot.
pub const SLOT: i32 = 8;

/// Guard page granularity used by the prolog's stack probes.
pub const PAGE_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    num_locals: usize,
    max_stack: usize,
    offsets: FrameOffsets,
}

impl FrameLayout {
    pub fn new(num_locals: usize, max_stack: usize, save_scratch: bool) -> Self {
        let callee_save = -SLOT;
        let mut next = callee_save - SLOT * (GLOBAL_GP.len() as i32 - 1);
        next -= SLOT;
        let sync_obj = next;
        next -= SLOT;
        let retval = next;
        let scratch_save = if save_scratch {
            next -= SLOT * SCRATCH_GP.len() as i32;
            next
        } else {
            0
        };
        let words = num_locals.div_ceil(64) as i32;
        next -= SLOT * words;
        let gc_locals = next;
        next -= SLOT * num_locals as i32;
        let locals = next;
        next -= SLOT * max_stack as i32;
        let stack = next;
        let frame_size = ((-stack) as u32 + 15) & !15;
        Self {
            num_locals,
            max_stack,
            offsets: FrameOffsets {
                frame_size,
                callee_save,
                sync_obj,
                retval,
                scratch_save,
                gc_locals,
                locals,
                stack,
            },
        }
    }

    pub fn offsets(&self) -> FrameOffsets {
        self.offsets
    }

    pub fn frame_size(&self) -> u32 {
        self.offsets.frame_size
    }

    pub fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub fn gc_words(&self) -> usize {
        self.num_locals.div_ceil(64)
    }

    fn at(off: i32) -> MemRef {
        MemRef::base_disp(Ar::RBP, off)
    }

    /// Spill slot of `GLOBAL_GP[k]`.
    pub fn callee_save(&self, k: usize) -> MemRef {
        Self::at(self.offsets.callee_save - SLOT * k as i32)
    }

    pub fn sync_obj(&self) -> MemRef {
        Self::at(self.offsets.sync_obj)
    }

    pub fn retval(&self) -> MemRef {
        Self::at(self.offsets.retval)
    }

    /// Save slot of `SCRATCH_GP[k]`, when the frame has a scratch save area.
    pub fn scratch_save(&self, k: usize) -> Option<MemRef> {
        (self.offsets.scratch_save != 0).then(|| Self::at(self.offsets.scratch_save + SLOT * k as i32))
    }

    /// Bitmap word holding the reference bit of local `idx`.
    pub fn gc_word(&self, idx: usize) -> MemRef {
        Self::at(self.offsets.gc_locals + SLOT * (idx / 64) as i32)
    }

    pub fn local(&self, idx: usize) -> MemRef {
        Self::at(self.offsets.locals + SLOT * idx as i32)
    }

    pub fn stack_slot(&self, pos: usize) -> MemRef {
        Self::at(self.offsets.stack + SLOT * pos as i32)
    }

    /// Operand stack position addressed by `m`, if it is a stack slot.
    pub fn stack_pos_of(&self, m: &MemRef) -> Option<usize> {
        let rel = self.slot_index(m, self.offsets.stack)?;
        (rel < self.max_stack).then_some(rel)
    }

    /// Local variable homed at `m`, if any.
    pub fn local_of(&self, m: &MemRef) -> Option<usize> {
        let rel = self.slot_index(m, self.offsets.locals)?;
        (rel < self.num_locals).then_some(rel)
    }

    fn slot_index(&self, m: &MemRef, base: i32) -> Option<usize> {
        if m.base != Some(Ar::RBP) || m.index.is_some() {
            return None;
        }
        let rel = m.disp.checked_sub(base)?;
        (rel >= 0 && rel % SLOT == 0).then_some((rel / SLOT) as usize)
    }

    /// Offsets from `rsp` touched by the prolog's stack probes, nearest page first.
    pub fn probe_offsets(&self) -> Vec<i32> {
        let size = self.frame_size();
        let mut probes = Vec::new();
        let mut off = PAGE_SIZE;
        while off < size {
            probes.push((size - off) as i32);
            off += PAGE_SIZE;
        }
        if size > 0 {
            probes.push(0);
        }
        probes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_areas_do_not_overlap() {
        let l = FrameLayout::new(3, 4, false);
        let o = l.offsets();
        assert_eq!(o.callee_save, -8);
        assert_eq!(o.sync_obj, -48);
        assert_eq!(o.retval, -56);
        assert_eq!(o.scratch_save, 0);
        assert_eq!(o.gc_locals, -64);
        assert_eq!(o.locals, -88);
        assert_eq!(o.stack, -120);
        assert_eq!(o.frame_size, 128);
        assert_eq!(l.local(2).disp, -72);
        assert_eq!(l.stack_slot(3).disp, -96);
        assert_eq!(l.callee_save(4).disp, -40);
        assert!(l.scratch_save(0).is_none());
    }

    #[test]
    fn test_scratch_area_and_bitmap_words() {
        let l = FrameLayout::new(70, 0, true);
        let o = l.offsets();
        assert_eq!(o.scratch_save, -120);
        assert_eq!(l.gc_words(), 2);
        assert_eq!(o.gc_locals, -136);
        assert_eq!(l.gc_word(63).disp, -136);
        assert_eq!(l.gc_word(64).disp, -128);
        assert_eq!(o.frame_size % 16, 0);
    }

    #[test]
    fn test_slot_classification() {
        let l = FrameLayout::new(2, 3, false);
        assert_eq!(l.stack_pos_of(&l.stack_slot(2)), Some(2));
        assert_eq!(l.stack_pos_of(&l.local(0)), None);
        assert_eq!(l.local_of(&l.local(1)), Some(1));
        assert_eq!(l.local_of(&MemRef::base_disp(Ar::RSP, l.local(1).disp)), None);
    }

    #[test]
    fn test_probes_cover_every_page() {
        let small = FrameLayout::new(1, 1, false);
        assert_eq!(small.probe_offsets(), vec![0]);
        let big = FrameLayout::new(1200, 10, false);
        let size = big.frame_size() as i32;
        let probes = big.probe_offsets();
        assert_eq!(probes.first(), Some(&(size - 4096)));
        assert_eq!(probes.last(), Some(&0));
        assert!(probes.windows(2).all(|w| w[0] - w[1] <= 4096));
    }
}
