// This module builds the GC maps recorded at calls and hardware null checks. A map
// describes the operand stack only: references held in locals are tracked at run time by
// the frame's locals bitmap, and references in global registers by the per-point register
// mask. A stack position counts as a root when its value is a reference stored in the
// position's own slot; immediates, aliases of locals and values in scratch registers are
// not roots of this frame at a call, since calls spill scratch registers first and the
// aliased locals are reported through the bitmap.

//! GC point construction from the abstract frame.

use crate::core::jframe::JFrame;
use crate::core::val::ValKind;
use crate::runtime::infoblock::{GcPoint, GcPointKind};

use super::globals::GlobalAssignment;
use super::layout::FrameLayout;

/// How a call site describes the operand stack to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Use the current frame. `retval_ref` marks the epilog's return value slot as a root.
    Frame { retval_ref: bool },
    /// The call never returns into this frame's operand stack.
    Throw,
    /// Explicit depth and stack bitmap.
    Custom { depth: u16, map: u64 },
    /// No GC point: the callee cannot trigger a collection.
    None,
}

/// Bitmap of stack positions holding a reference in their own slot.
pub fn stack_map(frame: &JFrame, layout: &FrameLayout) -> Vec<u64> {
    let mut words = vec![0u64; frame.depth().div_ceil(64)];
    for (pos, v) in frame.stack().iter().enumerate() {
        if !v.jt.is_ref() {
            continue;
        }
        if matches!(v.kind, ValKind::Mem(m) if m == layout.stack_slot(pos)) {
            words[pos / 64] |= 1 << (pos % 64);
        }
    }
    words
}

/// GC point for a call returning to `ip`, or `None` when `mode` records nothing.
pub fn call_point(
    mode: GcMode,
    ip: u32,
    pc: u32,
    frame: &JFrame,
    layout: &FrameLayout,
    globals: &GlobalAssignment,
) -> Option<GcPoint> {
    let regs = globals.ref_mask();
    let (depth, stack_map, retval_ref) = match mode {
        GcMode::None => return None,
        GcMode::Frame { retval_ref } => {
            (frame.depth() as u16, stack_map(frame, layout), retval_ref)
        }
        GcMode::Throw => (0, Vec::new(), false),
        GcMode::Custom { depth, map } => (depth, vec![map], false),
    };
    Some(GcPoint {
        ip,
        pc,
        kind: GcPointKind::Call,
        depth,
        stack_map,
        regs,
        retval_ref,
    })
}

/// GC point for the faulting instruction of a hardware null check at `ip`.
pub fn implicit_null_point(ip: u32, pc: u32, globals: &GlobalAssignment) -> GcPoint {
    GcPoint {
        ip,
        pc,
        kind: GcPointKind::ImplicitNullCheck,
        depth: 0,
        stack_map: Vec::new(),
        regs: globals.ref_mask(),
        retval_ref: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jtype::{JType, WordSize};
    use crate::core::register_file::Ar;
    use crate::core::val::Val;

    #[test]
    fn test_only_own_slot_refs_are_roots() {
        let layout = FrameLayout::new(2, 4, false);
        let mut frame = JFrame::new(4, 2, WordSize::W64);
        frame.push(Val::mem(JType::Ref, layout.stack_slot(0))).unwrap();
        frame.push(Val::mem(JType::Ref, layout.local(1))).unwrap();
        frame.push(Val::reg(JType::Ref, Ar::RAX)).unwrap();
        frame.push(Val::mem(JType::I32, layout.stack_slot(3))).unwrap();
        assert_eq!(stack_map(&frame, &layout), vec![0b1]);

        let globals = GlobalAssignment::none(2);
        let p = call_point(GcMode::Frame { retval_ref: true }, 40, 7, &frame, &layout, &globals)
            .unwrap();
        assert_eq!(p.depth, 4);
        assert!(p.retval_ref);
        assert_eq!(p.kind, GcPointKind::Call);
        assert!(call_point(GcMode::None, 40, 7, &frame, &layout, &globals).is_none());

        let t = call_point(GcMode::Throw, 40, 7, &frame, &layout, &globals).unwrap();
        assert_eq!(t.depth, 0);
        assert!(t.stack_map.is_empty());

        let c = call_point(GcMode::Custom { depth: 1, map: 1 }, 9, 0, &frame, &layout, &globals)
            .unwrap();
        assert_eq!((c.depth, c.stack_map.clone()), (1, vec![1]));
    }

    #[test]
    fn test_implicit_point_has_empty_stack() {
        let p = implicit_null_point(12, 3, &GlobalAssignment::none(0));
        assert_eq!(p.kind, GcPointKind::ImplicitNullCheck);
        assert_eq!(p.depth, 0);
    }
}
