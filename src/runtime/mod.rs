//! Run-time side of compiled code: arithmetic helpers, the method info block
//! and stack-walking support.

pub mod arith;
pub mod infoblock;
pub mod rt;

pub use infoblock::{
    CatchClass, FrameOffsets, GcPoint, GcPointKind, HandlerEntry, InfoBlock, InfoBlockError,
    InfoFlags, InfoHeader,
};
pub use rt::{
    rt_bc2native, rt_enum, rt_fix_handler_context, rt_get_local_var, rt_native2bc,
    rt_set_local_var, rt_unwind, MemoryAccess, RegContext, RegSlot, RootLoc, RtError,
};
