//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - The managed and helper calling convention (`CallSig`)
//! - The register partition used by the code generator

pub mod calling_convention;
pub mod encoder;

pub use calling_convention::{ArgLoc, CallSig, STACK_ALIGN};
pub use encoder::{EncodingError, X64Encoder};

use crate::core::register_file::{Ar, RegBitSet};

/// Register holding the exception object on handler entry.
pub const EXCEPTION_REG: Ar = Ar::RAX;

/// Callee-save registers available for global local-variable assignment, in
/// assignment order.
pub const GLOBAL_GP: [Ar; 5] = [Ar::RBX, Ar::R12, Ar::R13, Ar::R14, Ar::R15];

/// General-purpose registers the allocator hands out for temporaries.
pub const SCRATCH_GP: [Ar; 8] = [
    Ar::RAX,
    Ar::RCX,
    Ar::RDX,
    Ar::RSI,
    Ar::RDI,
    Ar::R8,
    Ar::R9,
    Ar::R10,
];

/// Number of XMM registers the allocator hands out (`xmm0..xmm14`).
pub const SCRATCH_FP_COUNT: u8 = 15;

/// Scratch set of the register file.
pub fn scratch_regs() -> RegBitSet {
    let mut set = RegBitSet::of(&SCRATCH_GP);
    for i in 0..SCRATCH_FP_COUNT {
        set.set(Ar::xmm(i));
    }
    set
}

pub fn global_regs() -> RegBitSet {
    RegBitSet::of(&GLOBAL_GP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::RegBank;

    #[test]
    fn test_partition_is_disjoint() {
        let scratch = scratch_regs();
        assert!(scratch.union(global_regs()).count() == scratch.count() + 5);
        assert!(!scratch.contains(Ar::RSP));
        assert!(!scratch.contains(Ar::RBP));
        assert!(!scratch.contains(encoder::TMP_GP));
        assert!(!scratch.contains(encoder::TMP_FP));
        assert_eq!(scratch.in_bank(RegBank::Fp).count(), 15);
        assert!(scratch.contains(EXCEPTION_REG));
    }
}
