//! Abstract registers, reference counts and scoped register locks.
//!
//! An [`Ar`] names one physical register of the target. The [`RegisterFile`]
//! tracks, per register, how many live frame values denote it (reference
//! count) and how many scoped [`RegLock`] guards currently pin it. The
//! allocator only hands out scratch registers; callee-save registers are
//! reserved for the once-per-method global assignment of local variables.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Number of abstract registers: 16 general purpose followed by 16 XMM.
pub const AR_COUNT: usize = 32;

/// Register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBank {
    Gp,
    Fp,
}

/// Abstract register id. GP registers use their hardware encoding (0..16),
/// XMM registers follow at 16..32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ar(pub u8);

impl Ar {
    pub const RAX: Ar = Ar(0);
    pub const RCX: Ar = Ar(1);
    pub const RDX: Ar = Ar(2);
    pub const RBX: Ar = Ar(3);
    pub const RSP: Ar = Ar(4);
    pub const RBP: Ar = Ar(5);
    pub const RSI: Ar = Ar(6);
    pub const RDI: Ar = Ar(7);
    pub const R8: Ar = Ar(8);
    pub const R9: Ar = Ar(9);
    pub const R10: Ar = Ar(10);
    pub const R11: Ar = Ar(11);
    pub const R12: Ar = Ar(12);
    pub const R13: Ar = Ar(13);
    pub const R14: Ar = Ar(14);
    pub const R15: Ar = Ar(15);
    pub const XMM0: Ar = Ar(16);
    pub const XMM15: Ar = Ar(31);

    pub const fn gp(id: u8) -> Ar {
        Ar(id & 15)
    }

    pub const fn xmm(id: u8) -> Ar {
        Ar(16 + (id & 15))
    }

    pub fn is_fp(self) -> bool {
        self.0 >= 16
    }

    pub fn bank(self) -> RegBank {
        if self.is_fp() {
            RegBank::Fp
        } else {
            RegBank::Gp
        }
    }

    /// Hardware register number within its bank.
    pub fn hw(self) -> u8 {
        self.0 & 15
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Ar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GP: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        if self.is_fp() {
            write!(f, "xmm{}", self.hw())
        } else {
            f.write_str(GP[self.hw() as usize])
        }
    }
}

/// Set of abstract registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegBitSet(u32);

impl RegBitSet {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn of(regs: &[Ar]) -> Self {
        let mut set = Self::new();
        for &r in regs {
            set.set(r);
        }
        set
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, reg: Ar) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    pub fn set(&mut self, reg: Ar) {
        self.0 |= 1 << reg.0;
    }

    pub fn clear(&mut self, reg: Ar) {
        self.0 &= !(1 << reg.0);
    }

    pub fn union(self, other: RegBitSet) -> RegBitSet {
        RegBitSet(self.0 | other.0)
    }

    pub fn minus(self, other: RegBitSet) -> RegBitSet {
        RegBitSet(self.0 & !other.0)
    }

    pub fn in_bank(self, bank: RegBank) -> RegBitSet {
        match bank {
            RegBank::Gp => RegBitSet(self.0 & 0xffff),
            RegBank::Fp => RegBitSet(self.0 & 0xffff_0000),
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn first(self) -> Option<Ar> {
        if self.0 == 0 {
            None
        } else {
            Some(Ar(self.0.trailing_zeros() as u8))
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Ar> {
        (0..AR_COUNT as u8).filter(move |&i| self.0 & (1 << i) != 0).map(Ar)
    }
}

/// Error types for register allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    /// Every scratch register of the bank is locked.
    AllLocked(RegBank),
    /// Reference count dropped below zero.
    RefCountUnderflow(Ar),
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::AllLocked(bank) => {
                write!(f, "all scratch registers of bank {bank:?} are locked")
            }
            RegAllocError::RefCountUnderflow(ar) => write!(f, "reference count underflow on {ar:?}"),
        }
    }
}

impl std::error::Error for RegAllocError {}

/// Lock counters shared between the register file and its guards.
#[derive(Debug, Default)]
struct LockTable {
    counts: [Cell<u16>; AR_COUNT],
}

/// Scoped lock over a set of registers; released on drop.
///
/// The guard does not borrow the register file, so code generation can keep
/// allocating (and spilling other registers) while it is alive.
#[must_use = "the registers are unlocked as soon as the guard is dropped"]
pub struct RegLock {
    table: Rc<LockTable>,
    regs: RegBitSet,
}

impl RegLock {
    pub fn regs(&self) -> RegBitSet {
        self.regs
    }
}

impl Drop for RegLock {
    fn drop(&mut self) {
        for r in self.regs.iter() {
            let c = &self.table.counts[r.index()];
            debug_assert!(c.get() > 0, "lock count underflow on {r:?}");
            c.set(c.get().saturating_sub(1));
        }
    }
}

/// Outcome of asking the register file for a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// The register holds nothing live.
    Free(Ar),
    /// The register must be spilled before it can be reused.
    Spill(Ar),
}

/// Per-method register bookkeeping.
pub struct RegisterFile {
    /// Registers the allocator may hand out.
    scratch: RegBitSet,
    /// Number of frame values denoting each register.
    refs: [u16; AR_COUNT],
    locks: Rc<LockTable>,
    /// Registers handed out since the last time the free pool wrapped around.
    recent: RegBitSet,
    /// Every register written by the method so far.
    clobbered: RegBitSet,
}

impl RegisterFile {
    pub fn new(scratch: RegBitSet) -> Self {
        Self {
            scratch,
            refs: [0; AR_COUNT],
            locks: Rc::new(LockTable::default()),
            recent: RegBitSet::new(),
            clobbered: RegBitSet::new(),
        }
    }

    pub fn scratch(&self) -> RegBitSet {
        self.scratch
    }

    pub fn is_scratch(&self, ar: Ar) -> bool {
        self.scratch.contains(ar)
    }

    pub fn refs(&self, ar: Ar) -> u16 {
        self.refs[ar.index()]
    }

    pub fn locks(&self, ar: Ar) -> u16 {
        self.locks.counts[ar.index()].get()
    }

    pub fn is_locked(&self, ar: Ar) -> bool {
        self.locks(ar) != 0
    }

    /// Whether any register is currently pinned by a guard.
    pub fn any_locked(&self) -> bool {
        self.locks.counts.iter().any(|c| c.get() != 0)
    }

    pub fn rref(&mut self, ar: Ar) {
        self.refs[ar.index()] += 1;
    }

    pub fn rfree(&mut self, ar: Ar) -> Result<(), RegAllocError> {
        let r = &mut self.refs[ar.index()];
        if *r == 0 {
            return Err(RegAllocError::RefCountUnderflow(ar));
        }
        *r -= 1;
        Ok(())
    }

    /// Forget all reference counts; used when a frame state is restored.
    pub fn reset_refs(&mut self) {
        self.refs = [0; AR_COUNT];
    }

    pub fn ref_counts(&self) -> [u16; AR_COUNT] {
        self.refs
    }

    /// Pin the given registers for the lifetime of the returned guard.
    pub fn lock(&self, regs: RegBitSet) -> RegLock {
        for r in regs.iter() {
            let c = &self.locks.counts[r.index()];
            c.set(c.get() + 1);
        }
        RegLock {
            table: Rc::clone(&self.locks),
            regs,
        }
    }

    pub fn lock_one(&self, ar: Ar) -> RegLock {
        self.lock(RegBitSet::of(&[ar]))
    }

    pub fn mark_clobbered(&mut self, ar: Ar) {
        self.clobbered.set(ar);
    }

    pub fn clobbered(&self) -> RegBitSet {
        self.clobbered
    }

    fn available(&self, ar: Ar) -> bool {
        self.refs[ar.index()] == 0 && !self.is_locked(ar)
    }

    /// Choose a register of `bank` for a new temporary.
    ///
    /// Prefers a free register not handed out since the pool last wrapped, then
    /// any free register, then the unlocked register with the fewest live
    /// references (which the caller must spill).
    pub fn pick(&mut self, bank: RegBank) -> Result<Pick, RegAllocError> {
        let pool = self.scratch.in_bank(bank);
        let free: Vec<Ar> = pool.iter().filter(|&r| self.available(r)).collect();
        if !free.is_empty() {
            let fresh = free.iter().copied().find(|&r| !self.recent.contains(r));
            let ar = match fresh {
                Some(ar) => ar,
                None => {
                    self.recent = self.recent.minus(pool);
                    free[0]
                }
            };
            self.recent.set(ar);
            self.clobbered.set(ar);
            return Ok(Pick::Free(ar));
        }

        let victim = pool
            .iter()
            .filter(|&r| !self.is_locked(r))
            .min_by_key(|&r| self.refs[r.index()])
            .ok_or(RegAllocError::AllLocked(bank))?;
        self.recent.set(victim);
        self.clobbered.set(victim);
        Ok(Pick::Spill(victim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_regfile() -> RegisterFile {
        RegisterFile::new(RegBitSet::of(&[Ar::RAX, Ar::RCX, Ar::RDX, Ar::XMM0, Ar::xmm(1)]))
    }

    #[test]
    fn test_ar_naming() {
        assert_eq!(format!("{:?}", Ar::R12), "r12");
        assert_eq!(format!("{:?}", Ar::xmm(3)), "xmm3");
        assert!(Ar::xmm(3).is_fp());
        assert_eq!(Ar::xmm(3).hw(), 3);
        assert_eq!(Ar::R10.bank(), RegBank::Gp);
    }

    #[test]
    fn test_bitset_ops() {
        let mut set = RegBitSet::of(&[Ar::RAX, Ar::XMM0]);
        assert!(set.contains(Ar::RAX));
        assert_eq!(set.in_bank(RegBank::Fp).first(), Some(Ar::XMM0));
        set.clear(Ar::RAX);
        assert_eq!(set.count(), 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Ar::XMM0]);
    }

    #[test]
    fn test_round_robin_preference() {
        let mut rf = create_test_regfile();
        assert_eq!(rf.pick(RegBank::Gp).unwrap(), Pick::Free(Ar::RAX));
        // rax is free again but was just used: the next pick moves on.
        assert_eq!(rf.pick(RegBank::Gp).unwrap(), Pick::Free(Ar::RCX));
        assert_eq!(rf.pick(RegBank::Gp).unwrap(), Pick::Free(Ar::RDX));
        // Pool exhausted of fresh registers: wraps around.
        assert_eq!(rf.pick(RegBank::Gp).unwrap(), Pick::Free(Ar::RAX));
    }

    #[test]
    fn test_spill_fewest_refs_never_locked() {
        let mut rf = create_test_regfile();
        rf.rref(Ar::RAX);
        rf.rref(Ar::RAX);
        rf.rref(Ar::RCX);
        rf.rref(Ar::RDX);
        rf.rref(Ar::RDX);
        assert_eq!(rf.pick(RegBank::Gp).unwrap(), Pick::Spill(Ar::RCX));

        let _guard = rf.lock_one(Ar::RCX);
        let pick = rf.pick(RegBank::Gp).unwrap();
        assert_ne!(pick, Pick::Spill(Ar::RCX));
    }

    #[test]
    fn test_all_locked_is_error() {
        let mut rf = create_test_regfile();
        let _g = rf.lock(RegBitSet::of(&[Ar::XMM0, Ar::xmm(1)]));
        assert_eq!(rf.pick(RegBank::Fp), Err(RegAllocError::AllLocked(RegBank::Fp)));
    }

    #[test]
    fn test_lock_guard_released_on_every_path() {
        let rf = create_test_regfile();
        fn early_exit(rf: &RegisterFile, bail: bool) -> Option<()> {
            let _g = rf.lock_one(Ar::RDX);
            if bail {
                return None;
            }
            Some(())
        }
        assert!(early_exit(&rf, true).is_none());
        assert!(early_exit(&rf, false).is_some());
        assert!(!rf.any_locked());

        {
            let _a = rf.lock_one(Ar::RAX);
            let _b = rf.lock_one(Ar::RAX);
            assert_eq!(rf.locks(Ar::RAX), 2);
        }
        assert_eq!(rf.locks(Ar::RAX), 0);
    }

    #[test]
    fn test_ref_underflow() {
        let mut rf = create_test_regfile();
        rf.rref(Ar::RCX);
        assert!(rf.rfree(Ar::RCX).is_ok());
        assert_eq!(rf.rfree(Ar::RCX), Err(RegAllocError::RefCountUnderflow(Ar::RCX)));
    }
}
