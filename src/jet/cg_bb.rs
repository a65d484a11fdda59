// This module implements the state transfer between basic blocks. Leaving a block towards
// a target entered by more than one edge (or by a jsr, a ret, or exception dispatch) brings
// every stack item into its own slot and records the slot types the target will be entered
// with; every later edge into the same target must agree on them. Locals need no work since
// stores are written through to their homes. A target with a single predecessor instead
// receives a snapshot of the frame as it stands when control leaves, and entering it simply
// restores that snapshot, so no code is emitted on such edges. Handler entry is special:
// the only stack item is the exception object, which arrives in the exception register.

//! Basic-block entry and exit.

use crate::core::encoder::Encoder;
use crate::core::error::{CompileError, CompileResult};
use crate::core::jtype::JType;
use crate::core::register_file::AR_COUNT;
use crate::core::val::{Val, ValAttrs, ValKind};
use crate::x64::EXCEPTION_REG;

use super::bbs::BasicBlock;
use super::compiler::{Compiler, EntryState};

impl<E: Encoder> Compiler<'_, '_, E> {
    /// Prepare the frame for control leaving towards `targets`.
    pub(super) fn bb_leave(&mut self, targets: &[u32]) -> CompileResult<()> {
        let mut blocks: Vec<BasicBlock> = Vec::with_capacity(targets.len());
        for &t in targets {
            let bb = self
                .bbs
                .block(t)
                .cloned()
                .ok_or_else(|| self.inconsistent(format!("no block at {t}")))?;
            blocks.push(bb);
        }

        if blocks.iter().any(|b| b.handler) {
            if blocks.iter().any(|b| !b.handler) || self.frame.depth() != 1 {
                return Err(self.inconsistent("flow into a handler with a foreign stack"));
            }
            let (v, _lock) = self.vpop_locked()?;
            let _rax = self.rf.lock_one(EXCEPTION_REG);
            self.load(EXCEPTION_REG, &Val { jt: JType::Ref, ..v })?;
            return self.vpush(Val::reg(JType::Ref, EXCEPTION_REG).with_non_null(true));
        }

        if blocks.iter().any(|b| b.needs_canon()) {
            self.vswap_all()?;
            self.session.record_bb_canonicalized();
        }
        for bb in &blocks {
            if bb.needs_canon() {
                self.record_canonical(bb.start)?;
            } else {
                self.entry_states
                    .insert(bb.start, EntryState::Snapshot(self.frame.clone()));
            }
        }
        Ok(())
    }

    /// Check the current stack against, or record it as, the canonical entry of `pc`.
    pub(super) fn record_canonical(&mut self, pc: u32) -> CompileResult<()> {
        let types: Vec<JType> = self.frame.stack().iter().map(|v| v.jt).collect();
        match self.entry_states.get(&pc) {
            Some(EntryState::Canonical(known)) if *known != types => Err(self.inconsistent(
                format!("stack {types:?} does not match {known:?} recorded for block {pc}"),
            )),
            Some(EntryState::Canonical(_)) => Ok(()),
            _ => {
                self.entry_states.insert(pc, EntryState::Canonical(types));
                Ok(())
            }
        }
    }

    pub(super) fn bb_enter(&mut self, bb: &BasicBlock) -> CompileResult<()> {
        if bb.needs_canon() {
            self.enter_canonical(bb)
        } else {
            match self.entry_states.remove(&bb.start) {
                Some(EntryState::Snapshot(frame)) => {
                    self.frame = frame;
                    self.recount_refs();
                    Ok(())
                }
                Some(EntryState::Canonical(_)) => {
                    Err(self.inconsistent(format!("block {} has a canonical entry", bb.start)))
                }
                // Method entry keeps the prolog's frame.
                None if bb.start == 0 => Ok(()),
                None => Err(self.inconsistent(format!("block {} entered before its predecessor", bb.start))),
            }
        }
    }

    fn enter_canonical(&mut self, bb: &BasicBlock) -> CompileResult<()> {
        self.frame.clear_stack();
        self.rf.reset_refs();
        if bb.handler {
            self.vpush(Val::reg(JType::Ref, EXCEPTION_REG).with_non_null(true))?;
        } else {
            let types = match self.entry_states.get(&bb.start) {
                Some(EntryState::Canonical(types)) => types.clone(),
                None if bb.start == 0 => {
                    self.entry_states
                        .insert(0, EntryState::Canonical(Vec::new()));
                    Vec::new()
                }
                _ => {
                    return Err(self.inconsistent(format!(
                        "no canonical state recorded for block {}",
                        bb.start
                    )))
                }
            };
            for (pos, jt) in types.into_iter().enumerate() {
                let v = if jt == JType::Void {
                    Val::placeholder()
                } else {
                    Val::mem(jt, self.layout.stack_slot(pos))
                };
                self.frame.push_slot(v).map_err(|e| self.frame_err(e))?;
            }
        }

        for idx in 0..self.frame.num_locals() {
            let jt = self.globals.class_of(idx);
            let kind = self.home(idx);
            if let Some(local) = self.frame.local_mut(idx) {
                *local = Val {
                    jt,
                    kind,
                    attrs: ValAttrs::default(),
                };
            }
        }
        Ok(())
    }

    fn recount_refs(&mut self) {
        self.rf.reset_refs();
        let regs: Vec<_> = self.frame.stack().iter().filter_map(|v| v.reg_ar()).collect();
        for r in regs {
            if self.rf.is_scratch(r) {
                self.rf.rref(r);
            }
        }
    }

    /// Verify the register bookkeeping against the frame.
    pub(super) fn vcheck(&self) -> CompileResult<()> {
        if self.rf.any_locked() {
            return Err(self.inconsistent("register lock held across instructions"));
        }
        let mut expected = [0u16; AR_COUNT];
        for v in self.frame.stack() {
            match v.kind {
                ValKind::Reg(r) if self.rf.is_scratch(r) => expected[r.index()] += 1,
                ValKind::Mem(m) if m.regs().iter().any(|r| self.rf.is_scratch(r)) => {
                    return Err(self.inconsistent(format!("stack item {v} based on a scratch register")));
                }
                _ => {}
            }
        }
        for v in self.frame.locals() {
            if v.regs().iter().any(|r| self.rf.is_scratch(r)) {
                return Err(self.inconsistent(format!("local {v} held in a scratch register")));
            }
        }
        let actual = self.rf.ref_counts();
        if actual != expected {
            return Err(CompileError::InconsistentState {
                pc: self.pc,
                reason: format!("register refs {actual:?}, frame implies {expected:?}"),
            });
        }
        Ok(())
    }
}
