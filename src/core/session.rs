// This module provides the compilation session: the per-compiler-thread context handed to
// every method compilation. CompilationSession owns a reference to a bumpalo arena that
// per-method tables (basic blocks, decoded instructions) are allocated from, and collects
// CompileStats through a RefCell so code generation can record events through a shared
// reference. Statistics are instance state rather than process-wide globals: each thread or
// test creates its own session and reads an isolated set of counters. CompileStats counts
// methods, bytecodes, emitted bytes, spills, null checks (emitted, eliminated, implicit),
// basic-block canonicalizations, helper calls and GC points, and renders a summary with
// Display.

//! Arena-based compilation session and statistics.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Compilation context shared by the methods compiled on one thread.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<CompileStats>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(CompileStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(slice)
    }

    pub fn stats(&self) -> CompileStats {
        self.stats.borrow().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.borrow_mut() = CompileStats::default();
    }

    pub fn record_method_compiled(&self, name: &str, bytecodes: usize, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_compiled += 1;
        stats.bytecode_bytes += bytecodes;
        stats.code_bytes += code_size;
        if stats.largest_method_size < code_size {
            stats.largest_method_size = code_size;
            stats.largest_method_name = name.to_string();
        }
    }

    pub fn record_method_filtered(&self) {
        self.stats.borrow_mut().methods_filtered += 1;
    }

    pub fn record_opcode(&self, name: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions += 1;
        *stats.opcode_counts.entry(name).or_insert(0) += 1;
    }

    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills += 1;
    }

    pub fn record_null_check(&self, outcome: NullCheckOutcome) {
        let mut stats = self.stats.borrow_mut();
        match outcome {
            NullCheckOutcome::Eliminated => stats.null_checks_eliminated += 1,
            NullCheckOutcome::Implicit => stats.null_checks_implicit += 1,
            NullCheckOutcome::Explicit => stats.null_checks_explicit += 1,
        }
    }

    pub fn record_bb_canonicalized(&self) {
        self.stats.borrow_mut().bb_canonicalizations += 1;
    }

    pub fn record_helper_call(&self) {
        self.stats.borrow_mut().helper_calls += 1;
    }

    pub fn record_gc_point(&self) {
        self.stats.borrow_mut().gc_points += 1;
    }
}

/// How a null check was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullCheckOutcome {
    Eliminated,
    Implicit,
    Explicit,
}

/// Compilation statistics.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub methods_compiled: usize,
    pub methods_filtered: usize,
    pub bytecode_bytes: usize,
    pub code_bytes: usize,
    pub largest_method_size: usize,
    pub largest_method_name: String,
    pub instructions: usize,
    pub opcode_counts: HashMap<&'static str, usize>,
    pub spills: usize,
    pub null_checks_eliminated: usize,
    pub null_checks_implicit: usize,
    pub null_checks_explicit: usize,
    pub bb_canonicalizations: usize,
    pub helper_calls: usize,
    pub gc_points: usize,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JET compilation statistics:")?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Methods filtered: {}", self.methods_filtered)?;
        writeln!(f, "  Bytecode bytes: {}", self.bytecode_bytes)?;
        writeln!(f, "  Native code bytes: {}", self.code_bytes)?;
        writeln!(f, "  Spills: {}", self.spills)?;
        writeln!(
            f,
            "  Null checks: {} explicit, {} implicit, {} eliminated",
            self.null_checks_explicit, self.null_checks_implicit, self.null_checks_eliminated
        )?;
        writeln!(f, "  Block canonicalizations: {}", self.bb_canonicalizations)?;
        writeln!(f, "  Helper calls: {}", self.helper_calls)?;
        writeln!(f, "  GC points: {}", self.gc_points)?;

        if !self.largest_method_name.is_empty() {
            writeln!(
                f,
                "  Largest method: {} ({} bytes)",
                self.largest_method_name, self.largest_method_size
            )?;
        }

        if !self.opcode_counts.is_empty() {
            writeln!(f, "  Bytecode breakdown:")?;
            let mut sorted: Vec<_> = self.opcode_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {opcode}: {count}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_isolated() {
        let arena = Bump::new();
        let a = CompilationSession::new(&arena);
        let b = CompilationSession::new(&arena);
        a.record_spill();
        a.record_opcode("iadd");
        a.record_opcode("iadd");
        assert_eq!(a.stats().spills, 1);
        assert_eq!(a.stats().opcode_counts.get("iadd"), Some(&2));
        assert_eq!(b.stats().spills, 0);
        a.reset_stats();
        assert_eq!(a.stats().instructions, 0);
    }

    #[test]
    fn test_largest_method_tracking() {
        let arena = Bump::new();
        let s = CompilationSession::new(&arena);
        s.record_method_compiled("A.f()V", 1, 10);
        s.record_method_compiled("A.g()V", 5, 40);
        s.record_method_compiled("A.h()V", 2, 20);
        let stats = s.stats();
        assert_eq!(stats.methods_compiled, 3);
        assert_eq!(stats.largest_method_name, "A.g()V");
        assert_eq!(stats.code_bytes, 70);
        let text = stats.to_string();
        assert!(text.contains("Largest method: A.g()V (40 bytes)"));
    }

    #[test]
    fn test_null_check_counters() {
        let arena = Bump::new();
        let s = CompilationSession::new(&arena);
        s.record_null_check(NullCheckOutcome::Eliminated);
        s.record_null_check(NullCheckOutcome::Explicit);
        s.record_null_check(NullCheckOutcome::Explicit);
        let stats = s.stats();
        assert_eq!(stats.null_checks_eliminated, 1);
        assert_eq!(stats.null_checks_explicit, 2);
        assert_eq!(stats.null_checks_implicit, 0);
    }

    #[test]
    fn test_arena_slices() {
        let arena = Bump::new();
        let s = CompilationSession::new(&arena);
        let xs = s.alloc_slice(&[1u32, 2, 3]);
        assert_eq!(xs, &[1, 2, 3]);
    }
}
