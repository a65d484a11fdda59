//! Compiler configuration.

/// Knobs controlling code shape. Every field is an explicit named switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Bind frequently used locals to callee-save registers for the whole method.
    pub global_regs: bool,
    /// Allow null checks that rely on the first dereference faulting.
    pub hw_null_checks: bool,
    /// Emit int/long/float arithmetic inline instead of calling the helpers.
    pub inline_arith: bool,
    /// Emit a safepoint poll (and profiling counter bump) on back edges.
    pub backedge_polls: bool,
    /// Emit JVMTI method entry/exit notifications guarded by the VM flags.
    pub jvmti_events: bool,
    /// Save every scratch register in the prolog (debugger frame-pop support).
    pub save_all_scratch: bool,
    /// Treat `invokeinterface` of a non-interface method as `invokevirtual`.
    pub lenient_interface_dispatch: bool,
    /// Verify register/lock bookkeeping at every block boundary.
    pub vcheck: bool,
    /// Compile only methods whose full name contains this string.
    pub name_filter: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            global_regs: true,
            hw_null_checks: true,
            inline_arith: true,
            backedge_polls: true,
            jvmti_events: true,
            save_all_scratch: false,
            lenient_interface_dispatch: true,
            vcheck: cfg!(debug_assertions),
            name_filter: None,
        }
    }
}

impl CompileOptions {
    /// Whether a method with the given full name passes the name filter.
    pub fn accepts(&self, full_name: &str) -> bool {
        match &self.name_filter {
            Some(filter) => full_name.contains(filter.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_filter() {
        let mut opts = CompileOptions::default();
        assert!(opts.accepts("Foo.bar()V"));
        opts.name_filter = Some("bar".into());
        assert!(opts.accepts("Foo.bar()V"));
        assert!(!opts.accepts("Foo.baz()V"));
    }
}
