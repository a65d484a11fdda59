// This module is a small textual bytecode assembler. It lets tests and the jetc driver
// describe methods as readable listings instead of class files, together with just enough
// of a class model (classes, fields, callable methods) to drive resolution. The parser in
// `parser` turns the text into a Module: a shared constant pool, the declarations, and one
// MethodInfo per `method ... end` block with the bytecode, limits and exception table
// filled in. `stub` provides StubRuntime, a VmAdaptor answering from a Module with fixed,
// predictable addresses so that generated code can be checked instruction by instruction.

//! JVM bytecode assembler and stub VM.
//!
//! # Format
//!
//! ```text
//! ; comments start with a semicolon
//! .class Point size 32
//! .field Point.x I offset 16
//! .static Point.count J
//! .method Point.norm()D vtable 48
//!
//! method static Point.add(II)I
//!     .limit stack 2
//!     iload_0
//!     iload_1
//!     iadd
//!     ireturn
//! end
//! ```
//!
//! Branch operands are labels (`loop:` on its own line or before an instruction).
//! `.catch from to handler [Class]` adds an exception table entry; without a class
//! it catches everything. Constant operands are written as literals (`ldc 7`,
//! `ldc 1.5f`, `ldc2_w 3L`, `ldc2_w 2.5`, `ldc "text"`, `ldc class Point`).

mod parser;
mod stub;

pub use parser::parse;
pub use stub::StubRuntime;

use thiserror::Error;

use crate::core::method::MethodInfo;

/// Errors reported by the assembler, with the 1-based source line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JasmError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },

    #[error("line {line}: unknown instruction '{name}'")]
    UnknownInstruction { line: usize, name: String },

    #[error("line {line}: undefined label '{label}'")]
    UndefinedLabel { line: usize, label: String },

    #[error("line {line}: duplicate label '{label}'")]
    DuplicateLabel { line: usize, label: String },

    #[error("line {line}: branch to '{label}' out of range")]
    BranchRange { line: usize, label: String },

    #[error("line {line}: method not closed with 'end'")]
    Unterminated { line: usize },
}

/// One constant pool entry. Index 0 is unused, as in class files.
#[derive(Debug, Clone, PartialEq)]
pub enum CpEntry {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    Field {
        class: String,
        name: String,
        desc: String,
    },
    Method {
        class: String,
        name: String,
        desc: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

impl ConstantPool {
    /// Index of `entry`, adding it when new.
    pub fn intern(&mut self, entry: CpEntry) -> u16 {
        let found = self.entries.iter().position(|e| match (e, &entry) {
            (CpEntry::Float(a), CpEntry::Float(b)) => a.to_bits() == b.to_bits(),
            (CpEntry::Double(a), CpEntry::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        });
        let idx = match found {
            Some(i) => i,
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        idx as u16 + 1
    }

    pub fn get(&self, cp: u16) -> Option<&CpEntry> {
        (cp as usize).checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDecl {
    pub name: String,
    pub is_interface: bool,
    pub initialized: bool,
    /// Instance size in bytes; 0 derives it from the declared fields.
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub class: String,
    pub name: String,
    pub desc: String,
    pub is_static: bool,
    pub offset: i32,
    pub is_volatile: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDecl {
    pub class: String,
    pub name: String,
    pub desc: String,
    pub vtable_offset: i32,
}

/// An assembled source file.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub pool: ConstantPool,
    pub classes: Vec<ClassDecl>,
    pub fields: Vec<FieldDecl>,
    pub decls: Vec<MethodDecl>,
    /// Methods with bodies, in source order.
    pub methods: Vec<MethodInfo>,
}

impl Module {
    pub fn method(&self, full_name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.full_name() == full_name)
    }

    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_interning() {
        let mut pool = ConstantPool::default();
        let a = pool.intern(CpEntry::Int(3));
        let b = pool.intern(CpEntry::Class("Foo".into()));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(pool.intern(CpEntry::Int(3)), 1);
        assert_eq!(pool.intern(CpEntry::Double(f64::NAN)), 3);
        assert_eq!(pool.intern(CpEntry::Double(f64::NAN)), 3);
        assert_eq!(pool.get(0), None);
        assert_eq!(pool.get(2), Some(&CpEntry::Class("Foo".into())));
        assert_eq!(pool.len(), 3);
    }
}
