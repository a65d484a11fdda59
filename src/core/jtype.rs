//! JVM value types as seen by the code generator.

use std::fmt;

/// Native word size of the code the abstract frame is modelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub fn bytes(self) -> u32 {
        match self {
            WordSize::W32 => 4,
            WordSize::W64 => 8,
        }
    }
}

/// Type tag of a stack slot, local variable, field or array element.
///
/// Sub-int types only appear as field/array element types; on the operand
/// stack they are widened to `I32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JType {
    Bool,
    I8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Ref,
    RetAddr,
    Void,
}

impl JType {
    /// Long and double take two JVM slots.
    pub fn is_wide(self) -> bool {
        matches!(self, JType::I64 | JType::F64)
    }

    /// Wide types that do not fit a native word and are carried as lo/hi halves.
    pub fn is_big(self, word: WordSize) -> bool {
        word == WordSize::W32 && self.is_wide()
    }

    pub fn is_f(self) -> bool {
        matches!(self, JType::F32 | JType::F64)
    }

    /// Whether a value of this type is a GC root.
    pub fn is_ref(self) -> bool {
        self == JType::Ref
    }

    pub fn slots(self) -> usize {
        match self {
            JType::Void => 0,
            t if t.is_wide() => 2,
            _ => 1,
        }
    }

    /// Computational type on the operand stack.
    pub fn stack_type(self) -> JType {
        match self {
            JType::Bool | JType::I8 | JType::I16 | JType::U16 => JType::I32,
            t => t,
        }
    }

    /// Size of the value in memory (fields and array elements).
    pub fn size_bytes(self) -> u32 {
        match self {
            JType::Bool | JType::I8 => 1,
            JType::I16 | JType::U16 => 2,
            JType::I32 | JType::F32 => 4,
            JType::I64 | JType::F64 | JType::Ref | JType::RetAddr => 8,
            JType::Void => 0,
        }
    }

    /// Type of a field descriptor's leading character.
    pub fn from_descriptor_char(c: u8) -> Option<JType> {
        Some(match c {
            b'Z' => JType::Bool,
            b'B' => JType::I8,
            b'S' => JType::I16,
            b'C' => JType::U16,
            b'I' => JType::I32,
            b'J' => JType::I64,
            b'F' => JType::F32,
            b'D' => JType::F64,
            b'L' | b'[' => JType::Ref,
            b'V' => JType::Void,
            _ => return None,
        })
    }

    /// Element type of a `newarray` atype operand.
    pub fn from_atype(atype: u8) -> Option<JType> {
        Some(match atype {
            4 => JType::Bool,
            5 => JType::U16,
            6 => JType::F32,
            7 => JType::F64,
            8 => JType::I8,
            9 => JType::I16,
            10 => JType::I32,
            11 => JType::I64,
            _ => return None,
        })
    }
}

impl fmt::Display for JType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JType::Bool => "z",
            JType::I8 => "i8",
            JType::I16 => "i16",
            JType::U16 => "u16",
            JType::I32 => "i32",
            JType::I64 => "i64",
            JType::F32 => "flt",
            JType::F64 => "dbl",
            JType::Ref => "jobj",
            JType::RetAddr => "retaddr",
            JType::Void => "void",
        };
        f.write_str(s)
    }
}

/// Parse a method descriptor such as `(IJLjava/lang/String;)D`.
///
/// Returns the argument types (without `this`) and the return type.
pub fn parse_method_descriptor(desc: &str) -> Option<(Vec<JType>, JType)> {
    let bytes = desc.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut args = Vec::new();
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        let (jt, next) = parse_field_type(bytes, i)?;
        args.push(jt);
        i = next;
    }
    if i >= bytes.len() {
        return None;
    }
    let (ret, end) = parse_field_type(bytes, i + 1)?;
    if end != bytes.len() {
        return None;
    }
    Some((args, ret))
}

fn parse_field_type(bytes: &[u8], mut i: usize) -> Option<(JType, usize)> {
    let c = *bytes.get(i)?;
    let jt = JType::from_descriptor_char(c)?;
    match c {
        b'L' => {
            while *bytes.get(i)? != b';' {
                i += 1;
            }
            Some((jt, i + 1))
        }
        b'[' => {
            while *bytes.get(i)? == b'[' {
                i += 1;
            }
            let (_, next) = parse_field_type(bytes, i)?;
            Some((JType::Ref, next))
        }
        _ => Some((jt, i + 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_and_big() {
        assert!(JType::I64.is_wide());
        assert!(JType::F64.is_wide());
        assert!(!JType::Ref.is_wide());
        assert!(JType::I64.is_big(WordSize::W32));
        assert!(!JType::I64.is_big(WordSize::W64));
        assert!(!JType::I32.is_big(WordSize::W32));
        assert_eq!(JType::F64.slots(), 2);
        assert_eq!(JType::Void.slots(), 0);
    }

    #[test]
    fn test_stack_type_widening() {
        assert_eq!(JType::I8.stack_type(), JType::I32);
        assert_eq!(JType::U16.stack_type(), JType::I32);
        assert_eq!(JType::Bool.stack_type(), JType::I32);
        assert_eq!(JType::F32.stack_type(), JType::F32);
    }

    #[test]
    fn test_method_descriptor() {
        let (args, ret) = parse_method_descriptor("(IJLjava/lang/String;[[D)V").unwrap();
        assert_eq!(args, vec![JType::I32, JType::I64, JType::Ref, JType::Ref]);
        assert_eq!(ret, JType::Void);

        let (args, ret) = parse_method_descriptor("()Ljava/lang/Object;").unwrap();
        assert!(args.is_empty());
        assert_eq!(ret, JType::Ref);

        assert!(parse_method_descriptor("I)V").is_none());
        assert!(parse_method_descriptor("(I").is_none());
        assert!(parse_method_descriptor("(Q)V").is_none());
    }
}
