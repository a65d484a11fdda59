// This module decodes JVM bytecode. It carries the opcode constants, a name table used by
// logging and by the jasm assembler, and `decode`, which turns the bytes at a PC into an
// Inst with typed operands: local indices (including the `wide` forms), immediates,
// constant-pool indices, absolute branch targets and fully expanded switch tables.
// Classification helpers answer the questions the block builder and code generator ask:
// does the instruction end a basic block, can it fall through, and which PCs can it
// transfer control to.

//! JVM bytecode opcodes and instruction decoding.

use super::error::{CompileError, CompileResult};
use super::jtype::JType;

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_5: u8 = 0x08;
pub const LCONST_0: u8 = 0x09;
pub const LCONST_1: u8 = 0x0a;
pub const FCONST_0: u8 = 0x0b;
pub const FCONST_2: u8 = 0x0d;
pub const DCONST_0: u8 = 0x0e;
pub const DCONST_1: u8 = 0x0f;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const ALOAD_0: u8 = 0x2a;
pub const ALOAD_3: u8 = 0x2d;
pub const IALOAD: u8 = 0x2e;
pub const LALOAD: u8 = 0x2f;
pub const FALOAD: u8 = 0x30;
pub const DALOAD: u8 = 0x31;
pub const AALOAD: u8 = 0x32;
pub const BALOAD: u8 = 0x33;
pub const CALOAD: u8 = 0x34;
pub const SALOAD: u8 = 0x35;
pub const ISTORE: u8 = 0x36;
pub const LSTORE: u8 = 0x37;
pub const FSTORE: u8 = 0x38;
pub const DSTORE: u8 = 0x39;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const ASTORE_0: u8 = 0x4b;
pub const ASTORE_3: u8 = 0x4e;
pub const IASTORE: u8 = 0x4f;
pub const LASTORE: u8 = 0x50;
pub const FASTORE: u8 = 0x51;
pub const DASTORE: u8 = 0x52;
pub const AASTORE: u8 = 0x53;
pub const BASTORE: u8 = 0x54;
pub const CASTORE: u8 = 0x55;
pub const SASTORE: u8 = 0x56;
pub const POP: u8 = 0x57;
pub const POP2: u8 = 0x58;
pub const DUP: u8 = 0x59;
pub const DUP_X1: u8 = 0x5a;
pub const DUP_X2: u8 = 0x5b;
pub const DUP2: u8 = 0x5c;
pub const DUP2_X1: u8 = 0x5d;
pub const DUP2_X2: u8 = 0x5e;
pub const SWAP: u8 = 0x5f;
pub const IADD: u8 = 0x60;
pub const LADD: u8 = 0x61;
pub const FADD: u8 = 0x62;
pub const DADD: u8 = 0x63;
pub const ISUB: u8 = 0x64;
pub const LSUB: u8 = 0x65;
pub const FSUB: u8 = 0x66;
pub const DSUB: u8 = 0x67;
pub const IMUL: u8 = 0x68;
pub const LMUL: u8 = 0x69;
pub const FMUL: u8 = 0x6a;
pub const DMUL: u8 = 0x6b;
pub const IDIV: u8 = 0x6c;
pub const LDIV: u8 = 0x6d;
pub const FDIV: u8 = 0x6e;
pub const DDIV: u8 = 0x6f;
pub const IREM: u8 = 0x70;
pub const LREM: u8 = 0x71;
pub const FREM: u8 = 0x72;
pub const DREM: u8 = 0x73;
pub const INEG: u8 = 0x74;
pub const LNEG: u8 = 0x75;
pub const FNEG: u8 = 0x76;
pub const DNEG: u8 = 0x77;
pub const ISHL: u8 = 0x78;
pub const LSHL: u8 = 0x79;
pub const ISHR: u8 = 0x7a;
pub const LSHR: u8 = 0x7b;
pub const IUSHR: u8 = 0x7c;
pub const LUSHR: u8 = 0x7d;
pub const IAND: u8 = 0x7e;
pub const LAND: u8 = 0x7f;
pub const IOR: u8 = 0x80;
pub const LOR: u8 = 0x81;
pub const IXOR: u8 = 0x82;
pub const LXOR: u8 = 0x83;
pub const IINC: u8 = 0x84;
pub const I2L: u8 = 0x85;
pub const I2F: u8 = 0x86;
pub const I2D: u8 = 0x87;
pub const L2I: u8 = 0x88;
pub const L2F: u8 = 0x89;
pub const L2D: u8 = 0x8a;
pub const F2I: u8 = 0x8b;
pub const F2L: u8 = 0x8c;
pub const F2D: u8 = 0x8d;
pub const D2I: u8 = 0x8e;
pub const D2L: u8 = 0x8f;
pub const D2F: u8 = 0x90;
pub const I2B: u8 = 0x91;
pub const I2C: u8 = 0x92;
pub const I2S: u8 = 0x93;
pub const LCMP: u8 = 0x94;
pub const FCMPL: u8 = 0x95;
pub const FCMPG: u8 = 0x96;
pub const DCMPL: u8 = 0x97;
pub const DCMPG: u8 = 0x98;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IFLT: u8 = 0x9b;
pub const IFGE: u8 = 0x9c;
pub const IFGT: u8 = 0x9d;
pub const IFLE: u8 = 0x9e;
pub const IF_ICMPEQ: u8 = 0x9f;
pub const IF_ICMPNE: u8 = 0xa0;
pub const IF_ICMPLT: u8 = 0xa1;
pub const IF_ICMPGE: u8 = 0xa2;
pub const IF_ICMPGT: u8 = 0xa3;
pub const IF_ICMPLE: u8 = 0xa4;
pub const IF_ACMPEQ: u8 = 0xa5;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ARRAYLENGTH: u8 = 0xbe;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const MONITORENTER: u8 = 0xc2;
pub const MONITOREXIT: u8 = 0xc3;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

const NAMES: [&str; 202] = [
    "nop", "aconst_null", "iconst_m1", "iconst_0", "iconst_1", "iconst_2", "iconst_3",
    "iconst_4", "iconst_5", "lconst_0", "lconst_1", "fconst_0", "fconst_1", "fconst_2",
    "dconst_0", "dconst_1", "bipush", "sipush", "ldc", "ldc_w", "ldc2_w", "iload", "lload",
    "fload", "dload", "aload", "iload_0", "iload_1", "iload_2", "iload_3", "lload_0",
    "lload_1", "lload_2", "lload_3", "fload_0", "fload_1", "fload_2", "fload_3", "dload_0",
    "dload_1", "dload_2", "dload_3", "aload_0", "aload_1", "aload_2", "aload_3", "iaload",
    "laload", "faload", "daload", "aaload", "baload", "caload", "saload", "istore", "lstore",
    "fstore", "dstore", "astore", "istore_0", "istore_1", "istore_2", "istore_3", "lstore_0",
    "lstore_1", "lstore_2", "lstore_3", "fstore_0", "fstore_1", "fstore_2", "fstore_3",
    "dstore_0", "dstore_1", "dstore_2", "dstore_3", "astore_0", "astore_1", "astore_2",
    "astore_3", "iastore", "lastore", "fastore", "dastore", "aastore", "bastore", "castore",
    "sastore", "pop", "pop2", "dup", "dup_x1", "dup_x2", "dup2", "dup2_x1", "dup2_x2", "swap",
    "iadd", "ladd", "fadd", "dadd", "isub", "lsub", "fsub", "dsub", "imul", "lmul", "fmul",
    "dmul", "idiv", "ldiv", "fdiv", "ddiv", "irem", "lrem", "frem", "drem", "ineg", "lneg",
    "fneg", "dneg", "ishl", "lshl", "ishr", "lshr", "iushr", "lushr", "iand", "land", "ior",
    "lor", "ixor", "lxor", "iinc", "i2l", "i2f", "i2d", "l2i", "l2f", "l2d", "f2i", "f2l",
    "f2d", "d2i", "d2l", "d2f", "i2b", "i2c", "i2s", "lcmp", "fcmpl", "fcmpg", "dcmpl",
    "dcmpg", "ifeq", "ifne", "iflt", "ifge", "ifgt", "ifle", "if_icmpeq", "if_icmpne",
    "if_icmplt", "if_icmpge", "if_icmpgt", "if_icmple", "if_acmpeq", "if_acmpne", "goto",
    "jsr", "ret", "tableswitch", "lookupswitch", "ireturn", "lreturn", "freturn", "dreturn",
    "areturn", "return", "getstatic", "putstatic", "getfield", "putfield", "invokevirtual",
    "invokespecial", "invokestatic", "invokeinterface", "invokedynamic", "new", "newarray",
    "anewarray", "arraylength", "athrow", "checkcast", "instanceof", "monitorenter",
    "monitorexit", "wide", "multianewarray", "ifnull", "ifnonnull", "goto_w", "jsr_w",
];

pub fn opcode_name(opcode: u8) -> &'static str {
    NAMES.get(opcode as usize).copied().unwrap_or("<invalid>")
}

pub fn opcode_by_name(name: &str) -> Option<u8> {
    NAMES.iter().position(|&n| n == name).map(|i| i as u8)
}

/// Decoded operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstData {
    None,
    Local(u16),
    Iinc { local: u16, delta: i16 },
    Imm(i32),
    Cp(u16),
    Invoke { cp: u16, count: u8 },
    NewArray(u8),
    MultiANewArray { cp: u16, dims: u8 },
    Branch(u32),
    TableSwitch {
        default: u32,
        low: i32,
        high: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub pc: u32,
    /// PC of the following instruction.
    pub next: u32,
    pub opcode: u8,
    pub wide: bool,
    pub data: InstData,
}

impl Inst {
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    pub fn local(&self) -> Option<u16> {
        match self.data {
            InstData::Local(i) => Some(i),
            InstData::Iinc { local, .. } => Some(local),
            _ => None,
        }
    }

    pub fn cp(&self) -> Option<u16> {
        match self.data {
            InstData::Cp(cp) => Some(cp),
            InstData::Invoke { cp, .. } => Some(cp),
            InstData::MultiANewArray { cp, .. } => Some(cp),
            _ => None,
        }
    }

    /// Local slot, type and store-ness of a local load, store, `iinc` or `ret`.
    pub fn local_access(&self) -> Option<(usize, JType, bool)> {
        const TYPES: [JType; 5] = [JType::I32, JType::I64, JType::F32, JType::F64, JType::Ref];
        let op = self.opcode;
        let (jt, idx, store) = match op {
            ILOAD..=ALOAD => (TYPES[(op - ILOAD) as usize], self.local()?, false),
            ILOAD_0..=ALOAD_3 => {
                let k = op - ILOAD_0;
                (TYPES[(k / 4) as usize], (k % 4) as u16, false)
            }
            ISTORE..=ASTORE => (TYPES[(op - ISTORE) as usize], self.local()?, true),
            ISTORE_0..=ASTORE_3 => {
                let k = op - ISTORE_0;
                (TYPES[(k / 4) as usize], (k % 4) as u16, true)
            }
            IINC => (JType::I32, self.local()?, true),
            RET => (JType::RetAddr, self.local()?, false),
            _ => return None,
        };
        Some((idx as usize, jt, store))
    }

    /// Explicit control transfer targets, including switch defaults.
    pub fn targets(&self) -> Vec<u32> {
        match &self.data {
            InstData::Branch(t) => vec![*t],
            InstData::TableSwitch {
                default, targets, ..
            } => {
                let mut v = vec![*default];
                v.extend(targets.iter().copied());
                v
            }
            InstData::LookupSwitch { default, pairs } => {
                let mut v = vec![*default];
                v.extend(pairs.iter().map(|p| p.1));
                v
            }
            _ => Vec::new(),
        }
    }

    pub fn is_return(&self) -> bool {
        (IRETURN..=RETURN).contains(&self.opcode)
    }

    pub fn is_jsr(&self) -> bool {
        self.opcode == JSR || self.opcode == JSR_W
    }

    pub fn is_cond_branch(&self) -> bool {
        (IFEQ..=IF_ACMPNE).contains(&self.opcode)
            || self.opcode == IFNULL
            || self.opcode == IFNONNULL
    }

    /// Whether execution can continue at `next`.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.opcode,
            GOTO | GOTO_W
                | JSR
                | JSR_W
                | RET
                | TABLESWITCH
                | LOOKUPSWITCH
                | ATHROW
                | IRETURN..=RETURN
        )
    }

    /// Whether the instruction can raise a guest exception.
    pub fn may_throw(&self) -> bool {
        matches!(
            self.opcode,
            IALOAD..=SALOAD
                | IASTORE..=SASTORE
                | IDIV
                | LDIV
                | IREM
                | LREM
                | GETSTATIC..=INVOKEDYNAMIC
                | NEW..=MONITOREXIT
                | MULTIANEWARRAY
                | LDC
                | LDC_W
        )
    }

    /// Whether the instruction terminates its basic block.
    pub fn ends_block(&self) -> bool {
        !self.falls_through() || self.is_cond_branch()
    }
}

fn u1(code: &[u8], at: usize, pc: u32) -> CompileResult<u8> {
    code.get(at).copied().ok_or(CompileError::TruncatedBytecode { pc })
}

fn u2(code: &[u8], at: usize, pc: u32) -> CompileResult<u16> {
    Ok(u16::from_be_bytes([u1(code, at, pc)?, u1(code, at + 1, pc)?]))
}

fn s4(code: &[u8], at: usize, pc: u32) -> CompileResult<i32> {
    Ok(i32::from_be_bytes([
        u1(code, at, pc)?,
        u1(code, at + 1, pc)?,
        u1(code, at + 2, pc)?,
        u1(code, at + 3, pc)?,
    ]))
}

fn target(code: &[u8], pc: u32, offset: i64) -> CompileResult<u32> {
    let t = pc as i64 + offset;
    if t < 0 || t as usize >= code.len() {
        return Err(CompileError::BadBranchTarget { pc, target: t });
    }
    Ok(t as u32)
}

/// Decode the instruction at `pc`.
pub fn decode(code: &[u8], pc: u32) -> CompileResult<Inst> {
    let at = pc as usize;
    let opcode = u1(code, at, pc)?;
    let (data, len, wide, opcode) = match opcode {
        BIPUSH => (InstData::Imm(u1(code, at + 1, pc)? as i8 as i32), 2, false, opcode),
        SIPUSH => (InstData::Imm(u2(code, at + 1, pc)? as i16 as i32), 3, false, opcode),
        LDC => (InstData::Cp(u1(code, at + 1, pc)? as u16), 2, false, opcode),
        LDC_W | LDC2_W => (InstData::Cp(u2(code, at + 1, pc)?), 3, false, opcode),
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
            (InstData::Local(u1(code, at + 1, pc)? as u16), 2, false, opcode)
        }
        IINC => (
            InstData::Iinc {
                local: u1(code, at + 1, pc)? as u16,
                delta: u1(code, at + 2, pc)? as i8 as i16,
            },
            3,
            false,
            opcode,
        ),
        WIDE => {
            let op = u1(code, at + 1, pc)?;
            match op {
                IINC => (
                    InstData::Iinc {
                        local: u2(code, at + 2, pc)?,
                        delta: u2(code, at + 4, pc)? as i16,
                    },
                    6,
                    true,
                    op,
                ),
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
                    (InstData::Local(u2(code, at + 2, pc)?), 4, true, op)
                }
                _ => return Err(CompileError::UnknownOpcode { pc, opcode: op }),
            }
        }
        IFEQ..=JSR | IFNULL | IFNONNULL => {
            let off = u2(code, at + 1, pc)? as i16 as i64;
            (InstData::Branch(target(code, pc, off)?), 3, false, opcode)
        }
        GOTO_W | JSR_W => {
            let off = s4(code, at + 1, pc)? as i64;
            (InstData::Branch(target(code, pc, off)?), 5, false, opcode)
        }
        TABLESWITCH => {
            let base = (at + 4) & !3;
            let default = target(code, pc, s4(code, base, pc)? as i64)?;
            let low = s4(code, base + 4, pc)?;
            let high = s4(code, base + 8, pc)?;
            if high < low {
                return Err(CompileError::BadBranchTarget {
                    pc,
                    target: high as i64,
                });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for i in 0..count {
                targets.push(target(code, pc, s4(code, base + 12 + 4 * i, pc)? as i64)?);
            }
            let len = base + 12 + 4 * count - at;
            (
                InstData::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                },
                len,
                false,
                opcode,
            )
        }
        LOOKUPSWITCH => {
            let base = (at + 4) & !3;
            let default = target(code, pc, s4(code, base, pc)? as i64)?;
            let npairs = s4(code, base + 4, pc)?;
            if npairs < 0 {
                return Err(CompileError::TruncatedBytecode { pc });
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for i in 0..npairs as usize {
                let key = s4(code, base + 8 + 8 * i, pc)?;
                let off = s4(code, base + 12 + 8 * i, pc)?;
                pairs.push((key, target(code, pc, off as i64)?));
            }
            let len = base + 8 + 8 * npairs as usize - at;
            (InstData::LookupSwitch { default, pairs }, len, false, opcode)
        }
        GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
            (InstData::Cp(u2(code, at + 1, pc)?), 3, false, opcode)
        }
        INVOKEINTERFACE => (
            InstData::Invoke {
                cp: u2(code, at + 1, pc)?,
                count: u1(code, at + 3, pc)?,
            },
            5,
            false,
            opcode,
        ),
        INVOKEDYNAMIC => (InstData::Cp(u2(code, at + 1, pc)?), 5, false, opcode),
        NEWARRAY => (InstData::NewArray(u1(code, at + 1, pc)?), 2, false, opcode),
        MULTIANEWARRAY => (
            InstData::MultiANewArray {
                cp: u2(code, at + 1, pc)?,
                dims: u1(code, at + 3, pc)?,
            },
            4,
            false,
            opcode,
        ),
        0xca..=0xff => return Err(CompileError::UnknownOpcode { pc, opcode }),
        _ => (InstData::None, 1, false, opcode),
    };
    if at + len > code.len() {
        return Err(CompileError::TruncatedBytecode { pc });
    }
    Ok(Inst {
        pc,
        next: (at + len) as u32,
        opcode,
        wide,
        data,
    })
}

/// Decode every instruction of `code` in order.
pub fn decode_all(code: &[u8]) -> CompileResult<Vec<Inst>> {
    let mut insts = Vec::new();
    let mut pc = 0u32;
    while (pc as usize) < code.len() {
        let inst = decode(code, pc)?;
        pc = inst.next;
        insts.push(inst);
    }
    Ok(insts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        assert_eq!(opcode_name(IADD), "iadd");
        assert_eq!(opcode_name(JSR_W), "jsr_w");
        assert_eq!(opcode_by_name("invokeinterface"), Some(INVOKEINTERFACE));
        assert_eq!(opcode_by_name("dup2_x2"), Some(DUP2_X2));
        assert_eq!(opcode_name(0xfe), "<invalid>");
    }

    #[test]
    fn test_simple_forms() {
        let code = [BIPUSH, 0xfb, SIPUSH, 0x80, 0x00, ILOAD, 4, IINC, 2, 0xff, RETURN];
        let insts = decode_all(&code).unwrap();
        assert_eq!(insts[0].data, InstData::Imm(-5));
        assert_eq!(insts[1].data, InstData::Imm(-32768));
        assert_eq!(insts[2].data, InstData::Local(4));
        assert_eq!(insts[3].data, InstData::Iinc { local: 2, delta: -1 });
        assert!(insts[4].is_return());
        assert!(!insts[4].falls_through());
    }

    #[test]
    fn test_local_access_short_and_long_forms() {
        let code = [LLOAD, 4, ALOAD_3, 0x47, ISTORE, 9, IINC, 1, 2, RET, 5];
        let insts = decode_all(&code).unwrap();
        assert_eq!(insts[0].local_access(), Some((4, JType::I64, false)));
        assert_eq!(insts[1].local_access(), Some((3, JType::Ref, false)));
        assert_eq!(insts[2].local_access(), Some((0, JType::F64, true)));
        assert_eq!(insts[3].local_access(), Some((9, JType::I32, true)));
        assert_eq!(insts[4].local_access(), Some((1, JType::I32, true)));
        assert_eq!(insts[5].local_access(), Some((5, JType::RetAddr, false)));
        assert_eq!(decode(&[IADD], 0).unwrap().local_access(), None);
    }

    #[test]
    fn test_wide_forms() {
        let code = [WIDE, ILOAD, 0x01, 0x00, WIDE, IINC, 0x00, 0x05, 0x01, 0x00, RETURN];
        let insts = decode_all(&code).unwrap();
        assert_eq!(insts[0].opcode, ILOAD);
        assert!(insts[0].wide);
        assert_eq!(insts[0].data, InstData::Local(256));
        assert_eq!(insts[1].data, InstData::Iinc { local: 5, delta: 256 });
        assert_eq!(insts[1].next, 10);
    }

    #[test]
    fn test_branch_targets() {
        // 0: iconst_0; 1: ifeq +4 -> 5; 4: nop; 5: goto -5 -> 0
        let code = [ICONST_0, IFEQ, 0x00, 0x04, NOP, GOTO, 0xff, 0xfb];
        let insts = decode_all(&code).unwrap();
        assert_eq!(insts[1].targets(), vec![5]);
        assert!(insts[1].is_cond_branch());
        assert!(insts[1].ends_block());
        assert!(insts[1].falls_through());
        assert_eq!(insts[3].targets(), vec![0]);
        assert!(!insts[3].falls_through());

        let bad = [GOTO, 0x00, 0x10];
        assert!(matches!(
            decode(&bad, 0),
            Err(CompileError::BadBranchTarget { .. })
        ));
    }

    #[test]
    fn test_tableswitch_padding() {
        // pc 0: iload_0, pc 1: tableswitch, pad to 4
        let mut code = vec![ILOAD_0, TABLESWITCH, 0, 0];
        code.extend_from_slice(&23i32.to_be_bytes()); // default -> 24
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&1i32.to_be_bytes()); // high
        code.extend_from_slice(&23i32.to_be_bytes());
        code.extend_from_slice(&23i32.to_be_bytes());
        code.push(RETURN);
        let inst = decode(&code, 1).unwrap();
        assert_eq!(inst.next, 24);
        match inst.data {
            InstData::TableSwitch {
                default,
                low,
                high,
                ref targets,
            } => {
                assert_eq!((default, low, high), (24, 0, 1));
                assert_eq!(targets, &vec![24, 24]);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(matches!(
            decode(&[SIPUSH, 0x01], 0),
            Err(CompileError::TruncatedBytecode { pc: 0 })
        ));
        assert!(matches!(
            decode(&[0xcb], 0),
            Err(CompileError::UnknownOpcode { opcode: 0xcb, .. })
        ));
    }
}
