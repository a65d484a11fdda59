// This module provides the x86-64 implementation of the Encoder trait on top of the
// iced-x86 low-level instruction API. X64Encoder converts abstract registers (Ar) and
// operands (Opnd/MemRef) to iced Registers and MemoryOperands, picks the concrete opcode
// form for each operand combination and size (imm8 vs imm32 ALU forms, r/m directions,
// 8/16/32/64-bit register views), encodes every instruction immediately at the current
// offset and appends it to a flat code buffer. Emitting instructions one at a time keeps
// the native offset of every bytecode and call site known as soon as it is generated, which
// the PC map, GC points and patch lists rely on. Branches and RIP-relative address loads are
// emitted in their rel32 form and patched in place once targets are known. r11 and xmm15
// are reserved as encoder temporaries for 64-bit immediates, memory-to-memory moves and
// absolute call targets; all code is position independent and encoded at offset 0.

//! x86-64 instruction encoding using iced-x86.

use crate::core::encoder::{
    AluOp, CallTarget, Cond, EncResult, Encoder, FpOp, OpSize, PatchRef, ShiftOp,
};
use crate::core::register_file::Ar;
use crate::core::val::{MemRef, Opnd};
use iced_x86::{Code, IcedError, Instruction, MemoryOperand, Register};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Register of the wrong bank or size for the operation.
    InvalidRegister(Ar),
    /// Operand combination the instruction set cannot express.
    UnsupportedInstruction(&'static str),
    /// Error reported by iced-x86.
    AssemblyError(String),
    /// Scale or register combination not encodable as an address.
    InvalidMemoryOperand,
    /// A patched displacement does not fit 32 bits or lies outside the buffer.
    PatchOutOfRange { at: u32, target: u32 },
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister(r) => write!(f, "Invalid register {r:?} for operation"),
            EncodingError::UnsupportedInstruction(what) => {
                write!(f, "Unsupported instruction or operand combination: {what}")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidMemoryOperand => write!(f, "Invalid memory operand"),
            EncodingError::PatchOutOfRange { at, target } => {
                write!(f, "Patch at {at:#x} cannot reach {target:#x}")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

/// Encoder temporary for wide immediates and absolute call targets.
pub const TMP_GP: Ar = Ar::R11;
pub const TMP_FP: Ar = Ar::XMM15;

/// Opcode forms of one two-operand ALU instruction.
struct AluForms {
    rm32_imm8: Code,
    rm64_imm8: Code,
    rm32_imm32: Code,
    rm64_imm32: Code,
    r32_rm32: Code,
    r64_rm64: Code,
    rm32_r32: Code,
    rm64_r64: Code,
}

fn alu_forms(op: AluOp) -> AluForms {
    match op {
        AluOp::Add => AluForms {
            rm32_imm8: Code::Add_rm32_imm8,
            rm64_imm8: Code::Add_rm64_imm8,
            rm32_imm32: Code::Add_rm32_imm32,
            rm64_imm32: Code::Add_rm64_imm32,
            r32_rm32: Code::Add_r32_rm32,
            r64_rm64: Code::Add_r64_rm64,
            rm32_r32: Code::Add_rm32_r32,
            rm64_r64: Code::Add_rm64_r64,
        },
        AluOp::Sub => AluForms {
            rm32_imm8: Code::Sub_rm32_imm8,
            rm64_imm8: Code::Sub_rm64_imm8,
            rm32_imm32: Code::Sub_rm32_imm32,
            rm64_imm32: Code::Sub_rm64_imm32,
            r32_rm32: Code::Sub_r32_rm32,
            r64_rm64: Code::Sub_r64_rm64,
            rm32_r32: Code::Sub_rm32_r32,
            rm64_r64: Code::Sub_rm64_r64,
        },
        AluOp::And => AluForms {
            rm32_imm8: Code::And_rm32_imm8,
            rm64_imm8: Code::And_rm64_imm8,
            rm32_imm32: Code::And_rm32_imm32,
            rm64_imm32: Code::And_rm64_imm32,
            r32_rm32: Code::And_r32_rm32,
            r64_rm64: Code::And_r64_rm64,
            rm32_r32: Code::And_rm32_r32,
            rm64_r64: Code::And_rm64_r64,
        },
        AluOp::Or => AluForms {
            rm32_imm8: Code::Or_rm32_imm8,
            rm64_imm8: Code::Or_rm64_imm8,
            rm32_imm32: Code::Or_rm32_imm32,
            rm64_imm32: Code::Or_rm64_imm32,
            r32_rm32: Code::Or_r32_rm32,
            r64_rm64: Code::Or_r64_rm64,
            rm32_r32: Code::Or_rm32_r32,
            rm64_r64: Code::Or_rm64_r64,
        },
        AluOp::Xor => AluForms {
            rm32_imm8: Code::Xor_rm32_imm8,
            rm64_imm8: Code::Xor_rm64_imm8,
            rm32_imm32: Code::Xor_rm32_imm32,
            rm64_imm32: Code::Xor_rm64_imm32,
            r32_rm32: Code::Xor_r32_rm32,
            r64_rm64: Code::Xor_r64_rm64,
            rm32_r32: Code::Xor_rm32_r32,
            rm64_r64: Code::Xor_rm64_r64,
        },
        AluOp::Cmp => AluForms {
            rm32_imm8: Code::Cmp_rm32_imm8,
            rm64_imm8: Code::Cmp_rm64_imm8,
            rm32_imm32: Code::Cmp_rm32_imm32,
            rm64_imm32: Code::Cmp_rm64_imm32,
            r32_rm32: Code::Cmp_r32_rm32,
            r64_rm64: Code::Cmp_r64_rm64,
            rm32_r32: Code::Cmp_rm32_r32,
            rm64_r64: Code::Cmp_rm64_r64,
        },
    }
}

fn jcc_code(cond: Cond) -> Code {
    match cond {
        Cond::Eq => Code::Je_rel32_64,
        Cond::Ne => Code::Jne_rel32_64,
        Cond::Lt => Code::Jl_rel32_64,
        Cond::Ge => Code::Jge_rel32_64,
        Cond::Gt => Code::Jg_rel32_64,
        Cond::Le => Code::Jle_rel32_64,
        Cond::B => Code::Jb_rel32_64,
        Cond::Ae => Code::Jae_rel32_64,
        Cond::A => Code::Ja_rel32_64,
        Cond::Be => Code::Jbe_rel32_64,
    }
}

fn fits_i8(v: i64) -> bool {
    i8::try_from(v).is_ok()
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// x86-64 instruction encoder.
pub struct X64Encoder {
    enc: iced_x86::Encoder,
    buf: Vec<u8>,
}

impl Default for X64Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl X64Encoder {
    pub fn new() -> Self {
        Self {
            enc: iced_x86::Encoder::new(64),
            buf: Vec::with_capacity(256),
        }
    }

    fn gp(&self, ar: Ar, sz: OpSize) -> EncResult<Register> {
        if ar.is_fp() {
            return Err(EncodingError::InvalidRegister(ar));
        }
        let i = ar.hw() as usize;
        Ok(match sz {
            OpSize::S8 => GP8[i],
            OpSize::S16 => GP16[i],
            OpSize::S32 => GP32[i],
            OpSize::S64 => GP64[i],
        })
    }

    fn xmm(&self, ar: Ar) -> EncResult<Register> {
        if !ar.is_fp() {
            return Err(EncodingError::InvalidRegister(ar));
        }
        Ok(XMM[ar.hw() as usize])
    }

    fn mem(&self, m: &MemRef) -> EncResult<MemoryOperand> {
        let base = match m.base {
            Some(b) => self.gp(b, OpSize::S64)?,
            None => Register::None,
        };
        let index = match m.index {
            Some(i) if i == Ar::RSP => return Err(EncodingError::InvalidMemoryOperand),
            Some(i) => self.gp(i, OpSize::S64)?,
            None => Register::None,
        };
        if !matches!(m.scale, 1 | 2 | 4 | 8) {
            return Err(EncodingError::InvalidMemoryOperand);
        }
        Ok(MemoryOperand::new(
            base,
            index,
            m.scale as u32,
            m.disp as i64,
            1,
            false,
            Register::None,
        ))
    }

    /// Encode one instruction at the current offset; returns its length.
    fn emit(&mut self, instr: Instruction) -> EncResult<usize> {
        let rip = self.buf.len() as u64;
        let len = self.enc.encode(&instr, rip)?;
        self.buf.extend_from_slice(&self.enc.take_buffer());
        Ok(len)
    }

    /// Emit a rel32-carrying instruction and return the displacement position.
    fn emit_rel32(&mut self, instr: Instruction) -> EncResult<PatchRef> {
        self.emit(instr)?;
        Ok(PatchRef(self.buf.len() as u32 - 4))
    }

    fn mov_tmp_imm(&mut self, imm: i64) -> EncResult<()> {
        self.mov(OpSize::S64, Opnd::Reg(TMP_GP), Opnd::Imm(imm))
    }

    fn check_int_size(&self, sz: OpSize, what: &'static str) -> EncResult<bool> {
        match sz {
            OpSize::S32 => Ok(false),
            OpSize::S64 => Ok(true),
            _ => Err(EncodingError::UnsupportedInstruction(what)),
        }
    }

    fn rm(&self, op: &Opnd, sz: OpSize) -> EncResult<RmOpnd> {
        match op {
            Opnd::Reg(r) => Ok(RmOpnd::Reg(self.gp(*r, sz)?)),
            Opnd::Mem(m) => Ok(RmOpnd::Mem(self.mem(m)?)),
            Opnd::Imm(_) => Err(EncodingError::UnsupportedInstruction("immediate destination")),
        }
    }
}

/// A register or memory operand already converted to iced form.
enum RmOpnd {
    Reg(Register),
    Mem(MemoryOperand),
}

impl RmOpnd {
    fn with0(&self, code: Code) -> EncResult<Instruction> {
        Ok(match self {
            RmOpnd::Reg(r) => Instruction::with1(code, *r)?,
            RmOpnd::Mem(m) => Instruction::with1(code, *m)?,
        })
    }

    fn with_reg(&self, code: Code, reg: Register) -> EncResult<Instruction> {
        Ok(match self {
            RmOpnd::Reg(r) => Instruction::with2(code, *r, reg)?,
            RmOpnd::Mem(m) => Instruction::with2(code, *m, reg)?,
        })
    }

    fn with_i32(&self, code: Code, imm: i32) -> EncResult<Instruction> {
        Ok(match self {
            RmOpnd::Reg(r) => Instruction::with2(code, *r, imm)?,
            RmOpnd::Mem(m) => Instruction::with2(code, *m, imm)?,
        })
    }

    fn with_u32(&self, code: Code, imm: u32) -> EncResult<Instruction> {
        Ok(match self {
            RmOpnd::Reg(r) => Instruction::with2(code, *r, imm)?,
            RmOpnd::Mem(m) => Instruction::with2(code, *m, imm)?,
        })
    }

    /// `reg <- rm` form.
    fn as_src(&self, code: Code, dst: Register) -> EncResult<Instruction> {
        Ok(match self {
            RmOpnd::Reg(r) => Instruction::with2(code, dst, *r)?,
            RmOpnd::Mem(m) => Instruction::with2(code, dst, *m)?,
        })
    }
}

impl Encoder for X64Encoder {
    fn ip(&self) -> u32 {
        self.buf.len() as u32
    }

    fn code(&self) -> &[u8] {
        &self.buf
    }

    fn take_code(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn scratch_gp(&self) -> Ar {
        TMP_GP
    }

    fn scratch_fp(&self) -> Ar {
        TMP_FP
    }

    fn mov(&mut self, sz: OpSize, dst: Opnd, src: Opnd) -> EncResult<()> {
        let (rm_r, r_rm, rm_imm) = match sz {
            OpSize::S8 => (Code::Mov_rm8_r8, Code::Mov_r8_rm8, Code::Mov_rm8_imm8),
            OpSize::S16 => (Code::Mov_rm16_r16, Code::Mov_r16_rm16, Code::Mov_rm16_imm16),
            OpSize::S32 => (Code::Mov_rm32_r32, Code::Mov_r32_rm32, Code::Mov_rm32_imm32),
            OpSize::S64 => (Code::Mov_rm64_r64, Code::Mov_r64_rm64, Code::Mov_rm64_imm32),
        };
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) => {
                if d == s && sz == OpSize::S64 {
                    return Ok(());
                }
                let (d, s) = (self.gp(d, sz)?, self.gp(s, sz)?);
                self.emit(Instruction::with2(r_rm, d, s)?)?;
            }
            (Opnd::Reg(d), Opnd::Mem(m)) => {
                let (d, m) = (self.gp(d, sz)?, self.mem(&m)?);
                self.emit(Instruction::with2(r_rm, d, m)?)?;
            }
            (Opnd::Mem(m), Opnd::Reg(s)) => {
                let (m, s) = (self.mem(&m)?, self.gp(s, sz)?);
                self.emit(Instruction::with2(rm_r, m, s)?)?;
            }
            (Opnd::Reg(d), Opnd::Imm(imm)) => match sz {
                OpSize::S64 if (0..=u32::MAX as i64).contains(&imm) => {
                    let d = self.gp(d, OpSize::S32)?;
                    self.emit(Instruction::with2(Code::Mov_r32_imm32, d, imm as u32)?)?;
                }
                OpSize::S64 if fits_i32(imm) => {
                    let d = self.gp(d, OpSize::S64)?;
                    self.emit(Instruction::with2(Code::Mov_rm64_imm32, d, imm as i32)?)?;
                }
                OpSize::S64 => {
                    let d = self.gp(d, OpSize::S64)?;
                    self.emit(Instruction::with2(Code::Mov_r64_imm64, d, imm as u64)?)?;
                }
                OpSize::S32 => {
                    let d = self.gp(d, OpSize::S32)?;
                    self.emit(Instruction::with2(Code::Mov_r32_imm32, d, imm as u32)?)?;
                }
                OpSize::S16 => {
                    let d = self.gp(d, OpSize::S16)?;
                    self.emit(Instruction::with2(Code::Mov_r16_imm16, d, imm as u16 as u32)?)?;
                }
                OpSize::S8 => {
                    let d = self.gp(d, OpSize::S8)?;
                    self.emit(Instruction::with2(Code::Mov_r8_imm8, d, imm as u8 as u32)?)?;
                }
            },
            (Opnd::Mem(m), Opnd::Imm(imm)) => {
                if sz == OpSize::S64 && !fits_i32(imm) {
                    if m.uses(TMP_GP) {
                        return Err(EncodingError::InvalidMemoryOperand);
                    }
                    self.mov_tmp_imm(imm)?;
                    return self.mov(sz, Opnd::Mem(m), Opnd::Reg(TMP_GP));
                }
                let mo = self.mem(&m)?;
                let instr = match sz {
                    OpSize::S8 => Instruction::with2(rm_imm, mo, imm as u8 as u32)?,
                    OpSize::S16 => Instruction::with2(rm_imm, mo, imm as u16 as u32)?,
                    _ => Instruction::with2(rm_imm, mo, imm as i32)?,
                };
                self.emit(instr)?;
            }
            (Opnd::Mem(d), Opnd::Mem(s)) => {
                if d.uses(TMP_GP) || s.uses(TMP_GP) {
                    return Err(EncodingError::InvalidMemoryOperand);
                }
                self.mov(sz, Opnd::Reg(TMP_GP), Opnd::Mem(s))?;
                self.mov(sz, Opnd::Mem(d), Opnd::Reg(TMP_GP))?;
            }
            (Opnd::Imm(_), _) => {
                return Err(EncodingError::UnsupportedInstruction("mov to immediate"))
            }
        }
        Ok(())
    }

    fn movx(&mut self, dst: Ar, src: Opnd, from: OpSize, signed: bool) -> EncResult<()> {
        let (code, dst_sz) = match (from, signed) {
            (OpSize::S8, true) => (Code::Movsx_r32_rm8, OpSize::S32),
            (OpSize::S8, false) => (Code::Movzx_r32_rm8, OpSize::S32),
            (OpSize::S16, true) => (Code::Movsx_r32_rm16, OpSize::S32),
            (OpSize::S16, false) => (Code::Movzx_r32_rm16, OpSize::S32),
            (OpSize::S32, true) => (Code::Movsxd_r64_rm32, OpSize::S64),
            (OpSize::S32, false) => (Code::Mov_r32_rm32, OpSize::S32),
            (OpSize::S64, _) => return self.mov(OpSize::S64, Opnd::Reg(dst), src),
        };
        let d = self.gp(dst, dst_sz)?;
        let rm = self.rm(&src, from)?;
        self.emit(rm.as_src(code, d)?)?;
        Ok(())
    }

    fn lea(&mut self, dst: Ar, addr: MemRef) -> EncResult<()> {
        let d = self.gp(dst, OpSize::S64)?;
        let m = self.mem(&addr)?;
        self.emit(Instruction::with2(Code::Lea_r64_m, d, m)?)?;
        Ok(())
    }

    fn alu(&mut self, sz: OpSize, op: AluOp, dst: Opnd, src: Opnd) -> EncResult<()> {
        if sz == OpSize::S8 {
            // Only byte compares against an immediate are generated.
            if let (AluOp::Cmp, Opnd::Imm(imm)) = (op, src) {
                let rm = self.rm(&dst, OpSize::S8)?;
                self.emit(rm.with_u32(Code::Cmp_rm8_imm8, imm as u8 as u32)?)?;
                return Ok(());
            }
            return Err(EncodingError::UnsupportedInstruction("byte alu"));
        }
        let wide = self.check_int_size(sz, "alu size")?;
        let forms = alu_forms(op);
        match (dst, src) {
            (_, Opnd::Imm(imm)) => {
                let imm = if wide { imm } else { imm as i32 as i64 };
                if !fits_i32(imm) {
                    if dst.regs().contains(TMP_GP) {
                        return Err(EncodingError::InvalidMemoryOperand);
                    }
                    self.mov_tmp_imm(imm)?;
                    return self.alu(sz, op, dst, Opnd::Reg(TMP_GP));
                }
                let rm = self.rm(&dst, sz)?;
                let code = match (fits_i8(imm), wide) {
                    (true, false) => forms.rm32_imm8,
                    (true, true) => forms.rm64_imm8,
                    (false, false) => forms.rm32_imm32,
                    (false, true) => forms.rm64_imm32,
                };
                self.emit(rm.with_i32(code, imm as i32)?)?;
            }
            (Opnd::Reg(d), _) => {
                let d = self.gp(d, sz)?;
                let rm = self.rm(&src, sz)?;
                let code = if wide { forms.r64_rm64 } else { forms.r32_rm32 };
                self.emit(rm.as_src(code, d)?)?;
            }
            (Opnd::Mem(_), Opnd::Reg(s)) => {
                let s = self.gp(s, sz)?;
                let rm = self.rm(&dst, sz)?;
                let code = if wide { forms.rm64_r64 } else { forms.rm32_r32 };
                self.emit(rm.with_reg(code, s)?)?;
            }
            (Opnd::Mem(d), Opnd::Mem(s)) => {
                if d.uses(TMP_GP) || s.uses(TMP_GP) {
                    return Err(EncodingError::InvalidMemoryOperand);
                }
                self.mov(sz, Opnd::Reg(TMP_GP), Opnd::Mem(s))?;
                return self.alu(sz, op, dst, Opnd::Reg(TMP_GP));
            }
            (Opnd::Imm(_), _) => {
                return Err(EncodingError::UnsupportedInstruction("alu on immediate"))
            }
        }
        Ok(())
    }

    fn test(&mut self, sz: OpSize, a: Opnd, b: Opnd) -> EncResult<()> {
        let rm = self.rm(&a, sz)?;
        let instr = match (sz, b) {
            (OpSize::S8, Opnd::Imm(imm)) => rm.with_u32(Code::Test_rm8_imm8, imm as u8 as u32)?,
            (OpSize::S32, Opnd::Imm(imm)) => rm.with_i32(Code::Test_rm32_imm32, imm as i32)?,
            (OpSize::S64, Opnd::Imm(imm)) if fits_i32(imm) => {
                rm.with_i32(Code::Test_rm64_imm32, imm as i32)?
            }
            (OpSize::S32, Opnd::Reg(r)) => rm.with_reg(Code::Test_rm32_r32, self.gp(r, sz)?)?,
            (OpSize::S64, Opnd::Reg(r)) => rm.with_reg(Code::Test_rm64_r64, self.gp(r, sz)?)?,
            _ => return Err(EncodingError::UnsupportedInstruction("test operands")),
        };
        self.emit(instr)?;
        Ok(())
    }

    fn imul(&mut self, sz: OpSize, dst: Ar, src: Opnd) -> EncResult<()> {
        let wide = self.check_int_size(sz, "imul size")?;
        let d = self.gp(dst, sz)?;
        match src {
            Opnd::Imm(imm) if fits_i32(imm) || !wide => {
                let imm = imm as i32;
                let code = match (i8::try_from(imm).is_ok(), wide) {
                    (true, false) => Code::Imul_r32_rm32_imm8,
                    (true, true) => Code::Imul_r64_rm64_imm8,
                    (false, false) => Code::Imul_r32_rm32_imm32,
                    (false, true) => Code::Imul_r64_rm64_imm32,
                };
                self.emit(Instruction::with3(code, d, d, imm)?)?;
            }
            Opnd::Imm(imm) => {
                self.mov_tmp_imm(imm)?;
                return self.imul(sz, dst, Opnd::Reg(TMP_GP));
            }
            _ => {
                let rm = self.rm(&src, sz)?;
                let code = if wide {
                    Code::Imul_r64_rm64
                } else {
                    Code::Imul_r32_rm32
                };
                self.emit(rm.as_src(code, d)?)?;
            }
        }
        Ok(())
    }

    fn neg(&mut self, sz: OpSize, dst: Opnd) -> EncResult<()> {
        let wide = self.check_int_size(sz, "neg size")?;
        let rm = self.rm(&dst, sz)?;
        let code = if wide { Code::Neg_rm64 } else { Code::Neg_rm32 };
        self.emit(rm.with0(code)?)?;
        Ok(())
    }

    fn shift(&mut self, sz: OpSize, op: ShiftOp, dst: Opnd, count: Option<u8>) -> EncResult<()> {
        let wide = self.check_int_size(sz, "shift size")?;
        let rm = self.rm(&dst, sz)?;
        let instr = match count {
            Some(n) => {
                let code = match (op, wide) {
                    (ShiftOp::Shl, false) => Code::Shl_rm32_imm8,
                    (ShiftOp::Shl, true) => Code::Shl_rm64_imm8,
                    (ShiftOp::Sar, false) => Code::Sar_rm32_imm8,
                    (ShiftOp::Sar, true) => Code::Sar_rm64_imm8,
                    (ShiftOp::Shr, false) => Code::Shr_rm32_imm8,
                    (ShiftOp::Shr, true) => Code::Shr_rm64_imm8,
                };
                rm.with_u32(code, n as u32)?
            }
            None => {
                let code = match (op, wide) {
                    (ShiftOp::Shl, false) => Code::Shl_rm32_CL,
                    (ShiftOp::Shl, true) => Code::Shl_rm64_CL,
                    (ShiftOp::Sar, false) => Code::Sar_rm32_CL,
                    (ShiftOp::Sar, true) => Code::Sar_rm64_CL,
                    (ShiftOp::Shr, false) => Code::Shr_rm32_CL,
                    (ShiftOp::Shr, true) => Code::Shr_rm64_CL,
                };
                rm.with_reg(code, Register::CL)?
            }
        };
        self.emit(instr)?;
        Ok(())
    }

    fn sign_extend_acc(&mut self, sz: OpSize) -> EncResult<()> {
        let code = if self.check_int_size(sz, "cdq size")? {
            Code::Cqo
        } else {
            Code::Cdq
        };
        self.emit(Instruction::with(code))?;
        Ok(())
    }

    fn idiv(&mut self, sz: OpSize, divisor: Opnd) -> EncResult<()> {
        let wide = self.check_int_size(sz, "idiv size")?;
        let rm = self.rm(&divisor, sz)?;
        let code = if wide { Code::Idiv_rm64 } else { Code::Idiv_rm32 };
        self.emit(rm.with0(code)?)?;
        Ok(())
    }

    fn bit(&mut self, dst: Opnd, bit: u8, set: bool) -> EncResult<()> {
        let rm = self.rm(&dst, OpSize::S64)?;
        let code = if set {
            Code::Bts_rm64_imm8
        } else {
            Code::Btr_rm64_imm8
        };
        self.emit(rm.with_u32(code, (bit & 63) as u32)?)?;
        Ok(())
    }

    fn bit_flip(&mut self, sz: OpSize, dst: Ar, bit: u8) -> EncResult<()> {
        let wide = self.check_int_size(sz, "btc size")?;
        let d = self.gp(dst, sz)?;
        let code = if wide {
            Code::Btc_rm64_imm8
        } else {
            Code::Btc_rm32_imm8
        };
        self.emit(Instruction::with2(code, d, bit as u32)?)?;
        Ok(())
    }

    fn fmov(&mut self, dbl: bool, dst: Opnd, src: Opnd) -> EncResult<()> {
        let (load, store) = if dbl {
            (Code::Movsd_xmm_xmmm64, Code::Movsd_xmmm64_xmm)
        } else {
            (Code::Movss_xmm_xmmm32, Code::Movss_xmmm32_xmm)
        };
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) => {
                if d == s {
                    return Ok(());
                }
                let (d, s) = (self.xmm(d)?, self.xmm(s)?);
                self.emit(Instruction::with2(load, d, s)?)?;
            }
            (Opnd::Reg(d), Opnd::Mem(m)) => {
                let (d, m) = (self.xmm(d)?, self.mem(&m)?);
                self.emit(Instruction::with2(load, d, m)?)?;
            }
            (Opnd::Mem(m), Opnd::Reg(s)) => {
                let (m, s) = (self.mem(&m)?, self.xmm(s)?);
                self.emit(Instruction::with2(store, m, s)?)?;
            }
            (Opnd::Reg(d), Opnd::Imm(bits)) => {
                let sz = if dbl { OpSize::S64 } else { OpSize::S32 };
                self.mov(sz, Opnd::Reg(TMP_GP), Opnd::Imm(bits))?;
                self.fbits(dbl, d, TMP_GP)?;
            }
            (Opnd::Mem(_), Opnd::Imm(bits)) => {
                let sz = if dbl { OpSize::S64 } else { OpSize::S32 };
                self.mov(sz, dst, Opnd::Imm(bits))?;
            }
            (Opnd::Mem(_), Opnd::Mem(_)) => {
                self.fmov(dbl, Opnd::Reg(TMP_FP), src)?;
                self.fmov(dbl, dst, Opnd::Reg(TMP_FP))?;
            }
            (Opnd::Imm(_), _) => {
                return Err(EncodingError::UnsupportedInstruction("fmov to immediate"))
            }
        }
        Ok(())
    }

    fn fop(&mut self, dbl: bool, op: FpOp, dst: Ar, src: Opnd) -> EncResult<()> {
        let code = match (op, dbl) {
            (FpOp::Add, false) => Code::Addss_xmm_xmmm32,
            (FpOp::Add, true) => Code::Addsd_xmm_xmmm64,
            (FpOp::Sub, false) => Code::Subss_xmm_xmmm32,
            (FpOp::Sub, true) => Code::Subsd_xmm_xmmm64,
            (FpOp::Mul, false) => Code::Mulss_xmm_xmmm32,
            (FpOp::Mul, true) => Code::Mulsd_xmm_xmmm64,
            (FpOp::Div, false) => Code::Divss_xmm_xmmm32,
            (FpOp::Div, true) => Code::Divsd_xmm_xmmm64,
        };
        let d = self.xmm(dst)?;
        let instr = match src {
            Opnd::Reg(s) => Instruction::with2(code, d, self.xmm(s)?)?,
            Opnd::Mem(m) => Instruction::with2(code, d, self.mem(&m)?)?,
            Opnd::Imm(bits) => {
                self.fmov(dbl, Opnd::Reg(TMP_FP), Opnd::Imm(bits))?;
                Instruction::with2(code, d, self.xmm(TMP_FP)?)?
            }
        };
        self.emit(instr)?;
        Ok(())
    }

    fn fbits(&mut self, wide: bool, dst: Ar, src: Ar) -> EncResult<()> {
        let sz = if wide { OpSize::S64 } else { OpSize::S32 };
        let instr = match (dst.is_fp(), src.is_fp()) {
            (true, false) => {
                let code = if wide {
                    Code::Movq_xmm_rm64
                } else {
                    Code::Movd_xmm_rm32
                };
                Instruction::with2(code, self.xmm(dst)?, self.gp(src, sz)?)?
            }
            (false, true) => {
                let code = if wide {
                    Code::Movq_rm64_xmm
                } else {
                    Code::Movd_rm32_xmm
                };
                Instruction::with2(code, self.gp(dst, sz)?, self.xmm(src)?)?
            }
            _ => return Err(EncodingError::UnsupportedInstruction("fbits within one bank")),
        };
        self.emit(instr)?;
        Ok(())
    }

    fn push(&mut self, reg: Ar) -> EncResult<()> {
        let r = self.gp(reg, OpSize::S64)?;
        self.emit(Instruction::with1(Code::Push_r64, r)?)?;
        Ok(())
    }

    fn pop(&mut self, reg: Ar) -> EncResult<()> {
        let r = self.gp(reg, OpSize::S64)?;
        self.emit(Instruction::with1(Code::Pop_r64, r)?)?;
        Ok(())
    }

    fn call(&mut self, target: CallTarget) -> EncResult<u32> {
        let instr = match target {
            CallTarget::Abs(addr) => {
                let tmp = self.gp(TMP_GP, OpSize::S64)?;
                self.emit(Instruction::with2(Code::Mov_r64_imm64, tmp, addr)?)?;
                Instruction::with1(Code::Call_rm64, tmp)?
            }
            CallTarget::Reg(r) => Instruction::with1(Code::Call_rm64, self.gp(r, OpSize::S64)?)?,
            CallTarget::Mem(m) => Instruction::with1(Code::Call_rm64, self.mem(&m)?)?,
        };
        self.emit(instr)?;
        Ok(self.ip())
    }

    fn ret(&mut self, pop_bytes: u16) -> EncResult<()> {
        let instr = if pop_bytes == 0 {
            Instruction::with(Code::Retnq)
        } else {
            Instruction::with1(Code::Retnq_imm16, pop_bytes as u32)?
        };
        self.emit(instr)?;
        Ok(())
    }

    fn jmp(&mut self) -> EncResult<PatchRef> {
        let here = self.ip() as u64;
        self.emit_rel32(Instruction::with_branch(Code::Jmp_rel32_64, here)?)
    }

    fn jcc(&mut self, cond: Cond) -> EncResult<PatchRef> {
        let here = self.ip() as u64;
        self.emit_rel32(Instruction::with_branch(jcc_code(cond), here)?)
    }

    fn jmp_indirect(&mut self, target: Opnd) -> EncResult<()> {
        let rm = self.rm(&target, OpSize::S64)?;
        self.emit(rm.with0(Code::Jmp_rm64)?)?;
        Ok(())
    }

    fn lea_rip(&mut self, dst: Ar) -> EncResult<PatchRef> {
        let d = self.gp(dst, OpSize::S64)?;
        let here = self.ip() as i64;
        let m = MemoryOperand::with_base_displ(Register::RIP, here);
        self.emit_rel32(Instruction::with2(Code::Lea_r64_m, d, m)?)
    }

    fn patch(&mut self, at: PatchRef, target: u32) -> EncResult<()> {
        let pos = at.0 as usize;
        if pos + 4 > self.buf.len() {
            return Err(EncodingError::PatchOutOfRange { at: at.0, target });
        }
        let rel = target as i64 - (at.0 as i64 + 4);
        let rel = i32::try_from(rel).map_err(|_| EncodingError::PatchOutOfRange { at: at.0, target })?;
        self.buf[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }

    fn data64(&mut self, value: i64) -> EncResult<u32> {
        let at = self.ip();
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(at)
    }

    fn patch_data64(&mut self, at: u32, value: i64) -> EncResult<()> {
        let pos = at as usize;
        if pos + 8 > self.buf.len() {
            return Err(EncodingError::PatchOutOfRange { at, target: 0 });
        }
        self.buf[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn fence(&mut self) -> EncResult<()> {
        self.emit(Instruction::with(Code::Mfence))?;
        Ok(())
    }

    fn trap(&mut self) -> EncResult<()> {
        self.emit(Instruction::with(Code::Int3))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

    fn disasm(code: &[u8]) -> Vec<String> {
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut out = Vec::new();
        for instr in &mut decoder {
            let mut s = String::new();
            formatter.format(&instr, &mut s);
            out.push(s);
        }
        out
    }

    #[test]
    fn test_moves() {
        let mut e = X64Encoder::new();
        e.mov(OpSize::S64, Opnd::Reg(Ar::RAX), Opnd::Reg(Ar::RBX)).unwrap();
        e.mov(OpSize::S32, Opnd::Reg(Ar::RCX), Opnd::Mem(MemRef::base_disp(Ar::RBP, -16)))
            .unwrap();
        e.mov(OpSize::S64, Opnd::Reg(Ar::R8), Opnd::Imm(0x1234_5678_9abc)).unwrap();
        // Same-register 64-bit move is elided, the 32-bit one is kept.
        e.mov(OpSize::S64, Opnd::Reg(Ar::RDX), Opnd::Reg(Ar::RDX)).unwrap();
        e.mov(OpSize::S32, Opnd::Reg(Ar::RDX), Opnd::Reg(Ar::RDX)).unwrap();
        assert_eq!(
            disasm(e.code()),
            vec![
                "mov rax,rbx",
                "mov ecx,[rbp-10h]",
                "mov r8,123456789ABCh",
                "mov edx,edx",
            ]
        );
    }

    #[test]
    fn test_alu_immediate_forms() {
        let mut e = X64Encoder::new();
        e.alu(OpSize::S32, AluOp::Add, Opnd::Reg(Ar::RAX), Opnd::Imm(1)).unwrap();
        let short = e.ip();
        e.alu(OpSize::S32, AluOp::Add, Opnd::Reg(Ar::RCX), Opnd::Imm(1000)).unwrap();
        assert_eq!(short, 3);
        assert_eq!(e.ip() - short, 6);
        assert_eq!(disasm(e.code()), vec!["add eax,1", "add ecx,3E8h"]);
    }

    #[test]
    fn test_forward_branch_patch() {
        let mut e = X64Encoder::new();
        let p = e.jcc(Cond::Eq).unwrap();
        e.trap().unwrap();
        let target = e.ip();
        e.ret(0).unwrap();
        e.patch(p, target).unwrap();
        let mut decoder = Decoder::with_ip(64, e.code(), 0, DecoderOptions::NONE);
        let jcc = decoder.decode();
        assert_eq!(jcc.near_branch64(), target as u64);
    }

    #[test]
    fn test_call_absolute_goes_through_r11() {
        let mut e = X64Encoder::new();
        let ret = e.call(CallTarget::Abs(0x7000_0000_0010)).unwrap();
        assert_eq!(ret, e.ip());
        assert_eq!(disasm(e.code()), vec!["mov r11,700000000010h", "call r11"]);
    }

    #[test]
    fn test_rejects_fp_register_in_gp_slot() {
        let mut e = X64Encoder::new();
        let err = e.mov(OpSize::S64, Opnd::Reg(Ar::XMM0), Opnd::Imm(0)).unwrap_err();
        assert_eq!(err, EncodingError::InvalidRegister(Ar::XMM0));
    }

    #[test]
    fn test_lea_rip_patch() {
        let mut e = X64Encoder::new();
        let p = e.lea_rip(Ar::R11).unwrap();
        let at = e.data64(0).unwrap();
        e.patch(p, at).unwrap();
        let mut decoder = Decoder::with_ip(64, &e.code()[..7], 0, DecoderOptions::NONE);
        let lea = decoder.decode();
        assert!(lea.is_ip_rel_memory_operand());
        assert_eq!(lea.ip_rel_memory_address(), at as u64);
    }
}
