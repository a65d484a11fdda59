// This module defines the method info block: the metadata a compiled method leaves behind
// for the runtime (stack walker, GC root enumeration, debugger support). It carries a fixed
// header (local/stack/argument counts, code start and length, warm-up length, flags, native
// frame layout offsets, the mask of callee-save registers the prolog stores, and the GC maps
// of the incoming arguments at method entry), the table binding locals to global registers,
// the bytecode PC <-> native offset map, the GC points (native offset, PC, operand-stack depth,
// bitmap of stack slots holding references, bitmap of registers holding references, kind)
// and the native exception-handler table. The block is serialized to a little-endian byte
// layout tagged with the "JETI" magic; deserialize() reproduces exactly what serialize()
// wrote, and malformed input is reported through InfoBlockError instead of panicking.

//! Method info block: layout, GC maps, PC map and handler table.

use std::fmt;

use thiserror::Error;

/// "JETI" in little-endian byte order.
pub const MAGIC: u32 = u32::from_le_bytes(*b"JETI");
pub const VERSION: u16 = 1;

/// Errors raised while decoding an info block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoBlockError {
    #[error("Bad info block magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Unsupported info block version {0}")]
    BadVersion(u16),

    #[error("Info block truncated at byte {at}")]
    Truncated { at: usize },

    #[error("Invalid {what} tag {tag} at byte {at}")]
    BadTag { what: &'static str, tag: u8, at: usize },

    #[error("{0} trailing bytes after info block")]
    Trailing(usize),
}

/// Method-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoFlags {
    pub is_static: bool,
    pub synchronized: bool,
    /// The method body is a bare `ret` without a frame.
    pub trivial: bool,
    pub has_jsr: bool,
    pub compressed_refs: bool,
    /// The prolog stores every scratch register.
    pub saves_scratch: bool,
}

impl InfoFlags {
    fn to_bits(self) -> u32 {
        (self.is_static as u32)
            | (self.synchronized as u32) << 1
            | (self.trivial as u32) << 2
            | (self.has_jsr as u32) << 3
            | (self.compressed_refs as u32) << 4
            | (self.saves_scratch as u32) << 5
    }

    fn from_bits(bits: u32) -> Self {
        Self {
            is_static: bits & 1 != 0,
            synchronized: bits & 2 != 0,
            trivial: bits & 4 != 0,
            has_jsr: bits & 8 != 0,
            compressed_refs: bits & 16 != 0,
            saves_scratch: bits & 32 != 0,
        }
    }
}

/// Native frame layout, as `rbp`-relative byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOffsets {
    /// Bytes reserved below the saved `rbp`.
    pub frame_size: u32,
    /// Slot of the first callee-save register; later ones follow downwards.
    pub callee_save: i32,
    pub sync_obj: i32,
    pub retval: i32,
    /// Scratch register save area, 0 when absent.
    pub scratch_save: i32,
    /// First word of the locals GC bitmap.
    pub gc_locals: i32,
    /// Local `i` lives at `locals + 8 * i`.
    pub locals: i32,
    /// Operand stack position `i` lives at `stack + 8 * i`.
    pub stack: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoHeader {
    pub num_locals: u16,
    pub max_stack: u16,
    pub in_slots: u16,
    pub code_start: u64,
    pub code_len: u32,
    pub warmup_len: u32,
    pub flags: InfoFlags,
    pub frame: FrameOffsets,
    /// Callee-save registers (hardware numbers) stored by the prolog.
    pub saved_regs_mask: u32,
    /// Incoming stack argument slots holding references at entry.
    pub entry_stack_args: u64,
    /// Argument registers holding references at entry.
    pub entry_reg_args: u32,
}

/// Why generated code may stop at a GC point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPointKind {
    /// Return address of a call.
    Call,
    /// Faulting instruction of a hardware null check.
    ImplicitNullCheck,
    /// Method entry, before the frame exists.
    Entry,
}

impl GcPointKind {
    fn tag(self) -> u8 {
        match self {
            GcPointKind::Call => 0,
            GcPointKind::ImplicitNullCheck => 1,
            GcPointKind::Entry => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPoint {
    pub ip: u32,
    pub pc: u32,
    pub kind: GcPointKind,
    pub depth: u16,
    /// One bit per operand stack position holding a reference in its slot.
    pub stack_map: Vec<u64>,
    /// Registers (hardware numbers) holding references.
    pub regs: u32,
    /// The return value slot holds a live reference.
    pub retval_ref: bool,
}

impl GcPoint {
    pub fn stack_has_ref(&self, pos: usize) -> bool {
        self.stack_map
            .get(pos / 64)
            .is_some_and(|w| w & (1u64 << (pos % 64)) != 0)
    }
}

/// Class filter of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchClass {
    Any,
    Resolved(u64),
    Unresolved(u16),
}

/// One native exception-handler range, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    pub start_ip: u32,
    pub end_ip: u32,
    pub handler_ip: u32,
    pub class: CatchClass,
}

impl HandlerEntry {
    /// Whether the instruction at `ip` is covered.
    pub fn covers(&self, ip: u32) -> bool {
        self.start_ip <= ip && ip < self.end_ip
    }
}

/// Per-method metadata published with the compiled code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoBlock {
    pub header: InfoHeader,
    /// `(local, hardware register)` bindings.
    pub global_regs: Vec<(u16, u8)>,
    /// `(pc, ip)` of every generated bytecode instruction, sorted by pc.
    pub pc_map: Vec<(u32, u32)>,
    /// Sorted by ip.
    pub gc_points: Vec<GcPoint>,
    pub handlers: Vec<HandlerEntry>,
}

impl InfoBlock {
    pub fn bc_to_native(&self, pc: u32) -> Option<u32> {
        self.pc_map
            .binary_search_by_key(&pc, |e| e.0)
            .ok()
            .map(|i| self.pc_map[i].1)
    }

    /// PC of the bytecode instruction whose code contains `ip`.
    pub fn native_to_bc(&self, ip: u32) -> Option<u32> {
        if ip >= self.header.code_len {
            return None;
        }
        self.pc_map
            .iter()
            .filter(|e| e.1 <= ip)
            .max_by_key(|e| (e.1, e.0))
            .map(|e| e.0)
    }

    pub fn gc_point_at(&self, ip: u32) -> Option<&GcPoint> {
        self.gc_points
            .binary_search_by_key(&ip, |g| g.ip)
            .ok()
            .map(|i| &self.gc_points[i])
    }

    /// Handlers covering the instruction at `ip`, in table order.
    pub fn handlers_at(&self, ip: u32) -> impl Iterator<Item = &HandlerEntry> {
        self.handlers.iter().filter(move |h| h.covers(ip))
    }

    /// Handlers covering the call whose return address is `ret_ip`.
    ///
    /// A return address may already belong to the next instruction, so the
    /// lookup is made on the last byte of the call itself.
    pub fn handlers_at_return(&self, ret_ip: u32) -> impl Iterator<Item = &HandlerEntry> {
        self.handlers_at(ret_ip.saturating_sub(1))
    }

    /// Global register bound to `local`, if any.
    pub fn global_reg_of(&self, local: u16) -> Option<u8> {
        self.global_regs
            .iter()
            .find(|(l, _)| *l == local)
            .map(|(_, r)| *r)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::default();
        let h = &self.header;
        w.u32(MAGIC);
        w.u16(VERSION);
        w.u16(h.num_locals);
        w.u16(h.max_stack);
        w.u16(h.in_slots);
        w.u64(h.code_start);
        w.u32(h.code_len);
        w.u32(h.warmup_len);
        w.u32(h.flags.to_bits());
        let f = &h.frame;
        w.u32(f.frame_size);
        for off in [
            f.callee_save,
            f.sync_obj,
            f.retval,
            f.scratch_save,
            f.gc_locals,
            f.locals,
            f.stack,
        ] {
            w.i32(off);
        }
        w.u32(h.saved_regs_mask);
        w.u64(h.entry_stack_args);
        w.u32(h.entry_reg_args);

        w.u32(self.global_regs.len() as u32);
        for &(local, reg) in &self.global_regs {
            w.u16(local);
            w.u8(reg);
        }

        w.u32(self.pc_map.len() as u32);
        for &(pc, ip) in &self.pc_map {
            w.u32(pc);
            w.u32(ip);
        }

        w.u32(self.gc_points.len() as u32);
        for g in &self.gc_points {
            w.u32(g.ip);
            w.u32(g.pc);
            w.u8(g.kind.tag());
            w.u8(g.retval_ref as u8);
            w.u16(g.depth);
            w.u32(g.regs);
            w.u16(g.stack_map.len() as u16);
            for &word in &g.stack_map {
                w.u64(word);
            }
        }

        w.u32(self.handlers.len() as u32);
        for e in &self.handlers {
            w.u32(e.start_ip);
            w.u32(e.end_ip);
            w.u32(e.handler_ip);
            match e.class {
                CatchClass::Any => w.u8(0),
                CatchClass::Resolved(c) => {
                    w.u8(1);
                    w.u64(c);
                }
                CatchClass::Unresolved(cp) => {
                    w.u8(2);
                    w.u16(cp);
                }
            }
        }
        w.buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<InfoBlock, InfoBlockError> {
        let mut r = Reader { bytes, at: 0 };
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(InfoBlockError::BadMagic { found: magic });
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(InfoBlockError::BadVersion(version));
        }
        let mut header = InfoHeader {
            num_locals: r.u16()?,
            max_stack: r.u16()?,
            in_slots: r.u16()?,
            code_start: r.u64()?,
            code_len: r.u32()?,
            warmup_len: r.u32()?,
            flags: InfoFlags::from_bits(r.u32()?),
            ..Default::default()
        };
        header.frame = FrameOffsets {
            frame_size: r.u32()?,
            callee_save: r.i32()?,
            sync_obj: r.i32()?,
            retval: r.i32()?,
            scratch_save: r.i32()?,
            gc_locals: r.i32()?,
            locals: r.i32()?,
            stack: r.i32()?,
        };
        header.saved_regs_mask = r.u32()?;
        header.entry_stack_args = r.u64()?;
        header.entry_reg_args = r.u32()?;

        let n = r.u32()?;
        let mut global_regs = Vec::new();
        for _ in 0..n {
            global_regs.push((r.u16()?, r.u8()?));
        }

        let n = r.u32()?;
        let mut pc_map = Vec::new();
        for _ in 0..n {
            pc_map.push((r.u32()?, r.u32()?));
        }

        let n = r.u32()?;
        let mut gc_points = Vec::new();
        for _ in 0..n {
            let ip = r.u32()?;
            let pc = r.u32()?;
            let at = r.at;
            let kind = match r.u8()? {
                0 => GcPointKind::Call,
                1 => GcPointKind::ImplicitNullCheck,
                2 => GcPointKind::Entry,
                tag => {
                    return Err(InfoBlockError::BadTag {
                        what: "gc point",
                        tag,
                        at,
                    })
                }
            };
            let retval_ref = r.u8()? != 0;
            let depth = r.u16()?;
            let regs = r.u32()?;
            let words = r.u16()?;
            let mut stack_map = Vec::new();
            for _ in 0..words {
                stack_map.push(r.u64()?);
            }
            gc_points.push(GcPoint {
                ip,
                pc,
                kind,
                depth,
                stack_map,
                regs,
                retval_ref,
            });
        }

        let n = r.u32()?;
        let mut handlers = Vec::new();
        for _ in 0..n {
            let start_ip = r.u32()?;
            let end_ip = r.u32()?;
            let handler_ip = r.u32()?;
            let at = r.at;
            let class = match r.u8()? {
                0 => CatchClass::Any,
                1 => CatchClass::Resolved(r.u64()?),
                2 => CatchClass::Unresolved(r.u16()?),
                tag => {
                    return Err(InfoBlockError::BadTag {
                        what: "catch class",
                        tag,
                        at,
                    })
                }
            };
            handlers.push(HandlerEntry {
                start_ip,
                end_ip,
                handler_ip,
                class,
            });
        }

        if r.at != bytes.len() {
            return Err(InfoBlockError::Trailing(bytes.len() - r.at));
        }
        Ok(InfoBlock {
            header,
            global_regs,
            pc_map,
            gc_points,
            handlers,
        })
    }
}

impl fmt::Display for InfoBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(
            f,
            "locals {} stack {} in-slots {} code {} bytes, warm-up {} bytes",
            h.num_locals, h.max_stack, h.in_slots, h.code_len, h.warmup_len
        )?;
        writeln!(f, "flags {:?}", h.flags)?;
        writeln!(
            f,
            "frame {} bytes, saved regs {:#x}, ref args: regs {:#x} stack {:#x}",
            h.frame.frame_size, h.saved_regs_mask, h.entry_reg_args, h.entry_stack_args
        )?;
        for (local, reg) in &self.global_regs {
            writeln!(f, "  local {local} in r{reg}")?;
        }
        for (pc, ip) in &self.pc_map {
            writeln!(f, "  pc {pc:>5} -> {ip:#06x}")?;
        }
        for g in &self.gc_points {
            let refs: Vec<String> = (0..g.depth as usize)
                .filter(|&i| g.stack_has_ref(i))
                .map(|i| i.to_string())
                .collect();
            writeln!(
                f,
                "  gc {:#06x} pc {} {:?} depth {} stack refs [{}] regs {:#x}{}",
                g.ip,
                g.pc,
                g.kind,
                g.depth,
                refs.join(","),
                g.regs,
                if g.retval_ref { " retval" } else { "" }
            )?;
        }
        for e in &self.handlers {
            writeln!(
                f,
                "  handler [{:#06x}, {:#06x}) -> {:#06x} {:?}",
                e.start_ip, e.end_ip, e.handler_ip, e.class
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], InfoBlockError> {
        let end = self.at + N;
        let slice = self
            .bytes
            .get(self.at..end)
            .ok_or(InfoBlockError::Truncated { at: self.at })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.at = end;
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, InfoBlockError> {
        Ok(self.take::<1>()?[0])
    }
    fn u16(&mut self) -> Result<u16, InfoBlockError> {
        Ok(u16::from_le_bytes(self.take()?))
    }
    fn u32(&mut self) -> Result<u32, InfoBlockError> {
        Ok(u32::from_le_bytes(self.take()?))
    }
    fn i32(&mut self) -> Result<i32, InfoBlockError> {
        Ok(i32::from_le_bytes(self.take()?))
    }
    fn u64(&mut self) -> Result<u64, InfoBlockError> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InfoBlock {
        InfoBlock {
            header: InfoHeader {
                num_locals: 3,
                max_stack: 4,
                in_slots: 2,
                code_start: 0x7f00_1000,
                code_len: 120,
                warmup_len: 30,
                flags: InfoFlags {
                    synchronized: true,
                    ..Default::default()
                },
                frame: FrameOffsets {
                    frame_size: 112,
                    callee_save: -8,
                    sync_obj: -48,
                    retval: -56,
                    scratch_save: 0,
                    gc_locals: -64,
                    locals: -88,
                    stack: -112,
                },
                saved_regs_mask: 1 << 3,
                entry_stack_args: 0,
                entry_reg_args: 1 << 7,
            },
            global_regs: vec![(1, 3)],
            pc_map: vec![(0, 30), (1, 34), (4, 50)],
            gc_points: vec![
                GcPoint {
                    ip: 0,
                    pc: 0,
                    kind: GcPointKind::Entry,
                    depth: 0,
                    stack_map: vec![],
                    regs: 0,
                    retval_ref: false,
                },
                GcPoint {
                    ip: 60,
                    pc: 4,
                    kind: GcPointKind::Call,
                    depth: 2,
                    stack_map: vec![0b10],
                    regs: 1 << 3,
                    retval_ref: false,
                },
            ],
            handlers: vec![
                HandlerEntry {
                    start_ip: 34,
                    end_ip: 70,
                    handler_ip: 90,
                    class: CatchClass::Unresolved(7),
                },
                HandlerEntry {
                    start_ip: 30,
                    end_ip: 80,
                    handler_ip: 100,
                    class: CatchClass::Any,
                },
            ],
        }
    }

    #[test]
    fn test_round_trip() {
        let block = sample();
        let bytes = block.serialize();
        assert_eq!(&bytes[..4], b"JETI");
        assert_eq!(InfoBlock::deserialize(&bytes).unwrap(), block);
    }

    #[test]
    fn test_malformed_input() {
        let bytes = sample().serialize();
        assert!(matches!(
            InfoBlock::deserialize(&bytes[..bytes.len() - 1]),
            Err(InfoBlockError::Truncated { .. })
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(
            InfoBlock::deserialize(&bad),
            Err(InfoBlockError::BadMagic { .. })
        ));
        let mut long = bytes;
        long.push(0);
        assert_eq!(InfoBlock::deserialize(&long), Err(InfoBlockError::Trailing(1)));
    }

    #[test]
    fn test_lookups() {
        let block = sample();
        assert_eq!(block.bc_to_native(1), Some(34));
        assert_eq!(block.bc_to_native(2), None);
        assert_eq!(block.native_to_bc(40), Some(1));
        assert_eq!(block.native_to_bc(50), Some(4));
        assert_eq!(block.native_to_bc(10), None);
        assert_eq!(block.native_to_bc(500), None);
        let g = block.gc_point_at(60).unwrap();
        assert!(g.stack_has_ref(1));
        assert!(!g.stack_has_ref(0));
        assert!(block.gc_point_at(61).is_none());
        let hs: Vec<_> = block.handlers_at(34).map(|h| h.handler_ip).collect();
        assert_eq!(hs, vec![90, 100]);
        let hs: Vec<_> = block.handlers_at(75).map(|h| h.handler_ip).collect();
        assert_eq!(hs, vec![100]);
        // A call ending exactly at 70 still belongs to the first range.
        let hs: Vec<_> = block.handlers_at_return(70).map(|h| h.handler_ip).collect();
        assert_eq!(hs, vec![90, 100]);
        assert_eq!(block.global_reg_of(1), Some(3));
        assert_eq!(block.global_reg_of(0), None);
    }
}
