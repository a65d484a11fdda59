// This module splits a method's bytecode into basic blocks before code generation starts.
// Instructions are decoded once into an arena-backed vector and indexed by pc. A block
// starts at pc 0, at every branch or switch target, after every block-ending instruction,
// at the bounds and entry points of exception handlers, and at both the target and the
// continuation of a jsr. Each block counts how many control transfers reach it; together
// with its handler and jsr flags that count decides whether the generator must bring the
// frame into canonical form on entry or may simply continue with the predecessor's state.

//! Basic-block discovery over decoded bytecode.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;

use crate::core::bytecode::{decode, Inst};
use crate::core::error::{CompileError, CompileResult};
use crate::core::method::ExceptionHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Leader pc.
    pub start: u32,
    /// Pc following the last instruction.
    pub end: u32,
    /// Pc of the last instruction.
    pub last: u32,
    /// Index of the first instruction in the block map.
    first: usize,
    count: usize,
    /// Control transfers reaching the block, including method entry and handler dispatch.
    pub ref_count: u32,
    pub handler: bool,
    pub jsr_target: bool,
    pub jsr_cont: bool,
}

impl BasicBlock {
    /// Whether the frame must be canonical on entry.
    pub fn needs_canon(&self) -> bool {
        self.ref_count > 1 || self.handler || self.jsr_target || self.jsr_cont
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct BlockMap<'arena> {
    insts: BumpVec<'arena, Inst>,
    /// Pc to instruction index.
    index: HashMap<u32, usize>,
    blocks: HashMap<u32, BasicBlock>,
    /// Leaders in pc order.
    order: Vec<u32>,
    has_jsr: bool,
}

impl<'arena> BlockMap<'arena> {
    pub fn build(code: &[u8], handlers: &[ExceptionHandler], arena: &'arena Bump) -> CompileResult<Self> {
        let mut insts = BumpVec::new_in(arena);
        let mut index = HashMap::new();
        let mut pc = 0usize;
        while pc < code.len() {
            let inst = decode(code, pc as u32)?;
            pc = inst.next as usize;
            index.insert(inst.pc, insts.len());
            insts.push(inst);
        }
        if insts.is_empty() {
            return Err(CompileError::TruncatedBytecode { pc: 0 });
        }

        let code_len = code.len() as u32;
        let mut leaders = vec![false; code.len()];
        leaders[0] = true;
        let mut has_jsr = false;

        for inst in insts.iter() {
            for target in inst.targets() {
                if !index.contains_key(&target) {
                    return Err(CompileError::BadBranchTarget {
                        pc: inst.pc,
                        target: target as i64,
                    });
                }
                leaders[target as usize] = true;
            }
            if inst.falls_through() && inst.next >= code_len {
                return Err(CompileError::BadBranchTarget {
                    pc: inst.pc,
                    target: inst.next as i64,
                });
            }
            if inst.is_jsr() {
                has_jsr = true;
            }
            if (inst.ends_block() || inst.is_jsr()) && inst.next < code_len {
                leaders[inst.next as usize] = true;
            }
        }

        for h in handlers {
            for (pc, may_end) in [(h.start_pc, false), (h.end_pc, true), (h.handler_pc, false)] {
                if may_end && pc == code_len {
                    continue;
                }
                if !index.contains_key(&pc) {
                    return Err(CompileError::BadBranchTarget {
                        pc: h.start_pc,
                        target: pc as i64,
                    });
                }
                leaders[pc as usize] = true;
            }
            if h.start_pc >= h.end_pc {
                return Err(CompileError::BadBranchTarget {
                    pc: h.start_pc,
                    target: h.end_pc as i64,
                });
            }
        }

        let mut blocks: HashMap<u32, BasicBlock> = HashMap::new();
        let mut order = Vec::new();
        for (i, inst) in insts.iter().enumerate() {
            if leaders[inst.pc as usize] {
                order.push(inst.pc);
                blocks.insert(
                    inst.pc,
                    BasicBlock {
                        start: inst.pc,
                        end: inst.next,
                        last: inst.pc,
                        first: i,
                        count: 0,
                        ref_count: 0,
                        handler: false,
                        jsr_target: false,
                        jsr_cont: false,
                    },
                );
            }
            let leader = *order.last().unwrap_or(&0);
            if let Some(bb) = blocks.get_mut(&leader) {
                bb.end = inst.next;
                bb.last = inst.pc;
                bb.count += 1;
            }
        }

        let mut map = Self {
            insts,
            index,
            blocks,
            order,
            has_jsr,
        };
        map.count_refs(handlers);
        Ok(map)
    }

    fn count_refs(&mut self, handlers: &[ExceptionHandler]) {
        let mut bumps: Vec<(u32, u8)> = vec![(0, 0)];
        for pc in &self.order {
            let bb = &self.blocks[pc];
            let last = &self.insts[bb.first + bb.count - 1];
            for t in last.targets() {
                bumps.push((t, if last.is_jsr() { 1 } else { 0 }));
            }
            if last.is_jsr() {
                bumps.push((last.next, 2));
            } else if last.falls_through() {
                bumps.push((last.next, 0));
            }
        }
        for h in handlers {
            bumps.push((h.handler_pc, 3));
        }
        for (pc, kind) in bumps {
            if let Some(bb) = self.blocks.get_mut(&pc) {
                bb.ref_count += 1;
                match kind {
                    1 => bb.jsr_target = true,
                    2 => bb.jsr_cont = true,
                    3 => bb.handler = true,
                    _ => {}
                }
            }
        }
    }

    pub fn block(&self, pc: u32) -> Option<&BasicBlock> {
        self.blocks.get(&pc)
    }

    pub fn is_leader(&self, pc: u32) -> bool {
        self.blocks.contains_key(&pc)
    }

    /// Leaders in pc order.
    pub fn leaders(&self) -> &[u32] {
        &self.order
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.order.iter().filter_map(|pc| self.blocks.get(pc))
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn inst_at(&self, pc: u32) -> Option<&Inst> {
        self.index.get(&pc).map(|&i| &self.insts[i])
    }

    pub fn block_insts(&self, bb: &BasicBlock) -> &[Inst] {
        &self.insts[bb.first..bb.first + bb.count]
    }

    pub fn has_jsr(&self) -> bool {
        self.has_jsr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecode::*;

    fn build(code: &[u8], handlers: &[ExceptionHandler]) -> CompileResult<Vec<BasicBlock>> {
        let arena = Bump::new();
        let map = BlockMap::build(code, handlers, &arena)?;
        Ok(map.blocks().cloned().collect())
    }

    #[test]
    fn test_diamond() {
        // 0: iload_0; 1: ifeq +7 (8); 4: iconst_1; 5: goto +4 (9); 8: iconst_0; 9: ireturn
        let code = [ILOAD_0, IFEQ, 0, 7, ICONST_0 + 1, GOTO, 0, 4, ICONST_0, IRETURN];
        let bbs = build(&code, &[]).unwrap();
        let starts: Vec<u32> = bbs.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 4, 8, 9]);
        assert_eq!(bbs[0].ref_count, 1);
        assert_eq!(bbs[1].ref_count, 1);
        assert_eq!(bbs[2].ref_count, 1);
        assert_eq!(bbs[3].ref_count, 2);
        assert!(bbs[3].needs_canon());
        assert!(!bbs[1].needs_canon());
        assert_eq!(bbs[0].last, 1);
        assert_eq!(bbs[1].end, 8);
    }

    #[test]
    fn test_handler_flags() {
        // 0: aload_0; 1: athrow; 2: astore_1; 3: return
        let code = [ALOAD_0, ATHROW, ASTORE_0 + 1, RETURN];
        let h = ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: None,
        };
        let bbs = build(&code, &[h]).unwrap();
        assert_eq!(bbs.len(), 2);
        assert!(bbs[1].handler);
        assert_eq!(bbs[1].ref_count, 1);
        assert!(bbs[1].needs_canon());
    }

    #[test]
    fn test_jsr_blocks() {
        // 0: jsr +4 (4); 3: return; 4: astore_1; 5: ret 1
        let code = [JSR, 0, 4, RETURN, ASTORE_0 + 1, RET, 1];
        let arena = Bump::new();
        let map = BlockMap::build(&code, &[], &arena).unwrap();
        assert!(map.has_jsr());
        assert!(map.block(4).unwrap().jsr_target);
        assert!(map.block(3).unwrap().jsr_cont);
        assert_eq!(map.block_insts(map.block(4).unwrap()).len(), 2);
    }

    #[test]
    fn test_bad_targets() {
        let code = [GOTO, 0, 2, RETURN];
        assert!(matches!(
            build(&code, &[]),
            Err(CompileError::BadBranchTarget { pc: 0, target: 2 })
        ));
        let falls_off = [ICONST_0, POP];
        assert!(matches!(
            build(&falls_off, &[]),
            Err(CompileError::BadBranchTarget { pc: 1, target: 2 })
        ));
    }

    #[test]
    fn test_loop_header_is_canonical() {
        // 0: iinc 0 1; 3: iload_0; 4: ifne -4 (0); 7: return
        let code = [IINC, 0, 1, ILOAD_0, IFNE, 0xff, 0xfc, RETURN];
        let bbs = build(&code, &[]).unwrap();
        assert_eq!(bbs[0].start, 0);
        assert_eq!(bbs[0].ref_count, 2);
        assert!(bbs[0].needs_canon());
    }
}
