//! Control-flow graph construction.
//!
//! Blocks are stored in one vector ordered by start offset and referenced
//! by `BlockId` indices; edges are `(BlockId, EdgeKind)` pairs. A dense
//! offset index makes `block_containing` O(1). Exception edges are
//! additive: a protected block keeps its normal successors and gains an
//! edge to its handler.

use ahash::AHashSet;

use crate::{
    code::{CodeObject, ExceptionEntry},
    error::{DecompileError, DecompileResult},
    insn::Instruction,
    opcodes::Opcode,
    version::PyVersion,
};

/// Index of a basic block in its `Cfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BlockId(u32);

impl BlockId {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EdgeKind {
    /// Fall-through or unconditional forward jump.
    Normal,
    /// Taken when the tested condition is truthy.
    CondTrue,
    /// Taken when the tested condition is falsy (`FOR_ITER` exhaustion).
    CondFalse,
    /// Raised-exception transfer to a handler.
    Exception,
    /// Unconditional jump back to a loop header.
    LoopBack,
}

/// A maximal straight-line instruction run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// First instruction offset (inclusive).
    pub start_offset: u32,
    /// End of the last instruction (exclusive).
    pub end_offset: u32,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<(BlockId, EdgeKind)>,
    pub predecessors: Vec<BlockId>,
    /// Entry point of an exception handler.
    pub is_handler: bool,
    /// Target of a back edge.
    pub is_loop_header: bool,
}

impl BasicBlock {
    /// Last instruction of the block.
    ///
    /// Blocks are never empty; construction guarantees it.
    #[must_use]
    pub fn terminator(&self) -> &Instruction {
        self.instructions.last().expect("blocks are non-empty")
    }

    /// First instruction of the block.
    #[must_use]
    pub fn first(&self) -> &Instruction {
        self.instructions.first().expect("blocks are non-empty")
    }

    /// Successor over an edge of the given kind.
    #[must_use]
    pub fn successor(&self, kind: EdgeKind) -> Option<BlockId> {
        self.successors.iter().find(|(_, k)| *k == kind).map(|(id, _)| *id)
    }

    /// Non-exception successors, in insertion order.
    pub fn flow_successors(&self) -> impl Iterator<Item = (BlockId, EdgeKind)> + '_ {
        self.successors.iter().copied().filter(|(_, k)| *k != EdgeKind::Exception)
    }
}

/// An immutable CFG for one code object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Dense byte-offset -> block index.
    offset_index: Vec<Option<BlockId>>,
    pub entry: BlockId,
    /// Decoded exception regions (synthesized from SETUP_* pre-3.11).
    pub regions: Vec<ExceptionEntry>,
}

impl Cfg {
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block covering `offset`, O(1).
    #[must_use]
    pub fn block_containing(&self, offset: u32) -> Option<BlockId> {
        self.offset_index.get(offset as usize).copied().flatten()
    }

    /// Block whose first instruction sits at `offset`.
    #[must_use]
    pub fn block_starting_at(&self, offset: u32) -> Option<BlockId> {
        let id = self.block_containing(offset)?;
        (self.block(id).start_offset == offset).then_some(id)
    }

    /// Builds the CFG for a decoded instruction stream.
    ///
    /// `instructions` must be non-empty; callers special-case empty code
    /// objects before reaching here.
    pub fn build(
        instructions: &[Instruction],
        code: &CodeObject,
        version: PyVersion,
    ) -> DecompileResult<Self> {
        let regions = exception_regions(code, instructions, version)?;
        let code_end = instructions.last().map_or(0, Instruction::next_offset);

        // Leader scan: first instruction, every jump target, everything
        // after a block-ending instruction, handler entries, and the
        // instruction after each protected range.
        let mut leaders: AHashSet<u32> = AHashSet::new();
        leaders.insert(instructions[0].offset);
        for instr in instructions {
            if let Some(target) = instr.jump_target(version) {
                if target >= code_end {
                    return Err(DecompileError::MalformedBytecode {
                        offset: instr.offset,
                        reason: format!("jump target {target} out of range"),
                    });
                }
                leaders.insert(target);
            }
            if instr.opcode.ends_basic_block() {
                leaders.insert(instr.next_offset());
            }
        }
        for region in &regions {
            leaders.insert(region.target);
            leaders.insert(region.start);
            if region.end < code_end {
                leaders.insert(region.end);
            }
        }

        // Partition into blocks.
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut current: Vec<Instruction> = Vec::new();
        for instr in instructions {
            if leaders.contains(&instr.offset) && !current.is_empty() {
                push_block(&mut blocks, std::mem::take(&mut current));
            }
            current.push(*instr);
        }
        if !current.is_empty() {
            push_block(&mut blocks, current);
        }

        // Dense offset -> block index over the whole byte range.
        let mut offset_index = vec![None; code_end as usize];
        for block in &blocks {
            for slot in &mut offset_index[block.start_offset as usize..block.end_offset as usize] {
                *slot = Some(block.id);
            }
        }

        let mut cfg = Self {
            blocks,
            offset_index,
            entry: BlockId::new(0),
            regions,
        };

        // Leaders derived from jump targets guarantee target blocks exist;
        // a miss here means the target fell mid-instruction.
        let resolve = |cfg: &Self, offset: u32, at: u32| -> DecompileResult<BlockId> {
            cfg.block_starting_at(offset).ok_or(DecompileError::MalformedBytecode {
                offset: at,
                reason: format!("jump target {offset} is not an instruction boundary"),
            })
        };

        // Flow edges.
        let mut edges: Vec<(BlockId, BlockId, EdgeKind)> = Vec::new();
        for block in &cfg.blocks {
            let term = *block.terminator();
            let op = term.opcode;
            if op.is_conditional_jump() {
                let target = term.jump_target(version).ok_or(DecompileError::MalformedBytecode {
                    offset: term.offset,
                    reason: "conditional jump without target".into(),
                })?;
                let taken = resolve(&cfg, target, term.offset)?;
                let fallthrough = resolve(&cfg, term.next_offset(), term.offset)?;
                let (taken_kind, fall_kind) = if op.jumps_on_false() {
                    (EdgeKind::CondFalse, EdgeKind::CondTrue)
                } else {
                    (EdgeKind::CondTrue, EdgeKind::CondFalse)
                };
                edges.push((block.id, taken, taken_kind));
                edges.push((block.id, fallthrough, fall_kind));
            } else if op.is_unconditional_jump() || op == Opcode::ContinueLoop {
                let target = term.jump_target(version).ok_or(DecompileError::MalformedBytecode {
                    offset: term.offset,
                    reason: "jump without target".into(),
                })?;
                let to = resolve(&cfg, target, term.offset)?;
                let kind = if target <= block.start_offset {
                    EdgeKind::LoopBack
                } else {
                    EdgeKind::Normal
                };
                edges.push((block.id, to, kind));
            } else if op.never_falls_through() || matches!(op, Opcode::ReturnValue | Opcode::ReturnConst) {
                // No successors.
            } else if term.next_offset() < code_end {
                let to = resolve(&cfg, term.next_offset(), term.offset)?;
                edges.push((block.id, to, EdgeKind::Normal));
            }
        }

        // Exception edges, additive over flow edges.
        let regions = cfg.regions.clone();
        for region in &regions {
            let handler = resolve(&cfg, region.target, region.start)?;
            cfg.blocks[handler.index()].is_handler = true;
            let covered: Vec<BlockId> = cfg
                .blocks
                .iter()
                .filter(|b| b.start_offset < region.end && b.end_offset > region.start)
                .map(|b| b.id)
                .collect();
            for id in covered {
                edges.push((id, handler, EdgeKind::Exception));
            }
        }

        for (from, to, kind) in edges {
            if matches!(kind, EdgeKind::LoopBack) || (kind != EdgeKind::Exception && to.index() <= from.index()) {
                cfg.blocks[to.index()].is_loop_header = true;
            }
            cfg.blocks[from.index()].successors.push((to, kind));
            cfg.blocks[to.index()].predecessors.push(from);
        }

        Ok(cfg)
    }
}

fn push_block(blocks: &mut Vec<BasicBlock>, instructions: Vec<Instruction>) {
    let id = BlockId::new(blocks.len());
    let start_offset = instructions[0].offset;
    let end_offset = instructions.last().map_or(start_offset, Instruction::next_offset);
    blocks.push(BasicBlock {
        id,
        start_offset,
        end_offset,
        instructions,
        successors: Vec::new(),
        predecessors: Vec::new(),
        is_handler: false,
        is_loop_header: false,
    });
}

/// Exception regions: the decoded side table on 3.11+, or ranges
/// synthesized from the SETUP_EXCEPT/SETUP_FINALLY/SETUP_WITH block stack
/// before that.
pub fn exception_regions(
    code: &CodeObject,
    instructions: &[Instruction],
    version: PyVersion,
) -> DecompileResult<Vec<ExceptionEntry>> {
    if version.has_exception_table() {
        return code.exception_entries();
    }
    let mut regions = Vec::new();
    let mut stack: Vec<(u32, u32)> = Vec::new(); // (protected start, handler)
    for instr in instructions {
        match instr.opcode {
            Opcode::SetupExcept | Opcode::SetupFinally | Opcode::SetupWith | Opcode::SetupAsyncWith => {
                let target = instr.jump_target(version).ok_or(DecompileError::MalformedBytecode {
                    offset: instr.offset,
                    reason: "SETUP without target".into(),
                })?;
                stack.push((instr.next_offset(), target));
            }
            Opcode::PopBlock => {
                // SETUP_LOOP blocks are tracked by the loop patterns, not
                // here, so an unmatched POP_BLOCK is fine.
                if let Some((start, handler)) = stack.pop() {
                    regions.push(ExceptionEntry {
                        start,
                        end: instr.next_offset(),
                        target: handler,
                        depth: 0,
                        lasti: false,
                    });
                }
            }
            _ => {}
        }
    }
    // Innermost-first, the order handler lookup wants.
    regions.sort_by_key(|r| std::cmp::Reverse(r.start));
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::decode_code;

    const V39: PyVersion = PyVersion::new(3, 9);

    fn bare_code(code: Vec<u8>) -> CodeObject {
        CodeObject {
            arg_count: 0,
            pos_only_arg_count: 0,
            kw_only_arg_count: 0,
            n_locals: 0,
            stack_size: 0,
            flags: 0,
            code,
            consts: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
            free_vars: Vec::new(),
            cell_vars: Vec::new(),
            filename: "test.py".into(),
            name: "<module>".into(),
            qualname: "<module>".into(),
            first_line: 1,
            line_table: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    fn build(code: Vec<u8>) -> Cfg {
        let obj = bare_code(code);
        let instrs = decode_code(&obj.code, V39).unwrap();
        Cfg::build(&instrs, &obj, V39).unwrap()
    }

    #[test]
    fn test_straight_line_is_one_block() {
        // LOAD_CONST 0; POP_TOP; LOAD_CONST 1; RETURN_VALUE
        let cfg = build(vec![100, 0, 1, 0, 100, 1, 83, 0]);
        assert_eq!(cfg.len(), 1);
        assert!(cfg.block(cfg.entry).successors.is_empty());
    }

    #[test]
    fn test_conditional_jump_has_true_and_false_edges() {
        // 0: LOAD_NAME 0; 2: POP_JUMP_IF_FALSE 8; 4: LOAD_CONST 0;
        // 6: RETURN_VALUE; 8: LOAD_CONST 1; 10: RETURN_VALUE
        let cfg = build(vec![101, 0, 114, 8, 100, 0, 83, 0, 100, 1, 83, 0]);
        assert_eq!(cfg.len(), 3);
        let entry = cfg.block(cfg.entry);
        assert_eq!(entry.successors.len(), 2);
        let true_succ = entry.successor(EdgeKind::CondTrue).unwrap();
        let false_succ = entry.successor(EdgeKind::CondFalse).unwrap();
        assert_eq!(cfg.block(true_succ).start_offset, 4);
        assert_eq!(cfg.block(false_succ).start_offset, 8);
    }

    #[test]
    fn test_block_containing_is_dense() {
        let cfg = build(vec![101, 0, 114, 8, 100, 0, 83, 0, 100, 1, 83, 0]);
        for block in &cfg.blocks {
            for off in (block.start_offset..block.end_offset).step_by(2) {
                assert_eq!(cfg.block_containing(off), Some(block.id));
            }
            assert_eq!(cfg.block_starting_at(block.start_offset), Some(block.id));
        }
    }

    #[test]
    fn test_backward_jump_marks_loop_header() {
        // 0: LOAD_NAME 0; 2: POP_JUMP_IF_FALSE 8; 4: LOAD_NAME 1;
        // 6: JUMP_ABSOLUTE 0; 8: LOAD_CONST 0; 10: RETURN_VALUE
        let cfg = build(vec![101, 0, 114, 8, 101, 1, 1, 0, 113, 0, 100, 0, 83, 0]);
        let header = cfg.block_starting_at(0).unwrap();
        assert!(cfg.block(header).is_loop_header);
        let body = cfg.block_containing(4).unwrap();
        let back = cfg
            .block(body)
            .successors
            .iter()
            .find(|(id, _)| *id == header)
            .unwrap();
        assert_eq!(back.1, EdgeKind::LoopBack);
    }

    #[test]
    fn test_out_of_range_jump_is_malformed() {
        let obj = bare_code(vec![110, 40, 83, 0]); // JUMP_FORWARD way past end
        let instrs = decode_code(&obj.code, V39).unwrap();
        assert!(matches!(
            Cfg::build(&instrs, &obj, V39),
            Err(DecompileError::MalformedBytecode { .. })
        ));
    }

    #[test]
    fn test_exception_edges_are_additive() {
        // 3.9 try/except skeleton:
        // 0: SETUP_FINALLY 8 (handler at 10)
        // 2: LOAD_NAME 0; 4: POP_TOP; 6: POP_BLOCK; 8: JUMP_FORWARD 16 -> 26?
        // Simplified: handler at 10 ends with RETURN.
        let code = vec![
            122, 8, // 0: SETUP_FINALLY -> handler 10
            101, 0, // 2: LOAD_NAME
            1, 0, // 4: POP_TOP
            87, 0, // 6: POP_BLOCK
            110, 4, // 8: JUMP_FORWARD -> 14
            1, 0, // 10: POP_TOP (handler)
            1, 0, // 12: POP_TOP
            100, 0, // 14: LOAD_CONST
            83, 0, // 16: RETURN_VALUE
        ];
        let cfg = build(code);
        let handler = cfg.block_starting_at(10).unwrap();
        assert!(cfg.block(handler).is_handler);
        let protected = cfg.block_containing(2).unwrap();
        assert!(cfg
            .block(protected)
            .successors
            .iter()
            .any(|(id, kind)| *id == handler && *kind == EdgeKind::Exception));
        // Normal edges still present on the protected block.
        assert!(cfg
            .block(protected)
            .successors
            .iter()
            .any(|(_, kind)| *kind != EdgeKind::Exception));
    }
}
