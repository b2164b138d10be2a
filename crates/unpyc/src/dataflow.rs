//! Merged entry stacks for every reachable block.
//!
//! A worklist over the CFG runs the simulator in flow mode and merges
//! each block's exit stack into its successors' entry stacks, after
//! applying the edge effect of the block's terminator (conditional jumps
//! pop their condition, `FOR_ITER` pushes on the iteration edge, the
//! OR_POP forms keep their value on the short-circuit edge only).
//!
//! Handler blocks are seeded, not merged into: three unknown slots for
//! the classic pre-3.11 exception triple, or the exception-table depth
//! plus the exception (plus `lasti`) on 3.11+.

use log::debug;

use crate::{
    cfg::{BlockId, Cfg, EdgeKind},
    code::CodeObject,
    error::DecompileResult,
    opcodes::Opcode,
    simulate::{NoNesting, SimMode, Simulator},
    stack::{StackState, StackValue},
    version::PyVersion,
};

/// Entry stacks per block; `None` for unreachable blocks.
#[derive(Debug)]
pub struct Dataflow {
    pub stack_in: Vec<Option<StackState>>,
}

impl Dataflow {
    /// Runs the worklist to a fixpoint.
    pub fn compute(cfg: &Cfg, code: &CodeObject, version: PyVersion) -> DecompileResult<Self> {
        let n = cfg.len();
        let mut stack_in: Vec<Option<StackState>> = vec![None; n];
        stack_in[cfg.entry.index()] = Some(StackState::new());

        // Handler seeds are authoritative; exception edges do not merge.
        for block in &cfg.blocks {
            if !block.is_handler {
                continue;
            }
            let seed = if version.has_exception_table() {
                let region = cfg.regions.iter().find(|r| r.target == block.start_offset);
                let depth = region.map_or(0, |r| r.depth) as usize;
                let lasti = region.is_some_and(|r| r.lasti);
                StackState::unknowns(depth + 1 + usize::from(lasti))
            } else {
                StackState::unknowns(3)
            };
            stack_in[block.id.index()] = Some(seed);
        }

        let hook = NoNesting;
        let mut work: Vec<BlockId> = Vec::new();
        work.push(cfg.entry);
        for block in &cfg.blocks {
            if block.is_handler {
                work.push(block.id);
            }
        }

        while let Some(id) = work.pop() {
            let entry = match &stack_in[id.index()] {
                Some(state) => state.clone(),
                None => continue,
            };
            let block = cfg.block(id);
            let mut sim = Simulator::new(code, version, SimMode::Flow, &hook, entry);
            sim.run(&block.instructions)?;
            let exit = sim.stack;
            let term = block.terminator().opcode;

            for (succ, kind) in block.flow_successors() {
                if cfg.block(succ).is_handler {
                    continue;
                }
                let next = edge_stack(&exit, term, kind, version);
                let changed = match &mut stack_in[succ.index()] {
                    Some(existing) => existing.merge(&next, succ)?,
                    slot @ None => {
                        *slot = Some(next);
                        true
                    }
                };
                if changed {
                    work.push(succ);
                }
            }
        }

        debug!(
            "entry stacks converged: {} reachable of {} blocks",
            stack_in.iter().filter(|s| s.is_some()).count(),
            n
        );
        Ok(Self { stack_in })
    }

    /// Entry stack of a block, if reachable.
    #[must_use]
    pub fn entry(&self, id: BlockId) -> Option<&StackState> {
        self.stack_in[id.index()].as_ref()
    }
}

/// The stack a successor sees, given the terminator and edge kind.
pub fn edge_stack(exit: &StackState, term: Opcode, kind: EdgeKind, version: PyVersion) -> StackState {
    let mut next = exit.clone();
    match term {
        Opcode::PopJumpIfFalse
        | Opcode::PopJumpIfTrue
        | Opcode::PopJumpIfNone
        | Opcode::PopJumpIfNotNone
        | Opcode::PopJumpBackwardIfFalse
        | Opcode::PopJumpBackwardIfTrue
        | Opcode::PopJumpBackwardIfNone
        | Opcode::PopJumpBackwardIfNotNone => {
            let _ = next.pop();
        }
        Opcode::JumpIfFalseOrPop => {
            // Value survives only on the short-circuit (jump) edge.
            if kind != EdgeKind::CondFalse {
                let _ = next.pop();
            }
        }
        Opcode::JumpIfTrueOrPop => {
            if kind != EdgeKind::CondTrue {
                let _ = next.pop();
            }
        }
        Opcode::JumpIfNotExcMatch => {
            let _ = next.pop();
            let _ = next.pop();
        }
        Opcode::ForIter => {
            if kind == EdgeKind::CondTrue {
                // Iteration edge: the next value sits above the iterator.
                next.push(StackValue::Unknown);
            } else if version.before(3, 12) {
                // Exhaustion consumed the iterator.
                let _ = next.pop();
            } else if version.before(3, 13) {
                // 3.12 jumps to END_FOR with a sentinel above the iterator.
                next.push(StackValue::Unknown);
            }
        }
        _ => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{insn::decode_code, marshal::Obj};

    const V39: PyVersion = PyVersion::new(3, 9);

    fn analyze(consts: Vec<Obj>, names: Vec<&str>, bytecode: Vec<u8>) -> (Cfg, Dataflow) {
        let code = CodeObject {
            arg_count: 0,
            pos_only_arg_count: 0,
            kw_only_arg_count: 0,
            n_locals: 0,
            stack_size: 8,
            flags: 0,
            code: bytecode,
            consts,
            names: names.into_iter().map(str::to_owned).collect(),
            var_names: Vec::new(),
            free_vars: Vec::new(),
            cell_vars: Vec::new(),
            filename: "test.py".into(),
            name: "<module>".into(),
            qualname: "<module>".into(),
            first_line: 1,
            line_table: Vec::new(),
            exception_table: Vec::new(),
        };
        let instrs = decode_code(&code.code, V39).unwrap();
        let cfg = Cfg::build(&instrs, &code, V39).unwrap();
        let flow = Dataflow::compute(&cfg, &code, V39).unwrap();
        (cfg, flow)
    }

    #[test]
    fn test_merge_agreeing_branches_keeps_expr() {
        // x = 1 if c else 1  (same constant on both arms)
        // 0: LOAD_NAME c; 2: POP_JUMP_IF_FALSE 8; 4: LOAD_CONST 0;
        // 6: JUMP_FORWARD -> 10; 8: LOAD_CONST 0; 10: STORE_NAME x; ...
        let (cfg, flow) = analyze(
            vec![Obj::Int(1), Obj::None],
            vec!["c", "x"],
            vec![101, 0, 114, 8, 100, 0, 110, 2, 100, 0, 90, 1, 100, 1, 83, 0],
        );
        let merge = cfg.block_starting_at(10).unwrap();
        let entry = flow.entry(merge).unwrap();
        assert_eq!(entry.depth(), 1);
        assert!(!entry.peek(0).unwrap().is_unknown());
    }

    #[test]
    fn test_merge_disagreeing_branches_is_unknown() {
        let (cfg, flow) = analyze(
            vec![Obj::Int(1), Obj::Int(2), Obj::None],
            vec!["c", "x"],
            vec![101, 0, 114, 8, 100, 0, 110, 2, 100, 1, 90, 1, 100, 2, 83, 0],
        );
        let merge = cfg.block_starting_at(10).unwrap();
        let entry = flow.entry(merge).unwrap();
        assert_eq!(entry.depth(), 1);
        assert!(entry.peek(0).unwrap().is_unknown());
    }

    #[test]
    fn test_condition_popped_on_both_edges() {
        let (cfg, flow) = analyze(
            vec![Obj::None],
            vec!["c", "x"],
            vec![101, 0, 114, 8, 101, 1, 1, 0, 100, 0, 83, 0],
        );
        // then-block at 4 and merge at 8 both start with an empty stack.
        for offset in [4u32, 8] {
            let block = cfg.block_starting_at(offset).unwrap();
            assert_eq!(flow.entry(block).unwrap().depth(), 0, "offset {offset}");
        }
    }

    #[test]
    fn test_handler_seeded_with_triple() {
        // SETUP_FINALLY protected region with a handler block.
        let (cfg, flow) = analyze(
            vec![Obj::None],
            vec!["a"],
            vec![
                122, 8, // 0: SETUP_FINALLY -> 10
                101, 0, // 2: LOAD_NAME a
                1, 0, // 4: POP_TOP
                87, 0, // 6: POP_BLOCK
                110, 6, // 8: JUMP_FORWARD -> 16
                1, 0, // 10: POP_TOP
                1, 0, // 12: POP_TOP
                1, 0, // 14: POP_TOP
                100, 0, // 16: LOAD_CONST None
                83, 0, // 18: RETURN_VALUE
            ],
        );
        let handler = cfg.block_starting_at(10).unwrap();
        assert!(cfg.block(handler).is_handler);
        assert_eq!(flow.entry(handler).unwrap().depth(), 3);
    }

    #[test]
    fn test_for_iter_edges() {
        // for x in it: pass
        // 0: LOAD_NAME it; 2: GET_ITER; 4: FOR_ITER -> 10; 6: STORE_NAME x;
        // 8: JUMP_ABSOLUTE 4; 10: LOAD_CONST None; 12: RETURN_VALUE
        let (cfg, flow) = analyze(
            vec![Obj::None],
            vec!["it", "x"],
            vec![101, 0, 68, 0, 93, 4, 90, 1, 113, 4, 100, 0, 83, 0],
        );
        let body = cfg.block_starting_at(6).unwrap();
        let exit = cfg.block_starting_at(10).unwrap();
        // Body sees iterator + pushed element; exit sees empty (3.9 pops
        // the iterator on exhaustion).
        assert_eq!(flow.entry(body).unwrap().depth(), 2);
        assert_eq!(flow.entry(exit).unwrap().depth(), 0);
    }
}
