//! Region classification: which structured statement a block heads.
//!
//! Classification is authoritative: the structured decompiler asks once
//! per block and dispatches on the answer, never re-detecting. Results
//! are cached per `(block, role)`; the CFG is immutable after
//! construction so the cache never invalidates.
//!
//! Candidates are tried in a fixed priority order. A candidate that does
//! not match simply yields to the next one; non-matches never surface as
//! errors.

use ahash::AHashMap;

use crate::{
    cfg::{BlockId, Cfg, EdgeKind},
    dom::DomInfo,
    opcodes::Opcode,
    version::PyVersion,
};

/// The structured pattern a block heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PatternKind {
    /// Straight-line code with at most one flow successor.
    Sequential,
    /// Head of an `if`/`elif`/`else` region.
    If,
    /// Both branches produce one expression and merge: `a if c else b`.
    Ternary,
    /// Short-circuit `and`/`or` chain.
    BoolOp,
    /// Loop with its test in the header (or `while True`).
    While,
    /// Pre-tested guard of a rotated loop (3.10+ `while` shape).
    WhileGuard,
    /// `for` loop headed by `FOR_ITER`.
    For,
    /// Head of a protected region with handlers.
    Try,
    /// `with` / `async with` region.
    With,
    /// `match` statement head.
    Match,
}

/// Role a query is made under, so loop headers can be re-classified for
/// their intra-loop content once their loop is already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Normal traversal.
    Top,
    /// The block's own loop is already being decompiled; classify the
    /// block's content instead of re-opening the loop.
    InsideOwnLoop,
}

/// Cached per-block pattern classifier.
pub struct PatternDetector<'a> {
    cfg: &'a Cfg,
    dom: &'a DomInfo,
    version: PyVersion,
    cache: AHashMap<(BlockId, Role), PatternKind>,
}

impl<'a> PatternDetector<'a> {
    #[must_use]
    pub fn new(cfg: &'a Cfg, dom: &'a DomInfo, version: PyVersion) -> Self {
        Self {
            cfg,
            dom,
            version,
            cache: AHashMap::new(),
        }
    }

    /// Classifies `block`, caching the result.
    pub fn classify(&mut self, block: BlockId, role: Role) -> PatternKind {
        if let Some(&kind) = self.cache.get(&(block, role)) {
            return kind;
        }
        let kind = self.classify_uncached(block, role);
        self.cache.insert((block, role), kind);
        kind
    }

    fn classify_uncached(&self, block: BlockId, role: Role) -> PatternKind {
        let b = self.cfg.block(block);

        // With before try: a with-block carries exception edges too, but
        // the BEFORE_WITH/SETUP_WITH opcode decides.
        if b.instructions.iter().any(|i| {
            matches!(
                i.opcode,
                Opcode::BeforeWith | Opcode::SetupWith | Opcode::BeforeAsyncWith | Opcode::SetupAsyncWith
            )
        }) {
            return PatternKind::With;
        }

        if self.heads_try_region(block) {
            return PatternKind::Try;
        }

        if b.instructions.iter().any(|i| {
            matches!(
                i.opcode,
                Opcode::MatchSequence | Opcode::MatchMapping | Opcode::MatchClass | Opcode::MatchKeys
            )
        }) {
            return PatternKind::Match;
        }

        // Loops: a loop header opens its loop once; when queried from
        // inside that loop the header is classified by its content.
        if role == Role::Top && self.dom.loop_headed_by(block).is_some() {
            if b.terminator().opcode == Opcode::ForIter
                || b.instructions.iter().any(|i| i.opcode == Opcode::ForIter)
            {
                return PatternKind::For;
            }
            return PatternKind::While;
        }

        let term = b.terminator();
        if term.opcode == Opcode::ForIter {
            return PatternKind::For;
        }

        if term.opcode.is_conditional_jump() {
            if self.is_rotated_while_guard(block) {
                return PatternKind::WhileGuard;
            }
            if matches!(term.opcode, Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop) {
                return PatternKind::BoolOp;
            }
            if self.is_modern_bool_op(block) {
                return PatternKind::BoolOp;
            }
            if self.is_ternary(block) {
                return PatternKind::Ternary;
            }
            return PatternKind::If;
        }

        PatternKind::Sequential
    }

    /// A block heads a try region when a protected range starts inside it
    /// and the handler is a real except/finally handler: on 3.11+ those
    /// always open with PUSH_EXC_INFO, which rules out the name-unbind
    /// and PEP 709 cleanup handlers the compiler also registers.
    fn heads_try_region(&self, block: BlockId) -> bool {
        let b = self.cfg.block(block);
        self.cfg.regions.iter().any(|region| {
            region.start >= b.start_offset
                && region.start < b.end_offset
                && self.cfg.block_starting_at(region.target).map_or(false, |h| {
                    if self.is_with_protocol(h) {
                        return false;
                    }
                    if self.version.at_least(3, 11) {
                        self.cfg.block(h).first().opcode == Opcode::PushExcInfo
                    } else {
                        !self.is_comprehension_cleanup(h) && !self.is_unbind_cleanup(h)
                    }
                })
        })
    }

    /// A handler that starts the `__exit__` protocol belongs to a `with`
    /// statement, never a user-visible `try`.
    fn is_with_protocol(&self, handler: BlockId) -> bool {
        let instrs = &self.cfg.block(handler).instructions;
        instrs.iter().take(2).any(|i| {
            matches!(
                i.opcode,
                Opcode::WithExceptStart | Opcode::WithCleanup | Opcode::WithCleanupStart
            )
        })
    }

    /// Pre-3.11 `except E as e` bodies are protected by a region whose
    /// handler just unbinds the name and re-raises.
    fn is_unbind_cleanup(&self, handler: BlockId) -> bool {
        let instrs = &self.cfg.block(handler).instructions;
        instrs.len() <= 5
            && instrs.first().map(|i| i.opcode) == Some(Opcode::LoadConst)
            && instrs.iter().any(|i| {
                matches!(i.opcode, Opcode::DeleteFast | Opcode::DeleteName | Opcode::DeleteGlobal)
            })
    }

    /// The inline-comprehension cleanup handler: restore the saved local,
    /// then re-raise. Never a user-visible `try`.
    fn is_comprehension_cleanup(&self, handler: BlockId) -> bool {
        let instrs = &self.cfg.block(handler).instructions;
        let mut ops = instrs.iter().map(|i| i.opcode);
        matches!(
            (ops.next(), ops.next(), ops.next()),
            (Some(Opcode::Swap), Some(Opcode::PopTop), Some(Opcode::StoreFast))
                | (Some(Opcode::Swap), Some(Opcode::StoreFast), Some(Opcode::Reraise))
        ) && instrs.iter().any(|i| i.opcode == Opcode::Reraise)
    }

    /// 3.10+ rotates `while cond:` into a pre-test guard plus a
    /// conditional back edge: the guard's taken-or-fallthrough edge
    /// enters a loop it is not itself part of, whose back edge is a
    /// conditional jump, and the guard's other edge leaves past the loop.
    fn is_rotated_while_guard(&self, block: BlockId) -> bool {
        if !self.version.at_least(3, 10) {
            return false;
        }
        let b = self.cfg.block(block);
        for (succ, kind) in b.flow_successors() {
            if kind == EdgeKind::Exception {
                continue;
            }
            let Some(l) = self.dom.loop_headed_by(succ) else { continue };
            if l.contains(block) {
                continue;
            }
            let back_is_conditional = l
                .back_edges
                .iter()
                .any(|&src| self.cfg.block(src).terminator().opcode.is_conditional_jump());
            if !back_is_conditional {
                continue;
            }
            // The other edge must leave the loop region.
            let leaves = b
                .flow_successors()
                .any(|(other, _)| other != succ && !l.contains(other));
            if leaves {
                return true;
            }
        }
        false
    }

    /// 3.12+ spells `a and b` as COPY 1 / POP_JUMP_IF_FALSE with the
    /// fall-through starting at POP_TOP.
    fn is_modern_bool_op(&self, block: BlockId) -> bool {
        let b = self.cfg.block(block);
        if !matches!(
            b.terminator().opcode,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue | Opcode::PopJumpIfNone | Opcode::PopJumpIfNotNone
        ) {
            return false;
        }
        let n = b.instructions.len();
        if n < 2 || b.instructions[n - 2].opcode != Opcode::Copy || b.instructions[n - 2].arg != 1 {
            return false;
        }
        // Fall-through must discard the copy.
        let fall = match b.terminator().opcode.jumps_on_false() {
            true => b.successor(EdgeKind::CondTrue),
            false => b.successor(EdgeKind::CondFalse),
        };
        fall.map_or(false, |f| {
            self.cfg
                .block(f)
                .instructions
                .first()
                .map_or(false, |i| i.opcode == Opcode::PopTop)
        })
    }

    /// Ternary: both branches are single expression-producing blocks that
    /// meet at the condition block's post-dominator.
    fn is_ternary(&self, block: BlockId) -> bool {
        let b = self.cfg.block(block);
        let Some(merge) = self.dom.merge_point(block) else {
            return false;
        };
        let (Some(t), Some(f)) = (b.successor(EdgeKind::CondTrue), b.successor(EdgeKind::CondFalse)) else {
            return false;
        };
        if t == merge || f == merge {
            return false;
        }
        for branch in [t, f] {
            let bb = self.cfg.block(branch);
            // Exactly one flow successor, straight to the merge.
            let mut succs = bb.flow_successors();
            match (succs.next(), succs.next()) {
                (Some((s, _)), None) if s == merge => {}
                _ => return false,
            }
            if !self.is_expression_only(branch) {
                return false;
            }
        }
        true
    }

    /// No statement-producing opcodes: the block only computes a value.
    fn is_expression_only(&self, block: BlockId) -> bool {
        self.cfg.block(block).instructions.iter().all(|i| {
            !matches!(
                i.opcode,
                Opcode::StoreName
                    | Opcode::StoreFast
                    | Opcode::StoreGlobal
                    | Opcode::StoreDeref
                    | Opcode::StoreAttr
                    | Opcode::StoreSubscr
                    | Opcode::StoreSlice
                    | Opcode::DeleteName
                    | Opcode::DeleteFast
                    | Opcode::DeleteGlobal
                    | Opcode::DeleteAttr
                    | Opcode::DeleteSubscr
                    | Opcode::PopTop
                    | Opcode::ReturnValue
                    | Opcode::ReturnConst
                    | Opcode::RaiseVarargs
                    | Opcode::Reraise
                    | Opcode::ImportName
                    | Opcode::ImportStar
                    | Opcode::PrintItem
                    | Opcode::PrintNewline
                    | Opcode::UnpackSequence
                    | Opcode::UnpackEx
                    | Opcode::YieldValue
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{code::CodeObject, insn::decode_code, marshal::Obj};

    const V39: PyVersion = PyVersion::new(3, 9);

    fn setup(consts: Vec<Obj>, names: Vec<&str>, bytecode: Vec<u8>) -> (Cfg, DomInfo) {
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
        let dom = DomInfo::compute(&cfg);
        (cfg, dom)
    }

    #[test]
    fn test_if_classification() {
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["c", "x"],
            vec![101, 0, 114, 8, 101, 1, 1, 0, 100, 0, 83, 0],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        assert_eq!(detector.classify(cfg.entry, Role::Top), PatternKind::If);
    }

    #[test]
    fn test_ternary_classification() {
        // x = a if c else b
        // 0: LOAD_NAME c; 2: POP_JUMP_IF_FALSE 8; 4: LOAD_NAME a;
        // 6: JUMP_FORWARD -> 10; 8: LOAD_NAME b; 10: STORE_NAME x; ...
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["c", "a", "b", "x"],
            vec![101, 0, 114, 8, 101, 1, 110, 2, 101, 2, 90, 3, 100, 0, 83, 0],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        assert_eq!(detector.classify(cfg.entry, Role::Top), PatternKind::Ternary);
    }

    #[test]
    fn test_while_and_inner_role() {
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["c", "b"],
            vec![101, 0, 114, 8, 101, 1, 1, 0, 113, 0, 100, 0, 83, 0],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        let header = cfg.entry;
        assert_eq!(detector.classify(header, Role::Top), PatternKind::While);
        // Inside its own loop the header is just the if-shaped test.
        assert_eq!(detector.classify(header, Role::InsideOwnLoop), PatternKind::If);
    }

    #[test]
    fn test_for_classification() {
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["it", "x"],
            vec![101, 0, 68, 0, 93, 4, 90, 1, 113, 4, 100, 0, 83, 0],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        let header = cfg.block_starting_at(4).unwrap();
        assert_eq!(detector.classify(header, Role::Top), PatternKind::For);
    }

    #[test]
    fn test_or_pop_is_bool_op() {
        // x = a and b:
        // 0: LOAD_NAME a; 2: JUMP_IF_FALSE_OR_POP 8; 4: LOAD_NAME b;
        // (fallthrough) 8: STORE_NAME x ...
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["a", "b", "x"],
            vec![101, 0, 111, 8, 101, 1, 110, 0, 90, 2, 100, 0, 83, 0],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        assert_eq!(detector.classify(cfg.entry, Role::Top), PatternKind::BoolOp);
    }

    #[test]
    fn test_try_classification() {
        let (cfg, dom) = setup(
            vec![Obj::None],
            vec!["a"],
            vec![
                122, 8, // 0: SETUP_FINALLY -> 10
                101, 0, // 2: LOAD_NAME a
                1, 0, // 4: POP_TOP
                87, 0, // 6: POP_BLOCK
                110, 6, // 8: JUMP_FORWARD -> 16
                1, 0, 1, 0, 1, 0, // 10..16: handler pops
                100, 0, 83, 0, // 16: LOAD_CONST; RETURN_VALUE
            ],
        );
        let mut detector = PatternDetector::new(&cfg, &dom, V39);
        // The SETUP_FINALLY block itself is straight-line; the protected
        // body heads the try region.
        assert_eq!(detector.classify(cfg.entry, Role::Top), PatternKind::Sequential);
        let body = cfg.block_starting_at(2).unwrap();
        assert_eq!(detector.classify(body, Role::Top), PatternKind::Try);
    }
}
