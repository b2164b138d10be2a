//! Dominator and loop analysis over a built CFG.
//!
//! Immediate dominators and post-dominators use the classic iterative
//! two-finger intersection over reverse post-order. Natural loops derive
//! from back edges (target dominates source); the body is every block
//! that reaches the back edge's source without passing through the
//! header. Post-dominators drive merge-point selection in the structured
//! decompiler, so both directions are computed up front.

use crate::cfg::{BlockId, Cfg, EdgeKind};

/// Dominator, post-dominator, and loop data for one CFG.
#[derive(Debug)]
pub struct DomInfo {
    /// Immediate dominator per block; `None` for the entry and for
    /// unreachable blocks.
    pub idom: Vec<Option<BlockId>>,
    /// Immediate post-dominator per block; `None` when the block only
    /// reaches function exit.
    pub ipdom: Vec<Option<BlockId>>,
    /// Reverse post-order over reachable blocks.
    pub rpo: Vec<BlockId>,
    /// Natural loops, outermost first.
    pub loops: Vec<NaturalLoop>,
    /// Innermost enclosing loop per block (index into `loops`).
    pub enclosing_loop: Vec<Option<usize>>,
}

/// A natural loop discovered from a back edge.
#[derive(Debug)]
pub struct NaturalLoop {
    pub header: BlockId,
    /// Membership bitset indexed by block.
    pub body: Vec<bool>,
    /// Sources of the back edges into the header.
    pub back_edges: Vec<BlockId>,
    /// Enclosing loop, if nested.
    pub parent: Option<usize>,
}

impl NaturalLoop {
    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.get(block.index()).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn body_size(&self) -> usize {
        self.body.iter().filter(|&&b| b).count()
    }
}

impl DomInfo {
    /// Computes all analyses for `cfg`. Deterministic for a given CFG.
    #[must_use]
    pub fn compute(cfg: &Cfg) -> Self {
        let n = cfg.len();
        let rpo = reverse_post_order(cfg);
        let idom = compute_idom(cfg, &rpo);
        let ipdom = compute_ipdom(cfg, &rpo);

        let mut info = Self {
            idom,
            ipdom,
            rpo,
            loops: Vec::new(),
            enclosing_loop: vec![None; n],
        };
        info.find_loops(cfg);
        info
    }

    /// True if `a` dominates `b` (reflexively).
    #[must_use]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur.index()] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// True if `a` post-dominates `b` (reflexively).
    #[must_use]
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.ipdom[cur.index()] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// The merge point of a branch: the branch block's immediate
    /// post-dominator.
    #[must_use]
    pub fn merge_point(&self, block: BlockId) -> Option<BlockId> {
        self.ipdom[block.index()]
    }

    /// Innermost loop containing `block`.
    #[must_use]
    pub fn loop_of(&self, block: BlockId) -> Option<&NaturalLoop> {
        self.enclosing_loop[block.index()].map(|i| &self.loops[i])
    }

    /// Loop headed exactly at `header`.
    #[must_use]
    pub fn loop_headed_by(&self, header: BlockId) -> Option<&NaturalLoop> {
        self.loops.iter().find(|l| l.header == header)
    }

    fn find_loops(&mut self, cfg: &Cfg) {
        let n = cfg.len();
        // Back edge: u -> v where v dominates u. The builder's LoopBack
        // label catches unconditional back jumps; conditional backward
        // jumps are caught by the dominance test.
        let mut headers: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for block in &cfg.blocks {
            for (succ, kind) in block.flow_successors() {
                let is_back = kind == EdgeKind::LoopBack
                    || (cfg.block(succ).start_offset <= block.start_offset && self.dominates(succ, block.id));
                if !is_back {
                    continue;
                }
                match headers.iter_mut().find(|(h, _)| *h == succ) {
                    Some((_, sources)) => sources.push(block.id),
                    None => headers.push((succ, vec![block.id])),
                }
            }
        }

        for (header, back_edges) in headers {
            let mut body = vec![false; n];
            body[header.index()] = true;
            let mut work: Vec<BlockId> = Vec::new();
            for &source in &back_edges {
                if !body[source.index()] {
                    body[source.index()] = true;
                    work.push(source);
                }
            }
            while let Some(b) = work.pop() {
                for &pred in &cfg.block(b).predecessors {
                    if !body[pred.index()] {
                        body[pred.index()] = true;
                        work.push(pred);
                    }
                }
            }
            self.loops.push(NaturalLoop {
                header,
                body,
                back_edges,
                parent: None,
            });
        }

        // Outermost first, so nested loops resolve after their parents.
        self.loops.sort_by_key(|l| std::cmp::Reverse(l.body_size()));

        // Parent: the smallest strictly larger loop containing the header.
        for i in 0..self.loops.len() {
            let header = self.loops[i].header;
            let size = self.loops[i].body_size();
            let mut best: Option<(usize, usize)> = None;
            for (j, outer) in self.loops.iter().enumerate() {
                if j == i || !outer.contains(header) {
                    continue;
                }
                let outer_size = outer.body_size();
                if outer_size <= size {
                    continue;
                }
                if best.map_or(true, |(_, s)| outer_size < s) {
                    best = Some((j, outer_size));
                }
            }
            self.loops[i].parent = best.map(|(j, _)| j);
        }

        // Innermost enclosing loop per block.
        for block in 0..n {
            let id = BlockId::new(block);
            let mut best: Option<(usize, usize)> = None;
            for (i, l) in self.loops.iter().enumerate() {
                if l.contains(id) {
                    let size = l.body_size();
                    if best.map_or(true, |(_, s)| size < s) {
                        best = Some((i, size));
                    }
                }
            }
            self.enclosing_loop[block] = best.map(|(i, _)| i);
        }
    }
}

fn reverse_post_order(cfg: &Cfg) -> Vec<BlockId> {
    let n = cfg.len();
    let mut visited = vec![false; n];
    let mut post: Vec<BlockId> = Vec::with_capacity(n);
    // Iterative DFS with an explicit phase marker.
    let mut stack: Vec<(BlockId, bool)> = vec![(cfg.entry, false)];
    while let Some((b, processed)) = stack.pop() {
        if processed {
            post.push(b);
            continue;
        }
        if visited[b.index()] {
            continue;
        }
        visited[b.index()] = true;
        stack.push((b, true));
        // Reversed so lower-index successors are visited first.
        for (succ, _) in cfg.block(b).successors.iter().rev() {
            if !visited[succ.index()] {
                stack.push((*succ, false));
            }
        }
    }
    post.reverse();
    post
}

fn compute_idom(cfg: &Cfg, rpo: &[BlockId]) -> Vec<Option<BlockId>> {
    let n = cfg.len();
    let mut order = vec![usize::MAX; n];
    for (i, &b) in rpo.iter().enumerate() {
        order[b.index()] = i;
    }
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    idom[cfg.entry.index()] = Some(cfg.entry);

    let intersect = |idom: &[Option<BlockId>], order: &[usize], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while order[a.index()] > order[b.index()] {
                a = idom[a.index()].expect("processed block has idom");
            }
            while order[b.index()] > order[a.index()] {
                b = idom[b.index()].expect("processed block has idom");
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo {
            if b == cfg.entry {
                continue;
            }
            let mut new_idom: Option<BlockId> = None;
            for &pred in &cfg.block(b).predecessors {
                if idom[pred.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, &order, pred, current),
                });
            }
            if new_idom.is_some() && idom[b.index()] != new_idom {
                idom[b.index()] = new_idom;
                changed = true;
            }
        }
    }

    // Entry's self-idom is an algorithm artifact; expose it as None.
    idom[cfg.entry.index()] = None;
    idom
}

fn compute_ipdom(cfg: &Cfg, rpo: &[BlockId]) -> Vec<Option<BlockId>> {
    let n = cfg.len();
    // Virtual exit at index n; every block without successors feeds it.
    let exit = n;
    let mut preds_rev: Vec<Vec<usize>> = vec![Vec::new(); n + 1];
    for block in &cfg.blocks {
        if block.successors.is_empty() {
            preds_rev[block.id.index()].push(exit);
        } else {
            for (succ, _) in &block.successors {
                preds_rev[block.id.index()].push(succ.index());
            }
        }
    }

    // Post-order of the forward graph approximates an RPO of the reverse
    // graph when iterated in reverse; iterate to fixpoint regardless.
    let mut order = vec![usize::MAX; n + 1];
    order[exit] = 0;
    let mut sequence: Vec<usize> = vec![exit];
    for (i, &b) in rpo.iter().rev().enumerate() {
        order[b.index()] = i + 1;
        sequence.push(b.index());
    }

    let mut ipdom: Vec<Option<usize>> = vec![None; n + 1];
    ipdom[exit] = Some(exit);

    let intersect = |ipdom: &[Option<usize>], order: &[usize], mut a: usize, mut b: usize| -> usize {
        while a != b {
            while order[a] > order[b] {
                a = ipdom[a].expect("processed block has ipdom");
            }
            while order[b] > order[a] {
                b = ipdom[b].expect("processed block has ipdom");
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &sequence {
            if b == exit {
                continue;
            }
            let mut new_ipdom: Option<usize> = None;
            for &succ in &preds_rev[b] {
                if ipdom[succ].is_none() {
                    continue;
                }
                new_ipdom = Some(match new_ipdom {
                    None => succ,
                    Some(current) => intersect(&ipdom, &order, succ, current),
                });
            }
            if new_ipdom.is_some() && ipdom[b] != new_ipdom {
                ipdom[b] = new_ipdom;
                changed = true;
            }
        }
    }

    (0..n)
        .map(|b| match ipdom[b] {
            Some(p) if p != exit => Some(BlockId::new(p)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{code::CodeObject, insn::decode_code, version::PyVersion};

    const V39: PyVersion = PyVersion::new(3, 9);

    fn build(code: Vec<u8>) -> (Cfg, DomInfo) {
        let obj = CodeObject {
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
        };
        let instrs = decode_code(&obj.code, V39).unwrap();
        let cfg = Cfg::build(&instrs, &obj, V39).unwrap();
        let dom = DomInfo::compute(&cfg);
        (cfg, dom)
    }

    /// Diamond: entry branches, both sides rejoin, then return.
    fn diamond() -> Vec<u8> {
        vec![
            101, 0, // 0: LOAD_NAME a
            114, 10, // 2: POP_JUMP_IF_FALSE -> 10
            101, 1, // 4: LOAD_NAME b
            90, 2, // 6: STORE_NAME c
            110, 4, // 8: JUMP_FORWARD -> 14
            101, 3, // 10: LOAD_NAME d
            90, 2, // 12: STORE_NAME c
            100, 0, // 14: LOAD_CONST
            83, 0, // 16: RETURN_VALUE
        ]
    }

    #[test]
    fn test_diamond_dominators() {
        let (cfg, dom) = build(diamond());
        let entry = cfg.entry;
        let then_b = cfg.block_starting_at(4).unwrap();
        let else_b = cfg.block_starting_at(10).unwrap();
        let merge = cfg.block_starting_at(14).unwrap();
        assert_eq!(dom.idom[then_b.index()], Some(entry));
        assert_eq!(dom.idom[else_b.index()], Some(entry));
        assert_eq!(dom.idom[merge.index()], Some(entry));
        assert!(dom.dominates(entry, merge));
        assert!(!dom.dominates(then_b, merge));
    }

    #[test]
    fn test_diamond_post_dominators() {
        let (cfg, dom) = build(diamond());
        let entry = cfg.entry;
        let then_b = cfg.block_starting_at(4).unwrap();
        let merge = cfg.block_starting_at(14).unwrap();
        assert_eq!(dom.merge_point(entry), Some(merge));
        assert_eq!(dom.ipdom[then_b.index()], Some(merge));
        assert!(dom.post_dominates(merge, entry));
    }

    #[test]
    fn test_loop_discovery() {
        // while a: b  -- header at 0, body at 4, exit at 8.
        let (cfg, dom) = build(vec![
            101, 0, // 0: LOAD_NAME a
            114, 8, // 2: POP_JUMP_IF_FALSE -> 8
            101, 1, // 4: LOAD_NAME b
            113, 0, // 6: JUMP_ABSOLUTE -> 0
            100, 0, // 8: LOAD_CONST
            83, 0, // 10: RETURN_VALUE
        ]);
        assert_eq!(dom.loops.len(), 1);
        let l = &dom.loops[0];
        let header = cfg.block_starting_at(0).unwrap();
        let body = cfg.block_starting_at(4).unwrap();
        let exit = cfg.block_starting_at(8).unwrap();
        assert_eq!(l.header, header);
        assert!(l.contains(body));
        assert!(!l.contains(exit));
        assert_eq!(dom.loop_of(body).unwrap().header, header);
        assert!(dom.loop_of(exit).is_none());
    }

    #[test]
    fn test_nested_loops_have_parents() {
        // while a: (while b: c)
        let (cfg, dom) = build(vec![
            101, 0, // 0: LOAD_NAME a
            114, 14, // 2: POP_JUMP_IF_FALSE -> 14
            101, 1, // 4: LOAD_NAME b (inner header)
            114, 12, // 6: POP_JUMP_IF_FALSE -> 12
            101, 2, // 8: LOAD_NAME c
            113, 4, // 10: JUMP_ABSOLUTE -> 4
            113, 0, // 12: JUMP_ABSOLUTE -> 0
            100, 0, // 14: LOAD_CONST
            83, 0, // 16: RETURN_VALUE
        ]);
        assert_eq!(dom.loops.len(), 2);
        let outer_header = cfg.block_starting_at(0).unwrap();
        let inner_header = cfg.block_starting_at(4).unwrap();
        let inner = dom.loop_headed_by(inner_header).unwrap();
        let outer = dom.loop_headed_by(outer_header).unwrap();
        assert!(outer.contains(inner_header));
        assert!(outer.body_size() > inner.body_size());
        let inner_idx = dom.loops.iter().position(|l| l.header == inner_header).unwrap();
        let outer_idx = dom.loops.iter().position(|l| l.header == outer_header).unwrap();
        assert_eq!(dom.loops[inner_idx].parent, Some(outer_idx));
        // Innermost map picks the inner loop for its body block.
        let inner_body = cfg.block_starting_at(8).unwrap();
        assert_eq!(dom.loop_of(inner_body).unwrap().header, inner_header);
    }
}
