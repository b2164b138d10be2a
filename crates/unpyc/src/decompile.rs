//! The structured decompiler: CFG regions back into statements.
//!
//! A `Walker` traverses the CFG pattern by pattern, driving the symbolic
//! simulator over each block and threading one running operand stack
//! through sequential regions. Each pattern handler consumes a contiguous
//! region, marks its blocks in the `consumed` bitset (the forward-progress
//! guard), and returns the block to continue from.
//!
//! Nested code objects re-enter through `decompile_scope`: function and
//! class bodies, lambdas, and comprehension code objects all get their own
//! walker over their own CFG, sharing only the version context.

use std::rc::Rc;

use log::trace;

use crate::{
    ast::{
        Arguments, ClsMeta, CmpOp, CompKind, Comprehension, ExceptHandler, Expr, FnMeta, FunctionDef, MatchCase,
        Pattern, Stmt, WithItem,
    },
    cfg::{BlockId, Cfg, EdgeKind},
    code::{flags, CodeObject, ExceptionEntry},
    dataflow::Dataflow,
    dom::DomInfo,
    error::{DecompileError, DecompileResult},
    insn::{decode_code, Instruction},
    marshal::Obj,
    opcodes::Opcode,
    patterns::{PatternDetector, PatternKind, Role},
    rewrite,
    simulate::{bool_join, NestedHook, SimMode, Simulator},
    stack::{CompState, StackState, StackValue},
    version::PyVersion,
};

/// Sentinel names threaded through the simulator while a pattern handler
/// harvests structure; they never survive into emitted AST.
const ITEM_SENTINEL: &str = "@item";
const EXC_SENTINEL: &str = "@exc";
const ENTER_SENTINEL: &str = "@enter";

/// What kind of scope a code object is decompiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Lambda,
    ClassBody,
}

/// Everything a nested-scope decompilation produces.
pub struct ScopeOutput {
    pub body: Vec<Stmt>,
    pub globals: Vec<String>,
    pub nonlocals: Vec<String>,
}

/// Decompiles one code object into a statement list.
///
/// This is the crate's central entry point; `lib.rs` wraps it for
/// containers and modules.
pub fn decompile_code(code: &CodeObject, version: PyVersion) -> DecompileResult<Vec<Stmt>> {
    let kind = if code.name == "<module>" {
        ScopeKind::Module
    } else if code.is_class_body() {
        ScopeKind::ClassBody
    } else {
        ScopeKind::Function
    };
    let output = decompile_scope(code, version, kind)?;
    Ok(output.body)
}

/// Like [`decompile_code`], but streams structured trace events to
/// `sink`: the merged entry-stack depth and chosen pattern per block,
/// the rewrite passes applied, and a completion event.
pub fn decompile_code_traced(
    code: &CodeObject,
    version: PyVersion,
    sink: &mut dyn crate::trace::TraceSink,
) -> DecompileResult<Vec<Stmt>> {
    use crate::trace::TraceEvent;

    let instructions = decode_code(&code.code, version)?;
    if !instructions.is_empty() {
        let cfg = Cfg::build(&instructions, code, version)?;
        let dom = DomInfo::compute(&cfg);
        let flow = Dataflow::compute(&cfg, code, version)?;
        let mut detector = PatternDetector::new(&cfg, &dom, version);
        for block in &cfg.blocks {
            if let Some(entry) = flow.entry(block.id) {
                sink.event(&TraceEvent::StackIn {
                    block: block.id,
                    depth: entry.depth(),
                });
            }
            sink.event(&TraceEvent::BlockPattern {
                block: block.id,
                pattern: detector.classify(block.id, Role::Top),
            });
        }
    }

    let body = decompile_code(code, version)?;
    for pass in [
        "implicit-return",
        "class-body",
        "imports",
        "guards",
        "asserts",
        "unmangle",
        "with-artifacts",
        "boolops",
    ] {
        sink.event(&TraceEvent::Pass { name: pass.into() });
    }
    sink.event(&TraceEvent::CodeDone {
        name: code.name.clone(),
        statements: body.len(),
    });
    Ok(body)
}

/// Decompiles a code object as a given scope kind, returning the body
/// plus the `global`/`nonlocal` declarations its stores imply.
pub fn decompile_scope(code: &CodeObject, version: PyVersion, kind: ScopeKind) -> DecompileResult<ScopeOutput> {
    let instructions = decode_code(&code.code, version)?;
    if instructions.is_empty() {
        return Ok(ScopeOutput {
            body: Vec::new(),
            globals: Vec::new(),
            nonlocals: Vec::new(),
        });
    }
    let cfg = Cfg::build(&instructions, code, version)?;
    let dom = DomInfo::compute(&cfg);
    // The dataflow pass validates that every reachable join meets at one
    // stack depth before any emission is attempted.
    let _entry_stacks = Dataflow::compute(&cfg, code, version)?;
    let hook = Nested { version };

    let mut walker = Walker {
        version,
        cfg: &cfg,
        dom: &dom,
        detector: PatternDetector::new(&cfg, &dom, version),
        sim: Simulator::new(code, version, SimMode::Emit, &hook, StackState::new()),
        consumed: vec![false; cfg.len()],
        frames: Vec::new(),
        active_tries: Vec::new(),
        steps: 0,
        step_limit: cfg.len() * 8 + 64,
    };

    let mut body = walker.walk_range(Some(cfg.entry), None, None)?;
    let globals = dedup(std::mem::take(&mut walker.sim.globals_used));
    let nonlocals = dedup(std::mem::take(&mut walker.sim.nonlocals_used));
    drop(walker);

    match kind {
        ScopeKind::Module => {
            body = rewrite::module_docstring(body);
            body = rewrite::run(body, true);
        }
        ScopeKind::Function => {
            body = rewrite::run(body, false);
        }
        ScopeKind::ClassBody => {
            body = strip_class_scaffolding(body);
            body = rewrite::run(body, false);
        }
        ScopeKind::Lambda => {
            // Keep the trailing return; the lambda builder reads it.
        }
    }

    Ok(ScopeOutput {
        body,
        globals,
        nonlocals,
    })
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Drops the `__module__`/`__qualname__` bookkeeping a class body opens
/// with, turns the `__doc__` store back into a docstring, and removes the
/// trailing return of the namespace.
fn strip_class_scaffolding(body: Vec<Stmt>) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        match &stmt {
            Stmt::Assign { targets, value } if targets.len() == 1 => {
                if let Expr::Name(name) = &targets[0] {
                    match name.as_str() {
                        "__module__" | "__qualname__" | "__firstlineno__" | "__static_attributes__" => continue,
                        "__doc__" => {
                            if let Expr::Const(Obj::Str(_)) = value {
                                out.push(Stmt::Expr(value.clone()));
                                continue;
                            }
                        }
                        _ => {}
                    }
                }
                out.push(stmt);
            }
            Stmt::Return(_) => {}
            _ => out.push(stmt),
        }
    }
    if out.is_empty() {
        out.push(Stmt::Pass);
    }
    out
}

/// The nested-scope callback handed to the simulator.
struct Nested {
    version: PyVersion,
}

impl NestedHook for Nested {
    fn comprehension(&self, code: &Rc<CodeObject>, iterable: Expr) -> DecompileResult<Expr> {
        decompile_comprehension(code, self.version, iterable)
    }

    fn lambda(&self, meta: &FnMeta) -> DecompileResult<Expr> {
        let output = decompile_scope(&meta.code, self.version, ScopeKind::Lambda)?;
        let value = output
            .body
            .into_iter()
            .find_map(|stmt| match stmt {
                Stmt::Return(Some(expr)) => Some(expr),
                Stmt::Return(None) => Some(Expr::none()),
                _ => None,
            })
            .unwrap_or_else(Expr::none);
        Ok(Expr::Lambda {
            args: Box::new(build_arguments(meta)),
            body: Box::new(value),
        })
    }

    fn function_def(&self, meta: &FnMeta, name: String) -> DecompileResult<Stmt> {
        Ok(Stmt::FunctionDef(build_function(meta, name, self.version)?))
    }

    fn class_def(&self, meta: &ClsMeta, name: String) -> DecompileResult<Stmt> {
        let output = decompile_scope(&meta.body.code, self.version, ScopeKind::ClassBody)?;
        let mut decorators = meta.decorators.clone();
        decorators.reverse();
        Ok(Stmt::ClassDef(crate::ast::ClassDef {
            name,
            bases: meta.bases.clone(),
            keywords: meta.keywords.clone(),
            body: output.body,
            decorators,
            type_params: meta.body.type_params.clone(),
        }))
    }
}

/// Builds a `def` from harvested metadata plus the nested decompilation.
fn build_function(meta: &FnMeta, name: String, version: PyVersion) -> DecompileResult<FunctionDef> {
    let output = decompile_scope(&meta.code, version, ScopeKind::Function)?;
    let mut body = Vec::new();
    if let Some(Obj::Str(doc)) = meta.code.consts.first() {
        body.push(Stmt::Expr(Expr::Const(Obj::Str(doc.clone()))));
    }
    if !output.globals.is_empty() {
        body.push(Stmt::Global(output.globals));
    }
    if !output.nonlocals.is_empty() {
        body.push(Stmt::Nonlocal(output.nonlocals));
    }
    body.extend(output.body);
    if body.is_empty() {
        body.push(Stmt::Pass);
    }

    let mut args = build_arguments(meta);
    let returns = args
        .annotations
        .iter()
        .position(|(n, _)| n == "return")
        .map(|i| args.annotations.remove(i).1);
    let mut decorators = meta.decorators.clone();
    decorators.reverse();

    Ok(FunctionDef {
        name,
        args,
        body,
        decorators,
        returns,
        type_params: meta.type_params.clone(),
        is_async: meta.code.is_coroutine() || meta.code.is_async_generator(),
    })
}

/// Reconstructs the parameter list from the code object's layout:
/// positional (including positional-only), then keyword-only, then
/// `*args`, then `**kwargs` in `co_varnames`.
fn build_arguments(meta: &FnMeta) -> Arguments {
    let code = &meta.code;
    let total_pos = code.arg_count as usize;
    let posonly_n = (code.pos_only_arg_count as usize).min(total_pos);
    let kwonly_n = code.kw_only_arg_count as usize;
    let names = &code.var_names;

    let take = |range: std::ops::Range<usize>| -> Vec<String> {
        range.filter_map(|i| names.get(i).cloned()).collect()
    };

    let posonly = take(0..posonly_n);
    let args = take(posonly_n..total_pos);
    let kwonly = take(total_pos..total_pos + kwonly_n);
    let mut index = total_pos + kwonly_n;
    let vararg = (code.flags & flags::CO_VARARGS != 0).then(|| {
        let name = names.get(index).cloned().unwrap_or_default();
        index += 1;
        name
    });
    let kwarg = (code.flags & flags::CO_VARKEYWORDS != 0).then(|| names.get(index).cloned().unwrap_or_default());

    let kw_defaults = kwonly
        .iter()
        .map(|name| {
            meta.kw_defaults
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        })
        .collect();

    Arguments {
        posonly,
        args,
        vararg,
        kwonly,
        kw_defaults,
        kwarg,
        defaults: meta.defaults.clone(),
        annotations: meta.annotations.clone(),
    }
}

/// Loop context for break/continue resolution.
struct LoopFrame {
    /// Index into `dom.loops`.
    loop_index: usize,
    /// Where `continue` jumps (the header, or the rotated bottom test).
    continue_block: BlockId,
    /// The natural exit; jumps here from inside are loop closure, jumps
    /// elsewhere out of the loop are breaks.
    exit: Option<BlockId>,
    /// Lexically last block of the body; its back jump closes the loop.
    last_body: BlockId,
    /// Break targets observed while walking the body.
    break_targets: Vec<BlockId>,
}

struct Walker<'a> {
    version: PyVersion,
    cfg: &'a Cfg,
    dom: &'a DomInfo,
    detector: PatternDetector<'a>,
    sim: Simulator<'a, Nested>,
    consumed: Vec<bool>,
    frames: Vec<LoopFrame>,
    /// Protected regions currently being decompiled, so the try head does
    /// not re-open its own region when the body walk revisits it.
    active_tries: Vec<(u32, u32, u32)>,
    steps: usize,
    step_limit: usize,
}

impl<'a> Walker<'a> {
    // ------------------------------------------------------------------
    // Traversal core
    // ------------------------------------------------------------------

    /// Walks blocks from `start` until `limit`, an already-consumed
    /// block, or the end of the region `bounds` (an offset half-range).
    fn walk_range(
        &mut self,
        start: Option<BlockId>,
        limit: Option<BlockId>,
        bounds: Option<(u32, u32)>,
    ) -> DecompileResult<Vec<Stmt>> {
        let mut out = Vec::new();
        let mut current = start;
        while let Some(b) = current {
            if Some(b) == limit || self.consumed[b.index()] {
                break;
            }
            if let Some((lo, hi)) = bounds {
                let off = self.cfg.block(b).start_offset;
                if off < lo || off >= hi {
                    break;
                }
            }
            self.steps += 1;
            if self.steps > self.step_limit {
                return Err(DecompileError::MalformedBytecode {
                    offset: self.cfg.block(b).start_offset,
                    reason: "traversal did not make progress".into(),
                });
            }
            let role = if self.frames.iter().any(|f| self.dom.loops[f.loop_index].header == b) {
                Role::InsideOwnLoop
            } else {
                Role::Top
            };
            let kind = self.detector.classify(b, role);
            trace!("block {} at {} -> {:?}", b.index(), self.cfg.block(b).start_offset, kind);
            current = match kind {
                PatternKind::Sequential => self.handle_sequential(b, &mut out)?,
                PatternKind::If => self.handle_if(b, None, &mut out)?,
                PatternKind::Ternary => self.handle_ternary(b)?,
                PatternKind::BoolOp => self.handle_bool_op(b, &mut out)?,
                PatternKind::While => self.handle_while(b, &mut out)?,
                PatternKind::WhileGuard => self.handle_while_guard(b, &mut out)?,
                PatternKind::For => self.handle_for(b, &mut out)?,
                PatternKind::Try => self.handle_try(b, &mut out)?,
                PatternKind::With => self.handle_with(b, &mut out)?,
                PatternKind::Match => self.handle_match(b, &mut out)?,
            };
            out.extend(self.sim.take_stmts());
        }
        Ok(out)
    }

    fn consume(&mut self, b: BlockId) {
        self.consumed[b.index()] = true;
    }

    /// Marks every block whose start offset falls in `[lo, hi)` consumed.
    fn consume_offsets(&mut self, lo: u32, hi: u32) {
        for block in &self.cfg.blocks {
            if block.start_offset >= lo && block.start_offset < hi {
                self.consumed[block.id.index()] = true;
            }
        }
    }

    fn simulate_block(&mut self, b: BlockId) -> DecompileResult<()> {
        let instrs = self.cfg.block(b).instructions.clone();
        self.sim.run(&instrs)
    }

    fn simulate_slice(&mut self, b: BlockId, range: std::ops::Range<usize>) -> DecompileResult<()> {
        let instrs = self.cfg.block(b).instructions[range].to_vec();
        self.sim.run(&instrs)
    }

    fn pop_expr(&mut self, b: BlockId) -> DecompileResult<Expr> {
        let block = self.cfg.block(b);
        let term = *block.terminator();
        match self.sim.stack.pop() {
            Some(value) => value.into_expr(term.opcode, term.offset),
            None => Err(DecompileError::StackUnderflow {
                offset: term.offset,
                opcode: term.opcode,
            }),
        }
    }

    /// Harvests the branch condition a conditional terminator tests,
    /// folding the `IF_NONE` forms into `is not None` comparisons.
    fn condition_from(&mut self, b: BlockId) -> DecompileResult<Expr> {
        let term = self.cfg.block(b).terminator().opcode;
        let raw = self.pop_expr(b)?;
        Ok(match term {
            Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone
            | Opcode::PopJumpBackwardIfNone
            | Opcode::PopJumpBackwardIfNotNone => Expr::Compare {
                left: Box::new(raw),
                ops: vec![CmpOp::IsNot],
                comparators: vec![Expr::none()],
            },
            _ => raw,
        })
    }

    /// A jump to `target` from inside the innermost loop, resolved to
    /// `break`/`continue` when the enclosing-loop map says so.
    fn loop_jump_stmt(&mut self, from: BlockId, target: BlockId) -> Option<Stmt> {
        let frame = self.frames.last_mut()?;
        let l = &self.dom.loops[frame.loop_index];
        if !l.contains(from) {
            return None;
        }
        if target == frame.continue_block {
            if from == frame.last_body {
                return None; // natural loop closure
            }
            return Some(Stmt::Continue);
        }
        if !l.contains(target) {
            if !frame.break_targets.contains(&target) {
                frame.break_targets.push(target);
            }
            return Some(Stmt::Break);
        }
        None
    }

    // ------------------------------------------------------------------
    // Sequential
    // ------------------------------------------------------------------

    fn handle_sequential(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        self.simulate_block(b)?;
        out.extend(self.sim.take_stmts());

        let block = self.cfg.block(b);
        let term = *block.terminator();

        // Await / yield-from send loop: consume the resumption block and
        // continue past END_SEND with the awaitable intact.
        if term.opcode == Opcode::Send {
            if let Some(resume) = block.successor(EdgeKind::Normal) {
                self.consume(resume);
            }
            if let Some(target) = term.jump_target(self.version) {
                return Ok(self.cfg.block_starting_at(target));
            }
        }

        match term.opcode {
            Opcode::BreakLoop => {
                out.push(Stmt::Break);
                return Ok(None);
            }
            Opcode::ContinueLoop => {
                out.push(Stmt::Continue);
                return Ok(None);
            }
            _ => {}
        }

        if term.opcode.is_unconditional_jump() {
            if let Some(target) = term.jump_target(self.version) {
                if let Some(target_block) = self.cfg.block_starting_at(target) {
                    if let Some(stmt) = self.loop_jump_stmt(b, target_block) {
                        out.push(stmt);
                        return Ok(None);
                    }
                    return Ok(Some(target_block));
                }
            }
            return Ok(None);
        }
        if term.opcode.never_falls_through()
            || matches!(term.opcode, Opcode::ReturnValue | Opcode::ReturnConst | Opcode::RaiseVarargs | Opcode::Reraise)
        {
            return Ok(None);
        }
        Ok(block.successor(EdgeKind::Normal))
    }

    // ------------------------------------------------------------------
    // If / ternary / boolop
    // ------------------------------------------------------------------

    fn handle_if(
        &mut self,
        b: BlockId,
        pre_cond: Option<Expr>,
        out: &mut Vec<Stmt>,
    ) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        let cond = match pre_cond {
            Some(cond) => cond,
            None => {
                self.simulate_block(b)?;
                out.extend(self.sim.take_stmts());
                self.condition_from(b)?
            }
        };

        let block = self.cfg.block(b);
        let term_op = block.terminator().opcode;
        let then_b = block.successor(EdgeKind::CondTrue);
        let else_b = block.successor(EdgeKind::CondFalse);
        let merge = self.dom.merge_point(b);

        // Guard tails: `if cond: break` / `if cond: continue`.
        if let Some(t) = then_b {
            if let Some(stmt) = self.loop_jump_stmt(b, t) {
                out.push(Stmt::If {
                    test: cond,
                    body: vec![stmt],
                    orelse: Vec::new(),
                });
                return Ok(else_b);
            }
        }
        if let Some(f) = else_b {
            if let Some(stmt) = self.loop_jump_stmt(b, f) {
                out.push(Stmt::If {
                    test: cond.negated(),
                    body: vec![stmt],
                    orelse: Vec::new(),
                });
                return Ok(then_b);
            }
        }

        let saved = self.sim.stack.clone();

        // A jump-on-true test is a negated guard (`if not cond:` or an
        // assert): the fall-through false edge is the body and the taken
        // edge is the continuation, never an implicit else chain.
        if !term_op.jumps_on_false() {
            let body = self.walk_branch(else_b, merge, &saved)?;
            let orelse = match merge {
                Some(m) if then_b != Some(m) => self.walk_branch(then_b, merge, &saved)?,
                _ => Vec::new(),
            };
            self.sim.stack = saved;
            out.push(Stmt::If {
                test: cond.negated(),
                body: non_empty(body),
                orelse,
            });
            return Ok(merge.or(then_b));
        }

        // Empty then-branch: invert into `if not cond:`.
        if then_b == merge || then_b.is_none() {
            let body = self.walk_branch(else_b, merge, &saved)?;
            out.push(Stmt::If {
                test: cond.negated(),
                body: non_empty(body),
                orelse: Vec::new(),
            });
            self.sim.stack = saved;
            return Ok(merge.or(then_b));
        }

        let body = self.walk_branch(then_b, merge, &saved)?;
        let orelse = if else_b == merge || else_b.is_none() {
            Vec::new()
        } else {
            self.walk_branch(else_b, merge, &saved)?
        };
        self.sim.stack = saved;

        // `if a: if b: X` with no else on either level reads as `a and b`.
        let (test, body) = if orelse.is_empty() {
            match single_if(body) {
                Ok((inner_test, inner_body)) => (
                    bool_join(crate::ast::BoolOpKind::And, vec![cond, inner_test]),
                    inner_body,
                ),
                Err(body) => (cond, body),
            }
        } else {
            (cond, body)
        };

        out.push(Stmt::If {
            test,
            body: non_empty(body),
            orelse,
        });
        Ok(merge.or(else_b))
    }

    fn walk_branch(
        &mut self,
        start: Option<BlockId>,
        limit: Option<BlockId>,
        entry_stack: &StackState,
    ) -> DecompileResult<Vec<Stmt>> {
        self.sim.stack = entry_stack.clone();
        self.walk_range(start, limit, None)
    }

    fn handle_ternary(&mut self, b: BlockId) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        self.simulate_block(b)?;
        let cond = self.condition_from(b)?;

        let block = self.cfg.block(b);
        let then_b = block.successor(EdgeKind::CondTrue);
        let else_b = block.successor(EdgeKind::CondFalse);
        let merge = self.dom.merge_point(b).ok_or(DecompileError::MalformedBytecode {
            offset: block.start_offset,
            reason: "ternary without merge".into(),
        })?;

        let saved = self.sim.stack.clone();
        let body = self.eval_expr_region(then_b, merge, false)?;
        self.sim.stack = saved.clone();
        let orelse = self.eval_expr_region(else_b, merge, false)?;
        self.sim.stack = saved;
        self.sim.stack.push(StackValue::Expr(Expr::IfExp {
            test: Box::new(cond),
            body: Box::new(body),
            orelse: Box::new(orelse),
        }));
        Ok(Some(merge))
    }

    /// Evaluates a pure expression region `[start, merge)` on the running
    /// stack and returns the single value it produces.
    fn eval_expr_region(
        &mut self,
        start: Option<BlockId>,
        merge: BlockId,
        skip_leading_pop: bool,
    ) -> DecompileResult<Expr> {
        let mut current = start;
        let mut skip = skip_leading_pop;
        while let Some(b) = current {
            if b == merge {
                break;
            }
            self.consume(b);
            let role = Role::Top;
            let kind = self.detector.classify(b, role);
            current = match kind {
                PatternKind::BoolOp => {
                    let mut scratch = Vec::new();
                    let next = self.handle_bool_op_inner(b, skip, &mut scratch)?;
                    skip = false;
                    next
                }
                PatternKind::Ternary => {
                    if skip {
                        self.simulate_first_skipping_pop(b)?;
                        skip = false;
                        // Re-harvest as a plain ternary over the rest.
                        let cond = self.condition_from(b)?;
                        return self.finish_ternary_region(b, cond, merge);
                    }
                    self.handle_ternary(b)?
                }
                _ => {
                    if skip {
                        self.simulate_first_skipping_pop(b)?;
                        skip = false;
                    } else {
                        self.simulate_block(b)?;
                    }
                    let block = self.cfg.block(b);
                    let term = block.terminator();
                    if term.opcode.is_unconditional_jump() {
                        term.jump_target(self.version)
                            .and_then(|t| self.cfg.block_starting_at(t))
                    } else {
                        block.successor(EdgeKind::Normal)
                    }
                }
            };
        }
        let exprs_block = start.unwrap_or(merge);
        self.pop_expr(exprs_block)
    }

    fn finish_ternary_region(&mut self, b: BlockId, cond: Expr, merge: BlockId) -> DecompileResult<Expr> {
        let block = self.cfg.block(b);
        let then_b = block.successor(EdgeKind::CondTrue);
        let else_b = block.successor(EdgeKind::CondFalse);
        let saved = self.sim.stack.clone();
        let body = self.eval_expr_region(then_b, merge, false)?;
        self.sim.stack = saved.clone();
        let orelse = self.eval_expr_region(else_b, merge, false)?;
        self.sim.stack = saved;
        Ok(Expr::IfExp {
            test: Box::new(cond),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn simulate_first_skipping_pop(&mut self, b: BlockId) -> DecompileResult<()> {
        let block = self.cfg.block(b);
        let skip = usize::from(block.instructions.first().map(|i| i.opcode) == Some(Opcode::PopTop));
        self.simulate_slice(b, skip..block.instructions.len())
    }

    fn handle_bool_op(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.handle_bool_op_inner(b, false, out)
    }

    /// Short-circuit chain starting at `b`. Pushes the folded expression
    /// and returns the merge block, or delegates to the if-handler when
    /// the chain turns out to be a chained-comparison condition.
    fn handle_bool_op_inner(
        &mut self,
        b: BlockId,
        skip_leading_pop: bool,
        out: &mut Vec<Stmt>,
    ) -> DecompileResult<Option<BlockId>> {
        use crate::ast::BoolOpKind;
        self.consume(b);
        if skip_leading_pop {
            self.simulate_first_skipping_pop(b)?;
        } else {
            self.simulate_block(b)?;
        }
        out.extend(self.sim.take_stmts());

        let block = self.cfg.block(b);
        let term = *block.terminator();
        let (op, merge_edge, fall_edge, modern) = match term.opcode {
            Opcode::JumpIfFalseOrPop => (BoolOpKind::And, EdgeKind::CondFalse, EdgeKind::CondTrue, false),
            Opcode::JumpIfTrueOrPop => (BoolOpKind::Or, EdgeKind::CondTrue, EdgeKind::CondFalse, false),
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfNone => {
                (BoolOpKind::And, EdgeKind::CondFalse, EdgeKind::CondTrue, true)
            }
            _ => (BoolOpKind::Or, EdgeKind::CondTrue, EdgeKind::CondFalse, true),
        };
        let merge = block.successor(merge_edge);
        let fall = block.successor(fall_edge);

        if modern {
            // COPY 1 left a twin; drop it, the value merge is virtual.
            let _ = self.sim.stack.pop();
        }
        let lhs = self.pop_expr(b)?;

        // Chained-comparison cleanup block at the merge means this chain
        // is really `a < b < c`: the duplicated middle operand feeds the
        // fall-through compare directly.
        if let Some(m) = merge {
            if self.is_compare_cleanup(m) {
                return self.finish_chained_compare(lhs, fall, m, out);
            }
        }

        let rhs_start = fall;
        let merge = merge.ok_or(DecompileError::MalformedBytecode {
            offset: block.start_offset,
            reason: "short-circuit chain without merge".into(),
        })?;

        let saved_depth = self.sim.stack.depth();
        let rhs = self.eval_expr_region(rhs_start, merge, modern)?;
        debug_assert_eq!(self.sim.stack.depth(), saved_depth);

        let folded = self.fold_compare_chain(op, lhs, rhs);
        self.sim.stack.push(StackValue::Expr(folded));
        Ok(Some(merge))
    }

    /// `[ROT_TWO|SWAP, POP_TOP, ...]` block that discards the duplicated
    /// middle operand of a chained comparison on the short-circuit path.
    fn is_compare_cleanup(&self, b: BlockId) -> bool {
        let instrs = &self.cfg.block(b).instructions;
        instrs.len() <= 3
            && matches!(instrs.first().map(|i| i.opcode), Some(Opcode::RotTwo | Opcode::Swap))
            && instrs.get(1).map(|i| i.opcode) == Some(Opcode::PopTop)
    }

    fn finish_chained_compare(
        &mut self,
        lhs: Expr,
        fall: Option<BlockId>,
        cleanup: BlockId,
        out: &mut Vec<Stmt>,
    ) -> DecompileResult<Option<BlockId>> {
        use crate::ast::BoolOpKind;
        let Some(rhs_block) = fall else {
            return Err(DecompileError::MalformedBytecode {
                offset: self.cfg.block(cleanup).start_offset,
                reason: "chained comparison without continuation".into(),
            });
        };
        self.consume(rhs_block);
        self.consume(cleanup);
        self.simulate_block(rhs_block)?;
        let rhs = self.pop_expr(rhs_block)?;
        let folded = self.fold_compare_chain(BoolOpKind::And, lhs, rhs);

        let term = *self.cfg.block(rhs_block).terminator();
        if term.opcode.is_conditional_jump() {
            // Condition context: the chain feeds a branch.
            return self.handle_if(rhs_block, Some(folded), out);
        }
        self.sim.stack.push(StackValue::Expr(folded));
        if term.opcode.is_unconditional_jump() {
            return Ok(term
                .jump_target(self.version)
                .and_then(|t| self.cfg.block_starting_at(t)));
        }
        Ok(self.cfg.block(rhs_block).successor(EdgeKind::Normal))
    }

    /// Folds `a < b and b < c` into `a < b < c` when the shared middle
    /// operand is pure; otherwise joins with the boolean operator.
    fn fold_compare_chain(&self, op: crate::ast::BoolOpKind, lhs: Expr, rhs: Expr) -> Expr {
        use crate::ast::BoolOpKind;
        if op == BoolOpKind::And {
            if let (
                Expr::Compare {
                    left,
                    ops,
                    comparators,
                },
                Expr::Compare {
                    left: right_left,
                    ops: right_ops,
                    comparators: right_comparators,
                },
            ) = (&lhs, &rhs)
            {
                let shared = comparators.last();
                if shared == Some(right_left) && shared.is_some_and(Expr::is_pure) {
                    let mut ops = ops.clone();
                    let mut comparators = comparators.clone();
                    ops.extend(right_ops.iter().copied());
                    comparators.extend(right_comparators.iter().cloned());
                    return Expr::Compare {
                        left: left.clone(),
                        ops,
                        comparators,
                    };
                }
            }
        }
        bool_join(op, vec![lhs, rhs])
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn loop_geometry(&self, loop_index: usize) -> (BlockId, BlockId) {
        let l = &self.dom.loops[loop_index];
        let mut last = l.header;
        let mut max_off = 0;
        for (i, member) in l.body.iter().enumerate() {
            if *member {
                let off = self.cfg.blocks[i].start_offset;
                if off >= max_off {
                    max_off = off;
                    last = BlockId::new(i);
                }
            }
        }
        (l.header, last)
    }

    fn handle_while(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        let loop_index = self
            .dom
            .loops
            .iter()
            .position(|l| l.header == b)
            .ok_or(DecompileError::MalformedBytecode {
                offset: self.cfg.block(b).start_offset,
                reason: "while header without loop".into(),
            })?;
        let (_, last_body) = self.loop_geometry(loop_index);
        let block = self.cfg.block(b);
        let term = *block.terminator();

        // Header with a conditional exit: classic top-tested while.
        let cond_exit = term.opcode.is_conditional_jump().then(|| {
            let t = block.successor(EdgeKind::CondTrue);
            let f = block.successor(EdgeKind::CondFalse);
            (t, f)
        });

        if let Some((t, f)) = cond_exit {
            let in_loop = |id: Option<BlockId>| id.is_some_and(|id| self.dom.loops[loop_index].contains(id));
            let trampoline = |id: Option<BlockId>| {
                id.is_some_and(|id| {
                    let blk = self.cfg.block(id);
                    blk.instructions.len() == 1 && blk.terminator().opcode.is_unconditional_jump()
                })
            };
            let (body_start, exit, negate) = if in_loop(t) && !in_loop(f) {
                (t, f, false)
            } else if in_loop(f) && !in_loop(t) && !trampoline(t) {
                (f, t, true)
            } else if in_loop(f) && !in_loop(t) {
                // The taken edge is a bare break trampoline: this header
                // is really `if cond: break` inside `while True:`.
                return self.handle_while_true(b, loop_index, last_body, out);
            } else {
                // Both edges stay inside: the header is the body's first
                // test, so this is `while True:` with an inner if.
                return self.handle_while_true(b, loop_index, last_body, out);
            };
            self.consume(b);
            self.simulate_block(b)?;
            out.extend(self.sim.take_stmts());
            let mut test = self.condition_from(b)?;
            if negate {
                test = test.negated();
            }

            self.frames.push(LoopFrame {
                loop_index,
                continue_block: b,
                exit,
                last_body: last_body.max(b),
                break_targets: Vec::new(),
            });
            let saved = self.sim.stack.clone();
            let body = self.walk_range(body_start, Some(b), None)?;
            self.sim.stack = saved;
            let frame = self.frames.pop().expect("pushed above");

            let (orelse, next) = self.loop_else(exit, &frame)?;
            out.push(Stmt::While {
                test,
                body: non_empty(body),
                orelse,
            });
            return Ok(next);
        }

        self.handle_while_true(b, loop_index, last_body, out)
    }

    /// `while True:` (no conditional exit in the header).
    fn handle_while_true(
        &mut self,
        b: BlockId,
        loop_index: usize,
        last_body: BlockId,
        out: &mut Vec<Stmt>,
    ) -> DecompileResult<Option<BlockId>> {
        self.frames.push(LoopFrame {
            loop_index,
            continue_block: b,
            exit: None,
            last_body,
            break_targets: Vec::new(),
        });
        let saved = self.sim.stack.clone();
        let body = self.walk_loop_body(b)?;
        self.sim.stack = saved;
        let frame = self.frames.pop().expect("pushed above");

        let next = frame.break_targets.first().copied();
        out.push(Stmt::While {
            test: Expr::Const(Obj::Bool(true)),
            body: non_empty(body),
            orelse: Vec::new(),
        });
        Ok(next)
    }

    /// Walks a loop body that starts at the header itself (the limit
    /// check is skipped for the first block).
    fn walk_loop_body(&mut self, header: BlockId) -> DecompileResult<Vec<Stmt>> {
        let mut out = Vec::new();
        let role = Role::InsideOwnLoop;
        let kind = self.detector.classify(header, role);
        let mut current = match kind {
            PatternKind::If => self.handle_if(header, None, &mut out)?,
            PatternKind::BoolOp => self.handle_bool_op(header, &mut out)?,
            PatternKind::Ternary => self.handle_ternary(header)?,
            PatternKind::Try => self.handle_try(header, &mut out)?,
            PatternKind::With => self.handle_with(header, &mut out)?,
            PatternKind::Match => self.handle_match(header, &mut out)?,
            _ => self.handle_sequential(header, &mut out)?,
        };
        out.extend(self.sim.take_stmts());
        if current != Some(header) {
            let rest = self.walk_range(current, Some(header), None)?;
            out.extend(rest);
            current = None;
        }
        let _ = current;
        Ok(out)
    }

    /// 3.10+ rotated while: pre-test guard, body, conditional back edge.
    fn handle_while_guard(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        self.simulate_block(b)?;
        out.extend(self.sim.take_stmts());

        let block = self.cfg.block(b);
        let t = block.successor(EdgeKind::CondTrue);
        let f = block.successor(EdgeKind::CondFalse);
        let (header, exit, negate) = match (t, f) {
            (Some(t), f) if self.dom.loop_headed_by(t).is_some() => (t, f, false),
            (t, Some(f)) if self.dom.loop_headed_by(f).is_some() => (f, t, true),
            _ => {
                return Err(DecompileError::MalformedBytecode {
                    offset: block.start_offset,
                    reason: "rotated while guard without loop".into(),
                });
            }
        };
        let mut test = self.condition_from(b)?;
        if negate {
            test = test.negated();
        }

        let loop_index = self
            .dom
            .loops
            .iter()
            .position(|l| l.header == header)
            .expect("guard checked loop exists");
        let bottom = self.dom.loops[loop_index]
            .back_edges
            .first()
            .copied()
            .unwrap_or(header);

        self.frames.push(LoopFrame {
            loop_index,
            continue_block: bottom,
            exit,
            last_body: bottom,
            break_targets: Vec::new(),
        });
        let saved = self.sim.stack.clone();
        let body = if bottom == header {
            Vec::new()
        } else {
            self.walk_range(Some(header), Some(bottom), None)?
        };
        // The bottom block re-evaluates the condition; discard its copy.
        self.consume(bottom);
        self.sim.stack = saved.clone();
        self.simulate_block(bottom)?;
        let _bottom_cond = self.sim.stack.pop();
        self.sim.stack = saved;
        let frame = self.frames.pop().expect("pushed above");

        let (orelse, next) = self.loop_else(exit, &frame)?;
        out.push(Stmt::While {
            test,
            body: non_empty(body),
            orelse,
        });
        Ok(next)
    }

    /// Loop else-clause detection: breaks that bypass the natural exit
    /// mean the statements between the exit and the break target are the
    /// `else` suite.
    fn loop_else(
        &mut self,
        exit: Option<BlockId>,
        frame: &LoopFrame,
    ) -> DecompileResult<(Vec<Stmt>, Option<BlockId>)> {
        let Some(exit) = exit else {
            return Ok((Vec::new(), frame.break_targets.first().copied()));
        };
        match frame.break_targets.first().copied() {
            Some(break_target) if break_target != exit => {
                let orelse = self.walk_range(Some(exit), Some(break_target), None)?;
                Ok((orelse, Some(break_target)))
            }
            _ => Ok((Vec::new(), Some(exit))),
        }
    }

    // ------------------------------------------------------------------
    // For loops and comprehensions
    // ------------------------------------------------------------------

    fn handle_for(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        let block = self.cfg.block(b);
        let n = block.instructions.len();
        // Everything before FOR_ITER computes the iterable.
        self.simulate_slice(b, 0..n - 1)?;
        out.extend(self.sim.take_stmts());
        let iterable = self.pop_expr(b)?;

        let body_start = self.cfg.block(b).successor(EdgeKind::CondTrue);
        let exit = self.cfg.block(b).successor(EdgeKind::CondFalse);

        // Comprehension accumulator below the iterator: inline (PEP 709)
        // or a comprehension code object's own loop.
        if matches!(
            self.sim.stack.peek(0),
            Some(StackValue::Expr(Expr::List(_) | Expr::Set(_) | Expr::Dict(_))) | Some(StackValue::CompBuilder(_))
        ) {
            return self.handle_comp_loop(b, iterable, exit, out);
        }

        let loop_index = self.dom.loops.iter().position(|l| l.header == b);
        let last_body = loop_index.map_or(b, |i| self.loop_geometry(i).1);

        // During the body the runtime stack holds the iterator with the
        // pushed element above it; mirror that so depth-indexed opcodes
        // (LIST_APPEND and friends) land where they expect. The body's
        // first stores bind the iteration target; seed a sentinel so they
        // surface as one assignment to harvest.
        self.sim.stack.push(StackValue::Unknown);
        self.sim.stack.push(StackValue::Expr(Expr::Name(ITEM_SENTINEL.into())));

        if let Some(loop_index) = loop_index {
            self.frames.push(LoopFrame {
                loop_index,
                continue_block: b,
                exit,
                last_body,
                break_targets: Vec::new(),
            });
        }
        let saved = self.sim.stack.clone();
        let mut body = self.walk_range(body_start, Some(b), None)?;
        self.sim.stack = saved;
        let _ = self.sim.stack.pop(); // drop the sentinel
        let frame = loop_index.map(|_| self.frames.pop().expect("pushed above"));

        let target = extract_for_target(&mut body).ok_or(DecompileError::MalformedBytecode {
            offset: self.cfg.block(b).start_offset,
            reason: "for loop without iteration target".into(),
        })?;

        let (orelse, next) = match frame {
            Some(frame) => self.loop_else(exit, &frame)?,
            None => (Vec::new(), exit),
        };

        // Pre-3.12 exhaustion pops the iterator; 3.12+ leaves it (plus a
        // sentinel) for END_FOR in the exit block.
        if self.version.at_least(3, 12) {
            self.sim.stack.push(StackValue::Unknown);
        } else {
            let _ = self.sim.stack.pop();
        }

        out.push(Stmt::For {
            target,
            iter: iterable,
            body: non_empty(body),
            orelse,
            is_async: false,
        });
        Ok(next)
    }

    /// A `FOR_ITER` loop appending into an accumulator: rebuild the
    /// comprehension expression instead of a `for` statement.
    fn handle_comp_loop(
        &mut self,
        header: BlockId,
        iterable: Expr,
        exit: Option<BlockId>,
        _out: &mut Vec<Stmt>,
    ) -> DecompileResult<Option<BlockId>> {
        // Swap the display for a builder.
        let kind = match self.sim.stack.peek(0) {
            Some(StackValue::Expr(Expr::List(_))) => CompKind::List,
            Some(StackValue::Expr(Expr::Set(_))) => CompKind::Set,
            Some(StackValue::Expr(Expr::Dict(_))) => CompKind::Dict,
            Some(StackValue::CompBuilder(state)) => state.kind,
            _ => CompKind::List,
        };
        let _ = self.sim.stack.pop();
        self.sim.stack.push(StackValue::CompBuilder(CompState::new(kind)));

        let comp = self.comp_from_loop(header, iterable, kind)?;

        // Replace the builder (dropping any leftover iterator slots
        // above it) with the finished expression.
        while !matches!(self.sim.stack.peek(0), Some(StackValue::CompBuilder(_)) | None) {
            let _ = self.sim.stack.pop();
        }
        let _ = self.sim.stack.pop();
        self.sim.stack.push(StackValue::Expr(comp));

        // Balance the exit block's END_FOR / restore epilogue: iterator
        // plus sentinel on 3.12+.
        if self.version.at_least(3, 12) {
            self.sim.stack.push(StackValue::Unknown);
            self.sim.stack.push(StackValue::Unknown);
        }
        Ok(exit)
    }

    /// Structural reconstruction of one comprehension: generators from
    /// nested `FOR_ITER` headers, `if` guards, and the terminal append.
    fn comp_from_loop(&mut self, header: BlockId, iterable: Expr, kind: CompKind) -> DecompileResult<Expr> {
        let mut generators: Vec<Comprehension> = Vec::new();
        let mut pending_iter = iterable;
        let mut pending_ifs: Vec<Expr> = Vec::new();
        let mut pending_target: Option<Expr> = None;
        let mut current_header = header;

        // The iterator occupies a stack slot for the whole loop.
        self.sim.stack.push(StackValue::Unknown);

        'outer: loop {
            self.consume(current_header);
            // Harvest the target from the body prelude.
            let body_start = self.cfg.block(current_header).successor(EdgeKind::CondTrue);
            self.sim.stack.push(StackValue::Expr(Expr::Name(ITEM_SENTINEL.into())));
            let mut current = body_start;

            // First: the target-binding stores at the top of the body.
            if let Some(bstart) = current {
                let instrs = self.cfg.block(bstart).instructions.clone();
                let split = prelude_split(&instrs);
                self.sim.run(&instrs[..split])?;
                let mut prelude = self.sim.take_stmts();
                pending_target = extract_for_target(&mut prelude);
                // Remaining instructions of this block continue below.
                let rest = instrs[split..].to_vec();
                if rest.is_empty() {
                    self.consume(bstart);
                    current = self.cfg.block(bstart).successor(EdgeKind::Normal);
                } else {
                    // Process the rest of the first block as the start of
                    // the guard/element region.
                    let next = self.comp_step(bstart, &rest, &mut generators, &mut pending_iter, &mut pending_ifs, &mut pending_target, kind)?;
                    match next {
                        CompStep::Continue(next) => current = next,
                        CompStep::Done => break 'outer,
                        CompStep::NewLoop(h) => {
                            current_header = h;
                            continue 'outer;
                        }
                    }
                }
            }

            // Then: whole blocks until the element is recorded.
            while let Some(b) = current {
                if b == current_header {
                    break;
                }
                let instrs = self.cfg.block(b).instructions.clone();
                let next = self.comp_step(b, &instrs, &mut generators, &mut pending_iter, &mut pending_ifs, &mut pending_target, kind)?;
                match next {
                    CompStep::Continue(next) => current = next,
                    CompStep::Done => break 'outer,
                    CompStep::NewLoop(h) => {
                        current_header = h;
                        continue 'outer;
                    }
                }
            }
            break;
        }

        generators.push(Comprehension {
            target: pending_target.unwrap_or(Expr::Name("_".into())),
            iter: pending_iter,
            ifs: pending_ifs,
            is_async: false,
        });

        // Read the element back out of the builder (it sits below the
        // iterator slots), or a yielded value for generator expressions.
        let mut found = (None, None);
        for depth in 0..self.sim.stack.depth() {
            if let Some(StackValue::CompBuilder(state)) = self.sim.stack.peek(depth) {
                found = (state.element.clone(), state.value.clone());
                break;
            }
        }
        let (element, value) = found;
        let element = element.ok_or(DecompileError::MalformedBytecode {
            offset: self.cfg.block(header).start_offset,
            reason: "comprehension without element".into(),
        })?;

        Ok(Expr::Comp {
            kind,
            element,
            value,
            generators,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn comp_step(
        &mut self,
        b: BlockId,
        instrs: &[Instruction],
        generators: &mut Vec<Comprehension>,
        pending_iter: &mut Expr,
        pending_ifs: &mut Vec<Expr>,
        pending_target: &mut Option<Expr>,
        _kind: CompKind,
    ) -> DecompileResult<CompStep> {
        self.consume(b);
        let term = instrs.last().copied();

        // Terminal block: contains the append / add / yield.
        let is_terminal = instrs.iter().any(|i| {
            matches!(
                i.opcode,
                Opcode::ListAppend | Opcode::SetAdd | Opcode::MapAdd | Opcode::YieldValue
            )
        });
        if is_terminal {
            self.sim.run(instrs)?;
            // A generator expression records its element as a yielded
            // statement rather than through the builder.
            for stmt in self.sim.take_stmts() {
                if let Stmt::Expr(Expr::Yield(Some(value))) = stmt {
                    if let Some(StackValue::CompBuilder(state)) = self.sim.stack.peek_mut(0) {
                        state.element = Some(value);
                    }
                }
            }
            return Ok(CompStep::Done);
        }

        // Nested FOR_ITER: previous clause is finished, a new one starts.
        if term.map(|i| i.opcode) == Some(Opcode::ForIter) {
            self.sim.run(&instrs[..instrs.len() - 1])?;
            let iter = self.pop_expr(b)?;
            generators.push(Comprehension {
                target: pending_target.take().unwrap_or(Expr::Name("_".into())),
                iter: std::mem::replace(pending_iter, iter),
                ifs: std::mem::take(pending_ifs),
                is_async: false,
            });
            // The nested loop's iterator takes its own stack slot.
            self.sim.stack.push(StackValue::Unknown);
            return Ok(CompStep::NewLoop(b));
        }

        // Guard condition.
        if term.is_some_and(|i| i.opcode.is_conditional_jump()) {
            self.sim.run(instrs)?;
            let _ = self.sim.take_stmts();
            let mut cond = self.condition_from(b)?;
            let t = self.cfg.block(b).successor(EdgeKind::CondTrue);
            let f = self.cfg.block(b).successor(EdgeKind::CondFalse);
            // The guard falls into the element on success; if the true
            // edge jumps back to the loop header instead, invert.
            let next = match (t, f) {
                (Some(t), _) if !self.is_loop_backjump(t) => t,
                (_, Some(f)) => {
                    cond = cond.negated();
                    f
                }
                _ => {
                    return Err(DecompileError::MalformedBytecode {
                        offset: self.cfg.block(b).start_offset,
                        reason: "comprehension guard without continuation".into(),
                    });
                }
            };
            pending_ifs.push(cond);
            return Ok(CompStep::Continue(Some(next)));
        }

        // Plain setup block (iterable of a nested clause, GET_ITER...).
        self.sim.run(instrs)?;
        let _ = self.sim.take_stmts();
        let next = self.cfg.block(b).successor(EdgeKind::Normal).or_else(|| {
            term.and_then(|i| i.jump_target(self.version))
                .and_then(|t| self.cfg.block_starting_at(t))
        });
        Ok(CompStep::Continue(next))
    }

    fn is_loop_backjump(&self, b: BlockId) -> bool {
        let block = self.cfg.block(b);
        block.instructions.len() == 1 && block.terminator().opcode.is_unconditional_jump() && block
            .successors
            .iter()
            .any(|(_, k)| *k == EdgeKind::LoopBack)
    }

    // ------------------------------------------------------------------
    // Try / except / finally
    // ------------------------------------------------------------------

    fn handle_try(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        let block = self.cfg.block(b);
        // Outermost unopened region starting in this block; the body walk
        // revisits this block for any nested region.
        let region = self
            .cfg
            .regions
            .iter()
            .filter(|r| {
                r.start >= block.start_offset
                    && r.start < block.end_offset
                    && !self.active_tries.contains(&(r.start, r.end, r.target))
            })
            .max_by_key(|r| r.end - r.start)
            .copied();
        let Some(region) = region else {
            // Every region here is already open: plain statements.
            return self.handle_sequential(b, out);
        };
        let handler_block = self
            .cfg
            .block_starting_at(region.target)
            .ok_or(DecompileError::MalformedBytecode {
                offset: region.target,
                reason: "exception handler is not a block boundary".into(),
            })?;
        self.active_tries.push((region.start, region.end, region.target));

        // Body.
        let saved = self.sim.stack.clone();
        let body_start = self.cfg.block_containing(region.start);
        let body = self.walk_range(body_start, Some(handler_block), Some((block.start_offset, region.end)))?;
        self.sim.stack = saved.clone();

        // Where the normal path lands after the body (through any bare
        // trampoline jump).
        let body_exit = self.region_exit_target(&region);
        let after_body = self.resolve_jump_only(body_exit);
        let handler_off = self.cfg.block(handler_block).start_offset;

        let is_finally = !self.handler_chain_has_except(handler_block);
        if is_finally {
            let (finalbody, next) = self.finally_body(&region, handler_block, body_exit)?;
            self.sim.stack = saved;
            self.active_tries.pop();
            out.push(Stmt::Try {
                body: non_empty(body),
                handlers: Vec::new(),
                orelse: Vec::new(),
                finalbody,
                is_star: false,
            });
            return Ok(next);
        }

        // An else suite placed before the handlers (3.11 layout) is
        // detectable now; the 3.9 layout (else after the handlers) shows
        // up as a body exit that differs from the handlers' rejoin.
        let (mut else_start, mut merge) = match after_body {
            Some(ab) if self.cfg.block(ab).start_offset < handler_off => {
                let ab_off = self.cfg.block(ab).start_offset;
                (Some(ab), self.range_exit_jump(ab_off, handler_off))
            }
            other => (None, other),
        };
        let bound_hi = match (else_start, merge) {
            (None, Some(m)) if self.cfg.block(m).start_offset > handler_off => self.cfg.block(m).start_offset,
            _ => u32::MAX,
        };

        let is_star = self.chain_blocks(handler_block).iter().any(|&hb| {
            self.cfg
                .block(hb)
                .instructions
                .iter()
                .any(|i| i.opcode == Opcode::CheckEgMatch)
        });

        let (handlers, rejoin) = self.parse_handler_chain(handler_block, region.lasti, merge, bound_hi)?;
        self.sim.stack = saved.clone();

        if else_start.is_none() {
            if let (Some(ab), Some(r)) = (after_body, rejoin) {
                if ab != r {
                    // 3.9-style else: body exits into it, handlers skip it.
                    else_start = Some(ab);
                    merge = Some(r);
                }
            }
        }
        let merge = merge.or(rejoin).or(after_body);

        let orelse = match else_start {
            Some(e) => {
                self.sim.stack = saved.clone();
                let hi = merge.map_or(u32::MAX, |m| self.cfg.block(m).start_offset);
                let suite = self.walk_range(Some(e), merge, Some((self.cfg.block(e).start_offset, hi)))?;
                self.sim.stack = saved;
                suite
            }
            None => Vec::new(),
        };

        self.active_tries.pop();
        out.push(Stmt::Try {
            body: non_empty(body),
            handlers,
            orelse,
            finalbody: Vec::new(),
            is_star,
        });
        Ok(merge)
    }

    /// Follows a block that consists solely of an unconditional jump.
    fn resolve_jump_only(&self, block: Option<BlockId>) -> Option<BlockId> {
        let mut current = block?;
        for _ in 0..self.cfg.len() {
            let b = self.cfg.block(current);
            if b.instructions.len() == 1 && b.terminator().opcode.is_unconditional_jump() {
                match b
                    .terminator()
                    .jump_target(self.version)
                    .and_then(|t| self.cfg.block_starting_at(t))
                {
                    Some(next) if next != current => current = next,
                    _ => break,
                }
            } else {
                break;
            }
        }
        Some(current)
    }

    /// The jump target that leaves the offset range `[lo, hi)` from its
    /// last jumping block.
    fn range_exit_jump(&self, lo: u32, hi: u32) -> Option<BlockId> {
        let mut best = None;
        for block in &self.cfg.blocks {
            if block.start_offset < lo || block.start_offset >= hi {
                continue;
            }
            let term = block.terminator();
            if term.opcode.is_unconditional_jump() {
                if let Some(target) = term.jump_target(self.version) {
                    if (target < lo || target >= hi) && target != lo {
                        best = self.cfg.block_starting_at(target).or(best);
                    }
                }
            }
        }
        best
    }

    /// The rejoin target jumped to from consumed blocks in `[lo, hi)`.
    fn rejoin_of(&self, lo: u32, hi: u32) -> Option<BlockId> {
        let mut best = None;
        for block in &self.cfg.blocks {
            if block.start_offset < lo || block.start_offset >= hi || !self.consumed[block.id.index()] {
                continue;
            }
            let term = block.terminator();
            if term.opcode.is_unconditional_jump() {
                if let Some(target) = term.jump_target(self.version) {
                    if target < lo || target >= hi {
                        best = self.cfg.block_starting_at(target).or(best);
                    }
                }
            }
        }
        best
    }

    /// The jump target of the last block inside a protected range.
    fn region_exit_target(&self, region: &ExceptionEntry) -> Option<BlockId> {
        let last = self
            .cfg
            .blocks
            .iter()
            .filter(|blk| blk.start_offset >= region.start && blk.start_offset < region.end)
            .last()?;
        let term = last.terminator();
        if term.opcode.is_unconditional_jump() {
            return term
                .jump_target(self.version)
                .and_then(|t| self.cfg.block_starting_at(t));
        }
        if term.opcode.never_falls_through() {
            return None;
        }
        self.cfg.block_starting_at(last.end_offset)
    }

    /// Blocks of a handler dispatch chain, following no-match edges.
    fn chain_blocks(&self, handler: BlockId) -> Vec<BlockId> {
        let mut blocks = vec![handler];
        let mut current = handler;
        for _ in 0..self.cfg.len() {
            let block = self.cfg.block(current);
            let term = block.terminator();
            if !term.opcode.is_conditional_jump() {
                break;
            }
            let Some(next) = block.successor(if term.opcode.jumps_on_false() {
                EdgeKind::CondFalse
            } else {
                EdgeKind::CondTrue
            }) else {
                break;
            };
            if blocks.contains(&next) {
                break;
            }
            blocks.push(next);
            current = next;
        }
        blocks
    }

    fn handler_chain_has_except(&self, handler: BlockId) -> bool {
        // Exception matching, a name/value discard, or POP_EXCEPT all
        // mark an except handler; a finally handler re-raises wholesale.
        let probe = |id: BlockId| {
            self.cfg.block(id).instructions.iter().any(|i| {
                matches!(i.opcode, Opcode::CheckExcMatch | Opcode::CheckEgMatch | Opcode::PopExcept)
                    || (i.opcode == Opcode::CompareOp && i.arg & 0x0F == 10 && self.version.before(3, 9))
                    || i.opcode == Opcode::JumpIfNotExcMatch
            })
        };
        let mut seen = vec![handler];
        let mut queue = vec![handler];
        while let Some(id) = queue.pop() {
            if probe(id) {
                return true;
            }
            for (succ, kind) in self.cfg.block(id).flow_successors() {
                let _ = kind;
                if !seen.contains(&succ) && self.cfg.block(succ).start_offset >= self.cfg.block(handler).start_offset {
                    seen.push(succ);
                    queue.push(succ);
                }
            }
        }
        false
    }

    /// The finally suite: the handler's own copy before 3.9 (shared
    /// code), the normal-path duplicate from 3.9 on.
    fn finally_body(
        &mut self,
        region: &ExceptionEntry,
        handler: BlockId,
        body_exit: Option<BlockId>,
    ) -> DecompileResult<(Vec<Stmt>, Option<BlockId>)> {
        let handler_off = self.cfg.block(handler).start_offset;
        if self.version.at_least(3, 9) {
            // Normal copy spans [region.end, handler); the exception copy
            // is consumed silently.
            let start = self.cfg.block_starting_at(region.end).or(body_exit);
            let seed = self.sim.stack.clone();
            let finalbody = self.walk_range(start, Some(handler), Some((region.end, handler_off)))?;
            self.sim.stack = seed;
            // The continuation is wherever the last normal-copy block
            // jumps.
            let next = self
                .cfg
                .blocks
                .iter()
                .filter(|blk| blk.start_offset >= region.end && blk.start_offset < handler_off)
                .last()
                .and_then(|blk| {
                    let term = blk.terminator();
                    if term.opcode.is_unconditional_jump() {
                        term.jump_target(self.version).and_then(|t| self.cfg.block_starting_at(t))
                    } else {
                        self.cfg.block_starting_at(blk.end_offset)
                    }
                });
            let end = self.handler_extent(handler);
            self.consume_offsets(handler_off, end);
            Ok((finalbody, next))
        } else {
            // Shared suite at the handler; the walk stops at END_FINALLY.
            self.sim.stack = StackState::unknowns(3);
            let finalbody = self.walk_range(Some(handler), None, Some((handler_off, u32::MAX)))?;
            let end = self.handler_extent(handler);
            self.consume_offsets(handler_off, end);
            let next = self.cfg.block_starting_at(end);
            Ok((finalbody, next))
        }
    }

    /// Last offset (exclusive) of the blocks reachable inside a handler.
    fn handler_extent(&self, handler: BlockId) -> u32 {
        let mut end = self.cfg.block(handler).end_offset;
        let mut seen = vec![handler];
        let mut queue = vec![handler];
        while let Some(id) = queue.pop() {
            let block = self.cfg.block(id);
            end = end.max(block.end_offset);
            for (succ, kind) in block.successors.iter() {
                if *kind == EdgeKind::Exception {
                    continue;
                }
                let sb = self.cfg.block(*succ);
                // Stay within the handler's tail: only forward, and only
                // until something that has normal-path predecessors too.
                if sb.start_offset > block.start_offset
                    && sb.is_handler
                    && !seen.contains(succ)
                {
                    seen.push(*succ);
                    queue.push(*succ);
                }
            }
        }
        end
    }

    /// Parses an except-handler chain into `ExceptHandler`s and the merge
    /// block the handler bodies rejoin. Body walks are bounded to
    /// `[handler, bound_hi)` (and stopped at `limit` when known) so they
    /// never run past the statement's merge point.
    fn parse_handler_chain(
        &mut self,
        handler: BlockId,
        lasti: bool,
        limit: Option<BlockId>,
        bound_hi: u32,
    ) -> DecompileResult<(Vec<ExceptHandler>, Option<BlockId>)> {
        let mut handlers = Vec::new();
        let mut merge: Option<BlockId> = None;
        let mut current = Some(handler);
        let mut max_off = self.cfg.block(handler).end_offset;

        while let Some(hb) = current {
            self.consume(hb);
            let block = self.cfg.block(hb);
            max_off = max_off.max(block.end_offset);
            let instrs = block.instructions.clone();

            // Seed the handler-entry stack with the exception sentinel on
            // top. On 3.11+ the previous exception appears only once
            // PUSH_EXC_INFO runs, so chain blocks after the first get it
            // pre-seeded; before 3.11 the classic triple is
            // (traceback, value, type) with the type on top.
            let has_push = instrs.first().map(|i| i.opcode) == Some(Opcode::PushExcInfo);
            let mut seed = if self.version.at_least(3, 11) {
                StackState::unknowns(usize::from(lasti) + usize::from(!has_push))
            } else {
                StackState::unknowns(1)
            };
            seed.push(StackValue::Expr(Expr::Name(EXC_SENTINEL.into())));
            if self.version.before(3, 11) {
                seed.push(StackValue::Unknown);
            }
            self.sim.stack = seed;

            let match_at = instrs.iter().position(|i| {
                matches!(i.opcode, Opcode::CheckExcMatch | Opcode::CheckEgMatch | Opcode::JumpIfNotExcMatch)
                    || (i.opcode == Opcode::CompareOp && i.arg & 0x0F == 10)
            });

            if let Some(idx) = match_at {
                // Typed handler: evaluate the exception type, follow the
                // match edge into the body, the no-match edge to the next
                // clause.
                self.sim.run(&instrs[..=idx])?;
                let _ = self.sim.take_stmts();
                let kind = self.pop_expr(hb)?;
                // The block ends with the dispatch jump; anything between
                // the match and the jump is protocol.
                let term = *block.terminator();
                let (match_edge, miss_edge) = if term.opcode.jumps_on_false() {
                    (EdgeKind::CondTrue, EdgeKind::CondFalse)
                } else {
                    (EdgeKind::CondFalse, EdgeKind::CondTrue)
                };
                let body_entry = block.successor(match_edge);
                let miss = block.successor(miss_edge);

                // The body continues on the post-match stack: the dispatch
                // value is gone, the exception sentinel is on top.
                let (name, body, rejoin, end) = self.walk_handler_body(body_entry, limit, bound_hi)?;
                max_off = max_off.max(end);
                merge = merge.or(rejoin);
                handlers.push(ExceptHandler {
                    kind: Some(kind),
                    name,
                    body: non_empty(body),
                });

                // A miss edge leading to another matcher continues the
                // chain; a bare re-raise tail ends it.
                current = match miss {
                    Some(m) if self.block_is_reraise_tail(m) => {
                        self.consume(m);
                        max_off = max_off.max(self.cfg.block(m).end_offset);
                        None
                    }
                    other => other,
                };
            } else {
                // Bare except: the whole block starts the body.
                let (name, body, rejoin, end) = self.walk_handler_body(Some(hb), limit, bound_hi)?;
                max_off = max_off.max(end);
                merge = merge.or(rejoin);
                handlers.push(ExceptHandler {
                    kind: None,
                    name,
                    body: non_empty(body),
                });
                current = None;
            }
        }

        let handler_off = self.cfg.block(handler).start_offset;
        self.consume_offsets(handler_off, max_off);
        Ok((handlers, merge))
    }

    /// Walks one handler body, pulling the bound name out of the sentinel
    /// store and trimming the `e = None; del e` unbinding tail.
    fn walk_handler_body(
        &mut self,
        start: Option<BlockId>,
        limit: Option<BlockId>,
        bound_hi: u32,
    ) -> DecompileResult<(Option<String>, Vec<Stmt>, Option<BlockId>, u32)> {
        let lo = start.map_or(0, |s| self.cfg.block(s).start_offset);
        let mut body = self.walk_range(start, limit, Some((lo, bound_hi)))?;
        let mut name = None;

        // Leading `name = @exc` is the as-binding; a leading bare `@exc`
        // statement is the discard.
        if let Some(first) = body.first() {
            match first {
                Stmt::Assign { targets, value } if *value == Expr::Name(EXC_SENTINEL.into()) => {
                    if let Some(Expr::Name(n)) = targets.first() {
                        name = Some(n.clone());
                    }
                    body.remove(0);
                }
                Stmt::Expr(Expr::Name(n)) if n == EXC_SENTINEL => {
                    body.remove(0);
                }
                _ => {}
            }
        }

        // Unbinding tail emitted by the `except ... as e` epilogue.
        if let Some(n) = &name {
            while matches!(
                body.last(),
                Some(Stmt::Assign { targets, value })
                    if value.is_none_const() && targets.first() == Some(&Expr::Name(n.clone()))
            ) || matches!(
                body.last(),
                Some(Stmt::Delete(items)) if items.first() == Some(&Expr::Name(n.clone()))
            ) {
                body.pop();
            }
        }

        // The rejoin is where the walked body jumps out of its range.
        let rejoin = self.rejoin_of(lo, bound_hi);
        let end = self
            .cfg
            .blocks
            .iter()
            .filter(|b| b.start_offset >= lo && b.start_offset < bound_hi && self.consumed[b.id.index()])
            .map(|b| b.end_offset)
            .max()
            .unwrap_or(lo);
        Ok((name, body, rejoin, end))
    }

    /// A chain tail that just re-raises the unmatched exception.
    fn block_is_reraise_tail(&self, b: BlockId) -> bool {
        let block = self.cfg.block(b);
        block.instructions.len() <= 3 && block.terminator().opcode == Opcode::Reraise
    }

    // ------------------------------------------------------------------
    // With
    // ------------------------------------------------------------------

    fn handle_with(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        let block = self.cfg.block(b);
        let instrs = block.instructions.clone();
        let setup_at = instrs
            .iter()
            .position(|i| {
                matches!(
                    i.opcode,
                    Opcode::BeforeWith | Opcode::SetupWith | Opcode::BeforeAsyncWith | Opcode::SetupAsyncWith
                )
            })
            .expect("with pattern requires a setup opcode");
        let setup = instrs[setup_at];
        let is_async = matches!(setup.opcode, Opcode::BeforeAsyncWith | Opcode::SetupAsyncWith);

        // Everything before the setup computes the context manager.
        self.sim.run(&instrs[..setup_at])?;
        out.extend(self.sim.take_stmts());
        let context = self.pop_expr(b)?;

        // The region opened by the setup bounds the body; its handler is
        // the __exit__ protocol, consumed silently.
        let region = self
            .cfg
            .regions
            .iter()
            .find(|r| r.start >= setup.offset && r.start <= setup.next_offset() + 8)
            .copied()
            .ok_or(DecompileError::MalformedBytecode {
                offset: setup.offset,
                reason: "with block without protected region".into(),
            })?;

        // The enter result lands on the stack; bind it through a sentinel
        // so an as-target surfaces as an assignment.
        self.sim.stack.push(StackValue::Expr(Expr::Name(ENTER_SENTINEL.into())));
        self.sim.run(&instrs[setup_at + 1..])?;
        let mut body = self.sim.take_stmts();

        let next_block = block.successor(EdgeKind::Normal);
        let end_block = self.cfg.block_starting_at(region.end);
        let rest = self.walk_range(next_block, end_block, Some((block.start_offset, region.end)))?;
        body.extend(rest);

        // Drop the sentinel if nothing bound it.
        let mut target = None;
        if let Some(first) = body.first() {
            match first {
                Stmt::Assign { targets, value } if *value == Expr::Name(ENTER_SENTINEL.into()) => {
                    target = targets.first().cloned();
                    body.remove(0);
                }
                Stmt::Expr(Expr::Name(n)) if n == ENTER_SENTINEL => {
                    body.remove(0);
                }
                _ => {}
            }
        }
        if matches!(self.sim.stack.peek(0), Some(StackValue::Expr(Expr::Name(n))) if n == ENTER_SENTINEL) {
            let _ = self.sim.stack.pop();
        }

        // Consume the exit-call epilogue and the exception-path handler.
        let handler = self.cfg.block_starting_at(region.target);
        let next = self.with_epilogue(region.end, handler);

        out.push(Stmt::With {
            items: vec![WithItem { context, target }],
            body: non_empty(body),
            is_async,
        });
        Ok(next)
    }

    /// Skips the `__exit__` call blocks after a with body and returns the
    /// continuation block.
    fn with_epilogue(&mut self, body_end: u32, handler: Option<BlockId>) -> Option<BlockId> {
        // Normal path: blocks from body_end until one that jumps past the
        // exception handler.
        let mut next = None;
        let handler_start = handler.map(|h| self.cfg.block(h).start_offset).unwrap_or(u32::MAX);
        for block in self.cfg.blocks.clone() {
            if block.start_offset < body_end || self.consumed[block.id.index()] {
                continue;
            }
            if block.start_offset >= handler_start {
                // Exception-path blocks: consume until the re-raise.
                self.consumed[block.id.index()] = true;
                let term = block.terminator();
                if term.opcode == Opcode::Reraise || term.opcode == Opcode::PopExcept {
                    continue;
                }
                if term.opcode.is_unconditional_jump() {
                    next = next.or_else(|| {
                        term.jump_target(self.version).and_then(|t| self.cfg.block_starting_at(t))
                    });
                }
                continue;
            }
            // Normal-path epilogue block.
            self.consumed[block.id.index()] = true;
            let term = block.terminator();
            if term.opcode.is_unconditional_jump() {
                next = term
                    .jump_target(self.version)
                    .and_then(|t| self.cfg.block_starting_at(t));
                break;
            }
            if term.opcode.never_falls_through() {
                break;
            }
            if let Some(fallthrough) = self.cfg.block_starting_at(block.end_offset) {
                if self.cfg.block(fallthrough).start_offset >= handler_start {
                    continue;
                }
                next = Some(fallthrough);
                if !self.cfg.block(fallthrough).is_handler {
                    break;
                }
            }
        }
        // Whatever the epilogue decided, never resume inside the handler
        // itself (the continuation usually sits past it).
        let handler_end = handler.map_or(0, |h| self.handler_extent(h));
        next.filter(|n| {
            let off = self.cfg.block(*n).start_offset;
            handler.is_none() || off < handler_start || off >= handler_end
        })
    }

    // ------------------------------------------------------------------
    // Match
    // ------------------------------------------------------------------

    fn handle_match(&mut self, b: BlockId, out: &mut Vec<Stmt>) -> DecompileResult<Option<BlockId>> {
        self.consume(b);
        let block = self.cfg.block(b);
        let instrs = block.instructions.clone();

        // The subject is whatever is computed before the first pattern
        // test opcode (or the trailing COPY that preserves it).
        let first_test = instrs
            .iter()
            .position(|i| {
                matches!(
                    i.opcode,
                    Opcode::MatchSequence
                        | Opcode::MatchMapping
                        | Opcode::MatchClass
                        | Opcode::MatchKeys
                        | Opcode::Copy
                )
            })
            .unwrap_or(instrs.len().saturating_sub(1));
        self.sim.run(&instrs[..first_test])?;
        out.extend(self.sim.take_stmts());
        let subject = self.pop_expr(b)?;
        let saved = self.sim.stack.clone();

        let mut cases = Vec::new();
        let mut current = Some(b);
        let mut first = Some(first_test);
        let mut merge: Option<BlockId> = None;

        while let Some(cb) = current {
            let start = first.take().unwrap_or(0);
            let bound_hi = merge.map(|m| self.cfg.block(m).start_offset);
            self.sim.stack = saved.clone();
            let (case, miss, rejoin) = self.parse_match_case(cb, start, &subject, bound_hi)?;
            merge = merge.or(rejoin);
            let is_wildcard = matches!(&case.pattern, Pattern::As { pattern: None, name: None });
            cases.push(case);
            if is_wildcard {
                current = None;
            } else {
                current = miss;
            }
            if current == merge {
                break;
            }
        }

        self.sim.stack = saved;
        out.push(Stmt::Match { subject, cases });
        Ok(merge)
    }

    /// Parses one `case`: its pattern tests, optional guard, and body.
    /// `bound_hi` caps the body walk at the match statement's merge when
    /// it is already known.
    fn parse_match_case(
        &mut self,
        b: BlockId,
        start_index: usize,
        subject: &Expr,
        bound_hi: Option<u32>,
    ) -> DecompileResult<(MatchCase, Option<BlockId>, Option<BlockId>)> {
        self.consume(b);
        let block = self.cfg.block(b);
        let instrs = block.instructions[start_index..].to_vec();
        let term = *block.terminator();

        // Wildcard / capture case: no conditional dispatch at all.
        if !term.opcode.is_conditional_jump() {
            self.sim.stack.push(StackValue::Expr(subject.clone()));
            self.sim.run(&instrs)?;
            let mut prelude = self.sim.take_stmts();
            let pattern = match extract_capture(&mut prelude, subject) {
                Some(name) => Pattern::As {
                    pattern: None,
                    name: Some(name),
                },
                None => Pattern::As {
                    pattern: None,
                    name: None,
                },
            };
            // The discard of the still-live subject is protocol noise.
            if matches!(prelude.first(), Some(Stmt::Expr(e)) if e == subject) {
                prelude.remove(0);
            }
            let mut body = prelude;
            let next = if term.opcode.is_unconditional_jump() {
                term.jump_target(self.version).and_then(|t| self.cfg.block_starting_at(t))
            } else {
                block.successor(EdgeKind::Normal)
            };
            let lo = block.start_offset;
            let hi = bound_hi.unwrap_or(u32::MAX);
            let limit = bound_hi.and_then(|h| self.cfg.block_starting_at(h));
            let rest = self.walk_range(next, limit, Some((lo, hi)))?;
            body.extend(rest);
            let rejoin = self.rejoin_of(lo, hi);
            return Ok((
                MatchCase {
                    pattern,
                    guard: None,
                    body: non_empty(body),
                },
                None,
                rejoin,
            ));
        }

        // Tested case: reconstruct the pattern from the test opcodes.
        let kind_op = instrs.iter().find(|i| {
            matches!(
                i.opcode,
                Opcode::MatchSequence | Opcode::MatchMapping | Opcode::MatchClass | Opcode::MatchKeys
            )
        });
        let (match_edge, miss_edge) = if term.opcode.jumps_on_false() {
            (EdgeKind::CondTrue, EdgeKind::CondFalse)
        } else {
            (EdgeKind::CondFalse, EdgeKind::CondTrue)
        };
        let miss = block.successor(miss_edge);
        let success = block.successor(match_edge);

        let mut pattern = match kind_op.map(|i| i.opcode) {
            Some(Opcode::MatchSequence) => Pattern::Sequence(Vec::new()),
            Some(Opcode::MatchMapping) => Pattern::Mapping {
                keys: Vec::new(),
                patterns: Vec::new(),
                rest: None,
            },
            Some(Opcode::MatchClass) => Pattern::Class {
                cls: Expr::Name(String::new()),
                patterns: Vec::new(),
                kwd_names: Vec::new(),
                kwd_patterns: Vec::new(),
            },
            _ => {
                // Value pattern: `COPY; LOAD const; COMPARE ==`.
                self.sim.stack.push(StackValue::Expr(subject.clone()));
                self.sim.run(&instrs)?;
                let _ = self.sim.take_stmts();
                let cond = self.pop_expr(b)?;
                let value = match cond {
                    Expr::Compare { comparators, .. } => {
                        comparators.into_iter().next().unwrap_or(Expr::none())
                    }
                    other => other,
                };
                while self.sim.stack.depth() > 0
                    && matches!(self.sim.stack.peek(0), Some(StackValue::Expr(e)) if e == subject)
                {
                    let _ = self.sim.stack.pop();
                }
                Pattern::Value(value)
            }
        };

        // For structural patterns, harvest bindings from the success
        // path; the body ends where the next case begins.
        let case_hi = miss
            .map(|m| self.cfg.block(m).start_offset)
            .or(bound_hi)
            .unwrap_or(u32::MAX);
        let (guard, body, rejoin) = self.parse_case_success(success, subject, &mut pattern, case_hi)?;

        Ok((
            MatchCase {
                pattern,
                guard,
                body: non_empty(body),
            },
            miss,
            rejoin,
        ))
    }

    /// Walks the success path of a case: length checks, unpack bindings,
    /// an optional guard, and the body.
    fn parse_case_success(
        &mut self,
        start: Option<BlockId>,
        subject: &Expr,
        pattern: &mut Pattern,
        bound_hi: u32,
    ) -> DecompileResult<(Option<Expr>, Vec<Stmt>, Option<BlockId>)> {
        let mut guard = None;
        let mut current = start;
        let mut bindings: Vec<String> = Vec::new();

        while let Some(cb) = current {
            if self.consumed[cb.index()] {
                break;
            }
            let block = self.cfg.block(cb);
            let term = *block.terminator();
            let has_unpack = block
                .instructions
                .iter()
                .any(|i| matches!(i.opcode, Opcode::UnpackSequence | Opcode::UnpackEx));
            let is_len_check = block
                .instructions
                .iter()
                .any(|i| i.opcode == Opcode::GetLen);

            if term.opcode.is_conditional_jump() && is_len_check {
                // Length guard of a sequence pattern: structural, skip.
                self.consume(cb);
                self.sim.stack.push(StackValue::Expr(subject.clone()));
                self.sim.run(&block.instructions.clone())?;
                let _ = self.sim.take_stmts();
                let _cond = self.sim.stack.pop();
                while matches!(self.sim.stack.peek(0), Some(StackValue::Expr(e)) if e == subject) {
                    let _ = self.sim.stack.pop();
                }
                current = block.successor(if term.opcode.jumps_on_false() {
                    EdgeKind::CondTrue
                } else {
                    EdgeKind::CondFalse
                });
                continue;
            }

            if has_unpack {
                // Binding block: unpack the matched sequence. The guard
                // test can share this block; its value is left on top.
                self.consume(cb);
                self.sim.stack.push(StackValue::Expr(subject.clone()));
                self.sim.run(&block.instructions.clone())?;
                for stmt in self.sim.take_stmts() {
                    if let Stmt::Assign { targets, .. } = stmt {
                        collect_names(&targets, &mut bindings);
                    }
                }
                current = if term.opcode.is_conditional_jump() {
                    guard = Some(self.condition_from(cb)?);
                    block.successor(if term.opcode.jumps_on_false() {
                        EdgeKind::CondTrue
                    } else {
                        EdgeKind::CondFalse
                    })
                } else if term.opcode.is_unconditional_jump() {
                    term.jump_target(self.version).and_then(|t| self.cfg.block_starting_at(t))
                } else {
                    block.successor(EdgeKind::Normal)
                };
                continue;
            }

            if term.opcode.is_conditional_jump() {
                // Guard expression.
                self.consume(cb);
                self.simulate_block(cb)?;
                let _ = self.sim.take_stmts();
                guard = Some(self.condition_from(cb)?);
                current = block.successor(if term.opcode.jumps_on_false() {
                    EdgeKind::CondTrue
                } else {
                    EdgeKind::CondFalse
                });
                continue;
            }

            break;
        }

        if let Pattern::Sequence(patterns) = pattern {
            *patterns = bindings
                .iter()
                .map(|n| Pattern::As {
                    pattern: None,
                    name: Some(n.clone()),
                })
                .collect();
        }

        let lo = current.map_or(0, |c| self.cfg.block(c).start_offset);
        let body = self.walk_range(current, None, Some((lo, bound_hi)))?;
        let rejoin = self.rejoin_of(lo, bound_hi);
        Ok((guard, body, rejoin))
    }
}

/// Intermediate result of one comprehension-walk step.
enum CompStep {
    Continue(Option<BlockId>),
    NewLoop(BlockId),
    Done,
}

/// Index of the first instruction after the target-binding prelude
/// (stores and unpacks at the top of a loop body).
fn prelude_split(instrs: &[Instruction]) -> usize {
    let mut i = 0;
    while i < instrs.len() {
        match instrs[i].opcode {
            Opcode::StoreFast
            | Opcode::StoreName
            | Opcode::StoreDeref
            | Opcode::StoreGlobal
            | Opcode::UnpackSequence
            | Opcode::UnpackEx => i += 1,
            _ => break,
        }
    }
    i
}

/// Pulls the `target = @item` assignment out of a freshly walked loop
/// body.
fn extract_for_target(body: &mut Vec<Stmt>) -> Option<Expr> {
    let index = body.iter().position(|stmt| {
        matches!(stmt, Stmt::Assign { value, .. } if *value == Expr::Name(ITEM_SENTINEL.into()))
    })?;
    match body.remove(index) {
        Stmt::Assign { mut targets, .. } => {
            let target = targets.pop()?;
            Some(match target {
                Expr::Tuple(items) if items.len() == 1 => items.into_iter().next().expect("len 1"),
                other => other,
            })
        }
        _ => None,
    }
}

/// A capture case stores the subject into a name.
fn extract_capture(stmts: &mut Vec<Stmt>, subject: &Expr) -> Option<String> {
    let index = stmts.iter().position(|stmt| {
        matches!(stmt, Stmt::Assign { value, .. } if value == subject)
    })?;
    match stmts.remove(index) {
        Stmt::Assign { targets, .. } => match targets.into_iter().next() {
            Some(Expr::Name(n)) => Some(n),
            _ => None,
        },
        _ => None,
    }
}

fn collect_names(targets: &[Expr], out: &mut Vec<String>) {
    for target in targets {
        match target {
            Expr::Name(n) => out.push(n.clone()),
            Expr::Tuple(items) | Expr::List(items) => collect_names(items, out),
            Expr::Starred(inner) => collect_names(std::slice::from_ref(inner), out),
            _ => {}
        }
    }
}

fn non_empty(body: Vec<Stmt>) -> Vec<Stmt> {
    if body.is_empty() {
        vec![Stmt::Pass]
    } else {
        body
    }
}

/// Splits a single-statement `if` (no else) into its test and body, or
/// returns the statements unchanged.
fn single_if(body: Vec<Stmt>) -> Result<(Expr, Vec<Stmt>), Vec<Stmt>> {
    if body.len() == 1 {
        if let Some(Stmt::If { test, body, orelse }) = body.first() {
            if orelse.is_empty() {
                return Ok((test.clone(), body.clone()));
            }
        }
    }
    Err(body)
}

/// Decompiles a comprehension code object invoked with `iterable`.
fn decompile_comprehension(code: &CodeObject, version: PyVersion, iterable: Expr) -> DecompileResult<Expr> {
    let instructions = decode_code(&code.code, version)?;
    if instructions.is_empty() {
        return Err(DecompileError::MalformedBytecode {
            offset: 0,
            reason: "empty comprehension code".into(),
        });
    }
    let cfg = Cfg::build(&instructions, code, version)?;
    let dom = DomInfo::compute(&cfg);
    let _entry_stacks = Dataflow::compute(&cfg, code, version)?;
    let hook = Nested { version };
    let mut walker = Walker {
        version,
        cfg: &cfg,
        dom: &dom,
        detector: PatternDetector::new(&cfg, &dom, version),
        sim: Simulator::new(code, version, SimMode::Emit, &hook, StackState::new()),
        consumed: vec![false; cfg.len()],
        frames: Vec::new(),
        active_tries: Vec::new(),
        steps: 0,
        step_limit: cfg.len() * 8 + 64,
    };

    // Run sequentially until the FOR_ITER header, then rebuild.
    let mut current = Some(cfg.entry);
    let mut comp = None;
    while let Some(b) = current {
        let block = walker.cfg.block(b);
        if block.terminator().opcode == Opcode::ForIter {
            let n = block.instructions.len();
            walker.consume(b);
            walker.simulate_slice(b, 0..n - 1)?;
            let inner_iter = walker.pop_expr(b)?;
            let kind = match (code.name.as_str(), walker.sim.stack.peek(0)) {
                ("<listcomp>", _) => CompKind::List,
                ("<setcomp>", _) => CompKind::Set,
                ("<dictcomp>", _) => CompKind::Dict,
                _ => CompKind::Generator,
            };
            // Replace the accumulator display (if any) with a builder.
            if matches!(
                walker.sim.stack.peek(0),
                Some(StackValue::Expr(Expr::List(_) | Expr::Set(_) | Expr::Dict(_)))
            ) {
                let _ = walker.sim.stack.pop();
            }
            walker.sim.stack.push(StackValue::CompBuilder(CompState::new(kind)));
            let _ = inner_iter;
            comp = Some(walker.comp_from_loop(b, iterable.clone(), kind)?);
            break;
        }
        walker.consume(b);
        walker.simulate_block(b)?;
        let _ = walker.sim.take_stmts();
        current = block.successor(EdgeKind::Normal);
    }

    let comp = comp.ok_or(DecompileError::MalformedBytecode {
        offset: 0,
        reason: "comprehension without loop".into(),
    })?;

    // The parameter `.0` is the call-site iterable.
    Ok(substitute_dot_zero(comp, &iterable))
}

/// Replaces the `.0` implicit parameter with the call-site iterable.
fn substitute_dot_zero(expr: Expr, iterable: &Expr) -> Expr {
    match expr {
        Expr::Name(n) if n == ".0" => iterable.clone(),
        Expr::Comp {
            kind,
            element,
            value,
            generators,
        } => Expr::Comp {
            kind,
            element: Box::new(substitute_dot_zero(*element, iterable)),
            value: value.map(|v| Box::new(substitute_dot_zero(*v, iterable))),
            generators: generators
                .into_iter()
                .map(|g| Comprehension {
                    target: g.target,
                    iter: substitute_dot_zero(g.iter, iterable),
                    ifs: g.ifs,
                    is_async: g.is_async,
                })
                .collect(),
        },
        other => other,
    }
}

