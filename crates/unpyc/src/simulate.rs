//! Per-block symbolic interpretation of the operand stack.
//!
//! The simulator replays a block's instructions against a `StackState`,
//! turning opcode sequences back into expressions and statements. It runs
//! in two modes: `Emit` builds AST and treats underflow or unknown inputs
//! as hard errors; `Flow` is the dataflow variant that absorbs underflow
//! and degrades unknown inputs to `Unknown` outputs without emitting
//! statements.
//!
//! Control-flow instructions (jumps, `FOR_ITER`) are deliberately inert
//! here; the structured decompiler consumes them. Nested code objects are
//! resolved through the `NestedHook` callback so this module stays free
//! of traversal logic.

use std::rc::Rc;

use crate::{
    ast::{
        Alias, BinOp, BoolOpKind, ClsMeta, CmpOp, Conversion, Expr, FStringPart, FnMeta, Keyword, Stmt, TypeParam,
        TypeParamKind, UnaryOp,
    },
    code::CodeObject,
    error::{DecompileError, DecompileResult},
    insn::Instruction,
    marshal::Obj,
    opcodes::{binary_op_from_arg, compare_from_arg, BinaryOpKind, CompareKind, Opcode},
    stack::{StackState, StackValue},
    version::PyVersion,
};

/// Simulation mode; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Dataflow: tolerate underflow, produce no statements.
    Flow,
    /// Emission: build AST, error on underflow or unknown inputs.
    Emit,
}

/// Callback into the structured decompiler for nested code objects.
///
/// Flow mode never calls these.
pub trait NestedHook {
    /// Decompiles a comprehension code object called with `iterable`.
    fn comprehension(&self, code: &Rc<CodeObject>, iterable: Expr) -> DecompileResult<Expr>;
    /// Decompiles a lambda body.
    fn lambda(&self, meta: &FnMeta) -> DecompileResult<Expr>;
    /// Builds a `def` statement for a stored function object.
    fn function_def(&self, meta: &FnMeta, name: String) -> DecompileResult<Stmt>;
    /// Builds a `class` statement for a stored class object.
    fn class_def(&self, meta: &ClsMeta, name: String) -> DecompileResult<Stmt>;
}

/// Hook used by flow mode; every request degrades to `Unknown`-ish
/// output, which flow mode discards anyway.
pub struct NoNesting;

impl NestedHook for NoNesting {
    fn comprehension(&self, _code: &Rc<CodeObject>, iterable: Expr) -> DecompileResult<Expr> {
        Ok(iterable)
    }

    fn lambda(&self, _meta: &FnMeta) -> DecompileResult<Expr> {
        Ok(Expr::none())
    }

    fn function_def(&self, _meta: &FnMeta, name: String) -> DecompileResult<Stmt> {
        Ok(Stmt::Expr(Expr::Name(name)))
    }

    fn class_def(&self, _meta: &ClsMeta, name: String) -> DecompileResult<Stmt> {
        Ok(Stmt::Expr(Expr::Name(name)))
    }
}

/// Pending multi-target unpack bookkeeping.
#[derive(Debug)]
struct UnpackGroup {
    targets: Vec<Option<Expr>>,
    star_index: Option<usize>,
    value: Expr,
    remaining: usize,
}

/// Per-block (and across sequential blocks) symbolic interpreter.
pub struct Simulator<'a, H: NestedHook> {
    pub code: &'a CodeObject,
    pub version: PyVersion,
    pub mode: SimMode,
    pub hook: &'a H,
    pub stack: StackState,
    stmts: Vec<Stmt>,
    /// `global` names implied by STORE_GLOBAL/DELETE_GLOBAL in functions.
    pub globals_used: Vec<String>,
    /// `nonlocal` names implied by stores to free variables.
    pub nonlocals_used: Vec<String>,
    unpacks: Vec<UnpackGroup>,
    /// Keyword names staged by `KW_NAMES` for the next call.
    kw_names: Option<Vec<String>>,
    /// Left operand and operator of the last in-place op, for AugAssign.
    pending_inplace: Option<(Expr, BinOp)>,
    /// Value of an active `a = b = x` chain.
    chain_value: Option<Expr>,
    /// Python 2 `print` items accumulated until PRINT_NEWLINE.
    print_items: Vec<Expr>,
}

impl<'a, H: NestedHook> Simulator<'a, H> {
    pub fn new(code: &'a CodeObject, version: PyVersion, mode: SimMode, hook: &'a H, stack: StackState) -> Self {
        Self {
            code,
            version,
            mode,
            hook,
            stack,
            stmts: Vec::new(),
            globals_used: Vec::new(),
            nonlocals_used: Vec::new(),
            unpacks: Vec::new(),
            kw_names: None,
            pending_inplace: None,
            chain_value: None,
            print_items: Vec::new(),
        }
    }

    /// Drains the statements emitted so far.
    pub fn take_stmts(&mut self) -> Vec<Stmt> {
        std::mem::take(&mut self.stmts)
    }

    pub fn emit(&mut self, stmt: Stmt) {
        if self.mode == SimMode::Emit {
            self.stmts.push(stmt);
        }
    }

    /// Runs every instruction of a slice through `step`.
    pub fn run(&mut self, instructions: &[Instruction]) -> DecompileResult<()> {
        for (i, instr) in instructions.iter().enumerate() {
            self.step(instr, instructions.get(i + 1))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    fn pop_value(&mut self, opcode: Opcode, offset: u32) -> DecompileResult<StackValue> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None if self.mode == SimMode::Flow => Ok(StackValue::Unknown),
            None => Err(DecompileError::StackUnderflow { offset, opcode }),
        }
    }

    /// Converts a stack value to an expression, resolving nested function
    /// objects through the hook. Flow mode maps failures to `None`.
    fn value_to_expr(&mut self, value: StackValue, opcode: Opcode, offset: u32) -> DecompileResult<Option<Expr>> {
        match value {
            StackValue::Function(meta) if self.mode == SimMode::Emit => {
                if meta.code.is_lambda() {
                    Ok(Some(self.hook.lambda(&meta)?))
                } else {
                    Err(DecompileError::NotAnExpression { opcode, offset })
                }
            }
            StackValue::Unknown if self.mode == SimMode::Flow => Ok(None),
            other => match other.into_expr(opcode, offset) {
                Ok(expr) => Ok(Some(expr)),
                Err(_) if self.mode == SimMode::Flow => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    fn pop_expr(&mut self, opcode: Opcode, offset: u32) -> DecompileResult<Option<Expr>> {
        let value = self.pop_value(opcode, offset)?;
        self.value_to_expr(value, opcode, offset)
    }

    /// Pops `n` values and converts them all, bottom-first. `None` if any
    /// was unknown (flow mode only).
    fn pop_exprs(&mut self, n: usize, opcode: Opcode, offset: u32) -> DecompileResult<Option<Vec<Expr>>> {
        let mut out = Vec::with_capacity(n);
        let mut ok = true;
        for _ in 0..n {
            match self.pop_expr(opcode, offset)? {
                Some(expr) => out.push(expr),
                None => ok = false,
            }
        }
        if !ok {
            return Ok(None);
        }
        out.reverse();
        Ok(Some(out))
    }

    fn push(&mut self, value: StackValue) {
        self.stack.push(value);
    }

    fn push_expr(&mut self, expr: Expr) {
        self.stack.push(StackValue::Expr(expr));
    }

    fn push_maybe(&mut self, expr: Option<Expr>) {
        match expr {
            Some(e) => self.push_expr(e),
            None => self.push(StackValue::Unknown),
        }
    }

    // ------------------------------------------------------------------
    // Name-table helpers
    // ------------------------------------------------------------------

    fn name(&self, index: u32, offset: u32) -> DecompileResult<String> {
        self.code
            .name_at(index)
            .map(str::to_owned)
            .ok_or(DecompileError::MalformedBytecode {
                offset,
                reason: format!("name index {index} out of range"),
            })
    }

    fn var_name(&self, index: u32, offset: u32) -> DecompileResult<String> {
        self.code
            .var_name_at(index)
            .map(str::to_owned)
            .ok_or(DecompileError::MalformedBytecode {
                offset,
                reason: format!("local index {index} out of range"),
            })
    }

    fn deref_name(&self, index: u32, offset: u32) -> DecompileResult<String> {
        self.code
            .deref_name_at(index, self.version)
            .map(str::to_owned)
            .ok_or(DecompileError::MalformedBytecode {
                offset,
                reason: format!("deref index {index} out of range"),
            })
    }

    fn constant(&self, index: u32, offset: u32) -> DecompileResult<Obj> {
        self.code.const_at(index).cloned().ok_or(DecompileError::MalformedBytecode {
            offset,
            reason: format!("constant index {index} out of range"),
        })
    }

    // ------------------------------------------------------------------
    // The opcode dispatch
    // ------------------------------------------------------------------

    /// Interprets one instruction. `next` is a one-instruction lookahead
    /// used to tell walrus assignments from assignment chains.
    #[allow(clippy::too_many_lines)]
    pub fn step(&mut self, instr: &Instruction, next: Option<&Instruction>) -> DecompileResult<()> {
        use Opcode as Op;
        let op = instr.opcode;
        let arg = instr.arg;
        let offset = instr.offset;

        match op {
            // -- inert: alignment, bookkeeping, and control flow handled
            //    by the structured decompiler
            Op::Nop
            | Op::Cache
            | Op::Resume
            | Op::StopCode
            | Op::GenStart
            | Op::ReturnGenerator
            | Op::MakeCell
            | Op::CopyFreeVars
            | Op::SetupAnnotations
            | Op::SetupLoop
            | Op::PopBlock
            | Op::SetupExcept
            | Op::SetupFinally
            | Op::Precall
            | Op::EnterExecutor
            | Op::Reserved
            | Op::ToBool
            | Op::GetIter
            | Op::GetAiter
            | Op::GetYieldFromIter
            | Op::JumpForward
            | Op::JumpAbsolute
            | Op::JumpBackward
            | Op::JumpBackwardNoInterrupt
            | Op::PopJumpIfFalse
            | Op::PopJumpIfTrue
            | Op::PopJumpIfNone
            | Op::PopJumpIfNotNone
            | Op::PopJumpBackwardIfFalse
            | Op::PopJumpBackwardIfTrue
            | Op::PopJumpBackwardIfNone
            | Op::PopJumpBackwardIfNotNone
            | Op::JumpIfFalseOrPop
            | Op::JumpIfTrueOrPop
            | Op::ForIter
            | Op::BreakLoop
            | Op::ContinueLoop
            | Op::InterpreterExit => {}

            // -- constants and names
            Op::LoadConst | Op::ReturnConst => {
                let obj = self.constant(arg, offset)?;
                let value = match obj {
                    Obj::Code(code) => StackValue::Code(code),
                    other => StackValue::Expr(Expr::Const(other)),
                };
                self.push(value);
                if op == Op::ReturnConst {
                    let expr = self.pop_expr(op, offset)?;
                    self.emit(Stmt::Return(expr));
                }
            }
            Op::LoadSmallInt => self.push_expr(Expr::Const(Obj::Int(i64::from(arg)))),
            Op::LoadName => {
                let name = self.name(arg, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadGlobal => {
                let index = if self.version.at_least(3, 11) {
                    if arg & 1 != 0 {
                        self.push(StackValue::Null);
                    }
                    arg >> 1
                } else {
                    arg
                };
                let name = self.name(index, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadFast | Op::LoadFastCheck | Op::LoadFastBorrow => {
                let name = self.var_name(arg, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadFastLoadFast | Op::LoadFastBorrowLoadFastBorrow => {
                let (hi, lo) = instr.packed_locals();
                let first = self.var_name(hi, offset)?;
                let second = self.var_name(lo, offset)?;
                self.push_expr(Expr::Name(first));
                self.push_expr(Expr::Name(second));
            }
            Op::StoreFastLoadFast => {
                let (hi, lo) = instr.packed_locals();
                let target = self.var_name(hi, offset)?;
                self.store_target(Expr::Name(target), op, offset, next)?;
                let name = self.var_name(lo, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::StoreFastStoreFast => {
                let (hi, lo) = instr.packed_locals();
                let first = self.var_name(hi, offset)?;
                let second = self.var_name(lo, offset)?;
                self.store_target(Expr::Name(first), op, offset, next)?;
                self.store_target(Expr::Name(second), op, offset, next)?;
            }
            Op::LoadDeref | Op::LoadClassderef | Op::LoadFromDictOrDeref => {
                let name = self.deref_name(arg, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadClosure => {
                let name = self.deref_name(arg, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadFromDictOrGlobals => {
                // Class-body lookup helper (PEP 695 scopes); the dict on
                // the stack is protocol noise.
                let _ = self.pop_value(op, offset)?;
                let name = self.name(arg, offset)?;
                self.push_expr(Expr::Name(name));
            }
            Op::LoadLocals => {
                self.push_expr(Expr::Call {
                    func: Box::new(Expr::Name("locals".into())),
                    args: Vec::new(),
                    keywords: Vec::new(),
                });
            }
            Op::LoadBuildClass => self.push_expr(Expr::Name("__build_class__".into())),
            Op::LoadAssertionError => self.push_expr(Expr::Name("AssertionError".into())),
            Op::LoadFastAndClear => {
                let name = self.code.var_name_at(arg).map(str::to_owned);
                self.push(StackValue::SavedLocal(name));
            }

            // -- attributes, subscripts, slices
            Op::LoadAttr => {
                let (index, is_method) = if self.version.at_least(3, 12) {
                    (arg >> 1, arg & 1 != 0)
                } else {
                    (arg, false)
                };
                let attr = self.name(index, offset)?;
                let owner = self.pop_value(op, offset)?;
                match owner {
                    // `import a.b.c as x` traverses submodules with
                    // LOAD_ATTR; extend the dotted path while it matches.
                    StackValue::Import {
                        module,
                        level,
                        fromlist,
                        mut attrs,
                    } => {
                        let follows_path = module.split('.').nth(attrs.len() + 1) == Some(attr.as_str());
                        if follows_path {
                            attrs.push(attr);
                            self.push(StackValue::Import {
                                module,
                                level,
                                fromlist,
                                attrs,
                            });
                            return Ok(());
                        }
                        let base = StackValue::Import {
                            module,
                            level,
                            fromlist,
                            attrs,
                        };
                        let expr = self.value_to_expr(base, op, offset)?;
                        self.push_maybe(expr.map(|value| Expr::Attribute {
                            value: Box::new(value),
                            attr,
                        }));
                    }
                    other => {
                        let expr = self.value_to_expr(other, op, offset)?;
                        self.push_maybe(expr.map(|value| Expr::Attribute {
                            value: Box::new(value),
                            attr,
                        }));
                    }
                }
                if is_method {
                    self.push(StackValue::Null);
                }
            }
            Op::LoadMethod => {
                let attr = self.name(arg, offset)?;
                let owner = self.pop_expr(op, offset)?;
                self.push_maybe(owner.map(|value| Expr::Attribute {
                    value: Box::new(value),
                    attr,
                }));
                self.push(StackValue::Null);
            }
            Op::LoadSuperAttr => {
                let attr = self.name(arg >> 2, offset)?;
                let _self_obj = self.pop_expr(op, offset)?;
                let _class = self.pop_expr(op, offset)?;
                let _super_fn = self.pop_expr(op, offset)?;
                // Zero-argument super() is what the compiler emits this
                // opcode for.
                self.push_expr(Expr::Attribute {
                    value: Box::new(Expr::Call {
                        func: Box::new(Expr::Name("super".into())),
                        args: Vec::new(),
                        keywords: Vec::new(),
                    }),
                    attr,
                });
                if arg & 1 != 0 {
                    self.push(StackValue::Null);
                }
            }
            Op::BinarySubscr => {
                let index = self.pop_expr(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.zip(index).map(|(value, index)| Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                }));
            }
            Op::BinarySlice => {
                let upper = self.pop_expr(op, offset)?;
                let lower = self.pop_expr(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.zip(lower.zip(upper)).map(|(value, (lower, upper))| Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(slice_expr(Some(lower), Some(upper), None)),
                }));
            }
            Op::BuildSlice => {
                let count = if arg == 3 { 3 } else { 2 };
                let Some(mut parts) = self.pop_exprs(count, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                let step = if count == 3 { parts.pop() } else { None };
                let upper = parts.pop();
                let lower = parts.pop();
                self.push_expr(slice_expr(
                    lower.filter(|e| !e.is_none_const()),
                    upper.filter(|e| !e.is_none_const()),
                    step.filter(|e| !e.is_none_const()),
                ));
            }

            // -- Python 2 slice opcodes
            Op::SlicePlus0 | Op::SlicePlus1 | Op::SlicePlus2 | Op::SlicePlus3 => {
                let (lower, upper) = self.pop_legacy_slice_bounds(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.map(|value| Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(slice_expr(lower, upper, None)),
                }));
            }
            Op::StoreSlicePlus0 | Op::StoreSlicePlus1 | Op::StoreSlicePlus2 | Op::StoreSlicePlus3 => {
                let (lower, upper) = self.pop_legacy_slice_bounds(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                let rhs = self.pop_expr(op, offset)?;
                if let (Some(value), Some(rhs)) = (value, rhs) {
                    let target = Expr::Subscript {
                        value: Box::new(value),
                        index: Box::new(slice_expr(lower, upper, None)),
                    };
                    self.emit(Stmt::Assign {
                        targets: vec![target],
                        value: rhs,
                    });
                }
            }
            Op::DeleteSlicePlus0 | Op::DeleteSlicePlus1 | Op::DeleteSlicePlus2 | Op::DeleteSlicePlus3 => {
                let (lower, upper) = self.pop_legacy_slice_bounds(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                if let Some(value) = value {
                    self.emit(Stmt::Delete(vec![Expr::Subscript {
                        value: Box::new(value),
                        index: Box::new(slice_expr(lower, upper, None)),
                    }]));
                }
            }

            // -- unary and binary operators
            Op::UnaryPositive => self.unary(UnaryOp::UAdd, op, offset)?,
            Op::UnaryNegative => self.unary(UnaryOp::USub, op, offset)?,
            Op::UnaryNot => self.unary(UnaryOp::Not, op, offset)?,
            Op::UnaryInvert => self.unary(UnaryOp::Invert, op, offset)?,
            Op::UnaryConvert => {
                // Python 2 backquotes; emit the repr() spelling.
                let operand = self.pop_expr(op, offset)?;
                self.push_maybe(operand.map(|operand| Expr::Call {
                    func: Box::new(Expr::Name("repr".into())),
                    args: vec![operand],
                    keywords: Vec::new(),
                }));
            }
            Op::BinaryPower => self.binary(BinOp::Pow, false, op, offset)?,
            Op::BinaryMultiply => self.binary(BinOp::Mult, false, op, offset)?,
            Op::BinaryMatrixMultiply => self.binary(BinOp::MatMult, false, op, offset)?,
            Op::BinaryDivide | Op::BinaryTrueDivide => self.binary(BinOp::Div, false, op, offset)?,
            Op::BinaryFloorDivide => self.binary(BinOp::FloorDiv, false, op, offset)?,
            Op::BinaryModulo => self.binary(BinOp::Mod, false, op, offset)?,
            Op::BinaryAdd => self.binary(BinOp::Add, false, op, offset)?,
            Op::BinarySubtract => self.binary(BinOp::Sub, false, op, offset)?,
            Op::BinaryLshift => self.binary(BinOp::LShift, false, op, offset)?,
            Op::BinaryRshift => self.binary(BinOp::RShift, false, op, offset)?,
            Op::BinaryAnd => self.binary(BinOp::BitAnd, false, op, offset)?,
            Op::BinaryXor => self.binary(BinOp::BitXor, false, op, offset)?,
            Op::BinaryOr => self.binary(BinOp::BitOr, false, op, offset)?,
            Op::InplacePower => self.binary(BinOp::Pow, true, op, offset)?,
            Op::InplaceMultiply => self.binary(BinOp::Mult, true, op, offset)?,
            Op::InplaceMatrixMultiply => self.binary(BinOp::MatMult, true, op, offset)?,
            Op::InplaceDivide | Op::InplaceTrueDivide => self.binary(BinOp::Div, true, op, offset)?,
            Op::InplaceFloorDivide => self.binary(BinOp::FloorDiv, true, op, offset)?,
            Op::InplaceModulo => self.binary(BinOp::Mod, true, op, offset)?,
            Op::InplaceAdd => self.binary(BinOp::Add, true, op, offset)?,
            Op::InplaceSubtract => self.binary(BinOp::Sub, true, op, offset)?,
            Op::InplaceLshift => self.binary(BinOp::LShift, true, op, offset)?,
            Op::InplaceRshift => self.binary(BinOp::RShift, true, op, offset)?,
            Op::InplaceAnd => self.binary(BinOp::BitAnd, true, op, offset)?,
            Op::InplaceXor => self.binary(BinOp::BitXor, true, op, offset)?,
            Op::InplaceOr => self.binary(BinOp::BitOr, true, op, offset)?,
            Op::BinaryOp => {
                let (kind, inplace) = binary_op_from_arg(arg, offset)?;
                self.binary(binop_ast(kind), inplace, op, offset)?;
            }

            // -- comparisons
            Op::CompareOp => {
                let kind = compare_from_arg(arg, self.version, offset)?;
                let cmp = match kind {
                    CompareKind::Lt => CmpOp::Lt,
                    CompareKind::Le => CmpOp::Le,
                    CompareKind::Eq => CmpOp::Eq,
                    CompareKind::Ne => CmpOp::NotEq,
                    CompareKind::Gt => CmpOp::Gt,
                    CompareKind::Ge => CmpOp::Ge,
                    CompareKind::In => CmpOp::In,
                    CompareKind::NotIn => CmpOp::NotIn,
                    CompareKind::Is => CmpOp::Is,
                    CompareKind::IsNot => CmpOp::IsNot,
                    // Exception matching is consumed structurally by the
                    // try pattern; keep the type on the stack.
                    CompareKind::ExcMatch => {
                        let kind_expr = self.pop_expr(op, offset)?;
                        let _exc = self.pop_value(op, offset)?;
                        self.push_maybe(kind_expr);
                        return Ok(());
                    }
                };
                self.compare(cmp, op, offset)?;
            }
            Op::IsOp => self.compare(if arg == 0 { CmpOp::Is } else { CmpOp::IsNot }, op, offset)?,
            Op::ContainsOp => self.compare(if arg == 0 { CmpOp::In } else { CmpOp::NotIn }, op, offset)?,
            Op::JumpIfNotExcMatch | Op::CheckExcMatch => {
                // Pop the candidate type; the try pattern reads it back.
                let kind_expr = self.pop_expr(op, offset)?;
                self.push_maybe(kind_expr);
            }
            Op::CheckEgMatch => {
                let kind_expr = self.pop_expr(op, offset)?;
                let _exc = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
                self.push_maybe(kind_expr);
            }

            // -- stack shuffling
            Op::PopTop => {
                let value = self.pop_value(op, offset)?;
                match value {
                    StackValue::Expr(expr) => self.emit(Stmt::Expr(expr)),
                    StackValue::Import { .. }
                    | StackValue::Null
                    | StackValue::Unknown
                    | StackValue::SavedLocal(_)
                    | StackValue::CompBuilder(_) => {}
                    other => {
                        if let Some(expr) = self.value_to_expr(other, op, offset)? {
                            self.emit(Stmt::Expr(expr));
                        }
                    }
                }
            }
            Op::RotTwo => self.rotate(2, op, offset)?,
            Op::RotThree => self.rotate(3, op, offset)?,
            Op::RotFour => self.rotate(4, op, offset)?,
            Op::RotN => self.rotate(arg as usize, op, offset)?,
            Op::DupTop => {
                let value = self.pop_value(op, offset)?;
                self.push(value.clone());
                self.push(value);
            }
            Op::DupTopTwo => {
                let b = self.pop_value(op, offset)?;
                let a = self.pop_value(op, offset)?;
                self.push(a.clone());
                self.push(b.clone());
                self.push(a);
                self.push(b);
            }
            Op::DupTopx => {
                let n = arg as usize;
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(self.pop_value(op, offset)?);
                }
                values.reverse();
                for v in &values {
                    self.push(v.clone());
                }
                for v in values {
                    self.push(v);
                }
            }
            Op::Copy => {
                let depth = (arg as usize).saturating_sub(1);
                let value = match self.stack.peek(depth) {
                    Some(v) => v.clone(),
                    None if self.mode == SimMode::Flow => StackValue::Unknown,
                    None => return Err(DecompileError::StackUnderflow { offset, opcode: op }),
                };
                self.push(value);
            }
            Op::Swap => {
                let depth = (arg as usize).saturating_sub(1);
                if self.stack.peek(depth).is_none() {
                    if self.mode == SimMode::Emit {
                        return Err(DecompileError::StackUnderflow { offset, opcode: op });
                    }
                    while self.stack.peek(depth).is_none() {
                        self.stack.absorb_underflow(StackValue::Unknown);
                    }
                }
                let top = self.stack.peek(0).cloned().expect("checked above");
                let other = self.stack.peek(depth).cloned().expect("checked above");
                *self.stack.peek_mut(0).expect("checked") = other;
                *self.stack.peek_mut(depth).expect("checked") = top;
            }
            Op::PushNull => self.push(StackValue::Null),

            // -- stores and deletes
            Op::StoreName | Op::StoreGlobal => {
                let name = self.name(arg, offset)?;
                if op == Op::StoreGlobal {
                    self.globals_used.push(name.clone());
                }
                self.store_target(Expr::Name(name), op, offset, next)?;
            }
            Op::StoreFast => {
                let name = self.var_name(arg, offset)?;
                self.store_target(Expr::Name(name), op, offset, next)?;
            }
            Op::StoreDeref => {
                let name = self.deref_name(arg, offset)?;
                if self.code.free_vars.iter().any(|f| *f == name) {
                    self.nonlocals_used.push(name.clone());
                }
                self.store_target(Expr::Name(name), op, offset, next)?;
            }
            Op::DeleteName | Op::DeleteGlobal => {
                let name = self.name(arg, offset)?;
                if op == Op::DeleteGlobal {
                    self.globals_used.push(name.clone());
                }
                self.emit(Stmt::Delete(vec![Expr::Name(name)]));
            }
            Op::DeleteFast => {
                let name = self.var_name(arg, offset)?;
                self.emit(Stmt::Delete(vec![Expr::Name(name)]));
            }
            Op::DeleteDeref => {
                let name = self.deref_name(arg, offset)?;
                if self.code.free_vars.iter().any(|f| *f == name) {
                    self.nonlocals_used.push(name.clone());
                }
                self.emit(Stmt::Delete(vec![Expr::Name(name)]));
            }
            Op::StoreAttr => {
                let attr = self.name(arg, offset)?;
                let owner = self.pop_expr(op, offset)?;
                let Some(owner) = owner else {
                    let _ = self.pop_value(op, offset)?;
                    return Ok(());
                };
                let target = Expr::Attribute {
                    value: Box::new(owner),
                    attr,
                };
                self.store_target(target, op, offset, next)?;
            }
            Op::DeleteAttr => {
                let attr = self.name(arg, offset)?;
                let owner = self.pop_expr(op, offset)?;
                if let Some(owner) = owner {
                    self.emit(Stmt::Delete(vec![Expr::Attribute {
                        value: Box::new(owner),
                        attr,
                    }]));
                }
            }
            Op::StoreSubscr => {
                let index = self.pop_expr(op, offset)?;
                let container = self.pop_expr(op, offset)?;
                let Some((index, container)) = index.zip(container) else {
                    let _ = self.pop_value(op, offset)?;
                    return Ok(());
                };
                // `x: T` compiles to a store into __annotations__.
                if let (Expr::Name(dict), Expr::Const(Obj::Str(target))) = (&container, &index) {
                    if dict == "__annotations__" {
                        let annotation = self.pop_expr(op, offset)?;
                        if let Some(annotation) = annotation {
                            self.emit(Stmt::AnnAssign {
                                target: Expr::Name(target.clone()),
                                annotation,
                                value: None,
                            });
                        }
                        return Ok(());
                    }
                }
                let target = Expr::Subscript {
                    value: Box::new(container),
                    index: Box::new(index),
                };
                self.store_target(target, op, offset, next)?;
            }
            Op::DeleteSubscr => {
                let index = self.pop_expr(op, offset)?;
                let container = self.pop_expr(op, offset)?;
                if let Some((index, container)) = index.zip(container) {
                    self.emit(Stmt::Delete(vec![Expr::Subscript {
                        value: Box::new(container),
                        index: Box::new(index),
                    }]));
                }
            }
            Op::StoreSlice => {
                let upper = self.pop_expr(op, offset)?;
                let lower = self.pop_expr(op, offset)?;
                let container = self.pop_expr(op, offset)?;
                let Some(((upper, lower), container)) = upper.zip(lower).zip(container) else {
                    let _ = self.pop_value(op, offset)?;
                    return Ok(());
                };
                let target = Expr::Subscript {
                    value: Box::new(container),
                    index: Box::new(slice_expr(Some(lower), Some(upper), None)),
                };
                self.store_target(target, op, offset, next)?;
            }
            Op::StoreAnnotation => {
                let name = self.name(arg, offset)?;
                let annotation = self.pop_expr(op, offset)?;
                if let Some(annotation) = annotation {
                    self.emit(Stmt::AnnAssign {
                        target: Expr::Name(name),
                        annotation,
                        value: None,
                    });
                }
            }

            // -- unpacking
            Op::UnpackSequence => {
                let value = self.pop_expr(op, offset)?;
                self.begin_unpack(arg as usize, None, value);
            }
            Op::UnpackEx => {
                let before = (arg & 0xFF) as usize;
                let after = (arg >> 8) as usize;
                let value = self.pop_expr(op, offset)?;
                self.begin_unpack(before + after + 1, Some(before), value);
            }
            Op::UnpackTuple | Op::UnpackList => {
                let value = self.pop_expr(op, offset)?;
                self.begin_unpack(arg as usize, None, value);
            }

            // -- container construction
            Op::BuildTuple => self.build_display(arg as usize, op, offset, Expr::Tuple)?,
            Op::BuildList => self.build_display(arg as usize, op, offset, Expr::List)?,
            Op::BuildSet => self.build_display(arg as usize, op, offset, Expr::Set)?,
            Op::BuildTupleUnpack | Op::BuildTupleUnpackWithCall => {
                self.build_splat_display(arg as usize, op, offset, Expr::Tuple)?;
            }
            Op::BuildListUnpack => self.build_splat_display(arg as usize, op, offset, Expr::List)?,
            Op::BuildSetUnpack => self.build_splat_display(arg as usize, op, offset, Expr::Set)?,
            Op::BuildMap => {
                let Some(parts) = self.pop_exprs(arg as usize * 2, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                let mut items = Vec::with_capacity(arg as usize);
                let mut iter = parts.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    items.push((Some(key), value));
                }
                self.push_expr(Expr::Dict(items));
            }
            Op::BuildMapUnpack | Op::BuildMapUnpackWithCall => {
                let Some(parts) = self.pop_exprs(arg as usize, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                let mut items = Vec::new();
                for part in parts {
                    match part {
                        Expr::Dict(inner) => items.extend(inner),
                        other => items.push((None, other)),
                    }
                }
                self.push_expr(Expr::Dict(items));
            }
            Op::BuildConstKeyMap => {
                let keys = self.pop_expr(op, offset)?;
                let Some(values) = self.pop_exprs(arg as usize, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                let keys = match keys {
                    Some(Expr::Const(Obj::Tuple(keys))) => keys,
                    Some(Expr::Tuple(keys)) => {
                        let items = keys.into_iter().map(Some).zip(values).collect();
                        self.push_expr(Expr::Dict(items));
                        return Ok(());
                    }
                    _ => {
                        self.push(StackValue::Unknown);
                        return Ok(());
                    }
                };
                let items = keys.into_iter().map(|k| Some(Expr::Const(k))).zip(values).collect();
                self.push_expr(Expr::Dict(items));
            }
            Op::StoreMap => {
                let key = self.pop_expr(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                if let (Some(key), Some(value)) = (key, value) {
                    if let Some(StackValue::Expr(Expr::Dict(items))) = self.stack.peek_mut(0) {
                        items.push((Some(key), value));
                    }
                }
            }
            Op::ListToTuple => {
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.map(|v| match v {
                    Expr::List(items) => Expr::Tuple(items),
                    other => other,
                }));
            }
            Op::ListExtend | Op::SetUpdate => {
                let iterable = self.pop_expr(op, offset)?;
                self.extend_display(arg as usize, iterable, op, offset)?;
            }
            Op::DictUpdate | Op::DictMerge => {
                let mapping = self.pop_expr(op, offset)?;
                let depth = (arg as usize).saturating_sub(1);
                if let (Some(mapping), Some(StackValue::Expr(Expr::Dict(items)))) =
                    (mapping, self.stack.peek_mut(depth))
                {
                    match mapping {
                        Expr::Dict(inner) => items.extend(inner),
                        Expr::Const(Obj::Dict(pairs)) => {
                            items.extend(pairs.into_iter().map(|(k, v)| (Some(Expr::Const(k)), Expr::Const(v))));
                        }
                        other => items.push((None, other)),
                    }
                }
            }
            Op::ListAppend | Op::SetAdd => {
                let value = self.pop_expr(op, offset)?;
                let depth = (arg as usize).saturating_sub(1);
                match self.stack.peek_mut(depth) {
                    Some(StackValue::CompBuilder(builder)) => {
                        if let Some(value) = value {
                            builder.element = Some(Box::new(value));
                        }
                    }
                    Some(StackValue::Expr(Expr::List(items) | Expr::Set(items))) => {
                        if let Some(value) = value {
                            items.push(value);
                        }
                    }
                    _ => {}
                }
            }
            Op::MapAdd => {
                let (key, value) = if self.version.at_least(3, 8) {
                    let value = self.pop_expr(op, offset)?;
                    let key = self.pop_expr(op, offset)?;
                    (key, value)
                } else {
                    let key = self.pop_expr(op, offset)?;
                    let value = self.pop_expr(op, offset)?;
                    (key, value)
                };
                let depth = (arg as usize).saturating_sub(1);
                if let Some(StackValue::CompBuilder(builder)) = self.stack.peek_mut(depth) {
                    if let (Some(key), Some(value)) = (key, value) {
                        builder.element = Some(Box::new(key));
                        builder.value = Some(Box::new(value));
                    }
                }
            }

            // -- f-strings
            Op::FormatValue => {
                let spec = if arg & 0x4 != 0 { self.pop_expr(op, offset)? } else { None };
                let value = self.pop_expr(op, offset)?;
                let conversion = match arg & 0x3 {
                    1 => Some(Conversion::Str),
                    2 => Some(Conversion::Repr),
                    3 => Some(Conversion::Ascii),
                    _ => None,
                };
                self.push_format_field(value, conversion, spec);
            }
            Op::ConvertValue => {
                let value = self.pop_expr(op, offset)?;
                let conversion = match arg {
                    1 => Some(Conversion::Str),
                    2 => Some(Conversion::Repr),
                    3 => Some(Conversion::Ascii),
                    _ => None,
                };
                self.push_format_field(value, conversion, None);
            }
            Op::FormatSimple => {
                let value = self.pop_expr(op, offset)?;
                match value {
                    Some(Expr::FString(parts)) => self.push_expr(Expr::FString(parts)),
                    other => self.push_format_field(other, None, None),
                }
            }
            Op::FormatWithSpec => {
                let spec = self.pop_expr(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                match value {
                    Some(Expr::FString(mut parts)) if parts.len() == 1 => {
                        if let FStringPart::Field { spec: slot, .. } = &mut parts[0] {
                            *slot = spec.map(spec_parts);
                        }
                        self.push_expr(Expr::FString(parts));
                    }
                    other => self.push_format_field(other, None, spec),
                }
            }
            Op::BuildString => {
                let Some(parts) = self.pop_exprs(arg as usize, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                let mut joined: Vec<FStringPart> = Vec::new();
                for part in parts {
                    match part {
                        Expr::FString(inner) => joined.extend(inner),
                        Expr::Const(Obj::Str(text)) => joined.push(FStringPart::Literal(text)),
                        other => joined.push(FStringPart::Field {
                            value: other,
                            conversion: None,
                            spec: None,
                        }),
                    }
                }
                self.push_expr(Expr::FString(joined));
            }

            // -- imports
            Op::ImportName => {
                let module = self.name(arg, offset)?;
                let fromlist_v = self.pop_expr(op, offset)?;
                let level_v = self.pop_expr(op, offset)?;
                let level = match level_v {
                    Some(Expr::Const(Obj::Int(n))) if n >= 0 => n as u32,
                    _ => 0,
                };
                let fromlist = match fromlist_v {
                    Some(Expr::Const(Obj::Tuple(names))) => {
                        names.iter().filter_map(Obj::as_name).collect()
                    }
                    _ => Vec::new(),
                };
                self.push(StackValue::Import {
                    module,
                    level,
                    fromlist,
                    attrs: Vec::new(),
                });
            }
            Op::ImportFrom => {
                let name = self.name(arg, offset)?;
                let module = match self.stack.peek(0) {
                    Some(StackValue::Import { module, .. }) => module.clone(),
                    _ => String::new(),
                };
                self.push(StackValue::ImportFromItem { module, name });
            }
            Op::ImportStar => {
                let value = self.pop_value(op, offset)?;
                if let StackValue::Import { module, level, .. } = value {
                    self.emit(Stmt::ImportFrom {
                        module,
                        names: vec![Alias {
                            name: "*".into(),
                            asname: None,
                        }],
                        level,
                    });
                }
            }

            // -- iteration & generators
            Op::GetAnext => self.push(StackValue::Unknown),
            Op::GetAwaitable => {
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.map(|v| match v {
                    already @ Expr::Await(_) => already,
                    other => Expr::Await(Box::new(other)),
                }));
            }
            Op::YieldValue => {
                let value = self.pop_expr(op, offset)?;
                let expr = value.map(|v| Expr::Yield(Some(Box::new(v)).filter(|b| !b.is_none_const())));
                self.push_maybe(expr);
            }
            Op::YieldFrom => {
                let _sent = self.pop_value(op, offset)?;
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.map(|v| match v {
                    already @ Expr::Await(_) => already,
                    other => Expr::YieldFrom(Box::new(other)),
                }));
            }
            Op::Send => {
                // The send loop is consumed structurally; keep the stack
                // balanced (receiver stays, sent value is replaced by the
                // result).
                let _sent = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
            }
            Op::EndSend => {
                let result = self.pop_value(op, offset)?;
                let receiver = self.pop_value(op, offset)?;
                // The send loop's visible value is the await/yield-from
                // expression itself.
                match receiver {
                    StackValue::Expr(e @ (Expr::Await(_) | Expr::YieldFrom(_))) => self.push_expr(e),
                    _ => self.push(result),
                }
            }
            Op::EndFor => {
                let _ = self.pop_value(op, offset)?;
                if self.version.before(3, 13) {
                    // 3.12's END_FOR pops both iterator and sentinel.
                    let _ = self.pop_value(op, offset)?;
                }
            }
            Op::EndAsyncFor => {
                let _ = self.pop_value(op, offset)?;
                let _ = self.pop_value(op, offset)?;
            }
            Op::AsyncGenWrap => {}
            Op::CleanupThrow => {
                let _ = self.pop_value(op, offset)?;
                let _ = self.pop_value(op, offset)?;
            }

            // -- exception machinery (structural patterns do the rest)
            Op::PushExcInfo => {
                let top = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
                self.push(top);
            }
            Op::PopExcept => {
                // Block-stack op before 3.11 (no value effect there); pops
                // the saved exception on 3.11+.
                if self.version.at_least(3, 11) {
                    let _ = self.pop_value(op, offset)?;
                }
            }
            Op::Reraise | Op::RaiseVarargs => {
                if op == Op::RaiseVarargs {
                    match arg {
                        0 => self.emit(Stmt::Raise { exc: None, cause: None }),
                        1 => {
                            let exc = self.pop_expr(op, offset)?;
                            self.emit(Stmt::Raise { exc, cause: None });
                        }
                        _ => {
                            let cause = self.pop_expr(op, offset)?;
                            let exc = self.pop_expr(op, offset)?;
                            self.emit(Stmt::Raise { exc, cause });
                        }
                    }
                }
            }
            Op::PrepReraiseStar | Op::CallIntrinsic2 => {
                let _ = self.pop_value(op, offset)?;
                let _ = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
            }
            Op::WithExceptStart | Op::WithCleanup | Op::WithCleanupStart => self.push(StackValue::Unknown),
            Op::WithCleanupFinish => {
                let _ = self.pop_value(op, offset)?;
                let _ = self.pop_value(op, offset)?;
            }
            Op::BeginFinally => self.push(StackValue::Null),
            Op::EndFinally | Op::PopFinally | Op::CallFinally => {}
            Op::SetupWith | Op::SetupAsyncWith | Op::BeforeWith | Op::BeforeAsyncWith => {
                // Emission is intercepted by the with pattern; this is the
                // flow-mode stack effect: mgr -> __exit__, __enter__().
                let _mgr = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
                self.push(StackValue::Unknown);
            }
            Op::ExitInitCheck => {
                let _ = self.pop_value(op, offset)?;
            }

            // -- pattern matching (structural patterns do the rest)
            Op::GetLen => {
                let subject = match self.stack.peek(0) {
                    Some(StackValue::Expr(e)) => Some(e.clone()),
                    _ => None,
                };
                self.push_maybe(subject.map(|s| Expr::Call {
                    func: Box::new(Expr::Name("len".into())),
                    args: vec![s],
                    keywords: Vec::new(),
                }));
            }
            Op::MatchMapping | Op::MatchSequence => self.push(StackValue::Unknown),
            Op::MatchKeys => self.push(StackValue::Unknown),
            Op::MatchClass => {
                let _names = self.pop_value(op, offset)?;
                let _cls = self.pop_value(op, offset)?;
                let _subject = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
            }
            Op::CopyDictWithoutKeys => {
                let _keys = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
            }

            // -- function objects, classes, calls
            Op::MakeFunction | Op::MakeClosure => self.make_function(op, arg, offset)?,
            Op::SetFunctionAttribute => self.set_function_attribute(arg, op, offset)?,
            Op::KwNames => {
                let names = self.constant(arg, offset)?;
                self.kw_names = names.as_tuple().map(|items| {
                    items.iter().filter_map(Obj::as_name).collect()
                });
            }
            Op::CallFunction => {
                if self.version.at_least(3, 6) {
                    self.call(arg as usize, Vec::new(), false, op, offset)?;
                } else {
                    let nkw = (arg >> 8) as usize;
                    let npos = (arg & 0xFF) as usize;
                    let keywords = self.pop_legacy_kwargs(nkw, op, offset)?;
                    self.call(npos, keywords, false, op, offset)?;
                }
            }
            Op::CallFunctionKw => {
                if self.version.at_least(3, 6) {
                    let names = match self.pop_expr(op, offset)? {
                        Some(Expr::Const(Obj::Tuple(names))) => {
                            names.iter().filter_map(Obj::as_name).collect::<Vec<_>>()
                        }
                        _ => Vec::new(),
                    };
                    let total = arg as usize;
                    let Some(mut values) = self.pop_exprs(total, op, offset)? else {
                        self.drop_call_protocol(false, op, offset)?;
                        self.push(StackValue::Unknown);
                        return Ok(());
                    };
                    let split = total - names.len().min(total);
                    let kw_values = values.split_off(split);
                    let keywords = names
                        .into_iter()
                        .zip(kw_values)
                        .map(|(name, value)| Keyword {
                            arg: Some(name),
                            value,
                        })
                        .collect();
                    self.call_with_args(values, keywords, false, op, offset)?;
                } else {
                    // Python 2 CALL_FUNCTION_KW: trailing *args iterable.
                    let star = self.pop_expr(op, offset)?;
                    let nkw = (arg >> 8) as usize;
                    let npos = (arg & 0xFF) as usize;
                    let keywords = self.pop_legacy_kwargs(nkw, op, offset)?;
                    let Some(mut args) = self.pop_exprs(npos, op, offset)? else {
                        self.push(StackValue::Unknown);
                        return Ok(());
                    };
                    if let Some(star) = star {
                        args.push(Expr::Starred(Box::new(star)));
                    }
                    self.call_with_args(args, keywords, false, op, offset)?;
                }
            }
            Op::CallFunctionVar | Op::CallFunctionVarKw => {
                let kwargs = if op == Op::CallFunctionVarKw {
                    self.pop_expr(op, offset)?
                } else {
                    None
                };
                let star = self.pop_expr(op, offset)?;
                let nkw = (arg >> 8) as usize;
                let npos = (arg & 0xFF) as usize;
                let mut keywords = self.pop_legacy_kwargs(nkw, op, offset)?;
                if let Some(kwargs) = kwargs {
                    keywords.push(Keyword {
                        arg: None,
                        value: kwargs,
                    });
                }
                let Some(mut args) = self.pop_exprs(npos, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                if let Some(star) = star {
                    args.push(Expr::Starred(Box::new(star)));
                }
                self.call_with_args(args, keywords, false, op, offset)?;
            }
            Op::CallFunctionEx => {
                let kwargs = if arg & 1 != 0 { self.pop_expr(op, offset)? } else { None };
                let args_v = self.pop_expr(op, offset)?;
                let args = match args_v {
                    Some(Expr::Tuple(items)) => items,
                    Some(Expr::Const(Obj::Tuple(items))) => items.into_iter().map(Expr::Const).collect(),
                    Some(other) => vec![Expr::Starred(Box::new(other))],
                    None => Vec::new(),
                };
                let mut keywords = Vec::new();
                if let Some(kwargs) = kwargs {
                    match kwargs {
                        Expr::Dict(items) => {
                            for (key, value) in items {
                                match key {
                                    Some(Expr::Const(Obj::Str(name))) => keywords.push(Keyword {
                                        arg: Some(name),
                                        value,
                                    }),
                                    _ => keywords.push(Keyword { arg: None, value }),
                                }
                            }
                        }
                        other => keywords.push(Keyword { arg: None, value: other }),
                    }
                }
                self.call_with_args(args, keywords, self.version.at_least(3, 11), op, offset)?;
            }
            Op::Call => {
                let keywords_names = self.kw_names.take().unwrap_or_default();
                self.call_with_kwnames(arg as usize, keywords_names, op, offset)?;
            }
            Op::CallKw => {
                let names = match self.pop_expr(op, offset)? {
                    Some(Expr::Const(Obj::Tuple(names))) => {
                        names.iter().filter_map(Obj::as_name).collect::<Vec<_>>()
                    }
                    _ => Vec::new(),
                };
                self.call_with_kwnames(arg as usize, names, op, offset)?;
            }
            Op::CallMethod => {
                self.call(arg as usize, Vec::new(), true, op, offset)?;
            }
            Op::CallIntrinsic1 => self.call_intrinsic_1(arg, op, offset)?,

            // -- returns, prints, exec
            Op::ReturnValue => {
                let value = self.pop_expr(op, offset)?;
                self.emit(Stmt::Return(value));
            }
            Op::PrintExpr => {
                let value = self.pop_expr(op, offset)?;
                if let Some(value) = value {
                    self.emit(Stmt::Expr(value));
                }
            }
            Op::PrintItem => {
                if let Some(value) = self.pop_expr(op, offset)? {
                    self.print_items.push(value);
                }
            }
            Op::PrintNewline => {
                let args = std::mem::take(&mut self.print_items);
                self.emit(Stmt::Expr(Expr::Call {
                    func: Box::new(Expr::Name("print".into())),
                    args,
                    keywords: Vec::new(),
                }));
            }
            Op::PrintItemTo | Op::PrintNewlineTo => {
                let _stream = self.pop_value(op, offset)?;
                if op == Op::PrintNewlineTo {
                    let args = std::mem::take(&mut self.print_items);
                    self.emit(Stmt::Expr(Expr::Call {
                        func: Box::new(Expr::Name("print".into())),
                        args,
                        keywords: Vec::new(),
                    }));
                }
            }
            Op::ExecStmt => {
                let locals = self.pop_expr(op, offset)?;
                let globals = self.pop_expr(op, offset)?;
                let source = self.pop_expr(op, offset)?;
                if let Some(source) = source {
                    let mut args = vec![source];
                    if let Some(globals) = globals.filter(|g| !g.is_none_const()) {
                        args.push(globals);
                        if let Some(locals) = locals.filter(|l| !l.is_none_const()) {
                            args.push(locals);
                        }
                    }
                    self.emit(Stmt::Expr(Expr::Call {
                        func: Box::new(Expr::Name("exec".into())),
                        args,
                        keywords: Vec::new(),
                    }));
                }
            }
            Op::BuildClass => {
                // Python 2: pops methods dict, bases tuple, name.
                let _methods = self.pop_value(op, offset)?;
                let _bases = self.pop_value(op, offset)?;
                let _name = self.pop_value(op, offset)?;
                self.push(StackValue::Unknown);
            }

            Op::ExtendedArg => {
                // Folded into the following instruction by the decoder.
            }

            // Specialized forms are despecialized during decode.
            other => {
                return Err(DecompileError::MalformedBytecode {
                    offset,
                    reason: format!("unexpected opcode {other} in simulation"),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator helpers
    // ------------------------------------------------------------------

    fn unary(&mut self, op_kind: UnaryOp, op: Opcode, offset: u32) -> DecompileResult<()> {
        let operand = self.pop_expr(op, offset)?;
        self.push_maybe(operand.map(|operand| Expr::UnaryOp {
            op: op_kind,
            operand: Box::new(operand),
        }));
        Ok(())
    }

    fn binary(&mut self, op_kind: BinOp, inplace: bool, op: Opcode, offset: u32) -> DecompileResult<()> {
        let right = self.pop_expr(op, offset)?;
        let left = self.pop_expr(op, offset)?;
        let Some((left, right)) = left.zip(right) else {
            self.push(StackValue::Unknown);
            return Ok(());
        };
        if inplace {
            self.pending_inplace = Some((left.clone(), op_kind));
        }
        self.push_expr(Expr::BinOp {
            left: Box::new(left),
            op: op_kind,
            right: Box::new(right),
        });
        Ok(())
    }

    fn compare(&mut self, cmp: CmpOp, op: Opcode, offset: u32) -> DecompileResult<()> {
        let right = self.pop_expr(op, offset)?;
        let left = self.pop_expr(op, offset)?;
        self.push_maybe(left.zip(right).map(|(left, right)| Expr::Compare {
            left: Box::new(left),
            ops: vec![cmp],
            comparators: vec![right],
        }));
        Ok(())
    }

    fn rotate(&mut self, n: usize, op: Opcode, offset: u32) -> DecompileResult<()> {
        if n < 2 {
            return Ok(());
        }
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop_value(op, offset)?);
        }
        // values[0] is old TOS; it moves to the bottom of the rotated run.
        let top = values.remove(0);
        values.reverse();
        self.push(top);
        for v in values {
            self.push(v);
        }
        Ok(())
    }

    fn pop_legacy_slice_bounds(
        &mut self,
        op: Opcode,
        offset: u32,
    ) -> DecompileResult<(Option<Expr>, Option<Expr>)> {
        // SLICE+0: no bounds; +1: lower; +2: upper; +3: both.
        let variant = match op {
            Opcode::SlicePlus1 | Opcode::StoreSlicePlus1 | Opcode::DeleteSlicePlus1 => 1,
            Opcode::SlicePlus2 | Opcode::StoreSlicePlus2 | Opcode::DeleteSlicePlus2 => 2,
            Opcode::SlicePlus3 | Opcode::StoreSlicePlus3 | Opcode::DeleteSlicePlus3 => 3,
            _ => 0,
        };
        let upper = if variant & 2 != 0 { self.pop_expr(op, offset)? } else { None };
        let lower = if variant & 1 != 0 { self.pop_expr(op, offset)? } else { None };
        Ok((lower, upper))
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    /// Routes a popped value into an assignment-like statement for
    /// `target`.
    fn store_target(
        &mut self,
        target: Expr,
        op: Opcode,
        offset: u32,
        next: Option<&Instruction>,
    ) -> DecompileResult<()> {
        let value = self.pop_value(op, offset)?;
        match value {
            StackValue::Expr(expr) => Ok(self.store_expr(target, expr, next)),
            StackValue::Function(meta) => {
                if self.mode == SimMode::Emit {
                    if meta.code.is_lambda() {
                        let lambda = self.hook.lambda(&meta)?;
                        self.store_expr(target, lambda, next);
                    } else {
                        let name = match &target {
                            Expr::Name(n) => n.clone(),
                            _ => meta.code.name.clone(),
                        };
                        let stmt = self.hook.function_def(&meta, name)?;
                        self.stmts.push(stmt);
                    }
                }
                Ok(())
            }
            StackValue::Class(meta) => {
                if self.mode == SimMode::Emit {
                    let name = match &target {
                        Expr::Name(n) => n.clone(),
                        _ => meta.name.clone(),
                    };
                    let stmt = self.hook.class_def(&meta, name)?;
                    self.stmts.push(stmt);
                }
                Ok(())
            }
            StackValue::Import {
                module,
                level,
                attrs,
                ..
            } => {
                let full: String = if attrs.is_empty() {
                    module.clone()
                } else {
                    let mut parts = vec![module.split('.').next().unwrap_or(&module).to_owned()];
                    parts.extend(attrs.iter().cloned());
                    parts.join(".")
                };
                let target_name = match &target {
                    Expr::Name(n) => n.clone(),
                    _ => String::new(),
                };
                let root = module.split('.').next().unwrap_or(&module);
                let alias = if attrs.is_empty() && target_name == root {
                    Alias {
                        name: module,
                        asname: None,
                    }
                } else {
                    Alias {
                        name: full,
                        asname: Some(target_name),
                    }
                };
                let _ = level;
                self.emit(Stmt::Import(vec![alias]));
                Ok(())
            }
            StackValue::ImportFromItem { module, name } => {
                let target_name = match &target {
                    Expr::Name(n) => n.clone(),
                    _ => name.clone(),
                };
                let level_of = |stack: &StackState| -> u32 {
                    match stack.peek(0) {
                        Some(StackValue::Import { level, .. }) => *level,
                        _ => 0,
                    }
                };
                let level = level_of(&self.stack);
                self.emit(Stmt::ImportFrom {
                    module,
                    names: vec![Alias {
                        asname: (target_name != name).then_some(target_name),
                        name,
                    }],
                    level,
                });
                Ok(())
            }
            StackValue::Unpack { group, index } => {
                self.record_unpack_target(group, index, target);
                Ok(())
            }
            // PEP 709 epilogue: restoring the saved local is protocol
            // noise, not an assignment.
            StackValue::SavedLocal(_) => Ok(()),
            StackValue::Unknown if self.mode == SimMode::Flow => Ok(()),
            _ => Err(DecompileError::NotAnExpression { opcode: op, offset }),
        }
    }

    /// Plain expression store with AugAssign, chain, and walrus folding.
    fn store_expr(&mut self, target: Expr, value: Expr, next: Option<&Instruction>) {
        // In-place op feeding a store of its left operand: `x += y`.
        if let Some((lhs, op_kind)) = self.pending_inplace.take() {
            if lhs == target {
                if let Expr::BinOp { left, op: bop, right } = &value {
                    if **left == target && *bop == op_kind {
                        self.emit(Stmt::AugAssign {
                            target,
                            op: op_kind,
                            value: (**right).clone(),
                        });
                        self.chain_value = None;
                        return;
                    }
                }
            }
        }

        let twin_on_top = matches!(self.stack.peek(0), Some(StackValue::Expr(top)) if *top == value);
        if twin_on_top {
            // Duplicated value still on the stack. If the next
            // instruction consumes it as an expression this is a walrus;
            // if it stores again it is an assignment chain.
            let next_is_store = next.map_or(false, |n| {
                matches!(
                    n.opcode,
                    Opcode::StoreName
                        | Opcode::StoreFast
                        | Opcode::StoreGlobal
                        | Opcode::StoreDeref
                        | Opcode::DupTop
                        | Opcode::Copy
                )
            });
            if next_is_store || next.is_none() {
                self.emit(Stmt::Assign {
                    targets: vec![target],
                    value: value.clone(),
                });
                self.chain_value = Some(value);
                return;
            }
            // Walrus: fold into the twin.
            if self.mode == SimMode::Emit {
                if let Some(slot) = self.stack.peek_mut(0) {
                    *slot = StackValue::Expr(Expr::NamedExpr {
                        target: Box::new(target),
                        value: Box::new(value),
                    });
                }
            }
            self.chain_value = None;
            return;
        }

        // Continuation of `a = b = x`: the twin was just popped.
        if self.chain_value.as_ref() == Some(&value) {
            if let Some(Stmt::Assign { targets, value: prev }) = self.stmts.last_mut() {
                if *prev == value {
                    targets.push(target);
                    if !matches!(self.stack.peek(0), Some(StackValue::Expr(top)) if *top == value) {
                        self.chain_value = None;
                    }
                    return;
                }
            }
            self.chain_value = None;
        }

        self.emit(Stmt::Assign {
            targets: vec![target],
            value,
        });
    }

    fn begin_unpack(&mut self, count: usize, star_index: Option<usize>, value: Option<Expr>) {
        let Some(value) = value else {
            for _ in 0..count {
                self.push(StackValue::Unknown);
            }
            return;
        };
        let group = self.unpacks.len();
        self.unpacks.push(UnpackGroup {
            targets: vec![None; count],
            star_index,
            value,
            remaining: count,
        });
        for index in (0..count).rev() {
            self.push(StackValue::Unpack { group, index });
        }
    }

    fn record_unpack_target(&mut self, group: usize, index: usize, target: Expr) {
        let Some(slot) = self.unpacks.get_mut(group) else { return };
        let star_index = slot.star_index;
        let wrapped = if star_index == Some(index) {
            Expr::Starred(Box::new(target))
        } else {
            target
        };
        if slot.targets[index].is_none() {
            slot.targets[index] = Some(wrapped);
            slot.remaining -= 1;
        }
        if slot.remaining == 0 {
            let targets: Vec<Expr> = slot.targets.iter().flatten().cloned().collect();
            let value = slot.value.clone();
            self.emit(Stmt::Assign {
                targets: vec![Expr::Tuple(targets)],
                value,
            });
        }
    }

    // ------------------------------------------------------------------
    // Displays
    // ------------------------------------------------------------------

    fn build_display(
        &mut self,
        count: usize,
        op: Opcode,
        offset: u32,
        wrap: impl FnOnce(Vec<Expr>) -> Expr,
    ) -> DecompileResult<()> {
        // An empty BUILD_LIST/SET/MAP immediately ahead of a loop that
        // appends into it is a comprehension accumulator; the for-pattern
        // converts the display into a builder when it fires, so a plain
        // display is the right default here.
        let Some(items) = self.pop_exprs(count, op, offset)? else {
            self.push(StackValue::Unknown);
            return Ok(());
        };
        self.push_expr(wrap(items));
        Ok(())
    }

    fn build_splat_display(
        &mut self,
        count: usize,
        op: Opcode,
        offset: u32,
        wrap: impl FnOnce(Vec<Expr>) -> Expr,
    ) -> DecompileResult<()> {
        let Some(parts) = self.pop_exprs(count, op, offset)? else {
            self.push(StackValue::Unknown);
            return Ok(());
        };
        let mut items = Vec::new();
        for part in parts {
            match part {
                Expr::Tuple(inner) | Expr::List(inner) => items.extend(inner),
                Expr::Const(Obj::Tuple(inner)) => items.extend(inner.into_iter().map(Expr::Const)),
                other => items.push(Expr::Starred(Box::new(other))),
            }
        }
        self.push_expr(wrap(items));
        Ok(())
    }

    fn extend_display(
        &mut self,
        depth_arg: usize,
        iterable: Option<Expr>,
        _op: Opcode,
        _offset: u32,
    ) -> DecompileResult<()> {
        let depth = depth_arg.saturating_sub(1);
        let Some(StackValue::Expr(Expr::List(items) | Expr::Set(items))) = self.stack.peek_mut(depth) else {
            return Ok(());
        };
        match iterable {
            Some(Expr::Const(Obj::Tuple(inner))) => items.extend(inner.into_iter().map(Expr::Const)),
            Some(Expr::Tuple(inner) | Expr::List(inner)) => items.extend(inner),
            Some(other) => items.push(Expr::Starred(Box::new(other))),
            None => items.push(Expr::Starred(Box::new(Expr::Name(String::new())))),
        }
        Ok(())
    }

    fn push_format_field(&mut self, value: Option<Expr>, conversion: Option<Conversion>, spec: Option<Expr>) {
        self.push_maybe(value.map(|value| {
            Expr::FString(vec![FStringPart::Field {
                value,
                conversion,
                spec: spec.map(spec_parts),
            }])
        }));
    }

    // ------------------------------------------------------------------
    // Functions and calls
    // ------------------------------------------------------------------

    fn make_function(&mut self, op: Opcode, arg: u32, offset: u32) -> DecompileResult<()> {
        let v = self.version;
        // 3.3-3.10 push a qualname above the code object.
        let code = if v.at_least(3, 3) && v.before(3, 11) {
            let _qualname = self.pop_value(op, offset)?;
            self.pop_value(op, offset)?
        } else {
            self.pop_value(op, offset)?
        };
        let StackValue::Code(code) = code else {
            // Flow mode over merged stacks may have lost the code object.
            if self.mode == SimMode::Flow {
                self.push(StackValue::Unknown);
                return Ok(());
            }
            return Err(DecompileError::NotAnExpression { opcode: op, offset });
        };
        let mut meta = FnMeta::new(code);

        if v.at_least(3, 13) {
            // Attributes arrive via SET_FUNCTION_ATTRIBUTE.
        } else if v.at_least(3, 6) {
            if arg & 0x08 != 0 {
                let _closure = self.pop_value(op, offset)?;
                meta.has_closure = true;
            }
            if arg & 0x04 != 0 {
                let annotations = self.pop_expr(op, offset)?;
                meta.annotations = annotations.map(annotation_pairs).unwrap_or_default();
            }
            if arg & 0x02 != 0 {
                let kw_defaults = self.pop_expr(op, offset)?;
                meta.kw_defaults = kw_defaults.map(dict_pairs).unwrap_or_default();
            }
            if arg & 0x01 != 0 {
                let defaults = self.pop_expr(op, offset)?;
                meta.defaults = defaults.map(tuple_items).unwrap_or_default();
            }
        } else if v.at_least(3, 0) {
            let ndefaults = (arg & 0xFF) as usize;
            let nkw = ((arg >> 8) & 0xFF) as usize;
            let nann = (arg >> 16) as usize;
            if nann > 0 {
                let names = self.pop_expr(op, offset)?;
                let Some(values) = self.pop_exprs(nann - 1, op, offset)? else {
                    self.push(StackValue::Unknown);
                    return Ok(());
                };
                if let Some(Expr::Const(Obj::Tuple(names))) = names {
                    meta.annotations = names
                        .iter()
                        .filter_map(Obj::as_name)
                        .zip(values)
                        .collect();
                }
            }
            for _ in 0..nkw {
                let value = self.pop_expr(op, offset)?;
                let name = self.pop_expr(op, offset)?;
                if let (Some(Expr::Const(Obj::Str(name))), Some(value)) = (name, value) {
                    meta.kw_defaults.push((name, value));
                }
            }
            let Some(defaults) = self.pop_exprs(ndefaults, op, offset)? else {
                self.push(StackValue::Unknown);
                return Ok(());
            };
            meta.defaults = defaults;
        } else {
            // Python 2: MAKE_FUNCTION pops positional defaults;
            // MAKE_CLOSURE also pops the closure tuple.
            if op == Opcode::MakeClosure {
                let _closure = self.pop_value(op, offset)?;
                meta.has_closure = true;
            }
            let Some(defaults) = self.pop_exprs(arg as usize, op, offset)? else {
                self.push(StackValue::Unknown);
                return Ok(());
            };
            meta.defaults = defaults;
        }

        self.push(StackValue::Function(meta));
        Ok(())
    }

    fn set_function_attribute(&mut self, arg: u32, op: Opcode, offset: u32) -> DecompileResult<()> {
        let func = self.pop_value(op, offset)?;
        let value = self.pop_value(op, offset)?;
        let StackValue::Function(mut meta) = func else {
            self.push(StackValue::Unknown);
            return Ok(());
        };
        let value_expr = self.value_to_expr(value, op, offset)?;
        match arg {
            0x01 => meta.defaults = value_expr.map(tuple_items).unwrap_or_default(),
            0x02 => meta.kw_defaults = value_expr.map(dict_pairs).unwrap_or_default(),
            0x04 => meta.annotations = value_expr.map(annotation_pairs).unwrap_or_default(),
            0x08 => meta.has_closure = true,
            _ => {}
        }
        self.push(StackValue::Function(meta));
        Ok(())
    }

    /// CALL/CALL_KW on 3.11+: pops args, then the null/self pair.
    fn call_with_kwnames(
        &mut self,
        argc: usize,
        names: Vec<String>,
        op: Opcode,
        offset: u32,
    ) -> DecompileResult<()> {
        let mut values = Vec::with_capacity(argc);
        for _ in 0..argc {
            values.push(self.pop_value(op, offset)?);
        }
        values.reverse();
        let split = argc - names.len().min(argc);
        let kw_values = values.split_off(split);
        let mut keywords = Vec::with_capacity(kw_values.len());
        for (name, value) in names.into_iter().zip(kw_values) {
            let Some(value) = self.value_to_expr(value, op, offset)? else {
                self.drop_call_protocol(true, op, offset)?;
                self.push(StackValue::Unknown);
                return Ok(());
            };
            keywords.push(Keyword {
                arg: Some(name),
                value,
            });
        }
        self.finish_call(values, keywords, true, op, offset)
    }

    /// Pre-3.11 call: pops `argc` values then the callable (plus the
    /// method pair when `null_pair`).
    fn call(
        &mut self,
        argc: usize,
        keywords: Vec<Keyword>,
        null_pair: bool,
        op: Opcode,
        offset: u32,
    ) -> DecompileResult<()> {
        let mut values = Vec::with_capacity(argc);
        for _ in 0..argc {
            values.push(self.pop_value(op, offset)?);
        }
        values.reverse();
        self.finish_call(values, keywords, null_pair, op, offset)
    }

    fn call_with_args(
        &mut self,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
        null_pair: bool,
        op: Opcode,
        offset: u32,
    ) -> DecompileResult<()> {
        let values = args.into_iter().map(StackValue::Expr).collect();
        self.finish_call(values, keywords, null_pair, op, offset)
    }

    fn drop_call_protocol(&mut self, null_pair: bool, op: Opcode, offset: u32) -> DecompileResult<()> {
        let _callable = self.pop_value(op, offset)?;
        if null_pair {
            let _null = self.pop_value(op, offset)?;
        }
        Ok(())
    }

    /// Shared tail of every call convention: resolve the callable, apply
    /// the special cases (class creation, decorators, comprehensions,
    /// lambdas), and push the result.
    fn finish_call(
        &mut self,
        arg_values: Vec<StackValue>,
        keywords: Vec<Keyword>,
        null_pair: bool,
        op: Opcode,
        offset: u32,
    ) -> DecompileResult<()> {
        let callee = if null_pair {
            let x = self.pop_value(op, offset)?;
            let y = self.pop_value(op, offset)?;
            match (x, y) {
                (StackValue::Null, f) | (f, StackValue::Null) => f,
                (f, StackValue::Unknown) | (StackValue::Unknown, f) if self.mode == SimMode::Flow => f,
                (f, other) => {
                    // Bound-method protocol: `other` is the receiver the
                    // attribute load left behind; the callable wins.
                    let _ = other;
                    f
                }
            }
        } else {
            self.pop_value(op, offset)?
        };

        // __build_class__(<body fn>, name, *bases, **kwds) -> class.
        if let StackValue::Expr(Expr::Name(name)) = &callee {
            if name == "__build_class__" {
                if let Some(StackValue::Function(body)) = arg_values.first().cloned() {
                    let cls_name = match arg_values.get(1) {
                        Some(StackValue::Expr(Expr::Const(Obj::Str(n)))) => n.clone(),
                        _ => body.code.name.clone(),
                    };
                    let mut bases = Vec::new();
                    for value in arg_values.into_iter().skip(2) {
                        match self.value_to_expr(value, op, offset)? {
                            Some(expr) => bases.push(expr),
                            None => {
                                self.push(StackValue::Unknown);
                                return Ok(());
                            }
                        }
                    }
                    self.push(StackValue::Class(ClsMeta {
                        body,
                        name: cls_name,
                        bases,
                        keywords,
                        decorators: Vec::new(),
                    }));
                    return Ok(());
                }
            }
        }

        // A comprehension's code object called with its iterable.
        if let StackValue::Function(meta) = &callee {
            if meta.code.is_comprehension() && arg_values.len() == 1 && keywords.is_empty() {
                if self.mode == SimMode::Flow {
                    self.push(StackValue::Unknown);
                    return Ok(());
                }
                let iterable = arg_values
                    .into_iter()
                    .next()
                    .expect("len checked")
                    .into_expr(op, offset)?;
                let comp = self.hook.comprehension(&meta.code.clone(), iterable)?;
                self.push_expr(comp);
                return Ok(());
            }
        }

        // Decorator application: callee(<fresh function or class>).
        if arg_values.len() == 1 && keywords.is_empty() {
            match (&callee, &arg_values[0]) {
                (StackValue::Expr(dec), StackValue::Function(meta)) if !meta.code.is_lambda() => {
                    let mut meta = meta.clone();
                    meta.decorators.push(dec.clone());
                    self.push(StackValue::Function(meta));
                    return Ok(());
                }
                (StackValue::Expr(dec), StackValue::Class(meta)) => {
                    let mut meta = meta.clone();
                    meta.decorators.push(dec.clone());
                    self.push(StackValue::Class(meta));
                    return Ok(());
                }
                _ => {}
            }
        }

        let Some(func) = self.value_to_expr(callee, op, offset)? else {
            self.push(StackValue::Unknown);
            return Ok(());
        };
        let mut args = Vec::with_capacity(arg_values.len());
        for value in arg_values {
            match self.value_to_expr(value, op, offset)? {
                Some(expr) => args.push(expr),
                None => {
                    self.push(StackValue::Unknown);
                    return Ok(());
                }
            }
        }
        self.push_expr(Expr::Call {
            func: Box::new(func),
            args,
            keywords,
        });
        Ok(())
    }

    fn pop_legacy_kwargs(&mut self, nkw: usize, op: Opcode, offset: u32) -> DecompileResult<Vec<Keyword>> {
        let mut keywords = Vec::with_capacity(nkw);
        for _ in 0..nkw {
            let value = self.pop_expr(op, offset)?;
            let name = self.pop_expr(op, offset)?;
            if let (Some(Expr::Const(Obj::Str(name))), Some(value)) = (name, value) {
                keywords.push(Keyword {
                    arg: Some(name),
                    value,
                });
            }
        }
        keywords.reverse();
        Ok(keywords)
    }

    fn call_intrinsic_1(&mut self, arg: u32, op: Opcode, offset: u32) -> DecompileResult<()> {
        match arg {
            // INTRINSIC_IMPORT_STAR
            2 => {
                let value = self.pop_value(op, offset)?;
                if let StackValue::Import { module, level, .. } = value {
                    self.emit(Stmt::ImportFrom {
                        module,
                        names: vec![Alias {
                            name: "*".into(),
                            asname: None,
                        }],
                        level,
                    });
                }
                self.push(StackValue::Expr(Expr::none()));
            }
            // INTRINSIC_UNARY_POSITIVE
            5 => self.unary(UnaryOp::UAdd, op, offset)?,
            // INTRINSIC_LIST_TO_TUPLE
            6 => {
                let value = self.pop_expr(op, offset)?;
                self.push_maybe(value.map(|v| match v {
                    Expr::List(items) => Expr::Tuple(items),
                    other => other,
                }));
            }
            // INTRINSIC_TYPEVAR / PARAMSPEC / TYPEVARTUPLE
            7 | 8 | 9 => {
                let name = self.pop_expr(op, offset)?;
                let kind = match arg {
                    8 => TypeParamKind::ParamSpec,
                    9 => TypeParamKind::TypeVarTuple,
                    _ => TypeParamKind::TypeVar,
                };
                match name {
                    Some(Expr::Const(Obj::Str(name))) => self.push(StackValue::TypeParam(TypeParam {
                        name,
                        kind,
                        bound: None,
                    })),
                    _ => self.push(StackValue::Unknown),
                }
            }
            // INTRINSIC_TYPEALIAS: (name, type_params, value) tuple.
            11 => {
                let value = self.pop_expr(op, offset)?;
                if let Some(Expr::Tuple(mut parts)) = value {
                    if parts.len() == 3 {
                        let alias_value = parts.pop().expect("len 3");
                        let _params = parts.pop();
                        if let Some(Expr::Const(Obj::Str(name))) = parts.pop() {
                            self.emit(Stmt::TypeAlias {
                                name,
                                type_params: Vec::new(),
                                value: alias_value,
                            });
                        }
                    }
                }
                self.push(StackValue::Expr(Expr::none()));
            }
            _ => {
                let value = self.pop_value(op, offset)?;
                self.push(value);
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

fn slice_expr(lower: Option<Expr>, upper: Option<Expr>, step: Option<Expr>) -> Expr {
    Expr::Slice {
        lower: lower.map(Box::new),
        upper: upper.map(Box::new),
        step: step.map(Box::new),
    }
}

fn binop_ast(kind: BinaryOpKind) -> BinOp {
    match kind {
        BinaryOpKind::Add => BinOp::Add,
        BinaryOpKind::And => BinOp::BitAnd,
        BinaryOpKind::FloorDivide => BinOp::FloorDiv,
        BinaryOpKind::Lshift => BinOp::LShift,
        BinaryOpKind::MatrixMultiply => BinOp::MatMult,
        BinaryOpKind::Multiply => BinOp::Mult,
        BinaryOpKind::Remainder => BinOp::Mod,
        BinaryOpKind::Or => BinOp::BitOr,
        BinaryOpKind::Power => BinOp::Pow,
        BinaryOpKind::Rshift => BinOp::RShift,
        BinaryOpKind::Subtract => BinOp::Sub,
        BinaryOpKind::TrueDivide => BinOp::Div,
        BinaryOpKind::Xor => BinOp::BitXor,
    }
}

/// Items of a defaults tuple, whether a display or a folded constant.
fn tuple_items(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::Tuple(items) => items,
        Expr::Const(Obj::Tuple(items)) => items.into_iter().map(Expr::Const).collect(),
        other => vec![other],
    }
}

/// `{name: value}` pairs from a kw-defaults dict display.
fn dict_pairs(expr: Expr) -> Vec<(String, Expr)> {
    match expr {
        Expr::Dict(items) => items
            .into_iter()
            .filter_map(|(key, value)| match key {
                Some(Expr::Const(Obj::Str(name))) => Some((name, value)),
                _ => None,
            })
            .collect(),
        Expr::Const(Obj::Dict(pairs)) => pairs
            .into_iter()
            .filter_map(|(k, v)| k.as_name().map(|name| (name, Expr::Const(v))))
            .collect(),
        _ => Vec::new(),
    }
}

/// Annotation pairs from either the dict (pre-3.10) or interleaved tuple
/// (3.10+) encoding.
fn annotation_pairs(expr: Expr) -> Vec<(String, Expr)> {
    match expr {
        Expr::Dict(_) | Expr::Const(Obj::Dict(_)) => dict_pairs(expr),
        Expr::Tuple(items) => {
            let mut out = Vec::new();
            let mut iter = items.into_iter();
            while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
                if let Expr::Const(Obj::Str(name)) = name {
                    out.push((name, value));
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Format-spec expression into f-string parts.
fn spec_parts(spec: Expr) -> Vec<FStringPart> {
    match spec {
        Expr::Const(Obj::Str(text)) => vec![FStringPart::Literal(text)],
        Expr::FString(parts) => parts,
        other => vec![FStringPart::Field {
            value: other,
            conversion: None,
            spec: None,
        }],
    }
}

/// Turns a one-element `BoolOp` back into its sole value while building
/// short-circuit chains.
pub fn bool_join(op: BoolOpKind, mut values: Vec<Expr>) -> Expr {
    // Flatten same-op nesting as we join.
    let mut flat = Vec::with_capacity(values.len());
    for value in values.drain(..) {
        match value {
            Expr::BoolOp { op: inner, values: vs } if inner == op => flat.extend(vs),
            other => flat.push(other),
        }
    }
    if flat.len() == 1 {
        flat.pop().expect("one element")
    } else {
        Expr::BoolOp { op, values: flat }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::decode_code;

    const V39: PyVersion = PyVersion::new(3, 9);

    fn code_with(consts: Vec<Obj>, names: Vec<&str>, var_names: Vec<&str>, bytecode: Vec<u8>) -> CodeObject {
        CodeObject {
            arg_count: 0,
            pos_only_arg_count: 0,
            kw_only_arg_count: 0,
            n_locals: var_names.len() as u32,
            stack_size: 8,
            flags: 0,
            code: bytecode,
            consts,
            names: names.into_iter().map(str::to_owned).collect(),
            var_names: var_names.into_iter().map(str::to_owned).collect(),
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

    fn run(code: &CodeObject) -> (StackState, Vec<Stmt>) {
        let instrs = decode_code(&code.code, V39).unwrap();
        let hook = NoNesting;
        let mut sim = Simulator::new(code, V39, SimMode::Emit, &hook, StackState::new());
        sim.run(&instrs).unwrap();
        let stmts = sim.take_stmts();
        (sim.stack, stmts)
    }

    #[test]
    fn test_binop_expression() {
        // LOAD_NAME a; LOAD_NAME b; BINARY_ADD
        let code = code_with(vec![], vec!["a", "b"], vec![], vec![101, 0, 101, 1, 23, 0]);
        let (stack, stmts) = run(&code);
        assert!(stmts.is_empty());
        assert_eq!(
            stack.peek(0),
            Some(&StackValue::Expr(Expr::BinOp {
                left: Box::new(Expr::Name("a".into())),
                op: BinOp::Add,
                right: Box::new(Expr::Name("b".into())),
            }))
        );
    }

    #[test]
    fn test_store_emits_assign() {
        // LOAD_CONST 1; STORE_NAME x
        let code = code_with(vec![Obj::Int(1)], vec!["x"], vec![], vec![100, 0, 90, 0]);
        let (stack, stmts) = run(&code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                targets: vec![Expr::Name("x".into())],
                value: Expr::Const(Obj::Int(1)),
            }]
        );
    }

    #[test]
    fn test_chained_assignment_via_dup() {
        // LOAD_CONST 1; DUP_TOP; STORE_NAME a; STORE_NAME b
        let code = code_with(vec![Obj::Int(1)], vec!["a", "b"], vec![], vec![100, 0, 4, 0, 90, 0, 90, 1]);
        let (stack, stmts) = run(&code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                targets: vec![Expr::Name("a".into()), Expr::Name("b".into())],
                value: Expr::Const(Obj::Int(1)),
            }]
        );
    }

    #[test]
    fn test_augmented_assignment() {
        // LOAD_NAME t; LOAD_NAME x; INPLACE_ADD; STORE_NAME t
        let code = code_with(vec![], vec!["t", "x"], vec![], vec![101, 0, 101, 1, 55, 0, 90, 0]);
        let (_, stmts) = run(&code);
        assert_eq!(
            stmts,
            vec![Stmt::AugAssign {
                target: Expr::Name("t".into()),
                op: BinOp::Add,
                value: Expr::Name("x".into()),
            }]
        );
    }

    #[test]
    fn test_call_with_args() {
        // LOAD_NAME f; LOAD_CONST 1; LOAD_CONST 2; CALL_FUNCTION 2; POP_TOP
        let code = code_with(
            vec![Obj::Int(1), Obj::Int(2)],
            vec!["f"],
            vec![],
            vec![101, 0, 100, 0, 100, 1, 131, 2, 1, 0],
        );
        let (stack, stmts) = run(&code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![Stmt::Expr(Expr::Call {
                func: Box::new(Expr::Name("f".into())),
                args: vec![Expr::Const(Obj::Int(1)), Expr::Const(Obj::Int(2))],
                keywords: Vec::new(),
            })]
        );
    }

    #[test]
    fn test_unpack_assignment() {
        // LOAD_NAME pair; UNPACK_SEQUENCE 2; STORE_NAME a; STORE_NAME b
        let code = code_with(vec![], vec!["pair", "a", "b"], vec![], vec![101, 0, 92, 2, 90, 1, 90, 2]);
        let (stack, stmts) = run(&code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![Stmt::Assign {
                targets: vec![Expr::Tuple(vec![Expr::Name("a".into()), Expr::Name("b".into())])],
                value: Expr::Name("pair".into()),
            }]
        );
    }

    #[test]
    fn test_import_from() {
        // 3.9 `from os import path as p`:
        // LOAD_CONST 0 (0); LOAD_CONST 1 (('path',)); IMPORT_NAME os;
        // IMPORT_FROM path; STORE_NAME p; POP_TOP
        let code = code_with(
            vec![Obj::Int(0), Obj::Tuple(vec![Obj::Str("path".into())])],
            vec!["os", "path", "p"],
            vec![],
            vec![100, 0, 100, 1, 108, 0, 109, 1, 90, 2, 1, 0],
        );
        let (stack, stmts) = run(&code);
        assert!(stack.is_empty());
        assert_eq!(
            stmts,
            vec![Stmt::ImportFrom {
                module: "os".into(),
                names: vec![Alias {
                    name: "path".into(),
                    asname: Some("p".into()),
                }],
                level: 0,
            }]
        );
    }

    #[test]
    fn test_fstring_parts() {
        // 3.9 f"a{x}": LOAD_CONST 'a'; LOAD_NAME x; FORMAT_VALUE 0;
        // BUILD_STRING 2
        let code = code_with(
            vec![Obj::Str("a".into())],
            vec!["x"],
            vec![],
            vec![100, 0, 101, 0, 155, 0, 157, 2],
        );
        let (stack, _) = run(&code);
        assert_eq!(
            stack.peek(0),
            Some(&StackValue::Expr(Expr::FString(vec![
                FStringPart::Literal("a".into()),
                FStringPart::Field {
                    value: Expr::Name("x".into()),
                    conversion: None,
                    spec: None,
                },
            ])))
        );
    }

    #[test]
    fn test_underflow_is_error_in_emit_mode() {
        let code = code_with(vec![], vec![], vec![], vec![23, 0]); // BINARY_ADD on empty stack
        let instrs = decode_code(&code.code, V39).unwrap();
        let hook = NoNesting;
        let mut sim = Simulator::new(&code, V39, SimMode::Emit, &hook, StackState::new());
        let err = sim.run(&instrs).unwrap_err();
        assert!(matches!(err, DecompileError::StackUnderflow { .. }));
    }

    #[test]
    fn test_underflow_absorbed_in_flow_mode() {
        let code = code_with(vec![], vec![], vec![], vec![23, 0]);
        let instrs = decode_code(&code.code, V39).unwrap();
        let hook = NoNesting;
        let mut sim = Simulator::new(&code, V39, SimMode::Flow, &hook, StackState::new());
        sim.run(&instrs).unwrap();
        assert_eq!(sim.stack.depth(), 1);
        assert!(sim.stack.peek(0).unwrap().is_unknown());
    }

    #[test]
    fn test_build_collections() {
        // LOAD_CONST 1; LOAD_CONST 2; BUILD_LIST 2
        let code = code_with(vec![Obj::Int(1), Obj::Int(2)], vec![], vec![], vec![100, 0, 100, 1, 103, 2]);
        let (stack, _) = run(&code);
        assert_eq!(
            stack.peek(0),
            Some(&StackValue::Expr(Expr::List(vec![
                Expr::Const(Obj::Int(1)),
                Expr::Const(Obj::Int(2)),
            ])))
        );
    }

    #[test]
    fn test_const_list_via_extend() {
        // BUILD_LIST 0; LOAD_CONST (1,2,3); LIST_EXTEND 1
        let code = code_with(
            vec![Obj::Tuple(vec![Obj::Int(1), Obj::Int(2), Obj::Int(3)])],
            vec![],
            vec![],
            vec![103, 0, 100, 0, 162, 1],
        );
        let (stack, _) = run(&code);
        assert_eq!(
            stack.peek(0),
            Some(&StackValue::Expr(Expr::List(vec![
                Expr::Const(Obj::Int(1)),
                Expr::Const(Obj::Int(2)),
                Expr::Const(Obj::Int(3)),
            ])))
        );
    }
}
