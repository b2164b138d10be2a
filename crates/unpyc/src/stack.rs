//! Symbolic operand-stack model.
//!
//! `StackValue` is the closed union of everything the simulator can hold
//! on the evaluation stack. `Unknown` is the phi/flow-mode fallback and
//! is never a legal input at an emission site; every consumer matches
//! exhaustively so a new variant cannot be silently mishandled.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    ast::{ClsMeta, CompKind, Expr, FnMeta, TypeParam},
    cfg::BlockId,
    code::CodeObject,
    error::{DecompileError, DecompileResult},
};

/// Accumulator for a comprehension under reconstruction.
///
/// Seeded in place of the empty container while the loop body is
/// simulated; `LIST_APPEND`/`SET_ADD`/`MAP_ADD` record into it instead of
/// producing statements.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompState {
    pub kind: CompKind,
    /// Element (key for dict comprehensions) seen in the loop body.
    pub element: Option<Box<Expr>>,
    /// Value for dict comprehensions.
    pub value: Option<Box<Expr>>,
}

impl CompState {
    #[must_use]
    pub fn new(kind: CompKind) -> Self {
        Self {
            kind,
            element: None,
            value: None,
        }
    }
}

/// One symbolic stack slot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StackValue {
    /// An ordinary expression.
    Expr(Expr),
    /// A function object between `MAKE_FUNCTION` and its store/call.
    Function(FnMeta),
    /// A pending `__build_class__` result.
    Class(ClsMeta),
    /// A raw code constant (becomes `Function` at `MAKE_FUNCTION`).
    Code(Rc<CodeObject>),
    /// Module object pushed by `IMPORT_NAME`; `attrs` tracks submodule
    /// traversal for `import a.b.c as x`.
    Import {
        module: String,
        level: u32,
        fromlist: Vec<String>,
        attrs: Vec<String>,
    },
    /// One name pulled out of a module by `IMPORT_FROM`.
    ImportFromItem { module: String, name: String },
    /// Comprehension accumulator (see `CompState`).
    CompBuilder(CompState),
    /// A reconstructed PEP 695 type parameter.
    TypeParam(TypeParam),
    /// The NULL sentinel of the 3.11+ call protocol.
    Null,
    /// Value saved by `LOAD_FAST_AND_CLEAR`; restored and discarded by
    /// the comprehension epilogue.
    SavedLocal(Option<String>),
    /// Placeholder produced by `UNPACK_SEQUENCE`/`UNPACK_EX`; consumed by
    /// the following stores. `group` indexes the simulator's unpack
    /// bookkeeping.
    Unpack { group: usize, index: usize },
    /// Phi-merge or flow-mode fallback; forbidden in emission context.
    Unknown,
}

impl StackValue {
    /// Extracts the expression form, or errors with `NotAnExpression`.
    ///
    /// `opcode_offset` pins the diagnostic to the consuming instruction.
    pub fn into_expr(self, opcode: crate::opcodes::Opcode, offset: u32) -> DecompileResult<Expr> {
        match self {
            Self::Expr(expr) => Ok(expr),
            // A traversed import is a perfectly good expression: the
            // module object itself.
            Self::Import { module, attrs, .. } => {
                let mut expr = Expr::Name(module.split('.').next().unwrap_or(&module).to_owned());
                for attr in attrs {
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                    };
                }
                Ok(expr)
            }
            Self::ImportFromItem { name, .. } => Ok(Expr::Name(name)),
            _ => Err(DecompileError::NotAnExpression { opcode, offset }),
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// A snapshot of the operand stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackState {
    slots: SmallVec<[StackValue; 8]>,
}

impl StackState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack of `depth` unknown slots (handler seeding).
    #[must_use]
    pub fn unknowns(depth: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| StackValue::Unknown).take(depth).collect(),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, value: StackValue) {
        self.slots.push(value);
    }

    pub fn pop(&mut self) -> Option<StackValue> {
        self.slots.pop()
    }

    /// Slot `depth_from_top` below the top (0 is TOS).
    #[must_use]
    pub fn peek(&self, depth_from_top: usize) -> Option<&StackValue> {
        let len = self.slots.len();
        if depth_from_top < len {
            self.slots.get(len - 1 - depth_from_top)
        } else {
            None
        }
    }

    pub fn peek_mut(&mut self, depth_from_top: usize) -> Option<&mut StackValue> {
        let len = self.slots.len();
        if depth_from_top < len {
            self.slots.get_mut(len - 1 - depth_from_top)
        } else {
            None
        }
    }

    /// Truncates to `depth` slots (exception unwind).
    pub fn truncate(&mut self, depth: usize) {
        self.slots.truncate(depth);
    }

    /// Inserts `value` at the bottom (flow-mode underflow absorption).
    pub fn absorb_underflow(&mut self, value: StackValue) {
        self.slots.insert(0, value);
    }

    /// Merges another predecessor's exit stack into this entry stack.
    ///
    /// Depths must match at a reachable join; slots that disagree
    /// structurally become `Unknown`. Returns whether anything changed,
    /// which drives the dataflow worklist.
    pub fn merge(&mut self, other: &Self, block: BlockId) -> DecompileResult<bool> {
        if self.depth() != other.depth() {
            return Err(DecompileError::StackDepthMismatch { block });
        }
        let mut changed = false;
        for (mine, theirs) in self.slots.iter_mut().zip(&other.slots) {
            if mine != theirs && !mine.is_unknown() {
                *mine = StackValue::Unknown;
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_counts_from_top() {
        let mut stack = StackState::new();
        stack.push(StackValue::Expr(Expr::Name("a".into())));
        stack.push(StackValue::Expr(Expr::Name("b".into())));
        assert_eq!(stack.peek(0), Some(&StackValue::Expr(Expr::Name("b".into()))));
        assert_eq!(stack.peek(1), Some(&StackValue::Expr(Expr::Name("a".into()))));
        assert_eq!(stack.peek(2), None);
    }

    #[test]
    fn test_merge_equal_keeps_exprs() {
        let mut a = StackState::new();
        a.push(StackValue::Expr(Expr::Name("x".into())));
        let mut b = StackState::new();
        b.push(StackValue::Expr(Expr::Name("x".into())));
        let changed = a.merge(&b, BlockId::new(0)).unwrap();
        assert!(!changed);
        assert_eq!(a.peek(0), Some(&StackValue::Expr(Expr::Name("x".into()))));
    }

    #[test]
    fn test_merge_conflict_becomes_unknown() {
        let mut a = StackState::new();
        a.push(StackValue::Expr(Expr::Name("x".into())));
        let mut b = StackState::new();
        b.push(StackValue::Expr(Expr::Name("y".into())));
        let changed = a.merge(&b, BlockId::new(0)).unwrap();
        assert!(changed);
        assert!(a.peek(0).unwrap().is_unknown());
        // Idempotent afterwards.
        assert!(!a.merge(&b, BlockId::new(0)).unwrap());
    }

    #[test]
    fn test_merge_depth_mismatch_is_fatal() {
        let mut a = StackState::new();
        a.push(StackValue::Unknown);
        let b = StackState::new();
        assert!(matches!(
            a.merge(&b, BlockId::new(3)),
            Err(DecompileError::StackDepthMismatch { .. })
        ));
    }

    #[test]
    fn test_into_expr_rejects_null() {
        let err = StackValue::Null
            .into_expr(crate::opcodes::Opcode::ReturnValue, 8)
            .unwrap_err();
        assert!(matches!(err, DecompileError::NotAnExpression { .. }));
    }
}
