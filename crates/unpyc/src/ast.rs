//! The reconstructed Python AST.
//!
//! These are the nodes the structured decompiler commits and the emitter
//! prints. Constants reuse the marshal `Obj` type unchanged, so a
//! decompiled `LOAD_CONST` round-trips big ints, nested tuples and
//! frozensets without translation. Equality is structural everywhere;
//! the stack-merge rule in dataflow depends on it.

use std::rc::Rc;

use crate::{code::CodeObject, marshal::Obj};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Not,
    UAdd,
    USub,
    Invert,
}

/// Comparison operators (n-ary chains carry one per comparator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    NotEq,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    /// The operator with swapped operand order (`a < b` == `b > a`).
    #[must_use]
    pub fn swapped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }
}

/// Short-circuit boolean operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BoolOpKind {
    And,
    Or,
}

/// Comprehension flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

/// One `for target in iter if cond ...` clause of a comprehension.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
    pub is_async: bool,
}

/// `!s`, `!r`, `!a` conversion inside an f-string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Conversion {
    Str,
    Repr,
    Ascii,
}

/// A piece of an f-string: literal text or an interpolated field.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FStringPart {
    Literal(String),
    Field {
        value: Expr,
        conversion: Option<Conversion>,
        /// Format spec, itself a joined string (may interpolate).
        spec: Option<Vec<FStringPart>>,
    },
}

/// A keyword argument; `arg: None` is a `**kwargs` splat.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Keyword {
    pub arg: Option<String>,
    pub value: Expr,
}

/// An expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    /// A literal straight from the constant pool.
    Const(Obj),
    Name(String),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    /// `lower:upper:step` inside a subscript.
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// Chained comparison: `left op0 c0 op1 c1 ...`.
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    /// Short-circuit `and`/`or` over two or more values.
    BoolOp {
        op: BoolOpKind,
        values: Vec<Expr>,
    },
    /// Ternary `body if test else orelse`.
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda {
        args: Box<Arguments>,
        body: Box<Expr>,
    },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    /// Dict display; a `None` key marks a `**mapping` splat.
    Dict(Vec<(Option<Expr>, Expr)>),
    Comp {
        kind: CompKind,
        /// Element (key for dict comprehensions).
        element: Box<Expr>,
        /// Value for dict comprehensions.
        value: Option<Box<Expr>>,
        generators: Vec<Comprehension>,
    },
    FString(Vec<FStringPart>),
    Starred(Box<Expr>),
    /// Walrus: `target := value`.
    NamedExpr {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Await(Box<Expr>),
}

impl Expr {
    /// Shorthand for the `None` literal.
    #[must_use]
    pub fn none() -> Self {
        Self::Const(Obj::None)
    }

    #[must_use]
    pub fn is_none_const(&self) -> bool {
        matches!(self, Self::Const(Obj::None))
    }

    /// True for expressions that can be re-evaluated without side effects:
    /// names, constants, and attribute chains over them. The
    /// chained-comparison fold requires the shared operand to be pure.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        match self {
            Self::Const(_) | Self::Name(_) => true,
            Self::Attribute { value, .. } => value.is_pure(),
            _ => false,
        }
    }

    /// Logical negation with double-negation elimination and comparison
    /// inversion where that stays readable.
    #[must_use]
    pub fn negated(self) -> Self {
        match self {
            Self::UnaryOp {
                op: UnaryOp::Not,
                operand,
            } => *operand,
            Self::Compare { left, ops, comparators } if ops.len() == 1 => {
                let inverted = match ops[0] {
                    CmpOp::Eq => Some(CmpOp::NotEq),
                    CmpOp::NotEq => Some(CmpOp::Eq),
                    CmpOp::In => Some(CmpOp::NotIn),
                    CmpOp::NotIn => Some(CmpOp::In),
                    CmpOp::Is => Some(CmpOp::IsNot),
                    CmpOp::IsNot => Some(CmpOp::Is),
                    _ => None,
                };
                match inverted {
                    Some(op) => Self::Compare {
                        left,
                        ops: vec![op],
                        comparators,
                    },
                    None => Self::UnaryOp {
                        op: UnaryOp::Not,
                        operand: Box::new(Self::Compare { left, ops, comparators }),
                    },
                }
            }
            other => Self::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(other),
            },
        }
    }
}

/// Function parameter list, Python-AST shaped.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Arguments {
    /// Positional-only parameters (before the `/`).
    pub posonly: Vec<String>,
    pub args: Vec<String>,
    pub vararg: Option<String>,
    /// Keyword-only parameters (after `*` or `*args`).
    pub kwonly: Vec<String>,
    /// Defaults for keyword-only parameters, parallel to `kwonly`.
    pub kw_defaults: Vec<Option<Expr>>,
    pub kwarg: Option<String>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Expr>,
    /// Parameter annotations by name; `return` holds the return
    /// annotation.
    pub annotations: Vec<(String, Expr)>,
}

impl Arguments {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.posonly.is_empty()
            && self.args.is_empty()
            && self.vararg.is_none()
            && self.kwonly.is_empty()
            && self.kwarg.is_none()
    }

    /// Annotation recorded for a parameter name, if any.
    #[must_use]
    pub fn annotation_of(&self, name: &str) -> Option<&Expr> {
        self.annotations.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }
}

/// A PEP 695 type parameter.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypeParam {
    pub name: String,
    pub kind: TypeParamKind,
    pub bound: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TypeParamKind {
    TypeVar,
    TypeVarTuple,
    ParamSpec,
}

/// `import x`/`from m import x` name with optional rebinding.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

/// One `except`/`except*` clause.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExceptHandler {
    pub kind: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

/// One `with` item: context expression and optional `as` target.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

/// One `case` of a `match` statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

/// A `match` pattern.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Pattern {
    /// Literal or dotted-name value pattern.
    Value(Expr),
    /// `None` / `True` / `False`.
    Singleton(Obj),
    Sequence(Vec<Pattern>),
    Mapping {
        keys: Vec<Expr>,
        patterns: Vec<Pattern>,
        /// `**rest` capture.
        rest: Option<String>,
    },
    Class {
        cls: Expr,
        patterns: Vec<Pattern>,
        kwd_names: Vec<String>,
        kwd_patterns: Vec<Pattern>,
    },
    /// `*name` (or `*_`) inside a sequence pattern.
    Star(Option<String>),
    /// Capture or wildcard: `x` captures, `None` name is `_`.
    As {
        pattern: Option<Box<Pattern>>,
        name: Option<String>,
    },
    Or(Vec<Pattern>),
}

/// A function definition, reconstructed from `MAKE_FUNCTION` plus the
/// nested code object's own decompilation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub args: Arguments,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub returns: Option<Expr>,
    pub type_params: Vec<TypeParam>,
    pub is_async: bool,
}

/// A class definition, reconstructed from the `__build_class__` call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub type_params: Vec<TypeParam>,
}

/// A statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Expr(Expr),
    /// `a = value`, or chained `a = b = value` with several targets.
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    AugAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },
    AnnAssign {
        target: Expr,
        annotation: Expr,
        value: Option<Expr>,
    },
    Return(Option<Expr>),
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Delete(Vec<Expr>),
    Pass,
    Break,
    Continue,
    Import(Vec<Alias>),
    ImportFrom {
        module: String,
        names: Vec<Alias>,
        level: u32,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        is_async: bool,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
        /// `except*` group-handler form.
        is_star: bool,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
        is_async: bool,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
    FunctionDef(FunctionDef),
    ClassDef(ClassDef),
    TypeAlias {
        name: String,
        type_params: Vec<TypeParam>,
        value: Expr,
    },
}

/// Metadata harvested while a function object travels the stack: the
/// code, plus everything `MAKE_FUNCTION`/`SET_FUNCTION_ATTRIBUTE`
/// attached before the store.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FnMeta {
    pub code: Rc<CodeObject>,
    pub defaults: Vec<Expr>,
    pub kw_defaults: Vec<(String, Expr)>,
    pub annotations: Vec<(String, Expr)>,
    pub has_closure: bool,
    pub type_params: Vec<TypeParam>,
    /// Decorators applied before the store, innermost first.
    pub decorators: Vec<Expr>,
}

impl FnMeta {
    #[must_use]
    pub fn new(code: Rc<CodeObject>) -> Self {
        Self {
            code,
            defaults: Vec::new(),
            kw_defaults: Vec::new(),
            annotations: Vec::new(),
            has_closure: false,
            type_params: Vec::new(),
            decorators: Vec::new(),
        }
    }
}

/// Metadata for a pending `__build_class__` call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClsMeta {
    pub body: FnMeta,
    pub name: String,
    pub bases: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    /// Decorators applied before the store, innermost first.
    pub decorators: Vec<Expr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negation_inverts_comparisons() {
        let cmp = Expr::Compare {
            left: Box::new(Expr::Name("a".into())),
            ops: vec![CmpOp::Eq],
            comparators: vec![Expr::Name("b".into())],
        };
        let negated = cmp.negated();
        assert_eq!(
            negated,
            Expr::Compare {
                left: Box::new(Expr::Name("a".into())),
                ops: vec![CmpOp::NotEq],
                comparators: vec![Expr::Name("b".into())],
            }
        );
    }

    #[test]
    fn test_double_negation_cancels() {
        let name = Expr::Name("flag".into());
        assert_eq!(name.clone().negated().negated(), name);
    }

    #[test]
    fn test_ordering_negation_keeps_not() {
        // `not (a < b)` is not `a >= b` (NaN), so ordering comparisons
        // keep the explicit not.
        let cmp = Expr::Compare {
            left: Box::new(Expr::Name("a".into())),
            ops: vec![CmpOp::Lt],
            comparators: vec![Expr::Name("b".into())],
        };
        assert!(matches!(
            cmp.negated(),
            Expr::UnaryOp {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn test_purity() {
        assert!(Expr::Name("x".into()).is_pure());
        let attr = Expr::Attribute {
            value: Box::new(Expr::Name("a".into())),
            attr: "b".into(),
        };
        assert!(attr.is_pure());
        let call = Expr::Call {
            func: Box::new(Expr::Name("f".into())),
            args: Vec::new(),
            keywords: Vec::new(),
        };
        assert!(!call.is_pure());
    }
}
