//! Canonicalization passes over decompiled statement lists.
//!
//! Every pass is purely structural and idempotent: statements in,
//! statements out, fixed order. Chain-assignment folding is not a pass
//! here; it happens during simulation where the duplicating opcode is
//! visible (two structurally equal values alone cannot distinguish
//! `a = b = f()` from two separate calls).

use indexmap::IndexMap;

use crate::{
    ast::{BoolOpKind, ExceptHandler, Expr, FStringPart, MatchCase, Stmt},
    marshal::Obj,
};

/// Runs the full pipeline in its fixed order.
#[must_use]
pub fn run(mut body: Vec<Stmt>, is_module: bool) -> Vec<Stmt> {
    body = elide_implicit_return(body, is_module);
    for_each_body(&mut body, &clean_class_bodies);
    for_each_body(&mut body, &group_imports);
    for_each_body(&mut body, &invert_empty_guards);
    for_each_body(&mut body, &reconstruct_asserts);
    unmangle_private_names(&mut body, &mut Vec::new());
    for_each_body(&mut body, &strip_with_artifacts);
    map_all_exprs(&mut body, &flatten_bool_ops);
    body
}

/// Converts a leading `__doc__ = '...'` into a docstring statement.
#[must_use]
pub fn module_docstring(mut body: Vec<Stmt>) -> Vec<Stmt> {
    if let Some(Stmt::Assign { targets, value }) = body.first() {
        if targets.len() == 1 && targets[0] == Expr::Name("__doc__".into()) {
            if let Expr::Const(Obj::Str(_)) = value {
                let doc = value.clone();
                body[0] = Stmt::Expr(doc);
            }
        }
    }
    body
}

/// Pass 1: drop the compiler's trailing `return None`.
///
/// Every function and module ends with one whether the source wrote it or
/// not; the canonical decompilation omits it. A mid-body `return None`
/// is always kept.
fn elide_implicit_return(mut body: Vec<Stmt>, _is_module: bool) -> Vec<Stmt> {
    match body.last() {
        Some(Stmt::Return(None)) => {
            body.pop();
        }
        Some(Stmt::Return(Some(expr))) if expr.is_none_const() => {
            body.pop();
        }
        _ => {}
    }
    body
}

/// Pass 2: class bodies never show their namespace return (`return
/// locals()` on Python 2, `None` elsewhere). Functions keep theirs.
fn clean_class_bodies(body: &mut Vec<Stmt>) {
    for stmt in body.iter_mut() {
        if let Stmt::ClassDef(class) = stmt {
            while matches!(class.body.last(), Some(Stmt::Return(_))) {
                class.body.pop();
            }
            if class.body.is_empty() {
                class.body.push(Stmt::Pass);
            }
        }
    }
}

/// Pass 3: merge a run of single-name `from m import x` statements into
/// grouped imports, preserving first-seen module order.
fn group_imports(body: &mut Vec<Stmt>) {
    let mut out: Vec<Stmt> = Vec::with_capacity(body.len());
    let mut run: IndexMap<(String, u32), Vec<crate::ast::Alias>> = IndexMap::new();

    let flush = |run: &mut IndexMap<(String, u32), Vec<crate::ast::Alias>>, out: &mut Vec<Stmt>| {
        for ((module, level), names) in run.drain(..) {
            out.push(Stmt::ImportFrom { module, names, level });
        }
    };

    for stmt in body.drain(..) {
        match stmt {
            Stmt::ImportFrom { module, names, level } if !names.iter().any(|a| a.name == "*") => {
                run.entry((module, level)).or_default().extend(names);
            }
            other => {
                flush(&mut run, &mut out);
                out.push(other);
            }
        }
    }
    flush(&mut run, &mut out);
    *body = out;
}

/// Pass 4: an `if` with an empty then-suite inverts into `if not cond:`.
fn invert_empty_guards(body: &mut Vec<Stmt>) {
    for stmt in body.iter_mut() {
        if let Stmt::If { test, body, orelse } = stmt {
            if body.iter().all(|s| matches!(s, Stmt::Pass)) && !orelse.is_empty() {
                *test = test.clone().negated();
                *body = std::mem::take(orelse);
            }
        }
    }
}

/// Pass 6: `if not cond: raise AssertionError(msg)` is an `assert`.
fn reconstruct_asserts(body: &mut Vec<Stmt>) {
    for stmt in body.iter_mut() {
        let Stmt::If { test, body: suite, orelse } = stmt else {
            continue;
        };
        if !orelse.is_empty() || suite.len() != 1 {
            continue;
        }
        let Stmt::Raise { exc: Some(exc), cause: None } = &suite[0] else {
            continue;
        };
        let msg = match exc {
            Expr::Name(n) if n == "AssertionError" => None,
            Expr::Call { func, args, keywords }
                if **func == Expr::Name("AssertionError".into()) && keywords.is_empty() && args.len() == 1 =>
            {
                Some(args[0].clone())
            }
            _ => continue,
        };
        *stmt = Stmt::Assert {
            test: test.clone().negated(),
            msg,
        };
    }
}

/// Pass 7: inside `class C:`, identifiers mangled to `_C__name` emit as
/// `__name`; the rewrite follows nested definitions.
fn unmangle_private_names(body: &mut [Stmt], class_stack: &mut Vec<String>) {
    for stmt in body.iter_mut() {
        if let Stmt::ClassDef(class) = stmt {
            class_stack.push(class.name.clone());
            unmangle_private_names(&mut class.body, class_stack);
            class_stack.pop();
            continue;
        }
        if !class_stack.is_empty() {
            let names: Vec<String> = class_stack.clone();
            map_stmt_exprs(stmt, &|expr| unmangle_expr(expr, &names));
        }
        // Recurse into nested bodies with the same class context.
        with_child_bodies(stmt, &mut |child| unmangle_private_names(child, class_stack));
    }
}

fn unmangle_expr(expr: Expr, class_names: &[String]) -> Expr {
    match expr {
        Expr::Name(name) => Expr::Name(unmangle(name, class_names)),
        Expr::Attribute { value, attr } => Expr::Attribute {
            value,
            attr: unmangle(attr, class_names),
        },
        other => other,
    }
}

fn unmangle(name: String, class_names: &[String]) -> String {
    for class in class_names.iter().rev() {
        let prefix = format!("_{}", class.trim_start_matches('_'));
        if let Some(rest) = name.strip_prefix(&prefix) {
            if rest.starts_with("__") && !rest.ends_with("__") {
                return rest.to_owned();
            }
        }
    }
    name
}

/// Pass 8: drop the compiler's trailing artifacts inside `with` bodies.
fn strip_with_artifacts(body: &mut Vec<Stmt>) {
    for stmt in body.iter_mut() {
        if let Stmt::With { body: suite, .. } = stmt {
            while matches!(suite.last(), Some(Stmt::Expr(e)) if e.is_none_const()) {
                suite.pop();
            }
            if suite.is_empty() {
                suite.push(Stmt::Pass);
            }
        }
    }
}

/// Pass 9: flatten nested same-operator boolean chains.
fn flatten_bool_ops(expr: Expr) -> Expr {
    match expr {
        Expr::BoolOp { op, values } => {
            let mut flat = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    Expr::BoolOp { op: inner, values: vs } if inner == op => flat.extend(vs),
                    other => flat.push(other),
                }
            }
            Expr::BoolOp { op, values: flat }
        }
        other => other,
    }
}

// ----------------------------------------------------------------------
// Traversal helpers
// ----------------------------------------------------------------------

/// Applies `f` to this statement list and every nested suite.
fn for_each_body(body: &mut Vec<Stmt>, f: &impl Fn(&mut Vec<Stmt>)) {
    f(body);
    for stmt in body.iter_mut() {
        with_child_bodies(stmt, &mut |child| for_each_body(child, f));
    }
}

/// Invokes `f` on each direct child suite of a statement.
fn with_child_bodies(stmt: &mut Stmt, f: &mut impl FnMut(&mut Vec<Stmt>)) {
    match stmt {
        Stmt::If { body, orelse, .. } | Stmt::While { body, orelse, .. } => {
            f(body);
            f(orelse);
        }
        Stmt::For { body, orelse, .. } => {
            f(body);
            f(orelse);
        }
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            f(body);
            for ExceptHandler { body, .. } in handlers {
                f(body);
            }
            f(orelse);
            f(finalbody);
        }
        Stmt::With { body, .. } => f(body),
        Stmt::Match { cases, .. } => {
            for MatchCase { body, .. } in cases {
                f(body);
            }
        }
        Stmt::FunctionDef(def) => f(&mut def.body),
        Stmt::ClassDef(def) => f(&mut def.body),
        _ => {}
    }
}

/// Applies an expression mapper to every expression in a suite.
fn map_all_exprs(body: &mut [Stmt], f: &impl Fn(Expr) -> Expr) {
    for stmt in body.iter_mut() {
        map_stmt_exprs(stmt, f);
        with_child_bodies(stmt, &mut |child| map_all_exprs(child, f));
    }
}

/// Applies `f` bottom-up over every expression directly held by `stmt`.
fn map_stmt_exprs(stmt: &mut Stmt, f: &impl Fn(Expr) -> Expr) {
    let apply = |expr: &mut Expr| {
        let owned = std::mem::replace(expr, Expr::none());
        *expr = map_expr(owned, f);
    };
    match stmt {
        Stmt::Expr(e) | Stmt::Return(Some(e)) => apply(e),
        Stmt::Assign { targets, value } => {
            for t in targets {
                apply(t);
            }
            apply(value);
        }
        Stmt::AugAssign { target, value, .. } => {
            apply(target);
            apply(value);
        }
        Stmt::AnnAssign {
            target,
            annotation,
            value,
        } => {
            apply(target);
            apply(annotation);
            if let Some(v) = value {
                apply(v);
            }
        }
        Stmt::Raise { exc, cause } => {
            if let Some(e) = exc {
                apply(e);
            }
            if let Some(c) = cause {
                apply(c);
            }
        }
        Stmt::Assert { test, msg } => {
            apply(test);
            if let Some(m) = msg {
                apply(m);
            }
        }
        Stmt::Delete(items) => {
            for item in items {
                apply(item);
            }
        }
        Stmt::If { test, .. } | Stmt::While { test, .. } => apply(test),
        Stmt::For { target, iter, .. } => {
            apply(target);
            apply(iter);
        }
        Stmt::With { items, .. } => {
            for item in items {
                apply(&mut item.context);
                if let Some(t) = &mut item.target {
                    apply(t);
                }
            }
        }
        Stmt::Match { subject, cases } => {
            apply(subject);
            for case in cases {
                if let Some(g) = &mut case.guard {
                    apply(g);
                }
            }
        }
        Stmt::Try { handlers, .. } => {
            for handler in handlers {
                if let Some(k) = &mut handler.kind {
                    apply(k);
                }
            }
        }
        Stmt::FunctionDef(def) => {
            for d in &mut def.decorators {
                apply(d);
            }
            for e in &mut def.args.defaults {
                apply(e);
            }
        }
        Stmt::ClassDef(def) => {
            for d in &mut def.decorators {
                apply(d);
            }
            for b in &mut def.bases {
                apply(b);
            }
        }
        Stmt::TypeAlias { value, .. } => apply(value),
        _ => {}
    }
}

/// Bottom-up expression map.
fn map_expr(expr: Expr, f: &impl Fn(Expr) -> Expr) -> Expr {
    let descend = |e: Box<Expr>| Box::new(map_expr(*e, f));
    let mapped = match expr {
        Expr::Attribute { value, attr } => Expr::Attribute {
            value: descend(value),
            attr,
        },
        Expr::Subscript { value, index } => Expr::Subscript {
            value: descend(value),
            index: descend(index),
        },
        Expr::Slice { lower, upper, step } => Expr::Slice {
            lower: lower.map(descend),
            upper: upper.map(descend),
            step: step.map(descend),
        },
        Expr::Call { func, args, keywords } => Expr::Call {
            func: descend(func),
            args: args.into_iter().map(|a| map_expr(a, f)).collect(),
            keywords: keywords
                .into_iter()
                .map(|mut k| {
                    k.value = map_expr(k.value, f);
                    k
                })
                .collect(),
        },
        Expr::BinOp { left, op, right } => Expr::BinOp {
            left: descend(left),
            op,
            right: descend(right),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op,
            operand: descend(operand),
        },
        Expr::Compare {
            left,
            ops,
            comparators,
        } => Expr::Compare {
            left: descend(left),
            ops,
            comparators: comparators.into_iter().map(|c| map_expr(c, f)).collect(),
        },
        Expr::BoolOp { op, values } => Expr::BoolOp {
            op,
            values: values.into_iter().map(|v| map_expr(v, f)).collect(),
        },
        Expr::IfExp { test, body, orelse } => Expr::IfExp {
            test: descend(test),
            body: descend(body),
            orelse: descend(orelse),
        },
        Expr::Lambda { args, body } => Expr::Lambda {
            args,
            body: descend(body),
        },
        Expr::Tuple(items) => Expr::Tuple(items.into_iter().map(|i| map_expr(i, f)).collect()),
        Expr::List(items) => Expr::List(items.into_iter().map(|i| map_expr(i, f)).collect()),
        Expr::Set(items) => Expr::Set(items.into_iter().map(|i| map_expr(i, f)).collect()),
        Expr::Dict(items) => Expr::Dict(
            items
                .into_iter()
                .map(|(k, v)| (k.map(|k| map_expr(k, f)), map_expr(v, f)))
                .collect(),
        ),
        Expr::Comp {
            kind,
            element,
            value,
            generators,
        } => Expr::Comp {
            kind,
            element: descend(element),
            value: value.map(descend),
            generators,
        },
        Expr::FString(parts) => Expr::FString(
            parts
                .into_iter()
                .map(|part| match part {
                    FStringPart::Field {
                        value,
                        conversion,
                        spec,
                    } => FStringPart::Field {
                        value: map_expr(value, f),
                        conversion,
                        spec,
                    },
                    literal => literal,
                })
                .collect(),
        ),
        Expr::Starred(inner) => Expr::Starred(descend(inner)),
        Expr::NamedExpr { target, value } => Expr::NamedExpr {
            target: descend(target),
            value: descend(value),
        },
        Expr::Yield(value) => Expr::Yield(value.map(descend)),
        Expr::YieldFrom(value) => Expr::YieldFrom(descend(value)),
        Expr::Await(value) => Expr::Await(descend(value)),
        leaf => leaf,
    };
    f(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Alias;

    fn name(n: &str) -> Expr {
        Expr::Name(n.into())
    }

    #[test]
    fn test_trailing_return_none_elided() {
        let body = vec![
            Stmt::Expr(name("x")),
            Stmt::Return(Some(Expr::none())),
        ];
        let out = run(body, false);
        assert_eq!(out, vec![Stmt::Expr(name("x"))]);
    }

    #[test]
    fn test_mid_body_return_none_kept() {
        let body = vec![
            Stmt::If {
                test: name("c"),
                body: vec![Stmt::Return(Some(Expr::none()))],
                orelse: Vec::new(),
            },
            Stmt::Expr(name("x")),
        ];
        let out = run(body.clone(), false);
        assert_eq!(out, body);
    }

    #[test]
    fn test_import_grouping() {
        let alias = |n: &str| Alias {
            name: n.into(),
            asname: None,
        };
        let body = vec![
            Stmt::ImportFrom {
                module: "os".into(),
                names: vec![alias("path")],
                level: 0,
            },
            Stmt::ImportFrom {
                module: "os".into(),
                names: vec![alias("sep")],
                level: 0,
            },
            Stmt::Expr(name("x")),
        ];
        let out = run(body, true);
        assert_eq!(
            out[0],
            Stmt::ImportFrom {
                module: "os".into(),
                names: vec![alias("path"), alias("sep")],
                level: 0,
            }
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_assert_reconstruction() {
        let body = vec![Stmt::If {
            test: Expr::UnaryOp {
                op: crate::ast::UnaryOp::Not,
                operand: Box::new(name("ok")),
            },
            body: vec![Stmt::Raise {
                exc: Some(Expr::Call {
                    func: Box::new(name("AssertionError")),
                    args: vec![Expr::Const(Obj::Str("boom".into()))],
                    keywords: Vec::new(),
                }),
                cause: None,
            }],
            orelse: Vec::new(),
        }];
        let out = run(body, false);
        assert_eq!(
            out,
            vec![Stmt::Assert {
                test: name("ok"),
                msg: Some(Expr::Const(Obj::Str("boom".into()))),
            }]
        );
    }

    #[test]
    fn test_unmangle_in_class_scope_only() {
        let assign = Stmt::Assign {
            targets: vec![name("_C__secret")],
            value: Expr::Const(Obj::Int(1)),
        };
        // At module scope the name is untouched.
        let out = run(vec![assign.clone()], true);
        assert_eq!(out, vec![assign.clone()]);
        // Inside `class C:` it unmangles.
        let class = Stmt::ClassDef(crate::ast::ClassDef {
            name: "C".into(),
            bases: Vec::new(),
            keywords: Vec::new(),
            body: vec![assign],
            decorators: Vec::new(),
            type_params: Vec::new(),
        });
        let out = run(vec![class], true);
        let Stmt::ClassDef(class) = &out[0] else { panic!() };
        assert_eq!(
            class.body[0],
            Stmt::Assign {
                targets: vec![name("__secret")],
                value: Expr::Const(Obj::Int(1)),
            }
        );
    }

    #[test]
    fn test_bool_op_flattening() {
        let nested = Expr::BoolOp {
            op: BoolOpKind::And,
            values: vec![
                Expr::BoolOp {
                    op: BoolOpKind::And,
                    values: vec![name("a"), name("b")],
                },
                name("c"),
            ],
        };
        let out = run(vec![Stmt::Expr(nested)], false);
        assert_eq!(
            out,
            vec![Stmt::Expr(Expr::BoolOp {
                op: BoolOpKind::And,
                values: vec![name("a"), name("b"), name("c")],
            })]
        );
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let body = vec![
            Stmt::If {
                test: name("c"),
                body: vec![Stmt::Pass],
                orelse: vec![Stmt::Expr(name("y"))],
            },
            Stmt::Return(Some(Expr::none())),
        ];
        let once = run(body, false);
        let twice = run(once.clone(), false);
        assert_eq!(once, twice);
    }
}
