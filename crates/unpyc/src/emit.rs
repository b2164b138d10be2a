//! Source emission: the reconstructed AST back to Python text.
//!
//! Rendering is Display-style into a single buffer with 4-space
//! indentation. Expressions carry a precedence so parentheses appear
//! exactly where the tree demands them; constants follow Python repr
//! conventions (single-quote strings, `1.0` floats, sign-magnitude big
//! ints printed in full).

use num_traits::Zero;

use crate::{
    ast::{
        Arguments, BinOp, BoolOpKind, CmpOp, CompKind, Comprehension, Conversion, Expr, FStringPart, MatchCase,
        Pattern, Stmt, TypeParamKind, UnaryOp,
    },
    marshal::Obj,
};

/// Renders a statement list as a module.
#[must_use]
pub fn to_source(body: &[Stmt]) -> String {
    let mut w = Writer::default();
    w.suite_inner(body, true);
    w.out
}

/// Operator precedence, loosest first. Mirrors the Python grammar.
mod prec {
    pub const LOWEST: u8 = 0;
    pub const LAMBDA: u8 = 1;
    pub const TERNARY: u8 = 2;
    pub const OR: u8 = 3;
    pub const AND: u8 = 4;
    pub const NOT: u8 = 5;
    pub const CMP: u8 = 6;
    pub const BIT_OR: u8 = 7;
    pub const BIT_XOR: u8 = 8;
    pub const BIT_AND: u8 = 9;
    pub const SHIFT: u8 = 10;
    pub const ARITH: u8 = 11;
    pub const TERM: u8 = 12;
    pub const UNARY: u8 = 13;
    pub const POWER: u8 = 14;
    pub const AWAIT: u8 = 15;
    pub const ATOM: u8 = 17;
}

#[derive(Default)]
struct Writer {
    out: String,
    indent: usize,
}

impl Writer {
    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn suite(&mut self, body: &[Stmt]) {
        self.indent += 1;
        self.suite_inner(body, false);
        self.indent -= 1;
    }

    fn suite_inner(&mut self, body: &[Stmt], top_level: bool) {
        if body.is_empty() && !top_level {
            self.line("pass");
            return;
        }
        for (i, stmt) in body.iter().enumerate() {
            // A leading string expression is the docstring.
            if i == 0 {
                if let Stmt::Expr(Expr::Const(Obj::Str(doc))) = stmt {
                    self.line(&docstring(doc));
                    continue;
                }
            }
            self.stmt(stmt);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                let text = expr_str(expr, prec::LOWEST);
                self.line(&text);
            }
            Stmt::Assign { targets, value } => {
                let mut text = String::new();
                for target in targets {
                    text.push_str(&expr_str(target, prec::LOWEST));
                    text.push_str(" = ");
                }
                text.push_str(&expr_str(value, prec::LOWEST));
                self.line(&text);
            }
            Stmt::AugAssign { target, op, value } => {
                let text = format!(
                    "{} {}= {}",
                    expr_str(target, prec::LOWEST),
                    binop_token(*op),
                    expr_str(value, prec::LOWEST)
                );
                self.line(&text);
            }
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => {
                let mut text = format!("{}: {}", expr_str(target, prec::LOWEST), expr_str(annotation, prec::LOWEST));
                if let Some(value) = value {
                    text.push_str(" = ");
                    text.push_str(&expr_str(value, prec::LOWEST));
                }
                self.line(&text);
            }
            Stmt::Return(value) => match value {
                Some(expr) => {
                    let text = format!("return {}", expr_str(expr, prec::LOWEST));
                    self.line(&text);
                }
                None => self.line("return"),
            },
            Stmt::Raise { exc, cause } => {
                let mut text = String::from("raise");
                if let Some(exc) = exc {
                    text.push(' ');
                    text.push_str(&expr_str(exc, prec::LOWEST));
                    if let Some(cause) = cause {
                        text.push_str(" from ");
                        text.push_str(&expr_str(cause, prec::LOWEST));
                    }
                }
                self.line(&text);
            }
            Stmt::Assert { test, msg } => {
                let mut text = format!("assert {}", expr_str(test, prec::LOWEST));
                if let Some(msg) = msg {
                    text.push_str(", ");
                    text.push_str(&expr_str(msg, prec::LOWEST));
                }
                self.line(&text);
            }
            Stmt::Delete(targets) => {
                let items: Vec<String> = targets.iter().map(|t| expr_str(t, prec::LOWEST)).collect();
                let text = format!("del {}", items.join(", "));
                self.line(&text);
            }
            Stmt::Pass => self.line("pass"),
            Stmt::Break => self.line("break"),
            Stmt::Continue => self.line("continue"),
            Stmt::Import(names) => {
                let items: Vec<String> = names.iter().map(alias_str).collect();
                let text = format!("import {}", items.join(", "));
                self.line(&text);
            }
            Stmt::ImportFrom { module, names, level } => {
                let dots = ".".repeat(*level as usize);
                let items: Vec<String> = names.iter().map(alias_str).collect();
                let text = format!("from {dots}{module} import {}", items.join(", "));
                self.line(&text);
            }
            Stmt::Global(names) => {
                let text = format!("global {}", names.join(", "));
                self.line(&text);
            }
            Stmt::Nonlocal(names) => {
                let text = format!("nonlocal {}", names.join(", "));
                self.line(&text);
            }
            Stmt::If { test, body, orelse } => self.if_chain(test, body, orelse),
            Stmt::While { test, body, orelse } => {
                let text = format!("while {}:", expr_str(test, prec::LOWEST));
                self.line(&text);
                self.suite(body);
                if !orelse.is_empty() {
                    self.line("else:");
                    self.suite(orelse);
                }
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            } => {
                let head = format!(
                    "{}for {} in {}:",
                    if *is_async { "async " } else { "" },
                    expr_str(target, prec::LOWEST),
                    expr_str(iter, prec::LOWEST)
                );
                self.line(&head);
                self.suite(body);
                if !orelse.is_empty() {
                    self.line("else:");
                    self.suite(orelse);
                }
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
            } => {
                self.line("try:");
                self.suite(body);
                for handler in handlers {
                    let star = if *is_star { "*" } else { "" };
                    let mut head = format!("except{star}");
                    if let Some(kind) = &handler.kind {
                        head.push(' ');
                        head.push_str(&expr_str(kind, prec::LOWEST));
                        if let Some(name) = &handler.name {
                            head.push_str(" as ");
                            head.push_str(name);
                        }
                    }
                    head.push(':');
                    self.line(&head);
                    self.suite(&handler.body);
                }
                if !orelse.is_empty() {
                    self.line("else:");
                    self.suite(orelse);
                }
                if !finalbody.is_empty() {
                    self.line("finally:");
                    self.suite(finalbody);
                }
            }
            Stmt::With { items, body, is_async } => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| {
                        let mut text = expr_str(&item.context, prec::LOWEST);
                        if let Some(target) = &item.target {
                            text.push_str(" as ");
                            text.push_str(&expr_str(target, prec::LOWEST));
                        }
                        text
                    })
                    .collect();
                let head = format!("{}with {}:", if *is_async { "async " } else { "" }, rendered.join(", "));
                self.line(&head);
                self.suite(body);
            }
            Stmt::Match { subject, cases } => {
                let head = format!("match {}:", expr_str(subject, prec::LOWEST));
                self.line(&head);
                self.indent += 1;
                for MatchCase { pattern, guard, body } in cases {
                    let mut head = format!("case {}", pattern_str(pattern));
                    if let Some(guard) = guard {
                        head.push_str(" if ");
                        head.push_str(&expr_str(guard, prec::LOWEST));
                    }
                    head.push(':');
                    self.line(&head);
                    self.suite(body);
                }
                self.indent -= 1;
            }
            Stmt::FunctionDef(def) => {
                for decorator in &def.decorators {
                    let text = format!("@{}", expr_str(decorator, prec::LOWEST));
                    self.line(&text);
                }
                let mut head = String::new();
                if def.is_async {
                    head.push_str("async ");
                }
                head.push_str("def ");
                head.push_str(&def.name);
                head.push_str(&type_params_str(&def.type_params));
                head.push('(');
                head.push_str(&arguments_str(&def.args));
                head.push(')');
                if let Some(returns) = &def.returns {
                    head.push_str(" -> ");
                    head.push_str(&expr_str(returns, prec::LOWEST));
                }
                head.push(':');
                self.line(&head);
                self.suite(&def.body);
            }
            Stmt::ClassDef(def) => {
                for decorator in &def.decorators {
                    let text = format!("@{}", expr_str(decorator, prec::LOWEST));
                    self.line(&text);
                }
                let mut head = format!("class {}{}", def.name, type_params_str(&def.type_params));
                let mut parts: Vec<String> = def.bases.iter().map(|b| expr_str(b, prec::LOWEST)).collect();
                for kw in &def.keywords {
                    match &kw.arg {
                        Some(name) => parts.push(format!("{name}={}", expr_str(&kw.value, prec::LOWEST))),
                        None => parts.push(format!("**{}", expr_str(&kw.value, prec::LOWEST))),
                    }
                }
                if !parts.is_empty() {
                    head.push('(');
                    head.push_str(&parts.join(", "));
                    head.push(')');
                }
                head.push(':');
                self.line(&head);
                self.suite(&def.body);
            }
            Stmt::TypeAlias {
                name,
                type_params,
                value,
            } => {
                let text = format!("type {name}{} = {}", type_params_str(type_params), expr_str(value, prec::LOWEST));
                self.line(&text);
            }
        }
    }

    /// `if`/`elif` folding: an else-suite that is exactly one `if`.
    fn if_chain(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) {
        let head = format!("if {}:", expr_str(test, prec::LOWEST));
        self.line(&head);
        self.suite(body);
        let mut orelse = orelse;
        loop {
            match orelse {
                [] => break,
                [Stmt::If {
                    test,
                    body,
                    orelse: next,
                }] => {
                    let head = format!("elif {}:", expr_str(test, prec::LOWEST));
                    self.line(&head);
                    self.suite(body);
                    orelse = next;
                }
                suite => {
                    self.line("else:");
                    self.suite(suite);
                    break;
                }
            }
        }
    }
}

fn docstring(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace("\"\"\"", "\\\"\\\"\\\"");
    format!("\"\"\"{escaped}\"\"\"")
}

fn alias_str(alias: &crate::ast::Alias) -> String {
    match &alias.asname {
        Some(asname) => format!("{} as {asname}", alias.name),
        None => alias.name.clone(),
    }
}

fn type_params_str(params: &[crate::ast::TypeParam]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = params
        .iter()
        .map(|p| {
            let sigil = match p.kind {
                TypeParamKind::TypeVar => "",
                TypeParamKind::TypeVarTuple => "*",
                TypeParamKind::ParamSpec => "**",
            };
            match &p.bound {
                Some(bound) => format!("{sigil}{}: {}", p.name, expr_str(bound, prec::LOWEST)),
                None => format!("{sigil}{}", p.name),
            }
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}

fn arguments_str(args: &Arguments) -> String {
    let mut parts: Vec<String> = Vec::new();
    let positional: Vec<&String> = args.posonly.iter().chain(&args.args).collect();
    let default_start = positional.len().saturating_sub(args.defaults.len());

    let one = |name: &String, default: Option<&Expr>| -> String {
        let mut text = name.clone();
        if let Some(annotation) = args.annotation_of(name) {
            text.push_str(": ");
            text.push_str(&expr_str(annotation, prec::LOWEST));
            if let Some(default) = default {
                text.push_str(" = ");
                text.push_str(&expr_str(default, prec::LOWEST));
            }
            return text;
        }
        if let Some(default) = default {
            text.push('=');
            text.push_str(&expr_str(default, prec::LOWEST));
        }
        text
    };

    for (i, name) in positional.iter().enumerate() {
        let default = i.checked_sub(default_start).and_then(|j| args.defaults.get(j));
        parts.push(one(name, default));
        if !args.posonly.is_empty() && i + 1 == args.posonly.len() {
            parts.push("/".into());
        }
    }
    if let Some(vararg) = &args.vararg {
        parts.push(format!("*{vararg}"));
    } else if !args.kwonly.is_empty() {
        parts.push("*".into());
    }
    for (i, name) in args.kwonly.iter().enumerate() {
        let default = args.kw_defaults.get(i).and_then(Option::as_ref);
        parts.push(one(name, default));
    }
    if let Some(kwarg) = &args.kwarg {
        parts.push(format!("**{kwarg}"));
    }
    parts.join(", ")
}

fn binop_token(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mult => "*",
        BinOp::MatMult => "@",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
        BinOp::LShift => "<<",
        BinOp::RShift => ">>",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^",
        BinOp::BitAnd => "&",
        BinOp::FloorDiv => "//",
    }
}

fn binop_prec(op: BinOp) -> u8 {
    match op {
        BinOp::Pow => prec::POWER,
        BinOp::Mult | BinOp::MatMult | BinOp::Div | BinOp::Mod | BinOp::FloorDiv => prec::TERM,
        BinOp::Add | BinOp::Sub => prec::ARITH,
        BinOp::LShift | BinOp::RShift => prec::SHIFT,
        BinOp::BitAnd => prec::BIT_AND,
        BinOp::BitXor => prec::BIT_XOR,
        BinOp::BitOr => prec::BIT_OR,
    }
}

fn cmp_token(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Eq => "==",
        CmpOp::NotEq => "!=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
        CmpOp::In => "in",
        CmpOp::NotIn => "not in",
        CmpOp::Is => "is",
        CmpOp::IsNot => "is not",
    }
}

/// Renders an expression, parenthesizing when its precedence is below
/// what the context requires.
#[allow(clippy::too_many_lines)]
fn expr_str(expr: &Expr, min_prec: u8) -> String {
    let (text, my_prec) = match expr {
        Expr::Const(obj) => (const_str(obj), const_prec(obj)),
        Expr::Name(name) => (name.clone(), prec::ATOM),
        Expr::Attribute { value, attr } => {
            (format!("{}.{attr}", expr_str(value, prec::ATOM)), prec::ATOM)
        }
        Expr::Subscript { value, index } => (
            format!("{}[{}]", expr_str(value, prec::ATOM), expr_str(index, prec::LOWEST)),
            prec::ATOM,
        ),
        Expr::Slice { lower, upper, step } => {
            let mut text = String::new();
            if let Some(lower) = lower {
                text.push_str(&expr_str(lower, prec::TERNARY));
            }
            text.push(':');
            if let Some(upper) = upper {
                text.push_str(&expr_str(upper, prec::TERNARY));
            }
            if let Some(step) = step {
                text.push(':');
                text.push_str(&expr_str(step, prec::TERNARY));
            }
            (text, prec::LOWEST)
        }
        Expr::Call { func, args, keywords } => {
            let mut parts: Vec<String> = args.iter().map(|a| expr_str(a, prec::TERNARY)).collect();
            for kw in keywords {
                match &kw.arg {
                    Some(name) => parts.push(format!("{name}={}", expr_str(&kw.value, prec::TERNARY))),
                    None => parts.push(format!("**{}", expr_str(&kw.value, prec::TERNARY))),
                }
            }
            (
                format!("{}({})", expr_str(func, prec::ATOM), parts.join(", ")),
                prec::ATOM,
            )
        }
        Expr::BinOp { left, op, right } => {
            let p = binop_prec(*op);
            // Power is right-associative; everything else left.
            let (lp, rp) = if *op == BinOp::Pow { (p + 1, p) } else { (p, p + 1) };
            (
                format!("{} {} {}", expr_str(left, lp), binop_token(*op), expr_str(right, rp)),
                p,
            )
        }
        Expr::UnaryOp { op, operand } => {
            let (token, p) = match op {
                UnaryOp::Not => ("not ", prec::NOT),
                UnaryOp::UAdd => ("+", prec::UNARY),
                UnaryOp::USub => ("-", prec::UNARY),
                UnaryOp::Invert => ("~", prec::UNARY),
            };
            (format!("{token}{}", expr_str(operand, p)), p)
        }
        Expr::Compare {
            left,
            ops,
            comparators,
        } => {
            let mut text = expr_str(left, prec::CMP + 1);
            for (op, comparator) in ops.iter().zip(comparators) {
                text.push(' ');
                text.push_str(cmp_token(*op));
                text.push(' ');
                text.push_str(&expr_str(comparator, prec::CMP + 1));
            }
            (text, prec::CMP)
        }
        Expr::BoolOp { op, values } => {
            let (token, p) = match op {
                BoolOpKind::And => (" and ", prec::AND),
                BoolOpKind::Or => (" or ", prec::OR),
            };
            let parts: Vec<String> = values.iter().map(|v| expr_str(v, p + 1)).collect();
            (parts.join(token), p)
        }
        Expr::IfExp { test, body, orelse } => (
            format!(
                "{} if {} else {}",
                expr_str(body, prec::OR),
                expr_str(test, prec::OR),
                expr_str(orelse, prec::TERNARY)
            ),
            prec::TERNARY,
        ),
        Expr::Lambda { args, body } => {
            let rendered = arguments_str(args);
            let text = if rendered.is_empty() {
                format!("lambda: {}", expr_str(body, prec::LAMBDA))
            } else {
                format!("lambda {rendered}: {}", expr_str(body, prec::LAMBDA))
            };
            (text, prec::LAMBDA)
        }
        Expr::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|i| expr_str(i, prec::TERNARY)).collect();
            let text = match parts.len() {
                0 => "()".into(),
                1 => format!("({},)", parts[0]),
                _ => format!("({})", parts.join(", ")),
            };
            (text, prec::ATOM)
        }
        Expr::List(items) => {
            let parts: Vec<String> = items.iter().map(|i| expr_str(i, prec::TERNARY)).collect();
            (format!("[{}]", parts.join(", ")), prec::ATOM)
        }
        Expr::Set(items) => {
            let parts: Vec<String> = items.iter().map(|i| expr_str(i, prec::TERNARY)).collect();
            if parts.is_empty() {
                ("set()".into(), prec::ATOM)
            } else {
                (format!("{{{}}}", parts.join(", ")), prec::ATOM)
            }
        }
        Expr::Dict(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|(key, value)| match key {
                    Some(key) => format!("{}: {}", expr_str(key, prec::TERNARY), expr_str(value, prec::TERNARY)),
                    None => format!("**{}", expr_str(value, prec::TERNARY)),
                })
                .collect();
            (format!("{{{}}}", parts.join(", ")), prec::ATOM)
        }
        Expr::Comp {
            kind,
            element,
            value,
            generators,
        } => {
            let head = match (kind, value) {
                (CompKind::Dict, Some(value)) => {
                    format!("{}: {}", expr_str(element, prec::TERNARY), expr_str(value, prec::TERNARY))
                }
                _ => expr_str(element, prec::TERNARY),
            };
            let clauses: String = generators.iter().map(comprehension_str).collect();
            let text = match kind {
                CompKind::List => format!("[{head}{clauses}]"),
                CompKind::Set => format!("{{{head}{clauses}}}"),
                CompKind::Dict => format!("{{{head}{clauses}}}"),
                CompKind::Generator => format!("({head}{clauses})"),
            };
            (text, prec::ATOM)
        }
        Expr::FString(parts) => (fstring_str(parts), prec::ATOM),
        Expr::Starred(inner) => (format!("*{}", expr_str(inner, prec::TERNARY)), prec::TERNARY),
        Expr::NamedExpr { target, value } => (
            format!("{} := {}", expr_str(target, prec::ATOM), expr_str(value, prec::TERNARY)),
            prec::LOWEST,
        ),
        Expr::Yield(value) => {
            let text = match value {
                Some(value) => format!("yield {}", expr_str(value, prec::TERNARY)),
                None => "yield".into(),
            };
            (text, prec::LOWEST)
        }
        Expr::YieldFrom(value) => (format!("yield from {}", expr_str(value, prec::TERNARY)), prec::LOWEST),
        Expr::Await(value) => (format!("await {}", expr_str(value, prec::AWAIT)), prec::AWAIT),
    };
    if my_prec < min_prec {
        format!("({text})")
    } else {
        text
    }
}

fn comprehension_str(clause: &Comprehension) -> String {
    let mut text = format!(
        "{}for {} in {}",
        if clause.is_async { " async " } else { " " },
        expr_str(&clause.target, prec::LOWEST),
        expr_str(&clause.iter, prec::OR)
    );
    for cond in &clause.ifs {
        text.push_str(" if ");
        text.push_str(&expr_str(cond, prec::OR));
    }
    text
}

fn const_prec(obj: &Obj) -> u8 {
    match obj {
        Obj::Int(v) if *v < 0 => prec::UNARY,
        Obj::Float(v) if *v < 0.0 => prec::UNARY,
        Obj::Long(v) if v.sign() == num_bigint::Sign::Minus => prec::UNARY,
        _ => prec::ATOM,
    }
}

fn const_str(obj: &Obj) -> String {
    match obj {
        Obj::None => "None".into(),
        Obj::StopIteration => "StopIteration".into(),
        Obj::Ellipsis => "...".into(),
        Obj::Bool(true) => "True".into(),
        Obj::Bool(false) => "False".into(),
        Obj::Int(v) => v.to_string(),
        Obj::Long(v) => v.to_string(),
        Obj::Float(v) => float_str(*v),
        Obj::Complex(re, im) => {
            if re.is_zero() {
                format!("{}j", float_trim(*im))
            } else {
                format!("({}+{}j)", float_trim(*re), float_trim(*im))
            }
        }
        Obj::Str(text) => string_str(text),
        Obj::Bytes(bytes) => bytes_str(bytes),
        Obj::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(const_str).collect();
            match parts.len() {
                0 => "()".into(),
                1 => format!("({},)", parts[0]),
                _ => format!("({})", parts.join(", ")),
            }
        }
        Obj::List(items) => {
            let parts: Vec<String> = items.iter().map(const_str).collect();
            format!("[{}]", parts.join(", "))
        }
        Obj::Dict(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|(k, v)| format!("{}: {}", const_str(k), const_str(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Obj::Set(items) => {
            let parts: Vec<String> = items.iter().map(const_str).collect();
            if parts.is_empty() {
                "set()".into()
            } else {
                format!("{{{}}}", parts.join(", "))
            }
        }
        Obj::FrozenSet(items) => {
            let parts: Vec<String> = items.iter().map(const_str).collect();
            if parts.is_empty() {
                "frozenset()".into()
            } else {
                format!("frozenset({{{}}})", parts.join(", "))
            }
        }
        Obj::Code(code) => format!("<code {}>", code.name),
    }
}

fn float_str(v: f64) -> String {
    if v.is_nan() {
        return "float('nan')".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "float('inf')" } else { "float('-inf')" }.into();
    }
    float_trim(v)
}

/// Python repr keeps a trailing `.0` on integral floats.
fn float_trim(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e16 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

/// Python string repr: single quotes unless the text contains a single
/// quote and no double quote.
fn string_str(text: &str) -> String {
    let use_double = text.contains('\'') && !text.contains('"');
    let quote = if use_double { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn bytes_str(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

fn fstring_str(parts: &[FStringPart]) -> String {
    // A no-field f-string is just a string.
    if parts.iter().all(|p| matches!(p, FStringPart::Literal(_))) {
        let text: String = parts
            .iter()
            .map(|p| match p {
                FStringPart::Literal(s) => s.as_str(),
                FStringPart::Field { .. } => unreachable!(),
            })
            .collect();
        return string_str(&text);
    }
    let mut out = String::from("f'");
    for part in parts {
        match part {
            FStringPart::Literal(text) => {
                for c in text.chars() {
                    match c {
                        '{' => out.push_str("{{"),
                        '}' => out.push_str("}}"),
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        c => out.push(c),
                    }
                }
            }
            FStringPart::Field {
                value,
                conversion,
                spec,
            } => {
                out.push('{');
                out.push_str(&expr_str(value, prec::TERNARY));
                if let Some(conversion) = conversion {
                    out.push('!');
                    out.push(match conversion {
                        Conversion::Str => 's',
                        Conversion::Repr => 'r',
                        Conversion::Ascii => 'a',
                    });
                }
                if let Some(spec) = spec {
                    out.push(':');
                    for part in spec {
                        match part {
                            FStringPart::Literal(text) => out.push_str(text),
                            FStringPart::Field { value, .. } => {
                                out.push('{');
                                out.push_str(&expr_str(value, prec::TERNARY));
                                out.push('}');
                            }
                        }
                    }
                }
                out.push('}');
            }
        }
    }
    out.push('\'');
    out
}

fn pattern_str(pattern: &Pattern) -> String {
    match pattern {
        Pattern::Value(expr) => expr_str(expr, prec::LOWEST),
        Pattern::Singleton(obj) => const_str(obj),
        Pattern::Sequence(items) => {
            let parts: Vec<String> = items.iter().map(pattern_str).collect();
            match parts.len() {
                1 => format!("({},)", parts[0]),
                _ => format!("({})", parts.join(", ")),
            }
        }
        Pattern::Mapping { keys, patterns, rest } => {
            let mut parts: Vec<String> = keys
                .iter()
                .zip(patterns)
                .map(|(k, p)| format!("{}: {}", expr_str(k, prec::LOWEST), pattern_str(p)))
                .collect();
            if let Some(rest) = rest {
                parts.push(format!("**{rest}"));
            }
            format!("{{{}}}", parts.join(", "))
        }
        Pattern::Class {
            cls,
            patterns,
            kwd_names,
            kwd_patterns,
        } => {
            let mut parts: Vec<String> = patterns.iter().map(pattern_str).collect();
            for (name, pattern) in kwd_names.iter().zip(kwd_patterns) {
                parts.push(format!("{name}={}", pattern_str(pattern)));
            }
            format!("{}({})", expr_str(cls, prec::ATOM), parts.join(", "))
        }
        Pattern::Star(name) => format!("*{}", name.as_deref().unwrap_or("_")),
        Pattern::As { pattern, name } => match (pattern, name) {
            (Some(pattern), Some(name)) => format!("{} as {name}", pattern_str(pattern)),
            (None, Some(name)) => name.clone(),
            _ => "_".into(),
        },
        Pattern::Or(items) => {
            let parts: Vec<String> = items.iter().map(pattern_str).collect();
            parts.join(" | ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Keyword;

    fn name(n: &str) -> Expr {
        Expr::Name(n.into())
    }

    #[test]
    fn test_precedence_parentheses() {
        // (a + b) * c needs parens; a + b * c does not.
        let sum = Expr::BinOp {
            left: Box::new(name("a")),
            op: BinOp::Add,
            right: Box::new(name("b")),
        };
        let product = Expr::BinOp {
            left: Box::new(sum.clone()),
            op: BinOp::Mult,
            right: Box::new(name("c")),
        };
        assert_eq!(expr_str(&product, prec::LOWEST), "(a + b) * c");

        let product2 = Expr::BinOp {
            left: Box::new(name("a")),
            op: BinOp::Add,
            right: Box::new(Expr::BinOp {
                left: Box::new(name("b")),
                op: BinOp::Mult,
                right: Box::new(name("c")),
            }),
        };
        assert_eq!(expr_str(&product2, prec::LOWEST), "a + b * c");
    }

    #[test]
    fn test_string_quoting() {
        assert_eq!(const_str(&Obj::Str("hi".into())), "'hi'");
        assert_eq!(const_str(&Obj::Str("it's".into())), "\"it's\"");
        assert_eq!(const_str(&Obj::Str("a\nb".into())), "'a\\nb'");
    }

    #[test]
    fn test_float_repr() {
        assert_eq!(const_str(&Obj::Float(1.0)), "1.0");
        assert_eq!(const_str(&Obj::Float(0.5)), "0.5");
    }

    #[test]
    fn test_if_elif_else_chain() {
        let stmt = Stmt::If {
            test: name("a"),
            body: vec![Stmt::Pass],
            orelse: vec![Stmt::If {
                test: name("b"),
                body: vec![Stmt::Pass],
                orelse: vec![Stmt::Expr(name("c"))],
            }],
        };
        let out = to_source(&[stmt]);
        assert_eq!(out, "if a:\n    pass\nelif b:\n    pass\nelse:\n    c\n");
    }

    #[test]
    fn test_function_def_with_docstring() {
        let def = Stmt::FunctionDef(crate::ast::FunctionDef {
            name: "greet".into(),
            args: Arguments {
                args: vec!["name".into()],
                ..Arguments::default()
            },
            body: vec![
                Stmt::Expr(Expr::Const(Obj::Str("Greet someone".into()))),
                Stmt::Return(Some(Expr::BinOp {
                    left: Box::new(Expr::Const(Obj::Str("Hello, ".into()))),
                    op: BinOp::Add,
                    right: Box::new(name("name")),
                })),
            ],
            decorators: Vec::new(),
            returns: None,
            type_params: Vec::new(),
            is_async: false,
        });
        let out = to_source(&[def]);
        assert_eq!(
            out,
            "def greet(name):\n    \"\"\"Greet someone\"\"\"\n    return 'Hello, ' + name\n"
        );
    }

    #[test]
    fn test_call_with_keywords_and_star() {
        let call = Expr::Call {
            func: Box::new(name("f")),
            args: vec![name("a"), Expr::Starred(Box::new(name("rest")))],
            keywords: vec![
                Keyword {
                    arg: Some("k".into()),
                    value: Expr::Const(Obj::Int(1)),
                },
                Keyword {
                    arg: None,
                    value: name("kw"),
                },
            ],
        };
        assert_eq!(expr_str(&call, prec::LOWEST), "f(a, *rest, k=1, **kw)");
    }

    #[test]
    fn test_comprehension_render() {
        let comp = Expr::Comp {
            kind: CompKind::List,
            element: Box::new(Expr::BinOp {
                left: Box::new(name("i")),
                op: BinOp::Mult,
                right: Box::new(name("i")),
            }),
            value: None,
            generators: vec![Comprehension {
                target: name("i"),
                iter: Expr::Call {
                    func: Box::new(name("range")),
                    args: vec![Expr::Const(Obj::Int(10))],
                    keywords: Vec::new(),
                },
                ifs: vec![Expr::BinOp {
                    left: Box::new(name("i")),
                    op: BinOp::Mod,
                    right: Box::new(Expr::Const(Obj::Int(2))),
                }],
                is_async: false,
            }],
        };
        assert_eq!(expr_str(&comp, prec::LOWEST), "[i * i for i in range(10) if i % 2]");
    }

    #[test]
    fn test_match_case_render() {
        let stmt = Stmt::Match {
            subject: name("p"),
            cases: vec![
                MatchCase {
                    pattern: Pattern::Sequence(vec![
                        Pattern::As {
                            pattern: None,
                            name: Some("a".into()),
                        },
                        Pattern::As {
                            pattern: None,
                            name: Some("b".into()),
                        },
                    ]),
                    guard: Some(Expr::Compare {
                        left: Box::new(name("a")),
                        ops: vec![CmpOp::Lt],
                        comparators: vec![name("b")],
                    }),
                    body: vec![Stmt::Pass],
                },
                MatchCase {
                    pattern: Pattern::As {
                        pattern: None,
                        name: None,
                    },
                    guard: None,
                    body: vec![Stmt::Pass],
                },
            ],
        };
        let out = to_source(&[stmt]);
        assert_eq!(
            out,
            "match p:\n    case (a, b) if a < b:\n        pass\n    case _:\n        pass\n"
        );
    }

    #[test]
    fn test_fstring_render() {
        let parts = vec![
            FStringPart::Literal("x=".into()),
            FStringPart::Field {
                value: name("x"),
                conversion: Some(Conversion::Repr),
                spec: None,
            },
        ];
        assert_eq!(fstring_str(&parts), "f'x={x!r}'");
    }
}
