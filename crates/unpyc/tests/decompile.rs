//! End-to-end decompilation tests over hand-assembled bytecode.
//!
//! `Asm` is a tiny word-code assembler driven by the same per-version
//! opcode tables the decoder uses, so these tests stay honest about
//! byte-level encodings. Each scenario builds a code object (or a whole
//! module with nested code objects), decompiles it, and compares the
//! emitted source.

use std::rc::Rc;

use pretty_assertions::assert_eq;

use unpyc::{
    code::CodeObject,
    decompile::decompile_code,
    emit,
    marshal::Obj,
    opcodes::{Opcode, OpcodeTable},
    version::PyVersion,
};

const V39: PyVersion = PyVersion::new(3, 9);
const V310: PyVersion = PyVersion::new(3, 10);
const V311: PyVersion = PyVersion::new(3, 11);
const V312: PyVersion = PyVersion::new(3, 12);

/// Word-code assembler for 3.6+ targets.
struct Asm {
    version: PyVersion,
    code: Vec<u8>,
}

impl Asm {
    fn new(version: PyVersion) -> Self {
        assert!(version.word_code(), "Asm emits word code only");
        Self {
            version,
            code: Vec::new(),
        }
    }

    fn op(mut self, op: Opcode, arg: u32) -> Self {
        assert!(arg < 256, "test assembler has no EXTENDED_ARG support");
        let byte = OpcodeTable::for_version(self.version)
            .byte_for(op)
            .unwrap_or_else(|| panic!("{op} is not encodable on Python {}", self.version));
        self.code.push(byte);
        self.code.push(arg as u8);
        self
    }

    /// Emits `n` inline-cache words (3.11+).
    fn cache(mut self, n: usize) -> Self {
        for _ in 0..n {
            self.code.push(0);
            self.code.push(0);
        }
        self
    }

    fn build(self) -> Vec<u8> {
        self.code
    }
}

/// Flag bits for function-like code objects.
const OPTIMIZED_FUNCTION: u32 = 0x1 | 0x2;

#[allow(clippy::too_many_arguments)]
fn code_object(
    name: &str,
    version: PyVersion,
    code: Vec<u8>,
    consts: Vec<Obj>,
    names: &[&str],
    var_names: &[&str],
    arg_count: u32,
    flags: u32,
) -> CodeObject {
    let _ = version;
    CodeObject {
        arg_count,
        pos_only_arg_count: 0,
        kw_only_arg_count: 0,
        n_locals: var_names.len() as u32,
        stack_size: 16,
        flags,
        code,
        consts,
        names: names.iter().map(|s| (*s).to_owned()).collect(),
        var_names: var_names.iter().map(|s| (*s).to_owned()).collect(),
        free_vars: Vec::new(),
        cell_vars: Vec::new(),
        filename: "test.py".into(),
        name: name.into(),
        qualname: name.into(),
        first_line: 1,
        line_table: Vec::new(),
        exception_table: Vec::new(),
    }
}

fn module(version: PyVersion, code: Vec<u8>, consts: Vec<Obj>, names: &[&str]) -> CodeObject {
    code_object("<module>", version, code, consts, names, &[], 0, 0)
}

fn source_of(code: &CodeObject, version: PyVersion) -> String {
    let body = decompile_code(code, version).expect("decompilation succeeds");
    emit::to_source(&body)
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// A 3.11 function with a docstring and one string concatenation.
#[test]
fn scenario_greet_docstring_and_concat() {
    use Opcode::*;
    let greet = code_object(
        "greet",
        V311,
        Asm::new(V311)
            .op(Resume, 0)
            .op(LoadConst, 1)
            .op(LoadFast, 0)
            .op(BinaryOp, 0)
            .cache(1)
            .op(ReturnValue, 0)
            .build(),
        vec![Obj::Str("Greet someone".into()), Obj::Str("Hello, ".into())],
        &[],
        &["name"],
        1,
        OPTIMIZED_FUNCTION,
    );
    let module = module(
        V311,
        Asm::new(V311)
            .op(Resume, 0)
            .op(LoadConst, 0)
            .op(MakeFunction, 0)
            .op(StoreName, 0)
            .op(LoadConst, 1)
            .op(ReturnValue, 0)
            .build(),
        vec![Obj::Code(Rc::new(greet)), Obj::None],
        &["greet"],
    );
    assert_eq!(
        source_of(&module, V311),
        "def greet(name):\n    \"\"\"Greet someone\"\"\"\n    return 'Hello, ' + name\n"
    );
}

/// A 3.10 if/elif/else chain where every branch returns.
#[test]
fn scenario_if_elif_else_returns() {
    use Opcode::*;
    let check = code_object(
        "check",
        V310,
        Asm::new(V310)
            .op(LoadFast, 0) // 0
            .op(LoadConst, 1) // 2
            .op(CompareOp, 4) // 4: >
            .op(PopJumpIfFalse, 6) // 6 -> byte 12
            .op(LoadConst, 2) // 8
            .op(ReturnValue, 0) // 10
            .op(LoadFast, 0) // 12
            .op(LoadConst, 1) // 14
            .op(CompareOp, 0) // 16: <
            .op(PopJumpIfFalse, 12) // 18 -> byte 24
            .op(LoadConst, 3) // 20
            .op(ReturnValue, 0) // 22
            .op(LoadConst, 4) // 24
            .op(ReturnValue, 0) // 26
            .build(),
        vec![
            Obj::None,
            Obj::Int(0),
            Obj::Str("pos".into()),
            Obj::Str("neg".into()),
            Obj::Str("zero".into()),
        ],
        &[],
        &["x"],
        1,
        OPTIMIZED_FUNCTION,
    );
    let module = module(
        V310,
        Asm::new(V310)
            .op(LoadConst, 0)
            .op(LoadConst, 1)
            .op(MakeFunction, 0)
            .op(StoreName, 0)
            .op(LoadConst, 2)
            .op(ReturnValue, 0)
            .build(),
        vec![
            Obj::Code(Rc::new(check)),
            Obj::Str("check".into()),
            Obj::None,
        ],
        &["check"],
    );
    assert_eq!(
        source_of(&module, V310),
        "def check(x):\n    if x > 0:\n        return 'pos'\n    elif x < 0:\n        return 'neg'\n    else:\n        return 'zero'\n"
    );
}

/// A 3.9 accumulator loop: assignment, for, augmented-free re-assign.
#[test]
fn scenario_sum_list_loop() {
    use Opcode::*;
    let sum_list = code_object(
        "sum_list",
        V39,
        Asm::new(V39)
            .op(LoadConst, 1) // 0
            .op(StoreFast, 1) // 2
            .op(LoadFast, 0) // 4
            .op(GetIter, 0) // 6
            .op(ForIter, 12) // 8 -> 22
            .op(StoreFast, 2) // 10
            .op(LoadFast, 1) // 12
            .op(LoadFast, 2) // 14
            .op(BinaryAdd, 0) // 16
            .op(StoreFast, 1) // 18
            .op(JumpAbsolute, 8) // 20
            .op(LoadFast, 1) // 22
            .op(ReturnValue, 0) // 24
            .build(),
        vec![Obj::None, Obj::Int(0)],
        &[],
        &["xs", "t", "x"],
        1,
        OPTIMIZED_FUNCTION,
    );
    let module = module(
        V39,
        Asm::new(V39)
            .op(LoadConst, 0)
            .op(LoadConst, 1)
            .op(MakeFunction, 0)
            .op(StoreName, 0)
            .op(LoadConst, 2)
            .op(ReturnValue, 0)
            .build(),
        vec![
            Obj::Code(Rc::new(sum_list)),
            Obj::Str("sum_list".into()),
            Obj::None,
        ],
        &["sum_list"],
    );
    assert_eq!(
        source_of(&module, V39),
        "def sum_list(xs):\n    t = 0\n    for x in xs:\n        t = t + x\n    return t\n"
    );
}

/// A 3.11 try/except with a typed handler.
#[test]
fn scenario_try_except_value_error() {
    use Opcode::*;
    let code = Asm::new(V311)
        .op(Resume, 0) // 0
        .op(PushNull, 0) // 2
        .op(LoadName, 0) // 4
        .op(Precall, 0) // 6
        .op(Call, 0) // 8
        .op(StoreName, 1) // 10
        .op(JumpForward, 13) // 12 -> 40
        .op(PushExcInfo, 0) // 14
        .op(LoadName, 2) // 16
        .op(CheckExcMatch, 0) // 18
        .op(PopJumpIfFalse, 5) // 20 -> 32
        .op(PopTop, 0) // 22
        .op(LoadConst, 0) // 24
        .op(StoreName, 1) // 26
        .op(PopExcept, 0) // 28
        .op(JumpForward, 4) // 30 -> 40
        .op(Reraise, 0) // 32
        .op(Copy, 3) // 34
        .op(PopExcept, 0) // 36
        .op(Reraise, 1) // 38
        .op(LoadConst, 1) // 40
        .op(ReturnValue, 0) // 42
        .build();
    let mut module = module(
        V311,
        code,
        vec![Obj::Int(0), Obj::None],
        &["f", "x", "ValueError"],
    );
    // Protected body [2, 12) -> handler 14; handler [14, 30) -> cleanup
    // 34 at depth 1 with lasti.
    module.exception_table = vec![0x81, 5, 7, 0, 0x87, 8, 17, 3];
    assert_eq!(
        source_of(&module, V311),
        "try:\n    x = f()\nexcept ValueError:\n    x = 0\n"
    );
}

/// A 3.12 inline (PEP 709) list comprehension with a guard.
#[test]
fn scenario_inline_comprehension() {
    use Opcode::*;
    let f = code_object(
        "f",
        V312,
        Asm::new(V312)
            .op(Resume, 0) // 0
            .op(LoadGlobal, 1) // 2: range, with NULL
            .op(LoadConst, 1) // 4
            .op(Call, 1) // 6
            .op(GetIter, 0) // 8
            .op(LoadFastAndClear, 0) // 10
            .op(Swap, 2) // 12
            .op(BuildList, 0) // 14
            .op(Swap, 2) // 16
            .op(ForIter, 11) // 18 -> 42
            .op(StoreFast, 0) // 20
            .op(LoadFast, 0) // 22
            .op(LoadConst, 2) // 24
            .op(BinaryOp, 6) // 26: %
            .op(PopJumpIfFalse, 5) // 28 -> 40
            .op(LoadFast, 0) // 30
            .op(LoadFast, 0) // 32
            .op(BinaryOp, 5) // 34: *
            .op(ListAppend, 2) // 36
            .op(JumpBackward, 11) // 38 -> 18
            .op(JumpBackward, 12) // 40 -> 18
            .op(EndFor, 0) // 42
            .op(Swap, 2) // 44
            .op(StoreFast, 0) // 46
            .op(ReturnValue, 0) // 48
            .build(),
        vec![Obj::None, Obj::Int(10), Obj::Int(2)],
        &["range"],
        &["i"],
        0,
        OPTIMIZED_FUNCTION,
    );
    let module = module(
        V312,
        Asm::new(V312)
            .op(Resume, 0)
            .op(LoadConst, 0)
            .op(MakeFunction, 0)
            .op(StoreName, 0)
            .op(ReturnConst, 1)
            .build(),
        vec![Obj::Code(Rc::new(f)), Obj::None],
        &["f"],
    );
    assert_eq!(
        source_of(&module, V312),
        "def f():\n    return [i * i for i in range(10) if i % 2]\n"
    );
}

/// A 3.11 match statement: sequence pattern with a guard, wildcard last.
#[test]
fn scenario_match_sequence_guard_wildcard() {
    use Opcode::*;
    let code = Asm::new(V311)
        .op(Resume, 0) // 0
        .op(LoadName, 0) // 2
        .op(MatchSequence, 0) // 4
        .op(PopJumpIfFalse, 14) // 6 -> 36
        .op(GetLen, 0) // 8
        .op(LoadConst, 0) // 10
        .op(CompareOp, 2) // 12: ==
        .op(PopJumpIfFalse, 10) // 14 -> 36
        .op(UnpackSequence, 2) // 16
        .op(StoreName, 1) // 18
        .op(StoreName, 2) // 20
        .op(LoadName, 1) // 22
        .op(LoadName, 2) // 24
        .op(CompareOp, 0) // 26: <
        .op(PopJumpIfFalse, 4) // 28 -> 38
        .op(LoadConst, 1) // 30
        .op(StoreName, 3) // 32
        .op(JumpForward, 3) // 34 -> 42
        .op(PopTop, 0) // 36
        .op(LoadConst, 2) // 38
        .op(StoreName, 3) // 40
        .op(LoadConst, 3) // 42
        .op(ReturnValue, 0) // 44
        .build();
    let module = module(
        V311,
        code,
        vec![Obj::Int(2), Obj::Int(1), Obj::Int(2), Obj::None],
        &["p", "a", "b", "x"],
    );
    assert_eq!(
        source_of(&module, V311),
        "match p:\n    case (a, b) if a < b:\n        x = 1\n    case _:\n        x = 2\n"
    );
}

// ----------------------------------------------------------------------
// Small statement forms, table-driven
// ----------------------------------------------------------------------

macro_rules! emit_tests {
    ($($name:ident: $names:expr, $bytes:expr, $expected:expr;)*) => {
        $(
            paste::item! {
                #[test]
                fn [< emit_ $name >]() {
                    let module = module(V39, $bytes, vec![Obj::None], &$names);
                    assert_eq!(source_of(&module, V39), $expected);
                }
            }
        )*
    }
}

emit_tests! {
    expression_statement: ["x"], vec![101, 0, 1, 0, 100, 0, 83, 0], "x\n";
    delete_name: ["x"], vec![91, 0, 100, 0, 83, 0], "del x\n";
    subscript_store: ["v", "a", "i"], vec![101, 0, 101, 1, 101, 2, 60, 0, 100, 0, 83, 0], "a[i] = v\n";
    unary_not: ["a", "b"], vec![101, 0, 12, 0, 90, 1, 100, 0, 83, 0], "b = not a\n";
    raise_statement: ["e"], vec![101, 0, 130, 1, 100, 0, 83, 0], "raise e\n";
    attribute_store: ["v", "o"], vec![101, 0, 101, 1, 95, 0, 100, 0, 83, 0], "o.v = v\n";
}

// ----------------------------------------------------------------------
// Structured statements beyond the scenarios
// ----------------------------------------------------------------------

#[test]
fn while_loop_with_condition() {
    use Opcode::*;
    // 3.9 `while n: n = f(n)`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0
        .op(PopJumpIfFalse, 14) // 2 -> 14
        .op(LoadName, 1) // 4
        .op(LoadName, 0) // 6
        .op(CallFunction, 1) // 8
        .op(StoreName, 0) // 10
        .op(JumpAbsolute, 0) // 12
        .op(LoadConst, 0) // 14
        .op(ReturnValue, 0) // 16
        .build();
    let module = module(V39, code, vec![Obj::None], &["n", "f"]);
    assert_eq!(source_of(&module, V39), "while n:\n    n = f(n)\n");
}

#[test]
fn while_true_with_break() {
    use Opcode::*;
    // 3.9 `while True:\n    if done():\n        break\n    step()`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: done
        .op(CallFunction, 0) // 2
        .op(PopJumpIfFalse, 8) // 4 -> 8
        .op(JumpForward, 8) // 6 -> 16 (break)
        .op(LoadName, 1) // 8: step
        .op(CallFunction, 0) // 10
        .op(PopTop, 0) // 12
        .op(JumpAbsolute, 0) // 14
        .op(LoadConst, 0) // 16
        .op(ReturnValue, 0) // 18
        .build();
    let module = module(V39, code, vec![Obj::None], &["done", "step"]);
    assert_eq!(
        source_of(&module, V39),
        "while True:\n    if done():\n        break\n    step()\n"
    );
}

#[test]
fn ternary_expression() {
    use Opcode::*;
    // 3.9 `x = a if c else b`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: c
        .op(PopJumpIfFalse, 8) // 2 -> 8
        .op(LoadName, 1) // 4: a
        .op(JumpForward, 2) // 6 -> 10
        .op(LoadName, 2) // 8: b
        .op(StoreName, 3) // 10: x
        .op(LoadConst, 0) // 12
        .op(ReturnValue, 0) // 14
        .build();
    let module = module(V39, code, vec![Obj::None], &["c", "a", "b", "x"]);
    assert_eq!(source_of(&module, V39), "x = a if c else b\n");
}

#[test]
fn boolean_chain_value() {
    use Opcode::*;
    // 3.9 `x = a and b`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: a
        .op(JumpIfFalseOrPop, 6) // 2 -> 6
        .op(LoadName, 1) // 4: b
        .op(StoreName, 2) // 6: x
        .op(LoadConst, 0) // 8
        .op(ReturnValue, 0) // 10
        .build();
    let module = module(V39, code, vec![Obj::None], &["a", "b", "x"]);
    assert_eq!(source_of(&module, V39), "x = a and b\n");
}

#[test]
fn chained_comparison_folds() {
    use Opcode::*;
    // 3.9 `x = a < b < c` with the DUP/ROT middle-operand dance.
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: a
        .op(LoadName, 1) // 2: b
        .op(DupTop, 0) // 4
        .op(RotThree, 0) // 6
        .op(CompareOp, 0) // 8: <
        .op(JumpIfFalseOrPop, 18) // 10 -> 18
        .op(LoadName, 2) // 12: c
        .op(CompareOp, 0) // 14: <
        .op(JumpForward, 4) // 16 -> 22
        .op(RotTwo, 0) // 18
        .op(PopTop, 0) // 20
        .op(StoreName, 3) // 22: x
        .op(LoadConst, 0) // 24
        .op(ReturnValue, 0) // 26
        .build();
    let module = module(V39, code, vec![Obj::None], &["a", "b", "c", "x"]);
    assert_eq!(source_of(&module, V39), "x = a < b < c\n");
}

#[test]
fn import_and_from_import() {
    use Opcode::*;
    // 3.9 `import os` then `from sys import argv, path`
    let code = Asm::new(V39)
        .op(LoadConst, 0) // 0: 0
        .op(LoadConst, 1) // 2: None
        .op(ImportName, 0) // 4: os
        .op(StoreName, 0) // 6
        .op(LoadConst, 0) // 8
        .op(LoadConst, 2) // 10: ('argv', 'path')
        .op(ImportName, 1) // 12: sys
        .op(ImportFrom, 2) // 14: argv
        .op(StoreName, 2) // 16
        .op(ImportFrom, 3) // 18: path
        .op(StoreName, 3) // 20
        .op(PopTop, 0) // 22
        .op(LoadConst, 1) // 24
        .op(ReturnValue, 0) // 26
        .build();
    let module = module(
        V39,
        code,
        vec![
            Obj::Int(0),
            Obj::None,
            Obj::Tuple(vec![Obj::Str("argv".into()), Obj::Str("path".into())]),
        ],
        &["os", "sys", "argv", "path"],
    );
    assert_eq!(
        source_of(&module, V39),
        "import os\nfrom sys import argv, path\n"
    );
}

#[test]
fn assert_statement_reconstructed() {
    use Opcode::*;
    // 3.9 `assert ok, 'boom'`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: ok
        .op(PopJumpIfTrue, 12) // 2 -> 12
        .op(LoadAssertionError, 0) // 4
        .op(LoadConst, 0) // 6: 'boom'
        .op(CallFunction, 1) // 8
        .op(RaiseVarargs, 1) // 10
        .op(LoadConst, 1) // 12
        .op(ReturnValue, 0) // 14
        .build();
    let module = module(V39, code, vec![Obj::Str("boom".into()), Obj::None], &["ok"]);
    assert_eq!(source_of(&module, V39), "assert ok, 'boom'\n");
}

#[test]
fn fstring_statement() {
    use Opcode::*;
    // 3.9 `msg = f'x={x!r}'`
    let code = Asm::new(V39)
        .op(LoadConst, 0) // 0: 'x='
        .op(LoadName, 0) // 2: x
        .op(FormatValue, 2) // 4: !r
        .op(BuildString, 2) // 6
        .op(StoreName, 1) // 8
        .op(LoadConst, 1) // 10
        .op(ReturnValue, 0) // 12
        .build();
    let module = module(V39, code, vec![Obj::Str("x=".into()), Obj::None], &["x", "msg"]);
    assert_eq!(source_of(&module, V39), "msg = f'x={x!r}'\n");
}

#[test]
fn chained_assignment_from_dup() {
    use Opcode::*;
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: value
        .op(DupTop, 0) // 2
        .op(StoreName, 1) // 4: a
        .op(StoreName, 2) // 6: b
        .op(LoadConst, 0) // 8
        .op(ReturnValue, 0) // 10
        .build();
    let module = module(V39, code, vec![Obj::None], &["value", "a", "b"]);
    assert_eq!(source_of(&module, V39), "a = b = value\n");
}

#[test]
fn with_statement_and_target() {
    use Opcode::*;
    // 3.9 `with f() as g:\n    h()`
    let code = Asm::new(V39)
        .op(LoadName, 0) // 0: f
        .op(CallFunction, 0) // 2
        .op(SetupWith, 22) // 4 -> 28
        .op(StoreName, 1) // 6: g
        .op(LoadName, 2) // 8: h
        .op(CallFunction, 0) // 10
        .op(PopTop, 0) // 12
        .op(PopBlock, 0) // 14
        .op(LoadConst, 0) // 16
        .op(DupTop, 0) // 18
        .op(DupTop, 0) // 20
        .op(CallFunction, 3) // 22
        .op(PopTop, 0) // 24
        .op(JumpForward, 12) // 26 -> 40
        .op(WithExceptStart, 0) // 28
        .op(PopJumpIfTrue, 34) // 30 -> 34
        .op(Reraise, 0) // 32
        .op(PopTop, 0) // 34
        .op(PopTop, 0) // 36
        .op(PopTop, 0) // 38
        .op(LoadConst, 0) // 40
        .op(ReturnValue, 0) // 42
        .build();
    let module = module(V39, code, vec![Obj::None], &["f", "g", "h"]);
    assert_eq!(source_of(&module, V39), "with f() as g:\n    h()\n");
}

// ----------------------------------------------------------------------
// Boundary behaviors
// ----------------------------------------------------------------------

#[test]
fn empty_bytecode_is_empty_module() {
    let module = module(V39, Vec::new(), Vec::new(), &[]);
    assert_eq!(source_of(&module, V39), "");
}

#[test]
fn lone_return_none_emits_nothing() {
    use Opcode::*;
    let code = Asm::new(V39).op(LoadConst, 0).op(ReturnValue, 0).build();
    let module = module(V39, code, vec![Obj::None], &[]);
    assert_eq!(source_of(&module, V39), "");
}

#[test]
fn resume_only_function_body_is_pass() {
    use Opcode::*;
    let empty = code_object(
        "noop",
        V311,
        Asm::new(V311)
            .op(Resume, 0)
            .op(LoadConst, 0)
            .op(ReturnValue, 0)
            .build(),
        vec![Obj::None],
        &[],
        &[],
        0,
        OPTIMIZED_FUNCTION,
    );
    let module = module(
        V311,
        Asm::new(V311)
            .op(Resume, 0)
            .op(LoadConst, 0)
            .op(MakeFunction, 0)
            .op(StoreName, 0)
            .op(LoadConst, 1)
            .op(ReturnValue, 0)
            .build(),
        vec![Obj::Code(Rc::new(empty)), Obj::None],
        &["noop"],
    );
    assert_eq!(source_of(&module, V311), "def noop():\n    pass\n");
}

#[test]
fn deeply_nested_comprehension_generators() {
    use Opcode::*;
    // 3.9 comprehension code object for
    // `[w for x in .0 for y in x for z in y for w in z]` (4 generators),
    // invoked through a module-level `r = [... for x in data ...]`.
    let comp = code_object(
        "<listcomp>",
        V39,
        Asm::new(V39)
            .op(BuildList, 0) // 0
            .op(LoadFast, 0) // 2: .0
            .op(ForIter, 38) // 4 -> 44
            .op(StoreFast, 1) // 6: x
            .op(LoadFast, 1) // 8
            .op(GetIter, 0) // 10
            .op(ForIter, 28) // 12 -> 42
            .op(StoreFast, 2) // 14: y
            .op(LoadFast, 2) // 16
            .op(GetIter, 0) // 18
            .op(ForIter, 18) // 20 -> 40
            .op(StoreFast, 3) // 22: z
            .op(LoadFast, 3) // 24
            .op(GetIter, 0) // 26
            .op(ForIter, 8) // 28 -> 38
            .op(StoreFast, 4) // 30: w
            .op(LoadFast, 4) // 32
            .op(ListAppend, 5) // 34
            .op(JumpAbsolute, 28) // 36
            .op(JumpAbsolute, 20) // 38
            .op(JumpAbsolute, 12) // 40
            .op(JumpAbsolute, 4) // 42
            .op(ReturnValue, 0) // 44
            .build(),
        vec![],
        &[],
        &[".0", "x", "y", "z", "w"],
        1,
        OPTIMIZED_FUNCTION,
    );
    let code = Asm::new(V39)
        .op(LoadConst, 0) // 0: <listcomp>
        .op(LoadConst, 1) // 2: '<listcomp>'
        .op(MakeFunction, 0) // 4
        .op(LoadName, 0) // 6: data
        .op(GetIter, 0) // 8
        .op(CallFunction, 1) // 10
        .op(StoreName, 1) // 12: r
        .op(LoadConst, 2) // 14
        .op(ReturnValue, 0) // 16
        .build();
    let module = module(
        V39,
        code,
        vec![
            Obj::Code(Rc::new(comp)),
            Obj::Str("<listcomp>".into()),
            Obj::None,
        ],
        &["data", "r"],
    );
    assert_eq!(
        source_of(&module, V39),
        "r = [w for x in data for y in x for z in y for w in z]\n"
    );
}

#[test]
fn trace_stream_reports_decisions() {
    use Opcode::*;
    let code = Asm::new(V39)
        .op(LoadName, 0)
        .op(PopJumpIfFalse, 14)
        .op(LoadName, 1)
        .op(LoadName, 0)
        .op(CallFunction, 1)
        .op(StoreName, 0)
        .op(JumpAbsolute, 0)
        .op(LoadConst, 0)
        .op(ReturnValue, 0)
        .build();
    let module = module(V39, code, vec![Obj::None], &["n", "f"]);
    let mut sink = unpyc::CollectTrace::default();
    let body = unpyc::decompile_code_traced(&module, V39, &mut sink).unwrap();
    assert!(!body.is_empty());
    assert!(sink
        .events
        .iter()
        .any(|e| matches!(e, unpyc::TraceEvent::BlockPattern { .. })));
    assert!(sink
        .events
        .iter()
        .any(|e| matches!(e, unpyc::TraceEvent::StackIn { .. })));
    assert!(sink
        .events
        .iter()
        .any(|e| matches!(e, unpyc::TraceEvent::CodeDone { statements: 1, .. })));
}

#[test]
fn malformed_jump_is_reported_not_panicked() {
    use Opcode::*;
    let code = Asm::new(V39).op(JumpForward, 90).op(ReturnValue, 0).build();
    let module = module(V39, code, vec![Obj::None], &[]);
    let err = decompile_code(&module, V39).unwrap_err();
    assert!(matches!(err, unpyc::DecompileError::MalformedBytecode { .. }));
}
