//! Canonical opcodes and the per-version byte tables.
//!
//! One `Opcode` enum spans every supported release; the per-version tables
//! map raw bytes onto it. Table layering follows release history: each
//! family starts from its predecessor, removes what the release dropped,
//! and adds what it introduced. 3.13 renumbered the whole opcode space
//! (no-argument opcodes below `HAVE_ARGUMENT`, everything generated in
//! name order), which the 3.13/3.14 builders reproduce.
//!
//! Specialized adaptive forms (3.11+) never appear in containers, but
//! disassemblies of warmed-up code do; `despecialize` folds them back to
//! their base instruction.

use std::sync::LazyLock;

use crate::{
    error::{DecompileError, DecompileResult},
    version::PyVersion,
};

/// Canonical instruction names across all supported versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    // Stack manipulation
    Cache,
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    RotN,
    DupTop,
    DupTopTwo,
    DupTopx,
    Copy,
    Swap,
    Nop,
    PushNull,
    Resume,
    StopCode,
    // Unary
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryConvert,
    UnaryInvert,
    // Binary (pre-3.11 dedicated forms)
    BinaryPower,
    BinaryMultiply,
    BinaryMatrixMultiply,
    BinaryDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinarySubscr,
    BinaryFloorDivide,
    BinaryTrueDivide,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    // In-place (pre-3.11 dedicated forms)
    InplacePower,
    InplaceMultiply,
    InplaceMatrixMultiply,
    InplaceDivide,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceFloorDivide,
    InplaceTrueDivide,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,
    // 3.11+ merged arithmetic, 3.12+ slice forms
    BinaryOp,
    BinarySlice,
    StoreSlice,
    // Python 2 slice opcodes
    #[strum(serialize = "SLICE+0")]
    SlicePlus0,
    #[strum(serialize = "SLICE+1")]
    SlicePlus1,
    #[strum(serialize = "SLICE+2")]
    SlicePlus2,
    #[strum(serialize = "SLICE+3")]
    SlicePlus3,
    #[strum(serialize = "STORE_SLICE+0")]
    StoreSlicePlus0,
    #[strum(serialize = "STORE_SLICE+1")]
    StoreSlicePlus1,
    #[strum(serialize = "STORE_SLICE+2")]
    StoreSlicePlus2,
    #[strum(serialize = "STORE_SLICE+3")]
    StoreSlicePlus3,
    #[strum(serialize = "DELETE_SLICE+0")]
    DeleteSlicePlus0,
    #[strum(serialize = "DELETE_SLICE+1")]
    DeleteSlicePlus1,
    #[strum(serialize = "DELETE_SLICE+2")]
    DeleteSlicePlus2,
    #[strum(serialize = "DELETE_SLICE+3")]
    DeleteSlicePlus3,
    // Subscript stores
    StoreSubscr,
    DeleteSubscr,
    StoreMap,
    // Python 2 statements
    PrintExpr,
    PrintItem,
    PrintNewline,
    PrintItemTo,
    PrintNewlineTo,
    ExecStmt,
    LoadLocals,
    BuildClass,
    // Iteration
    GetIter,
    GetYieldFromIter,
    GetAiter,
    GetAnext,
    GetAwaitable,
    ForIter,
    EndFor,
    EndAsyncFor,
    // Returns / yields
    ReturnValue,
    ReturnConst,
    ReturnGenerator,
    YieldValue,
    YieldFrom,
    Send,
    EndSend,
    CleanupThrow,
    AsyncGenWrap,
    GenStart,
    // Block management (pre-3.11) and exception control
    PopBlock,
    PopExcept,
    EndFinally,
    BeginFinally,
    CallFinally,
    PopFinally,
    BreakLoop,
    ContinueLoop,
    SetupLoop,
    SetupExcept,
    SetupFinally,
    SetupWith,
    SetupAsyncWith,
    SetupAnnotations,
    WithCleanup,
    WithCleanupStart,
    WithCleanupFinish,
    BeforeWith,
    BeforeAsyncWith,
    WithExceptStart,
    PushExcInfo,
    CheckExcMatch,
    CheckEgMatch,
    JumpIfNotExcMatch,
    Reraise,
    PrepReraiseStar,
    RaiseVarargs,
    LoadAssertionError,
    ExitInitCheck,
    InterpreterExit,
    // Names
    StoreName,
    DeleteName,
    LoadName,
    StoreGlobal,
    DeleteGlobal,
    LoadGlobal,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadFastCheck,
    LoadFastAndClear,
    LoadFastLoadFast,
    StoreFastLoadFast,
    StoreFastStoreFast,
    LoadFastBorrow,
    LoadFastBorrowLoadFastBorrow,
    LoadSmallInt,
    LoadConst,
    LoadAttr,
    StoreAttr,
    DeleteAttr,
    LoadMethod,
    LoadSuperAttr,
    LoadBuildClass,
    // Cells
    LoadClosure,
    LoadDeref,
    StoreDeref,
    DeleteDeref,
    LoadClassderef,
    MakeCell,
    CopyFreeVars,
    LoadFromDictOrDeref,
    LoadFromDictOrGlobals,
    // Containers
    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    BuildConstKeyMap,
    BuildString,
    BuildSlice,
    ListAppend,
    SetAdd,
    MapAdd,
    ListExtend,
    SetUpdate,
    DictUpdate,
    DictMerge,
    ListToTuple,
    BuildListUnpack,
    BuildMapUnpack,
    BuildMapUnpackWithCall,
    BuildTupleUnpack,
    BuildTupleUnpackWithCall,
    BuildSetUnpack,
    UnpackSequence,
    UnpackEx,
    UnpackTuple,
    UnpackList,
    // Comparisons
    CompareOp,
    IsOp,
    ContainsOp,
    ToBool,
    // Jumps
    JumpForward,
    JumpAbsolute,
    JumpBackward,
    JumpBackwardNoInterrupt,
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    PopJumpBackwardIfFalse,
    PopJumpBackwardIfTrue,
    PopJumpBackwardIfNone,
    PopJumpBackwardIfNotNone,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    // Imports
    ImportName,
    ImportFrom,
    ImportStar,
    // Functions and calls
    MakeFunction,
    MakeClosure,
    SetFunctionAttribute,
    CallFunction,
    CallFunctionVar,
    CallFunctionKw,
    CallFunctionVarKw,
    CallFunctionEx,
    CallMethod,
    CallMethodKw,
    Precall,
    Call,
    CallKw,
    KwNames,
    CallIntrinsic1,
    CallIntrinsic2,
    // f-strings
    FormatValue,
    FormatSimple,
    FormatWithSpec,
    ConvertValue,
    // Pattern matching
    GetLen,
    MatchMapping,
    MatchSequence,
    MatchKeys,
    MatchClass,
    CopyDictWithoutKeys,
    // Misc
    StoreAnnotation,
    ExtendedArg,
    EnterExecutor,
    Reserved,
    // Specialized adaptive forms (despecialize to their base op)
    BinaryOpAddInt,
    BinaryOpAddFloat,
    BinaryOpAddUnicode,
    BinaryOpSubtractInt,
    BinaryOpMultiplyInt,
    BinarySubscrListInt,
    BinarySubscrDict,
    BinarySubscrTupleInt,
    CompareOpInt,
    CompareOpStr,
    CompareOpFloat,
    ForIterList,
    ForIterTuple,
    ForIterRange,
    ForIterGen,
    LoadAttrInstanceValue,
    LoadAttrModule,
    LoadAttrSlot,
    LoadAttrMethodNoDict,
    LoadAttrMethodWithValues,
    LoadGlobalModule,
    LoadGlobalBuiltin,
    LoadFastLoadConst,
    LoadConstLoadFast,
    StoreAttrInstanceValue,
    StoreAttrSlot,
    StoreSubscrListInt,
    StoreSubscrDict,
    CallPyExactArgs,
    CallPyWithDefaults,
    CallBuiltinFast,
    ResumeCheck,
    UnpackSequenceList,
    UnpackSequenceTuple,
    UnpackSequenceTwoTuple,
}

impl Opcode {
    /// Maps a specialized adaptive form back to its base instruction.
    ///
    /// Non-specialized opcodes return themselves.
    #[must_use]
    pub fn despecialize(self) -> Self {
        match self {
            Self::BinaryOpAddInt
            | Self::BinaryOpAddFloat
            | Self::BinaryOpAddUnicode
            | Self::BinaryOpSubtractInt
            | Self::BinaryOpMultiplyInt => Self::BinaryOp,
            Self::BinarySubscrListInt | Self::BinarySubscrDict | Self::BinarySubscrTupleInt => Self::BinarySubscr,
            Self::CompareOpInt | Self::CompareOpStr | Self::CompareOpFloat => Self::CompareOp,
            Self::ForIterList | Self::ForIterTuple | Self::ForIterRange | Self::ForIterGen => Self::ForIter,
            Self::LoadAttrInstanceValue
            | Self::LoadAttrModule
            | Self::LoadAttrSlot
            | Self::LoadAttrMethodNoDict
            | Self::LoadAttrMethodWithValues => Self::LoadAttr,
            Self::LoadGlobalModule | Self::LoadGlobalBuiltin => Self::LoadGlobal,
            Self::StoreAttrInstanceValue | Self::StoreAttrSlot => Self::StoreAttr,
            Self::StoreSubscrListInt | Self::StoreSubscrDict => Self::StoreSubscr,
            Self::CallPyExactArgs | Self::CallPyWithDefaults | Self::CallBuiltinFast => Self::Call,
            Self::ResumeCheck => Self::Resume,
            Self::UnpackSequenceList | Self::UnpackSequenceTuple | Self::UnpackSequenceTwoTuple => {
                Self::UnpackSequence
            }
            other => other,
        }
    }

    /// True for the unconditional jump family.
    #[must_use]
    pub fn is_unconditional_jump(self) -> bool {
        matches!(
            self,
            Self::JumpForward | Self::JumpAbsolute | Self::JumpBackward | Self::JumpBackwardNoInterrupt
        )
    }

    /// True for jumps that branch on a condition (including `FOR_ITER`,
    /// whose exhaustion edge behaves as the false branch).
    #[must_use]
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::PopJumpIfNone
                | Self::PopJumpIfNotNone
                | Self::PopJumpBackwardIfFalse
                | Self::PopJumpBackwardIfTrue
                | Self::PopJumpBackwardIfNone
                | Self::PopJumpBackwardIfNotNone
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
                | Self::JumpIfNotExcMatch
                | Self::ForIter
        )
    }

    /// True if the jump is taken when the condition is falsy (the jump
    /// target is the false branch).
    #[must_use]
    pub fn jumps_on_false(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfFalse
                | Self::PopJumpBackwardIfFalse
                | Self::PopJumpIfNone
                | Self::PopJumpBackwardIfNone
                | Self::JumpIfFalseOrPop
                | Self::JumpIfNotExcMatch
                | Self::ForIter
        )
    }

    /// True for instructions after which control cannot fall through.
    #[must_use]
    pub fn ends_basic_block(self) -> bool {
        self.is_unconditional_jump()
            || self.is_conditional_jump()
            || matches!(
                self,
                Self::ReturnValue
                    | Self::ReturnConst
                    | Self::RaiseVarargs
                    | Self::Reraise
                    | Self::BreakLoop
                    | Self::ContinueLoop
            )
    }

    /// True for instructions with no successor at all.
    #[must_use]
    pub fn never_falls_through(self) -> bool {
        self.is_unconditional_jump()
            || matches!(
                self,
                Self::ReturnValue | Self::ReturnConst | Self::RaiseVarargs | Self::Reraise | Self::BreakLoop
            )
    }

    /// True for the pre-3.11 SETUP_* family whose argument is a handler
    /// or block-exit target.
    #[must_use]
    pub fn is_block_setup(self) -> bool {
        matches!(
            self,
            Self::SetupLoop | Self::SetupExcept | Self::SetupFinally | Self::SetupWith | Self::SetupAsyncWith
        )
    }
}

/// How a jump argument turns into a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpMode {
    /// Argument is an absolute target (bytes pre-3.10, words on 3.10).
    Absolute,
    /// Argument counts forward from the next instruction.
    RelativeForward,
    /// Argument counts backward from the next instruction (3.11+).
    RelativeBackward,
}

impl Opcode {
    /// Jump mode for this opcode at `version`, or `None` if it does not
    /// carry a code target.
    #[must_use]
    pub fn jump_mode(self, version: PyVersion) -> Option<JumpMode> {
        match self {
            Self::JumpForward | Self::ForIter | Self::Send => Some(JumpMode::RelativeForward),
            Self::SetupLoop | Self::SetupExcept | Self::SetupFinally | Self::SetupWith | Self::SetupAsyncWith => {
                Some(JumpMode::RelativeForward)
            }
            Self::JumpAbsolute | Self::ContinueLoop => Some(JumpMode::Absolute),
            Self::JumpBackward | Self::JumpBackwardNoInterrupt => Some(JumpMode::RelativeBackward),
            Self::PopJumpBackwardIfFalse
            | Self::PopJumpBackwardIfTrue
            | Self::PopJumpBackwardIfNone
            | Self::PopJumpBackwardIfNotNone => Some(JumpMode::RelativeBackward),
            Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::PopJumpIfNone
            | Self::PopJumpIfNotNone
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::JumpIfNotExcMatch => {
                if version.relative_jumps_only() {
                    Some(JumpMode::RelativeForward)
                } else {
                    Some(JumpMode::Absolute)
                }
            }
            _ => None,
        }
    }
}

/// Binary/in-place operator selected by a `BINARY_OP` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOpKind {
    Add,
    And,
    FloorDivide,
    Lshift,
    MatrixMultiply,
    Multiply,
    Remainder,
    Or,
    Power,
    Rshift,
    Subtract,
    TrueDivide,
    Xor,
}

/// Decodes a `BINARY_OP` argument into the operator and whether it is the
/// in-place variant (args 13..=25 mirror 0..=12).
pub fn binary_op_from_arg(arg: u32, offset: u32) -> DecompileResult<(BinaryOpKind, bool)> {
    let inplace = arg >= 13;
    let index = if inplace { arg - 13 } else { arg };
    let kind = match index {
        0 => BinaryOpKind::Add,
        1 => BinaryOpKind::And,
        2 => BinaryOpKind::FloorDivide,
        3 => BinaryOpKind::Lshift,
        4 => BinaryOpKind::MatrixMultiply,
        5 => BinaryOpKind::Multiply,
        6 => BinaryOpKind::Remainder,
        7 => BinaryOpKind::Or,
        8 => BinaryOpKind::Power,
        9 => BinaryOpKind::Rshift,
        10 => BinaryOpKind::Subtract,
        11 => BinaryOpKind::TrueDivide,
        12 => BinaryOpKind::Xor,
        _ => {
            return Err(DecompileError::MalformedBytecode {
                offset,
                reason: format!("BINARY_OP argument {arg} out of range"),
            });
        }
    };
    Ok((kind, inplace))
}

/// Comparison selected by a `COMPARE_OP` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareKind {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    /// Python 2 / early 3: `in`
    In,
    NotIn,
    Is,
    IsNot,
    /// Pre-3.9 exception matching in handlers.
    ExcMatch,
}

/// Decodes a `COMPARE_OP` argument per version: the raw value through
/// 3.11, shifted right by 4 on 3.12 and by 5 from 3.13 (low bits carry
/// specialization masks there).
pub fn compare_from_arg(arg: u32, version: PyVersion, offset: u32) -> DecompileResult<CompareKind> {
    let index = if version.at_least(3, 13) {
        arg >> 5
    } else if version.at_least(3, 12) {
        arg >> 4
    } else {
        arg & 0x0F
    };
    let kind = match index {
        0 => CompareKind::Lt,
        1 => CompareKind::Le,
        2 => CompareKind::Eq,
        3 => CompareKind::Ne,
        4 => CompareKind::Gt,
        5 => CompareKind::Ge,
        6 => CompareKind::In,
        7 => CompareKind::NotIn,
        8 => CompareKind::Is,
        9 => CompareKind::IsNot,
        10 => CompareKind::ExcMatch,
        _ => {
            return Err(DecompileError::MalformedBytecode {
                offset,
                reason: format!("COMPARE_OP argument {arg} out of range"),
            });
        }
    };
    Ok(kind)
}

/// Byte-indexed opcode table for one version family.
pub struct OpcodeTable {
    ops: [Option<Opcode>; 256],
    have_argument: u8,
}

impl OpcodeTable {
    fn from_pairs(pairs: &[(u8, Opcode)], have_argument: u8) -> Self {
        let mut ops = [None; 256];
        for &(byte, op) in pairs {
            debug_assert!(ops[byte as usize].is_none(), "duplicate opcode byte {byte}");
            ops[byte as usize] = Some(op);
        }
        Self { ops, have_argument }
    }

    /// Sequential layout used by the 3.13+ generated numbering: CACHE at
    /// 0, no-argument opcodes counting up from 1, argument opcodes from
    /// `have_argument`.
    fn sequential(no_arg: &[Opcode], with_arg: &[Opcode], have_argument: u8) -> Self {
        let mut pairs = vec![(0u8, Opcode::Cache)];
        for (i, &op) in no_arg.iter().enumerate() {
            pairs.push((1 + i as u8, op));
        }
        for (i, &op) in with_arg.iter().enumerate() {
            pairs.push((have_argument + i as u8, op));
        }
        Self::from_pairs(&pairs, have_argument)
    }

    /// Looks up an opcode byte.
    pub fn decode(&self, byte: u8, version: PyVersion, offset: u32) -> DecompileResult<Opcode> {
        self.ops[byte as usize].ok_or(DecompileError::UnknownOpcode { version, byte, offset })
    }

    /// True if this byte carries an argument.
    #[must_use]
    pub fn has_arg(&self, byte: u8) -> bool {
        byte >= self.have_argument
    }

    /// Reverse lookup: the byte encoding `op` in this table, if any.
    /// Used by assemblers (tests, mostly); decoding never needs it.
    #[must_use]
    pub fn byte_for(&self, op: Opcode) -> Option<u8> {
        (0..=255u8).find(|&b| self.ops[b as usize] == Some(op))
    }

    /// The table for a version.
    #[must_use]
    pub fn for_version(version: PyVersion) -> &'static Self {
        if version.before(3, 0) {
            &PY2
        } else if version.before(3, 6) {
            &PY3_EARLY
        } else if version.before(3, 8) {
            &PY36
        } else if version.before(3, 9) {
            &PY38
        } else if version.before(3, 10) {
            &PY39
        } else if version.before(3, 11) {
            &PY310
        } else if version.before(3, 12) {
            &PY311
        } else if version.before(3, 13) {
            &PY312
        } else if version.before(3, 14) {
            &PY313
        } else {
            &PY314
        }
    }
}

fn remove_bytes(pairs: &mut Vec<(u8, Opcode)>, bytes: &[u8]) {
    pairs.retain(|(b, _)| !bytes.contains(b));
}

/// Python 2 numbering (2.7's table; late-2.x files decode fully, older
/// 2.x files decode to the extent their opcodes survived into 2.7).
fn py2_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    vec![
        (0, StopCode),
        (1, PopTop),
        (2, RotTwo),
        (3, RotThree),
        (4, DupTop),
        (5, RotFour),
        (9, Nop),
        (10, UnaryPositive),
        (11, UnaryNegative),
        (12, UnaryNot),
        (13, UnaryConvert),
        (15, UnaryInvert),
        (19, BinaryPower),
        (20, BinaryMultiply),
        (21, BinaryDivide),
        (22, BinaryModulo),
        (23, BinaryAdd),
        (24, BinarySubtract),
        (25, BinarySubscr),
        (26, BinaryFloorDivide),
        (27, BinaryTrueDivide),
        (28, InplaceFloorDivide),
        (29, InplaceTrueDivide),
        (30, SlicePlus0),
        (31, SlicePlus1),
        (32, SlicePlus2),
        (33, SlicePlus3),
        (40, StoreSlicePlus0),
        (41, StoreSlicePlus1),
        (42, StoreSlicePlus2),
        (43, StoreSlicePlus3),
        (50, DeleteSlicePlus0),
        (51, DeleteSlicePlus1),
        (52, DeleteSlicePlus2),
        (53, DeleteSlicePlus3),
        (54, StoreMap),
        (55, InplaceAdd),
        (56, InplaceSubtract),
        (57, InplaceMultiply),
        (58, InplaceDivide),
        (59, InplaceModulo),
        (60, StoreSubscr),
        (61, DeleteSubscr),
        (62, BinaryLshift),
        (63, BinaryRshift),
        (64, BinaryAnd),
        (65, BinaryXor),
        (66, BinaryOr),
        (67, InplacePower),
        (68, GetIter),
        (70, PrintExpr),
        (71, PrintItem),
        (72, PrintNewline),
        (73, PrintItemTo),
        (74, PrintNewlineTo),
        (75, InplaceLshift),
        (76, InplaceRshift),
        (77, InplaceAnd),
        (78, InplaceXor),
        (79, InplaceOr),
        (80, BreakLoop),
        (81, WithCleanup),
        (82, LoadLocals),
        (83, ReturnValue),
        (84, ImportStar),
        (85, ExecStmt),
        (86, YieldValue),
        (87, PopBlock),
        (88, EndFinally),
        (89, BuildClass),
        (90, StoreName),
        (91, DeleteName),
        (92, UnpackSequence),
        (93, ForIter),
        (94, ListAppend),
        (95, StoreAttr),
        (96, DeleteAttr),
        (97, StoreGlobal),
        (98, DeleteGlobal),
        (99, DupTopx),
        (100, LoadConst),
        (101, LoadName),
        (102, BuildTuple),
        (103, BuildList),
        (104, BuildSet),
        (105, BuildMap),
        (106, LoadAttr),
        (107, CompareOp),
        (108, ImportName),
        (109, ImportFrom),
        (110, JumpForward),
        (111, JumpIfFalseOrPop),
        (112, JumpIfTrueOrPop),
        (113, JumpAbsolute),
        (114, PopJumpIfFalse),
        (115, PopJumpIfTrue),
        (116, LoadGlobal),
        (119, ContinueLoop),
        (120, SetupLoop),
        (121, SetupExcept),
        (122, SetupFinally),
        (124, LoadFast),
        (125, StoreFast),
        (126, DeleteFast),
        (130, RaiseVarargs),
        (131, CallFunction),
        (132, MakeFunction),
        (133, BuildSlice),
        (134, MakeClosure),
        (135, LoadClosure),
        (136, LoadDeref),
        (137, StoreDeref),
        (140, CallFunctionVar),
        (141, CallFunctionKw),
        (142, CallFunctionVarKw),
        (143, SetupWith),
        (145, ExtendedArg),
        (146, SetAdd),
        (147, MapAdd),
    ]
}

/// 3.0-3.5 numbering (3.5's table; earlier 3.x files decode to the extent
/// their opcodes survived into 3.5).
fn py3_early_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    vec![
        (1, PopTop),
        (2, RotTwo),
        (3, RotThree),
        (4, DupTop),
        (5, DupTopTwo),
        (9, Nop),
        (10, UnaryPositive),
        (11, UnaryNegative),
        (12, UnaryNot),
        (15, UnaryInvert),
        (16, BinaryMatrixMultiply),
        (17, InplaceMatrixMultiply),
        (19, BinaryPower),
        (20, BinaryMultiply),
        (22, BinaryModulo),
        (23, BinaryAdd),
        (24, BinarySubtract),
        (25, BinarySubscr),
        (26, BinaryFloorDivide),
        (27, BinaryTrueDivide),
        (28, InplaceFloorDivide),
        (29, InplaceTrueDivide),
        (50, GetAiter),
        (51, GetAnext),
        (52, BeforeAsyncWith),
        (54, StoreMap),
        (55, InplaceAdd),
        (56, InplaceSubtract),
        (57, InplaceMultiply),
        (59, InplaceModulo),
        (60, StoreSubscr),
        (61, DeleteSubscr),
        (62, BinaryLshift),
        (63, BinaryRshift),
        (64, BinaryAnd),
        (65, BinaryXor),
        (66, BinaryOr),
        (67, InplacePower),
        (68, GetIter),
        (69, GetYieldFromIter),
        (70, PrintExpr),
        (71, LoadBuildClass),
        (72, YieldFrom),
        (73, GetAwaitable),
        (75, InplaceLshift),
        (76, InplaceRshift),
        (77, InplaceAnd),
        (78, InplaceXor),
        (79, InplaceOr),
        (80, BreakLoop),
        (81, WithCleanupStart),
        (82, WithCleanupFinish),
        (83, ReturnValue),
        (84, ImportStar),
        (86, YieldValue),
        (87, PopBlock),
        (88, EndFinally),
        (89, PopExcept),
        (90, StoreName),
        (91, DeleteName),
        (92, UnpackSequence),
        (93, ForIter),
        (94, UnpackEx),
        (95, StoreAttr),
        (96, DeleteAttr),
        (97, StoreGlobal),
        (98, DeleteGlobal),
        (100, LoadConst),
        (101, LoadName),
        (102, BuildTuple),
        (103, BuildList),
        (104, BuildSet),
        (105, BuildMap),
        (106, LoadAttr),
        (107, CompareOp),
        (108, ImportName),
        (109, ImportFrom),
        (110, JumpForward),
        (111, JumpIfFalseOrPop),
        (112, JumpIfTrueOrPop),
        (113, JumpAbsolute),
        (114, PopJumpIfFalse),
        (115, PopJumpIfTrue),
        (116, LoadGlobal),
        (119, ContinueLoop),
        (120, SetupLoop),
        (121, SetupExcept),
        (122, SetupFinally),
        (124, LoadFast),
        (125, StoreFast),
        (126, DeleteFast),
        (130, RaiseVarargs),
        (131, CallFunction),
        (132, MakeFunction),
        (133, BuildSlice),
        (134, MakeClosure),
        (135, LoadClosure),
        (136, LoadDeref),
        (137, StoreDeref),
        (138, DeleteDeref),
        (140, CallFunctionVar),
        (141, CallFunctionKw),
        (142, CallFunctionVarKw),
        (143, SetupWith),
        (144, ExtendedArg),
        (145, ListAppend),
        (146, SetAdd),
        (147, MapAdd),
        (148, LoadClassderef),
        (149, BuildListUnpack),
        (150, BuildMapUnpack),
        (151, BuildMapUnpackWithCall),
        (152, BuildTupleUnpack),
        (153, BuildSetUnpack),
        (154, SetupAsyncWith),
    ]
}

/// 3.6-3.7: word code, EX calls, f-string opcodes; 3.7's method calls.
fn py36_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    let mut pairs = py3_early_pairs();
    // STORE_MAP and the *_VAR call forms died with 3.5.
    remove_bytes(&mut pairs, &[54, 140, 142]);
    pairs.extend_from_slice(&[
        (85, SetupAnnotations),
        (127, StoreAnnotation),
        (142, CallFunctionEx),
        (155, FormatValue),
        (156, BuildConstKeyMap),
        (157, BuildString),
        (158, BuildTupleUnpackWithCall),
        (160, LoadMethod),
        (161, CallMethod),
    ]);
    // MAKE_CLOSURE folded into MAKE_FUNCTION's flag word.
    remove_bytes(&mut pairs, &[134]);
    pairs
}

/// 3.8: frame-block compilation; loop bookkeeping opcodes removed.
fn py38_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    let mut pairs = py36_pairs();
    remove_bytes(&mut pairs, &[80, 119, 120, 121, 127]);
    pairs.extend_from_slice(&[(6, RotFour), (53, BeginFinally), (54, EndAsyncFor), (162, CallFinally), (163, PopFinally)]);
    pairs
}

/// 3.9: zero-cost-adjacent cleanup, IS_OP/CONTAINS_OP split, list/dict
/// update opcodes.
fn py39_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    let mut pairs = py38_pairs();
    remove_bytes(&mut pairs, &[53, 81, 82, 88, 162, 163, 149, 150, 151, 152, 153, 158]);
    pairs.extend_from_slice(&[
        (48, Reraise),
        (49, WithExceptStart),
        (74, LoadAssertionError),
        (82, ListToTuple),
        (117, IsOp),
        (118, ContainsOp),
        (121, JumpIfNotExcMatch),
        (162, ListExtend),
        (163, SetUpdate),
        (164, DictMerge),
        (165, DictUpdate),
    ]);
    pairs
}

/// 3.10: pattern matching; RERAISE gains an argument and moves.
fn py310_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    let mut pairs = py39_pairs();
    remove_bytes(&mut pairs, &[48]);
    pairs.extend_from_slice(&[
        (30, GetLen),
        (31, MatchMapping),
        (32, MatchSequence),
        (33, MatchKeys),
        (34, CopyDictWithoutKeys),
        (99, RotN),
        (119, Reraise),
        (129, GenStart),
        (152, MatchClass),
    ]);
    pairs
}

/// 3.11: the big renumbering - exception table, CACHE units, CALL
/// protocol with PUSH_NULL/PRECALL/KW_NAMES, relative-only jumps.
fn py311_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    vec![
        (0, Cache),
        (1, PopTop),
        (2, PushNull),
        (9, Nop),
        (10, UnaryPositive),
        (11, UnaryNegative),
        (12, UnaryNot),
        (15, UnaryInvert),
        (25, BinarySubscr),
        (30, GetLen),
        (31, MatchMapping),
        (32, MatchSequence),
        (33, MatchKeys),
        (35, PushExcInfo),
        (36, CheckExcMatch),
        (37, CheckEgMatch),
        (49, WithExceptStart),
        (50, GetAiter),
        (51, GetAnext),
        (52, BeforeAsyncWith),
        (53, BeforeWith),
        (54, EndAsyncFor),
        (60, StoreSubscr),
        (61, DeleteSubscr),
        (68, GetIter),
        (69, GetYieldFromIter),
        (70, PrintExpr),
        (71, LoadBuildClass),
        (74, LoadAssertionError),
        (75, ReturnGenerator),
        (82, ListToTuple),
        (83, ReturnValue),
        (84, ImportStar),
        (85, SetupAnnotations),
        (86, YieldValue),
        (87, AsyncGenWrap),
        (88, PrepReraiseStar),
        (89, PopExcept),
        (90, StoreName),
        (91, DeleteName),
        (92, UnpackSequence),
        (93, ForIter),
        (94, UnpackEx),
        (95, StoreAttr),
        (96, DeleteAttr),
        (97, StoreGlobal),
        (98, DeleteGlobal),
        (99, Swap),
        (100, LoadConst),
        (101, LoadName),
        (102, BuildTuple),
        (103, BuildList),
        (104, BuildSet),
        (105, BuildMap),
        (106, LoadAttr),
        (107, CompareOp),
        (108, ImportName),
        (109, ImportFrom),
        (110, JumpForward),
        (111, JumpIfFalseOrPop),
        (112, JumpIfTrueOrPop),
        (113, PopJumpIfFalse),
        (114, PopJumpIfTrue),
        (115, LoadGlobal),
        (116, IsOp),
        (117, ContainsOp),
        (118, Reraise),
        (119, Copy),
        (122, BinaryOp),
        (123, Send),
        (124, LoadFast),
        (125, StoreFast),
        (126, DeleteFast),
        (128, PopJumpIfNotNone),
        (129, PopJumpIfNone),
        (130, RaiseVarargs),
        (131, GetAwaitable),
        (132, MakeFunction),
        (133, BuildSlice),
        (134, JumpBackwardNoInterrupt),
        (135, MakeCell),
        (136, LoadClosure),
        (137, LoadDeref),
        (138, StoreDeref),
        (139, DeleteDeref),
        (140, JumpBackward),
        (142, CallFunctionEx),
        (144, ExtendedArg),
        (145, ListAppend),
        (146, SetAdd),
        (147, MapAdd),
        (148, LoadClassderef),
        (149, CopyFreeVars),
        (151, Resume),
        (152, MatchClass),
        (155, FormatValue),
        (156, BuildConstKeyMap),
        (157, BuildString),
        (160, LoadMethod),
        (162, ListExtend),
        (163, SetUpdate),
        (164, DictMerge),
        (165, DictUpdate),
        (166, Precall),
        (171, Call),
        (172, KwNames),
        (173, PopJumpBackwardIfNotNone),
        (174, PopJumpBackwardIfNone),
        (175, PopJumpBackwardIfFalse),
        (176, PopJumpBackwardIfTrue),
    ]
}

/// 3.12: PEP 709 inline comprehensions, RETURN_CONST, intrinsics, unified
/// forward conditional jumps.
fn py312_pairs() -> Vec<(u8, Opcode)> {
    use Opcode::*;
    let mut pairs = py311_pairs();
    // Dropped: UNARY_POSITIVE, YIELD_VALUE (moves), ASYNC_GEN_WRAP,
    // PREP_RERAISE_STAR, the OR_POP jumps, the directional POP_JUMP
    // family (re-unified below), LOAD_CLASSDEREF, LOAD_METHOD, PRECALL,
    // KW_NAMES, and the 111..119 run that shifts by one.
    remove_bytes(
        &mut pairs,
        &[10, 86, 87, 88, 111, 112, 113, 114, 115, 116, 117, 118, 119, 148, 160, 166, 172, 173, 174, 175, 176],
    );
    pairs.extend_from_slice(&[
        (3, InterpreterExit),
        (4, EndFor),
        (5, EndSend),
        (17, Reserved),
        (26, BinarySlice),
        (27, StoreSlice),
        (55, CleanupThrow),
        (87, LoadLocals),
        (114, PopJumpIfFalse),
        (115, PopJumpIfTrue),
        (116, LoadGlobal),
        (117, IsOp),
        (118, ContainsOp),
        (119, Reraise),
        (120, Copy),
        (121, ReturnConst),
        (127, LoadFastCheck),
        (141, LoadSuperAttr),
        (143, LoadFastAndClear),
        (150, YieldValue),
        (173, CallIntrinsic1),
        (174, CallIntrinsic2),
        (175, LoadFromDictOrGlobals),
        (176, LoadFromDictOrDeref),
    ]);
    pairs
}

fn py313_no_arg() -> Vec<Opcode> {
    use Opcode::*;
    vec![
        BeforeAsyncWith,
        BeforeWith,
        BinarySlice,
        BinarySubscr,
        CheckEgMatch,
        CheckExcMatch,
        CleanupThrow,
        DeleteSubscr,
        EndAsyncFor,
        EndFor,
        EndSend,
        ExitInitCheck,
        FormatSimple,
        FormatWithSpec,
        GetAiter,
        GetAnext,
        GetIter,
        GetLen,
        GetYieldFromIter,
        InterpreterExit,
        LoadAssertionError,
        LoadBuildClass,
        LoadLocals,
        MakeFunction,
        MatchKeys,
        MatchMapping,
        MatchSequence,
        Nop,
        PopExcept,
        PopTop,
        PushExcInfo,
        PushNull,
        ReturnGenerator,
        ReturnValue,
        SetupAnnotations,
        StoreSlice,
        StoreSubscr,
        ToBool,
        UnaryInvert,
        UnaryNegative,
        UnaryNot,
        WithExceptStart,
    ]
}

fn py313_with_arg() -> Vec<Opcode> {
    use Opcode::*;
    vec![
        BinaryOp,
        BuildConstKeyMap,
        BuildList,
        BuildMap,
        BuildSet,
        BuildSlice,
        BuildString,
        BuildTuple,
        Call,
        CallFunctionEx,
        CallIntrinsic1,
        CallIntrinsic2,
        CallKw,
        CompareOp,
        ContainsOp,
        ConvertValue,
        Copy,
        CopyFreeVars,
        DeleteAttr,
        DeleteDeref,
        DeleteFast,
        DeleteGlobal,
        DeleteName,
        DictMerge,
        DictUpdate,
        EnterExecutor,
        ExtendedArg,
        ForIter,
        GetAwaitable,
        ImportFrom,
        ImportName,
        IsOp,
        JumpBackward,
        JumpBackwardNoInterrupt,
        JumpForward,
        ListAppend,
        ListExtend,
        LoadAttr,
        LoadConst,
        LoadDeref,
        LoadFast,
        LoadFastAndClear,
        LoadFastCheck,
        LoadFastLoadFast,
        LoadFromDictOrDeref,
        LoadFromDictOrGlobals,
        LoadGlobal,
        LoadName,
        LoadSuperAttr,
        MakeCell,
        MapAdd,
        MatchClass,
        PopJumpIfFalse,
        PopJumpIfNone,
        PopJumpIfNotNone,
        PopJumpIfTrue,
        RaiseVarargs,
        Reraise,
        Resume,
        ReturnConst,
        Send,
        SetAdd,
        SetFunctionAttribute,
        SetUpdate,
        StoreAttr,
        StoreDeref,
        StoreFast,
        StoreFastLoadFast,
        StoreFastStoreFast,
        StoreGlobal,
        StoreName,
        Swap,
        UnpackEx,
        UnpackSequence,
        YieldValue,
    ]
}

fn py314_no_arg() -> Vec<Opcode> {
    py313_no_arg()
}

fn py314_with_arg() -> Vec<Opcode> {
    let mut ops = py313_with_arg();
    ops.extend_from_slice(&[
        Opcode::LoadSmallInt,
        Opcode::LoadFastBorrow,
        Opcode::LoadFastBorrowLoadFastBorrow,
    ]);
    ops
}

static PY2: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py2_pairs(), 90));
static PY3_EARLY: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py3_early_pairs(), 90));
static PY36: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py36_pairs(), 90));
static PY38: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py38_pairs(), 90));
static PY39: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py39_pairs(), 90));
static PY310: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py310_pairs(), 90));
static PY311: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py311_pairs(), 90));
static PY312: LazyLock<OpcodeTable> = LazyLock::new(|| OpcodeTable::from_pairs(&py312_pairs(), 90));
static PY313: LazyLock<OpcodeTable> =
    LazyLock::new(|| OpcodeTable::sequential(&py313_no_arg(), &py313_with_arg(), 44));
static PY314: LazyLock<OpcodeTable> =
    LazyLock::new(|| OpcodeTable::sequential(&py314_no_arg(), &py314_with_arg(), 43));

#[cfg(test)]
mod tests {
    use super::*;

    const V27: PyVersion = PyVersion::new(2, 7);
    const V39: PyVersion = PyVersion::new(3, 9);
    const V311: PyVersion = PyVersion::new(3, 11);

    #[test]
    fn test_lookup_per_version() {
        let t27 = OpcodeTable::for_version(V27);
        assert_eq!(t27.decode(100, V27, 0).unwrap(), Opcode::LoadConst);
        assert_eq!(t27.decode(71, V27, 0).unwrap(), Opcode::PrintItem);

        let t39 = OpcodeTable::for_version(V39);
        assert_eq!(t39.decode(117, V39, 0).unwrap(), Opcode::IsOp);

        let t311 = OpcodeTable::for_version(V311);
        assert_eq!(t311.decode(0, V311, 0).unwrap(), Opcode::Cache);
        assert_eq!(t311.decode(171, V311, 0).unwrap(), Opcode::Call);
    }

    #[test]
    fn test_unknown_byte_is_typed_error() {
        let t39 = OpcodeTable::for_version(V39);
        let err = t39.decode(250, V39, 6).unwrap_err();
        assert_eq!(
            err,
            DecompileError::UnknownOpcode {
                version: V39,
                byte: 250,
                offset: 6
            }
        );
    }

    #[test]
    fn test_has_arg_thresholds() {
        assert!(OpcodeTable::for_version(V39).has_arg(90));
        assert!(!OpcodeTable::for_version(V39).has_arg(89));
        let t313 = OpcodeTable::for_version(PyVersion::new(3, 13));
        assert!(t313.has_arg(44));
        assert!(!t313.has_arg(43));
    }

    #[test]
    fn test_despecialize() {
        assert_eq!(Opcode::BinaryOpAddInt.despecialize(), Opcode::BinaryOp);
        assert_eq!(Opcode::LoadAttrSlot.despecialize(), Opcode::LoadAttr);
        assert_eq!(Opcode::LoadConst.despecialize(), Opcode::LoadConst);
    }

    #[test]
    fn test_binary_op_args() {
        assert_eq!(binary_op_from_arg(0, 0).unwrap(), (BinaryOpKind::Add, false));
        assert_eq!(binary_op_from_arg(13, 0).unwrap(), (BinaryOpKind::Add, true));
        assert_eq!(binary_op_from_arg(11, 0).unwrap(), (BinaryOpKind::TrueDivide, false));
        assert!(binary_op_from_arg(26, 0).is_err());
    }

    #[test]
    fn test_compare_args_shift_by_version() {
        assert_eq!(compare_from_arg(2, V311, 0).unwrap(), CompareKind::Eq);
        assert_eq!(compare_from_arg(2 << 4 | 8, PyVersion::new(3, 12), 0).unwrap(), CompareKind::Eq);
        assert_eq!(compare_from_arg(4 << 5, PyVersion::new(3, 13), 0).unwrap(), CompareKind::Gt);
    }

    #[test]
    fn test_jump_modes() {
        assert_eq!(Opcode::JumpForward.jump_mode(V39), Some(JumpMode::RelativeForward));
        assert_eq!(Opcode::JumpAbsolute.jump_mode(V39), Some(JumpMode::Absolute));
        assert_eq!(Opcode::PopJumpIfFalse.jump_mode(V39), Some(JumpMode::Absolute));
        assert_eq!(Opcode::PopJumpIfFalse.jump_mode(V311), Some(JumpMode::RelativeForward));
        assert_eq!(Opcode::JumpBackward.jump_mode(V311), Some(JumpMode::RelativeBackward));
        assert_eq!(Opcode::LoadConst.jump_mode(V311), None);
    }

    #[test]
    fn test_polarity() {
        assert!(Opcode::PopJumpIfFalse.jumps_on_false());
        assert!(!Opcode::PopJumpIfTrue.jumps_on_false());
        assert!(Opcode::ForIter.jumps_on_false());
    }

    #[test]
    fn test_every_table_builds_without_collisions() {
        // Building a table debug-asserts on duplicate bytes; touching
        // every family is enough to exercise that.
        for (major, minor) in [
            (1, 5),
            (2, 7),
            (3, 0),
            (3, 5),
            (3, 6),
            (3, 7),
            (3, 8),
            (3, 9),
            (3, 10),
            (3, 11),
            (3, 12),
            (3, 13),
            (3, 14),
        ] {
            let table = OpcodeTable::for_version(PyVersion::new(major, minor));
            assert!(table.byte_for(Opcode::LoadConst).is_some(), "{major}.{minor}");
        }
    }
}
