//! Error taxonomy for container parsing and decompilation.
//!
//! Every failure surfaces as a `DecompileError` pinned to the first offset
//! or block it could be attributed to. There is no catch-and-continue in
//! the core: the only swallowed signal is the pattern detector's internal
//! non-match, which is an `Option`, not an error.

use std::fmt;

use crate::{cfg::BlockId, opcodes::Opcode, version::PyVersion};

/// A decompilation failure.
///
/// `Marshal` and `UnsupportedVersion` arise while reading the container;
/// the remaining kinds arise while decompiling a code object and carry the
/// offset or block they were pinned to.
#[derive(Debug, Clone, PartialEq)]
pub enum DecompileError {
    /// The container's object graph is invalid or truncated.
    Marshal { offset: usize, reason: String },
    /// The magic number does not match any known CPython release.
    UnsupportedVersion { magic: u32 },
    /// A decode or jump-target violation in the bytecode.
    MalformedBytecode { offset: u32, reason: String },
    /// An opcode byte with no entry in this version's table.
    UnknownOpcode { version: PyVersion, byte: u8, offset: u32 },
    /// An opcode popped more values than the stack holds (emission mode
    /// only; flow mode absorbs underflow).
    StackUnderflow { offset: u32, opcode: Opcode },
    /// Predecessors reach a join with different stack depths.
    StackDepthMismatch { block: BlockId },
    /// An emission site consumed a value with no expression form.
    NotAnExpression { opcode: Opcode, offset: u32 },
}

impl DecompileError {
    /// One-line diagnostic used when reporting a failed code object.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Marshal { offset, reason } => format!("marshal at byte {offset}: {reason}"),
            Self::UnsupportedVersion { magic } => format!("unsupported magic {magic:#010x}"),
            Self::MalformedBytecode { offset, reason } => format!("malformed bytecode at {offset}: {reason}"),
            Self::UnknownOpcode { version, byte, offset } => {
                format!("unknown opcode {byte:#04x} at {offset} (Python {version})")
            }
            Self::StackUnderflow { offset, opcode } => format!("stack underflow at {offset} ({opcode})"),
            Self::StackDepthMismatch { block } => format!("stack depth mismatch at block {}", block.index()),
            Self::NotAnExpression { opcode, offset } => format!("no expression form for {opcode} at {offset}"),
        }
    }
}

impl fmt::Display for DecompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for DecompileError {}

pub type DecompileResult<T> = Result<T, DecompileError>;

/// A failure attributed to a named code object.
///
/// Decompiling a container keeps going past a failed nested code object;
/// each casualty is reported as one of these alongside the partial output.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeError {
    /// `co_name` of the code object that failed.
    pub code_name: String,
    pub error: DecompileError,
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_name, self.error)
    }
}
