//! unpyc decompiles compiled Python containers (`.pyc`, CPython 1.0
//! through 3.14) back into source text.
//!
//! The pipeline per code object: decode the instruction stream
//! ([`insn`]), build a basic-block CFG with exception edges ([`cfg`]),
//! compute dominators and natural loops ([`dom`]), run a stack dataflow
//! for merged entry stacks ([`dataflow`]), then reconstruct statements by
//! classifying each region ([`patterns`]) and symbolically interpreting
//! its blocks ([`simulate`], [`decompile`]). A fixed pipeline of
//! canonicalization passes ([`rewrite`]) runs before the AST is printed
//! ([`emit`]).
//!
//! ```no_run
//! let data = std::fs::read("example.pyc").unwrap();
//! let module = unpyc::decompile_pyc(&data).unwrap();
//! print!("{}", module.to_source());
//! ```

pub mod ast;
pub mod cfg;
pub mod code;
pub mod dataflow;
pub mod decompile;
pub mod dom;
pub mod emit;
pub mod error;
pub mod insn;
pub mod marshal;
pub mod opcodes;
pub mod patterns;
pub mod pyc;
pub mod rewrite;
pub mod simulate;
pub mod stack;
pub mod trace;
pub mod version;

pub use crate::{
    code::CodeObject,
    decompile::{decompile_code, decompile_code_traced},
    error::{CodeError, DecompileError, DecompileResult},
    marshal::Obj,
    pyc::{parse_pyc, PycFile},
    trace::{CollectTrace, NoTrace, TraceEvent, TraceSink},
    version::PyVersion,
};

use crate::ast::Stmt;

/// A decompiled module: the version it was compiled with and its body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub version: PyVersion,
    pub body: Vec<Stmt>,
}

impl Module {
    /// Renders the module as Python source.
    #[must_use]
    pub fn to_source(&self) -> String {
        emit::to_source(&self.body)
    }
}

/// Parses a container and decompiles its top-level code object.
///
/// A failure inside a *nested* code object aborts only that object; the
/// error is surfaced as a [`CodeError`] naming it.
pub fn decompile_pyc(data: &[u8]) -> DecompileResult<Module> {
    let pyc = parse_pyc(data)?;
    let body = decompile_code(&pyc.code, pyc.version)?;
    Ok(Module {
        version: pyc.version,
        body,
    })
}
