//! Code objects: compiled bytecode plus the tables that describe it.
//!
//! A `CodeObject` is the unit of decompilation. It carries the raw
//! instruction bytes, the constant pool, name tables, and two side tables:
//! the exception table (3.11+) consulted for handler edges, and the
//! location table used to recover line numbers for diagnostics.

use crate::{
    error::{DecompileError, DecompileResult},
    marshal::Obj,
    version::PyVersion,
};

pub mod flags {
    //! `co_flags` bits that matter to decompilation.
    pub const CO_OPTIMIZED: u32 = 0x1;
    pub const CO_NEWLOCALS: u32 = 0x2;
    pub const CO_VARARGS: u32 = 0x4;
    pub const CO_VARKEYWORDS: u32 = 0x8;
    pub const CO_NESTED: u32 = 0x10;
    pub const CO_GENERATOR: u32 = 0x20;
    pub const CO_COROUTINE: u32 = 0x80;
    pub const CO_ITERABLE_COROUTINE: u32 = 0x100;
    pub const CO_ASYNC_GENERATOR: u32 = 0x200;
}

/// A compiled function, class body, comprehension, or module.
///
/// Field widths are normalized: old containers store 16-bit counts, new
/// ones 32-bit; the reader widens everything. `var_names`, `cell_vars`
/// and `free_vars` are already split back out of `localsplus` for 3.11+.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CodeObject {
    pub arg_count: u32,
    pub pos_only_arg_count: u32,
    pub kw_only_arg_count: u32,
    pub n_locals: u32,
    pub stack_size: u32,
    pub flags: u32,
    /// Raw bytecode.
    pub code: Vec<u8>,
    /// Constant pool, `LOAD_CONST` operand space.
    pub consts: Vec<Obj>,
    /// Global/attribute name table.
    pub names: Vec<String>,
    pub var_names: Vec<String>,
    pub free_vars: Vec<String>,
    pub cell_vars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub qualname: String,
    pub first_line: u32,
    /// Raw location bytes: lnotab, PEP 626 pairs, or 3.11+ locations.
    pub line_table: Vec<u8>,
    /// Raw 3.11+ exception table bytes (empty before 3.11).
    pub exception_table: Vec<u8>,
}

impl CodeObject {
    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags & flags::CO_GENERATOR != 0
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.flags & (flags::CO_COROUTINE | flags::CO_ITERABLE_COROUTINE) != 0
    }

    #[must_use]
    pub fn is_async_generator(&self) -> bool {
        self.flags & flags::CO_ASYNC_GENERATOR != 0
    }

    /// Class bodies execute with fresh locals but without fast-local
    /// optimization, unlike functions which set both bits.
    #[must_use]
    pub fn is_class_body(&self) -> bool {
        self.flags & flags::CO_NEWLOCALS != 0 && self.flags & flags::CO_OPTIMIZED == 0
    }

    /// Comprehensions and generator expressions compile to code objects
    /// with well-known names.
    #[must_use]
    pub fn is_comprehension(&self) -> bool {
        matches!(self.name.as_str(), "<listcomp>" | "<setcomp>" | "<dictcomp>" | "<genexpr>")
    }

    #[must_use]
    pub fn is_lambda(&self) -> bool {
        self.name == "<lambda>"
    }

    /// Constant by `LOAD_CONST` operand.
    #[must_use]
    pub fn const_at(&self, index: u32) -> Option<&Obj> {
        self.consts.get(index as usize)
    }

    /// Global/attribute name by operand.
    #[must_use]
    pub fn name_at(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    /// Fast-local name by operand.
    #[must_use]
    pub fn var_name_at(&self, index: u32) -> Option<&str> {
        self.var_names.get(index as usize).map(String::as_str)
    }

    /// Name for a `*_DEREF` operand.
    ///
    /// Pre-3.11 the operand indexes `cellvars ++ freevars`; 3.11+ it
    /// indexes the whole localsplus array (`varnames ++ cellvars ++
    /// freevars`).
    #[must_use]
    pub fn deref_name_at(&self, index: u32, version: PyVersion) -> Option<&str> {
        let index = index as usize;
        if version.at_least(3, 11) {
            let nvars = self.var_names.len();
            let ncells = self.cell_vars.len();
            if index < nvars {
                self.var_names.get(index).map(String::as_str)
            } else if index < nvars + ncells {
                self.cell_vars.get(index - nvars).map(String::as_str)
            } else {
                self.free_vars.get(index - nvars - ncells).map(String::as_str)
            }
        } else {
            let ncells = self.cell_vars.len();
            if index < ncells {
                self.cell_vars.get(index).map(String::as_str)
            } else {
                self.free_vars.get(index - ncells).map(String::as_str)
            }
        }
    }

    /// Decodes the 3.11+ exception table into byte-offset entries.
    ///
    /// The raw table packs `(start, length, target, depth<<1 | lasti)` per
    /// entry as 6-bit varint groups; `0x80` marks an entry's first byte and
    /// `0x40` continues a value. Offsets count instruction words and are
    /// scaled to byte offsets here.
    pub fn exception_entries(&self) -> DecompileResult<Vec<ExceptionEntry>> {
        let data = &self.exception_table;
        let mut entries = Vec::new();
        let mut pos = 0usize;

        let next = |pos: &mut usize| -> DecompileResult<u8> {
            let Some(&b) = data.get(*pos) else {
                return Err(DecompileError::MalformedBytecode {
                    offset: *pos as u32,
                    reason: "truncated exception table".into(),
                });
            };
            *pos += 1;
            Ok(b)
        };
        let varint = |pos: &mut usize| -> DecompileResult<u32> {
            let mut b = next(pos)?;
            let mut value = u32::from(b & 0x3F);
            while b & 0x40 != 0 {
                b = next(pos)?;
                value = (value << 6) | u32::from(b & 0x3F);
            }
            Ok(value)
        };

        while pos < data.len() {
            if data[pos] & 0x80 == 0 {
                return Err(DecompileError::MalformedBytecode {
                    offset: pos as u32,
                    reason: "exception table entry out of sync".into(),
                });
            }
            let start = varint(&mut pos)? * 2;
            let length = varint(&mut pos)? * 2;
            let target = varint(&mut pos)? * 2;
            let depth_lasti = varint(&mut pos)?;
            entries.push(ExceptionEntry {
                start,
                end: start + length,
                target,
                depth: depth_lasti >> 1,
                lasti: depth_lasti & 1 != 0,
            });
        }
        Ok(entries)
    }

    /// Line number for a bytecode offset, from whichever location format
    /// this version uses. Returns `first_line` when the table is silent.
    #[must_use]
    pub fn line_of(&self, offset: u32, version: PyVersion) -> u32 {
        if version.at_least(3, 11) {
            self.line_from_locations(offset)
        } else if version.at_least(3, 10) {
            self.line_from_pairs(offset)
        } else {
            self.line_from_lnotab(offset, version)
        }
    }

    /// Classic `co_lnotab`: `(addr_incr, line_incr)` byte pairs; line
    /// increments are signed from 3.6.
    fn line_from_lnotab(&self, offset: u32, version: PyVersion) -> u32 {
        let signed = version.at_least(3, 6);
        let mut line = i64::from(self.first_line);
        let mut addr = 0u32;
        for pair in self.line_table.chunks_exact(2) {
            addr += u32::from(pair[0]);
            if addr > offset {
                break;
            }
            line += if signed {
                i64::from(pair[1] as i8)
            } else {
                i64::from(pair[1])
            };
        }
        line.max(0) as u32
    }

    /// PEP 626 table (3.10): `(byte_delta, line_delta)` pairs covering
    /// ranges; line delta -128 marks artificial instructions.
    fn line_from_pairs(&self, offset: u32) -> u32 {
        let mut line = i64::from(self.first_line);
        let mut start = 0u32;
        let mut found = line;
        for pair in self.line_table.chunks_exact(2) {
            let bdelta = u32::from(pair[0]);
            let ldelta = pair[1] as i8;
            if ldelta != -128 {
                line += i64::from(ldelta);
            }
            let end = start + bdelta;
            if start <= offset && offset < end && ldelta != -128 {
                found = line;
            }
            start = end;
        }
        found.max(0) as u32
    }

    /// 3.11+ locations table: flagged first byte carries an entry code and
    /// a code-unit length; line deltas use signed varints.
    fn line_from_locations(&self, offset: u32) -> u32 {
        let data = &self.line_table;
        let mut pos = 0usize;
        let mut line = i64::from(self.first_line);
        let mut unit = 0u32; // current code-unit cursor
        let mut found = line;

        let varint = |pos: &mut usize| -> u32 {
            let mut value = 0u32;
            loop {
                let Some(&b) = data.get(*pos) else { return value };
                *pos += 1;
                value = (value << 6) | u32::from(b & 0x3F);
                if b & 0x40 == 0 {
                    return value;
                }
            }
        };
        let svarint = |pos: &mut usize| -> i64 {
            let raw = varint(pos);
            let magnitude = i64::from(raw >> 1);
            if raw & 1 != 0 {
                -magnitude
            } else {
                magnitude
            }
        };

        while pos < data.len() {
            let first = data[pos];
            pos += 1;
            if first & 0x80 == 0 {
                break; // out of sync; stop rather than misattribute
            }
            let code = (first >> 3) & 0x0F;
            let length = u32::from(first & 0x07) + 1;
            let mut has_line = true;
            match code {
                15 => has_line = false,
                14 => {
                    line += svarint(&mut pos);
                    let _end_line = varint(&mut pos);
                    let _col = varint(&mut pos);
                    let _end_col = varint(&mut pos);
                }
                13 => line += svarint(&mut pos),
                10..=12 => {
                    line += i64::from(code) - 10;
                    pos += 2; // column byte pair
                }
                _ => pos += 1, // short form: same line, one column byte
            }
            let start = unit * 2;
            let end = (unit + length) * 2;
            if has_line && start <= offset && offset < end {
                found = line;
            }
            unit += length;
        }
        found.max(0) as u32
    }
}

/// One decoded exception-table entry, in byte offsets.
///
/// `depth` is the operand-stack depth to unwind to before pushing the
/// exception; `lasti` means the offset of the raising instruction is
/// pushed below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExceptionEntry {
    /// Start of the protected range (inclusive).
    pub start: u32,
    /// End of the protected range (exclusive).
    pub end: u32,
    /// Handler entry offset.
    pub target: u32,
    pub depth: u32,
    pub lasti: bool,
}

impl ExceptionEntry {
    /// True if the protected range covers `offset`.
    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_code() -> CodeObject {
        CodeObject {
            arg_count: 0,
            pos_only_arg_count: 0,
            kw_only_arg_count: 0,
            n_locals: 0,
            stack_size: 0,
            flags: 0,
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
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

    #[test]
    fn test_exception_table_single_entry() {
        // start=0, length=4, target=6, depth=0 lasti=0
        // varints all fit in one 6-bit group; first byte gets 0x80.
        let mut code = empty_code();
        code.exception_table = vec![0x80, 4, 6, 0];
        let entries = code.exception_entries().unwrap();
        assert_eq!(
            entries,
            vec![ExceptionEntry {
                start: 0,
                end: 8,
                target: 12,
                depth: 0,
                lasti: false,
            }]
        );
        assert!(entries[0].contains(0));
        assert!(entries[0].contains(7));
        assert!(!entries[0].contains(8));
    }

    #[test]
    fn test_exception_table_varint_continuation() {
        // start = 100 units: 100 = 0b1_100100 -> groups [1, 0x24], first
        // byte 0x80 | 0x40 | 1.
        let mut code = empty_code();
        code.exception_table = vec![0xC1, 0x24, 2, 1, 3];
        let entries = code.exception_entries().unwrap();
        assert_eq!(entries[0].start, 200);
        assert_eq!(entries[0].end, 204);
        assert_eq!(entries[0].target, 2);
        assert_eq!(entries[0].depth, 1);
        assert!(entries[0].lasti);
    }

    #[test]
    fn test_exception_table_out_of_sync() {
        let mut code = empty_code();
        code.exception_table = vec![0x01];
        assert!(code.exception_entries().is_err());
    }

    #[test]
    fn test_lnotab_lines() {
        let mut code = empty_code();
        // 0..6 -> line 1, 6.. -> line 3
        code.line_table = vec![6, 2];
        let v = PyVersion::new(3, 9);
        assert_eq!(code.line_of(0, v), 1);
        assert_eq!(code.line_of(4, v), 1);
        assert_eq!(code.line_of(6, v), 3);
    }

    #[test]
    fn test_deref_names_311_index_localsplus() {
        let mut code = empty_code();
        code.var_names = vec!["a".into()];
        code.cell_vars = vec!["c".into()];
        code.free_vars = vec!["f".into()];
        let v311 = PyVersion::new(3, 11);
        assert_eq!(code.deref_name_at(1, v311), Some("c"));
        assert_eq!(code.deref_name_at(2, v311), Some("f"));
        let v39 = PyVersion::new(3, 9);
        assert_eq!(code.deref_name_at(0, v39), Some("c"));
        assert_eq!(code.deref_name_at(1, v39), Some("f"));
    }
}
