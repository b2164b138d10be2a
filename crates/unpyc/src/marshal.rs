//! Marshal object-graph reader.
//!
//! pyc containers serialize one code object with CPython's `marshal`
//! format: a type byte (possibly with the reference flag `0x80` set)
//! followed by type-specific payload. This module reads the full graph,
//! tracking back-references the way the writer emitted them, and produces
//! `Obj` values that later become `Expr` constants unchanged.
//!
//! Containers that carry the reference flag reserve their slot in the ref
//! list before their children are read, matching the writer's order.

use std::rc::Rc;

use num_bigint::{BigInt, BigUint, Sign};

use crate::{
    code::CodeObject,
    error::{DecompileError, DecompileResult},
    version::PyVersion,
};

/// A marshalled constant.
///
/// This is the constant-pool value space: everything a pyc can store in
/// `co_consts`, including nested code objects. Equality is structural,
/// which is what the stack-merge rule needs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Obj {
    None,
    StopIteration,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision int (marshal type `l`, sign-magnitude base 2^15).
    Long(BigInt),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Obj>),
    List(Vec<Obj>),
    Dict(Vec<(Obj, Obj)>),
    Set(Vec<Obj>),
    FrozenSet(Vec<Obj>),
    Code(Rc<CodeObject>),
}

impl Obj {
    /// Returns the string form of a name-position object.
    ///
    /// Python 3 names are unicode; Python 2 names arrive as (interned)
    /// byte strings and are read as latin-1.
    #[must_use]
    pub fn as_name(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Bytes(b) => Some(b.iter().map(|&c| c as char).collect()),
            _ => None,
        }
    }

    /// Returns the tuple elements, or `None` for non-tuples.
    ///
    /// `None` (the object) is accepted as an empty tuple: old writers used
    /// it for absent name tuples.
    #[must_use]
    pub fn as_tuple(&self) -> Option<&[Obj]> {
        match self {
            Self::Tuple(items) => Some(items),
            Self::None => Some(&[]),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Short type name for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::StopIteration => "StopIteration",
            Self::Ellipsis => "Ellipsis",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::Long(_) => "int",
            Self::Float(_) => "float",
            Self::Complex(..) => "complex",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::FrozenSet(_) => "frozenset",
            Self::Code(_) => "code",
        }
    }
}

/// Reference-flag bit on the type byte (3.4+ writers).
const FLAG_REF: u8 = 0x80;

/// Reads marshal data for one container.
pub struct MarshalReader<'a> {
    data: &'a [u8],
    pos: usize,
    version: PyVersion,
    /// Back-reference list for `r`-type objects (flag bit writers).
    refs: Vec<Obj>,
    /// Intern list for Python 2's `t`/`R` string interning.
    interned: Vec<Obj>,
}

impl<'a> MarshalReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], version: PyVersion) -> Self {
        Self {
            data,
            pos: 0,
            version,
            refs: Vec::new(),
            interned: Vec::new(),
        }
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn err<T>(&self, reason: impl Into<String>) -> DecompileResult<T> {
        Err(DecompileError::Marshal {
            offset: self.pos,
            reason: reason.into(),
        })
    }

    fn take(&mut self, n: usize) -> DecompileResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return self.err(format!("truncated: wanted {n} bytes"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> DecompileResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DecompileResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> DecompileResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> DecompileResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> DecompileResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn f64(&mut self) -> DecompileResult<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Length-prefixed byte slice with an i32 length.
    fn bytes32(&mut self) -> DecompileResult<Vec<u8>> {
        let len = self.i32()?;
        if len < 0 {
            return self.err("negative length");
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Legacy text float: u8 length + ascii digits.
    fn text_float(&mut self) -> DecompileResult<f64> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| DecompileError::Marshal {
            offset: self.pos,
            reason: "float literal is not ascii".into(),
        })?;
        text.parse::<f64>().map_err(|_| DecompileError::Marshal {
            offset: self.pos,
            reason: format!("bad float literal {text:?}"),
        })
    }

    /// Sign-magnitude base 2^15 long.
    fn long(&mut self) -> DecompileResult<BigInt> {
        let size = self.i32()?;
        let negative = size < 0;
        let ndigits = size.unsigned_abs() as usize;
        // Digits are stored low-to-high; read them all, then fold high-to-low.
        let mut digits = Vec::with_capacity(ndigits);
        for _ in 0..ndigits {
            let digit = self.u16()?;
            if digit >= 1 << 15 {
                return self.err("long digit out of range");
            }
            digits.push(digit);
        }
        let mut magnitude = BigUint::default();
        for &digit in digits.iter().rev() {
            magnitude = (magnitude << 15u32) | BigUint::from(digit);
        }
        let sign = if negative {
            Sign::Minus
        } else if magnitude == BigUint::default() {
            Sign::NoSign
        } else {
            Sign::Plus
        };
        Ok(BigInt::from_biguint(sign, magnitude))
    }

    fn utf8(&mut self, raw: Vec<u8>) -> DecompileResult<String> {
        String::from_utf8(raw).map_err(|_| DecompileError::Marshal {
            offset: self.pos,
            reason: "invalid utf-8 in string".into(),
        })
    }

    /// Reserves a ref slot for a container being read, if flagged.
    fn reserve_ref(&mut self, flagged: bool) -> Option<usize> {
        if flagged {
            self.refs.push(Obj::None);
            Some(self.refs.len() - 1)
        } else {
            None
        }
    }

    /// Fills a reserved slot (or appends a leaf) once the object is built.
    fn commit_ref(&mut self, slot: Option<usize>, obj: &Obj) {
        if let Some(idx) = slot {
            self.refs[idx] = obj.clone();
        }
    }

    fn note_leaf_ref(&mut self, flagged: bool, obj: &Obj) {
        if flagged {
            self.refs.push(obj.clone());
        }
    }

    /// Reads one object from the stream.
    pub fn read_object(&mut self) -> DecompileResult<Obj> {
        let type_byte = self.u8()?;
        let flagged = type_byte & FLAG_REF != 0;
        let kind = type_byte & !FLAG_REF;

        let obj = match kind {
            b'N' => Obj::None,
            b'S' => Obj::StopIteration,
            b'.' => Obj::Ellipsis,
            b'F' => Obj::Bool(false),
            b'T' => Obj::Bool(true),
            b'i' => {
                let obj = Obj::Int(i64::from(self.i32()?));
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'I' => {
                let obj = Obj::Int(self.i64()?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'l' => {
                let obj = Obj::Long(self.long()?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'g' => {
                let obj = Obj::Float(self.f64()?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'f' => {
                let obj = Obj::Float(self.text_float()?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'y' => {
                let real = self.f64()?;
                let imag = self.f64()?;
                let obj = Obj::Complex(real, imag);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'x' => {
                let real = self.text_float()?;
                let imag = self.text_float()?;
                let obj = Obj::Complex(real, imag);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b's' => {
                // Python 3: bytes. Python 2: str (kept as bytes; names go
                // through `Obj::as_name`).
                let obj = Obj::Bytes(self.bytes32()?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b't' => {
                let obj = if self.version.at_least(3, 0) {
                    // 3.x wrote interned unicode under 't' for a while.
                    let raw = self.bytes32()?;
                    Obj::Str(self.utf8(raw)?)
                } else {
                    let obj = Obj::Bytes(self.bytes32()?);
                    self.interned.push(obj.clone());
                    obj
                };
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'R' => {
                let idx = self.i32()?;
                let Some(obj) = self.interned.get(idx as usize) else {
                    return self.err(format!("string ref {idx} out of range"));
                };
                return Ok(obj.clone());
            }
            b'u' => {
                let raw = self.bytes32()?;
                let obj = Obj::Str(self.utf8(raw)?);
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'a' | b'A' => {
                let raw = self.bytes32()?;
                let obj = Obj::Str(raw.iter().map(|&c| c as char).collect());
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'z' | b'Z' => {
                let len = self.u8()? as usize;
                let raw = self.take(len)?;
                let obj = Obj::Str(raw.iter().map(|&c| c as char).collect());
                self.note_leaf_ref(flagged, &obj);
                return Ok(obj);
            }
            b'(' | b')' => {
                let count = if kind == b')' {
                    usize::from(self.u8()?)
                } else {
                    let n = self.i32()?;
                    if n < 0 {
                        return self.err("negative tuple length");
                    }
                    n as usize
                };
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_object()?);
                }
                let obj = Obj::Tuple(items);
                self.commit_ref(slot, &obj);
                return Ok(obj);
            }
            b'[' => {
                let n = self.i32()?;
                if n < 0 {
                    return self.err("negative list length");
                }
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity((n as usize).min(4096));
                for _ in 0..n {
                    items.push(self.read_object()?);
                }
                let obj = Obj::List(items);
                self.commit_ref(slot, &obj);
                return Ok(obj);
            }
            b'{' => {
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::new();
                loop {
                    // A NULL type byte terminates the key stream.
                    if self.data.get(self.pos) == Some(&b'0') {
                        self.pos += 1;
                        break;
                    }
                    let key = self.read_object()?;
                    let value = self.read_object()?;
                    items.push((key, value));
                }
                let obj = Obj::Dict(items);
                self.commit_ref(slot, &obj);
                return Ok(obj);
            }
            b'<' | b'>' => {
                let n = self.i32()?;
                if n < 0 {
                    return self.err("negative set length");
                }
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity((n as usize).min(4096));
                for _ in 0..n {
                    items.push(self.read_object()?);
                }
                let obj = if kind == b'>' {
                    Obj::FrozenSet(items)
                } else {
                    Obj::Set(items)
                };
                self.commit_ref(slot, &obj);
                return Ok(obj);
            }
            b'r' => {
                let idx = self.i32()?;
                let Some(obj) = self.refs.get(idx as usize) else {
                    return self.err(format!("object ref {idx} out of range"));
                };
                return Ok(obj.clone());
            }
            b'c' => {
                let slot = self.reserve_ref(flagged);
                let code = self.read_code()?;
                let obj = Obj::Code(Rc::new(code));
                self.commit_ref(slot, &obj);
                return Ok(obj);
            }
            b'0' => return self.err("unexpected NULL object"),
            other => return self.err(format!("unknown marshal type {:?}", other as char)),
        };
        // Singleton arms fall through here; they are never ref-listed by
        // modern writers but old ones flagged them anyway.
        self.note_leaf_ref(flagged, &obj);
        Ok(obj)
    }

    /// Reads a code object body (the `c` payload), versioned.
    fn read_code(&mut self) -> DecompileResult<CodeObject> {
        let v = self.version;

        // Counts: 16-bit before 2.3, 32-bit after.
        let small = v.before(2, 3);
        let mut read_count = |reader: &mut Self| -> DecompileResult<u32> {
            if small {
                Ok(u32::from(reader.u16()?))
            } else {
                Ok(reader.u32()?)
            }
        };

        let arg_count = if v.at_least(1, 3) { read_count(self)? } else { 0 };
        let pos_only_arg_count = if v.at_least(3, 8) { read_count(self)? } else { 0 };
        let kw_only_arg_count = if v.at_least(3, 0) { read_count(self)? } else { 0 };
        let n_locals = if v.at_least(1, 3) && v.before(3, 11) {
            read_count(self)?
        } else {
            0
        };
        let stack_size = if v.at_least(1, 5) { read_count(self)? } else { 0 };
        let flags = if v.at_least(1, 3) { read_count(self)? } else { 0 };

        let code = match self.read_object()? {
            Obj::Bytes(b) => b,
            other => return self.err(format!("co_code is {}, expected bytes", other.type_name())),
        };
        let consts = match self.read_object()? {
            Obj::Tuple(items) => items,
            other => return self.err(format!("co_consts is {}, expected tuple", other.type_name())),
        };
        let names = self.read_name_tuple("co_names")?;

        let (var_names, cell_vars, free_vars, n_locals) = if v.at_least(3, 11) {
            // 3.11 merged varnames/cellvars/freevars into localsplus.
            let names = self.read_name_tuple("co_localsplusnames")?;
            let kinds = match self.read_object()? {
                Obj::Bytes(b) => b,
                other => {
                    return self.err(format!("co_localspluskinds is {}, expected bytes", other.type_name()));
                }
            };
            if kinds.len() != names.len() {
                return self.err("localsplus kinds/names length mismatch");
            }
            let mut var_names = Vec::new();
            let mut cell_vars = Vec::new();
            let mut free_vars = Vec::new();
            for (name, kind) in names.into_iter().zip(kinds) {
                const CO_FAST_LOCAL: u8 = 0x20;
                const CO_FAST_CELL: u8 = 0x40;
                const CO_FAST_FREE: u8 = 0x80;
                if kind & CO_FAST_FREE != 0 {
                    free_vars.push(name);
                } else if kind & CO_FAST_CELL != 0 {
                    cell_vars.push(name);
                } else if kind & CO_FAST_LOCAL != 0 {
                    var_names.push(name);
                } else {
                    return self.err(format!("unknown local kind {kind:#x}"));
                }
            }
            let n_locals = var_names.len() as u32;
            (var_names, cell_vars, free_vars, n_locals)
        } else {
            let var_names = if v.at_least(1, 3) {
                self.read_name_tuple("co_varnames")?
            } else {
                Vec::new()
            };
            let (free_vars, cell_vars) = if v.at_least(2, 1) {
                (
                    self.read_name_tuple("co_freevars")?,
                    self.read_name_tuple("co_cellvars")?,
                )
            } else {
                (Vec::new(), Vec::new())
            };
            (var_names, cell_vars, free_vars, n_locals)
        };

        let filename = self.read_name("co_filename")?;
        let name = self.read_name("co_name")?;
        let qualname = if v.at_least(3, 11) {
            self.read_name("co_qualname")?
        } else {
            name.clone()
        };

        let first_line = if v.at_least(1, 5) { read_count(self)? } else { 0 };
        let line_table = if v.at_least(1, 5) {
            match self.read_object()? {
                Obj::Bytes(b) => b,
                Obj::None => Vec::new(),
                other => return self.err(format!("line table is {}, expected bytes", other.type_name())),
            }
        } else {
            Vec::new()
        };
        let exception_table = if v.at_least(3, 11) {
            match self.read_object()? {
                Obj::Bytes(b) => b,
                other => {
                    return self.err(format!("exception table is {}, expected bytes", other.type_name()));
                }
            }
        } else {
            Vec::new()
        };

        Ok(CodeObject {
            arg_count,
            pos_only_arg_count,
            kw_only_arg_count,
            n_locals,
            stack_size,
            flags,
            code,
            consts,
            names,
            var_names,
            free_vars,
            cell_vars,
            filename,
            name,
            qualname,
            first_line,
            line_table,
            exception_table,
        })
    }

    fn read_name(&mut self, field: &str) -> DecompileResult<String> {
        let obj = self.read_object()?;
        obj.as_name().ok_or_else(|| DecompileError::Marshal {
            offset: self.pos,
            reason: format!("{field} is {}, expected str", obj.type_name()),
        })
    }

    fn read_name_tuple(&mut self, field: &str) -> DecompileResult<Vec<String>> {
        let obj = self.read_object()?;
        let Some(items) = obj.as_tuple() else {
            return self.err(format!("{field} is {}, expected tuple", obj.type_name()));
        };
        items
            .iter()
            .map(|item| {
                item.as_name().ok_or_else(|| DecompileError::Marshal {
                    offset: self.pos,
                    reason: format!("{field} element is {}, expected str", item.type_name()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(data: &[u8], version: PyVersion) -> Obj {
        MarshalReader::new(data, version).read_object().unwrap()
    }

    const V311: PyVersion = PyVersion::new(3, 11);

    #[test]
    fn test_singletons() {
        assert_eq!(read(b"N", V311), Obj::None);
        assert_eq!(read(b"T", V311), Obj::Bool(true));
        assert_eq!(read(b"F", V311), Obj::Bool(false));
        assert_eq!(read(b".", V311), Obj::Ellipsis);
    }

    #[test]
    fn test_int32() {
        assert_eq!(read(b"i\x2a\x00\x00\x00", V311), Obj::Int(42));
        assert_eq!(read(b"i\xff\xff\xff\xff", V311), Obj::Int(-1));
    }

    #[test]
    fn test_long_base_2_15() {
        // 2 digits: 1 + 2*2^15 = 65537
        let mut data = vec![b'l', 2, 0, 0, 0];
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        assert_eq!(read(&data, V311), Obj::Long(BigInt::from(65537)));

        // Negative size means negative value.
        let mut data = vec![b'l', 0xff, 0xff, 0xff, 0xff];
        data.extend_from_slice(&5u16.to_le_bytes());
        assert_eq!(read(&data, V311), Obj::Long(BigInt::from(-5)));
    }

    #[test]
    fn test_short_ascii_and_unicode() {
        assert_eq!(read(b"z\x02hi", V311), Obj::Str("hi".into()));
        assert_eq!(read(b"u\x02\x00\x00\x00hi", V311), Obj::Str("hi".into()));
    }

    #[test]
    fn test_small_tuple() {
        let obj = read(b")\x02z\x01aT", V311);
        assert_eq!(obj, Obj::Tuple(vec![Obj::Str("a".into()), Obj::Bool(true)]));
    }

    #[test]
    fn test_ref_roundtrip() {
        // Flagged string, then a backref to it.
        let obj = read(b")\x02\xfa\x01ar\x00\x00\x00\x00", V311);
        assert_eq!(obj, Obj::Tuple(vec![Obj::Str("a".into()), Obj::Str("a".into())]));
    }

    #[test]
    fn test_dict_terminated_by_null() {
        let obj = read(b"{z\x01ai\x01\x00\x00\x000", V311);
        assert_eq!(obj, Obj::Dict(vec![(Obj::Str("a".into()), Obj::Int(1))]));
    }

    #[test]
    fn test_truncated_input_errors() {
        let err = MarshalReader::new(b"i\x01\x02", V311).read_object().unwrap_err();
        assert!(matches!(err, DecompileError::Marshal { .. }));
    }

    #[test]
    fn test_unknown_type_errors() {
        let err = MarshalReader::new(b"q", V311).read_object().unwrap_err();
        assert!(err.summary().contains("unknown marshal type"));
    }
}
