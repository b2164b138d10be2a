//! pyc container parsing: magic, header, and the marshalled code object.

use std::rc::Rc;

use log::debug;

use crate::{
    code::CodeObject,
    error::{DecompileError, DecompileResult},
    marshal::{MarshalReader, Obj},
    version::PyVersion,
};

/// A parsed container: the version tag and the top-level code object.
#[derive(Debug, Clone)]
pub struct PycFile {
    pub version: PyVersion,
    pub code: Rc<CodeObject>,
}

/// Parses a whole `.pyc` file.
///
/// The header layout is versioned: magic + mtime before 3.3, + source
/// size through 3.6, and the PEP 552 flags/hash form from 3.7. The
/// header's non-magic fields do not affect decompilation and are
/// skipped.
pub fn parse_pyc(data: &[u8]) -> DecompileResult<PycFile> {
    if data.len() < 4 {
        return Err(DecompileError::Marshal {
            offset: 0,
            reason: "container shorter than a magic number".into(),
        });
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let version = PyVersion::from_magic(magic).ok_or(DecompileError::UnsupportedVersion { magic })?;

    let header = version.header_size();
    if data.len() < header {
        return Err(DecompileError::Marshal {
            offset: data.len(),
            reason: format!("truncated header: {} bytes, Python {version} needs {header}", data.len()),
        });
    }

    debug!("container magic {magic:#010x} -> Python {version}");
    let mut reader = MarshalReader::new(&data[header..], version);
    let code = match reader.read_object()? {
        Obj::Code(code) => code,
        other => {
            return Err(DecompileError::Marshal {
                offset: header + reader.position(),
                reason: format!("container holds {}, expected a code object", other.type_name()),
            });
        }
    };

    Ok(PycFile { version, code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_input() {
        assert!(matches!(parse_pyc(b"\x0d"), Err(DecompileError::Marshal { .. })));
    }

    #[test]
    fn test_rejects_unknown_magic() {
        let err = parse_pyc(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DecompileError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_rejects_non_code_payload() {
        // Valid 2.7 magic (62211) + mtime, then a marshalled int.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x03, 0xF3, 0x0D, 0x0A]);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(b"i\x01\x00\x00\x00");
        let err = parse_pyc(&data).unwrap_err();
        assert!(err.summary().contains("expected a code object"));
    }

    #[test]
    fn test_parses_minimal_27_module() {
        // A hand-marshalled 2.7 code object whose body is just
        // LOAD_CONST None; RETURN_VALUE.
        let mut body = Vec::new();
        body.push(b'c'); // code
        body.extend_from_slice(&0u32.to_le_bytes()); // argcount
        body.extend_from_slice(&0u32.to_le_bytes()); // nlocals
        body.extend_from_slice(&1u32.to_le_bytes()); // stacksize
        body.extend_from_slice(&64u32.to_le_bytes()); // flags
        body.push(b's'); // co_code
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(&[100, 0, 0, 83]); // LOAD_CONST 0; RETURN_VALUE
        body.push(b'('); // consts
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(b'N');
        for _ in 0..4 {
            // names, varnames, freevars, cellvars
            body.push(b'(');
            body.extend_from_slice(&0u32.to_le_bytes());
        }
        body.push(b's'); // filename
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(b"test.py");
        body.push(b's'); // name
        body.extend_from_slice(&8u32.to_le_bytes());
        body.extend_from_slice(b"<module>");
        body.extend_from_slice(&1u32.to_le_bytes()); // firstlineno
        body.push(b's'); // lnotab
        body.extend_from_slice(&0u32.to_le_bytes());

        let mut data = Vec::new();
        data.extend_from_slice(&[0x03, 0xF3, 0x0D, 0x0A]); // 2.7 magic
        data.extend_from_slice(&[0, 0, 0, 0]); // mtime
        data.extend_from_slice(&body);

        let pyc = parse_pyc(&data).unwrap();
        assert_eq!(pyc.version, PyVersion::new(2, 7));
        assert_eq!(pyc.code.name, "<module>");
        assert_eq!(pyc.code.code, vec![100, 0, 0, 83]);
        assert_eq!(pyc.code.consts, vec![Obj::None]);
    }
}
