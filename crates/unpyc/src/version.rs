//! Python version tags and the capability gates derived from them.
//!
//! A `PyVersion` is the `(major, minor)` pair recovered from a pyc magic
//! number. Everything version-dependent in the crate (argument encoding,
//! jump arithmetic, exception-table presence, header layout) is asked of
//! this type rather than compared inline, so the gates live in one place.

use std::fmt;

/// A CPython release identified by `(major, minor)`.
///
/// Ordering follows release order, so gates read as
/// `version >= PyVersion::new(3, 11)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PyVersion {
    pub major: u8,
    pub minor: u8,
}

impl PyVersion {
    /// Creates a version tag.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Returns true if this version is at least `major.minor`.
    #[must_use]
    pub const fn at_least(self, major: u8, minor: u8) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }

    /// Returns true if this version is strictly before `major.minor`.
    #[must_use]
    pub const fn before(self, major: u8, minor: u8) -> bool {
        !self.at_least(major, minor)
    }

    /// Resolves a pyc magic number to a version.
    ///
    /// The magic is the first 4 bytes of the container, little-endian. From
    /// 1.5 on it is a 16-bit release counter followed by `\r\n`; the 1.0-1.4
    /// values predate that convention and are matched exactly.
    ///
    /// Returns `None` for unknown magics.
    #[must_use]
    pub fn from_magic(magic: u32) -> Option<Self> {
        // Pre-1.5 magics do not follow the counter-\r\n layout.
        match magic {
            0x0099_9902 => return Some(Self::new(1, 0)),
            0x0099_9903 => return Some(Self::new(1, 1)), // also 1.2
            0x0A0D_2E89 => return Some(Self::new(1, 3)),
            0x0A0D_1704 => return Some(Self::new(1, 4)),
            _ => {}
        }
        if magic >> 16 != 0x0A0D {
            return None;
        }
        let tag = (magic & 0xFFFF) as u16;
        let version = match tag {
            20121 => Self::new(1, 5),
            50428 => Self::new(1, 6),
            50823 => Self::new(2, 0),
            60202 => Self::new(2, 1),
            60717 => Self::new(2, 2),
            62011 | 62021 => Self::new(2, 3),
            62041 | 62051 | 62061 => Self::new(2, 4),
            62071 | 62081 | 62091 | 62092 | 62101 | 62111 | 62121 | 62131 => Self::new(2, 5),
            62151 | 62161 => Self::new(2, 6),
            62171 | 62181 | 62191 | 62201 | 62211 => Self::new(2, 7),
            3000..=3131 => Self::new(3, 0),
            3141..=3151 => Self::new(3, 1),
            3160..=3180 => Self::new(3, 2),
            3190..=3230 => Self::new(3, 3),
            3250..=3310 => Self::new(3, 4),
            3320..=3351 => Self::new(3, 5),
            3360..=3379 => Self::new(3, 6),
            3390..=3394 => Self::new(3, 7),
            3400..=3413 => Self::new(3, 8),
            3420..=3425 => Self::new(3, 9),
            3430..=3439 => Self::new(3, 10),
            3450..=3495 => Self::new(3, 11),
            3500..=3531 => Self::new(3, 12),
            3550..=3571 => Self::new(3, 13),
            3600..=3620 => Self::new(3, 14),
            _ => return None,
        };
        Some(version)
    }

    /// Size of the pyc header in bytes, magic included.
    ///
    /// Pre-3.3: magic + mtime. 3.3-3.6: magic + mtime + source size.
    /// 3.7+: magic + flags word + 8 bytes of mtime/size or source hash
    /// (PEP 552).
    #[must_use]
    pub const fn header_size(self) -> usize {
        if self.at_least(3, 7) {
            16
        } else if self.at_least(3, 3) {
            12
        } else {
            8
        }
    }

    /// True from 3.6 on: instructions are fixed 2-byte units.
    #[must_use]
    pub const fn word_code(self) -> bool {
        self.at_least(3, 6)
    }

    /// True from 3.11 on: exception handling uses a side table instead of
    /// SETUP_* block opcodes.
    #[must_use]
    pub const fn has_exception_table(self) -> bool {
        self.at_least(3, 11)
    }

    /// True from 3.11 on: CACHE units follow adaptive instructions.
    #[must_use]
    pub const fn has_inline_caches(self) -> bool {
        self.at_least(3, 11)
    }

    /// True from 3.10 on: jump arguments count instruction words, not bytes.
    #[must_use]
    pub const fn jumps_in_words(self) -> bool {
        self.at_least(3, 10)
    }

    /// True from 3.11 on: every jump is relative to the next instruction
    /// (backward jumps use the JUMP_BACKWARD family).
    #[must_use]
    pub const fn relative_jumps_only(self) -> bool {
        self.at_least(3, 11)
    }

    /// First opcode byte that carries an argument.
    #[must_use]
    pub const fn have_argument(self) -> u8 {
        if self.at_least(3, 14) {
            43
        } else if self.at_least(3, 13) {
            44
        } else {
            90
        }
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_roundtrip_311() {
        // 3495 is the released 3.11 magic: a7 0d 0d 0a
        let magic = u32::from_le_bytes([0xA7, 0x0D, 0x0D, 0x0A]);
        assert_eq!(PyVersion::from_magic(magic), Some(PyVersion::new(3, 11)));
    }

    #[test]
    fn test_magic_legacy() {
        let magic = u32::from_le_bytes([0x99, 0x4E, 0x0D, 0x0A]); // 20121 = 1.5
        assert_eq!(PyVersion::from_magic(magic), Some(PyVersion::new(1, 5)));
        assert_eq!(PyVersion::from_magic(0x0099_9902), Some(PyVersion::new(1, 0)));
    }

    #[test]
    fn test_magic_rejects_garbage() {
        assert_eq!(PyVersion::from_magic(0xDEAD_BEEF), None);
        // Right terminator, unknown counter.
        let magic = u32::from_le_bytes([0x01, 0x00, 0x0D, 0x0A]);
        assert_eq!(PyVersion::from_magic(magic), None);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(PyVersion::new(2, 7).header_size(), 8);
        assert_eq!(PyVersion::new(3, 4).header_size(), 12);
        assert_eq!(PyVersion::new(3, 12).header_size(), 16);
    }

    #[test]
    fn test_gates() {
        let v39 = PyVersion::new(3, 9);
        let v311 = PyVersion::new(3, 11);
        assert!(!v39.has_exception_table());
        assert!(v311.has_exception_table());
        assert!(!v39.jumps_in_words());
        assert!(PyVersion::new(3, 10).jumps_in_words());
        assert_eq!(v311.have_argument(), 90);
        assert_eq!(PyVersion::new(3, 13).have_argument(), 44);
        assert_eq!(PyVersion::new(3, 14).have_argument(), 43);
    }
}
