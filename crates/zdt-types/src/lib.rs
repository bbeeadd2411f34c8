#![forbid(unsafe_code)]
//! Shared newtypes, position bookmarks and byte-level parse helpers.
//!
//! Everything in this crate is format-neutral: the on-disk layouts live in
//! `zdt-ondisk`, the runtime error type in `zdt-error`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// log2 of the smallest allocatable unit (one 512-byte sector).
pub const SPA_MINBLOCKSHIFT: u32 = 9;
pub const SPA_MINBLOCKSIZE: usize = 1 << SPA_MINBLOCKSHIFT;
pub const SPA_MAXBLOCKSHIFT: u32 = 17;
pub const SPA_MAXBLOCKSIZE: usize = 1 << SPA_MAXBLOCKSHIFT;

/// log2 of the on-disk block pointer size.
pub const SPA_BLKPTRSHIFT: u32 = 7;
pub const BLKPTR_SIZE: usize = 1 << SPA_BLKPTRSHIFT;

/// log2 of the on-disk dnode record size.
pub const DNODE_SHIFT: u32 = 9;
pub const DNODE_SIZE: usize = 1 << DNODE_SHIFT;

/// Object-set header sizes: the old format lacks the accounting dnodes.
pub const OBJSET_OLD_PHYS_SIZE: usize = 1024;
pub const OBJSET_PHYS_SIZE: usize = 2048;

/// Transaction group number (the "birth" generation of a block).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Txg(pub u64);

impl Txg {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object-set (dataset) identifier. The meta object set is `0`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjsetId(pub u64);

impl ObjsetId {
    pub const META: Self = Self(0);
}

impl fmt::Display for ObjsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object number within an object set.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The meta dnode that indexes every other dnode of an object set.
    pub const META_DNODE: Self = Self(0);
    /// User space accounting object (`-1` in two's complement).
    pub const USER_USED: Self = Self(u64::MAX);
    /// Group space accounting object (`-2` in two's complement).
    pub const GROUP_USED: Self = Self(u64::MAX - 1);
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Accounting objects read better as their signed values.
        #[allow(clippy::cast_possible_wrap)]
        let signed = self.0 as i64;
        if signed < 0 {
            write!(f, "{signed}")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Stable coordinate of a visited block: `(objset, object, level, blkid)`.
///
/// Every callback invocation receives one. Derived ordering is
/// lexicographic over the fields in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bookmark {
    pub objset: ObjsetId,
    pub object: ObjectId,
    pub level: i64,
    pub blkid: u64,
}

impl Bookmark {
    pub const ROOT_OBJECT: ObjectId = ObjectId(0);
    pub const ROOT_LEVEL: i64 = -1;
    pub const ROOT_BLKID: u64 = 0;

    pub const ZIL_OBJECT: ObjectId = ObjectId(0);
    pub const ZIL_LEVEL: i64 = -2;

    /// Block id used for an object's spill block.
    pub const SPILL_BLKID: u64 = u64::MAX;

    #[must_use]
    pub fn new(objset: ObjsetId, object: ObjectId, level: i64, blkid: u64) -> Self {
        Self {
            objset,
            object,
            level,
            blkid,
        }
    }

    /// The bookmark of an object set's root block pointer.
    #[must_use]
    pub fn root(objset: ObjsetId) -> Self {
        Self::new(objset, Self::ROOT_OBJECT, Self::ROOT_LEVEL, Self::ROOT_BLKID)
    }

    /// Bookmark of one block in an intent-log chain, keyed by its sequence.
    #[must_use]
    pub fn zil_block(objset: ObjsetId, seq: u64) -> Self {
        Self::new(objset, Self::ZIL_OBJECT, Self::ZIL_LEVEL, seq)
    }

    /// Bookmark of a block referenced from a logged write record.
    #[must_use]
    pub fn zil_record(objset: ObjsetId, object: ObjectId, blkid: u64) -> Self {
        Self::new(objset, object, Self::ZIL_LEVEL, blkid)
    }

    #[must_use]
    pub fn spill(objset: ObjsetId, object: ObjectId) -> Self {
        Self::new(objset, object, 0, Self::SPILL_BLKID)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.object == Self::ROOT_OBJECT
            && self.level == Self::ROOT_LEVEL
            && self.blkid == Self::ROOT_BLKID
    }

    #[must_use]
    pub fn is_log(&self) -> bool {
        self.level == Self::ZIL_LEVEL
    }

    #[must_use]
    pub fn is_spill(&self) -> bool {
        self.level == 0 && self.blkid == Self::SPILL_BLKID
    }

    /// True if the block at `self` lies in the subtree rooted at `ancestor`.
    ///
    /// Only meaningful within one object's block tree: `ancestor` must be an
    /// indirect position of the same object (level > `self.level`). `epb` is
    /// the fan-out (block pointers per indirect block) of that object.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self, epb: u64) -> bool {
        if self.objset != ancestor.objset
            || self.object != ancestor.object
            || self.level >= ancestor.level
            || self.level < 0
            || self.is_spill()
        {
            return false;
        }
        let Ok(depth) = u32::try_from(ancestor.level - self.level) else {
            return false;
        };
        let Some(span) = epb.checked_pow(depth) else {
            return false;
        };
        self.blkid / span == ancestor.blkid
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}, {}, {}, {:#x}>",
            self.objset, self.object, self.level, self.blkid
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Borrow `len` bytes at `offset`, or report how short the input is.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get(offset..end)
        .ok_or_else(|| ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        })
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let mut out = [0_u8; N];
    out.copy_from_slice(ensure_slice(data, offset, N)?);
    Ok(out)
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset).map(u16::from_le_bytes)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset).map(u64::from_le_bytes)
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    ensure_slice(data, offset, 1).map(|bytes| bytes[0])
}

/// Write `value` little-endian at `offset`; the caller guarantees room.
#[inline]
pub fn write_le_u64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_readers_decode_and_bound_check() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x0201);
        assert_eq!(read_le_u32(&data, 1).unwrap(), 0x0504_0302);
        assert_eq!(read_le_u64(&data, 1).unwrap(), 0x0908_0706_0504_0302);
        assert_eq!(read_u8(&data, 8).unwrap(), 0x09);

        let err = read_le_u64(&data, 4).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 4,
                actual: 5,
            }
        );
        assert!(matches!(
            ensure_slice(&data, usize::MAX, 2),
            Err(ParseError::InvalidField {
                field: "offset",
                ..
            })
        ));
    }

    #[test]
    fn writers_round_trip_through_readers() {
        let mut buf = [0_u8; 16];
        write_le_u64(&mut buf, 3, 0xDEAD_BEEF_0102_0304);
        write_le_u16(&mut buf, 12, 0xABCD);
        assert_eq!(read_le_u64(&buf, 3).unwrap(), 0xDEAD_BEEF_0102_0304);
        assert_eq!(read_le_u16(&buf, 12).unwrap(), 0xABCD);
    }

    #[test]
    fn bookmark_sentinels() {
        let root = Bookmark::root(ObjsetId(54));
        assert!(root.is_root());
        assert!(!root.is_log());
        assert_eq!(root.level, -1);

        let log = Bookmark::zil_block(ObjsetId(54), 7);
        assert!(log.is_log());
        assert_eq!(log.object, Bookmark::ZIL_OBJECT);
        assert_eq!(log.blkid, 7);

        let spill = Bookmark::spill(ObjsetId(54), ObjectId(9));
        assert!(spill.is_spill());
        assert_eq!(spill.blkid, u64::MAX);
    }

    #[test]
    fn bookmark_display_uses_signed_accounting_objects() {
        let bm = Bookmark::new(ObjsetId(3), ObjectId::USER_USED, 0, 16);
        assert_eq!(bm.to_string(), "<3, -1, 0, 0x10>");
        let bm = Bookmark::new(ObjsetId(3), ObjectId(12), 2, 0);
        assert_eq!(bm.to_string(), "<3, 12, 2, 0x0>");
    }

    #[test]
    fn bookmark_descendant_relation() {
        let os = ObjsetId(1);
        let obj = ObjectId(5);
        let parent = Bookmark::new(os, obj, 2, 1);
        // Fan-out 4: level-0 blkids 16..32 live under <2, 1>.
        assert!(Bookmark::new(os, obj, 1, 4).is_descendant_of(&parent, 4));
        assert!(Bookmark::new(os, obj, 0, 16).is_descendant_of(&parent, 4));
        assert!(Bookmark::new(os, obj, 0, 31).is_descendant_of(&parent, 4));
        assert!(!Bookmark::new(os, obj, 0, 32).is_descendant_of(&parent, 4));
        assert!(!Bookmark::new(os, obj, 2, 1).is_descendant_of(&parent, 4));
        assert!(!Bookmark::new(os, ObjectId(6), 0, 16).is_descendant_of(&parent, 4));
        assert!(!Bookmark::spill(os, obj).is_descendant_of(&parent, 4));
    }

    #[test]
    fn bookmark_serde_round_trip() {
        let bm = Bookmark::new(ObjsetId(21), ObjectId(7), 1, 3);
        let json = serde_json::to_string(&bm).expect("serialize");
        let back: Bookmark = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(bm, back);
    }
}
