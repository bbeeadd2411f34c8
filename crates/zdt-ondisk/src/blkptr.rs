#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use zdt_types::{
    BLKPTR_SIZE, DNODE_SHIFT, ParseError, SPA_BLKPTRSHIFT, SPA_MINBLOCKSHIFT, Txg, ensure_slice,
    read_le_u64, write_le_u64,
};

const DVA_SIZE: usize = 16;
const BP_PROP_OFFSET: usize = 0x30;
const BP_PHYS_BIRTH_OFFSET: usize = 0x48;
const BP_BIRTH_OFFSET: usize = 0x50;
const BP_FILL_OFFSET: usize = 0x58;
const BP_CKSUM_OFFSET: usize = 0x60;

/// Checksum word holding the intent-log chain sequence number.
pub const ZIL_ZC_SEQ: usize = 3;
/// Checksum word holding the owning object set of an intent-log block.
pub const ZIL_ZC_OBJSET: usize = 2;

/// Checksum algorithm ids consumed by this workspace.
pub const ZIO_CHECKSUM_FLETCHER_4: u8 = 7;
pub const ZIO_CHECKSUM_ZILOG2: u8 = 9;

// ── Object types ────────────────────────────────────────────────────────────

/// Semantic type tag carried by block pointers and dnodes.
///
/// Only the types the traversal engine dispatches on get their own variant;
/// everything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[default]
    None,
    ObjectDirectory,
    IntentLog,
    Dnode,
    Objset,
    DslDir,
    DslDataset,
    PlainFileContents,
    Other(u8),
}

impl ObjectType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::ObjectDirectory,
            9 => Self::IntentLog,
            10 => Self::Dnode,
            11 => Self::Objset,
            12 => Self::DslDir,
            16 => Self::DslDataset,
            19 => Self::PlainFileContents,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ObjectDirectory => 1,
            Self::IntentLog => 9,
            Self::Dnode => 10,
            Self::Objset => 11,
            Self::DslDir => 12,
            Self::DslDataset => 16,
            Self::PlainFileContents => 19,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ObjectDirectory => write!(f, "object_directory"),
            Self::IntentLog => write!(f, "intent_log"),
            Self::Dnode => write!(f, "dnode"),
            Self::Objset => write!(f, "objset"),
            Self::DslDir => write!(f, "dsl_dir"),
            Self::DslDataset => write!(f, "dsl_dataset"),
            Self::PlainFileContents => write!(f, "plain_file_contents"),
            Self::Other(raw) => write!(f, "type_{raw}"),
        }
    }
}

// ── DVA ─────────────────────────────────────────────────────────────────────

/// Data virtual address: one physical copy of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dva {
    pub vdev: u32,
    /// Byte offset on the vdev (sector aligned).
    pub offset: u64,
    /// Allocated size in bytes (sector aligned).
    pub asize: u64,
    pub gang: bool,
}

impl Dva {
    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let word0 = read_le_u64(data, offset)?;
        let word1 = read_le_u64(data, offset + 8)?;
        let vdev = u32::try_from(word0 >> 32)
            .map_err(|_| ParseError::IntegerConversion { field: "dva_vdev" })?;
        Ok(Self {
            vdev,
            offset: (word1 & !(1_u64 << 63)) << SPA_MINBLOCKSHIFT,
            asize: (word0 & 0x00FF_FFFF) << SPA_MINBLOCKSHIFT,
            gang: word1 >> 63 != 0,
        })
    }

    fn encode_into(&self, out: &mut [u8], offset: usize) {
        let word0 = (u64::from(self.vdev) << 32) | ((self.asize >> SPA_MINBLOCKSHIFT) & 0x00FF_FFFF);
        let mut word1 = (self.offset >> SPA_MINBLOCKSHIFT) & !(1_u64 << 63);
        if self.gang {
            word1 |= 1_u64 << 63;
        }
        write_le_u64(out, offset, word0);
        write_le_u64(out, offset + 8, word1);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.asize == 0 && self.offset == 0 && self.vdev == 0
    }
}

impl fmt::Display for Dva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}:{:#x}", self.vdev, self.offset, self.asize)
    }
}

// ── Block pointer ───────────────────────────────────────────────────────────

/// On-disk reference to a physical block (128 bytes).
///
/// A zero birth txg marks a hole: no block was ever written there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub dva: [Dva; 3],
    /// Logical (uncompressed) size in bytes.
    pub lsize: u32,
    /// Physical size in bytes.
    pub psize: u32,
    pub compression: u8,
    pub checksum_type: u8,
    pub object_type: ObjectType,
    /// 0 for leaf blocks, > 0 for arrays of child block pointers.
    pub level: u8,
    pub phys_birth: Txg,
    pub birth: Txg,
    pub fill: u64,
    pub checksum: [u64; 4],
}

impl BlockPointer {
    /// An all-zero hole.
    #[must_use]
    pub fn hole() -> Self {
        Self::default()
    }

    /// Parse the block pointer stored at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, BLKPTR_SIZE)?;
        if raw.iter().all(|byte| *byte == 0) {
            return Ok(Self::hole());
        }

        let prop = read_le_u64(raw, BP_PROP_OFFSET)?.to_le_bytes();
        let lsize = sectors_to_bytes(u16::from_le_bytes([prop[0], prop[1]]), "lsize")?;
        let psize = sectors_to_bytes(u16::from_le_bytes([prop[2], prop[3]]), "psize")?;
        let (compression, checksum_type, object_type, level) =
            (prop[4], prop[5], prop[6], prop[7] & 0x1F);

        Ok(Self {
            dva: [
                Dva::parse(raw, 0)?,
                Dva::parse(raw, DVA_SIZE)?,
                Dva::parse(raw, 2 * DVA_SIZE)?,
            ],
            lsize,
            psize,
            compression,
            checksum_type,
            object_type: ObjectType::from_raw(object_type),
            level,
            phys_birth: Txg(read_le_u64(raw, BP_PHYS_BIRTH_OFFSET)?),
            birth: Txg(read_le_u64(raw, BP_BIRTH_OFFSET)?),
            fill: read_le_u64(raw, BP_FILL_OFFSET)?,
            checksum: [
                read_le_u64(raw, BP_CKSUM_OFFSET)?,
                read_le_u64(raw, BP_CKSUM_OFFSET + 8)?,
                read_le_u64(raw, BP_CKSUM_OFFSET + 16)?,
                read_le_u64(raw, BP_CKSUM_OFFSET + 24)?,
            ],
        })
    }

    /// Parse entry `index` of a packed block-pointer array.
    pub fn parse_at_index(data: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index
            .checked_mul(BLKPTR_SIZE)
            .ok_or(ParseError::IntegerConversion {
                field: "blkptr_index",
            })?;
        Self::parse(data, offset)
    }

    /// Encode into `out[offset..offset + 128]`.
    ///
    /// Holes encode as 128 zero bytes so that a zeroed buffer parses back
    /// as an array of holes.
    pub fn encode_into(&self, out: &mut [u8], offset: usize) {
        let raw = &mut out[offset..offset + BLKPTR_SIZE];
        raw.fill(0);
        if *self == Self::default() {
            return;
        }

        for (i, dva) in self.dva.iter().enumerate() {
            dva.encode_into(raw, i * DVA_SIZE);
        }
        let prop = u64::from(bytes_to_sectors(self.lsize))
            | (u64::from(bytes_to_sectors(self.psize)) << 16)
            | (u64::from(self.compression) << 32)
            | (u64::from(self.checksum_type) << 40)
            | (u64::from(self.object_type.raw()) << 48)
            | (u64::from(self.level & 0x1F) << 56);
        write_le_u64(raw, BP_PROP_OFFSET, prop);
        write_le_u64(raw, BP_PHYS_BIRTH_OFFSET, self.phys_birth.0);
        write_le_u64(raw, BP_BIRTH_OFFSET, self.birth.0);
        write_le_u64(raw, BP_FILL_OFFSET, self.fill);
        for (i, word) in self.checksum.iter().enumerate() {
            write_le_u64(raw, BP_CKSUM_OFFSET + i * 8, *word);
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLKPTR_SIZE] {
        let mut out = [0_u8; BLKPTR_SIZE];
        self.encode_into(&mut out, 0);
        out
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.birth == Txg::ZERO
    }

    #[must_use]
    pub fn is_indirect(&self) -> bool {
        self.level > 0
    }

    /// Child block pointers held by this block when it is indirect.
    #[must_use]
    pub fn pointers_per_block(&self) -> usize {
        (self.lsize >> SPA_BLKPTRSHIFT) as usize
    }

    /// Dnode records held by this block when it is a dnode block.
    #[must_use]
    pub fn dnodes_per_block(&self) -> usize {
        (self.lsize >> DNODE_SHIFT) as usize
    }

    /// Intent-log chain sequence number (meaningful for log blocks only).
    #[must_use]
    pub fn zil_seq(&self) -> u64 {
        self.checksum[ZIL_ZC_SEQ]
    }

    /// The primary copy, used as the cache and store key.
    #[must_use]
    pub fn primary_dva(&self) -> Dva {
        self.dva[0]
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            return write!(f, "HOLE [L{} {}] size={:#x}L", self.level, self.object_type, self.lsize);
        }
        write!(
            f,
            "DVA[0]={} [L{} {}] size={:#x}L/{:#x}P birth={}L/{}P fill={}",
            self.dva[0],
            self.level,
            self.object_type,
            self.lsize,
            self.psize,
            self.birth,
            self.phys_birth,
            self.fill
        )
    }
}

fn sectors_to_bytes(encoded: u16, field: &'static str) -> Result<u32, ParseError> {
    (u32::from(encoded) + 1)
        .checked_mul(1 << SPA_MINBLOCKSHIFT)
        .ok_or(ParseError::IntegerConversion { field })
}

fn bytes_to_sectors(bytes: u32) -> u32 {
    (bytes >> SPA_MINBLOCKSHIFT).saturating_sub(1) & 0xFFFF
}
