#![forbid(unsafe_code)]

use crate::blkptr::{BlockPointer, ObjectType};
use serde::{Deserialize, Serialize};
use zdt_types::{
    BLKPTR_SIZE, DNODE_SIZE, ParseError, SPA_BLKPTRSHIFT, SPA_MINBLOCKSHIFT, ensure_slice,
    read_le_u16, read_le_u64, read_u8, write_le_u16, write_le_u64,
};

/// Offset of the first block pointer inside a dnode record.
const DNODE_CORE_SIZE: usize = 0x40;
/// Offset of the spill block pointer (last 128 bytes of the record).
const DNODE_SPILL_OFFSET: usize = DNODE_SIZE - BLKPTR_SIZE;
/// At most three block pointers fit after the 64-byte core.
pub const DN_MAX_NBLKPTR: u8 = 3;

/// Dnode flag bits (`dn_flags`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnodeFlags(pub u8);

impl DnodeFlags {
    pub const USED_BYTES: Self = Self(1 << 0);
    pub const USERUSED_ACCOUNTED: Self = Self(1 << 1);
    pub const SPILL_BLKPTR: Self = Self(1 << 2);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// One 512-byte object metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dnode {
    pub object_type: ObjectType,
    pub indblkshift: u8,
    pub nlevels: u8,
    pub bonus_type: ObjectType,
    pub checksum: u8,
    pub compress: u8,
    pub flags: DnodeFlags,
    /// Data block size in 512-byte sectors.
    pub datablkszsec: u16,
    pub maxblkid: u64,
    pub used: u64,
    /// Direct block pointers; the length is the record's `nblkptr`.
    pub blkptr: Vec<BlockPointer>,
    /// Present only when `flags` has `SPILL_BLKPTR`.
    pub spill: Option<BlockPointer>,
    pub bonus: Vec<u8>,
}

impl Dnode {
    /// Parse the dnode record stored at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, DNODE_SIZE)?;

        let nblkptr = read_u8(raw, 3)?;
        if nblkptr > DN_MAX_NBLKPTR {
            return Err(ParseError::InvalidField {
                field: "dn_nblkptr",
                reason: "exceeds 3 block pointers",
            });
        }
        let flags = DnodeFlags(read_u8(raw, 7)?);
        let bonuslen = usize::from(read_le_u16(raw, 0x0A)?);

        let bonus_start = DNODE_CORE_SIZE + usize::from(nblkptr) * BLKPTR_SIZE;
        let bonus_limit = if flags.contains(DnodeFlags::SPILL_BLKPTR) {
            DNODE_SPILL_OFFSET
        } else {
            DNODE_SIZE
        };
        if bonus_start + bonuslen > bonus_limit {
            return Err(ParseError::InvalidField {
                field: "dn_bonuslen",
                reason: "bonus buffer overlaps spill pointer or record end",
            });
        }

        let blkptr = (0..usize::from(nblkptr))
            .map(|i| BlockPointer::parse(raw, DNODE_CORE_SIZE + i * BLKPTR_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        let spill = if flags.contains(DnodeFlags::SPILL_BLKPTR) {
            Some(BlockPointer::parse(raw, DNODE_SPILL_OFFSET)?)
        } else {
            None
        };

        Ok(Self {
            object_type: ObjectType::from_raw(read_u8(raw, 0)?),
            indblkshift: read_u8(raw, 1)?,
            nlevels: read_u8(raw, 2)?,
            bonus_type: ObjectType::from_raw(read_u8(raw, 4)?),
            checksum: read_u8(raw, 5)?,
            compress: read_u8(raw, 6)?,
            flags,
            datablkszsec: read_le_u16(raw, 0x08)?,
            maxblkid: read_le_u64(raw, 0x10)?,
            used: read_le_u64(raw, 0x18)?,
            blkptr,
            spill,
            bonus: ensure_slice(raw, bonus_start, bonuslen)?.to_vec(),
        })
    }

    /// Parse record `index` of a dnode block.
    pub fn parse_at_index(data: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index
            .checked_mul(DNODE_SIZE)
            .ok_or(ParseError::IntegerConversion {
                field: "dnode_index",
            })?;
        Self::parse(data, offset)
    }

    /// Encode into `out[offset..offset + 512]`.
    ///
    /// The spill pointer is written (and the flag forced on) when `spill`
    /// is set; callers must keep `blkptr` and `bonus` within the record.
    pub fn encode_into(&self, out: &mut [u8], offset: usize) {
        let raw = &mut out[offset..offset + DNODE_SIZE];
        raw.fill(0);

        let mut flags = self.flags;
        if self.spill.is_some() {
            flags.0 |= DnodeFlags::SPILL_BLKPTR.0;
        }
        raw[0] = self.object_type.raw();
        raw[1] = self.indblkshift;
        raw[2] = self.nlevels;
        raw[3] = self.nblkptr();
        raw[4] = self.bonus_type.raw();
        raw[5] = self.checksum;
        raw[6] = self.compress;
        raw[7] = flags.0;
        write_le_u16(raw, 0x08, self.datablkszsec);
        write_le_u16(raw, 0x0A, u16::try_from(self.bonus.len()).unwrap_or(u16::MAX));
        write_le_u64(raw, 0x10, self.maxblkid);
        write_le_u64(raw, 0x18, self.used);

        for (i, bp) in self.blkptr.iter().enumerate() {
            bp.encode_into(raw, DNODE_CORE_SIZE + i * BLKPTR_SIZE);
        }
        let bonus_start = DNODE_CORE_SIZE + self.blkptr.len() * BLKPTR_SIZE;
        raw[bonus_start..bonus_start + self.bonus.len()].copy_from_slice(&self.bonus);
        if let Some(spill) = &self.spill {
            spill.encode_into(raw, DNODE_SPILL_OFFSET);
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; DNODE_SIZE];
        self.encode_into(&mut out, 0);
        out
    }

    #[must_use]
    pub fn nblkptr(&self) -> u8 {
        u8::try_from(self.blkptr.len()).unwrap_or(u8::MAX)
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.object_type != ObjectType::None
    }

    /// Level of the block pointers stored directly in the record.
    #[must_use]
    pub fn top_level(&self) -> i64 {
        i64::from(self.nlevels) - 1
    }

    #[must_use]
    pub fn data_block_size(&self) -> u64 {
        u64::from(self.datablkszsec) << SPA_MINBLOCKSHIFT
    }

    /// log2 of block pointers per indirect block.
    #[must_use]
    pub fn epb_shift(&self) -> u32 {
        u32::from(self.indblkshift).saturating_sub(SPA_BLKPTRSHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdt_types::Txg;

    fn leaf(birth: u64) -> BlockPointer {
        BlockPointer {
            lsize: 4096,
            psize: 4096,
            object_type: ObjectType::PlainFileContents,
            birth: Txg(birth),
            phys_birth: Txg(birth),
            ..BlockPointer::default()
        }
    }

    #[test]
    fn zeroed_record_is_free_slot() {
        let dn = Dnode::parse(&[0_u8; DNODE_SIZE], 0).expect("parse");
        assert!(!dn.is_allocated());
        assert!(dn.blkptr.is_empty());
        assert!(dn.spill.is_none());
        assert_eq!(dn.top_level(), -1);
    }

    #[test]
    fn encode_then_parse_preserves_pointers_bonus_and_spill() {
        let dn = Dnode {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 14,
            nlevels: 2,
            bonus_type: ObjectType::Other(44),
            datablkszsec: 256,
            maxblkid: 300,
            blkptr: vec![leaf(5), BlockPointer::hole()],
            spill: Some(leaf(6)),
            bonus: vec![0xAB; 40],
            ..Dnode::default()
        };
        let parsed = Dnode::parse(&dn.to_bytes(), 0).expect("parse");
        assert_eq!(parsed.blkptr, dn.blkptr);
        assert_eq!(parsed.spill, dn.spill);
        assert_eq!(parsed.bonus, dn.bonus);
        assert!(parsed.flags.contains(DnodeFlags::SPILL_BLKPTR));
        assert_eq!(parsed.top_level(), 1);
        assert_eq!(parsed.data_block_size(), 128 * 1024);
        assert_eq!(parsed.epb_shift(), 7);
    }

    #[test]
    fn rejects_too_many_block_pointers() {
        let mut raw = [0_u8; DNODE_SIZE];
        raw[3] = 4;
        assert!(matches!(
            Dnode::parse(&raw, 0),
            Err(ParseError::InvalidField {
                field: "dn_nblkptr",
                ..
            })
        ));
    }

    #[test]
    fn rejects_bonus_overlapping_spill() {
        let mut raw = [0_u8; DNODE_SIZE];
        raw[3] = 1;
        raw[7] = DnodeFlags::SPILL_BLKPTR.0;
        // 0x40 + 128 + 0x101 > 0x180
        raw[0x0A..0x0C].copy_from_slice(&0x101_u16.to_le_bytes());
        assert!(matches!(
            Dnode::parse(&raw, 0),
            Err(ParseError::InvalidField {
                field: "dn_bonuslen",
                ..
            })
        ));
    }

    #[test]
    fn parse_at_index_reads_packed_records() {
        let mut block = vec![0_u8; DNODE_SIZE * 4];
        let dn = Dnode {
            object_type: ObjectType::DslDataset,
            nlevels: 1,
            blkptr: vec![leaf(9)],
            ..Dnode::default()
        };
        dn.encode_into(&mut block, DNODE_SIZE * 3);
        assert!(!Dnode::parse_at_index(&block, 2).unwrap().is_allocated());
        let got = Dnode::parse_at_index(&block, 3).unwrap();
        assert_eq!(got.object_type, ObjectType::DslDataset);
        assert_eq!(got.blkptr[0].birth, Txg(9));
    }
}
