#![forbid(unsafe_code)]

use crate::blkptr::BlockPointer;
use serde::{Deserialize, Serialize};
use zdt_types::{ObjectId, ParseError, Txg, ensure_slice, read_le_u64, write_le_u64};

/// Size of a dataset record (the bonus buffer of a DSL-dataset dnode).
pub const DSL_DATASET_PHYS_SIZE: usize = 320;

const DS_BP_OFFSET: usize = 0x80;

/// Dataset record: links a dataset (or snapshot) to its object-set root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DslDatasetPhys {
    pub dir_obj: ObjectId,
    pub prev_snap_obj: ObjectId,
    /// Birth txg of the previous snapshot; blocks born at or before it are
    /// shared with that snapshot.
    pub prev_snap_txg: Txg,
    pub next_snap_obj: ObjectId,
    pub snapnames_zapobj: ObjectId,
    pub num_children: u64,
    pub creation_time: u64,
    pub creation_txg: Txg,
    pub deadlist_obj: ObjectId,
    pub referenced_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub unique_bytes: u64,
    pub fsid_guid: u64,
    pub guid: u64,
    pub flags: u64,
    /// Root block pointer of the dataset's object set.
    pub bp: BlockPointer,
    pub next_clones_obj: ObjectId,
    pub props_obj: ObjectId,
    pub userrefs_obj: ObjectId,
}

impl DslDatasetPhys {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, DSL_DATASET_PHYS_SIZE)?;
        let word = |offset: usize| read_le_u64(raw, offset);
        Ok(Self {
            dir_obj: ObjectId(word(0x00)?),
            prev_snap_obj: ObjectId(word(0x08)?),
            prev_snap_txg: Txg(word(0x10)?),
            next_snap_obj: ObjectId(word(0x18)?),
            snapnames_zapobj: ObjectId(word(0x20)?),
            num_children: word(0x28)?,
            creation_time: word(0x30)?,
            creation_txg: Txg(word(0x38)?),
            deadlist_obj: ObjectId(word(0x40)?),
            referenced_bytes: word(0x48)?,
            compressed_bytes: word(0x50)?,
            uncompressed_bytes: word(0x58)?,
            unique_bytes: word(0x60)?,
            fsid_guid: word(0x68)?,
            guid: word(0x70)?,
            flags: word(0x78)?,
            bp: BlockPointer::parse(raw, DS_BP_OFFSET)?,
            next_clones_obj: ObjectId(word(0x100)?),
            props_obj: ObjectId(word(0x108)?),
            userrefs_obj: ObjectId(word(0x110)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; DSL_DATASET_PHYS_SIZE];
        let words = [
            (0x00, self.dir_obj.0),
            (0x08, self.prev_snap_obj.0),
            (0x10, self.prev_snap_txg.0),
            (0x18, self.next_snap_obj.0),
            (0x20, self.snapnames_zapobj.0),
            (0x28, self.num_children),
            (0x30, self.creation_time),
            (0x38, self.creation_txg.0),
            (0x40, self.deadlist_obj.0),
            (0x48, self.referenced_bytes),
            (0x50, self.compressed_bytes),
            (0x58, self.uncompressed_bytes),
            (0x60, self.unique_bytes),
            (0x68, self.fsid_guid),
            (0x70, self.guid),
            (0x78, self.flags),
            (0x100, self.next_clones_obj.0),
            (0x108, self.props_obj.0),
            (0x110, self.userrefs_obj.0),
        ];
        for (offset, value) in words {
            write_le_u64(&mut out, offset, value);
        }
        self.bp.encode_into(&mut out, DS_BP_OFFSET);
        out
    }

    /// Snapshots are the only datasets with a children count.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.num_children != 0
    }
}
