#![forbid(unsafe_code)]
//! Lookups inside one object set.
//!
//! Objects are found through the meta dnode: object `n` lives in dnode
//! block `n / dnodes_per_block`, which is reached through the meta dnode's
//! own indirect tree.

use tracing::trace;
use zdt_block::{BlockBuf, BlockReader, ReadFlags, ReadPriority, corruption_at};
use zdt_error::{Result, ZdtError};
use zdt_ondisk::{BlockPointer, Dnode, DslDatasetPhys, ObjectType, ObjsetPhys, ZilHeader};
use zdt_types::{Bookmark, DNODE_SHIFT, ObjectId, ObjsetId, Txg};

/// Blocks covered by one pointer at `level` of a tree with fan-out
/// `1 << epb_shift`. Saturates for trees deeper than 64 bits of span.
fn span(epb_shift: u32, level: u32) -> u64 {
    epb_shift
        .checked_mul(level)
        .and_then(|shift| 1_u64.checked_shl(shift))
        .unwrap_or(u64::MAX)
}

/// A decoded object-set header plus the reader needed to follow it.
pub struct ObjsetView<'a> {
    reader: &'a dyn BlockReader,
    objset: ObjsetId,
    phys: ObjsetPhys,
}

impl std::fmt::Debug for ObjsetView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjsetView")
            .field("objset", &self.objset)
            .field("phys", &self.phys)
            .finish_non_exhaustive()
    }
}

impl<'a> ObjsetView<'a> {
    /// Read the header at `root`. A hole is an empty object set.
    pub fn open(reader: &'a dyn BlockReader, objset: ObjsetId, root: &BlockPointer) -> Result<Self> {
        if root.is_hole() {
            return Ok(Self {
                reader,
                objset,
                phys: ObjsetPhys::default(),
            });
        }
        let bookmark = Bookmark::root(objset);
        let buf = reader.read(root, &bookmark, ReadPriority::SyncRead, ReadFlags::CANFAIL)?;
        let phys = ObjsetPhys::parse(buf.as_slice()).map_err(|err| corruption_at(&bookmark, &err))?;
        Ok(Self {
            reader,
            objset,
            phys,
        })
    }

    #[must_use]
    pub fn id(&self) -> ObjsetId {
        self.objset
    }

    #[must_use]
    pub fn phys(&self) -> &ObjsetPhys {
        &self.phys
    }

    #[must_use]
    pub fn zil_header(&self) -> &ZilHeader {
        &self.phys.zil_header
    }

    fn meta(&self) -> &Dnode {
        &self.phys.meta_dnode
    }

    fn dnodes_per_block(&self) -> u64 {
        (self.meta().data_block_size() >> DNODE_SHIFT).max(1)
    }

    fn read(&self, bp: &BlockPointer, bookmark: &Bookmark) -> Result<BlockBuf> {
        self.reader
            .read(bp, bookmark, ReadPriority::SyncRead, ReadFlags::CANFAIL)
    }

    /// Block pointer of dnode block `blkid`, or `None` if it is a hole.
    fn dnode_block(&self, blkid: u64) -> Result<Option<BlockPointer>> {
        let meta = self.meta();
        if meta.nlevels == 0 || blkid > meta.maxblkid {
            return Ok(None);
        }
        let epb_shift = meta.epb_shift();
        let top = u32::from(meta.nlevels - 1);
        let slot = blkid / span(epb_shift, top);
        let Some(mut bp) = usize::try_from(slot).ok().and_then(|slot| meta.blkptr.get(slot).copied())
        else {
            return Ok(None);
        };

        for level in (1..=top).rev() {
            if bp.is_hole() {
                return Ok(None);
            }
            let bookmark = Bookmark::new(
                self.objset,
                ObjectId::META_DNODE,
                i64::from(level),
                blkid / span(epb_shift, level),
            );
            let buf = self.read(&bp, &bookmark)?;
            let index = (blkid / span(epb_shift, level - 1)) & span(epb_shift, 1).wrapping_sub(1);
            bp = BlockPointer::parse_at_index(buf.as_slice(), index as usize)
                .map_err(|err| corruption_at(&bookmark, &err))?;
        }
        Ok((!bp.is_hole()).then_some(bp))
    }

    /// The dnode of `object`.
    pub fn dnode(&self, object: ObjectId) -> Result<Dnode> {
        let per_block = self.dnodes_per_block();
        let blkid = object.0 / per_block;
        let not_found = || ZdtError::NotFound(format!("object {object} in objset {}", self.objset));

        let bp = self.dnode_block(blkid)?.ok_or_else(not_found)?;
        let bookmark = Bookmark::new(self.objset, ObjectId::META_DNODE, 0, blkid);
        let buf = self.read(&bp, &bookmark)?;
        let dnode = Dnode::parse_at_index(buf.as_slice(), (object.0 % per_block) as usize)
            .map_err(|err| corruption_at(&Bookmark::new(self.objset, object, 0, 0), &err))?;
        if dnode.is_allocated() {
            Ok(dnode)
        } else {
            Err(not_found())
        }
    }

    /// First dnode block at or after `from` that is allocated and born
    /// after `min_txg`, searching the subtree under `bp`.
    fn find_block(
        &self,
        bp: &BlockPointer,
        level: u32,
        first: u64,
        from: u64,
        min_txg: Txg,
    ) -> Result<Option<(u64, BlockPointer)>> {
        if bp.is_hole() || bp.birth <= min_txg {
            return Ok(None);
        }
        if level == 0 {
            return Ok(Some((first, *bp)));
        }
        let epb_shift = self.meta().epb_shift();
        let child_span = span(epb_shift, level - 1);
        let bookmark = Bookmark::new(
            self.objset,
            ObjectId::META_DNODE,
            i64::from(level),
            first / span(epb_shift, level),
        );
        let buf = self.read(bp, &bookmark)?;
        for i in 0..bp.pointers_per_block() {
            let child_first = first.saturating_add((i as u64).saturating_mul(child_span));
            if child_first.saturating_add(child_span) <= from {
                continue;
            }
            if child_first > self.meta().maxblkid {
                break;
            }
            let child = BlockPointer::parse_at_index(buf.as_slice(), i)
                .map_err(|err| corruption_at(&bookmark, &err))?;
            if let Some(found) = self.find_block(&child, level - 1, child_first, from, min_txg)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// The next allocated object after `after` whose dnode block was born
    /// after `min_txg`.
    pub fn next_allocated(&self, after: ObjectId, min_txg: Txg) -> Result<Option<(ObjectId, Dnode)>> {
        let meta = self.meta();
        if meta.nlevels == 0 {
            return Ok(None);
        }
        let per_block = self.dnodes_per_block();
        let top = u32::from(meta.nlevels - 1);
        let top_span = span(meta.epb_shift(), top);
        let Some(mut from_object) = after.0.checked_add(1) else {
            return Ok(None);
        };

        loop {
            let from_blk = from_object / per_block;
            let mut found = None;
            for (slot, bp) in meta.blkptr.iter().enumerate() {
                let first = (slot as u64).saturating_mul(top_span);
                if first.saturating_add(top_span) <= from_blk {
                    continue;
                }
                found = self.find_block(bp, top, first, from_blk, min_txg)?;
                if found.is_some() {
                    break;
                }
            }
            let Some((blkid, bp)) = found else {
                return Ok(None);
            };

            let bookmark = Bookmark::new(self.objset, ObjectId::META_DNODE, 0, blkid);
            let buf = self.read(&bp, &bookmark)?;
            let start = if blkid == from_blk { from_object % per_block } else { 0 };
            for index in start..per_block {
                let object = ObjectId(blkid * per_block + index);
                let dnode = Dnode::parse_at_index(buf.as_slice(), index as usize)
                    .map_err(|err| corruption_at(&Bookmark::new(self.objset, object, 0, 0), &err))?;
                if dnode.is_allocated() {
                    trace!(target: "zdt::objset", objset = %self.objset, %object, "next_object");
                    return Ok(Some((object, dnode)));
                }
            }
            let Some(next) = blkid.checked_add(1).and_then(|b| b.checked_mul(per_block)) else {
                return Ok(None);
            };
            from_object = next;
        }
    }
}

// ── Datasets ────────────────────────────────────────────────────────────────

/// A dataset record loaded from the meta object set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub object: ObjectId,
    pub phys: DslDatasetPhys,
}

impl Dataset {
    /// Decode the dataset record carried in the bonus buffer of `dnode`.
    pub fn from_dnode(object: ObjectId, dnode: &Dnode) -> Result<Self> {
        if dnode.object_type != ObjectType::DslDataset {
            return Err(ZdtError::InvalidArgument(format!(
                "object {object} is {}, not a dataset",
                dnode.object_type
            )));
        }
        let phys = DslDatasetPhys::parse(&dnode.bonus).map_err(|err| {
            corruption_at(&Bookmark::new(ObjsetId::META, object, 0, 0), &err)
        })?;
        Ok(Self { object, phys })
    }

    /// Datasets are their own object-set ids.
    #[must_use]
    pub fn objset(&self) -> ObjsetId {
        ObjsetId(self.object.0)
    }

    #[must_use]
    pub fn root(&self) -> &BlockPointer {
        &self.phys.bp
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.phys.is_snapshot()
    }

    #[must_use]
    pub fn prev_snap_txg(&self) -> Txg {
        self.phys.prev_snap_txg
    }
}
