#![forbid(unsafe_code)]
//! The recursive block walk.
//!
//! [`Walker::visit_bp`] handles one block pointer: the hole and birth
//! checks, the prefetch credit, the pre-order callback, the descent into
//! children chosen by [`BlockKind`], and the post-order callback.
//! [`Walker::visit_dnode`] walks the pointers embedded in one dnode.
//!
//! Errors follow one of two policies. Strict walks return the first error
//! and visit nothing after it. `HARD` walks keep visiting siblings and
//! report the last error seen; see [`ErrorTally`].
//!
//! Damaged trees surface as [`ZdtError::Corruption`]: an indirect child
//! whose level is not one below its parent, or a block that is already
//! being descended through higher up the same path.

use crate::flags::TraverseFlags;
use crate::prefetch::{Credits, prefetch_eligible};
use crate::visit::{BlockVisitor, Visit, VisitAction, VisitPhase};
use std::collections::HashSet;
use tracing::{debug, trace, warn};
use zdt_block::{BlockBuf, BlockReader, ReadFlags, ReadPriority, corruption_at};
use zdt_error::{Result, ZdtError};
use zdt_ondisk::{BlockPointer, Dnode, Dva, ObjectType, ObjsetPhys};
use zdt_types::{Bookmark, ObjectId, ObjsetId, Txg};

// ── Error aggregation ───────────────────────────────────────────────────────

/// Collects child results under the walk's error policy.
#[derive(Debug)]
pub(crate) struct ErrorTally {
    hard: bool,
    last: Option<ZdtError>,
}

impl ErrorTally {
    pub(crate) fn new(flags: TraverseFlags) -> Self {
        Self {
            hard: flags.contains(TraverseFlags::HARD),
            last: None,
        }
    }

    /// Returns `Err` when the walk must stop now.
    pub(crate) fn record(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.hard => {
                trace!(target: "zdt::traverse", error = %err, "error_deferred");
                self.last = Some(err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn into_deferred(self) -> Option<ZdtError> {
        self.last
    }

    pub(crate) fn finish(self) -> Result<()> {
        self.last.map_or(Ok(()), Err)
    }
}

// ── Block dispatch ──────────────────────────────────────────────────────────

/// How the walk descends below a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    /// Level > 0: an array of child block pointers.
    Indirect,
    /// Level 0 block of the meta dnode: an array of dnodes.
    DnodeArray,
    /// Object-set header.
    Objset,
    /// No children.
    Leaf,
}

impl BlockKind {
    pub(crate) fn of(bp: &BlockPointer) -> Self {
        if bp.is_indirect() {
            return Self::Indirect;
        }
        match bp.object_type {
            ObjectType::Dnode => Self::DnodeArray,
            ObjectType::Objset => Self::Objset,
            _ => Self::Leaf,
        }
    }
}

/// Counters for one walk, logged when it ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WalkStats {
    callbacks: u64,
    holes: u64,
    /// Blocks skipped because they were born at or before the cutoff.
    skipped: u64,
    pruned: u64,
    reads: u64,
    read_errors: u64,
    credits_taken: u64,
    cycles: u64,
}

// ── Walker ──────────────────────────────────────────────────────────────────

pub(crate) struct Walker<'w, V: BlockVisitor + ?Sized> {
    reader: &'w dyn BlockReader,
    visitor: &'w mut V,
    min_txg: Txg,
    flags: TraverseFlags,
    credits: Option<&'w Credits>,
    /// Primary DVAs of the blocks currently being descended through.
    active_path: HashSet<Dva>,
    stats: WalkStats,
}

impl<'w, V: BlockVisitor + ?Sized> Walker<'w, V> {
    pub(crate) fn new(
        reader: &'w dyn BlockReader,
        visitor: &'w mut V,
        min_txg: Txg,
        flags: TraverseFlags,
        credits: Option<&'w Credits>,
    ) -> Self {
        Self {
            reader,
            visitor,
            min_txg,
            flags,
            credits,
            active_path: HashSet::new(),
            stats: WalkStats::default(),
        }
    }

    #[cfg(test)]
    fn stats(&self) -> WalkStats {
        self.stats
    }

    /// Walk the object set rooted at `root`.
    pub(crate) fn walk_root(&mut self, objset: ObjsetId, root: &BlockPointer) -> Result<()> {
        let result = self.visit_bp(None, root, Bookmark::root(objset));
        debug!(
            target: "zdt::traverse",
            %objset,
            callbacks = self.stats.callbacks,
            holes = self.stats.holes,
            skipped = self.stats.skipped,
            pruned = self.stats.pruned,
            reads = self.stats.reads,
            read_errors = self.stats.read_errors,
            credits = self.stats.credits_taken,
            cycles = self.stats.cycles,
            ok = result.is_ok(),
            "walk_done"
        );
        result
    }

    fn call(&mut self, visit: &Visit<'_>) -> Result<VisitAction> {
        self.stats.callbacks += 1;
        self.visitor.visit(visit)
    }

    /// Visit `bp` at `bookmark` and everything below it.
    pub(crate) fn visit_bp(
        &mut self,
        dnode: Option<&Dnode>,
        bp: &BlockPointer,
        bookmark: Bookmark,
    ) -> Result<()> {
        if bp.is_hole() {
            self.stats.holes += 1;
            if self.flags.contains(TraverseFlags::PRE) {
                self.call(&Visit {
                    bp: None,
                    bookmark,
                    dnode,
                    zil: None,
                    phase: VisitPhase::Pre,
                })?;
            }
            return Ok(());
        }

        if bp.birth <= self.min_txg {
            self.stats.skipped += 1;
            return Ok(());
        }

        if let Some(credits) = self.credits {
            if prefetch_eligible(bp, self.flags) {
                if credits.acquire() {
                    self.stats.credits_taken += 1;
                } else {
                    trace!(target: "zdt::prefetch", %bookmark, "credit_source_gone");
                }
            }
        }

        if self.flags.contains(TraverseFlags::PRE) {
            let action = self.call(&Visit {
                bp: Some(bp),
                bookmark,
                dnode,
                zil: None,
                phase: VisitPhase::Pre,
            })?;
            if action == VisitAction::Prune {
                self.stats.pruned += 1;
                trace!(target: "zdt::traverse", %bookmark, "pruned");
                return Ok(());
            }
        }

        let deferred = self.descend(dnode, bp, bookmark)?;

        if self.flags.contains(TraverseFlags::POST) {
            self.call(&Visit {
                bp: Some(bp),
                bookmark,
                dnode,
                zil: None,
                phase: VisitPhase::Post,
            })?;
        }
        deferred.map_or(Ok(()), Err)
    }

    /// Recurse into the children of `bp`. The buffer read here is dropped
    /// before returning, so it is never held across the post-order call.
    ///
    /// `Err` aborts the caller; `Ok(Some(_))` is a deferred `HARD` error.
    fn descend(
        &mut self,
        dnode: Option<&Dnode>,
        bp: &BlockPointer,
        bookmark: Bookmark,
    ) -> Result<Option<ZdtError>> {
        let kind = BlockKind::of(bp);
        if kind == BlockKind::Leaf {
            return Ok(None);
        }
        let dva = bp.primary_dva();
        if !self.active_path.insert(dva) {
            self.stats.cycles += 1;
            warn!(target: "zdt::traverse", %bookmark, vdev = dva.vdev, offset = dva.offset, "block_cycle");
            return Err(ZdtError::Corruption {
                location: bookmark.to_string(),
                detail: format!("cycle in block pointers at {}:{:#x}", dva.vdev, dva.offset),
            });
        }
        let result = match kind {
            BlockKind::Indirect => self.descend_indirect(dnode, bp, bookmark),
            BlockKind::DnodeArray => self.descend_dnode_array(bp, bookmark),
            BlockKind::Objset => self.descend_objset(bp, bookmark),
            BlockKind::Leaf => Ok(None),
        };
        self.active_path.remove(&dva);
        result
    }

    fn read(&mut self, bp: &BlockPointer, bookmark: &Bookmark) -> Result<BlockBuf> {
        self.stats.reads += 1;
        match self
            .reader
            .read(bp, bookmark, ReadPriority::AsyncRead, ReadFlags::CANFAIL)
        {
            Ok(buf) => Ok(buf),
            Err(err) => {
                self.stats.read_errors += 1;
                debug!(target: "zdt::traverse", %bookmark, error = %err, "read_failed");
                Err(err)
            }
        }
    }

    fn descend_indirect(
        &mut self,
        dnode: Option<&Dnode>,
        bp: &BlockPointer,
        bookmark: Bookmark,
    ) -> Result<Option<ZdtError>> {
        let buf = self.read(bp, &bookmark)?;
        let epb = bp.pointers_per_block();
        let base = bookmark
            .blkid
            .checked_mul(epb as u64)
            .ok_or_else(|| ZdtError::Corruption {
                location: bookmark.to_string(),
                detail: format!("child block ids overflow (epb {epb})"),
            })?;

        let mut tally = ErrorTally::new(self.flags);
        for i in 0..epb {
            let child_bookmark = Bookmark::new(
                bookmark.objset,
                bookmark.object,
                bookmark.level - 1,
                base + i as u64,
            );
            let result = match BlockPointer::parse_at_index(buf.as_slice(), i) {
                Ok(child) if !child.is_hole() && u16::from(child.level) + 1 != u16::from(bp.level) => {
                    Err(ZdtError::Corruption {
                        location: child_bookmark.to_string(),
                        detail: format!("child level {} under level {} indirect", child.level, bp.level),
                    })
                }
                Ok(child) => self.visit_bp(dnode, &child, child_bookmark),
                Err(err) => Err(corruption_at(&child_bookmark, &err)),
            };
            tally.record(result)?;
        }
        Ok(tally.into_deferred())
    }

    fn descend_dnode_array(
        &mut self,
        bp: &BlockPointer,
        bookmark: Bookmark,
    ) -> Result<Option<ZdtError>> {
        let buf = self.read(bp, &bookmark)?;
        let per_block = bp.dnodes_per_block();
        let base = bookmark
            .blkid
            .checked_mul(per_block as u64)
            .ok_or_else(|| ZdtError::Corruption {
                location: bookmark.to_string(),
                detail: format!("object numbers overflow ({per_block} dnodes per block)"),
            })?;

        let mut tally = ErrorTally::new(self.flags);
        for i in 0..per_block {
            let object = ObjectId(base + i as u64);
            let result = match Dnode::parse_at_index(buf.as_slice(), i) {
                Ok(record) => self.visit_dnode(&record, bookmark.objset, object),
                Err(err) => Err(corruption_at(
                    &Bookmark::new(bookmark.objset, object, 0, 0),
                    &err,
                )),
            };
            tally.record(result)?;
        }
        Ok(tally.into_deferred())
    }

    fn descend_objset(
        &mut self,
        bp: &BlockPointer,
        bookmark: Bookmark,
    ) -> Result<Option<ZdtError>> {
        let buf = self.read(bp, &bookmark)?;
        let phys = ObjsetPhys::parse(buf.as_slice()).map_err(|err| corruption_at(&bookmark, &err))?;
        drop(buf);

        let objset = bookmark.objset;
        let mut tally = ErrorTally::new(self.flags);
        tally.record(self.visit_dnode(&phys.meta_dnode, objset, ObjectId::META_DNODE))?;
        if let Some(userused) = &phys.userused {
            tally.record(self.visit_dnode(userused, objset, ObjectId::USER_USED))?;
        }
        if let Some(groupused) = &phys.groupused {
            tally.record(self.visit_dnode(groupused, objset, ObjectId::GROUP_USED))?;
        }
        Ok(tally.into_deferred())
    }

    /// Visit the spill block, then each direct block pointer in slot order.
    pub(crate) fn visit_dnode(
        &mut self,
        dnode: &Dnode,
        objset: ObjsetId,
        object: ObjectId,
    ) -> Result<()> {
        let mut tally = ErrorTally::new(self.flags);
        if let Some(spill) = &dnode.spill {
            tally.record(self.visit_bp(Some(dnode), spill, Bookmark::spill(objset, object)))?;
        }
        let level = dnode.top_level();
        for (slot, bp) in dnode.blkptr.iter().enumerate() {
            let bookmark = Bookmark::new(objset, object, level, slot as u64);
            tally.record(self.visit_bp(Some(dnode), bp, bookmark))?;
        }
        tally.finish()
    }
}
