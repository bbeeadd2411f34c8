#![forbid(unsafe_code)]
//! Walk entry points.
//!
//! [`traverse_root`] walks one object set, [`traverse_dataset`] adds the
//! dataset's intent log, and [`traverse_pool`] walks the meta object set
//! followed by every dataset it records.

use crate::config::TraverseConfig;
use crate::engine::{ErrorTally, Walker};
use crate::flags::TraverseFlags;
use crate::objset::{Dataset, ObjsetView};
use crate::prefetch::with_prefetch;
use crate::visit::BlockVisitor;
use crate::zil::{LogContext, traverse_intent_log};
use tracing::{debug, info};
use zdt_block::BlockReader;
use zdt_error::Result;
use zdt_ondisk::{BlockPointer, ObjectType};
use zdt_types::{ObjectId, ObjsetId, Txg};

/// A pool as seen by the walker.
#[derive(Debug)]
pub struct Pool<R> {
    reader: R,
    root: BlockPointer,
    first_txg: Txg,
    writable: bool,
    config: TraverseConfig,
}

impl<R: BlockReader> Pool<R> {
    /// A writable pool whose meta object set is rooted at `root`.
    /// `first_txg` is the first txg this pool has not synced.
    pub fn new(reader: R, root: BlockPointer, first_txg: Txg) -> Self {
        Self {
            reader,
            root,
            first_txg,
            writable: true,
            config: TraverseConfig::default(),
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: TraverseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn root(&self) -> &BlockPointer {
        &self.root
    }

    pub fn first_txg(&self) -> Txg {
        self.first_txg
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn config(&self) -> &TraverseConfig {
        &self.config
    }

    fn dyn_reader(&self) -> &dyn BlockReader {
        &self.reader
    }

    /// The meta object set.
    pub fn mos(&self) -> Result<ObjsetView<'_>> {
        self.open_objset(ObjsetId::META, &self.root)
    }

    pub fn open_objset(&self, objset: ObjsetId, root: &BlockPointer) -> Result<ObjsetView<'_>> {
        ObjsetView::open(self.dyn_reader(), objset, root)
    }

    /// Load the dataset record held by MOS object `object`.
    pub fn load_dataset(&self, object: ObjectId) -> Result<Dataset> {
        let dnode = self.mos()?.dnode(object)?;
        Dataset::from_dnode(object, &dnode)
    }
}

fn walk_objset<R, V>(
    pool: &Pool<R>,
    objset: ObjsetId,
    root: &BlockPointer,
    min_txg: Txg,
    flags: TraverseFlags,
    visitor: &mut V,
) -> Result<()>
where
    R: BlockReader,
    V: BlockVisitor + ?Sized,
{
    let reader = pool.dyn_reader();
    with_prefetch(reader, &pool.config, objset, root, min_txg, flags, |credits| {
        Walker::new(reader, visitor, min_txg, flags, credits).walk_root(objset, root)
    })
}

/// Walk the object set `objset` rooted at `root`, visiting every block
/// born after `min_txg`.
pub fn traverse_root<R, V>(
    pool: &Pool<R>,
    objset: ObjsetId,
    root: &BlockPointer,
    min_txg: Txg,
    flags: TraverseFlags,
    visitor: &mut V,
) -> Result<()>
where
    R: BlockReader,
    V: BlockVisitor + ?Sized,
{
    debug!(target: "zdt::traverse", %objset, %min_txg, %flags, "traverse_root");
    walk_objset(pool, objset, root, min_txg, flags, visitor)
}

/// Walk one dataset. Unless it is a snapshot, its intent log is walked
/// first; nothing the log walk finds affects the result.
pub fn traverse_dataset<R, V>(
    pool: &Pool<R>,
    dataset: &Dataset,
    min_txg: Txg,
    flags: TraverseFlags,
    visitor: &mut V,
) -> Result<()>
where
    R: BlockReader,
    V: BlockVisitor + ?Sized,
{
    let objset = dataset.objset();
    let root = dataset.root();
    debug!(
        target: "zdt::traverse",
        %objset,
        %min_txg,
        %flags,
        snapshot = dataset.is_snapshot(),
        "traverse_dataset"
    );

    if !dataset.is_snapshot() && !root.is_hole() {
        let view = pool.open_objset(objset, root)?;
        let ctx = LogContext {
            objset,
            first_txg: pool.first_txg,
            writable: pool.writable,
        };
        traverse_intent_log(pool.dyn_reader(), ctx, view.zil_header(), visitor);
    }

    walk_objset(pool, objset, root, min_txg, flags, visitor)
}

/// Walk the meta object set, then every dataset it records.
///
/// Each dataset is walked from the later of `min_txg` and its previous
/// snapshot's txg. MOS dnode blocks born at or before `min_txg` are not
/// searched for datasets.
pub fn traverse_pool<R, V>(pool: &Pool<R>, min_txg: Txg, flags: TraverseFlags, visitor: &mut V) -> Result<()>
where
    R: BlockReader,
    V: BlockVisitor + ?Sized,
{
    info!(target: "zdt::traverse", %min_txg, %flags, "traverse_pool_start");
    let mut tally = ErrorTally::new(flags);

    tally.record(walk_objset(pool, ObjsetId::META, &pool.root, min_txg, flags, visitor))?;

    let mos = match pool.mos() {
        Ok(mos) => mos,
        Err(err) => {
            tally.record(Err(err))?;
            return tally.finish();
        }
    };

    let mut datasets = 0_u64;
    let mut cursor = ObjectId::META_DNODE;
    loop {
        let (object, dnode) = match mos.next_allocated(cursor, min_txg) {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(err) => {
                tally.record(Err(err))?;
                break;
            }
        };
        cursor = object;
        if dnode.object_type != ObjectType::DslDataset {
            continue;
        }

        let result = Dataset::from_dnode(object, &dnode).and_then(|dataset| {
            let txg = min_txg.max(dataset.prev_snap_txg());
            traverse_dataset(pool, &dataset, txg, flags, visitor)
        });
        datasets += 1;
        if let Err(err) = &result {
            debug!(target: "zdt::traverse", %object, error = %err, "dataset_walk_failed");
        }
        tally.record(result)?;
    }

    let result = tally.finish();
    info!(
        target: "zdt::traverse",
        datasets,
        ok = result.is_ok(),
        "traverse_pool_done"
    );
    result
}
