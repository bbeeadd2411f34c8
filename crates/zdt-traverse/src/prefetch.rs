#![forbid(unsafe_code)]
//! Read-ahead on a background thread.
//!
//! The prefetch thread walks the same tree as the main walk but only
//! issues [`BlockReader::prefetch`] hints. Before each hint it sends a
//! unit token on a bounded channel; the main walk receives one token
//! before each block it is about to read. The channel capacity is the
//! number of blocks the prefetcher may run ahead.
//!
//! Both sides decide which blocks carry a token with [`prefetch_eligible`].
//! When the main walk ends it raises the cancel flag and drops its end of
//! the channel, which wakes a prefetcher blocked in `send`.

use crate::config::TraverseConfig;
use crate::engine::Walker;
use crate::flags::TraverseFlags;
use crate::visit::{BlockVisitor, Visit, VisitAction};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, warn};
use zdt_block::BlockReader;
use zdt_error::{Result, ZdtError};
use zdt_ondisk::{BlockPointer, ObjectType};
use zdt_types::{ObjsetId, Txg};

/// Whether `bp` is read by the walk and so takes a credit.
pub(crate) fn prefetch_eligible(bp: &BlockPointer, flags: TraverseFlags) -> bool {
    !bp.is_hole()
        && bp.object_type != ObjectType::IntentLog
        && (flags.contains(TraverseFlags::PREFETCH_DATA)
            || bp.object_type == ObjectType::Dnode
            || bp.is_indirect())
}

/// Consumer end of the credit channel, held by the main walk.
#[derive(Debug)]
pub(crate) struct Credits {
    rx: Receiver<()>,
}

impl Credits {
    /// Wait for the prefetcher to get one block ahead. Returns `false` once
    /// the prefetcher has exited and every token it sent is used up.
    pub(crate) fn acquire(&self) -> bool {
        self.rx.recv().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefetchPhase {
    Idle,
    Running,
    Cancelling,
    Exited,
}

/// Main-side view of the prefetch thread's lifecycle.
#[derive(Debug)]
struct PrefetchTracker {
    objset: ObjsetId,
    phase: PrefetchPhase,
}

impl PrefetchTracker {
    fn new(objset: ObjsetId) -> Self {
        Self {
            objset,
            phase: PrefetchPhase::Idle,
        }
    }

    fn advance(&mut self, next: PrefetchPhase) {
        debug!(
            target: "zdt::prefetch",
            objset = %self.objset,
            from = ?self.phase,
            to = ?next,
            "prefetch_phase"
        );
        self.phase = next;
    }
}

/// Visitor run by the prefetch thread.
struct Prefetcher<'a> {
    reader: &'a dyn BlockReader,
    tx: Sender<()>,
    cancel: &'a AtomicBool,
    flags: TraverseFlags,
    issued: u64,
}

impl BlockVisitor for Prefetcher<'_> {
    fn visit(&mut self, visit: &Visit<'_>) -> Result<VisitAction> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(ZdtError::Interrupted);
        }
        let Some(bp) = visit.bp else {
            return Ok(VisitAction::Descend);
        };
        if !prefetch_eligible(bp, self.flags) {
            return Ok(VisitAction::Descend);
        }
        self.tx.send(()).map_err(|_| ZdtError::Interrupted)?;
        self.reader.prefetch(bp, &visit.bookmark);
        self.issued += 1;
        Ok(VisitAction::Descend)
    }
}

/// Body of the prefetch thread. Its errors never leave this function.
fn prefetch_walk(
    reader: &dyn BlockReader,
    tx: Sender<()>,
    cancel: &AtomicBool,
    objset: ObjsetId,
    root: &BlockPointer,
    min_txg: Txg,
    flags: TraverseFlags,
) -> u64 {
    let mut prefetcher = Prefetcher {
        reader,
        tx,
        cancel,
        flags,
        issued: 0,
    };
    // Pre-order only: a second callback per block would mint a second token.
    let walk_flags = TraverseFlags::PRE
        .union(flags.intersection(TraverseFlags::HARD))
        .union(flags.intersection(TraverseFlags::PREFETCH));
    let outcome = Walker::new(reader, &mut prefetcher, min_txg, walk_flags, None).walk_root(objset, root);
    match outcome {
        Ok(()) | Err(ZdtError::Interrupted) => {}
        Err(err) => debug!(target: "zdt::prefetch", %objset, error = %err, "prefetch_walk_failed"),
    }
    prefetcher.issued
}

/// Run `walk` with a prefetch thread when `flags` ask for one.
///
/// `walk` receives the credit source to hand to its [`Walker`], or `None`
/// when no prefetch thread is running. The prefetch thread has always
/// exited when this returns.
pub(crate) fn with_prefetch<T>(
    reader: &dyn BlockReader,
    config: &TraverseConfig,
    objset: ObjsetId,
    root: &BlockPointer,
    min_txg: Txg,
    flags: TraverseFlags,
    walk: impl FnOnce(Option<&Credits>) -> T,
) -> T {
    if !flags.intersects(TraverseFlags::PREFETCH) {
        return walk(None);
    }

    let (tx, rx) = bounded(config.credit_bound());
    let cancel = AtomicBool::new(false);
    let mut tracker = PrefetchTracker::new(objset);
    let root = *root;

    thread::scope(|scope| {
        let cancel_flag = &cancel;
        let spawned = thread::Builder::new()
            .name("zdt-prefetch".to_owned())
            .spawn_scoped(scope, move || {
                prefetch_walk(reader, tx, cancel_flag, objset, &root, min_txg, flags)
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "zdt::prefetch", %objset, error = %err, "prefetch_spawn_failed");
                return walk(None);
            }
        };
        tracker.advance(PrefetchPhase::Running);

        let credits = Credits { rx };
        let result = walk(Some(&credits));

        tracker.advance(PrefetchPhase::Cancelling);
        cancel.store(true, Ordering::Release);
        drop(credits);
        match handle.join() {
            Ok(issued) => debug!(target: "zdt::prefetch", %objset, issued, "prefetch_joined"),
            Err(_) => warn!(target: "zdt::prefetch", %objset, "prefetch_thread_panicked"),
        }
        tracker.advance(PrefetchPhase::Exited);
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdt_block::{BlockBuf, ReadFlags, ReadPriority};
    use zdt_types::Bookmark;

    fn bp(object_type: ObjectType, level: u8, birth: u64) -> BlockPointer {
        BlockPointer {
            lsize: 4096,
            psize: 4096,
            object_type,
            level,
            birth: Txg(birth),
            ..BlockPointer::default()
        }
    }

    #[test]
    fn eligibility_depends_on_type_level_and_data_flag() {
        let meta = TraverseFlags::PREFETCH_METADATA;
        let data = TraverseFlags::PREFETCH_DATA;
        assert!(prefetch_eligible(&bp(ObjectType::Dnode, 0, 1), meta));
        assert!(prefetch_eligible(&bp(ObjectType::PlainFileContents, 1, 1), meta));
        assert!(!prefetch_eligible(&bp(ObjectType::PlainFileContents, 0, 1), meta));
        assert!(prefetch_eligible(&bp(ObjectType::PlainFileContents, 0, 1), data));
        assert!(!prefetch_eligible(&bp(ObjectType::IntentLog, 0, 1), data));
        assert!(!prefetch_eligible(&bp(ObjectType::Dnode, 0, 0), meta));
    }

    struct NullReader;

    impl BlockReader for NullReader {
        fn read(
            &self,
            _bp: &BlockPointer,
            _bookmark: &Bookmark,
            _priority: ReadPriority,
            _flags: ReadFlags,
        ) -> Result<BlockBuf> {
            Err(ZdtError::Io(std::io::Error::from_raw_os_error(libc::EIO)))
        }

        fn prefetch(&self, _bp: &BlockPointer, _bookmark: &Bookmark) {}
    }

    #[test]
    fn prefetcher_stops_when_cancelled_or_disconnected() {
        let (tx, rx) = bounded(1);
        let cancel = AtomicBool::new(false);
        let mut prefetcher = Prefetcher {
            reader: &NullReader,
            tx,
            cancel: &cancel,
            flags: TraverseFlags::PREFETCH_METADATA,
            issued: 0,
        };
        let dnode_block = bp(ObjectType::Dnode, 0, 3);
        let visit = Visit {
            bp: Some(&dnode_block),
            bookmark: Bookmark::root(ObjsetId(1)),
            dnode: None,
            zil: None,
            phase: crate::visit::VisitPhase::Pre,
        };
        assert_eq!(prefetcher.visit(&visit).expect("first"), VisitAction::Descend);
        assert_eq!(prefetcher.issued, 1);
        assert_eq!(rx.try_recv(), Ok(()));

        drop(rx);
        assert!(matches!(prefetcher.visit(&visit), Err(ZdtError::Interrupted)));

        cancel.store(true, Ordering::Release);
        assert!(matches!(prefetcher.visit(&visit), Err(ZdtError::Interrupted)));
        assert_eq!(prefetcher.issued, 1);
    }

    #[test]
    fn no_thread_without_prefetch_flags() {
        let root = bp(ObjectType::Objset, 0, 1);
        let ran = with_prefetch(
            &NullReader,
            &TraverseConfig::default(),
            ObjsetId(1),
            &root,
            Txg(0),
            TraverseFlags::PRE,
            |credits| credits.is_none(),
        );
        assert!(ran);
    }

    #[test]
    fn credits_run_out_when_prefetcher_exits() {
        // The prefetcher cannot read the root, so it exits at once and the
        // main side must not block.
        let root = bp(ObjectType::Dnode, 1, 1);
        let exhausted = with_prefetch(
            &NullReader,
            &TraverseConfig::default(),
            ObjsetId(1),
            &root,
            Txg(0),
            TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA,
            |credits| {
                let credits = credits.expect("prefetch thread running");
                // One token for the root itself, then nothing.
                credits.acquire() && !credits.acquire()
            },
        );
        assert!(exhausted);
    }
}
