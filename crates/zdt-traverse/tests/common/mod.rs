#![forbid(unsafe_code)]
#![allow(dead_code)]
//! Shared helpers for the traversal integration suites.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zdt_error::{Result, ZdtError};
use zdt_harness::{BuiltPool, MemBlockStore, PoolSpec, build_pool};
use zdt_traverse::{BlockVisitor, Pool, Visit, VisitAction, VisitPhase};
use zdt_types::{Bookmark, Txg};

/// One recorded callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub phase: VisitPhase,
    pub bookmark: Bookmark,
    pub birth: Option<Txg>,
    pub has_dnode: bool,
}

impl Event {
    pub fn is_hole(&self) -> bool {
        self.birth.is_none()
    }
}

/// Visitor that records every callback and can fail or prune on demand.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    /// Pre-order visits at these bookmarks fail with the given errno.
    pub fail_at: HashMap<Bookmark, i32>,
    pub prune_at: HashSet<Bookmark>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(bookmarks: &[Bookmark]) -> Self {
        Self {
            fail_at: bookmarks.iter().map(|bm| (*bm, libc::EIO)).collect(),
            ..Self::default()
        }
    }

    pub fn pruning(bookmarks: &[Bookmark]) -> Self {
        Self {
            prune_at: bookmarks.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn phase(&self, phase: VisitPhase) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |event| event.phase == phase)
    }

    /// Pre-order events that carry a block pointer.
    pub fn blocks(&self) -> Vec<Bookmark> {
        self.phase(VisitPhase::Pre)
            .filter(|event| !event.is_hole())
            .map(|event| event.bookmark)
            .collect()
    }

    pub fn holes(&self) -> usize {
        self.phase(VisitPhase::Pre).filter(|event| event.is_hole()).count()
    }
}

impl BlockVisitor for Recorder {
    fn visit(&mut self, visit: &Visit<'_>) -> Result<VisitAction> {
        self.events.push(Event {
            phase: visit.phase,
            bookmark: visit.bookmark,
            birth: visit.birth(),
            has_dnode: visit.dnode.is_some(),
        });
        if visit.phase == VisitPhase::Pre {
            if let Some(errno) = self.fail_at.get(&visit.bookmark) {
                return Err(ZdtError::callback(*errno, visit.bookmark.to_string()));
            }
        }
        if self.prune_at.contains(&visit.bookmark) {
            return Ok(VisitAction::Prune);
        }
        Ok(VisitAction::Descend)
    }
}

pub type TestPool = Pool<Arc<MemBlockStore>>;

/// Build `spec` into a fresh store and open it as a writable pool whose
/// first unsynced txg is `first_txg`.
pub fn open_pool(spec: &PoolSpec, first_txg: u64) -> (Arc<MemBlockStore>, BuiltPool, TestPool) {
    open_pool_in(Arc::new(MemBlockStore::new()), spec, first_txg)
}

pub fn open_pool_in(
    store: Arc<MemBlockStore>,
    spec: &PoolSpec,
    first_txg: u64,
) -> (Arc<MemBlockStore>, BuiltPool, TestPool) {
    let built = build_pool(&store, spec).expect("build pool");
    let pool = Pool::new(Arc::clone(&store), built.root, Txg(first_txg));
    store.reset_counters();
    (store, built, pool)
}

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("zdt-harness")
        .join("fixtures")
        .join(name)
}
