#![forbid(unsafe_code)]
//! Read-ahead must never change what a walk reports.
//!
//! Scenarios:
//! 1. Credit bound 1 reproduces the walk without prefetch, event for event.
//! 2. Metadata prefetch hints exactly the blocks that take credits.
//! 3. Data prefetch hints every block.
//! 4. Errors with prefetch running: strict walks return promptly, hard
//!    walks report what they would have reported without prefetch.
//! 5. Through an ARC cache, hints turn into cache fills.

mod common;

use common::{Recorder, TestPool, open_pool};
use std::collections::BTreeSet;
use std::sync::Arc;
use zdt_block::ArcCache;
use zdt_error::Result;
use zdt_harness::{DatasetSpec, Fault, ObjectSpec, ObjsetSpec, PoolSpec};
use zdt_traverse::{BlockVisitor, Pool, TraverseConfig, TraverseFlags, traverse_root};
use zdt_types::{Bookmark, ObjectId, ObjsetId, Txg};

const OS: ObjsetId = ObjsetId(5);

fn spec() -> PoolSpec {
    PoolSpec {
        datasets: vec![DatasetSpec {
            object: OS.0,
            objset: ObjsetSpec {
                objects: vec![
                    ObjectSpec::file(1, &[4; 20]),
                    ObjectSpec::file(2, &[3, 0, 3]),
                    ObjectSpec::file(40, &[6; 9]),
                ],
                accounting: true,
                ..ObjsetSpec::default()
            },
            prev_snap_txg: 0,
            snapshot: false,
        }],
        mos_objects: Vec::new(),
        birth: 1,
    }
}

fn credits(max: usize) -> TraverseConfig {
    TraverseConfig {
        prefetch_max_blocks: max,
    }
}

fn walk<R, V>(pool: &Pool<R>, flags: TraverseFlags, visitor: &mut V) -> Result<()>
where
    R: zdt_block::BlockReader,
    V: BlockVisitor,
{
    let dataset = pool.load_dataset(ObjectId(OS.0)).expect("dataset record");
    traverse_root(pool, dataset.objset(), dataset.root(), Txg(0), flags, visitor)
}

fn baseline(pool: &TestPool, flags: TraverseFlags) -> Recorder {
    let mut recorder = Recorder::new();
    walk(pool, flags, &mut recorder).expect("walk without prefetch");
    recorder
}

fn bm(object: u64, level: i64, blkid: u64) -> Bookmark {
    Bookmark::new(OS, ObjectId(object), level, blkid)
}

/// Blocks that carry a credit under metadata-only prefetch.
fn is_metadata(bookmark: &Bookmark) -> bool {
    !bookmark.is_root() && (bookmark.object == ObjectId::META_DNODE || bookmark.level > 0)
}

// ---------------------------------------------------------------------------
// Scenario 1: identical results
// ---------------------------------------------------------------------------

#[test]
fn single_credit_prefetch_matches_plain_walk() {
    let (store, _, pool) = open_pool(&spec(), 10);
    let pool = pool.with_config(credits(1));
    let flags = TraverseFlags::PRE | TraverseFlags::POST;
    let expected = baseline(&pool, flags);
    store.reset_counters();

    for prefetch in [
        TraverseFlags::PREFETCH_METADATA,
        TraverseFlags::PREFETCH_DATA,
        TraverseFlags::PREFETCH,
    ] {
        let mut recorder = Recorder::new();
        walk(&pool, flags | prefetch, &mut recorder).expect("walk with prefetch");
        assert_eq!(recorder.events, expected.events, "flags {}", flags | prefetch);
    }
    assert!(store.prefetch_count() > 0);
}

#[test]
fn wide_credit_window_matches_plain_walk() {
    let (_, _, pool) = open_pool(&spec(), 10);
    let pool = pool.with_config(credits(1000));
    let expected = baseline(&pool, TraverseFlags::PRE);
    let mut recorder = Recorder::new();
    walk(&pool, TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA, &mut recorder).expect("walk");
    assert_eq!(recorder.events, expected.events);
}

// ---------------------------------------------------------------------------
// Scenarios 2 and 3: what gets hinted
// ---------------------------------------------------------------------------

#[test]
fn metadata_prefetch_hints_credit_taking_blocks_only() {
    let (store, _, pool) = open_pool(&spec(), 10);
    let expected = baseline(&pool, TraverseFlags::PRE);
    store.reset_counters();

    let mut recorder = Recorder::new();
    walk(&pool, TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA, &mut recorder).expect("walk");

    let hinted: BTreeSet<Bookmark> = store.prefetches().into_iter().collect();
    let wanted: BTreeSet<Bookmark> = expected.blocks().into_iter().filter(is_metadata).collect();
    assert_eq!(hinted, wanted);
    assert!(hinted.contains(&bm(0, 0, 1)));
    assert!(hinted.contains(&bm(1, 1, 2)));
    assert!(!hinted.contains(&bm(1, 0, 0)));
    assert_eq!(store.prefetch_count(), hinted.len());
}

#[test]
fn data_prefetch_hints_every_block() {
    let (store, _, pool) = open_pool(&spec(), 10);
    let expected = baseline(&pool, TraverseFlags::PRE);
    store.reset_counters();

    let mut recorder = Recorder::new();
    walk(&pool, TraverseFlags::PRE | TraverseFlags::PREFETCH_DATA, &mut recorder).expect("walk");

    let hinted: BTreeSet<Bookmark> = store.prefetches().into_iter().collect();
    let wanted: BTreeSet<Bookmark> = expected.blocks().into_iter().collect();
    assert_eq!(hinted, wanted);
    assert!(hinted.contains(&Bookmark::root(OS)));
    assert!(hinted.contains(&bm(40, 1, 1)));
}

// ---------------------------------------------------------------------------
// Scenario 4: errors with prefetch running
// ---------------------------------------------------------------------------

#[test]
fn strict_failure_with_prefetch_returns_the_same_error() {
    let (_, _, pool) = open_pool(&spec(), 10);
    let pool = pool.with_config(credits(1));
    let failing = [bm(1, 0, 3)];

    let mut plain = Recorder::failing(&failing);
    let plain_err = walk(&pool, TraverseFlags::PRE, &mut plain).unwrap_err();

    let mut prefetched = Recorder::failing(&failing);
    let flags = TraverseFlags::PRE | TraverseFlags::PREFETCH;
    let err = walk(&pool, flags, &mut prefetched).unwrap_err();

    assert_eq!(err.to_string(), plain_err.to_string());
    assert_eq!(prefetched.events, plain.events);
}

#[test]
fn hard_walk_over_damage_is_unchanged_by_prefetch() {
    let (store, built, pool) = open_pool(&spec(), 10);
    let pool = pool.with_config(credits(2));
    let dataset = built.dataset(OS.0).expect("dataset");
    store.inject_fault(&dataset.objset.dnodes[&1].blkptr[1], Fault::Corrupt);
    store.inject_fault(&dataset.objset.dnodes[&40].blkptr[0], Fault::Io);

    let flags = TraverseFlags::PRE | TraverseFlags::POST | TraverseFlags::HARD;
    let mut plain = Recorder::new();
    let plain_err = walk(&pool, flags, &mut plain).unwrap_err();

    let mut prefetched = Recorder::new();
    let err = walk(&pool, flags | TraverseFlags::PREFETCH, &mut prefetched).unwrap_err();

    assert!(err.is_media_error());
    assert_eq!(err.to_string(), plain_err.to_string());
    assert_eq!(prefetched.events, plain.events);
}

// ---------------------------------------------------------------------------
// Scenario 5: ARC cache underneath
// ---------------------------------------------------------------------------

#[test]
fn hints_fill_the_arc_cache() {
    let (store, built, _) = open_pool(&spec(), 10);
    let cache = ArcCache::new(Arc::clone(&store), 256).expect("cache");
    let pool = Pool::new(cache, built.root, Txg(10)).with_config(credits(4));

    let mut plain = Recorder::new();
    {
        let uncached = Pool::new(Arc::clone(&store), built.root, Txg(10));
        walk(&uncached, TraverseFlags::PRE, &mut plain).expect("uncached walk");
    }

    let mut recorder = Recorder::new();
    walk(&pool, TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA, &mut recorder).expect("walk");
    assert_eq!(recorder.events, plain.events);

    let stats = pool.reader().stats();
    assert!(stats.prefetch_fills + stats.prefetch_skipped > 0);
    assert!(stats.hits > 0);
}
