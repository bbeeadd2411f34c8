#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use zdt_block::ArcCache;
use zdt_error::Result;
use zdt_harness::{BuiltPool, DatasetSpec, MemBlockStore, ObjectSpec, ObjsetSpec, PoolSpec, build_pool};
use zdt_traverse::{Pool, TraverseFlags, Visit, VisitAction, traverse_pool};
use zdt_types::Txg;

// ── Fixture ─────────────────────────────────────────────────────────────

fn spec() -> PoolSpec {
    let objects = (1..=16)
        .map(|object| ObjectSpec::file(object, &[3; 64]))
        .collect();
    PoolSpec {
        datasets: vec![DatasetSpec {
            object: 21,
            objset: ObjsetSpec {
                objects,
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

fn setup(delay: Duration) -> (Arc<MemBlockStore>, BuiltPool) {
    let store = Arc::new(MemBlockStore::with_read_delay(delay));
    let built = build_pool(&store, &spec()).expect("build pool");
    (store, built)
}

fn count_blocks(pool: &Pool<ArcCache<Arc<MemBlockStore>>>, flags: TraverseFlags) -> u64 {
    let mut blocks = 0_u64;
    let mut visitor = |visit: &Visit<'_>| -> Result<VisitAction> {
        if visit.bp.is_some() {
            blocks += 1;
        }
        Ok(VisitAction::Descend)
    };
    traverse_pool(pool, Txg(0), flags, &mut visitor).expect("walk");
    blocks
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_cold_walk(c: &mut Criterion, name: &str, flags: TraverseFlags) {
    let (store, built) = setup(Duration::from_micros(20));
    c.bench_function(name, |b| {
        b.iter(|| {
            // A fresh cache per iteration keeps every walk cold.
            let cache = ArcCache::new(Arc::clone(&store), 4096).expect("cache");
            let pool = Pool::new(cache, built.root, Txg(10));
            black_box(count_blocks(&pool, flags))
        });
    });
}

fn bench_walk_plain(c: &mut Criterion) {
    bench_cold_walk(c, "traverse_pool_cold", TraverseFlags::PRE);
}

fn bench_walk_prefetch_metadata(c: &mut Criterion) {
    bench_cold_walk(
        c,
        "traverse_pool_cold_prefetch_metadata",
        TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA,
    );
}

criterion_group!(traverse_benches, bench_walk_plain, bench_walk_prefetch_metadata);
criterion_main!(traverse_benches);
