#![forbid(unsafe_code)]
//! Adaptive replacement read cache in front of a [`BlockReader`].
//!
//! Entries are keyed by the primary DVA plus birth txg, which is unique for
//! the lifetime of a copy-on-write block. A prefetch reads through to the
//! inner reader and installs the result, so the authoritative read that
//! follows is served from memory.

use crate::{BlockBuf, BlockReader, ReadFlags, ReadPriority};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::trace;
use zdt_error::{Result, ZdtError};
use zdt_ondisk::{BlockPointer, Dva};
use zdt_types::{Bookmark, Txg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    dva: Dva,
    birth: Txg,
}

impl CacheKey {
    fn of(bp: &BlockPointer) -> Self {
        Self {
            dva: bp.primary_dva(),
            birth: bp.birth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    /// Seen once, data cached.
    Recent,
    /// Seen more than once, data cached.
    Frequent,
    /// Evicted from `Recent`; only the key is remembered.
    RecentGhost,
    /// Evicted from `Frequent`; only the key is remembered.
    FrequentGhost,
}

/// Counters exposed for tests and benches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetch_fills: u64,
    pub prefetch_skipped: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Lists {
    capacity: usize,
    /// Adaptive target size of `recent`.
    recent_target: usize,
    recent: VecDeque<CacheKey>,
    frequent: VecDeque<CacheKey>,
    recent_ghost: VecDeque<CacheKey>,
    frequent_ghost: VecDeque<CacheKey>,
    residency: HashMap<CacheKey, Residency>,
    data: HashMap<CacheKey, Vec<u8>>,
    stats: CacheStats,
}

fn unlink(list: &mut VecDeque<CacheKey>, key: CacheKey) {
    if let Some(pos) = list.iter().position(|k| *k == key) {
        let _ = list.remove(pos);
    }
}

impl Lists {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent_target: 0,
            recent: VecDeque::new(),
            frequent: VecDeque::new(),
            recent_ghost: VecDeque::new(),
            frequent_ghost: VecDeque::new(),
            residency: HashMap::new(),
            data: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn lookup(&mut self, key: CacheKey) -> Option<Vec<u8>> {
        let bytes = self.data.get(&key).cloned()?;
        match self.residency.get(&key).copied() {
            Some(Residency::Recent) => {
                unlink(&mut self.recent, key);
                self.frequent.push_back(key);
                self.residency.insert(key, Residency::Frequent);
            }
            Some(Residency::Frequent) => {
                unlink(&mut self.frequent, key);
                self.frequent.push_back(key);
            }
            Some(Residency::RecentGhost | Residency::FrequentGhost) | None => {}
        }
        Some(bytes)
    }

    /// Demote one resident entry to its ghost list.
    fn evict_one(&mut self, incoming_was_frequent_ghost: bool) {
        let recent_len = self.recent.len();
        let take_recent = recent_len > 0
            && (recent_len > self.recent_target
                || (incoming_was_frequent_ghost && recent_len == self.recent_target));
        let victim = if take_recent {
            self.recent
                .pop_front()
                .map(|key| (key, Residency::RecentGhost))
        } else {
            self.frequent
                .pop_front()
                .map(|key| (key, Residency::FrequentGhost))
        };
        if let Some((key, ghost)) = victim {
            let _ = self.data.remove(&key);
            self.residency.insert(key, ghost);
            match ghost {
                Residency::RecentGhost => self.recent_ghost.push_back(key),
                _ => self.frequent_ghost.push_back(key),
            }
            self.stats.evictions += 1;
        }
        self.trim_ghosts();
    }

    fn trim_ghosts(&mut self) {
        for ghosts in [&mut self.recent_ghost, &mut self.frequent_ghost] {
            while ghosts.len() > self.capacity {
                if let Some(key) = ghosts.pop_front() {
                    let _ = self.residency.remove(&key);
                }
            }
        }
    }

    fn is_full(&self) -> bool {
        self.recent.len() + self.frequent.len() >= self.capacity
    }

    fn insert(&mut self, key: CacheKey, bytes: Vec<u8>) {
        if self.data.contains_key(&key) {
            return;
        }
        match self.residency.get(&key).copied() {
            Some(Residency::RecentGhost) => {
                let step = (self.frequent_ghost.len().max(1) / self.recent_ghost.len().max(1)).max(1);
                self.recent_target = (self.recent_target + step).min(self.capacity);
                unlink(&mut self.recent_ghost, key);
                if self.is_full() {
                    self.evict_one(false);
                }
                self.frequent.push_back(key);
                self.residency.insert(key, Residency::Frequent);
            }
            Some(Residency::FrequentGhost) => {
                let step = (self.recent_ghost.len().max(1) / self.frequent_ghost.len().max(1)).max(1);
                self.recent_target = self.recent_target.saturating_sub(step);
                unlink(&mut self.frequent_ghost, key);
                if self.is_full() {
                    self.evict_one(true);
                }
                self.frequent.push_back(key);
                self.residency.insert(key, Residency::Frequent);
            }
            _ => {
                if self.is_full() {
                    self.evict_one(false);
                }
                self.recent.push_back(key);
                self.residency.insert(key, Residency::Recent);
            }
        }
        self.data.insert(key, bytes);
    }
}

/// ARC-cached wrapper around a [`BlockReader`].
#[derive(Debug)]
pub struct ArcCache<R> {
    inner: R,
    lists: Mutex<Lists>,
}

impl<R: BlockReader> ArcCache<R> {
    pub fn new(inner: R, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(ZdtError::InvalidArgument(
                "ArcCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            lists: Mutex::new(Lists::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &R {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lists.lock().stats
    }

    /// Number of blocks whose contents are currently cached.
    #[must_use]
    pub fn resident_blocks(&self) -> usize {
        self.lists.lock().data.len()
    }

    #[must_use]
    pub fn contains(&self, bp: &BlockPointer) -> bool {
        self.lists.lock().data.contains_key(&CacheKey::of(bp))
    }
}

impl<R: BlockReader> BlockReader for ArcCache<R> {
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        priority: ReadPriority,
        flags: ReadFlags,
    ) -> Result<BlockBuf> {
        let key = CacheKey::of(bp);
        {
            let mut lists = self.lists.lock();
            if let Some(bytes) = lists.lookup(key) {
                lists.stats.hits += 1;
                drop(lists);
                return Ok(BlockBuf::new(bytes));
            }
            lists.stats.misses += 1;
        }

        let buf = self.inner.read(bp, bookmark, priority, flags)?;
        self.lists.lock().insert(key, buf.as_slice().to_vec());
        Ok(buf)
    }

    fn prefetch(&self, bp: &BlockPointer, bookmark: &Bookmark) {
        let key = CacheKey::of(bp);
        {
            let mut lists = self.lists.lock();
            if lists.data.contains_key(&key) {
                lists.stats.prefetch_skipped += 1;
                return;
            }
        }
        let flags = ReadFlags::CANFAIL | ReadFlags::SPECULATIVE;
        match self.inner.read(bp, bookmark, ReadPriority::AsyncRead, flags) {
            Ok(buf) => {
                let mut lists = self.lists.lock();
                lists.insert(key, buf.into_inner());
                lists.stats.prefetch_fills += 1;
            }
            Err(err) => {
                trace!(target: "zdt::block", %bookmark, error = %err, "prefetch_read_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use zdt_ondisk::ObjectType;
    use zdt_types::ObjsetId;

    /// Serves the DVA offset as the block contents and counts device reads.
    #[derive(Debug, Default)]
    struct CountingReader {
        reads: AtomicU64,
        fail_offset: Option<u64>,
    }

    impl BlockReader for CountingReader {
        fn read(
            &self,
            bp: &BlockPointer,
            _bookmark: &Bookmark,
            _priority: ReadPriority,
            _flags: ReadFlags,
        ) -> Result<BlockBuf> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if Some(bp.primary_dva().offset) == self.fail_offset {
                return Err(ZdtError::Io(std::io::Error::other("injected")));
            }
            Ok(BlockBuf::new(bp.primary_dva().offset.to_le_bytes().to_vec()))
        }

        fn prefetch(&self, _bp: &BlockPointer, _bookmark: &Bookmark) {}
    }

    fn bp_at(offset: u64) -> BlockPointer {
        let mut bp = BlockPointer {
            lsize: 512,
            psize: 512,
            object_type: ObjectType::PlainFileContents,
            birth: Txg(1),
            ..BlockPointer::default()
        };
        bp.dva[0] = Dva {
            vdev: 0,
            offset,
            asize: 512,
            gang: false,
        };
        bp
    }

    fn read(cache: &ArcCache<CountingReader>, offset: u64) -> Vec<u8> {
        cache
            .read(
                &bp_at(offset),
                &Bookmark::root(ObjsetId(0)),
                ReadPriority::SyncRead,
                ReadFlags::NONE,
            )
            .expect("read")
            .into_inner()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ArcCache::new(CountingReader::default(), 0).is_err());
    }

    #[test]
    fn second_read_hits() {
        let cache = ArcCache::new(CountingReader::default(), 4).expect("cache");
        assert_eq!(read(&cache, 0x200), 0x200_u64.to_le_bytes());
        assert_eq!(read(&cache, 0x200), 0x200_u64.to_le_bytes());
        assert_eq!(cache.inner().reads.load(Ordering::Relaxed), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn prefetch_fills_cache_for_later_read() {
        let cache = ArcCache::new(CountingReader::default(), 4).expect("cache");
        let bm = Bookmark::root(ObjsetId(1));
        cache.prefetch(&bp_at(0x400), &bm);
        cache.prefetch(&bp_at(0x400), &bm);
        assert!(cache.contains(&bp_at(0x400)));
        let _ = read(&cache, 0x400);
        assert_eq!(cache.inner().reads.load(Ordering::Relaxed), 1);
        let stats = cache.stats();
        assert_eq!(stats.prefetch_fills, 1);
        assert_eq!(stats.prefetch_skipped, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn prefetch_errors_are_swallowed() {
        let reader = CountingReader {
            fail_offset: Some(0x600),
            ..CountingReader::default()
        };
        let cache = ArcCache::new(reader, 4).expect("cache");
        cache.prefetch(&bp_at(0x600), &Bookmark::root(ObjsetId(1)));
        assert!(!cache.contains(&bp_at(0x600)));
        assert_eq!(cache.stats().prefetch_fills, 0);
    }

    #[test]
    fn capacity_bounds_resident_blocks() {
        let cache = ArcCache::new(CountingReader::default(), 3).expect("cache");
        for i in 0..10 {
            let _ = read(&cache, i * 0x200);
        }
        assert_eq!(cache.resident_blocks(), 3);
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn frequently_read_block_survives_scan() {
        let cache = ArcCache::new(CountingReader::default(), 4).expect("cache");
        let _ = read(&cache, 0);
        let _ = read(&cache, 0);
        for i in 1..=8 {
            let _ = read(&cache, i * 0x200);
        }
        assert!(cache.contains(&bp_at(0)));
    }

    #[test]
    fn same_dva_different_birth_is_a_different_block() {
        let cache = ArcCache::new(CountingReader::default(), 4).expect("cache");
        let bm = Bookmark::root(ObjsetId(1));
        let old = bp_at(0x800);
        let mut new = old;
        new.birth = Txg(2);
        let _ = cache.read(&old, &bm, ReadPriority::SyncRead, ReadFlags::NONE);
        assert!(!cache.contains(&new));
    }
}
