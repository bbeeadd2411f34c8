#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;
use zdt_block::{BlockBuf, BlockReader, ReadFlags, ReadPriority};
use zdt_error::{Result, ZdtError};
use zdt_ondisk::{BlockPointer, Dva, ObjectType};
use zdt_types::{Bookmark, SPA_MINBLOCKSHIFT};

/// Injected read failure for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The read fails with `EIO`.
    Io,
    /// The stored bytes are damaged, so checksum verification fails.
    Corrupt,
}

/// One read as observed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    pub bookmark: Bookmark,
    pub priority: ReadPriority,
    pub speculative: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    next_offset: u64,
    blocks: HashMap<Dva, Vec<u8>>,
    faults: HashMap<Dva, Fault>,
    reads: Vec<ReadRecord>,
    prefetches: Vec<Bookmark>,
}

/// In-memory block store keyed by primary DVA.
///
/// Every non-log block written through [`MemBlockStore::write`] gets the
/// CRC32C of its contents in checksum word 0; reads verify it. Intent-log
/// blocks keep the chain verifier their caller put in the checksum words.
#[derive(Debug, Default)]
pub struct MemBlockStore {
    state: Mutex<StoreState>,
    read_delay: Option<Duration>,
}

fn block_checksum(data: &[u8]) -> u64 {
    u64::from(crc32c::crc32c(data))
}

fn is_log_block(bp: &BlockPointer) -> bool {
    bp.object_type == ObjectType::IntentLog
}

impl MemBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose reads each sleep for `delay`, to make prefetch overlap
    /// visible in benches.
    #[must_use]
    pub fn with_read_delay(delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Reserve `size` bytes of address space without writing anything.
    #[must_use]
    pub fn allocate(&self, size: u32) -> Dva {
        let size = u64::from(size.max(1 << SPA_MINBLOCKSHIFT));
        let mut state = self.state.lock();
        let offset = state.next_offset;
        state.next_offset += size;
        drop(state);
        Dva {
            vdev: 0,
            offset,
            asize: size,
            gang: false,
        }
    }

    /// Allocate space for `data` and store it.
    ///
    /// `template` supplies type, level, birth and (for log blocks) the
    /// checksum words; sizes and the DVA are filled in here.
    pub fn write(&self, template: BlockPointer, data: Vec<u8>) -> BlockPointer {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let dva = self.allocate(size);
        self.write_at(dva, template, data)
    }

    /// Store `data` at a previously allocated `dva`.
    pub fn write_at(&self, dva: Dva, template: BlockPointer, data: Vec<u8>) -> BlockPointer {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let mut bp = template;
        bp.dva = [dva, Dva::default(), Dva::default()];
        bp.lsize = size;
        bp.psize = size;
        if bp.phys_birth.0 == 0 {
            bp.phys_birth = bp.birth;
        }
        if !is_log_block(&bp) {
            bp.checksum = [block_checksum(&data), 0, 0, 0];
        }
        self.state.lock().blocks.insert(dva, data);
        bp
    }

    pub fn inject_fault(&self, bp: &BlockPointer, fault: Fault) {
        self.state.lock().faults.insert(bp.primary_dva(), fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Overwrite a stored block in place (checksum left stale).
    pub fn overwrite(&self, bp: &BlockPointer, data: Vec<u8>) {
        self.state.lock().blocks.insert(bp.primary_dva(), data);
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.state.lock().reads.len()
    }

    #[must_use]
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.state.lock().reads.clone()
    }

    #[must_use]
    pub fn prefetch_count(&self) -> usize {
        self.state.lock().prefetches.len()
    }

    #[must_use]
    pub fn prefetches(&self) -> Vec<Bookmark> {
        self.state.lock().prefetches.clone()
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.reads.clear();
        state.prefetches.clear();
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }
}

impl BlockReader for MemBlockStore {
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        priority: ReadPriority,
        flags: ReadFlags,
    ) -> Result<BlockBuf> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        let dva = bp.primary_dva();
        let mut state = self.state.lock();
        state.reads.push(ReadRecord {
            bookmark: *bookmark,
            priority,
            speculative: flags.contains(ReadFlags::SPECULATIVE),
        });
        let fault = state.faults.get(&dva).copied();
        let stored = state.blocks.get(&dva).cloned();
        drop(state);

        trace!(target: "zdt::harness", %bookmark, %dva, ?fault, "store_read");
        if fault == Some(Fault::Io) {
            return Err(ZdtError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        let Some(mut data) = stored else {
            return Err(ZdtError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no block stored at {dva}"),
            )));
        };
        if fault == Some(Fault::Corrupt) {
            if let Some(first) = data.first_mut() {
                *first ^= 0xFF;
            }
        }
        if !is_log_block(bp) {
            let actual = block_checksum(&data);
            if actual != bp.checksum[0] {
                return Err(ZdtError::Checksum {
                    location: bookmark.to_string(),
                    detail: format!(
                        "dva {dva}: expected crc32c {:#010x}, got {actual:#010x}",
                        bp.checksum[0]
                    ),
                });
            }
        }
        Ok(BlockBuf::new(data))
    }

    fn prefetch(&self, _bp: &BlockPointer, bookmark: &Bookmark) {
        self.state.lock().prefetches.push(*bookmark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdt_types::{ObjsetId, Txg};

    fn template(object_type: ObjectType) -> BlockPointer {
        BlockPointer {
            object_type,
            birth: Txg(3),
            ..BlockPointer::default()
        }
    }

    fn read(store: &MemBlockStore, bp: &BlockPointer) -> Result<BlockBuf> {
        store.read(
            bp,
            &Bookmark::root(ObjsetId(1)),
            ReadPriority::SyncRead,
            ReadFlags::CANFAIL,
        )
    }

    #[test]
    fn written_blocks_read_back_and_are_counted() {
        let store = MemBlockStore::new();
        let bp = store.write(template(ObjectType::PlainFileContents), vec![9; 1024]);
        assert_eq!(bp.lsize, 1024);
        assert_eq!(bp.phys_birth, Txg(3));
        assert_eq!(read(&store, &bp).expect("read").as_slice(), &[9; 1024]);
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let store = MemBlockStore::new();
        let a = store.allocate(4096);
        let b = store.allocate(100);
        let c = store.allocate(512);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 4096);
        assert_eq!(c.offset, 4096 + 512);
    }

    #[test]
    fn injected_faults_surface_as_media_errors() {
        let store = MemBlockStore::new();
        let bp = store.write(template(ObjectType::Dnode), vec![1; 512]);

        store.inject_fault(&bp, Fault::Io);
        let err = read(&store, &bp).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);

        store.inject_fault(&bp, Fault::Corrupt);
        assert!(matches!(read(&store, &bp), Err(ZdtError::Checksum { .. })));

        store.clear_faults();
        assert!(read(&store, &bp).is_ok());
    }

    #[test]
    fn log_blocks_keep_chain_checksum() {
        let store = MemBlockStore::new();
        let mut tmpl = template(ObjectType::IntentLog);
        tmpl.checksum = [7, 0, 21, 1];
        let bp = store.write(tmpl, vec![0; 512]);
        assert_eq!(bp.checksum, [7, 0, 21, 1]);
        assert!(read(&store, &bp).is_ok());
    }

    #[test]
    fn unallocated_block_fails_to_read() {
        let store = MemBlockStore::new();
        let mut bp = template(ObjectType::IntentLog);
        bp.dva[0] = store.allocate(512);
        assert!(matches!(read(&store, &bp), Err(ZdtError::Io(_))));
    }

    #[test]
    fn prefetch_hints_are_recorded() {
        let store = MemBlockStore::new();
        let bp = store.write(template(ObjectType::Dnode), vec![0; 512]);
        store.prefetch(&bp, &Bookmark::root(ObjsetId(4)));
        assert_eq!(store.prefetches(), vec![Bookmark::root(ObjsetId(4))]);
        store.reset_counters();
        assert_eq!(store.prefetch_count(), 0);
    }
}
