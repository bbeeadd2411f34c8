#![forbid(unsafe_code)]

use crate::{BlockBuf, BlockReader, ReadFlags, ReadPriority};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use zdt_error::{Result, ZdtError};
use zdt_ondisk::BlockPointer;
use zdt_types::Bookmark;

/// Bytes reserved at the front of a vdev for the two leading labels and
/// the boot block; DVA offsets are relative to the end of this region.
pub const VDEV_LABEL_START_SIZE: u64 = 4 << 20;

/// Reads uncompressed, non-gang blocks from a single flat vdev image.
///
/// This is the minimal reader for inspecting images produced without
/// compression; it performs no checksum verification of its own.
#[derive(Debug, Clone)]
pub struct FileVdevReader {
    file: Arc<File>,
    len: u64,
}

impl FileVdevReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    fn check(bp: &BlockPointer, bookmark: &Bookmark) -> Result<()> {
        let dva = bp.primary_dva();
        if dva.gang {
            return Err(ZdtError::InvalidArgument(format!(
                "gang block at {bookmark} is not supported"
            )));
        }
        if bp.lsize != bp.psize {
            return Err(ZdtError::InvalidArgument(format!(
                "compressed block at {bookmark} is not supported (lsize={:#x} psize={:#x})",
                bp.lsize, bp.psize
            )));
        }
        Ok(())
    }
}

impl BlockReader for FileVdevReader {
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        _priority: ReadPriority,
        _flags: ReadFlags,
    ) -> Result<BlockBuf> {
        Self::check(bp, bookmark)?;
        let offset = bp
            .primary_dva()
            .offset
            .checked_add(VDEV_LABEL_START_SIZE)
            .ok_or_else(|| ZdtError::InvalidArgument("DVA offset overflows u64".to_owned()))?;
        let size = usize::try_from(bp.psize)
            .map_err(|_| ZdtError::InvalidArgument("psize does not fit usize".to_owned()))?;
        let end = offset.saturating_add(u64::from(bp.psize));
        if end > self.len {
            return Err(ZdtError::Corruption {
                location: bookmark.to_string(),
                detail: format!(
                    "block {:#x}+{:#x} past end of vdev ({:#x} bytes)",
                    offset, bp.psize, self.len
                ),
            });
        }

        let mut buf = vec![0_u8; size];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn prefetch(&self, bp: &BlockPointer, bookmark: &Bookmark) {
        // The page cache does read-ahead for us; nothing to schedule.
        debug!(target: "zdt::block", %bookmark, dva = %bp.primary_dva(), "file_prefetch_hint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zdt_ondisk::{Dva, ObjectType};
    use zdt_types::{ObjsetId, Txg};

    fn bp(offset: u64, size: u32) -> BlockPointer {
        let mut bp = BlockPointer {
            lsize: size,
            psize: size,
            object_type: ObjectType::PlainFileContents,
            birth: Txg(1),
            ..BlockPointer::default()
        };
        bp.dva[0] = Dva {
            vdev: 0,
            offset,
            asize: u64::from(size),
            gang: false,
        };
        bp
    }

    #[test]
    fn reads_block_after_label_region() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut image = vec![0_u8; usize::try_from(VDEV_LABEL_START_SIZE).unwrap() + 4096];
        let start = usize::try_from(VDEV_LABEL_START_SIZE).unwrap() + 1024;
        image[start..start + 512].fill(0x5A);
        file.write_all(&image).expect("write image");

        let reader = FileVdevReader::open(file.path()).expect("open");
        let bm = Bookmark::root(ObjsetId(0));
        let buf = reader
            .read(&bp(1024, 512), &bm, ReadPriority::SyncRead, ReadFlags::NONE)
            .expect("read");
        assert_eq!(buf.as_slice(), &[0x5A; 512]);

        let err = reader
            .read(&bp(4096, 512), &bm, ReadPriority::SyncRead, ReadFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, ZdtError::Corruption { .. }));
    }

    #[test]
    fn compressed_and_gang_blocks_are_refused() {
        let bm = Bookmark::root(ObjsetId(0));
        let mut compressed = bp(0, 4096);
        compressed.psize = 1024;
        assert!(FileVdevReader::check(&compressed, &bm).is_err());
        let mut gang = bp(0, 512);
        gang.dva[0].gang = true;
        assert!(FileVdevReader::check(&gang, &bm).is_err());
        assert!(FileVdevReader::check(&bp(0, 512), &bm).is_ok());
    }
}
