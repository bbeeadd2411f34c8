#![forbid(unsafe_code)]
//! Block read layer consumed by the traversal engine.
//!
//! The engine never touches a device directly. It asks a [`BlockReader`]
//! for the contents of a block pointer (authoritative, blocking) and hints
//! upcoming reads through [`BlockReader::prefetch`] (advisory, errors
//! swallowed). Retry and verification policy belong to the reader.

mod arc;
mod file;

pub use arc::{ArcCache, CacheStats};
pub use file::{FileVdevReader, VDEV_LABEL_START_SIZE};

use std::fmt;
use std::sync::Arc;
use zdt_error::{Result, ZdtError};
use zdt_ondisk::BlockPointer;
use zdt_types::{Bookmark, ParseError};

/// Owned block contents. Dropping the buffer releases the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadPriority {
    SyncRead,
    AsyncRead,
}

/// Read modifiers passed through to the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReadFlags(pub u32);

impl ReadFlags {
    pub const NONE: Self = Self(0);
    /// The caller tolerates failure; the reader must not panic or retry forever.
    pub const CANFAIL: Self = Self(1 << 0);
    /// The read may be dropped under pressure.
    pub const SPECULATIVE: Self = Self(1 << 1);
    /// Issued on behalf of a scrub or verification walk.
    pub const SCRUB: Self = Self(1 << 2);

    const KNOWN: &'static [(Self, &'static str)] = &[
        (Self::CANFAIL, "CANFAIL"),
        (Self::SPECULATIVE, "SPECULATIVE"),
        (Self::SCRUB, "SCRUB"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        Self::KNOWN
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for ReadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for ReadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Source of block contents.
pub trait BlockReader: Send + Sync {
    /// Read and verify the block referenced by `bp`.
    ///
    /// `bookmark` identifies the logical position being read and is used for
    /// error reporting only.
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        priority: ReadPriority,
        flags: ReadFlags,
    ) -> Result<BlockBuf>;

    /// Hint that `bp` will be read soon. Never fails.
    fn prefetch(&self, bp: &BlockPointer, bookmark: &Bookmark);
}

impl<R: BlockReader + ?Sized> BlockReader for Arc<R> {
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        priority: ReadPriority,
        flags: ReadFlags,
    ) -> Result<BlockBuf> {
        (**self).read(bp, bookmark, priority, flags)
    }

    fn prefetch(&self, bp: &BlockPointer, bookmark: &Bookmark) {
        (**self).prefetch(bp, bookmark);
    }
}

impl<R: BlockReader + ?Sized> BlockReader for &R {
    fn read(
        &self,
        bp: &BlockPointer,
        bookmark: &Bookmark,
        priority: ReadPriority,
        flags: ReadFlags,
    ) -> Result<BlockBuf> {
        (**self).read(bp, bookmark, priority, flags)
    }

    fn prefetch(&self, bp: &BlockPointer, bookmark: &Bookmark) {
        (**self).prefetch(bp, bookmark);
    }
}

/// Wrap a decode failure of the block at `bookmark` as corruption.
#[must_use]
pub fn corruption_at(bookmark: &Bookmark, err: &ParseError) -> ZdtError {
    ZdtError::Corruption {
        location: bookmark.to_string(),
        detail: err.to_string(),
    }
}
