#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Walk policy bits supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraverseFlags(pub u32);

impl TraverseFlags {
    pub const NONE: Self = Self(0);
    /// Call the visitor before a block's children.
    pub const PRE: Self = Self(1 << 0);
    /// Call the visitor again after a block's children.
    pub const POST: Self = Self(1 << 1);
    /// Read ahead indirect and dnode blocks on a background thread.
    pub const PREFETCH_METADATA: Self = Self(1 << 2);
    /// Read ahead every block, leaves included.
    pub const PREFETCH_DATA: Self = Self(1 << 3);
    pub const PREFETCH: Self = Self(Self::PREFETCH_METADATA.0 | Self::PREFETCH_DATA.0);
    /// Continue past errors and return the last one seen.
    pub const HARD: Self = Self(1 << 4);

    const KNOWN: &'static [(Self, &'static str)] = &[
        (Self::PRE, "PRE"),
        (Self::POST, "POST"),
        (Self::PREFETCH_METADATA, "PREFETCH_METADATA"),
        (Self::PREFETCH_DATA, "PREFETCH_DATA"),
        (Self::HARD, "HARD"),
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
    pub fn intersects(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
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

impl std::ops::BitOr for TraverseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for TraverseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}
