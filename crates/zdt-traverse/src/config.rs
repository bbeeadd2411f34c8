#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Per-walk tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraverseConfig {
    /// How many blocks the prefetch thread may run ahead of the walk.
    /// Default: 100.
    pub prefetch_max_blocks: usize,
}

impl Default for TraverseConfig {
    fn default() -> Self {
        Self {
            prefetch_max_blocks: 100,
        }
    }
}

impl TraverseConfig {
    /// Capacity of the credit channel; never zero, since a rendezvous
    /// channel would serialize the two threads.
    #[must_use]
    pub fn credit_bound(&self) -> usize {
        self.prefetch_max_blocks.max(1)
    }
}
