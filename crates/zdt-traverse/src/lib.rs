#![forbid(unsafe_code)]
//! Block-tree traversal.
//!
//! Visits every block reachable from an object-set root in a fixed order:
//! pre-order callbacks before a block's children, children in index order,
//! post-order callbacks after them. Blocks born at or before a minimum txg
//! are skipped together with their subtrees. An optional background thread
//! reads ahead of the walk under a bounded credit scheme.
//!
//! ```no_run
//! use zdt_traverse::{Pool, TraverseFlags, Visit, VisitAction, traverse_pool};
//! # fn demo<R: zdt_block::BlockReader>(pool: &Pool<R>) -> zdt_error::Result<()> {
//! let mut blocks = 0_u64;
//! let mut count = |visit: &Visit<'_>| -> zdt_error::Result<VisitAction> {
//!     blocks += u64::from(!visit.is_hole());
//!     Ok(VisitAction::Descend)
//! };
//! traverse_pool(pool, zdt_types::Txg(0), TraverseFlags::PRE | TraverseFlags::PREFETCH_METADATA, &mut count)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod flags;
mod objset;
mod pool;
mod prefetch;
mod visit;
mod zil;

pub use config::TraverseConfig;
pub use flags::TraverseFlags;
pub use objset::{Dataset, ObjsetView};
pub use pool::{Pool, traverse_dataset, traverse_pool, traverse_root};
pub use visit::{BlockVisitor, Visit, VisitAction, VisitPhase};
pub use zil::{LogContext, LogSummary, traverse_intent_log};
