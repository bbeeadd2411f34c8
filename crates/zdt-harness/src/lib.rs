#![forbid(unsafe_code)]
//! Test infrastructure for the traversal engine.
//!
//! [`MemBlockStore`] is a checksumming in-memory [`zdt_block::BlockReader`]
//! with fault injection and read accounting. The [`builder`] module turns a
//! serde-described [`PoolSpec`] into real block trees inside such a store.

pub mod builder;
pub mod store;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub use builder::{
    BuiltDataset, BuiltObjset, BuiltPool, DEFAULT_DATA_BLOCK_SIZE, DEFAULT_INDBLKSHIFT,
    DNODE_BLOCK_SIZE, DatasetSpec, LOG_BLOCK_SIZE, LOG_GUID, LogBlockSpec, LogRecordSpec,
    LogSpec, ObjectSpec, ObjsetSpec, PoolSpec, build_log, build_object, build_objset,
    build_pool,
};
pub use store::{Fault, MemBlockStore, ReadRecord};

/// Load a JSON pool description from disk.
pub fn load_pool_spec(path: &Path) -> Result<PoolSpec> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    PoolSpec::from_json(&text).with_context(|| format!("invalid fixture json {}", path.display()))
}

/// Load a fixture and build it into a fresh store.
pub fn build_fixture(path: &Path) -> Result<(MemBlockStore, BuiltPool)> {
    let spec = load_pool_spec(path)?;
    let store = MemBlockStore::new();
    let pool = build_pool(&store, &spec)
        .with_context(|| format!("failed to build fixture {}", path.display()))?;
    Ok((store, pool))
}
