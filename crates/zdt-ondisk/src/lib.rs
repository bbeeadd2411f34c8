#![forbid(unsafe_code)]
//! On-disk layouts consumed by the traversal engine.
//!
//! Every structure has a bounds-checked `parse` returning
//! [`zdt_types::ParseError`] and an encoder that produces the exact bytes
//! `parse` accepts, so test pools can be assembled byte for byte.
//!
//! | Structure | Size | Module |
//! |-----------|------|--------|
//! | block pointer | 128 | [`blkptr`] |
//! | dnode record | 512 | [`dnode`] |
//! | object-set header | 1024 / 2048 | [`objset`] |
//! | intent-log header, chain trailer, records | 192 / 184 / 32+ | [`zil`] |
//! | dataset record | 320 | [`dataset`] |

pub mod blkptr;
pub mod dataset;
pub mod dnode;
pub mod objset;
pub mod zil;

pub use blkptr::{
    BlockPointer, Dva, ObjectType, ZIL_ZC_OBJSET, ZIL_ZC_SEQ, ZIO_CHECKSUM_FLETCHER_4,
    ZIO_CHECKSUM_ZILOG2,
};
pub use dataset::{DSL_DATASET_PHYS_SIZE, DslDatasetPhys};
pub use dnode::{DN_MAX_NBLKPTR, Dnode, DnodeFlags};
pub use objset::{DMU_OST_META, DMU_OST_NONE, DMU_OST_ZFS, DMU_OST_ZVOL, ObjsetPhys};
pub use zil::{
    LogBlock, LogRecord, LogRecordHeader, LogWrite, TX_CI, TX_WRITE, ZilChain, ZilHeader,
    ZilHeaderFlags, encode_log_block, parse_records,
};
