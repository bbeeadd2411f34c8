#![forbid(unsafe_code)]
//! Declarative pool images.
//!
//! A [`PoolSpec`] names datasets, their objects and the birth txg of every
//! data block; [`build_pool`] writes the corresponding block trees into a
//! [`MemBlockStore`] bottom-up, so every parent's birth is at least the
//! birth of each of its children, as in a real copy-on-write pool.

use crate::store::MemBlockStore;
use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zdt_ondisk::{
    BlockPointer, DMU_OST_META, DMU_OST_ZFS, Dnode, DslDatasetPhys, LogRecord, LogRecordHeader,
    LogWrite, ObjectType, ObjsetPhys, TX_WRITE, ZIO_CHECKSUM_ZILOG2, ZilHeader, ZilHeaderFlags,
    encode_log_block,
};
use zdt_types::{BLKPTR_SIZE, DNODE_SIZE, ObjectId, ObjsetId, SPA_BLKPTRSHIFT, Txg};

pub const DEFAULT_DATA_BLOCK_SIZE: u32 = 4096;
/// 1 KiB indirect blocks: eight pointers each, so small specs grow deep trees.
pub const DEFAULT_INDBLKSHIFT: u8 = 10;
pub const DNODE_BLOCK_SIZE: u32 = 16384;
pub const LOG_BLOCK_SIZE: usize = 4096;
/// First word of every log block checksum in a built pool.
pub const LOG_GUID: u64 = 0x5A11_0C0F_FEE5;
const ACCOUNTING_TYPE: ObjectType = ObjectType::Other(45);

fn default_object_type() -> ObjectType {
    ObjectType::PlainFileContents
}
fn default_block_size() -> u32 {
    DEFAULT_DATA_BLOCK_SIZE
}
fn default_indblkshift() -> u8 {
    DEFAULT_INDBLKSHIFT
}
fn default_birth() -> u64 {
    1
}
fn default_txtype() -> u64 {
    TX_WRITE
}

// ── Specs ───────────────────────────────────────────────────────────────────

/// One object: the birth txg of each level-0 block, `0` for a hole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub object: u64,
    #[serde(default = "default_object_type")]
    pub object_type: ObjectType,
    #[serde(default)]
    pub blocks: Vec<u64>,
    /// Birth of the spill block, if the object has one.
    #[serde(default)]
    pub spill: Option<u64>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_indblkshift")]
    pub indblkshift: u8,
    /// Direct pointers in the dnode; defaults to `blocks.len()` clamped to 1..=3.
    #[serde(default)]
    pub nblkptr: Option<u8>,
    /// Txg at which the dnode itself last changed, beyond its block births.
    #[serde(default)]
    pub modified: u64,
}

impl ObjectSpec {
    #[must_use]
    pub fn file(object: u64, blocks: &[u64]) -> Self {
        Self {
            object,
            object_type: default_object_type(),
            blocks: blocks.to_vec(),
            spill: None,
            block_size: DEFAULT_DATA_BLOCK_SIZE,
            indblkshift: DEFAULT_INDBLKSHIFT,
            nblkptr: None,
            modified: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordSpec {
    pub seq: u64,
    #[serde(default = "default_txtype")]
    pub txtype: u64,
    #[serde(default)]
    pub object: u64,
    #[serde(default)]
    pub offset: u64,
    /// Birth of the logged data block; `0` logs a hole.
    #[serde(default)]
    pub birth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlockSpec {
    #[serde(default = "default_birth")]
    pub birth: u64,
    #[serde(default)]
    pub records: Vec<LogRecordSpec>,
}

/// Intent-log chain plus the claim state recorded in its header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSpec {
    #[serde(default)]
    pub claim_txg: u64,
    #[serde(default)]
    pub claim_blk_seq: u64,
    #[serde(default)]
    pub claim_lr_seq: u64,
    #[serde(default)]
    pub claim_lr_seq_valid: bool,
    /// Sequence number of the first block; the chain starts at 1 by default.
    #[serde(default)]
    pub first_seq: Option<u64>,
    pub blocks: Vec<LogBlockSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjsetSpec {
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
    /// Write the current 2048-byte header with user/group accounting dnodes.
    #[serde(default)]
    pub accounting: bool,
    #[serde(default)]
    pub log: Option<LogSpec>,
    /// Txg the header was last written; a floor for metadata births.
    #[serde(default = "default_birth")]
    pub birth: u64,
}

impl Default for ObjsetSpec {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            accounting: false,
            log: None,
            birth: default_birth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// MOS object holding the dataset record; also the objset id.
    pub object: u64,
    #[serde(default)]
    pub objset: ObjsetSpec,
    #[serde(default)]
    pub prev_snap_txg: u64,
    #[serde(default)]
    pub snapshot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    /// Non-dataset objects of the meta object set.
    #[serde(default)]
    pub mos_objects: Vec<ObjectSpec>,
    #[serde(default = "default_birth")]
    pub birth: u64,
}

impl PoolSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ── Built images ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BuiltObjset {
    pub objset: ObjsetId,
    pub bp: BlockPointer,
    pub phys: ObjsetPhys,
    pub dnodes: BTreeMap<u64, Dnode>,
    /// Dnode blocks of the meta dnode, by block id (holes included).
    pub dnode_blocks: Vec<BlockPointer>,
    pub log_blocks: Vec<BlockPointer>,
}

#[derive(Debug, Clone)]
pub struct BuiltDataset {
    pub object: ObjectId,
    pub phys: DslDatasetPhys,
    pub objset: BuiltObjset,
}

#[derive(Debug, Clone)]
pub struct BuiltPool {
    /// Root block pointer of the meta object set.
    pub root: BlockPointer,
    pub mos: BuiltObjset,
    pub datasets: Vec<BuiltDataset>,
}

impl BuiltPool {
    #[must_use]
    pub fn dataset(&self, object: u64) -> Option<&BuiltDataset> {
        self.datasets.iter().find(|ds| ds.object.0 == object)
    }
}

// ── Block trees ─────────────────────────────────────────────────────────────

fn data_block(store: &MemBlockStore, object_type: ObjectType, birth: u64, size: u32, seed: u64) -> BlockPointer {
    if birth == 0 {
        return BlockPointer::hole();
    }
    let mut data = vec![0_u8; size as usize];
    for (i, chunk) in data.chunks_mut(8).enumerate() {
        let word = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(i as u64);
        let bytes = word.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    store.write(
        BlockPointer {
            object_type,
            birth: Txg(birth),
            fill: 1,
            ..BlockPointer::default()
        },
        data,
    )
}

/// Stack indirect levels over `leaves` until at most `nblkptr` pointers
/// remain. Returns the top-level pointers (padded with holes) and `nlevels`.
fn build_tree(
    store: &MemBlockStore,
    object_type: ObjectType,
    leaves: Vec<BlockPointer>,
    nblkptr: usize,
    indblkshift: u8,
) -> Result<(Vec<BlockPointer>, u8)> {
    ensure!(
        u32::from(indblkshift) > SPA_BLKPTRSHIFT && indblkshift <= 17,
        "indblkshift {indblkshift} out of range"
    );
    let epb = 1_usize << (u32::from(indblkshift) - SPA_BLKPTRSHIFT);
    let mut level = 0_u8;
    let mut current = leaves;
    while current.len() > nblkptr {
        level += 1;
        current = current
            .chunks(epb)
            .map(|chunk| {
                if chunk.iter().all(BlockPointer::is_hole) {
                    return BlockPointer::hole();
                }
                let mut data = vec![0_u8; 1 << indblkshift];
                for (i, child) in chunk.iter().enumerate() {
                    child.encode_into(&mut data, i * BLKPTR_SIZE);
                }
                store.write(
                    BlockPointer {
                        object_type,
                        level,
                        birth: chunk.iter().map(|bp| bp.birth).max().unwrap_or_default(),
                        fill: chunk.iter().map(|bp| bp.fill).sum(),
                        ..BlockPointer::default()
                    },
                    data,
                )
            })
            .collect();
    }
    current.resize(nblkptr, BlockPointer::hole());
    Ok((current, level + 1))
}

/// Write the blocks of one object and return its dnode.
pub fn build_object(store: &MemBlockStore, objset: ObjsetId, spec: &ObjectSpec) -> Result<Dnode> {
    ensure!(
        spec.block_size >= 512 && spec.block_size % 512 == 0,
        "object {}: block size {} is not a multiple of 512",
        spec.object,
        spec.block_size
    );
    // The spill pointer takes the place of the third block pointer.
    let max_nblkptr = if spec.spill.is_some() { 2 } else { 3 };
    let nblkptr = spec
        .nblkptr
        .map_or_else(|| spec.blocks.len().clamp(1, max_nblkptr), usize::from);
    ensure!(
        (1..=max_nblkptr).contains(&nblkptr),
        "object {}: nblkptr must be 1..={max_nblkptr}",
        spec.object
    );

    let leaves = spec
        .blocks
        .iter()
        .enumerate()
        .map(|(blkid, birth)| {
            let seed = (objset.0 << 48) ^ (spec.object << 24) ^ blkid as u64;
            data_block(store, spec.object_type, *birth, spec.block_size, seed)
        })
        .collect();
    let (blkptr, nlevels) = build_tree(store, spec.object_type, leaves, nblkptr, spec.indblkshift)?;
    let spill = spec
        .spill
        .map(|birth| data_block(store, ObjectType::Other(44), birth.max(1), 512, !spec.object));

    Ok(Dnode {
        object_type: spec.object_type,
        indblkshift: spec.indblkshift,
        nlevels,
        datablkszsec: u16::try_from(spec.block_size / 512).unwrap_or(u16::MAX),
        maxblkid: spec.blocks.len().saturating_sub(1) as u64,
        blkptr,
        spill,
        ..Dnode::default()
    })
}

fn dnode_birth(dnode: &Dnode) -> Txg {
    dnode
        .blkptr
        .iter()
        .chain(dnode.spill.iter())
        .map(|bp| bp.birth)
        .max()
        .unwrap_or_default()
}

// ── Intent log ──────────────────────────────────────────────────────────────

fn log_bp(dva: zdt_ondisk::Dva, birth: u64, objset: ObjsetId, seq: u64) -> BlockPointer {
    BlockPointer {
        dva: [dva, zdt_ondisk::Dva::default(), zdt_ondisk::Dva::default()],
        lsize: LOG_BLOCK_SIZE as u32,
        psize: LOG_BLOCK_SIZE as u32,
        checksum_type: ZIO_CHECKSUM_ZILOG2,
        object_type: ObjectType::IntentLog,
        birth: Txg(birth),
        phys_birth: Txg(birth),
        checksum: [LOG_GUID, 0, objset.0, seq],
        ..BlockPointer::default()
    }
}

fn log_record(store: &MemBlockStore, objset: ObjsetId, spec: &LogRecordSpec) -> LogRecord {
    let header = LogRecordHeader {
        txtype: spec.txtype,
        reclen: 0,
        txg: Txg(spec.birth),
        seq: spec.seq,
    };
    if spec.txtype != TX_WRITE {
        return LogRecord::Other(header);
    }
    let seed = (objset.0 << 40) ^ spec.seq;
    LogRecord::Write(LogWrite {
        header,
        foid: ObjectId(spec.object),
        offset: spec.offset,
        length: u64::from(DEFAULT_DATA_BLOCK_SIZE),
        blkoff: 0,
        bp: data_block(
            store,
            ObjectType::PlainFileContents,
            spec.birth,
            DEFAULT_DATA_BLOCK_SIZE,
            seed,
        ),
    })
}

/// Write a log chain and return its header and block pointers.
///
/// The successor of the last block is allocated but never written, so a
/// reader reaches the end of the chain by failing to read it.
pub fn build_log(store: &MemBlockStore, objset: ObjsetId, spec: &LogSpec) -> Result<(ZilHeader, Vec<BlockPointer>)> {
    let first_seq = spec.first_seq.unwrap_or(1);
    let mut flags = ZilHeaderFlags::default();
    if spec.claim_lr_seq_valid {
        flags = ZilHeaderFlags::CLAIM_LR_SEQ_VALID;
    }
    let mut header = ZilHeader {
        claim_txg: Txg(spec.claim_txg),
        claim_blk_seq: spec.claim_blk_seq,
        claim_lr_seq: spec.claim_lr_seq,
        flags,
        ..ZilHeader::default()
    };
    if spec.blocks.is_empty() {
        return Ok((header, Vec::new()));
    }

    let size = LOG_BLOCK_SIZE as u32;
    let last_birth = spec.blocks.last().map_or(1, |block| block.birth);
    let chain: Vec<BlockPointer> = spec
        .blocks
        .iter()
        .map(|block| block.birth)
        .chain(std::iter::once(last_birth))
        .enumerate()
        .map(|(i, birth)| log_bp(store.allocate(size), birth.max(1), objset, first_seq + i as u64))
        .collect();

    let mut written = Vec::with_capacity(spec.blocks.len());
    for (i, block) in spec.blocks.iter().enumerate() {
        let records: Vec<LogRecord> = block
            .records
            .iter()
            .map(|record| log_record(store, objset, record))
            .collect();
        let Some(data) = encode_log_block(LOG_BLOCK_SIZE, &chain[i + 1], &records) else {
            bail!("log block {i} of objset {objset}: records do not fit");
        };
        written.push(store.write_at(chain[i].primary_dva(), chain[i], data));
    }
    header.log = written[0];
    Ok((header, written))
}

// ── Object sets ─────────────────────────────────────────────────────────────

fn build_objset_with(
    store: &MemBlockStore,
    objset: ObjsetId,
    spec: &ObjsetSpec,
    extra: Vec<(u64, Dnode, Txg)>,
) -> Result<BuiltObjset> {
    let mut entries: BTreeMap<u64, (Dnode, Txg)> = BTreeMap::new();
    for object in &spec.objects {
        ensure!(object.object != 0, "objset {objset}: object 0 is reserved");
        let dnode = build_object(store, objset, object)?;
        let modified = Txg(object.modified);
        if entries.insert(object.object, (dnode, modified)).is_some() {
            bail!("objset {objset}: object {} defined twice", object.object);
        }
    }
    for (object, dnode, modified) in extra {
        ensure!(object != 0, "objset {objset}: object 0 is reserved");
        if entries.insert(object, (dnode, modified)).is_some() {
            bail!("objset {objset}: object {object} defined twice");
        }
    }

    let per_block = DNODE_BLOCK_SIZE as usize / DNODE_SIZE;
    let block_count = entries
        .keys()
        .next_back()
        .map_or(1, |max| (*max as usize) / per_block + 1);
    let mut dnode_blocks = Vec::with_capacity(block_count);
    for blkid in 0..block_count {
        let first = (blkid * per_block) as u64;
        let members: Vec<_> = entries.range(first..first + per_block as u64).collect();
        if members.is_empty() {
            dnode_blocks.push(BlockPointer::hole());
            continue;
        }
        let mut data = vec![0_u8; DNODE_BLOCK_SIZE as usize];
        let mut birth = Txg(1);
        for (object, (dnode, modified)) in members {
            dnode.encode_into(&mut data, (*object - first) as usize * DNODE_SIZE);
            birth = birth.max(dnode_birth(dnode)).max(*modified);
        }
        dnode_blocks.push(store.write(
            BlockPointer {
                object_type: ObjectType::Dnode,
                birth,
                fill: 1,
                ..BlockPointer::default()
            },
            data,
        ));
    }

    let nblkptr = dnode_blocks.len().clamp(1, 3);
    let (blkptr, nlevels) = build_tree(
        store,
        ObjectType::Dnode,
        dnode_blocks.clone(),
        nblkptr,
        DEFAULT_INDBLKSHIFT,
    )?;
    let meta_dnode = Dnode {
        object_type: ObjectType::Dnode,
        indblkshift: DEFAULT_INDBLKSHIFT,
        nlevels,
        datablkszsec: u16::try_from(DNODE_BLOCK_SIZE / 512).unwrap_or(u16::MAX),
        maxblkid: block_count.saturating_sub(1) as u64,
        blkptr,
        ..Dnode::default()
    };

    let (userused, groupused) = if spec.accounting {
        let used = |seed: u64| -> Result<Dnode> {
            let mut object = ObjectSpec::file(seed, &[spec.birth]);
            object.object_type = ACCOUNTING_TYPE;
            build_object(store, objset, &object)
        };
        (Some(used(u64::MAX)?), Some(used(u64::MAX - 1)?))
    } else {
        (None, None)
    };

    let (zil_header, log_blocks) = match &spec.log {
        Some(log) => build_log(store, objset, log)?,
        None => (ZilHeader::default(), Vec::new()),
    };

    let phys = ObjsetPhys {
        meta_dnode,
        zil_header,
        os_type: if objset == ObjsetId::META {
            DMU_OST_META
        } else {
            DMU_OST_ZFS
        },
        flags: 0,
        userused,
        groupused,
    };
    let birth = std::iter::once(&phys.meta_dnode)
        .chain(phys.userused.iter())
        .chain(phys.groupused.iter())
        .map(dnode_birth)
        .fold(Txg(spec.birth.max(1)), Txg::max);
    let bp = store.write(
        BlockPointer {
            object_type: ObjectType::Objset,
            birth,
            fill: entries.len() as u64,
            ..BlockPointer::default()
        },
        phys.to_bytes(),
    );

    Ok(BuiltObjset {
        objset,
        bp,
        phys,
        dnodes: entries.into_iter().map(|(object, (dnode, _))| (object, dnode)).collect(),
        dnode_blocks,
        log_blocks,
    })
}

/// Write one object set and return its root block pointer and layout.
pub fn build_objset(store: &MemBlockStore, objset: ObjsetId, spec: &ObjsetSpec) -> Result<BuiltObjset> {
    build_objset_with(store, objset, spec, Vec::new())
}

fn dataset_dnode(phys: &DslDatasetPhys) -> Dnode {
    Dnode {
        object_type: ObjectType::DslDataset,
        bonus_type: ObjectType::DslDataset,
        indblkshift: DEFAULT_INDBLKSHIFT,
        nlevels: 1,
        datablkszsec: 1,
        blkptr: vec![BlockPointer::hole()],
        bonus: phys.to_bytes(),
        ..Dnode::default()
    }
}

/// Write every dataset and the meta object set that indexes them.
pub fn build_pool(store: &MemBlockStore, spec: &PoolSpec) -> Result<BuiltPool> {
    let mut datasets = Vec::with_capacity(spec.datasets.len());
    let mut extra = Vec::with_capacity(spec.datasets.len());
    for ds in &spec.datasets {
        let objset = build_objset(store, ObjsetId(ds.object), &ds.objset)?;
        let phys = DslDatasetPhys {
            dir_obj: ObjectId(1),
            prev_snap_txg: Txg(ds.prev_snap_txg),
            num_children: u64::from(ds.snapshot),
            creation_txg: Txg(ds.objset.birth),
            guid: ds.object.wrapping_mul(0x1000_0000_01B3),
            bp: objset.bp,
            ..DslDatasetPhys::default()
        };
        extra.push((ds.object, dataset_dnode(&phys), objset.bp.birth));
        datasets.push(BuiltDataset {
            object: ObjectId(ds.object),
            phys,
            objset,
        });
    }

    let mos_spec = ObjsetSpec {
        objects: spec.mos_objects.clone(),
        accounting: false,
        log: None,
        birth: spec.birth,
    };
    let mos = build_objset_with(store, ObjsetId::META, &mos_spec, extra)?;
    Ok(BuiltPool {
        root: mos.bp,
        mos,
        datasets,
    })
}
