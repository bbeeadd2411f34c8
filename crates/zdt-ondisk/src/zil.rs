#![forbid(unsafe_code)]
//! Intent-log layouts: the per-dataset header, the chain trailer that links
//! log blocks, and the records packed inside each block.

use crate::blkptr::{BlockPointer, ZIL_ZC_SEQ, ZIO_CHECKSUM_ZILOG2};
use serde::{Deserialize, Serialize};
use std::fmt;
use zdt_types::{BLKPTR_SIZE, ObjectId, ParseError, Txg, ensure_slice, read_le_u64, write_le_u64};

pub const ZIL_HEADER_SIZE: usize = 192;
pub const ZIL_CHAIN_SIZE: usize = 184;
pub const LR_HEADER_SIZE: usize = 32;
pub const LR_WRITE_SIZE: usize = 0x40 + BLKPTR_SIZE;

/// Embedded checksum magic stored in every chain trailer.
pub const ZEC_MAGIC: u64 = 0x0210_DA7A_B10C_7A11;

/// Log record type of a logged write.
pub const TX_WRITE: u64 = 9;
/// Case-insensitive marker OR-ed into a record type.
pub const TX_CI: u64 = 1 << 63;

// ── Header ──────────────────────────────────────────────────────────────────

/// Intent-log header flags (`zh_flags`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZilHeaderFlags(pub u64);

impl ZilHeaderFlags {
    pub const REPLAY_NEEDED: Self = Self(0x1);
    pub const CLAIM_LR_SEQ_VALID: Self = Self(0x2);

    const KNOWN: &'static [(Self, &'static str)] = &[
        (Self::REPLAY_NEEDED, "REPLAY_NEEDED"),
        (Self::CLAIM_LR_SEQ_VALID, "CLAIM_LR_SEQ_VALID"),
    ];

    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
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

impl fmt::Display for ZilHeaderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Per-dataset intent-log header, embedded in the object-set header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZilHeader {
    /// Txg in which the log blocks were claimed; zero if never claimed.
    pub claim_txg: Txg,
    pub replay_seq: u64,
    /// First block of the log chain.
    pub log: BlockPointer,
    /// Highest claimed block sequence.
    pub claim_blk_seq: u64,
    pub flags: ZilHeaderFlags,
    /// Highest claimed record sequence.
    pub claim_lr_seq: u64,
}

impl ZilHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, ZIL_HEADER_SIZE)?;
        Ok(Self {
            claim_txg: Txg(read_le_u64(raw, 0x00)?),
            replay_seq: read_le_u64(raw, 0x08)?,
            log: BlockPointer::parse(raw, 0x10)?,
            claim_blk_seq: read_le_u64(raw, 0x90)?,
            flags: ZilHeaderFlags(read_le_u64(raw, 0x98)?),
            claim_lr_seq: read_le_u64(raw, 0xA0)?,
        })
    }

    pub fn encode_into(&self, out: &mut [u8], offset: usize) {
        let raw = &mut out[offset..offset + ZIL_HEADER_SIZE];
        raw.fill(0);
        write_le_u64(raw, 0x00, self.claim_txg.0);
        write_le_u64(raw, 0x08, self.replay_seq);
        self.log.encode_into(raw, 0x10);
        write_le_u64(raw, 0x90, self.claim_blk_seq);
        write_le_u64(raw, 0x98, self.flags.0);
        write_le_u64(raw, 0xA0, self.claim_lr_seq);
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claim_txg != Txg::ZERO
    }

    /// Highest block sequence a parse may visit.
    #[must_use]
    pub fn block_seq_bound(&self) -> u64 {
        if self.is_claimed() {
            self.claim_blk_seq
        } else {
            u64::MAX
        }
    }

    /// Highest record sequence a parse may visit. Logs written before the
    /// bound was recorded carry no valid value and are unbounded.
    #[must_use]
    pub fn record_seq_bound(&self) -> u64 {
        if self.is_claimed() && self.flags.contains(ZilHeaderFlags::CLAIM_LR_SEQ_VALID) {
            self.claim_lr_seq
        } else {
            u64::MAX
        }
    }
}

// ── Chain trailer ───────────────────────────────────────────────────────────

/// Link to the next log block plus the byte count used by records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZilChain {
    pub next: BlockPointer,
    pub nused: u64,
    pub eck_magic: u64,
    pub eck_cksum: [u64; 4],
}

impl ZilChain {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, ZIL_CHAIN_SIZE)?;
        Ok(Self {
            next: BlockPointer::parse(raw, 0x08)?,
            nused: read_le_u64(raw, 0x88)?,
            eck_magic: read_le_u64(raw, 0x90)?,
            eck_cksum: [
                read_le_u64(raw, 0x98)?,
                read_le_u64(raw, 0xA0)?,
                read_le_u64(raw, 0xA8)?,
                read_le_u64(raw, 0xB0)?,
            ],
        })
    }

    pub fn encode_into(&self, out: &mut [u8], offset: usize) {
        let raw = &mut out[offset..offset + ZIL_CHAIN_SIZE];
        raw.fill(0);
        self.next.encode_into(raw, 0x08);
        write_le_u64(raw, 0x88, self.nused);
        write_le_u64(raw, 0x90, self.eck_magic);
        for (i, word) in self.eck_cksum.iter().enumerate() {
            write_le_u64(raw, 0x98 + i * 8, *word);
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Common header of every log record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordHeader {
    pub txtype: u64,
    pub reclen: u64,
    pub txg: Txg,
    pub seq: u64,
}

impl LogRecordHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, LR_HEADER_SIZE)?;
        Ok(Self {
            txtype: read_le_u64(raw, 0x00)?,
            reclen: read_le_u64(raw, 0x08)?,
            txg: Txg(read_le_u64(raw, 0x10)?),
            seq: read_le_u64(raw, 0x18)?,
        })
    }

    fn encode_into(&self, out: &mut [u8], offset: usize) {
        write_le_u64(out, offset, self.txtype);
        write_le_u64(out, offset + 0x08, self.reclen);
        write_le_u64(out, offset + 0x10, self.txg.0);
        write_le_u64(out, offset + 0x18, self.seq);
    }

    /// Record type with the case-insensitive marker stripped.
    #[must_use]
    pub fn base_type(&self) -> u64 {
        self.txtype & !TX_CI
    }
}

/// A logged write: the data block it refers to lives outside the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWrite {
    pub header: LogRecordHeader,
    pub foid: ObjectId,
    pub offset: u64,
    pub length: u64,
    pub blkoff: u64,
    pub bp: BlockPointer,
}

impl LogWrite {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, LR_WRITE_SIZE)?;
        Ok(Self {
            header: LogRecordHeader::parse(raw, 0)?,
            foid: ObjectId(read_le_u64(raw, 0x20)?),
            offset: read_le_u64(raw, 0x28)?,
            length: read_le_u64(raw, 0x30)?,
            blkoff: read_le_u64(raw, 0x38)?,
            bp: BlockPointer::parse(raw, 0x40)?,
        })
    }

    /// Block id of the written block within its object.
    #[must_use]
    pub fn blkid(&self) -> u64 {
        match u64::from(self.bp.lsize) {
            0 => 0,
            lsize => self.offset / lsize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Write(LogWrite),
    /// Any other record type; only the common header is decoded.
    Other(LogRecordHeader),
}

impl LogRecord {
    #[must_use]
    pub fn header(&self) -> &LogRecordHeader {
        match self {
            Self::Write(write) => &write.header,
            Self::Other(header) => header,
        }
    }

    /// Encode with `reclen` filled in from the payload size.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Write(write) => {
                let mut out = vec![0_u8; LR_WRITE_SIZE];
                let header = LogRecordHeader {
                    reclen: LR_WRITE_SIZE as u64,
                    ..write.header
                };
                header.encode_into(&mut out, 0);
                write_le_u64(&mut out, 0x20, write.foid.0);
                write_le_u64(&mut out, 0x28, write.offset);
                write_le_u64(&mut out, 0x30, write.length);
                write_le_u64(&mut out, 0x38, write.blkoff);
                write.bp.encode_into(&mut out, 0x40);
                out
            }
            Self::Other(header) => {
                let reclen = usize::try_from(header.reclen)
                    .unwrap_or(LR_HEADER_SIZE)
                    .max(LR_HEADER_SIZE);
                let mut out = vec![0_u8; reclen];
                LogRecordHeader {
                    reclen: reclen as u64,
                    ..*header
                }
                .encode_into(&mut out, 0);
                out
            }
        }
    }
}

// ── Log block ───────────────────────────────────────────────────────────────

/// One verified log block: its successor and its decoded records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    pub next: BlockPointer,
    pub records: Vec<LogRecord>,
}

impl LogBlock {
    /// Decode the log block `bp` whose contents are `data`.
    ///
    /// `ZILOG2` blocks carry the trailer first and `nused` counts it;
    /// older blocks carry it in the last 184 bytes. In both layouts the
    /// successor must not be a hole and must carry sequence `seq + 1`,
    /// otherwise this block is the end of the chain and parsing fails.
    pub fn parse(bp: &BlockPointer, data: &[u8]) -> Result<Self, ParseError> {
        let (chain, records_start, records_end) = if bp.checksum_type == ZIO_CHECKSUM_ZILOG2 {
            let chain = ZilChain::parse(data, 0)?;
            let end = usize::try_from(chain.nused).map_err(|_| ParseError::IntegerConversion {
                field: "zc_nused",
            })?;
            if end < ZIL_CHAIN_SIZE || end > data.len() {
                return Err(ParseError::InvalidField {
                    field: "zc_nused",
                    reason: "outside log block",
                });
            }
            (chain, ZIL_CHAIN_SIZE, end)
        } else {
            let trailer = data
                .len()
                .checked_sub(ZIL_CHAIN_SIZE)
                .ok_or(ParseError::InsufficientData {
                    needed: ZIL_CHAIN_SIZE,
                    offset: 0,
                    actual: data.len(),
                })?;
            let chain = ZilChain::parse(data, trailer)?;
            let end = usize::try_from(chain.nused)
                .ok()
                .filter(|end| *end <= trailer)
                .ok_or(ParseError::InvalidField {
                    field: "zc_nused",
                    reason: "overlaps chain trailer",
                })?;
            (chain, 0, end)
        };

        let mut expected = bp.checksum;
        expected[ZIL_ZC_SEQ] = expected[ZIL_ZC_SEQ].wrapping_add(1);
        if chain.next.is_hole() || chain.next.checksum != expected {
            return Err(ParseError::InvalidField {
                field: "zc_next_blk",
                reason: "chain link does not follow this block",
            });
        }

        let records = parse_records(&data[records_start..records_end])?;
        Ok(Self {
            next: chain.next,
            records,
        })
    }
}

/// Decode a packed record stream.
pub fn parse_records(stream: &[u8]) -> Result<Vec<LogRecord>, ParseError> {
    let mut records = Vec::new();
    let mut offset = 0_usize;
    while offset < stream.len() {
        let header = LogRecordHeader::parse(stream, offset)?;
        let reclen = usize::try_from(header.reclen)
            .ok()
            .filter(|len| {
                *len >= LR_HEADER_SIZE
                    && offset.checked_add(*len).is_some_and(|end| end <= stream.len())
            })
            .ok_or(ParseError::InvalidField {
                field: "lrc_reclen",
                reason: "record length out of range",
            })?;
        let record = if header.base_type() == TX_WRITE {
            LogRecord::Write(LogWrite::parse(&stream[offset..offset + reclen], 0)?)
        } else {
            LogRecord::Other(header)
        };
        records.push(record);
        offset += reclen;
    }
    Ok(records)
}

/// Build the bytes of a `ZILOG2` log block of `size` bytes.
///
/// Returns `None` when the records do not fit.
#[must_use]
pub fn encode_log_block(size: usize, next: &BlockPointer, records: &[LogRecord]) -> Option<Vec<u8>> {
    if size < ZIL_CHAIN_SIZE {
        return None;
    }
    let mut out = vec![0_u8; size];
    let mut offset = ZIL_CHAIN_SIZE;
    for record in records {
        let bytes = record.to_bytes();
        let end = offset.checked_add(bytes.len()).filter(|end| *end <= size)?;
        out[offset..end].copy_from_slice(&bytes);
        offset = end;
    }
    let chain = ZilChain {
        next: *next,
        nused: offset as u64,
        eck_magic: ZEC_MAGIC,
        eck_cksum: next.checksum,
    };
    chain.encode_into(&mut out, 0);
    Some(out)
}
