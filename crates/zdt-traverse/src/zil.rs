#![forbid(unsafe_code)]
//! Intent-log walk.
//!
//! The log is a chain of blocks, each naming its successor, holding a
//! stream of records. Log blocks are reported at level −2 keyed by their
//! chain sequence; blocks referenced from logged writes are reported under
//! the written object at level −2 keyed by block id.
//!
//! Nothing found here affects the result of the enclosing walk. Read and
//! parse failures end the chain and are logged with the parse summary.

use crate::visit::{BlockVisitor, Visit, VisitPhase};
use tracing::{debug, trace};
use zdt_block::{BlockReader, ReadFlags, ReadPriority, corruption_at};
use zdt_error::ZdtError;
use zdt_ondisk::{BlockPointer, LogBlock, LogRecord, LogWrite, TX_WRITE, ZilHeader};
use zdt_types::{Bookmark, ObjsetId, Txg};

/// What a log walk saw.
#[derive(Debug, Default)]
pub struct LogSummary {
    /// Whether the chain was walked at all.
    pub walked: bool,
    pub blocks: u64,
    pub records: u64,
    pub max_blk_seq: u64,
    pub max_lr_seq: u64,
    /// The read or parse failure that ended the chain, if any.
    pub error: Option<ZdtError>,
}

/// Pool-level inputs to the log walk.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    pub objset: ObjsetId,
    /// First txg that has not yet been synced by this pool.
    pub first_txg: Txg,
    pub writable: bool,
}

struct LogWalker<'a, V: BlockVisitor + ?Sized> {
    reader: &'a dyn BlockReader,
    ctx: LogContext,
    header: &'a ZilHeader,
    visitor: &'a mut V,
}

impl<V: BlockVisitor + ?Sized> LogWalker<'_, V> {
    fn report(&mut self, bp: &BlockPointer, bookmark: Bookmark) {
        let visit = Visit {
            bp: Some(bp),
            bookmark,
            dnode: None,
            zil: Some(self.header),
            phase: VisitPhase::Log,
        };
        if let Err(err) = self.visitor.visit(&visit) {
            trace!(target: "zdt::zil", %bookmark, error = %err, "log_visit_error_ignored");
        }
    }

    fn visit_block(&mut self, bp: &BlockPointer) {
        let claim_txg = self.header.claim_txg;
        if bp.is_hole() {
            return;
        }
        // Unclaimed logs: blocks born in txgs this pool has not synced yet
        // are reported only once they are.
        if claim_txg == Txg::ZERO && bp.birth >= self.ctx.first_txg {
            return;
        }
        self.report(bp, Bookmark::zil_block(self.ctx.objset, bp.zil_seq()));
    }

    fn visit_record(&mut self, record: &LogRecord) {
        let LogRecord::Write(write) = record else {
            return;
        };
        if write.header.txtype != TX_WRITE {
            return;
        }
        let LogWrite { bp, foid, .. } = write;
        let claim_txg = self.header.claim_txg;
        if bp.is_hole() || claim_txg == Txg::ZERO || bp.birth < claim_txg {
            return;
        }
        self.report(bp, Bookmark::zil_record(self.ctx.objset, *foid, write.blkid()));
    }

    fn walk(&mut self) -> LogSummary {
        let blk_bound = self.header.block_seq_bound();
        let lr_bound = self.header.record_seq_bound();
        let mut summary = LogSummary {
            walked: true,
            ..LogSummary::default()
        };

        let mut blk = self.header.log;
        'chain: while !blk.is_hole() {
            let seq = blk.zil_seq();
            if seq > blk_bound {
                break;
            }
            self.visit_block(&blk);
            summary.max_blk_seq = seq;
            summary.blocks += 1;

            if summary.max_lr_seq == lr_bound && summary.max_blk_seq == blk_bound {
                break;
            }

            let bookmark = Bookmark::zil_block(self.ctx.objset, seq);
            let block = self
                .read(&blk, &bookmark)
                .and_then(|data| LogBlock::parse(&blk, &data).map_err(|err| corruption_at(&bookmark, &err)));
            let block = match block {
                Ok(block) => block,
                Err(err) => {
                    summary.error = Some(err);
                    break;
                }
            };

            for record in &block.records {
                let lr_seq = record.header().seq;
                if lr_seq > lr_bound {
                    break 'chain;
                }
                self.visit_record(record);
                summary.max_lr_seq = lr_seq;
                summary.records += 1;
            }
            blk = block.next;
        }
        summary
    }

    fn read(&self, bp: &BlockPointer, bookmark: &Bookmark) -> zdt_error::Result<Vec<u8>> {
        let flags = ReadFlags::CANFAIL | ReadFlags::SPECULATIVE | ReadFlags::SCRUB;
        let buf = self.reader.read(bp, bookmark, ReadPriority::SyncRead, flags)?;
        Ok(buf.into_inner())
    }
}

/// Walk the intent log described by `header`, reporting blocks to
/// `visitor` with phase [`VisitPhase::Log`].
///
/// Runs only when the log has been claimed, or when the pool is not
/// writable. Claimed logs stop at the claimed block and record sequences.
/// Visitor errors are ignored.
pub fn traverse_intent_log<V: BlockVisitor + ?Sized>(
    reader: &dyn BlockReader,
    ctx: LogContext,
    header: &ZilHeader,
    visitor: &mut V,
) -> LogSummary {
    if header.claim_txg == Txg::ZERO && ctx.writable {
        trace!(target: "zdt::zil", objset = %ctx.objset, "log_walk_skipped");
        return LogSummary::default();
    }
    let mut walker = LogWalker {
        reader,
        ctx,
        header,
        visitor,
    };
    let summary = walker.walk();
    debug!(
        target: "zdt::zil",
        objset = %ctx.objset,
        claim_txg = %header.claim_txg,
        blocks = summary.blocks,
        records = summary.records,
        max_blk_seq = summary.max_blk_seq,
        max_lr_seq = summary.max_lr_seq,
        error = ?summary.error.as_ref().map(ToString::to_string),
        "log_parse_done"
    );
    summary
}
