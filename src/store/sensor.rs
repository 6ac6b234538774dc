// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-sensor memory control block.
//!
//! Each sensor owns a singly linked chain of sectors (head/tail plus byte
//! cursors) and one pending cursor per declared upload source. The chain is
//! append-only; sources share it and advance independently:
//!
//! ```text
//!              ram_start                              ram_end
//!                 │                                      │
//!                 ▼                                      ▼
//!   chain:   [ sector ]──next──▶[ sector ]──next──▶[ sector ]──▶ NULL
//!                 ▲                   ▲                  ▲
//!         cursor(hosted)      cursor(gateway)     ram_write_offset
//! ```
//!
//! A source's cursor (`pending.start`) marks the head of its unacknowledged
//! run; `pending.count` is the run length. ACK advances the cursor past the
//! run and reclaims sectors every declared source has passed; NACK zeroes
//! the count so the next read re-delivers the run from the cursor.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::source::{SourceSet, UploadSource, SOURCE_COUNT};
use crate::store::record::{self, RecordKind, Sample};
use crate::store::sector_pool::{SectorId, SectorPool, SECTOR_PAYLOAD};

/// A byte position in a sensor's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPos {
    pub sector: SectorId,
    pub offset: u16,
}

impl ChainPos {
    pub const NULL: ChainPos = ChainPos { sector: SectorId::NULL, offset: 0 };

    pub fn is_null(self) -> bool {
        self.sector.is_null()
    }
}

/// Per-source pending state. `start` is the source's durable read cursor:
/// records before it are acknowledged, records in `[start, start + count)`
/// are delivered but unacknowledged, records after are new.
#[derive(Debug, Clone, Copy)]
pub struct SourceCursor {
    pub start: ChainPos,
    pub count: u32,
}

impl SourceCursor {
    const UNSET: SourceCursor = SourceCursor { start: ChainPos::NULL, count: 0 };

    pub fn is_set(&self) -> bool {
        !self.start.is_null()
    }
}

/// Memory control block for one sensor.
pub struct SensorState {
    pub kind: RecordKind,
    pub sources: SourceSet,
    pub ram_start: SectorId,
    /// Oldest live byte in the head sector: the minimum position any
    /// declared source still holds. Never-read sources start here.
    pub ram_read_offset: u16,
    pub ram_end: SectorId,
    pub ram_write_offset: u16,
    /// Records currently held in RAM between the read and write cursors.
    pub total_records: u32,
    pub pending: [SourceCursor; SOURCE_COUNT],
    /// Head sector is being written to disk; RAM reads are paused so the
    /// migrated records cannot be overtaken by newer ones.
    pub migrating: bool,
}

/// Snapshot handed to the disk layer while a head sector migrates. Keeps
/// enough state to splice the sector back in if the spool write fails.
pub struct HeadMigration {
    pub sector: SectorId,
    /// Records each declared source still needs from the migrated sector.
    pub per_source: Vec<(UploadSource, Vec<Sample>)>,
    saved_read_offset: u16,
    saved_cursors: Vec<(usize, SourceCursor)>,
    records_removed: u32,
}

impl SensorState {
    pub fn new(kind: RecordKind, sources: SourceSet) -> Self {
        SensorState {
            kind,
            sources,
            ram_start: SectorId::NULL,
            ram_read_offset: kind.first_offset(),
            ram_end: SectorId::NULL,
            ram_write_offset: kind.first_offset(),
            total_records: 0,
            pending: [SourceCursor::UNSET; SOURCE_COUNT],
            migrating: false,
        }
    }

    pub fn has_chain(&self) -> bool {
        !self.ram_start.is_null()
    }

    // ───────────────────────────── write path ────────────────────────────

    /// Append one record to the tail, allocating and linking a fresh sector
    /// when the current tail cannot fit the stride. Nothing is mutated if
    /// allocation fails, so a `NoSpace` append is side-effect free.
    pub fn append(&mut self, pool: &mut SectorPool, sample: Sample) -> Result<()> {
        let stride = self.kind.stride();

        if self.ram_end.is_null() {
            let sector = pool.allocate()?;
            if self.kind == RecordKind::Tsd {
                record::write_tsd_header(pool, sector, sample.utc_ms)?;
            }
            self.ram_end = sector;
            self.ram_write_offset = self.kind.first_offset();
            if self.ram_start.is_null() {
                self.ram_start = sector;
                self.ram_read_offset = self.kind.first_offset();
            }
        } else if self.ram_write_offset + stride > SECTOR_PAYLOAD {
            let sector = pool.allocate()?;
            if self.kind == RecordKind::Tsd {
                record::write_tsd_header(pool, sector, sample.utc_ms)?;
            }
            pool.set_next(self.ram_end, sector)?;
            self.ram_end = sector;
            self.ram_write_offset = self.kind.first_offset();
        }

        record::write_record(pool, self.kind, self.ram_end, self.ram_write_offset, sample)?;
        self.ram_write_offset += stride;
        self.total_records += 1;
        Ok(())
    }

    // ─────────────────────────── position algebra ────────────────────────

    /// Records below this offset exist in `sector`; everything at or past
    /// it belongs to the next sector (or is unwritten tail space).
    fn limit(&self, sector: SectorId) -> u16 {
        if sector == self.ram_end {
            self.ram_write_offset
        } else {
            self.kind.data_end()
        }
    }

    /// Canonicalise a position: clamp a TSD offset below the header to the
    /// first sample, hop exhausted sectors, clamp at the write head.
    pub fn normalize(&self, pool: &SectorPool, mut pos: ChainPos) -> Result<ChainPos> {
        loop {
            if pos.sector.is_null() {
                return Err(StoreError::BadOffset {
                    sector: SectorId::NULL.raw(),
                    offset: pos.offset,
                    len: 0,
                });
            }
            if pos.offset < self.kind.first_offset() {
                pos.offset = self.kind.first_offset();
            }
            let lim = self.limit(pos.sector);
            if pos.offset < lim {
                return Ok(pos);
            }
            if pos.sector == self.ram_end {
                pos.offset = self.ram_write_offset;
                return Ok(pos);
            }
            let next = pool.get_next(pos.sector)?;
            pos = ChainPos { sector: next, offset: self.kind.first_offset() };
        }
    }

    /// True when `pos` (normalised) sits at the write head: no record there.
    pub fn at_end(&self, pos: ChainPos) -> bool {
        pos.sector == self.ram_end && pos.offset >= self.ram_write_offset
    }

    /// Step `n` records forward. Clamps at the write head if the chain runs
    /// out first (a pending run that spans all available data).
    pub fn skip_records(&self, pool: &SectorPool, pos: ChainPos, n: u32) -> Result<ChainPos> {
        let mut pos = self.normalize(pool, pos)?;
        for _ in 0..n {
            if self.at_end(pos) {
                break;
            }
            pos.offset += self.kind.stride();
            pos = self.normalize(pool, pos)?;
        }
        Ok(pos)
    }

    /// Count records from `pos` (normalised) to the write head.
    pub fn records_from(&self, pool: &SectorPool, pos: ChainPos) -> Result<u32> {
        let mut pos = self.normalize(pool, pos)?;
        let stride = self.kind.stride();
        let mut n: u32 = 0;
        loop {
            let lim = self.limit(pos.sector);
            n += ((lim.saturating_sub(pos.offset)) / stride) as u32;
            if pos.sector == self.ram_end {
                return Ok(n);
            }
            let next = pool.get_next(pos.sector)?;
            pos = ChainPos { sector: next, offset: self.kind.first_offset() };
        }
    }

    /// Where a source's unread data begins: its cursor, or the shared head
    /// cursor if it has never read this sensor.
    fn source_base(&self, src: UploadSource) -> ChainPos {
        let cursor = &self.pending[src.index()];
        if cursor.is_set() {
            cursor.start
        } else {
            ChainPos { sector: self.ram_start, offset: self.ram_read_offset }
        }
    }

    /// First record not yet delivered to `src`: the base skipped past the
    /// pending run. `None` when the sensor has no chain.
    pub fn logical_position(&self, pool: &SectorPool, src: UploadSource) -> Result<Option<ChainPos>> {
        if !self.has_chain() {
            return Ok(None);
        }
        let base = self.source_base(src);
        let pos = self.skip_records(pool, base, self.pending[src.index()].count)?;
        Ok(Some(pos))
    }

    /// Records available to `src` from RAM, excluding its pending run.
    pub fn new_ram_count(&self, pool: &SectorPool, src: UploadSource) -> Result<u32> {
        match self.logical_position(pool, src)? {
            Some(pos) => self.records_from(pool, pos),
            None => Ok(0),
        }
    }

    // ──────────────────────────── read protocol ──────────────────────────

    /// Deliver up to `max` new RAM records to `src` and extend its pending
    /// run. The pending bookkeeping mutates only after the records have
    /// been collected, so a failed read leaves the cursor untouched.
    pub fn read_bulk_ram(
        &mut self,
        pool: &SectorPool,
        src: UploadSource,
        max: usize,
    ) -> Result<Vec<Sample>> {
        if !self.has_chain() || max == 0 {
            return Ok(Vec::new());
        }
        let base = self.normalize(pool, self.source_base(src))?;
        let idx = src.index();
        let mut pos = self.skip_records(pool, base, self.pending[idx].count)?;

        let mut out = Vec::new();
        while out.len() < max && !self.at_end(pos) {
            out.push(record::read_record(pool, self.kind, pos.sector, pos.offset)?);
            pos.offset += self.kind.stride();
            pos = self.normalize(pool, pos)?;
        }

        if !out.is_empty() {
            if self.pending[idx].count == 0 {
                self.pending[idx].start = base;
            }
            self.pending[idx].count += out.len() as u32;
        }
        Ok(out)
    }

    /// ACK: discard the pending run for `src`, advance its cursor past it,
    /// and free every sector all declared sources have moved beyond.
    /// Returns the number of sectors freed. No-op when nothing is pending.
    pub fn erase_pending_ram(&mut self, pool: &mut SectorPool, src: UploadSource) -> Result<u32> {
        if !self.has_chain() {
            return Ok(0);
        }
        let idx = src.index();
        if self.pending[idx].count > 0 {
            let base = self.source_base(src);
            let after = self.skip_records(pool, base, self.pending[idx].count)?;
            self.pending[idx].start = after;
            self.pending[idx].count = 0;
        }
        self.reclaim(pool)
    }

    /// NACK: make the pending run re-readable. The cursor stays at the run
    /// head; zeroing the count means the next read starts there and marks
    /// the run afresh. Idempotent.
    pub fn revert_pending_ram(&mut self, src: UploadSource) {
        self.pending[src.index()].count = 0;
    }

    pub fn ram_pending_count(&self, src: UploadSource) -> u32 {
        self.pending[src.index()].count
    }

    /// Last-resort recovery from an internal invariant violation: forget
    /// the source's cursor so it restarts from the shared chain head.
    pub fn reset_source_cursor(&mut self, src: UploadSource) {
        self.pending[src.index()] = SourceCursor::UNSET;
    }

    /// Free sectors that every declared source has acknowledged past, then
    /// pull the shared head cursor up to the slowest source. Collapses the
    /// chain entirely once every source sits at the write head.
    fn reclaim(&mut self, pool: &mut SectorPool) -> Result<u32> {
        if !self.has_chain() {
            return Ok(0);
        }
        // An aborted migration must be able to splice its sector back onto
        // the chain head it recorded; freeing sectors out from under it
        // would leave the splice dangling. The next ACK reclaims instead.
        if self.migrating {
            return Ok(0);
        }
        let ranks = self.sector_ranks(pool)?;
        let end = ChainPos { sector: self.ram_end, offset: self.ram_write_offset };
        let mut min = end;
        let mut min_key = (ranks[&self.ram_end.raw()], self.ram_write_offset);
        for src in self.sources.iter() {
            let pos = self.normalize(pool, self.source_base(src))?;
            let key = (ranks[&pos.sector.raw()], pos.offset);
            if key < min_key {
                min_key = key;
                min = pos;
            }
        }

        let stride = self.kind.stride();
        let mut freed_sectors = 0u32;
        let mut freed_records = 0u32;
        while self.ram_start != min.sector {
            let head = self.ram_start;
            let next = pool.get_next(head)?;
            freed_records += ((self.limit(head) - self.ram_read_offset) / stride) as u32;
            pool.free(head);
            freed_sectors += 1;
            self.ram_start = next;
            self.ram_read_offset = self.kind.first_offset();
        }
        freed_records += ((min.offset.saturating_sub(self.ram_read_offset)) / stride) as u32;
        self.ram_read_offset = min.offset;
        self.total_records -= freed_records;

        if min.sector == self.ram_end && min.offset >= self.ram_write_offset {
            // Every declared source has consumed the whole chain.
            pool.free(self.ram_end);
            freed_sectors += 1;
            self.ram_start = SectorId::NULL;
            self.ram_end = SectorId::NULL;
            self.ram_read_offset = self.kind.first_offset();
            self.ram_write_offset = self.kind.first_offset();
            for src in self.sources.iter() {
                self.pending[src.index()] = SourceCursor::UNSET;
            }
            debug_assert_eq!(self.total_records, 0);
        }

        if freed_sectors > 0 {
            debug!(freed_sectors, freed_records, "Reclaimed acknowledged sectors");
        }
        Ok(freed_sectors)
    }

    /// Traversal order of the live chain, for position comparison.
    fn sector_ranks(&self, pool: &SectorPool) -> Result<HashMap<u32, u32>> {
        let mut ranks = HashMap::new();
        let mut sector = self.ram_start;
        let mut rank = 0u32;
        loop {
            if sector.is_null() {
                return Err(StoreError::Corrupt(
                    "chain terminated before reaching the tail sector".into(),
                ));
            }
            ranks.insert(sector.raw(), rank);
            if sector == self.ram_end {
                return Ok(ranks);
            }
            sector = pool.get_next(sector)?;
            rank += 1;
        }
    }

    /// Number of sectors currently in the chain.
    pub fn chain_sectors(&self, pool: &SectorPool) -> Result<u32> {
        if !self.has_chain() {
            return Ok(0);
        }
        let mut n = 1u32;
        let mut sector = self.ram_start;
        while sector != self.ram_end {
            sector = pool.get_next(sector)?;
            n += 1;
        }
        Ok(n)
    }

    // ─────────────────────────── disk migration ──────────────────────────

    /// A head sector can migrate when it is not the tail and no declared
    /// source has delivered-but-unacknowledged records inside it (a NACK
    /// would otherwise have to replay across tiers).
    pub fn head_migratable(&self, pool: &SectorPool) -> Result<bool> {
        if self.migrating || !self.has_chain() || self.ram_start == self.ram_end {
            return Ok(false);
        }
        for src in self.sources.iter() {
            let cursor = &self.pending[src.index()];
            if cursor.count > 0 {
                let pos = self.normalize(pool, cursor.start)?;
                if pos.sector == self.ram_start {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Unlink the head sector and capture, per declared source, the records
    /// it still needs from it. Chain cursors move past the sector; the
    /// sector itself stays allocated (and its link intact) until the caller
    /// commits or aborts, so a failed spool write can splice it back.
    pub fn begin_head_migration(&mut self, pool: &SectorPool) -> Result<HeadMigration> {
        debug_assert!(matches!(self.head_migratable(pool), Ok(true)));
        let sector = self.ram_start;
        let new_head = pool.get_next(sector)?;
        if new_head.is_null() {
            return Err(StoreError::Corrupt("migratable head has no successor".into()));
        }

        let data_end = self.kind.data_end();
        let stride = self.kind.stride();
        let mut per_source = Vec::new();
        let mut saved_cursors = Vec::new();

        for src in self.sources.iter() {
            let idx = src.index();
            let cursor = self.pending[idx];
            let floor = if cursor.is_set() {
                let pos = self.normalize(pool, cursor.start)?;
                if pos.sector != sector {
                    // Already past the head sector; nothing to spool.
                    continue;
                }
                saved_cursors.push((idx, cursor));
                pos.offset
            } else {
                self.ram_read_offset
            };

            let mut samples = Vec::new();
            let mut off = floor;
            while off < data_end {
                samples.push(record::read_record(pool, self.kind, sector, off)?);
                off += stride;
            }
            if !samples.is_empty() {
                per_source.push((src, samples));
            }
        }

        let saved_read_offset = self.ram_read_offset;
        let records_removed = ((data_end - self.ram_read_offset) / stride) as u32;

        for (idx, _) in &saved_cursors {
            self.pending[*idx].start =
                ChainPos { sector: new_head, offset: self.kind.first_offset() };
        }
        self.ram_start = new_head;
        self.ram_read_offset = self.kind.first_offset();
        self.total_records -= records_removed;
        self.migrating = true;

        Ok(HeadMigration {
            sector,
            per_source,
            saved_read_offset,
            saved_cursors,
            records_removed,
        })
    }

    /// The spool files are durable: release the migrated sector.
    pub fn commit_head_migration(&mut self, pool: &mut SectorPool, migration: HeadMigration) {
        pool.free(migration.sector);
        self.migrating = false;
    }

    /// The spool write failed: splice the sector back in as the head and
    /// restore every cursor that pointed into it.
    pub fn abort_head_migration(&mut self, migration: HeadMigration) {
        self.ram_start = migration.sector;
        self.ram_read_offset = migration.saved_read_offset;
        self.total_records += migration.records_removed;
        for (idx, cursor) in migration.saved_cursors {
            self.pending[idx] = cursor;
        }
        self.migrating = false;
    }
}
