// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! RAM tier and store facade.
//!
//! [`TelemetryStore`] composes the sector pool, the per-sensor control
//! blocks and the disk spool behind the public producer/consumer API.
//!
//! Lock discipline: per-sensor lock → pool lock → disk-index lock, never
//! in reverse. Writers hold the sensor lock for the whole append and take
//! the pool lock inside it; readers hold the sensor lock across the entire
//! read/ACK/NACK operation so cursor and pending updates are atomic; disk
//! migration snapshots under the sensor lock, runs file I/O with no sensor
//! lock held, then re-acquires it to commit or roll back.

pub mod packet;
pub mod record;
pub mod sector_pool;
pub mod sensor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ReadStatus, Result, StoreError};
use crate::source::{SourceSet, UploadSource, SOURCE_COUNT};
use crate::spool::recovery::RecoveryReport;
use crate::spool::DiskSpool;
use crate::store::packet::Packet;
use crate::store::record::{RecordKind, Sample};
use crate::store::sector_pool::SectorPool;
use crate::store::sensor::SensorState;

// ─────────────────────────────── statistics ──────────────────────────────────

/// Global counters; all updated with relaxed atomics off the hot paths.
#[derive(Default)]
struct StoreCounters {
    dropped_writes: AtomicU64,
    migrated_sectors: AtomicU64,
    disk_io_errors: AtomicU64,
    corruption_events: AtomicU64,
}

/// Store-wide snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct MemoryStatistics {
    pub ram_sectors_total: u32,
    pub ram_sectors_used: u32,
    pub ram_sectors_free: u32,
    pub disk_files: u64,
    pub total_records: u64,
    pub total_disk_records: u64,
    pub per_source_pending: Vec<(UploadSource, u64)>,
    pub dropped_writes: u64,
    pub migrated_sectors: u64,
    pub quarantined_files: u64,
    pub disk_io_errors: u64,
    pub corruption_events: u64,
}

/// Per-sensor snapshot, one row per declared source.
#[derive(Debug, Clone)]
pub struct SensorStatistics {
    pub id: u32,
    pub name: String,
    pub kind: RecordKind,
    pub ram_sectors: u32,
    pub ram_records: u32,
    pub per_source: Vec<SourceStatistics>,
}

#[derive(Debug, Clone)]
pub struct SourceStatistics {
    pub source: UploadSource,
    pub new_records: u64,
    pub pending_records: u64,
    pub disk_records: u64,
}

// ─────────────────────────────── registry ────────────────────────────────────

/// One row of the read-mostly sensor registry; the lock guards only the
/// mutable control block.
struct SensorSlot {
    name: String,
    kind: RecordKind,
    sources: SourceSet,
    state: Mutex<SensorState>,
}

/// The tiered telemetry store.
pub struct TelemetryStore {
    sensors: HashMap<u32, SensorSlot>,
    pool: Mutex<SectorPool>,
    spool: DiskSpool,
    pressure_free_pct: u32,
    recovery: RecoveryReport,
    counters: StoreCounters,
    packet_in_use: [Arc<AtomicBool>; SOURCE_COUNT],
    maintenance_tx: Mutex<Option<mpsc::Sender<()>>>,
    running: AtomicBool,
}

impl TelemetryStore {
    /// Build the store from a validated config: allocate the sector pool,
    /// create the sensor registry and recover the disk spool.
    pub fn open(config: &Config) -> Result<TelemetryStore> {
        let (spool, recovery) = DiskSpool::open(&config.storage.base_path)?;

        let mut sensors = HashMap::new();
        for row in &config.sensors {
            sensors.insert(
                row.id,
                SensorSlot {
                    name: row.name.clone(),
                    kind: row.kind,
                    sources: row.source_set(),
                    state: Mutex::new(SensorState::new(row.kind, row.source_set())),
                },
            );
        }

        info!(
            sensors = sensors.len(),
            sector_count = config.storage.sector_count,
            spool_files = recovery.files_indexed,
            spool_records = recovery.records_indexed,
            quarantined = recovery.quarantined,
            "Telemetry store opened"
        );

        Ok(TelemetryStore {
            sensors,
            pool: Mutex::new(SectorPool::new(config.storage.sector_count)),
            spool,
            pressure_free_pct: config.storage.pressure_free_pct,
            recovery,
            counters: StoreCounters::default(),
            packet_in_use: std::array::from_fn(|_| Arc::new(AtomicBool::new(false))),
            maintenance_tx: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn sensor_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sensors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn slot(&self, sensor: u32) -> Result<&SensorSlot> {
        self.sensors
            .get(&sensor)
            .ok_or_else(|| StoreError::InvalidParameter(format!("unknown sensor {sensor}")))
    }

    // ─────────────────────────── producer API ────────────────────────────

    /// Append one time-series sample.
    pub fn write_tsd(&self, sensor: u32, value: u32, utc_ms: u64) -> Result<()> {
        self.append(sensor, RecordKind::Tsd, Sample { utc_ms, value })
    }

    /// Append one event record.
    pub fn write_evt(&self, sensor: u32, value: u32, utc_ms: u64) -> Result<()> {
        self.append(sensor, RecordKind::Evt, Sample { utc_ms, value })
    }

    fn append(&self, sensor: u32, kind: RecordKind, sample: Sample) -> Result<()> {
        let slot = self.slot(sensor)?;
        if slot.kind != kind {
            return Err(StoreError::InvalidParameter(format!(
                "sensor {sensor} is {:?}, not {:?}",
                slot.kind, kind
            )));
        }

        let mut state = slot.state.lock();
        let under_pressure;
        {
            let mut pool = self.pool.lock();
            match state.append(&mut pool, sample) {
                Ok(()) => {}
                Err(StoreError::NoSpace) => {
                    drop(pool);
                    drop(state);
                    self.counters.dropped_writes.fetch_add(1, Ordering::Relaxed);
                    warn!(sensor, "Sector pool full, record dropped");
                    self.notify_pressure();
                    return Err(StoreError::NoSpace);
                }
                Err(e) => return Err(e),
            }
            under_pressure = Self::pool_under_pressure(&pool, self.pressure_free_pct);
        }
        drop(state);

        if under_pressure {
            self.notify_pressure();
        }
        Ok(())
    }

    // ─────────────────────────── consumer API ────────────────────────────

    /// True when the sensor has a RAM chain at all. Callers should check
    /// this before counting or reading; the store stays defensive either
    /// way and reports zero for chainless sensors.
    pub fn has_chain(&self, sensor: u32) -> Result<bool> {
        Ok(self.slot(sensor)?.state.lock().has_chain())
    }

    /// True when `src` has delivered-but-unacknowledged records (RAM or
    /// disk) for the sensor.
    pub fn has_pending_data(&self, src: UploadSource, sensor: u32) -> Result<bool> {
        let slot = self.slot(sensor)?;
        if !slot.sources.contains(src) {
            return Ok(false);
        }
        let state = slot.state.lock();
        Ok(state.ram_pending_count(src) > 0 || self.spool.has_pending(src, sensor))
    }

    /// Records available to `src` that are not already pending: disk spool
    /// backlog plus RAM records past the source's logical position. Zero
    /// when the sensor has neither a chain nor disk records for `src`.
    pub fn get_new_sample_count(&self, src: UploadSource, sensor: u32) -> Result<u32> {
        let slot = self.slot(sensor)?;
        if !slot.sources.contains(src) {
            return Ok(0);
        }
        let state = slot.state.lock();
        let disk_new = self.spool.new_record_count(src, sensor);
        let ram_new = if state.migrating {
            0
        } else {
            let pool = self.pool.lock();
            state.new_ram_count(&pool, src)?
        };
        Ok(u32::try_from(disk_new + ram_new as u64).unwrap_or(u32::MAX))
    }

    /// Deliver up to `max` new records to `src`, oldest first: spooled
    /// records before RAM records, whole spool files at a time. Everything
    /// delivered joins the source's pending run and stays retrievable via
    /// NACK until [`erase_all_pending`](Self::erase_all_pending) confirms
    /// it. The shared cursors only move when records were delivered.
    pub fn read_bulk_samples(
        &self,
        src: UploadSource,
        sensor: u32,
        max: usize,
    ) -> Result<(Vec<Sample>, ReadStatus)> {
        let slot = self.slot(sensor)?;
        if !slot.sources.contains(src) {
            return Ok((Vec::new(), ReadStatus::NoData));
        }
        let mut state = slot.state.lock();

        // Disk first: spooled records are strictly older than the chain.
        let (mut out, disk_partial) = self.spool.read_new(src, sensor, max)?;
        if disk_partial {
            return Ok((out, ReadStatus::Partial));
        }

        // RAM is paused while the head sector is being migrated; the
        // spooled copy of those records arrives a moment later.
        if !state.migrating && out.len() < max {
            let pool = self.pool.lock();
            let budget = max - out.len();
            match state.read_bulk_ram(&pool, src, budget) {
                Ok(ram) => out.extend(ram),
                Err(e) => {
                    // Internal invariant violation: reset this source's
                    // cursor to the chain head and surface a soft failure.
                    warn!(sensor, source = %src, error = %e, "Chain read failed, cursor reset");
                    self.counters.corruption_events.fetch_add(1, Ordering::Relaxed);
                    state.reset_source_cursor(src);
                    return Ok((out, ReadStatus::Partial));
                }
            }
        }

        let status = if out.is_empty() { ReadStatus::NoData } else { ReadStatus::Complete };
        Ok((out, status))
    }

    /// ACK: permanently discard the pending run for `src`. Spool files
    /// covering it are unlinked; chain sectors every declared source has
    /// passed go back to the pool. No-op without pending data.
    pub fn erase_all_pending(&self, src: UploadSource, sensor: u32) -> Result<()> {
        let slot = self.slot(sensor)?;
        if !slot.sources.contains(src) {
            return Ok(());
        }
        let mut state = slot.state.lock();
        {
            let mut pool = self.pool.lock();
            state.erase_pending_ram(&mut pool, src)?;
        }
        self.spool.ack(src, sensor);
        Ok(())
    }

    /// NACK: the pending run becomes re-readable from its head, on both
    /// tiers. Idempotent; a no-op for sensors with nothing pending.
    pub fn revert_all_pending(&self, src: UploadSource, sensor: u32) -> Result<()> {
        let slot = self.slot(sensor)?;
        if !slot.sources.contains(src) {
            return Ok(());
        }
        let mut state = slot.state.lock();
        state.revert_pending_ram(src);
        self.spool.revert(src, sensor);
        Ok(())
    }

    // ─────────────────────────── packet gating ───────────────────────────

    /// Open the per-source packet scope. Fails if a packet for `src` is
    /// already being built.
    pub fn begin_packet(&self, src: UploadSource) -> Result<Packet> {
        let flag = &self.packet_in_use[src.index()];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::InvalidParameter(format!(
                "packet already in use for source {src}"
            )));
        }
        Ok(Packet::new(src, flag.clone()))
    }

    /// Read a sensor's new records into a packet. Only a complete, non-empty
    /// read contributes: anything else is reverted on the spot and the
    /// sensor is omitted, so it receives neither ACK nor NACK for this
    /// packet and nothing stays stranded in its pending run.
    pub fn read_into_packet(
        &self,
        pkt: &mut Packet,
        sensor: u32,
        max: usize,
    ) -> Result<(Vec<Sample>, ReadStatus)> {
        let src = pkt.source();
        let (samples, status) = self.read_bulk_samples(src, sensor, max)?;
        if status == ReadStatus::Complete && !samples.is_empty() {
            pkt.record_row(sensor, samples.len() as u32);
            Ok((samples, status))
        } else {
            self.revert_all_pending(src, sensor)?;
            Ok((Vec::new(), status))
        }
    }

    /// The packet was acknowledged: erase pending for every included sensor.
    pub fn ack_packet(&self, pkt: Packet) -> Result<()> {
        for row in pkt.rows() {
            self.erase_all_pending(pkt.source(), row.sensor)?;
        }
        Ok(())
    }

    /// The packet was rejected: make every included sensor re-readable.
    pub fn nack_packet(&self, pkt: Packet) -> Result<()> {
        for row in pkt.rows() {
            self.revert_all_pending(pkt.source(), row.sensor)?;
        }
        Ok(())
    }

    // ──────────────────────── pressure & migration ───────────────────────

    fn pool_under_pressure(pool: &SectorPool, free_pct: u32) -> bool {
        (pool.free_count() as u64) * 100 < (pool.capacity() as u64) * free_pct as u64
    }

    pub fn under_pressure(&self) -> bool {
        Self::pool_under_pressure(&self.pool.lock(), self.pressure_free_pct)
    }

    pub(crate) fn set_maintenance_waker(&self, tx: mpsc::Sender<()>) {
        *self.maintenance_tx.lock() = Some(tx);
    }

    pub(crate) fn clear_maintenance_waker(&self) {
        *self.maintenance_tx.lock() = None;
    }

    pub(crate) fn mark_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn notify_pressure(&self) {
        if let Some(tx) = &*self.maintenance_tx.lock() {
            let _ = tx.try_send(());
        }
    }

    /// Migrate head sectors to disk until the pool is out of pressure, up
    /// to `batch` sectors. Returns how many migrated. Called from the
    /// maintenance task; safe to call concurrently with producers and
    /// consumers.
    pub fn run_pressure_migration(&self, batch: u32) -> u32 {
        let mut migrated = 0;
        while migrated < batch && self.under_pressure() {
            let Some(sensor) = self.pick_migration_candidate() else {
                break;
            };
            match self.migrate_sensor_head(sensor) {
                Ok(true) => migrated += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(sensor, error = %e, "Head migration failed, sector kept in RAM");
                    break;
                }
            }
        }
        if migrated > 0 {
            debug!(migrated, "Pressure migration pass complete");
        }
        migrated
    }

    /// The sensor holding the most RAM records whose head sector can move.
    fn pick_migration_candidate(&self) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for (id, slot) in &self.sensors {
            let state = slot.state.lock();
            let pool = self.pool.lock();
            let migratable = state.head_migratable(&pool).unwrap_or(false);
            if migratable {
                let records = state.total_records;
                if best.map(|(_, r)| records > r).unwrap_or(true) {
                    best = Some((*id, records));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Move one sensor's head sector to the spool. Sector-granular and
    /// atomic: either the spool files become durable and the sector is
    /// freed, or the sector is spliced back and RAM is untouched.
    pub fn migrate_sensor_head(&self, sensor: u32) -> Result<bool> {
        let slot = self.slot(sensor)?;

        // Phase 1: snapshot and unlink under the sensor lock.
        let migration = {
            let mut state = slot.state.lock();
            let pool = self.pool.lock();
            if !state.head_migratable(&pool)? {
                return Ok(false);
            }
            state.begin_head_migration(&pool)?
        };

        // Phase 2: file I/O with no sensor lock held. Reads for this
        // sensor's RAM are paused by the migration pin.
        let io_result = self.spool.spool_sector(sensor, slot.kind, &migration.per_source);

        // Phase 3: commit or roll back.
        let mut state = slot.state.lock();
        match io_result {
            Ok(()) => {
                let mut pool = self.pool.lock();
                state.commit_head_migration(&mut pool, migration);
                self.counters.migrated_sectors.fetch_add(1, Ordering::Relaxed);
                debug!(sensor, "Head sector migrated to spool");
                Ok(true)
            }
            Err(e) => {
                state.abort_head_migration(migration);
                self.counters.disk_io_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    // ───────────────────────────── admin API ─────────────────────────────

    /// Destructive: delete every spool file and reset the disk index.
    /// Refused while the store is running; this is a startup-only or
    /// explicit-maintenance operation.
    pub fn clear_all_history(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(StoreError::InvalidParameter(
                "clear_all_history refused while the store is running".into(),
            ));
        }
        self.spool.clear_all()?;
        info!("Spool history cleared");
        Ok(())
    }

    /// Store-wide statistics snapshot.
    pub fn memory_statistics(&self) -> MemoryStatistics {
        let (total, free) = {
            let pool = self.pool.lock();
            (pool.capacity(), pool.free_count())
        };

        let mut total_records = 0u64;
        let mut per_source_pending: Vec<(UploadSource, u64)> =
            UploadSource::ALL.iter().map(|s| (*s, 0u64)).collect();
        for (id, slot) in &self.sensors {
            let state = slot.state.lock();
            total_records += state.total_records as u64;
            for src in slot.sources.iter() {
                per_source_pending[src.index()].1 += state.ram_pending_count(src) as u64
                    + self.spool.pending_record_count(src, *id);
            }
        }

        MemoryStatistics {
            ram_sectors_total: total,
            ram_sectors_used: total - free,
            ram_sectors_free: free,
            disk_files: self.spool.total_files(),
            total_records,
            total_disk_records: self.spool.total_records(),
            per_source_pending,
            dropped_writes: self.counters.dropped_writes.load(Ordering::Relaxed),
            migrated_sectors: self.counters.migrated_sectors.load(Ordering::Relaxed),
            quarantined_files: self.spool.quarantined_files(),
            disk_io_errors: self.counters.disk_io_errors.load(Ordering::Relaxed),
            corruption_events: self.counters.corruption_events.load(Ordering::Relaxed),
        }
    }

    /// Per-sensor statistics snapshot.
    pub fn sensor_statistics(&self, sensor: u32) -> Result<SensorStatistics> {
        let slot = self.slot(sensor)?;
        let state = slot.state.lock();
        let ram_sectors = {
            let pool = self.pool.lock();
            state.chain_sectors(&pool)?
        };
        let mut per_source = Vec::new();
        for src in slot.sources.iter() {
            per_source.push(SourceStatistics {
                source: src,
                new_records: {
                    let pool = self.pool.lock();
                    let ram = if state.migrating { 0 } else { state.new_ram_count(&pool, src)? };
                    ram as u64 + self.spool.new_record_count(src, sensor)
                },
                pending_records: state.ram_pending_count(src) as u64
                    + self.spool.pending_record_count(src, sensor),
                disk_records: self.spool.records_for_sensor(src, sensor),
            });
        }
        Ok(SensorStatistics {
            id: sensor,
            name: slot.name.clone(),
            kind: slot.kind,
            ram_sectors,
            ram_records: state.total_records,
            per_source,
        })
    }

    /// Sectors currently chained for one sensor.
    pub fn ram_sectors_used(&self, sensor: u32) -> Result<u32> {
        let slot = self.slot(sensor)?;
        let state = slot.state.lock();
        let pool = self.pool.lock();
        state.chain_sectors(&pool)
    }
}
