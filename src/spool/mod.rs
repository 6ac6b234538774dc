// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Disk spool subsystem — power-safe overflow tier for the RAM store.

pub mod file;
pub mod index;
pub mod recovery;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::source::UploadSource;
use crate::spool::index::DiskIndex;
use crate::spool::recovery::RecoveryReport;
use crate::store::record::{RecordKind, Sample};

/// Disk tier facade: owns the spool directory tree and the in-memory index
/// rebuilt from it at startup. All index access goes through the internal
/// disk-index lock, which is always the last lock taken.
pub struct DiskSpool {
    base: PathBuf,
    index: Mutex<DiskIndex>,
    /// Files moved to quarantine, at recovery or since.
    quarantined: AtomicU64,
}

impl DiskSpool {
    /// Open the spool at `base`, running power-fail recovery: validate
    /// every file, quarantine corruption, delete stale temp files, rebuild
    /// the index, clear all exhausted flags.
    pub fn open(base: &Path) -> Result<(Self, RecoveryReport)> {
        let (recovered, report) = recovery::scan_spool_tree(base)?;
        let mut index = DiskIndex::new();
        index.rebuild(recovered);
        Ok((
            DiskSpool {
                base: base.to_path_buf(),
                index: Mutex::new(index),
                quarantined: AtomicU64::new(report.quarantined as u64),
            },
            report,
        ))
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Persist one migrated sector: one spool file per source that still
    /// needs records from it. All files are written before any is
    /// registered; on failure the ones already renamed are unlinked so the
    /// sector can return to RAM with nothing half-registered.
    pub fn spool_sector(
        &self,
        sensor: u32,
        kind: RecordKind,
        per_source: &[(UploadSource, Vec<Sample>)],
    ) -> Result<()> {
        let mut written = Vec::new();
        for (src, samples) in per_source {
            let seq = self.index.lock().allocate_seq(*src, sensor);
            let dir = self.base.join(src.tag());
            match file::write_spool_file(&dir, sensor, seq, kind, samples) {
                Ok(meta) => written.push((*src, meta)),
                Err(e) => {
                    for (_, meta) in &written {
                        if let Err(rm) = std::fs::remove_file(&meta.path) {
                            warn!(path = ?meta.path, error = %rm, "Rollback unlink failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut index = self.index.lock();
        for (src, meta) in written {
            debug!(source = %src, sensor, seq = meta.seq, records = meta.record_count,
                   "Sector spooled to disk");
            index.push(src, meta);
        }
        Ok(())
    }

    /// Records on disk not yet delivered to `src`.
    pub fn new_record_count(&self, src: UploadSource, sensor: u32) -> u64 {
        self.index.lock().unread_records(src, sensor)
    }

    /// Records delivered to `src` and awaiting ACK.
    pub fn pending_record_count(&self, src: UploadSource, sensor: u32) -> u64 {
        self.index.lock().pending_records(src, sensor)
    }

    pub fn has_pending(&self, src: UploadSource, sensor: u32) -> bool {
        self.pending_record_count(src, sensor) > 0
    }

    /// Deliver whole spool files, oldest first, until `max` records would
    /// be exceeded. Delivered files stay on disk (pending) until ACKed.
    /// Returns `(samples, partial)`; `partial` is set when a corrupt file
    /// interrupted the read (the file is quarantined and dropped from the
    /// index) or when `max` is too small for even one file.
    pub fn read_new(
        &self,
        src: UploadSource,
        sensor: u32,
        max: usize,
    ) -> Result<(Vec<Sample>, bool)> {
        let mut index = self.index.lock();
        if index.is_exhausted(src) {
            return Ok((Vec::new(), false));
        }

        let mut out = Vec::new();
        let mut partial = false;
        while let Some(meta) = index.next_unread(src, sensor).cloned() {
            if out.len() + meta.record_count as usize > max {
                if out.is_empty() {
                    // Caller's budget cannot fit even the oldest file.
                    partial = true;
                }
                break;
            }
            match file::read_spool_file(&meta.path) {
                Ok((_, samples)) => {
                    out.extend(samples);
                    index.mark_delivered(src, sensor);
                }
                Err(e) => {
                    warn!(path = ?meta.path, error = %e, "Spool read failed, quarantining");
                    index.remove_file(src, sensor, meta.seq);
                    recovery::quarantine_file(&self.base, &meta.path);
                    self.quarantined.fetch_add(1, Ordering::Relaxed);
                    partial = true;
                    break;
                }
            }
        }
        Ok((out, partial))
    }

    /// ACK: unlink every delivered file for `(src, sensor)`. The unlink
    /// happens only now, after the upload has been confirmed shipped.
    /// Returns the number of files removed.
    pub fn ack(&self, src: UploadSource, sensor: u32) -> usize {
        let acked = self.index.lock().ack(src, sensor);
        let n = acked.len();
        for meta in acked {
            if let Err(e) = std::fs::remove_file(&meta.path) {
                warn!(path = ?meta.path, error = %e, "Unlink of acked spool file failed");
            }
        }
        if n > 0 {
            debug!(source = %src, sensor, files = n, "Acked spool files unlinked");
        }
        n
    }

    /// NACK: delivered files become readable again, oldest first.
    pub fn revert(&self, src: UploadSource, sensor: u32) {
        self.index.lock().revert(src, sensor);
    }

    pub fn total_files(&self) -> u64 {
        self.index.lock().total_files()
    }

    pub fn total_records(&self) -> u64 {
        self.index.lock().total_records()
    }

    pub fn records_for_sensor(&self, src: UploadSource, sensor: u32) -> u64 {
        self.index.lock().records_for_sensor(src, sensor)
    }

    pub fn is_exhausted(&self, src: UploadSource) -> bool {
        self.index.lock().is_exhausted(src)
    }

    pub fn quarantined_files(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    /// Administrative wipe: delete the whole spool tree (quarantine
    /// included) and reset the index. The store must not be running.
    pub fn clear_all(&self) -> Result<()> {
        if self.base.exists() {
            std::fs::remove_dir_all(&self.base)
                .map_err(|e| StoreError::Spool(format!("remove {:?}: {e}", self.base)))?;
        }
        std::fs::create_dir_all(&self.base)
            .map_err(|e| StoreError::Spool(format!("recreate {:?}: {e}", self.base)))?;
        self.index.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn evt(utc: u64, value: u32) -> Sample {
        Sample { utc_ms: utc, value }
    }

    #[test]
    fn test_spool_and_read_cycle() {
        let dir = TempDir::new().expect("tempdir");
        let (spool, report) = DiskSpool::open(dir.path()).expect("open");
        assert_eq!(report.files_indexed, 0);

        spool
            .spool_sector(
                1,
                RecordKind::Evt,
                &[
                    (UploadSource::Gateway, vec![evt(1, 10), evt(2, 11)]),
                    (UploadSource::Hosted, vec![evt(2, 11)]),
                ],
            )
            .expect("spool");

        assert_eq!(spool.new_record_count(UploadSource::Gateway, 1), 2);
        assert_eq!(spool.new_record_count(UploadSource::Hosted, 1), 1);

        let (got, partial) = spool.read_new(UploadSource::Gateway, 1, 100).expect("read");
        assert!(!partial);
        assert_eq!(got, vec![evt(1, 10), evt(2, 11)]);
        assert_eq!(spool.new_record_count(UploadSource::Gateway, 1), 0);
        assert!(spool.has_pending(UploadSource::Gateway, 1));

        // NACK then re-read: same records again.
        spool.revert(UploadSource::Gateway, 1);
        let (again, _) = spool.read_new(UploadSource::Gateway, 1, 100).expect("read");
        assert_eq!(again, got);

        // ACK unlinks gateway's copy; hosted's copy is untouched.
        assert_eq!(spool.ack(UploadSource::Gateway, 1), 1);
        assert!(!spool.has_pending(UploadSource::Gateway, 1));
        assert_eq!(spool.total_files(), 1);
        assert!(spool.is_exhausted(UploadSource::Gateway));
        assert_eq!(spool.new_record_count(UploadSource::Hosted, 1), 1);
    }

    #[test]
    fn test_read_respects_max_whole_files() {
        let dir = TempDir::new().expect("tempdir");
        let (spool, _) = DiskSpool::open(dir.path()).expect("open");
        spool
            .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(1, 1), evt(2, 2)])])
            .expect("spool a");
        spool
            .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(3, 3), evt(4, 4)])])
            .expect("spool b");

        // Budget of 3 fits only the first two-record file.
        let (got, partial) = spool.read_new(UploadSource::Gateway, 1, 3).expect("read");
        assert!(!partial);
        assert_eq!(got.len(), 2);

        // Budget of 1 fits nothing: soft failure, retry next cycle.
        let (none, partial) = spool.read_new(UploadSource::Gateway, 1, 1).expect("read");
        assert!(none.is_empty());
        assert!(partial);
    }

    #[test]
    fn test_corrupt_file_quarantined_on_read() {
        let dir = TempDir::new().expect("tempdir");
        let (spool, _) = DiskSpool::open(dir.path()).expect("open");
        spool
            .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(1, 1)])])
            .expect("spool a");
        spool
            .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(2, 2)])])
            .expect("spool b");

        // Corrupt the first file on disk.
        let victim = dir.path().join("gateway").join("sensor_1_seq_0.dat");
        let mut bytes = std::fs::read(&victim).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&victim, &bytes).expect("rewrite");

        let (got, partial) = spool.read_new(UploadSource::Gateway, 1, 100).expect("read");
        assert!(got.is_empty());
        assert!(partial);
        assert!(!victim.exists(), "corrupt file moved to quarantine");
        assert!(!spool.is_exhausted(UploadSource::Gateway), "read failure must not exhaust");

        // Next cycle delivers the surviving file.
        let (next, partial) = spool.read_new(UploadSource::Gateway, 1, 100).expect("read");
        assert!(!partial);
        assert_eq!(next, vec![evt(2, 2)]);
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (spool, _) = DiskSpool::open(dir.path()).expect("open");
            spool
                .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(1, 1), evt(2, 2)])])
                .expect("spool");
            spool
                .spool_sector(2, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(3, 3)])])
                .expect("spool");
            // Dropped here: simulates a crash/restart.
        }
        let (spool, report) = DiskSpool::open(dir.path()).expect("reopen");
        assert_eq!(report.files_indexed, 2);
        assert_eq!(report.records_indexed, 3);
        assert_eq!(spool.new_record_count(UploadSource::Gateway, 1), 2);
        assert_eq!(spool.new_record_count(UploadSource::Gateway, 2), 1);
        assert!(!spool.is_exhausted(UploadSource::Gateway));
    }

    #[test]
    fn test_clear_all_removes_tree() {
        let dir = TempDir::new().expect("tempdir");
        let base = dir.path().join("spool");
        let (spool, _) = DiskSpool::open(&base).expect("open");
        spool
            .spool_sector(1, RecordKind::Evt, &[(UploadSource::Gateway, vec![evt(1, 1)])])
            .expect("spool");
        assert_eq!(spool.total_files(), 1);

        spool.clear_all().expect("clear");
        assert_eq!(spool.total_files(), 0);
        assert!(base.exists());
        assert!(!base.join("gateway").exists());
    }
}
