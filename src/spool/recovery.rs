// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Power-fail recovery — executed once at startup, before any writer runs.
//!
//! Walks `{base}/{src_tag}/`, validates every spool file by header and
//! CRC, quarantines anything corrupt, deletes stale `.tmp` leftovers from
//! interrupted writes, and returns the surviving metadata. The result is
//! sorted by (source, sensor, sequence) so the rebuilt index is identical
//! regardless of filesystem enumeration order. RAM contents at the time of
//! a crash are gone by design; only durable spool files come back.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::source::UploadSource;
use crate::spool::file::{self, SpoolFileMeta};

/// Directory corrupt spool files are moved into, under the spool base.
pub const QUARANTINE_DIR: &str = "quarantine";

/// What recovery found, for logging and statistics.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub files_indexed: usize,
    pub records_indexed: u64,
    pub quarantined: usize,
    pub stale_tmp_removed: usize,
}

/// Scan the spool tree and return every valid file's metadata plus the
/// recovery report. Corrupt files are quarantined as a side effect.
pub fn scan_spool_tree(base: &Path) -> Result<(Vec<(UploadSource, SpoolFileMeta)>, RecoveryReport)> {
    std::fs::create_dir_all(base)
        .map_err(|e| StoreError::Spool(format!("create spool base {base:?}: {e}")))?;

    let mut recovered = Vec::new();
    let mut report = RecoveryReport::default();

    for src in UploadSource::ALL {
        let dir = base.join(src.tag());
        if !dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| StoreError::Spool(format!("scan {dir:?}: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Spool(format!("scan {dir:?}: {e}")))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(".tmp") {
                // Interrupted write: the rename never happened, so the data
                // was never durable. Drop the leftover.
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = ?path, error = %e, "Cannot remove stale temp file");
                } else {
                    report.stale_tmp_removed += 1;
                }
                continue;
            }
            if file::parse_spool_file_name(&name).is_none() {
                warn!(path = ?path, "Unrecognised file in spool directory, ignoring");
                continue;
            }

            match file::read_spool_file(&path) {
                Ok((meta, _samples)) => {
                    report.files_indexed += 1;
                    report.records_indexed += meta.record_count as u64;
                    recovered.push((src, meta));
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Corrupt spool file, quarantining");
                    quarantine_file(base, &path);
                    report.quarantined += 1;
                }
            }
        }
    }

    // Deterministic index regardless of readdir order.
    recovered.sort_by_key(|(src, meta)| (src.index(), meta.sensor, meta.seq));

    info!(
        files = report.files_indexed,
        records = report.records_indexed,
        quarantined = report.quarantined,
        stale_tmp = report.stale_tmp_removed,
        "Spool recovery complete"
    );
    Ok((recovered, report))
}

/// Move a corrupt file into `{base}/quarantine/`, keeping its name. A name
/// clash (same file quarantined after an earlier crash) gets a numeric
/// suffix rather than overwriting the earlier evidence.
pub fn quarantine_file(base: &Path, path: &Path) {
    let qdir = base.join(QUARANTINE_DIR);
    if let Err(e) = std::fs::create_dir_all(&qdir) {
        warn!(dir = ?qdir, error = %e, "Cannot create quarantine directory");
        return;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let mut target = qdir.join(&name);
    let mut attempt = 1u32;
    while target.exists() {
        target = qdir.join(format!("{name}.{attempt}"));
        attempt += 1;
    }
    if let Err(e) = std::fs::rename(path, &target) {
        warn!(from = ?path, to = ?target, error = %e, "Quarantine move failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::{RecordKind, Sample};
    use tempfile::TempDir;

    fn write_valid(base: &Path, src: UploadSource, sensor: u32, seq: u64) {
        let samples = vec![Sample { utc_ms: 100 + seq, value: seq as u32 }];
        file::write_spool_file(&base.join(src.tag()), sensor, seq, RecordKind::Evt, &samples)
            .expect("write spool file");
    }

    #[test]
    fn test_scan_empty_tree() {
        let dir = TempDir::new().expect("tempdir");
        let (recovered, report) = scan_spool_tree(dir.path()).expect("scan");
        assert!(recovered.is_empty());
        assert_eq!(report.files_indexed, 0);
    }

    #[test]
    fn test_scan_sorts_deterministically() {
        let dir = TempDir::new().expect("tempdir");
        write_valid(dir.path(), UploadSource::Hosted, 2, 1);
        write_valid(dir.path(), UploadSource::Gateway, 1, 1);
        write_valid(dir.path(), UploadSource::Gateway, 1, 0);
        write_valid(dir.path(), UploadSource::Gateway, 2, 0);

        let (recovered, report) = scan_spool_tree(dir.path()).expect("scan");
        assert_eq!(report.files_indexed, 4);
        assert_eq!(report.records_indexed, 4);
        let keys: Vec<(UploadSource, u32, u64)> = recovered
            .iter()
            .map(|(s, m)| (*s, m.sensor, m.seq))
            .collect();
        assert_eq!(
            keys,
            vec![
                (UploadSource::Gateway, 1, 0),
                (UploadSource::Gateway, 1, 1),
                (UploadSource::Gateway, 2, 0),
                (UploadSource::Hosted, 2, 1),
            ]
        );
    }

    #[test]
    fn test_corrupt_file_quarantined() {
        let dir = TempDir::new().expect("tempdir");
        write_valid(dir.path(), UploadSource::Gateway, 1, 0);
        let bad = dir.path().join("gateway").join("sensor_1_seq_1.dat");
        std::fs::write(&bad, b"garbage that is not a spool file").expect("write junk");

        let (recovered, report) = scan_spool_tree(dir.path()).expect("scan");
        assert_eq!(recovered.len(), 1);
        assert_eq!(report.quarantined, 1);
        assert!(!bad.exists());
        assert!(dir
            .path()
            .join(QUARANTINE_DIR)
            .join("sensor_1_seq_1.dat")
            .exists());
    }

    #[test]
    fn test_stale_tmp_removed() {
        let dir = TempDir::new().expect("tempdir");
        let gw = dir.path().join("gateway");
        std::fs::create_dir_all(&gw).expect("mkdir");
        std::fs::write(gw.join("sensor_1_seq_0.dat.tmp"), b"half-written").expect("tmp");

        let (recovered, report) = scan_spool_tree(dir.path()).expect("scan");
        assert!(recovered.is_empty());
        assert_eq!(report.stale_tmp_removed, 1);
        assert!(!gw.join("sensor_1_seq_0.dat.tmp").exists());
    }

    #[test]
    fn test_quarantine_name_clash_gets_suffix() {
        let dir = TempDir::new().expect("tempdir");
        let gw = dir.path().join("gateway");
        std::fs::create_dir_all(&gw).expect("mkdir");

        for round in 0..2 {
            let bad = gw.join("sensor_5_seq_0.dat");
            std::fs::write(&bad, format!("junk round {round}")).expect("junk");
            let (_, report) = scan_spool_tree(dir.path()).expect("scan");
            assert_eq!(report.quarantined, 1);
        }
        let qdir = dir.path().join(QUARANTINE_DIR);
        assert!(qdir.join("sensor_5_seq_0.dat").exists());
        assert!(qdir.join("sensor_5_seq_0.dat.1").exists());
    }
}
