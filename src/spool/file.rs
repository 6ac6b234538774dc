// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Spool file codec — one migrated sector's records, written power-safely.
//!
//! ## File Layout
//!
//! ```text
//! [SpoolHeader : 20 bytes]
//!   magic        : [u8;4]  = b"TSPL"
//!   version      : u16     (LE)
//!   kind         : u8      (0 = TSD, 1 = EVT)
//!   record_count : u8
//!   base_utc     : u64     (LE, ms) — UTC of the first record
//!   payload_crc  : u32     (LE) — CRC32 of the payload bytes
//!
//! [payload]
//!   TSD: record_count × u32 (LE) sample values (UTC implied by base_utc)
//!   EVT: record_count × (utc_ms: u64, value: u32) (LE)
//! ```
//!
//! Files are named `sensor_{id}_seq_{n}.dat` under `{base}/{src_tag}/`.
//! Writes go to a `.tmp` sibling first, are fsynced, then renamed into
//! place; the directory is fsynced after the rename so a power cut leaves
//! either the complete file or nothing.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StoreError};
use crate::store::record::{RecordKind, Sample};

// ─────────────────────────────── constants ───────────────────────────────────

pub const SPOOL_MAGIC: &[u8; 4] = b"TSPL";
pub const SPOOL_VERSION: u16 = 1;
pub const SPOOL_HEADER_SIZE: u64 = 4 + 2 + 1 + 1 + 8 + 4; // 20 bytes

// ─────────────────────────────── types ───────────────────────────────────────

/// Index entry for one spool file; the payload stays on disk until read.
#[derive(Debug, Clone)]
pub struct SpoolFileMeta {
    pub path: PathBuf,
    pub sensor: u32,
    pub seq: u64,
    pub kind: RecordKind,
    pub record_count: u32,
    pub base_utc: u64,
}

/// `sensor_{id}_seq_{n}.dat`
pub fn spool_file_name(sensor: u32, seq: u64) -> String {
    format!("sensor_{sensor}_seq_{seq}.dat")
}

/// Inverse of [`spool_file_name`]; `None` for anything else in the directory.
pub fn parse_spool_file_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix("sensor_")?.strip_suffix(".dat")?;
    let (sensor, seq) = rest.split_once("_seq_")?;
    Some((sensor.parse().ok()?, seq.parse().ok()?))
}

fn encode_payload(kind: RecordKind, samples: &[Sample]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(samples.len() * kind.stride() as usize);
    for sample in samples {
        match kind {
            RecordKind::Tsd => {
                payload.extend_from_slice(&sample.value.to_le_bytes());
            }
            RecordKind::Evt => {
                payload.extend_from_slice(&sample.utc_ms.to_le_bytes());
                payload.extend_from_slice(&sample.value.to_le_bytes());
            }
        }
    }
    payload
}

fn decode_payload(kind: RecordKind, base_utc: u64, payload: &[u8]) -> Result<Vec<Sample>> {
    let mut cursor = payload;
    let mut samples = Vec::new();
    match kind {
        RecordKind::Tsd => {
            while !cursor.is_empty() {
                let value = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| StoreError::Corrupt("truncated TSD payload".into()))?;
                samples.push(Sample { utc_ms: base_utc, value });
            }
        }
        RecordKind::Evt => {
            while !cursor.is_empty() {
                let utc_ms = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| StoreError::Corrupt("truncated EVT payload".into()))?;
                let value = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| StoreError::Corrupt("truncated EVT payload".into()))?;
                samples.push(Sample { utc_ms, value });
            }
        }
    }
    Ok(samples)
}

/// Write one spool file durably: temp sibling, fsync, atomic rename, dir
/// fsync. Returns the index entry for the finished file.
pub fn write_spool_file(
    dir: &Path,
    sensor: u32,
    seq: u64,
    kind: RecordKind,
    samples: &[Sample],
) -> Result<SpoolFileMeta> {
    if samples.is_empty() || samples.len() > kind.records_per_sector() as usize {
        return Err(StoreError::InvalidParameter(format!(
            "spool write of {} records for a {:?} sector",
            samples.len(),
            kind
        )));
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| StoreError::Spool(format!("create spool dir {dir:?}: {e}")))?;

    let base_utc = samples[0].utc_ms;
    let payload = encode_payload(kind, samples);
    let crc = crc32fast::hash(&payload);

    let final_path = dir.join(spool_file_name(sensor, seq));
    let tmp_path = dir.join(format!("{}.tmp", spool_file_name(sensor, seq)));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| StoreError::Spool(format!("open {tmp_path:?}: {e}")))?;
        file.write_all(SPOOL_MAGIC)?;
        file.write_u16::<LittleEndian>(SPOOL_VERSION)?;
        file.write_u8(kind.wire_tag())?;
        file.write_u8(samples.len() as u8)?;
        file.write_u64::<LittleEndian>(base_utc)?;
        file.write_u32::<LittleEndian>(crc)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, &final_path)
        .map_err(|e| StoreError::Spool(format!("rename into {final_path:?}: {e}")))?;
    // Make the rename itself durable.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok(SpoolFileMeta {
        path: final_path,
        sensor,
        seq,
        kind,
        record_count: samples.len() as u32,
        base_utc,
    })
}

/// Read and fully validate a spool file: magic, version, kind tag, record
/// count, payload length, CRC32. Any mismatch is `Corrupt`.
pub fn read_spool_file(path: &Path) -> Result<(SpoolFileMeta, Vec<Sample>)> {
    let file = File::open(path).map_err(|e| StoreError::Spool(format!("open {path:?}: {e}")))?;
    let file_len = file
        .metadata()
        .map_err(|e| StoreError::Spool(format!("stat {path:?}: {e}")))?
        .len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| StoreError::Corrupt(format!("{path:?}: short header")))?;
    if &magic != SPOOL_MAGIC {
        return Err(StoreError::Corrupt(format!("{path:?}: bad magic")));
    }
    let version = reader.read_u16::<LittleEndian>()?;
    if version != SPOOL_VERSION {
        return Err(StoreError::Corrupt(format!("{path:?}: unsupported version {version}")));
    }
    let kind = RecordKind::from_wire_tag(reader.read_u8()?)
        .ok_or_else(|| StoreError::Corrupt(format!("{path:?}: bad kind tag")))?;
    let record_count = reader.read_u8()? as u32;
    let base_utc = reader.read_u64::<LittleEndian>()?;
    let stored_crc = reader.read_u32::<LittleEndian>()?;

    if record_count == 0 || record_count > kind.records_per_sector() as u32 {
        return Err(StoreError::Corrupt(format!(
            "{path:?}: record count {record_count} out of range"
        )));
    }
    let expected_len = SPOOL_HEADER_SIZE + record_count as u64 * kind.stride() as u64;
    if file_len != expected_len {
        return Err(StoreError::Corrupt(format!(
            "{path:?}: length {file_len}, expected {expected_len}"
        )));
    }

    let mut payload = Vec::with_capacity((file_len - SPOOL_HEADER_SIZE) as usize);
    reader
        .read_to_end(&mut payload)
        .map_err(|_| StoreError::Corrupt(format!("{path:?}: short payload")))?;
    if crc32fast::hash(&payload) != stored_crc {
        return Err(StoreError::Corrupt(format!("{path:?}: payload CRC mismatch")));
    }

    let samples = decode_payload(kind, base_utc, &payload)?;
    let (sensor, seq) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_spool_file_name)
        .ok_or_else(|| StoreError::Corrupt(format!("{path:?}: unrecognised file name")))?;

    Ok((
        SpoolFileMeta {
            path: path.to_path_buf(),
            sensor,
            seq,
            kind,
            record_count,
            base_utc,
        },
        samples,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn samples_evt() -> Vec<Sample> {
        vec![
            Sample { utc_ms: 1000, value: 10 },
            Sample { utc_ms: 1001, value: 11 },
        ]
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = spool_file_name(17, 42);
        assert_eq!(name, "sensor_17_seq_42.dat");
        assert_eq!(parse_spool_file_name(&name), Some((17, 42)));
        assert_eq!(parse_spool_file_name("sensor_17_seq_42.dat.tmp"), None);
        assert_eq!(parse_spool_file_name("pool_000.bin"), None);
    }

    #[test]
    fn test_write_read_round_trip_evt() {
        let dir = TempDir::new().expect("tempdir");
        let written = write_spool_file(dir.path(), 3, 0, RecordKind::Evt, &samples_evt())
            .expect("write");
        assert_eq!(written.record_count, 2);
        assert_eq!(written.base_utc, 1000);

        let (meta, samples) = read_spool_file(&written.path).expect("read");
        assert_eq!(meta.sensor, 3);
        assert_eq!(meta.seq, 0);
        assert_eq!(meta.kind, RecordKind::Evt);
        assert_eq!(samples, samples_evt());
    }

    #[test]
    fn test_write_read_round_trip_tsd() {
        let dir = TempDir::new().expect("tempdir");
        let samples: Vec<Sample> =
            (0..6).map(|i| Sample { utc_ms: 5_000, value: i * 7 }).collect();
        let written =
            write_spool_file(dir.path(), 9, 4, RecordKind::Tsd, &samples).expect("write");
        let (_, got) = read_spool_file(&written.path).expect("read");
        assert_eq!(got, samples);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = TempDir::new().expect("tempdir");
        write_spool_file(dir.path(), 1, 0, RecordKind::Evt, &samples_evt()).expect("write");
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sensor_1_seq_0.dat".to_string()]);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = TempDir::new().expect("tempdir");
        let written = write_spool_file(dir.path(), 1, 0, RecordKind::Evt, &samples_evt())
            .expect("write");
        // Flip one payload byte.
        let mut bytes = std::fs::read(&written.path).expect("read bytes");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&written.path, &bytes).expect("rewrite");
        assert!(matches!(
            read_spool_file(&written.path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = TempDir::new().expect("tempdir");
        let written = write_spool_file(dir.path(), 1, 0, RecordKind::Evt, &samples_evt())
            .expect("write");
        let bytes = std::fs::read(&written.path).expect("read bytes");
        std::fs::write(&written.path, &bytes[..bytes.len() - 4]).expect("truncate");
        assert!(matches!(
            read_spool_file(&written.path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("sensor_1_seq_0.dat");
        std::fs::write(&path, b"NOPE____________________").expect("write junk");
        assert!(matches!(read_spool_file(&path), Err(StoreError::Corrupt(_))));
    }
}
