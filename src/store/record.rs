// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Record layouts within a sector payload.
//!
//! Two layouts exist, tagged per sensor (never per sector):
//!
//! ```text
//! TSD sector (time-series, one UTC header, fixed-stride samples):
//!   base_utc : u64 (LE, ms)        offsets 0..8
//!   sample   : u32 (LE) × 6        offsets 8, 12, 16, 20, 24, 28
//!
//! EVT sector (events, self-timestamped pairs):
//!   (utc_ms : u64, value : u32) (LE) × 2   offsets 0, 12
//! ```
//!
//! The TSD header holds the timestamp of the first sample in the sector;
//! samples are reported against that base. EVT pairs carry their own UTC.

use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::error::Result;
use crate::store::sector_pool::{SectorId, SectorPool, SECTOR_PAYLOAD};

/// Stride of one TSD sample.
pub const TSD_SAMPLE_LEN: u16 = 4;
/// Byte offset of the first TSD sample (the 8-byte UTC header precedes it).
pub const TSD_FIRST_OFFSET: u16 = 8;
/// Samples per TSD sector: (32 - 8) / 4.
pub const TSD_SAMPLES_PER_SECTOR: u16 = (SECTOR_PAYLOAD - TSD_FIRST_OFFSET) / TSD_SAMPLE_LEN;

/// Stride of one EVT pair.
pub const EVT_RECORD_LEN: u16 = 12;
/// EVT records start at the top of the payload.
pub const EVT_FIRST_OFFSET: u16 = 0;
/// Pairs per EVT sector: 32 / 12.
pub const EVT_RECORDS_PER_SECTOR: u16 = SECTOR_PAYLOAD / EVT_RECORD_LEN;

/// Record layout of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Time-series data: fixed-stride samples under one UTC header per sector.
    Tsd,
    /// Event data: `(utc_ms, value)` pairs.
    Evt,
}

impl RecordKind {
    pub fn stride(self) -> u16 {
        match self {
            RecordKind::Tsd => TSD_SAMPLE_LEN,
            RecordKind::Evt => EVT_RECORD_LEN,
        }
    }

    /// Offset of the first record in a sector of this kind.
    pub fn first_offset(self) -> u16 {
        match self {
            RecordKind::Tsd => TSD_FIRST_OFFSET,
            RecordKind::Evt => EVT_FIRST_OFFSET,
        }
    }

    pub fn records_per_sector(self) -> u16 {
        match self {
            RecordKind::Tsd => TSD_SAMPLES_PER_SECTOR,
            RecordKind::Evt => EVT_RECORDS_PER_SECTOR,
        }
    }

    /// End of usable record space in a full sector of this kind.
    pub fn data_end(self) -> u16 {
        self.first_offset() + self.records_per_sector() * self.stride()
    }

    /// Tag byte written into spool file headers (0 = TSD, 1 = EVT).
    pub fn wire_tag(self) -> u8 {
        match self {
            RecordKind::Tsd => 0,
            RecordKind::Evt => 1,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<RecordKind> {
        match tag {
            0 => Some(RecordKind::Tsd),
            1 => Some(RecordKind::Evt),
            _ => None,
        }
    }
}

/// One telemetry record as delivered to an upload source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub utc_ms: u64,
    pub value: u32,
}

/// Write the 8-byte base-UTC header of a fresh TSD sector.
pub fn write_tsd_header(pool: &mut SectorPool, sector: SectorId, utc_ms: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, utc_ms);
    pool.write(sector, 0, &buf)
}

/// Read a TSD sector's base UTC.
pub fn read_tsd_header(pool: &SectorPool, sector: SectorId) -> Result<u64> {
    let bytes = pool.read(sector, 0, 8)?;
    Ok(LittleEndian::read_u64(bytes))
}

/// Write one record at `offset`. TSD stores only the value; EVT stores the
/// full `(utc_ms, value)` pair.
pub fn write_record(
    pool: &mut SectorPool,
    kind: RecordKind,
    sector: SectorId,
    offset: u16,
    sample: Sample,
) -> Result<()> {
    match kind {
        RecordKind::Tsd => {
            let mut buf = [0u8; TSD_SAMPLE_LEN as usize];
            LittleEndian::write_u32(&mut buf, sample.value);
            pool.write(sector, offset, &buf)
        }
        RecordKind::Evt => {
            let mut buf = [0u8; EVT_RECORD_LEN as usize];
            LittleEndian::write_u64(&mut buf[0..8], sample.utc_ms);
            LittleEndian::write_u32(&mut buf[8..12], sample.value);
            pool.write(sector, offset, &buf)
        }
    }
}

/// Read one record at `offset`. For TSD the sector's base UTC is reported.
pub fn read_record(
    pool: &SectorPool,
    kind: RecordKind,
    sector: SectorId,
    offset: u16,
) -> Result<Sample> {
    match kind {
        RecordKind::Tsd => {
            let base_utc = read_tsd_header(pool, sector)?;
            let bytes = pool.read(sector, offset, TSD_SAMPLE_LEN)?;
            Ok(Sample {
                utc_ms: base_utc,
                value: LittleEndian::read_u32(bytes),
            })
        }
        RecordKind::Evt => {
            let bytes = pool.read(sector, offset, EVT_RECORD_LEN)?;
            Ok(Sample {
                utc_ms: LittleEndian::read_u64(&bytes[0..8]),
                value: LittleEndian::read_u32(&bytes[8..12]),
            })
        }
    }
}
