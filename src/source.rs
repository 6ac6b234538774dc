// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Upload sources — the closed set of destinations telemetry is shipped to.
//!
//! Each source keeps an independent read/ACK cursor over a sensor's shared
//! sector chain, and owns its own subtree of spool files on disk
//! (`{base}/{tag}/`). The set is fixed at compile time; per-sensor
//! configuration selects which sources a sensor actually feeds.

use std::fmt;

use serde::Deserialize;

/// A telemetry upload destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadSource {
    /// Local gateway uplink.
    Gateway,
    /// Hosted cloud endpoint.
    Hosted,
    /// BLE-connected companion device.
    Ble,
    /// CAN diagnostic consumer.
    CanDev,
}

/// Number of declared upload sources. Per-source state arrays are sized
/// with this so a new enum variant fails to compile until every table grows.
pub const SOURCE_COUNT: usize = 4;

impl UploadSource {
    pub const ALL: [UploadSource; SOURCE_COUNT] = [
        UploadSource::Gateway,
        UploadSource::Hosted,
        UploadSource::Ble,
        UploadSource::CanDev,
    ];

    /// Dense index into per-source state arrays.
    pub fn index(self) -> usize {
        match self {
            UploadSource::Gateway => 0,
            UploadSource::Hosted => 1,
            UploadSource::Ble => 2,
            UploadSource::CanDev => 3,
        }
    }

    /// Lowercase tag used for spool directory names.
    pub fn tag(self) -> &'static str {
        match self {
            UploadSource::Gateway => "gateway",
            UploadSource::Hosted => "hosted",
            UploadSource::Ble => "ble",
            UploadSource::CanDev => "can_dev",
        }
    }

    /// Inverse of [`tag`](Self::tag); used when scanning the spool tree.
    pub fn from_tag(tag: &str) -> Option<UploadSource> {
        UploadSource::ALL.iter().copied().find(|s| s.tag() == tag)
    }
}

impl fmt::Display for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Compact set of upload sources, one bit per [`UploadSource::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSet(u8);

impl SourceSet {
    pub fn empty() -> Self {
        SourceSet(0)
    }

    pub fn insert(&mut self, src: UploadSource) {
        self.0 |= 1 << src.index();
    }

    pub fn contains(self, src: UploadSource) -> bool {
        self.0 & (1 << src.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = UploadSource> {
        UploadSource::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl FromIterator<UploadSource> for SourceSet {
    fn from_iter<T: IntoIterator<Item = UploadSource>>(iter: T) -> Self {
        let mut set = SourceSet::empty();
        for s in iter {
            set.insert(s);
        }
        set
    }
}
