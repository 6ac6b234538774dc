// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-packet companion bookkeeping for the upload state machine.
//!
//! The upload FSM builds one packet per `(source, cycle)`. The store keeps
//! the "which sensors actually contributed records" question unambiguous:
//! only sensors recorded here may be ACKed or NACKed for this packet, and a
//! sensor whose read produced nothing is never recorded. The in-use flag
//! guards against two packets being built for the same source at once; it
//! is released when the packet is dropped, however the cycle ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::source::UploadSource;

/// Per-sensor contribution to one packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketRow {
    pub sensor: u32,
    pub records_added: u32,
}

/// Companion structure for one upload packet under construction.
pub struct Packet {
    source: UploadSource,
    rows: Vec<PacketRow>,
    in_use: Arc<AtomicBool>,
}

impl Packet {
    pub(crate) fn new(source: UploadSource, in_use: Arc<AtomicBool>) -> Self {
        Packet { source, rows: Vec::new(), in_use }
    }

    pub fn source(&self) -> UploadSource {
        self.source
    }

    /// Sensors that contributed records to this packet.
    pub fn rows(&self) -> &[PacketRow] {
        &self.rows
    }

    /// True when no sensor contributed anything; such a packet is not sent.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_records(&self) -> u32 {
        self.rows.iter().map(|r| r.records_added).sum()
    }

    pub(crate) fn record_row(&mut self, sensor: u32, records_added: u32) {
        debug_assert!(records_added > 0, "empty sensors are omitted from packets");
        self.rows.push(PacketRow { sensor, records_added });
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_released_on_drop() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let mut pkt = Packet::new(UploadSource::Gateway, flag.clone());
            pkt.record_row(1, 3);
            assert_eq!(pkt.total_records(), 3);
            assert!(!pkt.is_empty());
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
