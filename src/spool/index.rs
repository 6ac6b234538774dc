// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Disk spool index — maps (source, sensor) → ordered spool file queue.
//!
//! The index lives in memory during a session but is **persistent**: on
//! startup the spool tree is scanned and the index rebuilt from the file
//! headers (see `recovery`). No separate index file is written, so spool
//! I/O stays one durable file per migrated sector.
//!
//! Each queue is a FIFO of [`SpoolFileMeta`] ordered by sequence number.
//! The first `delivered` entries have been handed to the source and await
//! ACK (unlink) or NACK (re-delivery from the front).

use std::collections::HashMap;

use crate::source::{UploadSource, SOURCE_COUNT};
use crate::spool::file::SpoolFileMeta;

/// One source's spool queue for one sensor.
#[derive(Debug, Default)]
pub struct SpoolQueue {
    files: Vec<SpoolFileMeta>,
    /// Files at the front already delivered but not yet acknowledged.
    delivered: usize,
}

impl SpoolQueue {
    pub fn unread(&self) -> &[SpoolFileMeta] {
        &self.files[self.delivered..]
    }

    pub fn unread_records(&self) -> u64 {
        self.unread().iter().map(|f| f.record_count as u64).sum()
    }

    pub fn pending_records(&self) -> u64 {
        self.files[..self.delivered]
            .iter()
            .map(|f| f.record_count as u64)
            .sum()
    }

    pub fn total_records(&self) -> u64 {
        self.files.iter().map(|f| f.record_count as u64).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered
    }
}

/// In-memory index of every live spool file, plus per-source exhausted
/// flags and sequence counters.
#[derive(Default)]
pub struct DiskIndex {
    queues: HashMap<(UploadSource, u32), SpoolQueue>,
    next_seq: HashMap<(UploadSource, u32), u64>,
    /// Per-source file totals across all sensors; drives `exhausted`.
    files_per_source: [u64; SOURCE_COUNT],
    /// Set when a source has no spool files left anywhere; lets the read
    /// path skip disk lookups entirely. Cleared by recovery and by every
    /// new spool write for the source.
    exhausted: [bool; SOURCE_COUNT],
}

impl DiskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from recovered file metadata. Input order does not matter:
    /// queues are sorted by sequence so the result is deterministic.
    pub fn rebuild(&mut self, recovered: Vec<(UploadSource, SpoolFileMeta)>) {
        self.queues.clear();
        self.next_seq.clear();
        self.files_per_source = [0; SOURCE_COUNT];
        self.exhausted = [false; SOURCE_COUNT];

        for (src, meta) in recovered {
            let key = (src, meta.sensor);
            let next = self.next_seq.entry(key).or_insert(0);
            *next = (*next).max(meta.seq + 1);
            self.files_per_source[src.index()] += 1;
            self.queues.entry(key).or_default().files.push(meta);
        }
        for queue in self.queues.values_mut() {
            queue.files.sort_by_key(|f| f.seq);
        }
    }

    /// Next sequence number for a fresh spool file.
    pub fn allocate_seq(&mut self, src: UploadSource, sensor: u32) -> u64 {
        let next = self.next_seq.entry((src, sensor)).or_insert(0);
        let seq = *next;
        *next += 1;
        seq
    }

    /// Register a newly written spool file.
    pub fn push(&mut self, src: UploadSource, meta: SpoolFileMeta) {
        self.files_per_source[src.index()] += 1;
        self.exhausted[src.index()] = false;
        self.queues
            .entry((src, meta.sensor))
            .or_default()
            .files
            .push(meta);
    }

    pub fn queue(&self, src: UploadSource, sensor: u32) -> Option<&SpoolQueue> {
        self.queues.get(&(src, sensor))
    }

    /// Next undelivered file, if any.
    pub fn next_unread(&self, src: UploadSource, sensor: u32) -> Option<&SpoolFileMeta> {
        self.queues
            .get(&(src, sensor))
            .and_then(|q| q.unread().first())
    }

    /// Mark the next undelivered file as delivered (pending ACK).
    pub fn mark_delivered(&mut self, src: UploadSource, sensor: u32) {
        if let Some(queue) = self.queues.get_mut(&(src, sensor)) {
            if queue.delivered < queue.files.len() {
                queue.delivered += 1;
            }
        }
    }

    /// ACK: drop the delivered prefix from the queue. Returns the metas so
    /// the caller can unlink the files.
    pub fn ack(&mut self, src: UploadSource, sensor: u32) -> Vec<SpoolFileMeta> {
        let Some(queue) = self.queues.get_mut(&(src, sensor)) else {
            return Vec::new();
        };
        let acked: Vec<SpoolFileMeta> = queue.files.drain(..queue.delivered).collect();
        queue.delivered = 0;
        self.note_removed(src, acked.len() as u64);
        acked
    }

    /// NACK: the delivered prefix becomes unread again. Idempotent.
    pub fn revert(&mut self, src: UploadSource, sensor: u32) {
        if let Some(queue) = self.queues.get_mut(&(src, sensor)) {
            queue.delivered = 0;
        }
    }

    /// Drop one file (delivered or not) from the queue, e.g. after it was
    /// quarantined. Returns true if it was found.
    pub fn remove_file(&mut self, src: UploadSource, sensor: u32, seq: u64) -> bool {
        let Some(queue) = self.queues.get_mut(&(src, sensor)) else {
            return false;
        };
        let Some(idx) = queue.files.iter().position(|f| f.seq == seq) else {
            return false;
        };
        queue.files.remove(idx);
        if idx < queue.delivered {
            queue.delivered -= 1;
        }
        self.note_removed(src, 1);
        true
    }

    fn note_removed(&mut self, src: UploadSource, n: u64) {
        let count = &mut self.files_per_source[src.index()];
        *count = count.saturating_sub(n);
        if *count == 0 {
            self.exhausted[src.index()] = true;
        }
    }

    pub fn is_exhausted(&self, src: UploadSource) -> bool {
        self.exhausted[src.index()]
    }

    /// Records on disk not yet delivered to `src` for `sensor`.
    pub fn unread_records(&self, src: UploadSource, sensor: u32) -> u64 {
        if self.is_exhausted(src) {
            return 0;
        }
        self.queues
            .get(&(src, sensor))
            .map(|q| q.unread_records())
            .unwrap_or(0)
    }

    /// Records delivered to `src` for `sensor` and awaiting ACK.
    pub fn pending_records(&self, src: UploadSource, sensor: u32) -> u64 {
        self.queues
            .get(&(src, sensor))
            .map(|q| q.pending_records())
            .unwrap_or(0)
    }

    pub fn total_files(&self) -> u64 {
        self.files_per_source.iter().sum()
    }

    pub fn total_records(&self) -> u64 {
        self.queues.values().map(|q| q.total_records()).sum()
    }

    pub fn records_for_sensor(&self, src: UploadSource, sensor: u32) -> u64 {
        self.queues
            .get(&(src, sensor))
            .map(|q| q.total_records())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.next_seq.clear();
        self.files_per_source = [0; SOURCE_COUNT];
        self.exhausted = [true; SOURCE_COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::RecordKind;
    use std::path::PathBuf;

    fn meta(sensor: u32, seq: u64, records: u32) -> SpoolFileMeta {
        SpoolFileMeta {
            path: PathBuf::from(format!("/spool/sensor_{sensor}_seq_{seq}.dat")),
            sensor,
            seq,
            kind: RecordKind::Evt,
            record_count: records,
            base_utc: 0,
        }
    }

    #[test]
    fn test_rebuild_is_order_independent() {
        let src = UploadSource::Gateway;
        let mut a = DiskIndex::new();
        a.rebuild(vec![(src, meta(1, 2, 2)), (src, meta(1, 0, 2)), (src, meta(1, 1, 2))]);
        let mut b = DiskIndex::new();
        b.rebuild(vec![(src, meta(1, 1, 2)), (src, meta(1, 0, 2)), (src, meta(1, 2, 2))]);

        let seqs_a: Vec<u64> = a.queue(src, 1).expect("queue").unread().iter().map(|f| f.seq).collect();
        let seqs_b: Vec<u64> = b.queue(src, 1).expect("queue").unread().iter().map(|f| f.seq).collect();
        assert_eq!(seqs_a, vec![0, 1, 2]);
        assert_eq!(seqs_a, seqs_b);
        assert_eq!(a.allocate_seq(src, 1), 3);
    }

    #[test]
    fn test_deliver_ack_cycle() {
        let src = UploadSource::Gateway;
        let mut index = DiskIndex::new();
        index.push(src, meta(1, 0, 2));
        index.push(src, meta(1, 1, 2));
        assert_eq!(index.unread_records(src, 1), 4);

        index.mark_delivered(src, 1);
        assert_eq!(index.unread_records(src, 1), 2);
        assert_eq!(index.pending_records(src, 1), 2);

        let acked = index.ack(src, 1);
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].seq, 0);
        assert_eq!(index.pending_records(src, 1), 0);
        assert_eq!(index.unread_records(src, 1), 2);
        assert!(!index.is_exhausted(src));
    }

    #[test]
    fn test_revert_redelivers_from_front() {
        let src = UploadSource::Hosted;
        let mut index = DiskIndex::new();
        index.push(src, meta(2, 0, 1));
        index.push(src, meta(2, 1, 1));
        index.mark_delivered(src, 2);
        index.mark_delivered(src, 2);
        assert_eq!(index.unread_records(src, 2), 0);

        index.revert(src, 2);
        index.revert(src, 2); // idempotent
        assert_eq!(index.unread_records(src, 2), 2);
        assert_eq!(index.next_unread(src, 2).expect("front").seq, 0);
    }

    #[test]
    fn test_exhausted_tracking() {
        let src = UploadSource::Ble;
        let mut index = DiskIndex::new();
        assert!(!index.is_exhausted(src), "recovery leaves flags cleared");

        index.push(src, meta(1, 0, 2));
        index.mark_delivered(src, 1);
        index.ack(src, 1);
        assert!(index.is_exhausted(src), "last file acked");

        index.push(src, meta(1, 1, 2));
        assert!(!index.is_exhausted(src), "new spool write clears the flag");
    }

    #[test]
    fn test_remove_file_mid_queue() {
        let src = UploadSource::Gateway;
        let mut index = DiskIndex::new();
        index.push(src, meta(1, 0, 2));
        index.push(src, meta(1, 1, 2));
        index.push(src, meta(1, 2, 2));
        index.mark_delivered(src, 1);

        assert!(index.remove_file(src, 1, 1));
        assert_eq!(index.pending_records(src, 1), 2);
        assert_eq!(index.unread_records(src, 1), 2);
        assert!(!index.remove_file(src, 1, 9));
    }
}
