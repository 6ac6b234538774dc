// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Fixed sector pool — the RAM tier's arena of uniformly sized sectors.
//!
//! Every sector holds a 32-byte payload plus a chain link word. Sectors are
//! addressed by [`SectorId`] (a 32-bit index); chains are built by pointing
//! one sector's link at the next. A sector-allocation table (the free-list
//! stack plus a used bitmap) gives O(1) `allocate` / `free`.
//!
//! ## Sector entry
//!
//! ```text
//! next    : SectorId  — NULL_SECTOR terminates a chain
//! payload : [u8; 32]  — TSD or EVT layout, owned by the chain layer
//! ```
//!
//! Sector id 0 is a valid sector; only [`SectorId::NULL`] is not.

use std::fmt;

use tracing::error;

use crate::error::{Result, StoreError};

// ─────────────────────────────── constants ───────────────────────────────────

/// Payload bytes per sector.
pub const SECTOR_PAYLOAD: u16 = 32;

const NULL_ID: u32 = u32::MAX;

// ─────────────────────────────── types ───────────────────────────────────────

/// Index of a sector in the pool. The all-ones value is the reserved
/// "no sector" sentinel that terminates chains.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorId(u32);

impl SectorId {
    pub const NULL: SectorId = SectorId(NULL_ID);

    pub fn is_null(self) -> bool {
        self.0 == NULL_ID
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("SectorId(NULL)")
        } else {
            write!(f, "SectorId({})", self.0)
        }
    }
}

struct Sector {
    next: SectorId,
    payload: [u8; SECTOR_PAYLOAD as usize],
}

/// Fixed arena of sectors plus the allocation table. **Not** thread-safe on
/// its own; the store wraps it in the pool lock.
pub struct SectorPool {
    sectors: Vec<Sector>,
    /// Free-list stack of sector indices; top is allocated first.
    free_list: Vec<u32>,
    /// SAT: one bit of truth per sector, used to catch double frees.
    used: Vec<bool>,
}

impl SectorPool {
    /// Build a pool of `count` free sectors.
    pub fn new(count: u32) -> Self {
        let n = count as usize;
        let mut sectors = Vec::with_capacity(n);
        for _ in 0..n {
            sectors.push(Sector {
                next: SectorId::NULL,
                payload: [0u8; SECTOR_PAYLOAD as usize],
            });
        }
        // Low indices end up on top of the stack and allocate first.
        let free_list: Vec<u32> = (0..count).rev().collect();
        SectorPool {
            sectors,
            free_list,
            used: vec![false; n],
        }
    }

    /// Pop a free sector. The payload is zeroed and the link nulled so a
    /// recycled sector carries nothing over from its previous chain.
    pub fn allocate(&mut self) -> Result<SectorId> {
        let idx = self.free_list.pop().ok_or(StoreError::NoSpace)?;
        let sector = &mut self.sectors[idx as usize];
        sector.next = SectorId::NULL;
        sector.payload.fill(0);
        self.used[idx as usize] = true;
        Ok(SectorId(idx))
    }

    /// Return a sector to the free list. Double-free is a programming error:
    /// debug builds panic, release builds log and ignore the call.
    pub fn free(&mut self, id: SectorId) {
        let idx = id.raw() as usize;
        if id.is_null() || idx >= self.sectors.len() || !self.used[idx] {
            debug_assert!(false, "free of invalid or unallocated sector {id:?}");
            error!(sector = ?id, "free of invalid or unallocated sector ignored");
            return;
        }
        self.used[idx] = false;
        self.free_list.push(id.raw());
    }

    /// Read `len` payload bytes starting at `offset`.
    pub fn read(&self, id: SectorId, offset: u16, len: u16) -> Result<&[u8]> {
        let idx = self.check(id, offset, len)?;
        let start = offset as usize;
        Ok(&self.sectors[idx].payload[start..start + len as usize])
    }

    /// Write `bytes` into the payload at `offset`.
    pub fn write(&mut self, id: SectorId, offset: u16, bytes: &[u8]) -> Result<()> {
        let idx = self.check(id, offset, bytes.len() as u16)?;
        let start = offset as usize;
        self.sectors[idx].payload[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_next(&self, id: SectorId) -> Result<SectorId> {
        let idx = self.check(id, 0, 0)?;
        Ok(self.sectors[idx].next)
    }

    pub fn set_next(&mut self, id: SectorId, next: SectorId) -> Result<()> {
        let idx = self.check(id, 0, 0)?;
        self.sectors[idx].next = next;
        Ok(())
    }

    /// Copy of the whole payload, for migration snapshots.
    pub fn snapshot(&self, id: SectorId) -> Result<[u8; SECTOR_PAYLOAD as usize]> {
        let idx = self.check(id, 0, SECTOR_PAYLOAD)?;
        Ok(self.sectors[idx].payload)
    }

    pub fn capacity(&self) -> u32 {
        self.sectors.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_list.len() as u32
    }

    pub fn used_count(&self) -> u32 {
        self.capacity() - self.free_count()
    }

    fn check(&self, id: SectorId, offset: u16, len: u16) -> Result<usize> {
        let idx = id.raw() as usize;
        if id.is_null() || idx >= self.sectors.len() {
            return Err(StoreError::BadOffset { sector: id.raw(), offset, len });
        }
        if offset.checked_add(len).is_none() || offset + len > SECTOR_PAYLOAD {
            return Err(StoreError::BadOffset { sector: id.raw(), offset, len });
        }
        Ok(idx)
    }
}
