//! The swap table: a bitmap allocator over the swap device.
//!
//! The device is partitioned into page-sized slots of
//! `SECTORS_PER_PAGE` contiguous sectors; slot `i` occupies sectors
//! `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)`.
//!
//! The bitmap lives in memory only; a set bit means the slot is free.
//! All three operations serialize on one lock, and the device I/O runs
//! inside the critical section. The device driver is assumed to be
//! internally synchronized but slow; contention here is low enough that
//! holding the lock across I/O is the simpler correct choice.

use crate::address::PhysPageNum;
use crate::block_dev::BlockDevice;
use crate::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::frame_allocator::UserPool;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Bits per bitmap group.
const GROUP_BITS: usize = 64;

struct SwapTableInner {
    /// One bit per slot; set = free.
    map: Vec<u64>,
    slots: usize,
}

/// Allocator and I/O front end for the swap device.
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<SwapTableInner>,
}

impl SwapTable {
    /// Sizes the bitmap from the device and marks every slot free.
    ///
    /// # Panic
    ///
    /// Panics if the device is too small to hold a single page.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.num_blocks() / SECTORS_PER_PAGE;
        if slots == 0 {
            panic!("Cannot size the swap table: device smaller than one page");
        }
        let groups = (slots + GROUP_BITS - 1) / GROUP_BITS;
        let mut map = alloc::vec![u64::MAX; groups];
        // Bits past the last real slot must never look free.
        let tail = slots % GROUP_BITS;
        if tail != 0 {
            map[groups - 1] = (1u64 << tail) - 1;
        }
        Self {
            device,
            inner: Mutex::new(SwapTableInner { map, slots }),
        }
    }

    /// Writes `page` out to a free slot, marking it occupied.
    ///
    /// # Return
    /// Conditional branching.
    /// - The index of the slot now holding the page
    /// - If every slot is occupied => `None`
    pub fn swap_out(&self, page: &[u8]) -> Option<usize> {
        assert_eq!(page.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        let (group, inner_pos) = inner
            .map
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != 0)
            .map(|(group, bits)| (group, bits.trailing_zeros() as usize))?;
        inner.map[group] &= !(1u64 << inner_pos);
        let idx = group * GROUP_BITS + inner_pos;
        let mut sec_no = idx * SECTORS_PER_PAGE;
        for chunk in page.chunks(SECTOR_SIZE) {
            self.device.write_block(sec_no, chunk);
            sec_no += 1;
        }
        Some(idx)
    }

    /// Reads slot `idx` back into `page` and marks the slot free.
    ///
    /// # Return
    /// `false` without side effect if `idx` is out of range or the slot
    /// is not occupied.
    pub fn swap_in(&self, page: &mut [u8], idx: usize) -> bool {
        assert_eq!(page.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        if idx >= inner.slots {
            return false;
        }
        if inner.map[idx / GROUP_BITS] & (1u64 << (idx % GROUP_BITS)) != 0 {
            // Slot is empty.
            return false;
        }
        let mut sec_no = idx * SECTORS_PER_PAGE;
        for chunk in page.chunks_mut(SECTOR_SIZE) {
            self.device.read_block(sec_no, chunk);
            sec_no += 1;
        }
        inner.map[idx / GROUP_BITS] |= 1u64 << (idx % GROUP_BITS);
        true
    }

    /// Marks slot `idx` free without touching the device. Used when the
    /// owning page dies while its content sits in swap.
    pub fn remove(&self, idx: usize) {
        let mut inner = self.inner.lock();
        assert!(idx < inner.slots);
        assert!(
            inner.map[idx / GROUP_BITS] & (1u64 << (idx % GROUP_BITS)) == 0,
            "freeing an empty swap slot"
        );
        inner.map[idx / GROUP_BITS] |= 1u64 << (idx % GROUP_BITS);
    }

    /// Total slots on the device.
    pub fn slots(&self) -> usize {
        self.inner.lock().slots
    }

    /// Is slot `idx` currently free?
    pub fn is_free(&self, idx: usize) -> bool {
        let inner = self.inner.lock();
        assert!(idx < inner.slots);
        inner.map[idx / GROUP_BITS] & (1u64 << (idx % GROUP_BITS)) != 0
    }

    /// Copies a frame out to swap. Convenience over [`SwapTable::swap_out`]
    /// for callers holding a frame number rather than a byte slice.
    pub(crate) fn swap_out_frame(&self, pool: &UserPool, ppn: PhysPageNum) -> Option<usize> {
        pool.read(ppn, |bytes| self.swap_out(bytes))
    }
}
