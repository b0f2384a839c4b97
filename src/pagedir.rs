//! ## The per-process page directory
//!
//! The hardware walk is modeled in software: a page directory is a map
//! from virtual page number to a page-table-entry word. The word keeps
//! the SV39 leaf layout (frame number shifted above a byte of flag
//! bits), so the flag arithmetic reads the same as it would against a
//! real table, and the accessed/dirty bits behave the way an MMU would
//! drive them: the access path sets them, the memory subsystem reads
//! and clears them.

use crate::address::{PhysPageNum, VirtPageNum};
use crate::frame_allocator::UserPool;
use alloc::collections::BTreeMap;
use bitflags::*;
use spin::Mutex;

bitflags! {
    pub struct PTEFlags: u8 {
        /// Valid:
        /// - A page table entry is legal only if bit `V` is 1.
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User:
        /// - The entry maps user-space memory.
        const U = 1 << 4;
        /// Global:
        /// - Ignore for the time being.
        const G = 1 << 5;
        /// Accessed:
        /// - Set on every load or store through the mapping since the
        ///   bit was last cleared.
        const A = 1 << 6;
        /// Dirty:
        /// - Set on every store through the mapping since the bit was
        ///   last cleared.
        const D = 1 << 7;
    }
}

/// One leaf entry: frame number and access control information packed
/// into a `usize`, flags in the low byte.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    /// get frame number.
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10).into()
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    /// true if `V` flag is 1, false if it is 0.
    pub fn is_valid(&self) -> bool {
        (self.flags() & PTEFlags::V) != PTEFlags::empty()
    }

    pub fn writable(&self) -> bool {
        (self.flags() & PTEFlags::W) != PTEFlags::empty()
    }

    pub fn is_accessed(&self) -> bool {
        (self.flags() & PTEFlags::A) != PTEFlags::empty()
    }

    pub fn is_dirty(&self) -> bool {
        (self.flags() & PTEFlags::D) != PTEFlags::empty()
    }

    fn set_flag(&mut self, flag: PTEFlags, v: bool) {
        let mut flags = self.flags();
        flags.set(flag, v);
        self.bits = (self.bits & !0xff) | flags.bits() as usize;
    }
}

/// # Page directory
///
/// One per process. Entries exist only while the page is present;
/// `clear` removes the entry outright, which is what makes a subsequent
/// access fault back into the resolver.
///
/// Interior locking lets the eviction path flip bits in another
/// process's directory while that process owns everything else of its
/// address space.
pub struct PageDirectory {
    entries: Mutex<BTreeMap<VirtPageNum, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adds a mapping from `upage` to the frame `kpage` with the given
    /// write permission. The new entry starts with clear accessed and
    /// dirty bits.
    ///
    /// # Return
    /// `false` if `upage` is already mapped; the directory is unchanged.
    pub fn install(&self, upage: VirtPageNum, kpage: PhysPageNum, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        let mut flags = PTEFlags::V | PTEFlags::R | PTEFlags::U;
        if writable {
            flags |= PTEFlags::W;
        }
        entries.insert(upage, PageTableEntry::new(kpage, flags));
        true
    }

    /// Marks `upage` "not present". Later accesses fault.
    pub fn clear(&self, upage: VirtPageNum) {
        self.entries.lock().remove(&upage);
    }

    /// Makes a copy of the page table entry and returns it if present,
    /// or None if not.
    pub fn translate(&self, upage: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.lock().get(&upage).copied()
    }

    pub fn is_dirty(&self, upage: VirtPageNum) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .map_or(false, |pte| pte.is_dirty())
    }

    pub fn set_dirty(&self, upage: VirtPageNum, v: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.set_flag(PTEFlags::D, v);
        }
    }

    pub fn is_accessed(&self, upage: VirtPageNum) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .map_or(false, |pte| pte.is_accessed())
    }

    pub fn set_accessed(&self, upage: VirtPageNum, v: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.set_flag(PTEFlags::A, v);
        }
    }

    /// Records a load or store through the mapping the way the MMU
    /// would: `A` always, `D` additionally for a store.
    pub(crate) fn mark_access(&self, upage: VirtPageNum, write: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.set_flag(PTEFlags::A, true);
            if write {
                pte.set_flag(PTEFlags::D, true);
            }
        }
    }

    /// Tears the directory down, returning every still-mapped frame to
    /// the pool. Runs last in process teardown: the supplemental page
    /// table has already dropped its frame-table records, so the frames
    /// themselves are the only thing left to free.
    pub fn destroy(&self, pool: &UserPool) {
        let mut entries = self.entries.lock();
        for (_, pte) in entries.iter() {
            pool.dealloc(pte.ppn());
        }
        entries.clear();
    }

    /// Number of present pages. Used by teardown assertions and tests.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_translate() {
        let pd = PageDirectory::new();
        assert!(pd.install(VirtPageNum(7), PhysPageNum(3), true));
        let pte = pd.translate(VirtPageNum(7)).unwrap();
        assert_eq!(pte.ppn(), PhysPageNum(3));
        assert!(pte.is_valid());
        assert!(pte.writable());
        assert!(!pte.is_accessed());
        assert!(!pte.is_dirty());
        // second install of the same page is refused
        assert!(!pd.install(VirtPageNum(7), PhysPageNum(4), false));
    }

    #[test]
    fn clear_makes_not_present() {
        let pd = PageDirectory::new();
        pd.install(VirtPageNum(1), PhysPageNum(0), false);
        pd.clear(VirtPageNum(1));
        assert!(pd.translate(VirtPageNum(1)).is_none());
    }

    #[test]
    fn access_bits_follow_loads_and_stores() {
        let pd = PageDirectory::new();
        pd.install(VirtPageNum(2), PhysPageNum(1), true);
        pd.mark_access(VirtPageNum(2), false);
        assert!(pd.is_accessed(VirtPageNum(2)));
        assert!(!pd.is_dirty(VirtPageNum(2)));
        pd.mark_access(VirtPageNum(2), true);
        assert!(pd.is_dirty(VirtPageNum(2)));
        pd.set_accessed(VirtPageNum(2), false);
        pd.set_dirty(VirtPageNum(2), false);
        assert!(!pd.is_accessed(VirtPageNum(2)));
        assert!(!pd.is_dirty(VirtPageNum(2)));
    }
}
