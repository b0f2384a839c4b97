//! The system-wide frame table and its replacement policy.
//!
//! One record per physical frame currently lent to a user page, each
//! carrying a back-reference to the supplemental page table entry
//! living in it. When the pool runs dry the table picks a victim with
//! the clock sweep (or plain FIFO under the `fifo` feature), persists
//! its content according to provenance, and hands the frame to the new
//! tenant.
//!
//! Everything here runs under the one frame-table lock, including the
//! eviction I/O; the single sweep cursor is adjusted whenever the
//! record it points at is unlinked.

use crate::address::PhysPageNum;
use crate::config::PAGE_SIZE;
use crate::page::{PageType, SuppPte, SuppPteInner};
use crate::vm::Vm;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use log::warn;
use spin::Mutex;

#[derive(Clone)]
struct FrameRecord {
    kpage: PhysPageNum,
    /// The supplemental page table entry currently mapped here.
    tenant: Arc<SuppPte>,
}

struct FrameTableInner {
    frames: VecDeque<FrameRecord>,
    /// Clock sweep position: index of the next candidate.
    hand: usize,
}

/// Registry of allocated user frames plus the replacement policy.
pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FrameTableInner {
                frames: VecDeque::new(),
                hand: 0,
            }),
        }
    }

    /// Obtains a frame for `tenant`, evicting a victim when the pool is
    /// exhausted.
    ///
    /// # Return
    /// Conditional branching.
    /// - The frame now owned by `tenant`; its old content is garbage
    ///   and the caller fills it.
    /// - If the pool is empty and no victim can be persisted (swap
    ///   full, or nothing to evict) => `None`
    pub fn alloc(&self, vm: &Vm, tenant: Arc<SuppPte>) -> Option<PhysPageNum> {
        let mut inner = self.inner.lock();
        if let Some(kpage) = vm.pool.alloc() {
            inner.frames.push_back(FrameRecord { kpage, tenant });
            return Some(kpage);
        }
        if inner.frames.is_empty() {
            return None;
        }
        let victim = pick_victim(&mut inner);
        let (kpage, pte) = {
            let r = &inner.frames[victim];
            (r.kpage, Arc::clone(&r.tenant))
        };
        if !evict(vm, kpage, &pte) {
            return None;
        }
        #[cfg(not(feature = "fifo"))]
        {
            inner.frames[victim].tenant = tenant;
        }
        #[cfg(feature = "fifo")]
        {
            let mut rec = inner.frames.remove(victim).unwrap();
            rec.tenant = tenant;
            inner.frames.push_back(rec);
        }
        Some(kpage)
    }

    /// Unlinks the record for `kpage` and returns the frame to the pool.
    pub fn free(&self, vm: &Vm, kpage: PhysPageNum) {
        self.unlink(kpage);
        vm.pool.dealloc(kpage);
    }

    /// Unlinks the record for `kpage` without freeing the frame. Used
    /// when the page directory will free the frame itself.
    pub fn remove(&self, kpage: PhysPageNum) {
        self.unlink(kpage);
    }

    fn unlink(&self, kpage: PhysPageNum) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.frames.iter().position(|r| r.kpage == kpage) {
            inner.frames.remove(idx);
            // Removal shifts the successor into `idx`, so a cursor at
            // the removed element already points at the successor.
            if idx < inner.hand {
                inner.hand -= 1;
            }
        }
    }

    /// Number of live frame records.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry currently living in `kpage`, if the frame is lent out.
    pub fn tenant_of(&self, kpage: PhysPageNum) -> Option<Arc<SuppPte>> {
        self.inner
            .lock()
            .frames
            .iter()
            .find(|r| r.kpage == kpage)
            .map(|r| Arc::clone(&r.tenant))
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock algorithm: advance the cursor circularly, clearing accessed
/// bits, until a frame whose tenant has not been touched since the last
/// sweep comes up. Terminates because every pass over a frame either
/// selects it or clears its accessed bit.
#[cfg(not(feature = "fifo"))]
fn pick_victim(inner: &mut FrameTableInner) -> usize {
    loop {
        if inner.hand >= inner.frames.len() {
            inner.hand = 0;
        }
        let rec = &inner.frames[inner.hand];
        let pd = rec.tenant.pagedir();
        let upage = rec.tenant.upage();
        if pd.is_accessed(upage) {
            pd.set_accessed(upage, false);
            inner.hand += 1;
        } else {
            let victim = inner.hand;
            inner.hand += 1;
            return victim;
        }
    }
}

/// FIFO: the oldest frame goes; the caller rotates it to the tail.
#[cfg(feature = "fifo")]
fn pick_victim(_inner: &mut FrameTableInner) -> usize {
    0
}

/// Persists the victim's content according to its provenance and marks
/// the entry not resident:
///
/// - read-only or clean file pages are discarded (re-derivable),
/// - dirty mapped-file pages go back to their file span,
/// - dirty anonymous pages and anything of swap provenance go to swap,
/// - clean zero pages are discarded.
///
/// # Return
/// `false` when a needed swap slot cannot be had; the victim's mapping
/// is reinstalled and it stays resident, unharmed.
fn evict(vm: &Vm, kpage: PhysPageNum, pte: &Arc<SuppPte>) -> bool {
    let mut inner = pte.lock_inner();
    let upage = pte.upage();
    let pd = pte.pagedir();

    // Both aliases' dirty bits must be read before the mapping is torn
    // down; the union becomes the entry's sticky flag.
    let dirty = inner.dirty || pd.is_dirty(upage) || vm.pool.kernel_dirty(kpage);
    pd.clear(upage);

    let persisted = match inner.ty.clone() {
        PageType::File {
            file,
            ofs,
            writable,
            mmap,
            ..
        } => {
            if writable && mmap && dirty {
                let _fs = vm.fs_guard();
                let expected = usize::min(PAGE_SIZE, file.length().saturating_sub(ofs));
                let written = vm.pool.read(kpage, |bytes| file.write_at(ofs, bytes));
                if written < expected {
                    warn!(
                        "mmap write-back at ofs {} wrote {} of {} bytes",
                        ofs, written, expected
                    );
                }
                true
            } else if writable && !mmap && dirty {
                swap_out(vm, kpage, &mut inner)
            } else {
                // Clean or read-only: the file still has the content.
                true
            }
        }
        PageType::Zero => !dirty || swap_out(vm, kpage, &mut inner),
        // The slot was freed at swap-in; the frame is the only copy.
        PageType::Swap { .. } => swap_out(vm, kpage, &mut inner),
    };

    inner.dirty = dirty;
    if !persisted {
        let writable = match inner.ty {
            PageType::File { writable, .. } => writable,
            _ => true,
        };
        pd.install(upage, kpage, writable);
        return false;
    }
    inner.kpage = None;
    vm.pool.set_kernel_dirty(kpage, false);
    true
}

fn swap_out(vm: &Vm, kpage: PhysPageNum, inner: &mut SuppPteInner) -> bool {
    match vm.swap.swap_out_frame(&vm.pool, kpage) {
        Some(index) => {
            inner.ty = PageType::Swap { index };
            true
        }
        None => {
            warn!("swap exhausted while evicting {:?}", kpage);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::VirtAddr;
    use crate::config::SECTORS_PER_PAGE;
    use crate::page::SupplPageTable;
    use crate::pagedir::PageDirectory;
    use crate::testing::{MemFile, TestBlockDevice};
    use crate::vm::Vm;

    fn machine(user_pages: usize, swap_slots: usize) -> Vm {
        Vm::new(
            user_pages,
            Arc::new(TestBlockDevice::new(swap_slots * SECTORS_PER_PAGE)),
        )
    }

    fn anonymous_pages(spt: &mut SupplPageTable, vm: &Vm, count: usize) -> Vec<VirtPageNum> {
        (0..count)
            .map(|i| {
                let upage = VirtAddr(0x10000 + i * PAGE_SIZE).floor();
                spt.set_zero(upage);
                assert!(spt.load_page(vm, upage));
                upage
            })
            .collect()
    }

    use crate::address::VirtPageNum;
    use alloc::vec::Vec;

    #[test]
    fn overcommit_evicts_through_swap_and_content_survives() {
        let vm = machine(2, 8);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));

        let pages = anonymous_pages(&mut spt, &vm, 2);
        // dirty both resident pages with distinct patterns
        for (i, upage) in pages.iter().enumerate() {
            let kpage = spt.get(*upage).unwrap().frame().unwrap();
            vm.pool.modify(kpage, |bytes| bytes.fill(i as u8 + 1));
            pd.set_dirty(*upage, true);
        }

        // a third page forces an eviction
        let third = VirtAddr(0x90000).floor();
        spt.set_zero(third);
        assert!(spt.load_page(&vm, third));
        assert_eq!(vm.frames.len(), 2);
        assert_eq!(spt.resident_pages(), 2);

        // exactly one of the two originals went to swap, dirty content intact
        let evicted: Vec<_> = pages
            .iter()
            .filter(|p| !spt.get(**p).unwrap().is_resident())
            .collect();
        assert_eq!(evicted.len(), 1);
        let victim = *evicted[0];
        let slot = spt.get(victim).unwrap().swap_slot().unwrap();
        assert!(!vm.swap.is_free(slot));

        // faulting the victim back round-trips the bytes and frees the slot
        assert!(spt.load_page(&vm, victim));
        assert!(vm.swap.is_free(slot));
        let kpage = spt.get(victim).unwrap().frame().unwrap();
        let tag = pages.iter().position(|p| *p == victim).unwrap() as u8 + 1;
        assert!(vm.pool.read(kpage, |bytes| bytes.iter().all(|b| *b == tag)));
    }

    #[test]
    fn clock_spares_the_recently_accessed_page() {
        let vm = machine(2, 8);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));
        let pages = anonymous_pages(&mut spt, &vm, 2);

        // loading sets no accessed bits; touch only the first page
        pd.set_accessed(pages[0], true);

        let third = VirtAddr(0x90000).floor();
        spt.set_zero(third);
        assert!(spt.load_page(&vm, third));

        #[cfg(not(feature = "fifo"))]
        {
            // second page had a clear accessed bit and was the victim
            assert!(spt.get(pages[0]).unwrap().is_resident());
            assert!(!spt.get(pages[1]).unwrap().is_resident());
        }
        #[cfg(feature = "fifo")]
        {
            // oldest first, accessed or not
            assert!(!spt.get(pages[0]).unwrap().is_resident());
            assert!(spt.get(pages[1]).unwrap().is_resident());
        }
    }

    #[test]
    fn clean_file_page_is_discarded_not_swapped() {
        let vm = machine(1, 8);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));

        let file = MemFile::new(alloc::vec![9u8; PAGE_SIZE]);
        let fpage = VirtAddr(0x10000).floor();
        spt.set_file(fpage, file, 0, PAGE_SIZE, 0, false, false);
        assert!(spt.load_page(&vm, fpage));

        let other = VirtAddr(0x20000).floor();
        spt.set_zero(other);
        assert!(spt.load_page(&vm, other));

        // the file page lost its frame but kept its file provenance
        let pte = spt.get(fpage).unwrap();
        assert!(!pte.is_resident());
        assert!(pte.swap_slot().is_none());
        // nothing was written to swap
        assert_eq!(vm.swap.slots(), 8);
        assert!((0..8).all(|i| vm.swap.is_free(i)));

        // and it re-reads from the file on the next fault
        assert!(spt.load_page(&vm, fpage));
        let kpage = spt.get(fpage).unwrap().frame().unwrap();
        assert!(vm.pool.read(kpage, |bytes| bytes.iter().all(|b| *b == 9)));
    }

    #[test]
    fn dirty_mmap_page_evicts_to_its_file() {
        let vm = machine(1, 8);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));

        let file = MemFile::new(alloc::vec![0u8; PAGE_SIZE]);
        let probe = file.clone();
        let fpage = VirtAddr(0x10000).floor();
        spt.set_file(fpage, file, 0, PAGE_SIZE, 0, true, true);
        assert!(spt.load_page(&vm, fpage));
        let kpage = spt.get(fpage).unwrap().frame().unwrap();
        vm.pool.modify(kpage, |bytes| bytes.fill(0x5a));
        pd.set_dirty(fpage, true);

        let other = VirtAddr(0x20000).floor();
        spt.set_zero(other);
        assert!(spt.load_page(&vm, other));

        // written back to the file, not to swap
        assert!(probe.snapshot().iter().all(|b| *b == 0x5a));
        assert!(spt.get(fpage).unwrap().swap_slot().is_none());
        assert!((0..8).all(|i| vm.swap.is_free(i)));
    }

    #[test]
    fn swap_exhaustion_leaves_the_victim_resident() {
        let vm = machine(1, 1);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));

        // fill the only swap slot
        vm.swap.swap_out(&[0u8; PAGE_SIZE]).unwrap();

        let first = VirtAddr(0x10000).floor();
        spt.set_zero(first);
        assert!(spt.load_page(&vm, first));
        let kpage = spt.get(first).unwrap().frame().unwrap();
        vm.pool.modify(kpage, |bytes| bytes.fill(3));
        pd.set_dirty(first, true);

        let second = VirtAddr(0x20000).floor();
        spt.set_zero(second);
        assert!(!spt.load_page(&vm, second));

        // the victim kept its frame, mapping and content
        let pte = spt.get(first).unwrap();
        assert_eq!(pte.frame(), Some(kpage));
        assert!(pd.translate(first).is_some());
        assert!(vm.pool.read(kpage, |bytes| bytes.iter().all(|b| *b == 3)));
    }

    #[test]
    fn free_and_remove_unlink_records() {
        let vm = machine(2, 4);
        let pd = Arc::new(PageDirectory::new());
        let mut spt = SupplPageTable::new(Arc::clone(&pd));
        let pages = anonymous_pages(&mut spt, &vm, 2);
        let k0 = spt.get(pages[0]).unwrap().frame().unwrap();
        let k1 = spt.get(pages[1]).unwrap().frame().unwrap();

        vm.frames.free(&vm, k0);
        assert_eq!(vm.frames.len(), 1);
        assert_eq!(vm.pool.in_use(), 1);

        vm.frames.remove(k1);
        assert_eq!(vm.frames.len(), 0);
        // remove leaves the frame allocated
        assert_eq!(vm.pool.in_use(), 1);
    }
}
