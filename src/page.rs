//! Implementation of the supplemental page table.
//!
//! The hardware table only knows present pages. The supplemental table
//! remembers, for every virtual page a process owns, where its content
//! comes from when it is not present: nowhere (zero fill), a span of a
//! file, or a swap slot. The fault path reads this map to materialize a
//! page; the eviction path rewrites it when a page leaves memory.

use crate::address::{PhysPageNum, VirtPageNum};
use crate::config::PAGE_SIZE;
use crate::file::File;
use crate::frame_allocator::UserPool;
use crate::pagedir::PageDirectory;
use crate::vm::Vm;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

/// Where a non-present page's content comes from.
#[derive(Clone)]
pub enum PageType {
    /// Page materializes as all zero bytes on first touch.
    Zero,
    /// Page content from the file system.
    ///
    /// `read_bytes` from `ofs` fill the head of the page and
    /// `zero_bytes` of zeros fill the tail; the two always sum to a
    /// whole page.
    File {
        file: Arc<dyn File>,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        /// Dirty evictions of a mapped-file page go back to the file,
        /// never to swap.
        mmap: bool,
    },
    /// Page content sits in swap slot `index`.
    Swap { index: usize },
}

pub(crate) struct SuppPteInner {
    /// Current frame; `None` while the page is not resident.
    pub(crate) kpage: Option<PhysPageNum>,
    /// Sticky dirty flag, accumulated from the hardware bits every time
    /// the mapping is torn down.
    pub(crate) dirty: bool,
    pub(crate) ty: PageType,
}

/// One supplemental page table entry.
///
/// Shared between the owning table and the frame table (which keeps a
/// tenant reference per frame), so the mutable half sits behind a lock.
pub struct SuppPte {
    upage: VirtPageNum,
    pagedir: Arc<PageDirectory>,
    inner: Mutex<SuppPteInner>,
}

impl SuppPte {
    fn new(upage: VirtPageNum, pagedir: Arc<PageDirectory>, ty: PageType) -> Self {
        Self {
            upage,
            pagedir,
            inner: Mutex::new(SuppPteInner {
                kpage: None,
                dirty: false,
                ty,
            }),
        }
    }

    pub fn upage(&self) -> VirtPageNum {
        self.upage
    }

    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    /// Current frame, or `None` while not resident.
    pub fn frame(&self) -> Option<PhysPageNum> {
        self.inner.lock().kpage
    }

    pub fn is_resident(&self) -> bool {
        self.frame().is_some()
    }

    /// Swap slot holding the page, if its provenance is swap.
    pub fn swap_slot(&self) -> Option<usize> {
        match self.inner.lock().ty {
            PageType::Swap { index } => Some(index),
            _ => None,
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, SuppPteInner> {
        self.inner.lock()
    }

    /// Folds the hardware dirty bits of both aliases of the page (the
    /// user mapping and the frame's kernel alias) into the sticky flag
    /// and returns the union.
    pub fn refresh_dirty(&self, pool: &UserPool) -> bool {
        let mut inner = self.inner.lock();
        let kpage = match inner.kpage {
            Some(kpage) => kpage,
            None => return inner.dirty,
        };
        inner.dirty =
            inner.dirty || self.pagedir.is_dirty(self.upage) || pool.kernel_dirty(kpage);
        inner.dirty
    }

    /// Write permission the hardware mapping gets when the page is
    /// loaded: file pages carry their segment's flag, everything else
    /// is writable.
    pub(crate) fn writable(&self) -> bool {
        match self.inner.lock().ty {
            PageType::File { writable, .. } => writable,
            _ => true,
        }
    }
}

/// Per-process map from virtual page to provenance descriptor.
///
/// Owned and driven by the process's own thread; cross-process access
/// (eviction) goes through the shared entries, never through the map.
pub struct SupplPageTable {
    pagedir: Arc<PageDirectory>,
    map: BTreeMap<VirtPageNum, Arc<SuppPte>>,
}

impl SupplPageTable {
    pub fn new(pagedir: Arc<PageDirectory>) -> Self {
        Self {
            pagedir,
            map: BTreeMap::new(),
        }
    }

    /// Registers a zero-fill page at `upage`.
    ///
    /// Note that this does not involve actual frame allocation.
    ///
    /// # Panic
    ///
    /// Panics if `upage` already has an entry; callers check first.
    pub fn set_zero(&mut self, upage: VirtPageNum) {
        let pte = Arc::new(SuppPte::new(
            upage,
            Arc::clone(&self.pagedir),
            PageType::Zero,
        ));
        assert!(
            self.map.insert(upage, pte).is_none(),
            "page {:?} registered twice",
            upage
        );
    }

    /// Registers a file-backed page at `upage`.
    ///
    /// Note that this does not involve actual frame allocation.
    ///
    /// # Panic
    ///
    /// Panics if `upage` already has an entry; callers check first.
    #[allow(clippy::too_many_arguments)]
    pub fn set_file(
        &mut self,
        upage: VirtPageNum,
        file: Arc<dyn File>,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        mmap: bool,
    ) {
        assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        let pte = Arc::new(SuppPte::new(
            upage,
            Arc::clone(&self.pagedir),
            PageType::File {
                file,
                ofs,
                read_bytes,
                zero_bytes,
                writable,
                mmap,
            },
        ));
        assert!(
            self.map.insert(upage, pte).is_none(),
            "page {:?} registered twice",
            upage
        );
    }

    /// Returns the entry for `upage`, or `None` if the process never
    /// registered that page.
    pub fn get(&self, upage: VirtPageNum) -> Option<&Arc<SuppPte>> {
        self.map.get(&upage)
    }

    /// Loads `upage` into memory with frame allocation: the fault path.
    ///
    /// # Return
    /// `false` when there is no entry, the page is already resident (a
    /// stale or re-entered fault), or memory and swap are both
    /// exhausted.
    pub fn load_page(&self, vm: &Vm, upage: VirtPageNum) -> bool {
        let pte = match self.get(upage) {
            Some(pte) => Arc::clone(pte),
            None => return false,
        };
        if pte.inner.lock().kpage.is_some() {
            return false;
        }

        // Obtain a frame, evicting someone else's page if need be.
        let kpage = match vm.frames.alloc(vm, Arc::clone(&pte)) {
            Some(kpage) => kpage,
            None => return false,
        };

        // Load page content for each page type.
        let ty = pte.inner.lock().ty.clone();
        let loaded = match ty {
            PageType::Zero => {
                vm.pool.modify(kpage, |bytes| bytes.fill(0));
                true
            }
            PageType::File {
                file,
                ofs,
                read_bytes,
                zero_bytes,
                ..
            } => {
                let _fs = vm.fs_guard();
                file.seek(ofs);
                vm.pool.modify(kpage, |bytes| {
                    if file.read(&mut bytes[..read_bytes]) != read_bytes {
                        return false;
                    }
                    bytes[read_bytes..read_bytes + zero_bytes].fill(0);
                    true
                })
            }
            PageType::Swap { index } => vm.pool.modify(kpage, |bytes| vm.swap.swap_in(bytes, index)),
        };
        if !loaded {
            vm.frames.free(vm, kpage);
            return false;
        }

        // Install upage to kpage.
        if !pte.pagedir.install(upage, kpage, pte.writable()) {
            vm.frames.free(vm, kpage);
            return false;
        }

        // Loading itself must not count as a store.
        vm.pool.set_kernel_dirty(kpage, false);
        pte.inner.lock().kpage = Some(kpage);
        true
    }

    /// Marks `upage` "not present" and releases its entry: a resident
    /// page loses its frame-table record (the frame itself stays with
    /// the page directory), a swapped page gives its slot back.
    pub fn clear_page(&mut self, vm: &Vm, upage: VirtPageNum) {
        self.pagedir.clear(upage);
        if let Some(pte) = self.map.remove(&upage) {
            release_entry(vm, &pte);
        }
    }

    /// Drops the entry for `upage` without releasing anything. The
    /// caller has already dealt with the frame or slot.
    pub(crate) fn remove(&mut self, upage: VirtPageNum) -> Option<Arc<SuppPte>> {
        self.map.remove(&upage)
    }

    /// Releases every entry. Frame-table records and swap slots go now;
    /// the frames themselves are freed when the page directory is
    /// destroyed afterwards.
    pub fn destroy(&mut self, vm: &Vm) {
        for (_, pte) in core::mem::take(&mut self.map) {
            release_entry(vm, &pte);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries currently resident in memory.
    pub fn resident_pages(&self) -> usize {
        self.map.values().filter(|pte| pte.is_resident()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SuppPte>> {
        self.map.values()
    }
}

/// Releases one entry: a resident page drops its frame-table record
/// (but not the frame), a swapped page frees its slot.
///
/// The entry's lock is dropped before the frame table's is taken;
/// eviction acquires the two the other way around.
fn release_entry(vm: &Vm, pte: &SuppPte) {
    let (kpage, slot) = {
        let inner = pte.inner.lock();
        match (inner.kpage, &inner.ty) {
            (Some(kpage), _) => (Some(kpage), None),
            (None, PageType::Swap { index }) => (None, Some(*index)),
            _ => (None, None),
        }
    };
    if let Some(kpage) = kpage {
        vm.frames.remove(kpage);
    } else if let Some(slot) = slot {
        vm.swap.remove(slot);
    }
}
