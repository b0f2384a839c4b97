//! Memory-mapped files.
//!
//! A mapping pins a reopened file handle (so closing the descriptor
//! does not tear the mapping down) and registers one file-backed,
//! writable supplemental entry per page of the file. Unmapping flushes
//! dirty pages back to the file (from the frame when resident, by way
//! of a temporary buffer when the page sits dirty in swap) and
//! releases every resource the mapping held. Process exit unmaps every
//! live mapping through the same path.

use crate::address::VirtAddr;
use crate::config::PAGE_SIZE;
use crate::file::File;
use crate::page::PageType;
use crate::process::Process;
use crate::vm::Vm;
use alloc::sync::Arc;
use log::warn;

/// One live mapping.
pub struct MmapRecord {
    pub(crate) id: usize,
    pub(crate) file: Arc<dyn File>,
    pub(crate) addr: VirtAddr,
    pub(crate) size: usize,
}

/// Why an mmap request was refused. No process state is mutated when
/// any of these comes back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmapError {
    NullAddress,
    Misaligned,
    NotUserSpace,
    BadFd,
    EmptyFile,
    Overlap,
}

impl Process {
    /// Maps the file open as descriptor `fd` at `addr`.
    ///
    /// The same file may be mapped twice at distinct addresses; each
    /// mapping reopens the file and the two are independent.
    ///
    /// # Return
    /// The mapping id, allocated monotonically from zero per process.
    pub fn mmap(&mut self, vm: &Vm, fd: usize, addr: VirtAddr) -> Result<usize, MmapError> {
        let _fs = vm.fs_guard();
        if addr.0 == 0 {
            return Err(MmapError::NullAddress);
        }
        if !addr.aligned() {
            return Err(MmapError::Misaligned);
        }
        if !addr.is_user() {
            return Err(MmapError::NotUserSpace);
        }
        let file = self.file(fd).ok_or(MmapError::BadFd)?;
        // Hold an independent reference, immune to a later close(fd).
        let file = file.reopen();
        let size = file.length();
        if size == 0 {
            return Err(MmapError::EmptyFile);
        }

        let mut ofs = 0;
        while ofs < size {
            let page = VirtAddr(addr.0 + ofs);
            if !page.is_user() || self.spt.get(page.floor()).is_some() {
                // Undo every entry registered so far.
                for done in (0..ofs).step_by(PAGE_SIZE) {
                    self.spt.clear_page(vm, VirtAddr(addr.0 + done).floor());
                }
                return Err(MmapError::Overlap);
            }
            let read_bytes = usize::min(PAGE_SIZE, size - ofs);
            self.spt.set_file(
                page.floor(),
                Arc::clone(&file),
                ofs,
                read_bytes,
                PAGE_SIZE - read_bytes,
                true,
                true,
            );
            ofs += PAGE_SIZE;
        }

        let id = self.mapid_next;
        self.mapid_next += 1;
        self.mmaps.push(MmapRecord {
            id,
            file,
            addr,
            size,
        });
        Ok(id)
    }

    /// Unmaps mapping `id`, flushing dirty pages to the file. Silently
    /// tolerates an unknown id.
    pub fn munmap(&mut self, vm: &Vm, id: usize) {
        if let Some(idx) = self.mmaps.iter().position(|m| m.id == id) {
            let record = self.mmaps.remove(idx);
            self.unmap_record(vm, record);
        }
    }

    /// Mappings currently live.
    pub fn mmap_count(&self) -> usize {
        self.mmaps.len()
    }

    pub(crate) fn munmap_all(&mut self, vm: &Vm) {
        while let Some(record) = self.mmaps.pop() {
            self.unmap_record(vm, record);
        }
    }

    fn unmap_record(&mut self, vm: &Vm, record: MmapRecord) {
        let _fs = vm.fs_guard();
        let mut ofs = 0;
        while ofs < record.size {
            let upage = VirtAddr(record.addr.0 + ofs).floor();
            if let Some(pte) = self.spt.get(upage).map(Arc::clone) {
                let dirty = pte.refresh_dirty(&vm.pool);
                if let Some(kpage) = pte.frame() {
                    if dirty {
                        write_back(&record, vm.pool.read(kpage, |bytes| {
                            record.file.write_at(ofs, bytes)
                        }), ofs);
                    }
                    vm.frames.remove(kpage);
                    vm.pool.dealloc(kpage);
                } else if let PageType::Swap { index } = pte.lock_inner().ty {
                    if dirty {
                        // The slot's content has never reached the file;
                        // pull it into a scratch buffer and flush from
                        // there. Scratch memory is heap, never a user
                        // frame: disk paths must not recurse into the
                        // pool.
                        let mut scratch = alloc::vec![0u8; PAGE_SIZE];
                        if vm.swap.swap_in(&mut scratch, index) {
                            write_back(&record, record.file.write_at(ofs, &scratch), ofs);
                        }
                    } else {
                        vm.swap.remove(index);
                    }
                }
                self.pagedir.clear(upage);
                self.spt.remove(upage);
            }
            ofs += PAGE_SIZE;
        }
        // The reopened handle closes when the record drops here.
    }
}

fn write_back(record: &MmapRecord, written: usize, ofs: usize) {
    let expected = usize::min(PAGE_SIZE, record.size - ofs);
    if written < expected {
        warn!(
            "unmap write-back at ofs {} wrote {} of {} bytes",
            ofs, written, expected
        );
    }
}
