//! The process-side view of the memory subsystem: the page directory,
//! the supplemental page table, the descriptor table and the mmap list,
//! plus the access path user loads and stores take.
//!
//! The access path stands in for the MMU: a present mapping gets its
//! accessed (and, for stores, dirty) bit driven; a missing one faults
//! into the resolver; an unservable fault kills the process with exit
//! code -1.

use crate::address::VirtAddr;
use crate::file::File;
use crate::mmap::MmapRecord;
use crate::page::SupplPageTable;
use crate::pagedir::PageDirectory;
use crate::vm::Vm;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::info;

pub struct Process {
    name: String,
    pub(crate) pagedir: Arc<PageDirectory>,
    pub(crate) spt: SupplPageTable,
    /// File descriptor table
    ///
    /// ## Option
    /// Whether the file descriptor is currently free or not.
    /// - Some => occupied
    /// - None => free
    fd_table: Vec<Option<Arc<dyn File>>>,
    pub(crate) mmaps: Vec<MmapRecord>,
    /// Next mapping id; monotonically increasing from zero.
    pub(crate) mapid_next: usize,
    /// The running executable's image, held write-denied until exit.
    pub(crate) exec_file: Option<Arc<dyn File>>,
    /// Stack pointer saved on kernel entry; consulted by stack growth.
    esp: usize,
    exit_code: Option<i32>,
}

impl Process {
    pub fn new(name: &str) -> Self {
        let pagedir = Arc::new(PageDirectory::new());
        let spt = SupplPageTable::new(Arc::clone(&pagedir));
        Self {
            name: String::from(name),
            pagedir,
            spt,
            fd_table: Vec::new(),
            mmaps: Vec::new(),
            mapid_next: 0,
            exec_file: None,
            esp: crate::config::PHYS_BASE,
            exit_code: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    pub fn spt(&self) -> &SupplPageTable {
        &self.spt
    }

    pub fn spt_mut(&mut self) -> &mut SupplPageTable {
        &mut self.spt
    }

    /// Search `self.fd_table` from the beginning to find a free slot.
    ///
    /// # Return
    /// The descriptor now referring to `file`.
    pub fn add_file(&mut self, file: Arc<dyn File>) -> usize {
        if let Some(fd) = (0..self.fd_table.len()).find(|fd| self.fd_table[*fd].is_none()) {
            self.fd_table[fd] = Some(file);
            fd
        } else {
            self.fd_table.push(Some(file));
            self.fd_table.len() - 1
        }
    }

    /// The file open as descriptor `fd`, if any.
    pub fn file(&self, fd: usize) -> Option<Arc<dyn File>> {
        self.fd_table.get(fd).and_then(|f| f.clone())
    }

    /// Closes descriptor `fd`. Mappings made from it are unaffected;
    /// they hold their own reopened handles.
    pub fn close_file(&mut self, fd: usize) {
        if let Some(slot) = self.fd_table.get_mut(fd) {
            *slot = None;
        }
    }

    pub fn esp(&self) -> usize {
        self.esp
    }

    /// Records the user stack pointer as saved on kernel entry.
    pub fn set_esp(&mut self, esp: usize) {
        self.esp = esp;
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_alive(&self) -> bool {
        self.exit_code.is_none()
    }

    /// Reads one byte of user memory, faulting the page in if needed.
    ///
    /// # Return
    /// `None` if the address cannot be served; the process has then
    /// exited with code -1.
    pub fn read_byte(&mut self, vm: &Vm, addr: VirtAddr) -> Option<u8> {
        if !self.prepare_access(vm, addr, false) {
            return None;
        }
        let upage = addr.floor();
        self.pagedir.mark_access(upage, false);
        let pte = self.pagedir.translate(upage)?;
        Some(vm.pool.read(pte.ppn(), |bytes| bytes[addr.page_offset()]))
    }

    /// Writes one byte of user memory, faulting the page in if needed.
    ///
    /// # Return
    /// `false` if the address cannot be served or the page is mapped
    /// read-only; the process has then exited with code -1.
    pub fn write_byte(&mut self, vm: &Vm, addr: VirtAddr, value: u8) -> bool {
        if !self.prepare_access(vm, addr, true) {
            return false;
        }
        let upage = addr.floor();
        self.pagedir.mark_access(upage, true);
        let pte = match self.pagedir.translate(upage) {
            Some(pte) => pte,
            None => return false,
        };
        vm.pool
            .modify(pte.ppn(), |bytes| bytes[addr.page_offset()] = value);
        true
    }

    /// Reads `buf.len()` bytes starting at `addr`, one probe per byte
    /// the way the fault machinery sees real accesses.
    pub fn read_bytes(&mut self, vm: &Vm, addr: VirtAddr, buf: &mut [u8]) -> bool {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.read_byte(vm, VirtAddr(addr.0 + i)) {
                Some(b) => *slot = b,
                None => return false,
            }
        }
        true
    }

    /// Writes `buf` starting at `addr`, one probe per byte.
    pub fn write_bytes(&mut self, vm: &Vm, addr: VirtAddr, buf: &[u8]) -> bool {
        for (i, b) in buf.iter().enumerate() {
            if !self.write_byte(vm, VirtAddr(addr.0 + i), *b) {
                return false;
            }
        }
        true
    }

    /// Makes `addr` present and, for a store, writable, resolving a
    /// fault if the page is missing. Kills the process on an
    /// unservable access.
    fn prepare_access(&mut self, vm: &Vm, addr: VirtAddr, write: bool) -> bool {
        if !self.is_alive() {
            return false;
        }
        if !addr.is_user() {
            self.exit(vm, -1);
            return false;
        }
        let upage = addr.floor();
        // The instruction retries after a resolved fault, so a store
        // into a freshly loaded read-only page comes around again as a
        // rights violation.
        loop {
            if let Some(pte) = self.pagedir.translate(upage) {
                if write && !pte.writable() {
                    self.exit(vm, -1);
                    return false;
                }
                return true;
            }
            if !self.handle_fault(vm, addr) {
                self.exit(vm, -1);
                return false;
            }
        }
    }

    /// Tears the process's memory down: unmap every mapping (flushing
    /// dirty pages), release the supplemental table's swap slots and
    /// frame records, re-allow writes to the executable, then destroy
    /// the page directory, which frees the frames themselves.
    pub fn exit(&mut self, vm: &Vm, code: i32) {
        if self.exit_code.is_some() {
            return;
        }
        self.exit_code = Some(code);
        info!("{}: exit({})", self.name, code);
        self.munmap_all(vm);
        self.spt.destroy(vm);
        if let Some(exec) = self.exec_file.take() {
            exec.allow_write();
        }
        self.fd_table.clear();
        self.pagedir.destroy(&vm.pool);
    }
}
