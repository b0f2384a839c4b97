//! Lazy loading of executable images.
//!
//! Parses the ELF program headers and registers one file-backed
//! supplemental entry per page of each LOAD segment; no frame is
//! touched until the first access faults the page in. The stack gets a
//! single zero-fill page just under the top of user space and grows on
//! demand from there. The executable is held write-denied for the
//! process's lifetime.

use crate::address::{StepByOne, VirtAddr};
use crate::config::{PAGE_SIZE, PHYS_BASE};
use crate::file::File;
use crate::process::Process;
use crate::vm::Vm;
use alloc::sync::Arc;
use log::debug;

/// Registers `file`'s LOAD segments and the initial stack page with
/// `process`, leaving every page to be faulted in on first touch.
///
/// # Return
/// Conditional branching.
/// - The image's entry point
/// - If the image is not a loadable ELF => `None`; the process's
///   address space is then in no state to run and the caller should
///   discard it.
pub fn load_elf(vm: &Vm, process: &mut Process, file: Arc<dyn File>) -> Option<usize> {
    let _fs = vm.fs_guard();
    let exec = file.reopen();
    let len = exec.length();
    if len == 0 {
        return None;
    }
    let mut image = alloc::vec![0u8; len];
    if exec.read_at(0, &mut image) != len {
        return None;
    }

    let elf = xmas_elf::ElfFile::new(&image).ok()?;
    let magic = elf.header.pt1.magic;
    if magic != [0x7f, 0x45, 0x4c, 0x46] {
        return None;
    }
    let ph_count = elf.header.pt2.ph_count();
    for i in 0..ph_count {
        let ph = elf.program_header(i).ok()?;
        if ph.get_type().ok()? != xmas_elf::program::Type::Load {
            continue;
        }
        if ph.mem_size() < ph.file_size() {
            return None;
        }
        debug!(
            "segment at {:#x}: {:#x} bytes from file, {:#x} in memory",
            ph.virtual_addr(),
            ph.file_size(),
            ph.mem_size()
        );
        register_segment(
            process,
            &exec,
            ph.offset() as usize,
            VirtAddr(ph.virtual_addr() as usize),
            ph.file_size() as usize,
            ph.mem_size() as usize,
            ph.flags().is_write(),
        );
    }

    // One zero-fill page at the top of user space; further stack pages
    // arrive through the growth policy.
    process
        .spt_mut()
        .set_zero(VirtAddr(PHYS_BASE - PAGE_SIZE).floor());
    process.set_esp(PHYS_BASE);

    exec.deny_write();
    process.exec_file = Some(exec);

    Some(elf.header.pt2.entry_point() as usize)
}

/// Splits one LOAD segment into per-page (read_bytes, zero_bytes)
/// entries. The segment need not start page-aligned; the page-granular
/// mapping absorbs the intra-page offset.
fn register_segment(
    process: &mut Process,
    file: &Arc<dyn File>,
    ofs: usize,
    vaddr: VirtAddr,
    file_size: usize,
    mem_size: usize,
    writable: bool,
) {
    let page_ofs = vaddr.page_offset();
    let mut upage = VirtAddr(vaddr.0 - page_ofs).floor();
    let mut file_ofs = ofs - page_ofs;
    let mut read_bytes = page_ofs + file_size;
    let mut zero_bytes = {
        let span = page_ofs + mem_size;
        (span + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE - read_bytes
    };
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = usize::min(read_bytes, PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;
        process.spt_mut().set_file(
            upage,
            Arc::clone(file),
            file_ofs,
            page_read,
            page_zero,
            writable,
            false,
        );
        read_bytes -= page_read;
        zero_bytes -= page_zero;
        file_ofs += PAGE_SIZE;
        upage.step();
    }
}
