//! In-memory devices backing the unit tests.

use crate::block_dev::BlockDevice;
use crate::config::SECTOR_SIZE;
use crate::file::File;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// A sector device over a plain byte vector.
pub struct TestBlockDevice {
    sectors: Mutex<Vec<u8>>,
    num_blocks: usize,
}

impl TestBlockDevice {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            sectors: Mutex::new(alloc::vec![0u8; num_blocks * SECTOR_SIZE]),
            num_blocks,
        }
    }
}

impl BlockDevice for TestBlockDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let sectors = self.sectors.lock();
        let start = block_id * SECTOR_SIZE;
        buf.copy_from_slice(&sectors[start..start + buf.len()]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut sectors = self.sectors.lock();
        let start = block_id * SECTOR_SIZE;
        sectors[start..start + buf.len()].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

/// A file over a shared byte vector. Reopened handles share contents
/// and the write-deny count but carry their own cursor. Writes never
/// grow the file.
pub struct MemFile {
    contents: Arc<Mutex<Vec<u8>>>,
    deny: Arc<AtomicUsize>,
    cursor: Mutex<usize>,
}

impl MemFile {
    pub fn new(contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            contents: Arc::new(Mutex::new(contents)),
            deny: Arc::new(AtomicUsize::new(0)),
            cursor: Mutex::new(0),
        })
    }

    /// A copy of the current on-disk contents, for assertions.
    pub fn snapshot(&self) -> Vec<u8> {
        self.contents.lock().clone()
    }
}

impl File for MemFile {
    fn length(&self) -> usize {
        self.contents.lock().len()
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut cursor = self.cursor.lock();
        let n = self.read_at(*cursor, buf);
        *cursor += n;
        n
    }

    fn write(&self, buf: &[u8]) -> usize {
        let mut cursor = self.cursor.lock();
        let n = self.write_at(*cursor, buf);
        *cursor += n;
        n
    }

    fn read_at(&self, ofs: usize, buf: &mut [u8]) -> usize {
        let contents = self.contents.lock();
        if ofs >= contents.len() {
            return 0;
        }
        let n = usize::min(buf.len(), contents.len() - ofs);
        buf[..n].copy_from_slice(&contents[ofs..ofs + n]);
        n
    }

    fn write_at(&self, ofs: usize, buf: &[u8]) -> usize {
        if self.deny.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        let mut contents = self.contents.lock();
        if ofs >= contents.len() {
            return 0;
        }
        let n = usize::min(buf.len(), contents.len() - ofs);
        contents[ofs..ofs + n].copy_from_slice(&buf[..n]);
        n
    }

    fn seek(&self, ofs: usize) {
        *self.cursor.lock() = ofs;
    }

    fn reopen(&self) -> Arc<dyn File> {
        Arc::new(MemFile {
            contents: Arc::clone(&self.contents),
            deny: Arc::clone(&self.deny),
            cursor: Mutex::new(0),
        })
    }

    fn deny_write(&self) {
        self.deny.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(&self) {
        self.deny.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds a minimal 64-bit little-endian ELF image: one program header
/// per segment, segment data packed after the headers.
///
/// Each segment is (virtual address, file bytes, memory size, writable).
pub fn minimal_elf(entry: u64, segments: &[(u64, Vec<u8>, u64, bool)]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;
    let phnum = segments.len();
    let mut image = Vec::new();

    // e_ident
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0u8; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
    image.extend_from_slice(&0x3eu16.to_le_bytes()); // e_machine = x86-64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry.to_le_bytes()); // e_entry
    image.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes()); // e_phentsize
    image.extend_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHSIZE);

    let mut data_ofs = EHSIZE + PHENTSIZE * phnum;
    for (vaddr, data, memsz, writable) in segments {
        let flags = if *writable { 4 | 2 } else { 4 | 1 };
        image.extend_from_slice(&1u32.to_le_bytes()); // p_type = LOAD
        image.extend_from_slice(&(flags as u32).to_le_bytes()); // p_flags
        image.extend_from_slice(&(data_ofs as u64).to_le_bytes()); // p_offset
        image.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
        image.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        image.extend_from_slice(&(data.len() as u64).to_le_bytes()); // p_filesz
        image.extend_from_slice(&memsz.to_le_bytes()); // p_memsz
        image.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        data_ofs += data.len();
    }
    for (_, data, _, _) in segments {
        image.extend_from_slice(data);
    }
    image
}
