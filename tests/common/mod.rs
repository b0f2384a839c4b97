//! Host-side devices the end-to-end tests run against.

use easy_vm::{BlockDevice, File, SECTOR_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A sector device over a byte vector.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    num_blocks: usize,
}

impl MemDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; num_blocks * SECTOR_SIZE]),
            num_blocks,
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let sectors = self.sectors.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        buf.copy_from_slice(&sectors[start..start + buf.len()]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        sectors[start..start + buf.len()].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

/// A file over a shared byte vector: reopened handles share contents
/// and the deny count, each with its own cursor. Writes never grow the
/// file.
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

    pub fn snapshot(&self) -> Vec<u8> {
        self.contents.lock().unwrap().clone()
    }
}

impl File for MemFile {
    fn length(&self) -> usize {
        self.contents.lock().unwrap().len()
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut cursor = self.cursor.lock().unwrap();
        let n = self.read_at(*cursor, buf);
        *cursor += n;
        n
    }

    fn write(&self, buf: &[u8]) -> usize {
        let mut cursor = self.cursor.lock().unwrap();
        let n = self.write_at(*cursor, buf);
        *cursor += n;
        n
    }

    fn read_at(&self, ofs: usize, buf: &mut [u8]) -> usize {
        let contents = self.contents.lock().unwrap();
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
        let mut contents = self.contents.lock().unwrap();
        if ofs >= contents.len() {
            return 0;
        }
        let n = usize::min(buf.len(), contents.len() - ofs);
        contents[ofs..ofs + n].copy_from_slice(&buf[..n]);
        n
    }

    fn seek(&self, ofs: usize) {
        *self.cursor.lock().unwrap() = ofs;
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
