use core::any::Any;

/// The swap device, addressed in `SECTOR_SIZE`-byte sectors.
pub trait BlockDevice: Send + Sync + Any {
    /// Reads the sector number `block_id` from the device into the buffer `buf`.
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Writes the data in buffer `buf` to the sector numbered by `block_id`.
    fn write_block(&self, block_id: usize, buf: &[u8]);
    /// Total number of sectors on the device.
    fn num_blocks(&self) -> usize;
}
