//! Constants used across the memory subsystem.

/// 4096byte == 4KiB
pub const PAGE_SIZE: usize = 0x1000;
/// Bit width of intra-page offset
pub const PAGE_SIZE_BITS: usize = 0xc;

/// 1 sector == 512byte
///
/// The swap device is addressed in sectors of this size; a swap slot is
/// `SECTORS_PER_PAGE` contiguous sectors.
pub const SECTOR_SIZE: usize = 512;
/// Sectors occupied by one page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// First address above user space.
///
/// User virtual addresses live in `[0, PHYS_BASE)`; everything at or
/// above this address belongs to the kernel.
pub const PHYS_BASE: usize = 0xc000_0000;

/// Maximum size the user stack may grow to, measured down from
/// `PHYS_BASE`. 8MiB.
pub const STACK_LIMIT: usize = 0x80_0000;

/// Slack below the saved stack pointer that still counts as a stack
/// access. Covers the 32-byte probe of a PUSHA-style instruction that
/// decrements the stack pointer after the access.
pub const STACK_PROBE_SLACK: usize = 32;
