//! The machine-wide memory context.
//!
//! The frame table, the user pool, the swap table and the file-system
//! lock have init-once lifecycles; bundling them in one context that is
//! passed by reference keeps the subsystem free of global state, so a
//! host can stand up several independent machines side by side.
//!
//! Lock acquisition order, outermost first: file-system lock, frame
//! table, user pool, swap table.

use crate::block_dev::BlockDevice;
use crate::frame_allocator::UserPool;
use crate::frame_table::FrameTable;
use crate::swap::SwapTable;
use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

pub struct Vm {
    /// Physical frames available to user pages.
    pub pool: UserPool,
    /// Who lives in which frame, plus the replacement policy.
    pub frames: FrameTable,
    /// Swap slot allocator over the swap device.
    pub swap: SwapTable,
    /// Serializes every call into the file system.
    fs_lock: Mutex<()>,
}

impl Vm {
    /// Stands up a machine with `user_pages` frames of user memory and
    /// the given swap device.
    ///
    /// # Panic
    ///
    /// Panics if the swap device is smaller than one page, as for
    /// [`SwapTable::new`].
    pub fn new(user_pages: usize, swap_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            pool: UserPool::new(user_pages),
            frames: FrameTable::new(),
            swap: SwapTable::new(swap_device),
            fs_lock: Mutex::new(()),
        }
    }

    /// Holds the global file-system lock for the guard's lifetime.
    pub fn fs_guard(&self) -> MutexGuard<'_, ()> {
        self.fs_lock.lock()
    }
}
