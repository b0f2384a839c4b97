//! Page-fault resolution and the stack growth policy.

use crate::address::VirtAddr;
use crate::config::{PHYS_BASE, STACK_LIMIT, STACK_PROBE_SLACK};
use crate::process::Process;
use crate::vm::Vm;

impl Process {
    /// Resolves a not-present fault at `addr`.
    ///
    /// A registered page is loaded through its supplemental entry; an
    /// unregistered address that qualifies as stack growth gets a fresh
    /// zero-fill page first. (A write through a present read-only
    /// mapping never reaches here; the access path refuses it
    /// outright.)
    ///
    /// # Return
    /// `false` when the fault cannot be served and the process must die
    /// with exit code -1: a bad address, or memory and swap both
    /// exhausted.
    pub fn handle_fault(&mut self, vm: &Vm, addr: VirtAddr) -> bool {
        if !addr.is_user() {
            return false;
        }
        let upage = addr.floor();
        if self.spt.get(upage).is_some() {
            return self.spt.load_page(vm, upage);
        }
        if grows_stack(addr, self.esp()) {
            self.spt.set_zero(upage);
            return self.spt.load_page(vm, upage);
        }
        false
    }
}

/// Does a fault at `addr` extend the user stack?
///
/// It does iff `addr` is in user space, within `STACK_PROBE_SLACK`
/// bytes below the saved stack pointer or above it, and no deeper than
/// `STACK_LIMIT` below the top of user space. Repeated faults walk the
/// stack down one page at a time.
pub(crate) fn grows_stack(addr: VirtAddr, esp: usize) -> bool {
    addr.is_user()
        && addr.0 + STACK_PROBE_SLACK >= esp
        && addr.0 >= PHYS_BASE - STACK_LIMIT
}
