//! Host stand-ins for the privileged primitives.
//!
//! Used when the kernel library is compiled for a hosted target (unit
//! tests, miri). Interrupt control collapses to bookkeeping and the TLB
//! operations to no-ops; page-table state is plain memory on the host, so
//! nothing needs invalidating.

extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;

use crate::mm::{PhysicalAddress, VirtualAddress};

std::thread_local! {
    // Per-thread so parallel unit tests cannot observe each other's
    // critical sections.
    static IRQS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

static PAGE_DIRECTORY: AtomicUsize = AtomicUsize::new(0);

/// Saved interrupt-enable state, returned by [`irq_save_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub bool);

pub fn init() {}

pub fn irq_save_disable() -> IrqState {
    IrqState(IRQS_ENABLED.with(|state| state.replace(false)))
}

pub fn irq_restore(state: IrqState) {
    IRQS_ENABLED.with(|s| s.set(state.0));
}

pub fn irqs_enabled() -> bool {
    IRQS_ENABLED.with(|state| state.get())
}

pub fn halt() {}

pub fn idle_loop() -> ! {
    unreachable!("idle_loop is only entered on bare metal");
}

pub fn invlpg(_virt: VirtualAddress) {}

pub fn tlb_flush_all() {}

pub fn load_page_directory(root: PhysicalAddress) {
    PAGE_DIRECTORY.store(root.as_usize(), Ordering::Release);
}

pub fn current_page_directory() -> PhysicalAddress {
    PhysicalAddress::new(PAGE_DIRECTORY.load(Ordering::Acquire))
}

pub fn read_fault_address() -> VirtualAddress {
    VirtualAddress::new(0)
}
