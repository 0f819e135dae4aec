//! Kernel heap behind the Rust global allocator.
//!
//! A contiguous run of low-memory frames, reached through the physical
//! window (already mapped by the boot stub), handed to
//! `linked_list_allocator`. Initialized immediately after the PMM so the
//! address-space layer above may use `alloc` collections. Host builds use
//! the system allocator instead; see `lib.rs`.

use crate::error::KernelResult;

/// Default kernel heap size.
pub const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
mod imp {
    use linked_list_allocator::LockedHeap;

    use super::super::{phys_to_virt, AllocFlags, PAGE_SIZE, PMM};
    use super::KERNEL_HEAP_SIZE;
    use crate::error::KernelResult;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    /// Carve the heap out of the kernel-owned physical range and arm the
    /// global allocator. Called once during boot.
    pub fn init() -> KernelResult<()> {
        let size = KERNEL_HEAP_SIZE.next_multiple_of(PAGE_SIZE);
        let phys = PMM.lock().allocate_pages(size, AllocFlags::KERNEL)?;
        // SAFETY: the run was just allocated for exclusive heap use and
        // is reachable through the boot-mapped physical window.
        unsafe {
            ALLOCATOR.lock().init(phys_to_virt(phys), size);
        }
        log::info!("heap: {} KiB at {:#x}", size / 1024, phys.as_usize());
        Ok(())
    }

    /// Heap allocation failure in a no_std kernel is unrecoverable.
    #[alloc_error_handler]
    fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
        panic!("kernel heap exhausted: {:?}", layout);
    }
}

#[cfg(target_os = "none")]
pub use imp::init;

/// Hosted builds run on the system allocator; nothing to arm.
#[cfg(not(target_os = "none"))]
pub fn init() -> KernelResult<()> {
    Ok(())
}
