//! Memory management.
//!
//! Layering, bottom up: [`pmm`] owns physical frames, [`page_table`]
//! owns the hardware translation structures, [`address_space`] owns the
//! per-process virtual map and its page-fault routing, [`slab`] provides
//! object caches on top, and [`heap`] feeds the Rust global allocator on
//! bare metal.

#[cfg(feature = "alloc")]
pub mod address_space;
#[cfg(feature = "alloc")]
pub mod heap;
pub mod page_table;
pub mod pmm;
#[cfg(feature = "alloc")]
pub mod slab;

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicUsize, Ordering};
#[cfg(not(target_os = "none"))]
extern crate std;

pub use pmm::{AllocFlags, FrameAllocator, PMM};

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;
/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Is `value` a multiple of the page size?
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }

    pub const fn offset(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    pub const fn page_base(&self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.0)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn offset(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    pub const fn page_base(&self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.0)
    }
}

/// Physical frame number (`paddr >> PAGE_SHIFT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn new(pfn: usize) -> Self {
        Self(pfn)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

/// Classification of a boot memory-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the PMM may hand out.
    Usable,
    /// Firmware, MMIO holes, the loaded kernel image -- never allocated.
    Reserved,
}

/// One entry of the boot memory map, as handed to [`pmm::FrameAllocator::init`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub size: usize,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn usable(start: usize, size: usize) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            size,
            kind: MemoryRegionKind::Usable,
        }
    }

    pub const fn reserved(start: usize, size: usize) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            size,
            kind: MemoryRegionKind::Reserved,
        }
    }

    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_usize() + self.size)
    }
}

/// Virtual-memory layout of the higher-half kernel (32-bit).
pub mod layout {
    /// The null page: permanently unmapped to trap null dereferences.
    pub const NULL_GUARD_END: usize = 0x1000;

    /// Reserved virtual range backing the segment-descriptor arenas,
    /// below the first megabyte.
    pub const SEGMENT_ARENA_BASE: usize = 0x0001_0000;
    /// 16 pages = 1024 descriptor slots of 64 bytes.
    pub const SEGMENT_ARENA_SIZE: usize = 0x0001_0000;

    /// First address handed out to user mappings.
    pub const USER_BASE: usize = 0x0040_0000;
    /// User space ends where the kernel half begins.
    pub const USER_TOP: usize = KERNEL_BASE;

    /// Higher-half split: kernel virtual addresses start here.
    pub const KERNEL_BASE: usize = 0xC000_0000;
    /// End of the direct kernel window.
    pub const KERNEL_TOP: usize = 0xFFB0_0000;

    /// Kernel virtual-allocation range (vm_alloc with KERNEL).
    pub const KERNEL_VM_BASE: usize = KERNEL_TOP;
    pub const KERNEL_VM_TOP: usize = RECURSIVE_BASE;

    /// Top 4 MiB: the recursive page-table window.
    pub const RECURSIVE_BASE: usize = 0xFFC0_0000;

    /// Physical span reachable through the kernel window, and therefore
    /// the extent of `AllocFlags::KERNEL` allocations.
    pub const KERNEL_PHYS_SPAN: usize = KERNEL_TOP - KERNEL_BASE;
}

/// Offset of the physical→virtual window. On bare metal the boot stub
/// maps physical `[0, KERNEL_PHYS_SPAN)` at [`layout::KERNEL_BASE`]; host
/// tests point this at a private per-thread arena instead.
#[cfg(target_os = "none")]
static PHYS_WINDOW: AtomicUsize = AtomicUsize::new(layout::KERNEL_BASE);

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static PHYS_WINDOW: core::cell::Cell<usize> =
        const { core::cell::Cell::new(layout::KERNEL_BASE) };
}

/// Redirect the physical→virtual window (boot stub or test harness only).
#[cfg(target_os = "none")]
pub fn set_phys_window(offset: usize) {
    PHYS_WINDOW.store(offset, Ordering::Release);
}

#[cfg(target_os = "none")]
pub fn phys_window() -> usize {
    PHYS_WINDOW.load(Ordering::Acquire)
}

/// Redirect the physical→virtual window (boot stub or test harness only).
#[cfg(not(target_os = "none"))]
pub fn set_phys_window(offset: usize) {
    PHYS_WINDOW.with(|w| w.set(offset));
}

#[cfg(not(target_os = "none"))]
pub fn phys_window() -> usize {
    PHYS_WINDOW.with(|w| w.get())
}

/// Translate a physical address through the kernel window.
///
/// The result is only dereferenceable for frames inside the window span;
/// the PMM keeps its own metadata and all page-table frames there.
pub fn phys_to_virt(paddr: PhysicalAddress) -> *mut u8 {
    phys_window().wrapping_add(paddr.as_usize()) as *mut u8
}

/// Initialize physical memory management from the boot memory map.
pub fn init(regions: &[MemoryRegion]) -> crate::error::KernelResult<()> {
    let mut pmm = PMM.lock();
    pmm.init(regions)?;
    log::info!(
        "pmm: {} frames total, {} free",
        pmm.total_frames(),
        pmm.free_frames()
    );
    Ok(())
}

/// Page-fault trap entry: route the fault to the owning address space.
///
/// Faults no address space can satisfy kill the offending user process;
/// in kernel mode they are invariant violations and panic.
#[cfg(feature = "alloc")]
pub fn handle_page_fault(addr: VirtualAddress, is_write: bool, is_user: bool) {
    let served = crate::process::with_current_address_space(|aspace, pmm| {
        aspace.fault(pmm, addr, is_write)
    });

    match served {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            if is_user {
                log::warn!(
                    "segfault at {:#x} ({}) -- killing current process",
                    addr.as_usize(),
                    err
                );
                crate::process::kill_current();
            } else {
                panic!(
                    "kernel page fault at {:#x} (write={}): {}",
                    addr.as_usize(),
                    is_write,
                    err
                );
            }
        }
        None => panic!(
            "page fault at {:#x} before memory management was up",
            addr.as_usize()
        ),
    }
}


#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2001));
    }

    #[test]
    fn address_frame_round_trip() {
        let paddr = PhysicalAddress::new(0x0010_3000);
        assert_eq!(paddr.frame().as_usize(), 0x103);
        assert_eq!(paddr.frame().addr(), paddr);
    }

    #[test]
    fn layout_is_consistent() {
        assert!(layout::SEGMENT_ARENA_BASE >= layout::NULL_GUARD_END);
        assert!(layout::SEGMENT_ARENA_BASE + layout::SEGMENT_ARENA_SIZE <= 0x0010_0000);
        assert!(layout::USER_BASE < layout::USER_TOP);
        assert_eq!(layout::USER_TOP, layout::KERNEL_BASE);
        assert!(layout::KERNEL_VM_BASE < layout::KERNEL_VM_TOP);
        assert_eq!(layout::KERNEL_VM_TOP, layout::RECURSIVE_BASE);
    }
}
