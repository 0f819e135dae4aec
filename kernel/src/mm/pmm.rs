//! Physical frame allocator.
//!
//! Keeps one [`Page`] record per frame of the 32-bit physical space,
//! carved out of the first suitable usable region at init and reached
//! through the kernel's physical window. Allocation is a first-fit scan
//! for the lowest-numbered run of free frames; the contract deliberately
//! permits swapping in a buddy allocator later without changing callers.

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

use super::{
    layout, phys_to_virt, MemoryRegion, MemoryRegionKind, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE,
};

/// Hard cap on tracked frames: the whole 32-bit physical space.
const MAX_FRAMES: usize = 1 << 20;

bitflags::bitflags! {
    /// Allocation constraints for [`FrameAllocator::allocate_pages`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Restrict the run to the kernel-owned physical range (frames
        /// reachable through the kernel window).
        const KERNEL = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Per-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Frame is in the free pool.
        const AVAILABLE = 1 << 0;
        /// Frame is shared copy-on-write.
        const COW = 1 << 1;
        /// Frame backs a slab; `cache` identifies the owner.
        const SLAB = 1 << 2;
    }
}

/// Per-frame record. Created once at init, never destroyed; only the
/// flags, refcount and owning-cache token mutate.
#[repr(C)]
pub struct Page {
    flags: PageFlags,
    refcount: u16,
    /// Opaque token identifying the owning slab cache while SLAB is set.
    cache: usize,
}

/// The physical memory manager.
pub struct FrameAllocator {
    /// Frame records, living in carved physical memory behind the window.
    table: *mut Page,
    /// Number of records (frames) tracked.
    nframes: usize,
    /// Exclusive upper frame bound for `AllocFlags::KERNEL` requests.
    kernel_frames: usize,
    /// Frames currently in the free pool.
    free: usize,
    initialized: bool,
}

// SAFETY: the raw table pointer is only dereferenced through &mut self /
// &self; the global instance is serialized by its SpinLock.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            table: core::ptr::null_mut(),
            nframes: 0,
            kernel_frames: 0,
            free: 0,
            initialized: false,
        }
    }

    /// Build the frame table from the boot memory map.
    ///
    /// Must be called exactly once; a second call fails with `Busy`
    /// rather than corrupting the live table. Usable regions enter the
    /// free pool, everything else (including the table carve itself)
    /// stays reserved with a pinned refcount.
    pub fn init(&mut self, regions: &[MemoryRegion]) -> KernelResult<()> {
        if self.initialized {
            return Err(KernelError::Busy);
        }

        let mut nframes = 0;
        for region in regions {
            let end = region.end().as_usize();
            nframes = nframes.max(end >> PAGE_SHIFT);
        }
        nframes = nframes.min(MAX_FRAMES);
        if nframes == 0 {
            return Err(KernelError::Inval);
        }

        let table_bytes = nframes * core::mem::size_of::<Page>();
        let table_pages = table_bytes.div_ceil(PAGE_SIZE);

        // Carve the table from the first usable region that can hold it
        // and is reachable through the kernel window.
        let mut carve = None;
        for region in regions {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let base = super::align_up(region.start.as_usize(), PAGE_SIZE);
            let needed = table_pages * PAGE_SIZE;
            if base + needed <= region.end().as_usize() && base + needed <= layout::KERNEL_PHYS_SPAN
            {
                carve = Some(PhysicalAddress::new(base));
                break;
            }
        }
        let carve = carve.ok_or(KernelError::Nomem)?;

        let table = phys_to_virt(carve) as *mut Page;

        // SAFETY: the carve region is usable RAM reachable through the
        // window and exactly table_pages long; nothing else references it.
        unsafe {
            for pfn in 0..nframes {
                table.add(pfn).write(Page {
                    flags: PageFlags::empty(),
                    refcount: 1,
                    cache: 0,
                });
            }
        }

        self.table = table;
        self.nframes = nframes;
        self.kernel_frames = nframes.min(layout::KERNEL_PHYS_SPAN >> PAGE_SHIFT);
        self.free = 0;
        self.initialized = true;

        for region in regions {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let first = super::align_up(region.start.as_usize(), PAGE_SIZE) >> PAGE_SHIFT;
            let last = region.end().as_usize() >> PAGE_SHIFT;
            for pfn in first..last.min(self.nframes) {
                // SAFETY: pfn < nframes; exclusive access via &mut self.
                let page = unsafe { &mut *self.table.add(pfn) };
                if !page.flags.contains(PageFlags::AVAILABLE) {
                    page.flags.insert(PageFlags::AVAILABLE);
                    page.refcount = 0;
                    self.free += 1;
                }
            }
        }

        // The table's own frames are never handed out.
        let carve_first = carve.frame().as_usize();
        for pfn in carve_first..carve_first + table_pages {
            // SAFETY: carve frames are < nframes by construction.
            let page = unsafe { &mut *self.table.add(pfn) };
            if page.flags.contains(PageFlags::AVAILABLE) {
                page.flags.remove(PageFlags::AVAILABLE);
                page.refcount = 1;
                self.free -= 1;
            }
        }

        Ok(())
    }

    fn page(&self, pfn: usize) -> KernelResult<&Page> {
        if !self.initialized || pfn >= self.nframes {
            return Err(KernelError::Inval);
        }
        // SAFETY: bounds checked above; the table outlives self.
        Ok(unsafe { &*self.table.add(pfn) })
    }

    fn page_mut(&mut self, pfn: usize) -> KernelResult<&mut Page> {
        if !self.initialized || pfn >= self.nframes {
            return Err(KernelError::Inval);
        }
        // SAFETY: bounds checked above; exclusive access via &mut self.
        Ok(unsafe { &mut *self.table.add(pfn) })
    }

    /// Allocate a physically contiguous, page-aligned run of frames.
    ///
    /// `size` must be a non-zero multiple of the page size. The scan is
    /// first-fit from frame 0, so ties break toward the lowest PFN.
    pub fn allocate_pages(
        &mut self,
        size: usize,
        flags: AllocFlags,
    ) -> KernelResult<PhysicalAddress> {
        if !self.initialized {
            return Err(KernelError::Inval);
        }
        if size == 0 || !super::is_page_aligned(size) {
            return Err(KernelError::Inval);
        }
        let count = size >> PAGE_SHIFT;
        let limit = if flags.contains(AllocFlags::KERNEL) {
            self.kernel_frames
        } else {
            self.nframes
        };
        if count > limit {
            return Err(KernelError::Nomem);
        }

        let mut run = 0;
        let mut start = 0;
        for pfn in 0..limit {
            // SAFETY: pfn < limit <= nframes.
            let available =
                unsafe { (*self.table.add(pfn)).flags.contains(PageFlags::AVAILABLE) };
            if available {
                if run == 0 {
                    start = pfn;
                }
                run += 1;
                if run == count {
                    for claimed in start..start + count {
                        // SAFETY: claimed < limit <= nframes.
                        let page = unsafe { &mut *self.table.add(claimed) };
                        page.flags.remove(PageFlags::AVAILABLE);
                        page.refcount = 1;
                    }
                    self.free -= count;
                    return Ok(PhysicalAddress::new(start << PAGE_SHIFT));
                }
            } else {
                run = 0;
            }
        }

        Err(KernelError::Nomem)
    }

    /// Release a run previously returned by [`Self::allocate_pages`].
    ///
    /// Freeing an already-free frame is rejected instead of corrupting
    /// the pool; freeing a frame that still has extra references is a
    /// caller bug and also rejected (shared frames go through
    /// [`Self::page_put`]).
    pub fn free_pages(&mut self, paddr: PhysicalAddress, size: usize) -> KernelResult<()> {
        if size == 0 || !super::is_page_aligned(size) || !paddr.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let first = paddr.frame().as_usize();
        let count = size >> PAGE_SHIFT;
        if first + count > self.nframes {
            return Err(KernelError::Inval);
        }

        for pfn in first..first + count {
            let page = self.page(pfn)?;
            if page.flags.contains(PageFlags::AVAILABLE) || page.refcount != 1 {
                return Err(KernelError::Inval);
            }
        }

        for pfn in first..first + count {
            let page = self.page_mut(pfn)?;
            page.flags = PageFlags::AVAILABLE;
            page.refcount = 0;
            page.cache = 0;
        }
        self.free += count;
        Ok(())
    }

    /// Take an extra reference on an allocated frame.
    pub fn page_get(&mut self, paddr: PhysicalAddress) -> KernelResult<u16> {
        let page = self.page_mut(paddr.frame().as_usize())?;
        if page.flags.contains(PageFlags::AVAILABLE) {
            return Err(KernelError::Inval);
        }
        page.refcount = page.refcount.checked_add(1).ok_or(KernelError::Nomem)?;
        Ok(page.refcount)
    }

    /// Drop a reference; the frame returns to the free pool at zero.
    pub fn page_put(&mut self, paddr: PhysicalAddress) -> KernelResult<u16> {
        let pfn = paddr.frame().as_usize();
        let page = self.page_mut(pfn)?;
        if page.flags.contains(PageFlags::AVAILABLE) || page.refcount == 0 {
            return Err(KernelError::Inval);
        }
        page.refcount -= 1;
        let remaining = page.refcount;
        if remaining == 0 {
            page.flags = PageFlags::AVAILABLE;
            page.cache = 0;
            self.free += 1;
        }
        Ok(remaining)
    }

    /// Current reference count of a frame.
    pub fn refcount(&self, paddr: PhysicalAddress) -> KernelResult<u16> {
        Ok(self.page(paddr.frame().as_usize())?.refcount)
    }

    /// Flag or unflag a frame as shared copy-on-write.
    pub fn set_cow(&mut self, paddr: PhysicalAddress, cow: bool) -> KernelResult<()> {
        let page = self.page_mut(paddr.frame().as_usize())?;
        if page.flags.contains(PageFlags::AVAILABLE) {
            return Err(KernelError::Inval);
        }
        page.flags.set(PageFlags::COW, cow);
        Ok(())
    }

    pub fn is_cow(&self, paddr: PhysicalAddress) -> KernelResult<bool> {
        Ok(self
            .page(paddr.frame().as_usize())?
            .flags
            .contains(PageFlags::COW))
    }

    /// Tag a run of frames as slab-owned by `cache` (an opaque token).
    pub fn mark_slab(
        &mut self,
        paddr: PhysicalAddress,
        pages: usize,
        cache: usize,
    ) -> KernelResult<()> {
        let first = paddr.frame().as_usize();
        for pfn in first..first + pages {
            let page = self.page_mut(pfn)?;
            if page.flags.contains(PageFlags::AVAILABLE) {
                return Err(KernelError::Inval);
            }
            page.flags.insert(PageFlags::SLAB);
            page.cache = cache;
        }
        Ok(())
    }

    /// Remove the slab tag from a run of frames.
    pub fn clear_slab(&mut self, paddr: PhysicalAddress, pages: usize) -> KernelResult<()> {
        let first = paddr.frame().as_usize();
        for pfn in first..first + pages {
            let page = self.page_mut(pfn)?;
            page.flags.remove(PageFlags::SLAB);
            page.cache = 0;
        }
        Ok(())
    }

    /// Owning cache token of a slab frame, if tagged.
    pub fn slab_cache(&self, paddr: PhysicalAddress) -> KernelResult<Option<usize>> {
        let page = self.page(paddr.frame().as_usize())?;
        Ok(page.flags.contains(PageFlags::SLAB).then_some(page.cache))
    }

    pub fn is_available(&self, paddr: PhysicalAddress) -> KernelResult<bool> {
        Ok(self
            .page(paddr.frame().as_usize())?
            .flags
            .contains(PageFlags::AVAILABLE))
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    pub fn total_frames(&self) -> usize {
        self.nframes
    }

    pub fn kernel_frame_limit(&self) -> usize {
        self.kernel_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global physical memory manager. First in the kernel lock order.
pub static PMM: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testing::PhysArena;
    use super::*;

    const MIB: usize = 1 << 20;

    /// 16 MiB arena: first MiB reserved, the rest usable.
    fn fresh_pmm(arena: &PhysArena) -> FrameAllocator {
        let mut pmm = FrameAllocator::new();
        let map = [
            MemoryRegion::reserved(0, MIB),
            MemoryRegion::usable(MIB, arena.len() - MIB),
        ];
        pmm.init(&map).expect("init on a fresh allocator succeeds");
        pmm
    }

    #[test]
    fn init_reserves_low_memory_and_table() {
        let arena = PhysArena::new(16 * MIB);
        let pmm = fresh_pmm(&arena);

        // First megabyte is unavailable.
        for pfn in 0..256 {
            assert!(!pmm
                .is_available(PhysicalAddress::new(pfn << PAGE_SHIFT))
                .unwrap());
        }
        // The frame table itself was carved out of the usable region.
        assert!(!pmm.is_available(PhysicalAddress::new(MIB)).unwrap());
        assert!(pmm.free_frames() > 0);
    }

    #[test]
    fn double_init_is_rejected() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let map = [MemoryRegion::usable(MIB, arena.len() - MIB)];
        assert_eq!(pmm.init(&map), Err(KernelError::Busy));
    }

    #[test]
    fn allocation_is_lowest_pfn_first_fit() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = fresh_pmm(&arena);

        let a = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let b = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        assert!(a.as_usize() >= MIB, "reserved low memory was handed out");
        assert_eq!(b.as_usize(), a.as_usize() + PAGE_SIZE);

        // Freeing the first frame makes it the next choice again.
        pmm.free_pages(a, PAGE_SIZE).unwrap();
        let c = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn contiguous_runs_span_holes_correctly() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = fresh_pmm(&arena);

        let run = pmm
            .allocate_pages(4 * PAGE_SIZE, AllocFlags::empty())
            .unwrap();
        // Punch a hole in the middle and ask for a run longer than either
        // side of the hole's neighborhood.
        pmm.free_pages(run.offset(PAGE_SIZE), PAGE_SIZE).unwrap();
        let next = pmm
            .allocate_pages(2 * PAGE_SIZE, AllocFlags::empty())
            .unwrap();
        assert!(next.as_usize() > run.as_usize() + 3 * PAGE_SIZE);
    }

    #[test]
    fn zero_and_unaligned_sizes_are_rejected() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        assert_eq!(
            pmm.allocate_pages(0, AllocFlags::empty()),
            Err(KernelError::Inval)
        );
        assert_eq!(
            pmm.allocate_pages(PAGE_SIZE + 1, AllocFlags::empty()),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn exhaustion_returns_nomem_without_wrapping() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let total = pmm.total_frames() * PAGE_SIZE;
        assert_eq!(
            pmm.allocate_pages(total, AllocFlags::empty()),
            Err(KernelError::Nomem)
        );
    }

    #[test]
    fn double_free_is_rejected() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        pmm.free_pages(frame, PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_pages(frame, PAGE_SIZE), Err(KernelError::Inval));
    }

    #[test]
    fn refcount_zero_iff_available() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();

        assert_eq!(pmm.refcount(frame).unwrap(), 1);
        assert!(!pmm.is_available(frame).unwrap());

        assert_eq!(pmm.page_get(frame).unwrap(), 2);
        assert_eq!(pmm.page_put(frame).unwrap(), 1);
        assert!(!pmm.is_available(frame).unwrap());

        assert_eq!(pmm.page_put(frame).unwrap(), 0);
        assert!(pmm.is_available(frame).unwrap());
        assert_eq!(pmm.refcount(frame).unwrap(), 0);
    }

    #[test]
    fn slab_tagging_round_trips() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();

        assert_eq!(pmm.slab_cache(frame).unwrap(), None);
        pmm.mark_slab(frame, 1, 0xDEAD).unwrap();
        assert_eq!(pmm.slab_cache(frame).unwrap(), Some(0xDEAD));
        pmm.clear_slab(frame, 1).unwrap();
        assert_eq!(pmm.slab_cache(frame).unwrap(), None);
    }

    #[test]
    fn kernel_window_constrains_allocation() {
        let arena = PhysArena::new(4 * MIB);
        let mut pmm = fresh_pmm(&arena);
        // Everything in this small arena is inside the kernel window, so
        // the constrained allocation succeeds and stays below the limit.
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::KERNEL).unwrap();
        assert!(frame.frame().as_usize() < pmm.kernel_frame_limit());
    }

    #[test]
    fn boot_map_with_two_gib_of_ram() {
        // The frame records for a 2 GiB map need ~8-16 MiB; only they are
        // ever dereferenced, so a small arena backs the whole map.
        let table_bytes = (0x8000_0000 >> PAGE_SHIFT) * core::mem::size_of::<super::Page>();
        let arena = PhysArena::new(MIB + table_bytes + MIB);

        let mut pmm = FrameAllocator::new();
        let map = [
            MemoryRegion::reserved(0, MIB),
            MemoryRegion::usable(MIB, 0x8000_0000 - MIB),
        ];
        pmm.init(&map).unwrap();

        // Roughly 2 GiB free: everything usable minus the table carve.
        let expected = (0x8000_0000 - MIB) / PAGE_SIZE - table_bytes.div_ceil(PAGE_SIZE);
        assert_eq!(pmm.free_frames(), expected);

        // First megabyte unavailable.
        for pfn in 0..256 {
            assert!(!pmm
                .is_available(PhysicalAddress::new(pfn << PAGE_SHIFT))
                .unwrap());
        }

        // A fresh allocation lands at or above the first usable address.
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        assert!(frame.as_usize() >= 0x10_0000);
    }

    #[test]
    fn alloc_free_restores_free_count() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = fresh_pmm(&arena);
        let before = pmm.free_frames();
        let run = pmm
            .allocate_pages(8 * PAGE_SIZE, AllocFlags::empty())
            .unwrap();
        assert_eq!(pmm.free_frames(), before - 8);
        pmm.free_pages(run, 8 * PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_frames(), before);
    }
}
