//! Per-process virtual address spaces.
//!
//! An address space owns one page-directory hierarchy, a fixed arena of
//! segment descriptors, and the page-fault routing for its range. Segments
//! are page-granular and carry a driver vtable; the concrete drivers are
//! anonymous memory (lazy zero-fill, the common case), physical windows
//! (MMIO, no frame ownership) and the reserved driver that backs the
//! descriptor arena itself.
//!
//! The descriptor arena is the knot-cutter: segment records live in a
//! bitmap-managed region allocated straight from the PMM, so creating a
//! segment never re-enters the general allocator, and the slab layer can
//! in turn be built on `vm_alloc` without a cycle.
//!
//! Lock order: callers take the address-space lock before the PMM lock.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::page_table::{Mapper, PteFlags};
use super::pmm::{AllocFlags, FrameAllocator};
use super::{layout, phys_to_virt, PhysicalAddress, VirtualAddress, PAGE_SIZE};

bitflags::bitflags! {
    /// Segment protection and behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Kernel-only mapping (no USER bit, kernel-window frames).
        const KERNEL = 1 << 3;
        /// Guarantee zeroed memory on first touch.
        const CLEAR = 1 << 4;
        /// Caller supplies the start address.
        const FIXED = 1 << 5;
    }
}

/// Which driver a segment dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// Demand-paged zero-filled memory.
    Anonymous,
    /// Window onto a caller-supplied physical range (MMIO/DMA).
    Physical,
    /// The descriptor arena's own backing; mapped eagerly, never faults.
    Reserved,
}

/// A contiguous, page-aligned virtual range. Exactly one descriptor per
/// range, stored in the owning address space's arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Segment {
    pub start: VirtualAddress,
    pub size: usize,
    pub flags: SegmentFlags,
    pub kind: SegmentKind,
    /// Physical origin for `Physical`/`Reserved` segments.
    pub phys: PhysicalAddress,
}

impl Segment {
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_usize() + self.size)
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn overlaps(&self, start: VirtualAddress, size: usize) -> bool {
        self.start.as_usize() < start.as_usize() + size && start < self.end()
    }

    /// Leaf PTE flags for pages of this segment.
    fn pte_flags(&self) -> PteFlags {
        let mut flags = PteFlags::empty();
        if self.flags.contains(SegmentFlags::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if !self.flags.contains(SegmentFlags::KERNEL) {
            flags |= PteFlags::USER;
        }
        flags
    }

    fn ops(&self) -> &'static SegmentOps {
        match self.kind {
            SegmentKind::Anonymous => &ANONYMOUS_OPS,
            SegmentKind::Physical => &PHYSICAL_OPS,
            SegmentKind::Reserved => &RESERVED_OPS,
        }
    }
}

/// Segment driver vtable, carried per [`SegmentKind`].
pub struct SegmentOps {
    pub name: &'static str,
    /// Back the fresh segment (eagerly or lazily).
    pub alloc: fn(&mut Mapper, &mut FrameAllocator, &Segment) -> KernelResult<()>,
    /// Release everything the segment materialized.
    pub free: fn(&mut Mapper, &mut FrameAllocator, &Segment) -> KernelResult<()>,
    /// Adjust the backing for a new size (the descriptor update is the
    /// address space's job).
    pub resize: fn(&mut Mapper, &mut FrameAllocator, &Segment, usize) -> KernelResult<()>,
    /// Materialize or duplicate the page covering `addr`.
    pub fault:
        fn(&mut Mapper, &mut FrameAllocator, &Segment, VirtualAddress, bool) -> KernelResult<()>,
}

fn anon_alloc(_: &mut Mapper, _: &mut FrameAllocator, _: &Segment) -> KernelResult<()> {
    // Lazy: pages appear on first touch.
    Ok(())
}

fn anon_free(mapper: &mut Mapper, pmm: &mut FrameAllocator, seg: &Segment) -> KernelResult<()> {
    for page in (0..seg.size).step_by(PAGE_SIZE) {
        let virt = seg.start.offset(page);
        if let Ok(frame) = mapper.unmap(virt) {
            pmm.page_put(frame.page_base())?;
        }
    }
    Ok(())
}

fn anon_fault(
    mapper: &mut Mapper,
    pmm: &mut FrameAllocator,
    seg: &Segment,
    addr: VirtualAddress,
    _is_write: bool,
) -> KernelResult<()> {
    let alloc_flags = if seg.flags.contains(SegmentFlags::KERNEL) {
        AllocFlags::KERNEL
    } else {
        AllocFlags::empty()
    };
    let frame = pmm.allocate_pages(PAGE_SIZE, alloc_flags)?;
    super::page_table::zero_frame(frame);
    if let Err(err) = mapper.map(addr.page_base(), frame, seg.pte_flags(), pmm) {
        pmm.free_pages(frame, PAGE_SIZE)?;
        return Err(err);
    }
    Ok(())
}

fn anon_resize(
    mapper: &mut Mapper,
    pmm: &mut FrameAllocator,
    seg: &Segment,
    new_size: usize,
) -> KernelResult<()> {
    // Growth is lazy; shrinking releases the tail pages now.
    for page in (new_size..seg.size).step_by(PAGE_SIZE) {
        let virt = seg.start.offset(page);
        if let Ok(frame) = mapper.unmap(virt) {
            pmm.page_put(frame.page_base())?;
        }
    }
    Ok(())
}

fn window_alloc(mapper: &mut Mapper, pmm: &mut FrameAllocator, seg: &Segment) -> KernelResult<()> {
    for page in (0..seg.size).step_by(PAGE_SIZE) {
        let virt = seg.start.offset(page);
        let phys = seg.phys.offset(page);
        if let Err(err) = mapper.map(virt, phys, seg.pte_flags(), pmm) {
            // Unwind the partial window before failing.
            for unwind in (0..page).step_by(PAGE_SIZE) {
                let _ = mapper.unmap(seg.start.offset(unwind));
            }
            return Err(err);
        }
    }
    Ok(())
}

fn window_free(mapper: &mut Mapper, _: &mut FrameAllocator, seg: &Segment) -> KernelResult<()> {
    // The frames belong to the device (or the arena), not the pool.
    for page in (0..seg.size).step_by(PAGE_SIZE) {
        let _ = mapper.unmap(seg.start.offset(page));
    }
    Ok(())
}

fn window_fault(
    _: &mut Mapper,
    _: &mut FrameAllocator,
    _: &Segment,
    _: VirtualAddress,
    _: bool,
) -> KernelResult<()> {
    // Eagerly mapped; a fault here is a protection error.
    Err(KernelError::Access)
}

fn window_resize(
    _: &mut Mapper,
    _: &mut FrameAllocator,
    _: &Segment,
    _: usize,
) -> KernelResult<()> {
    Err(KernelError::NotSupported)
}

static ANONYMOUS_OPS: SegmentOps = SegmentOps {
    name: "anonymous",
    alloc: anon_alloc,
    free: anon_free,
    resize: anon_resize,
    fault: anon_fault,
};

static PHYSICAL_OPS: SegmentOps = SegmentOps {
    name: "physical",
    alloc: window_alloc,
    free: window_free,
    resize: window_resize,
    fault: window_fault,
};

static RESERVED_OPS: SegmentOps = SegmentOps {
    name: "vmm-reserved",
    alloc: window_alloc,
    free: window_free,
    resize: window_resize,
    fault: window_fault,
};

/// Size of one descriptor slot in the arena.
pub const SEGMENT_SLOT_SIZE: usize = 64;
/// Descriptor capacity of one address space.
pub const SEGMENT_SLOTS: usize = layout::SEGMENT_ARENA_SIZE / SEGMENT_SLOT_SIZE;

const _: () = assert!(core::mem::size_of::<Segment>() <= SEGMENT_SLOT_SIZE);

/// Bitmap-managed descriptor storage, living in PMM-allocated frames
/// reached through the physical window. One bit per 64-byte slot.
struct SegmentArena {
    base: PhysicalAddress,
    bitmap: [u32; SEGMENT_SLOTS / 32],
    used: usize,
}

impl SegmentArena {
    fn new(base: PhysicalAddress) -> Self {
        Self {
            base,
            bitmap: [0; SEGMENT_SLOTS / 32],
            used: 0,
        }
    }

    fn alloc_slot(&mut self) -> KernelResult<usize> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u32::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                self.used += 1;
                return Ok(word_idx * 32 + bit);
            }
        }
        Err(KernelError::Nomem)
    }

    fn free_slot(&mut self, slot: usize) {
        debug_assert!(self.is_used(slot));
        self.bitmap[slot / 32] &= !(1 << (slot % 32));
        self.used -= 1;
    }

    fn is_used(&self, slot: usize) -> bool {
        self.bitmap[slot / 32] & (1 << (slot % 32)) != 0
    }

    fn slot_ptr(&self, slot: usize) -> *mut Segment {
        phys_to_virt(self.base.offset(slot * SEGMENT_SLOT_SIZE)) as *mut Segment
    }

    fn read(&self, slot: usize) -> Segment {
        debug_assert!(self.is_used(slot));
        // SAFETY: used slots were initialized by `write`; the arena backing
        // is owned by this address space.
        unsafe { self.slot_ptr(slot).read() }
    }

    fn write(&mut self, slot: usize, segment: Segment) {
        // SAFETY: slot index is in range and the backing frames are ours.
        unsafe { self.slot_ptr(slot).write(segment) }
    }

    fn used_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..SEGMENT_SLOTS).filter(move |&slot| self.is_used(slot))
    }
}

/// A process's virtual memory map.
pub struct AddressSpace {
    mapper: Mapper,
    arena: SegmentArena,
    /// End of the initialized data image (set by the exec loader).
    pub data_end: VirtualAddress,
    /// Current program break.
    pub brk_end: VirtualAddress,
}

impl AddressSpace {
    /// Create an empty address space. `kernel_template` supplies the
    /// shared kernel half; `None` builds the kernel space itself.
    pub fn new(
        pmm: &mut FrameAllocator,
        kernel_template: Option<&AddressSpace>,
    ) -> KernelResult<Self> {
        let mapper = Mapper::new_directory(pmm, kernel_template.map(|k| &k.mapper))?;

        let arena_phys = match pmm.allocate_pages(layout::SEGMENT_ARENA_SIZE, AllocFlags::KERNEL) {
            Ok(phys) => phys,
            Err(err) => {
                let _ = mapper.destroy(pmm);
                return Err(err);
            }
        };
        for page in (0..layout::SEGMENT_ARENA_SIZE).step_by(PAGE_SIZE) {
            super::page_table::zero_frame(arena_phys.offset(page));
        }

        let mut space = Self {
            mapper,
            arena: SegmentArena::new(arena_phys),
            data_end: VirtualAddress::new(0),
            brk_end: VirtualAddress::new(0),
        };

        // The arena's own descriptor is its first entry; its pages are
        // mapped kernel-only at the reserved range.
        space.insert_segment(
            pmm,
            Segment {
                start: VirtualAddress::new(layout::SEGMENT_ARENA_BASE),
                size: layout::SEGMENT_ARENA_SIZE,
                flags: SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::KERNEL,
                kind: SegmentKind::Reserved,
                phys: arena_phys,
            },
        )?;

        Ok(space)
    }

    /// A hollow placeholder with no directory or arena, used only to
    /// swap a dying space out of its lock before teardown. Calling any
    /// operation on it fails or does nothing.
    pub fn empty() -> Self {
        Self {
            // SAFETY: the null root is never walked; every mapper entry
            // path goes through segments, of which there are none.
            mapper: unsafe { Mapper::from_root(PhysicalAddress::new(0)) },
            arena: SegmentArena::new(PhysicalAddress::new(0)),
            data_end: VirtualAddress::new(0),
            brk_end: VirtualAddress::new(0),
        }
    }

    pub fn page_directory(&self) -> PhysicalAddress {
        self.mapper.root()
    }

    pub fn mapper(&mut self) -> &mut Mapper {
        &mut self.mapper
    }

    /// Number of live segments, including the arena's own descriptor.
    pub fn segment_count(&self) -> usize {
        self.arena.used
    }

    /// Install the kernel's physical window: every tracked frame mapped
    /// at `KERNEL_BASE + paddr`, supervisor-only, GLOBAL so directory
    /// switches keep the TLB entries. Boot-time only, on the kernel
    /// space; user directories inherit the PDEs via the shared half.
    pub fn map_kernel_window(&mut self, pmm: &mut FrameAllocator) -> KernelResult<()> {
        let span = (pmm.total_frames() << super::PAGE_SHIFT).min(layout::KERNEL_PHYS_SPAN);
        for offset in (0..span).step_by(PAGE_SIZE) {
            self.mapper.map(
                VirtualAddress::new(layout::KERNEL_BASE + offset),
                PhysicalAddress::new(offset),
                PteFlags::WRITABLE | PteFlags::GLOBAL,
                pmm,
            )?;
        }
        Ok(())
    }

    fn insert_segment(&mut self, pmm: &mut FrameAllocator, segment: Segment) -> KernelResult<()> {
        if segment.size == 0
            || !super::is_page_aligned(segment.size)
            || !segment.start.is_page_aligned()
        {
            return Err(KernelError::Inval);
        }
        if segment.start.as_usize() < layout::NULL_GUARD_END
            || segment.end().as_usize() > layout::RECURSIVE_BASE
            || segment.end() < segment.start
        {
            return Err(KernelError::Inval);
        }
        for slot in self.arena.used_slots() {
            if self.arena.read(slot).overlaps(segment.start, segment.size) {
                return Err(KernelError::Exist);
            }
        }

        let slot = self.arena.alloc_slot()?;
        self.arena.write(slot, segment);

        if let Err(err) = (segment.ops().alloc)(&mut self.mapper, pmm, &segment) {
            self.arena.free_slot(slot);
            return Err(err);
        }
        Ok(())
    }

    /// Lowest gap of `size` bytes in the allocation range selected by
    /// `kernel`.
    fn find_gap(&self, size: usize, kernel: bool) -> KernelResult<VirtualAddress> {
        let (range_base, range_top) = if kernel {
            (layout::KERNEL_VM_BASE, layout::KERNEL_VM_TOP)
        } else {
            (layout::USER_BASE, layout::USER_TOP)
        };

        let mut spans: Vec<(usize, usize)> = self
            .arena
            .used_slots()
            .map(|slot| {
                let seg = self.arena.read(slot);
                (seg.start.as_usize(), seg.end().as_usize())
            })
            .filter(|&(start, end)| start < range_top && end > range_base)
            .collect();
        spans.sort_unstable();

        let mut candidate = range_base;
        for (start, end) in spans {
            if candidate + size <= start {
                break;
            }
            candidate = candidate.max(end);
        }
        if candidate + size > range_top {
            return Err(KernelError::Nomem);
        }
        Ok(VirtualAddress::new(candidate))
    }

    /// Allocate a lazily backed buffer of at least `size` bytes.
    ///
    /// `size` is rounded up to whole pages. `FIXED` requests must go
    /// through [`Self::vm_alloc_fixed`].
    pub fn vm_alloc(
        &mut self,
        pmm: &mut FrameAllocator,
        size: usize,
        flags: SegmentFlags,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 || flags.contains(SegmentFlags::FIXED) {
            return Err(KernelError::Inval);
        }
        let size = super::align_up(size, PAGE_SIZE);
        let start = self.find_gap(size, flags.contains(SegmentFlags::KERNEL))?;
        self.insert_segment(
            pmm,
            Segment {
                start,
                size,
                flags,
                kind: SegmentKind::Anonymous,
                phys: PhysicalAddress::new(0),
            },
        )?;
        Ok(start)
    }

    /// Allocate a lazily backed buffer at a caller-chosen address.
    pub fn vm_alloc_fixed(
        &mut self,
        pmm: &mut FrameAllocator,
        start: VirtualAddress,
        size: usize,
        flags: SegmentFlags,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 {
            return Err(KernelError::Inval);
        }
        let size = super::align_up(size, PAGE_SIZE);
        self.insert_segment(
            pmm,
            Segment {
                start,
                size,
                flags: flags | SegmentFlags::FIXED,
                kind: SegmentKind::Anonymous,
                phys: PhysicalAddress::new(0),
            },
        )?;
        Ok(start)
    }

    /// Map an existing physical range (PCI BAR, framebuffer) into the
    /// space. The frames are not owned by the PMM pool.
    pub fn vm_alloc_at(
        &mut self,
        pmm: &mut FrameAllocator,
        phys: PhysicalAddress,
        size: usize,
        flags: SegmentFlags,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 || !phys.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let size = super::align_up(size, PAGE_SIZE);
        let start = self.find_gap(size, flags.contains(SegmentFlags::KERNEL))?;
        self.insert_segment(
            pmm,
            Segment {
                start,
                size,
                flags,
                kind: SegmentKind::Physical,
                phys,
            },
        )?;
        Ok(start)
    }

    /// Resize the segment containing `ptr` in place (brk-style). Growth
    /// stays lazy; shrinking releases the tail immediately.
    pub fn vm_resize(
        &mut self,
        pmm: &mut FrameAllocator,
        ptr: VirtualAddress,
        new_size: usize,
    ) -> KernelResult<()> {
        if new_size == 0 {
            return Err(KernelError::Inval);
        }
        let new_size = super::align_up(new_size, PAGE_SIZE);
        let slot = self
            .arena
            .used_slots()
            .find(|&slot| self.arena.read(slot).contains(ptr))
            .ok_or(KernelError::Noent)?;
        let mut segment = self.arena.read(slot);

        if new_size > segment.size {
            // The grown range must stay inside the layout and off every
            // other segment.
            let grown_end = segment.start.as_usize() + new_size;
            if grown_end > layout::RECURSIVE_BASE {
                return Err(KernelError::Inval);
            }
            for other in self.arena.used_slots() {
                if other != slot
                    && self
                        .arena
                        .read(other)
                        .overlaps(segment.start, new_size)
                {
                    return Err(KernelError::Exist);
                }
            }
        }

        (segment.ops().resize)(&mut self.mapper, pmm, &segment, new_size)?;
        segment.size = new_size;
        self.arena.write(slot, segment);
        Ok(())
    }

    /// Tear down the segment containing `ptr`: backing frames, mappings
    /// and the descriptor.
    pub fn vm_free(&mut self, pmm: &mut FrameAllocator, ptr: VirtualAddress) -> KernelResult<()> {
        let slot = self
            .arena
            .used_slots()
            .find(|&slot| self.arena.read(slot).contains(ptr))
            .ok_or(KernelError::Noent)?;
        let segment = self.arena.read(slot);
        (segment.ops().free)(&mut self.mapper, pmm, &segment)?;
        self.arena.free_slot(slot);
        Ok(())
    }

    /// Locate the segment owning `ptr`.
    pub fn vm_find(&self, ptr: VirtualAddress) -> Option<Segment> {
        self.arena
            .used_slots()
            .map(|slot| self.arena.read(slot))
            .find(|seg| seg.contains(ptr))
    }

    /// Page-fault entry: dispatch to the owning segment's driver.
    ///
    /// Returns `Access` for faults no segment claims or that violate the
    /// segment's protection; the caller decides what that means (kill the
    /// process, panic the kernel).
    pub fn fault(
        &mut self,
        pmm: &mut FrameAllocator,
        addr: VirtualAddress,
        is_write: bool,
    ) -> KernelResult<()> {
        let segment = self.vm_find(addr).ok_or(KernelError::Access)?;
        if is_write && !segment.flags.contains(SegmentFlags::WRITE) {
            return Err(KernelError::Access);
        }
        if !is_write && !segment.flags.intersects(SegmentFlags::READ | SegmentFlags::EXEC) {
            return Err(KernelError::Access);
        }

        let page = addr.page_base();
        match self.mapper.entry_flags(page) {
            Ok(flags) => {
                if is_write && flags.contains(PteFlags::COW) {
                    self.cow_break(pmm, &segment, page)
                } else if is_write && !flags.contains(PteFlags::WRITABLE) {
                    Err(KernelError::Access)
                } else {
                    // Spurious fault (e.g. already materialized by a
                    // racing path); nothing to do.
                    Ok(())
                }
            }
            Err(_) => (segment.ops().fault)(&mut self.mapper, pmm, &segment, page, is_write),
        }
    }

    /// Resolve a write fault on a copy-on-write page.
    ///
    /// Sole owner: re-arm the original frame writable. Shared: copy into
    /// a fresh frame, drop one reference on the original.
    fn cow_break(
        &mut self,
        pmm: &mut FrameAllocator,
        segment: &Segment,
        page: VirtualAddress,
    ) -> KernelResult<()> {
        let old = self.mapper.translate(page)?.page_base();

        if pmm.refcount(old)? == 1 {
            pmm.set_cow(old, false)?;
            return self.mapper.update_flags(page, segment.pte_flags());
        }

        let alloc_flags = if segment.flags.contains(SegmentFlags::KERNEL) {
            AllocFlags::KERNEL
        } else {
            AllocFlags::empty()
        };
        let fresh = pmm.allocate_pages(PAGE_SIZE, alloc_flags)?;
        // SAFETY: both frames are live RAM inside the window: `old` is the
        // mapped source page, `fresh` was just allocated for us.
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(old), phys_to_virt(fresh), PAGE_SIZE);
        }
        if let Err(err) = self.mapper.remap(page, fresh, segment.pte_flags()) {
            pmm.free_pages(fresh, PAGE_SIZE)?;
            return Err(err);
        }
        pmm.page_put(old)?;
        Ok(())
    }

    /// Clone the current user mappings for fork: descriptors are copied,
    /// every materialized writable page flips to read-only copy-on-write
    /// on both sides, and frame refcounts pick up the second owner.
    pub fn copy_from(&mut self, pmm: &mut FrameAllocator, src: &mut AddressSpace) -> KernelResult<()> {
        let slots: Vec<usize> = src.arena.used_slots().collect();
        for slot in slots {
            let segment = src.arena.read(slot);
            if segment.flags.contains(SegmentFlags::KERNEL) || segment.kind == SegmentKind::Reserved
            {
                // The kernel half is already shared via the directory; the
                // arena is rebuilt per space.
                continue;
            }

            self.insert_segment(pmm, segment)?;
            if segment.kind != SegmentKind::Anonymous {
                // Physical windows were re-mapped eagerly by insert.
                continue;
            }

            for offset in (0..segment.size).step_by(PAGE_SIZE) {
                let page = segment.start.offset(offset);
                let Ok(phys) = src.mapper.translate(page) else {
                    continue;
                };
                let phys = phys.page_base();

                let shared_flags = if segment.flags.contains(SegmentFlags::WRITE) {
                    (segment.pte_flags() - PteFlags::WRITABLE) | PteFlags::COW
                } else {
                    segment.pte_flags()
                };

                self.mapper.map(page, phys, shared_flags, pmm)?;
                pmm.page_get(phys)?;
                if shared_flags.contains(PteFlags::COW) {
                    src.mapper.update_flags(page, shared_flags)?;
                    pmm.set_cow(phys, true)?;
                }
            }
        }
        Ok(())
    }

    /// Drop every user segment (exec). Kernel segments and the arena
    /// survive.
    pub fn clear_user(&mut self, pmm: &mut FrameAllocator) -> KernelResult<()> {
        let slots: Vec<usize> = self.arena.used_slots().collect();
        for slot in slots {
            let segment = self.arena.read(slot);
            if segment.flags.contains(SegmentFlags::KERNEL) || segment.kind == SegmentKind::Reserved
            {
                continue;
            }
            (segment.ops().free)(&mut self.mapper, pmm, &segment)?;
            self.arena.free_slot(slot);
        }
        self.data_end = VirtualAddress::new(0);
        self.brk_end = VirtualAddress::new(0);
        Ok(())
    }

    /// Full teardown on process death: all segments, the descriptor
    /// arena, the user page tables and the directory.
    pub fn destroy(mut self, pmm: &mut FrameAllocator) -> KernelResult<()> {
        let slots: Vec<usize> = self.arena.used_slots().collect();
        for slot in slots {
            let segment = self.arena.read(slot);
            (segment.ops().free)(&mut self.mapper, pmm, &segment)?;
            self.arena.free_slot(slot);
        }
        pmm.free_pages(self.arena.base, layout::SEGMENT_ARENA_SIZE)?;
        self.mapper.destroy(pmm)?;
        Ok(())
    }
}

/// The kernel's own address space, installed at boot.
static KERNEL_SPACE: spin::Once<crate::sync::SpinLock<AddressSpace>> = spin::Once::new();

/// Build the kernel address space. Called once during boot, after the
/// PMM is up.
pub fn init_kernel_space() -> KernelResult<()> {
    let space = {
        let mut pmm = super::PMM.lock();
        AddressSpace::new(&mut pmm, None)?
    };
    KERNEL_SPACE.call_once(|| crate::sync::SpinLock::new(space));
    Ok(())
}

/// The kernel address space.
///
/// Panics if called before [`init_kernel_space`]: running without a
/// kernel address space is unrecoverable.
pub fn kernel_space() -> &'static crate::sync::SpinLock<AddressSpace> {
    KERNEL_SPACE
        .get()
        .expect("kernel address space not initialized")
}

/// Non-panicking access for paths that may run before boot finishes.
pub fn try_kernel_space() -> Option<&'static crate::sync::SpinLock<AddressSpace>> {
    KERNEL_SPACE.get()
}

/// Allocate kernel virtual memory from the global kernel space.
/// Takes the space lock before the PMM lock, per the kernel lock order
/// (address-space above PMM).
pub fn kernel_vm_alloc(size: usize, flags: SegmentFlags) -> KernelResult<VirtualAddress> {
    let mut space = kernel_space().lock();
    let mut pmm = super::PMM.lock();
    space.vm_alloc(&mut pmm, size, flags | SegmentFlags::KERNEL)
}

/// Free kernel virtual memory previously returned by [`kernel_vm_alloc`].
pub fn kernel_vm_free(ptr: VirtualAddress) -> KernelResult<()> {
    let mut space = kernel_space().lock();
    let mut pmm = super::PMM.lock();
    space.vm_free(&mut pmm, ptr)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testing::PhysArena;
    use super::super::MemoryRegion;
    use super::*;

    const MIB: usize = 1 << 20;

    fn setup(arena: &PhysArena) -> FrameAllocator {
        let mut pmm = FrameAllocator::new();
        let map = [MemoryRegion::usable(MIB, arena.len() - MIB)];
        pmm.init(&map).unwrap();
        pmm
    }

    fn user_rw() -> SegmentFlags {
        SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::CLEAR
    }

    #[test]
    fn vm_alloc_is_lazy_and_fault_materializes_zeroed_pages() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let buf = space.vm_alloc(&mut pmm, 0x4000, user_rw()).unwrap();
        assert!(buf.is_page_aligned());

        // Nothing materialized yet.
        assert_eq!(space.mapper().translate(buf), Err(KernelError::Noent));

        // First write touch materializes a zeroed frame.
        space.fault(&mut pmm, buf, true).unwrap();
        let phys = space.mapper().translate(buf).unwrap();
        // SAFETY: the frame was just materialized in the test arena.
        let byte = unsafe { *phys_to_virt(phys) };
        assert_eq!(byte, 0);

        // Faulting a different page of the same segment works too.
        space.fault(&mut pmm, buf.offset(0x3FFF), true).unwrap();
        assert!(space.mapper().translate(buf.offset(0x3000)).is_ok());
    }

    #[test]
    fn vm_alloc_rounds_size_up_to_pages() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let buf = space.vm_alloc(&mut pmm, 100, user_rw()).unwrap();
        let segment = space.vm_find(buf).unwrap();
        assert_eq!(segment.size, PAGE_SIZE);
    }

    #[test]
    fn zero_size_alloc_is_rejected() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();
        assert_eq!(
            space.vm_alloc(&mut pmm, 0, user_rw()),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn alloc_free_round_trip_restores_state() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let segments_before = space.segment_count();
        let frames_before = pmm.free_frames();

        let buf = space.vm_alloc(&mut pmm, 4 * PAGE_SIZE, user_rw()).unwrap();
        space.fault(&mut pmm, buf, true).unwrap();
        space.fault(&mut pmm, buf.offset(PAGE_SIZE), true).unwrap();
        space.vm_free(&mut pmm, buf).unwrap();

        assert_eq!(space.segment_count(), segments_before);
        // One leaf page table may remain cached in the hierarchy; account
        // for it when comparing the pool.
        assert!(pmm.free_frames() >= frames_before - 1);
        assert_eq!(space.vm_find(buf), None);
    }

    #[test]
    fn segments_never_overlap() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let fixed = VirtualAddress::new(0x0100_0000);
        space
            .vm_alloc_fixed(&mut pmm, fixed, 4 * PAGE_SIZE, user_rw())
            .unwrap();
        assert_eq!(
            space.vm_alloc_fixed(&mut pmm, fixed.offset(PAGE_SIZE), PAGE_SIZE, user_rw()),
            Err(KernelError::Exist)
        );

        // Gap search steers a dynamic allocation around the fixed one.
        let other = space.vm_alloc(&mut pmm, PAGE_SIZE, user_rw()).unwrap();
        assert!(space.vm_find(other).is_some());
        assert!(!space.vm_find(other).unwrap().overlaps(fixed, 4 * PAGE_SIZE));
    }

    #[test]
    fn fixed_alloc_at_null_page_is_rejected() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();
        assert_eq!(
            space.vm_alloc_fixed(&mut pmm, VirtualAddress::new(0), PAGE_SIZE, user_rw()),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn physical_window_maps_eagerly() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        // Stand-in for an MMIO BAR: a frame we own, mapped read-only.
        let bar = pmm
            .allocate_pages(2 * PAGE_SIZE, AllocFlags::empty())
            .unwrap();
        let virt = space
            .vm_alloc_at(&mut pmm, bar, 2 * PAGE_SIZE, SegmentFlags::READ)
            .unwrap();

        assert_eq!(space.mapper().translate(virt).unwrap(), bar);
        assert_eq!(
            space.mapper().translate(virt.offset(PAGE_SIZE)).unwrap(),
            bar.offset(PAGE_SIZE)
        );

        // The window is mapped eagerly; a write fault is a protection
        // error, not a demand-paging request.
        assert_eq!(space.fault(&mut pmm, virt, true), Err(KernelError::Access));
    }

    #[test]
    fn fault_outside_any_segment_is_access_error() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();
        assert_eq!(
            space.fault(&mut pmm, VirtualAddress::new(0x7000_0000), false),
            Err(KernelError::Access)
        );
    }

    #[test]
    fn write_fault_on_readonly_segment_is_access_error() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let buf = space
            .vm_alloc(&mut pmm, PAGE_SIZE, SegmentFlags::READ)
            .unwrap();
        assert_eq!(space.fault(&mut pmm, buf, true), Err(KernelError::Access));
        // Read fault still materializes.
        space.fault(&mut pmm, buf, false).unwrap();
    }

    #[test]
    fn fork_copies_lazily_with_copy_on_write() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut parent = AddressSpace::new(&mut pmm, None).unwrap();

        let buf = parent.vm_alloc(&mut pmm, PAGE_SIZE, user_rw()).unwrap();
        parent.fault(&mut pmm, buf, true).unwrap();
        let phys = parent.mapper().translate(buf).unwrap().page_base();

        // Seed the page with recognizable bytes.
        // SAFETY: `phys` is a live arena frame mapped for this test.
        unsafe { *phys_to_virt(phys) = 0x5A };

        let mut child = AddressSpace::new(&mut pmm, None).unwrap();
        child.copy_from(&mut pmm, &mut parent).unwrap();

        // Both sides see the same frame, read-only, refcount 2.
        assert_eq!(child.mapper().translate(buf).unwrap().page_base(), phys);
        assert_eq!(pmm.refcount(phys).unwrap(), 2);
        assert!(pmm.is_cow(phys).unwrap());
        for space in [&mut parent, &mut child] {
            let flags = space.mapper().entry_flags(buf).unwrap();
            assert!(flags.contains(PteFlags::COW));
            assert!(!flags.contains(PteFlags::WRITABLE));
        }

        // Parent writes: the handler duplicates the page.
        parent.fault(&mut pmm, buf, true).unwrap();
        let parent_phys = parent.mapper().translate(buf).unwrap().page_base();
        assert_ne!(parent_phys, phys);
        assert_eq!(pmm.refcount(phys).unwrap(), 1);

        // SAFETY: both frames are live arena memory.
        unsafe {
            *phys_to_virt(parent_phys) = 0xAB;
            assert_eq!(*phys_to_virt(phys), 0x5A, "child copy was disturbed");
        }

        // Child writes: sole owner now, frame re-armed in place.
        child.fault(&mut pmm, buf, true).unwrap();
        assert_eq!(child.mapper().translate(buf).unwrap().page_base(), phys);
        assert!(child
            .mapper()
            .entry_flags(buf)
            .unwrap()
            .contains(PteFlags::WRITABLE));
        assert!(!pmm.is_cow(phys).unwrap());
    }

    #[test]
    fn resize_shrinks_eagerly_and_grows_lazily() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let buf = space.vm_alloc(&mut pmm, 4 * PAGE_SIZE, user_rw()).unwrap();
        for page in 0..4 {
            space
                .fault(&mut pmm, buf.offset(page * PAGE_SIZE), true)
                .unwrap();
        }
        let free_before = pmm.free_frames();

        // Shrinking to one page releases the other three frames.
        space.vm_resize(&mut pmm, buf, PAGE_SIZE).unwrap();
        assert_eq!(pmm.free_frames(), free_before + 3);
        assert_eq!(space.vm_find(buf).unwrap().size, PAGE_SIZE);
        assert_eq!(
            space.mapper().translate(buf.offset(PAGE_SIZE)),
            Err(KernelError::Noent)
        );

        // Growing back is lazy: the descriptor covers the range again
        // and a fresh touch materializes.
        space.vm_resize(&mut pmm, buf, 2 * PAGE_SIZE).unwrap();
        assert_eq!(space.vm_find(buf).unwrap().size, 2 * PAGE_SIZE);
        space.fault(&mut pmm, buf.offset(PAGE_SIZE), true).unwrap();
        assert!(space.mapper().translate(buf.offset(PAGE_SIZE)).is_ok());

        // Growing into a neighbor is refused.
        let neighbor = space.vm_find(buf).unwrap().end();
        space
            .vm_alloc_fixed(&mut pmm, neighbor, PAGE_SIZE, user_rw())
            .unwrap();
        assert_eq!(
            space.vm_resize(&mut pmm, buf, 4 * PAGE_SIZE),
            Err(KernelError::Exist)
        );
    }

    #[test]
    fn kernel_and_user_allocations_use_their_own_ranges() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let user = space.vm_alloc(&mut pmm, PAGE_SIZE, user_rw()).unwrap();
        let kernel = space
            .vm_alloc(
                &mut pmm,
                PAGE_SIZE,
                SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::KERNEL,
            )
            .unwrap();

        assert!(user.as_usize() >= layout::USER_BASE);
        assert!(user.as_usize() < layout::USER_TOP);
        assert!(kernel.as_usize() >= layout::KERNEL_VM_BASE);
        assert!(kernel.as_usize() < layout::KERNEL_VM_TOP);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let baseline = pmm.free_frames();

        let mut space = AddressSpace::new(&mut pmm, None).unwrap();
        let buf = space.vm_alloc(&mut pmm, 4 * PAGE_SIZE, user_rw()).unwrap();
        space.fault(&mut pmm, buf, true).unwrap();
        space.fault(&mut pmm, buf.offset(PAGE_SIZE), true).unwrap();

        space.destroy(&mut pmm).unwrap();
        assert_eq!(pmm.free_frames(), baseline);
    }

    #[test]
    fn clear_user_keeps_kernel_segments() {
        let arena = PhysArena::new(16 * MIB);
        let mut pmm = setup(&arena);
        let mut space = AddressSpace::new(&mut pmm, None).unwrap();

        let user = space.vm_alloc(&mut pmm, PAGE_SIZE, user_rw()).unwrap();
        let kernel = space
            .vm_alloc(
                &mut pmm,
                PAGE_SIZE,
                SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::KERNEL,
            )
            .unwrap();

        space.clear_user(&mut pmm).unwrap();
        assert_eq!(space.vm_find(user), None);
        assert!(space.vm_find(kernel).is_some());
    }
}
