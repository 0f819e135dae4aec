//! i686 two-level page tables.
//!
//! A page directory of 1024 entries, each covering 4 MiB through a page
//! table of 1024 PTEs. The last directory slot maps the directory itself
//! (recursive paging). All table memory is reached through the kernel's
//! physical window, which keeps the walker arch-neutral and testable: on
//! the host the "hardware" tables are plain arena memory.

use core::ops::{Index, IndexMut};

use crate::error::{KernelError, KernelResult};

use super::{layout, phys_to_virt, PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};

/// Entries per directory or table.
pub const TABLE_ENTRIES: usize = 1024;

/// Directory slot that maps the directory itself.
pub const RECURSIVE_INDEX: usize = 1023;

/// First directory slot of the kernel half (0xC000_0000 >> 22).
pub const KERNEL_PDE_FIRST: usize = layout::KERNEL_BASE >> 22;

bitflags::bitflags! {
    /// PTE/PDE bits. COW lives in an ignored-by-hardware bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
        /// Software: frame is shared copy-on-write; write faults duplicate.
        const COW = 1 << 9;
    }
}

/// One page-table or page-directory entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    /// Physical frame this entry points at, if present.
    pub fn addr(&self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & 0xFFFF_F000) as usize))
    }

    pub fn set(&mut self, frame: PhysicalAddress, flags: PteFlags) {
        debug_assert!(frame.is_page_aligned());
        self.0 = frame.as_usize() as u32 | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// A 4 KiB table of 1024 entries (directory and leaf tables share the
/// shape).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Decomposition of a virtual address into walk indices.
#[derive(Debug, Clone, Copy)]
pub struct VirtBreakdown {
    pub dir: usize,
    pub table: usize,
    pub offset: usize,
}

impl VirtBreakdown {
    pub const fn new(virt: VirtualAddress) -> Self {
        let addr = virt.as_usize();
        Self {
            dir: (addr >> 22) & 0x3FF,
            table: (addr >> PAGE_SHIFT) & 0x3FF,
            offset: addr & (PAGE_SIZE - 1),
        }
    }
}

/// Where the mapper gets frames for intermediate tables. The PMM
/// implements this; tests may substitute their own accounting source.
pub trait TableFrameSource {
    fn alloc_table_frame(&mut self) -> KernelResult<PhysicalAddress>;
    fn free_table_frame(&mut self, frame: PhysicalAddress) -> KernelResult<()>;
}

impl TableFrameSource for super::pmm::FrameAllocator {
    fn alloc_table_frame(&mut self) -> KernelResult<PhysicalAddress> {
        // Table frames must be reachable through the kernel window.
        self.allocate_pages(PAGE_SIZE, super::AllocFlags::KERNEL)
    }

    fn free_table_frame(&mut self, frame: PhysicalAddress) -> KernelResult<()> {
        self.free_pages(frame, PAGE_SIZE)
    }
}

/// Zero a frame through the physical window.
pub fn zero_frame(frame: PhysicalAddress) {
    // SAFETY: callers only pass frames they own, inside the window span.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame), 0, PAGE_SIZE);
    }
}

/// Walks and edits one page-table hierarchy, identified by the physical
/// address of its directory.
pub struct Mapper {
    root: PhysicalAddress,
}

impl Mapper {
    /// Adopt an existing directory.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a directory frame inside
    /// the window span, and the caller must ensure no other `Mapper`
    /// mutates the same hierarchy concurrently.
    pub unsafe fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// Allocate and initialize a fresh directory. The kernel half is
    /// copied from `kernel_template` so every address space shares the
    /// same kernel mappings; the recursive slot points back at the new
    /// directory.
    pub fn new_directory(
        src: &mut impl TableFrameSource,
        kernel_template: Option<&Mapper>,
    ) -> KernelResult<Self> {
        let frame = src.alloc_table_frame()?;
        zero_frame(frame);

        // SAFETY: frame was just allocated for us and zeroed.
        let dir = unsafe { &mut *(phys_to_virt(frame) as *mut PageTable) };
        if let Some(template) = kernel_template {
            let src_dir = template.directory();
            for slot in KERNEL_PDE_FIRST..RECURSIVE_INDEX {
                dir[slot] = src_dir[slot];
            }
        }
        dir[RECURSIVE_INDEX].set(frame, PteFlags::PRESENT | PteFlags::WRITABLE);

        Ok(Self { root: frame })
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn directory(&self) -> &PageTable {
        // SAFETY: root is a live directory frame per the from_root /
        // new_directory contracts.
        unsafe { &*(phys_to_virt(self.root) as *const PageTable) }
    }

    #[allow(clippy::mut_from_ref)]
    fn directory_mut(&mut self) -> &mut PageTable {
        // SAFETY: as above; &mut self serializes mutation.
        unsafe { &mut *(phys_to_virt(self.root) as *mut PageTable) }
    }

    fn leaf_table(entry: &PageTableEntry) -> Option<&'static mut PageTable> {
        let addr = entry.addr()?;
        // SAFETY: present PDEs only ever point at table frames this
        // module allocated inside the window span.
        Some(unsafe { &mut *(phys_to_virt(addr) as *mut PageTable) })
    }

    fn check_mappable(virt: VirtualAddress) -> KernelResult<()> {
        if !virt.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        // The null page is permanently reserved, and the top 4 MiB belong
        // to the recursive window.
        if virt.as_usize() < layout::NULL_GUARD_END || virt.as_usize() >= layout::RECURSIVE_BASE {
            return Err(KernelError::Inval);
        }
        Ok(())
    }

    /// Install a leaf mapping. Fails with `Exist` if `virt` is already
    /// mapped; never overwrites.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PteFlags,
        src: &mut impl TableFrameSource,
    ) -> KernelResult<()> {
        Self::check_mappable(virt)?;
        if !phys.is_page_aligned() {
            return Err(KernelError::Inval);
        }

        let breakdown = VirtBreakdown::new(virt);
        let user_half = breakdown.dir < KERNEL_PDE_FIRST;
        let dir = self.directory_mut();
        let pde = &mut dir[breakdown.dir];

        if !pde.is_present() {
            let table_frame = src.alloc_table_frame()?;
            zero_frame(table_frame);
            let mut pde_flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if user_half {
                pde_flags |= PteFlags::USER;
            }
            pde.set(table_frame, pde_flags);
        }

        let table = Self::leaf_table(pde).ok_or(KernelError::Inval)?;
        let pte = &mut table[breakdown.table];
        if pte.is_present() {
            return Err(KernelError::Exist);
        }
        pte.set(phys, flags | PteFlags::PRESENT);
        Ok(())
    }

    /// Remove a leaf mapping, returning the frame that backed it.
    pub fn unmap(&mut self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        Self::check_mappable(virt)?;
        let breakdown = VirtBreakdown::new(virt);
        let dir = self.directory_mut();
        let pde = &dir[breakdown.dir];
        if !pde.is_present() {
            return Err(KernelError::Noent);
        }
        let table = Self::leaf_table(pde).ok_or(KernelError::Noent)?;
        let pte = &mut table[breakdown.table];
        let frame = pte.addr().ok_or(KernelError::Noent)?;
        pte.clear();
        crate::arch::invlpg(virt);
        Ok(frame)
    }

    /// Walk the hierarchy for `virt`, returning the physical address
    /// (including the page offset).
    pub fn translate(&self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let breakdown = VirtBreakdown::new(virt);
        let dir = self.directory();
        let pde = &dir[breakdown.dir];
        if !pde.is_present() {
            return Err(KernelError::Noent);
        }
        let table = Self::leaf_table(pde).ok_or(KernelError::Noent)?;
        let frame = table[breakdown.table].addr().ok_or(KernelError::Noent)?;
        Ok(frame.offset(breakdown.offset))
    }

    /// Flags of the leaf entry covering `virt`.
    pub fn entry_flags(&self, virt: VirtualAddress) -> KernelResult<PteFlags> {
        let breakdown = VirtBreakdown::new(virt);
        let dir = self.directory();
        let pde = &dir[breakdown.dir];
        if !pde.is_present() {
            return Err(KernelError::Noent);
        }
        let table = Self::leaf_table(pde).ok_or(KernelError::Noent)?;
        let pte = &table[breakdown.table];
        if !pte.is_present() {
            return Err(KernelError::Noent);
        }
        Ok(pte.flags())
    }

    /// Replace the flags of an existing leaf entry (same frame).
    pub fn update_flags(&mut self, virt: VirtualAddress, flags: PteFlags) -> KernelResult<()> {
        let breakdown = VirtBreakdown::new(virt);
        let dir = self.directory_mut();
        let pde = &dir[breakdown.dir];
        if !pde.is_present() {
            return Err(KernelError::Noent);
        }
        let table = Self::leaf_table(pde).ok_or(KernelError::Noent)?;
        let pte = &mut table[breakdown.table];
        let frame = pte.addr().ok_or(KernelError::Noent)?;
        pte.set(frame, flags | PteFlags::PRESENT);
        crate::arch::invlpg(virt);
        Ok(())
    }

    /// Point an existing leaf entry at a different frame (CoW break).
    pub fn remap(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PteFlags,
    ) -> KernelResult<()> {
        let breakdown = VirtBreakdown::new(virt);
        let dir = self.directory_mut();
        let pde = &dir[breakdown.dir];
        if !pde.is_present() {
            return Err(KernelError::Noent);
        }
        let table = Self::leaf_table(pde).ok_or(KernelError::Noent)?;
        let pte = &mut table[breakdown.table];
        if !pte.is_present() {
            return Err(KernelError::Noent);
        }
        pte.set(phys, flags | PteFlags::PRESENT);
        crate::arch::invlpg(virt);
        Ok(())
    }

    /// Raw directory entry, for kernel-half comparisons.
    pub fn directory_entry(&self, slot: usize) -> PageTableEntry {
        self.directory()[slot]
    }

    /// Free every user-half leaf table (the mapped data frames must
    /// already have been released). Returns the number of table frames
    /// freed.
    pub fn free_user_tables(&mut self, src: &mut impl TableFrameSource) -> KernelResult<usize> {
        let mut freed = 0;
        let dir = self.directory_mut();
        for slot in 0..KERNEL_PDE_FIRST {
            let pde = &mut dir[slot];
            if let Some(table_frame) = pde.addr() {
                src.free_table_frame(table_frame)?;
                pde.clear();
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Tear the hierarchy down completely: user tables plus the
    /// directory frame itself. The kernel half is shared and untouched.
    pub fn destroy(mut self, src: &mut impl TableFrameSource) -> KernelResult<usize> {
        let mut freed = self.free_user_tables(src)?;
        src.free_table_frame(self.root)?;
        freed += 1;
        Ok(freed)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testing::PhysArena;
    use super::super::{AllocFlags, FrameAllocator, MemoryRegion};
    use super::*;

    const MIB: usize = 1 << 20;

    fn setup(arena: &PhysArena) -> FrameAllocator {
        let mut pmm = FrameAllocator::new();
        let map = [MemoryRegion::usable(MIB, arena.len() - MIB)];
        pmm.init(&map).unwrap();
        pmm
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut mapper = Mapper::new_directory(&mut pmm, None).unwrap();

        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x40_0000);

        let before = mapper.translate(virt);
        assert_eq!(before, Err(KernelError::Noent));

        mapper
            .map(virt, frame, PteFlags::WRITABLE | PteFlags::USER, &mut pmm)
            .unwrap();
        assert_eq!(mapper.translate(virt).unwrap(), frame);
        assert_eq!(
            mapper.translate(virt.offset(0x123)).unwrap(),
            frame.offset(0x123)
        );

        let released = mapper.unmap(virt).unwrap();
        assert_eq!(released, frame);
        // map; unmap restores the prior translation result.
        assert_eq!(mapper.translate(virt), before);
    }

    #[test]
    fn mapping_twice_fails_without_overwriting() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut mapper = Mapper::new_directory(&mut pmm, None).unwrap();

        let a = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let b = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x40_0000);

        mapper.map(virt, a, PteFlags::WRITABLE, &mut pmm).unwrap();
        assert_eq!(
            mapper.map(virt, b, PteFlags::WRITABLE, &mut pmm),
            Err(KernelError::Exist)
        );
        assert_eq!(mapper.translate(virt).unwrap(), a);
    }

    #[test]
    fn null_page_and_recursive_window_are_rejected() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut mapper = Mapper::new_directory(&mut pmm, None).unwrap();
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();

        assert_eq!(
            mapper.map(VirtualAddress::new(0), frame, PteFlags::WRITABLE, &mut pmm),
            Err(KernelError::Inval)
        );
        assert_eq!(
            mapper.map(
                VirtualAddress::new(layout::RECURSIVE_BASE),
                frame,
                PteFlags::WRITABLE,
                &mut pmm
            ),
            Err(KernelError::Inval)
        );
        assert_eq!(
            mapper.map(
                VirtualAddress::new(0x40_0001),
                frame,
                PteFlags::WRITABLE,
                &mut pmm
            ),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn recursive_slot_points_at_the_directory() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mapper = Mapper::new_directory(&mut pmm, None).unwrap();
        let entry = mapper.directory_entry(RECURSIVE_INDEX);
        assert_eq!(entry.addr().unwrap(), mapper.root());
    }

    #[test]
    fn kernel_half_is_shared_across_directories() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut kernel = Mapper::new_directory(&mut pmm, None).unwrap();

        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        kernel
            .map(
                VirtualAddress::new(layout::KERNEL_VM_BASE),
                frame,
                PteFlags::WRITABLE,
                &mut pmm,
            )
            .unwrap();

        let mut user = Mapper::new_directory(&mut pmm, Some(&kernel)).unwrap();
        for slot in KERNEL_PDE_FIRST..RECURSIVE_INDEX {
            assert_eq!(
                user.directory_entry(slot).raw(),
                kernel.directory_entry(slot).raw(),
                "kernel PDE {slot} differs"
            );
        }
        // The kernel mapping is visible through the user directory.
        assert_eq!(
            user.translate(VirtualAddress::new(layout::KERNEL_VM_BASE))
                .unwrap(),
            frame
        );

        // User-half changes stay private.
        let user_frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        user.map(
            VirtualAddress::new(0x40_0000),
            user_frame,
            PteFlags::USER | PteFlags::WRITABLE,
            &mut pmm,
        )
        .unwrap();
        assert_eq!(
            kernel.translate(VirtualAddress::new(0x40_0000)),
            Err(KernelError::Noent)
        );
    }

    #[test]
    fn cow_flag_survives_update() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let mut mapper = Mapper::new_directory(&mut pmm, None).unwrap();
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x40_0000);

        mapper
            .map(virt, frame, PteFlags::USER | PteFlags::WRITABLE, &mut pmm)
            .unwrap();
        mapper
            .update_flags(virt, PteFlags::USER | PteFlags::COW)
            .unwrap();

        let flags = mapper.entry_flags(virt).unwrap();
        assert!(flags.contains(PteFlags::COW));
        assert!(!flags.contains(PteFlags::WRITABLE));
        assert_eq!(mapper.translate(virt).unwrap(), frame);
    }

    #[test]
    fn destroy_returns_table_frames() {
        let arena = PhysArena::new(8 * MIB);
        let mut pmm = setup(&arena);
        let baseline = pmm.free_frames();

        let mut mapper = Mapper::new_directory(&mut pmm, None).unwrap();
        let frame = pmm.allocate_pages(PAGE_SIZE, AllocFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x40_0000);
        mapper.map(virt, frame, PteFlags::WRITABLE, &mut pmm).unwrap();

        let released = mapper.unmap(virt).unwrap();
        pmm.free_pages(released, PAGE_SIZE).unwrap();
        // Directory + one leaf table outstanding.
        let freed = Mapper::destroy(mapper, &mut pmm).unwrap();
        assert_eq!(freed, 2);
        assert_eq!(pmm.free_frames(), baseline);
    }
}
