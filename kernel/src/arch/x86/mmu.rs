//! i686 paging control: CR2/CR3 and TLB maintenance.
//!
//! Page-table *contents* are managed arch-neutrally in
//! [`crate::mm::page_table`]; this module only touches the control
//! registers that point the MMU at them.

use core::arch::asm;

use crate::mm::{PhysicalAddress, VirtualAddress};

/// CR0 paging enable.
const CR0_PG: u32 = 1 << 31;
/// CR0 supervisor write protect (honour read-only PTEs in ring 0, needed
/// for copy-on-write faults taken from kernel mode).
const CR0_WP: u32 = 1 << 16;

/// Read the current page-directory root from CR3.
pub fn current_page_directory() -> PhysicalAddress {
    let cr3: u32;
    // SAFETY: reading CR3 is side-effect free in ring 0.
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    }
    PhysicalAddress::new((cr3 & 0xFFFF_F000) as usize)
}

/// Switch to a new page directory. Flushes all non-global TLB entries.
///
/// The kernel half of every directory maps the same frames, so the
/// instruction stream stays valid across the switch.
pub fn load_page_directory(root: PhysicalAddress) {
    // SAFETY: the address-space layer only hands us directory roots whose
    // kernel half mirrors the live kernel mappings.
    unsafe {
        asm!("mov cr3, {}", in(reg) root.as_usize() as u32, options(nostack));
    }
}

/// Invalidate the TLB entry covering one virtual address.
pub fn invlpg(virt: VirtualAddress) {
    // SAFETY: invlpg only drops a TLB entry; translation is re-walked on
    // the next access.
    unsafe {
        asm!("invlpg [{}]", in(reg) virt.as_usize() as u32, options(nostack));
    }
}

/// Flush the entire (non-global) TLB by reloading CR3.
pub fn tlb_flush_all() {
    load_page_directory(current_page_directory());
}

/// Read the faulting address latched in CR2 by the last page fault.
pub fn read_fault_address() -> VirtualAddress {
    let cr2: u32;
    // SAFETY: reading CR2 is side-effect free in ring 0.
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }
    VirtualAddress::new(cr2 as usize)
}

/// Point CR3 at `root` and turn paging on (PG + WP).
///
/// # Safety
///
/// `root` must map the currently executing code at its linked addresses;
/// otherwise the instruction after the CR0 write faults unrecoverably.
pub unsafe fn enable_paging(root: PhysicalAddress) {
    load_page_directory(root);
    let cr0 = super::cpu::read_cr0() | CR0_PG | CR0_WP;
    // SAFETY: precondition per the function contract.
    unsafe {
        super::cpu::write_cr0(cr0);
    }
}
