//! Multiboot2 boot contract.
//!
//! The header below is what GRUB looks for; the parse helpers lift the
//! loader-provided information structure into the arch-neutral records
//! ([`MemoryRegion`], [`BootModule`]) the memory manager consumes.

use core::arch::global_asm;

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

use crate::error::{KernelError, KernelResult};
use crate::mm::{MemoryRegion, MemoryRegionKind, PhysicalAddress};

/// Magic value the loader leaves in EAX for a Multiboot2 handoff.
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d7_6289;

// Multiboot2 header
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                // magic number
    .long 0                         // architecture (0 = i386)
    .long multiboot_header_end - multiboot_header_start  // header length

    // checksum
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // End tag
    .word 0                         // type
    .word 0                         // flags
    .long 8                         // size
multiboot_header_end:
"#
);

/// A module the bootloader loaded alongside the kernel (e.g. the TAR
/// root filesystem image).
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub start: PhysicalAddress,
    pub size: usize,
    pub name: &'static str,
}

/// Parse the information structure the loader left at `info_addr`.
///
/// # Safety
///
/// `info_addr` must be the address of a valid Multiboot2 information
/// structure that stays mapped for the lifetime of the returned value.
pub unsafe fn boot_info(info_addr: usize) -> KernelResult<BootInformation<'static>> {
    // SAFETY: precondition per the function contract.
    unsafe {
        BootInformation::load(info_addr as *const BootInformationHeader)
            .map_err(|_| KernelError::Inval)
    }
}

/// Copy the loader memory map into `out`, returning the number of regions
/// written. Regions beyond the 32-bit physical horizon are clipped; the
/// map is the PMM's init contract.
pub fn memory_map(info: &BootInformation<'_>, out: &mut [MemoryRegion]) -> KernelResult<usize> {
    let tag = info.memory_map_tag().ok_or(KernelError::Inval)?;
    let mut count = 0;

    for area in tag.memory_areas() {
        if count == out.len() {
            break;
        }
        let start = area.start_address();
        if start >= u32::MAX as u64 {
            continue;
        }
        let end = area.end_address().min(u32::MAX as u64 + 1);
        let kind = if MemoryAreaType::from(area.typ()) == MemoryAreaType::Available {
            MemoryRegionKind::Usable
        } else {
            MemoryRegionKind::Reserved
        };
        out[count] = MemoryRegion {
            start: PhysicalAddress::new(start as usize),
            size: (end - start) as usize,
            kind,
        };
        count += 1;
    }

    if count == 0 {
        return Err(KernelError::Inval);
    }
    Ok(count)
}

/// Copy the loaded-module list into `out`, returning the number written.
pub fn modules(info: &BootInformation<'static>, out: &mut [BootModule]) -> usize {
    let mut count = 0;
    for module in info.module_tags() {
        if count == out.len() {
            break;
        }
        out[count] = BootModule {
            start: PhysicalAddress::new(module.start_address() as usize),
            size: (module.end_address() - module.start_address()) as usize,
            name: module.cmdline().unwrap_or(""),
        };
        count += 1;
    }
    count
}
