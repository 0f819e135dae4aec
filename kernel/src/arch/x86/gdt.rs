//! Global descriptor table: flat segments plus one TSS.
//!
//! The TSS exists only so the CPU knows which kernel stack to switch to
//! when an interrupt arrives in ring 3.

use core::mem::size_of;
use core::ptr::addr_of;

use super::cpu::{self, DescriptorTablePointer};

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
const TSS_SELECTOR: u16 = 0x28;

/// i686 task-state segment. Only `ss0`/`esp0` are consulted; hardware
/// task switching is not used.
#[repr(C, packed)]
struct TaskStateSegment {
    prev: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    prev: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    unused: [0; 23],
};

/// Segment descriptor encoder for the flat 4 GiB segments.
const fn flat_descriptor(access: u8) -> u64 {
    // base 0, limit 0xFFFFF, granularity 4K, 32-bit
    0x000F_0000_0000_FFFF | ((access as u64) << 40) | (0xC << 52)
}

static mut GDT: [u64; 6] = [
    0,                      // null
    flat_descriptor(0x9A),  // kernel code
    flat_descriptor(0x92),  // kernel data
    flat_descriptor(0xFA),  // user code
    flat_descriptor(0xF2),  // user data
    0,                      // TSS, patched in init()
];

/// TSS descriptor pointing at `TSS` (32-bit available TSS, byte granular).
fn tss_descriptor() -> u64 {
    let base = addr_of!(TSS) as usize as u64;
    let limit = (size_of::<TaskStateSegment>() - 1) as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

/// Install the GDT, reload the segment registers, and load the TSS.
pub fn init() {
    // SAFETY: GDT and TSS are statics with 'static lifetime; this runs
    // once on the boot CPU before interrupts are enabled.
    unsafe {
        GDT[5] = tss_descriptor();
        let ptr = DescriptorTablePointer {
            limit: (size_of::<[u64; 6]>() - 1) as u16,
            base: addr_of!(GDT) as usize as u32,
        };
        cpu::lgdt(&ptr);
        core::arch::asm!(
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            "mov ss, {data:x}",
            code = const KERNEL_CODE_SELECTOR as u32,
            data = in(reg) KERNEL_DATA_SELECTOR as u32,
            tmp = out(reg) _,
        );
        cpu::ltr(TSS_SELECTOR);
    }
}

/// Record the kernel stack the CPU should switch to on a ring-3 trap.
/// Called on every context switch to a user-capable thread.
pub fn set_kernel_stack(esp0: usize) {
    // SAFETY: single CPU; the TSS is only read by the hardware during a
    // ring transition, which cannot race this store.
    unsafe {
        TSS.esp0 = esp0 as u32;
    }
}
